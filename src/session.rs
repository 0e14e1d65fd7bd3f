//! the entry point for instrumenting the current process.

use std::{sync::Arc, time::Duration};

use log::debug;

use crate::{
    dispatch::FaultPolicy,
    listener::InvocationListener,
    memory::{MemoryReader, ProcessMemory},
    module::{LoadedModules, ModuleSource, Resolver},
    registry::{HookHandle, HookOptions, HookRegistry, HookStats, DEFAULT_MAX_STRING_LEN},
    Error, Result, Signature,
};

/// the defaults of all hooks attached by a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// what happens to a call whose callback panics.
    pub fault_policy: FaultPolicy,
    /// the signature assumed for hooked functions which don't declare one.
    pub signature: Signature,
    /// the nul search limit for strings read from arguments.
    pub max_string_len: usize,
    /// how long the code of a detached hook is kept after no thread was seen running it.
    pub reclaim_grace: Duration,
}
impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            fault_policy: FaultPolicy::Continue,
            signature: Signature::default(),
            max_string_len: DEFAULT_MAX_STRING_LEN,
            reclaim_grace: Duration::from_millis(50),
        }
    }
}

/// per hook overrides of the [`SessionConfig`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttachOptions {
    pub signature: Option<Signature>,
    pub fault_policy: Option<FaultPolicy>,
    pub max_string_len: Option<usize>,
}
impl AttachOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signature(mut self, signature: Signature) -> Self {
        self.signature = Some(signature);
        self
    }

    pub fn fault_policy(mut self, fault_policy: FaultPolicy) -> Self {
        self.fault_policy = Some(fault_policy);
        self
    }

    pub fn max_string_len(mut self, max_string_len: usize) -> Self {
        self.max_string_len = Some(max_string_len);
        self
    }
}

/// a function to hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Address(usize),
    /// an exported symbol, looked up in `module` or in all modules in load order.
    Export {
        module: Option<String>,
        symbol: String,
    },
}
impl Target {
    pub fn export(module: Option<&str>, symbol: &str) -> Self {
        Self::Export {
            module: module.map(str::to_string),
            symbol: symbol.to_string(),
        }
    }
}
impl From<usize> for Target {
    fn from(address: usize) -> Self {
        Self::Address(address)
    }
}
impl From<&str> for Target {
    fn from(symbol: &str) -> Self {
        Self::export(None, symbol)
    }
}

/// instruments the current process.
///
/// dropping the session detaches all of its hooks.
///
/// ```no_run
/// use waylay::{Callbacks, Session};
///
/// let session = Session::open();
/// let listener = Callbacks::new()
///     .on_enter(|ctx| {
///         if let Ok(buf) = ctx.arg(1).and_then(|arg| arg.read_utf8_string()) {
///             println!("write() buff={:?}", buf);
///         }
///     })
///     .on_leave(|ctx| println!("write()) => size={}", ctx.return_value().unwrap().to_i32()));
/// unsafe { session.attach("write", listener) }.unwrap();
/// ```
pub struct Session {
    config: SessionConfig,
    resolver: Resolver,
    registry: HookRegistry,
}
impl Session {
    /// a session with the default configuration.
    pub fn open() -> Self {
        Self::with_config(SessionConfig::default())
    }

    pub fn with_config(config: SessionConfig) -> Self {
        Self::with_parts(
            config,
            Box::new(LoadedModules::new()),
            Arc::new(ProcessMemory::new()),
        )
    }

    /// a session which enumerates modules and reads memory through the given collaborators.
    pub fn with_parts(
        config: SessionConfig,
        modules: Box<dyn ModuleSource>,
        memory: Arc<dyn MemoryReader>,
    ) -> Self {
        let resolver = Resolver::new(modules);
        debug!("session opened with {} modules", resolver.modules().len());
        Self {
            config,
            resolver,
            registry: HookRegistry::new(memory, config.reclaim_grace),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    /// the resolver, for refreshing it after modules were loaded.
    pub fn resolver_mut(&mut self) -> &mut Resolver {
        &mut self.resolver
    }

    /// hooks `target` with the session's defaults.
    ///
    /// # Safety
    /// see [`Session::attach_with`].
    pub unsafe fn attach(
        &self,
        target: impl Into<Target>,
        listener: impl InvocationListener + 'static,
    ) -> Result<HookHandle> {
        self.attach_with(target, listener, AttachOptions::default())
    }

    /// hooks `target`, so that `listener` observes every call to it.
    ///
    /// # Safety
    /// the target must be a function following the system v amd64 calling convention. an address target must be its
    /// entry point. no thread may be executing the start of the function, other than its first instruction, while it is
    /// patched.
    pub unsafe fn attach_with(
        &self,
        target: impl Into<Target>,
        listener: impl InvocationListener + 'static,
        options: AttachOptions,
    ) -> Result<HookHandle> {
        let address = self.resolve_target(&target.into())?;
        let options = HookOptions {
            signature: options.signature.unwrap_or(self.config.signature),
            fault_policy: options.fault_policy.unwrap_or(self.config.fault_policy),
            max_string_len: options.max_string_len.unwrap_or(self.config.max_string_len),
        };
        self.registry.install(address, Box::new(listener), options)
    }

    fn resolve_target(&self, target: &Target) -> Result<usize> {
        match target {
            Target::Address(address) => Ok(*address),
            Target::Export { module, symbol } => self.resolver.resolve(module.as_deref(), symbol),
        }
    }

    /// removes a hook, restoring the original code of its function.
    pub fn detach(&self, handle: HookHandle) -> Result<()> {
        self.registry.uninstall(handle)?;
        self.registry.reclaim();
        Ok(())
    }

    /// removes all hooks, returning the first error while still attempting the rest.
    pub fn detach_all(&self) -> Result<()> {
        let mut first_err: Option<Error> = None;
        for handle in self.registry.handles() {
            if let Err(err) = self.registry.uninstall(handle) {
                first_err.get_or_insert(err);
            }
        }
        self.registry.reclaim();
        first_err.map_or(Ok(()), Err)
    }

    /// frees the code of detached hooks which no thread runs anymore, returning how many were freed.
    pub fn reclaim(&self) -> usize {
        self.registry.reclaim()
    }

    pub fn stats(&self, handle: HookHandle) -> Result<HookStats> {
        self.registry.stats(handle)
    }

    pub fn last_fault(&self, handle: HookHandle) -> Result<Option<Error>> {
        self.registry.last_fault(handle)
    }

    pub fn handles(&self) -> Vec<HookHandle> {
        self.registry.handles()
    }

    pub fn is_hooked(&self, address: usize) -> bool {
        self.registry.is_hooked(address)
    }
}
impl core::fmt::Debug for Session {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .field("resolver", &self.resolver)
            .field("registry", &self.registry)
            .finish()
    }
}
