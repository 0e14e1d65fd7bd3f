//! installing and removing hooks, and keeping their code alive until no thread runs it.

use core::{
    mem,
    ops::{Deref, DerefMut, Range},
    sync::atomic::{AtomicU64, Ordering},
};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    thread,
    time::{Duration, Instant},
};

use log::{debug, error, warn};

use crate::{
    code::{CodeBlock, ENTER_STUB_OFFSET, LEAVE_STUB_OFFSET, TRAMPOLINE_OFFSET},
    dispatch::{self, BypassGuard, FaultPolicy, HookShared},
    listener::InvocationListener,
    memory::MemoryReader,
    patch,
    trampoline::{self, PatchBytes, MAX_PATCH_LEN},
    Error, Result, Signature,
};

/// `endbr64`, which must stay the first instruction of a function under indirect branch tracking.
const ENDBR64: [u8; 4] = [0xf3, 0x0f, 0x1e, 0xfa];

/// the amount of bytes read from a function before hooking it.
const PROLOGUE_READ_LEN: usize = ENDBR64.len() + MAX_PATCH_LEN;

/// the default limit on the length of strings read from arguments.
pub const DEFAULT_MAX_STRING_LEN: usize = 64 * 1024;

/// the code patched by every registry of the process, keyed by the address of the hooked function.
static PATCH_SITES: Mutex<BTreeMap<usize, Range<usize>>> = Mutex::new(BTreeMap::new());

/// locked after the state of a registry, never before it.
fn patch_sites() -> MutexGuard<'static, BTreeMap<usize, Range<usize>>> {
    PATCH_SITES.lock().unwrap_or_else(PoisonError::into_inner)
}

/// identifies an installed hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookHandle {
    id: u64,
    address: usize,
}
impl HookHandle {
    /// the address of the hooked function.
    pub fn address(&self) -> usize {
        self.address
    }
}

/// counters of a single hook.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HookStats {
    /// intercepted calls, not counting calls which bypassed the callbacks.
    pub calls: u64,
    /// callback panics.
    pub faults: u64,
    /// calls currently inside of the hook's code.
    pub in_flight: usize,
}

/// how a hook interprets and handles the calls it intercepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookOptions {
    /// how many arguments the function takes, and what it returns.
    pub signature: Signature,
    /// what happens to a call whose callback panics.
    pub fault_policy: FaultPolicy,
    /// the nul search limit of [`Argument::read_utf8_string`](crate::Argument::read_utf8_string).
    pub max_string_len: usize,
}
impl Default for HookOptions {
    fn default() -> Self {
        Self {
            signature: Signature::default(),
            fault_policy: FaultPolicy::default(),
            max_string_len: DEFAULT_MAX_STRING_LEN,
        }
    }
}

struct HookRecord {
    handle: HookHandle,
    patch_address: usize,
    original: PatchBytes,
    block: CodeBlock,
    shared: Box<HookShared>,
}

/// an uninstalled hook whose code may still be running.
struct Retired {
    block: CodeBlock,
    shared: Box<HookShared>,
    retired_at: Instant,
}

#[derive(Default)]
struct RegistryState {
    hooks: HashMap<usize, HookRecord>,
    retired: Vec<Retired>,
}

/// the state of a registry, locked by the current thread.
///
/// hooked functions which the thread calls while holding it, such as the allocator or `read`, bypass their callbacks,
/// so that no callback can lock the registry again on the same thread.
struct Locked<'a> {
    state: MutexGuard<'a, RegistryState>,
    _bypass: BypassGuard,
}
impl Deref for Locked<'_> {
    type Target = RegistryState;

    fn deref(&self) -> &RegistryState {
        &self.state
    }
}
impl DerefMut for Locked<'_> {
    fn deref_mut(&mut self) -> &mut RegistryState {
        &mut self.state
    }
}

/// the installed hooks of a process.
pub struct HookRegistry {
    state: Mutex<RegistryState>,
    memory: Arc<dyn MemoryReader>,
    next_id: AtomicU64,
    reclaim_grace: Duration,
}
impl HookRegistry {
    /// creates an empty registry. the code of uninstalled hooks is kept for at least `reclaim_grace`.
    pub fn new(memory: Arc<dyn MemoryReader>, reclaim_grace: Duration) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            memory,
            next_id: AtomicU64::new(1),
            reclaim_grace,
        }
    }

    fn lock(&self) -> Locked<'_> {
        let bypass = BypassGuard::new();
        Locked {
            state: self.state.lock().unwrap_or_else(PoisonError::into_inner),
            _bypass: bypass,
        }
    }

    /// hooks the function at `address`, so that `listener` observes every call to it.
    ///
    /// a function can only be hooked once in the whole process, so this fails with [`Error::AlreadyHooked`] if any
    /// registry already patched code at `address`.
    ///
    /// # Safety
    /// `address` must be the entry point of a function following the system v amd64 calling convention, and no thread
    /// may be executing within the first [`MAX_PATCH_LEN`] bytes of it other than at its first instruction.
    pub unsafe fn install(
        &self,
        address: usize,
        listener: Box<dyn InvocationListener>,
        options: HookOptions,
    ) -> Result<HookHandle> {
        let mut state = self.lock();
        let mut sites = patch_sites();
        if let Some((&hooked, _)) = sites
            .iter()
            .find(|&(&hooked, patched)| hooked == address || patched.contains(&address))
        {
            return Err(Error::AlreadyHooked(hooked));
        }

        let (buf, len) = self.read_prologue(address)?;
        let (patch_address, content) = match buf[..len].strip_prefix(&ENDBR64) {
            Some(rest) => (address + ENDBR64.len(), rest),
            None => (address, &buf[..len]),
        };

        let mut block = CodeBlock::alloc_near(patch_address)?;
        let block_address = block.address();
        let tramp = trampoline::build(
            content,
            patch_address as u64,
            (block_address + TRAMPOLINE_OFFSET) as u64,
            (block_address + ENTER_STUB_OFFSET) as u64,
        )
        .map_err(|source| Error::UnsupportedInstruction { address, source })?;

        let patch_range = patch_address..patch_address + tramp.patch.len();
        if let Some((&overlapping, _)) = sites
            .iter()
            .find(|(_, other)| other.start < patch_range.end && patch_range.start < other.end)
        {
            return Err(Error::AlreadyHooked(overlapping));
        }

        let shared = Box::new(HookShared::new(
            address,
            listener,
            options,
            self.memory.clone(),
            block_address + LEAVE_STUB_OFFSET,
        ));
        let enter_stub = dispatch::enter_stub(
            block_address + ENTER_STUB_OFFSET,
            &shared,
            block_address + TRAMPOLINE_OFFSET,
        );
        let leave_stub = dispatch::leave_stub(block_address + LEAVE_STUB_OFFSET, &shared);
        debug_assert!(ENTER_STUB_OFFSET + enter_stub.len() <= LEAVE_STUB_OFFSET);
        debug_assert!(LEAVE_STUB_OFFSET + leave_stub.len() <= block.len());

        block.write(TRAMPOLINE_OFFSET, &tramp.bytes);
        block.write(ENTER_STUB_OFFSET, &enter_stub);
        block.write(LEAVE_STUB_OFFSET, &leave_stub);
        block.make_executable()?;

        patch::write_code(patch_address, &tramp.patch)?;
        sites.insert(address, patch_range);

        let handle = HookHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            address,
        };
        debug!(
            "hooked {:#x}, patched {} bytes at {:#x}, code at {:#x}",
            address,
            tramp.patch.len(),
            patch_address,
            block_address
        );
        state.hooks.insert(
            address,
            HookRecord {
                handle,
                patch_address,
                original: tramp.original,
                block,
                shared,
            },
        );
        Ok(handle)
    }

    /// reads the start of a function, which may be shorter than the largest possible patch if it ends right before an
    /// unmapped page.
    fn read_prologue(&self, address: usize) -> Result<([u8; PROLOGUE_READ_LEN], usize)> {
        let mut buf = [0u8; PROLOGUE_READ_LEN];
        if self.memory.read(address, &mut buf).is_ok() {
            return Ok((buf, buf.len()));
        }
        let page_size = region::page::size();
        let len = (page_size - address % page_size).min(buf.len());
        self.memory.read(address, &mut buf[..len])?;
        Ok((buf, len))
    }

    /// restores the original code of a hooked function.
    ///
    /// the hook's code stays allocated until [`reclaim`](Self::reclaim) finds that no thread is running it.
    pub fn uninstall(&self, handle: HookHandle) -> Result<()> {
        let mut state = self.lock();
        let record = match state.hooks.remove(&handle.address) {
            Some(record) if record.handle == handle => record,
            Some(record) => {
                state.hooks.insert(handle.address, record);
                return Err(Error::UnknownHook(handle));
            }
            None => return Err(Error::UnknownHook(handle)),
        };

        let mut sites = patch_sites();
        if let Err(err) = unsafe { patch::write_code(record.patch_address, &record.original) } {
            state.hooks.insert(handle.address, record);
            return Err(err);
        }
        sites.remove(&handle.address);
        drop(sites);
        debug!("unhooked {:#x}", handle.address);
        state.retired.push(Retired {
            block: record.block,
            shared: record.shared,
            retired_at: Instant::now(),
        });
        Ok(())
    }

    /// frees the code of uninstalled hooks which no thread runs anymore, returning how many were freed.
    pub fn reclaim(&self) -> usize {
        let mut state = self.lock();
        let before = state.retired.len();
        let grace = self.reclaim_grace;
        state.retired.retain(|retired| {
            retired.shared.in_flight() != 0 || retired.retired_at.elapsed() < grace
        });
        let freed = before - state.retired.len();
        if freed > 0 {
            debug!(
                "reclaimed {} retired hooks, {} still pending",
                freed,
                state.retired.len()
            );
        }
        freed
    }

    pub fn stats(&self, handle: HookHandle) -> Result<HookStats> {
        self.with_record(handle, |record| record.shared.stats())
    }

    /// the last callback fault of a hook, if any of its callbacks ever panicked.
    pub fn last_fault(&self, handle: HookHandle) -> Result<Option<Error>> {
        self.with_record(handle, |record| record.shared.last_fault())
    }

    /// the handles of all installed hooks.
    pub fn handles(&self) -> Vec<HookHandle> {
        self.lock().hooks.values().map(|record| record.handle).collect()
    }

    pub fn is_hooked(&self, address: usize) -> bool {
        self.lock().hooks.contains_key(&address)
    }

    fn with_record<T>(&self, handle: HookHandle, f: impl FnOnce(&HookRecord) -> T) -> Result<T> {
        let state = self.lock();
        match state.hooks.get(&handle.address) {
            Some(record) if record.handle == handle => Ok(f(record)),
            _ => Err(Error::UnknownHook(handle)),
        }
    }
}
impl Drop for HookRegistry {
    fn drop(&mut self) {
        for handle in self.handles() {
            if let Err(err) = self.uninstall(handle) {
                error!("failed to unhook {:#x}: {}", handle.address, err);
            }
        }

        if !self.lock().retired.is_empty() {
            thread::sleep(self.reclaim_grace);
            self.reclaim();
        }

        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        let leaked = state.retired.len() + state.hooks.len();
        if leaked > 0 {
            warn!("leaking the code of {} hooks which may still run", leaked);
        }
        for retired in state.retired.drain(..) {
            mem::forget(retired.block);
            mem::forget(retired.shared);
        }
        for (_, record) in state.hooks.drain() {
            mem::forget(record.block);
            mem::forget(record.shared);
        }
    }
}
impl core::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.lock();
        f.debug_struct("HookRegistry")
            .field("hooks", &state.hooks.len())
            .field("retired", &state.retired.len())
            .field("reclaim_grace", &self.reclaim_grace)
            .finish_non_exhaustive()
    }
}
