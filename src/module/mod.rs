//! resolving exported symbols of the modules loaded into the process.

mod elf;

use std::{collections::HashMap, sync::OnceLock};

use log::debug;

use crate::{Error, Result};

pub use elf::LoadedModules;

/// a module loaded into the process, as seen when the modules were enumerated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleHandle {
    /// the file name of the module.
    pub name: String,
    /// the full path of the module, if known.
    pub path: String,
    /// the lowest address mapped by the module.
    pub base: usize,
    /// the size of the address range mapped by the module.
    pub size: usize,
    /// the difference between the module's runtime addresses and its link time addresses.
    pub load_bias: usize,
    /// the runtime address of the module's dynamic section, or zero if it has none.
    pub dynamic: usize,
}
impl ModuleHandle {
    /// whether `name` refers to this module.
    ///
    /// a module is referred to by its full path, its file name, or a prefix of its file name which ends right before a
    /// `.`, so `libc.so` matches `libc.so.6`.
    pub fn matches(&self, name: &str) -> bool {
        if self.path == name || self.name == name {
            return true;
        }
        self.name
            .strip_prefix(name)
            .is_some_and(|rest| rest.starts_with('.'))
    }

    /// whether `address` lies inside of the module's address range.
    pub fn contains(&self, address: usize) -> bool {
        (self.base..self.base + self.size).contains(&address)
    }
}

/// a single symbol exported by a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportEntry {
    pub name: String,
    pub address: usize,
}

/// an exported symbol resolved to its runtime address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportSymbol<'a> {
    pub name: &'a str,
    pub address: usize,
    pub module: &'a ModuleHandle,
}

/// the source of the modules and exports known to a [`Resolver`].
pub trait ModuleSource: Send + Sync {
    /// the loaded modules, in load order.
    fn modules(&self) -> Vec<ModuleHandle>;

    /// the symbols exported by `module`.
    fn exports(&self, module: &ModuleHandle) -> Vec<ExportEntry>;
}

/// resolves exported symbols to runtime addresses.
///
/// the modules are snapshotted when the resolver is created, and only re-enumerated by [`Resolver::refresh`].
pub struct Resolver {
    source: Box<dyn ModuleSource>,
    modules: Vec<ModuleHandle>,
    // export tables are built the first time a module is searched.
    exports: Vec<OnceLock<HashMap<String, usize>>>,
}
impl Resolver {
    pub fn new(source: Box<dyn ModuleSource>) -> Self {
        let mut resolver = Self {
            source,
            modules: Vec::new(),
            exports: Vec::new(),
        };
        resolver.refresh();
        resolver
    }

    /// re-enumerates the loaded modules, dropping all cached exports.
    pub fn refresh(&mut self) {
        self.modules = self.source.modules();
        self.exports = self.modules.iter().map(|_| OnceLock::new()).collect();
    }

    pub fn modules(&self) -> &[ModuleHandle] {
        &self.modules
    }

    /// the first module which `name` refers to.
    pub fn find_module(&self, name: &str) -> Option<&ModuleHandle> {
        self.modules.iter().find(|module| module.matches(name))
    }

    /// the module containing `address`.
    pub fn module_for_address(&self, address: usize) -> Option<&ModuleHandle> {
        self.modules.iter().find(|module| module.contains(address))
    }

    /// resolves `symbol` to its runtime address.
    ///
    /// if `module` is given only that module is searched, otherwise all modules are searched in load order and the first
    /// match wins.
    pub fn resolve(&self, module: Option<&str>, symbol: &str) -> Result<usize> {
        self.resolve_symbol(module, symbol).map(|export| export.address)
    }

    /// like [`Resolver::resolve`], but also returns the module which exports the symbol.
    pub fn resolve_symbol(&self, module: Option<&str>, symbol: &str) -> Result<ExportSymbol<'_>> {
        let not_found = || Error::NotFound {
            module: module.map(str::to_string),
            symbol: symbol.to_string(),
        };
        let candidates = self
            .modules
            .iter()
            .enumerate()
            .filter(|(_, handle)| module.map_or(true, |name| handle.matches(name)));

        for (index, handle) in candidates {
            let exports = self.exports_of(index);
            if let Some((name, &address)) = exports.get_key_value(symbol) {
                debug!("resolved {} to {:#x} in {}", symbol, address, handle.name);
                return Ok(ExportSymbol {
                    name,
                    address,
                    module: handle,
                });
            }
            if module.is_some() {
                break;
            }
        }
        Err(not_found())
    }

    fn exports_of(&self, index: usize) -> &HashMap<String, usize> {
        self.exports[index].get_or_init(|| {
            let mut table = HashMap::new();
            for export in self.source.exports(&self.modules[index]) {
                table.entry(export.name).or_insert(export.address);
            }
            table
        })
    }
}

impl core::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Resolver")
            .field("modules", &self.modules)
            .finish_non_exhaustive()
    }
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use std::ffi::CString;

    use super::*;

    struct FakeModules(Vec<(ModuleHandle, Vec<ExportEntry>)>);
    impl ModuleSource for FakeModules {
        fn modules(&self) -> Vec<ModuleHandle> {
            self.0.iter().map(|(module, _)| module.clone()).collect()
        }
        fn exports(&self, module: &ModuleHandle) -> Vec<ExportEntry> {
            self.0
                .iter()
                .find(|(m, _)| m == module)
                .map(|(_, exports)| exports.clone())
                .unwrap_or_default()
        }
    }

    fn fake_module(path: &str, base: usize, exports: &[(&str, usize)]) -> (ModuleHandle, Vec<ExportEntry>) {
        let module = ModuleHandle {
            name: basename(path).to_string(),
            path: path.to_string(),
            base,
            size: 0x1000,
            load_bias: base,
            dynamic: 0,
        };
        let exports = exports
            .iter()
            .map(|&(name, address)| ExportEntry {
                name: name.to_string(),
                address,
            })
            .collect();
        (module, exports)
    }

    fn dlsym(symbol: &str) -> usize {
        let symbol = CString::new(symbol).unwrap();
        unsafe { libc::dlsym(libc::RTLD_DEFAULT, symbol.as_ptr()) as usize }
    }

    #[test]
    fn module_name_matching() {
        let (module, _) = fake_module("/usr/lib/x86_64-linux-gnu/libc.so.6", 0x1000, &[]);
        assert!(module.matches("libc.so.6"));
        assert!(module.matches("libc.so"));
        assert!(module.matches("libc"));
        assert!(module.matches("/usr/lib/x86_64-linux-gnu/libc.so.6"));
        assert!(!module.matches("libc.s"));
        assert!(!module.matches("lib"));
    }

    #[test]
    fn first_module_in_load_order_wins() {
        let resolver = Resolver::new(Box::new(FakeModules(vec![
            fake_module("/bin/app", 0x10000, &[("main", 0x10100)]),
            fake_module("/lib/liba.so.1", 0x20000, &[("shared", 0x20100)]),
            fake_module("/lib/libb.so.1", 0x30000, &[("shared", 0x30100), ("only_b", 0x30200)]),
        ])));

        assert_eq!(resolver.resolve(None, "shared").unwrap(), 0x20100);
        assert_eq!(resolver.resolve(Some("libb.so"), "shared").unwrap(), 0x30100);
        assert_eq!(resolver.resolve(None, "only_b").unwrap(), 0x30200);

        let export = resolver.resolve_symbol(None, "main").unwrap();
        assert_eq!(export.name, "main");
        assert_eq!(export.module.name, "app");
    }

    #[test]
    fn missing_symbols_and_modules_are_not_found() {
        let resolver = Resolver::new(Box::new(FakeModules(vec![fake_module(
            "/lib/liba.so.1",
            0x20000,
            &[("shared", 0x20100)],
        )])));

        assert_eq!(
            resolver.resolve(None, "missing"),
            Err(Error::NotFound {
                module: None,
                symbol: "missing".to_string()
            })
        );
        assert_eq!(
            resolver.resolve(Some("libzzz.so"), "shared"),
            Err(Error::NotFound {
                module: Some("libzzz.so".to_string()),
                symbol: "shared".to_string()
            })
        );
    }

    #[test]
    fn module_for_address_finds_the_owner() {
        let resolver = Resolver::new(Box::new(FakeModules(vec![
            fake_module("/lib/liba.so.1", 0x20000, &[]),
            fake_module("/lib/libb.so.1", 0x30000, &[]),
        ])));
        assert_eq!(resolver.module_for_address(0x30800).unwrap().name, "libb.so.1");
        assert!(resolver.module_for_address(0x40000).is_none());
    }

    #[test]
    fn loaded_exports_match_dlsym() {
        let resolver = Resolver::new(Box::new(LoadedModules::new()));
        // `strlen` and `memcpy` are ifuncs in glibc, and `memcpy` also has a hidden older version.
        for symbol in ["write", "getpid", "strlen", "memcpy"] {
            assert_eq!(resolver.resolve(None, symbol).unwrap(), dlsym(symbol), "{symbol}");
        }

        let write = resolver.resolve_symbol(Some("libc.so"), "write").unwrap();
        assert_eq!(write.address, dlsym("write"));
        assert!(write.module.contains(write.address));
        assert_eq!(
            resolver.module_for_address(write.address),
            Some(write.module)
        );
    }

    #[test]
    fn loaded_modules_start_with_the_executable() {
        let resolver = Resolver::new(Box::new(LoadedModules::new()));
        let exe = std::fs::read_link("/proc/self/exe").unwrap();
        assert_eq!(resolver.modules()[0].path, exe.to_string_lossy());
        assert!(resolver.find_module("libc.so").is_some());
        assert!(matches!(
            resolver.resolve(None, "waylay_no_such_symbol"),
            Err(Error::NotFound { .. })
        ));
    }
}
