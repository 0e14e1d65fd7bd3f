//! enumeration of the modules loaded into the current process, and of their exports, using the in-memory elf images.

use core::ffi::{c_char, c_int, c_void};
use std::ffi::CStr;

use log::debug;

use super::{basename, ExportEntry, ModuleHandle, ModuleSource};

const DT_NULL: i64 = 0;
const DT_HASH: i64 = 4;
const DT_STRTAB: i64 = 5;
const DT_SYMTAB: i64 = 6;
const DT_GNU_HASH: i64 = 0x6fff_fef5;
const DT_VERSYM: i64 = 0x6fff_fff0;

const STB_GLOBAL: u8 = 1;
const STB_WEAK: u8 = 2;
const STT_OBJECT: u8 = 1;
const STT_FUNC: u8 = 2;
const STT_GNU_IFUNC: u8 = 10;
const SHN_UNDEF: u16 = 0;

/// set in a version index when the symbol version is not the default one.
const VERSYM_HIDDEN: u16 = 0x8000;

#[repr(C)]
#[derive(Clone, Copy)]
struct Elf64Sym {
    st_name: u32,
    st_info: u8,
    st_other: u8,
    st_shndx: u16,
    st_value: u64,
    st_size: u64,
}
impl Elf64Sym {
    fn bind(&self) -> u8 {
        self.st_info >> 4
    }
    fn kind(&self) -> u8 {
        self.st_info & 0xf
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
struct Elf64Dyn {
    d_tag: i64,
    d_val: u64,
}

/// the modules currently loaded by the dynamic loader, in load order.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoadedModules;
impl LoadedModules {
    pub fn new() -> Self {
        Self
    }
}

impl ModuleSource for LoadedModules {
    fn modules(&self) -> Vec<ModuleHandle> {
        let mut modules: Vec<ModuleHandle> = Vec::new();
        unsafe {
            libc::dl_iterate_phdr(
                Some(collect_module),
                &mut modules as *mut Vec<ModuleHandle> as *mut c_void,
            );
        }
        debug!("enumerated {} loaded modules", modules.len());
        modules
    }

    fn exports(&self, module: &ModuleHandle) -> Vec<ExportEntry> {
        if module.dynamic == 0 {
            return Vec::new();
        }
        // the module was loaded when it was enumerated, and stays loaded until the caller refreshes its snapshot.
        unsafe { dynamic_exports(module) }
    }
}

unsafe extern "C" fn collect_module(
    info: *mut libc::dl_phdr_info,
    _size: libc::size_t,
    data: *mut c_void,
) -> c_int {
    let modules = &mut *(data as *mut Vec<ModuleHandle>);
    let info = &*info;

    let path = if info.dlpi_name.is_null() || *info.dlpi_name == 0 {
        // the main executable has no name.
        std::fs::read_link("/proc/self/exe")
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default()
    } else {
        CStr::from_ptr(info.dlpi_name).to_string_lossy().into_owned()
    };

    let phdrs = core::slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize);
    let mut min_addr: Option<u64> = None;
    let mut max_addr: u64 = 0;
    let mut dynamic = 0;
    for phdr in phdrs {
        match phdr.p_type {
            libc::PT_LOAD if phdr.p_memsz > 0 => {
                let start = phdr.p_vaddr;
                min_addr = Some(min_addr.map_or(start, |m| m.min(start)));
                max_addr = max_addr.max(start + phdr.p_memsz);
            }
            libc::PT_DYNAMIC => dynamic = (info.dlpi_addr + phdr.p_vaddr) as usize,
            _ => {}
        }
    }

    let load_bias = info.dlpi_addr as usize;
    let name = if path.is_empty() {
        String::from("[unknown]")
    } else {
        basename(&path).to_string()
    };
    modules.push(ModuleHandle {
        name,
        path,
        base: load_bias + min_addr.unwrap_or(0) as usize,
        size: min_addr.map_or(0, |min| (max_addr - min) as usize),
        load_bias,
        dynamic,
    });
    0
}

unsafe fn dynamic_exports(module: &ModuleHandle) -> Vec<ExportEntry> {
    let mut symtab_val = 0;
    let mut strtab_val = 0;
    let mut hash_val = 0;
    let mut gnu_hash_val = 0;
    let mut versym_val = 0;

    let mut entry = module.dynamic as *const Elf64Dyn;
    while (*entry).d_tag != DT_NULL {
        let Elf64Dyn { d_tag, d_val } = *entry;
        match d_tag {
            DT_SYMTAB => symtab_val = d_val,
            DT_STRTAB => strtab_val = d_val,
            DT_HASH => hash_val = d_val,
            DT_GNU_HASH => gnu_hash_val = d_val,
            DT_VERSYM => versym_val = d_val,
            _ => {}
        }
        entry = entry.add(1);
    }
    if symtab_val == 0 || strtab_val == 0 {
        return Vec::new();
    }

    // the dynamic loader relocates these in place, except for images it did not map itself such as the vdso.
    let bias = module.load_bias as u64;
    let adjusted = symtab_val > bias || strtab_val > bias;
    let resolve = |val: u64| -> usize {
        if adjusted {
            val as usize
        } else {
            (bias + val) as usize
        }
    };

    let symtab = resolve(symtab_val) as *const Elf64Sym;
    let strtab = resolve(strtab_val) as *const c_char;
    let versym = (versym_val != 0).then(|| resolve(versym_val) as *const u16);

    let nsyms = if hash_val != 0 {
        // nbucket followed by nchain, which is the amount of symbols.
        *(resolve(hash_val) as *const u32).add(1) as usize
    } else if gnu_hash_val != 0 {
        gnu_hash_nsyms(resolve(gnu_hash_val) as *const u32)
    } else {
        return Vec::new();
    };

    let mut exports = Vec::new();
    for i in 0..nsyms {
        let sym = *symtab.add(i);
        if sym.st_shndx == SHN_UNDEF || sym.st_value == 0 || sym.st_name == 0 {
            continue;
        }
        if !matches!(sym.bind(), STB_GLOBAL | STB_WEAK) {
            continue;
        }
        if !matches!(sym.kind(), STT_FUNC | STT_OBJECT | STT_GNU_IFUNC) {
            continue;
        }
        if let Some(versym) = versym {
            if *versym.add(i) & VERSYM_HIDDEN != 0 {
                continue;
            }
        }

        let name = CStr::from_ptr(strtab.add(sym.st_name as usize))
            .to_string_lossy()
            .into_owned();
        let mut address = module.load_bias + sym.st_value as usize;
        if sym.kind() == STT_GNU_IFUNC {
            // the dynamic loader calls the resolver to pick an implementation, and so do we.
            let resolver: unsafe extern "C" fn() -> usize = core::mem::transmute(address);
            address = resolver();
        }
        exports.push(ExportEntry { name, address });
    }
    exports
}

/// gnu hash tables don't store the amount of symbols, so we find the end of the last hash chain.
unsafe fn gnu_hash_nsyms(gnu_hash: *const u32) -> usize {
    // nbuckets, symoffset, bloom_size, bloom_shift, bloom[bloom_size] (u64), buckets[nbuckets], chains[]
    let nbuckets = *gnu_hash as usize;
    let symoffset = *gnu_hash.add(1);
    let bloom_size = *gnu_hash.add(2) as usize;

    let bloom = gnu_hash.add(4) as *const u64;
    let buckets = bloom.add(bloom_size) as *const u32;
    let chains = buckets.add(nbuckets);

    let max_sym = (0..nbuckets).map(|i| *buckets.add(i)).max().unwrap_or(0);
    if max_sym < symoffset {
        return symoffset as usize;
    }

    let mut idx = max_sym;
    while *chains.add((idx - symoffset) as usize) & 1 == 0 {
        idx += 1;
    }
    idx as usize + 1
}
