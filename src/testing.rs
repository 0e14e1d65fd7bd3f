//! helpers for tests which hook hand assembled functions.

use std::sync::{Mutex, MutexGuard, PoisonError};

use region::{Allocation, Protection};

static CODE_PATCHING: Mutex<()> = Mutex::new(());

/// serializes tests which patch code, since they change page protections and search for free pages.
pub(crate) fn lock_code_patching() -> MutexGuard<'static, ()> {
    CODE_PATCHING.lock().unwrap_or_else(PoisonError::into_inner)
}

/// a function in its own executable page, padded with `int3`.
pub(crate) struct JitFunction {
    alloc: Allocation,
}
impl JitFunction {
    pub(crate) fn new(code: &[u8]) -> Self {
        let mut alloc = region::alloc(region::page::size(), Protection::READ_WRITE).unwrap();
        let len = alloc.len();
        let page = unsafe { core::slice::from_raw_parts_mut(alloc.as_mut_ptr::<u8>(), len) };
        page.fill(0xcc);
        page[..code.len()].copy_from_slice(code);
        unsafe { region::protect(alloc.as_ptr::<u8>(), len, Protection::READ_EXECUTE) }.unwrap();
        Self { alloc }
    }

    pub(crate) fn address(&self) -> usize {
        self.alloc.as_ptr::<u8>() as usize
    }

    /// the current bytes at the start of the function.
    pub(crate) fn bytes(&self, len: usize) -> Vec<u8> {
        unsafe { core::slice::from_raw_parts(self.alloc.as_ptr::<u8>(), len) }.to_vec()
    }

    pub(crate) fn as_fn1(&self) -> extern "C" fn(u64) -> u64 {
        unsafe { core::mem::transmute(self.address()) }
    }
}
