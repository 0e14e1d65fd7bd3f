//! executable memory holding the trampoline and dispatch stubs of a single hook.

use core::ops::Range;

use log::{debug, warn};
use region::{Allocation, Protection};

use crate::{Error, Result};

/// how far a code block may be from its hook target for rel32 operands to reach it.
const MAX_DISTANCE: usize = i32::MAX as usize - (1 << 20);

/// the lowest address the kernel hands out by default.
const MIN_MAP_ADDR: usize = 0x10000;

/// the offset of the trampoline inside of a code block.
pub(crate) const TRAMPOLINE_OFFSET: usize = 0;
/// the offset of the stub which the hooked function jumps to, right after the longest possible trampoline.
pub(crate) const ENTER_STUB_OFFSET: usize = 384;
/// the offset of the stub which the original function returns into.
pub(crate) const LEAVE_STUB_OFFSET: usize = 1024;

/// one page of code, writable until it is made executable.
pub(crate) struct CodeBlock {
    alloc: Allocation,
    executable: bool,
}

// the block is only written through `&mut self`, and executed as plain code.
unsafe impl Send for CodeBlock {}
unsafe impl Sync for CodeBlock {}

impl CodeBlock {
    /// allocates a block within rel32 reach of `target` if possible, and anywhere otherwise.
    pub(crate) fn alloc_near(target: usize) -> Result<Self> {
        let size = region::page::size();
        let alloc = match alloc_in_reach(target, size) {
            Some(alloc) => alloc,
            None => {
                warn!(
                    "no free page within reach of {:#x}, the hook will need long jumps",
                    target
                );
                region::alloc(size, Protection::READ_WRITE)
                    .map_err(|_| Error::AllocationFailed(target))?
            }
        };
        debug!(
            "allocated code block at {:#x} for {:#x}",
            alloc.as_ptr::<u8>() as usize,
            target
        );
        Ok(Self {
            alloc,
            executable: false,
        })
    }

    pub(crate) fn address(&self) -> usize {
        self.alloc.as_ptr::<u8>() as usize
    }

    pub(crate) fn len(&self) -> usize {
        self.alloc.len()
    }

    /// copies `bytes` into the block at `offset`.
    ///
    /// # panics
    /// panics if the block was already made executable, or if the bytes don't fit.
    pub(crate) fn write(&mut self, offset: usize, bytes: &[u8]) {
        assert!(!self.executable, "code block is no longer writable");
        let len = self.len();
        let block =
            unsafe { core::slice::from_raw_parts_mut(self.alloc.as_mut_ptr::<u8>(), len) };
        block[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// flips the block from read-write to read-execute.
    pub(crate) fn make_executable(&mut self) -> Result<()> {
        let address = self.address();
        unsafe { region::protect(self.alloc.as_ptr::<u8>(), self.len(), Protection::READ_EXECUTE) }
            .map_err(|err| Error::ProtectionFailed {
                address,
                reason: err.to_string(),
            })?;
        self.executable = true;
        Ok(())
    }
}

fn alloc_in_reach(target: usize, size: usize) -> Option<Allocation> {
    let window = target.saturating_sub(MAX_DISTANCE).max(MIN_MAP_ADDR) & !(size - 1)
        ..target.saturating_add(MAX_DISTANCE) & !(size - 1);
    for gap in free_gaps(window, target) {
        if gap.len() < size {
            continue;
        }
        let candidate = if gap.end <= target {
            gap.end - size
        } else {
            gap.start
        };
        if let Ok(alloc) = region::alloc_at(candidate as *const u8, size, Protection::READ_WRITE) {
            return Some(alloc);
        }
    }
    None
}

/// the unmapped ranges inside of `window`, closest to `target` first.
fn free_gaps(window: Range<usize>, target: usize) -> Vec<Range<usize>> {
    let mapped: Vec<Range<usize>> =
        match region::query_range(window.start as *const u8, window.end - window.start) {
            Ok(regions) => regions
                .filter_map(|region| region.ok())
                .map(|region| region.as_range())
                .collect(),
            Err(_) => Vec::new(),
        };

    let mut gaps = Vec::new();
    let mut prev_end = window.start;
    for range in mapped {
        if range.start > prev_end {
            gaps.push(prev_end..range.start.min(window.end));
        }
        prev_end = prev_end.max(range.end);
    }
    if prev_end < window.end {
        gaps.push(prev_end..window.end);
    }

    let distance = |gap: &Range<usize>| {
        if gap.end <= target {
            target - gap.end
        } else {
            gap.start.saturating_sub(target)
        }
    };
    gaps.sort_by_key(distance);
    gaps
}
