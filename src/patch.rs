//! rewriting code which other threads may be executing.

use core::sync::atomic::{fence, Ordering};

use region::Protection;

use crate::{Error, Result};

/// `jmp $`, a two byte jump to itself.
const JMP_SELF: [u8; 2] = [0xeb, 0xfe];

const CACHE_LINE_SIZE: usize = 64;

/// overwrites the code at `address` with `bytes`.
///
/// the first two bytes are first replaced by a jump to itself with a single store, then the rest of the bytes are
/// written, and finally the first two bytes. a thread which enters the code while it is rewritten spins until the new
/// code is complete, and never executes a mix of the old and new instructions.
///
/// code whose first two bytes straddle a cache line can't be redirected with a single atomic store, and is refused
/// with [`Error::UnpatchableSite`].
///
/// # safety
/// `address` must point to `bytes.len()` bytes of mapped code, which no thread is executing past its first
/// instruction.
pub(crate) unsafe fn write_code(address: usize, bytes: &[u8]) -> Result<()> {
    debug_assert!(bytes.len() >= JMP_SELF.len());
    // a 16 bit store is only atomic if it does not cross a cache line.
    if address % CACHE_LINE_SIZE == CACHE_LINE_SIZE - 1 {
        return Err(Error::UnpatchableSite(address));
    }

    let _restore_protection = region::protect_with_handle(
        address as *const u8,
        bytes.len(),
        Protection::READ_WRITE_EXECUTE,
    )
    .map_err(|err| Error::ProtectionFailed {
        address,
        reason: err.to_string(),
    })?;

    let dst = address as *mut u8;
    store_u16(dst, u16::from_le_bytes(JMP_SELF));
    fence(Ordering::SeqCst);

    core::ptr::copy_nonoverlapping(
        bytes[JMP_SELF.len()..].as_ptr(),
        dst.add(JMP_SELF.len()),
        bytes.len() - JMP_SELF.len(),
    );
    fence(Ordering::SeqCst);

    store_u16(dst, u16::from_le_bytes([bytes[0], bytes[1]]));
    fence(Ordering::SeqCst);
    Ok(())
}

/// a single, possibly unaligned, 16 bit store.
unsafe fn store_u16(dst: *mut u8, value: u16) {
    core::arch::asm!(
        "mov word ptr [{dst}], {value:x}",
        dst = in(reg) dst,
        value = in(reg) value,
        options(nostack, preserves_flags),
    );
}
