use thiserror_no_std::Error;

use crate::{dispatch::Phase, registry::HookHandle, relocate::RelocateError};

/// the result type used by the runtime layer of this crate.
pub type Result<T> = core::result::Result<T, Error>;

/// an error which occured while resolving, hooking or inspecting a function.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    #[error("symbol {symbol} not found in {}", .module.as_deref().unwrap_or("any loaded module"))]
    NotFound {
        module: Option<String>,
        symbol: String,
    },

    #[error("can't relocate the start of the function at {address:#x}")]
    UnsupportedInstruction {
        address: usize,
        #[source]
        source: RelocateError,
    },

    #[error("the function at {0:#x} is already hooked")]
    AlreadyHooked(usize),

    #[error("failed to read {len} bytes at {address:#x}")]
    InvalidMemoryRead { address: usize, len: usize },

    #[error("failed to write {len} bytes at {address:#x}")]
    InvalidMemoryWrite { address: usize, len: usize },

    #[error("no nul terminator within {limit} bytes of {address:#x}")]
    UnterminatedString { address: usize, limit: usize },

    #[error("the string at {address:#x} is not valid utf-8")]
    InvalidUtf8 { address: usize },

    #[error("argument {index} is out of range for a function taking {arity} arguments")]
    ArgumentOutOfRange { index: usize, arity: usize },

    #[error("the return value is only available once the original function returned")]
    ReturnValueUnavailable,

    #[error("operation is not allowed in the current dispatch state")]
    InvalidState,

    #[error("{phase} callback of the hook at {address:#x} panicked: {message}")]
    CallbackFault {
        address: usize,
        phase: Phase,
        message: String,
    },

    #[error("no such hook: {0:?}")]
    UnknownHook(HookHandle),

    #[error("failed to allocate executable memory near {0:#x}")]
    AllocationFailed(usize),

    #[error("the code at {0:#x} can't be patched atomically since its first two bytes straddle a cache line")]
    UnpatchableSite(usize),

    #[error("failed to change the protection of memory at {address:#x}: {reason}")]
    ProtectionFailed { address: usize, reason: String },
}
