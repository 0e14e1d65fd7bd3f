//! intercepts calls to functions of the current x86-64 linux process.
//!
//! a hooked function is patched to jump into generated code which runs an [`InvocationListener`] when the function is
//! entered and when it returns, then continues into a trampoline holding the relocated start of the original function.
//!
//! the code generation layer ([`jumper`], [`relocate`] and [`trampoline`]) only produces bytes and works without `std`.
//! the runtime layer, which resolves exports, patches code and dispatches calls, requires the `std` feature and linux.
//!
//! ```no_run
//! use waylay::{Callbacks, Session};
//!
//! let session = Session::open();
//! let listener = Callbacks::new()
//!     .on_enter(|ctx| {
//!         let buf = ctx.arg(1).and_then(|arg| arg.read_utf8_string());
//!         println!("write() buff={:?}", buf);
//!     })
//!     .on_leave(|ctx| println!("write()) => size={:?}", ctx.return_value().map(|v| v.to_i32())));
//! unsafe { session.attach("write", listener) }.unwrap();
//! ```

#![cfg_attr(not(feature = "std"), no_std)]

mod decoder;
pub mod jumper;
pub mod relocate;
pub mod trampoline;

#[cfg(all(feature = "std", target_os = "linux"))]
mod code;
#[cfg(all(feature = "std", target_os = "linux"))]
mod context;
#[cfg(all(feature = "std", target_os = "linux"))]
mod dispatch;
#[cfg(all(feature = "std", target_os = "linux"))]
mod error;
#[cfg(all(feature = "std", target_os = "linux"))]
mod listener;
#[cfg(all(feature = "std", target_os = "linux"))]
pub mod memory;
#[cfg(all(feature = "std", target_os = "linux"))]
pub mod module;
#[cfg(all(feature = "std", target_os = "linux"))]
mod patch;
#[cfg(all(feature = "std", target_os = "linux"))]
pub mod registry;
#[cfg(all(feature = "std", target_os = "linux"))]
mod session;
#[cfg(all(feature = "std", target_os = "linux", test))]
mod testing;
#[cfg(all(feature = "std", target_os = "linux"))]
mod writer;

pub use relocate::RelocateError;

#[cfg(all(feature = "std", target_os = "linux"))]
pub use crate::{
    context::{
        Argument, CallContext, DispatchState, ReturnType, ReturnValue, Signature, TypedValue,
        DEFAULT_ARITY, REGISTER_ARGS,
    },
    dispatch::{FaultPolicy, Phase},
    error::{Error, Result},
    listener::{Callbacks, InvocationListener},
    memory::{MemoryReader, ProcessMemory},
    module::{LoadedModules, ModuleHandle, ModuleSource, Resolver},
    registry::{HookHandle, HookOptions, HookRegistry, HookStats},
    session::{AttachOptions, Session, SessionConfig, Target},
};
