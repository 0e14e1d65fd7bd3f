//! the runtime half of a hook: the stubs which hooked functions jump to, and the dispatchers they call.
//!
//! a hooked function jumps to its enter stub, which saves the argument registers and calls [`enter_dispatch`]. the
//! enter dispatcher runs the enter callback, then rewrites the return address of the call so that the original
//! function returns into the leave stub, and the stub jumps to the trampoline with the caller's stack untouched. when
//! the original returns, the leave stub calls [`leave_dispatch`], which runs the leave callback and hands back the
//! real return address.

use core::{
    cell::{Cell, RefCell},
    fmt,
    mem::{offset_of, size_of},
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
};
use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Mutex, PoisonError},
};

use log::{error, trace, warn};

use crate::{
    context::{CallContext, Capture, DispatchState},
    listener::InvocationListener,
    memory::MemoryReader,
    registry::{HookOptions, HookStats},
    writer::{Reg, Writer},
    Error,
};

const ACTION_CALL: u64 = 0;
const ACTION_SKIP: u64 = 1;
const ACTION_BYPASS: u64 = 2;

/// the stubs stay clear of the red zone of the function which was just entered.
const RED_ZONE_LEN: usize = 128;
const FXSAVE_LEN: usize = 512;
const FXSAVE_ALIGN: usize = 16;

const fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// the registers saved by the enter stub, followed by the fxsave area.
#[allow(dead_code)]
#[repr(C)]
struct EnterFrame {
    rdi: u64,
    rsi: u64,
    rdx: u64,
    rcx: u64,
    r8: u64,
    r9: u64,
    rax: u64,
    r10: u64,
    /// the address of the return address of the intercepted call.
    return_slot: u64,
}

/// keeps the stack 16 byte aligned at the call to the enter dispatcher.
const ENTER_FRAME_LEN: usize =
    round_up(size_of::<EnterFrame>() + FXSAVE_ALIGN - 1 + FXSAVE_LEN, 16);

const ENTER_SAVED_REGS: [(Reg, usize); 8] = [
    (Reg::Rdi, offset_of!(EnterFrame, rdi)),
    (Reg::Rsi, offset_of!(EnterFrame, rsi)),
    (Reg::Rdx, offset_of!(EnterFrame, rdx)),
    (Reg::Rcx, offset_of!(EnterFrame, rcx)),
    (Reg::R8, offset_of!(EnterFrame, r8)),
    (Reg::R9, offset_of!(EnterFrame, r9)),
    (Reg::Rax, offset_of!(EnterFrame, rax)),
    (Reg::R10, offset_of!(EnterFrame, r10)),
];

/// the return registers saved by the leave stub, followed by the fxsave area.
#[allow(dead_code)]
#[repr(C)]
struct LeaveFrame {
    rax: u64,
    rdx: u64,
    /// the slot the original function returned from, which receives the real return address.
    return_slot: u64,
}

/// the leave stub is entered with an aligned stack and reserves the return slot, hence the extra 8 bytes.
const LEAVE_FRAME_LEN: usize =
    round_up(size_of::<LeaveFrame>() + FXSAVE_ALIGN - 1 + FXSAVE_LEN, 16) + 8;

const LEAVE_SAVED_REGS: [(Reg, usize); 2] = [
    (Reg::Rax, offset_of!(LeaveFrame, rax)),
    (Reg::Rdx, offset_of!(LeaveFrame, rdx)),
];

/// which callback of a hook is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Enter,
    Leave,
}
impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Enter => "enter",
            Phase::Leave => "leave",
        })
    }
}

/// what happens to an intercepted call when one of its callbacks panics.
///
/// the fault is always counted, logged and kept as the hook's last fault.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FaultPolicy {
    /// the call proceeds as if the callback returned normally.
    #[default]
    Continue,
    /// a faulting enter callback skips the original function, and a faulting leave callback replaces its return
    /// value, with `return_value` in both cases.
    SkipOriginal { return_value: u64 },
}

/// the state of a hook which its stubs and dispatchers share.
///
/// the stubs embed its address, so it must stay at the same place until the hook's code is freed.
pub(crate) struct HookShared {
    address: usize,
    listener: Box<dyn InvocationListener>,
    options: HookOptions,
    memory: Arc<dyn MemoryReader>,
    leave_stub: usize,
    /// calls which entered the enter stub and did not yet leave the hook's code.
    in_flight: AtomicUsize,
    calls: AtomicU64,
    faults: AtomicU64,
    last_fault: Mutex<Option<Error>>,
}
impl HookShared {
    pub(crate) fn new(
        address: usize,
        listener: Box<dyn InvocationListener>,
        options: HookOptions,
        memory: Arc<dyn MemoryReader>,
        leave_stub: usize,
    ) -> Self {
        Self {
            address,
            listener,
            options,
            memory,
            leave_stub,
            in_flight: AtomicUsize::new(0),
            calls: AtomicU64::new(0),
            faults: AtomicU64::new(0),
            last_fault: Mutex::new(None),
        }
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub(crate) fn stats(&self) -> HookStats {
        HookStats {
            calls: self.calls.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
            in_flight: self.in_flight(),
        }
    }

    pub(crate) fn last_fault(&self) -> Option<Error> {
        self.last_fault
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn leave_code(&self) {
        self.in_flight.fetch_sub(1, Ordering::Release);
    }

    fn record_fault(&self, phase: Phase, message: String) {
        self.faults.fetch_add(1, Ordering::Relaxed);
        error!(
            "{} callback of the hook at {:#x} panicked: {}",
            phase, self.address, message
        );
        *self
            .last_fault
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Error::CallbackFault {
            address: self.address,
            phase,
            message,
        });
    }
}

/// a call whose original function is running, waiting for it to return into the leave stub.
struct Invocation {
    hook: *const HookShared,
    return_slot: usize,
    return_address: usize,
    context: Box<CallContext>,
}

thread_local! {
    /// set while this thread runs dispatch code or callbacks. hooked functions called meanwhile run unobserved.
    static IN_DISPATCH: Cell<bool> = const { Cell::new(false) };

    /// the calls in progress on this thread, innermost last.
    static INVOCATIONS: RefCell<Vec<Invocation>> = const { RefCell::new(Vec::new()) };
}

/// makes hooked functions called by this thread bypass their callbacks until dropped.
///
/// held while the registry is locked, so that no callback runs on a thread which holds the lock.
pub(crate) struct BypassGuard {
    was_set: bool,
}
impl BypassGuard {
    pub(crate) fn new() -> Self {
        Self {
            was_set: IN_DISPATCH.with(|busy| busy.replace(true)),
        }
    }
}
impl Drop for BypassGuard {
    fn drop(&mut self) {
        if !self.was_set {
            IN_DISPATCH.with(|busy| busy.set(false));
        }
    }
}

/// emits the stub which the patched function jumps to.
pub(crate) fn enter_stub(stub_addr: usize, hook: &HookShared, trampoline: usize) -> Vec<u8> {
    let mut w = Writer::new(stub_addr as u64);
    let in_flight = &hook.in_flight as *const AtomicUsize as u64;

    w.put_mov_reg_imm64(Reg::R11, in_flight);
    w.put_lock_inc_mem(Reg::R11);

    w.put_lea_reg_mem(Reg::Rsp, Reg::Rsp, -(RED_ZONE_LEN as i32));
    w.put_pushfq();
    w.put_sub_reg_imm32(Reg::Rsp, ENTER_FRAME_LEN as u32);
    for (reg, offset) in ENTER_SAVED_REGS {
        w.put_mov_mem_reg(Reg::Rsp, offset as i32, reg);
    }
    w.put_lea_reg_mem(
        Reg::R11,
        Reg::Rsp,
        (ENTER_FRAME_LEN + size_of::<u64>() + RED_ZONE_LEN) as i32,
    );
    w.put_mov_mem_reg(
        Reg::Rsp,
        offset_of!(EnterFrame, return_slot) as i32,
        Reg::R11,
    );
    put_fxsave_area_addr(&mut w, size_of::<EnterFrame>());
    w.put_fxsave(Reg::R11);
    w.put_cld();

    put_dispatch_call(&mut w, hook, enter_dispatch as usize);

    w.put_cmp_reg_imm8(Reg::Rax, ACTION_SKIP as i8);
    let skip = w.put_je_label();

    // continue into the original function.
    put_fxsave_area_addr(&mut w, size_of::<EnterFrame>());
    w.put_fxrstor(Reg::R11);
    for (reg, offset) in ENTER_SAVED_REGS {
        w.put_mov_reg_mem(reg, Reg::Rsp, offset as i32);
    }
    w.put_lea_reg_mem(Reg::Rsp, Reg::Rsp, ENTER_FRAME_LEN as i32);
    w.put_popfq();
    w.put_lea_reg_mem(Reg::Rsp, Reg::Rsp, RED_ZONE_LEN as i32);
    w.put_jmp_near(trampoline as u64);

    // return straight to the caller.
    w.bind(skip);
    put_fxsave_area_addr(&mut w, size_of::<EnterFrame>());
    w.put_fxrstor(Reg::R11);
    w.put_mov_reg_mem(Reg::Rax, Reg::Rsp, offset_of!(EnterFrame, rax) as i32);
    w.put_lea_reg_mem(Reg::Rsp, Reg::Rsp, ENTER_FRAME_LEN as i32);
    w.put_popfq();
    w.put_lea_reg_mem(Reg::Rsp, Reg::Rsp, RED_ZONE_LEN as i32);
    w.put_mov_reg_imm64(Reg::R11, in_flight);
    w.put_lock_dec_mem(Reg::R11);
    w.put_ret();

    w.into_bytes()
}

/// emits the stub which the original function returns into.
pub(crate) fn leave_stub(stub_addr: usize, hook: &HookShared) -> Vec<u8> {
    let mut w = Writer::new(stub_addr as u64);
    let in_flight = &hook.in_flight as *const AtomicUsize as u64;

    // reclaim the slot of the consumed return address.
    w.put_lea_reg_mem(Reg::Rsp, Reg::Rsp, -(size_of::<u64>() as i32));
    w.put_sub_reg_imm32(Reg::Rsp, LEAVE_FRAME_LEN as u32);
    for (reg, offset) in LEAVE_SAVED_REGS {
        w.put_mov_mem_reg(Reg::Rsp, offset as i32, reg);
    }
    w.put_lea_reg_mem(Reg::R11, Reg::Rsp, LEAVE_FRAME_LEN as i32);
    w.put_mov_mem_reg(
        Reg::Rsp,
        offset_of!(LeaveFrame, return_slot) as i32,
        Reg::R11,
    );
    put_fxsave_area_addr(&mut w, size_of::<LeaveFrame>());
    w.put_fxsave(Reg::R11);
    w.put_cld();

    put_dispatch_call(&mut w, hook, leave_dispatch as usize);
    w.put_mov_mem_reg(Reg::Rsp, LEAVE_FRAME_LEN as i32, Reg::Rax);

    put_fxsave_area_addr(&mut w, size_of::<LeaveFrame>());
    w.put_fxrstor(Reg::R11);
    for (reg, offset) in LEAVE_SAVED_REGS {
        w.put_mov_reg_mem(reg, Reg::Rsp, offset as i32);
    }
    w.put_lea_reg_mem(Reg::Rsp, Reg::Rsp, LEAVE_FRAME_LEN as i32);
    w.put_mov_reg_imm64(Reg::R11, in_flight);
    w.put_lock_dec_mem(Reg::R11);
    w.put_ret();

    w.into_bytes()
}

/// `r11 = align_up(rsp + frame_len, 16)`
fn put_fxsave_area_addr(w: &mut Writer, frame_len: usize) {
    w.put_lea_reg_mem(Reg::R11, Reg::Rsp, (frame_len + FXSAVE_ALIGN - 1) as i32);
    w.put_and_reg_imm8(Reg::R11, -(FXSAVE_ALIGN as i8));
}

/// `dispatcher(hook, rsp)`
fn put_dispatch_call(w: &mut Writer, hook: &HookShared, dispatcher: usize) {
    w.put_mov_reg_imm64(Reg::Rdi, hook as *const HookShared as u64);
    w.put_mov_reg_reg(Reg::Rsi, Reg::Rsp);
    w.put_mov_reg_imm64(Reg::R11, dispatcher as u64);
    w.put_call_reg(Reg::R11);
}

unsafe extern "C" fn enter_dispatch(hook: *const HookShared, frame: *mut EnterFrame) -> u64 {
    let hook = &*hook;
    if IN_DISPATCH.with(|busy| busy.replace(true)) {
        hook.leave_code();
        return ACTION_BYPASS;
    }
    let action = dispatch_enter(hook, &mut *frame);
    IN_DISPATCH.with(|busy| busy.set(false));
    action
}

fn dispatch_enter(hook: &HookShared, frame: &mut EnterFrame) -> u64 {
    let Ok(depth) = INVOCATIONS.try_with(|stack| stack.borrow().len()) else {
        hook.leave_code();
        return ACTION_BYPASS;
    };
    let return_slot = frame.return_slot as usize;
    // the stub computed the slot from the stack pointer at entry, which points at the return address.
    let return_address = unsafe { *(return_slot as *const usize) };
    hook.calls.fetch_add(1, Ordering::Relaxed);

    let mut ctx = Box::new(CallContext::new(
        Capture {
            function: hook.address,
            registers: [frame.rdi, frame.rsi, frame.rdx, frame.rcx, frame.r8, frame.r9],
            stack_pointer: return_slot,
            return_address,
            depth,
            signature: hook.options.signature,
            max_string_len: hook.options.max_string_len,
        },
        hook.memory.clone(),
    ));
    ctx.set_state(DispatchState::EnterDispatched);
    trace!(
        target: "waylay::dispatch",
        "enter {:#x} from {:#x} at depth {}",
        hook.address,
        return_address,
        depth
    );

    if let Err(message) = run_callback(|| hook.listener.on_enter(&mut ctx)) {
        hook.record_fault(Phase::Enter, message);
        if let FaultPolicy::SkipOriginal { return_value } = hook.options.fault_policy {
            // the callbacks can't move the context out of its enter state.
            let skipped = ctx.skip_original(return_value);
            debug_assert!(skipped.is_ok());
        }
    }
    if let Some(registers) = ctx.replaced_registers() {
        [frame.rdi, frame.rsi, frame.rdx, frame.rcx, frame.r8, frame.r9] = *registers;
    }

    if let Some(return_value) = ctx.skip_value() {
        trace!(target: "waylay::dispatch", "skipping the original {:#x}", hook.address);
        ctx.set_return_value(return_value);
        frame.rax = run_leave(hook, &mut ctx);
        return ACTION_SKIP;
    }

    ctx.set_state(DispatchState::OriginalExecuting);
    let invocation = Invocation {
        hook,
        return_slot,
        return_address,
        context: ctx,
    };
    if INVOCATIONS
        .try_with(|stack| stack.borrow_mut().push(invocation))
        .is_err()
    {
        warn!(
            "thread is exiting, the call to {:#x} will not be observed on leave",
            hook.address
        );
        hook.leave_code();
        return ACTION_BYPASS;
    }
    unsafe { *(return_slot as *mut usize) = hook.leave_stub };
    ACTION_CALL
}

unsafe extern "C" fn leave_dispatch(hook: *const HookShared, frame: *mut LeaveFrame) -> usize {
    let hook = &*hook;
    let frame = &mut *frame;
    let reentered = IN_DISPATCH.with(|busy| busy.replace(true));

    let return_slot = frame.return_slot as usize;
    let popped = INVOCATIONS.try_with(|stack| pop_invocation(&mut stack.borrow_mut(), return_slot));
    let Ok(Some(invocation)) = popped else {
        // there is no way to know where to return to.
        error!(
            "no pending call of the hook at {:#x} returns through {:#x}, aborting",
            hook.address, return_slot
        );
        std::process::abort();
    };

    let mut ctx = invocation.context;
    ctx.set_return_value(frame.rax);
    if reentered {
        ctx.set_state(DispatchState::Returned);
    } else {
        frame.rax = run_leave(hook, &mut ctx);
    }
    drop(ctx);

    if !reentered {
        IN_DISPATCH.with(|busy| busy.set(false));
    }
    invocation.return_address
}

/// runs the leave callback, and returns the value the caller will see.
fn run_leave(hook: &HookShared, ctx: &mut CallContext) -> u64 {
    ctx.set_state(DispatchState::LeaveDispatched);
    if let Err(message) = run_callback(|| hook.listener.on_leave(ctx)) {
        hook.record_fault(Phase::Leave, message);
        if let FaultPolicy::SkipOriginal { return_value } = hook.options.fault_policy {
            let replaced = ctx.replace_return_value(return_value);
            debug_assert!(replaced.is_ok());
        }
    }
    ctx.set_state(DispatchState::Returned);
    let return_value = ctx.return_value().map_or(0, |value| value.raw());
    trace!(
        target: "waylay::dispatch",
        "leave {:#x} with {:#x}",
        hook.address,
        return_value
    );
    return_value
}

/// pops the invocation which returns through `return_slot`.
///
/// invocations above it were abandoned by a non-local exit such as `longjmp`, and are discarded.
fn pop_invocation(stack: &mut Vec<Invocation>, return_slot: usize) -> Option<Invocation> {
    while let Some(invocation) = stack.pop() {
        if invocation.return_slot == return_slot {
            return Some(invocation);
        }
        if invocation.return_slot > return_slot {
            // it belongs to a caller of ours, so ours is missing.
            stack.push(invocation);
            return None;
        }
        warn!(
            target: "waylay::dispatch",
            "discarding abandoned call to {:#x}",
            invocation.context.function()
        );
        // the hook's code can't be freed while the invocation counts as in flight.
        unsafe { &*invocation.hook }.leave_code();
    }
    None
}

fn run_callback(callback: impl FnOnce()) -> Result<(), String> {
    catch_unwind(AssertUnwindSafe(callback)).map_err(|payload| {
        payload
            .downcast_ref::<&str>()
            .map(|message| message.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| String::from("non-string panic payload"))
    })
}

impl fmt::Debug for HookShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookShared")
            .field("address", &format_args!("{:#x}", self.address))
            .field("options", &self.options)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
