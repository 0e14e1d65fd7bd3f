//! the state of a single intercepted call, as seen by the listener callbacks.

use core::any::Any;
use std::{cell::OnceCell, sync::Arc};

use crate::{memory::MemoryReader, Error, Result};

/// the amount of arguments passed in registers by the system v amd64 calling convention.
pub const REGISTER_ARGS: usize = 6;

/// the amount of arguments assumed when no signature is declared for a hooked function.
pub const DEFAULT_ARITY: usize = REGISTER_ARGS;

/// how the raw return register of a hooked function is interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReturnType {
    Void,
    I32,
    U32,
    I64,
    U64,
    #[default]
    Pointer,
}

/// the declared shape of a hooked function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    /// the amount of integer arguments the function takes.
    pub arity: usize,
    pub returns: ReturnType,
}
impl Signature {
    pub fn new(arity: usize, returns: ReturnType) -> Self {
        Self { arity, returns }
    }
}
impl Default for Signature {
    fn default() -> Self {
        Self::new(DEFAULT_ARITY, ReturnType::default())
    }
}

/// where an intercepted call currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Idle,
    /// the enter callback is running.
    EnterDispatched,
    /// the original function is running.
    OriginalExecuting,
    /// the leave callback is running.
    LeaveDispatched,
    Returned,
}

/// a return value interpreted according to its declared type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypedValue {
    Void,
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    Pointer(usize),
}

/// the value returned by a hooked function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReturnValue {
    raw: u64,
    ty: ReturnType,
}
impl ReturnValue {
    pub fn new(raw: u64, ty: ReturnType) -> Self {
        Self { raw, ty }
    }

    /// the raw content of the return register.
    pub fn raw(&self) -> u64 {
        self.raw
    }

    /// the low 32 bits as a signed value. the upper bits are ignored, never saturated into range.
    pub fn to_i32(&self) -> i32 {
        self.raw as u32 as i32
    }

    pub fn to_u32(&self) -> u32 {
        self.raw as u32
    }

    pub fn to_i64(&self) -> i64 {
        self.raw as i64
    }

    pub fn to_u64(&self) -> u64 {
        self.raw
    }

    pub fn as_ptr(&self) -> usize {
        self.raw as usize
    }

    pub fn return_type(&self) -> ReturnType {
        self.ty
    }

    /// the value according to the declared return type.
    pub fn value(&self) -> TypedValue {
        match self.ty {
            ReturnType::Void => TypedValue::Void,
            ReturnType::I32 => TypedValue::I32(self.to_i32()),
            ReturnType::U32 => TypedValue::U32(self.to_u32()),
            ReturnType::I64 => TypedValue::I64(self.to_i64()),
            ReturnType::U64 => TypedValue::U64(self.to_u64()),
            ReturnType::Pointer => TypedValue::Pointer(self.as_ptr()),
        }
    }
}

/// an argument of an intercepted call.
#[derive(Clone, Copy)]
pub struct Argument<'a> {
    index: usize,
    value: u64,
    ctx: &'a CallContext,
}
impl<'a> Argument<'a> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn as_ptr(&self) -> usize {
        self.value as usize
    }

    pub fn to_i32(&self) -> i32 {
        self.value as u32 as i32
    }

    pub fn to_u32(&self) -> u32 {
        self.value as u32
    }

    pub fn to_i64(&self) -> i64 {
        self.value as i64
    }

    /// reads `len` bytes from where this argument points to.
    pub fn read_bytes(&self, len: usize) -> Result<Vec<u8>> {
        let mut bytes = vec![0u8; len];
        self.ctx.memory.read(self.as_ptr(), &mut bytes)?;
        Ok(bytes)
    }

    /// decodes the nul terminated utf-8 string this argument points to.
    ///
    /// the string is read on first access and cached for the rest of the call.
    pub fn read_utf8_string(&self) -> Result<&'a str> {
        let ctx = self.ctx;
        let address = self.as_ptr();
        ctx.strings[self.index]
            .get_or_init(|| {
                let bytes = ctx.memory.read_c_string(address, ctx.max_string_len)?;
                String::from_utf8(bytes).map_err(|_| Error::InvalidUtf8 { address })
            })
            .as_deref()
            .map_err(Clone::clone)
    }
}
impl core::fmt::Debug for Argument<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Argument")
            .field("index", &self.index)
            .field("value", &format_args!("{:#x}", self.value))
            .finish()
    }
}

/// what was captured when the hooked function was entered.
pub(crate) struct Capture {
    pub function: usize,
    pub registers: [u64; REGISTER_ARGS],
    /// the stack pointer at entry, pointing at the return address.
    pub stack_pointer: usize,
    pub return_address: usize,
    pub depth: usize,
    pub signature: Signature,
    pub max_string_len: usize,
}

/// an intercepted call.
///
/// a call context lives from the moment the hooked function is entered until its leave callback returns. it belongs to
/// the thread which made the call.
pub struct CallContext {
    function: usize,
    depth: usize,
    state: DispatchState,
    registers: [u64; REGISTER_ARGS],
    registers_replaced: bool,
    stack_pointer: usize,
    return_address: usize,
    signature: Signature,
    max_string_len: usize,
    memory: Arc<dyn MemoryReader>,
    stack_args: Vec<OnceCell<Result<u64>>>,
    strings: Vec<OnceCell<Result<String>>>,
    return_value: Option<u64>,
    skip: Option<u64>,
    data: Option<Box<dyn Any>>,
}
impl CallContext {
    pub(crate) fn new(capture: Capture, memory: Arc<dyn MemoryReader>) -> Self {
        let arity = capture.signature.arity;
        Self {
            function: capture.function,
            depth: capture.depth,
            state: DispatchState::Idle,
            registers: capture.registers,
            registers_replaced: false,
            stack_pointer: capture.stack_pointer,
            return_address: capture.return_address,
            signature: capture.signature,
            max_string_len: capture.max_string_len,
            memory,
            stack_args: (REGISTER_ARGS..arity.max(REGISTER_ARGS))
                .map(|_| OnceCell::new())
                .collect(),
            strings: (0..arity).map(|_| OnceCell::new()).collect(),
            return_value: None,
            skip: None,
            data: None,
        }
    }

    /// the address of the hooked function.
    pub fn function(&self) -> usize {
        self.function
    }

    /// how many intercepted calls on this thread were already in progress when this call was made.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn state(&self) -> DispatchState {
        self.state
    }

    pub fn signature(&self) -> Signature {
        self.signature
    }

    /// the address the hooked function returns to.
    pub fn return_address(&self) -> usize {
        self.return_address
    }

    pub fn arity(&self) -> usize {
        self.signature.arity
    }

    /// the argument at `index`.
    ///
    /// register arguments are captured at entry. stack arguments are read from the caller's stack on first access.
    pub fn arg(&self, index: usize) -> Result<Argument<'_>> {
        let value = if index < REGISTER_ARGS {
            self.check_arity(index)?;
            self.registers[index]
        } else {
            self.check_arity(index)?;
            self.stack_args[index - REGISTER_ARGS]
                .get_or_init(|| self.memory.read_u64(self.stack_arg_address(index)))
                .clone()?
        };
        Ok(Argument {
            index,
            value,
            ctx: self,
        })
    }

    /// all declared arguments, in order.
    pub fn args(&self) -> impl Iterator<Item = Result<Argument<'_>>> {
        (0..self.arity()).map(|index| self.arg(index))
    }

    /// replaces the argument at `index` before the original function sees it.
    pub fn replace_arg(&mut self, index: usize, value: u64) -> Result<()> {
        self.check_state(DispatchState::EnterDispatched)?;
        self.check_arity(index)?;
        if index < REGISTER_ARGS {
            self.registers[index] = value;
            self.registers_replaced = true;
        } else {
            // the stack argument area belongs to the callee, which is free to overwrite it.
            self.memory
                .write(self.stack_arg_address(index), &value.to_le_bytes())?;
            self.stack_args[index - REGISTER_ARGS] = OnceCell::from(Ok(value));
        }
        self.strings[index] = OnceCell::new();
        Ok(())
    }

    /// skips the original function, making the call return `return_value` right after the leave callback.
    pub fn skip_original(&mut self, return_value: u64) -> Result<()> {
        self.check_state(DispatchState::EnterDispatched)?;
        self.skip = Some(return_value);
        Ok(())
    }

    /// the value returned by the original function, or the one it was skipped with.
    pub fn return_value(&self) -> Result<ReturnValue> {
        self.return_value
            .map(|raw| ReturnValue::new(raw, self.signature.returns))
            .ok_or(Error::ReturnValueUnavailable)
    }

    /// replaces the value the caller will see returned.
    pub fn replace_return_value(&mut self, value: u64) -> Result<()> {
        self.check_state(DispatchState::LeaveDispatched)?;
        self.return_value = Some(value);
        Ok(())
    }

    /// attaches user data to this call, replacing any previous data.
    pub fn set_data<T: Any>(&mut self, data: T) {
        self.data = Some(Box::new(data));
    }

    pub fn data<T: Any>(&self) -> Option<&T> {
        self.data.as_deref()?.downcast_ref()
    }

    pub fn data_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.data.as_deref_mut()?.downcast_mut()
    }

    pub fn take_data<T: Any>(&mut self) -> Option<T> {
        match self.data.take()?.downcast() {
            Ok(data) => Some(*data),
            Err(data) => {
                self.data = Some(data);
                None
            }
        }
    }

    pub(crate) fn set_state(&mut self, state: DispatchState) {
        self.state = state;
    }

    pub(crate) fn replaced_registers(&self) -> Option<&[u64; REGISTER_ARGS]> {
        self.registers_replaced.then_some(&self.registers)
    }

    pub(crate) fn skip_value(&self) -> Option<u64> {
        self.skip
    }

    pub(crate) fn set_return_value(&mut self, raw: u64) {
        self.return_value = Some(raw);
    }

    fn stack_arg_address(&self, index: usize) -> usize {
        self.stack_pointer + 8 * (index - (REGISTER_ARGS - 1))
    }

    fn check_arity(&self, index: usize) -> Result<()> {
        if index >= self.arity() {
            return Err(Error::ArgumentOutOfRange {
                index,
                arity: self.arity(),
            });
        }
        Ok(())
    }

    fn check_state(&self, expected: DispatchState) -> Result<()> {
        if self.state != expected {
            return Err(Error::InvalidState);
        }
        Ok(())
    }
}
impl core::fmt::Debug for CallContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CallContext")
            .field("function", &format_args!("{:#x}", self.function))
            .field("depth", &self.depth)
            .field("state", &self.state)
            .field("return_address", &format_args!("{:#x}", self.return_address))
            .field("return_value", &self.return_value)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ProcessMemory;

    fn context(registers: [u64; REGISTER_ARGS], stack_pointer: usize, arity: usize) -> CallContext {
        CallContext::new(
            Capture {
                function: 0x1000,
                registers,
                stack_pointer,
                return_address: 0x2000,
                depth: 0,
                signature: Signature::new(arity, ReturnType::I32),
                max_string_len: 16,
            },
            Arc::new(ProcessMemory::new()),
        )
    }

    #[test]
    fn register_and_stack_arguments() {
        // the return address, followed by the stack arguments.
        let stack = [0x2000u64, 60, 70];
        let ctx = context([0, 10, 20, 30, 40, 50], stack.as_ptr() as usize, 8);
        let values: Vec<u64> = ctx.args().map(|arg| arg.unwrap().value()).collect();
        assert_eq!(values, [0, 10, 20, 30, 40, 50, 60, 70]);
        assert_eq!(
            ctx.arg(8).unwrap_err(),
            Error::ArgumentOutOfRange { index: 8, arity: 8 }
        );
    }

    #[test]
    fn arity_limits_register_arguments_too() {
        let ctx = context([1, 2, 3, 4, 5, 6], 0, 2);
        assert_eq!(ctx.arg(1).unwrap().value(), 2);
        assert!(matches!(
            ctx.arg(2),
            Err(Error::ArgumentOutOfRange { index: 2, arity: 2 })
        ));
    }

    #[test]
    fn strings_are_decoded_and_cached() {
        let text = b"hi\n\0";
        let invalid = b"\xff\xfe\0";
        let unterminated = [b'a'; 32];
        let ctx = context(
            [
                0,
                text.as_ptr() as u64,
                invalid.as_ptr() as u64,
                unterminated.as_ptr() as u64,
                0,
                0,
            ],
            0,
            6,
        );

        let first = ctx.arg(1).unwrap().read_utf8_string().unwrap();
        let second = ctx.arg(1).unwrap().read_utf8_string().unwrap();
        assert_eq!(first, "hi\n");
        assert!(core::ptr::eq(first, second));

        assert_eq!(
            ctx.arg(2).unwrap().read_utf8_string(),
            Err(Error::InvalidUtf8 {
                address: invalid.as_ptr() as usize
            })
        );
        assert!(matches!(
            ctx.arg(3).unwrap().read_utf8_string(),
            Err(Error::UnterminatedString { limit: 16, .. })
        ));
        assert!(matches!(
            ctx.arg(0).unwrap().read_utf8_string(),
            Err(Error::InvalidMemoryRead { address: 0, .. })
        ));
        assert_eq!(ctx.arg(1).unwrap().read_bytes(2).unwrap(), b"hi");
        assert!(ctx.arg(0).unwrap().read_bytes(2).is_err());
    }

    #[test]
    fn state_gates_mutation() {
        let mut ctx = context([0; 6], 0, 6);
        assert_eq!(ctx.replace_arg(0, 1), Err(Error::InvalidState));
        assert_eq!(ctx.return_value(), Err(Error::ReturnValueUnavailable));

        ctx.set_state(DispatchState::EnterDispatched);
        ctx.replace_arg(0, 1).unwrap();
        assert_eq!(ctx.arg(0).unwrap().value(), 1);
        assert_eq!(ctx.replaced_registers().unwrap()[0], 1);
        assert_eq!(ctx.replace_return_value(5), Err(Error::InvalidState));
        ctx.skip_original(7).unwrap();
        assert_eq!(ctx.skip_value(), Some(7));

        ctx.set_state(DispatchState::LeaveDispatched);
        ctx.set_return_value(7);
        assert_eq!(ctx.return_value().unwrap().to_u64(), 7);
        assert_eq!(ctx.skip_original(1), Err(Error::InvalidState));
        ctx.replace_return_value(9).unwrap();
        assert_eq!(ctx.return_value().unwrap().to_u64(), 9);
    }

    #[test]
    fn replacing_a_stack_argument_writes_the_stack() {
        let mut stack = [0x2000u64, 60];
        let mut ctx = context([0; 6], stack.as_mut_ptr() as usize, 7);
        ctx.set_state(DispatchState::EnterDispatched);
        ctx.replace_arg(6, 61).unwrap();
        assert_eq!(ctx.arg(6).unwrap().value(), 61);
        drop(ctx);
        assert_eq!(stack[1], 61);
    }

    #[test]
    fn replacing_an_unwritable_stack_argument_fails() {
        let page_size = region::page::size();
        let mut pages = region::alloc(page_size * 2, region::Protection::READ_WRITE).unwrap();
        let base = pages.as_mut_ptr::<u8>() as usize;
        unsafe {
            (base as *mut u64).add(page_size / 8 - 1).write(0x2000);
            region::protect((base + page_size) as *const u8, page_size, region::Protection::NONE)
                .unwrap();
        }

        // the return address is the last word of the first page, so the 7th argument is on the second one.
        let mut ctx = context([0; 6], base + page_size - 8, 7);
        ctx.set_state(DispatchState::EnterDispatched);
        assert_eq!(
            ctx.replace_arg(6, 61),
            Err(Error::InvalidMemoryWrite {
                address: base + page_size,
                len: 8
            })
        );
        assert!(matches!(
            ctx.arg(6),
            Err(Error::InvalidMemoryRead { .. })
        ));
    }

    #[test]
    fn return_value_conversions() {
        let value = ReturnValue::new(0xffff_ffff, ReturnType::I32);
        assert_eq!(value.to_i32(), -1);
        assert_eq!(value.to_u32(), u32::MAX);
        assert_eq!(value.to_i64(), 0xffff_ffff);
        assert_eq!(value.value(), TypedValue::I32(-1));

        let wide = ReturnValue::new(0x1_0000_0003, ReturnType::U64);
        assert_eq!(wide.to_i32(), 3);
        assert_eq!(wide.value(), TypedValue::U64(0x1_0000_0003));

        assert_eq!(ReturnValue::new(u64::MAX, ReturnType::I64).to_i64(), -1);
        assert_eq!(ReturnValue::new(3, ReturnType::Void).value(), TypedValue::Void);
    }

    #[test]
    fn user_data_round_trip() {
        let mut ctx = context([0; 6], 0, 6);
        assert!(ctx.data::<u32>().is_none());
        ctx.set_data(5u32);
        *ctx.data_mut::<u32>().unwrap() += 1;
        assert_eq!(ctx.data::<u32>(), Some(&6));
        assert_eq!(ctx.take_data::<String>(), None);
        assert_eq!(ctx.take_data::<u32>(), Some(6));
        assert!(ctx.data::<u32>().is_none());
    }
}
