use core::mem::MaybeUninit;

use arrayvec::ArrayVec;
use zydis_sys::{
    ZyanStatus, ZydisDecodedInstruction, ZydisDecodedOperand, ZydisDecoder, ZydisDecoderContext,
    ZydisDecoderDecodeInstruction, ZydisDecoderDecodeOperands, ZydisDecoderInit, ZydisMachineMode,
    ZydisMnemonic, ZydisOperandType, ZydisRegister, ZydisStackWidth,
    ZYDIS_MAX_OPERAND_COUNT_VISIBLE,
};

const MAX_INSN_VISIBLE_OPERANDS: usize = ZYDIS_MAX_OPERAND_COUNT_VISIBLE as usize;
const ZYAN_IS_ERROR_BIT_MASK: u32 = 0x80000000;

pub(crate) struct Decoder {
    decoder: ZydisDecoder,
}
impl Decoder {
    pub(crate) fn new() -> Self {
        let mut decoder: MaybeUninit<ZydisDecoder> = MaybeUninit::uninit();
        let status = unsafe {
            ZydisDecoderInit(
                decoder.as_mut_ptr(),
                ZydisMachineMode::ZYDIS_MACHINE_MODE_LONG_64,
                ZydisStackWidth::ZYDIS_STACK_WIDTH_64,
            )
        };
        zyan_check(status).expect("failed to initialize a 64-bit mode zydis decoder");
        Self {
            decoder: unsafe { decoder.assume_init() },
        }
    }

    pub(crate) fn decode(&self, buf: &[u8]) -> Result<DecodedInsnInfo, ()> {
        let mut decoder_ctx_uninit: MaybeUninit<ZydisDecoderContext> = MaybeUninit::uninit();
        let mut insn_uninit: MaybeUninit<ZydisDecodedInstruction> = MaybeUninit::uninit();

        let status = unsafe {
            ZydisDecoderDecodeInstruction(
                &self.decoder,
                decoder_ctx_uninit.as_mut_ptr(),
                buf.as_ptr().cast(),
                buf.len() as u64,
                insn_uninit.as_mut_ptr(),
            )
        };
        zyan_check(status)?;

        let decoder_ctx = unsafe { decoder_ctx_uninit.assume_init() };
        let insn = unsafe { insn_uninit.assume_init() };

        if insn.operand_count_visible as usize > MAX_INSN_VISIBLE_OPERANDS {
            return Err(());
        }

        let mut operands: ArrayVec<ZydisDecodedOperand, MAX_INSN_VISIBLE_OPERANDS> =
            ArrayVec::new();
        let status = unsafe {
            ZydisDecoderDecodeOperands(
                &self.decoder,
                &decoder_ctx,
                &insn,
                operands.as_mut_ptr(),
                insn.operand_count_visible,
            )
        };
        zyan_check(status)?;

        unsafe { operands.set_len(insn.operand_count_visible as usize) }

        Ok(DecodedInsnInfo { insn, operands })
    }
}

pub(crate) struct DecodedInsnInfo {
    insn: ZydisDecodedInstruction,
    operands: ArrayVec<ZydisDecodedOperand, MAX_INSN_VISIBLE_OPERANDS>,
}
impl DecodedInsnInfo {
    pub(crate) fn len(&self) -> usize {
        self.insn.length as usize
    }

    /// the location of the pc relative field of this instruction, if it has one.
    ///
    /// this is either a relative branch immediate or the displacement of a rip based memory operand.
    pub(crate) fn relative_field(&self) -> Option<RelativeField> {
        for operand in &self.operands {
            match operand.type_ {
                ZydisOperandType::ZYDIS_OPERAND_TYPE_IMMEDIATE => {
                    if unsafe { operand.__bindgen_anon_1.imm }.is_relative != 0 {
                        let raw_imm = self.insn.raw.imm.iter().find(|imm| imm.is_relative != 0)?;
                        return Some(RelativeField {
                            offset: raw_imm.offset,
                            size: raw_imm.size / 8,
                            branch: true,
                        });
                    }
                }
                ZydisOperandType::ZYDIS_OPERAND_TYPE_MEMORY => {
                    if unsafe { operand.__bindgen_anon_1.mem }.base == ZydisRegister::ZYDIS_REGISTER_RIP
                    {
                        return Some(RelativeField {
                            offset: self.insn.raw.disp.offset,
                            size: self.insn.raw.disp.size / 8,
                            branch: false,
                        });
                    }
                }
                _ => {}
            }
        }
        None
    }

    /// whether execution never falls through to the instruction following this one.
    pub(crate) fn ends_control_flow(&self) -> bool {
        matches!(
            self.insn.mnemonic,
            ZydisMnemonic::ZYDIS_MNEMONIC_RET
                | ZydisMnemonic::ZYDIS_MNEMONIC_JMP
                | ZydisMnemonic::ZYDIS_MNEMONIC_UD2
                | ZydisMnemonic::ZYDIS_MNEMONIC_INT3
                | ZydisMnemonic::ZYDIS_MNEMONIC_HLT
        )
    }
}

/// a pc relative field inside of an encoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RelativeField {
    /// the offset of the field from the start of the instruction.
    pub offset: u8,
    /// the size of the field in bytes.
    pub size: u8,
    /// whether the field is a branch target rather than a memory operand.
    pub branch: bool,
}

fn zyan_is_err(status: ZyanStatus) -> bool {
    status & ZYAN_IS_ERROR_BIT_MASK != 0
}
fn zyan_check(status: ZyanStatus) -> Result<(), ()> {
    if zyan_is_err(status) {
        Err(())
    } else {
        Ok(())
    }
}
