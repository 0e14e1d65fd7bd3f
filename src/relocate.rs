//! relocation of the instructions at the start of a function into a trampoline.

use arrayvec::ArrayVec;
use thiserror_no_std::Error;

use crate::{
    decoder::{Decoder, RelativeField},
    jumper::{JumperKind, LONG_JUMPER_LEN, MAX_JUMPER_LEN},
    trampoline::MAX_PATCH_LEN,
};

/// the maximum length of relocated instructions.
///
/// the largest expansion is of a 2 byte `loop` whose target is far away, which takes 18 bytes once relocated.
pub const MAX_RELOCATED_LEN: usize = MAX_PATCH_LEN * 9;

/// a type alias for the bytes of relocated instructions.
pub type RelocatedBytes = ArrayVec<u8, MAX_RELOCATED_LEN>;

const JMP_REL32_LEN: usize = 5;
const JCC_REL32_LEN: usize = 6;
const CALL_REL32_LEN: usize = 5;
/// `call [rip + 2]; jmp +8` followed by the absolute target.
const CALL_ABS_LEN: usize = 16;

/// relocate the instructions at the start of the function so that we can put them in a different memory address and they
/// will still work fine.
///
/// `hooked_function_content` must start at `hooked_function_runtime_addr`, and should contain enough bytes to decode every
/// instruction which starts before `relocate_bytes_amount`.
pub fn relocate_fn_start(
    hooked_function_content: &[u8],
    hooked_function_runtime_addr: u64,
    relocate_bytes_amount: usize,
) -> Result<RelocateFnStartInfo, RelocateError> {
    let mut cur_index = 0;
    let mut insns = ArrayVec::new();
    let decoder = Decoder::new();
    while cur_index < relocate_bytes_amount {
        let insn = decoder
            .decode(hooked_function_content.get(cur_index..).unwrap_or_default())
            .map_err(|_| RelocateError::FailedToDecodeInsn { offset: cur_index })?;
        let insn_end = cur_index + insn.len();
        if insn.ends_control_flow() && insn_end < relocate_bytes_amount {
            return Err(RelocateError::FunctionTooShort { offset: cur_index });
        }
        insns
            .try_push(RelocatedInsn {
                offset: cur_index,
                len: insn.len(),
                relative: insn.relative_field(),
            })
            .map_err(|_| RelocateError::FailedToDecodeInsn { offset: cur_index })?;
        cur_index = insn_end;
    }
    Ok(RelocateFnStartInfo {
        bytes_to_copy: cur_index,
        hooked_function_runtime_addr,
        insns,
    })
}

/// information needed to relocate the bytes at the start of a function.
#[derive(Debug, Clone)]
pub struct RelocateFnStartInfo {
    /// the amount of bytes that you need to copy to properly relocate the instructions at the start of this function.
    /// this may be larger than the amount of bytes requested to be relocated since that amount may not end on an instruction boundary.
    pub bytes_to_copy: usize,
    hooked_function_runtime_addr: u64,
    // every instruction is at least one byte long, so no more instructions than jumper bytes are ever relocated.
    insns: ArrayVec<RelocatedInsn, MAX_JUMPER_LEN>,
}
impl RelocateFnStartInfo {
    /// the length of the instructions once relocated to `new_runtime_addr`.
    ///
    /// this may exceed [`bytes_to_copy`](Self::bytes_to_copy), since branches out of the copied region are widened to
    /// reach their targets from the new address.
    pub fn relocated_len(
        &self,
        hooked_function_content: &[u8],
        new_runtime_addr: u64,
    ) -> Result<usize, RelocateError> {
        Ok(self.plan(hooked_function_content, new_runtime_addr)?.len)
    }

    /// replaces the content of `out` with the instructions relocated to run at `new_runtime_addr`.
    ///
    /// rip relative memory operands are rewritten in place. branches out of the copied region are re-encoded with a
    /// 32 bit displacement, or as an absolute jump if that can't reach. branches into the copied region point at the
    /// relocated copy of their target.
    pub fn write_relocated(
        &self,
        hooked_function_content: &[u8],
        new_runtime_addr: u64,
        out: &mut RelocatedBytes,
    ) -> Result<(), RelocateError> {
        let plan = self.plan(hooked_function_content, new_runtime_addr)?;
        out.clear();
        for (insn, &(rewrite, new_offset)) in self.insns.iter().zip(&plan.insns) {
            let bytes = &hooked_function_content[insn.offset..insn.offset + insn.len];
            let at = new_runtime_addr + new_offset as u64;
            match rewrite {
                Rewrite::Copy => out.extend(bytes.iter().copied()),
                Rewrite::Internal { target_index } => {
                    let target_new_offset = plan.insns[target_index].1;
                    let displacement = target_new_offset as i64 - (new_offset + insn.len) as i64;
                    let target = self.hooked_function_runtime_addr + self.insns[target_index].offset as u64;
                    put_displaced(out, insn, bytes, displacement, target)?;
                }
                Rewrite::Displaced { target } => {
                    let displacement = target.wrapping_sub(at + insn.len as u64) as i64;
                    put_displaced(out, insn, bytes, displacement, target)?;
                }
                Rewrite::Branch { kind, target, far } => {
                    put_branch(out, kind, bytes, insn, at, target, far)
                }
            }
        }
        debug_assert_eq!(out.len(), plan.len);
        Ok(())
    }

    /// decides how every instruction is rewritten, and where it lands.
    fn plan(&self, hooked_function_content: &[u8], new_runtime_addr: u64) -> Result<Plan, RelocateError> {
        let region_start = self.hooked_function_runtime_addr;
        let region_end = region_start + self.bytes_to_copy as u64;

        let mut plan = Plan {
            insns: ArrayVec::new(),
            len: 0,
        };
        for insn in &self.insns {
            let undecodable = RelocateError::FailedToDecodeInsn {
                offset: insn.offset,
            };
            let bytes = hooked_function_content
                .get(insn.offset..insn.offset + insn.len)
                .ok_or(undecodable.clone())?;
            let rewrite = match insn.relative {
                None => Rewrite::Copy,
                Some(field) => {
                    let field_start = field.offset as usize;
                    let field_bytes = bytes
                        .get(field_start..field_start + field.size as usize)
                        .ok_or(undecodable.clone())?;
                    let displacement = read_displacement(field_bytes, field).ok_or(undecodable)?;
                    let target = (region_start + (insn.offset + insn.len) as u64).wrapping_add(displacement as u64);

                    if (region_start..region_end).contains(&target) {
                        let target_offset = (target - region_start) as usize;
                        // a branch into the middle of a relocated instruction has nothing to point at.
                        let target_index = self
                            .insns
                            .iter()
                            .position(|other| other.offset == target_offset)
                            .ok_or(RelocateError::UnreachableTarget {
                                offset: insn.offset,
                                target,
                            })?;
                        Rewrite::Internal { target_index }
                    } else if let Some(kind) = field.branch.then(|| branch_kind(bytes, field)).flatten() {
                        Rewrite::Branch {
                            kind,
                            target,
                            far: !rel32_reaches(new_runtime_addr, target),
                        }
                    } else {
                        Rewrite::Displaced { target }
                    }
                }
            };
            plan.insns.push((rewrite, plan.len));
            plan.len += rewritten_len(rewrite, insn);
        }
        Ok(plan)
    }
}

#[derive(Debug, Clone, Copy)]
struct RelocatedInsn {
    offset: usize,
    len: usize,
    relative: Option<RelativeField>,
}

/// the relocated layout of the copied instructions.
struct Plan {
    /// how each instruction is rewritten, and its offset in the relocated code.
    insns: ArrayVec<(Rewrite, usize), MAX_JUMPER_LEN>,
    len: usize,
}

#[derive(Debug, Clone, Copy)]
enum Rewrite {
    /// copied as is.
    Copy,
    /// points into the copied region, at the instruction at `target_index`.
    Internal { target_index: usize },
    /// a rip relative operand, or a branch with no wider form, whose field is rewritten in place.
    Displaced { target: u64 },
    /// a branch out of the copied region, re-encoded to reach `target`.
    Branch {
        kind: BranchKind,
        target: u64,
        far: bool,
    },
}

#[derive(Debug, Clone, Copy)]
enum BranchKind {
    Jmp,
    Jcc { condition: u8 },
    Call,
    /// `loop`, `loope`, `loopne` and `jrcxz`, which only have an 8 bit form.
    Loop,
}

/// classifies a relative branch by its opcode, which directly precedes its displacement.
fn branch_kind(bytes: &[u8], field: RelativeField) -> Option<BranchKind> {
    let opcode_offset = (field.offset as usize).checked_sub(1)?;
    let opcode = bytes[opcode_offset];
    let escaped = opcode_offset > 0 && bytes[opcode_offset - 1] == 0x0f;
    match (field.size, opcode, escaped) {
        (1, 0xeb, false) | (4, 0xe9, false) => Some(BranchKind::Jmp),
        (1, 0x70..=0x7f, false) | (4, 0x80..=0x8f, true) => Some(BranchKind::Jcc {
            condition: opcode & 0xf,
        }),
        (4, 0xe8, false) => Some(BranchKind::Call),
        (1, 0xe0..=0xe3, false) => Some(BranchKind::Loop),
        _ => None,
    }
}

/// whether a rel32 field anywhere in the relocated code reaches `target`.
fn rel32_reaches(new_runtime_addr: u64, target: u64) -> bool {
    let fits = |from: u64| i32::try_from(target.wrapping_sub(from) as i64).is_ok();
    fits(new_runtime_addr) && fits(new_runtime_addr + MAX_RELOCATED_LEN as u64)
}

fn rewritten_len(rewrite: Rewrite, insn: &RelocatedInsn) -> usize {
    let Rewrite::Branch { kind, far, .. } = rewrite else {
        return insn.len;
    };
    let jmp_len = if far { LONG_JUMPER_LEN } else { JMP_REL32_LEN };
    match kind {
        BranchKind::Jmp => jmp_len,
        BranchKind::Jcc { .. } if far => 2 + LONG_JUMPER_LEN,
        BranchKind::Jcc { .. } => JCC_REL32_LEN,
        BranchKind::Call if far => CALL_ABS_LEN,
        BranchKind::Call => CALL_REL32_LEN,
        BranchKind::Loop => loop_head_len(insn) + 2 + jmp_len,
    }
}

/// the prefixes and opcode of a `loop` followed by its 8 bit displacement.
fn loop_head_len(insn: &RelocatedInsn) -> usize {
    insn.relative.map_or(insn.len, |field| field.offset as usize + 1)
}

/// copies an instruction and sets its pc relative field to `displacement`.
fn put_displaced(
    out: &mut RelocatedBytes,
    insn: &RelocatedInsn,
    bytes: &[u8],
    displacement: i64,
    target: u64,
) -> Result<(), RelocateError> {
    let start = out.len();
    out.extend(bytes.iter().copied());
    let unreachable = RelocateError::UnreachableTarget {
        offset: insn.offset,
        target,
    };
    let Some(field) = insn.relative else {
        return Err(unreachable);
    };
    let field_start = start + field.offset as usize;
    write_displacement(
        &mut out[field_start..field_start + field.size as usize],
        field,
        displacement,
    )
    .ok_or(unreachable)
}

fn put_branch(
    out: &mut RelocatedBytes,
    kind: BranchKind,
    bytes: &[u8],
    insn: &RelocatedInsn,
    at: u64,
    target: u64,
    far: bool,
) {
    match kind {
        BranchKind::Jmp => put_jmp(out, at, target, far),
        BranchKind::Jcc { condition } if far => {
            // the inverted condition skips over the absolute jump.
            out.extend([0x70 | (condition ^ 1), LONG_JUMPER_LEN as u8]);
            out.extend(JumperKind::Long.build(at + 2, target));
        }
        BranchKind::Jcc { condition } => {
            out.extend([0x0f, 0x80 | condition]);
            out.extend(rel32(at + JCC_REL32_LEN as u64, target).to_le_bytes());
        }
        BranchKind::Call if far => {
            out.extend([0xff, 0x15, 0x02, 0x00, 0x00, 0x00, 0xeb, 0x08]);
            out.extend(target.to_le_bytes());
        }
        BranchKind::Call => {
            out.push(0xe8);
            out.extend(rel32(at + CALL_REL32_LEN as u64, target).to_le_bytes());
        }
        BranchKind::Loop => {
            // the loop branches into the jump to its target, and otherwise falls into a jump over it.
            let head_len = loop_head_len(insn);
            let jmp_len = if far { LONG_JUMPER_LEN } else { JMP_REL32_LEN };
            out.extend(bytes[..head_len - 1].iter().copied());
            out.extend([0x02, 0xeb, jmp_len as u8]);
            put_jmp(out, at + head_len as u64 + 2, target, far);
        }
    }
}

fn put_jmp(out: &mut RelocatedBytes, at: u64, target: u64, far: bool) {
    if far {
        out.extend(JumperKind::Long.build(at, target));
    } else {
        out.push(0xe9);
        out.extend(rel32(at + JMP_REL32_LEN as u64, target).to_le_bytes());
    }
}

/// the displacement of `target` from the end of an instruction at `next`, which [`rel32_reaches`] checked to fit.
fn rel32(next: u64, target: u64) -> i32 {
    target.wrapping_sub(next) as i64 as i32
}

fn read_displacement(bytes: &[u8], field: RelativeField) -> Option<i64> {
    Some(match field.size {
        1 => i8::from_le_bytes(bytes.try_into().ok()?) as i64,
        2 => i16::from_le_bytes(bytes.try_into().ok()?) as i64,
        4 => i32::from_le_bytes(bytes.try_into().ok()?) as i64,
        _ => return None,
    })
}

fn write_displacement(bytes: &mut [u8], field: RelativeField, displacement: i64) -> Option<()> {
    match field.size {
        1 => bytes.copy_from_slice(&i8::try_from(displacement).ok()?.to_le_bytes()),
        2 => bytes.copy_from_slice(&i16::try_from(displacement).ok()?.to_le_bytes()),
        4 => bytes.copy_from_slice(&i32::try_from(displacement).ok()?.to_le_bytes()),
        _ => return None,
    }
    Some(())
}

/// an error which occured while trying to relocate instructions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelocateError {
    #[error("failed to decode instruction at offset {offset}")]
    FailedToDecodeInsn { offset: usize },

    #[error("pc relative target {target:#x} of instruction at offset {offset} is unreachable from the trampoline")]
    UnreachableTarget { offset: usize, target: u64 },

    #[error("function ends at offset {offset}, before the hook jumper could fit")]
    FunctionTooShort { offset: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    const FN_ADDR: u64 = 0x1000_0000;
    const TRAMPOLINE_ADDR: u64 = 0x1000_8000;
    const FAR_TRAMPOLINE_ADDR: u64 = 0x7f00_0000_0000;

    fn relocate_to(content: &[u8], amount: usize, new_addr: u64) -> Result<RelocatedBytes, RelocateError> {
        let info = relocate_fn_start(content, FN_ADDR, amount)?;
        let mut out = RelocatedBytes::new();
        info.write_relocated(content, new_addr, &mut out)?;
        assert_eq!(info.relocated_len(content, new_addr)?, out.len());
        Ok(out)
    }

    fn relocate(content: &[u8], amount: usize) -> Result<RelocatedBytes, RelocateError> {
        relocate_to(content, amount, TRAMPOLINE_ADDR)
    }

    #[test]
    fn copies_whole_instructions() {
        // push rbp; mov rbp, rsp; sub rsp, 0x10; ret
        let content = [0x55, 0x48, 0x89, 0xe5, 0x48, 0x83, 0xec, 0x10, 0xc3];
        let info = relocate_fn_start(&content, FN_ADDR, 5).unwrap();
        assert_eq!(info.bytes_to_copy, 8);
        assert_eq!(relocate(&content, 5).unwrap().as_slice(), &content[..8]);
    }

    #[test]
    fn rewrites_rip_relative_displacement() {
        // mov rax, [rip + 0x10]; ret
        let content = [0x48, 0x8b, 0x05, 0x10, 0x00, 0x00, 0x00, 0xc3];
        // the target stays at FN_ADDR + 0x17, which is 0x7ff0 bytes behind the relocated instruction.
        assert_eq!(
            relocate(&content, 5).unwrap().as_slice(),
            &[0x48, 0x8b, 0x05, 0x10, 0x80, 0xff, 0xff]
        );
    }

    #[test]
    fn rejects_rip_relative_operand_out_of_reach() {
        // mov rax, [rip + 0x10]; ret
        let content = [0x48, 0x8b, 0x05, 0x10, 0x00, 0x00, 0x00, 0xc3];
        assert_eq!(
            relocate_to(&content, 5, FAR_TRAMPOLINE_ADDR),
            Err(RelocateError::UnreachableTarget {
                offset: 0,
                target: FN_ADDR + 0x17,
            })
        );
    }

    #[test]
    fn rewrites_call_rel32() {
        // call FN_ADDR + 0x105
        let content = [0xe8, 0x00, 0x01, 0x00, 0x00, 0x90];
        assert_eq!(
            relocate(&content, 5).unwrap().as_slice(),
            &[0xe8, 0x00, 0x81, 0xff, 0xff]
        );
    }

    #[test]
    fn far_call_becomes_an_absolute_call() {
        // call FN_ADDR + 0x105
        let content = [0xe8, 0x00, 0x01, 0x00, 0x00, 0x90];
        let out = relocate_to(&content, 5, FAR_TRAMPOLINE_ADDR).unwrap();
        assert_eq!(&out[..8], &[0xff, 0x15, 0x02, 0x00, 0x00, 0x00, 0xeb, 0x08]);
        assert_eq!(&out[8..], &(FN_ADDR + 0x105).to_le_bytes());
    }

    #[test]
    fn keeps_branches_into_the_copied_region() {
        // je +1; nop; nop; nop; nop
        let content = [0x74, 0x01, 0x90, 0x90, 0x90, 0x90];
        assert_eq!(relocate(&content, 5).unwrap().as_slice(), &content[..5]);
    }

    #[test]
    fn widens_rel8_branch_out_of_the_region() {
        // je +0x10; nop; nop; nop
        let content = [0x74, 0x10, 0x90, 0x90, 0x90, 0x90];
        // je rel32 to FN_ADDR + 0x12, 0x7ff4 bytes behind the end of the widened branch.
        assert_eq!(
            relocate(&content, 5).unwrap().as_slice(),
            &[0x0f, 0x84, 0x0c, 0x80, 0xff, 0xff, 0x90, 0x90, 0x90]
        );
    }

    #[test]
    fn far_conditional_branch_skips_an_absolute_jump() {
        // je +0x10; nop; nop; nop
        let content = [0x74, 0x10, 0x90, 0x90, 0x90, 0x90];
        let out = relocate_to(&content, 5, FAR_TRAMPOLINE_ADDR).unwrap();
        // jne over the jump
        assert_eq!(&out[..2], &[0x75, 0x0e]);
        assert_eq!(
            &out[2..16],
            JumperKind::Long.build(FAR_TRAMPOLINE_ADDR + 2, FN_ADDR + 0x12).as_slice()
        );
        assert_eq!(&out[16..], &[0x90, 0x90, 0x90]);
    }

    #[test]
    fn internal_branches_follow_widened_instructions() {
        // je +2 (to the nop); je +0x20; nop; nop
        let content = [0x74, 0x02, 0x74, 0x20, 0x90, 0x90];
        assert_eq!(
            relocate(&content, 5).unwrap().as_slice(),
            &[0x74, 0x06, 0x0f, 0x84, 0x1c, 0x80, 0xff, 0xff, 0x90]
        );
    }

    #[test]
    fn widens_loop_through_a_jump() {
        // loop +0x10; nop; nop; nop
        let content = [0xe2, 0x10, 0x90, 0x90, 0x90, 0x90];
        assert_eq!(
            relocate(&content, 5).unwrap().as_slice(),
            &[0xe2, 0x02, 0xeb, 0x05, 0xe9, 0x09, 0x80, 0xff, 0xff, 0x90, 0x90, 0x90]
        );
    }

    #[test]
    fn rejects_branch_into_the_middle_of_an_instruction() {
        // je +1; mov rbp, rsp
        let content = [0x74, 0x01, 0x48, 0x89, 0xe5, 0x90];
        assert_eq!(
            relocate(&content, 5),
            Err(RelocateError::UnreachableTarget {
                offset: 0,
                target: FN_ADDR + 3,
            })
        );
    }

    #[test]
    fn rejects_functions_shorter_than_the_jumper() {
        // xor eax, eax; ret
        let content = [0x31, 0xc0, 0xc3, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc];
        assert!(matches!(
            relocate_fn_start(&content, FN_ADDR, 5),
            Err(RelocateError::FunctionTooShort { offset: 2 })
        ));
    }

    #[test]
    fn jump_ending_exactly_at_the_jumper_end_is_fine() {
        // nop; nop; nop; jmp +0x20
        let content = [0x90, 0x90, 0x90, 0xeb, 0x20, 0xcc];
        assert_eq!(
            relocate(&content, 5).unwrap().as_slice(),
            &[0x90, 0x90, 0x90, 0xe9, 0x1d, 0x80, 0xff, 0xff]
        );
    }

    #[test]
    fn rejects_undecodable_bytes() {
        // a lone operand size prefix with nothing after it
        let content = [0x90, 0x66];
        assert!(matches!(
            relocate_fn_start(&content, FN_ADDR, 5),
            Err(RelocateError::FailedToDecodeInsn { offset: 1 })
        ));
    }
}
