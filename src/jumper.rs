//! encoding of the jumps placed at the start of a hooked function and at the end of its trampoline.

use arrayvec::ArrayVec;

const JMP_RIP_INSN_LEN: usize = 6;
const JMP_RIP_INSN: [u8; JMP_RIP_INSN_LEN] = [0xFF, 0x25, 0x00, 0x00, 0x00, 0x00];

/// `push imm32` sign extends its operand, so a short jumper can only reach the low 2GB.
const SHORT_JUMPER_MAX_TARGET: u64 = 0x8000_0000;

/// the length of a short relative jumper.
pub const SHORT_REL_JUMPER_LEN: usize = core::mem::size_of::<ShortRelJumper>();

/// the length of a short jumper.
pub const SHORT_JUMPER_LEN: usize = core::mem::size_of::<ShortJumper>();

/// the length of a long jumper.
pub const LONG_JUMPER_LEN: usize = core::mem::size_of::<LongJumper>();

/// the maximum length of a jumper of any kind.
pub const MAX_JUMPER_LEN: usize = LONG_JUMPER_LEN;

/// a type alias for the bytes of a jumper.
pub type JumperBytes = ArrayVec<u8, MAX_JUMPER_LEN>;

/// the different kinds of jumper available
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumperKind {
    /// a short relative jumper, which is a 32 bit relative jump.
    ShortRel,
    /// a short jumper, which is a push 32 bit address followed by a ret instruction.
    Short,
    /// a long jumper, which is a jmp to rip followed by the raw 64 bit address.
    Long,
}
impl JumperKind {
    /// returns the size of the jumper in bytes
    pub fn size_in_bytes(&self) -> usize {
        match self {
            JumperKind::ShortRel => SHORT_REL_JUMPER_LEN,
            JumperKind::Short => SHORT_JUMPER_LEN,
            JumperKind::Long => LONG_JUMPER_LEN,
        }
    }

    /// returns whether a jumper of this kind placed at `jumper_addr` can reach `target_addr`.
    pub fn can_reach(&self, jumper_addr: u64, target_addr: u64) -> bool {
        match self {
            JumperKind::ShortRel => short_rel_displacement(jumper_addr, target_addr).is_some(),
            JumperKind::Short => target_addr < SHORT_JUMPER_MAX_TARGET,
            JumperKind::Long => true,
        }
    }

    /// builds the jumper into an array of bytes.
    ///
    /// # panics
    /// panics if the jumper kind can't reach the target, see [`can_reach`].
    ///
    /// [`can_reach`]: JumperKind::can_reach
    pub fn build(&self, jumper_addr: u64, target_addr: u64) -> JumperBytes {
        let mut bytes = JumperBytes::new();
        match self {
            JumperKind::ShortRel => {
                let displacement = short_rel_displacement(jumper_addr, target_addr)
                    .expect("tried to use a short relative jumper but the distance to the target does not fit in 32 bits");
                let jumper = ShortRelJumper {
                    jump_opcode: 0xe9,
                    displacement: displacement.to_le(),
                };
                bytes.extend(jumper.to_bytes());
            }
            JumperKind::Short => {
                assert!(
                    target_addr < SHORT_JUMPER_MAX_TARGET,
                    "tried to use a short jumper but the target address does not fit in a sign extended 32 bit push"
                );
                let jumper = ShortJumper {
                    push: Push32BitImm {
                        push_opcode: 0x68,
                        pushed_value: (target_addr as u32).to_le(),
                    },
                    ret: 0xc3,
                };
                bytes.extend(jumper.to_bytes());
            }
            JumperKind::Long => {
                let jumper = LongJumper {
                    jmp_rip: JMP_RIP_INSN,
                    target_addr: target_addr.to_le(),
                };
                bytes.extend(jumper.to_bytes());
            }
        }
        bytes
    }
}

/// determines the best jumper kind to use in a specific case.
pub fn determine_best_jumper_kind(jumper_addr: u64, target_addr: u64) -> JumperKind {
    [JumperKind::ShortRel, JumperKind::Short]
        .into_iter()
        .find(|kind| kind.can_reach(jumper_addr, target_addr))
        .unwrap_or(JumperKind::Long)
}

/// determines the best jumper kind to use in a specific case and builds it.
pub fn determine_best_jumper_kind_and_build(jumper_addr: u64, target_addr: u64) -> JumperBytes {
    determine_best_jumper_kind(jumper_addr, target_addr).build(jumper_addr, target_addr)
}

fn short_rel_displacement(jumper_addr: u64, target_addr: u64) -> Option<i32> {
    let jmp_insn_end_addr = jumper_addr.wrapping_add(SHORT_REL_JUMPER_LEN as u64);
    i32::try_from(target_addr.wrapping_sub(jmp_insn_end_addr) as i64).ok()
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct ShortRelJumper {
    jump_opcode: u8,
    displacement: i32,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct ShortJumper {
    push: Push32BitImm,
    ret: u8,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct Push32BitImm {
    push_opcode: u8,
    pushed_value: u32,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct LongJumper {
    jmp_rip: [u8; JMP_RIP_INSN_LEN],
    target_addr: u64,
}

macro_rules! impl_to_bytes {
    ($($jumper:ty => $len:expr),* $(,)?) => {
        $(
            impl $jumper {
                fn to_bytes(self) -> [u8; $len] {
                    // the jumpers are packed plain old data, so every bit pattern is a valid byte array.
                    unsafe { core::mem::transmute::<$jumper, [u8; $len]>(self) }
                }
            }
        )*
    };
}

impl_to_bytes! {
    ShortRelJumper => SHORT_REL_JUMPER_LEN,
    ShortJumper => SHORT_JUMPER_LEN,
    LongJumper => LONG_JUMPER_LEN,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jumper_lengths() {
        assert_eq!(SHORT_REL_JUMPER_LEN, 5);
        assert_eq!(SHORT_JUMPER_LEN, 6);
        assert_eq!(LONG_JUMPER_LEN, 14);
    }

    #[test]
    fn short_rel_jumper_encodes_displacement_from_insn_end() {
        let bytes = JumperKind::ShortRel.build(0x1000, 0x2000);
        assert_eq!(bytes.as_slice(), &[0xe9, 0xfb, 0x0f, 0x00, 0x00]);

        let backwards = JumperKind::ShortRel.build(0x2000, 0x1000);
        assert_eq!(backwards.as_slice(), &[0xe9, 0xfb, 0xef, 0xff, 0xff]);
    }

    #[test]
    fn short_jumper_is_push_ret() {
        let bytes = JumperKind::Short.build(0x7fff_0000_0000, 0x1234_5678);
        assert_eq!(bytes.as_slice(), &[0x68, 0x78, 0x56, 0x34, 0x12, 0xc3]);
    }

    #[test]
    fn long_jumper_embeds_absolute_address() {
        let bytes = JumperKind::Long.build(0, 0x1122_3344_5566_7788);
        assert_eq!(
            bytes.as_slice(),
            &[0xff, 0x25, 0, 0, 0, 0, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
        );
    }

    #[test]
    fn best_kind_prefers_the_smallest_reachable_jumper() {
        assert_eq!(
            determine_best_jumper_kind(0x7f00_0000_0000, 0x7f00_1000_0000),
            JumperKind::ShortRel
        );
        assert_eq!(
            determine_best_jumper_kind(0x7f00_0000_0000, 0x4000_0000),
            JumperKind::Short
        );
        // sign extension of push imm32 would turn this into a kernel address.
        assert_eq!(
            determine_best_jumper_kind(0x7f00_0000_0000, 0x9000_0000),
            JumperKind::Long
        );
    }
}
