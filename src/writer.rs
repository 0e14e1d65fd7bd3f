//! a tiny x86-64 assembler for the dispatch stubs.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rsp = 4,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
}
impl Reg {
    fn lo3(self) -> u8 {
        (self as u8) & 7
    }

    fn is_extended(self) -> bool {
        (self as u8) >= 8
    }
}

/// a forward reference to a `rel32` field which is resolved by [`Writer::bind`].
#[derive(Debug)]
#[must_use]
pub(crate) struct Label {
    field_offset: usize,
}

/// emits code which will run at `base`.
#[derive(Debug)]
pub(crate) struct Writer {
    base: u64,
    code: Vec<u8>,
}
impl Writer {
    pub(crate) fn new(base: u64) -> Self {
        Self {
            base,
            code: Vec::new(),
        }
    }

    pub(crate) fn pc(&self) -> u64 {
        self.base + self.code.len() as u64
    }

    pub(crate) fn into_bytes(self) -> Vec<u8> {
        self.code
    }

    fn emit(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    /// REX prefix: 0100 W R X B
    fn rex(w: bool, r: bool, b: bool) -> u8 {
        0x40 | ((w as u8) << 3) | ((r as u8) << 2) | (b as u8)
    }

    fn modrm(mod_: u8, reg: u8, rm: u8) -> u8 {
        ((mod_ & 3) << 6) | ((reg & 7) << 3) | (rm & 7)
    }

    /// `[base + disp32]`, always with a 32 bit displacement.
    fn emit_modrm_base_disp32(&mut self, reg_field: u8, base: Reg, offset: i32) {
        if base.lo3() == 4 {
            // rsp and r12 need a sib byte.
            self.emit(&[Self::modrm(0b10, reg_field, 0b100), 0x24]);
        } else {
            self.emit(&[Self::modrm(0b10, reg_field, base.lo3())]);
        }
        self.emit(&offset.to_le_bytes());
    }

    /// `[reg]` without a displacement.
    fn emit_modrm_indirect(&mut self, reg_field: u8, base: Reg) {
        debug_assert!(
            !matches!(base.lo3(), 4 | 5),
            "rsp, rbp, r12 and r13 need a sib byte or a displacement"
        );
        self.emit(&[Self::modrm(0b00, reg_field, base.lo3())]);
    }

    /// `mov reg, imm64`
    pub(crate) fn put_mov_reg_imm64(&mut self, reg: Reg, imm: u64) {
        self.emit(&[Self::rex(true, false, reg.is_extended()), 0xb8 + reg.lo3()]);
        self.emit(&imm.to_le_bytes());
    }

    /// `mov dst, src`
    pub(crate) fn put_mov_reg_reg(&mut self, dst: Reg, src: Reg) {
        self.emit(&[
            Self::rex(true, src.is_extended(), dst.is_extended()),
            0x89,
            Self::modrm(0b11, src.lo3(), dst.lo3()),
        ]);
    }

    /// `mov dst, [base + offset]`
    pub(crate) fn put_mov_reg_mem(&mut self, dst: Reg, base: Reg, offset: i32) {
        self.emit(&[Self::rex(true, dst.is_extended(), base.is_extended()), 0x8b]);
        self.emit_modrm_base_disp32(dst.lo3(), base, offset);
    }

    /// `mov [base + offset], src`
    pub(crate) fn put_mov_mem_reg(&mut self, base: Reg, offset: i32, src: Reg) {
        self.emit(&[Self::rex(true, src.is_extended(), base.is_extended()), 0x89]);
        self.emit_modrm_base_disp32(src.lo3(), base, offset);
    }

    /// `lea dst, [base + offset]`
    pub(crate) fn put_lea_reg_mem(&mut self, dst: Reg, base: Reg, offset: i32) {
        self.emit(&[Self::rex(true, dst.is_extended(), base.is_extended()), 0x8d]);
        self.emit_modrm_base_disp32(dst.lo3(), base, offset);
    }

    /// `sub reg, imm32`
    pub(crate) fn put_sub_reg_imm32(&mut self, reg: Reg, imm: u32) {
        self.emit(&[
            Self::rex(true, false, reg.is_extended()),
            0x81,
            Self::modrm(0b11, 5, reg.lo3()),
        ]);
        self.emit(&imm.to_le_bytes());
    }

    /// `and reg, imm8`, with the immediate sign extended.
    pub(crate) fn put_and_reg_imm8(&mut self, reg: Reg, imm: i8) {
        self.emit(&[
            Self::rex(true, false, reg.is_extended()),
            0x83,
            Self::modrm(0b11, 4, reg.lo3()),
            imm as u8,
        ]);
    }

    /// `cmp reg, imm8`, with the immediate sign extended.
    pub(crate) fn put_cmp_reg_imm8(&mut self, reg: Reg, imm: i8) {
        self.emit(&[
            Self::rex(true, false, reg.is_extended()),
            0x83,
            Self::modrm(0b11, 7, reg.lo3()),
            imm as u8,
        ]);
    }

    /// `lock inc qword [reg]`
    pub(crate) fn put_lock_inc_mem(&mut self, reg: Reg) {
        self.emit(&[0xf0, Self::rex(true, false, reg.is_extended()), 0xff]);
        self.emit_modrm_indirect(0, reg);
    }

    /// `lock dec qword [reg]`
    pub(crate) fn put_lock_dec_mem(&mut self, reg: Reg) {
        self.emit(&[0xf0, Self::rex(true, false, reg.is_extended()), 0xff]);
        self.emit_modrm_indirect(1, reg);
    }

    /// `fxsave [reg]`, which must be 16 byte aligned.
    pub(crate) fn put_fxsave(&mut self, reg: Reg) {
        if reg.is_extended() {
            self.emit(&[Self::rex(false, false, true)]);
        }
        self.emit(&[0x0f, 0xae]);
        self.emit_modrm_indirect(0, reg);
    }

    /// `fxrstor [reg]`, which must be 16 byte aligned.
    pub(crate) fn put_fxrstor(&mut self, reg: Reg) {
        if reg.is_extended() {
            self.emit(&[Self::rex(false, false, true)]);
        }
        self.emit(&[0x0f, 0xae]);
        self.emit_modrm_indirect(1, reg);
    }

    /// `call reg`
    pub(crate) fn put_call_reg(&mut self, reg: Reg) {
        if reg.is_extended() {
            self.emit(&[Self::rex(false, false, true)]);
        }
        self.emit(&[0xff, Self::modrm(0b11, 2, reg.lo3())]);
    }

    /// `jmp rel32` to an absolute address, which must be within 2GB.
    pub(crate) fn put_jmp_near(&mut self, target: u64) {
        let rel = target.wrapping_sub(self.pc() + 5) as i64;
        debug_assert!(i32::try_from(rel).is_ok(), "jmp target out of range");
        self.emit(&[0xe9]);
        self.emit(&(rel as i32).to_le_bytes());
    }

    /// `je rel32` to a label bound later.
    pub(crate) fn put_je_label(&mut self) -> Label {
        self.emit(&[0x0f, 0x84]);
        let field_offset = self.code.len();
        self.emit(&[0; 4]);
        Label { field_offset }
    }

    /// makes `label` point at the next emitted instruction.
    pub(crate) fn bind(&mut self, label: Label) {
        let rel = (self.code.len() - (label.field_offset + 4)) as i32;
        self.code[label.field_offset..label.field_offset + 4].copy_from_slice(&rel.to_le_bytes());
    }

    pub(crate) fn put_pushfq(&mut self) {
        self.emit(&[0x9c]);
    }

    pub(crate) fn put_popfq(&mut self) {
        self.emit(&[0x9d]);
    }

    pub(crate) fn put_cld(&mut self) {
        self.emit(&[0xfc]);
    }

    pub(crate) fn put_ret(&mut self) {
        self.emit(&[0xc3]);
    }
}
