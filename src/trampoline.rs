//! building trampolines and the patches which redirect a hooked function into them.

use arrayvec::ArrayVec;
use zydis_sys::ZYDIS_MAX_INSTRUCTION_LENGTH;

use crate::{
    jumper::{determine_best_jumper_kind_and_build, JumperBytes, JumperKind, MAX_JUMPER_LEN},
    relocate::{relocate_fn_start, RelocateError, RelocateFnStartInfo, RelocatedBytes, MAX_RELOCATED_LEN},
};

/// the maximum amount of bytes overwritten at the start of a hooked function.
///
/// the jumper that we put at the start of the function might not end on an instruction boundary, which may increase the
/// amount of overwritten bytes in the worst case by the max length of an instruction minus one byte.
pub const MAX_PATCH_LEN: usize = MAX_JUMPER_LEN + ZYDIS_MAX_INSTRUCTION_LENGTH as usize - 1;

/// the maximum length of a trampoline.
///
/// this is the maximum length of the relocated instructions, followed by the jumper back into the hooked function.
pub const MAX_TRAMPOLINE_LEN: usize = MAX_RELOCATED_LEN + MAX_JUMPER_LEN;

/// the encoding of `nop`, used to pad the patch up to an instruction boundary.
const NOP: u8 = 0x90;

/// a type alias for the bytes of a patch.
pub type PatchBytes = ArrayVec<u8, MAX_PATCH_LEN>;

/// a type alias for the bytes of a trampoline.
pub type TrampolineBytes = ArrayVec<u8, MAX_TRAMPOLINE_LEN>;

/// generates information needed to hook the given function.
pub fn gen_hook_info(
    hooked_function_content: &[u8],
    hooked_function_runtime_addr: u64,
    hook_function_runtime_addr: u64,
) -> Result<HookInfo, RelocateError> {
    let jumper = determine_best_jumper_kind_and_build(
        hooked_function_runtime_addr,
        hook_function_runtime_addr,
    );
    let relocated_fn_info = relocate_fn_start(
        hooked_function_content,
        hooked_function_runtime_addr,
        jumper.len(),
    )?;
    Ok(HookInfo {
        jumper,
        relocated_fn_info,
        hooked_function_content,
        hooked_function_runtime_addr,
    })
}

/// information required for hooking a function
pub struct HookInfo<'a> {
    jumper: JumperBytes,
    relocated_fn_info: RelocateFnStartInfo,
    hooked_function_runtime_addr: u64,
    hooked_function_content: &'a [u8],
}
impl<'a> HookInfo<'a> {
    /// returns the jumper which should be placed at the start of the hooked function in order to hook it.
    pub fn jumper(&self) -> &[u8] {
        &self.jumper
    }

    /// returns the bytes which should overwrite the start of the hooked function, which is the jumper padded with nops
    /// up to the end of the last relocated instruction.
    pub fn patch(&self) -> PatchBytes {
        let mut patch = PatchBytes::new();
        patch.extend(self.jumper.iter().copied());
        while patch.len() < self.relocation_copied_bytes_amount() {
            patch.push(NOP);
        }
        patch
    }

    /// returns the original bytes which will be overwritten by the patch.
    pub fn original_bytes(&self) -> &'a [u8] {
        &self.hooked_function_content[..self.relocation_copied_bytes_amount()]
    }

    /// returns the amount of bytes relocated from the start of the hooked function.
    pub fn relocation_copied_bytes_amount(&self) -> usize {
        self.relocated_fn_info.bytes_to_copy
    }

    /// returns the size of the trampoline which will be built for this hooked function at the given runtime address.
    pub fn trampoline_size(&self, trampoline_runtime_addr: u64) -> Result<usize, RelocateError> {
        let relocated_len = self
            .relocated_fn_info
            .relocated_len(self.hooked_function_content, trampoline_runtime_addr)?;
        Ok(relocated_len + JumperKind::Long.size_in_bytes())
    }

    /// builds a trampoline which will be placed at the given runtime address.
    /// the size of the trampoline can be determined by calling [`trampoline_size`].
    ///
    /// [`trampoline_size`]: HookInfo::trampoline_size
    pub fn build_trampoline(
        &self,
        trampoline_runtime_addr: u64,
    ) -> Result<TrampolineBytes, RelocateError> {
        let copied = self.relocation_copied_bytes_amount();
        let mut relocated = RelocatedBytes::new();
        self.relocated_fn_info.write_relocated(
            self.hooked_function_content,
            trampoline_runtime_addr,
            &mut relocated,
        )?;

        let mut tramp_bytes = TrampolineBytes::new();
        tramp_bytes.extend(relocated.iter().copied());
        let jumper = JumperKind::Long.build(
            trampoline_runtime_addr + relocated.len() as u64,
            self.hooked_function_runtime_addr + copied as u64,
        );
        tramp_bytes.extend(jumper);
        Ok(tramp_bytes)
    }
}

/// everything needed to install a hook at a single site.
#[derive(Debug, Clone)]
pub struct Trampoline {
    /// the relocated start of the hooked function, followed by a jump back into it.
    pub bytes: TrampolineBytes,
    /// the bytes to write over the start of the hooked function.
    pub patch: PatchBytes,
    /// the original bytes which the patch overwrites, used to restore the function.
    pub original: PatchBytes,
}

/// builds a trampoline placed at `trampoline_addr` for the function at `target`, and a patch redirecting `target`
/// to `dispatch_entry`.
///
/// `content` must be the current bytes at `target`, at least [`MAX_PATCH_LEN`] of them unless the function is known to
/// be shorter.
pub fn build(
    content: &[u8],
    target: u64,
    trampoline_addr: u64,
    dispatch_entry: u64,
) -> Result<Trampoline, RelocateError> {
    let hook_info = gen_hook_info(content, target, dispatch_entry)?;
    let bytes = hook_info.build_trampoline(trampoline_addr)?;
    let mut original = PatchBytes::new();
    original.extend(hook_info.original_bytes().iter().copied());
    Ok(Trampoline {
        bytes,
        patch: hook_info.patch(),
        original,
    })
}
