//! JIT emission machinery for the convolution kernels.
//!
//! Layering, leaves first: `executable` (mmap code buffer), `regs`
//! (register file conventions and the tile allocator), `offsets` and
//! `ranges` (emission-time arithmetic), `bf16_emu` (dot-product
//! emulation), `eltwise` (post-op injector), and the two generators
//! `fwd` / `bwd_data` composing everything into machine code.

pub mod bf16_emu;
pub mod bwd_data;
pub mod eltwise;
pub mod executable;
pub mod fwd;
pub mod offsets;
pub mod ranges;
pub mod regs;

use crate::types::{ConvCallArgs, KernelError};

/// Call-descriptor field displacements baked into generated loads.
pub(crate) const OFF_SRC: i32 = std::mem::offset_of!(ConvCallArgs, src) as i32;
pub(crate) const OFF_DST: i32 = std::mem::offset_of!(ConvCallArgs, dst) as i32;
pub(crate) const OFF_FILT: i32 = std::mem::offset_of!(ConvCallArgs, filt) as i32;
pub(crate) const OFF_BIAS: i32 = std::mem::offset_of!(ConvCallArgs, bias) as i32;
pub(crate) const OFF_KH_PADDING: i32 = std::mem::offset_of!(ConvCallArgs, kh_padding) as i32;
pub(crate) const OFF_REGIME: i32 = std::mem::offset_of!(ConvCallArgs, regime) as i32;

pub(crate) fn asm_err(e: iced_x86::IcedError) -> KernelError {
    KernelError::Assembly(e.to_string())
}

/// Advance a pointer register by a compile-time byte count. Steps beyond
/// imm32 range go through the long-offset scratch register.
pub(crate) fn add_imm(
    asm: &mut iced_x86::code_asm::CodeAssembler,
    reg: iced_x86::code_asm::AsmRegister64,
    step: usize,
) -> Result<(), KernelError> {
    if step == 0 {
        return Ok(());
    }
    match i32::try_from(step) {
        Ok(imm) => asm.add(reg, imm).map_err(asm_err),
        Err(_) => {
            asm.mov(regs::REG_LONG_OFFT, step as u64).map_err(asm_err)?;
            asm.add(reg, regs::REG_LONG_OFFT).map_err(asm_err)
        }
    }
}

/// Counterpart of [`add_imm`] for the pass that walks a tensor downward.
pub(crate) fn sub_imm(
    asm: &mut iced_x86::code_asm::CodeAssembler,
    reg: iced_x86::code_asm::AsmRegister64,
    step: usize,
) -> Result<(), KernelError> {
    if step == 0 {
        return Ok(());
    }
    match i32::try_from(step) {
        Ok(imm) => asm.sub(reg, imm).map_err(asm_err),
        Err(_) => {
            asm.mov(regs::REG_LONG_OFFT, step as u64).map_err(asm_err)?;
            asm.sub(reg, regs::REG_LONG_OFFT).map_err(asm_err)
        }
    }
}
