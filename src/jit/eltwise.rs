//! Fused element-wise post-op emitted over the f32 accumulators at store
//! time.
//!
//! Only ReLU (plain and leaky with slope in [0, 1]) is supported, which
//! lets the injector run without opmask registers: `max(x, alpha * x)`
//! equals the leaky ReLU exactly for that slope range, and plain ReLU is
//! `max(x, 0)`. One reserved zmm plus one GPR serve as scratch; both are
//! already dead at the point the injector runs.

use iced_x86::code_asm::*;

use super::asm_err;
use crate::conf::{Eltwise, EltwiseKind};
use crate::jit::regs::{EMU_SCRATCH_GPR, ZMM_WEI};
use crate::types::KernelResult;

pub struct EltwiseInjector {
    alpha: f32,
    scratch: AsmRegisterZmm,
    scratch32: AsmRegister32,
}

impl EltwiseInjector {
    pub fn new(op: &Eltwise) -> Self {
        debug_assert!(matches!(op.kind, EltwiseKind::Relu));
        debug_assert!((0.0..=1.0).contains(&op.alpha));
        EltwiseInjector {
            alpha: op.alpha,
            scratch: ZMM_WEI,
            scratch32: EMU_SCRATCH_GPR,
        }
    }

    /// For the zero-slope case the comparison operand is constant, so it
    /// is zeroed once before the per-tile pass.
    pub fn prepare(&self, asm: &mut CodeAssembler) -> KernelResult<()> {
        if self.alpha == 0.0 {
            asm.vpxord(self.scratch, self.scratch, self.scratch)
                .map_err(asm_err)?;
        }
        Ok(())
    }

    /// Apply the activation in place to one accumulator tile.
    ///
    /// The leaky path re-broadcasts the slope each call because the
    /// scratch zmm doubles as the weight register inside the compute
    /// loop and does not survive between tiles of different store
    /// batches.
    pub fn compute_vector(
        &self,
        asm: &mut CodeAssembler,
        tile: AsmRegisterZmm,
    ) -> KernelResult<()> {
        if self.alpha == 0.0 {
            asm.vmaxps(tile, tile, self.scratch).map_err(asm_err)?;
        } else {
            asm.mov(self.scratch32, self.alpha.to_bits()).map_err(asm_err)?;
            asm.vpbroadcastd(self.scratch, self.scratch32).map_err(asm_err)?;
            asm.vmulps(self.scratch, self.scratch, tile).map_err(asm_err)?;
            asm.vmaxps(tile, tile, self.scratch).map_err(asm_err)?;
        }
        Ok(())
    }
}

/// Scalar model of the emitted activation, used by execution tests.
pub fn relu_scalar(x: f32, alpha: f32) -> f32 {
    x.max(alpha * x)
}
