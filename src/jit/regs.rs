//! Register-file conventions and the tile allocator.
//!
//! GPR plan (System V AMD64, descriptor pointer in rdi):
//!   r8  = src base          r12 = aux src (kh loop)
//!   r9  = weights base      r13 = aux weights (kh loop)
//!   r10 = dst base          r14 = long-offset scratch
//!   r11 = regime selector   rax = channel-block counter / emu scratch
//!   rbx = bias base         rcx = kh counter    rsi = kh trip count
//!
//! zmm plan: tile accumulators from index 0 upward; zmm31 is the
//! weight/bias/staging register; zmm26-30 are reserved by the bf16
//! emulation unit when it is active (which shrinks the tile budget, see
//! `conf::tile_budget`). One slot directly above the tiles holds the
//! emulated-path broadcast operand.

use iced_x86::code_asm::*;

use crate::conf::{tile_budget, ConvConf};
use crate::isa::isa_has_bf16;

pub const REG_PARAM: AsmRegister64 = rdi;
pub const REG_INP: AsmRegister64 = r8;
pub const REG_KER: AsmRegister64 = r9;
pub const REG_OUT: AsmRegister64 = r10;
pub const REG_OWB: AsmRegister64 = r11;
pub const AUX_REG_INP: AsmRegister64 = r12;
pub const AUX_REG_KER: AsmRegister64 = r13;
pub const REG_ICB: AsmRegister64 = rax;
pub const REG_BIAS: AsmRegister64 = rbx;
pub const REG_KJ: AsmRegister64 = rcx;
pub const REG_KH: AsmRegister64 = rsi;
pub const REG_LONG_OFFT: AsmRegister64 = r14;

/// 32-bit view of the emulation scratch GPR. Live only between kernel
/// entry and the first accumulator write.
pub const EMU_SCRATCH_GPR: AsmRegister32 = eax;

/// Weight broadcast / bias / store-staging register.
pub const ZMM_WEI: AsmRegisterZmm = zmm31;
pub const YMM_STAGE: AsmRegisterYmm = ymm31;

pub const ZMM: [AsmRegisterZmm; 32] = [
    zmm0, zmm1, zmm2, zmm3, zmm4, zmm5, zmm6, zmm7, zmm8, zmm9, zmm10, zmm11, zmm12,
    zmm13, zmm14, zmm15, zmm16, zmm17, zmm18, zmm19, zmm20, zmm21, zmm22, zmm23, zmm24,
    zmm25, zmm26, zmm27, zmm28, zmm29, zmm30, zmm31,
];

/// Injective mapping from tile coordinates to physical zmm indices.
///
/// The mapping always uses the configuration's full `ur_w` as the row
/// stride so tail variants address a prefix of the same registers.
#[derive(Debug, Clone, Copy)]
pub struct TileAlloc {
    pub ur_w: usize,
    pub nb_blocking: usize,
    pub budget: usize,
}

impl TileAlloc {
    pub fn for_conf(conf: &ConvConf) -> Self {
        TileAlloc {
            ur_w: conf.ur_w,
            nb_blocking: conf.nb_blocking,
            budget: tile_budget(conf.dir, isa_has_bf16(conf.isa)),
        }
    }

    /// Accumulator register for unroll position `i_ur`, channel block
    /// `i_blk`.
    pub fn tile(&self, i_ur: usize, i_blk: usize) -> AsmRegisterZmm {
        let idx = i_ur + i_blk * self.ur_w;
        assert!(
            idx < self.budget,
            "tile ({i_ur}, {i_blk}) -> zmm{idx} exceeds budget {}",
            self.budget
        );
        ZMM[idx]
    }

    /// Broadcast-operand register for the emulated dot-product path,
    /// placed in the first slot above the tile group.
    pub fn bcast(&self) -> AsmRegisterZmm {
        let idx = self.ur_w * self.nb_blocking;
        assert!(idx < 31, "broadcast slot zmm{idx} collides with reserved registers");
        ZMM[idx]
    }
}
