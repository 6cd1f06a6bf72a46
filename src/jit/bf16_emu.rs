//! bf16 dot-product emulation for hosts without AVX512-BF16.
//!
//! Replaces one `vdpbf16ps` with a sequence over AVX-512 F/BW
//! instructions: widen each bf16 half of the interleaved operand lanes to
//! f32 (low half by a 16-bit left shift, high half by masking) and run
//! two separately-rounded FMAs into the accumulator. The f32→bf16 store
//! conversion is emulated with the round-to-nearest-even bias trick.
//!
//! The unit owns five reserved zmm registers plus one GPR for constant
//! materialization; it never touches caller tile registers, and its
//! scratch state lives only for the duration of one emitted sequence.

use iced_x86::code_asm::*;

use super::asm_err;
use crate::jit::regs::{EMU_SCRATCH_GPR, ZMM};
use crate::types::KernelResult;

const LANE_HI_MASK: u32 = 0xFFFF_0000;
const RNE_ONE: u32 = 0x0000_0001;
const RNE_BIAS: u32 = 0x0000_7FFF;

pub struct Bf16Emulation {
    tr0: AsmRegisterZmm,
    tr1: AsmRegisterZmm,
    mask: AsmRegisterZmm,
    one: AsmRegisterZmm,
    bias: AsmRegisterZmm,
    scratch: AsmRegister32,
}

impl Bf16Emulation {
    /// Reserve zmm26-30 and the 32-bit scratch GPR.
    pub fn new() -> Self {
        Bf16Emulation {
            tr0: ZMM[26],
            tr1: ZMM[27],
            mask: ZMM[28],
            one: ZMM[29],
            bias: ZMM[30],
            scratch: EMU_SCRATCH_GPR,
        }
    }

    /// Materialize the lane mask and rounding constants. Emitted once at
    /// kernel entry, before any accumulator is live; clobbers the scratch
    /// GPR.
    pub fn init(&self, asm: &mut CodeAssembler) -> KernelResult<()> {
        asm.mov(self.scratch, LANE_HI_MASK).map_err(asm_err)?;
        asm.vpbroadcastd(self.mask, self.scratch).map_err(asm_err)?;
        asm.mov(self.scratch, RNE_ONE).map_err(asm_err)?;
        asm.vpbroadcastd(self.one, self.scratch).map_err(asm_err)?;
        asm.mov(self.scratch, RNE_BIAS).map_err(asm_err)?;
        asm.vpbroadcastd(self.bias, self.scratch).map_err(asm_err)?;
        Ok(())
    }

    /// acc += a · b over interleaved bf16 pairs, one FMA per half.
    ///
    /// The even (low) halves accumulate first, then the odd (high)
    /// halves, each with its own rounding step; see DESIGN.md for how
    /// this relates to the native instruction's rounding.
    pub fn vdpbf16ps(
        &self,
        asm: &mut CodeAssembler,
        acc: AsmRegisterZmm,
        a: AsmRegisterZmm,
        b: AsmRegisterZmm,
    ) -> KernelResult<()> {
        debug_assert!(![a, b, acc].contains(&self.tr0));
        debug_assert!(![a, b, acc].contains(&self.tr1));
        asm.vpslld(self.tr0, a, 16).map_err(asm_err)?;
        asm.vpslld(self.tr1, b, 16).map_err(asm_err)?;
        asm.vfmadd231ps(acc, self.tr0, self.tr1).map_err(asm_err)?;
        asm.vpandd(self.tr0, a, self.mask).map_err(asm_err)?;
        asm.vpandd(self.tr1, b, self.mask).map_err(asm_err)?;
        asm.vfmadd231ps(acc, self.tr0, self.tr1).map_err(asm_err)?;
        Ok(())
    }

    /// dst = f32→bf16 round-to-nearest-even of `src`'s 16 lanes.
    ///
    /// bits += 0x7FFF + ((bits >> 16) & 1), then take the high words.
    /// NaN payloads are not canonicalized, matching the truncating
    /// nature of the format.
    pub fn vcvtneps2bf16(
        &self,
        asm: &mut CodeAssembler,
        dst: AsmRegisterYmm,
        src: AsmRegisterZmm,
    ) -> KernelResult<()> {
        asm.vpsrld(self.tr0, src, 16).map_err(asm_err)?;
        asm.vpandd(self.tr0, self.tr0, self.one).map_err(asm_err)?;
        asm.vpaddd(self.tr0, self.tr0, self.bias).map_err(asm_err)?;
        asm.vpaddd(self.tr0, self.tr0, src).map_err(asm_err)?;
        asm.vpsrld(self.tr0, self.tr0, 16).map_err(asm_err)?;
        asm.vpmovdw(dst, self.tr0).map_err(asm_err)?;
        Ok(())
    }
}

impl Default for Bf16Emulation {
    fn default() -> Self {
        Self::new()
    }
}

/// Scalar model of the emitted `vdpbf16ps` sequence, lane-wise: two
/// separately rounded f32 FMAs, even half first. Used by tests and as
/// the reference for the numeric contract.
pub fn emu_dp_scalar(acc: f32, a: (u16, u16), b: (u16, u16)) -> f32 {
    let widen = |h: u16| f32::from_bits((h as u32) << 16);
    let acc = widen(a.0).mul_add(widen(b.0), acc);
    widen(a.1).mul_add(widen(b.1), acc)
}

/// Scalar model of the emitted f32→bf16 conversion.
pub fn emu_cvt_scalar(x: f32) -> u16 {
    let bits = x.to_bits();
    let rounded = bits.wrapping_add(0x7FFF + ((bits >> 16) & 1));
    (rounded >> 16) as u16
}

#[cfg(test)]
mod tests {
    use super::*;
    use half::bf16;

    fn xorshift(state: &mut u64) -> u64 {
        *state ^= *state << 13;
        *state ^= *state >> 7;
        *state ^= *state << 17;
        *state
    }

    fn rand_bf16(state: &mut u64) -> bf16 {
        // Finite values in roughly [-8, 8).
        let v = (xorshift(state) % 4096) as f32 / 256.0 - 8.0;
        bf16::from_f32(v)
    }

    #[test]
    fn test_cvt_matches_half_crate_rne() {
        let mut state = 0x2545_F491_4F6C_DD1Du64;
        for _ in 0..1000 {
            let x = (xorshift(&mut state) % 100_000) as f32 / 321.0 - 150.0;
            assert_eq!(
                emu_cvt_scalar(x),
                bf16::from_f32(x).to_bits(),
                "x = {x}"
            );
        }
    }

    #[test]
    fn test_dp_model_is_close_to_exact() {
        // Each product is exact in f32 (8-bit mantissas); only the two
        // accumulation roundings differ from an f64 reference.
        let mut state = 0xDEAD_BEEF_0BAD_F00Du64;
        for _ in 0..1000 {
            let (a0, a1) = (rand_bf16(&mut state), rand_bf16(&mut state));
            let (b0, b1) = (rand_bf16(&mut state), rand_bf16(&mut state));
            let acc = (xorshift(&mut state) % 512) as f32 / 64.0 - 4.0;
            let got = emu_dp_scalar(
                acc,
                (a0.to_bits(), a1.to_bits()),
                (b0.to_bits(), b1.to_bits()),
            );
            let want = acc as f64
                + f64::from(a0.to_f32()) * f64::from(b0.to_f32())
                + f64::from(a1.to_f32()) * f64::from(b1.to_f32());
            assert!(
                (got as f64 - want).abs() <= want.abs().max(1.0) * 1e-6,
                "got {got}, want {want}"
            );
        }
    }

    #[test]
    fn test_emitted_sequence_assembles() {
        let emu = Bf16Emulation::new();
        let mut asm = CodeAssembler::new(64).unwrap();
        emu.init(&mut asm).unwrap();
        emu.vdpbf16ps(&mut asm, ZMM[0], ZMM[31], ZMM[25]).unwrap();
        emu.vcvtneps2bf16(&mut asm, ymm31, ZMM[0]).unwrap();
        asm.ret().unwrap();
        let code = asm.assemble(0).unwrap();
        assert!(!code.is_empty());
    }
}
