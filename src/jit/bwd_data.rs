//! Backward-data convolution kernel generator.
//!
//! The pass scatters the output gradient back through the weights to
//! produce the input gradient. Relative to the forward generator the
//! spatial and channel roles swap: the unrolled axis is `iw`, the tiled
//! channel axis is `ic`, and the runtime channel loop walks output-channel
//! blocks. With stride, only input positions in phase with some kernel
//! tap accumulate; the rest of the tile stays zero, which is the correct
//! gradient for them. No bias and no post-ops on this pass.

use iced_x86::code_asm::*;

use super::{add_imm, asm_err, sub_imm, OFF_DST, OFF_FILT, OFF_KH_PADDING, OFF_REGIME, OFF_SRC};
use crate::conf::{ConvConf, Direction};
use crate::isa::isa_has_bf16;
use crate::jit::bf16_emu::Bf16Emulation;
use crate::jit::executable::KernelCode;
use crate::jit::offsets::{bwd_dst_offset, bwd_ker_offset, bwd_out_offset};
use crate::jit::ranges::{iw_end, iw_start};
use crate::jit::regs::*;
use crate::types::{ConvCallArgs, ConvKernelFn, DataType, KernelError, KernelResult, Regime};

/// A compiled backward-data kernel and its configuration.
pub struct ConvBwdDataKernel {
    conf: ConvConf,
    code: KernelCode,
}

impl ConvBwdDataKernel {
    pub fn new(conf: ConvConf) -> KernelResult<Self> {
        if conf.dir != Direction::BackwardData {
            return Err(KernelError::Unsupported(
                "backward-data generator given a forward configuration".into(),
            ));
        }
        let bytes = BwdDataEmitter::new(conf.clone())?.generate()?;
        log::debug!(
            "generated bwd-data conv kernel: {} bytes, native_bf16={}",
            bytes.len(),
            isa_has_bf16(conf.isa)
        );
        let code = KernelCode::new(&bytes)?;
        Ok(ConvBwdDataKernel { conf, code })
    }

    pub fn conf(&self) -> &ConvConf {
        &self.conf
    }

    pub fn code_size(&self) -> usize {
        self.code.len()
    }

    /// Raw entry point.
    ///
    /// # Safety
    ///
    /// Same contract as the forward kernel: host ISA must cover
    /// `conf().isa` and the descriptor must honor [`ConvCallArgs`].
    pub unsafe fn kernel(&self) -> ConvKernelFn {
        std::mem::transmute::<*const u8, ConvKernelFn>(self.code.ptr())
    }

    /// # Safety
    ///
    /// Same contract as [`Self::kernel`].
    pub unsafe fn call(&self, args: &ConvCallArgs) {
        (self.kernel())(args as *const ConvCallArgs)
    }
}

struct BwdDataEmitter {
    conf: ConvConf,
    asm: CodeAssembler,
    tiles: TileAlloc,
    emu: Option<Bf16Emulation>,
    native_bf16: bool,
}

impl BwdDataEmitter {
    fn new(conf: ConvConf) -> KernelResult<Self> {
        let max_disp = bwd_ker_offset(&conf, conf.kw - 1, conf.oc_block / 2 - 1,
            conf.nb_blocking - 1, 0)
            .max(bwd_out_offset(&conf, conf.ur_w.max(1) - 1, conf.nb_blocking - 1));
        if i32::try_from(max_disp).is_err() {
            return Err(KernelError::Unsupported(
                "tensor too large for 32-bit displacements".into(),
            ));
        }
        let native_bf16 = isa_has_bf16(conf.isa);
        let tiles = TileAlloc::for_conf(&conf);
        Ok(BwdDataEmitter {
            conf,
            asm: CodeAssembler::new(64).map_err(asm_err)?,
            tiles,
            emu: (!native_bf16).then(Bf16Emulation::new),
            native_bf16,
        })
    }

    fn generate(mut self) -> KernelResult<Vec<u8>> {
        let asm = &mut self.asm;
        asm.push(REG_BIAS).map_err(asm_err)?;
        asm.push(AUX_REG_INP).map_err(asm_err)?;
        asm.push(AUX_REG_KER).map_err(asm_err)?;
        asm.push(REG_LONG_OFFT).map_err(asm_err)?;

        // `src` carries the output gradient, `dst` the input gradient.
        asm.mov(REG_INP, qword_ptr(REG_PARAM + OFF_SRC)).map_err(asm_err)?;
        asm.mov(REG_OUT, qword_ptr(REG_PARAM + OFF_DST)).map_err(asm_err)?;
        asm.mov(REG_KER, qword_ptr(REG_PARAM + OFF_FILT)).map_err(asm_err)?;
        asm.mov(REG_KH, qword_ptr(REG_PARAM + OFF_KH_PADDING))
            .map_err(asm_err)?;
        asm.mov(REG_OWB, qword_ptr(REG_PARAM + OFF_REGIME)).map_err(asm_err)?;

        if let Some(emu) = &self.emu {
            emu.init(asm)?;
        }

        let mut l_main = self.asm.create_label();
        let mut l_right = self.asm.create_label();
        let mut l_tail = self.asm.create_label();
        let mut l_end = self.asm.create_label();

        let variants = self.conf.bwd_variants();
        let has_tail = variants[Regime::Tail as usize].0 > 0;

        self.asm.cmp(REG_OWB, Regime::Main as i32).map_err(asm_err)?;
        self.asm.je(l_main).map_err(asm_err)?;
        self.asm.cmp(REG_OWB, Regime::Right as i32).map_err(asm_err)?;
        self.asm.je(l_right).map_err(asm_err)?;
        self.asm.cmp(REG_OWB, Regime::Tail as i32).map_err(asm_err)?;
        self.asm.je(if has_tail { l_tail } else { l_end }).map_err(asm_err)?;

        let (ur, l_ovf, r_ovf) = variants[Regime::Left as usize];
        self.compute_loop(ur, l_ovf, r_ovf)?;
        self.asm.jmp(l_end).map_err(asm_err)?;

        self.asm.set_label(&mut l_main).map_err(asm_err)?;
        let (ur, l_ovf, r_ovf) = variants[Regime::Main as usize];
        self.compute_loop(ur, l_ovf, r_ovf)?;
        self.asm.jmp(l_end).map_err(asm_err)?;

        self.asm.set_label(&mut l_right).map_err(asm_err)?;
        let (ur, l_ovf, r_ovf) = variants[Regime::Right as usize];
        self.compute_loop(ur, l_ovf, r_ovf)?;

        if has_tail {
            self.asm.jmp(l_end).map_err(asm_err)?;
            self.asm.set_label(&mut l_tail).map_err(asm_err)?;
            let (ur, l_ovf, r_ovf) = variants[Regime::Tail as usize];
            self.compute_loop(ur, l_ovf, r_ovf)?;
        }

        self.asm.set_label(&mut l_end).map_err(asm_err)?;
        self.asm.vzeroupper().map_err(asm_err)?;
        self.asm.pop(REG_LONG_OFFT).map_err(asm_err)?;
        self.asm.pop(AUX_REG_KER).map_err(asm_err)?;
        self.asm.pop(AUX_REG_INP).map_err(asm_err)?;
        self.asm.pop(REG_BIAS).map_err(asm_err)?;
        self.asm.ret().map_err(asm_err)?;

        self.asm.assemble(0).map_err(asm_err)
    }

    fn compute_loop(&mut self, ur_w: usize, l_ovf: usize, r_ovf: usize) -> KernelResult<()> {
        for blk in 0..self.conf.nb_blocking {
            for u in 0..ur_w {
                let tile = self.tiles.tile(u, blk);
                self.asm.vpxord(tile, tile, tile).map_err(asm_err)?;
            }
        }

        if self.conf.nb_oc > 1 {
            let mut l_ocb = self.asm.create_label();
            self.asm.mov(REG_ICB, self.conf.nb_oc as i64).map_err(asm_err)?;
            self.asm.set_label(&mut l_ocb).map_err(asm_err)?;
            self.kh_loop(ur_w, l_ovf, r_ovf)?;
            let c = &self.conf;
            let dst_step = c.typesize_in * c.oh * c.ow * c.oc_block;
            let ker_step = c.typesize_in * c.kh * c.kw * c.oc_block * c.ic_block;
            add_imm(&mut self.asm, REG_INP, dst_step)?;
            add_imm(&mut self.asm, REG_KER, ker_step)?;
            self.asm.sub(REG_ICB, 1).map_err(asm_err)?;
            self.asm.jne(l_ocb).map_err(asm_err)?;
        } else {
            self.kh_loop(ur_w, l_ovf, r_ovf)?;
        }

        self.store_output(ur_w)
    }

    fn kh_loop(&mut self, ur_w: usize, l_ovf: usize, r_ovf: usize) -> KernelResult<()> {
        let c = self.conf.clone();
        let asm = &mut self.asm;

        asm.mov(AUX_REG_INP, REG_INP).map_err(asm_err)?;
        asm.mov(AUX_REG_KER, REG_KER).map_err(asm_err)?;
        asm.mov(REG_KJ, REG_KH).map_err(asm_err)?;

        // With vertical stride, dilation, or padding some input rows see
        // no kernel tap at all, so the trip count may arrive as zero.
        let mut l_done = asm.create_label();
        let may_skip = c.stride_h > 1
            || c.dilate_h > 0
            || ((c.kh - 1) * (c.dilate_h + 1)) < c.t_pad.max(c.b_pad).max(0) as usize;
        if may_skip {
            asm.cmp(REG_KJ, 0).map_err(asm_err)?;
            asm.je(l_done).map_err(asm_err)?;
        }

        let mut l_kh = asm.create_label();
        asm.set_label(&mut l_kh).map_err(asm_err)?;

        // Named to dodge the `dil` byte-register constant from `code_asm`.
        let dil_w = c.dilate_w + 1;
        for ki in 0..c.kw {
            let jj_start = iw_start(&c, ki, l_ovf);
            let jj_end = iw_end(&c, ur_w, ki, r_ovf);
            for ocp in 0..c.oc_block / 2 {
                for blk in 0..c.nb_blocking {
                    let wei_off = bwd_ker_offset(&c, ki, ocp, blk, 0) as i32;
                    self.asm
                        .vmovups(ZMM_WEI, zmmword_ptr(AUX_REG_KER + wei_off))
                        .map_err(asm_err)?;
                    for jj in (jj_start..jj_end).step_by(c.stride_w) {
                        // Relative to the block's shifted gradient base;
                        // interior blocks legitimately go negative.
                        let num = jj as i64 + c.l_pad as i64 - (ki * dil_w) as i64;
                        debug_assert_eq!(num.rem_euclid(c.stride_w as i64), 0);
                        let ow_idx = num / c.stride_w as i64;
                        let dst_off = bwd_dst_offset(&c, ow_idx, ocp) as i32;
                        let tile = self.tiles.tile(jj, blk);
                        if let Some(emu) = &self.emu {
                            let bcast = self.tiles.bcast();
                            self.asm
                                .vpbroadcastd(bcast, dword_ptr(AUX_REG_INP + dst_off))
                                .map_err(asm_err)?;
                            emu.vdpbf16ps(&mut self.asm, tile, ZMM_WEI, bcast)?;
                        } else {
                            self.asm
                                .vdpbf16ps(tile, ZMM_WEI, dword_bcst(AUX_REG_INP + dst_off))
                                .map_err(asm_err)?;
                        }
                    }
                }
            }
        }

        // Each consumed kernel row moves one weight row down and one
        // gradient row up.
        let ker_step = c.typesize_in * c.stride_h * c.kw * c.oc_block * c.ic_block;
        let dst_step = c.typesize_in * (c.dilate_h + 1) * c.ow * c.oc_block;
        add_imm(&mut self.asm, AUX_REG_KER, ker_step)?;
        sub_imm(&mut self.asm, AUX_REG_INP, dst_step)?;
        self.asm.sub(REG_KJ, 1).map_err(asm_err)?;
        self.asm.jne(l_kh).map_err(asm_err)?;

        if may_skip {
            self.asm.set_label(&mut l_done).map_err(asm_err)?;
            self.asm.nop().map_err(asm_err)?;
        }
        Ok(())
    }

    fn store_output(&mut self, ur_w: usize) -> KernelResult<()> {
        let c = self.conf.clone();
        match c.dst_dt {
            DataType::F32 => {
                for blk in 0..c.nb_blocking {
                    for u in 0..ur_w {
                        let off = bwd_out_offset(&c, u, blk) as i32;
                        self.asm
                            .vmovups(zmmword_ptr(REG_OUT + off), self.tiles.tile(u, blk))
                            .map_err(asm_err)?;
                    }
                }
            }
            DataType::Bf16 if self.native_bf16 => {
                for blk in 0..c.nb_blocking {
                    let mut u = 0;
                    while u + 1 < ur_w {
                        let off = bwd_out_offset(&c, u, blk) as i32;
                        self.asm
                            .vcvtne2ps2bf16(
                                ZMM_WEI,
                                self.tiles.tile(u + 1, blk),
                                self.tiles.tile(u, blk),
                            )
                            .map_err(asm_err)?;
                        self.asm
                            .vmovups(zmmword_ptr(REG_OUT + off), ZMM_WEI)
                            .map_err(asm_err)?;
                        u += 2;
                    }
                    if u < ur_w {
                        let off = bwd_out_offset(&c, u, blk) as i32;
                        self.asm
                            .vcvtneps2bf16(YMM_STAGE, self.tiles.tile(u, blk))
                            .map_err(asm_err)?;
                        self.asm
                            .vmovdqu64(ymmword_ptr(REG_OUT + off), YMM_STAGE)
                            .map_err(asm_err)?;
                    }
                }
            }
            DataType::Bf16 => {
                let emu = self.emu.take().ok_or_else(|| {
                    KernelError::Assembly("emulation unit missing for bf16 store".into())
                })?;
                for blk in 0..c.nb_blocking {
                    for u in 0..ur_w {
                        let off = bwd_out_offset(&c, u, blk) as i32;
                        emu.vcvtneps2bf16(&mut self.asm, YMM_STAGE, self.tiles.tile(u, blk))?;
                        self.asm
                            .vmovdqu64(ymmword_ptr(REG_OUT + off), YMM_STAGE)
                            .map_err(asm_err)?;
                    }
                }
                self.emu = Some(emu);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::ConvDesc;
    use crate::isa::Isa;

    fn desc() -> ConvDesc {
        ConvDesc {
            mb: 1,
            ic: 32,
            oc: 32,
            ih: 5,
            iw: 11,
            oh: 3,
            ow: 5,
            kh: 3,
            kw: 3,
            stride_h: 2,
            stride_w: 2,
            dilate_h: 0,
            dilate_w: 0,
            t_pad: 0,
            l_pad: 0,
            src_dt: DataType::Bf16,
            wei_dt: DataType::Bf16,
            dst_dt: DataType::F32,
            bias_dt: None,
            eltwise: None,
            nthreads: 1,
        }
    }

    fn build(d: &ConvDesc, isa: Isa) -> ConvBwdDataKernel {
        let conf = ConvConf::derive_with_isa(d, Direction::BackwardData, isa).unwrap();
        ConvBwdDataKernel::new(conf).unwrap()
    }

    #[test]
    fn test_strided_f32_out_assembles() {
        for isa in [Isa::Avx512Core, Isa::Avx512CoreBf16] {
            let k = build(&desc(), isa);
            assert!(k.code_size() > 0);
        }
    }

    #[test]
    fn test_unit_stride_bf16_out_assembles() {
        let mut d = desc();
        d.stride_h = 1;
        d.stride_w = 1;
        d.oh = 3;
        d.ow = 9;
        d.dst_dt = DataType::Bf16;
        for isa in [Isa::Avx512Core, Isa::Avx512CoreBf16] {
            let k = build(&d, isa);
            assert!(k.code_size() > 0);
        }
    }

    #[test]
    fn test_rejects_forward_conf() {
        let conf =
            ConvConf::derive_with_isa(&desc(), Direction::Forward, Isa::Avx512Core).unwrap();
        assert!(ConvBwdDataKernel::new(conf).is_err());
    }
}
