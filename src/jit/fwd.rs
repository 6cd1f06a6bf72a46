//! Forward convolution kernel generator.
//!
//! One generated function serves every output-row block of the problem it
//! was built for. The function carries four instruction-stream variants,
//! one per boundary `Regime`; the caller selects the variant through the
//! descriptor and the generated prologue branches to it. Inside a variant
//! everything is fully unrolled: the kernel-width taps, the
//! input-channel pairs, the output-channel blocks, and the `ur_w` output
//! positions, with every byte offset baked as an immediate displacement.
//! Only two runtime loops remain, over input-channel blocks and over the
//! in-bounds kernel-height taps.

use iced_x86::code_asm::*;

use super::{add_imm, asm_err, OFF_BIAS, OFF_DST, OFF_FILT, OFF_KH_PADDING, OFF_REGIME, OFF_SRC};
use crate::conf::{ConvConf, Direction};
use crate::isa::isa_has_bf16;
use crate::jit::bf16_emu::Bf16Emulation;
use crate::jit::eltwise::EltwiseInjector;
use crate::jit::executable::KernelCode;
use crate::jit::offsets::{inp_offset, ker_offset, max_ker_offset, out_offset};
use crate::jit::ranges::{ow_end, ow_start};
use crate::jit::regs::*;
use crate::types::{ConvCallArgs, ConvKernelFn, DataType, KernelError, KernelResult, Regime};

/// A compiled forward kernel and the configuration it was built for.
pub struct ConvFwdKernel {
    conf: ConvConf,
    code: KernelCode,
}

impl ConvFwdKernel {
    pub fn new(conf: ConvConf) -> KernelResult<Self> {
        if conf.dir != Direction::Forward {
            return Err(KernelError::Unsupported(
                "forward generator given a backward configuration".into(),
            ));
        }
        let bytes = FwdEmitter::new(conf.clone())?.generate()?;
        log::debug!(
            "generated fwd conv kernel: {} bytes, native_bf16={}",
            bytes.len(),
            isa_has_bf16(conf.isa)
        );
        let code = KernelCode::new(&bytes)?;
        Ok(ConvFwdKernel { conf, code })
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
    /// The returned function must only be run on a host whose ISA covers
    /// `conf().isa`, with a descriptor honoring the calling contract of
    /// [`ConvCallArgs`].
    pub unsafe fn kernel(&self) -> ConvKernelFn {
        std::mem::transmute::<*const u8, ConvKernelFn>(self.code.ptr())
    }

    /// Invoke the kernel for one descriptor.
    ///
    /// # Safety
    ///
    /// Same contract as [`Self::kernel`].
    pub unsafe fn call(&self, args: &ConvCallArgs) {
        (self.kernel())(args as *const ConvCallArgs)
    }
}

struct FwdEmitter {
    conf: ConvConf,
    asm: CodeAssembler,
    tiles: TileAlloc,
    native_bf16: bool,
    emu: Option<Bf16Emulation>,
    eltwise: Option<EltwiseInjector>,
}

impl FwdEmitter {
    fn new(conf: ConvConf) -> KernelResult<Self> {
        // Per-access displacements are baked as imm32; the loop advances
        // go through the long-offset register, but a single access that
        // cannot reach its operand has no such escape.
        let max_disp = max_ker_offset(&conf)
            .max(out_offset(&conf, conf.ur_w.max(1) - 1, conf.nb_blocking - 1));
        if i32::try_from(max_disp).is_err() {
            return Err(KernelError::Unsupported(
                "tensor too large for 32-bit displacements".into(),
            ));
        }
        let native_bf16 = isa_has_bf16(conf.isa);
        let tiles = TileAlloc::for_conf(&conf);
        let eltwise = conf.eltwise.as_ref().map(EltwiseInjector::new);
        Ok(FwdEmitter {
            conf,
            asm: CodeAssembler::new(64).map_err(asm_err)?,
            tiles,
            native_bf16,
            emu: (!native_bf16).then(Bf16Emulation::new),
            eltwise,
        })
    }

    fn generate(mut self) -> KernelResult<Vec<u8>> {
        let asm = &mut self.asm;
        asm.push(REG_BIAS).map_err(asm_err)?;
        asm.push(AUX_REG_INP).map_err(asm_err)?;
        asm.push(AUX_REG_KER).map_err(asm_err)?;
        asm.push(REG_LONG_OFFT).map_err(asm_err)?;

        asm.mov(REG_INP, qword_ptr(REG_PARAM + OFF_SRC)).map_err(asm_err)?;
        asm.mov(REG_OUT, qword_ptr(REG_PARAM + OFF_DST)).map_err(asm_err)?;
        asm.mov(REG_KER, qword_ptr(REG_PARAM + OFF_FILT)).map_err(asm_err)?;
        asm.mov(REG_KH, qword_ptr(REG_PARAM + OFF_KH_PADDING))
            .map_err(asm_err)?;
        if self.conf.with_bias {
            asm.mov(REG_BIAS, qword_ptr(REG_PARAM + OFF_BIAS)).map_err(asm_err)?;
        }
        asm.mov(REG_OWB, qword_ptr(REG_PARAM + OFF_REGIME)).map_err(asm_err)?;

        if let Some(emu) = &self.emu {
            emu.init(asm)?;
        }

        let mut l_main = self.asm.create_label();
        let mut l_right = self.asm.create_label();
        let mut l_tail = self.asm.create_label();
        let mut l_end = self.asm.create_label();

        let variants = self.conf.fwd_variants();
        let has_tail = variants[Regime::Tail as usize].0 > 0;

        self.asm.cmp(REG_OWB, Regime::Main as i32).map_err(asm_err)?;
        self.asm.je(l_main).map_err(asm_err)?;
        self.asm.cmp(REG_OWB, Regime::Right as i32).map_err(asm_err)?;
        self.asm.je(l_right).map_err(asm_err)?;
        self.asm.cmp(REG_OWB, Regime::Tail as i32).map_err(asm_err)?;
        self.asm.je(if has_tail { l_tail } else { l_end }).map_err(asm_err)?;
        // Fallthrough is the left-edge variant.
        let (ur, pad_l, pad_r) = variants[Regime::Left as usize];
        self.compute_loop(ur, pad_l, pad_r)?;
        self.asm.jmp(l_end).map_err(asm_err)?;

        self.asm.set_label(&mut l_main).map_err(asm_err)?;
        let (ur, pad_l, pad_r) = variants[Regime::Main as usize];
        self.compute_loop(ur, pad_l, pad_r)?;
        self.asm.jmp(l_end).map_err(asm_err)?;

        self.asm.set_label(&mut l_right).map_err(asm_err)?;
        let (ur, pad_l, pad_r) = variants[Regime::Right as usize];
        self.compute_loop(ur, pad_l, pad_r)?;
        self.asm.jmp(l_end).map_err(asm_err)?;

        if has_tail {
            self.asm.set_label(&mut l_tail).map_err(asm_err)?;
            let (ur, pad_l, pad_r) = variants[Regime::Tail as usize];
            self.compute_loop(ur, pad_l, pad_r)?;
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

    /// One full boundary variant: accumulator init, the channel-block and
    /// kernel-height loops around the unrolled dot-product body, and the
    /// store epilogue.
    fn compute_loop(&mut self, ur_w: usize, pad_l: i32, pad_r: i32) -> KernelResult<()> {
        self.prepare_output(ur_w)?;

        if self.conf.nb_ic > 1 {
            let mut l_icb = self.asm.create_label();
            self.asm.mov(REG_ICB, self.conf.nb_ic as i64).map_err(asm_err)?;
            self.asm.set_label(&mut l_icb).map_err(asm_err)?;
            self.kh_loop(ur_w, pad_l, pad_r)?;
            let c = &self.conf;
            let src_step = c.typesize_in * c.ih * c.iw * c.ic_block;
            let ker_step = c.typesize_in * c.kh * c.kw * c.ic_block * c.oc_block;
            add_imm(&mut self.asm, REG_INP, src_step)?;
            add_imm(&mut self.asm, REG_KER, ker_step)?;
            self.asm.sub(REG_ICB, 1).map_err(asm_err)?;
            self.asm.jne(l_icb).map_err(asm_err)?;
        } else {
            self.kh_loop(ur_w, pad_l, pad_r)?;
        }

        self.store_output(ur_w)
    }

    fn prepare_output(&mut self, ur_w: usize) -> KernelResult<()> {
        for blk in 0..self.conf.nb_blocking {
            for u in 0..ur_w {
                let tile = self.tiles.tile(u, blk);
                if self.conf.with_bias {
                    let off = (blk * self.conf.oc_block * self.conf.typesize_bia) as i32;
                    self.asm
                        .vmovups(tile, zmmword_ptr(REG_BIAS + off))
                        .map_err(asm_err)?;
                } else {
                    self.asm.vpxord(tile, tile, tile).map_err(asm_err)?;
                }
            }
        }
        Ok(())
    }

    /// Runtime loop over the in-bounds kernel-height taps; everything
    /// inside one tap is unrolled.
    fn kh_loop(&mut self, ur_w: usize, pad_l: i32, pad_r: i32) -> KernelResult<()> {
        let c = self.conf.clone();
        let asm = &mut self.asm;

        asm.mov(AUX_REG_INP, REG_INP).map_err(asm_err)?;
        asm.mov(AUX_REG_KER, REG_KER).map_err(asm_err)?;
        asm.mov(REG_KJ, REG_KH).map_err(asm_err)?;

        // When vertical padding can swallow the whole kernel height, the
        // trip count may arrive as zero.
        let mut l_done = asm.create_label();
        let may_skip =
            ((c.kh - 1) * (c.dilate_h + 1)) < c.t_pad.max(c.b_pad).max(0) as usize;
        if may_skip {
            asm.cmp(REG_KJ, 0).map_err(asm_err)?;
            asm.je(l_done).map_err(asm_err)?;
        }

        let mut l_kh = asm.create_label();
        asm.set_label(&mut l_kh).map_err(asm_err)?;

        for ki in 0..c.kw {
            let u_start = ow_start(&c, ki, pad_l);
            let u_end = ow_end(&c, ur_w, ki, pad_r);
            for icp in 0..c.ic_block / 2 {
                for blk in 0..c.nb_blocking {
                    let wei_off = ker_offset(&c, ki, icp, blk, 0) as i32;
                    self.asm
                        .vmovups(ZMM_WEI, zmmword_ptr(AUX_REG_KER + wei_off))
                        .map_err(asm_err)?;
                    for u in u_start..u_end {
                        let src_off = inp_offset(&c, ki, icp, u, pad_l) as i32;
                        let tile = self.tiles.tile(u, blk);
                        if let Some(emu) = &self.emu {
                            let bcast = self.tiles.bcast();
                            self.asm
                                .vpbroadcastd(bcast, dword_ptr(AUX_REG_INP + src_off))
                                .map_err(asm_err)?;
                            emu.vdpbf16ps(&mut self.asm, tile, ZMM_WEI, bcast)?;
                        } else {
                            self.asm
                                .vdpbf16ps(tile, ZMM_WEI, dword_bcst(AUX_REG_INP + src_off))
                                .map_err(asm_err)?;
                        }
                    }
                }
            }
        }

        let inp_step = c.typesize_in * (c.dilate_h + 1) * c.iw * c.ic_block;
        let ker_step = c.typesize_in * c.kw * c.oc_block * c.ic_block;
        add_imm(&mut self.asm, AUX_REG_INP, inp_step)?;
        add_imm(&mut self.asm, AUX_REG_KER, ker_step)?;
        self.asm.sub(REG_KJ, 1).map_err(asm_err)?;
        self.asm.jne(l_kh).map_err(asm_err)?;

        if may_skip {
            self.asm.set_label(&mut l_done).map_err(asm_err)?;
            // A label needs a following instruction even when the store
            // path starts with one anyway.
            self.asm.nop().map_err(asm_err)?;
        }
        Ok(())
    }

    fn store_output(&mut self, ur_w: usize) -> KernelResult<()> {
        let c = self.conf.clone();

        if let Some(inj) = self.eltwise.take() {
            inj.prepare(&mut self.asm)?;
            for blk in 0..c.nb_blocking {
                for u in 0..ur_w {
                    inj.compute_vector(&mut self.asm, self.tiles.tile(u, blk))?;
                }
            }
            self.eltwise = Some(inj);
        }

        match c.dst_dt {
            DataType::F32 => {
                for blk in 0..c.nb_blocking {
                    for u in 0..ur_w {
                        let off = out_offset(&c, u, blk) as i32;
                        self.asm
                            .vmovups(zmmword_ptr(REG_OUT + off), self.tiles.tile(u, blk))
                            .map_err(asm_err)?;
                    }
                }
            }
            DataType::Bf16 if self.native_bf16 => {
                // Pairs of unroll positions share one 512-bit store; the
                // second source lands in the low half.
                for blk in 0..c.nb_blocking {
                    let mut u = 0;
                    while u + 1 < ur_w {
                        let off = out_offset(&c, u, blk) as i32;
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
                        let off = out_offset(&c, u, blk) as i32;
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
                        let off = out_offset(&c, u, blk) as i32;
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
    use crate::conf::{ConvDesc, Eltwise, EltwiseKind};
    use crate::isa::Isa;

    fn desc() -> ConvDesc {
        ConvDesc {
            mb: 1,
            ic: 32,
            oc: 64,
            ih: 3,
            iw: 12,
            oh: 3,
            ow: 12,
            kh: 3,
            kw: 3,
            stride_h: 1,
            stride_w: 1,
            dilate_h: 0,
            dilate_w: 0,
            t_pad: 1,
            l_pad: 1,
            src_dt: DataType::Bf16,
            wei_dt: DataType::Bf16,
            dst_dt: DataType::F32,
            bias_dt: None,
            eltwise: None,
            nthreads: 1,
        }
    }

    fn build(d: &ConvDesc, isa: Isa) -> ConvFwdKernel {
        let conf = ConvConf::derive_with_isa(d, Direction::Forward, isa).unwrap();
        ConvFwdKernel::new(conf).unwrap()
    }

    #[test]
    fn test_native_f32_out_assembles() {
        let k = build(&desc(), Isa::Avx512CoreBf16);
        assert!(k.code_size() > 0);
    }

    #[test]
    fn test_emulated_path_is_longer() {
        let native = build(&desc(), Isa::Avx512CoreBf16);
        let emulated = build(&desc(), Isa::Avx512Core);
        assert!(emulated.code_size() > native.code_size());
    }

    #[test]
    fn test_bf16_out_with_bias_and_relu_assembles() {
        let mut d = desc();
        d.dst_dt = DataType::Bf16;
        d.bias_dt = Some(DataType::F32);
        d.eltwise = Some(Eltwise {
            kind: EltwiseKind::Relu,
            alpha: 0.25,
        });
        for isa in [Isa::Avx512Core, Isa::Avx512CoreBf16] {
            let k = build(&d, isa);
            assert!(k.code_size() > 0);
        }
    }

    #[test]
    fn test_odd_unroll_bf16_store_assembles() {
        // ur_w = 7 on the native path exercises the odd-tail store.
        let mut d = desc();
        d.dst_dt = DataType::Bf16;
        let k = build(&d, Isa::Avx512CoreBf16);
        assert_eq!(k.conf().ur_w, 7);
        assert!(k.code_size() > 0);
    }

    #[test]
    fn test_rejects_backward_conf() {
        let conf =
            ConvConf::derive_with_isa(&desc(), Direction::BackwardData, Isa::Avx512Core)
                .unwrap();
        assert!(ConvFwdKernel::new(conf).is_err());
    }
}
