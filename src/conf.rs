//! Kernel configuration: derivation, legality, and scratchpad bookkeeping.
//!
//! A `ConvConf` is the single immutable input to a kernel generator. It is
//! derived once per distinct problem shape, never mutated afterwards, and
//! carries every blocking factor, padding amount, and capability decision
//! the emitters need. Generators never re-probe the host: the native-vs-
//! emulated bf16 decision is baked here.

use crate::isa::{detect_isa, isa_has_bf16, Isa};
use crate::jit::ranges;
use crate::types::{DataType, KernelError, KernelResult};

/// Channel-block width, matched to one 512-bit register of f32 lanes.
pub const IC_BLOCK: usize = 16;
pub const OC_BLOCK: usize = 16;

/// Which pass a configuration (and its generator) serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    BackwardData,
}

/// Elementwise post-op fused into the forward epilogue.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Eltwise {
    pub kind: EltwiseKind,
    /// Negative-slope for leaky ReLU; 0.0 is plain ReLU.
    pub alpha: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EltwiseKind {
    Relu,
}

/// Raw operator shape and attributes, as handed over by the surrounding
/// framework. Spatial layout is 2D; dilation uses the zero-based
/// convention (0 = dense kernel).
#[derive(Debug, Clone)]
pub struct ConvDesc {
    pub mb: usize,
    pub ic: usize,
    pub oc: usize,
    pub ih: usize,
    pub iw: usize,
    pub oh: usize,
    pub ow: usize,
    pub kh: usize,
    pub kw: usize,
    pub stride_h: usize,
    pub stride_w: usize,
    pub dilate_h: usize,
    pub dilate_w: usize,
    pub t_pad: usize,
    pub l_pad: usize,
    pub src_dt: DataType,
    pub wei_dt: DataType,
    pub dst_dt: DataType,
    pub bias_dt: Option<DataType>,
    pub eltwise: Option<Eltwise>,
    pub nthreads: usize,
}

/// Fully-resolved, immutable kernel configuration.
///
/// For the forward pass the unrolled spatial axis is `ow` and the blocked
/// channel axis is `oc`; backward-data swaps the roles (`iw` / `ic`).
/// `nb_blocking` is the channel-block multiplier of one accumulator tile
/// group and `ur_w` the number of unrolled spatial positions, so one tile
/// group occupies `ur_w * nb_blocking` vector registers.
#[derive(Debug, Clone)]
pub struct ConvConf {
    pub dir: Direction,
    pub mb: usize,
    pub ic: usize,
    pub oc: usize,
    pub oc_without_padding: usize,
    pub id: usize,
    pub ih: usize,
    pub iw: usize,
    pub od: usize,
    pub oh: usize,
    pub ow: usize,
    pub kd: usize,
    pub kh: usize,
    pub kw: usize,
    pub stride_h: usize,
    pub stride_w: usize,
    pub dilate_h: usize,
    pub dilate_w: usize,
    pub t_pad: i32,
    pub b_pad: i32,
    pub l_pad: i32,
    pub r_pad: i32,
    pub ic_block: usize,
    pub oc_block: usize,
    pub nb_ic: usize,
    pub nb_oc: usize,
    pub nb_blocking: usize,
    pub ur_w: usize,
    pub ur_w_tail: usize,
    pub nb_ow_blocks: usize,
    /// Backward-data: kernel taps falling off the gradient tensor on the
    /// left/right at the current stride phase.
    pub l_overflow: usize,
    pub r_overflow: usize,
    pub src_dt: DataType,
    pub wei_dt: DataType,
    pub dst_dt: DataType,
    pub typesize_in: usize,
    pub typesize_out: usize,
    pub typesize_bia: usize,
    pub with_bias: bool,
    pub eltwise: Option<Eltwise>,
    pub isa: Isa,
    pub nthreads: usize,
}

/// Tile-register budget for one accumulator group.
///
/// The ceilings are properties of the 32-register zmm file: the top
/// registers are reserved for the weight/bias staging register and, when
/// the bf16 emulation unit is active, its five scratch registers. One
/// more slot above the tiles holds the emulation broadcast operand.
pub fn tile_budget(dir: Direction, native_bf16: bool) -> usize {
    match (dir, native_bf16) {
        (Direction::Forward, true) => 28,
        // Only zmm31 is reserved on this path, so tiles reach slot 30.
        (Direction::BackwardData, true) => 31,
        (_, false) => 25,
    }
}

/// Whether the requested post-op chain is one the injector supports:
/// at most one eltwise, and only on the forward pass.
pub fn post_ops_ok(desc: &ConvDesc, dir: Direction) -> bool {
    match (dir, desc.eltwise) {
        (_, None) => true,
        (Direction::Forward, Some(e)) => match e.kind {
            EltwiseKind::Relu => (0.0..=1.0).contains(&e.alpha),
        },
        (Direction::BackwardData, Some(_)) => false,
    }
}

fn rnd_up(a: usize, b: usize) -> usize {
    a.div_ceil(b) * b
}

impl ConvConf {
    /// Derive a configuration for the detected host ISA.
    pub fn derive(desc: &ConvDesc, dir: Direction) -> KernelResult<ConvConf> {
        let isa = detect_isa().ok_or_else(|| {
            KernelError::Unsupported("host lacks AVX-512 F/BW".into())
        })?;
        Self::derive_with_isa(desc, dir, isa)
    }

    /// Derive a configuration for an explicit target ISA. Used for
    /// cross-host generation and for forcing the emulated bf16 path on
    /// hardware that has the native instruction.
    pub fn derive_with_isa(
        desc: &ConvDesc,
        dir: Direction,
        isa: Isa,
    ) -> KernelResult<ConvConf> {
        if desc.src_dt != DataType::Bf16 || desc.wei_dt != DataType::Bf16 {
            return Err(KernelError::Unsupported(
                "source and weights must be bf16".into(),
            ));
        }
        if !matches!(desc.dst_dt, DataType::F32 | DataType::Bf16) {
            return Err(KernelError::Unsupported(
                "destination must be f32 or bf16".into(),
            ));
        }
        match desc.bias_dt {
            None => {}
            Some(DataType::F32) => {}
            Some(dt) => {
                return Err(KernelError::Unsupported(format!(
                    "bias dtype {dt:?} not supported"
                )))
            }
        }
        if dir == Direction::BackwardData && desc.bias_dt.is_some() {
            return Err(KernelError::Unsupported(
                "backward-data has no bias".into(),
            ));
        }
        if !post_ops_ok(desc, dir) {
            return Err(KernelError::Unsupported(
                "post-op chain not supported".into(),
            ));
        }
        if desc.stride_w == 0 || desc.stride_h == 0 {
            // Stride 0 would alias every unroll position onto one input.
            return Err(KernelError::Unsupported("zero stride".into()));
        }
        if dir == Direction::BackwardData && desc.dilate_h > 0 && desc.stride_h > 1 {
            // In-phase kernel rows are then stride_h / gcd(dilate_h+1,
            // stride_h) apart, which the fixed row walk in the generated
            // height loop cannot follow.
            return Err(KernelError::Unsupported(
                "vertical dilation combined with vertical stride on backward-data".into(),
            ));
        }
        if desc.kh == 0 || desc.kw == 0 || desc.ow == 0 || desc.oh == 0 {
            return Err(KernelError::Unsupported("empty spatial extent".into()));
        }
        if desc.ic % IC_BLOCK != 0 {
            return Err(KernelError::Unsupported(format!(
                "input channels {} not a multiple of {IC_BLOCK}",
                desc.ic
            )));
        }

        let oc = rnd_up(desc.oc, OC_BLOCK);
        let nb_ic = desc.ic / IC_BLOCK;
        let nb_oc = oc / OC_BLOCK;

        // Channel-block multiplier: widest group that divides the block
        // count, so every invocation sees identical tile geometry.
        let nb_for = |nb: usize| (1..=4).rev().find(|b| nb % b == 0).unwrap_or(1);
        let (nb_blocking, extent) = match dir {
            Direction::Forward => (nb_for(nb_oc), desc.ow),
            Direction::BackwardData => (nb_for(nb_ic), desc.iw),
        };

        let budget = tile_budget(dir, isa_has_bf16(isa));
        let mut cap = budget / nb_blocking;
        if dir == Direction::BackwardData && desc.stride_w > 1 {
            // Block bases must stay in stride phase, so full blocks carry
            // a whole number of strides.
            cap -= cap % desc.stride_w;
            if cap == 0 {
                return Err(KernelError::Unsupported(format!(
                    "stride {} exceeds unroll capacity {}",
                    desc.stride_w,
                    budget / nb_blocking
                )));
            }
        }
        let ur_w = extent.min(cap);
        let needed = ur_w * nb_blocking;
        if needed > budget {
            return Err(KernelError::RegisterBudget { needed, budget });
        }
        let ur_w_tail = extent % ur_w;
        let nb_ow_blocks = extent.div_ceil(ur_w);

        let ext_kw = (desc.kw - 1) * (desc.dilate_w + 1) + 1;
        let ext_kh = (desc.kh - 1) * (desc.dilate_h + 1) + 1;
        let r_pad = (desc.ow - 1) as i32 * desc.stride_w as i32 + ext_kw as i32
            - (desc.iw + desc.l_pad) as i32;
        let b_pad = (desc.oh - 1) as i32 * desc.stride_h as i32 + ext_kh as i32
            - (desc.ih + desc.t_pad) as i32;

        let ovf = |pad: i32| -> usize {
            let p = pad.max(0) as usize;
            ((ext_kw - 1).saturating_sub(p)) / desc.stride_w
        };

        let conf = ConvConf {
            dir,
            mb: desc.mb,
            ic: desc.ic,
            oc,
            oc_without_padding: desc.oc,
            id: 1,
            ih: desc.ih,
            iw: desc.iw,
            od: 1,
            oh: desc.oh,
            ow: desc.ow,
            kd: 1,
            kh: desc.kh,
            kw: desc.kw,
            stride_h: desc.stride_h,
            stride_w: desc.stride_w,
            dilate_h: desc.dilate_h,
            dilate_w: desc.dilate_w,
            t_pad: desc.t_pad as i32,
            b_pad,
            l_pad: desc.l_pad as i32,
            r_pad,
            ic_block: IC_BLOCK,
            oc_block: OC_BLOCK,
            nb_ic,
            nb_oc,
            nb_blocking,
            ur_w,
            ur_w_tail,
            nb_ow_blocks,
            l_overflow: ovf(desc.l_pad as i32),
            r_overflow: ovf(r_pad),
            src_dt: desc.src_dt,
            wei_dt: desc.wei_dt,
            dst_dt: desc.dst_dt,
            typesize_in: desc.src_dt.size(),
            typesize_out: desc.dst_dt.size(),
            typesize_bia: desc.bias_dt.map_or(0, DataType::size),
            with_bias: desc.bias_dt.is_some(),
            eltwise: desc.eltwise,
            isa,
            nthreads: desc.nthreads,
        };

        conf.validate_ranges()?;

        log::debug!(
            "derived {:?} conv conf: ur_w={} tail={} nb_blocking={} isa={:?}",
            dir,
            conf.ur_w,
            conf.ur_w_tail,
            conf.nb_blocking,
            conf.isa,
        );
        Ok(conf)
    }

    /// Pure legality predicate for upstream dispatch. By construction a
    /// derived configuration always re-checks legal.
    pub fn is_legal(desc: &ConvDesc, dir: Direction) -> bool {
        Self::derive(desc, dir).is_ok()
    }

    /// Boundary-regime variants for the forward generator, indexed by
    /// `Regime` discriminant: `(ur_w, pad_l, pad_r)` per variant. A zero
    /// tile width marks a variant that is never invoked.
    pub fn fwd_variants(&self) -> [(usize, i32, i32); 4] {
        let single = self.nb_ow_blocks == 1;
        [
            (self.ur_w, self.l_pad, if single { self.r_pad } else { 0 }),
            (self.ur_w, 0, 0),
            (self.ur_w, 0, self.r_pad),
            (self.ur_w_tail, 0, self.r_pad),
        ]
    }

    /// Boundary-regime variants for the backward-data generator:
    /// `(ur_w, l_overflow, r_overflow)` per `Regime` discriminant.
    pub fn bwd_variants(&self) -> [(usize, usize, usize); 4] {
        let single = self.nb_ow_blocks == 1;
        [
            (
                self.ur_w,
                self.l_overflow,
                if single { self.r_overflow } else { 0 },
            ),
            (self.ur_w, 0, 0),
            (self.ur_w, 0, self.r_overflow),
            (self.ur_w_tail, 0, self.r_overflow),
        ]
    }

    /// Every generated tap range must be well-formed: a claimed-nonempty
    /// range with start past end would emit out-of-bounds accesses.
    fn validate_ranges(&self) -> KernelResult<()> {
        match self.dir {
            Direction::Forward => {
                for &(ur, pad_l, pad_r) in &self.fwd_variants() {
                    if ur == 0 {
                        continue;
                    }
                    for ki in 0..self.kw {
                        let s = ranges::ow_start(self, ki, pad_l);
                        let e = ranges::ow_end(self, ur, ki, pad_r);
                        if s > e {
                            return Err(KernelError::Unsupported(format!(
                                "padding exceeds tile width (tap {ki}: [{s}, {e}))"
                            )));
                        }
                    }
                }
            }
            Direction::BackwardData => {
                for &(ur, l_ovf, r_ovf) in &self.bwd_variants() {
                    if ur == 0 {
                        continue;
                    }
                    for ki in 0..self.kw {
                        let s = ranges::iw_start(self, ki, l_ovf);
                        let e = ranges::iw_end(self, ur, ki, r_ovf);
                        if s > ur || e > ur {
                            return Err(KernelError::Unsupported(format!(
                                "overflow exceeds tile width (tap {ki}: [{s}, {e}))"
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

// ── Scratchpad registration ─────────────────────────────────────────────

/// Named scratch regions a configuration requires from the surrounding
/// memory planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScratchKey {
    /// f32 bias staging padded up to the blocked `oc`.
    BiasPadding,
}

/// Interface to the external scratchpad planner. Purely additive
/// bookkeeping; nothing is allocated here.
pub trait ScratchpadRegistrar {
    fn book(&mut self, key: ScratchKey, bytes: usize, align: usize);
}

/// Declare the scratch regions `conf` needs.
pub fn register_scratch<R: ScratchpadRegistrar>(registrar: &mut R, conf: &ConvConf) {
    if conf.with_bias && conf.oc != conf.oc_without_padding {
        registrar.book(ScratchKey::BiasPadding, conf.oc * conf.typesize_bia, 64);
    }
}
