//! Constant byte-offset arithmetic for the blocked tensor layouts.
//!
//! Every displacement a generated kernel uses is computed here at
//! emission time and baked into the instruction stream; nothing is
//! recomputed at runtime. Layouts (forward naming):
//!
//!   src:     [nb_ic][ih][iw][ic_block]            bf16
//!   dst:     [nb_oc][oh][ow][oc_block]            f32 | bf16
//!   weights: [nb_oc][nb_ic][kh][kw][ic/2][oc_block][2]   bf16
//!
//! The factor 2 on channel terms reflects the fused dot-product operand
//! layout: two bf16 channels interleaved per 32-bit lane. The emulation
//! unit consumes the identical layout, so the factor never changes with
//! the capability decision.

use crate::conf::ConvConf;

/// Destination offset for unroll position `u` in output channel block
/// `blk` (forward).
pub fn out_offset(conf: &ConvConf, u: usize, blk: usize) -> usize {
    conf.typesize_out * (blk * conf.od * conf.oh * conf.ow + u) * conf.oc_block
}

/// Source offset for kernel tap `ki`, input-channel pair `icp`, unroll
/// position `u` under left padding `pad_l` (forward). Only called for
/// in-bounds taps, so the spatial index is non-negative.
pub fn inp_offset(conf: &ConvConf, ki: usize, icp: usize, u: usize, pad_l: i32) -> usize {
    let iw_idx = ki as i64 * (conf.dilate_w as i64 + 1) + u as i64 * conf.stride_w as i64
        - pad_l as i64;
    debug_assert!(iw_idx >= 0, "input tap out of bounds: {iw_idx}");
    conf.typesize_in * (iw_idx as usize * conf.ic_block + 2 * icp)
}

/// Weight offset for kernel tap `ki`, input-channel pair `icp`, output
/// channel block `blk`, sub-register index `n` (forward).
pub fn ker_offset(conf: &ConvConf, ki: usize, icp: usize, blk: usize, n: usize) -> usize {
    let blk_stride = conf.nb_ic * conf.ic_block * conf.kh * conf.kw * conf.kd;
    conf.typesize_in
        * conf.oc_block
        * (blk * blk_stride + 2 * (icp + n) + ki * conf.ic_block)
}

/// Maximum weight displacement the forward emitter will bake; checked at
/// derivation so every weight access fits an i32 displacement.
pub fn max_ker_offset(conf: &ConvConf) -> usize {
    ker_offset(
        conf,
        conf.kw - 1,
        conf.ic_block / 2 - 1,
        conf.nb_blocking.saturating_sub(1),
        0,
    )
}

// ── Backward-data counterparts (roles swapped) ──────────────────────────
//
//   diff_dst: [nb_oc][oh][ow][oc_block]            bf16
//   diff_src: [nb_ic][ih][iw][ic_block]            f32 | bf16
//   weights:  [nb_ic][nb_oc][kh][kw][oc/2][ic_block][2]  bf16

/// Input-gradient offset for unroll position `u` in input channel block
/// `blk`.
pub fn bwd_out_offset(conf: &ConvConf, u: usize, blk: usize) -> usize {
    conf.typesize_out * (blk * conf.id * conf.ih * conf.iw + u) * conf.ic_block
}

/// Output-gradient offset for output position `ow_idx`, output-channel
/// pair `ocp`. The position is relative to the block's shifted base and
/// may be negative for interior blocks, so the result is signed.
pub fn bwd_dst_offset(conf: &ConvConf, ow_idx: i64, ocp: usize) -> i64 {
    conf.typesize_in as i64 * (ow_idx * conf.oc_block as i64 + 2 * ocp as i64)
}

/// Weight offset for the backward-data pass: tap `ki`, output-channel
/// pair `ocp`, input channel block `blk`, sub-register index `n`.
pub fn bwd_ker_offset(conf: &ConvConf, ki: usize, ocp: usize, blk: usize, n: usize) -> usize {
    let blk_stride = conf.nb_oc * conf.oc_block * conf.kh * conf.kw * conf.kd;
    conf.typesize_in
        * conf.ic_block
        * (blk * blk_stride + 2 * (ocp + n) + ki * conf.oc_block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::{ConvConf, ConvDesc, Direction};
    use crate::isa::Isa;
    use crate::types::DataType;

    fn conf() -> ConvConf {
        ConvConf::derive_with_isa(
            &ConvDesc {
                mb: 1,
                ic: 32,
                oc: 64,
                ih: 1,
                iw: 12,
                oh: 1,
                ow: 12,
                kh: 1,
                kw: 3,
                stride_h: 1,
                stride_w: 1,
                dilate_h: 0,
                dilate_w: 0,
                t_pad: 0,
                l_pad: 1,
                src_dt: DataType::Bf16,
                wei_dt: DataType::Bf16,
                dst_dt: DataType::F32,
                bias_dt: None,
                eltwise: None,
                nthreads: 1,
            },
            Direction::Forward,
            Isa::Avx512Core,
        )
        .unwrap()
    }

    #[test]
    fn test_out_offset_formula() {
        let c = conf();
        // f32, oc_block 16, spatial extent 12
        assert_eq!(out_offset(&c, 0, 0), 0);
        assert_eq!(out_offset(&c, 1, 0), 4 * 16);
        assert_eq!(out_offset(&c, 0, 1), 4 * 12 * 16);
    }

    #[test]
    fn test_inp_offset_interleaves_channel_pairs() {
        let c = conf();
        // bf16, ic_block 16: one spatial step is 32 bytes, one pair 4.
        assert_eq!(inp_offset(&c, 0, 0, 1, 0), 2 * 16);
        assert_eq!(inp_offset(&c, 0, 1, 0, 0), 2 * 2);
        // tap and padding shift the spatial index
        assert_eq!(inp_offset(&c, 1, 0, 0, 1), 0);
        assert_eq!(inp_offset(&c, 2, 0, 3, 1), 2 * 16 * 4);
    }

    #[test]
    fn test_ker_offset_strides() {
        let c = conf();
        let elt = 2 * 16; // typesize_in * oc_block
        assert_eq!(ker_offset(&c, 0, 0, 0, 0), 0);
        assert_eq!(ker_offset(&c, 0, 1, 0, 0), elt * 2);
        assert_eq!(ker_offset(&c, 1, 0, 0, 0), elt * 16);
        let blk_stride = c.nb_ic * 16 * c.kh * c.kw;
        assert_eq!(ker_offset(&c, 0, 0, 1, 0), elt * blk_stride);
    }

    #[test]
    fn test_inp_offsets_injective_across_unroll() {
        let c = conf();
        for ki in 0..c.kw {
            let mut seen = std::collections::HashSet::new();
            for u in 0..c.ur_w {
                assert!(
                    seen.insert(inp_offset(&c, ki, 0, u, 0)),
                    "aliasing access at ki={ki} u={u}"
                );
            }
        }
    }

    #[test]
    fn test_out_offsets_injective_across_tile() {
        let c = conf();
        let mut seen = std::collections::HashSet::new();
        for blk in 0..c.nb_blocking {
            for u in 0..c.ur_w {
                assert!(seen.insert(out_offset(&c, u, blk)));
            }
        }
    }

    #[test]
    fn test_bwd_offsets_mirror_forward() {
        let c = ConvConf::derive_with_isa(
            &ConvDesc {
                mb: 1,
                ic: 64,
                oc: 32,
                ih: 1,
                iw: 12,
                oh: 1,
                ow: 12,
                kh: 1,
                kw: 3,
                stride_h: 1,
                stride_w: 1,
                dilate_h: 0,
                dilate_w: 0,
                t_pad: 0,
                l_pad: 1,
                src_dt: DataType::Bf16,
                wei_dt: DataType::Bf16,
                dst_dt: DataType::F32,
                bias_dt: None,
                eltwise: None,
                nthreads: 1,
            },
            Direction::BackwardData,
            Isa::Avx512Core,
        )
        .unwrap();
        assert_eq!(bwd_out_offset(&c, 1, 0), 4 * 16);
        assert_eq!(bwd_dst_offset(&c, 1, 0), 2 * 16);
        assert_eq!(bwd_dst_offset(&c, 0, 3), 2 * 6);
        let elt = 2 * 16;
        assert_eq!(bwd_ker_offset(&c, 1, 0, 0, 0), elt * 16);
        let blk_stride = c.nb_oc * 16 * c.kh * c.kw;
        assert_eq!(bwd_ker_offset(&c, 0, 0, 1, 0), elt * blk_stride);
    }
}
