//! Edge-range arithmetic: which unroll positions stay in-bounds for a
//! given kernel tap.
//!
//! The forward pass trims by padding; backward-data trims by "overflow",
//! the count of taps falling outside the gradient tensor at the current
//! stride phase, expressed through a modular residue that is renormalized
//! upward until non-negative. All functions are pure and run only at
//! code-emission time.

use crate::conf::ConvConf;

/// C-style div_up: truncating division of `a + b - 1` by `b`. Negative
/// numerators round toward zero, which the callers clamp away.
fn div_up(a: i64, b: i64) -> i64 {
    (a + b - 1) / b
}

/// Smallest unroll position `u >= 0` with
/// `ki*(dilate_w+1) + u*stride_w - pad_l >= 0`.
pub fn ow_start(conf: &ConvConf, ki: usize, pad_l: i32) -> usize {
    let dil = conf.dilate_w as i64 + 1;
    div_up(pad_l as i64 - ki as i64 * dil, conf.stride_w as i64).max(0) as usize
}

/// One past the largest unroll position that stays within the right
/// padding bound; saturates at 0 for fully padded taps.
pub fn ow_end(conf: &ConvConf, ur_w: usize, ki: usize, pad_r: i32) -> usize {
    let dil = conf.dilate_w as i64 + 1;
    let trim = div_up(
        pad_r as i64 - (conf.kw - 1 - ki) as i64 * dil,
        conf.stride_w as i64,
    )
    .max(0);
    (ur_w as i64 - trim).max(0) as usize
}

/// First in-phase input position for tap `ki` in the backward-data pass.
/// The residue of `(iw - 1 + r_pad) mod stride_w` anchors the sub-stride
/// phase shared with the forward pass; `l_overflow` shifts whole strides
/// for taps hanging off the left edge.
pub fn iw_start(conf: &ConvConf, ki: usize, l_overflow: usize) -> usize {
    let stride = conf.stride_w as i64;
    let dil = conf.dilate_w as i64 + 1;
    let mut res = (conf.iw as i64 - 1 + conf.r_pad as i64) % stride
        + l_overflow as i64 * stride
        - (conf.kw - 1 - ki) as i64 * dil;
    while res < 0 {
        res += stride;
    }
    res as usize
}

/// One past the last in-phase input position for tap `ki`. Tiles that
/// cover the whole extent (or the tail) first shed any negative right
/// padding.
pub fn iw_end(conf: &ConvConf, ur_w: usize, ki: usize, r_overflow: usize) -> usize {
    let stride = conf.stride_w as i64;
    let dil = conf.dilate_w as i64 + 1;
    let mut ur = ur_w as i64;
    if ur_w == conf.iw || ur_w == conf.ur_w_tail {
        ur += i64::from(conf.r_pad.min(0));
    }
    let mut res = (ur - 1 + conf.l_pad as i64) % stride + r_overflow as i64 * stride
        - ki as i64 * dil;
    while res < 0 {
        res += stride;
    }
    (ur - res).max(0) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::{ConvConf, ConvDesc, Direction, Eltwise};
    use crate::isa::Isa;
    use crate::types::DataType;

    fn conf_1d(
        iw: usize,
        ow: usize,
        kw: usize,
        stride: usize,
        dilate: usize,
        l_pad: usize,
    ) -> ConvConf {
        let desc = ConvDesc {
            mb: 1,
            ic: 16,
            oc: 16,
            ih: 1,
            iw,
            oh: 1,
            ow,
            kh: 1,
            kw,
            stride_h: 1,
            stride_w: stride,
            dilate_h: 0,
            dilate_w: dilate,
            t_pad: 0,
            l_pad,
            src_dt: DataType::Bf16,
            wei_dt: DataType::Bf16,
            dst_dt: DataType::F32,
            bias_dt: None,
            eltwise: None::<Eltwise>,
            nthreads: 1,
        };
        ConvConf::derive_with_isa(&desc, Direction::Forward, Isa::Avx512Core).unwrap()
    }

    #[test]
    fn test_ow_start_is_minimal() {
        // kw=3, stride=1, dilate=0, l_pad=1: tap 0 skips position 0.
        let c = conf_1d(6, 6, 3, 1, 0, 1);
        assert_eq!(ow_start(&c, 0, c.l_pad), 1);
        assert_eq!(ow_start(&c, 1, c.l_pad), 0);
        assert_eq!(ow_start(&c, 2, c.l_pad), 0);
        // Minimality: the returned u is the first satisfying the bound.
        for ki in 0..3 {
            let u = ow_start(&c, ki, c.l_pad);
            let lhs = |u: i64| ki as i64 + u - 1;
            assert!(lhs(u as i64) >= 0);
            if u > 0 {
                assert!(lhs(u as i64 - 1) < 0);
            }
        }
    }

    #[test]
    fn test_ow_end_trims_right_padding() {
        let c = conf_1d(6, 6, 3, 1, 0, 1);
        assert_eq!(c.r_pad, 1);
        assert_eq!(ow_end(&c, 6, 2, c.r_pad), 5);
        assert_eq!(ow_end(&c, 6, 1, c.r_pad), 6);
        assert_eq!(ow_end(&c, 6, 0, c.r_pad), 6);
    }

    #[test]
    fn test_interior_regime_is_full_range() {
        let c = conf_1d(20, 20, 3, 1, 0, 1);
        for ki in 0..3 {
            assert_eq!(ow_start(&c, ki, 0), 0);
            assert_eq!(ow_end(&c, c.ur_w, ki, 0), c.ur_w);
        }
    }

    #[test]
    fn test_start_not_past_end_on_legal_confs() {
        for kw in 1..=5 {
            for stride in 1..=3 {
                for dil in 0..=2 {
                    for pad in 0..kw {
                        let ext = (kw - 1) * (dil + 1) + 1;
                        let ow = 16usize;
                        let iw = (ow - 1) * stride + ext;
                        let iw = iw.saturating_sub(2 * pad).max(ow);
                        let Ok(c) = crate::conf::ConvConf::derive_with_isa(
                            &ConvDesc {
                                iw,
                                ow,
                                kw,
                                stride_w: stride,
                                dilate_w: dil,
                                l_pad: pad,
                                ..base(iw, ow)
                            },
                            Direction::Forward,
                            Isa::Avx512Core,
                        ) else {
                            continue;
                        };
                        for &(ur, pl, pr) in &c.fwd_variants() {
                            if ur == 0 {
                                continue;
                            }
                            for ki in 0..c.kw {
                                assert!(
                                    ow_start(&c, ki, pl) <= ow_end(&c, ur, ki, pr),
                                    "kw={kw} stride={stride} dil={dil} pad={pad} ki={ki}"
                                );
                            }
                        }
                    }
                }
            }
        }
    }

    fn base(iw: usize, ow: usize) -> ConvDesc {
        ConvDesc {
            mb: 1,
            ic: 16,
            oc: 16,
            ih: 1,
            iw,
            oh: 1,
            ow,
            kh: 1,
            kw: 1,
            stride_h: 1,
            stride_w: 1,
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

    fn bwd_conf(iw: usize, ow: usize, kw: usize, stride: usize, l_pad: usize) -> ConvConf {
        ConvConf::derive_with_isa(
            &ConvDesc {
                iw,
                ow,
                kw,
                stride_w: stride,
                l_pad,
                ..base(iw, ow)
            },
            Direction::BackwardData,
            Isa::Avx512Core,
        )
        .unwrap()
    }

    #[test]
    fn test_iw_range_stays_within_tile() {
        // kw=3, stride=2, no padding: overflow 1 on both sides.
        let c = bwd_conf(11, 5, 3, 2, 0);
        assert_eq!(c.l_overflow, 1);
        assert_eq!(c.r_overflow, 1);
        for ki in 0..c.kw {
            let s = iw_start(&c, ki, c.l_overflow);
            let e = iw_end(&c, c.ur_w, ki, c.r_overflow);
            assert!(s <= c.ur_w, "ki={ki} start {s}");
            assert!(e <= c.ur_w, "ki={ki} end {e}");
        }
    }

    #[test]
    fn test_iw_start_monotone_in_overflow() {
        let c = bwd_conf(11, 5, 3, 2, 0);
        for ki in 0..c.kw {
            let mut prev = iw_start(&c, ki, 0);
            for ovf in 1..4 {
                let cur = iw_start(&c, ki, ovf);
                assert!(cur >= prev);
                prev = cur;
            }
        }
    }

    #[test]
    fn test_iw_end_monotone_in_overflow() {
        let c = bwd_conf(11, 5, 3, 2, 0);
        for ki in 0..c.kw {
            let mut prev = iw_end(&c, c.ur_w, ki, 0);
            for ovf in 1..4 {
                let cur = iw_end(&c, c.ur_w, ki, ovf);
                assert!(cur <= prev);
                prev = cur;
            }
        }
    }
}
