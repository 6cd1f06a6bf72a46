//! Host capability probe for the AVX-512 bf16 kernel family.
//!
//! Detection runs once and is cached; the result is baked into the
//! `ConvConf` at derivation time so generators never branch on host
//! features per-instruction.

use std::sync::OnceLock;

/// Instruction-set level a kernel is generated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Isa {
    /// AVX-512 F/BW: bf16 dot products go through the emulation unit.
    Avx512Core,
    /// AVX-512 with native BF16 (`vdpbf16ps`, `vcvtne2ps2bf16`).
    Avx512CoreBf16,
}

/// Whether the fused bf16 dot-product instruction is natively available
/// at the given ISA level.
pub fn isa_has_bf16(isa: Isa) -> bool {
    isa == Isa::Avx512CoreBf16
}

static HOST_ISA: OnceLock<Option<Isa>> = OnceLock::new();

/// Detect the best ISA level the host can execute, or `None` when the
/// host cannot run either kernel family.
pub fn detect_isa() -> Option<Isa> {
    *HOST_ISA.get_or_init(probe)
}

#[cfg(target_arch = "x86_64")]
fn probe() -> Option<Isa> {
    if !(is_x86_feature_detected!("avx512f") && is_x86_feature_detected!("avx512bw")) {
        return None;
    }
    if is_x86_feature_detected!("avx512bf16") {
        Some(Isa::Avx512CoreBf16)
    } else {
        Some(Isa::Avx512Core)
    }
}

#[cfg(not(target_arch = "x86_64"))]
fn probe() -> Option<Isa> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isa_has_bf16() {
        assert!(!isa_has_bf16(Isa::Avx512Core));
        assert!(isa_has_bf16(Isa::Avx512CoreBf16));
    }

    #[test]
    fn test_detect_is_stable() {
        // Cached probe must return the same answer every time.
        assert_eq!(detect_isa(), detect_isa());
    }
}
