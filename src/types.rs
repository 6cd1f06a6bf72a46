//! Shared types: element dtypes, the runtime call descriptor, and errors.

use thiserror::Error;

/// Errors from kernel configuration and code generation.
///
/// Invocation-time precondition violations (bad pointers, undersized
/// buffers) are deliberately *not* represented here: the generated code
/// performs no checks, and violating the calling contract is undefined
/// behavior by design.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("unsupported convolution: {0}")]
    Unsupported(String),
    #[error("register budget exceeded: {needed} tile registers, budget {budget}")]
    RegisterBudget { needed: usize, budget: usize },
    #[error("assembly failed: {0}")]
    Assembly(String),
    #[error("executable buffer: {0}")]
    CodeBuffer(String),
}

pub type KernelResult<T> = Result<T, KernelError>;

/// Element data type of a tensor touched by a generated kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    F32,
    Bf16,
}

impl DataType {
    /// Element size in bytes.
    pub fn size(self) -> usize {
        match self {
            DataType::F32 => 4,
            DataType::Bf16 => 2,
        }
    }
}

/// Boundary regime selector passed at invocation time.
///
/// The generated function contains one instruction-stream variant per
/// regime; the selector picks which variant runs for this output block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Regime {
    /// First output block: left padding is active.
    Left = 0,
    /// Interior block: no padding, fixed full unroll range.
    Main = 1,
    /// Last full-width block: right padding is active.
    Right = 2,
    /// Narrower tail block when the spatial extent is not divisible by
    /// the tile width.
    Tail = 3,
}

/// Runtime argument block for a generated convolution kernel.
///
/// This is the only thing that changes between invocations; every byte
/// offset is baked into the code at generation time, relative to these
/// base pointers.
///
/// # Calling contract
///
/// The caller guarantees all buffers are laid out per the `ConvConf` the
/// kernel was generated from and are large enough for every baked offset.
/// `kh_padding` is the number of kernel-height taps that land in-bounds
/// for this invocation (0 is legal and skips the accumulation entirely
/// when the configuration allows fully padded rows).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ConvCallArgs {
    /// Forward: source tensor. Backward-data: output gradient.
    pub src: *const u8,
    /// Forward: destination tensor. Backward-data: input gradient.
    pub dst: *mut u8,
    /// Weights, in the blocked two-channels-per-lane layout.
    pub filt: *const u8,
    /// f32 bias, forward only; null when the configuration has no bias.
    pub bias: *const u8,
    /// Kernel-height loop trip count for this invocation.
    pub kh_padding: usize,
    /// `Regime` discriminant selecting the boundary variant.
    pub regime: usize,
}

/// Signature of a generated convolution kernel.
pub type ConvKernelFn = unsafe extern "C" fn(*const ConvCallArgs);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_sizes() {
        assert_eq!(DataType::F32.size(), 4);
        assert_eq!(DataType::Bf16.size(), 2);
    }

    #[test]
    fn test_regime_discriminants() {
        assert_eq!(Regime::Left as usize, 0);
        assert_eq!(Regime::Main as usize, 1);
        assert_eq!(Regime::Right as usize, 2);
        assert_eq!(Regime::Tail as usize, 3);
    }

    #[test]
    fn test_call_args_layout_is_pointer_dense() {
        // The emitter reads fields with offset_of!; this just pins the
        // expectation that the struct stays pointer-aligned and packed.
        assert_eq!(
            std::mem::size_of::<ConvCallArgs>(),
            6 * std::mem::size_of::<usize>()
        );
    }
}
