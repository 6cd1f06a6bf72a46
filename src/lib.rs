//! JIT-compiled bf16 convolution kernels for AVX-512 hosts.
//!
//! The crate generates specialized x86-64 machine code for the forward
//! and backward-data passes of a blocked-layout 2D convolution with bf16
//! sources and weights. Every problem shape gets its own function with
//! all blocking factors, unroll ranges, and byte offsets baked in at
//! generation time; on hosts with AVX512-BF16 the inner product uses
//! `vdpbf16ps`, elsewhere an instruction-sequence emulation over plain
//! AVX-512 F/BW.
//!
//! # Quick start
//!
//! ```ignore
//! use bf16_conv_kernels::{ConvConf, ConvFwdKernel, Direction};
//!
//! let conf = ConvConf::derive(&desc, Direction::Forward)?;
//! let kernel = ConvFwdKernel::new(conf)?;
//! // unsafe: caller upholds the ConvCallArgs contract
//! unsafe { kernel.call(&args) };
//! ```

pub mod conf;
pub mod isa;
pub mod jit;
pub mod types;

pub use conf::{ConvConf, ConvDesc, Direction};
pub use isa::{detect_isa, Isa};
pub use jit::bwd_data::ConvBwdDataKernel;
pub use jit::fwd::ConvFwdKernel;
pub use types::{ConvCallArgs, DataType, KernelError, KernelResult, Regime};
