//! Benchmark kernel generation latency across representative shapes.
//!
//! Measures configuration derivation plus full code emission and the
//! executable-buffer setup; the generated code is never run, so the
//! bench works on any x86-64 build host.
//!
//! Run with: cargo bench --bench jit_compile

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use bf16_conv_kernels::conf::{ConvConf, ConvDesc, Direction};
use bf16_conv_kernels::isa::Isa;
use bf16_conv_kernels::types::DataType;
use bf16_conv_kernels::{ConvBwdDataKernel, ConvFwdKernel};

fn resnet_3x3(ic: usize, oc: usize, spatial: usize) -> ConvDesc {
    ConvDesc {
        mb: 1,
        ic,
        oc,
        ih: spatial,
        iw: spatial,
        oh: spatial,
        ow: spatial,
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
        dst_dt: DataType::Bf16,
        bias_dt: Some(DataType::F32),
        eltwise: None,
        nthreads: 1,
    }
}

fn bench_fwd_generation(c: &mut Criterion) {
    let mut group = c.benchmark_group("fwd_generation");
    for (name, desc, isa) in [
        ("64c_56px_native", resnet_3x3(64, 64, 56), Isa::Avx512CoreBf16),
        ("64c_56px_emulated", resnet_3x3(64, 64, 56), Isa::Avx512Core),
        ("256c_14px_native", resnet_3x3(256, 256, 14), Isa::Avx512CoreBf16),
    ] {
        group.bench_function(name, |b| {
            b.iter(|| {
                let conf =
                    ConvConf::derive_with_isa(black_box(&desc), Direction::Forward, isa)
                        .unwrap();
                let kernel = ConvFwdKernel::new(conf).unwrap();
                black_box(kernel.code_size())
            })
        });
    }
    group.finish();
}

fn bench_bwd_generation(c: &mut Criterion) {
    let mut group = c.benchmark_group("bwd_generation");
    let mut desc = resnet_3x3(64, 64, 56);
    desc.bias_dt = None;
    desc.dst_dt = DataType::F32;
    for (name, isa) in [
        ("64c_56px_native", Isa::Avx512CoreBf16),
        ("64c_56px_emulated", Isa::Avx512Core),
    ] {
        group.bench_function(name, |b| {
            b.iter(|| {
                let conf = ConvConf::derive_with_isa(
                    black_box(&desc),
                    Direction::BackwardData,
                    isa,
                )
                .unwrap();
                let kernel = ConvBwdDataKernel::new(conf).unwrap();
                black_box(kernel.code_size())
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_fwd_generation, bench_bwd_generation);
criterion_main!(benches);
