use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use qfuse::{
    Concat, ConvArgs, DataType, FusedConv, KernelManager, Layout, Operator, OptimizedProvider, ReferenceProvider,
    RoundMode, Tensor,
};
use std::sync::Arc;

fn lcg_tensor_u8(dims: [usize; 4], layout: Layout, seed: u64) -> Tensor {
    let mut s = seed;
    let mut t = Tensor::zeros(dims, layout, DataType::U8).unwrap();
    t.fill_with::<u8, _>(|_| {
        s = s.wrapping_mul(6364136223846793005).wrapping_add(1);
        (s >> 57) as u8
    })
    .unwrap();
    t
}

fn lcg_tensor_s8(dims: [usize; 4], seed: u64) -> Tensor {
    let mut s = seed;
    let mut t = Tensor::zeros(dims, Layout::Nchw, DataType::S8).unwrap();
    t.fill_with::<i8, _>(|_| {
        s = s.wrapping_mul(6364136223846793005).wrapping_add(1);
        ((s >> 32) as i32 % 7 - 3) as i8
    })
    .unwrap();
    t
}

fn managers() -> Vec<(&'static str, Arc<KernelManager>)> {
    vec![
        (
            "optimized",
            Arc::new(KernelManager::with_providers(vec![Arc::new(OptimizedProvider::default())])),
        ),
        (
            "reference",
            Arc::new(KernelManager::with_providers(vec![Arc::new(ReferenceProvider)])),
        ),
    ]
}

fn bench_conv(c: &mut Criterion) {
    let mut group = c.benchmark_group("conv3x3_u8");
    group.sample_size(10);
    let src = lcg_tensor_u8([1, 32, 28, 28], Layout::Nhwc, 1);
    let wei = lcg_tensor_s8([64, 32, 3, 3], 2);
    let w1 = lcg_tensor_s8([32, 64, 1, 1], 3);

    for (name, manager) in managers() {
        let mut dst = Tensor::zeros([1, 64, 28, 28], Layout::Nhwc, DataType::U8).unwrap();
        let args = ConvArgs::new(&src, &wei).padding([1, 1]).conv0_scales(vec![0.01]).relu(true, false);
        let mut op = FusedConv::<u8>::with_manager(false, manager.clone());
        op.configure(args, &mut dst).unwrap();
        group.bench_function(BenchmarkId::new("plain", name), |b| b.iter(|| black_box(&mut op).execute()));

        let mut dst = Tensor::zeros([1, 32, 28, 28], Layout::Nhwc, DataType::U8).unwrap();
        let args = ConvArgs::new(&src, &wei)
            .padding([1, 1])
            .conv0_scales(vec![0.01])
            .fuse_1x1(&w1, None, vec![0.02])
            .relu(true, true);
        let mut op = FusedConv::<u8>::with_manager(true, manager);
        op.configure(args, &mut dst).unwrap();
        group.bench_function(BenchmarkId::new("fused_1x1", name), |b| b.iter(|| black_box(&mut op).execute()));
    }
    group.finish();
}

fn bench_concat(c: &mut Criterion) {
    let mut group = c.benchmark_group("concat_u8");
    let a = lcg_tensor_u8([4, 128, 14, 14], Layout::Nchw, 4);
    let b = lcg_tensor_u8([4, 256, 14, 14], Layout::Nchw, 5);
    for (name, manager) in managers() {
        let mut dst = Tensor::zeros([4, 384, 14, 14], Layout::Nchw, DataType::U8).unwrap();
        let mut op =
            Concat::<u8>::configure_with(manager, vec![&a, &b], &mut dst, false, None, RoundMode::Nearest).unwrap();
        group.bench_function(BenchmarkId::new("nchw", name), |bn| bn.iter(|| black_box(&mut op).execute()));
    }
    group.finish();
}

criterion_group!(benches, bench_conv, bench_concat);
criterion_main!(benches);
