#![allow(dead_code)]

use qfuse::config::EngineConfig;
use qfuse::{DataType, Dims, Element, KernelManager, Layout, OptimizedProvider, ReferenceProvider, RoundMode, Tensor};
use std::sync::Arc;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Deterministic values covering most of `T`'s useful range, including negatives where `T` has them.
pub fn pattern<T: Element>(i: usize) -> T {
    let k = i.wrapping_mul(37).wrapping_add(11);
    let v = match T::DTYPE {
        DataType::U8 => (k % 23) as f64,
        DataType::S8 => (k % 23) as f64 - 11.0,
        DataType::S32 => (i.wrapping_mul(7919) % 2_000_003) as f64 - 1_000_000.0,
        DataType::F32 => (k % 101) as f64 / 8.0 - 6.0,
    };
    T::saturate(v)
}

/// Small weights in `-4..=4`, as `T`.
pub fn weight<T: Element>(i: usize) -> T {
    T::saturate(((i * 5 + 3) % 9) as f64 - 4.0)
}

pub fn filled<T: Element>(dims: [usize; 4], layout: Layout, f: impl Fn(usize) -> T) -> Tensor {
    let mut t = Tensor::zeros(dims, layout, T::DTYPE).unwrap();
    t.fill_with::<T, _>(f).unwrap();
    t
}

pub fn as_f64<T: Element>(t: &Tensor) -> Vec<f64> {
    t.to_nchw_vec::<T>().unwrap().into_iter().map(|v| v.to_f64()).collect()
}

/// Managers pinned to one provider each, with parallel rows forced on for the optimized ones.
pub fn managers() -> Vec<(&'static str, Arc<KernelManager>)> {
    let pooled = EngineConfig {
        num_threads: Some(3),
        parallel_threshold: 0,
        ..EngineConfig::from_toml_str("provider = \"optimized\"").unwrap()
    };
    vec![
        (
            "reference",
            Arc::new(KernelManager::with_providers(vec![Arc::new(ReferenceProvider)])),
        ),
        (
            "optimized",
            Arc::new(KernelManager::with_providers(vec![Arc::new(OptimizedProvider::new(None, 0))])),
        ),
        ("optimized-pool", Arc::new(KernelManager::from_config(&pooled).unwrap())),
    ]
}

/// Quantizes one accumulator the way a stored element of `dtype` is produced, entirely in f64.
pub fn store_as(dtype: DataType, acc: f64, bias: f64, relu: bool, scale: f32, round: RoundMode) -> f64 {
    let mut v = acc + bias;
    if relu && v < 0.0 {
        v = 0.0;
    }
    let v = v * scale as f64;
    let (lo, hi) = match dtype {
        DataType::F32 => return v.clamp(f32::MIN as f64, f32::MAX as f64) as f32 as f64,
        DataType::S32 => (i32::MIN as f64, i32::MAX as f64),
        DataType::S8 => (-128.0, 127.0),
        DataType::U8 => (0.0, 255.0),
    };
    let r = match round {
        RoundMode::Nearest => v.round_ties_even(),
        RoundMode::Down => v.floor(),
    };
    r.clamp(lo, hi)
}

pub struct NaiveStage<'a> {
    pub weights: &'a [f64],
    pub wdims: Dims,
    pub bias: &'a [f64],
    pub stride: [usize; 2],
    pub padding: [usize; 2],
    pub relu: bool,
    pub scales: &'a [f32],
    pub round: RoundMode,
    pub out: DataType,
}

/// Direct convolution over NCHW data; returns the output and its dims.
pub fn naive_conv(src: &[f64], sd: Dims, st: &NaiveStage) -> (Vec<f64>, Dims) {
    let wd = st.wdims;
    let oh = (sd.h + 2 * st.padding[0] - wd.h) / st.stride[0] + 1;
    let ow = (sd.w + 2 * st.padding[1] - wd.w) / st.stride[1] + 1;
    let od = Dims::new(sd.n, wd.n, oh, ow);
    let mut out = vec![0f64; od.count()];
    for n in 0..sd.n {
        for o in 0..wd.n {
            for y in 0..oh {
                for x in 0..ow {
                    let mut acc = 0f64;
                    for i in 0..sd.c {
                        for ky in 0..wd.h {
                            for kx in 0..wd.w {
                                let iy = (y * st.stride[0] + ky) as i64 - st.padding[0] as i64;
                                let ix = (x * st.stride[1] + kx) as i64 - st.padding[1] as i64;
                                if iy < 0 || ix < 0 || iy >= sd.h as i64 || ix >= sd.w as i64 {
                                    continue;
                                }
                                let s = src[((n * sd.c + i) * sd.h + iy as usize) * sd.w + ix as usize];
                                let w = st.weights[((o * wd.c + i) * wd.h + ky) * wd.w + kx];
                                acc += s * w;
                            }
                        }
                    }
                    let scale = if st.scales.len() == 1 { st.scales[0] } else { st.scales[o] };
                    let b = if st.bias.is_empty() { 0.0 } else { st.bias[o] };
                    out[((n * wd.n + o) * oh + y) * ow + x] = store_as(st.out, acc, b, st.relu, scale, st.round);
                }
            }
        }
    }
    (out, od)
}

/// Channel concatenation over NCHW data with an optional per-source rescale.
pub fn naive_concat(
    srcs: &[(Vec<f64>, Dims)],
    dtype: DataType,
    relu: bool,
    scales: Option<&[f32]>,
    round: RoundMode,
) -> Vec<f64> {
    let (n, h, w) = (srcs[0].1.n, srcs[0].1.h, srcs[0].1.w);
    let mut out = Vec::new();
    for b in 0..n {
        for (s, (data, d)) in srcs.iter().enumerate() {
            let plane = d.c * h * w;
            for &x in &data[b * plane..(b + 1) * plane] {
                let scale = scales.map_or(1.0, |sc| sc[s]);
                let mut v = if scale == 1.0 { x } else { store_as(dtype, x, 0.0, false, scale, round) };
                if relu && v < 0.0 {
                    v = 0.0;
                }
                out.push(v);
            }
        }
    }
    out
}

/// `|got - want| <= abs + rel * |want|` element-wise.
pub fn assert_close(what: &str, got: &[f64], want: &[f64], rel: f64, abs: f64) {
    assert_eq!(got.len(), want.len(), "{}: length", what);
    for (i, (g, w)) in got.iter().zip(want).enumerate() {
        let bound = abs + rel * w.abs();
        assert!(
            (g - w).abs() <= bound,
            "{}: element {} differs, got {} expected {}",
            what,
            i,
            g,
            w
        );
    }
}
