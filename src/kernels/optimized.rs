//! Throughput kernels.
//!
//! Integer sources accumulate in i32, float sources in f64. Each output row
//! is one task: the receptive field of every pixel is gathered once
//! (im2col for a single pixel) and dotted against all packed weight rows.
//! Tasks write disjoint destination positions through [`SendPtr`].

use super::avx;
use super::utils::{Parallelism, SendPtr};
use super::{
    bound, bound_mut, check_conv_types, load_bias, ConcatIo, ConcatKernel, ConvIo, ConvKernel,
    KernelProvider,
};
use crate::config::DEFAULT_PARALLEL_THRESHOLD;
use crate::error::{OpError, Result};
use crate::fusion::ConvConf;
use crate::ops::concat::ConcatConf;
use crate::quantization::{finish, finish_as, requantize_scaled, RoundMode};
use crate::tensor::{DataType, Element, Layout, Tensor};
use rayon::ThreadPool;
use std::sync::Arc;

/// Accumulator of a dot product.
pub trait Accum: Copy + Default + Send + Sync + 'static {
    fn from_elem<E: Element>(e: E) -> Self;
    fn from_f64(v: f64) -> Self;
    fn to_f64(self) -> f64;
    fn dot(a: &[Self], b: &[Self], avx2: bool) -> Self;
}

impl Accum for i32 {
    #[inline]
    fn from_elem<E: Element>(e: E) -> Self {
        e.to_i32()
    }
    #[inline]
    fn from_f64(v: f64) -> Self {
        v as i32
    }
    #[inline]
    fn to_f64(self) -> f64 {
        self as f64
    }
    #[inline]
    fn dot(a: &[Self], b: &[Self], avx2: bool) -> Self {
        avx::dot_i32(a, b, avx2)
    }
}

impl Accum for f64 {
    #[inline]
    fn from_elem<E: Element>(e: E) -> Self {
        e.to_f64()
    }
    #[inline]
    fn from_f64(v: f64) -> Self {
        v
    }
    #[inline]
    fn to_f64(self) -> f64 {
        self
    }
    /// Sequential in `(ic, kh, kw)` order, the same order as the reference sum.
    #[inline]
    fn dot(a: &[Self], b: &[Self], _avx2: bool) -> Self {
        a.iter().zip(b).fold(0.0, |s, (x, y)| s + x * y)
    }
}

/// Largest magnitude an element of `dt` can take, as a factor of the i32 bound.
fn max_magnitude(dt: DataType) -> i64 {
    match dt {
        DataType::U8 => 255,
        DataType::S8 => 128,
        DataType::S32 => i32::MAX as i64,
        DataType::F32 => 0,
    }
}

pub struct OptimizedProvider {
    par: Parallelism,
    avx2: bool,
}

impl Default for OptimizedProvider {
    fn default() -> Self {
        Self::new(None, DEFAULT_PARALLEL_THRESHOLD)
    }
}

impl OptimizedProvider {
    pub fn new(pool: Option<Arc<ThreadPool>>, parallel_threshold: usize) -> Self {
        Self {
            par: Parallelism::new(pool, parallel_threshold),
            avx2: avx::has_avx2(),
        }
    }

    /// The worst-case stage sums must fit an i32 accumulator.
    fn check_accumulator(&self, conf: &ConvConf) -> Result<()> {
        let limit = i32::MAX as i64;
        let weight = max_magnitude(DataType::S8);
        let stage0 = max_magnitude(conf.src_dtype) * weight * conf.reduction_len() as i64;
        if stage0 > limit {
            return Err(OpError::Binding {
                provider: self.name(),
                reason: format!("stage-0 reduction of {} may overflow i32", conf.reduction_len()),
            });
        }
        if conf.is_fused() {
            let stage1 = max_magnitude(conf.inter_dtype) * weight * conf.oc as i64;
            if stage1 > limit {
                return Err(OpError::Binding {
                    provider: self.name(),
                    reason: format!("1x1 reduction of {} may overflow i32", conf.oc),
                });
            }
        }
        Ok(())
    }
}

impl KernelProvider for OptimizedProvider {
    fn name(&self) -> &'static str {
        "optimized"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn bind_conv(&self, conf: &ConvConf) -> Result<Box<dyn ConvKernel>> {
        check_conv_types(conf)?;
        if conf.src_dtype == DataType::F32 {
            return Ok(Box::new(FastConv::<f64>::new(conf, self.par.clone(), false)));
        }
        self.check_accumulator(conf)?;
        Ok(Box::new(FastConv::<i32>::new(conf, self.par.clone(), self.avx2)))
    }

    fn bind_concat(&self, conf: &ConcatConf) -> Result<Box<dyn ConcatKernel>> {
        Ok(Box::new(FastConcat {
            conf: conf.clone(),
            par: self.par.clone(),
        }))
    }
}

/// Weight rows `[o][i * kh * kw]` in the accumulator type.
fn pack_weights<A: Accum>(w: &Tensor) -> Vec<A> {
    let d = w.dims();
    let mut packed = Vec::with_capacity(d.count());
    for o in 0..d.n {
        for i in 0..d.c {
            for h in 0..d.h {
                for x in 0..d.w {
                    packed.push(A::from_f64(w.load_f64(o, i, h, x)));
                }
            }
        }
    }
    packed
}

struct FastConv<A: Accum> {
    conf: ConvConf,
    par: Parallelism,
    avx2: bool,
    scale0: Vec<f32>,
    scale1: Vec<f32>,
    _acc: std::marker::PhantomData<A>,
}

impl<A: Accum> FastConv<A> {
    fn new(conf: &ConvConf, par: Parallelism, avx2: bool) -> Self {
        let scale1 = match &conf.conv1 {
            Some(q) => q.expand(conf.dst_channels),
            None => Vec::new(),
        };
        Self {
            scale0: conf.conv0.expand(conf.oc),
            scale1,
            conf: conf.clone(),
            par,
            avx2,
            _acc: std::marker::PhantomData,
        }
    }

    /// Receptive field of output pixel `(oh, ow)` in `(ic, kh, kw)` order; zero outside the input.
    #[inline]
    fn gather<S: Element>(&self, src: &[S], src_t: &Tensor, n: usize, oh: usize, ow: usize, patch: &mut [A]) {
        let c = &self.conf;
        let mut k = 0;
        for ic in 0..c.ic {
            for kh in 0..c.kh {
                let ih = (oh * c.stride[0] + kh) as isize - c.padding[0] as isize;
                let row_valid = ih >= 0 && ih < c.ih as isize;
                for kw in 0..c.kw {
                    let iw = (ow * c.stride[1] + kw) as isize - c.padding[1] as isize;
                    patch[k] = if row_valid && iw >= 0 && iw < c.iw as isize {
                        A::from_elem(src[src_t.offset(n, ic, ih as usize, iw as usize)])
                    } else {
                        A::default()
                    };
                    k += 1;
                }
            }
        }
    }

    fn run_dst<T: Element>(&self, io: &mut ConvIo<'_>) {
        match self.conf.src_dtype {
            DataType::U8 => self.run_typed::<u8, T>(io),
            DataType::S8 => self.run_typed::<i8, T>(io),
            _ => self.run_typed::<f32, T>(io),
        }
    }

    fn run_typed<S: Element, T: Element>(&self, io: &mut ConvIo<'_>) {
        let c = &self.conf;
        let k = c.reduction_len();
        let src_t = io.src;
        let src = bound::<S>(src_t);
        let w0 = pack_weights::<A>(io.weights);
        let b0 = load_bias(io.bias, c.oc);
        let round0 = c.conv0.round_mode();

        let fused = match (c.is_fused(), io.weights_1x1, &c.conv1) {
            (false, _, _) => None,
            (true, Some(w1), Some(q1)) => Some((
                pack_weights::<A>(w1),
                load_bias(io.bias_1x1, c.dst_channels),
                q1.round_mode(),
            )),
            _ => panic!("fused conv kernel bound without a 1x1 stage"),
        };

        let (layout, dims) = (io.dst.layout(), io.dst.dims());
        let out = SendPtr::new(bound_mut::<T>(io.dst).as_mut_ptr());

        self.par.for_each_row(c.macs(), c.batch * c.oh, |row| {
            let (n, oh) = (row / c.oh, row % c.oh);
            let mut patch = vec![A::default(); k];
            let mut mid = vec![A::default(); if fused.is_some() { c.oc } else { 0 }];
            for ow in 0..c.ow {
                self.gather(src, src_t, n, oh, ow, &mut patch);
                match &fused {
                    None => {
                        for oc in 0..c.oc {
                            let acc = A::dot(&w0[oc * k..(oc + 1) * k], &patch, self.avx2);
                            let v = finish::<T>(acc.to_f64(), b0[oc], c.relu0, self.scale0[oc], round0);
                            // SAFETY: (n, oc, oh, ow) is owned by this row
                            unsafe { out.write(layout.offset(&dims, n, oc, oh, ow), v) };
                        }
                    }
                    Some((w1, b1, round1)) => {
                        for oc in 0..c.oc {
                            let acc = A::dot(&w0[oc * k..(oc + 1) * k], &patch, self.avx2);
                            mid[oc] = A::from_f64(finish_as(
                                c.inter_dtype,
                                acc.to_f64(),
                                b0[oc],
                                c.relu0,
                                self.scale0[oc],
                                round0,
                            ));
                        }
                        self.pointwise::<T>(w1, b1, *round1, &mid, out, layout, &dims, n, oh, ow);
                    }
                }
            }
        });
    }

    #[allow(clippy::too_many_arguments)]
    #[inline]
    fn pointwise<T: Element>(
        &self,
        w1: &[A],
        b1: &[f64],
        round1: RoundMode,
        mid: &[A],
        out: SendPtr<T>,
        layout: Layout,
        dims: &crate::tensor::Dims,
        n: usize,
        oh: usize,
        ow: usize,
    ) {
        let c = &self.conf;
        for o1 in 0..c.dst_channels {
            let acc = A::dot(&w1[o1 * c.oc..(o1 + 1) * c.oc], mid, self.avx2);
            let v = finish::<T>(acc.to_f64(), b1[o1], c.relu1, self.scale1[o1], round1);
            // SAFETY: (n, o1, oh, ow) is owned by this row
            unsafe { out.write(layout.offset(dims, n, o1, oh, ow), v) };
        }
    }
}

impl<A: Accum> ConvKernel for FastConv<A> {
    fn name(&self) -> &'static str {
        match (self.conf.is_fused(), self.conf.src_dtype == DataType::F32) {
            (false, false) => "conv_i32acc",
            (true, false) => "conv_1x1_i32acc",
            (false, true) => "conv_f64acc",
            (true, true) => "conv_1x1_f64acc",
        }
    }

    fn run(&self, io: &mut ConvIo<'_>) {
        match self.conf.dst_dtype {
            DataType::F32 => self.run_dst::<f32>(io),
            DataType::S32 => self.run_dst::<i32>(io),
            DataType::S8 => self.run_dst::<i8>(io),
            DataType::U8 => self.run_dst::<u8>(io),
        }
    }
}

struct FastConcat {
    conf: ConcatConf,
    par: Parallelism,
}

impl ConcatKernel for FastConcat {
    fn name(&self) -> &'static str {
        "concat_rows"
    }

    fn run(&self, io: &mut ConcatIo<'_>) {
        match self.conf.dtype {
            DataType::F32 => self.run_typed::<f32>(io),
            DataType::S32 => self.run_typed::<i32>(io),
            DataType::S8 => self.run_typed::<i8>(io),
            DataType::U8 => self.run_typed::<u8>(io),
        }
    }
}

impl FastConcat {
    fn run_typed<T: Element>(&self, io: &mut ConcatIo<'_>) {
        let c = &self.conf;
        let srcs: Vec<&[T]> = io.srcs.iter().map(|s| bound::<T>(s)).collect();
        let src_ts = &io.srcs;
        let (layout, dims) = (io.dst.layout(), io.dst.dims());
        let out = SendPtr::new(bound_mut::<T>(io.dst).as_mut_ptr());
        let plane = c.h * c.w;
        let zero = T::default();

        // One row per (n, destination channel); channel blocks never overlap.
        self.par.for_each_row(c.elements(), c.batch * c.dst_channels, |row| {
            let (n, ch) = (row / c.dst_channels, row % c.dst_channels);
            let (s, local) = c.source_of(ch);
            let (src, src_t, q) = (srcs[s], src_ts[s], &c.contracts[s]);

            if q.is_identity() && !c.relu && src_t.layout() == Layout::Nchw && layout == Layout::Nchw {
                let from = src_t.offset(n, local, 0, 0);
                let to = layout.offset(&dims, n, ch, 0, 0);
                // SAFETY: both planes are contiguous in NCHW and this row owns the destination plane
                unsafe {
                    std::ptr::copy_nonoverlapping(src.as_ptr().add(from), out.as_ptr().add(to), plane);
                }
                return;
            }

            for h in 0..c.h {
                for w in 0..c.w {
                    let x = src[src_t.offset(n, local, h, w)];
                    let mut v = if q.is_identity() {
                        x
                    } else {
                        requantize_scaled::<T>(x.to_f64(), q.scale(0), q.round_mode())
                    };
                    if c.relu && v < zero {
                        v = zero;
                    }
                    // SAFETY: (n, ch, h, w) is owned by this row
                    unsafe { out.write(layout.offset(&dims, n, ch, h, w), v) };
                }
            }
        });
    }
}
