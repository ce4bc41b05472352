//! Straightforward kernels: direct loops, f64 accumulation, any layout.
//! Slow, but the yardstick the optimized kernels are checked against.

use super::{
    bound, bound_mut, check_conv_types, load_bias, ConcatIo, ConcatKernel, ConvIo, ConvKernel,
    KernelProvider,
};
use crate::error::Result;
use crate::fusion::ConvConf;
use crate::ops::concat::ConcatConf;
use crate::quantization::{finish, finish_as, requantize_scaled};
use crate::tensor::{DataType, Element, Tensor};

pub struct ReferenceProvider;

impl KernelProvider for ReferenceProvider {
    fn name(&self) -> &'static str {
        "reference"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn bind_conv(&self, conf: &ConvConf) -> Result<Box<dyn ConvKernel>> {
        check_conv_types(conf)?;
        Ok(Box::new(RefConv { conf: conf.clone() }))
    }

    fn bind_concat(&self, conf: &ConcatConf) -> Result<Box<dyn ConcatKernel>> {
        Ok(Box::new(RefConcat { conf: conf.clone() }))
    }
}

struct RefConv {
    conf: ConvConf,
}

impl ConvKernel for RefConv {
    fn name(&self) -> &'static str {
        if self.conf.is_fused() {
            "ref_conv_1x1"
        } else {
            "ref_conv"
        }
    }

    fn run(&self, io: &mut ConvIo<'_>) {
        match self.conf.dst_dtype {
            DataType::F32 => self.run_typed::<f32>(io),
            DataType::S32 => self.run_typed::<i32>(io),
            DataType::S8 => self.run_typed::<i8>(io),
            DataType::U8 => self.run_typed::<u8>(io),
        }
    }
}

impl RefConv {
    /// Full-precision stage-0 sum for one output position.
    fn stage0_acc(&self, src: &Tensor, wei: &Tensor, n: usize, oc: usize, oh: usize, ow: usize) -> f64 {
        let c = &self.conf;
        let mut acc = 0f64;
        for ic in 0..c.ic {
            for kh in 0..c.kh {
                let ih = (oh * c.stride[0] + kh) as isize - c.padding[0] as isize;
                if ih < 0 || ih >= c.ih as isize {
                    continue;
                }
                for kw in 0..c.kw {
                    let iw = (ow * c.stride[1] + kw) as isize - c.padding[1] as isize;
                    if iw < 0 || iw >= c.iw as isize {
                        continue;
                    }
                    acc += src.load_f64(n, ic, ih as usize, iw as usize) * wei.load_f64(oc, ic, kh, kw);
                }
            }
        }
        acc
    }

    fn run_typed<T: Element>(&self, io: &mut ConvIo<'_>) {
        let c = &self.conf;
        let (src, wei) = (io.src, io.weights);
        let b0 = load_bias(io.bias, c.oc);
        let round0 = c.conv0.round_mode();
        let (layout, dims) = (io.dst.layout(), io.dst.dims());

        if !c.is_fused() {
            let out = bound_mut::<T>(io.dst);
            for n in 0..c.batch {
                for oc in 0..c.oc {
                    for oh in 0..c.oh {
                        for ow in 0..c.ow {
                            let acc = self.stage0_acc(src, wei, n, oc, oh, ow);
                            out[layout.offset(&dims, n, oc, oh, ow)] =
                                finish::<T>(acc, b0[oc], c.relu0, c.conv0.scale(oc), round0);
                        }
                    }
                }
            }
            return;
        }

        let (Some(w1), Some(conv1)) = (io.weights_1x1, c.conv1.as_ref()) else {
            panic!("fused conv kernel bound without a 1x1 stage");
        };
        let b1 = load_bias(io.bias_1x1, c.dst_channels);
        let pixels = c.oh * c.ow;

        // [n][oc][oh][ow], already quantized to the intermediate type
        let mut inter = vec![0f64; c.batch * c.oc * pixels];
        for n in 0..c.batch {
            for oc in 0..c.oc {
                for oh in 0..c.oh {
                    for ow in 0..c.ow {
                        let acc = self.stage0_acc(src, wei, n, oc, oh, ow);
                        inter[(n * c.oc + oc) * pixels + oh * c.ow + ow] =
                            finish_as(c.inter_dtype, acc, b0[oc], c.relu0, c.conv0.scale(oc), round0);
                    }
                }
            }
        }

        let out = bound_mut::<T>(io.dst);
        for n in 0..c.batch {
            for o1 in 0..c.dst_channels {
                for p in 0..pixels {
                    let mut acc = 0f64;
                    for oc in 0..c.oc {
                        acc += inter[(n * c.oc + oc) * pixels + p] * w1.load_f64(o1, oc, 0, 0);
                    }
                    let (oh, ow) = (p / c.ow, p % c.ow);
                    out[layout.offset(&dims, n, o1, oh, ow)] = finish::<T>(
                        acc,
                        b1[o1],
                        c.relu1,
                        conv1.scale(o1),
                        conv1.round_mode(),
                    );
                }
            }
        }
    }
}

struct RefConcat {
    conf: ConcatConf,
}

impl ConcatKernel for RefConcat {
    fn name(&self) -> &'static str {
        "ref_concat"
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

impl RefConcat {
    fn run_typed<T: Element>(&self, io: &mut ConcatIo<'_>) {
        let c = &self.conf;
        let (layout, dims) = (io.dst.layout(), io.dst.dims());
        let out = bound_mut::<T>(io.dst);
        for (s, src) in io.srcs.iter().enumerate() {
            let data = bound::<T>(src);
            let q = &c.contracts[s];
            for n in 0..c.batch {
                for ch in 0..c.src_channels[s] {
                    for h in 0..c.h {
                        for w in 0..c.w {
                            let x = data[src.offset(n, ch, h, w)];
                            let v = if q.is_identity() {
                                x
                            } else {
                                requantize_scaled::<T>(x.to_f64(), q.scale(0), q.round_mode())
                            };
                            out[layout.offset(&dims, n, c.offsets[s] + ch, h, w)] = v;
                        }
                    }
                }
            }
        }
        if c.relu {
            for v in out.iter_mut() {
                if *v < T::default() {
                    *v = T::default();
                }
            }
        }
    }
}
