//! Derivation of the immutable convolution configuration.
//!
//! Every check runs before any kernel is bound and fails on the first
//! violation, so kernels can assume a consistent configuration.

use crate::error::{Axis, OpError, Result, Stage};
use crate::kernels::{ConvKernel, KernelProvider};
use crate::quantization::{QuantContract, RoundMode};
use crate::tensor::{DataType, Tensor};
use log::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConvMode {
    Plain,
    /// Convolution followed by a pointwise convolution.
    FusedPointwise,
}

impl ConvMode {
    pub fn from_flag(fuse_1x1: bool) -> Self {
        if fuse_1x1 {
            ConvMode::FusedPointwise
        } else {
            ConvMode::Plain
        }
    }
}

/// Read-only operands and parameters of a fused convolution.
#[derive(Debug, Clone)]
pub struct ConvArgs<'a> {
    pub src: &'a Tensor,
    pub weights: &'a Tensor,
    pub bias: Option<&'a Tensor>,
    pub groups: usize,
    pub stride: [usize; 2],
    pub padding: [usize; 2],
    pub conv0_scales: Vec<f32>,
    pub conv1_scales: Vec<f32>,
    pub weights_1x1: Option<&'a Tensor>,
    pub bias_1x1: Option<&'a Tensor>,
    pub relu0: bool,
    pub relu1: bool,
    pub round0: RoundMode,
    pub round1: RoundMode,
}

impl<'a> ConvArgs<'a> {
    pub fn new(src: &'a Tensor, weights: &'a Tensor) -> Self {
        Self {
            src,
            weights,
            bias: None,
            groups: 1,
            stride: [1, 1],
            padding: [0, 0],
            conv0_scales: vec![1.0],
            conv1_scales: vec![1.0],
            weights_1x1: None,
            bias_1x1: None,
            relu0: false,
            relu1: false,
            round0: RoundMode::Nearest,
            round1: RoundMode::Nearest,
        }
    }

    pub fn bias(mut self, bias: &'a Tensor) -> Self {
        self.bias = Some(bias);
        self
    }

    pub fn groups(mut self, groups: usize) -> Self {
        self.groups = groups;
        self
    }

    pub fn stride(mut self, stride: [usize; 2]) -> Self {
        self.stride = stride;
        self
    }

    pub fn padding(mut self, padding: [usize; 2]) -> Self {
        self.padding = padding;
        self
    }

    pub fn conv0_scales(mut self, scales: Vec<f32>) -> Self {
        self.conv0_scales = scales;
        self
    }

    pub fn fuse_1x1(mut self, weights: &'a Tensor, bias: Option<&'a Tensor>, scales: Vec<f32>) -> Self {
        self.weights_1x1 = Some(weights);
        self.bias_1x1 = bias;
        self.conv1_scales = scales;
        self
    }

    pub fn relu(mut self, relu0: bool, relu1: bool) -> Self {
        self.relu0 = relu0;
        self.relu1 = relu1;
        self
    }

    pub fn round(mut self, round0: RoundMode, round1: RoundMode) -> Self {
        self.round0 = round0;
        self.round1 = round1;
        self
    }
}

/// Everything a kernel needs to know about one convolution call.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvConf {
    pub mode: ConvMode,
    pub batch: usize,
    pub ic: usize,
    pub ih: usize,
    pub iw: usize,
    /// Output channels of stage 0.
    pub oc: usize,
    pub kh: usize,
    pub kw: usize,
    pub stride: [usize; 2],
    pub padding: [usize; 2],
    pub oh: usize,
    pub ow: usize,
    pub groups: usize,
    /// Channels written to the destination (stage 0 or stage 1 output).
    pub dst_channels: usize,
    pub relu0: bool,
    pub relu1: bool,
    pub conv0: QuantContract,
    pub conv1: Option<QuantContract>,
    pub src_dtype: DataType,
    pub wei_dtype: DataType,
    pub bias_dtype: Option<DataType>,
    pub wei_1x1_dtype: Option<DataType>,
    pub bias_1x1_dtype: Option<DataType>,
    pub dst_dtype: DataType,
    /// Element type stage 0 is quantized to before the pointwise stage.
    pub inter_dtype: DataType,
}

impl ConvConf {
    pub fn is_fused(&self) -> bool {
        self.mode == ConvMode::FusedPointwise
    }

    /// Length of one stage-0 dot product.
    pub fn reduction_len(&self) -> usize {
        self.ic * self.kh * self.kw
    }

    /// Multiply-accumulate count of one execution.
    pub fn macs(&self) -> usize {
        let pixels = self.batch * self.oh * self.ow;
        let stage0 = pixels * self.oc * self.reduction_len();
        if self.is_fused() {
            stage0 + pixels * self.oc * self.dst_channels
        } else {
            stage0
        }
    }
}

/// `floor((input + 2 * padding - kernel) / stride) + 1`, or `None` when no
/// output position exists.
pub fn conv_output_size(input: usize, kernel: usize, stride: usize, padding: usize) -> Option<usize> {
    let padded = input + 2 * padding;
    if stride == 0 || kernel == 0 || padded < kernel {
        return None;
    }
    Some((padded - kernel) / stride + 1)
}

fn reject(err: OpError) -> OpError {
    debug!("conv configuration rejected: {}", err);
    err
}

/// Runs all shape, channel, quantization and group checks, in order.
pub fn derive_conv_conf(mode: ConvMode, result: DataType, args: &ConvArgs<'_>, dst: &Tensor) -> Result<ConvConf> {
    if dst.dtype() != result {
        return Err(reject(OpError::DataType {
            what: "dst",
            expected: result,
            actual: dst.dtype(),
        }));
    }

    let src_d = args.src.dims();
    let wei_d = args.weights.dims();
    let dst_d = dst.dims();

    let axes = [
        (Axis::Height, src_d.h, wei_d.h, dst_d.h),
        (Axis::Width, src_d.w, wei_d.w, dst_d.w),
    ];
    for (i, (axis, input, kernel, actual)) in axes.into_iter().enumerate() {
        let expected = conv_output_size(input, kernel, args.stride[i], args.padding[i]).unwrap_or(0);
        if expected == 0 || expected != actual {
            return Err(reject(OpError::ShapeMismatch { axis, expected, actual }));
        }
    }

    if src_d.n != dst_d.n {
        return Err(reject(OpError::BatchMismatch {
            src: src_d.n,
            dst: dst_d.n,
        }));
    }
    if src_d.c != wei_d.c {
        return Err(reject(OpError::ChannelMismatch {
            what: "input",
            expected: wei_d.c,
            actual: src_d.c,
        }));
    }

    let has_1x1 = args.weights_1x1.is_some();
    if has_1x1 != (mode == ConvMode::FusedPointwise) {
        return Err(reject(OpError::ModeMismatch {
            expected: mode == ConvMode::FusedPointwise,
            actual: has_1x1,
        }));
    }

    let (conv0, conv1) = match args.weights_1x1 {
        None => {
            if dst_d.c != wei_d.n {
                return Err(reject(OpError::ChannelMismatch {
                    what: "output",
                    expected: wei_d.n,
                    actual: dst_d.c,
                }));
            }
            if let Some(b) = args.bias {
                if b.dims().n != wei_d.n {
                    return Err(reject(OpError::ChannelMismatch {
                        what: "bias",
                        expected: wei_d.n,
                        actual: b.dims().n,
                    }));
                }
            }
            let conv0 = QuantContract::for_stage(&args.conv0_scales, args.round0, Stage::Conv0, dst_d.c)
                .map_err(reject)?;
            (conv0, None)
        }
        Some(w1) => {
            let w1_d = w1.dims();
            if w1_d.c != wei_d.n {
                return Err(reject(OpError::ChannelMismatch {
                    what: "conv0 output",
                    expected: wei_d.n,
                    actual: w1_d.c,
                }));
            }
            if dst_d.c != w1_d.n {
                return Err(reject(OpError::ChannelMismatch {
                    what: "conv1x1 output",
                    expected: w1_d.n,
                    actual: dst_d.c,
                }));
            }
            if w1_d.h != 1 || w1_d.w != 1 {
                return Err(reject(OpError::FusionShape {
                    kh: w1_d.h,
                    kw: w1_d.w,
                }));
            }
            if let Some(b) = args.bias_1x1 {
                if b.dims().n != dst_d.c {
                    return Err(reject(OpError::ChannelMismatch {
                        what: "conv1x1 bias",
                        expected: dst_d.c,
                        actual: b.dims().n,
                    }));
                }
            }
            let conv0 = QuantContract::for_stage(&args.conv0_scales, args.round0, Stage::Conv0, w1_d.c)
                .map_err(reject)?;
            let conv1 = QuantContract::for_stage(&args.conv1_scales, args.round1, Stage::Conv1x1, w1_d.n)
                .map_err(reject)?;
            (conv0, Some(conv1))
        }
    };

    if args.groups != 1 {
        return Err(reject(OpError::Unsupported(format!(
            "group count {} (only 1 is supported)",
            args.groups
        ))));
    }

    let inter_dtype = if args.src.dtype() == DataType::F32 {
        DataType::F32
    } else if args.relu0 {
        DataType::U8
    } else {
        DataType::S8
    };

    Ok(ConvConf {
        mode,
        batch: src_d.n,
        ic: src_d.c,
        ih: src_d.h,
        iw: src_d.w,
        oc: wei_d.n,
        kh: wei_d.h,
        kw: wei_d.w,
        stride: args.stride,
        padding: args.padding,
        oh: dst_d.h,
        ow: dst_d.w,
        groups: args.groups,
        dst_channels: dst_d.c,
        relu0: args.relu0,
        relu1: args.relu1,
        conv0,
        conv1,
        src_dtype: args.src.dtype(),
        wei_dtype: args.weights.dtype(),
        bias_dtype: args.bias.map(|b| b.dtype()),
        wei_1x1_dtype: args.weights_1x1.map(|w| w.dtype()),
        bias_1x1_dtype: args.bias_1x1.map(|b| b.dtype()),
        dst_dtype: dst.dtype(),
        inter_dtype,
    })
}

/// Derives the configuration and lets `provider` bind a kernel to it.
/// The provider has the final word on feasibility.
pub fn derive_and_bind(
    provider: &dyn KernelProvider,
    mode: ConvMode,
    result: DataType,
    args: &ConvArgs<'_>,
    dst: &Tensor,
) -> Result<(ConvConf, Box<dyn ConvKernel>)> {
    let conf = derive_conv_conf(mode, result, args, dst)?;
    let kernel = provider.bind_conv(&conf).map_err(reject)?;
    debug!(
        "bound {} conv kernel from {}: {}x{}x{} -> {} ({:?})",
        kernel.name(),
        provider.name(),
        conf.ic,
        conf.ih,
        conf.iw,
        conf.dst_channels,
        conf.mode
    );
    Ok((conf, kernel))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Layout;

    #[test]
    fn test_conv_output_size() {
        assert_eq!(conv_output_size(14, 3, 1, 1), Some(14));
        assert_eq!(conv_output_size(14, 3, 2, 1), Some(7));
        assert_eq!(conv_output_size(15, 3, 2, 0), Some(7));
        assert_eq!(conv_output_size(1, 1, 1, 0), Some(1));
        assert_eq!(conv_output_size(2, 5, 1, 1), None);
        assert_eq!(conv_output_size(4, 3, 0, 0), None);
    }

    #[test]
    fn test_inter_dtype_follows_relu() {
        let src = Tensor::zeros([1, 4, 3, 3], Layout::Nchw, DataType::U8).unwrap();
        let wei = Tensor::zeros([8, 4, 3, 3], Layout::Nchw, DataType::S8).unwrap();
        let w1 = Tensor::zeros([2, 8, 1, 1], Layout::Nchw, DataType::S8).unwrap();
        let dst = Tensor::zeros([1, 2, 3, 3], Layout::Nchw, DataType::S32).unwrap();
        let args = ConvArgs::new(&src, &wei).padding([1, 1]).fuse_1x1(&w1, None, vec![1.0]);

        let conf = derive_conv_conf(ConvMode::FusedPointwise, DataType::S32, &args, &dst).unwrap();
        assert_eq!(conf.inter_dtype, DataType::S8);
        let conf = derive_conv_conf(ConvMode::FusedPointwise, DataType::S32, &args.clone().relu(true, false), &dst)
            .unwrap();
        assert_eq!(conf.inter_dtype, DataType::U8);
        assert_eq!(conf.macs(), 9 * 8 * 36 + 9 * 8 * 2);
    }

    #[test]
    fn test_mode_must_match_operands() {
        let src = Tensor::zeros([1, 4, 3, 3], Layout::Nchw, DataType::U8).unwrap();
        let wei = Tensor::zeros([8, 4, 1, 1], Layout::Nchw, DataType::S8).unwrap();
        let dst = Tensor::zeros([1, 8, 3, 3], Layout::Nchw, DataType::U8).unwrap();
        let args = ConvArgs::new(&src, &wei);
        let err = derive_conv_conf(ConvMode::FusedPointwise, DataType::U8, &args, &dst).unwrap_err();
        assert_eq!(
            err,
            OpError::ModeMismatch {
                expected: true,
                actual: false
            }
        );
    }
}
