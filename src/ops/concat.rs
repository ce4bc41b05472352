use super::Operator;
use crate::error::{Axis, OpError, Result, Stage};
use crate::kernels::{ConcatIo, ConcatKernel, KernelManager};
use crate::quantization::{QuantContract, RoundMode};
use crate::tensor::{DataType, Element, Tensor};
use log::debug;
use std::marker::PhantomData;
use std::sync::Arc;

/// Validated channel-wise concatenation.
#[derive(Debug, Clone, PartialEq)]
pub struct ConcatConf {
    pub batch: usize,
    pub h: usize,
    pub w: usize,
    pub src_channels: Vec<usize>,
    /// First destination channel of each source.
    pub offsets: Vec<usize>,
    pub dst_channels: usize,
    pub relu: bool,
    /// One per source; identity when no rescaling is needed.
    pub contracts: Vec<QuantContract>,
    pub dtype: DataType,
}

fn reject(err: OpError) -> OpError {
    debug!("concat configuration rejected: {}", err);
    err
}

impl ConcatConf {
    pub fn derive(
        result: DataType,
        srcs: &[&Tensor],
        dst: &Tensor,
        relu: bool,
        scales: Option<&[f32]>,
        round: RoundMode,
    ) -> Result<Self> {
        if srcs.is_empty() {
            return Err(reject(OpError::Unsupported("concat needs at least one source".into())));
        }
        if dst.dtype() != result {
            return Err(reject(OpError::DataType {
                what: "dst",
                expected: result,
                actual: dst.dtype(),
            }));
        }
        let d = dst.dims();
        let mut src_channels = Vec::with_capacity(srcs.len());
        let mut offsets = Vec::with_capacity(srcs.len());
        let mut total = 0;
        for src in srcs {
            if src.dtype() != result {
                return Err(reject(OpError::DataType {
                    what: "src",
                    expected: result,
                    actual: src.dtype(),
                }));
            }
            let s = src.dims();
            if s.n != d.n {
                return Err(reject(OpError::BatchMismatch { src: s.n, dst: d.n }));
            }
            if s.h != d.h {
                return Err(reject(OpError::ShapeMismatch {
                    axis: Axis::Height,
                    expected: d.h,
                    actual: s.h,
                }));
            }
            if s.w != d.w {
                return Err(reject(OpError::ShapeMismatch {
                    axis: Axis::Width,
                    expected: d.w,
                    actual: s.w,
                }));
            }
            offsets.push(total);
            src_channels.push(s.c);
            total += s.c;
        }
        if total != d.c {
            return Err(reject(OpError::ChannelMismatch {
                what: "concat output",
                expected: total,
                actual: d.c,
            }));
        }

        let contracts = match scales {
            None => vec![QuantContract::identity(); srcs.len()],
            Some(scales) if scales.len() == srcs.len() => scales
                .iter()
                .map(|&s| QuantContract::new(vec![s], round))
                .collect(),
            Some(scales) => {
                return Err(reject(OpError::ScaleLength {
                    stage: Stage::Concat,
                    len: scales.len(),
                    channels: srcs.len(),
                }))
            }
        };

        Ok(Self {
            batch: d.n,
            h: d.h,
            w: d.w,
            src_channels,
            offsets,
            dst_channels: d.c,
            relu,
            contracts,
            dtype: result,
        })
    }

    /// Source index and its local channel for destination channel `ch`.
    pub fn source_of(&self, ch: usize) -> (usize, usize) {
        let s = self.offsets.partition_point(|&o| o <= ch) - 1;
        (s, ch - self.offsets[s])
    }

    pub fn elements(&self) -> usize {
        self.batch * self.dst_channels * self.h * self.w
    }
}

/// Concatenation along channels; configured once, then executed any number of times.
pub struct Concat<'a, T: Element> {
    conf: ConcatConf,
    kernel: Box<dyn ConcatKernel>,
    io: ConcatIo<'a>,
    _result: PhantomData<T>,
}

impl<'a, T: Element> Concat<'a, T> {
    pub fn configure(
        srcs: Vec<&'a Tensor>,
        dst: &'a mut Tensor,
        relu: bool,
        scales: Option<Vec<f32>>,
        round: RoundMode,
    ) -> Result<Self> {
        Self::configure_with(KernelManager::global(), srcs, dst, relu, scales, round)
    }

    pub fn configure_with(
        manager: Arc<KernelManager>,
        srcs: Vec<&'a Tensor>,
        dst: &'a mut Tensor,
        relu: bool,
        scales: Option<Vec<f32>>,
        round: RoundMode,
    ) -> Result<Self> {
        let conf = ConcatConf::derive(T::DTYPE, &srcs, dst, relu, scales.as_deref(), round)?;
        let provider = manager.select_best()?;
        let kernel = provider.bind_concat(&conf).map_err(reject)?;
        debug!(
            "bound {} from {}: {:?} -> {}",
            kernel.name(),
            provider.name(),
            conf.src_channels,
            conf.dst_channels
        );
        Ok(Self {
            conf,
            kernel,
            io: ConcatIo { srcs, dst },
            _result: PhantomData,
        })
    }

    pub fn conf(&self) -> &ConcatConf {
        &self.conf
    }

    pub fn kernel_name(&self) -> &'static str {
        self.kernel.name()
    }

    pub fn dst(&self) -> &Tensor {
        &*self.io.dst
    }
}

impl<'a, T: Element> Operator for Concat<'a, T> {
    fn name(&self) -> &'static str {
        "concat"
    }

    fn execute(&mut self) {
        self.kernel.run(&mut self.io);
    }
}
