use super::Operator;
use crate::error::Result;
use crate::fusion::{derive_and_bind, ConvArgs, ConvConf, ConvMode};
use crate::kernels::{ConvIo, ConvKernel, KernelManager};
use crate::tensor::{Element, Tensor};
use std::marker::PhantomData;
use std::sync::Arc;

struct Bound<'a> {
    conf: ConvConf,
    kernel: Box<dyn ConvKernel>,
    io: ConvIo<'a>,
}

enum ConvState<'a> {
    Unconfigured,
    Ready(Box<Bound<'a>>),
}

/// Convolution, optionally fused with a following 1x1 convolution, producing `T`.
pub struct FusedConv<'a, T: Element> {
    mode: ConvMode,
    manager: Arc<KernelManager>,
    state: ConvState<'a>,
    _result: PhantomData<T>,
}

impl<'a, T: Element> FusedConv<'a, T> {
    pub fn new(fuse_1x1: bool) -> Self {
        Self::with_manager(fuse_1x1, KernelManager::global())
    }

    pub fn with_manager(fuse_1x1: bool, manager: Arc<KernelManager>) -> Self {
        Self {
            mode: ConvMode::from_flag(fuse_1x1),
            manager,
            state: ConvState::Unconfigured,
            _result: PhantomData,
        }
    }

    pub fn mode(&self) -> ConvMode {
        self.mode
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, ConvState::Ready(_))
    }

    pub fn conf(&self) -> Option<&ConvConf> {
        match &self.state {
            ConvState::Ready(b) => Some(&b.conf),
            ConvState::Unconfigured => None,
        }
    }

    pub fn kernel_name(&self) -> Option<&'static str> {
        match &self.state {
            ConvState::Ready(b) => Some(b.kernel.name()),
            ConvState::Unconfigured => None,
        }
    }

    /// The bound destination, readable between executions.
    pub fn dst(&self) -> Option<&Tensor> {
        match &self.state {
            ConvState::Ready(b) => Some(&*b.io.dst),
            ConvState::Unconfigured => None,
        }
    }

    /// Validates `args` against `dst` and binds a kernel. On failure the
    /// operator is left unconfigured.
    pub fn configure(&mut self, args: ConvArgs<'a>, dst: &'a mut Tensor) -> Result<()> {
        self.state = ConvState::Unconfigured;
        let provider = self.manager.select_best()?;
        let (conf, kernel) = derive_and_bind(provider.as_ref(), self.mode, T::DTYPE, &args, dst)?;
        let io = ConvIo {
            src: args.src,
            weights: args.weights,
            bias: args.bias,
            weights_1x1: args.weights_1x1,
            bias_1x1: args.bias_1x1,
            dst,
        };
        self.state = ConvState::Ready(Box::new(Bound { conf, kernel, io }));
        Ok(())
    }
}

impl<'a, T: Element> Operator for FusedConv<'a, T> {
    fn name(&self) -> &'static str {
        match self.mode {
            ConvMode::Plain => "conv",
            ConvMode::FusedPointwise => "conv_1x1",
        }
    }

    /// # Panics
    /// When called before a successful `configure`.
    fn execute(&mut self) {
        match &mut self.state {
            ConvState::Ready(b) => {
                let Bound { kernel, io, .. } = &mut **b;
                kernel.run(io);
            }
            ConvState::Unconfigured => panic!("FusedConv::execute called on an unconfigured operator"),
        }
    }
}
