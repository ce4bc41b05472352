pub mod config;
pub mod error;
pub mod fusion;
pub mod kernels;
pub mod ops;
pub mod quantization;
pub mod tensor;

pub use config::{EngineConfig, ProviderKind};
pub use error::{Axis, OpError, Result, Stage};
pub use fusion::{conv_output_size, derive_conv_conf, ConvArgs, ConvConf, ConvMode};
pub use kernels::{KernelManager, KernelProvider, OptimizedProvider, ReferenceProvider};
pub use ops::{Concat, ConcatConf, FusedConv, Operator};
pub use quantization::{QuantContract, RoundMode};
pub use tensor::{DataType, Dims, Element, Layout, Tensor};
