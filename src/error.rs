use crate::tensor::DataType;
use thiserror::Error;

/// Spatial axis of a 4-d tensor, used to attribute shape failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    Height,
    Width,
}

impl std::fmt::Display for Axis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Axis::Height => write!(f, "height"),
            Axis::Width => write!(f, "width"),
        }
    }
}

/// Which stage a quantization failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Conv0,
    Conv1x1,
    Concat,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Conv0 => write!(f, "conv0"),
            Stage::Conv1x1 => write!(f, "conv1x1"),
            Stage::Concat => write!(f, "concat"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OpError {
    #[error("{what} data type mismatch: expected {expected}, got {actual}")]
    DataType {
        what: &'static str,
        expected: DataType,
        actual: DataType,
    },
    #[error("output {axis} does not match: expected {expected}, got {actual}")]
    ShapeMismatch {
        axis: Axis,
        expected: usize,
        actual: usize,
    },
    #[error("batch size mismatch: source {src}, destination {dst}")]
    BatchMismatch { src: usize, dst: usize },
    #[error("{what} channel mismatch: expected {expected}, got {actual}")]
    ChannelMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("fused conv must be a 1x1 kernel, got {kh}x{kw}")]
    FusionShape { kh: usize, kw: usize },
    #[error("{stage} scale length {len} is neither 1 nor {channels}")]
    ScaleLength {
        stage: Stage,
        len: usize,
        channels: usize,
    },
    #[error("operator built with fuse_1x1={expected} but 1x1 weights present={actual}")]
    ModeMismatch { expected: bool, actual: bool },
    #[error("unsupported configuration: {0}")]
    Unsupported(String),
    #[error("kernel binding failed in {provider}: {reason}")]
    Binding {
        provider: &'static str,
        reason: String,
    },
    #[error("invalid tensor buffer: {0}")]
    Buffer(String),
    #[error("invalid engine config: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, OpError>;
