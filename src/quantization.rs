use crate::error::{OpError, Result, Stage};
use crate::tensor::{DataType, Element};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RoundMode {
    /// Round half to even.
    #[default]
    Nearest,
    /// Round toward negative infinity.
    Down,
}

impl RoundMode {
    #[inline]
    pub fn apply(self, v: f64) -> f64 {
        match self {
            RoundMode::Nearest => v.round_ties_even(),
            RoundMode::Down => v.floor(),
        }
    }
}

/// How an accumulator becomes a stored value: scale, round, saturate.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantContract {
    scales: Vec<f32>,
    round: RoundMode,
}

impl Default for QuantContract {
    fn default() -> Self {
        Self::identity()
    }
}

impl QuantContract {
    pub fn new(scales: Vec<f32>, round: RoundMode) -> Self {
        Self { scales, round }
    }

    pub fn identity() -> Self {
        Self {
            scales: vec![1.0],
            round: RoundMode::Nearest,
        }
    }

    /// Builds the contract for a stage with `channels` outputs, checking that
    /// the scale vector is per-tensor or per-channel.
    pub fn for_stage(scales: &[f32], round: RoundMode, stage: Stage, channels: usize) -> Result<Self> {
        let contract = Self::new(scales.to_vec(), round);
        contract.check_channels(stage, channels)?;
        Ok(contract)
    }

    pub fn check_channels(&self, stage: Stage, channels: usize) -> Result<()> {
        if self.scales.len() == 1 || self.scales.len() == channels {
            Ok(())
        } else {
            Err(OpError::ScaleLength {
                stage,
                len: self.scales.len(),
                channels,
            })
        }
    }

    pub fn scales(&self) -> &[f32] {
        &self.scales
    }

    pub fn round_mode(&self) -> RoundMode {
        self.round
    }

    pub fn is_per_channel(&self) -> bool {
        self.scales.len() > 1
    }

    pub fn is_identity(&self) -> bool {
        self.scales.iter().all(|&s| s == 1.0)
    }

    #[inline]
    pub fn scale(&self, channel: usize) -> f32 {
        if self.scales.len() == 1 {
            self.scales[0]
        } else {
            self.scales[channel]
        }
    }

    /// Per-channel scales expanded to `channels` entries.
    pub fn expand(&self, channels: usize) -> Vec<f32> {
        (0..channels).map(|c| self.scale(c)).collect()
    }

    #[inline]
    pub fn requantize<T: Element>(&self, acc: f64, channel: usize) -> T {
        requantize_scaled(acc, self.scale(channel), self.round)
    }
}

/// `acc * scale`, rounded for integer targets, saturated to `T`.
/// Computed in f64 so every i32 accumulator is represented exactly.
#[inline]
pub fn requantize_scaled<T: Element>(acc: f64, scale: f32, round: RoundMode) -> T {
    let v = acc * scale as f64;
    if T::DTYPE.is_integer() {
        T::saturate(round.apply(v))
    } else {
        T::saturate(v)
    }
}

/// The stage epilogue shared by every kernel: bias, optional ReLU, then the contract.
#[inline]
pub fn finish<T: Element>(acc: f64, bias: f64, relu: bool, scale: f32, round: RoundMode) -> T {
    let mut v = acc + bias;
    if relu && v < 0.0 {
        v = 0.0;
    }
    requantize_scaled(v, scale, round)
}

/// [`finish`] into the element type named by `dtype`, widened back to f64.
#[inline]
pub fn finish_as(dtype: DataType, acc: f64, bias: f64, relu: bool, scale: f32, round: RoundMode) -> f64 {
    match dtype {
        DataType::F32 => finish::<f32>(acc, bias, relu, scale, round) as f64,
        DataType::S32 => finish::<i32>(acc, bias, relu, scale, round) as f64,
        DataType::S8 => finish::<i8>(acc, bias, relu, scale, round) as f64,
        DataType::U8 => finish::<u8>(acc, bias, relu, scale, round) as f64,
    }
}
