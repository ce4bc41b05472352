pub mod concat;
pub mod conv;

pub use concat::{Concat, ConcatConf};
pub use conv::FusedConv;

use crate::error::Result;
use crate::fusion::ConvArgs;
use crate::quantization::RoundMode;
use crate::tensor::{Element, Tensor};
use log::trace;
use std::time::Instant;

pub trait Operator {
    fn name(&self) -> &'static str;

    /// Runs the bound kernel over the bound tensors. Writes the whole destination.
    fn execute(&mut self);

    /// `execute` with the elapsed time traced.
    fn submit(&mut self) {
        let start = Instant::now();
        self.execute();
        trace!("{} took {:?}", self.name(), start.elapsed());
    }
}

/// Builds and configures a convolution; fusion follows `args.weights_1x1`.
pub fn conv<'a, T: Element>(args: ConvArgs<'a>, dst: &'a mut Tensor) -> Result<FusedConv<'a, T>> {
    let mut op = FusedConv::new(args.weights_1x1.is_some());
    op.configure(args, dst)?;
    Ok(op)
}

/// Unscaled concatenation with an optional trailing ReLU.
pub fn concat<'a, T: Element>(srcs: Vec<&'a Tensor>, dst: &'a mut Tensor, relu: bool) -> Result<Concat<'a, T>> {
    Concat::configure(srcs, dst, relu, None, RoundMode::Nearest)
}
