mod error;
mod params;
mod softmax;

pub use error::{Result, TrainError};
pub use params::{Metrics, Parameters, Tensor};
pub use softmax::SoftmaxRegression;

use crate::data::Subset;

/// The loss and accuracy of a model over some evaluation data.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub loss: f64,
    pub accuracy: f64,
}

/// Abstraction over the local numeric work executed by a participant.
///
/// Implementations encapsulate the model architecture, the loss and the optimizer.
/// The orchestration engine treats this trait as a black box that maps parameters
/// and a data handle to updated parameters and scalar metrics.
pub trait Trainer: Send {
    /// Runs `epochs` local passes over `data`, updating `params` in place.
    ///
    /// # Returns
    /// Trainer-defined metrics about the passes, possibly empty.
    ///
    /// # Errors
    /// Implementations should report invalid parameter layouts or inputs via
    /// `TrainError` rather than panicking.
    fn train(&mut self, params: &mut Parameters, data: &Subset, epochs: usize) -> Result<Metrics>;

    /// Evaluates `params` over `data` without updating them.
    fn evaluate(&mut self, params: &Parameters, data: &Subset) -> Result<Evaluation>;
}
