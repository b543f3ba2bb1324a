use std::{error::Error, fmt};

/// The result type of every `Trainer` operation.
pub type Result<T> = std::result::Result<T, TrainError>;

/// Failures reported by a trainer.
#[derive(Debug, Clone, PartialEq)]
pub enum TrainError {
    /// A parameter tensor or sample doesn't have the shape the model expects.
    ShapeMismatch {
        what: &'static str,
        got: Vec<usize>,
        expected: Vec<usize>,
    },
    /// The numeric work produced a non-finite loss.
    Diverged { epoch: usize },
    /// Any other domain-level failure.
    InvalidInput(String),
}

impl fmt::Display for TrainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainError::ShapeMismatch {
                what,
                got,
                expected,
            } => write!(f, "shape mismatch for {what}: got {got:?}, expected {expected:?}"),
            TrainError::Diverged { epoch } => write!(f, "training diverged at epoch {epoch}"),
            TrainError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
        }
    }
}

impl Error for TrainError {}
