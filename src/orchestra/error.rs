use std::{error::Error, fmt};

use super::scheduler::SchedulerError;
use crate::{data::DataError, model::TrainError};

/// The orchestra module's result type.
pub type Result<T> = std::result::Result<T, OrchestraError>;

/// The two halves of a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Fit,
    Evaluate,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Fit => write!(f, "fit"),
            Phase::Evaluate => write!(f, "evaluate"),
        }
    }
}

/// Why a round couldn't be aggregated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuorumShortfall {
    /// Fewer surviving results than the phase's minimum.
    TooFewResults { got: usize, required: usize },
    /// Every surviving result reported zero examples.
    ZeroWeight,
}

/// Errors that stop a run or a round.
#[derive(Debug)]
pub enum OrchestraError {
    /// Invalid configuration, caught before the first round.
    Configuration(String),
    /// Fewer participants available than the run requires.
    InsufficientParticipants { available: usize, required: usize },
    /// A round phase didn't gather enough usable results.
    RoundQuorum {
        round: u32,
        phase: Phase,
        shortfall: QuorumShortfall,
    },
    /// The run was cancelled before it could finish.
    Cancelled { round: u32 },
}

impl fmt::Display for OrchestraError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration(msg) => write!(f, "configuration error: {msg}"),
            Self::InsufficientParticipants {
                available,
                required,
            } => write!(
                f,
                "insufficient participants: {available} available, {required} required"
            ),
            Self::RoundQuorum {
                round,
                phase,
                shortfall: QuorumShortfall::TooFewResults { got, required },
            } => write!(
                f,
                "round {round} {phase} quorum failure: {got} result(s), {required} required"
            ),
            Self::RoundQuorum {
                round,
                phase,
                shortfall: QuorumShortfall::ZeroWeight,
            } => write!(
                f,
                "round {round} {phase} quorum failure: results carry zero total examples"
            ),
            Self::Cancelled { round } => write!(f, "run cancelled before round {round}"),
        }
    }
}

impl Error for OrchestraError {}

impl From<DataError> for OrchestraError {
    fn from(value: DataError) -> Self {
        Self::Configuration(value.to_string())
    }
}

impl From<SchedulerError> for OrchestraError {
    fn from(value: SchedulerError) -> Self {
        Self::Configuration(value.to_string())
    }
}

/// Why a single participant task didn't produce a result.
#[derive(Debug)]
pub enum FailureReason {
    /// The trainer or evaluator reported an error.
    Trainer(TrainError),
    /// The returned parameters don't match the global model's layout.
    LayoutMismatch {
        got: Vec<Vec<usize>>,
        expected: Vec<Vec<usize>>,
    },
    /// The resource scheduler refused the task.
    Admission(SchedulerError),
    /// The task panicked or was aborted by the runtime.
    Panicked(String),
    /// The round timed out or the run was cancelled while the task was outstanding.
    Cancelled,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Trainer(e) => write!(f, "{e}"),
            FailureReason::LayoutMismatch { got, expected } => {
                write!(f, "parameter layout {got:?} doesn't match {expected:?}")
            }
            FailureReason::Admission(e) => write!(f, "not admitted: {e}"),
            FailureReason::Panicked(msg) => write!(f, "task panicked: {msg}"),
            FailureReason::Cancelled => write!(f, "cancelled while outstanding"),
        }
    }
}

/// A single participant's `fit` or `evaluate` failed.
///
/// It's recovered by excluding the participant from the round's aggregation.
#[derive(Debug)]
pub struct ParticipantFailure {
    pub participant_id: usize,
    pub reason: FailureReason,
}

impl ParticipantFailure {
    pub fn new(participant_id: usize, reason: FailureReason) -> Self {
        Self {
            participant_id,
            reason,
        }
    }
}

impl fmt::Display for ParticipantFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "participant {} failed: {}", self.participant_id, self.reason)
    }
}

impl Error for ParticipantFailure {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self.reason {
            FailureReason::Trainer(e) => Some(e),
            FailureReason::Admission(e) => Some(e),
            _ => None,
        }
    }
}
