mod error;
mod history;
mod orchestrator;
mod participant;
mod scheduler;
mod status;
mod strategy;

pub use error::{FailureReason, OrchestraError, ParticipantFailure, Phase, QuorumShortfall, Result};
pub use history::{History, RoundRecord};
pub use orchestrator::{Orchestrator, OrchestratorBuilder, RoundState};
pub use participant::{
    EvalTarget, EvaluateRes, FitRes, Participant, ParticipantContext, ParticipantProxy,
    RoundConfig,
};
pub use scheduler::{Lease, ResourceScheduler, Resources, SchedulerError};
pub use status::{HistoryItem, RunStatus, StatusBoard, TrainingStatus};
pub use strategy::{
    sample_size, weighted_average, weighted_mean, weighted_metrics, FedAvg, StrategyConfig,
};
