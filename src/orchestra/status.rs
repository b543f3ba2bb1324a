use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Lifecycle of a training run as seen from outside.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Idle,
    Running,
    Finished,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryItem {
    pub round: u32,
    pub accuracy: f64,
}

/// A snapshot of a run's progress, as served on `/get-status`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingStatus {
    pub status: RunStatus,
    pub current_round: u32,
    pub total_rounds: u32,
    pub history: Vec<HistoryItem>,
    pub error_message: Option<String>,
}

/// Shared, thread-safe view of a run's `TrainingStatus`.
#[derive(Debug, Clone, Default)]
pub struct StatusBoard(Arc<RwLock<TrainingStatus>>);

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> TrainingStatus {
        self.0.read().clone()
    }

    /// Marks a run as started unless one is already running.
    ///
    /// # Returns
    /// `false` if a run is in progress, the board is left untouched.
    pub fn try_start(&self, total_rounds: u32) -> bool {
        let mut status = self.0.write();
        if status.status == RunStatus::Running {
            return false;
        }

        *status = TrainingStatus {
            status: RunStatus::Running,
            total_rounds,
            ..Default::default()
        };
        true
    }

    /// Marks a run as started, discarding any previous progress.
    pub fn start(&self, total_rounds: u32) {
        let mut status = self.0.write();
        *status = TrainingStatus {
            status: RunStatus::Running,
            total_rounds,
            ..Default::default()
        };
    }

    /// Records a completed round and its accuracy, if it was evaluated.
    pub fn round_completed(&self, round: u32, accuracy: Option<f64>) {
        let mut status = self.0.write();
        status.current_round = round;
        if let Some(accuracy) = accuracy {
            status.history.push(HistoryItem { round, accuracy });
        }
    }

    pub fn finish(&self) {
        self.0.write().status = RunStatus::Finished;
    }

    pub fn fail(&self, msg: impl Into<String>) {
        let mut status = self.0.write();
        status.status = RunStatus::Failed;
        status.error_message = Some(msg.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_one_run_at_a_time() {
        let board = StatusBoard::new();
        assert_eq!(board.snapshot().status, RunStatus::Idle);

        assert!(board.try_start(3));
        assert!(!board.try_start(3));

        board.round_completed(1, Some(0.4));
        board.round_completed(2, None);
        board.fail("round 3 fit quorum failure");

        let status = board.snapshot();
        assert_eq!(status.status, RunStatus::Failed);
        assert_eq!(status.current_round, 2);
        assert_eq!(status.history, vec![HistoryItem { round: 1, accuracy: 0.4 }]);

        assert!(board.try_start(3));
        assert!(board.snapshot().history.is_empty());
    }

    #[test]
    fn serializes_like_the_dashboard_expects() {
        let status = TrainingStatus {
            status: RunStatus::Running,
            current_round: 1,
            total_rounds: 100,
            history: vec![HistoryItem {
                round: 1,
                accuracy: 0.5,
            }],
            error_message: None,
        };

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "status": "running",
                "current_round": 1,
                "total_rounds": 100,
                "history": [{"round": 1, "accuracy": 0.5}],
                "error_message": null
            })
        );
    }
}
