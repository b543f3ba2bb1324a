//! The compute host: runs simulations in the background and reports their progress.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use log::{error, info};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{
    config::SimulationConfig,
    orchestra::{StatusBoard, TrainingStatus},
    simulation::Simulation,
};

/// Body of a successful `/start-training`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartResponse {
    pub message: String,
    pub total_rounds: u32,
}

/// Body of every error response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detail {
    pub detail: String,
}

type ApiError = (StatusCode, Json<Detail>);

fn api_error(status: StatusCode, detail: impl Into<String>) -> ApiError {
    (
        status,
        Json(Detail {
            detail: detail.into(),
        }),
    )
}

/// State shared by the compute host's handlers.
#[derive(Clone)]
pub struct ComputeState {
    config: Arc<SimulationConfig>,
    status: StatusBoard,
    shutdown: CancellationToken,
}

impl ComputeState {
    /// Creates a new `ComputeState`.
    ///
    /// # Arguments
    /// * `config` - The configuration of every simulation started on this host.
    /// * `shutdown` - Cancels the running simulation, if any, once triggered.
    pub fn new(config: SimulationConfig, shutdown: CancellationToken) -> Self {
        Self {
            config: Arc::new(config),
            status: StatusBoard::new(),
            shutdown,
        }
    }

    pub fn status(&self) -> &StatusBoard {
        &self.status
    }
}

/// The compute host's routes.
pub fn router(state: ComputeState) -> Router {
    Router::new()
        .route("/start-training", post(start_training))
        .route("/get-status", get(get_status))
        .with_state(state)
}

async fn start_training(
    State(state): State<ComputeState>,
) -> Result<Json<StartResponse>, ApiError> {
    let total_rounds = state.config.strategy.num_rounds;
    if !state.status.try_start(total_rounds) {
        return Err(api_error(StatusCode::CONFLICT, "Training is already running"));
    }

    let simulation = match Simulation::new((*state.config).clone()) {
        Ok(simulation) => simulation
            .with_status(state.status.clone())
            .with_cancel_token(state.shutdown.child_token()),
        Err(e) => {
            state.status.fail(e.to_string());
            return Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()));
        }
    };

    tokio::spawn(async move {
        match simulation.run().await {
            Ok(history) => info!("simulation finished after {} rounds", history.len()),
            Err(e) => error!("simulation failed: {e}"),
        }
    });

    info!("started a {total_rounds} round simulation");
    Ok(Json(StartResponse {
        message: "Training started".into(),
        total_rounds,
    }))
}

async fn get_status(State(state): State<ComputeState>) -> Json<TrainingStatus> {
    Json(state.status.snapshot())
}

#[cfg(test)]
mod tests {
    use axum::{
        body::{to_bytes, Body},
        http::Request,
    };
    use tower::ServiceExt;

    use super::*;
    use crate::{config::DatasetConfig, orchestra::RunStatus, orchestra::StrategyConfig};

    fn tiny_config() -> SimulationConfig {
        SimulationConfig {
            num_clients: 2,
            num_classes: 2,
            shards_per_label: 1,
            strategy: StrategyConfig {
                fraction_fit: 1.0,
                fraction_evaluate: 1.0,
                min_fit_clients: 2,
                min_evaluate_clients: 2,
                min_available_clients: 2,
                num_rounds: 2,
            },
            dataset: DatasetConfig::Synthetic {
                feature_dim: 2,
                train_per_class: 10,
                test_per_class: 5,
                spread: 0.1,
            },
            client_resources: crate::orchestra::Resources::cpus(1.0),
            lr: 0.1,
            ..Default::default()
        }
    }

    async fn call(app: Router, method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn status_starts_idle() {
        let app = router(ComputeState::new(tiny_config(), CancellationToken::new()));

        let (status, body) = call(app, "GET", "/get-status").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "idle");
        assert_eq!(body["history"], serde_json::json!([]));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn second_start_conflicts_while_running() {
        let state = ComputeState::new(tiny_config(), CancellationToken::new());
        state.status().start(2);
        let app = router(state);

        let (status, body) = call(app, "POST", "/start-training").await;

        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["detail"].as_str().unwrap().contains("already running"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn started_run_finishes() {
        let state = ComputeState::new(tiny_config(), CancellationToken::new());
        let app = router(state.clone());

        let (status, body) = call(app, "POST", "/start-training").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total_rounds"], 2);

        let mut snapshot = state.status().snapshot();
        for _ in 0..200 {
            if snapshot.status != RunStatus::Running {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
            snapshot = state.status().snapshot();
        }

        assert_eq!(snapshot.status, RunStatus::Finished, "{snapshot:?}");
        assert_eq!(snapshot.current_round, 2);
        assert_eq!(snapshot.history.len(), 2);
    }
}
