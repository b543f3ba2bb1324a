use std::{sync::Arc, time::Duration};

use futures::future;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use rand::{rngs::StdRng, SeedableRng};
use tokio::{task, time::Instant};
use tokio_util::sync::CancellationToken;

use super::{
    EvaluateRes, FailureReason, FedAvg, FitRes, History, OrchestraError, Participant,
    ParticipantFailure, ResourceScheduler, Resources, Result, RoundConfig, RoundRecord,
    StatusBoard, StrategyConfig,
};
use crate::model::{Metrics, Parameters};

type Outcome<R> = std::result::Result<R, ParticipantFailure>;

/// Where the orchestrator is within a round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RoundState {
    #[default]
    Idle,
    SelectingFit,
    Fitting,
    AggregatingFit,
    SelectingEval,
    Evaluating,
    AggregatingEval,
    RoundComplete,
    Finished,
    Failed,
}

/// Configures and validates an `Orchestrator`.
pub struct OrchestratorBuilder {
    strategy: StrategyConfig,
    scheduler: Arc<ResourceScheduler>,
    client_resources: Resources,
    local_epochs: usize,
    round_timeout: Option<Duration>,
    seed: Option<u64>,
    status: Option<StatusBoard>,
    cancel: CancellationToken,
}

impl OrchestratorBuilder {
    /// Creates a new `OrchestratorBuilder`.
    ///
    /// # Arguments
    /// * `strategy` - Sampling, quorum and round count of the run.
    /// * `scheduler` - The pool every participant task is admitted against.
    pub fn new(strategy: StrategyConfig, scheduler: Arc<ResourceScheduler>) -> Self {
        Self {
            strategy,
            scheduler,
            client_resources: Resources::cpus(1.0),
            local_epochs: 1,
            round_timeout: None,
            seed: None,
            status: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Resources requested by every single `fit` or `evaluate` task.
    pub fn client_resources(mut self, resources: Resources) -> Self {
        self.client_resources = resources;
        self
    }

    pub fn local_epochs(mut self, epochs: usize) -> Self {
        self.local_epochs = epochs;
        self
    }

    /// Tasks still outstanding this long after a phase starts count as failures.
    pub fn round_timeout(mut self, timeout: Duration) -> Self {
        self.round_timeout = Some(timeout);
        self
    }

    /// Seeds participant sampling, so runs are reproducible.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Publishes the run's progress on `status`.
    pub fn status(mut self, status: StatusBoard) -> Self {
        self.status = Some(status);
        self
    }

    /// Stops the run once `token` is cancelled.
    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Builds the `Orchestrator`.
    ///
    /// # Arguments
    /// * `participants` - Every member of the federation, the i-th one with id `i`.
    /// * `initial` - The global parameters before the first round.
    ///
    /// # Errors
    /// `Configuration` if the strategy is invalid, the client resources can never be
    /// admitted, `local_epochs` is zero or the participant ids aren't `0..n`.
    pub fn build<P>(self, participants: Vec<P>, initial: Parameters) -> Result<Orchestrator<P>>
    where
        P: Participant + 'static,
    {
        let strategy = FedAvg::new(self.strategy)?;
        self.scheduler.check(self.client_resources)?;

        if self.local_epochs == 0 {
            return Err(OrchestraError::Configuration(
                "local_epochs must be greater than zero".into(),
            ));
        }

        if let Some((i, p)) = participants
            .iter()
            .enumerate()
            .find(|(i, p)| p.id() != *i)
        {
            return Err(OrchestraError::Configuration(format!(
                "participant at position {i} has id {}",
                p.id()
            )));
        }

        let rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        Ok(Orchestrator {
            participants: participants
                .into_iter()
                .map(|p| Arc::new(Mutex::new(p)))
                .collect(),
            strategy,
            scheduler: self.scheduler,
            client_resources: self.client_resources,
            local_epochs: self.local_epochs,
            round_timeout: self.round_timeout,
            parameters: Arc::new(initial),
            history: History::new(),
            state: RoundState::Idle,
            rng,
            status: self.status,
            cancel: self.cancel,
        })
    }
}

/// Drives the synchronous rounds of a federated run.
///
/// Every round samples participants, runs their `fit` tasks concurrently under the
/// resource scheduler, waits for all of them, then averages the survivors into the
/// new global parameters. Evaluation follows the same pattern.
pub struct Orchestrator<P: Participant> {
    participants: Vec<Arc<Mutex<P>>>,
    strategy: FedAvg,
    scheduler: Arc<ResourceScheduler>,
    client_resources: Resources,
    local_epochs: usize,
    round_timeout: Option<Duration>,
    parameters: Arc<Parameters>,
    history: History,
    state: RoundState,
    rng: StdRng,
    status: Option<StatusBoard>,
    cancel: CancellationToken,
}

impl<P: Participant + 'static> Orchestrator<P> {
    /// The current global parameters.
    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn state(&self) -> RoundState {
        self.state
    }

    pub fn num_participants(&self) -> usize {
        self.participants.len()
    }

    /// A token that cancels this run.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs `f` on the participant with the given id.
    pub fn with_participant<T>(&self, id: usize, f: impl FnOnce(&P) -> T) -> Option<T> {
        self.participants.get(id).map(|p| f(&*p.lock()))
    }

    /// Runs every configured round in order.
    ///
    /// # Returns
    /// The history of all rounds.
    ///
    /// # Errors
    /// The first round error, which aborts the run and leaves it `Failed`.
    pub async fn run(&mut self) -> Result<&History> {
        let num_rounds = self.strategy.config().num_rounds;
        if let Some(status) = &self.status {
            status.start(num_rounds);
        }

        info!(
            "starting a {num_rounds} round run over {} participants",
            self.participants.len()
        );

        for round in 1..=num_rounds {
            if let Err(e) = self.run_round(round).await {
                error!("run aborted: {e}");
                if let Some(status) = &self.status {
                    status.fail(e.to_string());
                }
                return Err(e);
            }
        }

        self.state = RoundState::Finished;
        if let Some(status) = &self.status {
            status.finish();
        }

        match self.history.last().and_then(|r| r.metrics.get("accuracy")) {
            Some(accuracy) => info!("run finished, final accuracy {accuracy:.4}"),
            None => info!("run finished"),
        }
        Ok(&self.history)
    }

    /// Runs a single round: fit, aggregate, then optionally evaluate.
    ///
    /// A failed round leaves the global parameters untouched, so it may be retried.
    ///
    /// # Errors
    /// `InsufficientParticipants` or `RoundQuorum` if a phase can't go ahead,
    /// `Cancelled` if the run was cancelled and `Configuration` if `round` isn't
    /// after the last completed one.
    pub async fn run_round(&mut self, round: u32) -> Result<RoundRecord> {
        match self.play_round(round).await {
            Ok(record) => Ok(record),
            Err(e) => {
                self.state = RoundState::Failed;
                warn!("round {round} failed: {e}");
                Err(e)
            }
        }
    }

    async fn play_round(&mut self, round: u32) -> Result<RoundRecord> {
        if let Some(last) = self.history.last().filter(|last| last.round >= round) {
            return Err(OrchestraError::Configuration(format!(
                "round {round} doesn't follow completed round {}",
                last.round
            )));
        }
        self.check_cancelled(round)?;

        let config = RoundConfig {
            round,
            local_epochs: self.local_epochs,
        };

        self.state = RoundState::SelectingFit;
        let selected = self
            .strategy
            .configure_fit(self.participants.len(), &mut self.rng)?;

        self.state = RoundState::Fitting;
        debug!("round {round}: fitting on {} participants", selected.len());
        let (fitted, mut fit_failures) = self
            .dispatch(&selected, &self.parameters, config, P::fit)
            .await;
        self.check_cancelled(round)?;

        let expected = self.parameters.layout();
        let mut results: Vec<FitRes> = Vec::with_capacity(fitted.len());
        for (id, res) in fitted {
            if res.parameters.same_layout(&self.parameters) {
                results.push(res);
            } else {
                let reason = FailureReason::LayoutMismatch {
                    got: res.parameters.layout(),
                    expected: expected.clone(),
                };
                fit_failures.push(ParticipantFailure::new(id, reason));
            }
        }
        log_failures(round, &fit_failures);

        self.state = RoundState::AggregatingFit;
        let (parameters, fit_metrics) = self.strategy.aggregate_fit(round, &results)?;
        // Committed only once the whole round has succeeded.
        let parameters = Arc::new(parameters);

        let (loss, metrics, evaluate_failures) = if self.strategy.evaluates() {
            self.state = RoundState::SelectingEval;
            let selected = self
                .strategy
                .configure_evaluate(self.participants.len(), &mut self.rng)?;

            self.state = RoundState::Evaluating;
            let (evaluated, failures) = self
                .dispatch(&selected, &parameters, config, P::evaluate)
                .await;
            self.check_cancelled(round)?;
            log_failures(round, &failures);

            self.state = RoundState::AggregatingEval;
            let results: Vec<EvaluateRes> = evaluated.into_iter().map(|(_, r)| r).collect();
            let (loss, metrics) = self.strategy.aggregate_evaluate(round, &results)?;
            (Some(loss), metrics, failures.len())
        } else {
            (None, Metrics::new(), 0)
        };

        let accuracy = metrics.get("accuracy").copied();
        match (loss, accuracy) {
            (Some(loss), Some(accuracy)) => {
                info!("round {round}: loss {loss:.4}, accuracy {accuracy:.4}")
            }
            (Some(loss), None) => info!("round {round}: loss {loss:.4}"),
            _ => info!("round {round}: aggregated {} fit results", results.len()),
        }

        self.parameters = parameters;
        let record = RoundRecord {
            round,
            fit_metrics,
            fit_failures: fit_failures.len(),
            loss,
            metrics,
            evaluate_failures,
        };
        self.history.push(record.clone());
        self.state = RoundState::RoundComplete;

        if let Some(status) = &self.status {
            status.round_completed(round, accuracy);
        }
        Ok(record)
    }

    fn check_cancelled(&self, round: u32) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(OrchestraError::Cancelled { round });
        }
        Ok(())
    }

    /// Runs `work` with `parameters` on every selected participant and waits for all
    /// of them.
    ///
    /// Each task is admitted by the scheduler first and holds its lease until the
    /// blocking work returns.
    ///
    /// # Returns
    /// The successful results tagged with their participant id, and the failures.
    async fn dispatch<R, F>(
        &self,
        ids: &[usize],
        parameters: &Arc<Parameters>,
        config: RoundConfig,
        work: F,
    ) -> (Vec<(usize, R)>, Vec<ParticipantFailure>)
    where
        R: Send + 'static,
        F: Fn(&mut P, &Parameters, &RoundConfig) -> Outcome<R> + Copy + Send + 'static,
    {
        let deadline = self.round_timeout.map(|timeout| Instant::now() + timeout);

        let tasks = ids.iter().map(|&id| {
            let participant = Arc::clone(&self.participants[id]);
            let scheduler = Arc::clone(&self.scheduler);
            let parameters = Arc::clone(parameters);
            let resources = self.client_resources;
            let cancel = self.cancel.clone();

            tokio::spawn(async move {
                let run = async move {
                    let lease = match scheduler.admit(resources).await {
                        Ok(lease) => lease,
                        Err(e) => {
                            return Err(ParticipantFailure::new(id, FailureReason::Admission(e)))
                        }
                    };

                    let blocking = task::spawn_blocking(move || {
                        let _lease = lease;
                        let mut participant = participant.lock();
                        work(&mut *participant, &*parameters, &config)
                    });

                    match blocking.await {
                        Ok(outcome) => outcome,
                        Err(e) => Err(ParticipantFailure::new(
                            id,
                            FailureReason::Panicked(e.to_string()),
                        )),
                    }
                };

                tokio::select! {
                    outcome = run => outcome,
                    _ = cancel.cancelled() => {
                        Err(ParticipantFailure::new(id, FailureReason::Cancelled))
                    }
                    _ = expire(deadline) => {
                        Err(ParticipantFailure::new(id, FailureReason::Cancelled))
                    }
                }
            })
        });

        let joined = future::join_all(tasks).await;

        let mut results = Vec::with_capacity(ids.len());
        let mut failures = Vec::new();
        for (&id, outcome) in ids.iter().zip(joined) {
            match outcome {
                Ok(Ok(res)) => results.push((id, res)),
                Ok(Err(failure)) => failures.push(failure),
                Err(e) => failures.push(ParticipantFailure::new(
                    id,
                    FailureReason::Panicked(e.to_string()),
                )),
            }
        }
        (results, failures)
    }
}

async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}

fn log_failures(round: u32, failures: &[ParticipantFailure]) {
    for failure in failures {
        warn!("round {round}: {failure}");
    }
}
