use std::{error::Error, fmt, sync::Arc};

use log::info;
use rand::{rngs::StdRng, SeedableRng};
use tokio::task;
use tokio_util::sync::CancellationToken;

use crate::{
    config::{ConfigError, EvaluateOn, SimulationConfig},
    data::{partition, DataError, Dataset, Subset},
    model::SoftmaxRegression,
    orchestra::{
        EvalTarget, History, OrchestraError, Orchestrator, OrchestratorBuilder, ParticipantContext,
        ParticipantProxy, ResourceScheduler, StatusBoard,
    },
};

/// The participant type every simulation runs.
pub type SimParticipant = ParticipantProxy<SoftmaxRegression>;

/// Errors that stop a simulation.
#[derive(Debug)]
pub enum SimulationError {
    Config(ConfigError),
    Data(DataError),
    Orchestra(OrchestraError),
    /// The setup task died before handing back an orchestrator.
    Setup(String),
}

impl fmt::Display for SimulationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => write!(f, "{e}"),
            Self::Data(e) => write!(f, "dataset error: {e}"),
            Self::Orchestra(e) => write!(f, "{e}"),
            Self::Setup(msg) => write!(f, "setup failed: {msg}"),
        }
    }
}

impl Error for SimulationError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Config(e) => Some(e),
            Self::Data(e) => Some(e),
            Self::Orchestra(e) => Some(e),
            Self::Setup(_) => None,
        }
    }
}

impl From<ConfigError> for SimulationError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<DataError> for SimulationError {
    fn from(e: DataError) -> Self {
        Self::Data(e)
    }
}

impl From<OrchestraError> for SimulationError {
    fn from(e: OrchestraError) -> Self {
        Self::Orchestra(e)
    }
}

/// A configured simulation, ready to run.
pub struct Simulation {
    config: SimulationConfig,
    status: Option<StatusBoard>,
    cancel: CancellationToken,
}

impl Simulation {
    /// Creates a new `Simulation`.
    ///
    /// # Errors
    /// If `config` fails validation.
    pub fn new(config: SimulationConfig) -> Result<Self, SimulationError> {
        config.validate()?;
        Ok(Self {
            config,
            status: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Publishes progress on `status`.
    pub fn with_status(mut self, status: StatusBoard) -> Self {
        self.status = Some(status);
        self
    }

    /// Stops the run once `token` is cancelled.
    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// Loads the data, partitions it and builds the orchestrator.
    ///
    /// # Errors
    /// If the data can't be loaded or partitioned, or the orchestrator rejects the
    /// configuration.
    pub fn prepare(&self) -> Result<Orchestrator<SimParticipant>, SimulationError> {
        let config = &self.config;
        let (train, test) = config.provider().load()?;

        if train.num_classes() != config.num_classes {
            return Err(DataError::Configuration(format!(
                "dataset has {} classes, config expects {}",
                train.num_classes(),
                config.num_classes
            ))
            .into());
        }

        let feature_dim = train.feature_dim();
        let ctx = self.context(train, test)?;
        let participants: Vec<_> = (0..ctx.num_participants())
            .map(|id| ParticipantProxy::new(id, &ctx, self.trainer(feature_dim, id)))
            .collect();
        let initial = self.trainer(feature_dim, 0).init_parameters();

        let scheduler =
            ResourceScheduler::new(config.capacity()).map_err(OrchestraError::from)?;
        info!(
            "scheduling {} participants on {}, {} each",
            participants.len(),
            scheduler.capacity(),
            config.client_resources
        );

        let mut builder = OrchestratorBuilder::new(config.strategy.clone(), scheduler)
            .client_resources(config.client_resources)
            .local_epochs(config.local_epochs)
            .seed(config.seed)
            .cancel_token(self.cancel.clone());
        if let Some(timeout) = config.round_timeout() {
            builder = builder.round_timeout(timeout);
        }
        if let Some(status) = &self.status {
            builder = builder.status(status.clone());
        }

        Ok(builder.build(participants, initial)?)
    }

    /// Runs every round of the simulation.
    ///
    /// Setup reads or generates the whole dataset, so it runs on the blocking pool.
    ///
    /// # Returns
    /// The history of the completed run.
    ///
    /// # Errors
    /// Any setup error, or the round error that aborted the run.
    pub async fn run(self) -> Result<History, SimulationError> {
        let status = self.status.clone();
        let prepared = task::spawn_blocking(move || self.prepare())
            .await
            .unwrap_or_else(|e| Err(SimulationError::Setup(e.to_string())));

        let mut orchestrator = match prepared {
            Ok(orchestrator) => orchestrator,
            Err(e) => {
                if let Some(status) = &status {
                    status.fail(e.to_string());
                }
                return Err(e);
            }
        };

        let history = orchestrator.run().await?;
        Ok(history.clone())
    }

    fn context(&self, train: Dataset, test: Dataset) -> Result<ParticipantContext, DataError> {
        let config = &self.config;
        let mut rng = StdRng::seed_from_u64(config.seed);
        let partition = partition(
            &train,
            config.num_clients,
            config.shards_per_label,
            &mut rng,
        )?;

        for id in 0..partition.num_participants() {
            info!(
                "participant {id}: {} samples, label counts {:?}",
                partition.len_of(id),
                partition.label_counts(id)
            );
        }

        let eval_target = match config.evaluate_on {
            EvaluateOn::Local => EvalTarget::Local,
            EvaluateOn::Test => EvalTarget::Shared(Subset::full(Arc::new(test))),
        };

        Ok(ParticipantContext::new(
            Arc::new(train),
            Arc::new(partition),
            eval_target,
        ))
    }

    fn trainer(&self, feature_dim: usize, id: usize) -> SoftmaxRegression {
        let config = &self.config;
        SoftmaxRegression::new(
            feature_dim,
            config.num_classes,
            config.lr,
            config.momentum,
            config.batch_size,
            config.seed.wrapping_add(id as u64 + 1),
        )
    }
}

/// Shorthand for `Simulation::new(config)?.run()`.
///
/// # Errors
/// Same as `Simulation::run`.
pub async fn simulate(config: SimulationConfig) -> Result<History, SimulationError> {
    Simulation::new(config)?.run().await
}

#[cfg(test)]
mod tests {
    use crate::{
        config::DatasetConfig,
        orchestra::{RunStatus, StatusBoard},
    };

    use super::*;

    #[tokio::test]
    async fn missing_dataset_fails_the_run() {
        let config = SimulationConfig {
            dataset: DatasetConfig::Csv {
                train: "/nonexistent/train.csv".into(),
                test: "/nonexistent/test.csv".into(),
            },
            ..Default::default()
        };
        let status = StatusBoard::new();
        status.start(config.strategy.num_rounds);

        let err = Simulation::new(config)
            .unwrap()
            .with_status(status.clone())
            .run()
            .await
            .unwrap_err();

        assert!(matches!(err, SimulationError::Data(_)));
        let snapshot = status.snapshot();
        assert_eq!(snapshot.status, RunStatus::Failed);
        assert!(snapshot.error_message.is_some());
    }
}
