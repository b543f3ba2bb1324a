use std::sync::Arc;

use log::debug;

use super::{FailureReason, ParticipantFailure};
use crate::{
    data::{Dataset, Partition, Subset},
    model::{Metrics, Parameters, Trainer},
};

/// Round-specific instructions sent with every task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundConfig {
    pub round: u32,
    pub local_epochs: usize,
}

/// The outcome of a participant's local training.
#[derive(Debug, Clone)]
pub struct FitRes {
    pub parameters: Parameters,
    /// Local samples used, the aggregation weight.
    pub num_examples: u64,
    pub metrics: Metrics,
}

/// The outcome of a participant's local evaluation.
#[derive(Debug, Clone)]
pub struct EvaluateRes {
    pub loss: f64,
    pub num_examples: u64,
    pub metrics: Metrics,
}

/// The capabilities of a federation member.
pub trait Participant: Send {
    fn id(&self) -> usize;

    /// Trains the global parameters on local data.
    ///
    /// # Errors
    /// A `ParticipantFailure` tagged with this participant's id.
    fn fit(&mut self, parameters: &Parameters, config: &RoundConfig)
        -> Result<FitRes, ParticipantFailure>;

    /// Evaluates the global parameters on local data without updating them.
    ///
    /// # Errors
    /// A `ParticipantFailure` tagged with this participant's id.
    fn evaluate(
        &mut self,
        parameters: &Parameters,
        config: &RoundConfig,
    ) -> Result<EvaluateRes, ParticipantFailure>;
}

/// What a participant evaluates the global model on.
#[derive(Debug, Clone)]
pub enum EvalTarget {
    /// Its own partition.
    Local,
    /// A held-out set shared by every participant.
    Shared(Subset),
}

/// Everything a `ParticipantProxy` needs to bind to its data.
#[derive(Debug, Clone)]
pub struct ParticipantContext {
    pub dataset: Arc<Dataset>,
    pub partition: Arc<Partition>,
    pub eval_target: EvalTarget,
}

impl ParticipantContext {
    pub fn new(dataset: Arc<Dataset>, partition: Arc<Partition>, eval_target: EvalTarget) -> Self {
        Self {
            dataset,
            partition,
            eval_target,
        }
    }

    pub fn num_participants(&self) -> usize {
        self.partition.num_participants()
    }
}

/// A simulated participant holding one partition and a trainer.
pub struct ParticipantProxy<T: Trainer> {
    id: usize,
    train_data: Subset,
    eval_data: Subset,
    trainer: T,
    local: Parameters,
}

impl<T: Trainer> ParticipantProxy<T> {
    /// Creates a new `ParticipantProxy`.
    ///
    /// # Arguments
    /// * `id` - The participant's id, also the index of its partition.
    /// * `ctx` - The shared dataset, partition and evaluation target.
    /// * `trainer` - This participant's own trainer.
    ///
    /// # Panics
    /// If `id` isn't a participant of `ctx.partition`.
    pub fn new(id: usize, ctx: &ParticipantContext, trainer: T) -> Self {
        let train_data = ctx.partition.subset(id, Arc::clone(&ctx.dataset));
        let eval_data = match &ctx.eval_target {
            EvalTarget::Local => train_data.clone(),
            EvalTarget::Shared(subset) => subset.clone(),
        };

        Self {
            id,
            train_data,
            eval_data,
            trainer,
            local: Parameters::default(),
        }
    }

    /// The parameters this participant last loaded or trained.
    pub fn local_parameters(&self) -> &Parameters {
        &self.local
    }

    /// The number of samples this participant trains on.
    pub fn num_examples(&self) -> usize {
        self.train_data.len()
    }

    fn failure(&self, reason: FailureReason) -> ParticipantFailure {
        ParticipantFailure::new(self.id, reason)
    }
}

impl<T: Trainer> Participant for ParticipantProxy<T> {
    fn id(&self) -> usize {
        self.id
    }

    fn fit(
        &mut self,
        parameters: &Parameters,
        config: &RoundConfig,
    ) -> Result<FitRes, ParticipantFailure> {
        self.local = parameters.clone();

        let metrics = self
            .trainer
            .train(&mut self.local, &self.train_data, config.local_epochs)
            .map_err(|e| self.failure(FailureReason::Trainer(e)))?;

        debug!(
            "participant {} trained round {} on {} samples",
            self.id,
            config.round,
            self.train_data.len()
        );

        Ok(FitRes {
            parameters: self.local.clone(),
            num_examples: self.train_data.len() as u64,
            metrics,
        })
    }

    fn evaluate(
        &mut self,
        parameters: &Parameters,
        config: &RoundConfig,
    ) -> Result<EvaluateRes, ParticipantFailure> {
        self.local = parameters.clone();

        let eval = self
            .trainer
            .evaluate(&self.local, &self.eval_data)
            .map_err(|e| self.failure(FailureReason::Trainer(e)))?;

        debug!(
            "participant {} evaluated round {}: loss={:.4} accuracy={:.4}",
            self.id, config.round, eval.loss, eval.accuracy
        );

        Ok(EvaluateRes {
            loss: eval.loss,
            num_examples: self.eval_data.len() as u64,
            metrics: Metrics::from([("accuracy".to_string(), eval.accuracy)]),
        })
    }
}

#[cfg(test)]
mod tests {
    use ndarray::arr1;
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;
    use crate::{
        data::partition,
        model::{Evaluation, TrainError},
    };

    /// Adds one to every parameter per epoch, fails when asked to.
    struct Bump {
        fail: bool,
    }

    impl Trainer for Bump {
        fn train(
            &mut self,
            params: &mut Parameters,
            _data: &Subset,
            epochs: usize,
        ) -> crate::model::Result<Metrics> {
            if self.fail {
                return Err(TrainError::InvalidInput("boom".into()));
            }
            let bumped = params
                .tensors()
                .iter()
                .map(|t| t.mapv(|v| v + epochs as f32))
                .collect();
            *params = Parameters::new(bumped);
            Ok(Metrics::new())
        }

        fn evaluate(
            &mut self,
            _params: &Parameters,
            data: &Subset,
        ) -> crate::model::Result<Evaluation> {
            Ok(Evaluation {
                loss: 1.0,
                accuracy: data.len() as f64 / 100.0,
            })
        }
    }

    fn context(eval_target: EvalTarget) -> ParticipantContext {
        let labels: Vec<usize> = (0..40).map(|i| i % 4).collect();
        let dataset = Arc::new(Dataset::new(vec![0.0; 40], 1, labels, 4).unwrap());
        let part = partition(&dataset, 4, 2, &mut StdRng::seed_from_u64(0)).unwrap();
        ParticipantContext::new(dataset, Arc::new(part), eval_target)
    }

    fn config() -> RoundConfig {
        RoundConfig {
            round: 1,
            local_epochs: 2,
        }
    }

    #[test]
    fn fit_returns_partition_size_and_new_parameters() {
        let ctx = context(EvalTarget::Local);
        let mut proxy = ParticipantProxy::new(2, &ctx, Bump { fail: false });
        let global = Parameters::new(vec![arr1(&[1.0, 2.0]).into_dyn()]);

        let res = proxy.fit(&global, &config()).unwrap();

        assert_eq!(res.num_examples, 10);
        assert_eq!(res.parameters.tensors()[0], arr1(&[3.0, 4.0]).into_dyn());
        assert_eq!(proxy.local_parameters(), &res.parameters);
    }

    #[test]
    fn evaluate_reports_accuracy_on_target() {
        let ctx = context(EvalTarget::Local);
        let shared = Subset::full(Arc::clone(&ctx.dataset));
        let global = Parameters::default();

        let mut local = ParticipantProxy::new(0, &ctx, Bump { fail: false });
        let res = local.evaluate(&global, &config()).unwrap();
        assert_eq!(res.num_examples, 10);
        assert_eq!(res.metrics["accuracy"], 0.1);

        let ctx = ParticipantContext {
            eval_target: EvalTarget::Shared(shared),
            ..ctx
        };
        let mut central = ParticipantProxy::new(0, &ctx, Bump { fail: false });
        let res = central.evaluate(&global, &config()).unwrap();
        assert_eq!(res.num_examples, 40);
    }

    #[test]
    fn trainer_errors_are_tagged_with_the_id() {
        let ctx = context(EvalTarget::Local);
        let mut proxy = ParticipantProxy::new(3, &ctx, Bump { fail: true });

        let err = proxy.fit(&Parameters::default(), &config()).unwrap_err();
        assert_eq!(err.participant_id, 3);
        assert!(matches!(err.reason, FailureReason::Trainer(_)));
        assert!(err.to_string().contains("boom"));
    }
}
