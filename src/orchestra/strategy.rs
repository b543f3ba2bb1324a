use log::debug;
use ndarray::{ArrayD, Zip};
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::{
    participant::{EvaluateRes, FitRes},
    OrchestraError, Phase, QuorumShortfall, Result,
};
use crate::model::{Metrics, Parameters};

/// Sampling ratios, quorum floors and round count of a federated run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    pub fraction_fit: f64,
    pub fraction_evaluate: f64,
    pub min_fit_clients: usize,
    pub min_evaluate_clients: usize,
    pub min_available_clients: usize,
    pub num_rounds: u32,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            fraction_fit: 0.5,
            fraction_evaluate: 0.5,
            min_fit_clients: 5,
            min_evaluate_clients: 5,
            min_available_clients: 10,
            num_rounds: 100,
        }
    }
}

impl StrategyConfig {
    /// # Errors
    /// `Configuration` if a fraction is outside `[0, 1]`, `num_rounds` is zero or
    /// `min_fit_clients` is zero.
    pub fn validate(&self) -> Result<()> {
        for (name, fraction) in [
            ("fraction_fit", self.fraction_fit),
            ("fraction_evaluate", self.fraction_evaluate),
        ] {
            if !(0.0..=1.0).contains(&fraction) {
                return Err(OrchestraError::Configuration(format!(
                    "{name} must be in [0, 1], got {fraction}"
                )));
            }
        }

        if self.num_rounds == 0 {
            return Err(OrchestraError::Configuration(
                "num_rounds must be greater than zero".into(),
            ));
        }

        if self.min_fit_clients == 0 {
            return Err(OrchestraError::Configuration(
                "min_fit_clients must be greater than zero".into(),
            ));
        }

        Ok(())
    }
}

/// `max(min_clients, ceil(fraction * available))`.
///
/// Products within `1e-9` of an integer count as that integer, so `0.07 * 100`
/// asks for 7 participants and not 8.
pub fn sample_size(fraction: f64, min_clients: usize, available: usize) -> usize {
    let wanted = (fraction * available as f64 - 1e-9).ceil().max(0.0) as usize;
    wanted.max(min_clients)
}

/// Federated averaging: uniform sampling and example-count weighted aggregation.
#[derive(Debug, Clone)]
pub struct FedAvg {
    config: StrategyConfig,
}

impl FedAvg {
    /// # Errors
    /// Whatever `StrategyConfig::validate` rejects.
    pub fn new(config: StrategyConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &StrategyConfig {
        &self.config
    }

    /// Whether the evaluation phase runs at all.
    pub fn evaluates(&self) -> bool {
        self.config.fraction_evaluate > 0.0
    }

    /// Picks the participants of a round's fit phase.
    ///
    /// # Returns
    /// The sorted ids of `max(min_fit_clients, ceil(fraction_fit * available))`
    /// distinct participants drawn uniformly from `0..available`.
    ///
    /// # Errors
    /// `InsufficientParticipants` if `available` is below `min_available_clients` or
    /// below the sample size.
    pub fn configure_fit<R: Rng + ?Sized>(
        &self,
        available: usize,
        rng: &mut R,
    ) -> Result<Vec<usize>> {
        let k = sample_size(
            self.config.fraction_fit,
            self.config.min_fit_clients,
            available,
        );
        self.select(available, k, rng)
    }

    /// Picks the participants of a round's evaluation phase, none if evaluation is off.
    ///
    /// # Errors
    /// Same as `configure_fit`.
    pub fn configure_evaluate<R: Rng + ?Sized>(
        &self,
        available: usize,
        rng: &mut R,
    ) -> Result<Vec<usize>> {
        if !self.evaluates() {
            return Ok(Vec::new());
        }

        let k = sample_size(
            self.config.fraction_evaluate,
            self.config.min_evaluate_clients,
            available,
        );
        self.select(available, k, rng)
    }

    fn select<R: Rng + ?Sized>(
        &self,
        available: usize,
        k: usize,
        rng: &mut R,
    ) -> Result<Vec<usize>> {
        let required = self.config.min_available_clients.max(k);
        if available < required {
            return Err(OrchestraError::InsufficientParticipants {
                available,
                required,
            });
        }

        let mut selected = rand::seq::index::sample(rng, available, k).into_vec();
        selected.sort_unstable();
        debug!("sampled {k} of {available} participants: {selected:?}");
        Ok(selected)
    }

    /// Averages the surviving fit results into new global parameters.
    ///
    /// # Returns
    /// The new parameters and the weighted average of every fit metric.
    ///
    /// # Errors
    /// `RoundQuorum` if fewer than `min_fit_clients` results survived or they carry no
    /// examples at all.
    pub fn aggregate_fit(&self, round: u32, results: &[FitRes]) -> Result<(Parameters, Metrics)> {
        self.check_quorum(round, Phase::Fit, results.len(), self.config.min_fit_clients)?;

        let weighted: Vec<_> = results
            .iter()
            .map(|r| (&r.parameters, r.num_examples))
            .collect();
        let parameters = weighted_average(&weighted).ok_or(OrchestraError::RoundQuorum {
            round,
            phase: Phase::Fit,
            shortfall: QuorumShortfall::ZeroWeight,
        })?;

        let metrics: Vec<_> = results.iter().map(|r| (r.num_examples, &r.metrics)).collect();
        Ok((parameters, weighted_metrics(&metrics)))
    }

    /// Averages the surviving evaluation results.
    ///
    /// # Returns
    /// The weighted distributed loss and the weighted average of every metric.
    ///
    /// # Errors
    /// `RoundQuorum` if fewer than `min_evaluate_clients` results survived or they carry
    /// no examples at all.
    pub fn aggregate_evaluate(
        &self,
        round: u32,
        results: &[EvaluateRes],
    ) -> Result<(f64, Metrics)> {
        self.check_quorum(
            round,
            Phase::Evaluate,
            results.len(),
            self.config.min_evaluate_clients,
        )?;

        let loss = weighted_mean(results.iter().map(|r| (r.num_examples, r.loss))).ok_or(
            OrchestraError::RoundQuorum {
                round,
                phase: Phase::Evaluate,
                shortfall: QuorumShortfall::ZeroWeight,
            },
        )?;

        let metrics: Vec<_> = results.iter().map(|r| (r.num_examples, &r.metrics)).collect();
        Ok((loss, weighted_metrics(&metrics)))
    }

    fn check_quorum(&self, round: u32, phase: Phase, got: usize, required: usize) -> Result<()> {
        if got < required {
            return Err(OrchestraError::RoundQuorum {
                round,
                phase,
                shortfall: QuorumShortfall::TooFewResults { got, required },
            });
        }
        Ok(())
    }
}

/// Element-wise, example-count weighted average of parameter sets.
///
/// Accumulates in `f64` and rounds back to `f32` once per element.
///
/// # Returns
/// `None` if `results` is empty or the total weight is zero.
///
/// # Panics
/// If the parameter sets don't share the same layout.
pub fn weighted_average(results: &[(&Parameters, u64)]) -> Option<Parameters> {
    let total: u64 = results.iter().map(|(_, n)| n).sum();
    let (first, _) = results.first()?;
    if total == 0 {
        return None;
    }

    assert!(
        results.iter().all(|(p, _)| p.same_layout(first)),
        "parameter layouts differ"
    );

    let mut acc: Vec<ArrayD<f64>> = first
        .tensors()
        .iter()
        .map(|t| ArrayD::zeros(t.raw_dim()))
        .collect();

    for (params, n) in results {
        let weight = *n as f64;
        for (sum, tensor) in acc.iter_mut().zip(params.tensors()) {
            Zip::from(sum)
                .and(tensor)
                .for_each(|s, &x| *s += weight * x as f64);
        }
    }

    let total = total as f64;
    Some(Parameters::new(
        acc.into_iter()
            .map(|sum| sum.mapv(|s| (s / total) as f32))
            .collect(),
    ))
}

/// `Σ nᵢ·xᵢ / Σ nᵢ`, or `None` when the total weight is zero.
pub fn weighted_mean(values: impl IntoIterator<Item = (u64, f64)>) -> Option<f64> {
    let (weighted, total) = values
        .into_iter()
        .fold((0.0, 0u64), |(acc, total), (n, x)| {
            (acc + n as f64 * x, total + n)
        });

    (total > 0).then(|| weighted / total as f64)
}

/// Weighted average of every metric, each over the results that report it.
///
/// Metrics whose reporters carry zero examples are left out.
pub fn weighted_metrics(results: &[(u64, &Metrics)]) -> Metrics {
    let mut names: Vec<&String> = results.iter().flat_map(|(_, m)| m.keys()).collect();
    names.sort_unstable();
    names.dedup();

    names
        .into_iter()
        .filter_map(|name| {
            let values = results
                .iter()
                .filter_map(|(n, m)| m.get(name).map(|&v| (*n, v)));
            weighted_mean(values).map(|v| (name.clone(), v))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use ndarray::{arr1, arr2};
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    fn fedavg(min_fit: usize, min_available: usize) -> FedAvg {
        FedAvg::new(StrategyConfig {
            fraction_fit: 0.5,
            fraction_evaluate: 0.5,
            min_fit_clients: min_fit,
            min_evaluate_clients: min_fit,
            min_available_clients: min_available,
            num_rounds: 1,
        })
        .unwrap()
    }

    fn metrics(pairs: &[(&str, f64)]) -> Metrics {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn sample_size_respects_floor_and_fraction() {
        assert_eq!(sample_size(0.5, 5, 10), 5);
        assert_eq!(sample_size(0.5, 2, 9), 5);
        assert_eq!(sample_size(0.1, 5, 10), 5);
        assert_eq!(sample_size(1.0, 0, 7), 7);
        assert_eq!(sample_size(0.0, 0, 7), 0);
    }

    #[test]
    fn sample_size_ignores_rounding_noise() {
        assert_eq!(sample_size(0.07, 0, 100), 7);
        assert_eq!(sample_size(0.14, 0, 100), 14);
        assert_eq!(sample_size(0.071, 0, 100), 8);

        let strategy = FedAvg::new(StrategyConfig {
            fraction_fit: 0.07,
            fraction_evaluate: 0.14,
            min_fit_clients: 1,
            min_evaluate_clients: 1,
            min_available_clients: 100,
            num_rounds: 1,
        })
        .unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        assert_eq!(strategy.configure_fit(100, &mut rng).unwrap().len(), 7);
        assert_eq!(strategy.configure_evaluate(100, &mut rng).unwrap().len(), 14);
    }

    #[test]
    fn rejects_invalid_config() {
        let bad = StrategyConfig {
            fraction_fit: 1.5,
            ..Default::default()
        };
        assert!(matches!(FedAvg::new(bad), Err(OrchestraError::Configuration(_))));

        let bad = StrategyConfig {
            num_rounds: 0,
            ..Default::default()
        };
        assert!(FedAvg::new(bad).is_err());
    }

    #[test]
    fn selection_meets_floor_for_any_availability() {
        let mut rng = StdRng::seed_from_u64(1);

        for min_fit in 1..8 {
            let strategy = fedavg(min_fit, min_fit);
            for available in min_fit..20 {
                let selected = strategy.configure_fit(available, &mut rng).unwrap();
                assert!(selected.len() >= min_fit);
                assert!(selected.windows(2).all(|w| w[0] < w[1]));
                assert!(selected.iter().all(|&id| id < available));
            }
        }
    }

    #[test]
    fn selection_fails_below_min_available() {
        let mut rng = StdRng::seed_from_u64(1);
        let err = fedavg(2, 10).configure_fit(9, &mut rng).unwrap_err();
        assert!(matches!(
            err,
            OrchestraError::InsufficientParticipants {
                available: 9,
                required: 10
            }
        ));
    }

    #[test]
    fn evaluation_off_selects_nobody() {
        let strategy = FedAvg::new(StrategyConfig {
            fraction_evaluate: 0.0,
            min_available_clients: 1,
            ..Default::default()
        })
        .unwrap();

        let selected = strategy
            .configure_evaluate(10, &mut StdRng::seed_from_u64(0))
            .unwrap();
        assert!(selected.is_empty());
    }

    #[test]
    fn weighted_average_follows_counts() {
        let a = Parameters::new(vec![arr2(&[[1.0, 2.0]]).into_dyn(), arr1(&[0.0]).into_dyn()]);
        let b = Parameters::new(vec![arr2(&[[3.0, 6.0]]).into_dyn(), arr1(&[4.0]).into_dyn()]);

        let avg = weighted_average(&[(&a, 1), (&b, 3)]).unwrap();

        assert_eq!(avg.tensors()[0], arr2(&[[2.5, 5.0]]).into_dyn());
        assert_eq!(avg.tensors()[1], arr1(&[3.0]).into_dyn());
    }

    #[test]
    fn weighted_average_needs_weight() {
        let a = Parameters::new(vec![arr1(&[1.0]).into_dyn()]);
        assert!(weighted_average(&[(&a, 0), (&a, 0)]).is_none());
        assert!(weighted_average(&[]).is_none());
    }

    #[test]
    fn equal_counts_reduce_to_plain_mean() {
        let mut rng = StdRng::seed_from_u64(99);

        for _ in 0..50 {
            let clients = rng.random_range(1..8);
            let len = rng.random_range(1..16);
            let count = rng.random_range(1..1000);

            let params: Vec<Parameters> = (0..clients)
                .map(|_| {
                    let values: Vec<f32> =
                        (0..len).map(|_| rng.random_range(-10.0..10.0)).collect();
                    Parameters::new(vec![arr1(&values).into_dyn()])
                })
                .collect();

            let weighted: Vec<_> = params.iter().map(|p| (p, count)).collect();
            let avg = weighted_average(&weighted).unwrap();

            for i in 0..len {
                let mean = params.iter().map(|p| p.tensors()[0][[i]] as f64).sum::<f64>()
                    / clients as f64;
                assert!((avg.tensors()[0][[i]] as f64 - mean).abs() < 1e-4);
            }
        }
    }

    #[test]
    fn aggregated_metric_stays_within_inputs() {
        let mut rng = StdRng::seed_from_u64(3);

        for _ in 0..100 {
            let results: Vec<(u64, Metrics)> = (0..rng.random_range(1..10))
                .map(|_| {
                    (
                        rng.random_range(0..500),
                        metrics(&[("accuracy", rng.random_range(0.0..1.0))]),
                    )
                })
                .collect();

            let refs: Vec<_> = results.iter().map(|(n, m)| (*n, m)).collect();
            let aggregated = weighted_metrics(&refs);

            let Some(&acc) = aggregated.get("accuracy") else {
                assert!(results.iter().all(|(n, _)| *n == 0));
                continue;
            };

            let weighted_inputs = results
                .iter()
                .filter(|(n, _)| *n > 0)
                .map(|(_, m)| m["accuracy"]);
            let lo = weighted_inputs.clone().fold(f64::INFINITY, f64::min);
            let hi = weighted_inputs.fold(f64::NEG_INFINITY, f64::max);
            assert!(lo - 1e-12 <= acc && acc <= hi + 1e-12);
        }
    }

    #[test]
    fn metrics_average_over_reporters_only() {
        let a = metrics(&[("accuracy", 0.5), ("train_loss", 2.0)]);
        let b = metrics(&[("accuracy", 1.0)]);

        let aggregated = weighted_metrics(&[(10, &a), (30, &b)]);

        assert_eq!(aggregated["accuracy"], 0.875);
        assert_eq!(aggregated["train_loss"], 2.0);
    }

    #[test]
    fn aggregation_enforces_quorum() {
        let strategy = fedavg(3, 3);
        let res = FitRes {
            parameters: Parameters::new(vec![arr1(&[1.0]).into_dyn()]),
            num_examples: 10,
            metrics: Metrics::new(),
        };

        let err = strategy
            .aggregate_fit(4, &[res.clone(), res.clone()])
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestraError::RoundQuorum {
                round: 4,
                phase: Phase::Fit,
                shortfall: QuorumShortfall::TooFewResults {
                    got: 2,
                    required: 3
                }
            }
        ));

        let empty = FitRes {
            num_examples: 0,
            ..res
        };
        let err = strategy
            .aggregate_fit(4, &[empty.clone(), empty.clone(), empty])
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestraError::RoundQuorum {
                shortfall: QuorumShortfall::ZeroWeight,
                ..
            }
        ));
    }

    #[test]
    fn evaluation_loss_is_weighted() {
        let strategy = fedavg(1, 1);
        let results = [
            EvaluateRes {
                loss: 1.0,
                num_examples: 1,
                metrics: metrics(&[("accuracy", 0.0)]),
            },
            EvaluateRes {
                loss: 3.0,
                num_examples: 3,
                metrics: metrics(&[("accuracy", 1.0)]),
            },
        ];

        let (loss, aggregated) = strategy.aggregate_evaluate(1, &results).unwrap();
        assert_eq!(loss, 2.5);
        assert_eq!(aggregated["accuracy"], 0.75);
    }
}
