use serde::Serialize;

use crate::model::Metrics;

/// The aggregated outcome of one completed round.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoundRecord {
    pub round: u32,
    /// Weighted average of the metrics reported by `fit`.
    pub fit_metrics: Metrics,
    pub fit_failures: usize,
    /// Weighted distributed loss, `None` when the round skipped evaluation.
    pub loss: Option<f64>,
    /// Weighted average of the metrics reported by `evaluate`.
    pub metrics: Metrics,
    pub evaluate_failures: usize,
}

/// Append-only record of every completed round, in round order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct History {
    rounds: Vec<RoundRecord>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, record: RoundRecord) {
        self.rounds.push(record);
    }

    pub fn rounds(&self) -> &[RoundRecord] {
        &self.rounds
    }

    pub fn len(&self) -> usize {
        self.rounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rounds.is_empty()
    }

    pub fn last(&self) -> Option<&RoundRecord> {
        self.rounds.last()
    }

    /// The record of `round`, if it completed.
    pub fn get(&self, round: u32) -> Option<&RoundRecord> {
        self.rounds.iter().find(|r| r.round == round)
    }

    /// The `(round, value)` series of an evaluation metric.
    pub fn metric(&self, name: &str) -> Vec<(u32, f64)> {
        self.rounds
            .iter()
            .filter_map(|r| r.metrics.get(name).map(|&v| (r.round, v)))
            .collect()
    }

    /// The `(round, value)` series of a fit metric.
    pub fn fit_metric(&self, name: &str) -> Vec<(u32, f64)> {
        self.rounds
            .iter()
            .filter_map(|r| r.fit_metrics.get(name).map(|&v| (r.round, v)))
            .collect()
    }

    /// The `(round, loss)` series of distributed losses.
    pub fn losses(&self) -> Vec<(u32, f64)> {
        self.rounds
            .iter()
            .filter_map(|r| r.loss.map(|loss| (r.round, loss)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(round: u32, accuracy: Option<f64>) -> RoundRecord {
        RoundRecord {
            round,
            fit_metrics: Metrics::new(),
            fit_failures: 0,
            loss: accuracy.map(|a| 1.0 - a),
            metrics: accuracy
                .map(|a| Metrics::from([("accuracy".to_string(), a)]))
                .unwrap_or_default(),
            evaluate_failures: 0,
        }
    }

    #[test]
    fn series_skip_rounds_without_evaluation() {
        let mut history = History::new();
        history.push(record(1, Some(0.25)));
        history.push(record(2, None));
        history.push(record(3, Some(0.5)));

        assert_eq!(history.len(), 3);
        assert_eq!(history.metric("accuracy"), vec![(1, 0.25), (3, 0.5)]);
        assert_eq!(history.losses(), vec![(1, 0.75), (3, 0.5)]);
        assert!(history.metric("f1").is_empty());
        assert_eq!(history.get(2).map(|r| r.loss), Some(None));
    }
}
