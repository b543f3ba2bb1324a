use std::{fs, path::PathBuf};

use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::Normal;

use super::{DataError, Dataset, Result};

/// Supplies the training and held-out test datasets of a simulation.
pub trait DatasetProvider {
    /// Loads both datasets.
    ///
    /// # Returns
    /// The `(train, test)` pair, sharing the same `num_classes` and `feature_dim`.
    fn load(&self) -> Result<(Dataset, Dataset)>;
}

/// Gaussian clusters around one random center per class.
#[derive(Debug, Clone)]
pub struct SyntheticBlobs {
    pub num_classes: usize,
    pub feature_dim: usize,
    pub train_per_class: usize,
    pub test_per_class: usize,
    /// Standard deviation of every cluster.
    pub spread: f32,
    pub seed: u64,
}

impl Default for SyntheticBlobs {
    fn default() -> Self {
        Self {
            num_classes: 10,
            feature_dim: 16,
            train_per_class: 500,
            test_per_class: 100,
            spread: 1.0,
            seed: 0,
        }
    }
}

impl SyntheticBlobs {
    fn sample<R: Rng>(
        &self,
        rng: &mut R,
        centers: &[Vec<f32>],
        noise: Normal<f32>,
        per_class: usize,
    ) -> Result<Dataset> {
        let total = self.num_classes * per_class;
        let mut features = Vec::with_capacity(total * self.feature_dim);
        let mut labels = Vec::with_capacity(total);

        for i in 0..total {
            let label = i % self.num_classes;
            features.extend(centers[label].iter().map(|c| c + rng.sample(noise)));
            labels.push(label);
        }

        Dataset::new(features, self.feature_dim, labels, self.num_classes)
    }
}

impl DatasetProvider for SyntheticBlobs {
    fn load(&self) -> Result<(Dataset, Dataset)> {
        let noise = Normal::new(0.0, self.spread)
            .map_err(|e| DataError::Configuration(format!("invalid spread: {e}")))?;

        let mut rng = StdRng::seed_from_u64(self.seed);
        let centers: Vec<Vec<f32>> = (0..self.num_classes)
            .map(|_| {
                (0..self.feature_dim)
                    .map(|_| rng.random_range(-4.0..4.0))
                    .collect()
            })
            .collect();

        let train = self.sample(&mut rng, &centers, noise, self.train_per_class)?;
        let test = self.sample(&mut rng, &centers, noise, self.test_per_class)?;
        Ok((train, test))
    }
}

/// Two CSV files with one sample per row: `feature_dim` floats followed by the label.
#[derive(Debug, Clone)]
pub struct CsvDataset {
    pub train: PathBuf,
    pub test: PathBuf,
    pub num_classes: usize,
}

impl CsvDataset {
    fn read(&self, path: &PathBuf) -> Result<Dataset> {
        let content = fs::read_to_string(path)?;
        parse_csv(&content, self.num_classes)
    }
}

impl DatasetProvider for CsvDataset {
    fn load(&self) -> Result<(Dataset, Dataset)> {
        let train = self.read(&self.train)?;
        let test = self.read(&self.test)?;

        if train.feature_dim() != test.feature_dim() {
            return Err(DataError::Configuration(format!(
                "train rows have {} features but test rows have {}",
                train.feature_dim(),
                test.feature_dim()
            )));
        }

        Ok((train, test))
    }
}

fn parse_csv(content: &str, num_classes: usize) -> Result<Dataset> {
    let mut features = Vec::new();
    let mut labels = Vec::new();
    let mut row_size = None;

    for (i, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let values: Vec<&str> = line.split(',').map(str::trim).collect();
        let expected = *row_size.get_or_insert(values.len());

        if values.len() != expected || expected < 2 {
            return Err(DataError::Parse {
                line: i,
                msg: format!("expected {expected} values (at least 2), got {}", values.len()),
            });
        }

        let (xs, y) = values.split_at(expected - 1);
        for v in xs {
            let x = v.parse::<f32>().map_err(|_| DataError::Parse {
                line: i,
                msg: format!("cannot parse '{v}' as f32"),
            })?;
            features.push(x);
        }

        let label = y[0].parse::<usize>().map_err(|_| DataError::Parse {
            line: i,
            msg: format!("cannot parse '{}' as a label", y[0]),
        })?;
        labels.push(label);
    }

    let feature_dim = row_size.map_or(0, |n| n - 1);
    if labels.is_empty() {
        return Err(DataError::Configuration("dataset is empty".into()));
    }

    Dataset::new(features, feature_dim, labels, num_classes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blobs_are_balanced_and_reproducible() {
        let blobs = SyntheticBlobs {
            num_classes: 3,
            feature_dim: 2,
            train_per_class: 4,
            test_per_class: 2,
            spread: 0.5,
            seed: 9,
        };

        let (train, test) = blobs.load().unwrap();
        assert_eq!(train.len(), 12);
        assert_eq!(test.len(), 6);
        assert!(train.indices_by_label().iter().all(|pool| pool.len() == 4));

        let (again, _) = blobs.load().unwrap();
        assert_eq!(train.features(5), again.features(5));
    }

    #[test]
    fn blobs_reject_negative_spread() {
        let blobs = SyntheticBlobs {
            spread: -1.0,
            ..Default::default()
        };
        assert!(matches!(blobs.load(), Err(DataError::Configuration(_))));
    }

    #[test]
    fn csv_rows_parse_features_then_label() {
        let ds = parse_csv("0.5, 1.0, 2\n\n1.5,2.5,0\n", 3).unwrap();
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.feature_dim(), 2);
        assert_eq!(ds.features(1), &[1.5, 2.5]);
        assert_eq!(ds.labels(), &[2, 0]);
    }

    #[test]
    fn csv_rejects_ragged_rows() {
        let err = parse_csv("1,2,0\n1,0\n", 2).unwrap_err();
        assert!(matches!(err, DataError::Parse { line: 1, .. }));

        let err = parse_csv("1,x,0\n", 2).unwrap_err();
        assert!(matches!(err, DataError::Parse { line: 0, .. }));
    }
}
