use std::sync::Arc;

use super::{DataError, Result};

/// An immutable in-memory labeled dataset.
///
/// Features are stored row-major in a single flat buffer, `feature_dim` values per
/// sample. Every label is guaranteed to be in `[0, num_classes)`.
#[derive(Debug, Clone)]
pub struct Dataset {
    features: Vec<f32>,
    feature_dim: usize,
    labels: Vec<usize>,
    num_classes: usize,
}

impl Dataset {
    /// Creates a new `Dataset` from owned buffers.
    ///
    /// # Errors
    /// - `Configuration` if `feature_dim` or `num_classes` is zero.
    /// - `SizeMismatch` if `features.len() != labels.len() * feature_dim`.
    /// - `LabelOutOfRange` if some label is not below `num_classes`.
    pub fn new(
        features: Vec<f32>,
        feature_dim: usize,
        labels: Vec<usize>,
        num_classes: usize,
    ) -> Result<Self> {
        if feature_dim == 0 {
            return Err(DataError::Configuration(
                "feature_dim must be greater than zero".into(),
            ));
        }

        if num_classes == 0 {
            return Err(DataError::Configuration(
                "num_classes must be greater than zero".into(),
            ));
        }

        let expected = labels.len() * feature_dim;
        if features.len() != expected {
            return Err(DataError::SizeMismatch {
                got: features.len(),
                expected,
            });
        }

        if let Some((index, &label)) = labels.iter().enumerate().find(|(_, l)| **l >= num_classes)
        {
            return Err(DataError::LabelOutOfRange {
                index,
                label,
                num_classes,
            });
        }

        Ok(Self {
            features,
            feature_dim,
            labels,
            num_classes,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    #[inline]
    pub fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    /// The count of distinct labels `C`.
    #[inline]
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    #[inline]
    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    /// Returns the features of the sample at `idx` (panics if out of bounds).
    #[inline]
    pub fn features(&self, idx: usize) -> &[f32] {
        let start = idx * self.feature_dim;
        &self.features[start..start + self.feature_dim]
    }

    /// Returns the label of the sample at `idx` (panics if out of bounds).
    #[inline]
    pub fn label(&self, idx: usize) -> usize {
        self.labels[idx]
    }

    /// Groups every sample index by its label.
    ///
    /// # Returns
    /// `num_classes` index pools in ascending sample order, one per label. Labels with
    /// no samples yield an empty pool.
    pub fn indices_by_label(&self) -> Vec<Vec<usize>> {
        let mut pools = vec![Vec::new(); self.num_classes];
        for (idx, &label) in self.labels.iter().enumerate() {
            pools[label].push(idx);
        }
        pools
    }
}

/// A cheap, shareable view over a subset of a `Dataset`.
///
/// This is the data handle given to a trainer: it owns no samples, only the indices
/// that belong to it.
#[derive(Debug, Clone)]
pub struct Subset {
    dataset: Arc<Dataset>,
    indices: Arc<[usize]>,
}

impl Subset {
    /// Creates a new `Subset`.
    ///
    /// # Panics
    /// If any index is out of bounds for `dataset`.
    pub fn new(dataset: Arc<Dataset>, indices: impl Into<Arc<[usize]>>) -> Self {
        let indices = indices.into();
        assert!(
            indices.iter().all(|&i| i < dataset.len()),
            "subset index out of bounds"
        );
        Self { dataset, indices }
    }

    /// A subset spanning the entire dataset.
    pub fn full(dataset: Arc<Dataset>) -> Self {
        let indices: Vec<usize> = (0..dataset.len()).collect();
        Self {
            dataset,
            indices: indices.into(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    #[inline]
    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    #[inline]
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    /// Returns the `(features, label)` pair at position `pos` of this subset.
    #[inline]
    pub fn sample(&self, pos: usize) -> (&[f32], usize) {
        let idx = self.indices[pos];
        (self.dataset.features(idx), self.dataset.label(idx))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[f32], usize)> + '_ {
        self.indices
            .iter()
            .map(|&idx| (self.dataset.features(idx), self.dataset.label(idx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny() -> Dataset {
        Dataset::new(vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0], 2, vec![1, 0, 1], 2).unwrap()
    }

    #[test]
    fn dataset_basic() {
        let ds = tiny();
        assert_eq!(ds.len(), 3);
        assert_eq!(ds.features(1), &[2.0, 3.0]);
        assert_eq!(ds.label(2), 1);
        assert_eq!(ds.indices_by_label(), vec![vec![1], vec![0, 2]]);
    }

    #[test]
    fn dataset_rejects_bad_buffers() {
        let err = Dataset::new(vec![0.0; 5], 2, vec![0, 1, 0], 2).unwrap_err();
        assert!(matches!(
            err,
            DataError::SizeMismatch {
                got: 5,
                expected: 6
            }
        ));

        let err = Dataset::new(vec![0.0; 4], 2, vec![0, 3], 2).unwrap_err();
        assert!(matches!(err, DataError::LabelOutOfRange { index: 1, .. }));
    }

    #[test]
    fn subset_reads_through_indices() {
        let sub = Subset::new(Arc::new(tiny()), vec![2, 0]);
        assert_eq!(sub.len(), 2);
        assert_eq!(sub.sample(0), (&[4.0, 5.0][..], 1));

        let labels: Vec<_> = sub.iter().map(|(_, y)| y).collect();
        assert_eq!(labels, vec![1, 1]);
    }
}
