use std::collections::BTreeMap;

use ndarray::ArrayD;

/// A single dense parameter tensor.
pub type Tensor = ArrayD<f32>;

/// Scalar metrics keyed by name.
pub type Metrics = BTreeMap<String, f64>;

/// An ordered sequence of tensors, identified by position.
///
/// The orchestration engine never interprets the tensors, it only averages them
/// position by position.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Parameters(Vec<Tensor>);

impl Parameters {
    pub fn new(tensors: Vec<Tensor>) -> Self {
        Self(tensors)
    }

    #[inline]
    pub fn tensors(&self) -> &[Tensor] {
        &self.0
    }

    #[inline]
    pub fn into_tensors(self) -> Vec<Tensor> {
        self.0
    }

    /// The amount of tensors.
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The total amount of scalars across every tensor.
    pub fn num_elements(&self) -> usize {
        self.0.iter().map(|t| t.len()).sum()
    }

    /// The shape of every tensor, in order.
    pub fn layout(&self) -> Vec<Vec<usize>> {
        self.0.iter().map(|t| t.shape().to_vec()).collect()
    }

    /// Whether `other` has the same amount of tensors with the same shapes.
    pub fn same_layout(&self, other: &Parameters) -> bool {
        self.0.len() == other.0.len()
            && self
                .0
                .iter()
                .zip(&other.0)
                .all(|(a, b)| a.shape() == b.shape())
    }
}

impl From<Vec<Tensor>> for Parameters {
    fn from(value: Vec<Tensor>) -> Self {
        Self(value)
    }
}
