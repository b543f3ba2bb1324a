use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Ix1, Ix2};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use super::{Evaluation, Metrics, Parameters, Result, TrainError, Trainer};
use crate::data::Subset;

const EPS: f32 = 1e-12;

/// Multinomial logistic regression trained with mini-batch SGD with momentum.
///
/// Parameter layout: `[weights (C x D), biases (C)]`.
#[derive(Debug)]
pub struct SoftmaxRegression {
    feature_dim: usize,
    num_classes: usize,
    lr: f32,
    momentum: f32,
    batch_size: usize,
    rng: StdRng,
}

impl SoftmaxRegression {
    /// Creates a new `SoftmaxRegression`.
    ///
    /// # Arguments
    /// * `feature_dim` - The amount of features per sample `D`.
    /// * `num_classes` - The amount of classes `C`.
    /// * `lr` - The learning rate.
    /// * `momentum` - The momentum factor, `0.0` for plain SGD.
    /// * `batch_size` - The mini-batch size, clamped to at least 1.
    /// * `seed` - Seed for the per-epoch sample shuffling.
    pub fn new(
        feature_dim: usize,
        num_classes: usize,
        lr: f32,
        momentum: f32,
        batch_size: usize,
        seed: u64,
    ) -> Self {
        Self {
            feature_dim,
            num_classes,
            lr,
            momentum,
            batch_size: batch_size.max(1),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// All-zero parameters with this model's layout.
    pub fn init_parameters(&self) -> Parameters {
        Parameters::new(vec![
            Array2::<f32>::zeros((self.num_classes, self.feature_dim)).into_dyn(),
            Array1::<f32>::zeros(self.num_classes).into_dyn(),
        ])
    }

    fn unpack<'a>(
        &self,
        params: &'a Parameters,
    ) -> Result<(ArrayView2<'a, f32>, ArrayView1<'a, f32>)> {
        let expected = self.init_parameters().layout();
        let got = params.layout();

        if got != expected {
            return Err(TrainError::ShapeMismatch {
                what: "parameters",
                got: got.into_iter().flatten().collect(),
                expected: expected.into_iter().flatten().collect(),
            });
        }

        let shape_err = |_| TrainError::InvalidInput("parameters are not contiguous".into());
        let w = params.tensors()[0]
            .view()
            .into_dimensionality::<Ix2>()
            .map_err(shape_err)?;
        let b = params.tensors()[1]
            .view()
            .into_dimensionality::<Ix1>()
            .map_err(shape_err)?;

        Ok((w, b))
    }

    fn check_data(&self, data: &Subset) -> Result<()> {
        let dataset = data.dataset();

        if dataset.feature_dim() != self.feature_dim {
            return Err(TrainError::ShapeMismatch {
                what: "samples",
                got: vec![dataset.feature_dim()],
                expected: vec![self.feature_dim],
            });
        }

        if dataset.num_classes() > self.num_classes {
            return Err(TrainError::InvalidInput(format!(
                "data has {} classes but the model only {}",
                dataset.num_classes(),
                self.num_classes
            )));
        }

        Ok(())
    }

    fn batch(&self, data: &Subset, positions: &[usize]) -> Result<(Array2<f32>, Vec<usize>)> {
        let mut xs = Vec::with_capacity(positions.len() * self.feature_dim);
        let mut ys = Vec::with_capacity(positions.len());

        for &pos in positions {
            let (x, y) = data.sample(pos);
            xs.extend_from_slice(x);
            ys.push(y);
        }

        let xs = Array2::from_shape_vec((positions.len(), self.feature_dim), xs)
            .map_err(|e| TrainError::InvalidInput(format!("bad batch: {e}")))?;

        Ok((xs, ys))
    }
}

/// Row-wise softmax of `x @ w^T + b`.
fn probabilities(xs: &Array2<f32>, w: &ArrayView2<f32>, b: &ArrayView1<f32>) -> Array2<f32> {
    let mut logits = xs.dot(&w.t());
    logits += b;

    for mut row in logits.rows_mut() {
        let max = row.fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row /= sum;
    }

    logits
}

/// Summed cross-entropy of a batch.
fn cross_entropy(probs: &Array2<f32>, ys: &[usize]) -> f64 {
    ys.iter()
        .enumerate()
        .map(|(i, &y)| -(probs[[i, y]].max(EPS).ln() as f64))
        .sum()
}

impl Trainer for SoftmaxRegression {
    fn train(&mut self, params: &mut Parameters, data: &Subset, epochs: usize) -> Result<Metrics> {
        self.check_data(data)?;
        let (w, b) = self.unpack(params)?;
        let mut w = w.to_owned();
        let mut b = b.to_owned();

        let mut vw = Array2::<f32>::zeros(w.raw_dim());
        let mut vb = Array1::<f32>::zeros(b.raw_dim());

        let mut order: Vec<usize> = (0..data.len()).collect();
        let mut epoch_loss = 0.0;

        for epoch in 0..epochs {
            order.shuffle(&mut self.rng);
            epoch_loss = 0.0;

            for positions in order.chunks(self.batch_size) {
                let (xs, ys) = self.batch(data, positions)?;
                let mut grad = probabilities(&xs, &w.view(), &b.view());
                epoch_loss += cross_entropy(&grad, &ys);

                for (i, &y) in ys.iter().enumerate() {
                    grad[[i, y]] -= 1.0;
                }
                grad /= positions.len() as f32;

                let gw = grad.t().dot(&xs);
                let gb = grad.sum_axis(Axis(0));

                vw.mapv_inplace(|v| v * self.momentum);
                vw += &gw;
                vb.mapv_inplace(|v| v * self.momentum);
                vb += &gb;

                w.scaled_add(-self.lr, &vw);
                b.scaled_add(-self.lr, &vb);
            }

            if !epoch_loss.is_finite() {
                return Err(TrainError::Diverged { epoch });
            }
        }

        *params = Parameters::new(vec![w.into_dyn(), b.into_dyn()]);

        let mut metrics = Metrics::new();
        if epochs > 0 && !data.is_empty() {
            metrics.insert("train_loss".into(), epoch_loss / data.len() as f64);
        }

        Ok(metrics)
    }

    fn evaluate(&mut self, params: &Parameters, data: &Subset) -> Result<Evaluation> {
        self.check_data(data)?;
        let (w, b) = self.unpack(params)?;

        if data.is_empty() {
            return Ok(Evaluation {
                loss: 0.0,
                accuracy: 0.0,
            });
        }

        let positions: Vec<usize> = (0..data.len()).collect();
        let mut loss = 0.0;
        let mut correct = 0usize;

        for chunk in positions.chunks(self.batch_size) {
            let (xs, ys) = self.batch(data, chunk)?;
            let probs = probabilities(&xs, &w, &b);
            loss += cross_entropy(&probs, &ys);

            for (row, &y) in probs.rows().into_iter().zip(&ys) {
                let (predicted, _) = row.iter().enumerate().fold(
                    (0, f32::NEG_INFINITY),
                    |best, (i, &p)| if p > best.1 { (i, p) } else { best },
                );
                if predicted == y {
                    correct += 1;
                }
            }
        }

        Ok(Evaluation {
            loss: loss / data.len() as f64,
            accuracy: correct as f64 / data.len() as f64,
        })
    }
}
