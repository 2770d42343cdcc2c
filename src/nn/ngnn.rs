use candle_core::Tensor;
use candle_nn::{Activation, Dropout, Module, ModuleT, VarBuilder};

use super::utils::xavier;
use crate::utils::matmul_rows;
use crate::Result;

/// Feed-forward layers stacked inside a GNN layer ("network in graph neural
/// network"). With zero layers this is the identity.
pub struct NgnnMlp {
    weights: Vec<Tensor>,
    activation: Activation,
    dropout: Dropout,
}

impl NgnnMlp {
    pub fn new(
        dim: usize,
        num_layers: usize,
        activation: Activation,
        dropout: f32,
        vs: VarBuilder,
    ) -> Result<Self> {
        let gain = 2f64.sqrt();
        let weights = (0..num_layers)
            .map(|i| xavier(dim, dim, gain, &format!("ngnn[{i}]"), &vs))
            .collect::<Result<_>>()?;
        Ok(Self {
            weights,
            activation,
            dropout: Dropout::new(dropout),
        })
    }

    pub fn num_layers(&self) -> usize {
        self.weights.len()
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        if self.weights.is_empty() {
            return Ok(xs.clone());
        }
        let mut h = xs.clone();
        for w in &self.weights {
            h = self.activation.forward(&matmul_rows(&h, w)?)?;
        }
        Ok(self.dropout.forward_t(&h, train)?)
    }
}
