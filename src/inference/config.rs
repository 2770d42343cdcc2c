use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::nn::Aggregate;
use crate::sampling::{full_fanout, parse_fanout, LayerFanout};
use crate::{Error, Result};

fn default_eval_batch_size() -> usize {
    10000
}
fn default_true() -> bool {
    true
}
fn default_aggregate() -> String {
    "sum".to_string()
}

/// Settings of a full-graph inference call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferenceConfig {
    pub num_layers: usize,
    /// Training fanout, e.g. `"10,20"` or `"user/buys/item:10@item/rev/user:5,-1"`.
    /// Only validated here; inference samples with `eval_fanout`.
    #[serde(default)]
    pub fanout: Option<String>,
    /// Inference fanout; all neighbors in every layer when unset.
    #[serde(default)]
    pub eval_fanout: Option<String>,
    #[serde(default = "default_eval_batch_size")]
    pub eval_batch_size: usize,
    #[serde(default)]
    pub edge_mask: Option<String>,
    #[serde(default)]
    pub target_ntypes: Option<Vec<String>>,
    #[serde(default = "default_true")]
    pub use_mini_batch_infer: bool,
    #[serde(default = "default_aggregate")]
    pub aggregate: String,
    /// Keep the per-layer tensors of layer-by-layer inference.
    #[serde(default)]
    pub keep_intermediate: bool,
    #[serde(default = "default_true")]
    pub persistent_outputs: bool,
    #[serde(default)]
    pub sampler_seed: u64,
}

impl InferenceConfig {
    pub fn new(num_layers: usize) -> Self {
        Self {
            num_layers,
            fanout: None,
            eval_fanout: None,
            eval_batch_size: default_eval_batch_size(),
            edge_mask: None,
            target_ntypes: None,
            use_mini_batch_infer: true,
            aggregate: default_aggregate(),
            keep_intermediate: false,
            persistent_outputs: true,
            sampler_seed: 0,
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.eval_batch_size == 0 {
            return Err(Error::Config("eval_batch_size must be positive".to_string()));
        }
        self.fanout()?;
        self.eval_fanout()?;
        self.aggregate()?;
        Ok(())
    }

    fn checked_fanout(&self, name: &str, text: &str) -> Result<Vec<LayerFanout>> {
        let fanout = parse_fanout(text)?;
        if fanout.len() != self.num_layers {
            return Err(Error::Config(format!(
                "{name} {text:?} has {} layers, the model has {}",
                fanout.len(),
                self.num_layers
            )));
        }
        Ok(fanout)
    }

    /// The parsed training fanout. Nothing in inference reads it; it is
    /// checked so a shared config file fails early.
    pub fn fanout(&self) -> Result<Option<Vec<LayerFanout>>> {
        self.fanout
            .as_deref()
            .map(|text| self.checked_fanout("fanout", text))
            .transpose()
    }

    pub fn eval_fanout(&self) -> Result<Vec<LayerFanout>> {
        match &self.eval_fanout {
            Some(text) => self.checked_fanout("eval_fanout", text),
            None => Ok(full_fanout(self.num_layers)),
        }
    }

    /// The cross-type reducer of the GNN layers.
    pub fn aggregate(&self) -> Result<Aggregate> {
        match self.aggregate.parse()? {
            Aggregate::Stack => Err(Error::Config(
                "aggregate \"stack\" cannot be used by the GNN layers".to_string(),
            )),
            aggregate => Ok(aggregate),
        }
    }
}
