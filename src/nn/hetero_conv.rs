use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use candle_core::Tensor;

use super::{ConvGraph, RelInput, RelationModule};
use crate::{CanonicalEtype, EdgeMap, Error, NodeMap, Result};

pub type AggregateFn = Arc<dyn Fn(&[Tensor], &str) -> Result<Tensor> + Send + Sync>;

/// Combines the outputs of all edge types sharing a destination node type.
#[derive(Clone, Default)]
pub enum Aggregate {
    #[default]
    Sum,
    Max,
    Min,
    Mean,
    /// Stacks along a new second dimension, in edge type order.
    Stack,
    Custom(AggregateFn),
}

impl fmt::Debug for Aggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sum => write!(f, "Sum"),
            Self::Max => write!(f, "Max"),
            Self::Min => write!(f, "Min"),
            Self::Mean => write!(f, "Mean"),
            Self::Stack => write!(f, "Stack"),
            Self::Custom(_) => write!(f, "Custom"),
        }
    }
}

impl FromStr for Aggregate {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sum" => Ok(Self::Sum),
            "max" => Ok(Self::Max),
            "min" => Ok(Self::Min),
            "mean" => Ok(Self::Mean),
            "stack" => Ok(Self::Stack),
            _ => Err(Error::Config(format!("invalid cross type reducer {s:?}"))),
        }
    }
}

impl Aggregate {
    pub fn apply(&self, xs: &[Tensor], ntype: &str) -> Result<Tensor> {
        if let Self::Custom(f) = self {
            return f(xs, ntype);
        }
        if let Self::Stack = self {
            return Ok(Tensor::stack(xs, 1)?);
        }
        let stacked = Tensor::stack(xs, 0)?;
        Ok(match self {
            Self::Max => stacked.max(0)?,
            Self::Min => stacked.min(0)?,
            Self::Mean => stacked.mean(0)?,
            _ => stacked.sum(0)?,
        })
    }
}

/// Relation modules looked up by exact edge type first, then by relation name.
#[derive(Default)]
pub struct ModuleRegistry {
    exact: EdgeMap<Box<dyn RelationModule>>,
    by_relation: BTreeMap<String, Box<dyn RelationModule>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_etype(&mut self, etype: CanonicalEtype, module: Box<dyn RelationModule>) {
        self.exact.insert(etype, module);
    }

    pub fn insert_relation(&mut self, relation: &str, module: Box<dyn RelationModule>) {
        self.by_relation.insert(relation.to_string(), module);
    }

    pub fn get(&self, etype: &CanonicalEtype) -> Result<&dyn RelationModule> {
        self.exact
            .get(etype)
            .or_else(|| self.by_relation.get(&etype.1))
            .map(|m| m.as_ref())
            .ok_or_else(|| Error::UnknownEdgeType {
                etype: etype.clone(),
            })
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.by_relation.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The inputs of a heterogeneous convolution.
#[derive(Debug, Clone, Copy)]
pub enum ConvInput<'a> {
    /// Source features; destination features are their leading rows.
    NodeOnly(&'a NodeMap<Tensor>),
    SourceDest(&'a NodeMap<Tensor>, &'a NodeMap<Tensor>),
    SourceDestEdge(&'a NodeMap<Tensor>, &'a NodeMap<Tensor>, &'a EdgeMap<Tensor>),
}

/// Runs the relation module of every edge type and aggregates the results
/// per destination node type.
pub struct HeteroGraphConv {
    modules: ModuleRegistry,
    aggregate: Aggregate,
}

impl HeteroGraphConv {
    pub fn new(modules: ModuleRegistry, aggregate: Aggregate) -> Self {
        Self { modules, aggregate }
    }

    pub fn modules(&self) -> &ModuleRegistry {
        &self.modules
    }

    /// Edge types whose source type is missing from the inputs or has no rows
    /// contribute nothing; destination types without any contribution are
    /// absent from the result. An edge type present in the inputs must have
    /// a module even when its source has no rows.
    pub fn forward(&self, g: &dyn ConvGraph, inputs: ConvInput<'_>) -> Result<NodeMap<Tensor>> {
        let (src_inputs, dst_inputs, edge_inputs) = match inputs {
            ConvInput::NodeOnly(h) => {
                let mut dst = NodeMap::new();
                for (ntype, x) in h {
                    let n = g.num_dst_nodes(ntype);
                    if n <= x.dim(0)? {
                        dst.insert(ntype.clone(), x.narrow(0, 0, n)?);
                    }
                }
                (h, Cow::Owned(dst), None)
            }
            ConvInput::SourceDest(src, dst) => (src, Cow::Borrowed(dst), None),
            ConvInput::SourceDestEdge(src, dst, edge) => {
                (src, Cow::Borrowed(dst), Some(edge))
            }
        };

        let mut outputs: NodeMap<Vec<Tensor>> = NodeMap::new();
        for etype in g.canonical_etypes() {
            let (stype, _, dtype) = &etype;
            let (Some(src), Some(dst)) = (src_inputs.get(stype), dst_inputs.get(dtype)) else {
                continue;
            };
            let module = self.modules.get(&etype)?;
            if src.dim(0)? == 0 {
                continue;
            }
            let rel = g.rel_graph(&etype, src.device())?;
            let edge = edge_inputs.and_then(|e| e.get(&etype));
            let out = module.forward(&rel, RelInput { src, dst, edge })?;
            outputs.entry(dtype.clone()).or_default().push(out);
        }

        outputs
            .into_iter()
            .map(|(ntype, xs)| {
                let h = self.aggregate.apply(&xs, &ntype)?;
                Ok((ntype, h))
            })
            .collect()
    }
}
