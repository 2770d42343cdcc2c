use std::str::FromStr;

use candle_core::Tensor;
use candle_nn::VarBuilder;

use super::utils::{mean_edge_agg, src_messages, xavier};
use super::{RelGraph, RelInput, RelationModule};
use crate::utils::matmul_rows;
use crate::{Error, Result};

/// How edge features are combined with source node messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EdgeFeatOp {
    #[default]
    Concat,
    Add,
    Sub,
    Mul,
    Div,
}

impl EdgeFeatOp {
    fn combine(&self, msgs: &Tensor, edge: &Tensor) -> Result<Tensor> {
        let edge = edge.to_dtype(msgs.dtype())?;
        Ok(match self {
            Self::Concat => Tensor::cat(&[msgs, &edge], 1)?,
            Self::Add => (msgs + edge)?,
            Self::Sub => (msgs - edge)?,
            Self::Mul => (msgs * edge)?,
            Self::Div => (msgs / edge)?,
        })
    }
}

impl FromStr for EdgeFeatOp {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "concat" => Ok(Self::Concat),
            "add" => Ok(Self::Add),
            "sub" => Ok(Self::Sub),
            "mul" => Ok(Self::Mul),
            "div" => Ok(Self::Div),
            _ => Err(Error::Config(format!(
                "unknown edge feature operation {s:?}, expected concat, add, sub, mul or div"
            ))),
        }
    }
}

/// Graph convolution of one relation: the mean of the incoming messages,
/// projected by a weight matrix.
pub struct GraphConvRel {
    weight: Tensor,
    in_dim: usize,
    out_dim: usize,
    edge_op: Option<EdgeFeatOp>,
}

impl GraphConvRel {
    pub fn new(in_dim: usize, out_dim: usize, vs: VarBuilder) -> Result<Self> {
        Ok(Self {
            weight: xavier(in_dim, out_dim, 1.0, "weight", &vs)?,
            in_dim,
            out_dim,
            edge_op: None,
        })
    }

    /// A convolution whose messages also carry `edge_dim`-sized edge features.
    pub fn with_edge_feat(
        in_dim: usize,
        edge_dim: usize,
        out_dim: usize,
        op: EdgeFeatOp,
        vs: VarBuilder,
    ) -> Result<Self> {
        let msg_dim = match op {
            EdgeFeatOp::Concat => in_dim + edge_dim,
            _ if edge_dim == in_dim => in_dim,
            _ => {
                return Err(Error::Config(format!(
                    "edge feature size {edge_dim} must equal node size {in_dim} for {op:?}"
                )))
            }
        };
        Ok(Self {
            weight: xavier(msg_dim, out_dim, 1.0, "weight", &vs)?,
            in_dim,
            out_dim,
            edge_op: Some(op),
        })
    }

    pub fn uses_edge_feat(&self) -> bool {
        self.edge_op.is_some()
    }
}

impl RelationModule for GraphConvRel {
    fn forward(&self, g: &RelGraph, input: RelInput<'_>) -> Result<Tensor> {
        let msgs = src_messages(input.src, g)?;
        match (self.edge_op, input.edge) {
            (Some(op), Some(edge)) => {
                let msgs = op.combine(&msgs, edge)?;
                matmul_rows(&mean_edge_agg(&msgs, g)?, &self.weight)
            }
            _ => {
                // the edge part of a concat weight is unused without edge features
                let weight = self.weight.narrow(0, 0, self.in_dim)?;
                matmul_rows(&mean_edge_agg(&msgs, g)?, &weight)
            }
        }
    }

    fn out_dim(&self) -> usize {
        self.out_dim
    }
}
