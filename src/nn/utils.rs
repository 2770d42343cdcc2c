use candle_core::{DType, IndexOp, Tensor};
use candle_nn::{Init, Linear, VarBuilder};

use super::RelGraph;
use crate::utils::matmul_rows;
use crate::{NodeMap, Result};

/// An `(in_dim, out_dim)` weight with Xavier-uniform initialisation, scaled
/// by `gain`.
pub(crate) fn xavier(
    in_dim: usize,
    out_dim: usize,
    gain: f64,
    name: &str,
    vs: &VarBuilder,
) -> Result<Tensor> {
    let bound = gain * (6.0 / (in_dim + out_dim) as f64).sqrt();
    Ok(vs.get_with_hints(
        (in_dim, out_dim),
        name,
        Init::Uniform {
            lo: -bound,
            up: bound,
        },
    )?)
}

/// `Linear::forward` for 2-D inputs, tolerating zero rows.
pub fn linear_rows(lin: &Linear, xs: &Tensor) -> Result<Tensor> {
    let h = matmul_rows(xs, &lin.weight().t()?)?;
    match lin.bias() {
        Some(b) => Ok(h.broadcast_add(b)?),
        None => Ok(h),
    }
}

/// Gathers the source row of every edge.
pub fn src_messages(xs: &Tensor, g: &RelGraph) -> Result<Tensor> {
    if g.num_edges == 0 {
        return Ok(Tensor::zeros((0, xs.dim(1)?), xs.dtype(), xs.device())?);
    }
    Ok(xs.index_select(&g.edge_index.i((0, ..))?, 0)?)
}

/// Sums per-edge messages into their destinations.
pub fn sum_edge_agg(msgs: &Tensor, g: &RelGraph) -> Result<Tensor> {
    let out = Tensor::zeros((g.num_dst, msgs.dim(1)?), msgs.dtype(), msgs.device())?;
    if g.num_edges == 0 || g.num_dst == 0 {
        return Ok(out);
    }
    Ok(out.index_add(&g.edge_index.i((1, ..))?, msgs, 0)?)
}

/// Averages per-edge messages over the in-edges of each destination.
/// Destinations without in-edges get zeros.
pub fn mean_edge_agg(msgs: &Tensor, g: &RelGraph) -> Result<Tensor> {
    let summed = sum_edge_agg(msgs, g)?;
    if g.num_edges == 0 || g.num_dst == 0 {
        return Ok(summed);
    }
    let dst = g.edge_index.i((1, ..))?;
    let ones = Tensor::ones((g.num_edges, 1), DType::F32, msgs.device())?;
    let degree = Tensor::zeros((g.num_dst, 1), DType::F32, msgs.device())?
        .index_add(&dst, &ones, 0)?
        .maximum(1f64)?
        .to_dtype(msgs.dtype())?;
    Ok(summed.broadcast_div(&degree)?)
}

pub fn sum_agg(xs: &Tensor, g: &RelGraph) -> Result<Tensor> {
    sum_edge_agg(&src_messages(xs, g)?, g)
}

pub fn mean_agg(xs: &Tensor, g: &RelGraph) -> Result<Tensor> {
    mean_edge_agg(&src_messages(xs, g)?, g)
}

/// Applies `f` to every tensor of a node map.
pub fn apply<F>(xs: &NodeMap<Tensor>, f: F) -> Result<NodeMap<Tensor>>
where
    F: Fn(&str, &Tensor) -> Result<Tensor>,
{
    xs.iter().map(|(k, x)| Ok((k.clone(), f(k, x)?))).collect()
}
