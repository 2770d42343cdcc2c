use candle_core::{DType, Device, Tensor, D};
use serde::Serialize;

use crate::{Error, Result};

/// `sum(head * tail)` per row.
pub fn calc_dot_pos_score(h_emb: &Tensor, t_emb: &Tensor) -> Result<Tensor> {
    Ok((h_emb * t_emb)?.sum(D::Minus1)?)
}

/// DistMult score `sum(head * relation * tail)` per row; `r_emb` may be a
/// single relation vector broadcast over all rows.
pub fn calc_distmult_pos_score(h_emb: &Tensor, t_emb: &Tensor, r_emb: &Tensor) -> Result<Tensor> {
    Ok(h_emb
        .broadcast_mul(r_emb)?
        .broadcast_mul(t_emb)?
        .sum(D::Minus1)?)
}

/// 1-based rank of each positive score among its row of negative scores,
/// after a sigmoid, highest first.
///
/// `pos_score` has one score per edge, `neg_score` is `(num_edges, num_neg)`.
pub fn calc_ranking(pos_score: &Tensor, neg_score: &Tensor) -> Result<Tensor> {
    let pos_score = pos_score.reshape(((), 1))?;
    let scores = Tensor::cat(&[&pos_score, neg_score], 1)?;
    let scores = candle_nn::ops::sigmoid(&scores.to_dtype(DType::F32)?)?;
    let order = scores.arg_sort_last_dim(false)?.to_vec2::<u32>()?;
    let ranking = order
        .iter()
        .map(|row| row.iter().position(|&i| i == 0).unwrap_or(0) as u32 + 1)
        .collect::<Vec<_>>();
    Ok(Tensor::new(ranking, &Device::Cpu)?)
}

fn ranking_values(ranking: &Tensor) -> Result<Vec<f64>> {
    let ranking = match ranking.dims() {
        [_] => ranking.clone(),
        [_, 1] => ranking.squeeze(1)?,
        dims => {
            return Err(Error::ShapeMismatch {
                name: "ranking".to_string(),
                expected: vec![dims.first().copied().unwrap_or(0)],
                actual: dims.to_vec(),
            })
        }
    };
    let values = ranking
        .to_device(&Device::Cpu)?
        .to_dtype(DType::F64)?
        .to_vec1::<f64>()?;
    if values.is_empty() {
        return Err(Error::Config("cannot evaluate an empty ranking".to_string()));
    }
    Ok(values)
}

/// Mean reciprocal rank.
pub fn compute_mrr(ranking: &Tensor) -> Result<f64> {
    let values = ranking_values(ranking)?;
    Ok(values.iter().map(|r| 1.0 / r).sum::<f64>() / values.len() as f64)
}

/// Fraction of positive edges ranked within the top `k`.
pub fn compute_hit_at_link_prediction(ranking: &Tensor, k: usize) -> Result<f64> {
    let values = ranking_values(ranking)?;
    let hits = values.iter().filter(|&&r| r <= k as f64).count();
    Ok(hits as f64 / values.len() as f64)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LinkPredictionScore {
    pub mrr: f64,
    pub mr: f64,
    #[serde(rename = "hits@1")]
    pub hits_at_1: f64,
    #[serde(rename = "hits@3")]
    pub hits_at_3: f64,
    #[serde(rename = "hits@10")]
    pub hits_at_10: f64,
}

pub fn gen_lp_score(ranking: &Tensor) -> Result<LinkPredictionScore> {
    let values = ranking_values(ranking)?;
    let n = values.len() as f64;
    Ok(LinkPredictionScore {
        mrr: compute_mrr(ranking)?,
        mr: values.iter().sum::<f64>() / n,
        hits_at_1: compute_hit_at_link_prediction(ranking, 1)?,
        hits_at_3: compute_hit_at_link_prediction(ranking, 3)?,
        hits_at_10: compute_hit_at_link_prediction(ranking, 10)?,
    })
}
