use candle_core::{DType, Device, Tensor, D};

use crate::{Error, Result};

fn squeeze_col(xs: &Tensor) -> Result<Tensor> {
    Ok(match xs.dims() {
        [_, 1] => xs.squeeze(1)?,
        _ => xs.clone(),
    })
}

fn check_shape(pred: &Tensor, labels: &Tensor) -> Result<()> {
    if pred.dims() != labels.dims() {
        return Err(Error::ShapeMismatch {
            name: "prediction".to_string(),
            expected: labels.dims().to_vec(),
            actual: pred.dims().to_vec(),
        });
    }
    if labels.elem_count() == 0 {
        return Err(Error::Config("cannot evaluate on zero labels".to_string()));
    }
    Ok(())
}

fn mean(xs: &Tensor) -> Result<f64> {
    Ok(xs
        .to_device(&Device::Cpu)?
        .to_dtype(DType::F64)?
        .mean_all()?
        .to_scalar::<f64>()?)
}

/// Accuracy of `pred` against 1-D integer `labels`.
///
/// `pred` holds either class ids (1-D, or `(n, 1)`) or logits `(n, c)`, which
/// are reduced with argmax.
pub fn compute_acc(pred: &Tensor, labels: &Tensor) -> Result<f64> {
    let pred = match pred.dims() {
        [_, c] if *c > 1 => {
            if !pred.dtype().is_float() {
                return Err(Error::Config(format!(
                    "logits are expected to be floats, got {:?}",
                    pred.dtype()
                )));
            }
            pred.argmax(D::Minus1)?
        }
        _ => squeeze_col(pred)?,
    };
    if pred.dtype().is_float() {
        return Err(Error::Config(
            "1D predictions are expected to be integer type".to_string(),
        ));
    }
    let labels = squeeze_col(labels)?;
    check_shape(&pred, &labels)?;
    let is_ok = pred
        .to_dtype(DType::I64)?
        .eq(&labels.to_dtype(DType::I64)?)?
        .to_dtype(DType::F64)?;
    mean(&is_ok)
}

/// Number of positive labels among the `k` highest scored predictions of a
/// binary classifier. `preds` is `(n, 1)` or `(n, 2)`; in the latter case
/// column 1 is the positive score.
pub fn compute_hit_at_classification(preds: &Tensor, labels: &Tensor, k: usize) -> Result<f64> {
    let scores = match preds.dims() {
        [_, 2] => preds.narrow(1, 1, 1)?.squeeze(1)?,
        [_, 1] => preds.squeeze(1)?,
        dims => {
            return Err(Error::ShapeMismatch {
                name: "prediction".to_string(),
                expected: vec![dims.first().copied().unwrap_or(0), 2],
                actual: dims.to_vec(),
            })
        }
    };
    let labels = squeeze_col(labels)?;
    check_shape(&scores, &labels)?;
    let order = scores.to_dtype(DType::F32)?.arg_sort_last_dim(false)?;
    let k = k.min(order.dim(0)?);
    let hits = labels.index_select(&order.narrow(0, 0, k)?, 0)?;
    Ok(hits.to_dtype(DType::F64)?.sum_all()?.to_scalar::<f64>()?)
}

fn regression_diff(pred: &Tensor, labels: &Tensor) -> Result<Tensor> {
    if !pred.dtype().is_float() || !labels.dtype().is_float() {
        return Err(Error::Config(
            "prediction and labels must be floating points".to_string(),
        ));
    }
    let pred = match labels.rank() {
        1 => squeeze_col(pred)?,
        _ => pred.clone(),
    };
    check_shape(&pred, labels)?;
    if pred.dtype() != labels.dtype() {
        tracing::warn!(
            pred = ?pred.dtype(),
            labels = ?labels.dtype(),
            "prediction and labels have different data types"
        );
    }
    let pred = pred.to_device(&Device::Cpu)?.to_dtype(DType::F64)?;
    let labels = labels.to_device(&Device::Cpu)?.to_dtype(DType::F64)?;
    Ok((pred - labels)?)
}

pub fn compute_mse(pred: &Tensor, labels: &Tensor) -> Result<f64> {
    mean(&regression_diff(pred, labels)?.sqr()?)
}

pub fn compute_rmse(pred: &Tensor, labels: &Tensor) -> Result<f64> {
    Ok(compute_mse(pred, labels)?.sqrt())
}

pub fn compute_mae(pred: &Tensor, labels: &Tensor) -> Result<f64> {
    mean(&regression_diff(pred, labels)?.abs()?)
}
