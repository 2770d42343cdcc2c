use candle_core::{DType, Device, Tensor};

use crate::Result;

/// Indices of the non-zero entries of a `u8` mask.
pub fn mask_to_index(mask: &Tensor) -> Result<Vec<u32>> {
    Ok(mask
        .to_dtype(DType::U8)?
        .to_vec1()?
        .into_iter()
        .enumerate()
        .filter_map(|(idx, m): (_, u8)| if m == 0 { None } else { Some(idx as u32) })
        .collect())
}

/// Boolean view of a `u8` mask.
pub fn mask_to_bools(mask: &Tensor) -> Result<Vec<bool>> {
    Ok(mask
        .to_dtype(DType::U8)?
        .to_vec1::<u8>()?
        .into_iter()
        .map(|m| m != 0)
        .collect())
}

/// Selects rows `ids` of `xs` onto `device`. An empty id list yields a
/// `(0, ..)` tensor of the same trailing shape and dtype.
pub fn gather_rows(xs: &Tensor, ids: &[u32], device: &Device) -> Result<Tensor> {
    if ids.is_empty() {
        let mut dims = xs.dims().to_vec();
        dims[0] = 0;
        return Ok(Tensor::zeros(dims, xs.dtype(), device)?);
    }
    let index = Tensor::new(ids, xs.device())?;
    Ok(xs.index_select(&index, 0)?.to_device(device)?)
}

/// `xs @ ws`, tolerating zero-row inputs.
pub fn matmul_rows(xs: &Tensor, ws: &Tensor) -> Result<Tensor> {
    let rows = xs.dim(0)?;
    let out_dim = ws.dim(1)?;
    if rows == 0 {
        return Ok(Tensor::zeros((0, out_dim), ws.dtype(), xs.device())?);
    }
    Ok(xs.to_dtype(ws.dtype())?.matmul(ws)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks() -> Result<()> {
        let mask = Tensor::new(&[0u8, 1, 1, 0], &Device::Cpu)?;
        assert_eq!(mask_to_index(&mask)?, vec![1, 2]);
        assert_eq!(mask_to_bools(&mask)?, vec![false, true, true, false]);
        Ok(())
    }

    #[test]
    fn gather_empty_keeps_shape() -> Result<()> {
        let xs = Tensor::ones((3, 4), DType::F32, &Device::Cpu)?;
        assert_eq!(gather_rows(&xs, &[], &Device::Cpu)?.dims(), &[0, 4]);
        assert_eq!(gather_rows(&xs, &[2, 0], &Device::Cpu)?.dims(), &[2, 4]);
        Ok(())
    }

    #[test]
    fn matmul_zero_rows() -> Result<()> {
        let xs = Tensor::zeros((0, 4), DType::F32, &Device::Cpu)?;
        let ws = Tensor::ones((4, 2), DType::F32, &Device::Cpu)?;
        assert_eq!(matmul_rows(&xs, &ws)?.dims(), &[0, 2]);
        Ok(())
    }
}
