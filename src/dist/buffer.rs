use candle_core::{DType, Device, Shape, Tensor};

use crate::{Error, Result};

/// Flat host copy of tensor data.
///
/// Integer dtypes are held as `i64`, `F64` as `f64` and the other float
/// dtypes as `f32`, so every supported dtype converts back without loss.
#[derive(Debug, Clone, PartialEq)]
pub enum HostBuffer {
    I64(Vec<i64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl HostBuffer {
    /// The dtype rows of `dtype` are held in.
    pub fn storage_dtype(dtype: DType) -> DType {
        if dtype.is_int() {
            DType::I64
        } else if dtype == DType::F64 {
            DType::F64
        } else {
            DType::F32
        }
    }

    pub fn zeros(dtype: DType, len: usize) -> Self {
        match Self::storage_dtype(dtype) {
            DType::I64 => Self::I64(vec![0; len]),
            DType::F64 => Self::F64(vec![0.0; len]),
            _ => Self::F32(vec![0.0; len]),
        }
    }

    /// Flattens `xs`, converting it to the storage of `dtype`.
    pub fn from_tensor(xs: &Tensor, dtype: DType) -> Result<Self> {
        let xs = xs.to_device(&Device::Cpu)?.flatten_all()?;
        Ok(match Self::storage_dtype(dtype) {
            DType::I64 => Self::I64(xs.to_dtype(DType::I64)?.to_vec1()?),
            DType::F64 => Self::F64(xs.to_dtype(DType::F64)?.to_vec1()?),
            _ => Self::F32(xs.to_dtype(DType::F32)?.to_vec1()?),
        })
    }

    pub fn dtype(&self) -> DType {
        match self {
            Self::I64(_) => DType::I64,
            Self::F32(_) => DType::F32,
            Self::F64(_) => DType::F64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::I64(v) => v.len(),
            Self::F32(v) => v.len(),
            Self::F64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_tensor<S: Into<Shape>>(
        self,
        shape: S,
        dtype: DType,
        device: &Device,
    ) -> Result<Tensor> {
        let xs = match self {
            Self::I64(v) => Tensor::from_vec(v, shape, &Device::Cpu)?,
            Self::F32(v) => Tensor::from_vec(v, shape, &Device::Cpu)?,
            Self::F64(v) => Tensor::from_vec(v, shape, &Device::Cpu)?,
        };
        Ok(xs.to_dtype(dtype)?.to_device(device)?)
    }

    /// Copies row `i` of `src` into row `rows[i]` of `self`.
    pub(crate) fn scatter_rows(&mut self, rows: &[u32], src: &HostBuffer, dim: usize) -> Result<()> {
        match (self, src) {
            (Self::I64(dst), Self::I64(src)) => scatter(dst, rows, src, dim),
            (Self::F32(dst), Self::F32(src)) => scatter(dst, rows, src, dim),
            (Self::F64(dst), Self::F64(src)) => scatter(dst, rows, src, dim),
            (dst, src) => {
                return Err(Error::Config(format!(
                    "cannot copy {:?} rows into a {:?} buffer",
                    src.dtype(),
                    dst.dtype()
                )))
            }
        }
        Ok(())
    }

    /// The rows `rows` of `self`, in order.
    pub(crate) fn gather_rows(&self, rows: &[u32], dim: usize) -> Self {
        match self {
            Self::I64(v) => Self::I64(gather(v, rows, dim)),
            Self::F32(v) => Self::F32(gather(v, rows, dim)),
            Self::F64(v) => Self::F64(gather(v, rows, dim)),
        }
    }
}

fn scatter<T: Copy>(dst: &mut [T], rows: &[u32], src: &[T], dim: usize) {
    for (i, &row) in rows.iter().enumerate() {
        let row = row as usize;
        dst[row * dim..(row + 1) * dim].copy_from_slice(&src[i * dim..(i + 1) * dim]);
    }
}

fn gather<T: Copy>(src: &[T], rows: &[u32], dim: usize) -> Vec<T> {
    let mut out = Vec::with_capacity(rows.len() * dim);
    for &row in rows {
        let row = row as usize;
        out.extend_from_slice(&src[row * dim..(row + 1) * dim]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_keeps_values() -> Result<()> {
        assert_eq!(HostBuffer::storage_dtype(DType::U32), DType::I64);
        assert_eq!(HostBuffer::storage_dtype(DType::BF16), DType::F32);

        let ids = Tensor::new(&[16_777_217i64, 1 << 40], &Device::Cpu)?;
        let buf = HostBuffer::from_tensor(&ids, DType::I64)?;
        assert_eq!(buf, HostBuffer::I64(vec![16_777_217, 1 << 40]));

        let mut table = HostBuffer::zeros(DType::F64, 6);
        let row = Tensor::new(&[1.000000000001f64, 2.], &Device::Cpu)?;
        table.scatter_rows(&[2], &HostBuffer::from_tensor(&row, DType::F64)?, 2)?;
        let out = table
            .gather_rows(&[2, 0], 2)
            .into_tensor((2, 2), DType::F64, &Device::Cpu)?;
        assert_eq!(out.to_vec2::<f64>()?, vec![vec![1.000000000001, 2.], vec![0., 0.]]);

        let floats = HostBuffer::zeros(DType::F32, 2);
        assert!(table.scatter_rows(&[0], &floats, 2).is_err());
        Ok(())
    }
}
