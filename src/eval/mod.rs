use candle_core::{Device, Tensor};

use crate::dist::{Communicator, HostBuffer};
use crate::Result;

mod lp;
pub use lp::*;

mod metrics;
pub use metrics::*;

/// Exchanges rows between workers: every worker receives the rows of all
/// workers concatenated in rank order. The trailing dimensions and the
/// dtype must agree; values come back unchanged.
pub fn broadcast_data(comm: &dyn Communicator, data: &Tensor) -> Result<Tensor> {
    if comm.world_size() == 1 {
        return Ok(data.clone());
    }
    let dims = data.dims().to_vec();
    let mut sizes = vec![0u64; comm.world_size()];
    sizes[comm.rank()] = dims.first().copied().unwrap_or(0) as u64;
    let sizes = comm.all_reduce_sum(&sizes)?;

    let payload = HostBuffer::from_tensor(data, data.dtype())?;
    let parts = comm
        .all_gather(payload)?
        .into_iter()
        .zip(sizes)
        .map(|(part, rows)| {
            let mut shape = dims.clone();
            if let Some(first) = shape.first_mut() {
                *first = rows as usize;
            }
            part.into_tensor(shape, data.dtype(), &Device::Cpu)
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Tensor::cat(&parts, 0)?.to_device(data.device())?)
}
