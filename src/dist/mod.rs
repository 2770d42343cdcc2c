mod buffer;
pub use buffer::*;

mod comm;
pub use comm::*;

mod partition;
pub use partition::*;

mod tensor;
pub use tensor::*;
