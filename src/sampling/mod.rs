mod block;
pub use block::*;

mod dataloader;
pub use dataloader::*;

mod fanout;
pub use fanout::*;

mod sampler;
pub use sampler::*;
