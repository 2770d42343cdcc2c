mod traits;
pub use traits::*;
pub mod utils;

mod rel_conv;
pub use rel_conv::{EdgeFeatOp, GraphConvRel};
mod hetero_conv;
pub use hetero_conv::{Aggregate, AggregateFn, ConvInput, HeteroGraphConv, ModuleRegistry};
mod ngnn;
pub use ngnn::NgnnMlp;

mod encoder;
pub use encoder::{RelGraphConvEncoder, RelGraphConvLayer, RelGraphConvParams};
mod embed;
pub use embed::{
    compute_node_input_embeddings, EdgeEncoderInputLayer, FeatSize, NodeEncoderInputLayer,
    NodeEncoderParams, NodeInputLayer, PureLearnableInputLayer, SparseEmbedding,
};
