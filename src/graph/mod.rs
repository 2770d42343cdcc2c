mod dist_graph;
pub use dist_graph::*;

mod feats;
pub use feats::*;

mod hetero;
pub use hetero::*;
