use std::collections::BTreeMap;

pub mod dist;
pub mod eval;
pub mod graph;
pub mod inference;
pub mod nn;
pub mod sampling;
pub mod utils;

mod error;
pub use error::{Error, Result};

/// `(source node type, relation, destination node type)`.
pub type CanonicalEtype = (String, String, String);

/// Values keyed by node type.
pub type NodeMap<T> = BTreeMap<String, T>;

/// Values keyed by canonical edge type.
pub type EdgeMap<T> = BTreeMap<CanonicalEtype, T>;

pub fn canonical_etype(src: &str, rel: &str, dst: &str) -> CanonicalEtype {
    (src.to_string(), rel.to_string(), dst.to_string())
}
