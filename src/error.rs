use crate::CanonicalEtype;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("cannot find module with edge type ({}, {}, {})", .etype.0, .etype.1, .etype.2)]
    UnknownEdgeType { etype: CanonicalEtype },

    #[error("unknown node type {0}")]
    UnknownNodeType(String),

    #[error("shape mismatch for {name}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("rank {rank} cannot write row {node} of {name}: owned by rank {owner}")]
    NotOwner {
        name: String,
        node: u32,
        rank: usize,
        owner: usize,
    },

    #[error("node {node} out of range for node type {ntype} with {num_nodes} nodes")]
    NodeOutOfRange {
        ntype: String,
        node: u32,
        num_nodes: usize,
    },

    #[error("cannot infer the hidden dim size: {0}")]
    DimInference(String),

    #[error("distributed tensor {0} is persistent and cannot be dropped")]
    PersistentDrop(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("communication error: {0}")]
    Comm(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
