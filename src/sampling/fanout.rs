use std::str::FromStr;

use itertools::Itertools;

use crate::{CanonicalEtype, EdgeMap, Error, Result};

/// Neighbors sampled per node per layer; `All` is written `-1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fanout {
    All,
    Limit(usize),
}

impl Fanout {
    pub fn from_i64(value: i64) -> Result<Self> {
        match value {
            -1 => Ok(Self::All),
            v if v >= 0 => Ok(Self::Limit(v as usize)),
            v => Err(Error::Config(format!("invalid fanout {v}"))),
        }
    }

    pub fn limit(&self) -> Option<usize> {
        match self {
            Self::All => None,
            Self::Limit(k) => Some(*k),
        }
    }
}

impl FromStr for Fanout {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        let v: i64 = s
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("fanout {s:?} is not an integer")))?;
        Self::from_i64(v)
    }
}

/// The fanout of one layer, uniform or per edge type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerFanout {
    Uniform(Fanout),
    /// Edge types missing from the map are not sampled.
    PerEtype(EdgeMap<Fanout>),
}

impl LayerFanout {
    pub fn for_etype(&self, etype: &CanonicalEtype) -> Fanout {
        match self {
            Self::Uniform(f) => *f,
            Self::PerEtype(map) => map.get(etype).copied().unwrap_or(Fanout::Limit(0)),
        }
    }
}

impl From<Fanout> for LayerFanout {
    fn from(f: Fanout) -> Self {
        Self::Uniform(f)
    }
}

/// `-1` for every one of `num_layers` layers.
pub fn full_fanout(num_layers: usize) -> Vec<LayerFanout> {
    vec![LayerFanout::Uniform(Fanout::All); num_layers]
}

/// Parses `"10,20"`, `"-1,10"`, or per edge type
/// `"user/buys/item:10@item/rev-buys/user:5,user/buys/item:-1"`.
/// Layers are separated by `,`, edge types within a layer by `@`.
pub fn parse_fanout(text: &str) -> Result<Vec<LayerFanout>> {
    text.split(',')
        .map(|layer| {
            let layer = layer.trim();
            if !layer.contains(':') {
                return Ok(LayerFanout::Uniform(layer.parse()?));
            }
            let map = layer
                .split('@')
                .map(|item| {
                    let (etype, fanout) = item.split_once(':').ok_or_else(|| {
                        Error::Config(format!("fanout entry {item:?} lacks ':'"))
                    })?;
                    let parts = etype.split('/').map(str::trim).collect_vec();
                    if parts.len() != 3 || parts.iter().any(|p| p.is_empty()) {
                        return Err(Error::Config(format!(
                            "edge type {etype:?} must be src/relation/dst"
                        )));
                    }
                    let etype = (parts[0].into(), parts[1].into(), parts[2].into());
                    Ok((etype, fanout.parse()?))
                })
                .collect::<Result<EdgeMap<Fanout>>>()?;
            Ok(LayerFanout::PerEtype(map))
        })
        .collect()
}
