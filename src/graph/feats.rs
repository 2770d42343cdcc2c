use candle_core::{Device, Tensor};

use crate::sampling::Block;
use crate::utils::gather_rows;
use crate::{EdgeMap, NodeMap, Result};

use super::HeteroGraph;

/// Which node data fields hold input features.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FeatField {
    #[default]
    None,
    /// The same field names for every node type.
    Shared(Vec<String>),
    PerType(NodeMap<Vec<String>>),
}

impl FeatField {
    pub fn shared(name: &str) -> Self {
        Self::Shared(vec![name.to_string()])
    }

    pub fn fields(&self, ntype: &str) -> &[String] {
        match self {
            Self::None => &[],
            Self::Shared(names) => names,
            Self::PerType(map) => map.get(ntype).map(Vec::as_slice).unwrap_or(&[]),
        }
    }
}

/// Gathers the input features of `input_nodes`: one tensor per configured
/// field found on the node type. Node types without features are omitted.
pub fn prepare_batch_input(
    g: &HeteroGraph,
    input_nodes: &NodeMap<Vec<u32>>,
    feat_field: &FeatField,
    device: &Device,
) -> Result<NodeMap<Vec<Tensor>>> {
    let mut feats = NodeMap::new();
    for (ntype, ids) in input_nodes {
        let fields: Vec<Tensor> = feat_field
            .fields(ntype)
            .iter()
            .filter_map(|name| g.node_data(ntype, name))
            .map(|data| gather_rows(&as_2d(data)?, ids, device))
            .collect::<Result<_>>()?;
        if !fields.is_empty() {
            feats.insert(ntype.clone(), fields);
        }
    }
    Ok(feats)
}

/// Gathers the edge features of every sampled edge, per block. Multiple
/// fields of one edge type are concatenated.
pub fn prepare_edge_input(
    g: &HeteroGraph,
    blocks: &[Block],
    edge_feat_field: &EdgeMap<Vec<String>>,
    device: &Device,
) -> Result<Vec<EdgeMap<Tensor>>> {
    blocks
        .iter()
        .map(|block| {
            let mut feats = EdgeMap::new();
            for (etype, names) in edge_feat_field {
                let Some(edges) = block.edges(etype) else {
                    continue;
                };
                let parts: Vec<Tensor> = names
                    .iter()
                    .filter_map(|name| g.edge_data(etype, name))
                    .map(|data| gather_rows(&as_2d(data)?, &edges.eids, device))
                    .collect::<Result<_>>()?;
                if !parts.is_empty() {
                    feats.insert(etype.clone(), Tensor::cat(&parts, 1)?);
                }
            }
            Ok(feats)
        })
        .collect()
}

fn as_2d(data: &Tensor) -> Result<Tensor> {
    Ok(match data.rank() {
        1 => data.unsqueeze(1)?,
        _ => data.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    #[test]
    fn gathers_only_featured_types() -> Result<()> {
        let mut g = HeteroGraph::new([("user", 3), ("item", 2)]);
        g.set_node_data(
            "user",
            "feat",
            Tensor::new(&[[0f32, 0.], [1., 1.], [2., 2.]], &Device::Cpu)?,
        )?;
        g.set_node_data("user", "age", Tensor::new(&[10f32, 20., 30.], &Device::Cpu)?)?;
        let input = NodeMap::from([
            ("user".to_string(), vec![2, 0]),
            ("item".to_string(), vec![1]),
        ]);
        let field = FeatField::Shared(vec!["feat".into(), "age".into()]);
        let feats = prepare_batch_input(&g, &input, &field, &Device::Cpu)?;
        assert!(!feats.contains_key("item"));
        let user = &feats["user"];
        assert_eq!(user.len(), 2);
        assert_eq!(user[0].to_vec2::<f32>()?, vec![vec![2., 2.], vec![0., 0.]]);
        assert_eq!(user[1].to_vec2::<f32>()?, vec![vec![30.], vec![10.]]);

        let empty = NodeMap::from([("user".to_string(), vec![])]);
        let feats = prepare_batch_input(&g, &empty, &FeatField::shared("feat"), &Device::Cpu)?;
        assert_eq!(feats["user"][0].dims(), &[0, 2]);
        assert_eq!(feats["user"][0].dtype(), DType::F32);
        Ok(())
    }
}
