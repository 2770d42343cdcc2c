use std::time::Instant;

use candle_core::{DType, Device, Tensor};
use candle_nn::{Activation, Dropout, Init, Linear, Module, ModuleT, VarBuilder};

use super::utils::{linear_rows, xavier};
use super::NgnnMlp;
use crate::dist::DistTensor;
use crate::graph::{prepare_batch_input, DistGraph, FeatField};
use crate::inference::TaskTracker;
use crate::utils::matmul_rows;
use crate::{EdgeMap, Error, NodeMap, Result};

/// Learnable per-node embeddings kept in a distributed tensor. Every worker
/// initialises the rows it owns uniformly in `[-1, 1]`.
#[derive(Debug, Clone)]
pub struct SparseEmbedding {
    table: DistTensor,
}

impl SparseEmbedding {
    /// Collective: every worker of the group must call this.
    pub fn new(g: &DistGraph, ntype: &str, embed_size: usize) -> Result<Self> {
        let policy = g.partition_policy(ntype)?;
        let table = g.store().create(
            &format!("embed_{ntype}"),
            (policy.num_nodes(), embed_size),
            DType::F32,
            policy,
            true,
        )?;
        let local = g.node_split(ntype)?;
        if !local.is_empty() {
            let init = Tensor::rand(-1f32, 1f32, (local.len(), embed_size), &Device::Cpu)?;
            table.write(g.rank(), &local, &init)?;
        }
        if g.rank() == 0 {
            tracing::debug!(ntype, embed_size, "use additional sparse embeddings");
        }
        g.barrier()?;
        Ok(Self { table })
    }

    pub fn embedding_dim(&self) -> usize {
        self.table.dim()
    }

    pub fn table(&self) -> &DistTensor {
        &self.table
    }

    /// Rows of `ids`; zero ids give a `(0, embedding_dim)` tensor.
    pub fn lookup(&self, ids: &[u32], device: &Device) -> Result<Tensor> {
        self.table.read(ids, device)
    }
}

/// Feature size of a node type: one flat feature vector or several
/// feature groups each encoded on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeatSize {
    Dim(usize),
    Groups(Vec<usize>),
}

/// Produces the layer-0 embeddings of the input nodes.
pub trait NodeInputLayer: Send + Sync {
    /// `feats` holds one tensor per feature field (or group) of each node
    /// type that has features; node types without output are left out.
    fn forward(
        &self,
        feats: &NodeMap<Vec<Tensor>>,
        input_nodes: &NodeMap<Vec<u32>>,
    ) -> Result<NodeMap<Tensor>>;
    fn out_dims(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct NodeEncoderParams {
    pub activation: Option<Activation>,
    pub dropout: f32,
    /// Concatenate a learnable embedding to the features of every node type.
    pub use_node_embeddings: bool,
    /// Featureless node types that get no learnable embedding.
    pub force_no_embeddings: Vec<String>,
    pub num_ffn_layers_in_input: usize,
    pub ffn_activation: Activation,
}

impl Default for NodeEncoderParams {
    fn default() -> Self {
        Self {
            activation: None,
            dropout: 0.0,
            use_node_embeddings: false,
            force_no_embeddings: Vec::new(),
            num_ffn_layers_in_input: 0,
            ffn_activation: Activation::Relu,
        }
    }
}

/// Projects node features, feature groups and learnable embeddings into a
/// common embedding size.
pub struct NodeEncoderInputLayer {
    embed_size: usize,
    input_projs: NodeMap<Tensor>,
    feat_group_projs: NodeMap<Vec<Linear>>,
    proj_matrix: NodeMap<Tensor>,
    sparse_embeds: NodeMap<SparseEmbedding>,
    ngnn: NodeMap<NgnnMlp>,
    activation: Option<Activation>,
    dropout: Dropout,
    use_node_embeddings: bool,
    device: Device,
}

impl NodeEncoderInputLayer {
    pub fn new(
        g: &DistGraph,
        feat_size: &NodeMap<FeatSize>,
        embed_size: usize,
        params: NodeEncoderParams,
        vs: VarBuilder,
    ) -> Result<Self> {
        let relu_gain = 2f64.sqrt();
        let mut input_projs = NodeMap::new();
        let mut feat_group_projs = NodeMap::new();
        let mut proj_matrix = NodeMap::new();
        let mut sparse_embeds = NodeMap::new();
        let mut ngnn = NodeMap::new();

        for ntype in g.ntypes() {
            let vs = vs.pp(&ntype);
            match feat_size.get(&ntype) {
                Some(&FeatSize::Dim(dim)) if dim > 0 => {
                    if g.rank() == 0 {
                        tracing::debug!(ntype = ntype.as_str(), dim, "node type has features");
                    }
                    let w = xavier(dim, embed_size, relu_gain, "input_proj", &vs)?;
                    input_projs.insert(ntype.clone(), w);
                    if params.use_node_embeddings {
                        sparse_embeds
                            .insert(ntype.clone(), SparseEmbedding::new(g, &ntype, embed_size)?);
                        let w = xavier(2 * embed_size, embed_size, relu_gain, "proj_matrix", &vs)?;
                        proj_matrix.insert(ntype.clone(), w);
                    }
                }
                None | Some(FeatSize::Dim(_)) => {
                    if !params.force_no_embeddings.contains(&ntype) {
                        sparse_embeds
                            .insert(ntype.clone(), SparseEmbedding::new(g, &ntype, embed_size)?);
                        let w = xavier(embed_size, embed_size, relu_gain, "proj_matrix", &vs)?;
                        proj_matrix.insert(ntype.clone(), w);
                    }
                }
                Some(FeatSize::Groups(sizes)) => {
                    let projs = sizes
                        .iter()
                        .enumerate()
                        .map(|(i, &size)| {
                            let vs = vs.pp(format!("group[{i}]"));
                            let weight =
                                xavier(size, embed_size, relu_gain, "weight", &vs)?.t()?;
                            let bias = vs.get_with_hints(embed_size, "bias", Init::Const(0.0))?;
                            Ok(Linear::new(weight, Some(bias)))
                        })
                        .collect::<Result<Vec<_>>>()?;
                    let mut combine_dim = embed_size * projs.len();
                    feat_group_projs.insert(ntype.clone(), projs);
                    if params.use_node_embeddings {
                        sparse_embeds
                            .insert(ntype.clone(), SparseEmbedding::new(g, &ntype, embed_size)?);
                        combine_dim += embed_size;
                    }
                    let w = xavier(combine_dim, embed_size, relu_gain, "proj_matrix", &vs)?;
                    proj_matrix.insert(ntype.clone(), w);
                }
            }
            let mlp = NgnnMlp::new(
                embed_size,
                params.num_ffn_layers_in_input,
                params.ffn_activation,
                params.dropout,
                vs.pp("ngnn"),
            )?;
            ngnn.insert(ntype, mlp);
        }

        Ok(Self {
            embed_size,
            input_projs,
            feat_group_projs,
            proj_matrix,
            sparse_embeds,
            ngnn,
            activation: params.activation,
            dropout: Dropout::new(params.dropout),
            use_node_embeddings: params.use_node_embeddings,
            device: vs.device().clone(),
        })
    }

    fn sparse(&self, ntype: &str) -> Result<&SparseEmbedding> {
        self.sparse_embeds.get(ntype).ok_or_else(|| {
            Error::Config(format!("node type {ntype} needs a sparse embedding"))
        })
    }

    fn proj(&self, ntype: &str) -> Result<&Tensor> {
        self.proj_matrix
            .get(ntype)
            .ok_or_else(|| Error::Config(format!("node type {ntype} has no projection")))
    }

    fn embed_with_feats(&self, ntype: &str, feats: &[Tensor], ids: &[u32]) -> Result<Tensor> {
        let feats = feats
            .iter()
            .map(|f| f.to_dtype(DType::F32))
            .collect::<candle_core::Result<Vec<_>>>()?;
        if let Some(w) = self.input_projs.get(ntype) {
            let emb = matmul_rows(&Tensor::cat(&feats, 1)?, w)?;
            if !self.use_node_embeddings {
                return Ok(emb);
            }
            let node_emb = self.sparse(ntype)?.lookup(ids, emb.device())?;
            return matmul_rows(&Tensor::cat(&[emb, node_emb], 1)?, self.proj(ntype)?);
        }
        if let Some(projs) = self.feat_group_projs.get(ntype) {
            let mut embs = feats
                .iter()
                .zip(projs)
                .map(|(f, proj)| Ok(linear_rows(proj, f)?.relu()?))
                .collect::<Result<Vec<_>>>()?;
            if self.use_node_embeddings {
                embs.push(self.sparse(ntype)?.lookup(ids, &self.device)?);
            }
            return matmul_rows(&Tensor::cat(&embs, 1)?, self.proj(ntype)?);
        }
        Err(Error::Config(format!(
            "node type {ntype} has features but no projection"
        )))
    }
}

impl NodeInputLayer for NodeEncoderInputLayer {
    fn forward(
        &self,
        feats: &NodeMap<Vec<Tensor>>,
        input_nodes: &NodeMap<Vec<u32>>,
    ) -> Result<NodeMap<Tensor>> {
        let mut embs = NodeMap::new();
        for (ntype, ids) in input_nodes {
            let emb = match feats.get(ntype) {
                Some(f) => self.embed_with_feats(ntype, f, ids)?,
                None => match self.sparse_embeds.get(ntype) {
                    Some(_) if ids.is_empty() => {
                        let empty = Tensor::zeros((0, self.embed_size), DType::F32, &self.device)?;
                        embs.insert(ntype.clone(), empty);
                        continue;
                    }
                    Some(sparse) => {
                        matmul_rows(&sparse.lookup(ids, &self.device)?, self.proj(ntype)?)?
                    }
                    None => continue,
                },
            };
            let emb = match &self.activation {
                Some(act) => self.dropout.forward_t(&act.forward(&emb)?, false)?,
                None => emb,
            };
            embs.insert(ntype.clone(), emb);
        }
        embs.into_iter()
            .map(|(ntype, h)| {
                let h = match self.ngnn.get(&ntype) {
                    Some(mlp) => mlp.forward_t(&h, false)?,
                    None => h,
                };
                Ok((ntype, h))
            })
            .collect()
    }

    fn out_dims(&self) -> usize {
        self.embed_size
    }
}

/// Learnable embeddings only; node features are ignored.
pub struct PureLearnableInputLayer {
    embed_size: usize,
    sparse_embeds: NodeMap<SparseEmbedding>,
    device: Device,
}

impl PureLearnableInputLayer {
    pub fn new(g: &DistGraph, embed_size: usize, device: &Device) -> Result<Self> {
        let sparse_embeds = g
            .ntypes()
            .into_iter()
            .map(|ntype| {
                let emb = SparseEmbedding::new(g, &ntype, embed_size)?;
                Ok((ntype, emb))
            })
            .collect::<Result<_>>()?;
        Ok(Self {
            embed_size,
            sparse_embeds,
            device: device.clone(),
        })
    }
}

impl NodeInputLayer for PureLearnableInputLayer {
    fn forward(
        &self,
        _feats: &NodeMap<Vec<Tensor>>,
        input_nodes: &NodeMap<Vec<u32>>,
    ) -> Result<NodeMap<Tensor>> {
        input_nodes
            .iter()
            .map(|(ntype, ids)| {
                let sparse = self.sparse_embeds.get(ntype).ok_or_else(|| {
                    Error::Config(format!("the node embeddings of {ntype} are not initialized"))
                })?;
                Ok((ntype.clone(), sparse.lookup(ids, &self.device)?))
            })
            .collect()
    }

    fn out_dims(&self) -> usize {
        self.embed_size
    }
}

/// Projects edge features into the embedding size, per block.
pub struct EdgeEncoderInputLayer {
    embed_size: usize,
    input_projs: EdgeMap<Tensor>,
    ngnn: EdgeMap<NgnnMlp>,
    activation: Option<Activation>,
    dropout: Dropout,
}

impl EdgeEncoderInputLayer {
    pub fn new(
        feat_size: &EdgeMap<usize>,
        embed_size: usize,
        activation: Option<Activation>,
        dropout: f32,
        num_ffn_layers_in_input: usize,
        vs: VarBuilder,
    ) -> Result<Self> {
        let mut input_projs = EdgeMap::new();
        let mut ngnn = EdgeMap::new();
        for (etype, &dim) in feat_size.iter().filter(|(_, &dim)| dim > 0) {
            let vs = vs.pp(format!("{},{},{}", etype.0, etype.1, etype.2));
            input_projs.insert(etype.clone(), xavier(dim, embed_size, 1.0, "input_proj", &vs)?);
            let mlp = NgnnMlp::new(
                embed_size,
                num_ffn_layers_in_input,
                Activation::Relu,
                dropout,
                vs.pp("ngnn"),
            )?;
            ngnn.insert(etype.clone(), mlp);
        }
        Ok(Self {
            embed_size,
            input_projs,
            ngnn,
            activation,
            dropout: Dropout::new(dropout),
        })
    }

    pub fn out_dims(&self) -> usize {
        self.embed_size
    }

    pub fn forward(&self, block_feats: &[EdgeMap<Tensor>]) -> Result<Vec<EdgeMap<Tensor>>> {
        block_feats
            .iter()
            .map(|feats| {
                feats
                    .iter()
                    .map(|(etype, f)| {
                        let w = self.input_projs.get(etype).ok_or_else(|| {
                            Error::UnknownEdgeType {
                                etype: etype.clone(),
                            }
                        })?;
                        let mut emb = matmul_rows(&f.to_dtype(DType::F32)?, w)?;
                        if let Some(act) = &self.activation {
                            emb = act.forward(&emb)?;
                        }
                        emb = self.dropout.forward_t(&emb, false)?;
                        if let Some(mlp) = self.ngnn.get(etype) {
                            emb = mlp.forward_t(&emb, false)?;
                        }
                        Ok((etype.clone(), emb))
                    })
                    .collect()
            })
            .collect()
    }
}

const LOG_EVERY_BATCH: usize = 200;

/// Whether `layer` produces an embedding for `ntype`, checked on node 0.
fn can_embed(
    g: &DistGraph,
    layer: &dyn NodeInputLayer,
    feat_field: &FeatField,
    ntype: &str,
    device: &Device,
) -> Result<bool> {
    if g.number_of_nodes(ntype)? == 0 {
        return Ok(false);
    }
    let first = NodeMap::from([(ntype.to_string(), vec![0u32])]);
    let feats = prepare_batch_input(g.graph(), &first, feat_field, device)?;
    Ok(layer.forward(&feats, &first)?.contains_key(ntype))
}

/// Computes the input embeddings of every node this worker owns into
/// persistent `{ntype}_input_emb` tensors. Node types the layer cannot embed
/// are skipped.
pub fn compute_node_input_embeddings(
    g: &DistGraph,
    batch_size: usize,
    layer: &dyn NodeInputLayer,
    tracker: Option<&dyn TaskTracker>,
    feat_field: &FeatField,
    target_ntypes: Option<&[String]>,
    device: &Device,
) -> Result<NodeMap<DistTensor>> {
    if batch_size == 0 {
        return Err(Error::Config("batch size must be positive".to_string()));
    }
    if g.rank() == 0 {
        tracing::debug!("compute the node input embeddings");
    }
    let start = Instant::now();
    let ntypes = target_ntypes.map_or_else(|| g.ntypes(), <[String]>::to_vec);
    let mut n_embs = NodeMap::new();
    for ntype in ntypes {
        if !can_embed(g, layer, feat_field, &ntype, device)? {
            continue;
        }
        let policy = g.partition_policy(&ntype)?;
        let input_emb = g.store().create(
            &format!("{ntype}_input_emb"),
            (policy.num_nodes(), layer.out_dims()),
            DType::F32,
            policy,
            true,
        )?;
        let infer_nodes = g.node_split(&ntype)?;
        let num_batches = infer_nodes.len().div_ceil(batch_size);
        for (step, chunk) in infer_nodes.chunks(batch_size).enumerate() {
            let iter_start = Instant::now();
            if let Some(tracker) = tracker {
                tracker.keep_alive(step);
            }
            let input = NodeMap::from([(ntype.clone(), chunk.to_vec())]);
            let feats = prepare_batch_input(g.graph(), &input, feat_field, device)?;
            let emb = layer.forward(&feats, &input)?;
            let emb = emb.get(&ntype).ok_or_else(|| {
                Error::DimInference(format!("input layer produced no embedding for {ntype}"))
            })?;
            input_emb.write(g.rank(), chunk, emb)?;
            if step % LOG_EVERY_BATCH == 0 && g.rank() == 0 {
                tracing::debug!(
                    ntype = ntype.as_str(),
                    step,
                    num_batches,
                    elapsed = ?iter_start.elapsed(),
                    "compute input embeddings"
                );
            }
        }
        n_embs.insert(ntype, input_emb);
    }
    g.barrier()?;
    if g.rank() == 0 {
        tracing::info!(elapsed = ?start.elapsed(), "computing input embeddings finished");
    }
    Ok(n_embs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical_etype;
    use crate::graph::HeteroGraph;
    use candle_nn::VarMap;

    fn dist_graph() -> Result<DistGraph> {
        let mut g = HeteroGraph::new([("user", 3), ("item", 2)]);
        g.add_edges(canonical_etype("user", "buys", "item"), vec![0, 1, 2], vec![0, 0, 1])?;
        g.set_node_data("user", "feat", Tensor::ones((3, 5), DType::F32, &Device::Cpu)?)?;
        DistGraph::single(g)
    }

    #[test]
    fn features_and_featureless_types() -> Result<()> {
        let g = dist_graph()?;
        let varmap = VarMap::new();
        let vs = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let feat_size = NodeMap::from([("user".to_string(), FeatSize::Dim(5))]);
        let layer = NodeEncoderInputLayer::new(&g, &feat_size, 4, Default::default(), vs)?;

        let input = NodeMap::from([
            ("user".to_string(), vec![0, 2]),
            ("item".to_string(), vec![]),
        ]);
        let feats = prepare_batch_input(g.graph(), &input, &FeatField::shared("feat"), &Device::Cpu)?;
        let embs = layer.forward(&feats, &input)?;
        assert_eq!(embs["user"].dims(), &[2, 4]);
        assert_eq!(embs["item"].dims(), &[0, 4]);

        let input = NodeMap::from([("item".to_string(), vec![1])]);
        let embs = layer.forward(&NodeMap::new(), &input)?;
        assert_eq!(embs["item"].dims(), &[1, 4]);
        Ok(())
    }

    #[test]
    fn force_no_embeddings() -> Result<()> {
        let g = dist_graph()?;
        let varmap = VarMap::new();
        let vs = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let feat_size = NodeMap::from([("user".to_string(), FeatSize::Dim(5))]);
        let params = NodeEncoderParams {
            force_no_embeddings: vec!["item".to_string()],
            ..Default::default()
        };
        let layer = NodeEncoderInputLayer::new(&g, &feat_size, 4, params, vs)?;
        let input = NodeMap::from([("item".to_string(), vec![0])]);
        assert!(layer.forward(&NodeMap::new(), &input)?.is_empty());

        let embs = compute_node_input_embeddings(
            &g,
            2,
            &layer,
            None,
            &FeatField::shared("feat"),
            None,
            &Device::Cpu,
        )?;
        assert!(!embs.contains_key("item"));
        let user = &embs["user"];
        assert_eq!(user.name(), "user_input_emb");
        assert_eq!(user.shape(), (3, 4));
        assert!((0..3).all(|v| user.writer_of(v) == Some(0)));
        Ok(())
    }

    #[test]
    fn feature_groups() -> Result<()> {
        let mut g = HeteroGraph::new([("user", 2)]);
        g.set_node_data("user", "a", Tensor::ones((2, 3), DType::F32, &Device::Cpu)?)?;
        g.set_node_data("user", "b", Tensor::ones((2, 2), DType::F32, &Device::Cpu)?)?;
        let g = DistGraph::single(g)?;
        let varmap = VarMap::new();
        let vs = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let feat_size = NodeMap::from([("user".to_string(), FeatSize::Groups(vec![3, 2]))]);
        let params = NodeEncoderParams {
            use_node_embeddings: true,
            num_ffn_layers_in_input: 1,
            ..Default::default()
        };
        let layer = NodeEncoderInputLayer::new(&g, &feat_size, 6, params, vs)?;
        let input = NodeMap::from([("user".to_string(), vec![1, 0])]);
        let field = FeatField::Shared(vec!["a".into(), "b".into()]);
        let feats = prepare_batch_input(g.graph(), &input, &field, &Device::Cpu)?;
        assert_eq!(layer.forward(&feats, &input)?["user"].dims(), &[2, 6]);
        Ok(())
    }

    #[test]
    fn sparse_embeddings_are_bounded() -> Result<()> {
        let g = dist_graph()?;
        let layer = PureLearnableInputLayer::new(&g, 8, &Device::Cpu)?;
        let input = NodeMap::from([("user".to_string(), vec![0, 1, 2])]);
        let emb = layer.forward(&NodeMap::new(), &input)?;
        let values = emb["user"].flatten_all()?.to_vec1::<f32>()?;
        assert!(values.iter().all(|v| (-1.0..=1.0).contains(v)));
        let empty = NodeMap::from([("item".to_string(), vec![])]);
        assert_eq!(layer.forward(&NodeMap::new(), &empty)?["item"].dims(), &[0, 8]);
        Ok(())
    }

    #[test]
    fn edge_input_layer() -> Result<()> {
        let varmap = VarMap::new();
        let vs = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let buys = canonical_etype("user", "buys", "item");
        let layer = EdgeEncoderInputLayer::new(
            &EdgeMap::from([(buys.clone(), 3)]),
            4,
            Some(Activation::Relu),
            0.0,
            0,
            vs,
        )?;
        let feats = vec![EdgeMap::from([(
            buys.clone(),
            Tensor::ones((5, 3), DType::F32, &Device::Cpu)?,
        )])];
        assert_eq!(layer.forward(&feats)?[0][&buys].dims(), &[5, 4]);
        let other = vec![EdgeMap::from([(
            canonical_etype("item", "rev", "user"),
            Tensor::ones((1, 3), DType::F32, &Device::Cpu)?,
        )])];
        assert!(layer.forward(&other).is_err());
        Ok(())
    }
}
