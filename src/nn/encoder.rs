use candle_core::{DType, Tensor};
use candle_nn::{Activation, Dropout, Init, Module, ModuleT, VarBuilder};

use super::utils::{apply, xavier};
use super::{
    Aggregate, ConvGraph, ConvInput, EdgeFeatOp, GnnEncoder, GnnLayer, GraphConvRel,
    HeteroGraphConv, ModuleRegistry, NgnnMlp,
};
use crate::utils::matmul_rows;
use crate::{CanonicalEtype, EdgeMap, Error, NodeMap, Result};

#[derive(Debug, Clone)]
pub struct RelGraphConvParams {
    pub self_loop: bool,
    pub bias: bool,
    pub dropout: f32,
    pub aggregate: Aggregate,
    pub num_ffn_layers_in_gnn: usize,
    /// Whether the last layer applies the activation.
    pub last_layer_act: bool,
    /// Edge feature size of the edge types whose features join message passing.
    pub edge_feat_dims: EdgeMap<usize>,
    pub edge_feat_op: EdgeFeatOp,
}

impl Default for RelGraphConvParams {
    fn default() -> Self {
        Self {
            self_loop: true,
            bias: true,
            dropout: 0.0,
            aggregate: Aggregate::Sum,
            num_ffn_layers_in_gnn: 0,
            last_layer_act: false,
            edge_feat_dims: EdgeMap::new(),
            edge_feat_op: EdgeFeatOp::Concat,
        }
    }
}

/// Relational graph convolution layer.
///
/// https://arxiv.org/abs/1703.06103
/// - one graph convolution per edge type, summed per destination type
/// - optional self-loop transformation of the destination nodes
pub struct RelGraphConvLayer {
    conv: HeteroGraphConv,
    loop_weight: Option<Tensor>,
    self_loop: bool,
    h_bias: Option<Tensor>,
    activation: Option<Activation>,
    ngnn: NgnnMlp,
    dropout: Dropout,
    out_dim: usize,
}

impl RelGraphConvLayer {
    pub fn new(
        in_dim: usize,
        out_dim: usize,
        etypes: &[CanonicalEtype],
        activation: Option<Activation>,
        params: &RelGraphConvParams,
        vs: VarBuilder,
    ) -> Result<Self> {
        // stacking keeps one slice per edge type, which a layer cannot project
        if matches!(params.aggregate, Aggregate::Stack) {
            return Err(Error::Config(
                "the stack aggregation gives 3-D outputs and cannot be used in a GNN layer"
                    .to_string(),
            ));
        }
        let mut modules = ModuleRegistry::new();
        for etype in etypes {
            let vs = vs.pp(format!("conv[{},{},{}]", etype.0, etype.1, etype.2));
            let module = match params.edge_feat_dims.get(etype) {
                Some(&edge_dim) => GraphConvRel::with_edge_feat(
                    in_dim,
                    edge_dim,
                    out_dim,
                    params.edge_feat_op,
                    vs,
                )?,
                None => GraphConvRel::new(in_dim, out_dim, vs)?,
            };
            modules.insert_etype(etype.clone(), Box::new(module));
        }
        let gain = 2f64.sqrt();
        let loop_weight = if params.self_loop {
            Some(xavier(in_dim, out_dim, gain, "loop_weight", &vs)?)
        } else {
            None
        };
        let h_bias = if params.bias {
            Some(vs.get_with_hints(out_dim, "h_bias", Init::Const(0.0))?)
        } else {
            None
        };
        Ok(Self {
            conv: HeteroGraphConv::new(modules, params.aggregate.clone()),
            loop_weight,
            self_loop: params.self_loop,
            h_bias,
            activation,
            ngnn: NgnnMlp::new(
                out_dim,
                params.num_ffn_layers_in_gnn,
                Activation::Relu,
                params.dropout,
                vs.pp("ngnn"),
            )?,
            dropout: Dropout::new(params.dropout),
            out_dim,
        })
    }

    pub fn self_loop(&self) -> bool {
        self.self_loop
    }

    /// Turns the self-loop off or back on; only layers built with a
    /// self-loop weight can turn it on.
    pub fn set_self_loop(&mut self, on: bool) {
        self.self_loop = on && self.loop_weight.is_some();
    }
}

impl GnnLayer for RelGraphConvLayer {
    fn forward(
        &self,
        g: &dyn ConvGraph,
        h: &NodeMap<Tensor>,
        e_h: Option<&EdgeMap<Tensor>>,
    ) -> Result<NodeMap<Tensor>> {
        let mut dst = NodeMap::new();
        for (ntype, x) in h {
            let n = g.num_dst_nodes(ntype);
            if n <= x.dim(0)? {
                dst.insert(ntype.clone(), x.narrow(0, 0, n)?);
            }
        }
        let input = match e_h {
            Some(e) if !e.is_empty() => ConvInput::SourceDestEdge(h, &dst, e),
            _ => ConvInput::SourceDest(h, &dst),
        };
        let mut hs = self.conv.forward(g, input)?;

        for (ntype, x) in &dst {
            let n = x.dim(0)?;
            if n > 0 && !hs.contains_key(ntype) {
                tracing::warn!(
                    ntype = ntype.as_str(),
                    "graph convolution returned no output for node type; check for nodes without in-edges"
                );
                hs.insert(
                    ntype.clone(),
                    Tensor::zeros((n, self.out_dim), DType::F32, x.device())?,
                );
            }
        }

        apply(&hs, |ntype, x| {
            let mut x = x.clone();
            if self.self_loop {
                if let (Some(w), Some(d)) = (&self.loop_weight, dst.get(ntype)) {
                    let dtype = x.dtype();
                    x = (x + matmul_rows(d, w)?.to_dtype(dtype)?)?;
                }
            }
            if let Some(b) = &self.h_bias {
                x = x.broadcast_add(&b.to_dtype(x.dtype())?)?;
            }
            if let Some(act) = &self.activation {
                x = act.forward(&x)?;
            }
            x = self.ngnn.forward_t(&x, false)?;
            Ok(self.dropout.forward_t(&x, false)?)
        })
    }

    fn out_dim(&self) -> usize {
        self.out_dim
    }
}

/// A stack of relational graph convolution layers: `num_hidden_layers`
/// hidden layers of size `h_dim`, then one output layer of size `out_dim`.
pub struct RelGraphConvEncoder {
    layers: Vec<RelGraphConvLayer>,
    h_dim: usize,
    out_dim: usize,
    uses_edge_feat: bool,
    last_selfloop: Option<bool>,
}

impl RelGraphConvEncoder {
    pub fn new(
        h_dim: usize,
        out_dim: usize,
        num_hidden_layers: usize,
        etypes: &[CanonicalEtype],
        params: RelGraphConvParams,
        vs: VarBuilder,
    ) -> Result<Self> {
        let mut layers = Vec::with_capacity(num_hidden_layers + 1);
        for i in 0..num_hidden_layers {
            layers.push(RelGraphConvLayer::new(
                h_dim,
                h_dim,
                etypes,
                Some(Activation::Relu),
                &params,
                vs.pp(i.to_string()),
            )?);
        }
        let last_act = params.last_layer_act.then_some(Activation::Relu);
        layers.push(RelGraphConvLayer::new(
            h_dim,
            out_dim,
            etypes,
            last_act,
            &params,
            vs.pp(num_hidden_layers.to_string()),
        )?);
        Ok(Self {
            layers,
            h_dim,
            out_dim,
            uses_edge_feat: !params.edge_feat_dims.is_empty(),
            last_selfloop: None,
        })
    }

    /// Disables the self-loop of the last layer until `reset_last_selfloop`.
    pub fn skip_last_selfloop(&mut self) {
        if let Some(last) = self.layers.last_mut() {
            self.last_selfloop = Some(last.self_loop());
            last.set_self_loop(false);
        }
    }

    pub fn reset_last_selfloop(&mut self) {
        if let (Some(last), Some(on)) = (self.layers.last_mut(), self.last_selfloop.take()) {
            last.set_self_loop(on);
        }
    }
}

impl GnnEncoder for RelGraphConvEncoder {
    fn num_layers(&self) -> usize {
        self.layers.len()
    }
    fn layer(&self, i: usize) -> &dyn GnnLayer {
        &self.layers[i]
    }
    fn h_dims(&self) -> usize {
        self.h_dim
    }
    fn out_dims(&self) -> usize {
        self.out_dim
    }
    fn is_using_edge_feat(&self) -> bool {
        self.uses_edge_feat
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical_etype;
    use crate::graph::HeteroGraph;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn graph() -> Result<HeteroGraph> {
        let mut g = HeteroGraph::new([("user", 3), ("item", 2)]);
        g.add_edges(canonical_etype("user", "buys", "item"), vec![0, 1, 2], vec![0, 0, 1])?;
        Ok(g)
    }

    fn feats(dim: usize) -> Result<NodeMap<Tensor>> {
        Ok(NodeMap::from([
            ("user".to_string(), Tensor::ones((3, dim), DType::F32, &Device::Cpu)?),
            ("item".to_string(), Tensor::ones((2, dim), DType::F32, &Device::Cpu)?),
        ]))
    }

    #[test]
    fn layer_fills_types_without_in_edges() -> Result<()> {
        let g = graph()?;
        let varmap = VarMap::new();
        let vs = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let params = RelGraphConvParams {
            self_loop: false,
            bias: false,
            ..Default::default()
        };
        let layer =
            RelGraphConvLayer::new(4, 3, &g.canonical_etypes(), None, &params, vs.pp("l"))?;
        let out = layer.forward(&g, &feats(4)?, None)?;
        assert_eq!(out["item"].dims(), &[2, 3]);
        // user has no in-edges
        assert_eq!(out["user"].to_vec2::<f32>()?, vec![vec![0.; 3]; 3]);
        Ok(())
    }

    #[test]
    fn self_loop_projects_destination_rows() -> Result<()> {
        let g = graph()?;
        let varmap = VarMap::new();
        let vs = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let params = RelGraphConvParams {
            bias: false,
            ..Default::default()
        };
        let layer =
            RelGraphConvLayer::new(4, 3, &g.canonical_etypes(), None, &params, vs.pp("l"))?;
        let h = feats(4)?;
        let out = layer.forward(&g, &h, None)?;
        // user has no in-edges, so only the self-loop contributes
        let expected = h["user"].matmul(layer.loop_weight.as_ref().expect("self-loop weight"))?;
        assert_eq!(out["user"].to_vec2::<f32>()?, expected.to_vec2::<f32>()?);
        Ok(())
    }

    #[test]
    fn stack_aggregation_is_rejected() {
        let g = graph().expect("graph");
        let varmap = VarMap::new();
        let vs = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let params = RelGraphConvParams {
            aggregate: Aggregate::Stack,
            ..Default::default()
        };
        let layer = RelGraphConvLayer::new(4, 3, &g.canonical_etypes(), None, &params, vs);
        assert!(matches!(layer, Err(Error::Config(_))));
    }

    #[test]
    fn encoder_and_last_selfloop() -> Result<()> {
        let g = graph()?;
        let varmap = VarMap::new();
        let vs = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let mut encoder = RelGraphConvEncoder::new(
            4,
            2,
            1,
            &g.canonical_etypes(),
            RelGraphConvParams::default(),
            vs,
        )?;
        assert_eq!(encoder.num_layers(), 2);
        assert_eq!(encoder.out_dims(), 2);
        assert!(!encoder.is_using_edge_feat());

        let h = feats(4)?;
        let h1 = encoder.layer(0).forward(&g, &h, None)?;
        let out = encoder.layer(1).forward(&g, &h1, None)?;
        assert_eq!(out["user"].dims(), &[3, 2]);

        encoder.skip_last_selfloop();
        assert!(!encoder.layers[1].self_loop());
        let skipped = encoder.layer(1).forward(&g, &h1, None)?;
        // without the self-loop and in-edges, user rows reduce to the zero bias
        assert_eq!(skipped["user"].to_vec2::<f32>()?, vec![vec![0.; 2]; 3]);
        encoder.reset_last_selfloop();
        assert!(encoder.layers[1].self_loop());
        Ok(())
    }
}
