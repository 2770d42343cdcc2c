use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};

use candle_dist_gnn::dist::PartitionBook;
use candle_dist_gnn::graph::{DistGraph, FeatField, HeteroGraph};
use candle_dist_gnn::inference::{
    dist_inference, do_full_graph_inference, FeatureInput, InferenceParams, InferenceStrategy,
};
use candle_dist_gnn::nn::{
    ConvGraph, EdgeEncoderInputLayer, FeatSize, GnnEncoder, GnnLayer, NodeEncoderInputLayer,
    RelGraphConvEncoder, RelGraphConvParams,
};
use candle_dist_gnn::{canonical_etype, EdgeMap, Error, NodeMap};

fn graph() -> Result<HeteroGraph> {
    let mut g = HeteroGraph::new([("user", 4), ("item", 2)]);
    g.add_edges(
        canonical_etype("user", "buys", "item"),
        vec![0, 1, 2, 3, 0],
        vec![0, 0, 1, 1, 1],
    )?;
    g.add_edges(
        canonical_etype("item", "rev-buys", "user"),
        vec![0, 0, 1, 1, 1],
        vec![0, 1, 2, 3, 0],
    )?;
    let feat = Tensor::arange(0f32, 12., &Device::Cpu)?.reshape((4, 3))?;
    g.set_node_data("user", "feat", feat)?;
    let weight = Tensor::arange(0f32, 10., &Device::Cpu)?.reshape((5, 2))?;
    g.set_edge_data(&canonical_etype("user", "buys", "item"), "weight", weight)?;
    Ok(g)
}

fn homogeneous_graph() -> Result<HeteroGraph> {
    let mut g = HeteroGraph::new([("node", 5)]);
    g.add_edges(
        canonical_etype("node", "links", "node"),
        vec![0, 1, 2, 3, 4, 0],
        vec![1, 2, 3, 4, 0, 2],
    )?;
    let feat = Tensor::arange(0f32, 10., &Device::Cpu)?.reshape((5, 2))?;
    g.set_node_data("node", "feat", feat)?;
    Ok(g)
}

/// Runs `f` on one thread per worker and returns the results in rank order.
fn run_workers<T, F>(book: PartitionBook, f: F) -> Result<Vec<T>>
where
    T: Send,
    F: Fn(DistGraph) -> Result<T> + Sync,
{
    run_workers_on(graph()?, book, f)
}

fn run_workers_on<T, F>(graph: HeteroGraph, book: PartitionBook, f: F) -> Result<Vec<T>>
where
    T: Send,
    F: Fn(DistGraph) -> Result<T> + Sync,
{
    let graphs = DistGraph::local_cluster(graph, book)?;
    let f = &f;
    thread::scope(|s| {
        let handles: Vec<_> = graphs
            .into_iter()
            .map(|g| s.spawn(move || f(g)))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("worker panicked"))
            .collect()
    })
}

fn even_book() -> Result<PartitionBook> {
    let num_nodes = NodeMap::from([("user".to_string(), 4), ("item".to_string(), 2)]);
    Ok(PartitionBook::even(&num_nodes, 2)?)
}

struct Model {
    input: NodeEncoderInputLayer,
    encoder: RelGraphConvEncoder,
}

impl Model {
    fn new(g: &DistGraph, varmap: &VarMap, params: RelGraphConvParams) -> Result<Self> {
        let vs = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        let feat_size = NodeMap::from([("user".to_string(), FeatSize::Dim(3))]);
        let input = NodeEncoderInputLayer::new(g, &feat_size, 4, Default::default(), vs.pp("input"))?;
        let encoder =
            RelGraphConvEncoder::new(4, 2, 1, &g.canonical_etypes(), params, vs.pp("gnn"))?;
        Ok(Self { input, encoder })
    }
}

#[test]
fn two_workers_write_their_own_rows() -> Result<()> {
    let varmap = VarMap::new();
    let results = run_workers(even_book()?, |g| {
        let model = Model::new(&g, &varmap, RelGraphConvParams::default())?;
        let input = FeatureInput::new(g.graph(), FeatField::shared("feat"), &model.input, &Device::Cpu);
        let encoder: &dyn GnnEncoder = &model.encoder;
        let params = InferenceParams::new(1, &Device::Cpu);

        let layerwise = do_full_graph_inference(
            &g,
            Some(encoder),
            &input,
            InferenceStrategy::LayerByLayer,
            &params,
        )?;
        let minibatch =
            do_full_graph_inference(&g, Some(encoder), &input, InferenceStrategy::MiniBatch, &params)?;

        let user = &layerwise["user"];
        let all = [0, 1, 2, 3];
        let first = user.read(&all, &Device::Cpu)?.to_vec2::<f32>()?;
        let second = user.read(&all, &Device::Cpu)?.to_vec2::<f32>()?;
        assert_eq!(first, second);
        let writers: Vec<_> = all.iter().map(|&v| user.writer_of(v)).collect();
        let mini = minibatch["user"].read(&all, &Device::Cpu)?.to_vec2::<f32>()?;
        Ok((user.name().to_string(), user.shape(), writers, first, mini))
    })?;

    let (_, _, _, rank0_rows, _) = &results[0];
    for (name, shape, writers, rows, mini) in &results {
        assert_eq!(name, "h-1");
        assert_eq!(*shape, (4, 2));
        assert_eq!(writers, &vec![Some(0), Some(0), Some(1), Some(1)]);
        // both workers read the same rows
        assert_eq!(rows, rank0_rows);
        // full neighborhoods make both strategies agree
        for (a, b) in rows.iter().flatten().zip(mini.iter().flatten()) {
            assert!((a - b).abs() < 1e-4, "{a} != {b}");
        }
    }
    Ok(())
}

#[test]
fn skewed_workers_run_the_same_number_of_iterations() -> Result<()> {
    let book = PartitionBook::from_offsets(NodeMap::from([
        ("user".to_string(), vec![0, 3, 4]),
        ("item".to_string(), vec![0, 1, 2]),
    ]))?;
    let varmap = VarMap::new();
    let steps = run_workers(book, |g| {
        let model = Model::new(&g, &varmap, RelGraphConvParams::default())?;
        let input = FeatureInput::new(g.graph(), FeatField::shared("feat"), &model.input, &Device::Cpu);
        let count = AtomicUsize::new(0);
        let tracker = |_step: usize| {
            count.fetch_add(1, Ordering::Relaxed);
        };
        let mut params = InferenceParams::new(1, &Device::Cpu).with_tracker(&tracker);
        params.target_ntypes = Some(vec!["user".to_string()]);

        let encoder: &dyn GnnEncoder = &model.encoder;
        do_full_graph_inference(&g, Some(encoder), &input, InferenceStrategy::MiniBatch, &params)?;
        let minibatch = count.swap(0, Ordering::Relaxed);
        do_full_graph_inference(&g, Some(encoder), &input, InferenceStrategy::LayerByLayer, &params)?;
        let layerwise = count.load(Ordering::Relaxed);
        Ok((g.node_split("user")?.len(), minibatch, layerwise))
    })?;
    assert_eq!(steps[0].0, 3);
    assert_eq!(steps[1].0, 1);
    for (_, minibatch, layerwise) in steps {
        assert_eq!(minibatch, 3);
        // layer 0 covers users and items (4 vs 2 batches), layer 1 users (3 vs 1)
        assert_eq!(layerwise, 4 + 3);
    }
    Ok(())
}

struct Silent;

impl GnnLayer for Silent {
    fn forward(
        &self,
        _g: &dyn ConvGraph,
        _h: &NodeMap<Tensor>,
        _e_h: Option<&EdgeMap<Tensor>>,
    ) -> candle_dist_gnn::Result<NodeMap<Tensor>> {
        Ok(NodeMap::new())
    }
    fn out_dim(&self) -> usize {
        2
    }
}

struct SilentEncoder(Silent);

impl GnnEncoder for SilentEncoder {
    fn num_layers(&self) -> usize {
        1
    }
    fn layer(&self, _i: usize) -> &dyn GnnLayer {
        &self.0
    }
    fn h_dims(&self) -> usize {
        2
    }
    fn out_dims(&self) -> usize {
        2
    }
}

fn ones_input(nodes: &NodeMap<Vec<u32>>) -> candle_dist_gnn::Result<NodeMap<Tensor>> {
    nodes
        .iter()
        .map(|(ntype, ids)| {
            Ok((ntype.clone(), Tensor::ones((ids.len(), 2), DType::F32, &Device::Cpu)?))
        })
        .collect()
}

#[test]
fn no_output_fails_on_every_worker() -> Result<()> {
    let results = run_workers(even_book()?, |g| {
        let params = InferenceParams::new(2, &Device::Cpu);
        Ok(dist_inference(&g, &SilentEncoder(Silent), &ones_input, &params))
    })?;
    for result in results {
        assert!(matches!(result, Err(Error::DimInference(_))));
    }
    Ok(())
}

/// Emits `width` columns of ones for every destination node.
struct Ones(usize);

impl GnnLayer for Ones {
    fn forward(
        &self,
        g: &dyn ConvGraph,
        h: &NodeMap<Tensor>,
        _e_h: Option<&EdgeMap<Tensor>>,
    ) -> candle_dist_gnn::Result<NodeMap<Tensor>> {
        h.keys()
            .map(|ntype| {
                let n = g.num_dst_nodes(ntype);
                Ok((ntype.clone(), Tensor::ones((n, self.0), DType::F32, &Device::Cpu)?))
            })
            .collect()
    }
    fn out_dim(&self) -> usize {
        self.0
    }
}

struct OnesEncoder(Ones);

impl GnnEncoder for OnesEncoder {
    fn num_layers(&self) -> usize {
        1
    }
    fn layer(&self, _i: usize) -> &dyn GnnLayer {
        &self.0
    }
    fn h_dims(&self) -> usize {
        self.0 .0
    }
    fn out_dims(&self) -> usize {
        self.0 .0
    }
}

#[test]
fn mismatched_output_sizes_fail_on_every_worker() -> Result<()> {
    // each worker returns instead of waiting for the others in the flush
    let results = run_workers(even_book()?, |g| {
        let encoder = OnesEncoder(Ones(2 + 2 * g.rank()));
        let params = InferenceParams::new(2, &Device::Cpu);
        Ok(dist_inference(&g, &encoder, &ones_input, &params))
    })?;
    for result in results {
        assert!(matches!(result, Err(Error::DimInference(_))));
    }

    let widths = run_workers(even_book()?, |g| {
        let params = InferenceParams::new(2, &Device::Cpu);
        let out = dist_inference(&g, &OnesEncoder(Ones(3)), &ones_input, &params)?;
        Ok(out["user"].shape())
    })?;
    assert_eq!(widths, vec![(4, 3), (4, 3)]);
    Ok(())
}

#[test]
fn homogeneous_graph_strategies_agree() -> Result<()> {
    let num_nodes = NodeMap::from([("node".to_string(), 5)]);
    let book = PartitionBook::even(&num_nodes, 2)?;
    let varmap = VarMap::new();
    let results = run_workers_on(homogeneous_graph()?, book, |g| {
        let vs = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let feat_size = NodeMap::from([("node".to_string(), FeatSize::Dim(2))]);
        let input_layer =
            NodeEncoderInputLayer::new(&g, &feat_size, 4, Default::default(), vs.pp("input"))?;
        let encoder = RelGraphConvEncoder::new(
            4,
            3,
            1,
            &g.canonical_etypes(),
            RelGraphConvParams::default(),
            vs.pp("gnn"),
        )?;
        let encoder: &dyn GnnEncoder = &encoder;
        let input =
            FeatureInput::new(g.graph(), FeatField::shared("feat"), &input_layer, &Device::Cpu);
        let params = InferenceParams::new(2, &Device::Cpu);

        let all = [0, 1, 2, 3, 4];
        let run = |strategy| do_full_graph_inference(&g, Some(encoder), &input, strategy, &params);
        let layerwise = run(InferenceStrategy::LayerByLayer)?;
        let minibatch = run(InferenceStrategy::MiniBatch)?;
        Ok((
            layerwise["node"].read(&all, &Device::Cpu)?.to_vec2::<f32>()?,
            minibatch["node"].read(&all, &Device::Cpu)?.to_vec2::<f32>()?,
        ))
    })?;
    for (layerwise, minibatch) in &results {
        assert_eq!(layerwise.len(), 5);
        for (a, b) in layerwise.iter().flatten().zip(minibatch.iter().flatten()) {
            assert!((a - b).abs() < 1e-4, "{a} != {b}");
        }
    }
    assert_eq!(results[0], results[1]);
    Ok(())
}

#[test]
fn edge_features_need_mini_batch_inference() -> Result<()> {
    let g = DistGraph::single(graph()?)?;
    let buys = canonical_etype("user", "buys", "item");
    let varmap = VarMap::new();
    let vs = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let params = RelGraphConvParams {
        edge_feat_dims: EdgeMap::from([(buys.clone(), 4)]),
        ..Default::default()
    };
    let model = Model::new(&g, &varmap, params)?;
    assert!(model.encoder.is_using_edge_feat());
    let edge_layer = EdgeEncoderInputLayer::new(
        &EdgeMap::from([(buys.clone(), 2)]),
        4,
        None,
        0.0,
        0,
        vs.pp("edge"),
    )?;
    let input = FeatureInput::new(g.graph(), FeatField::shared("feat"), &model.input, &Device::Cpu)
        .with_edge_layer(&edge_layer, EdgeMap::from([(buys, vec!["weight".to_string()])]));
    let encoder: &dyn GnnEncoder = &model.encoder;
    let params = InferenceParams::new(3, &Device::Cpu);

    let err = do_full_graph_inference(
        &g,
        Some(encoder),
        &input,
        InferenceStrategy::LayerByLayer,
        &params,
    );
    assert!(matches!(err, Err(Error::Config(_))));

    let out =
        do_full_graph_inference(&g, Some(encoder), &input, InferenceStrategy::MiniBatch, &params)?;
    assert_eq!(out["item"].shape(), (2, 2));
    assert!((0..4).all(|v| out["user"].writer_of(v) == Some(0)));
    Ok(())
}

#[test]
fn intermediate_layers_are_dropped_unless_kept() -> Result<()> {
    let g = DistGraph::single(graph()?)?;
    let varmap = VarMap::new();
    let model = Model::new(&g, &varmap, RelGraphConvParams::default())?;
    let input = FeatureInput::new(g.graph(), FeatField::shared("feat"), &model.input, &Device::Cpu);
    let encoder: &dyn GnnEncoder = &model.encoder;

    let mut params = InferenceParams::new(2, &Device::Cpu);
    params.target_ntypes = Some(vec!["item".to_string()]);
    let out = do_full_graph_inference(
        &g,
        Some(encoder),
        &input,
        InferenceStrategy::LayerByLayer,
        &params,
    )?;
    assert_eq!(out.keys().collect::<Vec<_>>(), vec!["item"]);
    assert!(g.store().get("user", "h-0").is_none());
    assert!(g.store().get("item", "h-1").is_some_and(|t| t.is_persistent()));

    params.keep_intermediate = true;
    do_full_graph_inference(
        &g,
        Some(encoder),
        &input,
        InferenceStrategy::LayerByLayer,
        &params,
    )?;
    assert_eq!(g.store().get("user", "h-0").map(|t| t.shape()), Some((4, 4)));
    Ok(())
}

#[test]
fn without_encoder_the_input_embeddings_are_returned() -> Result<()> {
    let g = DistGraph::single(graph()?)?;
    let varmap = VarMap::new();
    let model = Model::new(&g, &varmap, RelGraphConvParams::default())?;
    let input = FeatureInput::new(g.graph(), FeatField::shared("feat"), &model.input, &Device::Cpu);
    let params = InferenceParams::new(3, &Device::Cpu);
    let out = do_full_graph_inference(&g, None, &input, InferenceStrategy::MiniBatch, &params)?;
    assert_eq!(out["user"].name(), "user_input_emb");
    assert_eq!(out["item"].shape(), (2, 4));
    Ok(())
}
