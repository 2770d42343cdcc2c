use std::thread;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use candle_dist_gnn::dist::PartitionBook;
use candle_dist_gnn::eval::{broadcast_data, calc_dot_pos_score, calc_ranking, gen_lp_score};
use candle_dist_gnn::graph::{DistGraph, FeatField, HeteroGraph};
use candle_dist_gnn::inference::{
    do_full_graph_inference, FeatureInput, InferenceConfig, InferenceParams, InferenceStrategy,
    ProgressTracker,
};
use candle_dist_gnn::nn::{
    FeatSize, GnnEncoder, NodeEncoderInputLayer, RelGraphConvEncoder, RelGraphConvParams,
};
use candle_dist_gnn::utils::mask_to_index;
use candle_dist_gnn::{canonical_etype, NodeMap};

const NUM_USERS: usize = 1000;
const NUM_ITEMS: usize = 200;
const NUM_EDGES: usize = 5000;
const NUM_NEG: usize = 16;

fn synthetic_graph(rng: &mut StdRng) -> anyhow::Result<HeteroGraph> {
    let mut g = HeteroGraph::new([("user", NUM_USERS), ("item", NUM_ITEMS)]);
    let src: Vec<u32> = (0..NUM_EDGES).map(|_| rng.gen_range(0..NUM_USERS as u32)).collect();
    let dst: Vec<u32> = (0..NUM_EDGES).map(|_| rng.gen_range(0..NUM_ITEMS as u32)).collect();
    // hold out every tenth edge from message passing
    let train_mask: Vec<u8> = (0..NUM_EDGES).map(|i| (i % 10 != 0) as u8).collect();

    let buys = canonical_etype("user", "buys", "item");
    let rev = canonical_etype("item", "rev-buys", "user");
    g.add_edges(buys.clone(), src.clone(), dst.clone())?;
    g.add_edges(rev.clone(), dst, src)?;
    for etype in [&buys, &rev] {
        let mask = Tensor::from_vec(train_mask.clone(), NUM_EDGES, &Device::Cpu)?;
        g.set_edge_data(etype, "train_mask", mask)?;
    }
    let feat = Tensor::randn(0f32, 1., (NUM_USERS, 16), &Device::Cpu)?;
    g.set_node_data("user", "feat", feat)?;
    Ok(g)
}

// cargo run --example two_workers
fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let mut rng = StdRng::seed_from_u64(42);
    let g = synthetic_graph(&mut rng)?;
    let book = PartitionBook::even(g.num_nodes(), 2)?;
    let config = InferenceConfig::from_json_str(
        r#"{
            "num_layers": 2,
            "eval_fanout": "10,-1",
            "eval_batch_size": 128,
            "edge_mask": "train_mask"
        }"#,
    )?;

    let varmap = VarMap::new();
    let workers = DistGraph::local_cluster(g, book)?;
    let results: Vec<anyhow::Result<()>> = thread::scope(|s| {
        let handles: Vec<_> = workers
            .into_iter()
            .map(|g| {
                let (varmap, config) = (&varmap, &config);
                s.spawn(move || run_worker(&g, varmap, config))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or_else(|_| Err(anyhow::anyhow!("worker panicked"))))
            .collect()
    });
    for result in results {
        result?;
    }
    Ok(())
}

fn run_worker(g: &DistGraph, varmap: &VarMap, config: &InferenceConfig) -> anyhow::Result<()> {
    let device = Device::Cpu;
    let vs = VarBuilder::from_varmap(varmap, DType::F32, &device);
    let feat_size = NodeMap::from([("user".to_string(), FeatSize::Dim(16))]);
    let input_layer =
        NodeEncoderInputLayer::new(g, &feat_size, 32, Default::default(), vs.pp("input"))?;
    let encoder = RelGraphConvEncoder::new(
        32,
        32,
        config.num_layers - 1,
        &g.canonical_etypes(),
        RelGraphConvParams {
            aggregate: config.aggregate()?,
            ..Default::default()
        },
        vs.pp("gnn"),
    )?;
    let encoder: &dyn GnnEncoder = &encoder;
    let input = FeatureInput::new(g.graph(), FeatField::shared("feat"), &input_layer, &device);

    let tracker = if g.rank() == 0 {
        ProgressTracker::new("GNN inference", 0)?
    } else {
        ProgressTracker::hidden()
    };
    let params = InferenceParams::from_config(config, &device)?.with_tracker(&tracker);
    let embs = do_full_graph_inference(
        g,
        Some(encoder),
        &input,
        InferenceStrategy::from_config(config),
        &params,
    )?;
    tracker.finish();

    // score the held-out edges whose head this worker owns
    let buys = canonical_etype("user", "buys", "item");
    let edges = g.graph().edges(&buys)?;
    let held_out = match g.graph().edge_data(&buys, "train_mask") {
        Some(mask) => mask_to_index(&mask.eq(0u8)?)?,
        None => Vec::new(),
    };
    let policy = g.partition_policy("user")?;
    let mut heads = Vec::new();
    let mut tails = Vec::new();
    for eid in held_out {
        let u = edges.src()[eid as usize];
        if policy.owner(u)? == g.rank() {
            heads.push(u);
            tails.push(edges.dst()[eid as usize]);
        }
    }
    let mut rng = StdRng::seed_from_u64(g.rank() as u64);
    let negs: Vec<u32> = (0..heads.len() * NUM_NEG)
        .map(|_| rng.gen_range(0..NUM_ITEMS as u32))
        .collect();

    let h = embs["user"].read(&heads, &device)?;
    let t = embs["item"].read(&tails, &device)?;
    let n = embs["item"]
        .read(&negs, &device)?
        .reshape((heads.len(), NUM_NEG, embs["item"].dim()))?;
    let pos = calc_dot_pos_score(&h, &t)?;
    let neg = h.unsqueeze(1)?.broadcast_mul(&n)?.sum(2)?;
    let ranking = calc_ranking(&pos, &neg)?;

    let ranking = broadcast_data(g.comm(), &ranking)?;
    if g.rank() == 0 {
        let score = gen_lp_score(&ranking)?;
        println!("{}", serde_json::to_string_pretty(&score)?);
    }
    Ok(())
}
