//! End-to-end pipeline coverage: loss attachment, gradient construction,
//! optimizer construction, a small host-driven training loop, persistence and
//! build determinism.

use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{BTreeMap, HashMap};
use std::sync::Once;
use training_graph::checker::random_tensor;
use training_graph::graph::{TensorId, TensorKind};
use training_graph::loss::LossFunction;
use training_graph::optimizer::sgd_step;
use training_graph::session::{SaveOption, TrainingSession};
use training_graph::{
    DType, GradientGraphBuilder, GradientGraphConfig, Graph, GraphMutator, NodeDef,
    OptimizerAlgorithm, OptimizerGraphConfig, OptimizerNodeConfig, TensorValue,
};

static INIT: Once = Once::new();

fn init_logging() {
    INIT.call_once(|| {
        env_logger::init();
    });
}

fn node(name: &str, op_type: &str, inputs: Vec<TensorId>, outputs: Vec<TensorId>) -> NodeDef {
    NodeDef {
        name: name.to_string(),
        op_type: op_type.to_string(),
        inputs,
        outputs,
        attributes: BTreeMap::new(),
        aliases: vec![],
    }
}

/// Two-layer perceptron: y = MatMul(Relu(Gemm(x, w1, b1)), w2).
fn build_mlp(rng: &mut StdRng) -> GraphMutator {
    init_logging();
    let mut m = GraphMutator::new();
    let x = m.add_input("x", DType::F32, vec![4, 3]).unwrap();
    let w1 = m
        .add_initializer("w1", random_tensor(rng, DType::F32, &[3, 5], -0.5, 0.5).unwrap())
        .unwrap();
    let b1 = m
        .add_initializer("b1", random_tensor(rng, DType::F32, &[5], -0.1, 0.1).unwrap())
        .unwrap();
    let w2 = m
        .add_initializer("w2", random_tensor(rng, DType::F32, &[5, 2], -0.5, 0.5).unwrap())
        .unwrap();
    let h = m
        .add_intermediate("h", Some(DType::F32), Some(vec![4, 5]))
        .unwrap();
    let r = m
        .add_intermediate("r", Some(DType::F32), Some(vec![4, 5]))
        .unwrap();
    let y = m
        .add_intermediate("y", Some(DType::F32), Some(vec![4, 2]))
        .unwrap();
    m.add_node(node("layer1", "Gemm", vec![x, w1, b1], vec![h])).unwrap();
    m.add_node(node("act1", "Relu", vec![h], vec![r])).unwrap();
    m.add_node(node("layer2", "MatMul", vec![r, w2], vec![y])).unwrap();
    m
}

fn initializer_value(graph: &Graph, name: &str) -> TensorValue {
    graph
        .tensors()
        .find_map(|(_, t)| match (&t.kind, t.name == name) {
            (TensorKind::Initializer(v), true) => Some(v.clone()),
            _ => None,
        })
        .unwrap()
}

fn mse_loss() -> LossFunction {
    LossFunction::MeanSquaredError {
        prediction: "y".to_string(),
        target: "target".to_string(),
    }
}

#[test]
fn mlp_loss_decreases_under_sgd() {
    let mut rng = StdRng::seed_from_u64(42);
    let mut m = build_mlp(&mut rng);
    training_graph::loss::attach_loss(&mut m, &mse_loss(), "loss").unwrap();
    let weights = ["b1", "w1", "w2"];
    let config = GradientGraphConfig::new("loss", weights.iter().map(|w| w.to_string()));
    let result = GradientGraphBuilder::new(config).build(&mut m).unwrap();

    let mut feeds = HashMap::new();
    feeds.insert(
        "x".to_string(),
        random_tensor(&mut rng, DType::F32, &[4, 3], -1.0, 1.0).unwrap(),
    );
    feeds.insert(
        "target".to_string(),
        random_tensor(&mut rng, DType::F32, &[4, 2], -1.0, 1.0).unwrap(),
    );

    let mut fetches = vec!["loss"];
    for w in &weights {
        fetches.push(result.weight_gradients[*w].as_str());
    }

    let mut losses = Vec::new();
    for _ in 0..200 {
        let out = training_graph::interpreter::Interpreter::new(m.graph())
            .run(&feeds, &fetches)
            .unwrap();
        let loss = out[0].to_f32_array().unwrap().iter().copied().next().unwrap();
        losses.push(loss);
        for (i, w) in weights.iter().enumerate() {
            let current = initializer_value(m.graph(), w);
            let updated = sgd_step(0.1, &current, &out[i + 1]).unwrap();
            m.set_initializer_value(w, updated).unwrap();
        }
    }
    let first = losses[0];
    let last = *losses.last().unwrap();
    assert!(
        last < 0.6 * first,
        "loss did not decrease: first {first}, last {last}"
    );
    // Monotone progress at this step size: no intermediate blowup.
    assert!(losses.windows(2).all(|w| w[1] <= w[0] * 1.05));
}

#[test]
fn session_pipeline_produces_the_naming_contract() {
    let mut rng = StdRng::seed_from_u64(7);
    let mut session = TrainingSession::new(build_mlp(&mut rng).into_inner());
    session.attach_loss_function(&mse_loss(), "loss").unwrap();
    let weights = session
        .trainable_weights(&Default::default(), &Default::default())
        .unwrap();
    assert_eq!(
        weights.iter().cloned().collect::<Vec<_>>(),
        vec!["b1", "w1", "w2"]
    );
    session
        .build_gradient_graph(GradientGraphConfig::new("loss", weights.into_iter()))
        .unwrap();
    let result = session
        .build_optimizer(OptimizerGraphConfig::default(), OptimizerNodeConfig::default())
        .unwrap()
        .clone();

    assert_eq!(result.learning_rate_input, "Learning_Rate");
    let state = &result.weight_state["w1"];
    assert_eq!(state.weight_out, "w1_Out");
    assert_eq!(state.moment_1.as_deref(), Some("w1_Moment_1"));
    assert_eq!(state.moment_1_out.as_deref(), Some("w1_Moment_1_Out"));
    assert_eq!(state.moment_2_out.as_deref(), Some("w1_Moment_2_Out"));
    assert_eq!(state.update_count.as_deref(), Some("w1_Update_Count"));
    assert_eq!(state.update_count_out.as_deref(), Some("w1_Update_Count_Out"));

    let graph = session.graph();
    let names = graph.tensors_by_name();
    assert!(names.contains_key("Learning_Rate"));
    let (_, node) = graph
        .nodes()
        .find(|(_, n)| n.op_type == OptimizerAlgorithm::Adam.op_type() && n.name.ends_with("w1"))
        .unwrap();
    // eta, step, W, G, M1, M2 feed the update node in that order.
    assert_eq!(node.inputs.len(), 6);
}

#[test]
fn save_options_persist_each_stage() {
    let mut rng = StdRng::seed_from_u64(3);
    let mut session = TrainingSession::new(build_mlp(&mut rng).into_inner());
    session.attach_loss_function(&mse_loss(), "loss").unwrap();
    let err = session.save(
        Vec::<u8>::new(),
        SaveOption::WithUpdatedWeightsAndLossFuncAndGradients,
    );
    assert!(err.is_err());

    session
        .build_gradient_graph(GradientGraphConfig::new(
            "loss",
            ["w1".to_string(), "w2".to_string()].into_iter(),
        ))
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trained.json");
    session
        .save_to_path(&path, SaveOption::WithUpdatedWeightsAndLossFuncAndGradients)
        .unwrap();
    let reloaded = Graph::load_json(std::fs::File::open(&path).unwrap()).unwrap();
    assert_eq!(
        serde_json::to_string(&reloaded).unwrap(),
        serde_json::to_string(session.graph()).unwrap()
    );

    // The forward-only option drops the loss and gradient machinery.
    let bare_path = dir.path().join("forward.json");
    session
        .save_to_path(&bare_path, SaveOption::WithUpdatedWeights)
        .unwrap();
    let bare = Graph::load_json(std::fs::File::open(&bare_path).unwrap()).unwrap();
    assert!(bare.tensors_by_name().contains_key("y"));
    assert!(!bare.tensors_by_name().contains_key("loss"));
}

#[test]
fn updated_weights_are_saved_into_the_forward_graph() {
    let mut rng = StdRng::seed_from_u64(9);
    let mut session = TrainingSession::new(build_mlp(&mut rng).into_inner());
    session.attach_loss_function(&mse_loss(), "loss").unwrap();
    session
        .build_gradient_graph(GradientGraphConfig::new(
            "loss",
            ["w1".to_string()].into_iter(),
        ))
        .unwrap();
    let trained = TensorValue::filled(DType::F32, &[3, 5], 0.125).unwrap();
    session.set_weight_value("w1", trained.clone()).unwrap();

    let mut buffer = Vec::new();
    session.save(&mut buffer, SaveOption::WithUpdatedWeights).unwrap();
    let saved = Graph::load_json(buffer.as_slice()).unwrap();
    assert_eq!(initializer_value(&saved, "w1"), trained);
    // The saved forward graph carries no gradient tensors.
    assert!(!saved.tensors_by_name().contains_key("w1_grad"));
}

#[test]
fn gradient_and_optimizer_builds_are_deterministic() {
    let build = || {
        let mut rng = StdRng::seed_from_u64(5);
        let mut m = build_mlp(&mut rng);
        training_graph::loss::attach_loss(&mut m, &mse_loss(), "loss").unwrap();
        let config = GradientGraphConfig::new(
            "loss",
            ["b1", "w1", "w2"].iter().map(|w| w.to_string()),
        );
        let result = GradientGraphBuilder::new(config).build(&mut m).unwrap();
        let mut builder =
            training_graph::OptimizerGraphBuilder::new(OptimizerGraphConfig::default());
        for (w, g) in &result.weight_gradients {
            builder.add_weight(w, g, OptimizerNodeConfig::default());
        }
        builder.build(&mut m).unwrap();
        serde_json::to_string(m.graph()).unwrap()
    };
    assert_eq!(build(), build());
}

#[test]
fn distributed_configs_validate_up_front() {
    init_logging();
    let mut m = GraphMutator::new();
    m.add_initializer("w", TensorValue::zeros(DType::F32, &[2]))
        .unwrap();
    m.add_intermediate("w_grad", Some(DType::F32), Some(vec![2]))
        .unwrap();
    let config = OptimizerGraphConfig {
        world_rank: 3,
        world_size: 2,
        ..Default::default()
    };
    let mut builder = training_graph::OptimizerGraphBuilder::new(config);
    builder.add_weight("w", "w_grad", OptimizerNodeConfig::sgd());
    assert!(builder.build(&mut m).is_err());

    let config = OptimizerGraphConfig {
        partition_optimizer: true,
        ..Default::default()
    };
    let mut builder = training_graph::OptimizerGraphBuilder::new(config);
    builder.add_weight("w", "w_grad", OptimizerNodeConfig::sgd());
    assert!(builder.build(&mut m).is_err());
}
