//! End-to-end adapter behavior on small custom models
//!
//! Each case trains a few SGD steps on a tiny host model and checks which
//! parameters moved, then exercises merge, disable, save/load and
//! combination on the trained adapters.

use adaptar::autograd::{gather, scale, sum};
use adaptar::nn::{Conv1D, Conv2d, Embedding, Layer, Linear, Sequential, ShapedTensor};
use adaptar::tuners::persist::WEIGHTS_NAME;
use adaptar::{backward, AdapterConfig, CombinationType, Context, Optimizer, PeftModel, SGD};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::BTreeMap;
use tempfile::TempDir;

const TOL: f32 = 1e-4;

// ============================================================================
// Host models
// ============================================================================

fn mlp() -> Sequential {
    let mut rng = StdRng::seed_from_u64(0);
    Sequential::new()
        .with("lin0", Linear::new(10, 20, true, &mut rng))
        .with("relu", Layer::Relu)
        .with("drop", Layer::Dropout(0.0))
        .with("lin1", Linear::new(20, 2, true, &mut rng))
        .with("sm", Layer::LogSoftmax)
}

fn emb_conv1d() -> Sequential {
    let mut rng = StdRng::seed_from_u64(1);
    Sequential::new()
        .with("emb", Embedding::new(100, 5, &mut rng))
        .with("conv1d", Conv1D::new(1, 5, &mut rng))
        .with("relu", Layer::Relu)
        .with("flat", Layer::Flatten)
        .with("lin0", Linear::new(10, 2, true, &mut rng))
        .with("sm", Layer::LogSoftmax)
}

fn conv2d() -> Sequential {
    let mut rng = StdRng::seed_from_u64(2);
    Sequential::new()
        .with("conv2d", Conv2d::new(5, 10, 3, &mut rng))
        .with("relu", Layer::Relu)
        .with("flat", Layer::Flatten)
        .with("lin0", Linear::new(10, 2, true, &mut rng))
        .with("sm", Layer::LogSoftmax)
}

fn mlp_input() -> ShapedTensor {
    ShapedTensor::from_vec((0..40).map(|i| ((i as f32) * 0.31).sin()).collect(), vec![4, 10])
}

fn token_input() -> ShapedTensor {
    ShapedTensor::from_vec((0..40).map(|i| ((i * 7) % 100) as f32).collect(), vec![4, 10])
}

fn image_input() -> ShapedTensor {
    ShapedTensor::from_vec((0..180).map(|i| ((i as f32) * 0.17).cos()).collect(), vec![4, 5, 3, 3])
}

struct Case {
    name: &'static str,
    model: fn() -> Sequential,
    input: fn() -> ShapedTensor,
    config: AdapterConfig,
}

fn cases() -> Vec<Case> {
    vec![
        Case {
            name: "mlp lora lin0",
            model: mlp,
            input: mlp_input,
            config: AdapterConfig::lora(8, 8.0).with_targets("lin0"),
        },
        Case {
            name: "mlp lora both",
            model: mlp,
            input: mlp_input,
            config: AdapterConfig::lora(4, 8.0).with_targets(vec!["lin0", "lin1"]),
        },
        Case {
            name: "mlp lora modules_to_save",
            model: mlp,
            input: mlp_input,
            config: AdapterConfig::lora(4, 8.0).with_targets("lin0").with_modules_to_save(&["lin1"]),
        },
        Case {
            name: "mlp ia3",
            model: mlp,
            input: mlp_input,
            config: AdapterConfig::ia3().with_targets(vec!["lin0", "lin1"]).with_feedforward_modules("lin1"),
        },
        Case {
            name: "mlp adalora",
            model: mlp,
            input: mlp_input,
            config: AdapterConfig::adalora(4, 2).with_targets("lin0"),
        },
        Case {
            name: "emb_conv1d lora",
            model: emb_conv1d,
            input: token_input,
            config: AdapterConfig::lora(4, 8.0).with_targets(vec!["emb", "conv1d"]),
        },
        Case {
            name: "emb_conv1d ia3",
            model: emb_conv1d,
            input: token_input,
            config: AdapterConfig::ia3().with_targets("conv1d"),
        },
        Case {
            name: "conv2d lora",
            model: conv2d,
            input: image_input,
            config: AdapterConfig::lora(4, 8.0).with_targets(vec!["conv2d", "lin0"]),
        },
        Case {
            name: "conv2d ia3",
            model: conv2d,
            input: image_input,
            config: AdapterConfig::ia3().with_targets(vec!["conv2d", "lin0"]).with_feedforward_modules("lin0"),
        },
    ]
}

// ============================================================================
// Helpers
// ============================================================================

fn build(case: &Case) -> PeftModel {
    PeftModel::with_context((case.model)(), case.config.clone(), "default", Context::with_seed(42)).unwrap()
}

fn eval_ctx() -> Context {
    let mut ctx = Context::with_seed(0);
    ctx.eval();
    ctx
}

/// Negative log-likelihood of class 0 for `[rows, 2]` log-probabilities
fn nll(y: &ShapedTensor) -> adaptar::Tensor {
    let rows = y.tensor.len() / 2;
    let picks: Vec<Option<usize>> = (0..rows).map(|r| Some(r * 2)).collect();
    scale(&sum(&gather(&y.tensor, &picks)), -1.0 / rows as f32)
}

fn train(model: &mut PeftModel, x: &ShapedTensor, steps: usize) {
    let mut opt = SGD::new(0.5, 0.0);
    for _ in 0..steps {
        let mut params = model.parameters_mut();
        opt.zero_grad(&mut params);
        drop(params);

        let y = model.forward(x);
        let mut loss = nll(&y);
        backward(&mut loss, None);

        let mut params = model.parameters_mut();
        opt.step(&mut params);
    }
}

fn snapshot(model: &PeftModel) -> BTreeMap<String, (Vec<f32>, bool)> {
    model
        .named_parameters()
        .into_iter()
        .map(|(name, t)| (name, (t.to_vec(), t.requires_grad())))
        .collect()
}

fn close(a: &[f32], b: &[f32]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| (x - y).abs() <= TOL)
}

// ============================================================================
// Training touches only adapter parameters
// ============================================================================

#[test]
fn test_training_updates_only_adapter_parameters() {
    for case in cases() {
        let mut model = build(&case);
        let before = snapshot(&model);
        train(&mut model, &(case.input)(), 4);
        let after = snapshot(&model);

        let mut trained = 0;
        for (name, (init, requires_grad)) in &before {
            let (now, _) = &after[name];
            if *requires_grad {
                trained += 1;
                assert!(!close(init, now), "{}: trainable '{name}' did not move", case.name);
            } else {
                assert!(close(init, now), "{}: frozen '{name}' changed", case.name);
            }
        }
        assert!(trained > 0, "{}: nothing was trainable", case.name);
    }
}

#[test]
fn test_untargeted_layer_is_bit_identical() {
    let mut model = PeftModel::new(mlp(), AdapterConfig::lora(8, 8.0).with_targets("lin0"), "default").unwrap();
    let lin1 = mlp().get("lin1").map(|l| l.parameters().into_iter().map(|(_, t)| t.to_vec()).collect::<Vec<_>>());
    train(&mut model, &mlp_input(), 4);

    let now = model.get("lin1").map(|l| l.parameters().into_iter().map(|(_, t)| t.to_vec()).collect::<Vec<_>>());
    assert_eq!(now, lin1);
}

// ============================================================================
// Merge
// ============================================================================

#[test]
fn test_merge_unmerge_restores_base_weights() {
    for case in cases() {
        let mut model = build(&case);
        train(&mut model, &(case.input)(), 3);
        model.eval();
        let adapted = model.forward(&(case.input)());
        let before = snapshot(&model);

        model.merge_adapter(None).unwrap();
        assert!(model.forward(&(case.input)()).allclose(&adapted, TOL), "{}: merged output", case.name);
        model.unmerge_adapter().unwrap();

        let after = snapshot(&model);
        for (name, (value, _)) in &before {
            assert!(close(value, &after[name].0), "{}: '{name}' not restored", case.name);
        }
    }
}

#[test]
fn test_merge_unmerge_with_several_active_adapters() {
    let mut model = PeftModel::with_context(
        mlp(),
        AdapterConfig::lora(4, 8.0).with_targets(vec!["lin0", "lin1"]).with_init_weights(false),
        "a",
        eval_ctx(),
    )
    .unwrap();
    model.add_adapter("b", AdapterConfig::lora(2, 2.0).with_targets("lin0").with_init_weights(false)).unwrap();
    model.add_adapter("c", AdapterConfig::lora(3, 1.0).with_targets("lin1").with_init_weights(false)).unwrap();
    model.set_active_adapters(&["c", "a", "b"]).unwrap();
    let adapted = model.forward(&mlp_input());
    let before = snapshot(&model);

    model.merge_adapter(Some(&["b"])).unwrap();
    model.merge_adapter(Some(&["c", "a"])).unwrap();
    assert!(model.forward(&mlp_input()).allclose(&adapted, TOL));
    model.unmerge_adapter().unwrap();

    let after = snapshot(&model);
    for (name, (value, _)) in &before {
        assert!(close(value, &after[name].0), "'{name}' not restored");
    }
}

// ============================================================================
// Disable
// ============================================================================

#[test]
fn test_disable_reproduces_base_output() {
    for case in cases() {
        let base = (case.model)().forward(&(case.input)(), &eval_ctx());
        let mut model = build(&case);
        train(&mut model, &(case.input)(), 3);
        model.eval();
        let adapted = model.forward(&(case.input)());
        let flags: Vec<bool> = snapshot(&model).values().map(|(_, g)| *g).collect();

        {
            let guard = model.disable_adapter().unwrap();
            assert!(guard.forward(&(case.input)()).allclose(&base, TOL), "{}: disabled output", case.name);
        }
        assert!(model.forward(&(case.input)()).allclose(&adapted, TOL), "{}: re-enabled output", case.name);
        let restored: Vec<bool> = snapshot(&model).values().map(|(_, g)| *g).collect();
        assert_eq!(restored, flags, "{}: requires_grad flags", case.name);
    }
}

// ============================================================================
// Save / load
// ============================================================================

#[test]
fn test_save_load_round_trip() {
    for case in cases() {
        let tmp = TempDir::new().unwrap();
        let mut model = build(&case);
        train(&mut model, &(case.input)(), 3);
        model.eval();
        let expected = model.forward(&(case.input)());
        model.save_pretrained(tmp.path()).unwrap();
        assert!(tmp.path().join(WEIGHTS_NAME).exists());

        let loaded =
            PeftModel::from_pretrained_with_context((case.model)(), tmp.path(), "default", false, eval_ctx()).unwrap();
        let saved = model.state_dict("default").unwrap();
        let restored = loaded.state_dict("default").unwrap();
        assert_eq!(saved.keys().collect::<Vec<_>>(), restored.keys().collect::<Vec<_>>(), "{}", case.name);
        for (key, tensor) in &saved {
            assert!(close(&tensor.data, &restored[key].data), "{}: '{key}' differs", case.name);
        }
        assert!(loaded.forward(&(case.input)()).allclose(&expected, TOL), "{}: output", case.name);
    }
}

// ============================================================================
// Several adapters
// ============================================================================

fn two_adapters(model: fn() -> Sequential, targets: Vec<&str>) -> PeftModel {
    let first = AdapterConfig::lora(4, 8.0).with_targets(targets.clone()).with_init_weights(false);
    let second = AdapterConfig::lora(2, 4.0).with_targets(targets).with_init_weights(false);
    let mut peft = PeftModel::with_context(model(), first, "first", eval_ctx()).unwrap();
    peft.add_adapter("second", second).unwrap();
    peft
}

#[test]
fn test_cat_combination_matches_both_active() {
    let setups: [(fn() -> Sequential, fn() -> ShapedTensor, Vec<&str>); 3] = [
        (mlp, mlp_input, vec!["lin0", "lin1"]),
        (emb_conv1d, token_input, vec!["emb", "conv1d"]),
        (conv2d, image_input, vec!["conv2d"]),
    ];
    for (model, input, targets) in setups {
        let mut peft = two_adapters(model, targets);
        peft.set_active_adapters(&["first", "second"]).unwrap();
        let both = peft.forward(&input());

        peft.add_weighted_adapter(&["first", "second"], &[1.0, 1.0], "cat", CombinationType::Cat).unwrap();
        peft.set_adapter("cat").unwrap();
        assert!(peft.forward(&input()).allclose(&both, TOL));
    }
}

#[test]
fn test_multiple_active_adapters_differ_from_each_alone() {
    let mut peft = two_adapters(mlp, vec!["lin0"]);
    let x = mlp_input();
    let first = peft.forward(&x);
    peft.set_adapter("second").unwrap();
    let second = peft.forward(&x);
    peft.set_active_adapters(&["first", "second"]).unwrap();
    let both = peft.forward(&x);

    assert!(!both.allclose(&first, TOL));
    assert!(!both.allclose(&second, TOL));
    let summed: Vec<f32> = first.to_vec().iter().zip(second.to_vec()).map(|(a, b)| a + b).collect();
    assert!(!close(&both.to_vec(), &summed));
}

#[test]
fn test_switching_moves_requires_grad() {
    let mut peft = two_adapters(mlp, vec!["lin0", "lin1"]);
    for round in 0..3 {
        for (active, other) in [("first", "second"), ("second", "first")] {
            peft.set_adapter(active).unwrap();
            for (name, tensor) in peft.named_parameters() {
                if name.ends_with(&format!(".{active}")) {
                    assert!(tensor.requires_grad(), "round {round}: '{name}' should train");
                } else {
                    assert!(!tensor.requires_grad(), "round {round}: '{name}' should be frozen");
                }
                assert!(!(name.ends_with(&format!(".{other}")) && tensor.requires_grad()));
            }
        }
    }
}
