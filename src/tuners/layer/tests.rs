//! Tests for the tunable layer wrapper

use super::*;
use crate::autograd::{Context, Tensor};
use crate::error::PeftError;
use crate::nn::{Conv1D, Conv2d, Embedding, Layer, Linear, ShapedTensor};
use crate::tuners::config::{AdapterConfig, PeftMethod};
use crate::tuners::method::AdapterWeights;
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

fn linear(d_in: usize, d_out: usize, seed: u64) -> Layer {
    Linear::new(d_in, d_out, true, &mut StdRng::seed_from_u64(seed)).into()
}

fn wrapped(layer: Layer, config: &AdapterConfig, adapters: &[&str], seed: u64) -> TunerLayer {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut tuner = TunerLayer::new(layer, "layer", config.peft_type).expect("layer should be supported");
    for name in adapters {
        tuner.update("layer", name, config, &mut rng).expect("update should succeed");
    }
    tuner.set_adapter(&names(&adapters[..1]));
    tuner
}

fn input(rows: usize, cols: usize) -> ShapedTensor {
    let data = (0..rows * cols).map(|i| ((i as f32) * 0.37).sin()).collect();
    ShapedTensor::from_vec(data, vec![rows, cols])
}

fn eval_ctx() -> Context {
    let mut ctx = Context::with_seed(0);
    ctx.eval();
    ctx
}

fn random_lora() -> AdapterConfig {
    AdapterConfig::lora(2, 4.0).with_targets("layer").with_init_weights(false)
}

// ========================================================================
// PROPERTY TESTS
// ========================================================================

proptest! {
    #![proptest_config(proptest::test_runner::Config::with_cases(64))]

    #[test]
    fn prop_default_init_gives_base_output(
        d_in in 1usize..8,
        d_out in 1usize..8,
        rank in 1usize..4,
        seed in 0u64..1000,
    ) {
        let config = AdapterConfig::lora(rank, 8.0).with_targets("layer");
        let tuner = wrapped(linear(d_in, d_out, seed), &config, &["default"], seed);
        let ctx = eval_ctx();
        let x = input(3, d_in);

        let adapted = tuner.forward(&x, &ctx);
        let base = tuner.base().forward(&x);
        prop_assert!(adapted.allclose(&base, 1e-6));
    }

    #[test]
    fn prop_merge_preserves_forward_and_unmerge_restores_weight(
        d_in in 1usize..8,
        d_out in 1usize..8,
        method in 0usize..3,
        seed in 0u64..1000,
    ) {
        let config = match method {
            0 => random_lora(),
            1 => AdapterConfig::ia3().with_targets("layer").with_init_weights(false),
            _ => AdapterConfig::adalora(3, 1).with_targets("layer").with_init_weights(false),
        };
        let mut tuner = wrapped(linear(d_in, d_out, seed), &config, &["default"], seed);
        let ctx = eval_ctx();
        let x = input(2, d_in);
        let weight_before = tuner.base().weight().to_vec();
        let unmerged_out = tuner.forward(&x, &ctx);

        tuner.merge(None).expect("merge should succeed");
        prop_assert!(tuner.is_merged());
        let merged_out = tuner.forward(&x, &ctx);
        prop_assert!(merged_out.allclose(&unmerged_out, 1e-4));

        tuner.unmerge().expect("unmerge should succeed");
        for (a, b) in tuner.base().weight().data().iter().zip(weight_before.iter()) {
            prop_assert!((a - b).abs() < 1e-4);
        }
    }

    #[test]
    fn prop_multi_adapter_merge_any_order_restores(
        d_in in 1usize..6,
        d_out in 1usize..6,
        reverse in any::<bool>(),
        seed in 0u64..1000,
    ) {
        let mut tuner = wrapped(linear(d_in, d_out, seed), &random_lora(), &["a", "b", "c"], seed);
        let order = if reverse { names(&["c", "b", "a"]) } else { names(&["a", "b", "c"]) };
        tuner.set_adapter(&order);
        let ctx = eval_ctx();
        let x = input(2, d_in);
        let before = tuner.base().weight().to_vec();
        let expected = tuner.forward(&x, &ctx);

        tuner.merge(None).expect("merge should succeed");
        prop_assert_eq!(tuner.merged_adapters(), order.as_slice());
        prop_assert!(tuner.forward(&x, &ctx).allclose(&expected, 1e-4));

        tuner.unmerge().expect("unmerge should succeed");
        for (a, b) in tuner.base().weight().data().iter().zip(before.iter()) {
            prop_assert!((a - b).abs() < 1e-4);
        }
    }
}

// ========================================================================
// LAYER KINDS
// ========================================================================

#[test]
fn test_merge_matches_forward_for_every_layer_kind() {
    let mut rng = StdRng::seed_from_u64(11);
    let kinds: Vec<(Layer, ShapedTensor)> = vec![
        (Embedding::new(10, 4, &mut rng).into(), ShapedTensor::from_vec(vec![1.0, 7.0, 3.0], vec![1, 3])),
        (Conv1D::new(3, 5, &mut rng).into(), input(2, 5)),
        (
            Conv2d::new(2, 3, 2, &mut rng).into(),
            ShapedTensor::from_vec((0..18).map(|i| (i as f32 * 0.1).cos()).collect(), vec![1, 2, 3, 3]),
        ),
    ];
    let ctx = eval_ctx();

    for (layer, x) in kinds {
        let kind = layer.kind();
        let mut tuner = wrapped(layer, &random_lora(), &["default"], 5);
        let base_out = tuner.base().forward(&x);
        let adapted = tuner.forward(&x, &ctx);
        assert!(!adapted.allclose(&base_out, 1e-6), "{kind}: random adapter must change the output");

        tuner.merge(None).expect("merge should succeed");
        assert!(tuner.forward(&x, &ctx).allclose(&adapted, 1e-4), "{kind}: merged output differs");
        tuner.unmerge().expect("unmerge should succeed");
        assert!(tuner.base().forward(&x).allclose(&base_out, 1e-4), "{kind}: unmerge did not restore");
    }
}

#[test]
fn test_ia3_conv2d_feedforward_merge() {
    let mut rng = StdRng::seed_from_u64(3);
    let layer: Layer = Conv2d::new(2, 2, 1, &mut rng).into();
    let config = AdapterConfig::ia3()
        .with_targets("layer")
        .with_feedforward_modules("layer")
        .with_init_weights(false);
    let mut tuner = wrapped(layer, &config, &["default"], 4);
    let ctx = eval_ctx();
    let x = ShapedTensor::from_vec((0..8).map(|i| i as f32 * 0.25).collect(), vec![1, 2, 2, 2]);

    let adapted = tuner.forward(&x, &ctx);
    tuner.merge(None).expect("merge should succeed");
    assert!(tuner.forward(&x, &ctx).allclose(&adapted, 1e-4));
}

#[test]
fn test_unsupported_method_layer_pairs() {
    let mut rng = StdRng::seed_from_u64(0);
    let embedding: Layer = Embedding::new(4, 2, &mut rng).into();
    let mut tuner = TunerLayer::new(embedding, "emb", PeftMethod::Ia3).expect("wrapper should build");
    let err = tuner
        .update("emb", "default", &AdapterConfig::ia3().with_targets("emb"), &mut rng)
        .unwrap_err();
    assert!(matches!(err, PeftError::UnsupportedLayer { kind: "Embedding", method: "IA3", .. }));

    let conv: Layer = Conv2d::new(1, 1, 1, &mut rng).into();
    let mut tuner = TunerLayer::new(conv, "conv", PeftMethod::AdaLora).expect("wrapper should build");
    let err = tuner
        .update("conv", "default", &AdapterConfig::adalora(2, 1).with_targets("conv"), &mut rng)
        .unwrap_err();
    assert!(matches!(err, PeftError::UnsupportedLayer { .. }));
}

// ========================================================================
// STATE MACHINE
// ========================================================================

#[test]
fn test_merge_errors() {
    let mut tuner = wrapped(linear(3, 2, 0), &random_lora(), &["a", "b"], 0);

    assert!(matches!(tuner.unmerge(), Err(PeftError::NothingMerged)));
    assert!(matches!(tuner.merge(Some(&names(&["zzz"]))), Err(PeftError::UnknownAdapter(_))));

    tuner.merge(None).expect("merge should succeed");
    assert!(matches!(tuner.merge(None), Err(PeftError::AlreadyMerged(name)) if name == "a"));
    assert!(matches!(tuner.merge(Some(&names(&["a"]))), Err(PeftError::AlreadyMerged(_))));

    // a different adapter can still be merged explicitly
    tuner.merge(Some(&names(&["b"]))).expect("merge should succeed");
    assert_eq!(tuner.merged_adapters(), names(&["a", "b"]).as_slice());
}

#[test]
fn test_duplicate_merge_names_rejected() {
    let mut tuner = wrapped(linear(3, 2, 8), &random_lora(), &["a"], 8);
    let base_weight = tuner.base().weight().to_vec();

    let err = tuner.merge(Some(&names(&["a", "a"]))).unwrap_err();
    assert!(matches!(err, PeftError::AlreadyMerged(name) if name == "a"));
    assert!(!tuner.is_merged());
    assert_eq!(tuner.base().weight().to_vec(), base_weight);
}

#[test]
fn test_unmerge_while_disabled_drops_pending_merge() {
    let mut tuner = wrapped(linear(4, 3, 9), &random_lora(), &["a"], 9);
    let ctx = eval_ctx();
    let x = input(2, 4);
    let base_weight = tuner.base().weight().to_vec();
    let base_out = tuner.base().forward(&x);

    tuner.merge(None).expect("merge should succeed");
    tuner.enable_adapters(false);
    tuner.unmerge().expect("unmerge should succeed");
    assert!(!tuner.is_merged());
    assert!(matches!(tuner.unmerge(), Err(PeftError::NothingMerged)));

    tuner.enable_adapters(true);
    assert!(tuner.merged_adapters().is_empty());
    assert!(tuner.base().weight().allclose(&Tensor::constant(base_weight), 1e-5));
    assert!(!tuner.forward(&x, &ctx).allclose(&base_out, 1e-4));
    tuner.delete_adapter("a").expect("unmerged adapter can be deleted");
}

#[test]
fn test_merged_adapter_is_not_counted_twice() {
    let mut tuner = wrapped(linear(3, 2, 1), &random_lora(), &["a", "b"], 1);
    tuner.set_adapter(&names(&["a", "b"]));
    let ctx = eval_ctx();
    let x = input(2, 3);
    let expected = tuner.forward(&x, &ctx);

    tuner.merge(Some(&names(&["a"]))).expect("merge should succeed");
    assert!(tuner.forward(&x, &ctx).allclose(&expected, 1e-4));
}

#[test]
fn test_delete_merged_adapter_fails() {
    let mut tuner = wrapped(linear(3, 2, 2), &random_lora(), &["a", "b"], 2);
    tuner.merge(None).expect("merge should succeed");
    assert!(matches!(tuner.delete_adapter("a"), Err(PeftError::AdapterMerged(_))));
    assert!(matches!(tuner.delete_adapter("nope"), Err(PeftError::UnknownAdapter(_))));

    tuner.delete_adapter("b").expect("unmerged adapter can be deleted");
    tuner.unmerge().expect("unmerge should succeed");
    tuner.delete_adapter("a").expect("delete after unmerge should succeed");
    assert!(tuner.adapter_names().is_empty());
    assert!(tuner.active_adapters().is_empty());
}

#[test]
fn test_duplicate_and_mixed_methods_rejected() {
    let mut rng = StdRng::seed_from_u64(0);
    let mut tuner = wrapped(linear(3, 2, 3), &random_lora(), &["a"], 3);
    assert!(matches!(
        tuner.update("layer", "a", &random_lora(), &mut rng),
        Err(PeftError::DuplicateAdapter(_))
    ));
    assert!(matches!(
        tuner.update("layer", "b", &AdapterConfig::ia3().with_targets("layer"), &mut rng),
        Err(PeftError::MethodMismatch { .. })
    ));
}

#[test]
fn test_set_adapter_switches_requires_grad() {
    let mut tuner = wrapped(linear(3, 2, 4), &random_lora(), &["a", "b"], 4);

    let trainable = |tuner: &TunerLayer| -> Vec<String> {
        tuner
            .parameters()
            .into_iter()
            .filter(|(n, t)| n.starts_with("lora_") && t.requires_grad())
            .map(|(n, _)| n)
            .collect()
    };

    assert_eq!(trainable(&tuner), names(&["lora_A.a", "lora_B.a"]));
    tuner.set_adapter(&names(&["b"]));
    assert_eq!(trainable(&tuner), names(&["lora_A.b", "lora_B.b"]));
    tuner.set_adapter(&names(&["a", "b"]));
    assert_eq!(trainable(&tuner).len(), 4);
    tuner.set_adapter(&[]);
    assert!(trainable(&tuner).is_empty());
}

#[test]
fn test_inference_mode_adapter_stays_frozen() {
    let config = random_lora().with_inference_mode(true);
    let tuner = wrapped(linear(3, 2, 5), &config, &["a"], 5);
    let slot = tuner.adapter("a").expect("adapter should exist");
    assert!(slot.weights.tensors().iter().all(|(_, t)| !t.requires_grad()));
}

#[test]
fn test_disable_unmerges_and_enable_remerges() {
    let mut tuner = wrapped(linear(4, 3, 6), &random_lora(), &["a"], 6);
    let ctx = eval_ctx();
    let x = input(2, 4);
    let base_weight = tuner.base().weight().to_vec();
    let base_out = tuner.base().forward(&x);
    let adapted = tuner.forward(&x, &ctx);

    tuner.merge(None).expect("merge should succeed");
    tuner.enable_adapters(false);
    assert!(tuner.is_disabled());
    assert!(tuner.merged_adapters().is_empty());
    assert!(tuner.is_merged());
    assert!(tuner.holds_merge("a"));
    assert!(tuner.base().weight().allclose(&Tensor::constant(base_weight), 1e-5));
    assert!(tuner.forward(&x, &ctx).allclose(&base_out, 1e-4));
    assert!(matches!(tuner.merge(None), Err(PeftError::AdaptersDisabled)));
    assert!(matches!(tuner.delete_adapter("a"), Err(PeftError::AdapterMerged(_))));

    tuner.enable_adapters(true);
    assert_eq!(tuner.merged_adapters(), names(&["a"]).as_slice());
    assert!(tuner.forward(&x, &ctx).allclose(&adapted, 1e-4));
}

#[test]
fn test_adalora_resize_keeps_output() {
    let config = AdapterConfig::adalora(4, 2).with_targets("layer").with_init_weights(false);
    let mut tuner = wrapped(linear(5, 3, 7), &config, &["default"], 7);
    let keep = [true, false, false, true];
    if let Some(AdapterWeights::AdaLora(w)) = tuner.adapter_mut("default").map(|s| &mut s.weights) {
        w.mask(&keep);
    }
    let ctx = eval_ctx();
    let x = input(2, 5);
    let masked = tuner.forward(&x, &ctx);

    assert!(matches!(tuner.resize_adapter("default", &[true]), Err(PeftError::RankMismatch(_))));
    tuner.resize_adapter("default", &keep).expect("resize should succeed");
    assert_eq!(tuner.adapter("default").map(|s| s.weights.rank()), Some(2));
    assert!(tuner.forward(&x, &ctx).allclose(&masked, 1e-5));
}

#[test]
fn test_unload_undoes_merge_and_merge_and_unload_keeps_it() {
    let tuner = wrapped(linear(3, 3, 8), &random_lora(), &["a"], 8);
    let ctx = eval_ctx();
    let x = input(1, 3);
    let adapted = tuner.forward(&x, &ctx);
    let base_out = tuner.base().forward(&x);

    let mut merged = tuner.clone();
    merged.merge(None).expect("merge should succeed");
    let unloaded = merged.unload();
    assert!(unloaded.forward(&x, &ctx).allclose(&base_out, 1e-4));

    let folded = tuner.merge_and_unload().expect("merge_and_unload should succeed");
    assert!(matches!(folded, Layer::Linear(_)));
    assert!(folded.forward(&x, &ctx).allclose(&adapted, 1e-4));
}
