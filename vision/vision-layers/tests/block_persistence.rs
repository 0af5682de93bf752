//! Registry and checkpoint round trips through the public API.
//!
//! To run: cargo test -p vision-layers --test block_persistence

#![allow(clippy::unwrap_used, clippy::expect_used)]

use burn::prelude::Backend;
use burn::tensor::{Distribution, Tensor};
use burn_ndarray::NdArray;
use tempfile::tempdir;
use vision_layers::{
    BlockManifest, BlockRegistry, BlockSpec, CSP_CONNECT, CheckpointFormat, ConvBlockConfig,
    CspConnectConfig, LayerError, load_block, load_checkpoint, save_block,
};
use vision_types::{ActivationKind, ConvHyperparams, InitializerKind, TensorShape};

type TestBackend = NdArray<f32>;

fn device() -> <TestBackend as Backend>::Device {
    <TestBackend as Backend>::Device::default()
}

fn to_vec(x: Tensor<TestBackend, 4>) -> Vec<f32> {
    x.into_data().to_vec::<f32>().expect("f32 data")
}

#[test]
fn json_block_materializes_through_registry() {
    let json = r#"{
        "type": "csp_connect",
        "config": {
            "filters": 16,
            "filter_reduce": 4,
            "activation": "leaky",
            "kernel_initializer": {"truncated_normal": {"mean": 0.0, "stddev": 0.02}},
            "weight_decay": 0.0001
        }
    }"#;
    let spec: BlockSpec = serde_json::from_str(json).expect("valid spec");
    assert_eq!(spec.block_type, CSP_CONNECT);

    let typed: CspConnectConfig = spec.parse_config().expect("typed config");
    assert_eq!(typed.filter_reduce, 4);
    assert_eq!(typed.hyperparams.activation, ActivationKind::Leaky);

    let registry = BlockRegistry::<TestBackend>::with_layers();
    let prev = TensorShape::from([2, 6, 6, 12]);
    let csp = TensorShape::from([2, 6, 6, 4]);
    let block = registry
        .materialize(&spec, &[prev, csp], &device())
        .expect("materialized");

    let out = block
        .try_forward(vec![
            Tensor::ones([2, 6, 6, 12], &device()),
            Tensor::ones([2, 6, 6, 4], &device()),
        ])
        .expect("forward");
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].dims(), [2, 6, 6, 16]);
    assert_eq!(block.output_shapes()[0].to_array(), [2, 6, 6, 16]);
}

#[test]
fn block_round_trips_through_checkpoint() {
    let dir = tempdir().expect("temp dir");
    let registry = BlockRegistry::<TestBackend>::with_layers();
    let hp = ConvHyperparams::default()
        .with_bn(false)
        .with_kernel_initializer(InitializerKind::HeNormal);
    let spec = BlockSpec::from_config("conv_block", &ConvBlockConfig::new(8, 3).with_hyperparams(hp))
        .expect("spec");
    let input = TensorShape::from([1, 10, 10, 3]);

    for format in [CheckpointFormat::Binary, CheckpointFormat::Json] {
        let block = registry
            .materialize(&spec, std::slice::from_ref(&input), &device())
            .expect("materialized");
        let stem = dir.path().join(format!("conv_{format}"));
        let manifest_path =
            save_block(block.as_ref(), stem.to_str().expect("utf-8 path"), format).expect("saved");
        assert_eq!(manifest_path, BlockManifest::path_for(stem.to_str().expect("utf-8 path")));
        assert!(manifest_path.exists());

        let restored = load_block(&registry, &manifest_path, &device()).expect("loaded");
        assert_eq!(restored.spec(), block.spec());
        assert_eq!(restored.num_params(), block.num_params());

        let x = Tensor::<TestBackend, 4>::random([1, 10, 10, 3], Distribution::Default, &device());
        let expected = to_vec(block.try_forward(vec![x.clone()]).expect("forward").remove(0));
        let actual = to_vec(restored.try_forward(vec![x]).expect("forward").remove(0));
        assert_eq!(expected.len(), actual.len());
        for (a, b) in expected.iter().zip(&actual) {
            assert!((a - b).abs() < 1e-6, "{a} != {b}");
        }
    }
}

#[test]
fn freshly_materialized_blocks_differ() {
    // Random initialization: two materializations disagree until weights
    // are loaded.
    let registry = BlockRegistry::<TestBackend>::with_layers();
    let spec = BlockSpec::from_config(
        "conv_block",
        &ConvBlockConfig::new(4, 3).with_hyperparams(ConvHyperparams::default().with_bn(false)),
    )
    .expect("spec");
    let input = [TensorShape::from([1, 5, 5, 2])];
    let a = registry.materialize(&spec, &input, &device()).expect("a");
    let b = registry.materialize(&spec, &input, &device()).expect("b");

    let x = Tensor::<TestBackend, 4>::ones([1, 5, 5, 2], &device());
    let ya = to_vec(a.try_forward(vec![x.clone()]).expect("forward").remove(0));
    let yb = to_vec(b.try_forward(vec![x]).expect("forward").remove(0));
    assert_ne!(ya, yb);
}

#[test]
fn missing_manifest_is_reported() {
    let dir = tempdir().expect("temp dir");
    let registry = BlockRegistry::<TestBackend>::with_layers();
    let result = load_block(&registry, &dir.path().join("absent.manifest.json"), &device());
    assert!(matches!(result, Err(LayerError::CheckpointNotFound(_))));
}

#[test]
fn manifest_with_unknown_type_is_rejected() {
    let dir = tempdir().expect("temp dir");
    let manifest = BlockManifest {
        spec: BlockSpec::new("spp", serde_json::json!({"filters": 8})),
        input_shapes: vec![vision_types::Nhwc::new(1, 4, 4, 8)],
        format: CheckpointFormat::Binary,
        weights: "spp.bin".to_owned(),
    };
    let path = dir.path().join("spp.manifest.json");
    std::fs::write(&path, serde_json::to_string(&manifest).expect("json")).expect("write");

    let registry = BlockRegistry::<TestBackend>::with_layers();
    let result = load_block(&registry, &path, &device());
    assert!(matches!(result, Err(LayerError::UnknownBlockType(name)) if name == "spp"));
}

#[test]
fn manifest_format_must_match_weights() {
    let dir = tempdir().expect("temp dir");
    let registry = BlockRegistry::<TestBackend>::with_layers();
    let spec = BlockSpec::from_config("conv_block", &ConvBlockConfig::new(4, 1)).expect("spec");
    let block = registry
        .materialize(&spec, &[TensorShape::from([1, 4, 4, 2])], &device())
        .expect("materialized");
    let stem = dir.path().join("conv");
    let manifest_path = save_block(
        block.as_ref(),
        stem.to_str().expect("utf-8 path"),
        CheckpointFormat::Binary,
    )
    .expect("saved");

    let mut manifest: BlockManifest =
        serde_json::from_str(&std::fs::read_to_string(&manifest_path).expect("read"))
            .expect("manifest");
    manifest.format = CheckpointFormat::Json;
    std::fs::write(&manifest_path, serde_json::to_string(&manifest).expect("json"))
        .expect("write");

    let result = load_block(&registry, &manifest_path, &device());
    assert!(matches!(result, Err(LayerError::LoadCheckpoint { .. })));
}

#[test]
fn burn_extension_is_not_a_checkpoint_format() {
    let dir = tempdir().expect("temp dir");
    let path = dir.path().join("conv.burn");
    std::fs::write(&path, b"").expect("write");

    let block = ConvBlockConfig::new(4, 1)
        .materialize::<TestBackend>(vision_types::Nhwc::new(1, 4, 4, 2), &device())
        .expect("materialized");
    let result = load_checkpoint::<TestBackend, _>(
        block,
        path.to_str().expect("utf-8 path"),
        &device(),
    );
    assert!(matches!(result, Err(LayerError::UnsupportedFormat(_))));
}
