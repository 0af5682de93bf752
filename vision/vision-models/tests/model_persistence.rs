//! Registry and checkpoint round trips for model-level blocks.
//!
//! To run: cargo test -p vision-models --test model_persistence

#![allow(clippy::unwrap_used, clippy::expect_used)]

use burn::prelude::Backend;
use burn::tensor::{Distribution, Tensor};
use burn_ndarray::NdArray;
use tempfile::tempdir;
use vision_layers::{BlockSpec, CheckpointFormat, load_block, save_block};
use vision_models::{FASTER_RCNN_RESNET_FPN, FasterRcnnFpnConfig, model_registry};
use vision_types::{Nhwc, TensorShape};

type TestBackend = NdArray<f32>;

fn device() -> <TestBackend as Backend>::Device {
    <TestBackend as Backend>::Device::default()
}

#[test]
fn extractor_round_trips_through_manifest() {
    let dir = tempdir().expect("temp dir");
    let registry = model_registry::<TestBackend>().expect("registry");

    let config = FasterRcnnFpnConfig::default()
        .with_base_width(4)
        .with_stage_blocks([1, 1, 1, 1])
        .with_additional_layer_depth(8)
        .with_levels(2, 6);
    let spec = BlockSpec::from_config(FASTER_RCNN_RESNET_FPN, &config).expect("spec");
    let input = TensorShape::from([1, 64, 64, 3]);

    let block = registry
        .materialize(&spec, std::slice::from_ref(&input), &device())
        .expect("materialized");
    assert_eq!(block.output_shapes().len(), 5);
    assert_eq!(block.output_shapes()[4], Nhwc::new(1, 1, 1, 8));

    let stem = dir.path().join("extractor");
    let manifest = save_block(
        block.as_ref(),
        stem.to_str().expect("utf-8 path"),
        CheckpointFormat::Binary,
    )
    .expect("saved");
    let restored = load_block(&registry, &manifest, &device()).expect("loaded");
    assert_eq!(restored.block_type(), FASTER_RCNN_RESNET_FPN);
    assert_eq!(restored.output_shapes(), block.output_shapes());

    let x = Tensor::<TestBackend, 4>::random([1, 64, 64, 3], Distribution::Default, &device());
    let expected = block.try_forward(vec![x.clone()]).expect("forward");
    let actual = restored.try_forward(vec![x]).expect("forward");
    assert_eq!(expected.len(), actual.len());
    for (a, b) in expected.into_iter().zip(actual) {
        assert_eq!(a.dims(), b.dims());
        let a = a.into_data().to_vec::<f32>().expect("f32 data");
        let b = b.into_data().to_vec::<f32>().expect("f32 data");
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-5, "{x} != {y}");
        }
    }
}

#[test]
fn json_describes_extractor() {
    let json = r#"{
        "type": "faster_rcnn_resnet_fpn",
        "config": {"depth": "resnet101", "first_stage_features_stride": 8}
    }"#;
    let spec: BlockSpec = serde_json::from_str(json).expect("valid spec");
    let config: FasterRcnnFpnConfig = spec.parse_config().expect("typed config");
    assert_eq!(config.depth.block_counts(), [3, 4, 23, 3]);
    assert_eq!(config.first_stage_features_stride, 8);
    assert_eq!(config.additional_layer_depth, 256);
}
