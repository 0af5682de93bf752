//! Pyramid shapes of the Faster-RCNN ResNet-v1 FPN extractor.
//!
//! Full-size networks are checked through shape inference; a narrow
//! network is run end to end to tie inference to execution.
//!
//! To run: cargo test -p vision-models --test feature_extractor_shapes

#![allow(clippy::unwrap_used, clippy::expect_used)]

use burn::prelude::Backend;
use burn::tensor::{Distribution, Tensor};
use burn_ndarray::NdArray;
use vision_layers::LayerError;
use vision_models::{FasterRcnnFpnConfig, ModelError, ResNetDepth};
use vision_types::{Nhwc, ShapeError, TensorShape};

type TestBackend = NdArray<f32>;

fn device() -> <TestBackend as Backend>::Device {
    <TestBackend as Backend>::Device::default()
}

/// Inference-mode extractor with stride-16 first-stage features.
fn extractor_config() -> FasterRcnnFpnConfig {
    FasterRcnnFpnConfig::new(ResNetDepth::Resnet50)
        .with_first_stage_features_stride(16)
        .with_training(false, false)
        .with_weight_decay(0.0)
}

fn arrays(shapes: &[Nhwc]) -> Vec<[usize; 4]> {
    shapes.iter().map(Nhwc::to_array).collect()
}

#[test]
fn extract_proposal_features_returns_expected_size() {
    let shapes = extractor_config()
        .output_shapes(&TensorShape::from([2, 448, 448, 3]))
        .expect("valid input");
    assert_eq!(
        arrays(&shapes),
        vec![
            [2, 112, 112, 256],
            [2, 56, 56, 256],
            [2, 28, 28, 256],
            [2, 14, 14, 256],
        ]
    );
}

#[test]
fn extract_proposal_features_half_size_input() {
    let shapes = extractor_config()
        .output_shapes(&TensorShape::from([2, 224, 224, 3]))
        .expect("valid input");
    assert_eq!(
        arrays(&shapes),
        vec![
            [2, 56, 56, 256],
            [2, 28, 28, 256],
            [2, 14, 14, 256],
            [2, 7, 7, 256],
        ]
    );
}

#[test]
fn extract_proposal_features_rejects_incorrect_rank() {
    let result = extractor_config().output_shapes(&TensorShape::from([224, 224, 3]));
    assert!(matches!(
        result,
        Err(ModelError::Shape(ShapeError::InvalidRank { expected: 4, actual: 3, .. }))
    ));
}

#[test]
fn deeper_backbones_share_pyramid_shapes() {
    let input = TensorShape::from([1, 448, 448, 3]);
    let reference = extractor_config().output_shapes(&input).expect("resnet50");
    for depth in [ResNetDepth::Resnet101, ResNetDepth::Resnet152] {
        let shapes = FasterRcnnFpnConfig::new(depth)
            .output_shapes(&input)
            .expect("deeper backbone");
        assert_eq!(shapes, reference, "{depth}");
    }
}

#[test]
fn stride_eight_is_accepted() {
    let shapes = extractor_config()
        .with_first_stage_features_stride(8)
        .output_shapes(&TensorShape::from([2, 224, 224, 3]));
    assert!(shapes.is_ok_and(|s| s.len() == 4));
}

#[test]
fn unsupported_stride_is_rejected() {
    let result = extractor_config()
        .with_first_stage_features_stride(32)
        .output_shapes(&TensorShape::from([2, 224, 224, 3]));
    assert!(matches!(result, Err(ModelError::InvalidConfig(_))));
}

#[test]
fn narrow_extractor_runs_at_inferred_shapes() {
    let config = extractor_config()
        .with_base_width(8)
        .with_stage_blocks([1, 1, 1, 1])
        .with_additional_layer_depth(16);
    let input = Nhwc::new(2, 96, 80, 3);
    let extractor = config
        .materialize::<TestBackend>(input, &device())
        .expect("materialized");

    let images = Tensor::<TestBackend, 4>::random(
        input.to_array(),
        Distribution::Uniform(0.0, 255.0),
        &device(),
    );
    let levels = extractor
        .try_extract_proposal_features(extractor.preprocess(images))
        .expect("valid input");
    let dims: Vec<_> = levels.iter().map(Tensor::dims).collect();

    let inferred = config
        .output_shapes(&TensorShape::from(input))
        .expect("valid input");
    assert_eq!(dims, arrays(&inferred));
    assert_eq!(
        dims,
        vec![[2, 24, 20, 16], [2, 12, 10, 16], [2, 6, 5, 16], [2, 3, 3, 16]]
    );
}

#[test]
fn runtime_rank_three_is_an_error() {
    let config = extractor_config()
        .with_base_width(4)
        .with_stage_blocks([1, 1, 1, 1])
        .with_additional_layer_depth(8);
    let extractor = config
        .materialize::<TestBackend>(Nhwc::new(1, 32, 32, 3), &device())
        .expect("materialized");
    let images = Tensor::<TestBackend, 3>::zeros([32, 32, 3], &device());
    let result = extractor.try_extract_proposal_features(images);
    assert!(matches!(
        result,
        Err(ModelError::Layer(LayerError::Shape(ShapeError::InvalidRank { .. })))
    ));
}

#[test]
fn runtime_empty_extent_is_an_error() {
    let config = extractor_config()
        .with_base_width(4)
        .with_stage_blocks([1, 1, 1, 1])
        .with_additional_layer_depth(8);
    let extractor = config
        .materialize::<TestBackend>(Nhwc::new(1, 32, 32, 3), &device())
        .expect("materialized");
    let images = Tensor::<TestBackend, 4>::zeros([1, 0, 32, 3], &device());
    let result = extractor.try_extract_proposal_features(images);
    assert!(matches!(
        result,
        Err(ModelError::Shape(ShapeError::ZeroDimension { .. }))
    ));
}

#[test]
fn box_classifier_returns_expected_size() {
    let config = extractor_config();
    let head = config
        .box_classifier_config()
        .materialize::<TestBackend>(config.proposal_crop_shape(3), &device())
        .expect("materialized");
    let crops = Tensor::<TestBackend, 4>::random([3, 7, 7, 256], Distribution::Default, &device());
    let features = head.try_forward(crops).expect("valid crops");
    assert_eq!(features.dims(), [3, 1, 1, 1024]);
}
