//! Registry entries for the model-level blocks.

use burn::prelude::Backend;
use vision_layers::{BlockRegistry, BlockSpec, DynBlock, RegisteredBlock, nhwc_inputs};
use vision_types::TensorShape;

use crate::box_classifier::{BoxClassifierConfig, BoxClassifierHead};
use crate::feature_extractor::{FasterRcnnFpnConfig, FasterRcnnFpnExtractor};

/// Registry name of [`FasterRcnnFpnExtractor`].
pub const FASTER_RCNN_RESNET_FPN: &str = "faster_rcnn_resnet_fpn";

/// Registry name of [`BoxClassifierHead`].
pub const BOX_CLASSIFIER_HEAD: &str = "box_classifier_head";

/// Adds the model-level blocks to a registry.
///
/// # Errors
///
/// Returns [`vision_layers::LayerError::DuplicateBlockType`] if a name is
/// already taken.
pub fn register_models<B: Backend>(registry: &mut BlockRegistry<B>) -> vision_layers::Result<()> {
    registry.register(FASTER_RCNN_RESNET_FPN, extractor_factory::<B>)?;
    registry.register(BOX_CLASSIFIER_HEAD, box_classifier_factory::<B>)
}

/// Registry with every layer and model block.
///
/// # Errors
///
/// Returns an error if a model name collides with a layer name.
pub fn model_registry<B: Backend>() -> vision_layers::Result<BlockRegistry<B>> {
    let mut registry = BlockRegistry::with_layers();
    register_models(&mut registry)?;
    Ok(registry)
}

fn extractor_factory<B: Backend>(
    spec: &BlockSpec,
    inputs: &[TensorShape],
    device: &B::Device,
) -> vision_layers::Result<Box<dyn DynBlock<B>>> {
    let config: FasterRcnnFpnConfig = spec.parse_config()?;
    let shapes = nhwc_inputs(FASTER_RCNN_RESNET_FPN, inputs, 1)?;
    let extractor = config.materialize::<B>(shapes[0], device)?;
    let outputs = extractor.output_shapes().to_vec();
    Ok(Box::new(RegisteredBlock::new(
        spec.clone(),
        shapes,
        outputs,
        extractor,
        |extractor: &FasterRcnnFpnExtractor<B>, mut inputs| {
            Ok(extractor.try_extract_proposal_features(inputs.remove(0))?)
        },
    )))
}

fn box_classifier_factory<B: Backend>(
    spec: &BlockSpec,
    inputs: &[TensorShape],
    device: &B::Device,
) -> vision_layers::Result<Box<dyn DynBlock<B>>> {
    let config: BoxClassifierConfig = spec.parse_config()?;
    let shapes = nhwc_inputs(BOX_CLASSIFIER_HEAD, inputs, 1)?;
    let head = config.materialize::<B>(shapes[0], device)?;
    let outputs = vec![head.output_shape()];
    Ok(Box::new(RegisteredBlock::new(
        spec.clone(),
        shapes,
        outputs,
        head,
        |head: &BoxClassifierHead<B>, mut inputs| Ok(vec![head.try_forward(inputs.remove(0))?]),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Tensor;
    use burn_ndarray::NdArray;
    use vision_layers::{CONV_BLOCK, LayerError};

    type TestBackend = NdArray<f32>;

    fn device() -> <TestBackend as Backend>::Device {
        <TestBackend as Backend>::Device::default()
    }

    #[test]
    fn model_registry_holds_everything() {
        let registry = model_registry::<TestBackend>();
        assert!(registry.is_ok());
        if let Ok(registry) = registry {
            assert!(registry.contains(CONV_BLOCK));
            assert!(registry.contains(FASTER_RCNN_RESNET_FPN));
            assert!(registry.contains(BOX_CLASSIFIER_HEAD));
        }
    }

    #[test]
    fn registering_twice_fails() {
        let mut registry = BlockRegistry::<TestBackend>::new();
        assert!(register_models(&mut registry).is_ok());
        assert!(matches!(
            register_models(&mut registry),
            Err(LayerError::DuplicateBlockType(_))
        ));
    }

    #[test]
    fn invalid_stride_surfaces_as_config_error() {
        let registry = model_registry::<TestBackend>();
        assert!(registry.is_ok());
        if let Ok(registry) = registry {
            let spec = BlockSpec::new(
                FASTER_RCNN_RESNET_FPN,
                serde_json::json!({"first_stage_features_stride": 32}),
            );
            let result = registry.materialize(&spec, &[TensorShape::from([1, 64, 64, 3])], &device());
            assert!(matches!(result, Err(LayerError::InvalidConfig(_))));
        }
    }

    #[test]
    fn head_through_registry() {
        let registry = model_registry::<TestBackend>();
        assert!(registry.is_ok());
        if let Ok(registry) = registry {
            let spec = BlockSpec::new(BOX_CLASSIFIER_HEAD, serde_json::json!({"hidden": 32}));
            let block = registry.materialize(&spec, &[TensorShape::from([3, 7, 7, 16])], &device());
            assert!(block.is_ok());
            if let Ok(block) = block {
                let out = block.try_forward(vec![Tensor::ones([3, 7, 7, 16], &device())]);
                assert!(out.is_ok_and(|out| out[0].dims() == [3, 1, 1, 32]));
            }
        }
    }
}
