//! Faster-RCNN ResNet-v1 FPN feature extraction on Burn.
//!
//! Composes the blocks of `vision-layers` into a detection backbone:
//!
//! - [`ResNet`] - ResNet-v1 50/101/152 bottleneck backbone producing `C2..C5`
//! - [`Fpn`] - Top-down feature pyramid with optional extra coarse levels
//! - [`FasterRcnnFpnExtractor`] - Backbone plus pyramid, the first-stage
//!   proposal feature extractor
//! - [`BoxClassifierHead`] - Second-stage head over cropped proposals
//!
//! Shapes can be inferred from a configuration without allocating any
//! parameters, which is how full-size networks are checked cheaply.
//!
//! # Registry
//!
//! [`register_models`] adds the extractor and the head to a
//! [`vision_layers::BlockRegistry`], so they can be rebuilt from JSON specs
//! and persisted with [`vision_layers::save_block`].
//!
//! # Example
//!
//! ```
//! use burn::tensor::Tensor;
//! use burn_ndarray::NdArray;
//! use vision_models::FasterRcnnFpnConfig;
//! use vision_types::Nhwc;
//!
//! let device = Default::default();
//! let config = FasterRcnnFpnConfig::default()
//!     .with_base_width(4)
//!     .with_stage_blocks([1, 1, 1, 1])
//!     .with_additional_layer_depth(8);
//! let input = Nhwc::new(1, 64, 64, 3);
//! let extractor = config.materialize::<NdArray<f32>>(input, &device)?;
//! let levels = extractor.extract_proposal_features(Tensor::zeros(input.to_array(), &device));
//! assert_eq!(levels[0].dims(), [1, 16, 16, 8]);
//! # Ok::<(), vision_models::ModelError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

mod box_classifier;
mod error;
mod feature_extractor;
mod fpn;
mod registry;
mod resnet;

// Re-export model types
pub use box_classifier::{BoxClassifierConfig, BoxClassifierHead};
pub use feature_extractor::{
    CHANNEL_MEANS, FasterRcnnFpnConfig, FasterRcnnFpnExtractor, PROPOSAL_CROP_SIZE,
    SUPPORTED_FEATURE_STRIDES, preprocess,
};
pub use fpn::{Fpn, FpnConfig, MAX_BACKBONE_LEVEL, MIN_BACKBONE_LEVEL, upsample_nearest};
pub use resnet::{
    Bottleneck, BottleneckConfig, EXPANSION, ResNet, ResNetConfig, ResNetDepth, ResNetStage,
};

// Re-export registry entries
pub use registry::{BOX_CLASSIFIER_HEAD, FASTER_RCNN_RESNET_FPN, model_registry, register_models};

// Re-export error types
pub use error::{ModelError, Result};

/// Prelude for convenient imports.
pub mod prelude {
    pub use super::{
        BoxClassifierConfig, BoxClassifierHead, FasterRcnnFpnConfig, FasterRcnnFpnExtractor,
        ModelError, ResNetDepth, model_registry, preprocess,
    };
}
