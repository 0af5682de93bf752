//! Faster-RCNN ResNet-v1 FPN feature extractor.
//!
//! Images go in channels-last; the extractor returns one feature map per
//! pyramid level `fpn_min_level..=fpn_max_level`, finest first, level `l`
//! at stride `2^l` with `additional_layer_depth` channels.
//!
//! # Example
//!
//! ```
//! use vision_models::FasterRcnnFpnConfig;
//! use vision_types::{Nhwc, TensorShape};
//!
//! let config = FasterRcnnFpnConfig::default();
//! let shapes = config.output_shapes(&TensorShape::from([2, 448, 448, 3]))?;
//! assert_eq!(shapes[0], Nhwc::new(2, 112, 112, 256));
//! assert_eq!(shapes[3], Nhwc::new(2, 14, 14, 256));
//!
//! assert!(config.output_shapes(&TensorShape::from([448, 448, 3])).is_err());
//! # Ok::<(), vision_models::ModelError>(())
//! ```

use burn::module::{Ignored, Module};
use burn::prelude::Backend;
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};
use tracing::debug;
use vision_layers::ops::{
    check_channels, expect_rank4, nhwc_of, sum_losses, to_channels_first, to_channels_last,
};
use vision_types::{ActivationKind, ConvHyperparams, InitializerKind, Nhwc, TensorShape};

use crate::box_classifier::{BoxClassifierConfig, BoxClassifierHead};
use crate::error::{ModelError, Result};
use crate::fpn::{Fpn, FpnConfig, MIN_BACKBONE_LEVEL};
use crate::resnet::{ResNet, ResNetConfig, ResNetDepth};

/// ResNet channel means subtracted by [`preprocess`], RGB order.
pub const CHANNEL_MEANS: [f32; 3] = [123.68, 116.779, 103.939];

/// Spatial extent of the proposal crops fed to the box classifier.
pub const PROPOSAL_CROP_SIZE: usize = 7;

/// First-stage feature strides the detector supports.
pub const SUPPORTED_FEATURE_STRIDES: [usize; 2] = [8, 16];

const fn default_base_width() -> usize {
    64
}

const fn default_features_stride() -> usize {
    16
}

const fn default_min_level() -> usize {
    2
}

const fn default_max_level() -> usize {
    5
}

const fn default_layer_depth() -> usize {
    256
}

/// Configuration of a [`FasterRcnnFpnExtractor`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FasterRcnnFpnConfig {
    /// Backbone depth.
    #[serde(default)]
    pub depth: ResNetDepth,

    /// First-stage backbone width.
    #[serde(default = "default_base_width")]
    pub base_width: usize,

    /// Overrides the block counts of `depth`.
    #[serde(default)]
    pub stage_blocks: Option<[usize; 4]>,

    /// Output stride of the first-stage features; 8 or 16.
    #[serde(default = "default_features_stride")]
    pub first_stage_features_stride: usize,

    /// Whether the extractor is built for training.
    #[serde(default)]
    pub is_training: bool,

    /// Whether backbone batch norm parameters train along with the rest.
    #[serde(default)]
    pub batch_norm_trainable: bool,

    /// L2 weight decay of the backbone convolutions.
    #[serde(default)]
    pub weight_decay: f64,

    /// Hyperparameters of the pyramid convolutions.
    #[serde(default = "FasterRcnnFpnConfig::default_conv_hyperparams")]
    pub conv_hyperparams: ConvHyperparams,

    /// Finest pyramid level.
    #[serde(default = "default_min_level")]
    pub fpn_min_level: usize,

    /// Coarsest pyramid level.
    #[serde(default = "default_max_level")]
    pub fpn_max_level: usize,

    /// Channels of every pyramid level.
    #[serde(default = "default_layer_depth")]
    pub additional_layer_depth: usize,
}

impl Default for FasterRcnnFpnConfig {
    fn default() -> Self {
        Self::new(ResNetDepth::default())
    }
}

impl FasterRcnnFpnConfig {
    /// Creates an inference-mode extractor of the given depth.
    #[must_use]
    pub fn new(depth: ResNetDepth) -> Self {
        Self {
            depth,
            base_width: default_base_width(),
            stage_blocks: None,
            first_stage_features_stride: default_features_stride(),
            is_training: false,
            batch_norm_trainable: false,
            weight_decay: 0.0,
            conv_hyperparams: Self::default_conv_hyperparams(),
            fpn_min_level: default_min_level(),
            fpn_max_level: default_max_level(),
            additional_layer_depth: default_layer_depth(),
        }
    }

    /// ReLU, truncated-normal kernels, no batch norm.
    #[must_use]
    pub fn default_conv_hyperparams() -> ConvHyperparams {
        ConvHyperparams::default()
            .with_activation(ActivationKind::Relu)
            .with_kernel_initializer(InitializerKind::truncated_normal())
            .with_bn(false)
    }

    /// Sets the backbone width.
    #[must_use]
    pub const fn with_base_width(mut self, base_width: usize) -> Self {
        self.base_width = base_width;
        self
    }

    /// Overrides the backbone block counts.
    #[must_use]
    pub const fn with_stage_blocks(mut self, stage_blocks: [usize; 4]) -> Self {
        self.stage_blocks = Some(stage_blocks);
        self
    }

    /// Sets the first-stage feature stride.
    #[must_use]
    pub const fn with_first_stage_features_stride(mut self, stride: usize) -> Self {
        self.first_stage_features_stride = stride;
        self
    }

    /// Sets training mode and whether batch norm trains.
    #[must_use]
    pub const fn with_training(mut self, is_training: bool, batch_norm_trainable: bool) -> Self {
        self.is_training = is_training;
        self.batch_norm_trainable = batch_norm_trainable;
        self
    }

    /// Sets the backbone weight decay.
    #[must_use]
    pub const fn with_weight_decay(mut self, weight_decay: f64) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    /// Sets the pyramid conv hyperparameters.
    #[must_use]
    pub const fn with_conv_hyperparams(mut self, hyperparams: ConvHyperparams) -> Self {
        self.conv_hyperparams = hyperparams;
        self
    }

    /// Sets the pyramid levels.
    #[must_use]
    pub const fn with_levels(mut self, min_level: usize, max_level: usize) -> Self {
        self.fpn_min_level = min_level;
        self.fpn_max_level = max_level;
        self
    }

    /// Sets the pyramid depth.
    #[must_use]
    pub const fn with_additional_layer_depth(mut self, depth: usize) -> Self {
        self.additional_layer_depth = depth;
        self
    }

    /// Checks every field.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::InvalidConfig`] describing the first problem.
    pub fn validate(&self) -> Result<()> {
        if !SUPPORTED_FEATURE_STRIDES.contains(&self.first_stage_features_stride) {
            return Err(ModelError::invalid_config(format!(
                "first_stage_features_stride must be 8 or 16, got {}",
                self.first_stage_features_stride
            )));
        }
        if !self.weight_decay.is_finite() || self.weight_decay < 0.0 {
            return Err(ModelError::invalid_config(format!(
                "weight_decay must be non-negative, got {}",
                self.weight_decay
            )));
        }
        self.backbone_config().validate()?;
        self.fpn_config().validate()
    }

    /// Backbone batch norm only trains in training mode.
    #[must_use]
    pub const fn trains_batch_norm(&self) -> bool {
        self.is_training && self.batch_norm_trainable
    }

    /// Configuration of the ResNet backbone.
    #[must_use]
    pub fn backbone_config(&self) -> ResNetConfig {
        let defaults = ResNetConfig::default_hyperparams();
        let mut hp = defaults.with_norm(defaults.norm.with_trainable(self.trains_batch_norm()));
        if self.weight_decay > 0.0 {
            hp = hp.with_weight_decay(self.weight_decay);
        }
        let config = ResNetConfig::new(self.depth)
            .with_base_width(self.base_width)
            .with_hyperparams(hp);
        match self.stage_blocks {
            Some(blocks) => config.with_stage_blocks(blocks),
            None => config,
        }
    }

    /// Configuration of the feature pyramid.
    #[must_use]
    pub fn fpn_config(&self) -> FpnConfig {
        FpnConfig::new(
            self.fpn_min_level,
            self.fpn_max_level,
            self.additional_layer_depth,
        )
        .with_hyperparams(self.conv_hyperparams)
    }

    /// Configuration of the second-stage box classifier.
    #[must_use]
    pub fn box_classifier_config(&self) -> BoxClassifierConfig {
        BoxClassifierConfig::default()
            .with_kernel_initializer(self.conv_hyperparams.kernel_initializer)
    }

    /// Shape of `num_proposals` cropped proposals for the box classifier.
    #[must_use]
    pub const fn proposal_crop_shape(&self, num_proposals: usize) -> Nhwc {
        Nhwc::new(
            num_proposals,
            PROPOSAL_CROP_SIZE,
            PROPOSAL_CROP_SIZE,
            self.additional_layer_depth,
        )
    }

    fn pyramid_inputs(&self, backbone: &[Nhwc]) -> Result<Vec<Nhwc>> {
        let fpn = self.fpn_config();
        let start = fpn.min_level - MIN_BACKBONE_LEVEL;
        backbone
            .get(start..start + fpn.num_inputs())
            .map(<[Nhwc]>::to_vec)
            .ok_or_else(|| {
                ModelError::invalid_config(format!(
                    "backbone provides {} levels, pyramid needs levels {}..={}",
                    backbone.len(),
                    fpn.min_level,
                    fpn.base_max_level()
                ))
            })
    }

    /// Infers the pyramid shapes for an input, finest first.
    ///
    /// # Errors
    ///
    /// Returns a shape error unless the input has rank 4, and
    /// [`ModelError::InvalidConfig`] for an invalid configuration.
    pub fn output_shapes(&self, input: &TensorShape) -> Result<Vec<Nhwc>> {
        let input = input.nhwc()?;
        self.validate()?;
        let backbone = self.backbone_config().output_shapes(input)?;
        self.fpn_config().output_shapes(&self.pyramid_inputs(&backbone)?)
    }

    /// Allocates backbone and pyramid for an input shape.
    ///
    /// # Errors
    ///
    /// Fails under the same conditions as [`Self::output_shapes`].
    pub fn materialize<B: Backend>(
        &self,
        input: Nhwc,
        device: &B::Device,
    ) -> Result<FasterRcnnFpnExtractor<B>> {
        let outputs = self.output_shapes(&input.into())?;
        let backbone = self.backbone_config().materialize(input, device)?;
        let fpn = self
            .fpn_config()
            .materialize(&self.pyramid_inputs(&backbone.output_shapes())?, device)?;

        let extractor = FasterRcnnFpnExtractor {
            backbone,
            fpn,
            config: Ignored(*self),
            input_shape: Ignored(input),
            output_shapes: Ignored(outputs),
        };
        debug!(
            depth = %self.depth,
            input = %input,
            levels = self.fpn_config().num_levels(),
            params = extractor.num_params(),
            "materialized faster-rcnn fpn extractor"
        );
        Ok(extractor)
    }
}

/// Subtracts [`CHANNEL_MEANS`] from three-channel `[b, h, w, 3]` images.
///
/// Inputs with another channel count are returned unchanged.
pub fn preprocess<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    let [_, _, _, channels] = x.dims();
    if channels != CHANNEL_MEANS.len() {
        return x;
    }
    let means = Tensor::<B, 1>::from_floats(CHANNEL_MEANS, &x.device()).reshape([1, 1, 1, 3]);
    x - means
}

/// ResNet-v1 backbone plus feature pyramid.
#[derive(Module, Debug)]
pub struct FasterRcnnFpnExtractor<B: Backend> {
    backbone: ResNet<B>,
    fpn: Fpn<B>,
    config: Ignored<FasterRcnnFpnConfig>,
    input_shape: Ignored<Nhwc>,
    output_shapes: Ignored<Vec<Nhwc>>,
}

impl<B: Backend> FasterRcnnFpnExtractor<B> {
    /// Computes the proposal feature pyramid of `[b, h, w, c]` images,
    /// finest level first, channels-last.
    pub fn extract_proposal_features(&self, x: Tensor<B, 4>) -> Vec<Tensor<B, 4>> {
        let fpn = self.fpn.config();
        let features = self
            .backbone
            .forward_channels_first(to_channels_first(x))
            .into_iter()
            .skip(fpn.min_level - MIN_BACKBONE_LEVEL)
            .take(fpn.num_inputs())
            .collect();
        self.fpn
            .forward_channels_first(features)
            .into_iter()
            .map(to_channels_last)
            .collect()
    }

    /// Computes the proposal feature pyramid after validating the input.
    ///
    /// # Errors
    ///
    /// Returns a shape error unless `x` has rank 4 with non-zero extents,
    /// and a shape mismatch if its channel count differs from the
    /// materialized one.
    pub fn try_extract_proposal_features<const D: usize>(
        &self,
        x: Tensor<B, D>,
    ) -> Result<Vec<Tensor<B, 4>>> {
        let x = expect_rank4(x)?;
        let actual = nhwc_of(&x);
        check_channels(*self.input_shape, actual)?;
        self.config.output_shapes(&TensorShape::from(actual))?;
        Ok(self.extract_proposal_features(x))
    }

    /// Subtracts the ResNet channel means.
    pub fn preprocess(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        preprocess(x)
    }

    /// Allocates a box classifier head for `num_proposals` crops of this
    /// extractor's pyramid depth.
    ///
    /// # Errors
    ///
    /// Returns an error if the head configuration is invalid.
    pub fn box_classifier(
        &self,
        num_proposals: usize,
        device: &B::Device,
    ) -> Result<BoxClassifierHead<B>> {
        self.config
            .box_classifier_config()
            .materialize(self.config.proposal_crop_shape(num_proposals), device)
    }

    /// Sum of the weight penalties of backbone and pyramid.
    pub fn regularization_loss(&self) -> Option<Tensor<B, 1>> {
        sum_losses([
            self.backbone.regularization_loss(),
            self.fpn.regularization_loss(),
        ])
    }

    /// Configuration the extractor was materialized from.
    #[must_use]
    pub fn config(&self) -> &FasterRcnnFpnConfig {
        &self.config
    }

    /// Input shape the extractor was materialized for.
    #[must_use]
    pub fn input_shape(&self) -> Nhwc {
        *self.input_shape
    }

    /// Pyramid shapes for the materialized input, finest first.
    #[must_use]
    pub fn output_shapes(&self) -> &[Nhwc] {
        &self.output_shapes
    }

    /// The backbone.
    #[must_use]
    pub fn backbone(&self) -> &ResNet<B> {
        &self.backbone
    }

    /// The feature pyramid.
    #[must_use]
    pub fn fpn(&self) -> &Fpn<B> {
        &self.fpn
    }
}
