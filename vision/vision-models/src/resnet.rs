//! ResNet-v1 bottleneck backbone.
//!
//! Keras-style v1: the stride of a stage lives on the first 1×1 conv of its
//! first block, and every stage opens with a projection shortcut. The
//! backbone returns the last activation of each stage, `C2..C5`, with
//! strides 4, 8, 16 and 32.

use burn::module::{Ignored, Module};
use burn::nn::PaddingConfig2d;
use burn::nn::pool::{MaxPool2d, MaxPool2dConfig};
use burn::prelude::Backend;
use burn::tensor::Tensor;
use burn::tensor::activation::relu;
use serde::{Deserialize, Serialize};
use tracing::debug;
use vision_layers::ops::{sum_losses, to_channels_first, to_channels_last};
use vision_layers::{ConvBlock, ConvBlockConfig};
use vision_types::{ActivationKind, ConvHyperparams, Nhwc, NormSettings, Padding, conv_output_size};

use crate::error::{ModelError, Result};

/// Output channels of a bottleneck relative to its inner width.
pub const EXPANSION: usize = 4;

const POOL_KERNEL: usize = 3;
const POOL_STRIDE: usize = 2;
const POOL_PADDING: usize = 1;

const fn default_base_width() -> usize {
    64
}

/// Standard ResNet-v1 depths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResNetDepth {
    /// 50 layers, `[3, 4, 6, 3]` blocks.
    #[default]
    Resnet50,
    /// 101 layers, `[3, 4, 23, 3]` blocks.
    Resnet101,
    /// 152 layers, `[3, 8, 36, 3]` blocks.
    Resnet152,
}

impl ResNetDepth {
    /// Bottleneck blocks per stage.
    #[must_use]
    pub const fn block_counts(&self) -> [usize; 4] {
        match self {
            Self::Resnet50 => [3, 4, 6, 3],
            Self::Resnet101 => [3, 4, 23, 3],
            Self::Resnet152 => [3, 8, 36, 3],
        }
    }

    /// Architecture name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Resnet50 => "resnet_v1_50",
            Self::Resnet101 => "resnet_v1_101",
            Self::Resnet152 => "resnet_v1_152",
        }
    }
}

impl std::fmt::Display for ResNetDepth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Configuration of a [`ResNet`] backbone.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResNetConfig {
    /// Depth preset.
    #[serde(default)]
    pub depth: ResNetDepth,

    /// Inner width of the first stage; doubles every stage.
    #[serde(default = "default_base_width")]
    pub base_width: usize,

    /// Overrides the block counts of `depth`.
    #[serde(default)]
    pub stage_blocks: Option<[usize; 4]>,

    /// Hyperparameters of every convolution.
    #[serde(default = "ResNetConfig::default_hyperparams")]
    pub hyperparams: ConvHyperparams,
}

impl Default for ResNetConfig {
    fn default() -> Self {
        Self::new(ResNetDepth::default())
    }
}

impl ResNetConfig {
    /// Creates a full-width backbone of the given depth.
    #[must_use]
    pub fn new(depth: ResNetDepth) -> Self {
        Self {
            depth,
            base_width: default_base_width(),
            stage_blocks: None,
            hyperparams: Self::default_hyperparams(),
        }
    }

    /// ReLU with batch norm at momentum 0.997, epsilon 1e-5.
    #[must_use]
    pub fn default_hyperparams() -> ConvHyperparams {
        ConvHyperparams::default()
            .with_activation(ActivationKind::Relu)
            .with_norm(NormSettings::new(0.997, 1e-5))
    }

    /// Sets the first-stage width.
    #[must_use]
    pub const fn with_base_width(mut self, base_width: usize) -> Self {
        self.base_width = base_width;
        self
    }

    /// Overrides the per-stage block counts.
    #[must_use]
    pub const fn with_stage_blocks(mut self, stage_blocks: [usize; 4]) -> Self {
        self.stage_blocks = Some(stage_blocks);
        self
    }

    /// Sets the convolution hyperparameters.
    #[must_use]
    pub const fn with_hyperparams(mut self, hyperparams: ConvHyperparams) -> Self {
        self.hyperparams = hyperparams;
        self
    }

    /// Blocks per stage.
    #[must_use]
    pub fn blocks(&self) -> [usize; 4] {
        self.stage_blocks.unwrap_or_else(|| self.depth.block_counts())
    }

    /// Channels of `C2..C5`.
    #[must_use]
    pub fn stage_channels(&self) -> [usize; 4] {
        std::array::from_fn(|stage| (self.base_width << stage) * EXPANSION)
    }

    /// Checks widths, block counts and hyperparameters.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::InvalidConfig`] describing the first problem.
    pub fn validate(&self) -> Result<()> {
        if self.base_width == 0 {
            return Err(ModelError::invalid_config("base_width must be positive"));
        }
        if self.blocks().contains(&0) {
            return Err(ModelError::invalid_config(format!(
                "every stage needs at least one block, got {:?}",
                self.blocks()
            )));
        }
        if !self.hyperparams.is_valid() {
            return Err(ModelError::invalid_config(format!(
                "invalid backbone hyperparameters: {:?}",
                self.hyperparams
            )));
        }
        Ok(())
    }

    fn stem_config(&self) -> ConvBlockConfig {
        ConvBlockConfig::new(self.base_width, 7)
            .with_strides(2)
            .with_hyperparams(self.hyperparams)
    }

    fn pool_output(input: Nhwc) -> Result<Nhwc> {
        let padding = Padding::Explicit(POOL_PADDING);
        let height = conv_output_size(input.height, POOL_KERNEL, POOL_STRIDE, padding)?;
        let width = conv_output_size(input.width, POOL_KERNEL, POOL_STRIDE, padding)?;
        Ok(input.with_spatial(height, width))
    }

    fn block_configs(&self) -> impl Iterator<Item = (usize, BottleneckConfig)> + '_ {
        self.blocks()
            .into_iter()
            .enumerate()
            .flat_map(move |(stage, count)| {
                let width = self.base_width << stage;
                let strides = if stage == 0 { 1 } else { 2 };
                (0..count).map(move |index| {
                    let config = if index == 0 {
                        BottleneckConfig::new(width, strides, true, self.hyperparams)
                    } else {
                        BottleneckConfig::new(width, 1, false, self.hyperparams)
                    };
                    (stage, config)
                })
            })
    }

    /// Infers the shapes of `C2..C5`.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid configuration or an input too small
    /// for the stem.
    pub fn output_shapes(&self, input: Nhwc) -> Result<[Nhwc; 4]> {
        self.validate()?;
        let mut shape = Self::pool_output(self.stem_config().output_shape(input)?)?;
        let mut outputs = [shape; 4];
        for (stage, block) in self.block_configs() {
            shape = block.output_shape(shape)?;
            outputs[stage] = shape;
        }
        Ok(outputs)
    }

    /// Allocates the backbone for an input shape.
    ///
    /// # Errors
    ///
    /// Fails under the same conditions as [`Self::output_shapes`].
    pub fn materialize<B: Backend>(&self, input: Nhwc, device: &B::Device) -> Result<ResNet<B>> {
        let outputs = self.output_shapes(input)?;
        let stem = self.stem_config().materialize(input, device)?;
        let pool = MaxPool2dConfig::new([POOL_KERNEL, POOL_KERNEL])
            .with_strides([POOL_STRIDE, POOL_STRIDE])
            .with_padding(PaddingConfig2d::Explicit(POOL_PADDING, POOL_PADDING))
            .init();

        let mut shape = Self::pool_output(stem.output_shape())?;
        let mut stages: Vec<ResNetStage<B>> = (0..4)
            .map(|_| ResNetStage { blocks: Vec::new() })
            .collect();
        for (stage, config) in self.block_configs() {
            let block = config.materialize(shape, device)?;
            shape = block.output_shape();
            if let Some(target) = stages.get_mut(stage) {
                target.blocks.push(block);
            }
        }

        let backbone = ResNet {
            stem,
            pool,
            stages,
            config: Ignored(*self),
            input_shape: Ignored(input),
            output_shapes: Ignored(outputs),
        };
        debug!(
            depth = %self.depth,
            blocks = ?self.blocks(),
            input = %input,
            c5 = %outputs[3],
            params = backbone.num_params(),
            "materialized resnet backbone"
        );
        Ok(backbone)
    }
}

/// Configuration of one bottleneck block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BottleneckConfig {
    /// Inner width; the block outputs `width * EXPANSION` channels.
    pub width: usize,
    /// Stride of the first 1×1 conv and of the projection.
    pub strides: usize,
    /// Whether the shortcut is a 1×1 projection.
    pub projection: bool,
    /// Hyperparameters of every convolution.
    pub hyperparams: ConvHyperparams,
}

impl BottleneckConfig {
    /// Creates a bottleneck configuration.
    #[must_use]
    pub const fn new(
        width: usize,
        strides: usize,
        projection: bool,
        hyperparams: ConvHyperparams,
    ) -> Self {
        Self {
            width,
            strides,
            projection,
            hyperparams,
        }
    }

    fn reduce(&self) -> ConvBlockConfig {
        ConvBlockConfig::new(self.width, 1)
            .with_strides(self.strides)
            .with_hyperparams(self.hyperparams)
    }

    fn conv(&self) -> ConvBlockConfig {
        ConvBlockConfig::new(self.width, 3).with_hyperparams(self.hyperparams)
    }

    fn expand(&self) -> ConvBlockConfig {
        ConvBlockConfig::new(self.width * EXPANSION, 1)
            .with_hyperparams(self.hyperparams.with_activation(ActivationKind::Linear))
    }

    fn shortcut(&self) -> ConvBlockConfig {
        self.expand().with_strides(self.strides)
    }

    /// Infers the output shape.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid configuration, or if an identity
    /// shortcut would join tensors of different shapes.
    pub fn output_shape(&self, input: Nhwc) -> Result<Nhwc> {
        let output = self
            .expand()
            .output_shape(self.conv().output_shape(self.reduce().output_shape(input)?)?)?;
        if !self.projection && output != input {
            return Err(ModelError::invalid_config(format!(
                "identity shortcut needs matching shapes, got {input} -> {output}"
            )));
        }
        Ok(output)
    }

    /// Allocates the block.
    ///
    /// # Errors
    ///
    /// Fails under the same conditions as [`Self::output_shape`].
    pub fn materialize<B: Backend>(&self, input: Nhwc, device: &B::Device) -> Result<Bottleneck<B>> {
        let output = self.output_shape(input)?;
        let reduce = self.reduce().materialize(input, device)?;
        let conv = self.conv().materialize(reduce.output_shape(), device)?;
        let expand = self.expand().materialize(conv.output_shape(), device)?;
        let shortcut = if self.projection {
            Some(self.shortcut().materialize(input, device)?)
        } else {
            None
        };
        Ok(Bottleneck {
            reduce,
            conv,
            expand,
            shortcut,
            output_shape: Ignored(output),
        })
    }
}

/// 1×1 reduce, 3×3, 1×1 expand, plus a shortcut.
#[derive(Module, Debug)]
pub struct Bottleneck<B: Backend> {
    reduce: ConvBlock<B>,
    conv: ConvBlock<B>,
    expand: ConvBlock<B>,
    shortcut: Option<ConvBlock<B>>,
    output_shape: Ignored<Nhwc>,
}

impl<B: Backend> Bottleneck<B> {
    /// Runs the block on a `[b, c, h, w]` tensor.
    pub fn forward_channels_first(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let shortcut = match &self.shortcut {
            Some(projection) => projection.forward_channels_first(x.clone()),
            None => x.clone(),
        };
        let x = self.reduce.forward_channels_first(x);
        let x = self.conv.forward_channels_first(x);
        let x = self.expand.forward_channels_first(x);
        relu(x + shortcut)
    }

    /// Output shape for the materialized input.
    #[must_use]
    pub fn output_shape(&self) -> Nhwc {
        *self.output_shape
    }

    /// Returns true if the shortcut is a projection.
    #[must_use]
    pub fn has_projection(&self) -> bool {
        self.shortcut.is_some()
    }

    /// Convolutions of the block, shortcut projection last.
    pub fn conv_blocks(&self) -> impl Iterator<Item = &ConvBlock<B>> {
        [&self.reduce, &self.conv, &self.expand]
            .into_iter()
            .chain(self.shortcut.as_ref())
    }

    /// Sum of the weight penalties of every convolution.
    pub fn regularization_loss(&self) -> Option<Tensor<B, 1>> {
        sum_losses([
            self.reduce.regularization_loss(),
            self.conv.regularization_loss(),
            self.expand.regularization_loss(),
            self.shortcut.as_ref().and_then(ConvBlock::regularization_loss),
        ])
    }
}

/// Consecutive bottlenecks at one resolution.
#[derive(Module, Debug)]
pub struct ResNetStage<B: Backend> {
    blocks: Vec<Bottleneck<B>>,
}

impl<B: Backend> ResNetStage<B> {
    /// Blocks of the stage.
    #[must_use]
    pub fn blocks(&self) -> &[Bottleneck<B>] {
        &self.blocks
    }
}

/// ResNet-v1 backbone producing `C2..C5`.
#[derive(Module, Debug)]
pub struct ResNet<B: Backend> {
    stem: ConvBlock<B>,
    pool: MaxPool2d,
    stages: Vec<ResNetStage<B>>,
    config: Ignored<ResNetConfig>,
    input_shape: Ignored<Nhwc>,
    output_shapes: Ignored<[Nhwc; 4]>,
}

impl<B: Backend> ResNet<B> {
    /// Runs the backbone on `[b, c, h, w]` and returns `C2..C5` in the same
    /// layout.
    pub fn forward_channels_first(&self, x: Tensor<B, 4>) -> Vec<Tensor<B, 4>> {
        let mut x = self.pool.forward(self.stem.forward_channels_first(x));
        let mut features = Vec::with_capacity(self.stages.len());
        for stage in &self.stages {
            for block in &stage.blocks {
                x = block.forward_channels_first(x);
            }
            features.push(x.clone());
        }
        features
    }

    /// Runs the backbone on `[b, h, w, c]` and returns `C2..C5` channels-last.
    pub fn forward(&self, x: Tensor<B, 4>) -> Vec<Tensor<B, 4>> {
        self.forward_channels_first(to_channels_first(x))
            .into_iter()
            .map(to_channels_last)
            .collect()
    }

    /// Sum of the weight penalties of every convolution.
    pub fn regularization_loss(&self) -> Option<Tensor<B, 1>> {
        sum_losses(
            std::iter::once(self.stem.regularization_loss()).chain(
                self.stages
                    .iter()
                    .flat_map(|stage| &stage.blocks)
                    .map(Bottleneck::regularization_loss),
            ),
        )
    }

    /// Every convolution of the backbone, stem first.
    pub fn conv_blocks(&self) -> impl Iterator<Item = &ConvBlock<B>> {
        std::iter::once(&self.stem).chain(
            self.stages
                .iter()
                .flat_map(|stage| &stage.blocks)
                .flat_map(Bottleneck::conv_blocks),
        )
    }

    /// Configuration the backbone was materialized from.
    #[must_use]
    pub fn config(&self) -> &ResNetConfig {
        &self.config
    }

    /// Input shape the backbone was materialized for.
    #[must_use]
    pub fn input_shape(&self) -> Nhwc {
        *self.input_shape
    }

    /// Shapes of `C2..C5` for the materialized input.
    #[must_use]
    pub fn output_shapes(&self) -> [Nhwc; 4] {
        *self.output_shapes
    }

    /// Stages in order.
    #[must_use]
    pub fn stages(&self) -> &[ResNetStage<B>] {
        &self.stages
    }
}
