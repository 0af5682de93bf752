//! Feature pyramid over backbone levels.
//!
//! Top-down pathway: a 1×1 lateral per backbone level, nearest 2×
//! upsampling of the coarser map cropped to the lateral's extent, and a
//! 3×3 smoothing conv on every merged level except the coarsest. Levels
//! above 5 come from stride-2 3×3 convs stacked on the coarsest output.

use burn::module::{Ignored, Module};
use burn::prelude::Backend;
use burn::tensor::Tensor;
use burn::tensor::module::interpolate;
use burn::tensor::ops::{InterpolateMode, InterpolateOptions};
use serde::{Deserialize, Serialize};
use tracing::debug;
use vision_layers::ops::sum_losses;
use vision_layers::{ConvBlock, ConvBlockConfig, LayerError};
use vision_types::{ActivationKind, ConvHyperparams, Nhwc};

use crate::error::{ModelError, Result};

/// Coarsest level a ResNet backbone provides.
pub const MAX_BACKBONE_LEVEL: usize = 5;

/// Finest level a ResNet backbone provides.
pub const MIN_BACKBONE_LEVEL: usize = 2;

/// Configuration of an [`Fpn`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FpnConfig {
    /// Finest pyramid level.
    pub min_level: usize,
    /// Coarsest pyramid level.
    pub max_level: usize,
    /// Channels of every pyramid level.
    pub depth: usize,
    /// Hyperparameters of the smoothing and extra-level convs.
    pub hyperparams: ConvHyperparams,
}

impl FpnConfig {
    /// Creates a pyramid over `min_level..=max_level`.
    #[must_use]
    pub fn new(min_level: usize, max_level: usize, depth: usize) -> Self {
        Self {
            min_level,
            max_level,
            depth,
            hyperparams: ConvHyperparams::default(),
        }
    }

    /// Sets the conv hyperparameters.
    #[must_use]
    pub const fn with_hyperparams(mut self, hyperparams: ConvHyperparams) -> Self {
        self.hyperparams = hyperparams;
        self
    }

    /// Coarsest level taken from the backbone.
    #[must_use]
    pub const fn base_max_level(&self) -> usize {
        if self.max_level < MAX_BACKBONE_LEVEL {
            self.max_level
        } else {
            MAX_BACKBONE_LEVEL
        }
    }

    /// Number of backbone levels consumed.
    #[must_use]
    pub const fn num_inputs(&self) -> usize {
        self.base_max_level() + 1 - self.min_level
    }

    /// Number of pyramid levels produced.
    #[must_use]
    pub const fn num_levels(&self) -> usize {
        self.max_level + 1 - self.min_level
    }

    /// Checks the level range and depth.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::InvalidConfig`] describing the first problem.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_BACKBONE_LEVEL..=MAX_BACKBONE_LEVEL).contains(&self.min_level) {
            return Err(ModelError::invalid_config(format!(
                "fpn min level must lie in {MIN_BACKBONE_LEVEL}..={MAX_BACKBONE_LEVEL}, got {}",
                self.min_level
            )));
        }
        if self.max_level < self.min_level {
            return Err(ModelError::invalid_config(format!(
                "fpn max level {} is below min level {}",
                self.max_level, self.min_level
            )));
        }
        if self.depth == 0 {
            return Err(ModelError::invalid_config("fpn depth must be positive"));
        }
        if !self.hyperparams.is_valid() {
            return Err(ModelError::invalid_config(format!(
                "invalid fpn hyperparameters: {:?}",
                self.hyperparams
            )));
        }
        Ok(())
    }

    fn lateral_config(&self) -> ConvBlockConfig {
        let hp = self
            .hyperparams
            .with_bn(false)
            .with_activation(ActivationKind::Linear);
        ConvBlockConfig::new(self.depth, 1).with_hyperparams(hp)
    }

    fn smoothing_config(&self) -> ConvBlockConfig {
        ConvBlockConfig::new(self.depth, 3).with_hyperparams(self.hyperparams)
    }

    fn coarse_config(&self) -> ConvBlockConfig {
        self.smoothing_config().with_strides(2)
    }

    fn check_inputs(&self, features: &[Nhwc]) -> Result<()> {
        self.validate()?;
        if features.len() != self.num_inputs() {
            return Err(ModelError::invalid_config(format!(
                "fpn over levels {}..={} takes {} feature maps, got {}",
                self.min_level,
                self.base_max_level(),
                self.num_inputs(),
                features.len()
            )));
        }
        Ok(())
    }

    /// Infers the pyramid shapes, finest first, from the backbone shapes
    /// of levels `min_level..=base_max_level()`.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid configuration, a wrong number of
    /// inputs, or a coarser level that upsamples to less than the finer
    /// level's extent.
    pub fn output_shapes(&self, features: &[Nhwc]) -> Result<Vec<Nhwc>> {
        self.check_inputs(features)?;
        let lateral = self.lateral_config();
        let laterals = features
            .iter()
            .map(|&shape| lateral.output_shape(shape))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        for pair in laterals.windows(2) {
            let (finer, coarser) = (pair[0], pair[1]);
            let upsampled = coarser.with_spatial(2 * coarser.height, 2 * coarser.width);
            if upsampled.height < finer.height || upsampled.width < finer.width {
                return Err(LayerError::shape_mismatch(finer, upsampled).into());
            }
        }

        let mut outputs = laterals;
        let coarse = self.coarse_config();
        for _ in self.base_max_level()..self.max_level {
            if let Some(&last) = outputs.last() {
                outputs.push(coarse.output_shape(last)?);
            }
        }
        Ok(outputs)
    }

    /// Allocates the pyramid for the given backbone shapes.
    ///
    /// # Errors
    ///
    /// Fails under the same conditions as [`Self::output_shapes`].
    pub fn materialize<B: Backend>(&self, features: &[Nhwc], device: &B::Device) -> Result<Fpn<B>> {
        let outputs = self.output_shapes(features)?;

        let lateral = self.lateral_config();
        let laterals = features
            .iter()
            .map(|&shape| lateral.materialize(shape, device))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let smoothing = self.smoothing_config();
        let smoothing = laterals
            .iter()
            .take(laterals.len().saturating_sub(1))
            .map(|lateral| smoothing.materialize(lateral.output_shape(), device))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let coarse = self.coarse_config();
        let coarse = outputs
            .iter()
            .skip(self.num_inputs() - 1)
            .take(self.max_level - self.base_max_level())
            .map(|&shape| coarse.materialize(shape, device))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let fpn = Fpn {
            laterals,
            smoothing,
            coarse,
            config: Ignored(*self),
            output_shapes: Ignored(outputs),
        };
        debug!(
            min_level = self.min_level,
            max_level = self.max_level,
            depth = self.depth,
            params = fpn.num_params(),
            "materialized feature pyramid"
        );
        Ok(fpn)
    }
}

/// Nearest-neighbour 2× upsampling of `[b, c, h, w]`.
pub fn upsample_nearest<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    let [_, _, height, width] = x.dims();
    interpolate(
        x,
        [height * 2, width * 2],
        InterpolateOptions::new(InterpolateMode::Nearest),
    )
}

/// Upsamples `coarser`, crops it to `lateral` and adds them.
fn merge_top_down<B: Backend>(coarser: Tensor<B, 4>, lateral: Tensor<B, 4>) -> Tensor<B, 4> {
    let [batch, channels, height, width] = lateral.dims();
    let up = upsample_nearest(coarser).slice([0..batch, 0..channels, 0..height, 0..width]);
    up + lateral
}

/// Feature pyramid network.
#[derive(Module, Debug)]
pub struct Fpn<B: Backend> {
    laterals: Vec<ConvBlock<B>>,
    smoothing: Vec<ConvBlock<B>>,
    coarse: Vec<ConvBlock<B>>,
    config: Ignored<FpnConfig>,
    output_shapes: Ignored<Vec<Nhwc>>,
}

impl<B: Backend> Fpn<B> {
    /// Builds the pyramid from channels-first backbone maps, finest first.
    /// Returns channels-first levels `min_level..=max_level`, finest first.
    pub fn forward_channels_first(&self, features: Vec<Tensor<B, 4>>) -> Vec<Tensor<B, 4>> {
        let mut laterals: Vec<_> = self
            .laterals
            .iter()
            .zip(features)
            .map(|(conv, x)| conv.forward_channels_first(x))
            .collect();
        let Some(mut top_down) = laterals.pop() else {
            return Vec::new();
        };

        let mut outputs = vec![top_down.clone()];
        for (lateral, smoothing) in laterals.into_iter().zip(&self.smoothing).rev() {
            top_down = merge_top_down(top_down, lateral);
            outputs.push(smoothing.forward_channels_first(top_down.clone()));
        }
        outputs.reverse();

        if let Some(mut last) = outputs.last().cloned() {
            for conv in &self.coarse {
                last = conv.forward_channels_first(last);
                outputs.push(last.clone());
            }
        }
        outputs
    }

    /// Sum of the weight penalties of every convolution.
    pub fn regularization_loss(&self) -> Option<Tensor<B, 1>> {
        sum_losses(
            self.laterals
                .iter()
                .chain(&self.smoothing)
                .chain(&self.coarse)
                .map(ConvBlock::regularization_loss),
        )
    }

    /// Configuration the pyramid was materialized from.
    #[must_use]
    pub fn config(&self) -> &FpnConfig {
        &self.config
    }

    /// Level shapes for the materialized inputs, finest first.
    #[must_use]
    pub fn output_shapes(&self) -> &[Nhwc] {
        &self.output_shapes
    }
}
