//! Convolution + batch norm + activation wrapper.

use burn::module::{Ignored, Module, Param};
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, Initializer, PaddingConfig2d};
use burn::prelude::Backend;
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use vision_types::{ConvHyperparams, Nhwc, Padding, conv_output_size};

use crate::error::{LayerError, Result};
use crate::init::init_param;
use crate::ops::{
    activate, check_channels, nhwc_of, sum_losses, to_channels_first, to_channels_last,
};

const fn default_kernel_size() -> usize {
    3
}

const fn default_strides() -> usize {
    1
}

/// Configuration of a [`ConvBlock`].
///
/// The record is immutable once a block has been materialized from it; a
/// different configuration means a new block.
///
/// # Example
///
/// ```
/// use vision_layers::ConvBlockConfig;
/// use vision_types::{ActivationKind, ConvHyperparams, Nhwc};
///
/// let config = ConvBlockConfig::new(64, 3)
///     .with_strides(2)
///     .with_hyperparams(ConvHyperparams::default().with_activation(ActivationKind::Leaky));
/// let out = config.output_shape(Nhwc::new(1, 32, 32, 3))?;
/// assert_eq!(out, Nhwc::new(1, 16, 16, 64));
/// # Ok::<(), vision_layers::LayerError>(())
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConvBlockConfig {
    /// Output channels.
    pub filters: usize,

    /// Square kernel extent.
    #[serde(default = "default_kernel_size")]
    pub kernel_size: usize,

    /// Square stride.
    #[serde(default = "default_strides")]
    pub strides: usize,

    /// Spatial padding.
    #[serde(default)]
    pub padding: Padding,

    /// Shared convolution hyperparameters.
    #[serde(flatten)]
    pub hyperparams: ConvHyperparams,
}

impl ConvBlockConfig {
    /// Creates a stride-1, same-padded block with default hyperparameters.
    #[must_use]
    pub fn new(filters: usize, kernel_size: usize) -> Self {
        Self {
            filters,
            kernel_size,
            strides: 1,
            padding: Padding::Same,
            hyperparams: ConvHyperparams::default(),
        }
    }

    /// Sets the stride.
    #[must_use]
    pub const fn with_strides(mut self, strides: usize) -> Self {
        self.strides = strides;
        self
    }

    /// Sets the padding.
    #[must_use]
    pub const fn with_padding(mut self, padding: Padding) -> Self {
        self.padding = padding;
        self
    }

    /// Sets the hyperparameters.
    #[must_use]
    pub const fn with_hyperparams(mut self, hyperparams: ConvHyperparams) -> Self {
        self.hyperparams = hyperparams;
        self
    }

    /// Validates the configuration.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.filters > 0 && self.kernel_size > 0 && self.strides > 0 && self.hyperparams.is_valid()
    }

    /// Infers the output shape for an input shape.
    ///
    /// # Errors
    ///
    /// Returns [`LayerError::InvalidConfig`] for an invalid configuration
    /// and a shape error if the convolution arithmetic fails.
    pub fn output_shape(&self, input: Nhwc) -> Result<Nhwc> {
        if !self.is_valid() {
            return Err(LayerError::invalid_config(format!("{self:?}")));
        }
        let height = conv_output_size(input.height, self.kernel_size, self.strides, self.padding)?;
        let width = conv_output_size(input.width, self.kernel_size, self.strides, self.padding)?;
        Ok(Nhwc::new(input.batch, height, width, self.filters))
    }

    /// Allocates the block's parameters for an input shape.
    ///
    /// # Errors
    ///
    /// Fails under the same conditions as [`Self::output_shape`].
    pub fn materialize<B: Backend>(&self, input: Nhwc, device: &B::Device) -> Result<ConvBlock<B>> {
        let output = self.output_shape(input)?;
        let hp = &self.hyperparams;
        let k = self.kernel_size;
        let pad = self.padding.per_side(k)?;
        let fan_in = input.channels * k * k;
        let fan_out = self.filters * k * k;

        let mut conv = Conv2dConfig::new([input.channels, self.filters], [k, k])
            .with_stride([self.strides, self.strides])
            .with_padding(PaddingConfig2d::Explicit(pad, pad))
            .with_bias(false)
            .with_initializer(Initializer::Zeros)
            .init(device);
        conv.weight = init_param(
            hp.kernel_initializer,
            [self.filters, input.channels, k, k],
            fan_in,
            fan_out,
            device,
        );

        // Normalization supplies the shift, so the conv only carries a bias
        // without it.
        let bias = (!hp.use_bn).then(|| {
            init_param(hp.bias_initializer, [self.filters], fan_in, fan_out, device)
        });

        let norm = hp.use_bn.then(|| {
            let norm: BatchNorm<B, 2> = BatchNormConfig::new(self.filters)
                .with_epsilon(hp.norm.epsilon)
                .with_momentum(hp.norm.update_rate())
                .init(device);
            if hp.norm.trainable {
                norm
            } else {
                norm.no_grad()
            }
        });

        if hp.use_bn && hp.norm.sync {
            warn!(
                filters = self.filters,
                "synchronized batch norm requested; statistics are computed per replica"
            );
        }

        let block = ConvBlock {
            conv,
            bias,
            norm,
            config: Ignored(*self),
            input_shape: Ignored(input),
            output_shape: Ignored(output),
        };
        debug!(
            input = %input,
            output = %output,
            params = block.num_params(),
            "materialized conv block"
        );
        Ok(block)
    }
}

/// Convolution followed by optional batch norm and an activation.
///
/// Channels-last at its public boundary; [`Self::forward_channels_first`]
/// is available for callers that chain many blocks and keep Burn's layout
/// internally.
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    conv: Conv2d<B>,
    bias: Option<Param<Tensor<B, 1>>>,
    norm: Option<BatchNorm<B, 2>>,
    config: Ignored<ConvBlockConfig>,
    input_shape: Ignored<Nhwc>,
    output_shape: Ignored<Nhwc>,
}

impl<B: Backend> ConvBlock<B> {
    /// Runs the block on a `[b, h, w, c]` tensor.
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        to_channels_last(self.forward_channels_first(to_channels_first(x)))
    }

    /// Runs the block on a `[b, c, h, w]` tensor.
    pub fn forward_channels_first(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = self.conv.forward(x);
        if let Some(bias) = &self.bias {
            x = x + bias.val().reshape([1, self.config.filters, 1, 1]);
        }
        if let Some(norm) = &self.norm {
            x = norm.forward(x);
        }
        let hp = &self.config.hyperparams;
        activate(x, hp.activation, hp.leaky_alpha)
    }

    /// Runs the block after checking the input against the materialized
    /// shape.
    ///
    /// # Errors
    ///
    /// Returns [`LayerError::ShapeMismatch`] if the channel count differs
    /// from the one the block was materialized for, and a shape error if
    /// the kernel does not fit the spatial extent.
    pub fn try_forward(&self, x: Tensor<B, 4>) -> Result<Tensor<B, 4>> {
        let actual = nhwc_of(&x);
        check_channels(*self.input_shape, actual)?;
        self.config.output_shape(actual)?;
        Ok(self.forward(x))
    }

    /// Sum of the configured weight penalties, or `None` if there are none.
    pub fn regularization_loss(&self) -> Option<Tensor<B, 1>> {
        let hp = &self.config.hyperparams;
        if !hp.has_regularization() {
            return None;
        }
        let kernel = hp
            .weight_decay
            .map(|wd| self.conv.weight.val().powf_scalar(2.0).sum().mul_scalar(wd));
        let bias = match (hp.bias_regularizer, &self.bias) {
            (Some(reg), Some(bias)) => {
                let (l1, l2) = reg.penalty_weights();
                let b = bias.val();
                Some(b.clone().abs().sum().mul_scalar(l1) + b.powf_scalar(2.0).sum().mul_scalar(l2))
            }
            _ => None,
        };
        sum_losses([kernel, bias])
    }

    /// Configuration the block was materialized from.
    #[must_use]
    pub fn config(&self) -> &ConvBlockConfig {
        &self.config
    }

    /// Input shape the block was materialized for.
    #[must_use]
    pub fn input_shape(&self) -> Nhwc {
        *self.input_shape
    }

    /// Output shape for the materialized input shape.
    #[must_use]
    pub fn output_shape(&self) -> Nhwc {
        *self.output_shape
    }

    /// Returns true if the block normalizes its output.
    #[must_use]
    pub fn has_norm(&self) -> bool {
        self.norm.is_some()
    }

    /// Batch norm applied after the convolution, if any.
    #[must_use]
    pub fn norm(&self) -> Option<&BatchNorm<B, 2>> {
        self.norm.as_ref()
    }

    /// Returns true if the block adds its own bias.
    #[must_use]
    pub fn has_bias(&self) -> bool {
        self.bias.is_some()
    }
}
