//! Cross-stage-partial connection block.
//!
//! Fuses the output of a CSP stage (`x_prev`) with the cross-stage
//! shortcut (`x_csp`): a 1×1 channel reduction of `x_prev`, concatenation
//! with `x_csp` along channels, then a 1×1 projection to `filters`.

use burn::module::{Ignored, Module};
use burn::prelude::Backend;
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};
use tracing::debug;
use vision_types::{ConvHyperparams, Nhwc};

use crate::conv_block::{ConvBlock, ConvBlockConfig};
use crate::error::{LayerError, Result};
use crate::ops::{nhwc_of, sum_losses, to_channels_first, to_channels_last};

const fn default_filter_reduce() -> usize {
    2
}

/// Configuration of a [`CspConnect`] block.
///
/// Defaults match the YOLO CSP layers: `mish`, `glorot_uniform` kernels,
/// `zeros` biases, batch norm with momentum 0.99 and epsilon 0.001.
///
/// # Example
///
/// ```
/// use vision_layers::CspConnectConfig;
/// use vision_types::Nhwc;
///
/// let config = CspConnectConfig::new(256);
/// let out = config.output_shape(Nhwc::new(1, 32, 32, 256), Nhwc::new(1, 32, 32, 128))?;
/// assert_eq!(out, Nhwc::new(1, 32, 32, 256));
/// # Ok::<(), vision_layers::LayerError>(())
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CspConnectConfig {
    /// Output channels.
    pub filters: usize,

    /// Divisor applied to `filters` for the reduction convolution.
    #[serde(default = "default_filter_reduce")]
    pub filter_reduce: usize,

    /// Hyperparameters threaded into both convolutions.
    #[serde(flatten)]
    pub hyperparams: ConvHyperparams,
}

impl CspConnectConfig {
    /// Creates a configuration with `filter_reduce = 2`.
    #[must_use]
    pub fn new(filters: usize) -> Self {
        Self {
            filters,
            filter_reduce: 2,
            hyperparams: ConvHyperparams::default(),
        }
    }

    /// Sets the reduction divisor.
    #[must_use]
    pub const fn with_filter_reduce(mut self, filter_reduce: usize) -> Self {
        self.filter_reduce = filter_reduce;
        self
    }

    /// Sets the hyperparameters.
    #[must_use]
    pub const fn with_hyperparams(mut self, hyperparams: ConvHyperparams) -> Self {
        self.hyperparams = hyperparams;
        self
    }

    /// Channels produced by the reduction convolution.
    ///
    /// # Errors
    ///
    /// Returns [`LayerError::InvalidConfig`] if `filter_reduce` is zero or
    /// does not divide `filters`.
    pub fn reduced_filters(&self) -> Result<usize> {
        if self.filter_reduce == 0 || self.filters % self.filter_reduce != 0 {
            return Err(LayerError::invalid_config(format!(
                "filter_reduce {} must divide filters {}",
                self.filter_reduce, self.filters
            )));
        }
        Ok(self.filters / self.filter_reduce)
    }

    fn reduce_config(&self) -> Result<ConvBlockConfig> {
        Ok(ConvBlockConfig::new(self.reduced_filters()?, 1).with_hyperparams(self.hyperparams))
    }

    fn project_config(&self) -> ConvBlockConfig {
        ConvBlockConfig::new(self.filters, 1).with_hyperparams(self.hyperparams)
    }

    /// Infers the output shape.
    ///
    /// # Errors
    ///
    /// Returns an error for a malformed configuration or if the two inputs
    /// disagree on batch or spatial extent.
    pub fn output_shape(&self, prev: Nhwc, csp: Nhwc) -> Result<Nhwc> {
        let reduced = self.reduce_config()?.output_shape(prev)?;
        if !reduced.same_extent(&csp) {
            return Err(LayerError::shape_mismatch(reduced.with_channels(csp.channels), csp));
        }
        let merged = reduced.with_channels(reduced.channels + csp.channels);
        self.project_config().output_shape(merged)
    }

    /// Allocates both convolutions for the given input shapes.
    ///
    /// # Errors
    ///
    /// Fails under the same conditions as [`Self::output_shape`].
    pub fn materialize<B: Backend>(
        &self,
        prev: Nhwc,
        csp: Nhwc,
        device: &B::Device,
    ) -> Result<CspConnect<B>> {
        let output = self.output_shape(prev, csp)?;
        let reduce = self.reduce_config()?.materialize(prev, device)?;
        let merged = reduce
            .output_shape()
            .with_channels(reduce.output_shape().channels + csp.channels);
        let project = self.project_config().materialize(merged, device)?;

        let block = CspConnect {
            reduce,
            project,
            config: Ignored(*self),
            input_shapes: Ignored((prev, csp)),
            output_shape: Ignored(output),
        };
        debug!(
            prev = %prev,
            csp = %csp,
            output = %output,
            params = block.num_params(),
            "materialized csp connect"
        );
        Ok(block)
    }
}

/// CSP connection: reduce `x_prev`, concatenate with `x_csp`, project.
#[derive(Module, Debug)]
pub struct CspConnect<B: Backend> {
    reduce: ConvBlock<B>,
    project: ConvBlock<B>,
    config: Ignored<CspConnectConfig>,
    input_shapes: Ignored<(Nhwc, Nhwc)>,
    output_shape: Ignored<Nhwc>,
}

impl<B: Backend> CspConnect<B> {
    /// Fuses `x_prev` and `x_csp` (both `[b, h, w, c]`).
    pub fn forward(&self, x_prev: Tensor<B, 4>, x_csp: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.reduce.forward_channels_first(to_channels_first(x_prev));
        let x = Tensor::cat(vec![x, to_channels_first(x_csp)], 1);
        to_channels_last(self.project.forward_channels_first(x))
    }

    /// Fuses the inputs after validating them against the materialized
    /// shapes.
    ///
    /// # Errors
    ///
    /// Returns [`LayerError::ShapeMismatch`] if either input's channel count
    /// differs from the materialized one, or if the inputs disagree on batch
    /// or spatial extent.
    pub fn try_forward(&self, x_prev: Tensor<B, 4>, x_csp: Tensor<B, 4>) -> Result<Tensor<B, 4>> {
        let (prev_shape, csp_shape) = *self.input_shapes;
        let prev = nhwc_of(&x_prev);
        let csp = nhwc_of(&x_csp);
        if prev.channels != prev_shape.channels {
            return Err(LayerError::shape_mismatch(prev_shape, prev));
        }
        if csp.channels != csp_shape.channels {
            return Err(LayerError::shape_mismatch(csp_shape, csp));
        }
        // The reduction is 1×1 stride 1, so the extents must already agree.
        if !prev.same_extent(&csp) {
            return Err(LayerError::shape_mismatch(prev.with_channels(csp.channels), csp));
        }
        Ok(self.forward(x_prev, x_csp))
    }

    /// Sum of the weight penalties of both convolutions.
    pub fn regularization_loss(&self) -> Option<Tensor<B, 1>> {
        sum_losses([
            self.reduce.regularization_loss(),
            self.project.regularization_loss(),
        ])
    }

    /// Configuration the block was materialized from.
    #[must_use]
    pub fn config(&self) -> &CspConnectConfig {
        &self.config
    }

    /// `(x_prev, x_csp)` shapes the block was materialized for.
    #[must_use]
    pub fn input_shapes(&self) -> (Nhwc, Nhwc) {
        *self.input_shapes
    }

    /// Output shape for the materialized inputs.
    #[must_use]
    pub fn output_shape(&self) -> Nhwc {
        *self.output_shape
    }

    /// The reduction convolution.
    #[must_use]
    pub fn reduce(&self) -> &ConvBlock<B> {
        &self.reduce
    }

    /// The projection convolution.
    #[must_use]
    pub fn project(&self) -> &ConvBlock<B> {
        &self.project
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use vision_types::{ActivationKind, Regularizer};

    type TestBackend = NdArray<f32>;

    fn device() -> <TestBackend as Backend>::Device {
        <TestBackend as Backend>::Device::default()
    }

    #[test]
    fn config_defaults() {
        let config = CspConnectConfig::new(128);
        assert_eq!(config.filter_reduce, 2);
        assert_eq!(config.hyperparams.activation, ActivationKind::Mish);
        assert!(config.hyperparams.use_bn);
        assert_eq!(config.reduced_filters().unwrap_or_default(), 64);
    }

    #[test]
    fn config_from_json_defaults() {
        let config: Option<CspConnectConfig> =
            serde_json::from_str(r#"{"filters": 64, "activation": "leaky"}"#).ok();
        assert!(config.is_some_and(|c| c.filter_reduce == 2
            && c.hyperparams.activation == ActivationKind::Leaky));
    }

    #[test]
    fn non_divisible_reduce_is_rejected() {
        let config = CspConnectConfig::new(100).with_filter_reduce(3);
        let shape = Nhwc::new(1, 4, 4, 8);
        assert!(matches!(
            config.output_shape(shape, shape),
            Err(LayerError::InvalidConfig(_))
        ));
        assert!(
            config
                .materialize::<TestBackend>(shape, shape, &device())
                .is_err()
        );

        let config = CspConnectConfig::new(64).with_filter_reduce(0);
        assert!(config.reduced_filters().is_err());
    }

    #[test]
    fn mismatched_extents_are_rejected() {
        let config = CspConnectConfig::new(16);
        let out = config.output_shape(Nhwc::new(1, 8, 8, 4), Nhwc::new(1, 4, 4, 4));
        assert!(matches!(out, Err(LayerError::ShapeMismatch { .. })));
    }

    #[test]
    fn forward_256_filters() {
        let config = CspConnectConfig::new(256);
        let shape = Nhwc::new(1, 32, 32, 256);
        let block = config.materialize::<TestBackend>(shape, shape, &device());
        assert!(block.is_ok());
        if let Ok(block) = block {
            let x_prev = Tensor::<TestBackend, 4>::ones(shape.to_array(), &device());
            let x_csp = Tensor::<TestBackend, 4>::ones(shape.to_array(), &device());
            let y = block.forward(x_prev, x_csp);
            assert_eq!(y.dims(), [1, 32, 32, 256]);
            assert_eq!(block.output_shape(), Nhwc::new(1, 32, 32, 256));
            assert_eq!(block.reduce().output_shape().channels, 128);
            assert_eq!(block.project().input_shape().channels, 128 + 256);
        }
    }

    #[test]
    fn output_channels_independent_of_inputs() {
        for (prev_c, csp_c) in [(3, 5), (64, 8), (17, 200)] {
            let prev = Nhwc::new(2, 6, 5, prev_c);
            let csp = Nhwc::new(2, 6, 5, csp_c);
            let block = CspConnectConfig::new(24).materialize::<TestBackend>(prev, csp, &device());
            assert!(block.is_ok());
            if let Ok(block) = block {
                let y = block.try_forward(
                    Tensor::zeros(prev.to_array(), &device()),
                    Tensor::zeros(csp.to_array(), &device()),
                );
                assert!(y.is_ok_and(|y| y.dims() == [2, 6, 5, 24]));
            }
        }
    }

    #[test]
    fn try_forward_rejects_mismatches() {
        let prev = Nhwc::new(1, 8, 8, 16);
        let csp = Nhwc::new(1, 8, 8, 8);
        let block = CspConnectConfig::new(32).materialize::<TestBackend>(prev, csp, &device());
        assert!(block.is_ok());
        if let Ok(block) = block {
            let wrong_channels = block.try_forward(
                Tensor::zeros([1, 8, 8, 12], &device()),
                Tensor::zeros(csp.to_array(), &device()),
            );
            assert!(matches!(wrong_channels, Err(LayerError::ShapeMismatch { .. })));

            let wrong_extent = block.try_forward(
                Tensor::zeros(prev.to_array(), &device()),
                Tensor::zeros([1, 4, 4, 8], &device()),
            );
            assert!(matches!(wrong_extent, Err(LayerError::ShapeMismatch { .. })));
        }
    }

    #[test]
    fn hyperparams_thread_into_both_convs() {
        let hp = ConvHyperparams::default()
            .with_activation(ActivationKind::Leaky)
            .with_bn(false)
            .with_weight_decay(1e-4)
            .with_bias_regularizer(Regularizer::l2(1e-3));
        let shape = Nhwc::new(1, 4, 4, 8);
        let block = CspConnectConfig::new(16)
            .with_hyperparams(hp)
            .materialize::<TestBackend>(shape, shape, &device());
        assert!(block.is_ok());
        if let Ok(block) = block {
            assert_eq!(block.reduce().config().hyperparams, hp);
            assert_eq!(block.project().config().hyperparams, hp);
            assert!(block.reduce().has_bias());
            assert!(block.project().has_bias());
            assert!(block.regularization_loss().is_some());
        }
    }
}
