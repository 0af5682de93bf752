//! Second-stage box classifier head.
//!
//! Flattens each cropped proposal and runs two fully connected ReLU
//! layers, emitting `[n, 1, 1, hidden]` so the result still reads as a
//! (1×1) feature map.

use burn::module::{Ignored, Module};
use burn::nn::{Initializer, Linear, LinearConfig};
use burn::prelude::Backend;
use burn::tensor::Tensor;
use burn::tensor::activation::relu;
use serde::{Deserialize, Serialize};
use tracing::debug;
use vision_layers::LayerError;
use vision_layers::init::init_param;
use vision_layers::ops::nhwc_of;
use vision_types::{InitializerKind, Nhwc};

use crate::error::{ModelError, Result};

const fn default_hidden() -> usize {
    1024
}

/// Configuration of a [`BoxClassifierHead`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoxClassifierConfig {
    /// Width of both fully connected layers.
    #[serde(default = "default_hidden")]
    pub hidden: usize,

    /// Weight initializer of both layers.
    #[serde(default)]
    pub kernel_initializer: InitializerKind,
}

impl Default for BoxClassifierConfig {
    fn default() -> Self {
        Self {
            hidden: default_hidden(),
            kernel_initializer: InitializerKind::default(),
        }
    }
}

impl BoxClassifierConfig {
    /// Creates a head with the given hidden width.
    #[must_use]
    pub fn new(hidden: usize) -> Self {
        Self {
            hidden,
            ..Self::default()
        }
    }

    /// Sets the weight initializer.
    #[must_use]
    pub const fn with_kernel_initializer(mut self, init: InitializerKind) -> Self {
        self.kernel_initializer = init;
        self
    }

    /// Infers the output shape for proposal crops of shape `input`.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::InvalidConfig`] for a zero width or an invalid
    /// initializer.
    pub fn output_shape(&self, input: Nhwc) -> Result<Nhwc> {
        if self.hidden == 0 || !self.kernel_initializer.is_valid() {
            return Err(ModelError::invalid_config(format!("{self:?}")));
        }
        Ok(Nhwc::new(input.batch, 1, 1, self.hidden))
    }

    fn linear<B: Backend>(&self, d_input: usize, device: &B::Device) -> Linear<B> {
        let mut linear = LinearConfig::new(d_input, self.hidden)
            .with_initializer(Initializer::Zeros)
            .init(device);
        linear.weight = init_param(
            self.kernel_initializer,
            [d_input, self.hidden],
            d_input,
            self.hidden,
            device,
        );
        linear
    }

    /// Allocates the head for proposal crops of shape `input`.
    ///
    /// # Errors
    ///
    /// Fails under the same conditions as [`Self::output_shape`].
    pub fn materialize<B: Backend>(
        &self,
        input: Nhwc,
        device: &B::Device,
    ) -> Result<BoxClassifierHead<B>> {
        let output = self.output_shape(input)?;
        let head = BoxClassifierHead {
            fc1: self.linear(input.item_len(), device),
            fc2: self.linear(self.hidden, device),
            config: Ignored(*self),
            input_shape: Ignored(input),
            output_shape: Ignored(output),
        };
        debug!(
            input = %input,
            output = %output,
            params = head.num_params(),
            "materialized box classifier head"
        );
        Ok(head)
    }
}

/// Flatten, two fully connected ReLU layers, reshape to `[n, 1, 1, hidden]`.
#[derive(Module, Debug)]
pub struct BoxClassifierHead<B: Backend> {
    fc1: Linear<B>,
    fc2: Linear<B>,
    config: Ignored<BoxClassifierConfig>,
    input_shape: Ignored<Nhwc>,
    output_shape: Ignored<Nhwc>,
}

impl<B: Backend> BoxClassifierHead<B> {
    /// Classifies proposal crops `[n, h, w, c]`.
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [n, height, width, channels] = x.dims();
        let x = x.reshape([n, height * width * channels]);
        let x = relu(self.fc1.forward(x));
        let x = relu(self.fc2.forward(x));
        x.reshape([n, 1, 1, self.config.hidden])
    }

    /// Classifies proposal crops after checking their per-item shape.
    ///
    /// # Errors
    ///
    /// Returns a shape mismatch if the crop extent or depth differs from
    /// the materialized one; only the proposal count may vary.
    pub fn try_forward(&self, x: Tensor<B, 4>) -> Result<Tensor<B, 4>> {
        let actual = nhwc_of(&x);
        let expected = *self.input_shape;
        if actual.spatial() != expected.spatial() || actual.channels != expected.channels {
            return Err(LayerError::shape_mismatch(expected, actual).into());
        }
        Ok(self.forward(x))
    }

    /// Crop shape the head was materialized for.
    #[must_use]
    pub fn input_shape(&self) -> Nhwc {
        *self.input_shape
    }

    /// Output shape for the materialized input.
    #[must_use]
    pub fn output_shape(&self) -> Nhwc {
        *self.output_shape
    }
}
