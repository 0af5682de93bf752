//! Convolution hyperparameters shared by every sub-operator of a block.

use serde::{Deserialize, Serialize};

use crate::activation::ActivationKind;
use crate::initializer::InitializerKind;
use crate::regularizer::Regularizer;

/// Batch normalization settings.
///
/// `momentum` follows the keras convention: the running statistics are
/// updated as `running = momentum * running + (1 - momentum) * batch`.
///
/// # Example
///
/// ```
/// use vision_types::NormSettings;
///
/// let norm = NormSettings::default();
/// assert_eq!(norm.momentum, 0.99);
/// assert_eq!(norm.epsilon, 0.001);
/// assert!(!norm.sync);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormSettings {
    /// Decay of the running statistics.
    pub momentum: f64,

    /// Variance floor.
    pub epsilon: f64,

    /// Synchronize batch statistics across execution replicas.
    pub sync: bool,

    /// Whether the scale and shift are updated during training.
    pub trainable: bool,
}

impl Default for NormSettings {
    fn default() -> Self {
        Self {
            momentum: 0.99,
            epsilon: 0.001,
            sync: false,
            trainable: true,
        }
    }
}

impl NormSettings {
    /// Creates settings with the given momentum and epsilon.
    #[must_use]
    pub const fn new(momentum: f64, epsilon: f64) -> Self {
        Self {
            momentum,
            epsilon,
            sync: false,
            trainable: true,
        }
    }

    /// Requests synchronized statistics.
    #[must_use]
    pub const fn with_sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }

    /// Freezes or unfreezes scale and shift.
    #[must_use]
    pub const fn with_trainable(mut self, trainable: bool) -> Self {
        self.trainable = trainable;
        self
    }

    /// Momentum in the "weight of the new batch" convention.
    #[must_use]
    pub fn update_rate(&self) -> f64 {
        1.0 - self.momentum
    }

    /// Validates the settings.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        (0.0..=1.0).contains(&self.momentum) && self.epsilon > 0.0 && self.epsilon.is_finite()
    }
}

/// The configuration surface threaded into every convolution of a block.
///
/// Composite blocks hold one of these and hand a copy to each child so
/// initializers, penalties, normalization and activation never have to be
/// re-specified per operator.
///
/// # Example
///
/// ```
/// use vision_types::{ActivationKind, ConvHyperparams, Regularizer};
///
/// let hp = ConvHyperparams::default()
///     .with_activation(ActivationKind::Leaky)
///     .with_weight_decay(5e-4)
///     .with_bias_regularizer(Regularizer::l2(1e-4));
/// assert!(hp.is_valid());
/// assert!(hp.has_regularization());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvHyperparams {
    /// Kernel initializer.
    pub kernel_initializer: InitializerKind,

    /// Bias initializer (only used when the convolution carries a bias).
    pub bias_initializer: InitializerKind,

    /// Optional bias penalty.
    pub bias_regularizer: Option<Regularizer>,

    /// Optional L2 coefficient on kernels.
    pub weight_decay: Option<f64>,

    /// Apply batch normalization after the convolution.
    pub use_bn: bool,

    /// Batch normalization settings.
    pub norm: NormSettings,

    /// Activation after normalization.
    pub activation: ActivationKind,

    /// Negative slope of [`ActivationKind::Leaky`].
    pub leaky_alpha: f64,
}

impl Default for ConvHyperparams {
    fn default() -> Self {
        Self {
            kernel_initializer: InitializerKind::GlorotUniform,
            bias_initializer: InitializerKind::Zeros,
            bias_regularizer: None,
            weight_decay: None,
            use_bn: true,
            norm: NormSettings::default(),
            activation: ActivationKind::Mish,
            leaky_alpha: 0.1,
        }
    }
}

impl ConvHyperparams {
    /// Sets the activation.
    #[must_use]
    pub const fn with_activation(mut self, activation: ActivationKind) -> Self {
        self.activation = activation;
        self
    }

    /// Sets the kernel initializer.
    #[must_use]
    pub const fn with_kernel_initializer(mut self, init: InitializerKind) -> Self {
        self.kernel_initializer = init;
        self
    }

    /// Sets the bias initializer.
    #[must_use]
    pub const fn with_bias_initializer(mut self, init: InitializerKind) -> Self {
        self.bias_initializer = init;
        self
    }

    /// Sets the bias penalty.
    #[must_use]
    pub const fn with_bias_regularizer(mut self, reg: Regularizer) -> Self {
        self.bias_regularizer = Some(reg);
        self
    }

    /// Sets the kernel L2 coefficient.
    #[must_use]
    pub const fn with_weight_decay(mut self, weight_decay: f64) -> Self {
        self.weight_decay = Some(weight_decay);
        self
    }

    /// Enables or disables batch normalization.
    #[must_use]
    pub const fn with_bn(mut self, use_bn: bool) -> Self {
        self.use_bn = use_bn;
        self
    }

    /// Sets the normalization settings.
    #[must_use]
    pub const fn with_norm(mut self, norm: NormSettings) -> Self {
        self.norm = norm;
        self
    }

    /// Returns true if any penalty is configured.
    #[must_use]
    pub const fn has_regularization(&self) -> bool {
        self.weight_decay.is_some() || self.bias_regularizer.is_some()
    }

    /// Validates the hyperparameters.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.kernel_initializer.is_valid()
            && self.bias_initializer.is_valid()
            && self.bias_regularizer.is_none_or(|r| r.is_valid())
            && self
                .weight_decay
                .is_none_or(|wd| wd.is_finite() && wd >= 0.0)
            && (!self.use_bn || self.norm.is_valid())
            && self.leaky_alpha.is_finite()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn hyperparams_default_mirrors_csp_layer() {
        let hp = ConvHyperparams::default();
        assert_eq!(hp.activation, ActivationKind::Mish);
        assert_eq!(hp.kernel_initializer, InitializerKind::GlorotUniform);
        assert_eq!(hp.bias_initializer, InitializerKind::Zeros);
        assert!(hp.use_bn);
        assert!(!hp.norm.sync);
        assert!(!hp.has_regularization());
        assert!(hp.is_valid());
    }

    #[test]
    fn norm_update_rate() {
        assert_relative_eq!(NormSettings::default().update_rate(), 0.01, epsilon = 1e-12);
        assert_relative_eq!(NormSettings::new(0.9, 1e-5).update_rate(), 0.1, epsilon = 1e-12);
    }

    #[test]
    fn invalid_hyperparams() {
        let hp = ConvHyperparams::default().with_weight_decay(-1.0);
        assert!(!hp.is_valid());

        let hp = ConvHyperparams::default().with_norm(NormSettings::new(1.5, 1e-3));
        assert!(!hp.is_valid());

        // Norm settings are ignored without batch norm.
        let hp = ConvHyperparams::default()
            .with_bn(false)
            .with_norm(NormSettings::new(1.5, 1e-3));
        assert!(hp.is_valid());
    }

    #[test]
    fn hyperparams_partial_json() {
        let hp: ConvHyperparams =
            serde_json::from_str(r#"{"activation": "leaky", "use_bn": false}"#)
                .unwrap_or_default();
        assert_eq!(hp.activation, ActivationKind::Leaky);
        assert!(!hp.use_bn);
        assert_relative_eq!(hp.leaky_alpha, 0.1);
        assert_eq!(hp.norm, NormSettings::default());
    }
}
