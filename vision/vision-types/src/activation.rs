//! Activation function selection.

use serde::{Deserialize, Serialize};

/// Activation applied after a convolution (and its normalization).
///
/// # Example
///
/// ```
/// use vision_types::ActivationKind;
///
/// let act: ActivationKind = "leaky".parse()?;
/// assert_eq!(act, ActivationKind::Leaky);
/// assert_eq!(ActivationKind::default(), ActivationKind::Mish);
/// # Ok::<(), String>(())
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ActivationKind {
    /// Identity.
    Linear,
    /// `max(0, x)`.
    Relu,
    /// Leaky ReLU; the slope comes from the block's `leaky_alpha`.
    Leaky,
    /// `x * tanh(softplus(x))`.
    #[default]
    Mish,
    /// `x * sigmoid(x)`.
    Swish,
    /// Logistic sigmoid.
    Sigmoid,
}

impl ActivationKind {
    /// Returns the activation name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Linear => "linear",
            Self::Relu => "relu",
            Self::Leaky => "leaky",
            Self::Mish => "mish",
            Self::Swish => "swish",
            Self::Sigmoid => "sigmoid",
        }
    }
}

impl std::fmt::Display for ActivationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ActivationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "linear" | "identity" => Ok(Self::Linear),
            "relu" => Ok(Self::Relu),
            "leaky" | "leaky_relu" => Ok(Self::Leaky),
            "mish" => Ok(Self::Mish),
            "swish" | "silu" => Ok(Self::Swish),
            "sigmoid" => Ok(Self::Sigmoid),
            other => Err(format!("unknown activation: {other}")),
        }
    }
}
