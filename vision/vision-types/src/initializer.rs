//! Parameter initializer selection.

use serde::{Deserialize, Serialize};

/// How a weight or bias tensor is filled when a block is materialized.
///
/// Names follow the common keras spellings so block specs written for
/// other frameworks read the same.
///
/// # Example
///
/// ```
/// use vision_types::InitializerKind;
///
/// let init: InitializerKind = serde_json::from_str(r#""glorot_uniform""#)?;
/// assert_eq!(init, InitializerKind::GlorotUniform);
///
/// let init: InitializerKind =
///     serde_json::from_str(r#"{"truncated_normal": {"mean": 0.0, "stddev": 0.03}}"#)?;
/// assert!(!init.needs_fan());
/// # Ok::<(), serde_json::Error>(())
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InitializerKind {
    /// All zeros.
    Zeros,
    /// All ones.
    Ones,
    /// Constant value.
    Constant {
        /// Fill value.
        value: f64,
    },
    /// Glorot (Xavier) uniform.
    #[default]
    GlorotUniform,
    /// Glorot (Xavier) normal.
    GlorotNormal,
    /// He (Kaiming) uniform.
    HeUniform,
    /// He (Kaiming) normal.
    HeNormal,
    /// Normal distribution.
    RandomNormal {
        /// Mean.
        mean: f64,
        /// Standard deviation.
        stddev: f64,
    },
    /// Normal distribution with samples beyond two standard deviations
    /// redrawn.
    TruncatedNormal {
        /// Mean.
        mean: f64,
        /// Standard deviation.
        stddev: f64,
    },
    /// Uniform distribution.
    RandomUniform {
        /// Lower bound.
        min: f64,
        /// Upper bound.
        max: f64,
    },
}

impl InitializerKind {
    /// Truncated normal with the keras defaults.
    #[must_use]
    pub const fn truncated_normal() -> Self {
        Self::TruncatedNormal {
            mean: 0.0,
            stddev: 0.05,
        }
    }

    /// Returns true if the initializer scales with fan-in/fan-out.
    #[must_use]
    pub const fn needs_fan(&self) -> bool {
        matches!(
            self,
            Self::GlorotUniform | Self::GlorotNormal | Self::HeUniform | Self::HeNormal
        )
    }

    /// Returns true if the parameters are valid.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        match *self {
            Self::RandomNormal { stddev, .. } | Self::TruncatedNormal { stddev, .. } => {
                stddev.is_finite() && stddev >= 0.0
            }
            Self::RandomUniform { min, max } => min.is_finite() && max.is_finite() && min <= max,
            Self::Constant { value } => value.is_finite(),
            _ => true,
        }
    }
}
