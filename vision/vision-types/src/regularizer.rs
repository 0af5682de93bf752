//! Weight penalties.

use serde::{Deserialize, Serialize};

/// Penalty added to the training loss for a parameter tensor.
///
/// `l1 * sum(|w|) + l2 * sum(w²)`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Regularizer {
    /// Absolute-value penalty.
    L1 {
        /// Coefficient.
        l1: f64,
    },
    /// Squared penalty.
    L2 {
        /// Coefficient.
        l2: f64,
    },
    /// Both penalties.
    L1L2 {
        /// Absolute-value coefficient.
        l1: f64,
        /// Squared coefficient.
        l2: f64,
    },
}

impl Regularizer {
    /// Squared penalty with the given coefficient.
    #[must_use]
    pub const fn l2(l2: f64) -> Self {
        Self::L2 { l2 }
    }

    /// Returns `(l1, l2)` coefficients.
    #[must_use]
    pub const fn penalty_weights(&self) -> (f64, f64) {
        match *self {
            Self::L1 { l1 } => (l1, 0.0),
            Self::L2 { l2 } => (0.0, l2),
            Self::L1L2 { l1, l2 } => (l1, l2),
        }
    }

    /// Returns true if no coefficient is negative or non-finite.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        let (l1, l2) = self.penalty_weights();
        l1.is_finite() && l2.is_finite() && l1 >= 0.0 && l2 >= 0.0
    }
}
