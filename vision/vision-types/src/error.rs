//! Error types for vision-types crate.

use thiserror::Error;

/// Errors raised by shape validation and convolution arithmetic.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ShapeError {
    /// Tensor rank differs from the rank the operation expects.
    #[error("invalid rank: expected {expected}, got {actual} (shape {shape:?})")]
    InvalidRank {
        /// Expected rank.
        expected: usize,
        /// Observed rank.
        actual: usize,
        /// Observed dimensions.
        shape: Vec<usize>,
    },

    /// A dimension is zero.
    #[error("dimension {axis} is zero in shape {shape:?}")]
    ZeroDimension {
        /// Axis holding the zero.
        axis: usize,
        /// Observed dimensions.
        shape: Vec<usize>,
    },

    /// Stride of zero.
    #[error("stride must be positive")]
    InvalidStride,

    /// Kernel larger than the (padded) input.
    #[error("kernel {kernel} does not fit input {input} with padding {padding}")]
    KernelTooLarge {
        /// Kernel extent.
        kernel: usize,
        /// Input extent.
        input: usize,
        /// Padding applied to each side.
        padding: usize,
    },

    /// `Same` padding requested with an even kernel.
    #[error("same padding requires an odd kernel, got {0}")]
    EvenKernelSamePadding(usize),
}

impl ShapeError {
    /// Creates an invalid rank error.
    #[must_use]
    pub fn invalid_rank(expected: usize, shape: &[usize]) -> Self {
        Self::InvalidRank {
            expected,
            actual: shape.len(),
            shape: shape.to_vec(),
        }
    }
}

/// Result type for vision-types operations.
pub type Result<T> = std::result::Result<T, ShapeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_invalid_rank() {
        let err = ShapeError::invalid_rank(4, &[224, 224, 3]);
        let msg = err.to_string();
        assert!(msg.contains("expected 4"));
        assert!(msg.contains("got 3"));
        assert!(msg.contains("[224, 224, 3]"));
    }

    #[test]
    fn error_kernel_too_large() {
        let err = ShapeError::KernelTooLarge {
            kernel: 7,
            input: 3,
            padding: 0,
        };
        assert!(err.to_string().contains("kernel 7"));
    }

    #[test]
    fn error_even_kernel() {
        let err = ShapeError::EvenKernelSamePadding(2);
        assert!(err.to_string().contains("odd kernel"));
    }
}
