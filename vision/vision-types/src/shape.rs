//! Tensor shapes and convolution arithmetic.

use serde::{Deserialize, Serialize};

use crate::error::{Result, ShapeError};

/// Dimensions observed on a tensor of any rank.
///
/// # Example
///
/// ```
/// use vision_types::TensorShape;
///
/// let shape = TensorShape::new(vec![2, 448, 448, 3]);
/// let nhwc = shape.nhwc()?;
/// assert_eq!(nhwc.channels, 3);
///
/// assert!(TensorShape::new(vec![448, 448, 3]).nhwc().is_err());
/// # Ok::<(), vision_types::ShapeError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorShape(Vec<usize>);

impl TensorShape {
    /// Wraps a list of dimensions.
    #[must_use]
    pub const fn new(dims: Vec<usize>) -> Self {
        Self(dims)
    }

    /// Returns the rank.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Returns the dimensions.
    #[must_use]
    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Interprets the shape as channels-last image batch.
    ///
    /// # Errors
    ///
    /// Returns [`ShapeError::InvalidRank`] unless the rank is 4, and
    /// [`ShapeError::ZeroDimension`] if any dimension is zero.
    pub fn nhwc(&self) -> Result<Nhwc> {
        let &[batch, height, width, channels] = self.0.as_slice() else {
            return Err(ShapeError::invalid_rank(4, &self.0));
        };
        if let Some(axis) = self.0.iter().position(|&d| d == 0) {
            return Err(ShapeError::ZeroDimension {
                axis,
                shape: self.0.clone(),
            });
        }
        Ok(Nhwc::new(batch, height, width, channels))
    }
}

impl From<Vec<usize>> for TensorShape {
    fn from(dims: Vec<usize>) -> Self {
        Self(dims)
    }
}

impl<const D: usize> From<[usize; D]> for TensorShape {
    fn from(dims: [usize; D]) -> Self {
        Self(dims.to_vec())
    }
}

impl From<Nhwc> for TensorShape {
    fn from(shape: Nhwc) -> Self {
        Self(shape.to_array().to_vec())
    }
}

/// Rank-4 channels-last shape `[batch, height, width, channels]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Nhwc {
    /// Batch size.
    pub batch: usize,
    /// Rows.
    pub height: usize,
    /// Columns.
    pub width: usize,
    /// Channels (innermost axis).
    pub channels: usize,
}

impl Nhwc {
    /// Creates a shape.
    #[must_use]
    pub const fn new(batch: usize, height: usize, width: usize, channels: usize) -> Self {
        Self {
            batch,
            height,
            width,
            channels,
        }
    }

    /// Returns a copy with a different channel count.
    #[must_use]
    pub const fn with_channels(mut self, channels: usize) -> Self {
        self.channels = channels;
        self
    }

    /// Returns a copy with different spatial dims.
    #[must_use]
    pub const fn with_spatial(mut self, height: usize, width: usize) -> Self {
        self.height = height;
        self.width = width;
        self
    }

    /// Returns `(height, width)`.
    #[must_use]
    pub const fn spatial(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    /// Returns the dimensions as an array.
    #[must_use]
    pub const fn to_array(&self) -> [usize; 4] {
        [self.batch, self.height, self.width, self.channels]
    }

    /// Returns true if batch and spatial dims agree (channels may differ).
    #[must_use]
    pub const fn same_extent(&self, other: &Self) -> bool {
        self.batch == other.batch && self.height == other.height && self.width == other.width
    }

    /// Number of elements per batch item.
    #[must_use]
    pub const fn item_len(&self) -> usize {
        self.height * self.width * self.channels
    }
}

impl std::fmt::Display for Nhwc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}, {}, {}, {}]",
            self.batch, self.height, self.width, self.channels
        )
    }
}

/// Spatial padding policy of a convolution or pooling window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Padding {
    /// Output extent is `ceil(input / stride)`. Odd kernels only.
    #[default]
    Same,
    /// No padding.
    Valid,
    /// Symmetric padding of the given size on each side.
    Explicit(usize),
}

impl Padding {
    /// Pixels added to each side for the given kernel.
    ///
    /// # Errors
    ///
    /// Returns [`ShapeError::EvenKernelSamePadding`] for `Same` with an
    /// even kernel.
    pub fn per_side(&self, kernel: usize) -> Result<usize> {
        match self {
            Self::Same => {
                if kernel % 2 == 0 {
                    Err(ShapeError::EvenKernelSamePadding(kernel))
                } else {
                    Ok((kernel - 1) / 2)
                }
            }
            Self::Valid => Ok(0),
            Self::Explicit(p) => Ok(*p),
        }
    }
}

/// Output extent of a convolution along one axis.
///
/// `floor((input + 2 * pad - kernel) / stride) + 1`
///
/// # Errors
///
/// Returns an error for a zero stride, an even kernel with `Same`
/// padding, or a kernel that does not fit the padded input.
///
/// # Example
///
/// ```
/// use vision_types::{conv_output_size, Padding};
///
/// assert_eq!(conv_output_size(448, 7, 2, Padding::Same)?, 224);
/// assert_eq!(conv_output_size(7, 3, 2, Padding::Same)?, 4);
/// assert_eq!(conv_output_size(7, 3, 1, Padding::Valid)?, 5);
/// # Ok::<(), vision_types::ShapeError>(())
/// ```
pub fn conv_output_size(
    input: usize,
    kernel: usize,
    stride: usize,
    padding: Padding,
) -> Result<usize> {
    if stride == 0 {
        return Err(ShapeError::InvalidStride);
    }
    let pad = padding.per_side(kernel)?;
    let padded = input + 2 * pad;
    if kernel == 0 || kernel > padded {
        return Err(ShapeError::KernelTooLarge {
            kernel,
            input,
            padding: pad,
        });
    }
    Ok((padded - kernel) / stride + 1)
}
