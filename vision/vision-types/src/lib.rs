//! Shape and configuration vocabulary for composable vision blocks.
//!
//! This crate is framework-free: it describes *what* a block is
//! configured with and *what shape* it produces, never how tensors are
//! computed. The layer and model crates turn these records into Burn
//! modules.
//!
//! # Shapes
//!
//! - [`TensorShape`] - Dynamic-rank dimensions as observed on a tensor
//! - [`Nhwc`] - Validated channels-last image batch shape
//! - [`Padding`] / [`conv_output_size`] - Convolution arithmetic
//!
//! # Configuration
//!
//! - [`ConvHyperparams`] - Initializers, penalties, normalization and
//!   activation shared by every convolution of a block
//! - [`NormSettings`] - Batch normalization settings
//! - [`ActivationKind`], [`InitializerKind`], [`Regularizer`]
//!
//! # Example
//!
//! ```
//! use vision_types::{conv_output_size, Padding, TensorShape};
//!
//! let input = TensorShape::from([2, 224, 224, 3]).nhwc()?;
//! let h = conv_output_size(input.height, 7, 2, Padding::Same)?;
//! assert_eq!(h, 112);
//! # Ok::<(), vision_types::ShapeError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

mod activation;
mod error;
mod hyperparams;
mod initializer;
mod regularizer;
mod shape;

pub use activation::ActivationKind;
pub use hyperparams::{ConvHyperparams, NormSettings};
pub use initializer::InitializerKind;
pub use regularizer::Regularizer;
pub use shape::{Nhwc, Padding, TensorShape, conv_output_size};

pub use error::{Result, ShapeError};
