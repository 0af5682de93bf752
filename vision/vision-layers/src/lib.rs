//! Configurable convolution blocks on Burn.
//!
//! Every block follows the same two-phase lifecycle: an immutable,
//! serializable configuration record, and a `materialize` step that takes
//! the first input shape and allocates parameters. After that the block's
//! parameter shapes are fixed and its output shapes are known up front.
//!
//! # Blocks
//!
//! - [`ConvBlock`] - Convolution, optional batch norm and an activation
//! - [`CspConnect`] - Cross-stage-partial fusion of two feature maps
//!
//! # Registry
//!
//! [`BlockRegistry`] maps block-type names to factories, so a block can be
//! rebuilt from a JSON [`BlockSpec`] without knowing its Rust type.
//!
//! # Checkpoint Persistence
//!
//! Weights are stored through Burn's recorders:
//! - Binary format (compact, fast)
//! - JSON format (human-readable, debuggable)
//!
//! [`save_block`] also writes a manifest so [`load_block`] can
//! re-materialize the block through a registry before loading weights.
//!
//! # Layout
//!
//! Public forwards take and return channels-last `[b, h, w, c]` tensors.
//! Burn's convolutions are channels-first, so blocks permute at their
//! boundary; `forward_channels_first` skips that for chained use.
//!
//! # Example
//!
//! ```
//! use burn::tensor::Tensor;
//! use burn_ndarray::NdArray;
//! use vision_layers::CspConnectConfig;
//! use vision_types::Nhwc;
//!
//! let device = Default::default();
//! let shape = Nhwc::new(1, 8, 8, 16);
//! let block = CspConnectConfig::new(32).materialize::<NdArray<f32>>(shape, shape, &device)?;
//! let y = block.forward(
//!     Tensor::zeros(shape.to_array(), &device),
//!     Tensor::zeros(shape.to_array(), &device),
//! );
//! assert_eq!(y.dims(), [1, 8, 8, 32]);
//! # Ok::<(), vision_layers::LayerError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

mod checkpoint;
mod conv_block;
mod csp_connect;
mod error;
pub mod init;
pub mod ops;
mod registry;

// Re-export blocks
pub use conv_block::{ConvBlock, ConvBlockConfig};
pub use csp_connect::{CspConnect, CspConnectConfig};

// Re-export registry
pub use registry::{
    BlockFactory, BlockRegistry, BlockSpec, CONV_BLOCK, CSP_CONNECT, DynBlock, ForwardFn,
    RegisteredBlock, nhwc_inputs,
};

// Re-export checkpoint utilities
pub use checkpoint::{
    BlockManifest, CheckpointFormat, load_block, load_checkpoint, save_block, save_checkpoint,
};

// Re-export error types
pub use error::{LayerError, Result};

/// Prelude for convenient imports.
pub mod prelude {
    pub use super::{
        BlockRegistry, BlockSpec, CheckpointFormat, ConvBlock, ConvBlockConfig, CspConnect,
        CspConnectConfig, DynBlock, LayerError, load_block, save_block,
    };
    pub use vision_types::{ActivationKind, ConvHyperparams, Nhwc, NormSettings, TensorShape};
}
