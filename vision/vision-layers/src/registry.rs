//! Block registry: block-type names mapped to factory functions.
//!
//! A [`BlockSpec`] names a registered block type and carries its JSON
//! configuration. The registry parses the configuration, materializes the
//! block for the given input shapes and hands it back behind the
//! object-safe [`DynBlock`] interface.

use std::collections::BTreeMap;

use burn::module::Module;
use burn::prelude::Backend;
use burn::tensor::Tensor;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;
use vision_types::{Nhwc, TensorShape};

use crate::checkpoint::{CheckpointFormat, load_checkpoint, save_checkpoint};
use crate::conv_block::{ConvBlock, ConvBlockConfig};
use crate::csp_connect::{CspConnect, CspConnectConfig};
use crate::error::{LayerError, Result};

/// Registry name of [`ConvBlock`].
pub const CONV_BLOCK: &str = "conv_block";

/// Registry name of [`CspConnect`].
pub const CSP_CONNECT: &str = "csp_connect";

/// Serializable description of a block: its type name and configuration.
///
/// # Example
///
/// ```
/// use vision_layers::{BlockSpec, CspConnectConfig};
///
/// let spec = BlockSpec::from_config("csp_connect", &CspConnectConfig::new(64))?;
/// let json = serde_json::to_string(&spec)?;
/// assert!(json.contains(r#""type":"csp_connect""#));
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockSpec {
    /// Registered block type.
    #[serde(rename = "type")]
    pub block_type: String,

    /// Block configuration.
    #[serde(default)]
    pub config: serde_json::Value,
}

impl BlockSpec {
    /// Creates a spec from a raw JSON configuration.
    #[must_use]
    pub fn new(block_type: impl Into<String>, config: serde_json::Value) -> Self {
        Self {
            block_type: block_type.into(),
            config,
        }
    }

    /// Creates a spec from a typed configuration.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the configuration cannot be
    /// represented as JSON.
    pub fn from_config<C: Serialize>(block_type: impl Into<String>, config: &C) -> Result<Self> {
        Ok(Self::new(block_type, serde_json::to_value(config)?))
    }

    /// Parses the configuration into a typed record.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the JSON does not match `C`.
    pub fn parse_config<C: DeserializeOwned>(&self) -> Result<C> {
        serde_json::from_value(self.config.clone()).map_err(|e| {
            LayerError::serialization(format!("{} config: {e}", self.block_type))
        })
    }
}

/// Object-safe view of a materialized block.
pub trait DynBlock<B: Backend> {
    /// Spec the block was built from.
    fn spec(&self) -> &BlockSpec;

    /// Registered block type.
    fn block_type(&self) -> &str {
        &self.spec().block_type
    }

    /// Input shapes the block was materialized for.
    fn input_shapes(&self) -> Vec<Nhwc>;

    /// Output shapes for the materialized inputs.
    fn output_shapes(&self) -> Vec<Nhwc>;

    /// Number of stored scalars, batch-norm running statistics included.
    fn num_params(&self) -> usize;

    /// Runs the block on channels-last inputs.
    ///
    /// # Errors
    ///
    /// Returns an error for a wrong number of inputs or shapes that do not
    /// match the materialized ones.
    fn try_forward(&self, inputs: Vec<Tensor<B, 4>>) -> Result<Vec<Tensor<B, 4>>>;

    /// Saves the weights to `<stem>.<ext>` and returns the path.
    ///
    /// # Errors
    ///
    /// Returns an error if the recorder fails.
    fn save_weights(&self, stem: &str, format: CheckpointFormat) -> Result<String>;

    /// Replaces the weights with the ones stored at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or does not match the block.
    fn load_weights(self: Box<Self>, path: &str, device: &B::Device)
    -> Result<Box<dyn DynBlock<B>>>;
}

/// Forward function of a [`RegisteredBlock`].
pub type ForwardFn<B, M> = fn(&M, Vec<Tensor<B, 4>>) -> Result<Vec<Tensor<B, 4>>>;

/// Adapts a concrete Burn module to [`DynBlock`].
pub struct RegisteredBlock<B: Backend, M: Module<B>> {
    spec: BlockSpec,
    inputs: Vec<Nhwc>,
    outputs: Vec<Nhwc>,
    module: M,
    forward: ForwardFn<B, M>,
}

impl<B: Backend, M: Module<B>> RegisteredBlock<B, M> {
    /// Wraps a materialized module.
    pub fn new(
        spec: BlockSpec,
        inputs: Vec<Nhwc>,
        outputs: Vec<Nhwc>,
        module: M,
        forward: ForwardFn<B, M>,
    ) -> Self {
        Self {
            spec,
            inputs,
            outputs,
            module,
            forward,
        }
    }

    /// The wrapped module.
    pub fn module(&self) -> &M {
        &self.module
    }
}

impl<B: Backend, M: Module<B> + 'static> DynBlock<B> for RegisteredBlock<B, M> {
    fn spec(&self) -> &BlockSpec {
        &self.spec
    }

    fn input_shapes(&self) -> Vec<Nhwc> {
        self.inputs.clone()
    }

    fn output_shapes(&self) -> Vec<Nhwc> {
        self.outputs.clone()
    }

    fn num_params(&self) -> usize {
        self.module.num_params()
    }

    fn try_forward(&self, inputs: Vec<Tensor<B, 4>>) -> Result<Vec<Tensor<B, 4>>> {
        if inputs.len() != self.inputs.len() {
            return Err(LayerError::input_count(
                &self.spec.block_type,
                self.inputs.len(),
                inputs.len(),
            ));
        }
        (self.forward)(&self.module, inputs)
    }

    fn save_weights(&self, stem: &str, format: CheckpointFormat) -> Result<String> {
        save_checkpoint::<B, M>(&self.module, stem, format)
    }

    fn load_weights(
        self: Box<Self>,
        path: &str,
        device: &B::Device,
    ) -> Result<Box<dyn DynBlock<B>>> {
        let this = *self;
        let module = load_checkpoint::<B, M>(this.module, path, device)?;
        Ok(Box::new(Self { module, ..this }))
    }
}

/// Builds a block from its spec for the given input shapes.
pub type BlockFactory<B> =
    fn(&BlockSpec, &[TensorShape], &<B as Backend>::Device) -> Result<Box<dyn DynBlock<B>>>;

/// Registry of block factories keyed by block-type name.
///
/// # Example
///
/// ```
/// use burn_ndarray::NdArray;
/// use vision_layers::{BlockRegistry, BlockSpec, CspConnectConfig};
/// use vision_types::TensorShape;
///
/// let registry = BlockRegistry::<NdArray<f32>>::with_layers();
/// let spec = BlockSpec::from_config("csp_connect", &CspConnectConfig::new(32))?;
/// let shape = TensorShape::from([1, 8, 8, 16]);
/// let block = registry.materialize(&spec, &[shape.clone(), shape], &Default::default())?;
/// assert_eq!(block.output_shapes()[0].channels, 32);
/// # Ok::<(), vision_layers::LayerError>(())
/// ```
pub struct BlockRegistry<B: Backend> {
    factories: BTreeMap<String, BlockFactory<B>>,
}

impl<B: Backend> Default for BlockRegistry<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> BlockRegistry<B> {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Creates a registry holding the blocks of this crate.
    #[must_use]
    pub fn with_layers() -> Self {
        let mut registry = Self::new();
        registry.factories.insert(CONV_BLOCK.to_owned(), conv_block_factory::<B>);
        registry
            .factories
            .insert(CSP_CONNECT.to_owned(), csp_connect_factory::<B>);
        registry
    }

    /// Registers a factory.
    ///
    /// # Errors
    ///
    /// Returns [`LayerError::DuplicateBlockType`] if the name is taken.
    pub fn register(&mut self, name: impl Into<String>, factory: BlockFactory<B>) -> Result<()> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(LayerError::DuplicateBlockType(name));
        }
        debug!(block = %name, "registered block type");
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Returns true if a factory is registered under the name.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names in sorted order.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Materializes the block a spec describes.
    ///
    /// # Errors
    ///
    /// Returns [`LayerError::UnknownBlockType`] for an unregistered type,
    /// and whatever the factory raises for malformed configurations or
    /// input shapes.
    pub fn materialize(
        &self,
        spec: &BlockSpec,
        inputs: &[TensorShape],
        device: &B::Device,
    ) -> Result<Box<dyn DynBlock<B>>> {
        let factory = self
            .factories
            .get(&spec.block_type)
            .ok_or_else(|| LayerError::UnknownBlockType(spec.block_type.clone()))?;
        factory(spec, inputs, device)
    }
}

/// Validates the input count and converts each input to [`Nhwc`].
///
/// # Errors
///
/// Returns [`LayerError::InputCount`] or a rank error.
pub fn nhwc_inputs(block: &str, inputs: &[TensorShape], expected: usize) -> Result<Vec<Nhwc>> {
    if inputs.len() != expected {
        return Err(LayerError::input_count(block, expected, inputs.len()));
    }
    inputs
        .iter()
        .map(|shape| shape.nhwc().map_err(LayerError::from))
        .collect()
}

fn conv_block_factory<B: Backend>(
    spec: &BlockSpec,
    inputs: &[TensorShape],
    device: &B::Device,
) -> Result<Box<dyn DynBlock<B>>> {
    let config: ConvBlockConfig = spec.parse_config()?;
    let shapes = nhwc_inputs(CONV_BLOCK, inputs, 1)?;
    let block = config.materialize::<B>(shapes[0], device)?;
    let outputs = vec![block.output_shape()];
    Ok(Box::new(RegisteredBlock::new(
        spec.clone(),
        shapes,
        outputs,
        block,
        |block: &ConvBlock<B>, mut inputs| {
            let x = inputs.remove(0);
            Ok(vec![block.try_forward(x)?])
        },
    )))
}

fn csp_connect_factory<B: Backend>(
    spec: &BlockSpec,
    inputs: &[TensorShape],
    device: &B::Device,
) -> Result<Box<dyn DynBlock<B>>> {
    let config: CspConnectConfig = spec.parse_config()?;
    let shapes = nhwc_inputs(CSP_CONNECT, inputs, 2)?;
    let block = config.materialize::<B>(shapes[0], shapes[1], device)?;
    let outputs = vec![block.output_shape()];
    Ok(Box::new(RegisteredBlock::new(
        spec.clone(),
        shapes,
        outputs,
        block,
        |block: &CspConnect<B>, inputs| {
            let mut inputs = inputs.into_iter();
            match (inputs.next(), inputs.next()) {
                (Some(x_prev), Some(x_csp)) => Ok(vec![block.try_forward(x_prev, x_csp)?]),
                _ => Err(LayerError::input_count(CSP_CONNECT, 2, 0)),
            }
        },
    )))
}
