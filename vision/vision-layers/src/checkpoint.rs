//! Weight persistence for materialized blocks.
//!
//! Weights go through Burn's recorders. A JSON manifest written next to
//! them records the block spec and input shapes, which is everything the
//! registry needs to re-materialize an identical block before loading.

use std::path::{Path, PathBuf};

use burn::module::Module;
use burn::prelude::Backend;
use burn::record::{BinFileRecorder, FullPrecisionSettings, PrettyJsonFileRecorder, Recorder};
use serde::{Deserialize, Serialize};
use tracing::debug;
use vision_types::{Nhwc, TensorShape};

use crate::error::{LayerError, Result};
use crate::registry::{BlockRegistry, BlockSpec, DynBlock};

/// Supported checkpoint file formats.
///
/// # Example
///
/// ```
/// use vision_layers::CheckpointFormat;
///
/// let format = CheckpointFormat::from_extension("bin");
/// assert_eq!(format, Some(CheckpointFormat::Binary));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointFormat {
    /// Burn's `BinFileRecorder` at full precision.
    #[default]
    Binary,

    /// Burn's `PrettyJsonFileRecorder`; larger but inspectable.
    Json,
}

impl CheckpointFormat {
    /// Determines format from file extension.
    ///
    /// - `.bin` -> Binary
    /// - `.json` -> Json
    /// - Other -> None
    #[must_use]
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "bin" => Some(Self::Binary),
            "json" => Some(Self::Json),
            _ => None,
        }
    }

    /// Determines format from file path.
    #[must_use]
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(Self::from_extension)
    }

    /// Returns the default file extension for this format.
    #[must_use]
    pub const fn extension(&self) -> &'static str {
        match self {
            Self::Binary => "bin",
            Self::Json => "json",
        }
    }

    /// Returns the format name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Binary => "binary",
            Self::Json => "json",
        }
    }
}

impl std::fmt::Display for CheckpointFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Saves a module's weights to `<path>.<ext>`.
///
/// Returns the full path written.
///
/// # Errors
///
/// Returns [`LayerError::SaveCheckpoint`] if the recorder fails.
pub fn save_checkpoint<B, M>(module: &M, path: &str, format: CheckpointFormat) -> Result<String>
where
    B: Backend,
    M: Module<B>,
{
    let full_path = format!("{}.{}", path, format.extension());
    let record = module.clone().into_record();

    match format {
        CheckpointFormat::Binary => BinFileRecorder::<FullPrecisionSettings>::new()
            .record(record, full_path.clone().into())
            .map_err(|e| LayerError::save_checkpoint(&full_path, e.to_string()))?,
        CheckpointFormat::Json => PrettyJsonFileRecorder::<FullPrecisionSettings>::new()
            .record(record, full_path.clone().into())
            .map_err(|e| LayerError::save_checkpoint(&full_path, e.to_string()))?,
    }

    debug!(path = %full_path, format = %format, "saved checkpoint");
    Ok(full_path)
}

/// Loads weights from `path` (with extension) into a module of the same
/// structure.
///
/// # Errors
///
/// Returns [`LayerError::CheckpointNotFound`] if the file doesn't exist,
/// [`LayerError::UnsupportedFormat`] for an unknown extension and
/// [`LayerError::LoadCheckpoint`] if the recorder fails.
pub fn load_checkpoint<B, M>(module: M, path: &str, device: &B::Device) -> Result<M>
where
    B: Backend,
    M: Module<B>,
{
    let path_obj = Path::new(path);
    if !path_obj.exists() {
        return Err(LayerError::checkpoint_not_found(path));
    }

    let format =
        CheckpointFormat::from_path(path_obj).ok_or_else(|| LayerError::unsupported_format(path))?;

    let loaded = match format {
        CheckpointFormat::Binary => module
            .load_file(path_obj, &BinFileRecorder::<FullPrecisionSettings>::new(), device)
            .map_err(|e| LayerError::load_checkpoint(path, e.to_string()))?,
        CheckpointFormat::Json => module
            .load_file(
                path_obj,
                &PrettyJsonFileRecorder::<FullPrecisionSettings>::new(),
                device,
            )
            .map_err(|e| LayerError::load_checkpoint(path, e.to_string()))?,
    };

    debug!(path, "loaded checkpoint");
    Ok(loaded)
}

/// Everything needed to rebuild a saved block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockManifest {
    /// Block type and configuration.
    pub spec: BlockSpec,

    /// Input shapes the block was materialized for.
    pub input_shapes: Vec<Nhwc>,

    /// Weight file format.
    pub format: CheckpointFormat,

    /// Weight file name, relative to the manifest.
    pub weights: String,
}

impl BlockManifest {
    /// Manifest path for a checkpoint stem.
    #[must_use]
    pub fn path_for(stem: &str) -> PathBuf {
        PathBuf::from(format!("{stem}.manifest.json"))
    }
}

/// Saves a registry-built block: weights plus `<stem>.manifest.json`.
///
/// Returns the manifest path.
///
/// # Errors
///
/// Returns an error if either file cannot be written.
pub fn save_block<B: Backend>(
    block: &dyn DynBlock<B>,
    stem: &str,
    format: CheckpointFormat,
) -> Result<PathBuf> {
    let weights_path = block.save_weights(stem, format)?;
    let weights = Path::new(&weights_path)
        .file_name()
        .and_then(|name| name.to_str())
        .map(str::to_owned)
        .ok_or_else(|| LayerError::save_checkpoint(&weights_path, "invalid file name"))?;

    let manifest = BlockManifest {
        spec: block.spec().clone(),
        input_shapes: block.input_shapes(),
        format,
        weights,
    };
    let manifest_path = BlockManifest::path_for(stem);
    std::fs::write(&manifest_path, serde_json::to_string_pretty(&manifest)?)?;
    debug!(path = %manifest_path.display(), block = %manifest.spec.block_type, "saved block manifest");
    Ok(manifest_path)
}

/// Rebuilds a block from its manifest and loads its weights.
///
/// # Errors
///
/// Returns [`LayerError::CheckpointNotFound`] if the manifest is missing,
/// a serialization error if it is malformed, [`LayerError::LoadCheckpoint`]
/// if the weight file does not match the declared format, and any error the
/// registry or the weight loader raises.
pub fn load_block<B: Backend>(
    registry: &BlockRegistry<B>,
    manifest_path: &Path,
    device: &B::Device,
) -> Result<Box<dyn DynBlock<B>>> {
    if !manifest_path.exists() {
        return Err(LayerError::checkpoint_not_found(
            manifest_path.display().to_string(),
        ));
    }
    let manifest: BlockManifest = serde_json::from_str(&std::fs::read_to_string(manifest_path)?)?;

    let inputs: Vec<TensorShape> = manifest.input_shapes.iter().copied().map(Into::into).collect();
    let block = registry.materialize(&manifest.spec, &inputs, device)?;

    let weights = manifest_path
        .parent()
        .map_or_else(|| PathBuf::from(&manifest.weights), |dir| dir.join(&manifest.weights));
    let weights = weights.display().to_string();
    if CheckpointFormat::from_path(Path::new(&weights)) != Some(manifest.format) {
        return Err(LayerError::load_checkpoint(
            weights,
            format!("manifest declares {} weights", manifest.format),
        ));
    }
    block.load_weights(&weights, device)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_from_extension() {
        assert_eq!(
            CheckpointFormat::from_extension("bin"),
            Some(CheckpointFormat::Binary)
        );
        // Burn's file recorders always read `.bin`.
        assert_eq!(CheckpointFormat::from_extension("burn"), None);
        assert_eq!(
            CheckpointFormat::from_extension("JSON"),
            Some(CheckpointFormat::Json)
        );
        assert_eq!(CheckpointFormat::from_extension("xml"), None);
    }

    #[test]
    fn format_from_path() {
        assert_eq!(
            CheckpointFormat::from_path(Path::new("/ckpt/csp.bin")),
            Some(CheckpointFormat::Binary)
        );
        assert_eq!(
            CheckpointFormat::from_path(Path::new("csp.json")),
            Some(CheckpointFormat::Json)
        );
        assert_eq!(CheckpointFormat::from_path(Path::new("csp")), None);
    }

    #[test]
    fn format_display_and_default() {
        assert_eq!(CheckpointFormat::default(), CheckpointFormat::Binary);
        assert_eq!(CheckpointFormat::Json.to_string(), "json");
        assert_eq!(CheckpointFormat::Binary.extension(), "bin");
    }

    #[test]
    fn manifest_path_for_stem() {
        assert_eq!(
            BlockManifest::path_for("/tmp/csp"),
            PathBuf::from("/tmp/csp.manifest.json")
        );
    }
}
