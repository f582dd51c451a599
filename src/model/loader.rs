//! Model catalogue and the local model cache.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::image::TensorLayout;

/// Postprocessing path a model feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Per-pixel class ids, rendered as a blended overlay plus legend.
    Segmentation,
    /// Per-pixel relative depth, rendered as grayscale.
    Depth,
}

/// Models the pipeline knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    /// SegFormer-B2 fine-tuned on ADE20K (150 classes).
    Segformer,
    /// Depth Anything V2 small, channel-first input.
    DepthAnything,
    /// Depth Anything export that takes channel-last input.
    DepthAnythingChannelLast,
}

impl ModelKind {
    /// Get the bundled artifact filename for this model.
    #[must_use]
    pub const fn filename(&self) -> &'static str {
        match self {
            Self::Segformer => "segformer-b2-finetuned-ade-512-512.onnx",
            Self::DepthAnything => "depth_anything_v2_vits.onnx",
            Self::DepthAnythingChannelLast => "depth_anything_nhwc.onnx",
        }
    }

    /// Side of the square input the model was exported with.
    #[must_use]
    pub const fn input_size(&self) -> u32 {
        match self {
            Self::Segformer => 512,
            Self::DepthAnything | Self::DepthAnythingChannelLast => 518,
        }
    }

    /// Input layout assumed when the model does not declare one.
    #[must_use]
    pub const fn layout(&self) -> TensorLayout {
        match self {
            Self::Segformer | Self::DepthAnything => TensorLayout::ChannelsFirst,
            Self::DepthAnythingChannelLast => TensorLayout::ChannelsLast,
        }
    }

    #[must_use]
    pub const fn mode(&self) -> Mode {
        match self {
            Self::Segformer => Mode::Segmentation,
            Self::DepthAnything | Self::DepthAnythingChannelLast => Mode::Depth,
        }
    }
}

/// Local, writable copies of bundled model artifacts.
///
/// Runtimes open models by path, so a bundled artifact is copied into the
/// cache once and reused afterwards.
#[derive(Debug, Clone)]
pub struct ModelCache {
    cache_dir: PathBuf,
}

impl ModelCache {
    /// Create a cache in the platform cache directory.
    ///
    /// - Windows: `%LOCALAPPDATA%\visualaid\models`
    /// - Linux: `~/.cache/visualaid/models`
    /// - macOS: `~/Library/Caches/visualaid/models`
    ///
    /// # Errors
    ///
    /// Returns an error if the cache directory cannot be created.
    pub fn new() -> Result<Self> {
        let base = dirs::cache_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::at(base.join("visualaid").join("models"))
    }

    /// Create a cache rooted at `cache_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn at<P: Into<PathBuf>>(cache_dir: P) -> Result<Self> {
        let cache_dir = cache_dir.into();

        fs::create_dir_all(&cache_dir).map_err(|source| Error::CacheDir {
            path: cache_dir.clone(),
            source,
        })?;

        Ok(Self { cache_dir })
    }

    #[must_use]
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Where the cached copy of `kind` lives, whether or not it exists yet.
    #[must_use]
    pub fn model_path(&self, kind: ModelKind) -> PathBuf {
        self.cache_dir.join(kind.filename())
    }

    /// Copy a bundled artifact into the cache unless a copy already exists.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ModelLoad`] if the bundled artifact cannot be read, or
    /// an IO error if the copy cannot be written.
    pub fn materialize(&self, kind: ModelKind, bundled: &Path) -> Result<PathBuf> {
        let path = self.model_path(kind);

        if path.exists() {
            tracing::debug!("Using cached model {}", path.display());
            return Ok(path);
        }

        tracing::info!("Copying {} into model cache", bundled.display());
        let mut source =
            fs::File::open(bundled).map_err(|e| Error::model_load(kind.filename(), e))?;
        write_atomically(&path, |file| std::io::copy(&mut source, file).map(|_| ()))?;

        Ok(path)
    }

    /// Write in-memory model bytes into the cache unless a copy already exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the copy cannot be written.
    pub fn materialize_bytes(&self, kind: ModelKind, bytes: &[u8]) -> Result<PathBuf> {
        let path = self.model_path(kind);

        if path.exists() {
            tracing::debug!("Using cached model {}", path.display());
            return Ok(path);
        }

        tracing::info!("Writing {} ({} bytes) into model cache", kind.filename(), bytes.len());
        write_atomically(&path, |file| file.write_all(bytes))?;

        Ok(path)
    }
}

/// Write to a temporary file first, then rename, so a partial copy is never
/// mistaken for a cached model.
fn write_atomically<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(&mut fs::File) -> std::io::Result<()>,
{
    let temp_path = path.with_extension("tmp");
    let mut file = fs::File::create(&temp_path)?;

    if let Err(err) = write(&mut file).and_then(|()| file.sync_all()) {
        drop(file);
        let _ = fs::remove_file(&temp_path);
        return Err(err.into());
    }
    drop(file);

    fs::rename(&temp_path, path)?;
    Ok(())
}
