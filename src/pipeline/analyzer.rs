//! Segmentation and depth analysis pipeline.

use std::fmt;
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use image::RgbImage;

use crate::error::{Error, Result};
use crate::image::{load_image, preprocess};
use crate::model::{
    InferenceSession, ModelCache, ModelHandle, ModelKind, ModelSource, Mode, SessionOptions,
    SessionState,
};

use super::depth::postprocess_depth;
use super::legend::LegendEntry;
use super::palette::Palette;
use super::segmentation::{postprocess_segmentation, ClassMap, BLEND_ALPHA};

/// Configuration for the analysis pipeline.
#[derive(Debug, Clone)]
pub struct Config {
    /// Which model to drive. Also selects segmentation or depth output.
    pub model: ModelKind,

    /// Mask weight for the segmentation overlay (0.0-1.0).
    pub blend_alpha: f32,

    /// Use an accelerated execution provider when one is available.
    pub acceleration: bool,

    /// Intra-op threads for the runtime. None keeps the runtime default.
    pub intra_threads: Option<usize>,

    /// Model cache directory. None uses the platform cache directory.
    pub cache_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: ModelKind::Segformer,
            blend_alpha: BLEND_ALPHA,
            acceleration: true,
            intra_threads: None,
            cache_dir: None,
        }
    }
}

impl Config {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any parameter is out of valid range.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.blend_alpha) {
            return Err(Error::InvalidParameter {
                name: "blend_alpha".to_string(),
                reason: "must be between 0.0 and 1.0".to_string(),
            });
        }

        if self.intra_threads == Some(0) {
            return Err(Error::InvalidParameter {
                name: "intra_threads".to_string(),
                reason: "must be greater than 0".to_string(),
            });
        }

        Ok(())
    }

    #[must_use]
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            acceleration: self.acceleration,
            intra_threads: self.intra_threads,
        }
    }

    fn model_cache(&self) -> Result<ModelCache> {
        match &self.cache_dir {
            Some(dir) => ModelCache::at(dir),
            None => ModelCache::new(),
        }
    }
}

/// Visual artifact handed to the renderer.
#[derive(Debug, Clone)]
pub enum Visualization {
    Segmentation {
        overlay: RgbImage,
        legend: Vec<LegendEntry>,
        class_map: ClassMap,
    },
    Depth {
        depth: RgbImage,
    },
}

impl Visualization {
    /// The image to display: the overlay or the grayscale depth map.
    #[must_use]
    pub const fn image(&self) -> &RgbImage {
        match self {
            Self::Segmentation { overlay, .. } => overlay,
            Self::Depth { depth } => depth,
        }
    }

    /// Legend entries; empty in depth mode.
    #[must_use]
    pub fn legend(&self) -> &[LegendEntry] {
        match self {
            Self::Segmentation { legend, .. } => legend,
            Self::Depth { .. } => &[],
        }
    }
}

/// Wall-clock durations of one analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    /// The forward pass alone.
    pub inference: Duration,
    /// Preprocessing, inference, and postprocessing.
    pub total: Duration,
}

impl Timings {
    #[must_use]
    pub fn inference_text(&self) -> String {
        format!("Inference time: {:.2} seconds", self.inference.as_secs_f32())
    }

    #[must_use]
    pub fn total_text(&self) -> String {
        format!("Total time: {:.2} seconds", self.total.as_secs_f32())
    }
}

impl fmt::Display for Timings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {}", self.inference_text(), self.total_text())
    }
}

/// Output of [`Pipeline::analyze`].
#[derive(Debug, Clone)]
pub struct Analysis {
    pub visualization: Visualization,
    pub timings: Timings,
}

/// Runs one model over photos and renders the result.
///
/// The model loads in the background; until it is ready, [`Pipeline::analyze`]
/// fails with [`Error::NotReady`] and the caller decides when to retry.
pub struct Pipeline {
    config: Config,
    palette: Palette,
    model: ModelHandle,
}

impl Pipeline {
    /// Create a pipeline whose model is not loaded yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        tracing::info!("Initializing pipeline with config: {config:?}");

        let model = ModelHandle::new(config.model.filename());
        Ok(Self {
            config,
            palette: Palette::ade20k(),
            model,
        })
    }

    /// Create a pipeline around an already loaded session.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn with_session(config: Config, session: InferenceSession) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            palette: Palette::ade20k(),
            model: ModelHandle::ready(session),
        })
    }

    /// Replace the class palette used for segmentation.
    #[must_use]
    pub fn with_palette(mut self, palette: Palette) -> Self {
        self.palette = palette;
        self
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Handle for observing or waiting on the model state.
    #[must_use]
    pub const fn model(&self) -> &ModelHandle {
        &self.model
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.model.state()
    }

    /// Load the model from `source` on a background thread.
    ///
    /// `on_complete` runs on the loader thread once the state settles.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LoadInProgress`] if a load is already running.
    pub fn load_in_background<C>(&self, source: ModelSource, on_complete: C) -> Result<JoinHandle<()>>
    where
        C: FnOnce(&SessionState) + Send + 'static,
    {
        let name = self.config.model.filename();
        let options = self.config.session_options();
        self.model.spawn_load(
            move || InferenceSession::load(&source, name, &options),
            on_complete,
        )
    }

    /// Copy a bundled model into the cache and load it, both on a background
    /// thread.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LoadInProgress`] if a load is already running.
    pub fn load_bundled_in_background<C>(&self, bundled: &Path, on_complete: C) -> Result<JoinHandle<()>>
    where
        C: FnOnce(&SessionState) + Send + 'static,
    {
        let kind = self.config.model;
        let options = self.config.session_options();
        let config = self.config.clone();
        let bundled = bundled.to_path_buf();

        self.model.spawn_load(
            move || {
                let path = config.model_cache()?.materialize(kind, &bundled)?;
                InferenceSession::load(&ModelSource::Path(path), kind.filename(), &options)
            },
            on_complete,
        )
    }

    /// Run the model over an upright image.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotReady`] while the model is not loaded,
    /// [`Error::ShapeMismatch`] if the model breaks its tensor contract, and
    /// [`Error::Inference`] on runtime failures.
    pub fn analyze(&self, image: &RgbImage) -> Result<Analysis> {
        let session = self.model.session()?;
        let kind = self.config.model;

        let total_start = Instant::now();

        let layout = session.input_layout().unwrap_or_else(|| kind.layout());
        let size = session
            .input()
            .square_size(layout)
            .unwrap_or_else(|| kind.input_size());
        let tensor = preprocess(image, size, layout);

        let (outputs, inference) = session.run_timed(&session.input().name, tensor)?;

        let raw = outputs.into_first()?;
        tracing::debug!("Raw output shape: {:?}", raw.shape());

        let visualization = match kind.mode() {
            Mode::Segmentation => {
                let segmentation = postprocess_segmentation(
                    &raw,
                    image,
                    &self.palette,
                    self.config.blend_alpha,
                )?;
                Visualization::Segmentation {
                    overlay: segmentation.overlay,
                    legend: segmentation.legend,
                    class_map: segmentation.class_map,
                }
            }
            Mode::Depth => Visualization::Depth {
                depth: postprocess_depth(&raw, image.dimensions())?,
            },
        };

        let timings = Timings {
            inference,
            total: total_start.elapsed(),
        };
        tracing::info!("{timings}");

        Ok(Analysis {
            visualization,
            timings,
        })
    }

    /// Decode image bytes (honoring EXIF orientation) and analyze them.
    ///
    /// Returns the upright image alongside the analysis so the caller can show
    /// both.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] for unreadable bytes, otherwise as
    /// [`Pipeline::analyze`].
    pub fn analyze_bytes(&self, bytes: &[u8]) -> Result<(RgbImage, Analysis)> {
        let image = load_image(bytes)?;
        let analysis = self.analyze(&image)?;
        Ok((image, analysis))
    }
}
