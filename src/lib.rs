//! # visualaid
//!
//! On-device scene understanding for photos: semantic segmentation rendered as
//! a colored overlay with a legend, and monocular depth rendered as grayscale.
//!
//! Photos are decoded upright (EXIF orientation applied), resized to the
//! model's square input, and run through ONNX Runtime. The model loads in the
//! background; requests made before it is ready are rejected, not queued.
//!
//! ## Example
//!
//! ```no_run
//! use std::path::Path;
//! use visualaid::{Config, Pipeline};
//!
//! # fn main() -> visualaid::Result<()> {
//! let pipeline = Pipeline::new(Config::default())?;
//! pipeline.load_bundled_in_background(Path::new("models/segformer.onnx"), |_| {})?;
//! println!("model {}", pipeline.model().wait());
//!
//! let bytes = std::fs::read("street.jpg")?;
//! let (_upright, analysis) = pipeline.analyze_bytes(&bytes)?;
//! for entry in analysis.visualization.legend() {
//!     println!("{} {:?}", entry.label, entry.color);
//! }
//! println!("{}", analysis.timings);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod image;
pub mod model;
pub mod pipeline;

pub use error::{Error, Result};
pub use model::{ModelKind, Mode, SessionState};
pub use pipeline::{Analysis, Config, LegendEntry, Pipeline, Timings, Visualization};
