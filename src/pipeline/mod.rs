//! Segmentation and depth postprocessing, and the pipeline that drives them.

mod analyzer;
mod depth;
mod legend;
mod palette;
mod segmentation;

pub use analyzer::{Analysis, Config, Pipeline, Timings, Visualization};
pub use depth::{depth_map, depth_to_grayscale, postprocess_depth, DepthMap, DEPTH_EPSILON};
pub use legend::{build_legend, distinct_classes, legend_for, LegendEntry};
pub use palette::{Palette, ADE20K_COLORS, ADE20K_LABELS, FALLBACK_COLOR};
pub use segmentation::{
    argmax_classes, blend, colorize, decode_logits, postprocess_segmentation, ClassMap,
    Segmentation, BLEND_ALPHA,
};
