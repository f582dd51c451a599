//! Image loading, orientation, tensor preprocessing, and saving utilities.

mod load;
mod preprocess;
mod save;

pub use load::{
    apply_orientation, decode_image, load_image, load_image_file, read_orientation, Orientation,
};
pub use preprocess::{preprocess, TensorLayout};
pub use save::save_image;

use ndarray::Array4;

/// Model input tensor, `(1, 3, S, S)` or `(1, S, S, 3)` depending on layout.
/// Values are scaled to [0, 1].
pub type ImageTensor = Array4<f32>;

/// Number of channels in RGB images.
pub const RGB_CHANNELS: usize = 3;
