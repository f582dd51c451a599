//! Model catalogue, cache, inference sessions, and load state.

mod loader;
mod session;
mod state;

pub use loader::{ModelCache, ModelKind, Mode};
pub use session::{
    InferenceBackend, InferenceSession, ModelSource, NamedOutputs, OrtBackend, SessionOptions,
    TensorSpec,
};
pub use state::{ModelHandle, SessionState};
