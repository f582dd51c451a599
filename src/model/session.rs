//! Inference sessions: one loaded model behind a serialized `run`.

use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use ndarray::ArrayD;
use ort::execution_providers::ExecutionProviderDispatch;
use ort::logging::LogLevel;
use ort::session::builder::SessionBuilder;
use ort::session::Session;
use ort::value::{Tensor, ValueType};
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::image::{ImageTensor, TensorLayout};

/// Where a model is loaded from.
#[derive(Clone)]
pub enum ModelSource {
    Path(PathBuf),
    Bytes(Vec<u8>),
}

impl fmt::Debug for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) => f.debug_tuple("Path").field(path).finish(),
            Self::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
        }
    }
}

impl From<PathBuf> for ModelSource {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

impl From<Vec<u8>> for ModelSource {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes)
    }
}

/// Declared name and shape of a model input. Negative extents are dynamic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorSpec {
    pub name: String,
    pub shape: Vec<i64>,
}

impl TensorSpec {
    pub fn new(name: impl Into<String>, shape: impl Into<Vec<i64>>) -> Self {
        Self {
            name: name.into(),
            shape: shape.into(),
        }
    }

    /// Whether a concrete tensor shape satisfies this declaration.
    #[must_use]
    pub fn accepts(&self, shape: &[usize]) -> bool {
        self.shape.len() == shape.len()
            && self
                .shape
                .iter()
                .zip(shape)
                .all(|(&declared, &actual)| declared < 0 || usize::try_from(declared) == Ok(actual))
    }

    /// Static square spatial size, if the declaration fixes one.
    #[must_use]
    pub fn square_size(&self, layout: TensorLayout) -> Option<u32> {
        let (h, w) = match (layout, self.shape.as_slice()) {
            (TensorLayout::ChannelsFirst, [_, _, h, w]) | (TensorLayout::ChannelsLast, [_, h, w, _]) => {
                (*h, *w)
            }
            _ => return None,
        };
        if h == w && h > 0 {
            u32::try_from(h).ok()
        } else {
            None
        }
    }
}

/// Raw model outputs in the order the graph declares them.
#[derive(Debug, Default, Clone)]
pub struct NamedOutputs {
    entries: Vec<(String, ArrayD<f32>)>,
}

impl NamedOutputs {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: ArrayD<f32>) {
        self.entries.push((name.into(), value));
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ArrayD<f32>> {
        self.entries
            .iter()
            .find(|(entry, _)| entry == name)
            .map(|(_, value)| value)
    }

    #[must_use]
    pub fn first(&self) -> Option<&ArrayD<f32>> {
        self.entries.first().map(|(_, value)| value)
    }

    /// Take ownership of the first output.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShapeMismatch`] if the model produced no outputs.
    pub fn into_first(self) -> Result<ArrayD<f32>> {
        self.entries
            .into_iter()
            .next()
            .map(|(_, value)| value)
            .ok_or_else(|| Error::shape_mismatch("at least one output", "no output"))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A runtime able to execute one loaded model.
///
/// Implementations only run the forward pass; input validation happens in
/// [`InferenceSession::run`].
pub trait InferenceBackend: Send {
    /// Declared model inputs.
    fn inputs(&self) -> &[TensorSpec];

    /// Run one forward pass and return every output as `f32`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Inference`] on runtime failures.
    fn forward(&mut self, input_name: &str, input: ImageTensor) -> Result<NamedOutputs>;
}

/// Runtime tuning for a session. None of these change numerical results.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Register accelerated execution providers when compiled in and available.
    pub acceleration: bool,
    /// Intra-op thread count. `None` keeps the runtime default.
    pub intra_threads: Option<usize>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            acceleration: true,
            intra_threads: None,
        }
    }
}

/// ONNX Runtime backend.
pub struct OrtBackend {
    session: Session,
    inputs: Vec<TensorSpec>,
}

impl OrtBackend {
    /// Build an ONNX Runtime session for `source`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ModelLoad`] if the file is missing, corrupt, or rejected
    /// by the runtime.
    pub fn load(source: &ModelSource, name: &str, options: &SessionOptions) -> Result<Self> {
        if let ModelSource::Path(path) = source {
            if !path.exists() {
                return Err(Error::model_load(
                    name,
                    std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("{} does not exist", path.display()),
                    ),
                ));
            }
        }

        let builder = Session::builder()
            .and_then(|builder| configure(builder, options))
            .map_err(|e| Error::model_load(name, e))?;

        let session = match source {
            ModelSource::Path(path) => builder.commit_from_file(path),
            ModelSource::Bytes(bytes) => builder.commit_from_memory(bytes),
        }
        .map_err(|e| Error::model_load(name, e))?;

        let inputs = session
            .inputs
            .iter()
            .map(|input| TensorSpec::new(input.name.clone(), tensor_shape(&input.input_type)))
            .collect::<Vec<_>>();

        tracing::debug!("Model {name} inputs: {inputs:?}");
        tracing::debug!(
            "Model {name} outputs: {:?}",
            session.outputs.iter().map(|o| o.name.as_str()).collect::<Vec<_>>()
        );

        Ok(Self { session, inputs })
    }
}

impl InferenceBackend for OrtBackend {
    fn inputs(&self) -> &[TensorSpec] {
        &self.inputs
    }

    #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    fn forward(&mut self, input_name: &str, input: ImageTensor) -> Result<NamedOutputs> {
        let value = Tensor::from_array(input).map_err(Error::inference)?;

        let outputs = self
            .session
            .run(ort::inputs![input_name => value])
            .map_err(Error::inference)?;

        let mut named = NamedOutputs::new();
        for (name, output) in outputs.iter() {
            let (shape, data) = output
                .try_extract_tensor::<f32>()
                .map_err(Error::inference)?;

            // Safe: runtime output extents are non-negative
            let dims: Vec<usize> = shape.iter().map(|&d| d as usize).collect();
            let array = ArrayD::from_shape_vec(dims.clone(), data.to_vec())
                .map_err(|_| Error::shape_mismatch(format!("{dims:?}"), "reshape failed"))?;
            named.push(name, array);
        }

        Ok(named)
    }
}

fn tensor_shape(value_type: &ValueType) -> Vec<i64> {
    match value_type {
        ValueType::Tensor { shape, .. } => shape.to_vec(),
        _ => Vec::new(),
    }
}

fn configure(builder: SessionBuilder, options: &SessionOptions) -> ort::Result<SessionBuilder> {
    let mut builder = builder.with_log_level(LogLevel::Error)?;

    if let Some(threads) = options.intra_threads {
        builder = builder.with_intra_threads(threads)?;
    }

    if options.acceleration {
        let providers = accelerated_providers();
        if providers.is_empty() {
            tracing::debug!("No accelerated execution provider available, using CPU");
        } else {
            // Providers that fail to register fall back to CPU inside ort.
            builder = builder.with_execution_providers(providers)?;
        }
    }

    Ok(builder)
}

#[allow(unused_mut)]
fn accelerated_providers() -> Vec<ExecutionProviderDispatch> {
    let mut providers = Vec::new();

    #[cfg(feature = "nnapi")]
    push_if_available(
        &mut providers,
        ort::execution_providers::NNAPIExecutionProvider::default(),
        "NNAPI",
    );

    #[cfg(feature = "coreml")]
    push_if_available(
        &mut providers,
        ort::execution_providers::CoreMLExecutionProvider::default(),
        "CoreML",
    );

    #[cfg(feature = "cuda")]
    push_if_available(
        &mut providers,
        ort::execution_providers::CUDAExecutionProvider::default(),
        "CUDA",
    );

    providers
}

#[cfg(any(feature = "nnapi", feature = "coreml", feature = "cuda"))]
fn push_if_available<E>(providers: &mut Vec<ExecutionProviderDispatch>, provider: E, label: &str)
where
    E: ort::execution_providers::ExecutionProvider + Into<ExecutionProviderDispatch>,
{
    match provider.is_available() {
        Ok(true) => {
            tracing::info!("{label} enabled for ONNX Runtime");
            providers.push(provider.into());
        }
        Ok(false) => tracing::debug!("{label} not available"),
        Err(e) => tracing::warn!("Could not query {label} availability: {e}"),
    }
}

/// A loaded model with a validated, serialized `run`.
///
/// The session is shared read-only after load. Overlapping `run` calls are
/// queued on an internal mutex so only one forward pass is in flight.
pub struct InferenceSession {
    name: String,
    input: TensorSpec,
    backend: Mutex<Box<dyn InferenceBackend>>,
}

impl fmt::Debug for InferenceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InferenceSession")
            .field("name", &self.name)
            .field("input", &self.input)
            .finish_non_exhaustive()
    }
}

impl InferenceSession {
    /// Load a model with ONNX Runtime.
    ///
    /// This blocks for the whole graph construction; run it off the
    /// foreground thread (see [`crate::model::ModelHandle::spawn_load`]).
    ///
    /// # Errors
    ///
    /// Returns [`Error::ModelLoad`] if the model cannot be loaded.
    pub fn load(source: &ModelSource, name: &str, options: &SessionOptions) -> Result<Self> {
        let backend = OrtBackend::load(source, name, options)?;
        Self::from_backend(name, Box::new(backend))
    }

    /// Wrap an already loaded backend.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShapeMismatch`] if the backend declares no inputs.
    pub fn from_backend(name: impl Into<String>, backend: Box<dyn InferenceBackend>) -> Result<Self> {
        let input = backend
            .inputs()
            .first()
            .cloned()
            .ok_or_else(|| Error::shape_mismatch("one model input", "no inputs"))?;

        Ok(Self {
            name: name.into(),
            input,
            backend: Mutex::new(backend),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Primary input declaration.
    #[must_use]
    pub fn input(&self) -> &TensorSpec {
        &self.input
    }

    /// Input layout the model declares, when its shape makes it unambiguous.
    #[must_use]
    pub fn input_layout(&self) -> Option<TensorLayout> {
        TensorLayout::from_input_shape(&self.input.shape)
    }

    /// Run one forward pass.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShapeMismatch`] if `input_name` is unknown or `tensor`
    /// disagrees with the declared shape, and [`Error::Inference`] on runtime
    /// failures.
    pub fn run(&self, input_name: &str, tensor: ImageTensor) -> Result<NamedOutputs> {
        self.run_timed(input_name, tensor).map(|(outputs, _)| outputs)
    }

    /// Like [`InferenceSession::run`], also returning how long the forward
    /// pass took. Time spent queued behind other callers is not counted.
    ///
    /// # Errors
    ///
    /// As [`InferenceSession::run`].
    pub fn run_timed(
        &self,
        input_name: &str,
        tensor: ImageTensor,
    ) -> Result<(NamedOutputs, Duration)> {
        let mut backend = self.backend.lock();
        let started = Instant::now();

        let spec = backend
            .inputs()
            .iter()
            .find(|spec| spec.name == input_name)
            .ok_or_else(|| {
                Error::shape_mismatch(
                    format!("input named {}", self.input.name),
                    format!("input named {input_name}"),
                )
            })?;

        if !spec.accepts(tensor.shape()) {
            tracing::error!(
                "Input {input_name} of {} expects {:?}, got {:?}",
                self.name,
                spec.shape,
                tensor.shape()
            );
            return Err(Error::shape_mismatch(
                format!("{:?}", spec.shape),
                format!("{:?}", tensor.shape()),
            ));
        }

        let outputs = backend.forward(input_name, tensor)?;
        Ok((outputs, started.elapsed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array4, IxDyn};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc, Arc};

    struct EchoBackend {
        inputs: Vec<TensorSpec>,
        calls: Arc<AtomicUsize>,
    }

    impl InferenceBackend for EchoBackend {
        fn inputs(&self) -> &[TensorSpec] {
            &self.inputs
        }

        fn forward(&mut self, _input_name: &str, input: ImageTensor) -> Result<NamedOutputs> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut outputs = NamedOutputs::new();
            outputs.push("echo", input.into_dyn());
            Ok(outputs)
        }
    }

    fn echo_session(shape: &[i64]) -> (InferenceSession, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let backend = EchoBackend {
            inputs: vec![TensorSpec::new("pixel_values", shape.to_vec())],
            calls: Arc::clone(&calls),
        };
        let session = InferenceSession::from_backend("echo", Box::new(backend)).expect("session");
        (session, calls)
    }

    #[test]
    fn test_spec_accepts_exact_and_dynamic() {
        let fixed = TensorSpec::new("x", vec![1, 3, 4, 4]);
        assert!(fixed.accepts(&[1, 3, 4, 4]));
        assert!(!fixed.accepts(&[1, 3, 4, 5]));
        assert!(!fixed.accepts(&[3, 4, 4]));

        let dynamic = TensorSpec::new("x", vec![-1, 3, -1, -1]);
        assert!(dynamic.accepts(&[2, 3, 8, 9]));
        assert!(!dynamic.accepts(&[1, 4, 8, 8]));
    }

    #[test]
    fn test_square_size() {
        let nchw = TensorSpec::new("x", vec![1, 3, 512, 512]);
        assert_eq!(nchw.square_size(TensorLayout::ChannelsFirst), Some(512));
        let nhwc = TensorSpec::new("x", vec![1, 518, 518, 3]);
        assert_eq!(nhwc.square_size(TensorLayout::ChannelsLast), Some(518));
        let dynamic = TensorSpec::new("x", vec![1, 3, -1, -1]);
        assert_eq!(dynamic.square_size(TensorLayout::ChannelsFirst), None);
    }

    #[test]
    fn test_run_passes_matching_tensor() {
        let (session, calls) = echo_session(&[1, 3, 4, 4]);
        assert_eq!(session.input_layout(), Some(TensorLayout::ChannelsFirst));

        let outputs = session
            .run("pixel_values", Array4::<f32>::ones((1, 3, 4, 4)))
            .expect("run");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outputs.names().collect::<Vec<_>>(), vec!["echo"]);
        assert_eq!(outputs.get("echo").map(|a| a.shape()), Some(&[1, 3, 4, 4][..]));
        assert_eq!(
            outputs.into_first().expect("output").dim(),
            IxDyn(&[1, 3, 4, 4])
        );
    }

    #[test]
    fn test_run_rejects_wrong_shape_without_calling_backend() {
        let (session, calls) = echo_session(&[1, 3, 4, 4]);
        let err = session
            .run("pixel_values", Array4::<f32>::zeros((1, 3, 5, 5)))
            .unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_run_rejects_unknown_input_name() {
        let (session, _) = echo_session(&[1, 3, 4, 4]);
        let err = session
            .run("images", Array4::<f32>::zeros((1, 3, 4, 4)))
            .unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
    }

    #[test]
    fn test_backend_without_inputs_is_rejected() {
        let backend = EchoBackend {
            inputs: Vec::new(),
            calls: Arc::new(AtomicUsize::new(0)),
        };
        assert!(InferenceSession::from_backend("empty", Box::new(backend)).is_err());
    }

    /// Records how many forward passes overlap.
    struct SlowBackend {
        inputs: Vec<TensorSpec>,
        in_flight: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl InferenceBackend for SlowBackend {
        fn inputs(&self) -> &[TensorSpec] {
            &self.inputs
        }

        fn forward(&mut self, _input_name: &str, input: ImageTensor) -> Result<NamedOutputs> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(10));
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let mut outputs = NamedOutputs::new();
            outputs.push("out", input.into_dyn());
            Ok(outputs)
        }
    }

    #[test]
    fn test_concurrent_runs_are_serialized() {
        let peak = Arc::new(AtomicUsize::new(0));
        let backend = SlowBackend {
            inputs: vec![TensorSpec::new("pixel_values", vec![1, 3, 2, 2])],
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: Arc::clone(&peak),
        };
        let session =
            Arc::new(InferenceSession::from_backend("slow", Box::new(backend)).expect("session"));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let session = Arc::clone(&session);
                std::thread::spawn(move || {
                    session
                        .run("pixel_values", Array4::<f32>::zeros((1, 3, 2, 2)))
                        .map(|outputs| outputs.len())
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().expect("join").expect("run"), 1);
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    /// Blocks its first forward pass until released.
    struct GatedBackend {
        inputs: Vec<TensorSpec>,
        entered: mpsc::Sender<()>,
        gate: Option<mpsc::Receiver<()>>,
    }

    impl InferenceBackend for GatedBackend {
        fn inputs(&self) -> &[TensorSpec] {
            &self.inputs
        }

        fn forward(&mut self, _input_name: &str, _input: ImageTensor) -> Result<NamedOutputs> {
            if let Some(gate) = self.gate.take() {
                self.entered.send(()).expect("entered");
                gate.recv().expect("gate");
            }
            Ok(NamedOutputs::new())
        }
    }

    #[test]
    fn test_run_timed_excludes_queueing() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (gate_tx, gate_rx) = mpsc::channel();
        let backend = GatedBackend {
            inputs: vec![TensorSpec::new("x", vec![1, 3, 2, 2])],
            entered: entered_tx,
            gate: Some(gate_rx),
        };
        let session =
            Arc::new(InferenceSession::from_backend("gated", Box::new(backend)).expect("session"));

        let first = {
            let session = Arc::clone(&session);
            std::thread::spawn(move || {
                session.run_timed("x", Array4::<f32>::zeros((1, 3, 2, 2)))
            })
        };
        entered_rx.recv().expect("first pass started");

        let queued = {
            let session = Arc::clone(&session);
            std::thread::spawn(move || {
                let started = Instant::now();
                let (_, forward) = session
                    .run_timed("x", Array4::<f32>::zeros((1, 3, 2, 2)))
                    .expect("queued run");
                (forward, started.elapsed())
            })
        };

        std::thread::sleep(Duration::from_millis(150));
        gate_tx.send(()).expect("release");

        let (_, first_forward) = first.join().expect("join").expect("first run");
        assert!(first_forward >= Duration::from_millis(100));

        let (forward, waited) = queued.join().expect("join");
        assert!(waited >= Duration::from_millis(100));
        assert!(forward < Duration::from_millis(100), "forward took {forward:?}");
    }

    #[test]
    fn test_missing_model_file_is_model_load_error() {
        let source = ModelSource::Path(PathBuf::from("/nonexistent/visualaid/model.onnx"));
        let err = InferenceSession::load(&source, "model.onnx", &SessionOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::ModelLoad { .. }));
    }

    #[test]
    fn test_model_source_debug_hides_bytes() {
        let source = ModelSource::from(vec![0u8; 16]);
        assert_eq!(format!("{source:?}"), "Bytes(16 bytes)");
    }
}
