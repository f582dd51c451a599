//! Model readiness tracking and background loading.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};

use super::session::InferenceSession;

/// Lifecycle of a model handle. Only the load task moves it forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Unloaded,
    Loading,
    Ready,
    Failed(String),
}

impl SessionState {
    /// Whether a load is finished, successfully or not.
    #[must_use]
    pub const fn is_settled(&self) -> bool {
        matches!(self, Self::Ready | Self::Failed(_))
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unloaded => f.write_str("unloaded"),
            Self::Loading => f.write_str("loading"),
            Self::Ready => f.write_str("ready"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

struct Slot {
    state: SessionState,
    session: Option<Arc<InferenceSession>>,
}

struct Shared {
    name: String,
    slot: Mutex<Slot>,
    changed: Condvar,
}

/// Shared handle to a model that may still be loading.
///
/// Cloning is cheap; every clone observes the same state. Inference requests
/// made before the model is ready are rejected with [`Error::NotReady`]
/// instead of blocking.
#[derive(Clone)]
pub struct ModelHandle {
    shared: Arc<Shared>,
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle")
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .finish()
    }
}

impl ModelHandle {
    /// Create an unloaded handle.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                slot: Mutex::new(Slot {
                    state: SessionState::Unloaded,
                    session: None,
                }),
                changed: Condvar::new(),
            }),
        }
    }

    /// Create a handle around an already loaded session.
    #[must_use]
    pub fn ready(session: InferenceSession) -> Self {
        let handle = Self::new(session.name());
        handle.settle(Ok(session));
        handle
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.shared.slot.lock().state.clone()
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Ready
    }

    /// Get the loaded session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotReady`] unless the handle is [`SessionState::Ready`].
    pub fn session(&self) -> Result<Arc<InferenceSession>> {
        let slot = self.shared.slot.lock();
        match (&slot.state, &slot.session) {
            (SessionState::Ready, Some(session)) => Ok(Arc::clone(session)),
            (state, _) => Err(Error::NotReady {
                state: state.to_string(),
            }),
        }
    }

    /// Load on a background thread.
    ///
    /// The state becomes [`SessionState::Loading`] immediately and settles to
    /// `Ready` or `Failed` when `load` returns. `on_complete` runs on the
    /// loader thread after the state is published. A failed model can be
    /// loaded again; a ready one is replaced.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LoadInProgress`] if a load is already running, or an
    /// IO error if the thread cannot be spawned.
    pub fn spawn_load<F, C>(&self, load: F, on_complete: C) -> Result<JoinHandle<()>>
    where
        F: FnOnce() -> Result<InferenceSession> + Send + 'static,
        C: FnOnce(&SessionState) + Send + 'static,
    {
        self.begin_load()?;

        let handle = self.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("load-{}", self.name()))
            .spawn(move || {
                let started = Instant::now();
                let outcome = match panic::catch_unwind(AssertUnwindSafe(load)) {
                    Ok(result) => result.map_err(|err| err.to_string()),
                    Err(_) => Err("loader panicked".to_string()),
                };
                tracing::debug!("Load of {} took {:?}", handle.name(), started.elapsed());

                let state = handle.settle(outcome);
                on_complete(&state);
            });

        spawned.map_err(|err| {
            self.settle(Err(format!("could not start loader thread: {err}")));
            Error::Io(err)
        })
    }

    /// Load on the calling thread.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LoadInProgress`] if a background load is running, or
    /// the error produced by `load` (the handle is then `Failed`).
    pub fn load_blocking<F>(&self, load: F) -> Result<Arc<InferenceSession>>
    where
        F: FnOnce() -> Result<InferenceSession>,
    {
        self.begin_load()?;
        match load() {
            Ok(session) => {
                self.settle(Ok(session));
                self.session()
            }
            Err(err) => {
                self.settle(Err(err.to_string()));
                Err(err)
            }
        }
    }

    /// Block until no load is in flight and return the settled state.
    #[must_use]
    pub fn wait(&self) -> SessionState {
        let mut slot = self.shared.slot.lock();
        while slot.state == SessionState::Loading {
            self.shared.changed.wait(&mut slot);
        }
        slot.state.clone()
    }

    /// Like [`ModelHandle::wait`] but gives up after `timeout`, returning the
    /// state at that moment.
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> SessionState {
        let deadline = Instant::now() + timeout;
        let mut slot = self.shared.slot.lock();
        while slot.state == SessionState::Loading {
            if self
                .shared
                .changed
                .wait_until(&mut slot, deadline)
                .timed_out()
            {
                break;
            }
        }
        slot.state.clone()
    }

    fn begin_load(&self) -> Result<()> {
        let mut slot = self.shared.slot.lock();
        if slot.state == SessionState::Loading {
            return Err(Error::LoadInProgress {
                name: self.shared.name.clone(),
            });
        }
        slot.state = SessionState::Loading;
        slot.session = None;
        drop(slot);

        tracing::info!("Loading model {}...", self.shared.name);
        Ok(())
    }

    fn settle(&self, outcome: std::result::Result<InferenceSession, String>) -> SessionState {
        let mut slot = self.shared.slot.lock();
        match outcome {
            Ok(session) => {
                tracing::info!("Model {} loaded successfully", self.shared.name);
                slot.session = Some(Arc::new(session));
                slot.state = SessionState::Ready;
            }
            Err(reason) => {
                tracing::error!("Failed to load model {}: {reason}", self.shared.name);
                slot.session = None;
                slot.state = SessionState::Failed(reason);
            }
        }
        let state = slot.state.clone();
        drop(slot);

        self.shared.changed.notify_all();
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ImageTensor;
    use crate::model::session::{InferenceBackend, NamedOutputs, TensorSpec};
    use std::sync::mpsc;

    struct NullBackend {
        inputs: Vec<TensorSpec>,
    }

    impl InferenceBackend for NullBackend {
        fn inputs(&self) -> &[TensorSpec] {
            &self.inputs
        }

        fn forward(&mut self, _input_name: &str, _input: ImageTensor) -> Result<NamedOutputs> {
            Ok(NamedOutputs::new())
        }
    }

    fn null_session() -> Result<InferenceSession> {
        InferenceSession::from_backend(
            "null",
            Box::new(NullBackend {
                inputs: vec![TensorSpec::new("x", vec![1, 3, 2, 2])],
            }),
        )
    }

    #[test]
    fn test_unloaded_rejects_requests() {
        let handle = ModelHandle::new("seg");
        assert_eq!(handle.state(), SessionState::Unloaded);
        let err = handle.session().unwrap_err();
        assert!(matches!(err, Error::NotReady { .. }));
    }

    #[test]
    fn test_loading_rejects_then_becomes_ready() {
        let handle = ModelHandle::new("seg");
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (done_tx, done_rx) = mpsc::channel();

        let join = handle
            .spawn_load(
                move || {
                    release_rx.recv().expect("release");
                    null_session()
                },
                move |state| done_tx.send(state.clone()).expect("notify"),
            )
            .expect("spawn");

        assert_eq!(handle.state(), SessionState::Loading);
        assert!(matches!(
            handle.session().unwrap_err(),
            Error::NotReady { .. }
        ));
        assert!(matches!(
            handle.spawn_load(null_session, |_| {}).unwrap_err(),
            Error::LoadInProgress { .. }
        ));

        release_tx.send(()).expect("release loader");
        assert_eq!(handle.wait(), SessionState::Ready);
        assert_eq!(done_rx.recv().expect("completion"), SessionState::Ready);
        join.join().expect("loader thread");

        assert!(handle.session().is_ok());
    }

    #[test]
    fn test_failed_load_can_be_retried() {
        let handle = ModelHandle::new("depth");

        let err = handle
            .load_blocking(|| {
                Err(Error::InvalidParameter {
                    name: "model".to_string(),
                    reason: "corrupt".to_string(),
                })
            })
            .unwrap_err();
        assert!(matches!(err, Error::InvalidParameter { .. }));
        assert!(matches!(handle.state(), SessionState::Failed(_)));
        assert!(handle.session().is_err());

        handle.load_blocking(null_session).expect("retry");
        assert!(handle.is_ready());
    }

    #[test]
    fn test_panicking_loader_settles_as_failed() {
        let handle = ModelHandle::new("seg");
        let join = handle
            .spawn_load(|| panic!("boom"), |_| {})
            .expect("spawn");
        join.join().expect("loader thread catches the panic");
        assert!(matches!(handle.wait(), SessionState::Failed(_)));
    }

    #[test]
    fn test_wait_timeout_returns_loading() {
        let handle = ModelHandle::new("seg");
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let join = handle
            .spawn_load(
                move || {
                    release_rx.recv().expect("release");
                    null_session()
                },
                |_| {},
            )
            .expect("spawn");

        assert_eq!(
            handle.wait_timeout(Duration::from_millis(20)),
            SessionState::Loading
        );
        release_tx.send(()).expect("release loader");
        join.join().expect("loader thread");
        assert_eq!(handle.wait_timeout(Duration::from_secs(1)), SessionState::Ready);
    }

    #[test]
    fn test_ready_constructor() {
        let handle = ModelHandle::ready(null_session().expect("session"));
        assert_eq!(handle.name(), "null");
        assert!(handle.state().is_settled());
        assert!(handle.session().is_ok());
    }
}
