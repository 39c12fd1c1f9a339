use bytes::Bytes;
use rollcall_core::recognition::ToleranceMode;
use rollcall_core::registration::{CaptureRejected, FaceStatus, RegistrationError, Step};
use rollcall_core::types::ValidationError;
use rollcall_core::{
    Config, EmbeddingProvider, KnownFaces, NewPerson, PersonId, PersonRecord, Recognition,
    RecognitionSession, RegistrationFlow, RegistrationInput, Tolerances,
};
use rollcall_hw::{CameraError, Frame, FrameError, FrameSource, Overlay};
use rollcall_store::{FaceStore, StoreError};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("invalid details: {0}")]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Rejected(#[from] CaptureRejected),
    #[error("registration failed: {0}")]
    Registration(String),
    #[error("engine thread exited")]
    ChannelClosed,
}

impl From<RegistrationError> for EngineError {
    fn from(e: RegistrationError) -> Self {
        match e {
            RegistrationError::Validation(v) => Self::Validation(v),
            RegistrationError::Rejected(r) => Self::Rejected(r),
            RegistrationError::Persist(source) => match source.downcast::<StoreError>() {
                Ok(store) => Self::Store(*store),
                Err(other) => Self::Registration(other.to_string()),
            },
            other @ RegistrationError::OutOfOrder { .. } => Self::Registration(other.to_string()),
        }
    }
}

/// Engine tunables, taken from `Config` at startup.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub mirror: bool,
    pub warmup_frames: usize,
    pub capture_attempts: usize,
    pub frame_skip: u32,
    pub tolerances: Tolerances,
    pub lenient: bool,
    pub jpeg_quality: u8,
}

impl EngineOptions {
    pub fn from_config(config: &Config, lenient: bool) -> Self {
        Self {
            mirror: config.mirror,
            warmup_frames: config.warmup_frames,
            capture_attempts: config.capture_attempts,
            frame_skip: config.frame_skip,
            tolerances: config.tolerances(),
            lenient,
            jpeg_quality: 80,
        }
    }
}

/// Snapshot of engine state for `/api/status`.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub camera: String,
    pub persons: usize,
    pub embeddings: usize,
    pub tolerance: f32,
    pub lenient: bool,
    pub frames: u64,
}

/// Messages sent from HTTP handlers to the engine thread.
enum EngineRequest {
    Frame {
        reply: oneshot::Sender<Result<Bytes, EngineError>>,
    },
    Register {
        person: NewPerson,
        reply: oneshot::Sender<Result<PersonId, EngineError>>,
    },
    Persons {
        reply: oneshot::Sender<Result<Vec<PersonRecord>, EngineError>>,
    },
    Detections {
        reply: oneshot::Sender<(f32, Vec<Recognition>)>,
    },
    Reload {
        reply: oneshot::Sender<usize>,
    },
    ToggleTolerance {
        reply: oneshot::Sender<(f32, bool)>,
    },
    Status {
        reply: oneshot::Sender<EngineStatus>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Capture one frame, annotate it with the latest identities, encode as JPEG.
    pub async fn frame(&self) -> Result<Bytes, EngineError> {
        self.request(|reply| EngineRequest::Frame { reply }).await?
    }

    /// Capture until exactly one face is seen, then persist the person.
    pub async fn register(&self, person: NewPerson) -> Result<PersonId, EngineError> {
        self.request(|reply| EngineRequest::Register { person, reply }).await?
    }

    pub async fn persons(&self) -> Result<Vec<PersonRecord>, EngineError> {
        self.request(|reply| EngineRequest::Persons { reply }).await?
    }

    /// Current tolerance and the identities from the last processed frame.
    pub async fn detections(&self) -> Result<(f32, Vec<Recognition>), EngineError> {
        self.request(|reply| EngineRequest::Detections { reply }).await
    }

    /// Re-read the store; returns the number of known persons.
    pub async fn reload(&self) -> Result<usize, EngineError> {
        self.request(|reply| EngineRequest::Reload { reply }).await
    }

    /// Returns the new tolerance and whether it is the lenient preset.
    pub async fn toggle_tolerance(&self) -> Result<(f32, bool), EngineError> {
        self.request(|reply| EngineRequest::ToggleTolerance { reply }).await
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        self.request(|reply| EngineRequest::Status { reply }).await
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The frame source is opened on the engine thread itself and warmed up
/// before this returns, so startup fails fast if no camera works.
pub async fn spawn_engine<S, O, P>(
    open_source: O,
    provider: P,
    store: FaceStore,
    options: EngineOptions,
) -> Result<EngineHandle, EngineError>
where
    S: FrameSource + 'static,
    O: FnOnce() -> Result<S, CameraError> + Send + 'static,
    P: EmbeddingProvider + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);
    let (ready_tx, ready_rx) = oneshot::channel::<Result<(), EngineError>>();

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            let mut source = match open_source() {
                Ok(source) => source,
                Err(e) => {
                    let _ = ready_tx.send(Err(e.into()));
                    return;
                }
            };
            tracing::info!(camera = %source.describe(), "camera opened");

            // Discard warmup frames for camera AGC/AE stabilization
            if options.warmup_frames > 0 {
                tracing::info!(count = options.warmup_frames, "discarding warmup frames");
                if let Err(e) = source.discard(options.warmup_frames) {
                    let _ = ready_tx.send(Err(e.into()));
                    return;
                }
            }

            let mut engine = match Engine::new(source, provider, store, options) {
                Ok(engine) => engine,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));

            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                engine.handle(req);
            }
            tracing::info!("engine thread exiting");
        })
        .expect("failed to spawn engine thread");

    ready_rx.await.map_err(|_| EngineError::ChannelClosed)??;
    Ok(EngineHandle { tx })
}

struct Engine<S, P> {
    source: S,
    provider: P,
    store: FaceStore,
    session: RecognitionSession,
    overlay: Overlay,
    latest: Vec<Recognition>,
    frames: u64,
    options: EngineOptions,
}

impl<S: FrameSource, P: EmbeddingProvider> Engine<S, P> {
    fn new(source: S, provider: P, store: FaceStore, options: EngineOptions) -> Result<Self, EngineError> {
        let mut session = RecognitionSession::new(KnownFaces::empty(), options.tolerances, options.frame_skip);
        session.reload(load_known(&store));
        if options.lenient {
            session.set_mode(ToleranceMode::Lenient);
        }
        Ok(Self {
            source,
            provider,
            store,
            session,
            overlay: Overlay::new()?,
            latest: Vec::new(),
            frames: 0,
            options,
        })
    }

    fn handle(&mut self, req: EngineRequest) {
        match req {
            EngineRequest::Frame { reply } => {
                let _ = reply.send(self.annotated_jpeg());
            }
            EngineRequest::Register { person, reply } => {
                let _ = reply.send(self.register(person));
            }
            EngineRequest::Persons { reply } => {
                let _ = reply.send(self.store.persons().map_err(EngineError::from));
            }
            EngineRequest::Detections { reply } => {
                let _ = reply.send((self.session.tolerance(), self.latest.clone()));
            }
            EngineRequest::Reload { reply } => {
                self.reload();
                let _ = reply.send(self.session.known().person_count());
            }
            EngineRequest::ToggleTolerance { reply } => {
                let tolerance = self.session.toggle_tolerance();
                let _ = reply.send((tolerance, self.session.mode() == ToleranceMode::Lenient));
            }
            EngineRequest::Status { reply } => {
                let known = self.session.known();
                let _ = reply.send(EngineStatus {
                    camera: self.source.describe(),
                    persons: known.person_count(),
                    embeddings: known.embedding_count(),
                    tolerance: self.session.tolerance(),
                    lenient: self.session.mode() == ToleranceMode::Lenient,
                    frames: self.frames,
                });
            }
        }
    }

    fn reload(&mut self) {
        self.session.reload(load_known(&self.store));
        self.latest.clear();
    }

    fn next_frame(&mut self) -> Result<Frame, EngineError> {
        let mut frame = self.source.next_frame()?;
        self.frames += 1;
        if self.options.mirror {
            frame.mirror();
        }
        Ok(frame)
    }

    fn annotated_jpeg(&mut self) -> Result<Bytes, EngineError> {
        let frame = self.next_frame()?;
        if self.session.should_process() {
            match self.provider.faces(&frame.data, frame.width, frame.height) {
                Ok(faces) => self.latest = self.session.identify(&faces),
                Err(e) => tracing::warn!(error = %e, "face detection failed; keeping previous overlay"),
            }
        }
        let frame = self.overlay.annotate(frame, &self.latest)?;
        Ok(Bytes::from(frame.to_jpeg(self.options.jpeg_quality)?))
    }

    /// Web registration: examine up to `capture_attempts` frames and capture
    /// the first one showing exactly one face.
    fn register(&mut self, person: NewPerson) -> Result<PersonId, EngineError> {
        let mut flow = RegistrationFlow::new();
        flow.apply(RegistrationInput::Begin(person), &mut self.store)?;

        let mut last = FaceStatus::None;
        for attempt in 1..=self.options.capture_attempts.max(1) {
            let frame = self.next_frame()?;
            let faces = match self.provider.faces(&frame.data, frame.width, frame.height) {
                Ok(faces) => faces,
                Err(e) => {
                    tracing::warn!(error = %e, attempt, "face detection failed during registration");
                    continue;
                }
            };
            if let Step::Observed(status) = flow.apply(RegistrationInput::Frame(faces), &mut self.store)? {
                last = status;
            }
            if last != FaceStatus::One {
                continue;
            }

            flow.apply(RegistrationInput::Capture, &mut self.store)?;
            if let Step::Persisted(person_id) = flow.apply(RegistrationInput::Confirm, &mut self.store)? {
                tracing::info!(person_id, attempt, "registered via web");
                self.reload();
                return Ok(person_id);
            }
        }

        tracing::info!(attempts = self.options.capture_attempts, faces = ?last, "registration gave up");
        Err(match last {
            FaceStatus::Many(n) => CaptureRejected::MultipleFaces(n),
            _ => CaptureRejected::NoFace,
        }
        .into())
    }
}

fn load_known(store: &FaceStore) -> Result<KnownFaces, StoreError> {
    store.load_all().map(KnownFaces::from_pairs)
}
