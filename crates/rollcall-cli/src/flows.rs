//! Capture loops behind `register`, `add-sample` and `recognize`.
//!
//! Each loop owns its frame source for the duration of the flow; the camera
//! is released when the source is dropped on any exit path.

use crate::input::{registration_key, Keys, Poll};
use anyhow::{bail, Context, Result};
use rollcall_core::registration::{FaceStatus, RegistrationError, Step};
use rollcall_core::{
    Command, Config, Control, EmbeddingProvider, KnownFaces, NewPerson, OnnxProvider, PersonId,
    PersonSink, Recognition, RecognitionSession, RegistrationFlow, RegistrationInput,
};
use rollcall_hw::{open_first_available, Camera, Frame, FrameSource, Overlay};
use rollcall_store::{FaceStore, StoreError};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

const FPS_WINDOW: u64 = 30;
const PREVIEW_JPEG_QUALITY: u8 = 80;

/// Open the first working camera index and let exposure settle.
pub fn open_camera(config: &Config) -> Result<Camera> {
    let (index, mut camera) = open_first_available(&config.camera_indices, Camera::open_index)?;
    camera
        .discard(config.warmup_frames)
        .context("camera failed during warmup")?;
    println!("Camera {index} ready: {}", camera.describe());
    Ok(camera)
}

pub fn load_provider(config: &Config) -> Result<OnnxProvider> {
    Ok(OnnxProvider::load(&config.model_dir)?)
}

/// Snapshot loader used at start and on `r`.
pub fn load_known(store: &FaceStore) -> Result<KnownFaces, StoreError> {
    store.load_all().map(KnownFaces::from_pairs)
}

/// Ask for a person's details. `None` if stdin closed or a field was invalid.
pub fn prompt_details(keys: &Keys) -> Option<NewPerson> {
    println!("\nEnter person details (fields marked * are required)");
    let person = NewPerson {
        name: keys.prompt("  Name*: ")?,
        class: keys.prompt("  Class*: ")?,
        roll_number: keys.prompt("  Roll number*: ")?,
        email: keys.prompt("  Email: ")?,
        phone: keys.prompt("  Phone: ")?,
    };
    match person.validated() {
        Ok(person) => Some(person),
        Err(e) => {
            println!("Error: {e}");
            None
        }
    }
}

/// Drive one registration from `Begin` to `Persisted` or cancellation.
///
/// Returns the new id, or `None` when the operator cancelled or input closed.
pub fn capture_registration<F, P, S>(
    source: &mut F,
    provider: &mut P,
    keys: &Keys,
    person: NewPerson,
    sink: &mut S,
    mirror: bool,
) -> Result<Option<PersonId>>
where
    F: FrameSource,
    P: EmbeddingProvider,
    S: PersonSink,
{
    let mut flow = RegistrationFlow::new();
    flow.apply(RegistrationInput::Begin(person), sink)?;
    println!("Look at the camera. SPACE+Return: capture, Return: confirm, ESC/x+Return: cancel");

    let mut last_status = None;
    loop {
        let mut frame = source.next_frame()?;
        if mirror {
            frame.mirror();
        }
        let faces = match provider.faces(&frame.data, frame.width, frame.height) {
            Ok(faces) => faces,
            Err(e) => {
                tracing::warn!(error = %e, "face detection failed");
                Vec::new()
            }
        };
        if let Ok(Step::Observed(status)) = flow.apply(RegistrationInput::Frame(faces), sink) {
            if last_status != Some(status) {
                print_face_status(status);
                last_status = Some(status);
            }
        }

        let line = match keys.poll() {
            Poll::Line(line) => line,
            Poll::Empty => continue,
            Poll::Closed => return Ok(None),
        };
        let Some(input) = registration_key(&line) else {
            continue;
        };

        match flow.apply(input, sink) {
            Ok(Step::Captured) => println!("Face captured. Press Return to save, or ESC/x to cancel."),
            Ok(Step::Persisted(id)) => return Ok(Some(id)),
            Ok(Step::Cancelled) => {
                println!("Registration cancelled.");
                return Ok(None);
            }
            Ok(_) => {}
            Err(e @ RegistrationError::Persist(_)) => return Err(e.into()),
            Err(RegistrationError::OutOfOrder { .. }) => println!("Press SPACE first to capture a face."),
            Err(e) => println!("{e}"),
        }
    }
}

fn print_face_status(status: FaceStatus) {
    match status {
        FaceStatus::None => println!("No face detected"),
        FaceStatus::One => println!("Face detected. Press SPACE+Return to capture"),
        FaceStatus::Many(n) => println!("{n} faces detected; only one person should be in view"),
    }
}

/// Register a new person from the terminal.
pub fn register(config: &Config, store: &mut FaceStore, keys: &Keys) -> Result<()> {
    let Some(person) = prompt_details(keys) else {
        return Ok(());
    };
    let mut provider = load_provider(config)?;
    let mut camera = open_camera(config)?;
    let name = person.name.clone();

    if let Some(id) = capture_registration(&mut camera, &mut provider, keys, person, store, config.mirror)? {
        println!("Registered {name} with id {id}.");
    }
    Ok(())
}

/// Decode a photo (any format `image` reads) into an RGB frame.
pub fn load_image(path: &Path) -> Result<Frame> {
    let image = image::open(path).with_context(|| format!("failed to read image {}", path.display()))?;
    Ok(Frame::from_image(image.to_rgb8()))
}

/// Run one still frame through the registration flow. The photo must show
/// exactly one face.
pub fn register_still<P, S>(frame: &Frame, provider: &mut P, person: NewPerson, sink: &mut S) -> Result<PersonId>
where
    P: EmbeddingProvider,
    S: PersonSink,
{
    let faces = provider.faces(&frame.data, frame.width, frame.height)?;
    let mut flow = RegistrationFlow::new();
    flow.apply(RegistrationInput::Begin(person), sink)?;
    flow.apply(RegistrationInput::Frame(faces), sink)?;
    flow.apply(RegistrationInput::Capture, sink)?;
    match flow.apply(RegistrationInput::Confirm, sink)? {
        Step::Persisted(id) => Ok(id),
        step => bail!("registration did not complete ({step:?})"),
    }
}

/// Register a new person from an image file instead of the webcam.
pub fn register_from_image(config: &Config, store: &mut FaceStore, keys: &Keys, path: &Path) -> Result<()> {
    let frame = load_image(path)?;
    tracing::info!(path = %path.display(), width = frame.width, height = frame.height, "loaded registration image");
    let Some(person) = prompt_details(keys) else {
        return Ok(());
    };
    let mut provider = load_provider(config)?;
    let name = person.name.clone();
    let id = register_still(&frame, &mut provider, person, store)?;
    println!("Registered {name} with id {id}.");
    Ok(())
}

/// Writes an extra sample for an existing person instead of a new row.
struct SampleSink<'a> {
    store: &'a FaceStore,
    person_id: PersonId,
}

impl PersonSink for SampleSink<'_> {
    type Error = StoreError;

    fn persist(&mut self, _person: &NewPerson, embedding: &rollcall_core::Embedding) -> Result<PersonId, StoreError> {
        self.store.add_embedding(self.person_id, embedding)?;
        Ok(self.person_id)
    }
}

/// Capture one more embedding for a registered person.
pub fn add_sample(config: &Config, store: &FaceStore, keys: &Keys, person_id: PersonId) -> Result<()> {
    let record = store
        .find_by_id(person_id)?
        .ok_or(StoreError::UnknownPerson(person_id))?;
    println!("Adding a sample for {} ({})", record.name, record.class);

    let person = NewPerson {
        name: record.name.clone(),
        class: record.class.clone(),
        roll_number: record.roll_number.clone(),
        email: record.email.clone(),
        phone: record.phone.clone(),
    };
    let mut provider = load_provider(config)?;
    let mut camera = open_camera(config)?;
    let mut sink = SampleSink { store, person_id };

    if capture_registration(&mut camera, &mut provider, keys, person, &mut sink, config.mirror)?.is_some() {
        println!("Sample saved for {}.", record.name);
    }
    Ok(())
}

/// Annotated JPEG rewritten after every processed frame, so the live view
/// can be watched in any image viewer that reloads on change.
pub struct Preview {
    overlay: Overlay,
    path: PathBuf,
}

impl Preview {
    pub fn new(path: PathBuf) -> Result<Self> {
        Ok(Self {
            overlay: Overlay::new()?,
            path,
        })
    }

    /// Replace the preview file; the rename keeps readers from seeing a partial image.
    fn write(&self, frame: Frame, recognitions: &[Recognition]) -> Result<()> {
        let jpeg = self.overlay.annotate(frame, recognitions)?.to_jpeg(PREVIEW_JPEG_QUALITY)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, jpeg).with_context(|| format!("failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path).with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

/// Counters reported when a recognition loop ends.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RecognitionStats {
    pub frames: u64,
    pub processed: u64,
}

/// Live recognition until `q` or end of input.
pub fn recognize_loop<F, P, L>(
    source: &mut F,
    provider: &mut P,
    session: &mut RecognitionSession,
    keys: &Keys,
    mut load: L,
    mirror: bool,
    preview: Option<&Preview>,
) -> Result<RecognitionStats>
where
    F: FrameSource,
    P: EmbeddingProvider,
    L: FnMut() -> Result<KnownFaces, StoreError>,
{
    let mut stats = RecognitionStats::default();
    let mut last_labels: Vec<String> = Vec::new();
    let mut window_start = Instant::now();

    loop {
        let mut frame = source.next_frame()?;
        stats.frames += 1;
        if mirror {
            frame.mirror();
        }

        if session.should_process() {
            stats.processed += 1;
            match provider.faces(&frame.data, frame.width, frame.height) {
                Ok(faces) => {
                    let recognitions = session.identify(&faces);
                    let labels: Vec<String> = recognitions.iter().map(ToString::to_string).collect();
                    if labels != last_labels {
                        print_recognitions(&recognitions);
                        last_labels = labels;
                    }
                    if let Some(preview) = preview {
                        if let Err(e) = preview.write(frame, &recognitions) {
                            tracing::warn!(error = %e, "failed to update preview");
                        }
                    }
                }
                Err(e) => tracing::warn!(error = %e, "face detection failed"),
            }
        }

        if stats.frames % FPS_WINDOW == 0 {
            let fps = FPS_WINDOW as f32 / window_start.elapsed().as_secs_f32().max(f32::EPSILON);
            tracing::info!(fps = format_args!("{fps:.1}"), tolerance = session.tolerance(), "recognition running");
            window_start = Instant::now();
        }

        let command = match keys.poll() {
            Poll::Line(line) => Command::parse(&line),
            Poll::Empty => None,
            Poll::Closed => Some(Command::Quit),
        };
        if let Some(command) = command {
            if session.handle(command, &mut load) == Control::Stop {
                return Ok(stats);
            }
            match command {
                Command::Reload => println!("Reloaded {} registered persons.", session.known().person_count()),
                Command::ToggleTolerance => println!("Tolerance now {:.1}", session.tolerance()),
                Command::Quit => {}
            }
            last_labels.clear();
        }
    }
}

fn print_recognitions(recognitions: &[Recognition]) {
    if recognitions.is_empty() {
        println!("No faces in view");
        return;
    }
    for (i, recognition) in recognitions.iter().enumerate() {
        println!("  face {}: {recognition}", i + 1);
    }
}

pub fn recognize(config: &Config, store: &FaceStore, keys: &Keys, lenient: bool, snapshot: Option<PathBuf>) -> Result<()> {
    let mut provider = load_provider(config)?;
    let preview = snapshot.map(Preview::new).transpose()?;
    if let Some(preview) = &preview {
        println!("Writing annotated frames to {}", preview.path.display());
    }

    let mut session = RecognitionSession::new(KnownFaces::empty(), config.tolerances(), config.frame_skip);
    session.reload(load_known(store));
    if lenient {
        session.toggle_tolerance();
    }
    println!(
        "Loaded {} registered persons. Tolerance {:.1}. Commands: q quit, r reload, t toggle tolerance",
        session.known().person_count(),
        session.tolerance()
    );

    let mut camera = open_camera(config)?;
    let stats = recognize_loop(
        &mut camera,
        &mut provider,
        &mut session,
        keys,
        || load_known(store),
        config.mirror,
        preview.as_ref(),
    )?;
    tracing::info!(frames = stats.frames, processed = stats.processed, "recognition stopped");
    Ok(())
}
