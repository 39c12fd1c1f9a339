//! Live recognition session: an owned, reloadable snapshot of known faces
//! plus the per-frame matching policy.

use crate::matcher::{EuclideanMatcher, Matcher, LENIENT_TOLERANCE, STRICT_TOLERANCE};
use crate::provider::DetectedFace;
use crate::types::{BoundingBox, EmbeddingRecord, PersonId, PersonRecord};
use std::collections::BTreeMap;
use std::fmt;

/// In-memory copy of the store, taken at start and on reload.
#[derive(Debug, Clone, Default)]
pub struct KnownFaces {
    people: BTreeMap<PersonId, PersonRecord>,
    embeddings: Vec<EmbeddingRecord>,
}

impl KnownFaces {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_pairs(pairs: impl IntoIterator<Item = (PersonRecord, EmbeddingRecord)>) -> Self {
        let mut known = Self::default();
        for (person, embedding) in pairs {
            known.people.entry(person.id).or_insert(person);
            known.embeddings.push(embedding);
        }
        known
    }

    pub fn person(&self, id: PersonId) -> Option<&PersonRecord> {
        self.people.get(&id)
    }

    pub fn embeddings(&self) -> &[EmbeddingRecord] {
        &self.embeddings
    }

    pub fn person_count(&self) -> usize {
        self.people.len()
    }

    pub fn embedding_count(&self) -> usize {
        self.embeddings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.embeddings.is_empty()
    }
}

/// Strict/lenient tolerance pair toggled at runtime.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tolerances {
    pub strict: f32,
    pub lenient: f32,
}

impl Default for Tolerances {
    fn default() -> Self {
        Self {
            strict: STRICT_TOLERANCE,
            lenient: LENIENT_TOLERANCE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToleranceMode {
    Strict,
    Lenient,
}

/// Interactive commands accepted while recognizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Quit,
    Reload,
    ToggleTolerance,
}

impl Command {
    /// Parse a key (`q`, `r`, `t`), ignoring surrounding whitespace and case.
    pub fn parse(key: &str) -> Option<Self> {
        match key.trim().to_ascii_lowercase().as_str() {
            "q" => Some(Self::Quit),
            "r" => Some(Self::Reload),
            "t" => Some(Self::ToggleTolerance),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Continue,
    Stop,
}

/// Who a detected face was identified as.
#[derive(Debug, Clone, PartialEq)]
pub enum Identity {
    Known { person: PersonRecord, distance: f32 },
    Unknown,
}

/// One face in a processed frame and its identity.
#[derive(Debug, Clone, PartialEq)]
pub struct Recognition {
    pub bbox: BoundingBox,
    pub identity: Identity,
}

impl Recognition {
    pub fn is_known(&self) -> bool {
        matches!(self.identity, Identity::Known { .. })
    }

    pub fn person(&self) -> Option<&PersonRecord> {
        match &self.identity {
            Identity::Known { person, .. } => Some(person),
            Identity::Unknown => None,
        }
    }

    /// `1 - distance` for known faces, 0 otherwise.
    pub fn confidence(&self) -> f32 {
        match &self.identity {
            Identity::Known { distance, .. } => (1.0 - distance).clamp(0.0, 1.0),
            Identity::Unknown => 0.0,
        }
    }

    /// Overlay text, one entry per line.
    pub fn caption(&self) -> Vec<String> {
        match &self.identity {
            Identity::Known { person, .. } => vec![
                format!("{} ({})", person.name, person.class),
                format!("Roll: {}", person.roll_number),
                format!("Confidence: {:.2}", self.confidence()),
            ],
            Identity::Unknown => vec!["Unknown Person".to_string()],
        }
    }
}

impl fmt::Display for Recognition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.identity {
            Identity::Known { person, .. } => write!(
                f,
                "{} ({}) roll {}, confidence {:.2}",
                person.name,
                person.class,
                person.roll_number,
                self.confidence()
            ),
            Identity::Unknown => f.write_str("Unknown Person"),
        }
    }
}

/// Recognition state owned by one capture loop.
pub struct RecognitionSession<M: Matcher = EuclideanMatcher> {
    known: KnownFaces,
    tolerances: Tolerances,
    mode: ToleranceMode,
    frame_skip: u64,
    frames_seen: u64,
    matcher: M,
}

impl RecognitionSession<EuclideanMatcher> {
    pub fn new(known: KnownFaces, tolerances: Tolerances, frame_skip: u32) -> Self {
        Self::with_matcher(known, tolerances, frame_skip, EuclideanMatcher)
    }
}

impl<M: Matcher> RecognitionSession<M> {
    pub fn with_matcher(known: KnownFaces, tolerances: Tolerances, frame_skip: u32, matcher: M) -> Self {
        Self {
            known,
            tolerances,
            mode: ToleranceMode::Strict,
            frame_skip: u64::from(frame_skip.max(1)),
            frames_seen: 0,
            matcher,
        }
    }

    pub fn known(&self) -> &KnownFaces {
        &self.known
    }

    pub fn mode(&self) -> ToleranceMode {
        self.mode
    }

    pub fn tolerance(&self) -> f32 {
        match self.mode {
            ToleranceMode::Strict => self.tolerances.strict,
            ToleranceMode::Lenient => self.tolerances.lenient,
        }
    }

    pub fn set_mode(&mut self, mode: ToleranceMode) {
        self.mode = mode;
    }

    /// Switch between strict and lenient; returns the tolerance now in effect.
    pub fn toggle_tolerance(&mut self) -> f32 {
        self.mode = match self.mode {
            ToleranceMode::Strict => ToleranceMode::Lenient,
            ToleranceMode::Lenient => ToleranceMode::Strict,
        };
        tracing::info!(tolerance = self.tolerance(), mode = ?self.mode, "tolerance changed");
        self.tolerance()
    }

    /// Count a captured frame; true if it should be run through detection.
    pub fn should_process(&mut self) -> bool {
        let process = self.frames_seen % self.frame_skip == 0;
        self.frames_seen += 1;
        process
    }

    pub fn frames_seen(&self) -> u64 {
        self.frames_seen
    }

    /// Swap in a freshly loaded snapshot. A failed load leaves an empty set.
    pub fn reload<E: fmt::Display>(&mut self, loaded: Result<KnownFaces, E>) {
        match loaded {
            Ok(known) => {
                tracing::info!(
                    persons = known.person_count(),
                    embeddings = known.embedding_count(),
                    "known faces reloaded"
                );
                self.known = known;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to load known faces; continuing with an empty set");
                self.known = KnownFaces::empty();
            }
        }
    }

    /// Apply an interactive command. `load` is only called for `Reload`.
    pub fn handle<E, F>(&mut self, command: Command, load: F) -> Control
    where
        E: fmt::Display,
        F: FnOnce() -> Result<KnownFaces, E>,
    {
        match command {
            Command::Quit => Control::Stop,
            Command::Reload => {
                self.reload(load());
                Control::Continue
            }
            Command::ToggleTolerance => {
                self.toggle_tolerance();
                Control::Continue
            }
        }
    }

    /// Identify every detected face against the current snapshot.
    pub fn identify(&self, faces: &[DetectedFace]) -> Vec<Recognition> {
        let tolerance = self.tolerance();
        faces
            .iter()
            .map(|face| {
                let result = self.matcher.compare(&face.embedding, self.known.embeddings(), tolerance);
                let identity = match result.person_id.and_then(|id| self.known.person(id)) {
                    Some(person) if result.matched => Identity::Known {
                        person: person.clone(),
                        distance: result.distance,
                    },
                    _ => Identity::Unknown,
                };
                Recognition {
                    bbox: face.bbox.clone(),
                    identity,
                }
            })
            .collect()
    }
}
