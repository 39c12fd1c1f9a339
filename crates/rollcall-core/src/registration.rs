//! Registration flow as an explicit state machine.
//!
//! ```text
//! Idle ──begin──▶ AwaitingFaceDetected ──capture (1 face)──▶ CaptureConfirmed ──confirm──▶ Persisted
//!   ▲                    │ frame / rejected capture ↺               │
//!   └──────── cancel ────┴────────────── cancel / persist failure ──┘
//! ```
//!
//! The machine is driven by [`RegistrationInput`] values and knows nothing
//! about terminals or cameras; front-ends translate keys and frames into
//! inputs and supply a [`PersonSink`] for the final write.

use crate::provider::DetectedFace;
use crate::types::{Embedding, NewPerson, PersonId, ValidationError};
use thiserror::Error;

/// Destination for a confirmed registration.
pub trait PersonSink {
    type Error: std::error::Error + Send + Sync + 'static;

    fn persist(&mut self, person: &NewPerson, embedding: &Embedding) -> Result<PersonId, Self::Error>;
}

/// How many faces the most recent frame contained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaceStatus {
    None,
    One,
    Many(usize),
}

impl FaceStatus {
    pub fn from_count(count: usize) -> Self {
        match count {
            0 => Self::None,
            1 => Self::One,
            n => Self::Many(n),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RegistrationState {
    Idle,
    AwaitingFaceDetected {
        person: NewPerson,
        faces: FaceStatus,
        /// Embedding of the single face in the latest frame, if exactly one.
        current: Option<Embedding>,
    },
    CaptureConfirmed {
        person: NewPerson,
        embedding: Embedding,
    },
    Persisted {
        person_id: PersonId,
    },
}

impl RegistrationState {
    fn name(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::AwaitingFaceDetected { .. } => "AwaitingFaceDetected",
            Self::CaptureConfirmed { .. } => "CaptureConfirmed",
            Self::Persisted { .. } => "Persisted",
        }
    }
}

/// Operator and camera inputs accepted by the flow.
#[derive(Debug, Clone)]
pub enum RegistrationInput {
    /// Metadata entered; start watching for a face.
    Begin(NewPerson),
    /// Detections for the latest camera frame.
    Frame(Vec<DetectedFace>),
    /// Operator capture key (SPACE).
    Capture,
    /// Operator confirm key (ENTER).
    Confirm,
    /// Operator cancel key (ESC).
    Cancel,
}

impl RegistrationInput {
    fn name(&self) -> &'static str {
        match self {
            Self::Begin(_) => "Begin",
            Self::Frame(_) => "Frame",
            Self::Capture => "Capture",
            Self::Confirm => "Confirm",
            Self::Cancel => "Cancel",
        }
    }
}

/// What an accepted input did.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Started,
    Observed(FaceStatus),
    Captured,
    Persisted(PersonId),
    Cancelled,
}

/// Retryable capture refusal; the flow stays in `AwaitingFaceDetected`.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureRejected {
    #[error("no face detected; face the camera and try again")]
    NoFace,
    #[error("{0} faces detected; only one person may be in view")]
    MultipleFaces(usize),
}

#[derive(Error, Debug)]
pub enum RegistrationError {
    #[error("invalid details: {0}")]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Rejected(#[from] CaptureRejected),
    #[error("{input} is not accepted in state {state}")]
    OutOfOrder {
        state: &'static str,
        input: &'static str,
    },
    #[error("failed to save registration: {0}")]
    Persist(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl RegistrationError {
    /// Whether the operator can simply try again in the same state.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Rejected(_) | Self::Validation(_))
    }
}

#[derive(Debug)]
pub struct RegistrationFlow {
    state: RegistrationState,
}

impl Default for RegistrationFlow {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistrationFlow {
    pub fn new() -> Self {
        Self {
            state: RegistrationState::Idle,
        }
    }

    pub fn state(&self) -> &RegistrationState {
        &self.state
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, RegistrationState::Persisted { .. })
    }

    /// Feed one input. Rejected inputs leave the state untouched, except a
    /// failed persist which returns the flow to `Idle`.
    pub fn apply<S: PersonSink>(
        &mut self,
        input: RegistrationInput,
        sink: &mut S,
    ) -> Result<Step, RegistrationError> {
        let out_of_order = |state: &RegistrationState, input: &RegistrationInput| RegistrationError::OutOfOrder {
            state: state.name(),
            input: input.name(),
        };

        match (&mut self.state, input) {
            (RegistrationState::Idle, RegistrationInput::Begin(person)) => {
                let person = person.validated()?;
                tracing::debug!(name = %person.name, "registration started");
                self.state = RegistrationState::AwaitingFaceDetected {
                    person,
                    faces: FaceStatus::None,
                    current: None,
                };
                Ok(Step::Started)
            }

            (RegistrationState::AwaitingFaceDetected { faces, current, .. }, RegistrationInput::Frame(detected)) => {
                let status = FaceStatus::from_count(detected.len());
                *faces = status;
                *current = match (status, detected.into_iter().next()) {
                    (FaceStatus::One, Some(face)) => Some(face.embedding),
                    _ => None,
                };
                Ok(Step::Observed(status))
            }

            (RegistrationState::AwaitingFaceDetected { person, faces, current }, RegistrationInput::Capture) => {
                let embedding = match (*faces, current.take()) {
                    (FaceStatus::One, Some(embedding)) => embedding,
                    (FaceStatus::Many(n), _) => return Err(CaptureRejected::MultipleFaces(n).into()),
                    _ => return Err(CaptureRejected::NoFace.into()),
                };
                let person = std::mem::take(person);
                self.state = RegistrationState::CaptureConfirmed { person, embedding };
                Ok(Step::Captured)
            }

            (RegistrationState::CaptureConfirmed { person, embedding }, RegistrationInput::Confirm) => {
                match sink.persist(person, embedding) {
                    Ok(person_id) => {
                        tracing::info!(person_id, name = %person.name, "registration persisted");
                        self.state = RegistrationState::Persisted { person_id };
                        Ok(Step::Persisted(person_id))
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "registration not persisted; returning to idle");
                        self.state = RegistrationState::Idle;
                        Err(RegistrationError::Persist(Box::new(e)))
                    }
                }
            }

            (RegistrationState::Persisted { .. }, input) => Err(out_of_order(&self.state, &input)),

            (_, RegistrationInput::Cancel) => {
                if !matches!(self.state, RegistrationState::Idle) {
                    tracing::debug!(from = self.state.name(), "registration cancelled");
                }
                self.state = RegistrationState::Idle;
                Ok(Step::Cancelled)
            }

            // Frames arriving after capture are expected while the operator decides.
            (RegistrationState::CaptureConfirmed { .. }, RegistrationInput::Frame(detected)) => {
                Ok(Step::Observed(FaceStatus::from_count(detected.len())))
            }

            (state, input) => Err(out_of_order(state, &input)),
        }
    }
}
