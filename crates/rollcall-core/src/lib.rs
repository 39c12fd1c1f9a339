//! rollcall-core — Face registration and recognition engine.
//!
//! Uses SCRFD for face detection and ArcFace for face embeddings, both
//! running via ONNX Runtime, plus the matching rule and the registration
//! and recognition flows built on top of them.

pub mod alignment;
pub mod config;
pub mod detector;
pub mod matcher;
pub mod provider;
pub mod recognition;
pub mod recognizer;
pub mod registration;
pub mod types;

pub use config::Config;
pub use matcher::{best_match, EuclideanMatcher, MatchResult, Matcher};
pub use provider::{DetectedFace, EmbeddingProvider, OnnxProvider, ProviderError};
pub use recognition::{Command, Control, KnownFaces, Recognition, RecognitionSession, Tolerances};
pub use registration::{PersonSink, RegistrationFlow, RegistrationInput, RegistrationState};
pub use types::{BoundingBox, Embedding, EmbeddingRecord, NewPerson, PersonId, PersonRecord};
