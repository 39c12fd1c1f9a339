use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifier of a registered person. Assigned by the store, starting at 1.
pub type PersonId = u64;

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

/// Face embedding vector. Dimensionality is fixed by the embedding provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Euclidean distance between two embeddings of equal dimensionality.
    ///
    /// Returns `None` when the dimensions differ; such vectors are not comparable.
    pub fn distance(&self, other: &Embedding) -> Option<f32> {
        if self.values.len() != other.values.len() {
            return None;
        }
        let sum: f32 = self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum();
        Some(sum.sqrt())
    }
}

/// Operator-supplied metadata for a person about to be registered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPerson {
    pub name: String,
    pub class: String,
    pub roll_number: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub phone: String,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{0} is required")]
    MissingField(&'static str),
}

impl NewPerson {
    /// Trim every field and check that name, class and roll number are present.
    pub fn validated(self) -> Result<Self, ValidationError> {
        let person = Self {
            name: self.name.trim().to_string(),
            class: self.class.trim().to_string(),
            roll_number: self.roll_number.trim().to_string(),
            email: self.email.trim().to_string(),
            phone: self.phone.trim().to_string(),
        };
        if person.name.is_empty() {
            return Err(ValidationError::MissingField("name"));
        }
        if person.class.is_empty() {
            return Err(ValidationError::MissingField("class"));
        }
        if person.roll_number.is_empty() {
            return Err(ValidationError::MissingField("roll number"));
        }
        Ok(person)
    }
}

/// A registered person. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonRecord {
    pub id: PersonId,
    pub name: String,
    pub class: String,
    pub roll_number: String,
    pub email: String,
    pub phone: String,
    pub registered_at: NaiveDateTime,
}

impl PersonRecord {
    pub fn from_new(id: PersonId, person: NewPerson, registered_at: NaiveDateTime) -> Self {
        Self {
            id,
            name: person.name,
            class: person.class,
            roll_number: person.roll_number,
            email: person.email,
            phone: person.phone,
            registered_at,
        }
    }
}

/// One stored embedding, keyed by the person it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub person_id: PersonId,
    pub embedding: Embedding,
}
