//! Nearest-embedding matching by Euclidean distance.

use crate::types::{Embedding, EmbeddingRecord, PersonId};

/// Default strict tolerance.
pub const STRICT_TOLERANCE: f32 = 0.6;
/// Default lenient tolerance, selectable at runtime.
pub const LENIENT_TOLERANCE: f32 = 0.9;

/// Result of matching a probe embedding against the known set.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub matched: bool,
    /// Distance to the nearest comparable embedding, `f32::INFINITY` if there was none.
    pub distance: f32,
    /// Person owning the nearest embedding, set only when `matched`.
    pub person_id: Option<PersonId>,
}

impl MatchResult {
    fn unknown(distance: f32) -> Self {
        Self {
            matched: false,
            distance,
            person_id: None,
        }
    }

    /// Operator-facing confidence, `1 - distance` clamped to [0, 1].
    pub fn confidence(&self) -> f32 {
        if self.matched {
            (1.0 - self.distance).clamp(0.0, 1.0)
        } else {
            0.0
        }
    }
}

/// Strategy for comparing a probe embedding against the known set.
pub trait Matcher {
    fn compare(&self, probe: &Embedding, known: &[EmbeddingRecord], tolerance: f32) -> MatchResult;
}

/// Linear-scan Euclidean matcher. On equal distances the first record seen wins.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(&self, probe: &Embedding, known: &[EmbeddingRecord], tolerance: f32) -> MatchResult {
        let mut best: Option<(PersonId, f32)> = None;

        for record in known {
            let Some(distance) = probe.distance(&record.embedding) else {
                tracing::trace!(
                    person_id = record.person_id,
                    probe_dim = probe.dim(),
                    known_dim = record.embedding.dim(),
                    "skipping embedding with mismatched dimension"
                );
                continue;
            };
            let closer = match best {
                None => true,
                Some((_, best_distance)) => distance < best_distance,
            };
            if closer {
                best = Some((record.person_id, distance));
            }
        }

        match best {
            Some((person_id, distance)) if distance <= tolerance => MatchResult {
                matched: true,
                distance,
                person_id: Some(person_id),
            },
            Some((_, distance)) => MatchResult::unknown(distance),
            None => MatchResult::unknown(f32::INFINITY),
        }
    }
}

/// Nearest stored person within `tolerance`, with its distance.
pub fn best_match(
    probe: &Embedding,
    known: &[EmbeddingRecord],
    tolerance: f32,
) -> Option<(PersonId, f32)> {
    let result = EuclideanMatcher.compare(probe, known, tolerance);
    result.person_id.map(|id| (id, result.distance))
}
