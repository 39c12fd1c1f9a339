//! rollcall-store — Flat-file persistence for registered persons.
//!
//! A CSV person table plus a checksummed binary blob of embeddings,
//! kept consistent by a single transactional append.

pub mod blob;
pub mod store;
pub mod table;

pub use store::{FaceStore, StoreError};
