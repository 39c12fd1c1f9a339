//! `FaceStore`: the person table and the embedding blob behind one
//! all-or-nothing append.
//!
//! Both files are written to sibling `.tmp` files, synced, then renamed into
//! place: the blob first, the table last. The table rename is the commit
//! point. Blob entries without a table row are ignored on load, so a crash
//! between the two renames leaves nothing visible and the next append reuses
//! the orphaned id.

use crate::blob::{EmbeddingBlob, BLOB_FILE};
use crate::table::{self, TABLE_FILE};
use chrono::{Local, SubsecRound};
use rollcall_core::{Embedding, EmbeddingRecord, NewPerson, PersonId, PersonRecord, PersonSink};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("corrupt data in {path}: {reason}")]
    CorruptData { path: PathBuf, reason: String },
    #[error("no registered person with id {0}")]
    UnknownPerson(PersonId),
    #[error("embedding has {actual} dimensions but the store holds {expected}-dimensional embeddings")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Flat-file person and embedding store rooted at one directory.
#[derive(Debug, Clone)]
pub struct FaceStore {
    table_path: PathBuf,
    blob_path: PathBuf,
}

impl FaceStore {
    /// Open the store, creating the directory and an empty table if absent.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|source| StoreError::Write {
            path: dir.clone(),
            source,
        })?;

        let store = Self {
            table_path: dir.join(TABLE_FILE),
            blob_path: dir.join(BLOB_FILE),
        };

        if !store.table_path.exists() {
            let header = encode_table(&[], &store.table_path)?;
            let tmp = write_temp(&store.table_path, &header)?;
            commit(&tmp, &store.table_path)?;
            tracing::info!(path = %store.table_path.display(), "created person table");
        }

        Ok(store)
    }

    pub fn table_path(&self) -> &Path {
        &self.table_path
    }

    pub fn blob_path(&self) -> &Path {
        &self.blob_path
    }

    /// Register a person with their first embedding. Returns the new id.
    pub fn append(&self, person: &NewPerson, embedding: &Embedding) -> Result<PersonId, StoreError> {
        self.append_with(person, embedding, commit)
    }

    /// `append` with the final table rename supplied by the caller.
    fn append_with<C>(&self, person: &NewPerson, embedding: &Embedding, commit_table: C) -> Result<PersonId, StoreError>
    where
        C: FnOnce(&Path, &Path) -> Result<(), StoreError>,
    {
        let mut persons = self.persons()?;
        let old_blob_bytes = read_optional(&self.blob_path)?;
        let mut blob = self.decode_blob(old_blob_bytes.as_deref())?;

        self.check_dimension(&blob, &persons, embedding)?;

        let id = persons.iter().map(|p| p.id).max().map_or(1, |max| max + 1);
        if blob.entries.contains_key(&id) {
            tracing::warn!(person_id = id, "overwriting orphaned embeddings");
        }
        blob.entries.insert(id, vec![embedding.values.clone()]);

        let record = PersonRecord::from_new(id, person.clone(), Local::now().naive_local().trunc_subsecs(0));
        persons.push(record);

        let blob_bytes = encode_blob(&blob, &self.blob_path)?;
        let table_bytes = encode_table(&persons, &self.table_path)?;

        let blob_tmp = write_temp(&self.blob_path, &blob_bytes)?;
        let table_tmp = match write_temp(&self.table_path, &table_bytes) {
            Ok(tmp) => tmp,
            Err(e) => {
                let _ = fs::remove_file(&blob_tmp);
                return Err(e);
            }
        };

        if let Err(e) = commit(&blob_tmp, &self.blob_path) {
            let _ = fs::remove_file(&table_tmp);
            return Err(e);
        }
        if let Err(e) = commit_table(&table_tmp, &self.table_path) {
            let _ = fs::remove_file(&table_tmp);
            self.restore_blob(old_blob_bytes.as_deref());
            return Err(e);
        }

        tracing::info!(
            person_id = id,
            name = %person.name,
            dim = embedding.dim(),
            "registered person"
        );
        Ok(id)
    }

    /// Add another capture for an already registered person.
    pub fn add_embedding(&self, person_id: PersonId, embedding: &Embedding) -> Result<usize, StoreError> {
        let persons = self.persons()?;
        if !persons.iter().any(|p| p.id == person_id) {
            return Err(StoreError::UnknownPerson(person_id));
        }

        let mut blob = self.decode_blob(read_optional(&self.blob_path)?.as_deref())?;
        self.check_dimension(&blob, &persons, embedding)?;

        let samples = blob.entries.entry(person_id).or_default();
        samples.push(embedding.values.clone());
        let count = samples.len();

        let bytes = encode_blob(&blob, &self.blob_path)?;
        let tmp = write_temp(&self.blob_path, &bytes)?;
        commit(&tmp, &self.blob_path)?;

        tracing::info!(person_id, samples = count, "added embedding");
        Ok(count)
    }

    /// Every person with every embedding, by person id then insertion order.
    pub fn load_all(&self) -> Result<Vec<(PersonRecord, EmbeddingRecord)>, StoreError> {
        let mut persons = self.persons()?;
        persons.sort_by_key(|p| p.id);
        let blob = self.decode_blob(read_optional(&self.blob_path)?.as_deref())?;

        for id in blob.entries.keys() {
            if persons.binary_search_by_key(id, |p| p.id).is_err() {
                tracing::warn!(person_id = id, "ignoring embeddings with no person row");
            }
        }

        let mut pairs = Vec::new();
        for person in persons {
            let Some(samples) = blob.entries.get(&person.id) else {
                tracing::warn!(person_id = person.id, "person has no embeddings");
                continue;
            };
            for values in samples {
                pairs.push((
                    person.clone(),
                    EmbeddingRecord {
                        person_id: person.id,
                        embedding: Embedding::new(values.clone()),
                    },
                ));
            }
        }

        tracing::debug!(embeddings = pairs.len(), "loaded known faces");
        Ok(pairs)
    }

    /// The person table in file order.
    pub fn persons(&self) -> Result<Vec<PersonRecord>, StoreError> {
        match read_optional(&self.table_path)? {
            Some(bytes) => table::decode(&bytes, &self.table_path),
            None => Ok(Vec::new()),
        }
    }

    pub fn find_by_id(&self, id: PersonId) -> Result<Option<PersonRecord>, StoreError> {
        Ok(self.persons()?.into_iter().find(|p| p.id == id))
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        Ok(self.persons()?.len())
    }

    fn decode_blob(&self, bytes: Option<&[u8]>) -> Result<EmbeddingBlob, StoreError> {
        match bytes {
            Some(bytes) => EmbeddingBlob::decode(bytes, &self.blob_path),
            None => Ok(EmbeddingBlob::new()),
        }
    }

    fn check_dimension(
        &self,
        blob: &EmbeddingBlob,
        persons: &[PersonRecord],
        embedding: &Embedding,
    ) -> Result<(), StoreError> {
        match blob.dimension_among(persons.iter().map(|p| p.id)) {
            Some(expected) if expected != embedding.dim() => Err(StoreError::DimensionMismatch {
                expected,
                actual: embedding.dim(),
            }),
            _ => Ok(()),
        }
    }

    fn restore_blob(&self, previous: Option<&[u8]>) {
        let restored = match previous {
            Some(bytes) => write_temp(&self.blob_path, bytes).and_then(|tmp| commit(&tmp, &self.blob_path)),
            None => fs::remove_file(&self.blob_path).map_err(|source| StoreError::Write {
                path: self.blob_path.clone(),
                source,
            }),
        };
        if let Err(e) = restored {
            // Load ignores the orphaned entry, so the store still reads consistently.
            tracing::error!(error = %e, "failed to restore embedding blob");
        }
    }
}

impl PersonSink for FaceStore {
    type Error = StoreError;

    fn persist(&mut self, person: &NewPerson, embedding: &Embedding) -> Result<PersonId, StoreError> {
        self.append(person, embedding)
    }
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, StoreError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(StoreError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn encode_table(persons: &[PersonRecord], path: &Path) -> Result<Vec<u8>, StoreError> {
    table::encode(persons).map_err(|e| StoreError::Write {
        path: path.to_path_buf(),
        source: io::Error::other(e.to_string()),
    })
}

fn encode_blob(blob: &EmbeddingBlob, path: &Path) -> Result<Vec<u8>, StoreError> {
    blob.encode().map_err(|e| StoreError::Write {
        path: path.to_path_buf(),
        source: io::Error::other(e.to_string()),
    })
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write `bytes` to the sibling temp file of `path` and fsync it.
fn write_temp(path: &Path, bytes: &[u8]) -> Result<PathBuf, StoreError> {
    let tmp = temp_path(path);
    let result = fs::File::create(&tmp).and_then(|mut file| {
        file.write_all(bytes)?;
        file.sync_all()
    });
    match result {
        Ok(()) => Ok(tmp),
        Err(source) => {
            let _ = fs::remove_file(&tmp);
            Err(StoreError::Write { path: tmp, source })
        }
    }
}

fn commit(tmp: &Path, path: &Path) -> Result<(), StoreError> {
    fs::rename(tmp, path).map_err(|source| StoreError::Write {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::registration::{RegistrationFlow, RegistrationInput, Step};
    use rollcall_core::{BoundingBox, DetectedFace};

    fn person(name: &str, roll: &str) -> NewPerson {
        NewPerson {
            name: name.into(),
            class: "10A".into(),
            roll_number: roll.into(),
            email: format!("{}@school.test", name.to_lowercase()),
            phone: String::new(),
        }
    }

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    fn open_temp() -> (tempfile::TempDir, FaceStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FaceStore::open(dir.path().join("data")).unwrap();
        (dir, store)
    }

    fn snapshot(store: &FaceStore) -> (Vec<u8>, Option<Vec<u8>>) {
        (
            fs::read(store.table_path()).unwrap(),
            fs::read(store.blob_path()).ok(),
        )
    }

    #[test]
    fn test_open_creates_header_only_table() {
        let (_dir, store) = open_temp();
        let text = fs::read_to_string(store.table_path()).unwrap();
        assert_eq!(text, "id,name,class,roll_number,email,phone,registered_at\n");
        assert_eq!(store.count().unwrap(), 0);
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn test_append_then_load_round_trip() {
        let (_dir, store) = open_temp();
        let alice = person("Alice", "5");
        let v = emb(&[0.25, -0.5, 1.0]);

        let id = store.append(&alice, &v).unwrap();
        assert_eq!(id, 1);

        let all = store.load_all().unwrap();
        assert_eq!(all.len(), 1);
        let (record, embedding) = &all[0];
        assert_eq!(record.id, 1);
        assert_eq!(record.name, "Alice");
        assert_eq!(record.class, "10A");
        assert_eq!(record.roll_number, "5");
        assert_eq!(record.email, "alice@school.test");
        assert_eq!(embedding.person_id, 1);
        assert_eq!(embedding.embedding, v);
    }

    #[test]
    fn test_ids_increment_and_reopen() {
        let (dir, store) = open_temp();
        assert_eq!(store.append(&person("Alice", "5"), &emb(&[0.0, 0.0])).unwrap(), 1);
        assert_eq!(store.append(&person("Bob", "6"), &emb(&[1.0, 1.0])).unwrap(), 2);

        let reopened = FaceStore::open(dir.path().join("data")).unwrap();
        assert_eq!(reopened.count().unwrap(), 2);
        assert_eq!(reopened.append(&person("Cara", "7"), &emb(&[2.0, 2.0])).unwrap(), 3);
        assert_eq!(reopened.find_by_id(2).unwrap().map(|p| p.name), Some("Bob".to_string()));
        assert_eq!(reopened.find_by_id(42).unwrap(), None);

        let ids: Vec<u64> = reopened.load_all().unwrap().iter().map(|(p, _)| p.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_add_embedding_keeps_insertion_order() {
        let (_dir, store) = open_temp();
        let id = store.append(&person("Alice", "5"), &emb(&[0.0, 0.0])).unwrap();
        assert_eq!(store.add_embedding(id, &emb(&[0.1, 0.1])).unwrap(), 2);

        let all = store.load_all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].1.embedding, emb(&[0.0, 0.0]));
        assert_eq!(all[1].1.embedding, emb(&[0.1, 0.1]));
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_add_embedding_unknown_person() {
        let (_dir, store) = open_temp();
        assert!(matches!(
            store.add_embedding(9, &emb(&[0.0])),
            Err(StoreError::UnknownPerson(9))
        ));
    }

    #[test]
    fn test_dimension_mismatch_leaves_store_unchanged() {
        let (_dir, store) = open_temp();
        store.append(&person("Alice", "5"), &emb(&[0.0, 0.0, 0.0])).unwrap();
        let before = snapshot(&store);

        let err = store.append(&person("Bob", "6"), &emb(&[0.0, 0.0])).unwrap_err();
        assert!(matches!(err, StoreError::DimensionMismatch { expected: 3, actual: 2 }));
        assert!(matches!(
            store.add_embedding(1, &emb(&[1.0])),
            Err(StoreError::DimensionMismatch { .. })
        ));
        assert_eq!(snapshot(&store), before);
    }

    #[test]
    fn test_write_failure_leaves_store_unchanged() {
        let (_dir, store) = open_temp();
        store.append(&person("Alice", "5"), &emb(&[0.0, 0.0])).unwrap();
        let before = snapshot(&store);

        // A directory squatting on the temp path makes the table write fail.
        let blocker = temp_path(store.table_path());
        fs::create_dir(&blocker).unwrap();

        let err = store.append(&person("Bob", "6"), &emb(&[1.0, 1.0])).unwrap_err();
        assert!(matches!(err, StoreError::Write { .. }));
        assert_eq!(snapshot(&store), before);
        assert!(!temp_path(store.blob_path()).exists());

        fs::remove_dir(&blocker).unwrap();
        assert_eq!(store.append(&person("Bob", "6"), &emb(&[1.0, 1.0])).unwrap(), 2);
    }

    fn failing_rename(_tmp: &Path, path: &Path) -> Result<(), StoreError> {
        Err(StoreError::Write {
            path: path.to_path_buf(),
            source: io::Error::other("rename refused"),
        })
    }

    fn leftover_temps(store: &FaceStore) -> bool {
        temp_path(store.table_path()).exists() || temp_path(store.blob_path()).exists()
    }

    #[test]
    fn test_table_commit_failure_restores_blob() {
        let (_dir, store) = open_temp();
        store.append(&person("Alice", "5"), &emb(&[0.0, 0.0])).unwrap();
        let before = snapshot(&store);

        let err = store
            .append_with(&person("Bob", "6"), &emb(&[1.0, 1.0]), failing_rename)
            .unwrap_err();
        assert!(matches!(err, StoreError::Write { .. }));

        // Blob bytes and rows are exactly as before, with no temp files left.
        assert_eq!(snapshot(&store), before);
        assert_eq!(store.count().unwrap(), 1);
        assert_eq!(store.load_all().unwrap().len(), 1);
        assert!(!leftover_temps(&store));

        assert_eq!(store.append(&person("Bob", "6"), &emb(&[1.0, 1.0])).unwrap(), 2);
    }

    #[test]
    fn test_first_append_commit_failure_removes_new_blob() {
        let (_dir, store) = open_temp();
        assert!(!store.blob_path().exists());

        store
            .append_with(&person("Alice", "5"), &emb(&[0.0, 0.0]), failing_rename)
            .unwrap_err();

        assert!(!store.blob_path().exists());
        assert_eq!(store.count().unwrap(), 0);
        assert!(store.load_all().unwrap().is_empty());
        assert!(!leftover_temps(&store));
    }

    #[test]
    fn test_orphaned_embeddings_ignored_and_id_reused() {
        let (_dir, store) = open_temp();
        store.append(&person("Alice", "5"), &emb(&[0.0, 0.0])).unwrap();

        // Simulate a crash after the blob rename but before the table rename.
        let mut blob = EmbeddingBlob::decode(&fs::read(store.blob_path()).unwrap(), store.blob_path()).unwrap();
        blob.entries.insert(2, vec![vec![9.0, 9.0]]);
        fs::write(store.blob_path(), blob.encode().unwrap()).unwrap();

        let all = store.load_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(store.count().unwrap(), 1);

        let id = store.append(&person("Bob", "6"), &emb(&[1.0, 1.0])).unwrap();
        assert_eq!(id, 2);
        let bob: Vec<_> = store.load_all().unwrap().into_iter().filter(|(p, _)| p.id == 2).collect();
        assert_eq!(bob.len(), 1);
        assert_eq!(bob[0].1.embedding, emb(&[1.0, 1.0]));
    }

    #[test]
    fn test_corrupt_blob_reported() {
        let (_dir, store) = open_temp();
        store.append(&person("Alice", "5"), &emb(&[0.0, 0.0])).unwrap();
        fs::write(store.blob_path(), b"definitely not embeddings").unwrap();

        let err = store.load_all().unwrap_err();
        assert!(matches!(err, StoreError::CorruptData { .. }));
        // The table alone is still readable.
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_registration_flow_persists_through_store() {
        let (_dir, mut store) = open_temp();
        let mut flow = RegistrationFlow::new();
        let face = DetectedFace {
            bbox: BoundingBox {
                x: 0.0,
                y: 0.0,
                width: 10.0,
                height: 10.0,
                confidence: 0.9,
                landmarks: None,
            },
            embedding: emb(&[0.5, 0.5]),
        };

        flow.apply(RegistrationInput::Begin(person("Alice", "5")), &mut store).unwrap();
        flow.apply(RegistrationInput::Frame(vec![face]), &mut store).unwrap();
        flow.apply(RegistrationInput::Capture, &mut store).unwrap();
        let step = flow.apply(RegistrationInput::Confirm, &mut store).unwrap();

        assert_eq!(step, Step::Persisted(1));
        assert_eq!(store.find_by_id(1).unwrap().map(|p| p.name), Some("Alice".to_string()));
    }
}
