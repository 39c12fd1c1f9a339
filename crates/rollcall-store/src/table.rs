//! Person table: one CSV row per registered person.

use crate::store::StoreError;
use chrono::NaiveDateTime;
use rollcall_core::PersonRecord;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const TABLE_FILE: &str = "person_details.csv";
pub const HEADER: [&str; 7] = ["id", "name", "class", "roll_number", "email", "phone", "registered_at"];
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Serialize, Deserialize)]
struct Row {
    id: u64,
    name: String,
    class: String,
    roll_number: String,
    email: String,
    phone: String,
    registered_at: String,
}

impl From<&PersonRecord> for Row {
    fn from(p: &PersonRecord) -> Self {
        Self {
            id: p.id,
            name: p.name.clone(),
            class: p.class.clone(),
            roll_number: p.roll_number.clone(),
            email: p.email.clone(),
            phone: p.phone.clone(),
            registered_at: p.registered_at.format(TIMESTAMP_FORMAT).to_string(),
        }
    }
}

/// Parse a person table. Rows come back in file order.
pub fn decode(bytes: &[u8], path: &Path) -> Result<Vec<PersonRecord>, StoreError> {
    let corrupt = |reason: String| StoreError::CorruptData {
        path: path.to_path_buf(),
        reason,
    };

    let mut reader = csv::Reader::from_reader(bytes);
    let mut persons = Vec::new();
    for (line, row) in reader.deserialize::<Row>().enumerate() {
        let row = row.map_err(|e| corrupt(format!("row {}: {e}", line + 1)))?;
        let registered_at = NaiveDateTime::parse_from_str(&row.registered_at, TIMESTAMP_FORMAT)
            .map_err(|e| corrupt(format!("row {}: bad timestamp {:?}: {e}", line + 1, row.registered_at)))?;
        persons.push(PersonRecord {
            id: row.id,
            name: row.name,
            class: row.class,
            roll_number: row.roll_number,
            email: row.email,
            phone: row.phone,
            registered_at,
        });
    }
    Ok(persons)
}

/// Serialize the whole table, header first.
pub fn encode(persons: &[PersonRecord]) -> Result<Vec<u8>, csv::Error> {
    let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(Vec::new());
    writer.write_record(HEADER)?;
    for person in persons {
        writer.serialize(Row::from(person))?;
    }
    writer.into_inner().map_err(|e| csv::Error::from(e.into_error()))
}
