//! Byte layout shared by the key-value backends.
//!
//! Keys are `[table length: u16 BE][table][record key]` so that tables can
//! never collide regardless of their contents. Values are bincode-encoded
//! [`FieldMap`]s; a value written through the single-record path is a
//! record with one field named [`VALUE_FIELD`].

use crate::batch::FieldMap;
use crate::error::{DbError, DbResult};

/// Field holding the payload of single-record writes.
pub const VALUE_FIELD: &str = "value";

pub fn record_key(table: &str, key: &str) -> DbResult<Vec<u8>> {
    let table_len = u16::try_from(table.len()).map_err(|_| {
        DbError::Validation(format!("table name is {} bytes, limit is {}", table.len(), u16::MAX))
    })?;
    let mut out = Vec::with_capacity(2 + table.len() + key.len());
    out.extend_from_slice(&table_len.to_be_bytes());
    out.extend_from_slice(table.as_bytes());
    out.extend_from_slice(key.as_bytes());
    Ok(out)
}

pub fn encode_record(record: &FieldMap) -> DbResult<Vec<u8>> {
    Ok(bincode::serialize(record)?)
}

pub fn decode_record(bytes: &[u8]) -> DbResult<FieldMap> {
    Ok(bincode::deserialize(bytes)?)
}

pub fn single_value(value: &str) -> FieldMap {
    FieldMap::from([(VALUE_FIELD.to_string(), value.as_bytes().to_vec())])
}

pub fn encode_value(value: &str) -> DbResult<Vec<u8>> {
    encode_record(&single_value(value))
}

/// Render a record as the opaque string of the single-record path.
///
/// Single-field records written by `insert`/`update` come back verbatim;
/// records written through the batch path are rendered as a JSON object.
pub fn record_to_value(mut record: FieldMap) -> DbResult<String> {
    if record.len() == 1 {
        if let Some(raw) = record.remove(VALUE_FIELD) {
            return String::from_utf8(raw).map_err(DbError::backend);
        }
    }
    let rendered: serde_json::Map<String, serde_json::Value> = record
        .into_iter()
        .map(|(field, raw)| {
            let text = String::from_utf8_lossy(&raw).into_owned();
            (field, serde_json::Value::String(text))
        })
        .collect();
    Ok(serde_json::to_string(&rendered)?)
}

pub fn decode_value(bytes: &[u8]) -> DbResult<String> {
    record_to_value(decode_record(bytes)?)
}
