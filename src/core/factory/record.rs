//! Positional field records: the opaque blob stored per entry.
//!
//! The field order per entry type is fixed. New fields are only ever
//! appended, so readers check a minimum count and ignore the tail.

use serde::{Deserialize, Serialize};

use crate::core::entry::EmbeddedType;
use crate::core::error::{Result, StoreError};
use crate::core::priority::Priority;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Field {
    Null,
    Str(String),
    Long(i64),
    Int(i32),
    Bool(bool),
    Bytes(Vec<u8>),
}

impl Field {
    pub fn opt_str(value: Option<&str>) -> Field {
        value.map_or(Field::Null, |s| Field::Str(s.to_string()))
    }
}

pub fn encode(fields: &[Field]) -> Result<Vec<u8>> {
    bincode::serialize(fields).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Typed access to a decoded record with the row's coordinates for errors.
pub struct FieldReader {
    fields: Vec<Field>,
    entry_type: EmbeddedType,
    priority: Priority,
    timestamp: i64,
}

impl FieldReader {
    pub fn decode(blob: &[u8], entry_type: EmbeddedType, priority: Priority, timestamp: i64) -> Result<Self> {
        let fields: Vec<Field> = if blob.is_empty() {
            Vec::new()
        } else {
            bincode::deserialize(blob)
                .map_err(|e| StoreError::Internal(format!("undecodable {entry_type} record: {e}")))?
        };
        Ok(Self {
            fields,
            entry_type,
            priority,
            timestamp,
        })
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Fails with `VersionIncompatible` when fewer than `min` fields are present.
    pub fn require(&self, min: usize) -> Result<()> {
        if self.fields.len() < min {
            return Err(StoreError::VersionIncompatible {
                entry_type: self.entry_type.as_str().to_string(),
                expected: min,
                got: self.fields.len(),
                priority: self.priority.as_i32(),
                timestamp: self.timestamp,
            });
        }
        Ok(())
    }

    fn mismatch(&self, index: usize, wanted: &str) -> StoreError {
        StoreError::Internal(format!(
            "{} record field {index} is {:?}, expected {wanted}",
            self.entry_type,
            self.fields.get(index)
        ))
    }

    pub fn opt_str(&self, index: usize) -> Result<Option<String>> {
        match self.fields.get(index) {
            None | Some(Field::Null) => Ok(None),
            Some(Field::Str(s)) => Ok(Some(s.clone())),
            Some(_) => Err(self.mismatch(index, "string")),
        }
    }

    pub fn str(&self, index: usize) -> Result<String> {
        self.opt_str(index)?
            .ok_or_else(|| self.mismatch(index, "non-null string"))
    }

    pub fn long(&self, index: usize) -> Result<i64> {
        match self.fields.get(index) {
            Some(Field::Long(v)) => Ok(*v),
            Some(Field::Int(v)) => Ok(*v as i64),
            _ => Err(self.mismatch(index, "long")),
        }
    }

    /// Integer at `index`, or `default` when the record is shorter.
    pub fn int_or(&self, index: usize, default: i32) -> Result<i32> {
        match self.fields.get(index) {
            None | Some(Field::Null) => Ok(default),
            Some(Field::Int(v)) => Ok(*v),
            Some(Field::Long(v)) => i32::try_from(*v).map_err(|_| self.mismatch(index, "int")),
            Some(_) => Err(self.mismatch(index, "int")),
        }
    }

    pub fn bytes_or_empty(&self, index: usize) -> Result<Vec<u8>> {
        match self.fields.get(index) {
            None | Some(Field::Null) => Ok(Vec::new()),
            Some(Field::Bytes(b)) => Ok(b.clone()),
            Some(_) => Err(self.mismatch(index, "bytes")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_record_is_version_incompatible() {
        let blob = encode(&[Field::Str("a".into())]).unwrap();
        let reader = FieldReader::decode(&blob, EmbeddedType::HistoryRef, Priority::NORM, 42).unwrap();
        match reader.require(2) {
            Err(StoreError::VersionIncompatible { expected, got, timestamp, .. }) => {
                assert_eq!((expected, got, timestamp), (2, 1, 42));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn missing_trailing_int_uses_default() {
        let blob = encode(&[Field::Long(7)]).unwrap();
        let reader = FieldReader::decode(&blob, EmbeddedType::MsgXml, Priority::NORM, 0).unwrap();
        assert_eq!(reader.long(0).unwrap(), 7);
        assert_eq!(reader.int_or(3, 0).unwrap(), 0);
    }

    #[test]
    fn type_mismatch_is_internal_error() {
        let blob = encode(&[Field::Bool(true)]).unwrap();
        let reader = FieldReader::decode(&blob, EmbeddedType::Session, Priority::NORM, 0).unwrap();
        assert!(matches!(reader.str(0), Err(StoreError::Internal(_))));
    }
}
