use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::error::{Result, StoreError};

pub const HISTORY: &str = "history";
pub const CALLBACK: &str = "callback";
pub const SUBJECT: &str = "subject";
pub const MSG_UNIT_STORE: &str = "msgUnitStore";
pub const TOPIC_STORE: &str = "topicStore";
pub const SESSION: &str = "session";
pub const SUBSCRIBE: &str = "subscribe";

/// Name of a storage area, `prefix:postfix`.
///
/// The composed form is built once; equality and hashing use it directly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StorageId {
    id: String,
    split: usize,
}

impl StorageId {
    pub fn new(prefix: &str, postfix: &str) -> Result<Self> {
        if prefix.is_empty() || prefix.contains(':') {
            return Err(StoreError::Configuration(format!(
                "invalid storage prefix '{prefix}'"
            )));
        }
        Ok(Self {
            id: format!("{prefix}:{postfix}"),
            split: prefix.len(),
        })
    }

    /// Splits on the first `:`.
    pub fn parse(id: &str) -> Result<Self> {
        match id.find(':') {
            Some(0) | None => Err(StoreError::Configuration(format!(
                "storage id '{id}' must have the form prefix:postfix"
            ))),
            Some(split) => Ok(Self {
                id: id.to_string(),
                split,
            }),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.id[..self.split]
    }

    pub fn postfix(&self) -> &str {
        &self.id[self.split + 1..]
    }

    pub fn as_str(&self) -> &str {
        &self.id
    }

    /// Postfix reduced to characters safe for a file name.
    pub fn file_stem(&self) -> String {
        self.id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
            .collect()
    }

    /// Queues that hold references into the shared payload store and must
    /// adjust reference counts on add/remove.
    pub fn holds_references(&self) -> bool {
        matches!(self.prefix(), HISTORY | CALLBACK | SUBJECT)
    }

    pub fn is_history(&self) -> bool {
        self.prefix() == HISTORY
    }

    /// `(queue kind, id1, id2)` used to match threshold rules.
    ///
    /// history and subject queues are identified by the last path segment;
    /// callback queues by `(subject, session)` from the last two segments.
    pub fn event_coordinates(&self) -> Option<(String, String, String)> {
        let kind = self.prefix();
        let postfix = self.postfix();
        match kind {
            HISTORY | SUBJECT => {
                let pos = postfix.rfind('/')?;
                Some((kind.to_string(), postfix[pos + 1..].to_string(), String::new()))
            }
            CALLBACK => {
                let pos = postfix.rfind('/')?;
                let session = &postfix[pos + 1..];
                let head = &postfix[..pos];
                let pos = head.rfind('/')?;
                Some((kind.to_string(), head[pos + 1..].to_string(), session.to_string()))
            }
            _ => None,
        }
    }
}

impl fmt::Display for StorageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

impl FromStr for StorageId {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        StorageId::parse(s)
    }
}

impl TryFrom<String> for StorageId {
    type Error = StoreError;

    fn try_from(s: String) -> Result<Self> {
        StorageId::parse(&s)
    }
}

impl From<StorageId> for String {
    fn from(id: StorageId) -> String {
        id.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_first_colon() {
        let id = StorageId::parse("callback:/node/heron/client/joe/session:1").unwrap();
        assert_eq!(id.prefix(), "callback");
        assert_eq!(id.postfix(), "/node/heron/client/joe/session:1");
        assert_eq!(id.to_string(), "callback:/node/heron/client/joe/session:1");
    }

    #[test]
    fn missing_colon_is_configuration_error() {
        let err = StorageId::parse("history").unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn equality_uses_composed_string() {
        let a = StorageId::new("history", "/node/a/topic/x").unwrap();
        let b = StorageId::parse("history:/node/a/topic/x").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn callback_coordinates_use_subject_and_session() {
        let id = StorageId::parse("callback:/node/heron/client/joe/1").unwrap();
        let (kind, id1, id2) = id.event_coordinates().unwrap();
        assert_eq!(kind, "callback");
        assert_eq!(id1, "joe");
        assert_eq!(id2, "1");
    }

    #[test]
    fn stores_have_no_coordinates() {
        let id = StorageId::parse("msgUnitStore:/node/heron/topic/x").unwrap();
        assert!(id.event_coordinates().is_none());
        assert!(!id.holds_references());
    }
}
