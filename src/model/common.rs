use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::model::EntityKind;

/// Serial identifier of rows in the aspect, class and instance tables.
pub type Id = i64;

/// A non-null column value. Absent fields are NULL; there is no null variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Scalar {
    Int(i64),
    Number(f64),
    Text(String),
    Uuid(Uuid),
    Json(serde_json::Value),
}

impl Scalar {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Scalar::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Scalar::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Scalar::Uuid(u) => Some(*u),
            _ => None,
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Int(i) => write!(f, "{}", i),
            Scalar::Number(n) => write!(f, "{}", n),
            Scalar::Text(s) => write!(f, "{:?}", s),
            Scalar::Uuid(u) => write!(f, "{}", u),
            Scalar::Json(j) => write!(f, "{}", j),
        }
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Scalar::Text(value.to_string())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Scalar::Text(value)
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Scalar::Int(value)
    }
}

impl From<i32> for Scalar {
    fn from(value: i32) -> Self {
        Scalar::Int(i64::from(value))
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Scalar::Number(value)
    }
}

impl From<Uuid> for Scalar {
    fn from(value: Uuid) -> Self {
        Scalar::Uuid(value)
    }
}

impl From<serde_json::Value> for Scalar {
    fn from(value: serde_json::Value) -> Self {
        Scalar::Json(value)
    }
}

/// Column values of one row, keyed by column name. Ordered so that every
/// walk over a row (SQL generation, matching, logging) is deterministic.
pub type Row = BTreeMap<String, Scalar>;

/// One component of a primary key. Keys only ever hold integers and uuids,
/// which keeps them hashable and totally ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyPart {
    Int(i64),
    Uuid(Uuid),
}

impl KeyPart {
    pub fn from_scalar(value: &Scalar) -> Option<Self> {
        match value {
            Scalar::Int(i) => Some(KeyPart::Int(*i)),
            Scalar::Uuid(u) => Some(KeyPart::Uuid(*u)),
            _ => None,
        }
    }

    pub fn to_scalar(self) -> Scalar {
        match self {
            KeyPart::Int(i) => Scalar::Int(i),
            KeyPart::Uuid(u) => Scalar::Uuid(u),
        }
    }
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPart::Int(i) => write!(f, "{}", i),
            KeyPart::Uuid(u) => write!(f, "{}", u),
        }
    }
}

/// Primary key of a persisted row.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Key {
    Serial(i64),
    Uuid(Uuid),
    Composite(Vec<KeyPart>),
}

impl Key {
    /// Key components in key-column order.
    pub fn parts(&self) -> Vec<KeyPart> {
        match self {
            Key::Serial(i) => vec![KeyPart::Int(*i)],
            Key::Uuid(u) => vec![KeyPart::Uuid(*u)],
            Key::Composite(parts) => parts.clone(),
        }
    }

    /// Single integer parts become serial keys and single uuids supplied
    /// keys; anything longer is composite.
    pub fn from_parts(mut parts: Vec<KeyPart>) -> Self {
        if parts.len() == 1 {
            match parts.remove(0) {
                KeyPart::Int(i) => Key::Serial(i),
                KeyPart::Uuid(u) => Key::Uuid(u),
            }
        } else {
            Key::Composite(parts)
        }
    }

    pub fn as_serial(&self) -> Option<i64> {
        match self {
            Key::Serial(i) => Some(*i),
            _ => None,
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Serial(i) => write!(f, "{}", i),
            Key::Uuid(u) => write!(f, "{}", u),
            Key::Composite(parts) => {
                let parts: Vec<String> = parts.iter().map(|p| p.to_string()).collect();
                write!(f, "({})", parts.join(", "))
            }
        }
    }
}

/// Identifier of a persisted entity: its kind plus its primary key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId {
    pub kind: EntityKind,
    pub key: Key,
}

impl EntityId {
    pub fn new(kind: EntityKind, key: Key) -> Self {
        Self { kind, key }
    }

    pub fn serial(&self) -> Option<Id> {
        self.key.as_serial()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.key)
    }
}

/// Strip the `N:dataset:` prefix remote dataset ids carry and parse the rest.
pub fn parse_remote_id(value: &str) -> Result<Uuid, uuid::Error> {
    let trimmed = value.strip_prefix("N:dataset:").unwrap_or(value);
    Uuid::parse_str(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_id_prefix_is_stripped() {
        let bare = "55c5b69c-a5b8-4881-a105-e4048af26fa5";
        let prefixed = format!("N:dataset:{}", bare);

        assert_eq!(parse_remote_id(&prefixed).unwrap(), parse_remote_id(bare).unwrap());
        assert!(parse_remote_id("N:dataset:not-a-uuid").is_err());
    }

    #[test]
    fn test_key_parts_follow_key_shape() {
        let u = Uuid::new_v4();
        assert_eq!(Key::Serial(4).parts(), vec![KeyPart::Int(4)]);
        assert_eq!(Key::Uuid(u).parts(), vec![KeyPart::Uuid(u)]);
        assert_eq!(
            Key::Composite(vec![KeyPart::Uuid(u), KeyPart::Int(2)]).to_string(),
            format!("({}, 2)", u)
        );
    }
}
