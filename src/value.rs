// used for date and datetime attribute values
use chrono::{NaiveDate, NaiveDateTime};
// used for decimal numbers
use bigdecimal::BigDecimal;

// used to print out readable forms of a value
use std::fmt;
// used to indicate that values need to be hashable (identity keys are value tuples)
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// The closed set of kinds an attribute field can declare.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    Text,
    Integer,
    Boolean,
    Decimal,
    Date,
    DateTime,
    Json,
    /// No kind constraint; any value is accepted.
    Any,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ValueKind::Text => "text",
            ValueKind::Integer => "int",
            ValueKind::Boolean => "bool",
            ValueKind::Decimal => "decimal",
            ValueKind::Date => "date",
            ValueKind::DateTime => "datetime",
            ValueKind::Json => "json",
            ValueKind::Any => "any",
        };
        write!(f, "{}", name)
    }
}

/// A JSON document usable as an attribute value.
///
/// Wrapped so that equality and hashing exist; both go through the
/// serialized form, which is also how the value travels in snapshots.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(pub serde_json::Value);

impl Document {
    pub fn from_str(s: &str) -> Option<Document> {
        match serde_json::from_str(s) {
            Ok(json) => Some(Document(json)),
            _ => None,
        }
    }
}
impl Eq for Document {}
impl Hash for Document {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.to_string().hash(state);
    }
}
impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An attribute value.
///
/// `Void` is the distinguished "absent" value: it is what a cleared field
/// without a declared default reads as, and it is distinct from an empty
/// string, zero, or JSON null.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Value {
    Text(String),
    Integer(i64),
    Boolean(bool),
    Decimal(BigDecimal),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    Json(Document),
    Void,
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Text(_) => ValueKind::Text,
            Value::Integer(_) => ValueKind::Integer,
            Value::Boolean(_) => ValueKind::Boolean,
            Value::Decimal(_) => ValueKind::Decimal,
            Value::Date(_) => ValueKind::Date,
            Value::DateTime(_) => ValueKind::DateTime,
            Value::Json(_) => ValueKind::Json,
            Value::Void => ValueKind::Any,
        }
    }
    pub fn is_void(&self) -> bool {
        matches!(self, Value::Void)
    }
    /// Whether this value satisfies the declared kind of a field.
    /// `Void` satisfies every kind, and `Any` accepts every value.
    pub fn fits(&self, kind: ValueKind) -> bool {
        self.is_void() || kind == ValueKind::Any || self.kind() == kind
    }
    pub fn text(s: &str) -> Value {
        Value::Text(s.to_owned())
    }
    /// Text payload, when this is a text value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Text(s) => write!(f, "{}", s),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Decimal(d) => write!(f, "{}", d),
            Value::Date(d) => write!(f, "{}", d),
            Value::DateTime(d) => write!(f, "{}", d),
            Value::Json(j) => write!(f, "{}", j),
            Value::Void => write!(f, "∅"),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Value {
        Value::Text(s.to_owned())
    }
}
impl From<String> for Value {
    fn from(s: String) -> Value {
        Value::Text(s)
    }
}
impl From<i64> for Value {
    fn from(i: i64) -> Value {
        Value::Integer(i)
    }
}
impl From<bool> for Value {
    fn from(b: bool) -> Value {
        Value::Boolean(b)
    }
}
impl From<BigDecimal> for Value {
    fn from(d: BigDecimal) -> Value {
        Value::Decimal(d)
    }
}
impl From<NaiveDate> for Value {
    fn from(d: NaiveDate) -> Value {
        Value::Date(d)
    }
}
impl From<NaiveDateTime> for Value {
    fn from(d: NaiveDateTime) -> Value {
        Value::DateTime(d)
    }
}
