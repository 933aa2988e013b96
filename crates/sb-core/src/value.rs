use std::fmt;

use indexmap::IndexMap;
use num_bigint::BigInt;
use num_traits::ToPrimitive;
use serde::{Deserialize, Serialize};

/// An interpreter integer: machine width when it fits, arbitrary precision
/// otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScriptInt {
    Small(i64),
    Big(BigInt),
}

impl ScriptInt {
    pub fn from_bigint(value: BigInt) -> Self {
        match value.to_i64() {
            Some(small) => Self::Small(small),
            None => Self::Big(value),
        }
    }

    pub fn to_i64(&self) -> Option<i64> {
        match self {
            Self::Small(value) => Some(*value),
            Self::Big(value) => value.to_i64(),
        }
    }

    pub fn to_bigint(&self) -> BigInt {
        match self {
            Self::Small(value) => BigInt::from(*value),
            Self::Big(value) => value.clone(),
        }
    }
}

impl From<i64> for ScriptInt {
    fn from(value: i64) -> Self {
        Self::Small(value)
    }
}

impl fmt::Display for ScriptInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Small(value) => write!(f, "{}", value),
            Self::Big(value) => write!(f, "{}", value),
        }
    }
}

/// Named fields in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScriptStruct {
    fields: IndexMap<String, ScriptValue>,
}

impl ScriptStruct {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fields<K: Into<String>>(fields: impl IntoIterator<Item = (K, ScriptValue)>) -> Self {
        let mut out = Self::new();
        for (name, value) in fields {
            out.insert(name, value);
        }
        out
    }

    /// Re-assigning a field keeps its original position.
    pub fn insert(&mut self, name: impl Into<String>, value: ScriptValue) {
        self.fields.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&ScriptValue> {
        self.fields.get(name)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &ScriptValue)> {
        self.fields.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// The evaluation namespace of a bridged instance.
pub type Namespace = IndexMap<String, ScriptValue>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ScriptValue {
    None,
    Bool(bool),
    Int(ScriptInt),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Tuple(Vec<ScriptValue>),
    List(Vec<ScriptValue>),
    /// Unique elements, kept in insertion order.
    Set(Vec<ScriptValue>),
    /// Unique keys, kept in insertion order.
    Mapping(Vec<(ScriptValue, ScriptValue)>),
    Struct(ScriptStruct),
    /// A callable interpreter value, by name.
    Function(String),
    /// Any other interpreter value, by its type name.
    Opaque(String),
}

impl ScriptValue {
    pub fn int(value: i64) -> Self {
        Self::Int(ScriptInt::Small(value))
    }

    pub fn string(value: impl Into<String>) -> Self {
        Self::String(value.into())
    }

    /// Drops later duplicates.
    pub fn set(items: Vec<ScriptValue>) -> Self {
        let mut unique: Vec<ScriptValue> = Vec::with_capacity(items.len());
        for item in items {
            if !unique.contains(&item) {
                unique.push(item);
            }
        }
        Self::Set(unique)
    }

    /// A repeated key takes the later value but keeps its first position.
    pub fn mapping(entries: Vec<(ScriptValue, ScriptValue)>) -> Self {
        let mut unique: Vec<(ScriptValue, ScriptValue)> = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            match unique.iter_mut().find(|(existing, _)| *existing == key) {
                Some(entry) => entry.1 = value,
                None => unique.push((key, value)),
            }
        }
        Self::Mapping(unique)
    }

    pub fn type_name(&self) -> &str {
        match self {
            Self::None => "NoneType",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::Tuple(_) => "tuple",
            Self::List(_) => "list",
            Self::Set(_) => "set",
            Self::Mapping(_) => "dict",
            Self::Struct(_) => "struct",
            Self::Function(_) => "function",
            Self::Opaque(type_name) => type_name.as_str(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value.as_str()),
            _ => None,
        }
    }
}

impl PartialEq for ScriptValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::None, Self::None) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            (Self::Tuple(a), Self::Tuple(b)) | (Self::List(a), Self::List(b)) => a == b,
            (Self::Set(a), Self::Set(b)) => {
                a.len() == b.len() && a.iter().all(|item| b.contains(item))
            }
            (Self::Mapping(a), Self::Mapping(b)) => a == b,
            (Self::Struct(a), Self::Struct(b)) => a == b,
            (Self::Function(a), Self::Function(b)) => a == b,
            (Self::Opaque(a), Self::Opaque(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for ScriptValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Bool(true) => f.write_str("True"),
            Self::Bool(false) => f.write_str("False"),
            Self::Int(value) => write!(f, "{}", value),
            Self::Float(value) => write!(f, "{:?}", value),
            Self::String(value) => write!(f, "{:?}", value),
            Self::Bytes(value) => write!(f, "b{:?}", String::from_utf8_lossy(value)),
            Self::Tuple(items) if items.len() == 1 => write!(f, "({},)", items[0]),
            Self::Tuple(items) => write!(f, "({})", join(items)),
            Self::List(items) => write!(f, "[{}]", join(items)),
            Self::Set(items) => write!(f, "set([{}])", join(items)),
            Self::Mapping(entries) => {
                let body = entries
                    .iter()
                    .map(|(key, value)| format!("{}: {}", key, value))
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(f, "{{{}}}", body)
            }
            Self::Struct(fields) => {
                let body = fields
                    .fields()
                    .map(|(name, value)| format!("{} = {}", name, value))
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(f, "struct({})", body)
            }
            Self::Function(name) => write!(f, "<function {}>", name),
            Self::Opaque(type_name) => write!(f, "<{}>", type_name),
        }
    }
}

fn join(items: &[ScriptValue]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
