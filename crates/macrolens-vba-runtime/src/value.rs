use std::cell::RefCell;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use crate::ast::Procedure;

pub type ListRef = Rc<RefCell<Vec<Value>>>;
pub type MapRef = Rc<RefCell<MapObject>>;

/// A faked COM object or `Scripting.Dictionary`. Entries keep insertion
/// order so `.Keys`/`.Items` round-trip deterministically.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MapObject {
    /// Lowercased prog id (`scripting.filesystemobject`, `adodb.stream`, ...)
    /// or an empty string for plain dictionaries.
    pub kind: String,
    pub entries: Vec<(String, Value)>,
}

impl MapObject {
    pub fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_ascii_lowercase(),
            entries: Vec::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        let key = key.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|(k, _)| k.to_ascii_lowercase() == key)
            .map(|(_, v)| v)
    }

    pub fn insert(&mut self, key: &str, value: Value) {
        let lower = key.to_ascii_lowercase();
        for (k, v) in self.entries.iter_mut() {
            if k.to_ascii_lowercase() == lower {
                *v = value;
                return;
            }
        }
        self.entries.push((key.to_string(), value));
    }

    pub fn remove(&mut self, key: &str) {
        let lower = key.to_ascii_lowercase();
        self.entries.retain(|(k, _)| k.to_ascii_lowercase() != lower);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The dynamic value union flowing through emulation.
///
/// `Unresolved` is the in-band stand-in for a name that could not be
/// resolved; it renders as the string `NULL` wherever a display form is
/// taken, which is distinct from VBA's own `Null`/`Empty` (both of which
/// collapse to `Unresolved` here as well, deliberately). `Wildcard` models
/// unknown environment inputs and compares equal to anything.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Unresolved,
    Wildcard,
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    List(ListRef),
    Map(MapRef),
    Procedure(Rc<Procedure>),
    Builtin(&'static str),
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unresolved => write!(f, "Unresolved"),
            Self::Wildcard => write!(f, "Wildcard"),
            Self::Int(v) => write!(f, "Int({v})"),
            Self::Float(v) => write!(f, "Float({v})"),
            Self::Str(v) => write!(f, "Str({v:?})"),
            Self::Bool(v) => write!(f, "Bool({v})"),
            Self::List(v) => write!(f, "List(len={})", v.borrow().len()),
            Self::Map(v) => write!(f, "Map(len={})", v.borrow().len()),
            Self::Procedure(p) => write!(f, "Procedure({})", p.name),
            Self::Builtin(n) => write!(f, "Builtin({n})"),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Wildcard, _) | (_, Self::Wildcard) => true,
            (Self::Unresolved, Self::Unresolved) => true,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::Int(a), Self::Float(b)) | (Self::Float(b), Self::Int(a)) => *a as f64 == *b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::List(a), Self::List(b)) => {
                Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow()
            }
            (Self::Map(a), Self::Map(b)) => Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow(),
            (Self::Procedure(a), Self::Procedure(b)) => Rc::ptr_eq(a, b),
            (Self::Builtin(a), Self::Builtin(b)) => a == b,
            _ => false,
        }
    }
}

impl Value {
    pub fn list(values: Vec<Value>) -> Self {
        Self::List(Rc::new(RefCell::new(values)))
    }

    pub fn map(object: MapObject) -> Self {
        Self::Map(Rc::new(RefCell::new(object)))
    }

    pub fn str(s: impl Into<String>) -> Self {
        Self::Str(s.into())
    }

    pub fn is_unresolved(&self) -> bool {
        matches!(self, Self::Unresolved)
    }

    pub fn is_callable(&self) -> bool {
        matches!(self, Self::Procedure(_) | Self::Builtin(_))
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Bool(v) => *v,
            Self::Int(v) => *v != 0,
            Self::Float(v) => *v != 0.0,
            Self::Str(s) => {
                let t = s.trim();
                if t.eq_ignore_ascii_case("true") {
                    return true;
                }
                if t.eq_ignore_ascii_case("false") {
                    return false;
                }
                t.parse::<f64>().map(|v| v != 0.0).unwrap_or(false)
            }
            Self::Wildcard => true,
            Self::Unresolved => false,
            Self::List(v) => !v.borrow().is_empty(),
            Self::Map(_) | Self::Procedure(_) | Self::Builtin(_) => true,
        }
    }

    /// Feeds the loop no-change fingerprint. Cheap and structural; collection
    /// contents hash through their borrows.
    pub fn hash_into<H: Hasher>(&self, state: &mut H) {
        match self {
            Self::Unresolved => 0u8.hash(state),
            Self::Wildcard => 1u8.hash(state),
            Self::Int(v) => {
                2u8.hash(state);
                v.hash(state);
            }
            Self::Float(v) => {
                3u8.hash(state);
                v.to_bits().hash(state);
            }
            Self::Str(v) => {
                4u8.hash(state);
                v.hash(state);
            }
            Self::Bool(v) => {
                5u8.hash(state);
                v.hash(state);
            }
            Self::List(v) => {
                6u8.hash(state);
                let items = v.borrow();
                items.len().hash(state);
                for item in items.iter() {
                    item.hash_into(state);
                }
            }
            Self::Map(v) => {
                7u8.hash(state);
                let map = v.borrow();
                map.kind.hash(state);
                map.entries.len().hash(state);
                for (k, item) in map.entries.iter() {
                    k.hash(state);
                    item.hash_into(state);
                }
            }
            Self::Procedure(p) => {
                8u8.hash(state);
                p.name.hash(state);
            }
            Self::Builtin(n) => {
                9u8.hash(state);
                n.hash(state);
            }
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}
