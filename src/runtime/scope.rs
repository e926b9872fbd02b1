//! Captured scope snapshots
//!
//! A [`Scope`] is an immutable name → [`Value`] map taken once when a loop or
//! flow is declared. Workers share it by reference count and never lock it.
//! Layering a scope over another (see [`Scope::merge`]) produces a new
//! snapshot; explicit bindings always win over captured ones.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value as JsonValue;

use crate::error::{Error, Result};
use crate::runtime::Value;

/// Immutable snapshot of enclosing variables
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Scope {
    variables: Arc<HashMap<String, Value>>,
}

impl Scope {
    /// Creates an empty scope
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a scope from name/value pairs; later pairs win on duplicate names
    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        Scope {
            variables: Arc::new(
                pairs
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
        }
    }

    /// Gets a captured variable by name
    pub fn get(&self, name: &str) -> Result<Value> {
        self.variables
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UndefinedVariable {
                name: name.to_string(),
            })
    }

    /// Gets a captured variable by name without cloning
    pub fn lookup(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    /// Returns true if the name is captured
    pub fn contains(&self, name: &str) -> bool {
        self.variables.contains_key(name)
    }

    /// Number of captured names
    pub fn len(&self) -> usize {
        self.variables.len()
    }

    /// Returns true if nothing is captured
    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    /// Captured names in sorted order
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.variables.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// New snapshot with one explicit binding layered on top
    pub fn with(&self, name: impl Into<String>, value: impl Into<Value>) -> Scope {
        let mut variables = (*self.variables).clone();
        variables.insert(name.into(), value.into());
        Scope {
            variables: Arc::new(variables),
        }
    }

    /// New snapshot containing both scopes; names in `other` win
    pub fn merge(&self, other: &Scope) -> Scope {
        if other.is_empty() {
            return self.clone();
        }
        if self.is_empty() {
            return other.clone();
        }
        let mut variables = (*self.variables).clone();
        for (name, value) in other.variables.iter() {
            variables.insert(name.clone(), value.clone());
        }
        Scope {
            variables: Arc::new(variables),
        }
    }

    /// Renders the snapshot as a JSON object
    pub fn to_json(&self) -> JsonValue {
        JsonValue::Object(
            self.variables
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{")?;
        for (i, name) in self.names().into_iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", name, self.variables[name])?;
        }
        write!(f, "}}")
    }
}

/// Builds a [`Scope`] from local variables, using each variable's name as the key
///
/// ```
/// use undertow::capture;
///
/// let query = "hello world";
/// let multiplier = 10;
/// let scope = capture!(query, multiplier, retries = 3);
/// assert_eq!(scope.get("query").unwrap().as_str().unwrap(), "hello world");
/// assert_eq!(scope.get("retries").unwrap().as_int().unwrap(), 3);
/// ```
#[macro_export]
macro_rules! capture {
    (@value $name:ident = $value:expr) => {
        $crate::Value::from($value)
    };
    (@value $name:ident) => {
        $crate::Value::from($name.clone())
    };
    () => {
        $crate::Scope::new()
    };
    ($($name:ident $(= $value:expr)?),+ $(,)?) => {
        $crate::Scope::from_pairs(::std::vec![
            $((stringify!($name), $crate::capture!(@value $name $(= $value)?))),+
        ])
    };
}
