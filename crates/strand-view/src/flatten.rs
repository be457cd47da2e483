// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Flattening of nested row fields into dotted column paths.

use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashSet;
use thiserror::Error;

/// Why a row's fields could not be turned into flat key/value pairs.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MalformedRowError {
    /// `fields` was not an object.
    #[error("row fields must be an object, found {found}")]
    NotAnObject {
        /// JSON type name of the offending value.
        found: &'static str,
    },
    /// A key was the empty string.
    #[error("empty field name under `{parent}`")]
    EmptyKey {
        /// Dotted path of the enclosing object (empty at top level).
        parent: String,
    },
    /// Two keys flattened to the same dotted path, e.g. `{"a.b": 1, "a": {"b": 2}}`.
    #[error("field path `{path}` appears more than once")]
    DuplicatePath {
        /// The colliding path.
        path: String,
    },
    /// The row id was missing or not a string or integer.
    #[error("row id must be a string or integer, found {found}")]
    BadId {
        /// JSON type name of the id, or `nothing` when absent.
        found: &'static str,
    },
    /// An upsert entry was not an object.
    #[error("upsert entry must be an object, found {found}")]
    NotARow {
        /// JSON type name of the entry.
        found: &'static str,
    },
}

pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Flatten `fields` into `(dotted.path, leaf)` pairs in document order.
///
/// Nested objects recurse. Arrays, scalars, `null` and empty objects are
/// leaves.
pub fn flatten(fields: &Value) -> Result<Vec<(String, Value)>, MalformedRowError> {
    let Value::Object(map) = fields else {
        return Err(MalformedRowError::NotAnObject {
            found: type_name(fields),
        });
    };
    let mut out = Vec::with_capacity(map.len());
    let mut seen = HashSet::with_capacity(map.len());
    walk("", map, &mut out, &mut seen)?;
    Ok(out)
}

fn walk(
    prefix: &str,
    map: &Map<String, Value>,
    out: &mut Vec<(String, Value)>,
    seen: &mut HashSet<String>,
) -> Result<(), MalformedRowError> {
    for (key, value) in map {
        if key.is_empty() {
            return Err(MalformedRowError::EmptyKey {
                parent: prefix.to_owned(),
            });
        }
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            Value::Object(inner) if !inner.is_empty() => walk(&path, inner, out, seen)?,
            leaf => {
                if !seen.insert(path.clone()) {
                    return Err(MalformedRowError::DuplicatePath { path });
                }
                out.push((path, leaf.clone()));
            }
        }
    }
    Ok(())
}
