// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Table cell values.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// One position in a row tuple.
///
/// `Absent` means the row carries no value for the column. It is distinct
/// from `Value(Value::Null)`, which is an explicit null delivered by the
/// remote.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Cell {
    /// The row has no value for this column.
    #[default]
    Absent,
    /// A leaf value taken from the row's flattened fields.
    Value(Value),
}

impl Cell {
    /// True when the cell holds no value.
    pub fn is_absent(&self) -> bool {
        matches!(self, Cell::Absent)
    }

    /// Borrow the held value, if any.
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Cell::Absent => None,
            Cell::Value(v) => Some(v),
        }
    }
}

impl From<Value> for Cell {
    fn from(value: Value) -> Self {
        Cell::Value(value)
    }
}

/// Renders strings bare, other JSON values in compact form, and `Absent`
/// as an empty string.
impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Absent => Ok(()),
            Cell::Value(Value::String(s)) => f.write_str(s),
            Cell::Value(v) => write!(f, "{v}"),
        }
    }
}
