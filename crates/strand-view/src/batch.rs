// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Operation batches: the unit of a stream's operation log.
//!
//! On the wire a batch is either a single object
//! `{"upserts": [...], "deletions": [...]}` or a list of such objects.
//! Steps are applied in the order the lists appear in the document, so
//! `{"deletions": ["a"], "upserts": [{"id": "a"}]}` deletes first and
//! `{"upserts": [{"id": "a"}], "deletions": ["a"]}` leaves no row behind.
//!
//! An entry with an unusable id (or an upsert that is not an object) decodes
//! to [`Step::Reject`] in its place instead of failing the whole batch.

use serde::de::{self, Deserializer, IgnoredAny, MapAccess, SeqAccess, Visitor};
use serde::ser::{SerializeMap, SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::flatten::{type_name, MalformedRowError};

/// Insert-or-replace of one row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowUpsert {
    /// Row identifier. Numeric ids on the wire are normalized to strings.
    #[serde(deserialize_with = "row_id")]
    pub id: String,
    /// Row fields; nested objects are flattened to dotted paths when applied.
    #[serde(default = "empty_object")]
    pub fields: Value,
}

impl RowUpsert {
    /// Build an upsert for `id` with the given fields.
    pub fn new(id: impl Into<String>, fields: Value) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }
}

/// One step of a batch, in application order.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Replace (or create) a row.
    Upsert(RowUpsert),
    /// Remove a row by id.
    Delete(String),
    /// An entry that could not be read as a row. Applying it records a
    /// diagnostic and changes nothing else.
    Reject {
        /// Best-effort id: the raw JSON of a bad id, empty when absent.
        row_id: String,
        /// What was wrong with the entry.
        error: MalformedRowError,
    },
}

/// Ordered list of row upserts and deletions for a single stream.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OperationBatch {
    steps: Vec<Step>,
}

impl OperationBatch {
    /// Empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a batch from explicit steps.
    pub fn from_steps(steps: Vec<Step>) -> Self {
        Self { steps }
    }

    /// Append an upsert step.
    pub fn upsert(mut self, id: impl Into<String>, fields: Value) -> Self {
        self.steps.push(Step::Upsert(RowUpsert::new(id, fields)));
        self
    }

    /// Append a deletion step.
    pub fn delete(mut self, id: impl Into<String>) -> Self {
        self.steps.push(Step::Delete(id.into()));
        self
    }

    /// Steps in application order.
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// True when the batch carries no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

fn row_key(raw: Value) -> Result<String, (String, MalformedRowError)> {
    match raw {
        Value::String(id) => Ok(id),
        Value::Number(n) if n.is_i64() || n.is_u64() => Ok(n.to_string()),
        other => Err((
            other.to_string(),
            MalformedRowError::BadId {
                found: type_name(&other),
            },
        )),
    }
}

fn row_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    row_key(Value::deserialize(deserializer)?).map_err(|(_, err)| de::Error::custom(err))
}

fn reject((row_id, error): (String, MalformedRowError)) -> Step {
    Step::Reject { row_id, error }
}

fn upsert_step(raw: Value) -> Step {
    let mut entry = match raw {
        Value::Object(entry) => entry,
        other => {
            return reject((
                String::new(),
                MalformedRowError::NotARow {
                    found: type_name(&other),
                },
            ))
        }
    };
    let fields = entry.remove("fields").unwrap_or_else(empty_object);
    match entry.remove("id") {
        Some(id) => match row_key(id) {
            Ok(id) => Step::Upsert(RowUpsert { id, fields }),
            Err(bad) => reject(bad),
        },
        None => reject((String::new(), MalformedRowError::BadId { found: "nothing" })),
    }
}

fn delete_step(raw: Value) -> Step {
    row_key(raw).map_or_else(reject, Step::Delete)
}

/// Read `upserts` / `deletions` entries from one operation object, keeping
/// document order.
fn read_steps<'de, A>(mut map: A, steps: &mut Vec<Step>) -> Result<(), A::Error>
where
    A: MapAccess<'de>,
{
    while let Some(key) = map.next_key::<String>()? {
        match key.as_str() {
            "upserts" => {
                let rows: Option<Vec<Value>> = map.next_value()?;
                steps.extend(rows.into_iter().flatten().map(upsert_step));
            }
            "deletions" => {
                let ids: Option<Vec<Value>> = map.next_value()?;
                steps.extend(ids.into_iter().flatten().map(delete_step));
            }
            _ => {
                map.next_value::<IgnoredAny>()?;
            }
        }
    }
    Ok(())
}

struct StepGroup(Vec<Step>);

impl<'de> Deserialize<'de> for StepGroup {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct GroupVisitor;

        impl<'de> Visitor<'de> for GroupVisitor {
            type Value = StepGroup;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an operation object")
            }

            fn visit_map<A>(self, map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut steps = Vec::new();
                read_steps(map, &mut steps)?;
                Ok(StepGroup(steps))
            }
        }

        deserializer.deserialize_map(GroupVisitor)
    }
}

struct BatchVisitor;

impl<'de> Visitor<'de> for BatchVisitor {
    type Value = OperationBatch;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an operation object or a list of operation objects")
    }

    fn visit_map<A>(self, map: A) -> Result<Self::Value, A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut steps = Vec::new();
        read_steps(map, &mut steps)?;
        Ok(OperationBatch { steps })
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let mut steps = Vec::new();
        while let Some(StepGroup(group)) = seq.next_element()? {
            steps.extend(group);
        }
        Ok(OperationBatch { steps })
    }

    fn visit_unit<E>(self) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        Ok(OperationBatch::default())
    }

    fn visit_none<E>(self) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        Ok(OperationBatch::default())
    }
}

impl<'de> Deserialize<'de> for OperationBatch {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(BatchVisitor)
    }
}

/// A run of consecutive steps of the same kind, serialized as one object.
enum Run<'a> {
    Upserts(Vec<&'a RowUpsert>),
    Deletions(Vec<&'a str>),
}

impl Serialize for Run<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut m = serializer.serialize_map(Some(1))?;
        match self {
            Run::Upserts(rows) => m.serialize_entry("upserts", rows)?,
            Run::Deletions(ids) => m.serialize_entry("deletions", ids)?,
        }
        m.end()
    }
}

/// Serialized in list form so that interleaved upserts and deletions keep
/// their order. Rejected entries are not written.
impl Serialize for OperationBatch {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut runs: Vec<Run<'_>> = Vec::new();
        for step in &self.steps {
            match (step, runs.last_mut()) {
                (Step::Upsert(row), Some(Run::Upserts(rows))) => rows.push(row),
                (Step::Delete(id), Some(Run::Deletions(ids))) => ids.push(id.as_str()),
                (Step::Upsert(row), _) => runs.push(Run::Upserts(vec![row])),
                (Step::Delete(id), _) => runs.push(Run::Deletions(vec![id.as_str()])),
                (Step::Reject { .. }, _) => {}
            }
        }
        let mut seq = serializer.serialize_seq(Some(runs.len()))?;
        for run in &runs {
            seq.serialize_element(run)?;
        }
        seq.end()
    }
}
