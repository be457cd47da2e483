// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The per-stream reducer.
//!
//! # Invariants
//!
//! 1. `columns` is append-only; a column keeps its index for the lifetime of
//!    the view (until [`Materializer::reset`]).
//! 2. Every row tuple has exactly `columns.len()` cells after any `apply`.
//! 3. An upsert replaces the whole row; fields are never merged.

use std::collections::{BTreeMap, HashMap, VecDeque};

use serde::Serialize;
use serde_json::Value;

use crate::batch::{OperationBatch, Step};
use crate::cell::Cell;
use crate::flatten::{flatten, MalformedRowError};

/// Number of rejected-row diagnostics retained per view.
pub const DIAGNOSTIC_CAPACITY: usize = 64;

/// A row that was dropped from a batch because it was unusable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowDiagnostic {
    /// Id of the rejected row.
    pub row_id: String,
    /// What was wrong with it.
    pub error: MalformedRowError,
}

/// Counters for one `apply` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Rows written (created or replaced).
    pub upserted: usize,
    /// Rows actually removed (deletions of unknown ids are not counted).
    pub deleted: usize,
    /// Columns appended to the schema.
    pub columns_added: usize,
    /// Rows rejected in this batch.
    pub rejected: Vec<RowDiagnostic>,
}

/// Coarse view state for callers deciding between "loading" and "no results".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ViewState {
    /// Backlog not finished and nothing received yet.
    Loading,
    /// The remote signalled it is caught up and there are no rows.
    Empty,
    /// At least one row is present.
    Populated,
}

/// Immutable copy of a view, suitable for rendering.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ViewSnapshot {
    /// Column names in first-seen order.
    pub columns: Vec<String>,
    /// Row id → tuple aligned with `columns`.
    pub rows: BTreeMap<String, Vec<Cell>>,
    /// True once the remote finished replaying its backlog.
    pub synced: bool,
    /// Schema object delivered with the synced signal, if any.
    pub schema: Option<Value>,
    /// Most recent rejected rows, oldest first.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<RowDiagnostic>,
}

impl ViewSnapshot {
    /// Loading / Empty / Populated.
    pub fn state(&self) -> ViewState {
        if !self.rows.is_empty() {
            ViewState::Populated
        } else if self.synced {
            ViewState::Empty
        } else {
            ViewState::Loading
        }
    }

    /// Tuple for `id`.
    pub fn row(&self, id: &str) -> Option<&[Cell]> {
        self.rows.get(id).map(Vec::as_slice)
    }

    /// Cell at (`id`, `column`).
    pub fn cell(&self, id: &str, column: &str) -> Option<&Cell> {
        let idx = self.columns.iter().position(|c| c == column)?;
        self.rows.get(id)?.get(idx)
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// True when there are no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Folds operation batches into a table. One instance per stream, fed in
/// arrival order.
#[derive(Debug, Default)]
pub struct Materializer {
    columns: Vec<String>,
    index: HashMap<String, usize>,
    rows: BTreeMap<String, Vec<Cell>>,
    synced: bool,
    schema: Option<Value>,
    diagnostics: VecDeque<RowDiagnostic>,
    revision: u64,
}

impl Materializer {
    /// Empty view.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one batch in step order.
    ///
    /// Malformed rows are skipped and reported; the remaining steps still
    /// apply. An empty batch changes nothing.
    pub fn apply(&mut self, batch: &OperationBatch) -> ApplyReport {
        self.revision += 1;
        let mut report = ApplyReport::default();
        for step in batch.steps() {
            match step {
                Step::Upsert(row) => match flatten(&row.fields) {
                    Ok(entries) => {
                        report.columns_added += self.upsert(&row.id, entries);
                        report.upserted += 1;
                    }
                    Err(error) => self.reject(&mut report, &row.id, error),
                },
                Step::Delete(id) => {
                    if self.rows.remove(id).is_some() {
                        report.deleted += 1;
                    }
                }
                Step::Reject { row_id, error } => self.reject(&mut report, row_id, error.clone()),
            }
        }
        report
    }

    /// Write a flattened row; returns how many columns were appended.
    fn upsert(&mut self, id: &str, entries: Vec<(String, Value)>) -> usize {
        let before = self.columns.len();
        for (path, _) in &entries {
            if !self.index.contains_key(path) {
                self.index.insert(path.clone(), self.columns.len());
                self.columns.push(path.clone());
            }
        }
        let width = self.columns.len();
        if width > before {
            // Back-fill: new columns only ever land at the tail.
            for tuple in self.rows.values_mut() {
                tuple.resize(width, Cell::Absent);
            }
        }
        let mut tuple = vec![Cell::Absent; width];
        for (path, value) in entries {
            if let Some(slot) = self.index.get(&path).and_then(|&i| tuple.get_mut(i)) {
                *slot = Cell::Value(value);
            }
        }
        self.rows.insert(id.to_owned(), tuple);
        width - before
    }

    fn reject(&mut self, report: &mut ApplyReport, row_id: &str, error: MalformedRowError) {
        let diag = RowDiagnostic {
            row_id: row_id.to_owned(),
            error,
        };
        self.record(diag.clone());
        report.rejected.push(diag);
    }

    fn record(&mut self, diag: RowDiagnostic) {
        if self.diagnostics.len() == DIAGNOSTIC_CAPACITY {
            self.diagnostics.pop_front();
        }
        self.diagnostics.push_back(diag);
    }

    /// Record that the remote finished its backlog, keeping the schema it sent.
    pub fn mark_synced(&mut self, schema: Option<Value>) {
        self.revision += 1;
        self.synced = true;
        if schema.is_some() {
            self.schema = schema;
        }
    }

    /// Drop everything, including columns, and return to the loading state.
    ///
    /// The revision keeps counting so observers still see a change.
    pub fn reset(&mut self) {
        let revision = self.revision + 1;
        *self = Self::default();
        self.revision = revision;
    }

    /// Number of frames applied so far, empty batches included.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Current column list.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Current rows.
    pub fn rows(&self) -> &BTreeMap<String, Vec<Cell>> {
        &self.rows
    }

    /// Whether the synced signal has been seen.
    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// Most recent rejected rows, oldest first.
    pub fn diagnostics(&self) -> impl Iterator<Item = &RowDiagnostic> {
        self.diagnostics.iter()
    }

    /// Copy the current table.
    pub fn snapshot(&self) -> ViewSnapshot {
        ViewSnapshot {
            columns: self.columns.clone(),
            rows: self.rows.clone(),
            synced: self.synced,
            schema: self.schema.clone(),
            diagnostics: self.diagnostics.iter().cloned().collect(),
        }
    }
}
