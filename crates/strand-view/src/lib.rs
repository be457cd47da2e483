// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Materialized views for Strand streams.
//!
//! A stream delivers an operation log: ordered row upserts and row deletions.
//! [`Materializer`] folds that log into a table whose column set only ever
//! grows (first-seen order) and whose row tuples always match the current
//! column count. Missing values are [`Cell::Absent`], never collapsed into
//! `null`.
//!
//! The reducer is pure: no I/O, no locking. One instance belongs to exactly
//! one stream and must be fed frames in arrival order.

pub mod batch;
pub mod cell;
pub mod flatten;
pub mod materializer;

pub use batch::{OperationBatch, RowUpsert, Step};
pub use cell::Cell;
pub use flatten::{flatten, MalformedRowError};
pub use materializer::{
    ApplyReport, Materializer, RowDiagnostic, ViewSnapshot, ViewState, DIAGNOSTIC_CAPACITY,
};
