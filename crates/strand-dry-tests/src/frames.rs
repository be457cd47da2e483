// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Inbound frame builders for tests.

use serde_json::{json, Value};
use strand_stream_proto::{InboundFrame, SyncMarker};
use strand_view::OperationBatch;

/// Builder for [`InboundFrame`] instances.
///
/// # Example
///
/// ```
/// use serde_json::json;
/// use strand_dry_tests::FrameBuilder;
///
/// let frame = FrameBuilder::new("ifaces")
///     .upsert("eth0", json!({"mtu": 1500}))
///     .delete("eth9")
///     .synced()
///     .build();
///
/// assert_eq!(frame.operation.unwrap().len(), 2);
/// assert!(frame.sync.is_some());
/// ```
#[derive(Debug, Clone)]
pub struct FrameBuilder {
    stream: String,
    batch: Option<OperationBatch>,
    sync: Option<SyncMarker>,
}

impl FrameBuilder {
    /// Frame for `stream` with no content yet.
    pub fn new(stream: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            batch: None,
            sync: None,
        }
    }

    /// Append an upsert.
    pub fn upsert(mut self, id: impl Into<String>, fields: Value) -> Self {
        self.batch = Some(self.batch.take().unwrap_or_default().upsert(id, fields));
        self
    }

    /// Append a deletion.
    pub fn delete(mut self, id: impl Into<String>) -> Self {
        self.batch = Some(self.batch.take().unwrap_or_default().delete(id));
        self
    }

    /// Mark the end of the backlog.
    pub fn synced(mut self) -> Self {
        self.sync = Some(SyncMarker::default());
        self
    }

    /// Mark the end of the backlog with a schema object.
    pub fn synced_with_schema(mut self, schema: Value) -> Self {
        self.sync = Some(SyncMarker {
            schema: Some(schema),
        });
        self
    }

    /// Build the frame.
    pub fn build(self) -> InboundFrame {
        InboundFrame {
            stream: self.stream,
            operation: self.batch,
            sync: self.sync,
            error: None,
        }
    }
}

/// A backlog of `rows` single-row frames for `stream` followed by the
/// synced signal. Row `i` has id `r{i}` and fields `{"n": i}`.
pub fn backlog(stream: &str, rows: usize) -> Vec<InboundFrame> {
    (0..rows)
        .map(|i| {
            FrameBuilder::new(stream)
                .upsert(format!("r{i}"), json!({ "n": i }))
                .build()
        })
        .chain(std::iter::once(FrameBuilder::new(stream).synced().build()))
        .collect()
}
