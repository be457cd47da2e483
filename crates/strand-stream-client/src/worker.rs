// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Per-subscription dispatch workers.
//!
//! Each worker owns one [`Materializer`] and drains one bounded queue, so a
//! stream's frames apply strictly in arrival order while different streams
//! progress independently. Snapshots are published through a `watch`
//! channel that outlives the worker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use strand_stream_proto::InboundFrame;
use strand_view::{Materializer, ViewSnapshot};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Publisher side of a subscription's snapshot channel.
pub(crate) type SnapshotTx = Arc<watch::Sender<Arc<ViewSnapshot>>>;

/// Work item for a dispatch worker, tagged with the generation it was
/// issued for.
#[derive(Debug)]
pub(crate) enum Dispatch {
    Frame { frame: InboundFrame, generation: u64 },
    Reset { generation: u64 },
}

/// Control-task side of a running worker.
#[derive(Debug)]
pub(crate) struct WorkerHandle {
    queue: mpsc::Sender<Dispatch>,
    closed: Arc<AtomicBool>,
}

impl WorkerHandle {
    /// Spawn a worker for `stream` onto `set`.
    pub(crate) fn spawn(
        set: &mut JoinSet<()>,
        stream: &str,
        generation: u64,
        publisher: SnapshotTx,
        depth: usize,
    ) -> Self {
        let (queue, rx) = mpsc::channel(depth);
        let closed = Arc::new(AtomicBool::new(false));
        let worker = Worker {
            stream: stream.to_owned(),
            generation,
            closed: Arc::clone(&closed),
            publisher,
            view: Materializer::new(),
        };
        set.spawn(worker.run(rx));
        Self { queue, closed }
    }

    /// Queue an item; false if the worker is gone.
    pub(crate) async fn dispatch(&self, item: Dispatch) -> bool {
        self.queue.send(item).await.is_ok()
    }

    /// Stop the worker. Items still queued are discarded, and nothing is
    /// published after this returns.
    pub(crate) fn close(self) {
        self.closed.store(true, Ordering::Release);
    }
}

struct Worker {
    stream: String,
    generation: u64,
    closed: Arc<AtomicBool>,
    publisher: SnapshotTx,
    view: Materializer,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::Receiver<Dispatch>) {
        while let Some(item) = rx.recv().await {
            if self.closed.load(Ordering::Acquire) {
                break;
            }
            match item {
                Dispatch::Frame { frame, generation } if generation == self.generation => {
                    self.apply(frame);
                }
                Dispatch::Reset { generation } if generation == self.generation => {
                    self.view.reset();
                    self.publish();
                }
                _ => debug!(stream = %self.stream, "dropping stale dispatch"),
            }
        }
        debug!(stream = %self.stream, generation = self.generation, "worker stopped");
    }

    fn apply(&mut self, frame: InboundFrame) {
        if let Some(batch) = &frame.operation {
            let report = self.view.apply(batch);
            for diag in &report.rejected {
                warn!(
                    stream = %self.stream,
                    row = %diag.row_id,
                    error = %diag.error,
                    "rejected malformed row"
                );
            }
        }
        if let Some(sync) = frame.sync {
            self.view.mark_synced(sync.schema);
        }
        self.publish();
    }

    fn publish(&self) {
        let closed = &self.closed;
        let view = &self.view;
        self.publisher.send_if_modified(|current| {
            if closed.load(Ordering::Acquire) {
                return false;
            }
            let next = view.snapshot();
            if **current == next {
                return false;
            }
            *current = Arc::new(next);
            true
        });
    }
}
