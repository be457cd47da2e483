// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Scripted [`Connector`] whose links are driven by the test.
//!
//! Every successful connect hands the test a [`RemoteEnd`]: the remote side
//! of the new link. The test reads the intents the multiplexer sends, pushes
//! frames back, and drops the end to simulate a link failure.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strand_stream_client::{Connector, Link, TransportError};
use strand_stream_proto::{ClientIntent, InboundFrame};
use tokio::sync::mpsc;
use tokio::time::timeout;

const LINK_DEPTH: usize = 64;

/// How long [`RemoteEnd::next_intent`] and [`RemoteEnds::next`] wait.
pub const SCRIPT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct Shared {
    ends: mpsc::UnboundedSender<RemoteEnd>,
    refuse: AtomicU32,
    connects: AtomicU32,
    teardown: bool,
}

/// Test double for a remote that accepts links on demand.
#[derive(Debug, Clone)]
pub struct ScriptedConnector {
    shared: Arc<Shared>,
}

/// Stream of remote ends, one per successful connect.
#[derive(Debug)]
pub struct RemoteEnds {
    rx: mpsc::UnboundedReceiver<RemoteEnd>,
}

impl ScriptedConnector {
    /// Connector whose remote honours unsubscribe.
    pub fn new() -> (Self, RemoteEnds) {
        Self::build(true)
    }

    /// Connector whose remote cannot tear down a stream.
    pub fn without_teardown() -> (Self, RemoteEnds) {
        Self::build(false)
    }

    fn build(teardown: bool) -> (Self, RemoteEnds) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            ends: tx,
            refuse: AtomicU32::new(0),
            connects: AtomicU32::new(0),
            teardown,
        });
        (Self { shared }, RemoteEnds { rx })
    }

    /// Refuse the next `n` connect attempts.
    pub fn refuse_next(&self, n: u32) {
        self.shared.refuse.store(n, Ordering::SeqCst);
    }

    /// Connect attempts so far, refused ones included.
    pub fn connect_count(&self) -> u32 {
        self.shared.connects.load(Ordering::SeqCst)
    }
}

impl Connector for ScriptedConnector {
    async fn connect(&self) -> Result<Link, TransportError> {
        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .shared
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(TransportError::Connect("scripted refusal".into()));
        }

        let (out_tx, out_rx) = mpsc::channel(LINK_DEPTH);
        let (in_tx, in_rx) = mpsc::channel(LINK_DEPTH);
        let end = RemoteEnd {
            intents: out_rx,
            frames: in_tx,
        };
        self.shared
            .ends
            .send(end)
            .map_err(|_| TransportError::Connect("test dropped the remote ends".into()))?;
        Ok(Link {
            outbound: out_tx,
            inbound: in_rx,
        })
    }

    fn supports_teardown(&self) -> bool {
        self.shared.teardown
    }
}

impl RemoteEnds {
    /// Wait for the next connect. `None` on timeout.
    pub async fn next(&mut self) -> Option<RemoteEnd> {
        timeout(SCRIPT_TIMEOUT, self.rx.recv()).await.ok().flatten()
    }

    /// A connect that already happened, without waiting.
    pub fn try_next(&mut self) -> Option<RemoteEnd> {
        self.rx.try_recv().ok()
    }
}

/// Remote side of one link.
#[derive(Debug)]
pub struct RemoteEnd {
    intents: mpsc::Receiver<ClientIntent>,
    frames: mpsc::Sender<InboundFrame>,
}

impl RemoteEnd {
    /// Wait for the next intent. `None` on timeout or when the client
    /// dropped the link.
    pub async fn next_intent(&mut self) -> Option<ClientIntent> {
        timeout(SCRIPT_TIMEOUT, self.intents.recv())
            .await
            .ok()
            .flatten()
    }

    /// Receive exactly `n` intents.
    pub async fn take_intents(&mut self, n: usize) -> Vec<ClientIntent> {
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            match self.next_intent().await {
                Some(intent) => out.push(intent),
                None => break,
            }
        }
        out
    }

    /// Intents already queued, without waiting.
    pub fn drain_intents(&mut self) -> Vec<ClientIntent> {
        std::iter::from_fn(|| self.intents.try_recv().ok()).collect()
    }

    /// Push a frame to the client. False if the client dropped the link.
    pub async fn send(&self, frame: InboundFrame) -> bool {
        self.frames.send(frame).await.is_ok()
    }

    /// Push several frames in order.
    pub async fn send_all(&self, frames: impl IntoIterator<Item = InboundFrame>) -> bool {
        for frame in frames {
            if !self.send(frame).await {
                return false;
            }
        }
        true
    }

    /// True once the client side of the link is gone.
    pub fn is_closed(&self) -> bool {
        self.frames.is_closed()
    }

    /// Simulate a link failure.
    pub fn hang_up(self) {}
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use strand_stream_proto::{StreamKind, StreamParams};

    #[tokio::test]
    async fn refusals_are_counted_then_links_flow() {
        let (connector, mut ends) = ScriptedConnector::new();
        connector.refuse_next(1);
        assert!(connector.connect().await.is_err());

        let mut link = connector.connect().await.unwrap();
        assert_eq!(connector.connect_count(), 2);

        let mut end = ends.next().await.unwrap();
        link.outbound
            .send(ClientIntent::Unsubscribe { stream: "s".into() })
            .await
            .unwrap();
        assert_eq!(end.next_intent().await.unwrap().stream(), "s");

        assert!(end.send(InboundFrame::synced("s", None)).await);
        assert!(link.inbound.recv().await.is_some());

        end.hang_up();
        assert!(link.inbound.recv().await.is_none());
    }

    #[tokio::test]
    async fn draining_returns_only_what_is_queued() {
        let (connector, mut ends) = ScriptedConnector::without_teardown();
        assert!(!connector.supports_teardown());
        let link = connector.connect().await.unwrap();
        let mut end = ends.try_next().unwrap();
        for name in ["a", "b"] {
            link.outbound
                .send(ClientIntent::Subscribe {
                    stream: name.into(),
                    params: StreamParams::new(StreamKind::Resource),
                })
                .await
                .unwrap();
        }
        assert_eq!(end.drain_intents().len(), 2);
        assert!(end.drain_intents().is_empty());
    }
}
