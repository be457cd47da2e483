// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Transport seam between the multiplexer and whatever carries frames.

use std::future::Future;
use strand_stream_proto::{ClientIntent, InboundFrame};
use tokio::sync::mpsc;

use crate::error::TransportError;

/// One live connection, as a pair of channels.
///
/// The link is lost when `inbound` yields `None`. Dropping the link closes
/// `outbound`, which tells the transport to shut the connection down.
#[derive(Debug)]
pub struct Link {
    /// Intents for the remote.
    pub outbound: mpsc::Sender<ClientIntent>,
    /// Frames from the remote, in arrival order.
    pub inbound: mpsc::Receiver<InboundFrame>,
}

/// Opens links to the remote.
pub trait Connector: Send + Sync + 'static {
    /// Establish a new link.
    fn connect(&self) -> impl Future<Output = Result<Link, TransportError>> + Send;

    /// Whether the remote honours unsubscribe requests. When it does not,
    /// unsubscribing only filters frames locally.
    fn supports_teardown(&self) -> bool {
        true
    }
}
