// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Client side of Strand live views: a subscription registry and a
//! reconnecting multiplexer that routes each stream's frames into its own
//! materialized view.
//!
//! ```text
//! Connector ──Link──> StreamMultiplexer (control task)
//!                        │  registry + slots
//!                        ├──> worker "ifaces" ──> watch<ViewSnapshot>
//!                        └──> worker "alarms" ──> watch<ViewSnapshot>
//! ```

pub mod backoff;
pub mod config;
pub mod error;
pub mod multiplexer;
pub mod naming;
pub mod registry;
pub mod transport;
pub mod unix;
mod worker;

pub use backoff::{Backoff, ReconnectConfig};
pub use config::MultiplexerConfig;
pub use error::{StreamError, SubscriptionError, TransportError};
pub use multiplexer::{
    ConnectionState, RestartMode, SnapshotListener, SnapshotWatch, StreamMultiplexer,
};
pub use naming::StreamNamer;
pub use registry::{
    SubscriptionHandle, SubscriptionRegistry, SubscriptionState, SubscriptionStatus,
};
pub use strand_stream_proto::{StreamKind, StreamParams};
pub use transport::{Connector, Link};
pub use unix::UnixConnector;
