// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Error types surfaced by the client.

use strand_stream_proto::{wire::WireError, RemoteError};
use thiserror::Error;

/// Failure of the underlying connection. Absorbed by the reconnect loop;
/// callers observe it only as `ConnectionState::Connecting`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The remote could not be reached.
    #[error("connect failed: {0}")]
    Connect(String),
    /// An established link went away.
    #[error("link lost: {0}")]
    LinkLost(String),
    /// Bytes on the link could not be framed or decoded.
    #[error("codec error: {0}")]
    Codec(String),
}

impl From<WireError> for TransportError {
    fn from(err: WireError) -> Self {
        Self::Codec(err.to_string())
    }
}

/// The remote refused one stream. Stored on that subscription's status.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("stream `{stream}` rejected ({code}): {message}")]
pub struct SubscriptionError {
    /// Rejected stream.
    pub stream: String,
    /// Remote error code.
    pub code: u32,
    /// Remote error message.
    pub message: String,
}

impl SubscriptionError {
    /// Attach a stream name to a remote error.
    pub fn from_remote(stream: impl Into<String>, err: RemoteError) -> Self {
        Self {
            stream: stream.into(),
            code: err.code,
            message: err.message,
        }
    }
}

/// Errors returned by multiplexer handle operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    /// No subscription with that name.
    #[error("no subscription named `{0}`")]
    NotFound(String),
    /// The multiplexer was disposed.
    #[error("multiplexer disposed")]
    Disposed,
    /// The caller's cancellation token fired first.
    #[error("cancelled")]
    Cancelled,
    /// Reconnect attempts ran out.
    #[error("remote unavailable after {attempts} attempts")]
    Unavailable {
        /// Failed attempts before giving up.
        attempts: u32,
    },
}
