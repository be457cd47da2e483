// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Stream wire schema: inbound frames, client intents and the envelope they
//! travel in.
//!
//! Inbound frames follow the platform's JSON event shape
//! (`{"streamName": .., "operation": ..}` / `{"streamName": .., "state":
//! "synced"}`). Between the console and a local host they are carried in
//! deterministic packets, see [`wire`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::BTreeMap, convert::Infallible, fmt, path::PathBuf, str::FromStr};
use strand_view::OperationBatch;

/// Default Unix socket path for a local stream host.
///
/// Prefers a per-user runtime dir (XDG_RUNTIME_DIR) and falls back to `/tmp`
/// when unavailable.
pub fn default_socket_path() -> PathBuf {
    let base = std::env::var_os("XDG_RUNTIME_DIR").map_or_else(|| PathBuf::from("/tmp"), PathBuf::from);
    base.join("strand-stream.sock")
}

/// Envelope carried as the payload of a packet.
///
/// * `op` – operation name (`subscribe`, `stream`, ...).
/// * `ts` – logical timestamp of the sender.
/// * `payload` – operation specific body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OpEnvelope<P> {
    /// Operation name.
    pub op: String,
    /// Logical timestamp (monotonic per sender).
    pub ts: u64,
    /// Operation-specific body.
    pub payload: P,
}

/// Family of stream a subscription targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    /// State of one resource kind (e.g. interfaces of a node).
    Resource,
    /// Ad hoc query results.
    Query,
    /// Topology graph feed.
    Topology,
    /// Anything else the platform exposes.
    Custom(String),
}

impl StreamKind {
    /// Whether the remote can swap parameters on a live stream.
    pub fn supports_restart(&self) -> bool {
        matches!(self, Self::Query)
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resource => f.write_str("resource"),
            Self::Query => f.write_str("query"),
            Self::Topology => f.write_str("topology"),
            Self::Custom(name) => f.write_str(name),
        }
    }
}

impl FromStr for StreamKind {
    type Err = Infallible;

    /// Known family names map to their variant; anything else is `Custom`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "resource" => Self::Resource,
            "query" => Self::Query,
            "topology" => Self::Topology,
            other => Self::Custom(other.to_owned()),
        })
    }
}

/// Parameters sent with a subscribe or restart request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamParams {
    /// Stream family.
    pub kind: StreamKind,
    /// Kind-specific arguments, opaque to the client.
    #[serde(default)]
    pub args: BTreeMap<String, Value>,
}

impl StreamParams {
    /// Parameters of `kind` with no arguments.
    pub fn new(kind: StreamKind) -> Self {
        Self {
            kind,
            args: BTreeMap::new(),
        }
    }

    /// Add one argument.
    pub fn arg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }
}

/// End-of-backlog signal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncMarker {
    /// Schema object that accompanied the signal, if any.
    pub schema: Option<Value>,
}

/// Remote rejection of a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    /// Numeric code (HTTP-like: 404 unknown stream, 400 bad params, ...).
    pub code: u32,
    /// Human readable message.
    pub message: String,
}

/// One message the remote sent for a named stream.
///
/// A frame may carry an operation batch, the synced signal, both, or a
/// rejection. Batches are applied before the synced signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawFrame", into = "RawFrame")]
pub struct InboundFrame {
    /// Stream this frame belongs to.
    pub stream: String,
    /// Row upserts and deletions.
    pub operation: Option<OperationBatch>,
    /// Present when the remote finished replaying its backlog.
    pub sync: Option<SyncMarker>,
    /// Present when the remote rejected the stream.
    pub error: Option<RemoteError>,
}

impl InboundFrame {
    /// Frame carrying one operation batch.
    pub fn operation(stream: impl Into<String>, batch: OperationBatch) -> Self {
        Self {
            stream: stream.into(),
            operation: Some(batch),
            sync: None,
            error: None,
        }
    }

    /// Frame carrying the synced signal.
    pub fn synced(stream: impl Into<String>, schema: Option<Value>) -> Self {
        Self {
            stream: stream.into(),
            operation: None,
            sync: Some(SyncMarker { schema }),
            error: None,
        }
    }

    /// Frame rejecting the stream.
    pub fn rejected(stream: impl Into<String>, code: u32, message: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            operation: None,
            sync: None,
            error: Some(RemoteError {
                code,
                message: message.into(),
            }),
        }
    }

    /// Decode a platform JSON text frame.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// True if the frame rejects its stream.
    pub fn is_rejection(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum StreamState {
    Synced,
    #[serde(other)]
    Other,
}

/// Platform JSON shape of a frame.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFrame {
    stream_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    operation: Option<OperationBatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    state: Option<StreamState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<RemoteError>,
}

impl From<RawFrame> for InboundFrame {
    fn from(raw: RawFrame) -> Self {
        let sync = (raw.state == Some(StreamState::Synced)).then_some(SyncMarker {
            schema: raw.schema,
        });
        Self {
            stream: raw.stream_name,
            operation: raw.operation,
            sync,
            error: raw.error,
        }
    }
}

impl From<InboundFrame> for RawFrame {
    fn from(frame: InboundFrame) -> Self {
        let (state, schema) = match frame.sync {
            Some(marker) => (Some(StreamState::Synced), marker.schema),
            None => (None, None),
        };
        Self {
            stream_name: frame.stream,
            operation: frame.operation,
            state,
            schema,
            error: frame.error,
        }
    }
}

/// What the client asks of the remote.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientIntent {
    /// Start (or re-issue) a stream.
    Subscribe {
        /// Stream name.
        stream: String,
        /// Stream parameters.
        params: StreamParams,
    },
    /// Stop a stream.
    Unsubscribe {
        /// Stream name.
        stream: String,
    },
    /// Swap the parameters of a live stream.
    Restart {
        /// Stream name.
        stream: String,
        /// New parameters.
        params: StreamParams,
    },
}

impl ClientIntent {
    /// Stream the intent targets.
    pub fn stream(&self) -> &str {
        match self {
            Self::Subscribe { stream, .. }
            | Self::Unsubscribe { stream }
            | Self::Restart { stream, .. } => stream,
        }
    }
}

/// Subscribe / restart payload (client → host).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubscribePayload {
    /// Stream name.
    pub stream: String,
    /// Stream parameters.
    pub params: StreamParams,
}

/// Unsubscribe payload (client → host).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnsubscribePayload {
    /// Stream name.
    pub stream: String,
}

/// Protocol-level error payload, not tied to one stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    /// Numeric error code.
    pub code: u32,
    /// Stable identifier (e.g. "E_BAD_PACKET").
    pub name: String,
    /// Human readable message.
    pub message: String,
}

/// Wire message kinds carried inside OpEnvelope payloads.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Start a stream (op = "subscribe").
    Subscribe(SubscribePayload),
    /// Stop a stream (op = "unsubscribe").
    Unsubscribe(UnsubscribePayload),
    /// Swap parameters of a live stream (op = "restart").
    Restart(SubscribePayload),
    /// Frame for one stream (op = "stream").
    Stream(InboundFrame),
    /// Protocol or processing error (op = "error").
    Error(ErrorPayload),
}

impl Message {
    /// Canonical op string for this message variant.
    pub fn op_name(&self) -> &'static str {
        match self {
            Self::Subscribe(_) => "subscribe",
            Self::Unsubscribe(_) => "unsubscribe",
            Self::Restart(_) => "restart",
            Self::Stream(_) => "stream",
            Self::Error(_) => "error",
        }
    }

    /// Client intent carried by this message, if it is one.
    pub fn into_intent(self) -> Option<ClientIntent> {
        match self {
            Self::Subscribe(p) => Some(ClientIntent::Subscribe {
                stream: p.stream,
                params: p.params,
            }),
            Self::Unsubscribe(p) => Some(ClientIntent::Unsubscribe { stream: p.stream }),
            Self::Restart(p) => Some(ClientIntent::Restart {
                stream: p.stream,
                params: p.params,
            }),
            Self::Stream(_) | Self::Error(_) => None,
        }
    }
}

impl From<ClientIntent> for Message {
    fn from(intent: ClientIntent) -> Self {
        match intent {
            ClientIntent::Subscribe { stream, params } => {
                Self::Subscribe(SubscribePayload { stream, params })
            }
            ClientIntent::Unsubscribe { stream } => Self::Unsubscribe(UnsubscribePayload { stream }),
            ClientIntent::Restart { stream, params } => {
                Self::Restart(SubscribePayload { stream, params })
            }
        }
    }
}

pub mod wire;
