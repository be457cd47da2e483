// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! [`Connector`] over a Unix socket speaking the local packet framing.

use std::path::{Path, PathBuf};
use strand_stream_proto::wire::{decode_message, encode_message, try_extract_packet, MAX_PAYLOAD_BYTES};
use strand_stream_proto::{ClientIntent, InboundFrame, Message};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::transport::{Connector, Link};

const CHANNEL_DEPTH: usize = 256;

/// Connects to a stream host listening on a Unix socket.
#[derive(Debug, Clone)]
pub struct UnixConnector {
    path: PathBuf,
    max_payload: usize,
}

impl UnixConnector {
    /// Connector for the socket at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_payload: MAX_PAYLOAD_BYTES,
        }
    }

    /// Override the per-packet payload bound.
    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }

    /// Socket path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Connector for UnixConnector {
    async fn connect(&self) -> Result<Link, TransportError> {
        let stream = UnixStream::connect(&self.path)
            .await
            .map_err(|e| TransportError::Connect(format!("{}: {e}", self.path.display())))?;
        Ok(spawn_link(stream, self.max_payload))
    }
}

/// Wire an already-connected stream into a [`Link`].
pub fn spawn_link(stream: UnixStream, max_payload: usize) -> Link {
    let (reader, writer) = stream.into_split();
    let (out_tx, out_rx) = mpsc::channel::<ClientIntent>(CHANNEL_DEPTH);
    let (in_tx, in_rx) = mpsc::channel::<InboundFrame>(CHANNEL_DEPTH);

    tokio::spawn(async move {
        if let Err(err) = write_loop(writer, out_rx).await {
            debug!(%err, "link writer stopped");
        }
    });
    tokio::spawn(async move {
        if let Err(err) = read_loop(reader, in_tx, max_payload).await {
            warn!(%err, "link reader stopped");
        }
    });

    Link {
        outbound: out_tx,
        inbound: in_rx,
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut intents: mpsc::Receiver<ClientIntent>,
) -> Result<(), TransportError> {
    let mut ts = 0u64;
    while let Some(intent) = intents.recv().await {
        let pkt = encode_message(&Message::from(intent), ts)?;
        ts += 1;
        writer
            .write_all(&pkt)
            .await
            .map_err(|e| TransportError::LinkLost(e.to_string()))?;
    }
    // Link dropped by the multiplexer: close our half.
    let _ = writer.shutdown().await;
    Ok(())
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    frames: mpsc::Sender<InboundFrame>,
    max_payload: usize,
) -> Result<(), TransportError> {
    let mut read_buf = vec![0u8; 16 * 1024];
    let mut acc: Vec<u8> = Vec::with_capacity(32 * 1024);
    loop {
        let n = reader
            .read(&mut read_buf)
            .await
            .map_err(|e| TransportError::LinkLost(e.to_string()))?;
        if n == 0 {
            return Ok(());
        }
        acc.extend_from_slice(&read_buf[..n]);
        while let Some(packet) = try_extract_packet(&mut acc, max_payload)? {
            let decoded = match decode_message(&packet) {
                Ok(decoded) => decoded,
                Err(err) if err.is_payload_error() => {
                    warn!(%err, bytes = packet.len(), "skipping undecodable packet");
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            match decoded {
                (Message::Stream(frame), _, _) => {
                    if frames.send(frame).await.is_err() {
                        // Multiplexer dropped the link.
                        return Ok(());
                    }
                }
                (Message::Error(err), _, _) => {
                    warn!(code = err.code, name = %err.name, message = %err.message, "host reported an error");
                }
                (other, _, _) => {
                    debug!(op = other.op_name(), "ignoring unexpected op from host");
                }
            }
        }
    }
}
