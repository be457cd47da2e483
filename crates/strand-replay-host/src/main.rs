// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Development stream host: replays a frame script over the Strand socket.

mod script;

use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use strand_app_core::config::ConfigService;
use strand_config_fs::FsConfigStore;
use strand_stream_proto::{
    default_socket_path,
    wire::{decode_message, encode_message, try_extract_packet, MAX_PAYLOAD_BYTES},
    InboundFrame, Message,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::script::Script;

const PREFS_KEY: &str = "replay_host";
const UNKNOWN_STREAM: u32 = 404;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
struct HostPrefs {
    socket_path: String,
    script: Option<String>,
}

impl Default for HostPrefs {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path().display().to_string(),
            script: None,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Strand replay host")]
struct Args {
    /// Unix socket to listen on (overrides saved prefs)
    #[arg(long)]
    socket: Option<PathBuf>,
    /// JSON-lines frame script to replay (overrides saved prefs)
    #[arg(long)]
    script: Option<PathBuf>,
}

struct ConnState {
    subscribed: HashSet<String>,
    tx: mpsc::Sender<Vec<u8>>,
}

struct HostState {
    next_conn_id: u64,
    next_ts: u64,
    script: Arc<Script>,
    conns: HashMap<u64, ConnState>,
}

impl HostState {
    fn new(script: Script) -> Self {
        Self {
            next_conn_id: 0,
            next_ts: 0,
            script: Arc::new(script),
            conns: HashMap::new(),
        }
    }

    fn alloc_ts(&mut self) -> u64 {
        let t = self.next_ts;
        self.next_ts += 1;
        t
    }

    fn add_conn(&mut self, tx: mpsc::Sender<Vec<u8>>) -> u64 {
        let id = self.next_conn_id;
        self.next_conn_id += 1;
        self.conns.insert(
            id,
            ConnState {
                subscribed: HashSet::new(),
                tx,
            },
        );
        id
    }

    /// Encode `frames` with fresh timestamps.
    fn encode_frames<'a>(
        &mut self,
        frames: impl IntoIterator<Item = &'a InboundFrame>,
    ) -> Result<Vec<Vec<u8>>> {
        frames
            .into_iter()
            .map(|frame| {
                let ts = self.alloc_ts();
                Ok(encode_message(&Message::Stream(frame.clone()), ts)?)
            })
            .collect()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let args = Args::parse();

    // Config (best-effort)
    let config: Option<ConfigService<FsConfigStore>> =
        FsConfigStore::new().map(ConfigService::new).ok();
    let mut prefs: HostPrefs = config
        .as_ref()
        .and_then(|c| c.load_or_init::<HostPrefs>(PREFS_KEY).ok())
        .unwrap_or_default();
    if let Some(socket) = &args.socket {
        prefs.socket_path = socket.display().to_string();
    }
    if let Some(script) = &args.script {
        prefs.script = Some(script.display().to_string());
    }

    let script = match &prefs.script {
        Some(path) => Script::load(Path::new(path))?,
        None => {
            warn!("no script configured; every subscription will be rejected");
            Script::default()
        }
    };
    info!(
        frames = script.len(),
        streams = script.streams().count(),
        "script loaded"
    );

    let host = Arc::new(Mutex::new(HostState::new(script)));

    // Remove stale socket if present
    let _ = std::fs::remove_file(&prefs.socket_path);
    let listener = UnixListener::bind(&prefs.socket_path)
        .with_context(|| format!("binding {}", prefs.socket_path))?;
    info!("replay host listening at {}", prefs.socket_path);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _) = accepted?;
                let host = Arc::clone(&host);
                tokio::spawn(async move {
                    if let Err(err) = handle_client(stream, host).await {
                        warn!(?err, "client handler error");
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                let _ = std::fs::remove_file(&prefs.socket_path);
                return Ok(());
            }
        }
    }
}

async fn handle_client(stream: UnixStream, host: Arc<Mutex<HostState>>) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();

    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(256);
    let conn_id = host.lock().await.add_conn(tx);
    info!(conn_id, "client connected");

    tokio::spawn(async move {
        while let Some(buf) = rx.recv().await {
            if writer.write_all(&buf).await.is_err() {
                break;
            }
        }
    });

    let result = read_loop(&mut reader, conn_id, &host).await;

    host.lock().await.conns.remove(&conn_id);
    info!(conn_id, "client disconnected");
    result
}

async fn read_loop(
    reader: &mut tokio::net::unix::OwnedReadHalf,
    conn_id: u64,
    host: &Arc<Mutex<HostState>>,
) -> Result<()> {
    let mut read_buf = vec![0u8; 16 * 1024];
    let mut acc: Vec<u8> = Vec::with_capacity(32 * 1024);
    loop {
        let n = reader.read(&mut read_buf).await?;
        if n == 0 {
            return Ok(());
        }
        acc.extend_from_slice(&read_buf[..n]);
        while let Some(packet) = try_extract_packet(&mut acc, MAX_PAYLOAD_BYTES)? {
            let (msg, _ts, _used) = decode_message(&packet)?;
            handle_message(msg, conn_id, host).await?;
        }
    }
}

// Handle a single inbound message from a connection.
async fn handle_message(msg: Message, conn_id: u64, host: &Arc<Mutex<HostState>>) -> Result<()> {
    let mut h = host.lock().await;
    let script = Arc::clone(&h.script);
    let conn = h
        .conns
        .get_mut(&conn_id)
        .ok_or_else(|| anyhow::anyhow!("missing conn {conn_id}"))?;

    let (stream, replay) = match msg {
        Message::Subscribe(sub) => {
            info!(conn_id, stream = %sub.stream, kind = %sub.params.kind, "subscribe");
            (sub.stream, true)
        }
        Message::Restart(sub) => {
            info!(conn_id, stream = %sub.stream, kind = %sub.params.kind, "restart");
            let known = conn.subscribed.contains(&sub.stream);
            (sub.stream, known)
        }
        Message::Unsubscribe(unsub) => {
            info!(conn_id, stream = %unsub.stream, "unsubscribe");
            conn.subscribed.remove(&unsub.stream);
            return Ok(());
        }
        other @ (Message::Stream(_) | Message::Error(_)) => {
            debug!(conn_id, op = other.op_name(), "ignoring host-bound op from client");
            return Ok(());
        }
    };

    let tx = conn.tx.clone();
    let packets = match script.backlog(&stream) {
        Some(backlog) if replay => {
            conn.subscribed.insert(stream.clone());
            h.encode_frames(backlog)?
        }
        _ => {
            conn.subscribed.remove(&stream);
            let reject = InboundFrame::rejected(stream.as_str(), UNKNOWN_STREAM, "unknown stream");
            h.encode_frames([&reject])?
        }
    };
    drop(h);

    for pkt in packets {
        if tx.send(pkt).await.is_err() {
            break;
        }
    }
    Ok(())
}
