// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
#![allow(clippy::print_stdout)]
//! Strand developer CLI.
//!
//! - `tail`: subscribe to one stream and print its view as it changes.
//! - `diff`: side-by-side line diff of two files.
//! - `names`: mint collision-free names for ad hoc streams.

mod render;

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use strand_app_core::config::ConfigService;
use strand_app_core::prefs::{ConsolePrefs, CONSOLE_PREFS_KEY};
use strand_config_fs::FsConfigStore;
use strand_stream_client::{
    MultiplexerConfig, StreamMultiplexer, StreamNamer, SubscriptionState, UnixConnector,
};
use strand_stream_proto::{StreamKind, StreamParams};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Strand developer CLI")]
struct Args {
    /// Directory holding Strand prefs (defaults to the platform config dir)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,
    /// Stream host socket (overrides saved prefs)
    #[arg(long, global = true)]
    socket: Option<PathBuf>,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Subscribe to a stream and print its view on every change
    Tail(TailArgs),
    /// Side-by-side diff of two files
    Diff(DiffArgs),
    /// Generate ephemeral stream names
    Names(NamesArgs),
}

#[derive(clap::Args, Debug)]
struct TailArgs {
    /// Stream name
    stream: String,
    /// Stream family: resource, query, topology or a custom name
    #[arg(long, default_value = "resource")]
    kind: StreamKind,
    /// Stream argument as key=value; values that parse as JSON are sent as JSON
    #[arg(long = "arg", value_parser = parse_key_value)]
    args: Vec<(String, Value)>,
    /// Exit after the first snapshot that follows the end of the backlog
    #[arg(long)]
    until_synced: bool,
    /// Print snapshots as JSON lines instead of tables
    #[arg(long)]
    json: bool,
}

impl TailArgs {
    fn params(&self) -> StreamParams {
        self.args
            .iter()
            .fold(StreamParams::new(self.kind.clone()), |params, (k, v)| {
                params.arg(k.clone(), v.clone())
            })
    }
}

#[derive(clap::Args, Debug)]
struct DiffArgs {
    /// Original file
    before: PathBuf,
    /// Changed file
    after: PathBuf,
    /// Advisory line limit (defaults to the saved prefs)
    #[arg(long)]
    limit: Option<usize>,
    /// Only print rows that differ
    #[arg(long)]
    changed_only: bool,
}

#[derive(clap::Args, Debug)]
struct NamesArgs {
    /// Name prefix, e.g. "query"
    prefix: String,
    /// How many names to print
    #[arg(short = 'n', long, default_value_t = 1)]
    count: usize,
}

fn parse_key_value(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got `{raw}`"))?;
    if key.is_empty() {
        return Err(format!("empty key in `{raw}`"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_owned()));
    Ok((key.to_owned(), value))
}

/// Load console prefs, persisting defaults once if absent. Best-effort:
/// an unreadable store falls back to defaults.
fn load_prefs(args: &Args) -> ConsolePrefs {
    let store = match &args.config_dir {
        Some(dir) => FsConfigStore::with_base(dir),
        None => FsConfigStore::new(),
    };
    let mut prefs = match store.map(ConfigService::new) {
        Ok(config) => config
            .load_or_init::<ConsolePrefs>(CONSOLE_PREFS_KEY)
            .unwrap_or_else(|err| {
                warn!(%err, "ignoring unreadable console prefs");
                ConsolePrefs::default()
            }),
        Err(err) => {
            warn!(%err, "config store unavailable; using defaults");
            ConsolePrefs::default()
        }
    };
    if let Some(socket) = &args.socket {
        prefs.socket_path = socket.display().to_string();
    }
    prefs
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let prefs = load_prefs(&args);

    match args.cmd {
        Command::Tail(tail_args) => tail(tail_args, &prefs).await,
        Command::Diff(diff_args) => diff(&diff_args, &prefs),
        Command::Names(names_args) => {
            let mut namer = StreamNamer::new();
            for _ in 0..names_args.count {
                println!("{}", namer.next(&names_args.prefix));
            }
            Ok(())
        }
    }
}

fn diff(args: &DiffArgs, prefs: &ConsolePrefs) -> Result<()> {
    let before = std::fs::read_to_string(&args.before)
        .with_context(|| format!("reading {}", args.before.display()))?;
    let after = std::fs::read_to_string(&args.after)
        .with_context(|| format!("reading {}", args.after.display()))?;

    let limit = args.limit.unwrap_or(prefs.diff_advisory_lines);
    let result = strand_diff::diff_with_limit(&before, &after, limit);
    if let Some(advisory) = &result.advisory {
        warn!(%advisory, "large input");
    }
    if !result.is_identical() {
        println!("{}", render::diff_table(&result, args.changed_only));
    }
    println!("{}", render::diff_summary(&result));
    Ok(())
}

async fn tail(args: TailArgs, prefs: &ConsolePrefs) -> Result<()> {
    let connector = UnixConnector::new(&prefs.socket_path);
    let mux = StreamMultiplexer::new(connector, MultiplexerConfig::from(prefs));
    info!(socket = %prefs.socket_path, stream = %args.stream, "tailing");

    mux.subscribe(args.stream.as_str(), args.params()).await?;
    let mut rx = mux.watch(&args.stream).await?;
    let mut status_tick = tokio::time::interval(Duration::from_millis(500));
    let mut last_state = None;

    let outcome = loop {
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
                let snap = Arc::clone(&rx.borrow_and_update());
                if args.json {
                    println!("{}", serde_json::to_string(&*snap)?);
                } else {
                    println!("{}", render::snapshot_caption(&args.stream, &snap));
                    println!("{}", render::snapshot_table(&snap));
                }
                if args.until_synced && snap.synced {
                    break Ok(());
                }
            }
            _ = status_tick.tick() => {
                let Some(status) = mux.status(&args.stream).await else {
                    break Ok(());
                };
                if last_state != Some(status.state) {
                    info!(state = %status.state, "subscription");
                    last_state = Some(status.state);
                }
                if status.state == SubscriptionState::Errored {
                    let reason = status
                        .last_error
                        .map_or_else(|| "rejected".to_owned(), |e| e.to_string());
                    break Err(reason);
                }
            }
            _ = tokio::signal::ctrl_c() => break Ok(()),
        }
    };

    mux.dispose().await;
    match outcome {
        Ok(()) => Ok(()),
        Err(reason) => bail!("{reason}"),
    }
}
