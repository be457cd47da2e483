// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Console preferences shared by the CLI and the replay host.

use serde::{Deserialize, Serialize};
use strand_stream_proto::default_socket_path;

/// Config key under which [`ConsolePrefs`] are stored.
pub const CONSOLE_PREFS_KEY: &str = "console";

/// Saved preferences for a console session.
///
/// Missing fields fall back to their defaults, so older files keep loading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsolePrefs {
    /// Unix socket of the stream host.
    pub socket_path: String,
    /// Reconnect backoff.
    pub reconnect: ReconnectPrefs,
    /// Bound of each subscription's dispatch queue.
    pub dispatch_queue_depth: usize,
    /// Line count above which diffs carry a size advisory.
    pub diff_advisory_lines: usize,
}

impl Default for ConsolePrefs {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path().display().to_string(),
            reconnect: ReconnectPrefs::default(),
            dispatch_queue_depth: 256,
            diff_advisory_lines: 50_000,
        }
    }
}

/// Reconnect backoff parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPrefs {
    /// First delay, in milliseconds.
    pub initial_ms: u64,
    /// Growth factor applied after each failed attempt.
    pub multiplier: f64,
    /// Delay cap, in milliseconds.
    pub max_ms: u64,
    /// Jitter as a fraction of the delay (0.25 = ±25%).
    pub jitter: f64,
    /// Give up after this many consecutive failures; `None` retries forever.
    pub max_retries: Option<u32>,
}

impl Default for ReconnectPrefs {
    fn default() -> Self {
        Self {
            initial_ms: 250,
            multiplier: 2.0,
            max_ms: 30_000,
            jitter: 0.25,
            max_retries: None,
        }
    }
}
