// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Multiplexer settings.

use strand_app_core::prefs::ConsolePrefs;

use crate::backoff::ReconnectConfig;

/// Tuning for a [`StreamMultiplexer`](crate::StreamMultiplexer).
#[derive(Debug, Clone, PartialEq)]
pub struct MultiplexerConfig {
    /// Reconnect backoff.
    pub reconnect: ReconnectConfig,
    /// Bound of each subscription's dispatch queue. A full queue applies
    /// backpressure to the link rather than dropping frames.
    pub dispatch_queue_depth: usize,
    /// Bound of the handle → control task command queue.
    pub command_queue_depth: usize,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self::from(&ConsolePrefs::default())
    }
}

impl From<&ConsolePrefs> for MultiplexerConfig {
    fn from(prefs: &ConsolePrefs) -> Self {
        Self {
            reconnect: ReconnectConfig::from(&prefs.reconnect),
            dispatch_queue_depth: prefs.dispatch_queue_depth.max(1),
            command_queue_depth: 64,
        }
    }
}
