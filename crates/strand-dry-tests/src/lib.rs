// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Shared test doubles and fixtures for Strand crates.
#![forbid(unsafe_code)]
//!
//! # Modules
//!
//! - [`config`] - In-memory config store
//! - [`frames`] - Inbound frame builders and backlogs
//! - [`link`] - Scripted connector and remote link ends
//! - [`wait`] - Bounded waits on snapshot and state channels

pub mod config;
pub mod frames;
pub mod link;
pub mod wait;

pub use config::InMemoryConfigStore;
pub use frames::{backlog, FrameBuilder};
pub use link::{RemoteEnd, RemoteEnds, ScriptedConnector, SCRIPT_TIMEOUT};
pub use wait::{wait_for, wait_for_state};
