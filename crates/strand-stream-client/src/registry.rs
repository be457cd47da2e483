// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Subscription registry: the single source of truth for which streams the
//! client wants and in what state each one is.
//!
//! The registry is plain data. The multiplexer's control task owns it and is
//! the only writer; callers see copies through [`SubscriptionStatus`].

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use strand_stream_proto::StreamParams;

use crate::error::SubscriptionError;

/// Lifecycle state of one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SubscriptionState {
    /// Requested, waiting for the first frame (or for a reconnect).
    Pending,
    /// At least one frame arrived since the last (re)issue.
    Active,
    /// The remote rejected the stream.
    Errored,
    /// Removed by the caller.
    Closed,
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Errored => "errored",
            Self::Closed => "closed",
        };
        f.write_str(label)
    }
}

/// Copy of one registry entry.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionStatus {
    /// Stream name.
    pub name: String,
    /// Current parameters.
    pub params: StreamParams,
    /// Lifecycle state.
    pub state: SubscriptionState,
    /// Most recent remote rejection, cleared when the stream goes active.
    pub last_error: Option<SubscriptionError>,
    /// Generation of the materializer currently bound to this name.
    pub generation: u64,
}

/// Result of [`SubscriptionRegistry::register`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    /// Stream name.
    pub name: String,
    /// Generation of the entry.
    pub generation: u64,
    /// False when the name was already registered and only its parameters
    /// were updated.
    pub created: bool,
}

#[derive(Debug)]
struct Entry {
    params: StreamParams,
    state: SubscriptionState,
    last_error: Option<SubscriptionError>,
    generation: u64,
}

impl Entry {
    fn status(&self, name: &str) -> SubscriptionStatus {
        SubscriptionStatus {
            name: name.to_owned(),
            params: self.params.clone(),
            state: self.state,
            last_error: self.last_error.clone(),
            generation: self.generation,
        }
    }
}

/// Name-keyed set of subscriptions.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: BTreeMap<String, Entry>,
    next_generation: u64,
}

impl SubscriptionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn alloc_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    /// Add `name`, or update its parameters in place if already present.
    pub fn register(&mut self, name: &str, params: StreamParams) -> SubscriptionHandle {
        if let Some(entry) = self.entries.get_mut(name) {
            entry.params = params;
            return SubscriptionHandle {
                name: name.to_owned(),
                generation: entry.generation,
                created: false,
            };
        }
        let generation = self.alloc_generation();
        self.entries.insert(
            name.to_owned(),
            Entry {
                params,
                state: SubscriptionState::Pending,
                last_error: None,
                generation,
            },
        );
        SubscriptionHandle {
            name: name.to_owned(),
            generation,
            created: true,
        }
    }

    /// Replace the parameters of an existing entry. Returns false if unknown.
    pub fn update(&mut self, name: &str, params: StreamParams) -> bool {
        self.entries
            .get_mut(name)
            .map(|entry| entry.params = params)
            .is_some()
    }

    /// Remove `name`, returning its final status (state `Closed`).
    /// Unknown names are a no-op.
    pub fn unregister(&mut self, name: &str) -> Option<SubscriptionStatus> {
        self.entries.remove(name).map(|entry| {
            let mut status = entry.status(name);
            status.state = SubscriptionState::Closed;
            status
        })
    }

    /// Status of `name`.
    pub fn get(&self, name: &str) -> Option<SubscriptionStatus> {
        self.entries.get(name).map(|entry| entry.status(name))
    }

    /// Whether `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Registered names in sorted order.
    pub fn list(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Registered names with their parameters, sorted by name.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &StreamParams)> {
        self.entries
            .iter()
            .map(|(name, entry)| (name.as_str(), &entry.params))
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record a confirmed frame. Returns true if the state changed.
    pub fn mark_active(&mut self, name: &str) -> bool {
        match self.entries.get_mut(name) {
            Some(entry) if entry.state != SubscriptionState::Active => {
                entry.state = SubscriptionState::Active;
                entry.last_error = None;
                true
            }
            _ => false,
        }
    }

    /// Record a remote rejection.
    pub fn mark_errored(&mut self, name: &str, error: SubscriptionError) -> bool {
        match self.entries.get_mut(name) {
            Some(entry) => {
                entry.state = SubscriptionState::Errored;
                entry.last_error = Some(error);
                true
            }
            None => false,
        }
    }

    /// Put one entry back to `Pending`.
    pub fn mark_pending(&mut self, name: &str) -> bool {
        match self.entries.get_mut(name) {
            Some(entry) => {
                entry.state = SubscriptionState::Pending;
                true
            }
            None => false,
        }
    }

    /// Put every entry back to `Pending` (the link went away).
    pub fn mark_all_pending(&mut self) {
        for entry in self.entries.values_mut() {
            entry.state = SubscriptionState::Pending;
        }
    }

    /// Bind a fresh generation to `name`, invalidating in-flight dispatch for
    /// the old one.
    pub fn renew(&mut self, name: &str) -> Option<u64> {
        if !self.entries.contains_key(name) {
            return None;
        }
        let generation = self.alloc_generation();
        let entry = self.entries.get_mut(name)?;
        entry.generation = generation;
        Some(generation)
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use strand_stream_proto::StreamKind;

    fn query(q: &str) -> StreamParams {
        StreamParams::new(StreamKind::Query).arg("query", q)
    }

    #[test]
    fn registering_twice_updates_in_place() {
        let mut reg = SubscriptionRegistry::new();
        let first = reg.register("q", query("a"));
        let second = reg.register("q", query("b"));
        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.generation, second.generation);
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get("q").unwrap().params, query("b"));
    }

    #[test]
    fn unregistering_unknown_names_is_a_no_op() {
        let mut reg = SubscriptionRegistry::new();
        reg.register("a", query("a"));
        assert_eq!(reg.unregister("zzz"), None);
        assert_eq!(reg.list(), vec!["a"]);
    }

    #[test]
    fn unregister_reports_closed() {
        let mut reg = SubscriptionRegistry::new();
        reg.register("a", query("a"));
        let status = reg.unregister("a").unwrap();
        assert_eq!(status.state, SubscriptionState::Closed);
        assert!(reg.get("a").is_none());
    }

    #[test]
    fn lifecycle_transitions() {
        let mut reg = SubscriptionRegistry::new();
        reg.register("a", query("a"));
        assert_eq!(reg.get("a").unwrap().state, SubscriptionState::Pending);

        assert!(reg.mark_active("a"));
        assert!(!reg.mark_active("a"));

        let err = SubscriptionError {
            stream: "a".into(),
            code: 400,
            message: "bad query".into(),
        };
        reg.mark_errored("a", err.clone());
        let status = reg.get("a").unwrap();
        assert_eq!(status.state, SubscriptionState::Errored);
        assert_eq!(status.last_error, Some(err));

        reg.mark_all_pending();
        assert_eq!(reg.get("a").unwrap().state, SubscriptionState::Pending);

        reg.mark_active("a");
        assert_eq!(reg.get("a").unwrap().last_error, None);
    }

    #[test]
    fn generations_are_never_reused() {
        let mut reg = SubscriptionRegistry::new();
        let g1 = reg.register("a", query("a")).generation;
        let g2 = reg.renew("a").unwrap();
        reg.unregister("a");
        let g3 = reg.register("a", query("a")).generation;
        assert!(g1 < g2 && g2 < g3);
        assert_eq!(reg.renew("missing"), None);
    }

    #[test]
    fn entries_are_sorted_by_name() {
        let mut reg = SubscriptionRegistry::new();
        reg.register("b", query("b"));
        reg.register("a", query("a"));
        let names: Vec<&str> = reg.entries().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
