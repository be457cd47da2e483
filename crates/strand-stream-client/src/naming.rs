// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Collision-free names for ad hoc streams.

use std::time::{SystemTime, UNIX_EPOCH};

/// Generates `<prefix>-<unix-millis>` names, falling back to
/// `<prefix>-<millis>-<n>` whenever the clock has not advanced since the
/// previous name (same millisecond or a backwards step).
#[derive(Debug, Default)]
pub struct StreamNamer {
    last_millis: u64,
    counter: u64,
}

impl StreamNamer {
    /// Fresh namer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Next name for `prefix`, stamped with the current wall clock.
    pub fn next(&mut self, prefix: &str) -> String {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        self.next_at(prefix, millis)
    }

    /// Next name for `prefix` as if the clock read `millis`.
    pub fn next_at(&mut self, prefix: &str, millis: u64) -> String {
        if millis > self.last_millis {
            self.last_millis = millis;
            self.counter = 0;
            return format!("{prefix}-{millis}");
        }
        self.counter += 1;
        format!("{prefix}-{}-{}", self.last_millis, self.counter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn same_millisecond_gets_a_counter() {
        let mut namer = StreamNamer::new();
        assert_eq!(namer.next_at("query", 1000), "query-1000");
        assert_eq!(namer.next_at("query", 1000), "query-1000-1");
        assert_eq!(namer.next_at("query", 1000), "query-1000-2");
        assert_eq!(namer.next_at("query", 1001), "query-1001");
    }

    #[test]
    fn backwards_clock_stays_unique() {
        let mut namer = StreamNamer::new();
        assert_eq!(namer.next_at("q", 500), "q-500");
        assert_eq!(namer.next_at("q", 400), "q-500-1");
    }

    #[test]
    fn rapid_activations_never_collide() {
        let mut namer = StreamNamer::new();
        let names: HashSet<String> = (0..1000).map(|_| namer.next("alarms")).collect();
        assert_eq!(names.len(), 1000);
    }
}
