// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! JSON-lines frame scripts.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::Path;
use strand_stream_proto::InboundFrame;

/// Frames to replay, grouped by stream in script order.
#[derive(Debug, Default, Clone, PartialEq)]
pub(crate) struct Script {
    streams: BTreeMap<String, Vec<InboundFrame>>,
}

impl Script {
    /// Read a script file.
    pub(crate) fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading script {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing script {}", path.display()))
    }

    /// Parse script text: one frame per line, `#` comments and blank lines
    /// skipped.
    pub(crate) fn parse(text: &str) -> Result<Self> {
        let mut streams: BTreeMap<String, Vec<InboundFrame>> = BTreeMap::new();
        for (idx, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let frame = InboundFrame::from_json(line)
                .with_context(|| format!("line {}", idx + 1))?;
            streams.entry(frame.stream.clone()).or_default().push(frame);
        }
        Ok(Self { streams })
    }

    /// Backlog for `stream`, if the script mentions it.
    pub(crate) fn backlog(&self, stream: &str) -> Option<&[InboundFrame]> {
        self.streams.get(stream).map(Vec::as_slice)
    }

    /// Stream names in the script.
    pub(crate) fn streams(&self) -> impl Iterator<Item = &str> {
        self.streams.keys().map(String::as_str)
    }

    /// Total frames across all streams.
    pub(crate) fn len(&self) -> usize {
        self.streams.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Write;

    const DEMO: &str = r#"
# interfaces
{"streamName": "ifaces", "operation": {"upserts": [{"id": "eth0", "fields": {"mtu": 1500}}]}}
{"streamName": "alarms", "state": "synced"}
{"streamName": "ifaces", "operation": {"deletions": ["eth9"]}}
{"streamName": "ifaces", "state": "synced", "schema": {"mtu": "int"}}
"#;

    #[test]
    fn frames_group_by_stream_in_order() {
        let script = Script::parse(DEMO).unwrap();
        assert_eq!(script.len(), 4);
        assert_eq!(script.streams().collect::<Vec<_>>(), ["alarms", "ifaces"]);
        let ifaces = script.backlog("ifaces").unwrap();
        assert_eq!(ifaces.len(), 3);
        assert!(ifaces[0].operation.is_some());
        assert!(ifaces[2].sync.is_some());
        assert!(script.backlog("nope").is_none());
    }

    #[test]
    fn bad_lines_report_their_number() {
        let err = Script::parse("{\"streamName\": \"a\"}\nnot json\n").unwrap_err();
        assert!(format!("{err:#}").contains("line 2"));
    }

    #[test]
    fn loads_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(DEMO.as_bytes()).unwrap();
        let script = Script::load(file.path()).unwrap();
        assert_eq!(script, Script::parse(DEMO).unwrap());
        assert!(Script::load(Path::new("/nonexistent/script.jsonl")).is_err());
    }
}
