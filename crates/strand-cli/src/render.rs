// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Terminal tables for snapshots and diffs.

use comfy_table::{presets::UTF8_FULL, Table};
use strand_diff::{DiffLine, LineDiff, LineKind};
use strand_view::ViewSnapshot;

/// Snapshot as a table: one `id` column followed by the view's columns.
/// Absent cells render empty.
pub(crate) fn snapshot_table(snap: &ViewSnapshot) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    let mut header = Vec::with_capacity(snap.columns.len() + 1);
    header.push("id".to_owned());
    header.extend(snap.columns.iter().cloned());
    table.set_header(header);
    for (id, cells) in &snap.rows {
        let mut row = Vec::with_capacity(cells.len() + 1);
        row.push(id.clone());
        row.extend(cells.iter().map(ToString::to_string));
        table.add_row(row);
    }
    table
}

/// One-line summary printed above a snapshot table.
pub(crate) fn snapshot_caption(stream: &str, snap: &ViewSnapshot) -> String {
    let state = format!("{:?}", snap.state()).to_lowercase();
    format!(
        "{stream}: {state}, {} rows x {} columns",
        snap.len(),
        snap.columns.len()
    )
}

fn marker(line: &DiffLine) -> &'static str {
    match line.kind {
        LineKind::Added => "+ ",
        LineKind::Removed => "- ",
        LineKind::Context => "  ",
        LineKind::Filler => "",
    }
}

fn number(line: &DiffLine) -> String {
    line.line_number.map(|n| n.to_string()).unwrap_or_default()
}

/// Side-by-side diff table.
pub(crate) fn diff_table(diff: &LineDiff, changed_only: bool) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["#", "before", "#", "after"]);
    for (left, right) in diff.rows() {
        let unchanged = left.kind == LineKind::Context && right.kind == LineKind::Context;
        if changed_only && unchanged {
            continue;
        }
        table.add_row(vec![
            number(left),
            format!("{}{}", marker(left), left.content),
            number(right),
            format!("{}{}", marker(right), right.content),
        ]);
    }
    table
}

/// Summary line under a diff table.
pub(crate) fn diff_summary(diff: &LineDiff) -> String {
    if diff.is_identical() {
        "identical".to_owned()
    } else {
        format!("{} changed rows", diff.changed_rows())
    }
}
