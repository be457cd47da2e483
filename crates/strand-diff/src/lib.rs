// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Aligned line diff for rendering two versions of a resource side by side.
//!
//! [`diff`] returns a "before" pane and an "after" pane of equal length, so a
//! renderer can zip them row by row without computing vertical offsets.
//!
//! The algorithm is the classic O(n·m) longest-common-subsequence table with
//! a traceback pass. Common leading and trailing lines are peeled off first,
//! which keeps the table small for the usual "one field changed" edit.
//! Inputs are expected to be single-resource configuration blobs; anything
//! above [`ADVISORY_LINE_LIMIT`] lines is still diffed but flagged with a
//! [`DiffInputTooLarge`] advisory. Very large inputs need a different
//! algorithm (Myers) and are not handled here.
//!
//! Line numbering: 1-based and sequential per pane; filler rows carry no
//! number.

use serde::Serialize;
use thiserror::Error;
use tracing::warn;

/// Line count above which [`diff`] attaches a [`DiffInputTooLarge`] advisory.
pub const ADVISORY_LINE_LIMIT: usize = 50_000;

/// Classification of one rendered row in a pane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LineKind {
    /// Present, unchanged, in both versions.
    Context,
    /// Only in the after version.
    Added,
    /// Only in the before version.
    Removed,
    /// Padding opposite an added or removed line.
    Filler,
}

/// One rendered row in a pane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiffLine {
    /// Line text without its terminator; empty for filler.
    pub content: String,
    /// Row classification.
    pub kind: LineKind,
    /// 1-based line number within this pane; `None` for filler.
    pub line_number: Option<usize>,
}

impl DiffLine {
    fn filler() -> Self {
        Self {
            content: String::new(),
            kind: LineKind::Filler,
            line_number: None,
        }
    }
}

/// Advisory raised when an input exceeds the size the O(n·m) table is meant for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize)]
#[error("diff input has {lines} lines, above the advisory limit of {limit}")]
pub struct DiffInputTooLarge {
    /// Line count of the larger input.
    pub lines: usize,
    /// Limit that was exceeded.
    pub limit: usize,
}

/// Result of [`diff`]: two aligned panes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LineDiff {
    /// Rows of the before pane.
    pub before: Vec<DiffLine>,
    /// Rows of the after pane; always the same length as `before`.
    pub after: Vec<DiffLine>,
    /// Size advisory, if an input was above the limit.
    pub advisory: Option<DiffInputTooLarge>,
}

impl LineDiff {
    /// True when both inputs had identical lines (both panes empty).
    pub fn is_identical(&self) -> bool {
        self.before.is_empty() && self.after.is_empty()
    }

    /// Aligned rows as (before, after) pairs.
    pub fn rows(&self) -> impl Iterator<Item = (&DiffLine, &DiffLine)> {
        self.before.iter().zip(self.after.iter())
    }

    /// Number of rows where either side is not context.
    pub fn changed_rows(&self) -> usize {
        self.rows()
            .filter(|(b, a)| b.kind != LineKind::Context || a.kind != LineKind::Context)
            .count()
    }
}

/// Return an advisory when either input has more than `limit` lines.
pub fn check_size(before: &str, after: &str, limit: usize) -> Option<DiffInputTooLarge> {
    advisory(before.lines().count(), after.lines().count(), limit)
}

fn advisory(before_lines: usize, after_lines: usize, limit: usize) -> Option<DiffInputTooLarge> {
    let lines = before_lines.max(after_lines);
    (lines > limit).then_some(DiffInputTooLarge { lines, limit })
}

/// Diff two blobs line by line using [`ADVISORY_LINE_LIMIT`].
pub fn diff(before: &str, after: &str) -> LineDiff {
    diff_with_limit(before, after, ADVISORY_LINE_LIMIT)
}

/// Diff two blobs line by line, flagging inputs above `limit` lines.
///
/// Lines are split with [`str::lines`], so `\r\n` endings and a single
/// trailing newline do not count as differences.
pub fn diff_with_limit(before: &str, after: &str, limit: usize) -> LineDiff {
    let old: Vec<&str> = before.lines().collect();
    let new: Vec<&str> = after.lines().collect();
    if old == new {
        return LineDiff::default();
    }

    let too_large = advisory(old.len(), new.len(), limit);
    if let Some(adv) = &too_large {
        warn!(lines = adv.lines, limit = adv.limit, "diffing oversized input");
    }

    let ops = edit_script(&old, &new);
    let mut out = Layout::default();
    for op in ops {
        match op {
            Op::Keep(i, j) => {
                out.flush(&old, &new);
                out.context(old[i], new[j]);
            }
            Op::Remove(i) => out.removed.push(i),
            Op::Add(j) => out.added.push(j),
        }
    }
    out.flush(&old, &new);

    LineDiff {
        before: out.before,
        after: out.after,
        advisory: too_large,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Keep(usize, usize),
    Remove(usize),
    Add(usize),
}

/// Edit script over whole-sequence indices.
fn edit_script(old: &[&str], new: &[&str]) -> Vec<Op> {
    let prefix = old
        .iter()
        .zip(new.iter())
        .take_while(|(a, b)| a == b)
        .count();
    let suffix = old[prefix..]
        .iter()
        .rev()
        .zip(new[prefix..].iter().rev())
        .take_while(|(a, b)| a == b)
        .count();

    let mid_old = &old[prefix..old.len() - suffix];
    let mid_new = &new[prefix..new.len() - suffix];

    let mut ops = Vec::with_capacity(old.len().max(new.len()));
    ops.extend((0..prefix).map(|k| Op::Keep(k, k)));
    ops.extend(
        lcs_walk(mid_old, mid_new)
            .into_iter()
            .map(|op| match op {
                Op::Keep(i, j) => Op::Keep(i + prefix, j + prefix),
                Op::Remove(i) => Op::Remove(i + prefix),
                Op::Add(j) => Op::Add(j + prefix),
            }),
    );
    let old_tail = old.len() - suffix;
    let new_tail = new.len() - suffix;
    ops.extend((0..suffix).map(|k| Op::Keep(old_tail + k, new_tail + k)));
    ops
}

/// LCS table plus traceback. `table[i][j]` holds the LCS length of
/// `a[i..]` and `b[j..]`, stored row-major in one allocation.
fn lcs_walk(a: &[&str], b: &[&str]) -> Vec<Op> {
    let (n, m) = (a.len(), b.len());
    let width = m + 1;
    let mut table = vec![0u32; (n + 1) * width];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            table[i * width + j] = if a[i] == b[j] {
                table[(i + 1) * width + j + 1] + 1
            } else {
                table[(i + 1) * width + j].max(table[i * width + j + 1])
            };
        }
    }

    let mut ops = Vec::with_capacity(n + m);
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if a[i] == b[j] {
            ops.push(Op::Keep(i, j));
            i += 1;
            j += 1;
        } else if table[(i + 1) * width + j] >= table[i * width + j + 1] {
            ops.push(Op::Remove(i));
            i += 1;
        } else {
            ops.push(Op::Add(j));
            j += 1;
        }
    }
    ops.extend((i..n).map(Op::Remove));
    ops.extend((j..m).map(Op::Add));
    ops
}

/// Accumulates panes; pending removed/added runs are laid side by side when
/// the next context line (or the end) arrives.
#[derive(Default)]
struct Layout {
    before: Vec<DiffLine>,
    after: Vec<DiffLine>,
    removed: Vec<usize>,
    added: Vec<usize>,
    before_no: usize,
    after_no: usize,
}

impl Layout {
    fn context(&mut self, old: &str, new: &str) {
        self.before_no += 1;
        self.after_no += 1;
        self.before.push(DiffLine {
            content: old.to_owned(),
            kind: LineKind::Context,
            line_number: Some(self.before_no),
        });
        self.after.push(DiffLine {
            content: new.to_owned(),
            kind: LineKind::Context,
            line_number: Some(self.after_no),
        });
    }

    fn flush(&mut self, old: &[&str], new: &[&str]) {
        let rows = self.removed.len().max(self.added.len());
        for k in 0..rows {
            match self.removed.get(k) {
                Some(&i) => {
                    self.before_no += 1;
                    self.before.push(DiffLine {
                        content: old[i].to_owned(),
                        kind: LineKind::Removed,
                        line_number: Some(self.before_no),
                    });
                }
                None => self.before.push(DiffLine::filler()),
            }
            match self.added.get(k) {
                Some(&j) => {
                    self.after_no += 1;
                    self.after.push(DiffLine {
                        content: new[j].to_owned(),
                        kind: LineKind::Added,
                        line_number: Some(self.after_no),
                    });
                }
                None => self.after.push(DiffLine::filler()),
            }
        }
        self.removed.clear();
        self.added.clear();
    }
}
