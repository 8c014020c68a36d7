//! Narrow unified-diff handling: the core never parses diff bodies, it only
//! extracts the set of touched paths for scope checks and produces the
//! textual reversal shown to the solver as the oracle patch. Actual patch
//! application always goes through the `patch` utility at strip level 1.

use std::collections::BTreeSet;

/// Extracts the repository-relative paths touched by a unified diff, from the
/// `--- a/...` and `+++ b/...` header lines. `/dev/null` entries (file
/// creation or deletion) are skipped.
pub fn touched_paths(diff: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut paths = Vec::new();
    for line in diff.lines() {
        let rest = if let Some(rest) = line.strip_prefix("--- ") {
            rest
        } else if let Some(rest) = line.strip_prefix("+++ ") {
            rest
        } else {
            continue;
        };
        // Header lines may carry a trailing tab plus timestamp.
        let token = rest.split('\t').next().unwrap_or(rest).trim();
        if token == "/dev/null" {
            continue;
        }
        let path = token
            .strip_prefix("a/")
            .or_else(|| token.strip_prefix("b/"))
            .unwrap_or(token);
        if path.is_empty() {
            continue;
        }
        if seen.insert(path.to_string()) {
            paths.push(path.to_string());
        }
    }
    paths
}

/// Reverses a unified diff textually: hunk ranges are swapped and added lines
/// become removals (and vice versa). Used only to render the oracle patch for
/// the solver; reverse application of the real diff uses `patch -R`.
pub fn reverse_unified_diff(diff: &str) -> String {
    let mut out: Vec<String> = Vec::new();
    for line in diff.lines() {
        if line.starts_with("--- ") || line.starts_with("+++ ") {
            out.push(line.to_string());
        } else if let Some(reversed) = reverse_hunk_header(line) {
            out.push(reversed);
        } else if let Some(rest) = line.strip_prefix('+') {
            out.push(format!("-{}", rest));
        } else if let Some(rest) = line.strip_prefix('-') {
            out.push(format!("+{}", rest));
        } else {
            out.push(line.to_string());
        }
    }
    let mut text = out.join("\n");
    if diff.ends_with('\n') {
        text.push('\n');
    }
    text
}

fn reverse_hunk_header(line: &str) -> Option<String> {
    let rest = line.strip_prefix("@@ -")?;
    let (ranges, suffix) = rest.split_once(" @@")?;
    let (old_range, new_range) = ranges.split_once(" +")?;
    Some(format!("@@ -{} +{} @@{}", new_range, old_range, suffix))
}
