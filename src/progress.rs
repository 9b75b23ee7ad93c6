//! Run summary and log-line prefixing (`spec.md` §6, §8 scenarios S1/S2).
//!
//! Grounded in `hurry::progress`'s non-interactive logging posture (plain
//! `println!` lines, colorized via `colored`) rather than its
//! `indicatif`-backed progress bar, since this crate has no equivalent
//! dependency and the spec's only required surface is a one-line summary
//! plus per-task log prefixing.

use std::fmt;

use colored::Colorize as _;

use crate::graph::TaskKey;

/// Running tallies of task outcomes, reported as the final summary line
/// (`spec.md` §6: `"N successful, M total; H cached, M total"`).
#[derive(Default, Debug, Clone, Copy)]
pub struct Tally {
    pub succeeded: usize,
    pub cached: usize,
    pub failed: usize,
    pub skipped: usize,
    /// The highest non-zero child exit code observed among failed tasks,
    /// used to compute the run's final process exit code (`spec.md` §6:
    /// "the highest child non-zero code on task failure in continue
    /// mode"). `None` until a failure with a known exit code is recorded.
    pub worst_exit_code: Option<i32>,
}

impl Tally {
    pub fn total(&self) -> usize {
        self.succeeded + self.cached + self.failed + self.skipped
    }

    pub fn record_succeeded(&mut self) {
        self.succeeded += 1;
    }

    pub fn record_cached(&mut self) {
        // A cache hit counts as both a success and a cache hit.
        self.succeeded += 1;
        self.cached += 1;
    }

    /// `exit_code` is the subprocess's exit code, or `None` for an internal
    /// (non-subprocess) failure.
    pub fn record_failed(&mut self, exit_code: Option<i32>) {
        self.failed += 1;
        if let Some(code) = exit_code {
            self.worst_exit_code = Some(self.worst_exit_code.map_or(code, |w| w.max(code)));
        }
    }

    pub fn record_skipped(&mut self) {
        self.skipped += 1;
    }
}

impl fmt::Display for Tally {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} successful, {} total; {} cached, {} total",
            self.succeeded,
            self.total(),
            self.cached,
            self.total()
        )
    }
}

/// Prefix a captured log's lines with `package#task >`, coloring the
/// prefix so interleaved concurrent output stays readable.
pub fn prefix_lines(key: &TaskKey, text: &str) -> String {
    let prefix = format!("{key} >").cyan();
    text.lines()
        .map(|line| format!("{prefix} {line}"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::PackageName;

    #[test]
    fn summary_line_matches_spec_format() {
        let mut tally = Tally::default();
        tally.record_succeeded();
        tally.record_cached();
        assert_eq!(tally.to_string(), "2 successful, 2 total; 1 cached, 2 total");
    }

    #[test]
    fn cached_counts_as_success() {
        let mut tally = Tally::default();
        tally.record_cached();
        assert_eq!(tally.succeeded, 1);
        assert_eq!(tally.cached, 1);
        assert_eq!(tally.total(), 1);
    }

    #[test]
    fn prefix_lines_labels_every_line() {
        let key = TaskKey::new(PackageName::new("app"), "build");
        let prefixed = prefix_lines(&key, "line one\nline two");
        assert_eq!(prefixed.lines().count(), 2);
        assert!(prefixed.lines().all(|l| l.contains("app#build >")));
    }
}
