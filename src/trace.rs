//! Optional trace-event profile emission (`spec.md` §4.5, §6): one
//! complete-event ("X") per task, in the standard Chrome trace-event JSON
//! array format, consumed by an external profiler collaborator.
//!
//! Serialization follows the same `serde`/`serde_json` convention already
//! used for the task-configuration file (`config.rs`) and the in-archive
//! cache metadata (`cache::archive`); this crate writes the array directly
//! rather than depending on a dedicated chrome-trace crate, since the
//! format needed is a handful of fixed fields.

use std::sync::Mutex;

use color_eyre::{Result, eyre::Context};
use serde::Serialize;

use crate::{fs, graph::TaskKey, path::AbsFilePath};

/// A single task's outcome, as recorded on the trace profile.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum TraceOutcome {
    Built,
    Cached,
    Failed,
}

impl TraceOutcome {
    fn as_str(self) -> &'static str {
        match self {
            Self::Built => "built",
            Self::Cached => "cached",
            Self::Failed => "failed",
        }
    }
}

#[derive(Serialize)]
struct TraceEvent {
    name: String,
    cat: &'static str,
    ph: &'static str,
    ts: u64,
    dur: u64,
    pid: u32,
    tid: u32,
}

/// Collects trace events for the duration of a run and writes them to a
/// single JSON array file on [`Profile::flush`].
#[derive(Default)]
pub struct Profile {
    events: Mutex<Vec<TraceEvent>>,
}

impl Profile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one task's span, in microseconds since the run started.
    pub fn record(&self, key: &TaskKey, outcome: TraceOutcome, start_us: u64, duration_us: u64) {
        let event = TraceEvent {
            name: key.to_string(),
            cat: outcome.as_str(),
            ph: "X",
            ts: start_us,
            dur: duration_us,
            pid: std::process::id(),
            tid: 0,
        };
        self.events.lock().expect("trace profile mutex poisoned").push(event);
    }

    /// Write the collected events to `path` as a JSON array.
    pub async fn flush(&self, path: &AbsFilePath) -> Result<()> {
        let events = self.events.lock().expect("trace profile mutex poisoned");
        let bytes = serde_json::to_vec_pretty(&*events).context("serialize trace profile")?;
        drop(events);
        fs::write(path, bytes).await.context("write trace profile")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::PackageName;

    #[tokio::test]
    async fn flush_writes_one_event_per_recorded_task() {
        let dir = tempfile::tempdir().unwrap();
        let path = AbsFilePath::try_from(dir.path().join("trace.json")).unwrap();

        let profile = Profile::new();
        profile.record(
            &TaskKey::new(PackageName::new("app"), "build"),
            TraceOutcome::Built,
            0,
            1000,
        );
        profile.record(
            &TaskKey::new(PackageName::new("util"), "build"),
            TraceOutcome::Cached,
            0,
            5,
        );
        profile.flush(&path).await.unwrap();

        let contents = fs::must_read_buffered_utf8(&path).await.unwrap();
        let parsed: Vec<serde_json::Value> = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0]["cat"], "built");
        assert_eq!(parsed[1]["cat"], "cached");
    }
}
