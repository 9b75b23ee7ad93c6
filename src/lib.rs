//! The incremental monorepo task runner: task-graph scheduling, the
//! fingerprint/hashing pipeline, and the content-addressed cache protocol.
//!
//! Module layout mirrors the component breakdown of the system design:
//! [`filehash`] and [`fingerprint`] compute what changed, [`cache`] stores
//! and restores task outputs by fingerprint, [`graph`] and [`scheduler`]
//! decide what runs and in what order, [`process`] and [`coordinator`]
//! actually run a task, and [`config`]/[`task`]/[`package`] describe the
//! repo the runner operates over.

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod filehash;
pub mod fingerprint;
pub mod fs;
pub mod graph;
pub mod hash;
pub mod package;
pub mod path;
pub mod process;
pub mod progress;
pub mod scheduler;
pub mod task;
pub mod trace;
