//! Subprocess execution for task commands (`spec.md` §4.5, §5).
//!
//! Spawning follows `hurry::cargo`'s pattern of async `tokio::process`
//! invocation (`Stdio::piped()`, `.context("could not spawn ...")`); output
//! is drained concurrently from stdout and stderr into a single
//! arrival-ordered byte buffer (the per-task log, per `spec.md` §6's "one
//! `.turbo/turbo-<task>.log` entry"), tee'd line-by-line to a caller-supplied
//! sink so the operator sees output live. Cancellation is delivered by
//! racing the child's exit against a `tokio::sync::watch` flag with
//! `tokio::select!` (`spec.md` §5): the watching task kills the child
//! directly, rather than routing through the registry, so a cancellation
//! in flight is never blocked behind the registry's mutex.
//!
//! [`ProcessRegistry`] separately tracks which task keys currently have a
//! live subprocess, guarded by a mutex whose only synchronized operations
//! are registration and deregistration (`spec.md` §5) — used to report
//! which tasks were still running when a forced shutdown deadline expired.

use std::{collections::BTreeSet, process::Stdio, sync::Mutex};

use color_eyre::{Result, eyre::Context};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
    sync::watch,
};
use tracing::{instrument, trace, warn};

use crate::{graph::TaskKey, path::AbsDirPath};

/// Tracks which task keys currently own a live subprocess.
#[derive(Default)]
pub struct ProcessRegistry {
    live: Mutex<BTreeSet<TaskKey>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, key: &TaskKey) {
        self.live.lock().expect("process registry mutex poisoned").insert(key.clone());
    }

    fn deregister(&self, key: &TaskKey) {
        self.live.lock().expect("process registry mutex poisoned").remove(key);
    }

    /// Task keys with a subprocess still registered as live.
    pub fn snapshot(&self) -> Vec<TaskKey> {
        self.live
            .lock()
            .expect("process registry mutex poisoned")
            .iter()
            .cloned()
            .collect()
    }
}

/// The outcome of running a task's command to completion (or cancellation).
pub struct Outcome {
    pub status: std::process::ExitStatus,
    /// Combined stdout+stderr bytes, in arrival order, newline-terminated
    /// per line (the per-task log persisted/cached by the coordinator).
    pub log: Vec<u8>,
    pub cancelled: bool,
}

/// Run `command` in `cwd` with the given extra environment variables,
/// streaming each output line to `on_line` as it arrives, until the child
/// exits or `cancel` reports a shutdown request.
#[instrument(skip(registry, env, on_line, cancel))]
pub async fn run(
    registry: &ProcessRegistry,
    key: &TaskKey,
    cwd: &AbsDirPath,
    command: &str,
    env: impl IntoIterator<Item = (String, String)>,
    mut on_line: impl FnMut(&[u8]) + Send,
    cancel: &mut watch::Receiver<bool>,
) -> Result<Outcome> {
    let (shell, shell_flag) = shell_invocation();
    let mut cmd = Command::new(shell);
    cmd.arg(shell_flag);
    cmd.arg(command);
    cmd.current_dir(cwd.as_std_path());
    cmd.envs(env);
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    trace!(%key, command, "spawn task command");
    let mut child = cmd.spawn().context("could not spawn task command")?;
    let stdout = child.stdout.take().expect("stdout was piped");
    let stderr = child.stderr.take().expect("stderr was piped");

    registry.register(key);

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Vec<u8>>();
    let stdout_reader = tokio::spawn(stream_lines(stdout, tx.clone()));
    let stderr_reader = tokio::spawn(stream_lines(stderr, tx));

    let mut log = Vec::new();
    let mut cancelled = false;
    let status = loop {
        tokio::select! {
            biased;
            line = rx.recv() => {
                let Some(line) = line else {
                    // Both readers have dropped their sender; wait for exit.
                    break child.wait().await.context("wait for task command")?;
                };
                on_line(&line);
                log.extend_from_slice(&line);
            }
            status = child.wait() => {
                break status.context("wait for task command")?;
            }
            Ok(()) = cancel.changed() => {
                if *cancel.borrow() {
                    warn!(%key, "cancellation requested; terminating subprocess");
                    cancelled = true;
                    let _ = child.start_kill();
                    break child.wait().await.context("wait for task command after cancellation")?;
                }
            }
        }
    };

    // Drain any remaining buffered lines the readers already queued.
    while let Ok(line) = rx.try_recv() {
        on_line(&line);
        log.extend_from_slice(&line);
    }
    let _ = stdout_reader.await;
    let _ = stderr_reader.await;

    registry.deregister(key);

    Ok(Outcome {
        status,
        log,
        cancelled,
    })
}

async fn stream_lines(
    reader: impl tokio::io::AsyncRead + Unpin,
    tx: tokio::sync::mpsc::UnboundedSender<Vec<u8>>,
) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let mut bytes = line.into_bytes();
                bytes.push(b'\n');
                if tx.send(bytes).is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(err) => {
                warn!(error = ?err, "failed to read subprocess output");
                return;
            }
        }
    }
}

#[cfg(not(target_os = "windows"))]
fn shell_invocation() -> (&'static str, &'static str) {
    ("/bin/sh", "-c")
}

#[cfg(target_os = "windows")]
fn shell_invocation() -> (&'static str, &'static str) {
    ("cmd", "/C")
}
