//! The run coordinator: the per-task driver (`spec.md` §4.5).
//!
//! Step 1 ("resolve definition") already happened when the task graph was
//! built (`graph::TaskGraph::build` elides nodes with no definition), so
//! [`run_task`] starts at step 2. It is the function a [`scheduler::Scheduler`]
//! invokes for each ready node; its return value is exactly the
//! [`NodeOutcome`] the scheduler's bookkeeping expects.
//!
//! Grounded in `hurry`'s "subprocess invocation + cache probe" shape for
//! `cargo build` (`hurry::cargo`, `hurry::cache`): compute a cache key,
//! probe before running, execute on miss, populate the cache on success.

use std::{collections::BTreeMap, collections::HashMap, sync::Arc, time::Instant};

use color_eyre::{Result, eyre::Context};
use tokio::sync::{Mutex, Notify, watch};
use tracing::{error, instrument};
use wax::Glob;

use crate::{
    cache::Cache,
    error::MonorailError,
    filehash::AnchoredPath,
    fingerprint::{Fingerprint, TaskFingerprintInputs, task_fingerprint},
    fs,
    graph::TaskKey,
    path::{AbsDirPath, TryJoinWith as _},
    process::{self, ProcessRegistry},
    progress::{self, Tally},
    scheduler::NodeOutcome,
    task::{OutputLogsMode, TaskDefinition},
    trace::{Profile, TraceOutcome},
};

/// Ensures at most one producer runs per fingerprint at a time (`spec.md`
/// §4.3): `cache::LocalCache::write`'s write-once guarantee only stops a
/// second on-disk write from clobbering an entry, it doesn't stop two
/// concurrent invocations from both running the underlying command for the
/// same cache key. Mirrors the scheduler's own mutex/notify pairing
/// (`scheduler.rs`) rather than introducing a different primitive.
#[derive(Default)]
pub struct InFlightRegistry {
    inner: Mutex<HashMap<Fingerprint, Arc<Notify>>>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to become the sole producer for `fingerprint`. Returns `true` if
    /// this caller now owns it — it must call [`release`](Self::release)
    /// when done. Returns `false` once another caller that held it has
    /// released; the caller should re-check the cache before retrying.
    async fn acquire_or_wait(&self, fingerprint: &Fingerprint) -> bool {
        let notify = {
            let mut inner = self.inner.lock().await;
            match inner.get(fingerprint) {
                Some(existing) => Some(existing.clone()),
                None => {
                    inner.insert(fingerprint.clone(), Arc::new(Notify::new()));
                    None
                }
            }
        };
        match notify {
            None => true,
            Some(notify) => {
                notify.notified().await;
                false
            }
        }
    }

    async fn release(&self, fingerprint: &Fingerprint) {
        if let Some(notify) = self.inner.lock().await.remove(fingerprint) {
            notify.notify_waiters();
        }
    }
}

/// `outputs` defaults applied when a task declares none (`spec.md` §8:
/// "absent applies inferred defaults").
fn effective_outputs(definition: &TaskDefinition) -> Vec<String> {
    definition
        .outputs
        .clone()
        .unwrap_or_else(|| vec!["dist/**".to_owned(), "build/**".to_owned()])
}

/// Everything the coordinator needs to drive one ready node, resolved by
/// the caller before scheduling: package directory, package fingerprint,
/// and pass-through args already filtered to this task.
pub struct TaskInputs<'a> {
    pub key: &'a TaskKey,
    pub definition: &'a TaskDefinition,
    pub extra_env: &'a [String],
    pub package_root: &'a AbsDirPath,
    pub package_fingerprint: &'a Fingerprint,
    pub pass_through_args: &'a [String],
    pub package_manager_binary: &'a str,
    pub force: bool,
    /// Wall-clock reference the trace profile's timestamps are relative to.
    pub run_start: Instant,
}

/// Shared, read-only collaborators every task driver invocation uses.
#[derive(Clone, Copy)]
pub struct TaskServices<'a> {
    pub cache: &'a Cache,
    pub registry: &'a ProcessRegistry,
    pub profile: &'a Profile,
    pub tally: &'a Mutex<Tally>,
    pub in_flight: &'a InFlightRegistry,
}

/// Run one ready task node to completion (`spec.md` §4.5 steps 2-8).
/// Never returns an `Err`: any internal failure (cache I/O, glob
/// resolution, subprocess spawn) is logged as a [`MonorailError`] and
/// reported to the scheduler as [`NodeOutcome::Failed`], consistent with
/// `spec.md` §7 ("hashing/cache errors are fatal for the affected task").
#[instrument(skip_all, fields(task = %inputs.key))]
pub async fn run_task(
    inputs: TaskInputs<'_>,
    services: TaskServices<'_>,
    cancel: watch::Receiver<bool>,
) -> NodeOutcome {
    match run_task_inner(&inputs, &services, cancel).await {
        Ok(outcome) => outcome,
        Err(err) => {
            error!(%err, "task driver failed");
            services.tally.lock().await.record_failed(None);
            NodeOutcome::Failed
        }
    }
}

async fn run_task_inner(
    inputs: &TaskInputs<'_>,
    services: &TaskServices<'_>,
    mut cancel: watch::Receiver<bool>,
) -> Result<NodeOutcome> {
    let task_start = Instant::now();
    let outputs = effective_outputs(inputs.definition);
    let env_values: BTreeMap<String, Option<String>> = inputs
        .definition
        .env
        .iter()
        .chain(inputs.extra_env.iter())
        .map(|name| (name.clone(), std::env::var(name).ok()))
        .collect();

    let fingerprint = task_fingerprint(&TaskFingerprintInputs {
        package_fingerprint: inputs.package_fingerprint,
        task_name: &inputs.key.task,
        resolved_outputs: &outputs,
        pass_through_args: inputs.pass_through_args,
        env_values: &env_values,
    });

    let cacheable = inputs.definition.cache;
    let mode = inputs.definition.output_logs;

    if let Some(outcome) = try_fetch_cached(inputs, services, &fingerprint, mode, task_start).await? {
        return Ok(outcome);
    }

    if !cacheable {
        return execute_task(inputs, services, &mut cancel, task_start, &fingerprint, &outputs, cacheable, mode).await;
    }

    // At most one concurrent producer per fingerprint: if another caller is
    // already running this exact task, wait for it instead of duplicating
    // the work, then see whether it left a cache entry we can reuse.
    loop {
        if services.in_flight.acquire_or_wait(&fingerprint).await {
            let result = execute_task(inputs, services, &mut cancel, task_start, &fingerprint, &outputs, cacheable, mode).await;
            services.in_flight.release(&fingerprint).await;
            return result;
        }
        if let Some(outcome) = try_fetch_cached(inputs, services, &fingerprint, mode, task_start).await? {
            return Ok(outcome);
        }
        // The previous producer didn't leave a usable cache entry (e.g. it
        // failed, or `--force` is set); loop around to become the producer.
    }
}

/// Consult the cache for `fingerprint`, replaying the cached log and
/// recording the hit if found. Returns `None` on a miss or when `--force`
/// bypasses the cache, so the caller knows it must (re)produce the result.
async fn try_fetch_cached(
    inputs: &TaskInputs<'_>,
    services: &TaskServices<'_>,
    fingerprint: &Fingerprint,
    mode: OutputLogsMode,
    task_start: Instant,
) -> Result<Option<NodeOutcome>> {
    if inputs.force || !inputs.definition.cache {
        return Ok(None);
    }
    let hit = services
        .cache
        .fetch(inputs.package_root, fingerprint)
        .await
        .map_err(MonorailError::cache)?;
    let Some(hit) = hit else {
        return Ok(None);
    };
    replay_cached_log(inputs.key, &hit, mode, fingerprint).await?;
    record_span(services, inputs, task_start, TraceOutcome::Cached);
    services.tally.lock().await.record_cached();
    Ok(Some(NodeOutcome::Cached))
}

/// Run the task's command and, on success, populate the cache. This is the
/// "producer" body: reached either directly (uncacheable tasks) or once a
/// caller has won the per-fingerprint [`InFlightRegistry`] claim.
async fn execute_task(
    inputs: &TaskInputs<'_>,
    services: &TaskServices<'_>,
    cancel: &mut watch::Receiver<bool>,
    task_start: Instant,
    fingerprint: &Fingerprint,
    outputs: &[String],
    cacheable: bool,
    mode: OutputLogsMode,
) -> Result<NodeOutcome> {
    let command = format!(
        "{} run {} -- {}",
        inputs.package_manager_binary,
        inputs.key.task,
        inputs.pass_through_args.join(" ")
    );
    let env = vec![("TURBO_HASH".to_owned(), fingerprint.as_str().to_owned())];

    if matches!(mode, OutputLogsMode::HashOnly) {
        println!("{}", progress::prefix_lines(inputs.key, &format!("cache key {fingerprint}")));
    }
    let stream_live = matches!(mode, OutputLogsMode::Full | OutputLogsMode::NewOnly);

    let outcome = process::run(
        services.registry,
        inputs.key,
        inputs.package_root,
        &command,
        env,
        |line| {
            if stream_live {
                print!("{}", progress::prefix_lines(inputs.key, &String::from_utf8_lossy(line)));
            }
        },
        cancel,
    )
    .await
    .map_err(MonorailError::execution)?;

    if outcome.cancelled {
        return Ok(NodeOutcome::Failed);
    }

    if !outcome.status.success() {
        if matches!(mode, OutputLogsMode::ErrorsOnly) {
            print!("{}", progress::prefix_lines(inputs.key, &String::from_utf8_lossy(&outcome.log)));
        }
        record_span(services, inputs, task_start, TraceOutcome::Failed);
        services.tally.lock().await.record_failed(outcome.status.code());
        return Ok(NodeOutcome::Failed);
    }

    if cacheable {
        let log_path = inputs
            .package_root
            .try_join_combined([".turbo"], format!("turbo-{}.log", inputs.key.task))
            .context("build per-task log path")?;
        fs::write(&log_path, &outcome.log).await.context("write per-task log")?;

        let resolved_files = resolve_output_globs(inputs.package_root, outputs)
            .await
            .map_err(MonorailError::hashing)?;
        services
            .cache
            .put(
                inputs.package_root,
                fingerprint,
                &inputs.key.task,
                task_start.elapsed().as_millis() as u64,
                &resolved_files,
                &outcome.log,
            )
            .await
            .map_err(MonorailError::cache)?;
    }

    record_span(services, inputs, task_start, TraceOutcome::Built);
    services.tally.lock().await.record_succeeded();
    Ok(NodeOutcome::Succeeded)
}

fn record_span(
    services: &TaskServices<'_>,
    inputs: &TaskInputs<'_>,
    task_start: Instant,
    outcome: TraceOutcome,
) {
    let start_us = task_start.duration_since(inputs.run_start).as_micros() as u64;
    let duration_us = task_start.elapsed().as_micros() as u64;
    services.profile.record(inputs.key, outcome, start_us, duration_us);
}

async fn replay_cached_log(
    key: &TaskKey,
    hit: &crate::cache::CacheHit,
    mode: OutputLogsMode,
    fingerprint: &Fingerprint,
) -> Result<()> {
    match mode {
        OutputLogsMode::Full => {
            let contents = fs::must_read_buffered_utf8(&hit.log_path)
                .await
                .context("replay cached log")?;
            println!("{}", progress::prefix_lines(key, &contents));
        }
        OutputLogsMode::HashOnly => {
            println!("{}", progress::prefix_lines(key, &format!("cache key {fingerprint}")));
        }
        OutputLogsMode::NewOnly | OutputLogsMode::ErrorsOnly | OutputLogsMode::None => {}
    }
    Ok(())
}

/// Resolve declared `outputs` globs against `package_root`, returning the
/// matched files as anchored paths (`spec.md` §4.5 step 7).
async fn resolve_output_globs(package_root: &AbsDirPath, globs: &[String]) -> Result<Vec<AnchoredPath>> {
    let compiled: Vec<Glob> = globs
        .iter()
        .map(|pattern| Glob::new(pattern).with_context(|| format!("invalid output glob {pattern:?}")))
        .collect::<Result<_>>()?;

    let mut matched = Vec::new();
    for glob in &compiled {
        for entry in glob.walk(package_root.as_std_path()) {
            let Ok(entry) = entry else { continue };
            if entry.file_type().is_file() {
                let relative = entry
                    .path()
                    .strip_prefix(package_root.as_std_path())
                    .context("output file escaped package root")?;
                matched.push(relative.to_string_lossy().replace('\\', "/"));
            }
        }
    }
    matched.sort();
    matched.dedup();
    Ok(matched)
}
