//! The task-graph scheduler (`spec.md` §4.4, §5).
//!
//! A bounded worker pool of `tokio` tasks pulls ready node indices from a
//! queue guarded by a `tokio::sync::Mutex` + `tokio::sync::Notify` pair —
//! the async analogue of a mutex/condvar — per the spec's own Design Notes
//! §9 ("a bounded worker pool with a ready-queue protected by a
//! mutex/condition pair"); `hurry::fs::DEFAULT_CONCURRENCY` (10) is reused
//! as this crate's default pool size, matching the spec's literal default.
//! All bookkeeping (state transitions, dependency-countdown, cascading
//! skips) happens synchronously while the queue's lock is held, so no
//! `.await` ever occurs inside a critical section.
//!
//! Cancellation is a single `tokio::sync::watch::Sender<bool>` (`spec.md`
//! §5): set on the first bail-mode failure or on an external shutdown
//! request, observed both by this module (to stop dispatching and skip
//! everything still pending) and by `process::run`'s `tokio::select!` (to
//! terminate in-flight subprocesses).

use std::{collections::VecDeque, sync::Arc};

use tokio::{
    sync::{Mutex, Notify, watch},
    task::JoinSet,
};
use tracing::{instrument, trace};

use crate::{fs::DEFAULT_CONCURRENCY, graph::TaskGraph};

/// The terminal state of a task node (`spec.md` §4.4: `pending -> ready ->
/// running -> {cached, succeeded, failed, skipped}`).
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum NodeState {
    Pending,
    Ready,
    Running,
    Cached,
    Succeeded,
    Failed,
    Skipped,
}

impl NodeState {
    /// `cached` and `succeeded` count as success for downstream readiness
    /// (`spec.md` §4.4).
    fn is_success(self) -> bool {
        matches!(self, Self::Cached | Self::Succeeded)
    }
}

/// What the caller-supplied executor reports back for a node it ran.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum NodeOutcome {
    Cached,
    Succeeded,
    Failed,
}

impl From<NodeOutcome> for NodeState {
    fn from(outcome: NodeOutcome) -> Self {
        match outcome {
            NodeOutcome::Cached => Self::Cached,
            NodeOutcome::Succeeded => Self::Succeeded,
            NodeOutcome::Failed => Self::Failed,
        }
    }
}

/// Final per-node states after [`Scheduler::run`] returns.
pub struct RunReport {
    pub states: Vec<NodeState>,
}

impl RunReport {
    /// The highest observed non-zero-equivalent outcome, per `spec.md` §6's
    /// exit-code rule: any `Failed` node means a non-success exit.
    pub fn any_failed(&self) -> bool {
        self.states.iter().any(|s| matches!(s, NodeState::Failed))
    }
}

struct Inner {
    states: Vec<NodeState>,
    remaining_deps: Vec<usize>,
    deps_failed: Vec<bool>,
    ready: VecDeque<usize>,
    finished: usize,
    cancelled: bool,
}

struct Shared {
    inner: Mutex<Inner>,
    notify: Notify,
    dependents: Vec<Vec<usize>>,
    total: usize,
}

impl Shared {
    /// Apply a node's completion and cascade: decrement each dependent's
    /// outstanding-predecessor count; a dependent that reaches zero becomes
    /// `Ready` if every predecessor succeeded, or is itself completed as
    /// `Skipped` otherwise (or unconditionally, once cancelled) — which may
    /// cascade further. Entirely synchronous; called with the lock held.
    fn complete(inner: &mut Inner, dependents: &[Vec<usize>], idx: usize, state: NodeState) {
        let mut worklist = VecDeque::from([(idx, state)]);
        while let Some((idx, state)) = worklist.pop_front() {
            inner.states[idx] = state;
            inner.finished += 1;
            for &dep in &dependents[idx] {
                inner.remaining_deps[dep] -= 1;
                if !state.is_success() {
                    inner.deps_failed[dep] = true;
                }
                if inner.remaining_deps[dep] == 0 {
                    if inner.cancelled || inner.deps_failed[dep] {
                        worklist.push_back((dep, NodeState::Skipped));
                    } else {
                        inner.states[dep] = NodeState::Ready;
                        inner.ready.push_back(dep);
                    }
                }
            }
        }
    }
}

/// Drives a [`TaskGraph`] to completion with bounded concurrency.
pub struct Scheduler {
    concurrency: usize,
    continue_on_error: bool,
}

impl Scheduler {
    /// `concurrency` of `0` is treated as the default; `1` forces serial
    /// execution (`spec.md` §5).
    pub fn new(concurrency: usize, continue_on_error: bool) -> Self {
        Self {
            concurrency: if concurrency == 0 { DEFAULT_CONCURRENCY } else { concurrency },
            continue_on_error,
        }
    }

    /// Run every node in `graph` to completion, invoking `execute(idx,
    /// cancel_rx)` for each node that becomes ready. `cancel_tx` is shared
    /// with the caller so an external shutdown signal can also flip it.
    #[instrument(skip_all)]
    pub async fn run<Exec, Fut>(
        &self,
        graph: &TaskGraph,
        cancel_tx: watch::Sender<bool>,
        execute: Exec,
    ) -> RunReport
    where
        Exec: Fn(usize, watch::Receiver<bool>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = NodeOutcome> + Send + 'static,
    {
        let total = graph.len();
        if total == 0 {
            return RunReport { states: Vec::new() };
        }

        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); total];
        let mut remaining_deps = vec![0usize; total];
        for idx in 0..total {
            let deps = graph.dependencies(idx);
            remaining_deps[idx] = deps.len();
            for &dep in deps {
                dependents[dep].push(idx);
            }
        }

        let mut states = vec![NodeState::Pending; total];
        let mut ready = VecDeque::new();
        for idx in 0..total {
            if remaining_deps[idx] == 0 {
                states[idx] = NodeState::Ready;
                ready.push_back(idx);
            }
        }

        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                states,
                remaining_deps,
                deps_failed: vec![false; total],
                ready,
                finished: 0,
                cancelled: false,
            }),
            notify: Notify::new(),
            dependents,
            total,
        });
        shared.notify.notify_waiters();

        let execute = Arc::new(execute);
        let workers = self.concurrency.min(total).max(1);
        let mut pool = JoinSet::new();
        for _ in 0..workers {
            let shared = shared.clone();
            let execute = execute.clone();
            let cancel_tx = cancel_tx.clone();
            let bail_on_error = !self.continue_on_error;
            pool.spawn(worker_loop(shared, execute, cancel_tx, bail_on_error));
        }
        while pool.join_next().await.is_some() {}

        let inner = shared.inner.lock().await;
        RunReport {
            states: inner.states.clone(),
        }
    }
}

async fn worker_loop<Exec, Fut>(
    shared: Arc<Shared>,
    execute: Arc<Exec>,
    cancel_tx: watch::Sender<bool>,
    bail_on_error: bool,
) where
    Exec: Fn(usize, watch::Receiver<bool>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = NodeOutcome> + Send + 'static,
{
    loop {
        let notified = shared.notify.notified();
        let idx = {
            let mut inner = shared.inner.lock().await;
            if inner.cancelled {
                mark_remaining_skipped(&mut inner, &shared.dependents);
            }
            if let Some(idx) = inner.ready.pop_front() {
                inner.states[idx] = NodeState::Running;
                Some(idx)
            } else if inner.finished >= shared.total {
                None
            } else {
                drop(inner);
                notified.await;
                continue;
            }
        };

        let Some(idx) = idx else { return };

        trace!(idx, "scheduler dispatching node");
        let outcome = execute(idx, cancel_tx.subscribe()).await;
        let state: NodeState = outcome.into();

        let mut inner = shared.inner.lock().await;
        if matches!(outcome, NodeOutcome::Failed) && bail_on_error && !inner.cancelled {
            inner.cancelled = true;
            let _ = cancel_tx.send(true);
        }
        Shared::complete(&mut inner, &shared.dependents, idx, state);
        if inner.cancelled {
            mark_remaining_skipped(&mut inner, &shared.dependents);
        }
        drop(inner);
        shared.notify.notify_waiters();
    }
}

/// Once cancelled, every node still `Pending`/`Ready` (not yet dispatched)
/// completes as `Skipped` rather than waiting for its turn in the pool.
fn mark_remaining_skipped(inner: &mut Inner, dependents: &[Vec<usize>]) {
    let to_skip: Vec<usize> = inner
        .ready
        .drain(..)
        .chain(
            inner
                .states
                .iter()
                .enumerate()
                .filter(|(_, s)| matches!(s, NodeState::Pending))
                .map(|(i, _)| i),
        )
        .collect();
    for idx in to_skip {
        if matches!(inner.states[idx], NodeState::Skipped) {
            continue;
        }
        Shared::complete(inner, dependents, idx, NodeState::Skipped);
    }
}
