//! The `RampingExecutor`: population control by periodic reconciliation.
//!
//! A single coordinating loop wakes up every `tick`, reads the target from the
//! [`RampingSchedule`] and compares it with the sessions it owns:
//!
//! - fewer active sessions than the floored target: spawn the difference;
//! - more: ask the oldest excess sessions to leave. They stay tracked as
//!   *retiring* until their task ends, so ramp-down still emits `leave` before
//!   every close.
//!
//! The loop never awaits session I/O. Sessions are spawned tasks in a
//! [`JoinSet`](tokio::task::JoinSet); finished ones are reaped without blocking at the top of each tick.
//! A session that ends on its own (lifetime, transport error) frees its VU slot and
//! is replaced on the next tick, so VUs keep iterating as long as the stage wants
//! them.
//!
//! # Tuning knobs
//! - `tick`: convergence latency. 100ms by default.
//! - `tolerance`: sessions still alive above `ceil(target)` one tick after that
//!   target was reconciled, before the tick counts in `scheduler_deviations`.
//!   Deviations are logged, never fatal.
//! - `graceful_ramp_down`: retiring sessions still running after this are aborted.
//! - `graceful_stop`: the same, for everything left when the schedule ends.

use std::{
    cmp::Reverse,
    collections::{BTreeMap, BinaryHeap},
    sync::Arc,
};

use futures::FutureExt;
use tokio::time::{Instant, sleep_until};
use typed_builder::TypedBuilder;

use super::{
    ExecutionOptions, ExecutionSummary, Executor, Progress, ProgressFn, RampingSchedule, drain,
};
use crate::{
    error::Error,
    metric::{Event, names},
    session::SessionFactory,
    transport::Transport,
};
use internals::*;

/// Executor that keeps the live population on a ramping schedule.
///
/// ```rust,no_run
/// use std::time::Duration;
/// use chatstorm::executor::{RampingExecutor, RampingSchedule, Stage};
///
/// let executor = RampingExecutor::builder()
///     .schedule(RampingSchedule::new(0, vec![
///         Stage::new(Duration::from_secs(10), 1000),
///         Stage::new(Duration::from_secs(5), 1000),
///         Stage::new(Duration::from_secs(5), 0),
///     ]))
///     .build();
/// ```
#[derive(Debug, TypedBuilder)]
pub struct RampingExecutor {
    pub schedule: RampingSchedule,
    #[builder(default)]
    pub options: ExecutionOptions,
    #[builder(default, setter(strip_option))]
    pub progress: Option<ProgressFn>,
}

impl Executor for RampingExecutor {
    type Error = Error;

    async fn exec<T: Transport>(
        &self,
        sessions: Arc<SessionFactory<T>>,
    ) -> Result<ExecutionSummary, Self::Error> {
        let opts = &self.options;
        if opts.tick.is_zero() {
            return Err(Error::Scheduler("tick must be greater than zero".into()));
        }
        let metrics = sessions.metrics().clone();
        let total = self.schedule.total_duration();
        let stages = self.schedule.stages().len();
        let mut population = Population::new(sessions);
        let mut summary = ExecutionSummary::default();
        let mut stage = None;
        let mut settled: Option<f64> = None;

        tracing::info!(
            "Ramping {stages} stages over {total:?}, peak target {}",
            self.schedule.max_target()
        );
        let start = Instant::now();
        let mut next_tick = start;
        loop {
            population.reap();
            let elapsed = start.elapsed();
            if elapsed >= total {
                break;
            }

            let current = self.schedule.stage_at(elapsed);
            if current != stage {
                if let Some(i) = current {
                    tracing::info!("Starting stage: {}/{stages}", i + 1);
                }
                stage = current;
            }

            let target = self.schedule.target_at(elapsed);
            // what the last reconcile asked for must have converged by now
            let lingering = population.active() + population.retiring();
            let converged_to = settled.replace(target);
            let ceiling = converged_to.map(|t| t.ceil() + opts.tolerance as f64);
            if ceiling.is_some_and(|c| lingering as f64 > c) {
                summary.deviations += 1;
                tracing::warn!(
                    "Population {lingering} exceeds target {:.1} by more than {}",
                    converged_to.unwrap_or(target),
                    opts.tolerance
                );
                metrics.record(Event::counter(names::SCHEDULER_DEVIATIONS, 1));
            }
            population.reconcile(target);
            summary.interrupted += population.abort_overdue(opts.graceful_ramp_down);

            let progress = Progress {
                elapsed,
                target,
                active: population.active(),
                retiring: population.retiring(),
            };
            let live = progress.live();
            summary.peak = summary.peak.max(live);
            metrics.record(Event::trend(names::VUS, live as f64));
            if let Some(progress_fn) = &self.progress {
                progress_fn.call(progress);
            }

            next_tick += opts.tick;
            sleep_until(next_tick).await;
        }

        tracing::info!(
            "Schedule finished, stopping {} remaining sessions",
            population.active() + population.retiring()
        );
        summary.sessions = population.spawned();
        summary.interrupted += population.shutdown(opts.graceful_stop).await;
        summary.elapsed = start.elapsed();
        tracing::info!("Ramping run done after {:?}", summary.elapsed);
        Ok(summary)
    }
}

#[cfg(feature = "internals")]
pub use internals::*;

/// Population bookkeeping for the `RampingExecutor`.
/// Encapsulated in a module to allow conditional exposure via `#[cfg(feature = "internals")]`.
mod internals {
    use super::*;
    use std::panic::AssertUnwindSafe;
    use tokio::{
        sync::watch::{self, Sender},
        task::{AbortHandle, JoinSet},
    };

    use crate::{executor::schedule::whole, session::SessionOutcome};

    /// A spawned session as seen by the executor.
    pub struct Slot {
        pub vu: u64,
        pub stop: Sender<bool>,
        pub abort: AbortHandle,
        pub retiring_since: Option<Instant>,
    }

    /// VU numbers in use are unique; freed numbers are reused lowest first.
    #[derive(Default)]
    pub struct VuPool {
        next: u64,
        free: BinaryHeap<Reverse<u64>>,
    }

    impl VuPool {
        pub fn acquire(&mut self) -> u64 {
            match self.free.pop() {
                Some(Reverse(vu)) => vu,
                None => {
                    self.next += 1;
                    self.next
                }
            }
        }

        pub fn release(&mut self, vu: u64) {
            self.free.push(Reverse(vu));
        }
    }

    /// Every session the executor owns, keyed by session id (spawn order).
    pub struct Population<T: Transport> {
        sessions: Arc<SessionFactory<T>>,
        tasks: JoinSet<(u64, Option<SessionOutcome>)>,
        active: BTreeMap<u64, Slot>,
        retiring: BTreeMap<u64, Slot>,
        vus: VuPool,
        spawned: u64,
    }

    impl<T: Transport> Population<T> {
        pub fn new(sessions: Arc<SessionFactory<T>>) -> Self {
            Self {
                sessions,
                tasks: JoinSet::new(),
                active: BTreeMap::new(),
                retiring: BTreeMap::new(),
                vus: VuPool::default(),
                spawned: 0,
            }
        }

        pub fn active(&self) -> usize {
            self.active.len()
        }

        pub fn retiring(&self) -> usize {
            self.retiring.len()
        }

        pub fn spawned(&self) -> u64 {
            self.spawned
        }

        /// Spawn or retire sessions so `active` matches the floored target.
        pub fn reconcile(&mut self, target: f64) {
            let want = whole(target);
            while self.active.len() < want {
                self.spawn();
            }
            while self.active.len() > want {
                self.retire_oldest();
            }
        }

        pub fn spawn(&mut self) {
            let vu = self.vus.acquire();
            let session = self.sessions.session(vu);
            let id = session.id();
            let (stop, rx) = watch::channel(false);
            let abort = self.tasks.spawn(async move {
                match AssertUnwindSafe(session.run(rx)).catch_unwind().await {
                    Ok(outcome) => (id, Some(outcome)),
                    Err(_) => (id, None),
                }
            });
            self.active.insert(
                id,
                Slot {
                    vu,
                    stop,
                    abort,
                    retiring_since: None,
                },
            );
            self.spawned += 1;
        }

        pub fn retire_oldest(&mut self) {
            if let Some((id, mut slot)) = self.active.pop_first() {
                tracing::debug!("Retiring session {id}");
                // the session may already be gone, reaped on the next tick
                let _ = slot.stop.send(true);
                slot.retiring_since = Some(Instant::now());
                self.retiring.insert(id, slot);
            }
        }

        /// Collect finished sessions without waiting.
        pub fn reap(&mut self) {
            while let Some(Some(joined)) = self.tasks.join_next().now_or_never() {
                let id = match joined {
                    Ok((id, Some(_))) => id,
                    Ok((id, None)) => {
                        tracing::error!("Session {id} panicked");
                        id
                    }
                    // aborted tasks were already removed
                    Err(_) => continue,
                };
                if let Some(slot) = self.active.remove(&id).or_else(|| self.retiring.remove(&id)) {
                    self.vus.release(slot.vu);
                }
            }
        }

        /// Abort retiring sessions that exceeded `grace`. Returns how many.
        pub fn abort_overdue(&mut self, grace: std::time::Duration) -> u64 {
            let now = Instant::now();
            let overdue: Vec<u64> = self
                .retiring
                .iter()
                .filter(|(_, s)| s.retiring_since.is_some_and(|t| now.duration_since(t) >= grace))
                .map(|(id, _)| *id)
                .collect();
            for id in &overdue {
                if let Some(slot) = self.retiring.remove(id) {
                    tracing::warn!("Session {id} did not leave within {grace:?}, aborting");
                    slot.abort.abort();
                    self.vus.release(slot.vu);
                }
            }
            if !overdue.is_empty() {
                self.sessions.metrics().record(Event::counter(
                    names::WS_SESSIONS_INTERRUPTED,
                    overdue.len() as u64,
                ));
            }
            overdue.len() as u64
        }

        /// Ask every session to leave and wait for them up to `grace`.
        pub async fn shutdown(&mut self, grace: std::time::Duration) -> u64 {
            while !self.active.is_empty() {
                self.retire_oldest();
            }
            let interrupted = drain(&mut self.tasks, grace, self.sessions.metrics()).await;
            for (_, slot) in std::mem::take(&mut self.retiring) {
                self.vus.release(slot.vu);
            }
            interrupted
        }
    }
}
