//! Executor: turns a workload shape into a live population of sessions.
//!
//! An [`Executor`] owns the run's session tasks. It decides when sessions start,
//! asks them to leave, and enforces the graceful stop period at the end of the run.
//! Two executors ship with chatstorm:
//!
//! - [`RampingExecutor`]: reconciles the live population against a piecewise-linear
//!   [`RampingSchedule`] once per tick, spawning and retiring sessions.
//! - [`ConstantExecutor`]: a fixed set of VU slots, each restarting a new lifecycle as
//!   soon as the previous one ends (churn).
pub mod constant;
pub mod ramping;
pub mod schedule;

pub use constant::ConstantExecutor;
pub use ramping::RampingExecutor;
pub use schedule::{RampingSchedule, Stage};

use std::{fmt, future::Future, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::{task::JoinSet, time::Instant};
use typed_builder::TypedBuilder;

use crate::{
    metric::{Event, names},
    session::SessionFactory,
    transport::Transport,
};

/// The runtime hook that executes a workload.
///
/// Executors are handed a [`SessionFactory`] and are free to create as many
/// sessions as their strategy requires. They return once every session they
/// started has finished or has been aborted.
pub trait Executor: Send + Sync {
    type Error;

    fn exec<T: Transport>(
        &self,
        sessions: Arc<SessionFactory<T>>,
    ) -> impl Future<Output = Result<ExecutionSummary, Self::Error>> + Send;
}

/// Knobs shared by both executors.
#[derive(Debug, Clone, PartialEq, TypedBuilder, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutionOptions {
    /// Reconciliation period. Population changes converge within one tick.
    #[builder(default = Duration::from_millis(100))]
    #[serde(with = "crate::config::duration")]
    pub tick: Duration,
    /// Sessions the live population may exceed the target by before a tick counts
    /// as a deviation.
    #[builder(default = 10)]
    pub tolerance: usize,
    /// How long sessions get to leave once the workload is over.
    #[builder(default = Duration::from_secs(5))]
    #[serde(with = "crate::config::duration")]
    pub graceful_stop: Duration,
    /// How long a session retired by a ramp-down gets to leave.
    #[builder(default = Duration::from_secs(5))]
    #[serde(with = "crate::config::duration")]
    pub graceful_ramp_down: Duration,
    /// Pause before a constant VU restarts after a failed lifecycle.
    #[builder(default = Duration::from_millis(100))]
    #[serde(with = "crate::config::duration")]
    pub error_backoff: Duration,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Population observed by an executor on one tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub elapsed: Duration,
    /// Exact target of the schedule at `elapsed`.
    pub target: f64,
    /// Sessions running and not asked to leave.
    pub active: usize,
    /// Sessions asked to leave that have not finished yet.
    pub retiring: usize,
}

impl Progress {
    pub fn live(&self) -> usize {
        self.active + self.retiring
    }
}

/// Callback invoked once per executor tick.
#[derive(Clone)]
pub struct ProgressFn(Arc<dyn Fn(Progress) + Send + Sync>);

impl ProgressFn {
    pub fn new(f: impl Fn(Progress) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub(crate) fn call(&self, progress: Progress) {
        (self.0)(progress)
    }
}

impl fmt::Debug for ProgressFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ProgressFn")
    }
}

/// What an executor did, beyond the metrics its sessions recorded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionSummary {
    pub elapsed: Duration,
    /// Lifecycles started.
    pub sessions: u64,
    /// Highest live population seen on a tick.
    pub peak: usize,
    pub deviations: u64,
    /// Sessions aborted after a grace period ran out.
    pub interrupted: u64,
}

/// Wait for every task in `tasks` until `grace` runs out, then abort the rest.
///
/// Returns the number of aborted tasks, which is also recorded as
/// `ws_sessions_interrupted`.
pub(crate) async fn drain<T: 'static>(
    tasks: &mut JoinSet<T>,
    grace: Duration,
    metrics: &crate::Aggregator,
) -> u64 {
    let deadline = Instant::now() + grace;
    loop {
        match tokio::time::timeout_at(deadline, tasks.join_next()).await {
            Ok(Some(Ok(_))) => {}
            Ok(Some(Err(e))) => {
                if e.is_panic() {
                    tracing::error!("Session task panicked with error: {e}");
                }
            }
            Ok(None) => return 0,
            Err(_) => break,
        }
    }

    let left = tasks.len() as u64;
    tracing::warn!("Graceful stop of {grace:?} exceeded, aborting {left} sessions");
    tasks.abort_all();
    while tasks.join_next().await.is_some() {}
    metrics.record(Event::counter(names::WS_SESSIONS_INTERRUPTED, left));
    left
}
