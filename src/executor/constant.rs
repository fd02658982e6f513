//! The `ConstantExecutor`: a fixed number of VUs, each looping lifecycles
//! back to back.
//!
//! Every VU slot is a task that runs a session, waits for it to reach a terminal
//! state and starts the next one right away. The population is therefore capped at
//! `vus` by construction while individual slots cycle at different phases, which
//! maximizes connect and disconnect rate (churn). Failed lifecycles, panics
//! included, restart after `error_backoff` so a refusing endpoint is not hammered
//! in a tight loop.

use std::{
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use futures::FutureExt;
use tokio::{
    sync::watch::{self, Receiver},
    task::JoinSet,
    time::{Instant, sleep, sleep_until},
};
use typed_builder::TypedBuilder;

use super::{ExecutionOptions, ExecutionSummary, Executor, Progress, ProgressFn, drain};
use crate::{
    error::Error,
    metric::{Event, names},
    session::{SessionFactory, SessionState},
    transport::Transport,
};

/// Executor that keeps `vus` sessions cycling for `duration`.
#[derive(Debug, TypedBuilder)]
pub struct ConstantExecutor {
    pub vus: usize,
    pub duration: Duration,
    #[builder(default)]
    pub options: ExecutionOptions,
    #[builder(default, setter(strip_option))]
    pub progress: Option<ProgressFn>,
}

impl Executor for ConstantExecutor {
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
        let (stop_tx, stop_rx) = watch::channel(false);
        let live = Arc::new(AtomicUsize::new(0));

        tracing::info!("Spawning {} VUs for {:?}...", self.vus, self.duration);
        let mut tasks = JoinSet::new();
        for vu in 1..=self.vus as u64 {
            tasks.spawn(vu_loop(
                vu,
                sessions.clone(),
                stop_rx.clone(),
                live.clone(),
                opts.error_backoff,
            ));
        }

        let mut summary = ExecutionSummary::default();
        let start = Instant::now();
        let end = start + self.duration;
        let mut next_tick = start;
        loop {
            let elapsed = start.elapsed();
            if elapsed >= self.duration {
                break;
            }
            let active = live.load(Ordering::Relaxed);
            summary.peak = summary.peak.max(active);
            metrics.record(Event::trend(names::VUS, active as f64));
            if let Some(progress_fn) = &self.progress {
                progress_fn.call(Progress {
                    elapsed,
                    target: self.vus as f64,
                    active,
                    retiring: 0,
                });
            }
            next_tick += opts.tick;
            sleep_until(next_tick.min(end)).await;
        }

        tracing::info!("Duration elapsed, signaling VUs to leave...");
        // every receiver may be gone already if all VU tasks died
        let _ = stop_tx.send(true);
        summary.interrupted = drain(&mut tasks, opts.graceful_stop, &metrics).await;
        summary.sessions = sessions.created();
        summary.elapsed = start.elapsed();
        tracing::info!(
            "Constant run done: {} lifecycles in {:?}",
            summary.sessions,
            summary.elapsed
        );
        Ok(summary)
    }
}

/// Decrements the live count when a lifecycle ends, panics and aborts included.
struct LiveGuard(Arc<AtomicUsize>);

impl LiveGuard {
    fn enter(live: &Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::Relaxed);
        Self(live.clone())
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

fn stop_requested(stop: &Receiver<bool>) -> bool {
    *stop.borrow()
}

async fn vu_loop<T: Transport>(
    vu: u64,
    sessions: Arc<SessionFactory<T>>,
    mut stop: Receiver<bool>,
    live: Arc<AtomicUsize>,
    error_backoff: Duration,
) {
    tracing::debug!("VU {vu} started.");
    while !stop_requested(&stop) {
        let outcome = {
            let _live = LiveGuard::enter(&live);
            AssertUnwindSafe(sessions.session(vu).run(stop.clone()))
                .catch_unwind()
                .await
        };
        let failed = match outcome {
            Ok(outcome) => outcome.state == SessionState::Errored,
            Err(_) => {
                tracing::error!("VU {vu} session panicked, starting over");
                true
            }
        };
        if failed && !error_backoff.is_zero() {
            tokio::select! {
                _ = sleep(error_backoff) => {}
                _ = stop.wait_for(|s| *s) => {}
            }
        }
    }
    tracing::debug!("VU {vu} shutting down.");
}
