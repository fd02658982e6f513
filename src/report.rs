//! Run reports and reporters.
//!
//! A [`RunReport`] is the processed form of a finished run: per-metric summaries
//! derived from the final [`MetricSnapshot`], what the executor did, and the
//! threshold results. It is pure data. [`Reporter`]s are the I/O boundary that
//! sends a report somewhere (the log, a file, stdout).

use std::{
    collections::BTreeMap,
    error::Error as StdError,
    future::Future,
    io::Write,
    sync::{Mutex, PoisonError},
    time::Duration,
};

use serde::Serialize;

use crate::{
    aggregate::{MetricSnapshot, Series},
    executor::ExecutionSummary,
    threshold::{ThresholdResult, Verdict},
};

/// Summary statistics of one metric.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MetricSummary {
    Counter {
        total: u64,
        /// Per second of run time.
        rate: f64,
    },
    Trend {
        count: u64,
        min: Option<f64>,
        max: Option<f64>,
        avg: Option<f64>,
        med: Option<f64>,
        p90: Option<f64>,
        p95: Option<f64>,
        p99: Option<f64>,
    },
}

impl MetricSummary {
    pub fn new(series: &Series, elapsed: Duration) -> Self {
        match series {
            Series::Counter(c) => {
                let secs = elapsed.as_secs_f64();
                Self::Counter {
                    total: c.total,
                    rate: if secs > 0.0 { c.total as f64 / secs } else { 0.0 },
                }
            }
            Series::Trend(t) => Self::Trend {
                count: t.count(),
                min: t.min(),
                max: t.max(),
                avg: t.avg(),
                med: t.median(),
                p90: t.percentile(90.0),
                p95: t.percentile(95.0),
                p99: t.percentile(99.0),
            },
        }
    }
}

/// Everything known about a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub scenario: String,
    pub elapsed_secs: f64,
    pub sessions: u64,
    pub peak_vus: usize,
    pub deviations: u64,
    pub interrupted: u64,
    pub metrics: BTreeMap<String, MetricSummary>,
    pub thresholds: Vec<ThresholdResult>,
    pub passed: bool,
    #[serde(skip)]
    snapshot: MetricSnapshot,
}

impl RunReport {
    pub fn new(
        scenario: impl Into<String>,
        summary: ExecutionSummary,
        snapshot: MetricSnapshot,
        verdict: Verdict,
    ) -> Self {
        let metrics = snapshot
            .iter()
            .map(|(name, series)| {
                (
                    name.to_string(),
                    MetricSummary::new(series, snapshot.elapsed()),
                )
            })
            .collect();
        Self {
            scenario: scenario.into(),
            elapsed_secs: summary.elapsed.as_secs_f64(),
            sessions: summary.sessions,
            peak_vus: summary.peak,
            deviations: summary.deviations,
            interrupted: summary.interrupted,
            metrics,
            passed: verdict.passed(),
            thresholds: verdict.results,
            snapshot,
        }
    }

    /// Final verdict: every threshold passed. Runs without thresholds pass.
    pub fn passed(&self) -> bool {
        self.passed
    }

    /// The final metric snapshot the report was built from.
    pub fn snapshot(&self) -> &MetricSnapshot {
        &self.snapshot
    }

    /// Process exit code for this outcome.
    pub fn exit_code(&self) -> i32 {
        if self.passed { 0 } else { 99 }
    }
}

/// A [`Reporter`] consumes a [`RunReport`] and performs side effects: logging it,
/// writing it to a file or sending it to a service.
pub trait Reporter {
    fn report(&self, report: &RunReport)
    -> impl Future<Output = Result<(), Box<dyn StdError>>>;
}

/// Logs a k6-like summary through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl Reporter for LogReporter {
    async fn report(&self, report: &RunReport) -> Result<(), Box<dyn StdError>> {
        tracing::info!(
            "Scenario {} finished in {:.1}s: {} sessions, peak {} VUs",
            report.scenario,
            report.elapsed_secs,
            report.sessions,
            report.peak_vus
        );
        for (name, summary) in &report.metrics {
            tracing::info!("{}", metric_line(name, summary));
        }
        for result in &report.thresholds {
            let mark = if result.passed { "PASS" } else { "FAIL" };
            match result.observed {
                Some(v) => tracing::info!("[{mark}] {} (observed {v:.2})", result.spec),
                None => tracing::info!("[{mark}] {} (no data)", result.spec),
            }
        }
        if report.passed {
            tracing::info!("All thresholds passed");
        } else {
            tracing::warn!("Some thresholds failed");
        }
        Ok(())
    }
}

fn metric_line(name: &str, summary: &MetricSummary) -> String {
    let fmt = |v: Option<f64>| v.map_or_else(|| "-".to_string(), |v| format!("{v:.2}"));
    match summary {
        MetricSummary::Counter { total, rate } => {
            format!("{name:.<28} {total} ({rate:.2}/s)")
        }
        MetricSummary::Trend {
            count,
            min,
            max,
            avg,
            med,
            p90,
            p95,
            ..
        } => format!(
            "{name:.<28} avg={} min={} med={} max={} p(90)={} p(95)={} count={count}",
            fmt(*avg),
            fmt(*min),
            fmt(*med),
            fmt(*max),
            fmt(*p90),
            fmt(*p95),
        ),
    }
}

/// Writes the report as a single JSON document.
pub struct JsonReporter<W: Write> {
    out: Mutex<W>,
    pretty: bool,
}

impl<W: Write> JsonReporter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
            pretty: false,
        }
    }

    pub fn pretty(mut self) -> Self {
        self.pretty = true;
        self
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<W: Write> Reporter for JsonReporter<W> {
    async fn report(&self, report: &RunReport) -> Result<(), Box<dyn StdError>> {
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        if self.pretty {
            serde_json::to_writer_pretty(&mut *out, report)?;
        } else {
            serde_json::to_writer(&mut *out, report)?;
        }
        writeln!(out)?;
        out.flush()?;
        Ok(())
    }
}
