use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{
    aggregate::Aggregator,
    error::{ConfigError, Result},
    executor::{
        ConstantExecutor, ExecutionOptions, Executor, ProgressFn, RampingExecutor,
        RampingSchedule, Stage,
    },
    report::RunReport,
    session::{SessionFactory, SessionProfile},
    threshold::{ThresholdSpec, evaluate_thresholds},
    transport::Transport,
};

/// Endpoint used when neither the scenario nor the environment names one.
pub const DEFAULT_URL: &str = "ws://localhost:8080/ws";

/// Shape of the population over time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "executor", rename_all = "lowercase")]
pub enum Workload {
    /// Piecewise-linear ramps between stage targets.
    Ramping {
        #[serde(default)]
        start_vus: u32,
        stages: Vec<Stage>,
    },
    /// `vus` sessions restarting back to back for `duration` (churn).
    Constant {
        vus: u32,
        #[serde(with = "crate::config::duration")]
        duration: Duration,
    },
}

impl Workload {
    pub fn schedule(&self) -> RampingSchedule {
        match self {
            Self::Ramping { start_vus, stages } => RampingSchedule::new(*start_vus, stages.clone()),
            Self::Constant { vus, duration } => RampingSchedule::constant(*vus, *duration),
        }
    }

    pub fn total_duration(&self) -> Duration {
        self.schedule().total_duration()
    }

    pub fn max_vus(&self) -> u32 {
        self.schedule().max_target()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Self::Ramping { stages, .. } if stages.is_empty() => {
                Err(ConfigError::Invalid("ramping workload has no stages".into()))
            }
            Self::Constant { vus: 0, .. } => {
                Err(ConfigError::Invalid("constant workload needs at least one VU".into()))
            }
            _ if self.total_duration().is_zero() => {
                Err(ConfigError::Invalid("workload duration is zero".into()))
            }
            _ => Ok(()),
        }
    }
}

/// A complete load test: where to connect, how the population evolves, what each
/// session does and which thresholds decide the verdict.
///
/// # Example
/// ```rust,no_run
/// use std::time::Duration;
/// use chatstorm::{Scenario, Workload, SessionProfile, ThresholdSpec, transport::WsTransport};
///
/// # async fn run() -> chatstorm::Result<()> {
/// let report = Scenario::builder()
///     .name("steady")
///     .workload(Workload::Constant { vus: 100, duration: Duration::from_secs(60) })
///     .session(
///         SessionProfile::builder()
///             .lifetime(Duration::from_secs(60))
///             .send_interval(Duration::from_secs(1))
///             .build(),
///     )
///     .thresholds(vec![ThresholdSpec::new("ws_errors", "count==0")?])
///     .build()
///     .run(WsTransport::default())
///     .await?;
/// assert!(report.passed());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, TypedBuilder, Serialize)]
pub struct Scenario {
    #[builder(setter(into))]
    pub name: String,
    #[builder(default = DEFAULT_URL.to_string(), setter(into))]
    pub url: String,
    pub workload: Workload,
    #[builder(default)]
    pub session: SessionProfile,
    #[builder(default)]
    pub thresholds: Vec<ThresholdSpec>,
    #[builder(default)]
    pub options: ExecutionOptions,
}

impl Scenario {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid("scenario name is empty".into()));
        }
        if self.url.trim().is_empty() {
            return Err(ConfigError::Invalid("endpoint url is empty".into()));
        }
        if self.session.lifetime.is_zero() {
            return Err(ConfigError::Invalid("session lifetime is zero".into()));
        }
        if self.session.send_interval.is_some_and(|i| i.is_zero()) {
            return Err(ConfigError::Invalid("send interval is zero".into()));
        }
        if self.options.tick.is_zero() {
            return Err(ConfigError::Invalid("tick is zero".into()));
        }
        self.workload.validate()
    }

    /// Run the scenario against `transport` and evaluate its thresholds.
    pub async fn run<T: Transport>(&self, transport: T) -> Result<RunReport> {
        self.execute(transport, None).await
    }

    /// Like [`Scenario::run`], calling `progress` on every executor tick.
    pub async fn run_observed<T: Transport>(
        &self,
        transport: T,
        progress: ProgressFn,
    ) -> Result<RunReport> {
        self.execute(transport, Some(progress)).await
    }

    async fn execute<T: Transport>(
        &self,
        transport: T,
        progress: Option<ProgressFn>,
    ) -> Result<RunReport> {
        self.validate()?;
        let metrics = Arc::new(Aggregator::new());
        let sessions = Arc::new(SessionFactory::new(
            Arc::new(transport),
            self.url.as_str(),
            self.session.clone(),
            metrics.clone(),
        ));

        tracing::info!("Running scenario: {} against {}!", self.name, self.url);
        let summary = match &self.workload {
            Workload::Ramping { start_vus, stages } => {
                RampingExecutor {
                    schedule: RampingSchedule::new(*start_vus, stages.clone()),
                    options: self.options.clone(),
                    progress,
                }
                .exec(sessions)
                .await?
            }
            Workload::Constant { vus, duration } => {
                ConstantExecutor {
                    vus: *vus as usize,
                    duration: *duration,
                    options: self.options.clone(),
                    progress,
                }
                .exec(sessions)
                .await?
            }
        };

        tracing::info!("Processing results...");
        let snapshot = metrics.snapshot();
        let verdict = evaluate_thresholds(&self.thresholds, &snapshot);
        tracing::info!("Done running scenario: {}!", self.name);
        Ok(RunReport::new(self.name.clone(), summary, snapshot, verdict))
    }
}
