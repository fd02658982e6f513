//! Target population as a pure function of elapsed time.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A stage ramps the population from the previous target to `target` over
/// `duration`.
///
/// A stage with `Duration::ZERO` jumps to its target instantly. This is how a
/// ramping workload starts at a non-zero population or steps up abruptly.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    #[serde(with = "crate::config::duration")]
    pub duration: Duration,
    /// Concurrent sessions at the end of the stage.
    pub target: u32,
}

impl Stage {
    pub fn new(duration: Duration, target: u32) -> Self {
        Self { duration, target }
    }
}

/// Piecewise-linear target concurrency over a list of [`Stage`]s.
///
/// ```rust
/// use std::time::Duration;
/// use chatstorm::executor::{RampingSchedule, Stage};
///
/// let schedule = RampingSchedule::new(0, vec![
///     Stage::new(Duration::from_secs(10), 1000),
///     Stage::new(Duration::from_secs(5), 1000),
///     Stage::new(Duration::from_secs(5), 0),
/// ]);
/// assert_eq!(schedule.vus_at(Duration::from_secs(5)), 500);
/// assert_eq!(schedule.vus_at(Duration::from_secs(12)), 1000);
/// assert_eq!(schedule.vus_at(Duration::from_secs(20)), 0);
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct RampingSchedule {
    start: u32,
    stages: Vec<Stage>,
}

impl RampingSchedule {
    pub fn new(start: u32, stages: Vec<Stage>) -> Self {
        Self { start, stages }
    }

    /// A step function: `vus` from the first instant until `duration` elapses.
    pub fn constant(vus: u32, duration: Duration) -> Self {
        Self::new(vus, vec![Stage::new(duration, vus)])
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn total_duration(&self) -> Duration {
        self.stages.iter().map(|s| s.duration).sum()
    }

    pub fn max_target(&self) -> u32 {
        self.stages
            .iter()
            .map(|s| s.target)
            .fold(self.start, u32::max)
    }

    /// Index of the stage running at `elapsed`, `None` once the schedule is over.
    pub fn stage_at(&self, elapsed: Duration) -> Option<usize> {
        let mut end = Duration::ZERO;
        for (i, stage) in self.stages.iter().enumerate() {
            end += stage.duration;
            if elapsed < end {
                return Some(i);
            }
        }
        None
    }

    /// Exact target at `elapsed`. Past the last stage it holds the final target.
    pub fn target_at(&self, elapsed: Duration) -> f64 {
        let mut from = f64::from(self.start);
        let mut offset = Duration::ZERO;
        for stage in &self.stages {
            let end = offset + stage.duration;
            if elapsed < end {
                return interpolate(elapsed - offset, stage.duration, from, f64::from(stage.target));
            }
            from = f64::from(stage.target);
            offset = end;
        }
        from
    }

    /// Whole sessions wanted at `elapsed`.
    pub fn vus_at(&self, elapsed: Duration) -> usize {
        whole(self.target_at(elapsed))
    }
}

/// Linear interpolation between `start` and `end` at `elapsed` into a stage of
/// `stage_duration`, clamped to the stage bounds.
pub fn interpolate(elapsed: Duration, stage_duration: Duration, start: f64, end: f64) -> f64 {
    if stage_duration.is_zero() {
        return end;
    }
    let t = (elapsed.as_secs_f64() / stage_duration.as_secs_f64()).min(1.0);
    start + (end - start) * t
}

/// Floor, tolerant of float noise just below an integer.
pub(crate) fn whole(target: f64) -> usize {
    if target.is_finite() && target > 0.0 {
        (target + 1e-9).floor() as usize
    } else {
        0
    }
}
