//! Built-in workloads.
//!
//! Ready-made scenarios covering the usual shapes of chat load: a steady room, a
//! join burst, connection churn, a stepped saturation ramp, and soak variants of
//! steady and churn. All of them target [`DEFAULT_URL`] until overridden.

use std::time::Duration;

use crate::{
    error::{Error, Result},
    executor::Stage,
    metric::names,
    scenario::{DEFAULT_URL, Scenario, Workload},
    session::{MalformedPolicy, SessionProfile},
    threshold::ThresholdSpec,
};

/// Names accepted by [`by_name`]. Dashes and underscores are interchangeable.
pub const NAMES: &[&str] = &[
    "steady",
    "burst",
    "churn",
    "churn-soak",
    "saturation",
    "steady-soak",
];

/// Look up a built-in workload by name.
pub fn by_name(name: &str) -> Result<Scenario> {
    match name.trim().to_ascii_lowercase().replace('_', "-").as_str() {
        "steady" => steady(),
        "burst" => burst(),
        "churn" => churn(),
        "churn-soak" => churn_soak(),
        "saturation" => saturation(),
        "steady-soak" => steady_soak(),
        _ => Err(Error::UnknownWorkload(name.to_string())),
    }
}

fn secs(s: u64) -> Duration {
    Duration::from_secs(s)
}

fn thresholds(raw: &[(&str, &str)]) -> Result<Vec<ThresholdSpec>> {
    raw.iter()
        .map(|(metric, expr)| ThresholdSpec::new(*metric, expr).map_err(Error::from))
        .collect()
}

/// 100 VUs chatting once a second for a minute.
pub fn steady() -> Result<Scenario> {
    Ok(Scenario::builder()
        .name("steady")
        .url(DEFAULT_URL)
        .workload(Workload::Constant {
            vus: 100,
            duration: secs(60),
        })
        .session(
            SessionProfile::builder()
                .lifetime(secs(60))
                .send_interval(secs(1))
                .payload_size(88)
                .malformed(MalformedPolicy::Count)
                .build(),
        )
        .thresholds(thresholds(&[
            (names::WS_SESSION_DURATION, "p(95)<65000"),
            (names::CHAT_MSGS_SENT, "count>5000"),
            (names::WS_ERRORS, "count==0"),
        ])?)
        .build())
}

/// Ramp to 1000 VUs in ten seconds, each sending one message on join.
pub fn burst() -> Result<Scenario> {
    Ok(Scenario::builder()
        .name("burst")
        .workload(Workload::Ramping {
            start_vus: 0,
            stages: vec![
                Stage::new(secs(10), 1000),
                Stage::new(secs(5), 1000),
                Stage::new(secs(5), 0),
            ],
        })
        .session(
            SessionProfile::builder()
                .user_id_width(0)
                .lifetime(secs(15))
                .messages_on_join(1)
                .text_prefix("burst")
                .payload_size(80)
                .malformed(MalformedPolicy::Count)
                .build(),
        )
        .thresholds(thresholds(&[
            (names::WS_ERRORS, "count==0"),
            (names::WS_SESSION_DURATION, "p(95)<10000"),
        ])?)
        .build())
}

fn churn_profile(user_id_width: usize) -> SessionProfile {
    SessionProfile::builder()
        .user_id_width(user_id_width)
        .lifetime(secs(2))
        .malformed(MalformedPolicy::Count)
        .build()
}

/// 200 VUs connecting, joining, leaving and reconnecting every two seconds.
pub fn churn() -> Result<Scenario> {
    Ok(Scenario::builder()
        .name("churn")
        .workload(Workload::Constant {
            vus: 200,
            duration: secs(60),
        })
        .session(churn_profile(0))
        .thresholds(thresholds(&[
            (names::WS_ERRORS, "count==0"),
            (names::WS_CONNECTS, "count>5000"),
        ])?)
        .build())
}

/// Three minutes of churn.
pub fn churn_soak() -> Result<Scenario> {
    Ok(Scenario::builder()
        .name("churn-soak")
        .workload(Workload::Constant {
            vus: 200,
            duration: secs(180),
        })
        .session(churn_profile(3))
        .thresholds(thresholds(&[
            (names::WS_CONNECTS, "count>16500"),
            (names::WS_ERRORS, "count==0"),
        ])?)
        .build())
}

/// Stepped ramp to 1000 chatty VUs. No thresholds: the point is to find where the
/// endpoint starts to degrade.
pub fn saturation() -> Result<Scenario> {
    let step = |d, t| Stage::new(secs(d), t);
    Ok(Scenario::builder()
        .name("saturation")
        .workload(Workload::Ramping {
            start_vus: 0,
            stages: vec![
                step(10, 200),
                step(20, 200),
                step(10, 500),
                step(20, 500),
                step(10, 1000),
                step(20, 1000),
                step(10, 0),
            ],
        })
        .session(
            SessionProfile::builder()
                .user_prefix("sat")
                .user_id_width(4)
                .text_prefix("sat")
                .lifetime(secs(100))
                .send_interval(Duration::from_millis(200))
                .payload_size(89)
                .build(),
        )
        .build())
}

/// Five minutes of steady chat with delivery latency measured end to end.
pub fn steady_soak() -> Result<Scenario> {
    Ok(Scenario::builder()
        .name("steady-soak")
        .workload(Workload::Constant {
            vus: 100,
            duration: secs(300),
        })
        .session(
            SessionProfile::builder()
                .lifetime(secs(300))
                .send_interval(secs(1))
                .embed_timestamp(true)
                .payload_size(78)
                .malformed(MalformedPolicy::Count)
                .build(),
        )
        .thresholds(thresholds(&[
            (names::WS_SESSION_DURATION, "p(95)<305000"),
            (names::CHAT_MSGS_SENT, "count>25000"),
            (names::WS_ERRORS, "count==0"),
        ])?)
        .build())
}
