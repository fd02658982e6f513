use std::{borrow::Cow, time::SystemTime};

use serde::{Deserialize, Serialize};

/// The two kinds of metric the engine knows about.
///
/// - A **Counter** holds a monotonically increasing total. Each event adds its value.
/// - A **Trend** holds a distribution of sampled values, later queried for
///   percentiles, averages and extremes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Trend,
}

/// An `Event` is a single observed measurement produced by a session or by the
/// scheduler.
///
/// Events are the most granular unit of data in chatstorm. They are ephemeral: each
/// one is handed to the [`crate::Aggregator`] as soon as it is produced, folded into
/// the named series, and dropped. Nothing retains raw events.
///
/// ## Example
/// ```rust
/// use chatstorm::{Event, metric::names};
///
/// let sent = Event::counter(names::CHAT_MSGS_SENT, 1);
/// let latency = Event::trend(names::MSG_DELIVERY_LATENCY, 42.0);
/// assert_eq!(sent.value, 1.0);
/// assert_eq!(latency.name, "msg_delivery_latency");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub name: Cow<'static, str>,
    pub kind: MetricKind,
    pub value: f64,
    pub timestamp: SystemTime,
}

impl Event {
    pub fn new(name: impl Into<Cow<'static, str>>, kind: MetricKind, value: f64) -> Self {
        Self {
            name: name.into(),
            kind,
            value,
            timestamp: SystemTime::now(),
        }
    }

    /// Counter increment. Counters only ever grow, so the value is unsigned.
    pub fn counter(name: impl Into<Cow<'static, str>>, value: u64) -> Self {
        Self::new(name, MetricKind::Counter, value as f64)
    }

    /// One trend sample.
    pub fn trend(name: impl Into<Cow<'static, str>>, value: f64) -> Self {
        Self::new(name, MetricKind::Trend, value)
    }
}

/// Names of the metrics recorded by the engine itself.
pub mod names {
    /// Lifecycles started (a connect was attempted).
    pub const WS_SESSIONS: &str = "ws_sessions";
    /// Successful opens.
    pub const WS_CONNECTS: &str = "ws_connects";
    /// Graceful closes: leave sent and transport closed.
    pub const WS_DISCONNECTS: &str = "ws_disconnects";
    /// Transport level failures.
    pub const WS_ERRORS: &str = "ws_errors";
    /// Malformed inbound payloads, only under `MalformedPolicy::Count`.
    pub const WS_PROTOCOL_ERRORS: &str = "ws_protocol_errors";
    pub const WS_PONGS_SENT: &str = "ws_pongs_sent";
    pub const CHAT_MSGS_SENT: &str = "chat_msgs_sent";
    pub const CHAT_MSGS_RECEIVED: &str = "chat_msgs_received";
    /// Connect latency in milliseconds.
    pub const WS_CONNECTING: &str = "ws_connecting";
    /// Milliseconds from connect start until the session reached a terminal state.
    pub const WS_SESSION_DURATION: &str = "ws_session_duration";
    /// Milliseconds between the embedded send timestamp and receipt.
    pub const MSG_DELIVERY_LATENCY: &str = "msg_delivery_latency";
    /// Live population, sampled once per scheduler tick.
    pub const VUS: &str = "vus";
    pub const SCHEDULER_DEVIATIONS: &str = "scheduler_deviations";
    /// Sessions aborted because they outlived the graceful stop period.
    pub const WS_SESSIONS_INTERRUPTED: &str = "ws_sessions_interrupted";
}
