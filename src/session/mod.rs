//! Session engine: one simulated chat client.
//!
//! A session walks `connect -> join -> exchange -> leave -> close` against the
//! endpoint. The protocol rules live in the synchronous [`SessionMachine`]; the
//! async [`Session`] driver owns the connection and the session's timers, turns
//! their wake-ups into [`Input`]s and carries out the resulting [`Action`]s.
mod driver;
mod machine;

pub use driver::{Session, SessionOutcome};
pub use machine::{Action, Input, Now, SessionMachine, SessionState};

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{aggregate::Aggregator, transport::Transport};

/// What to do with inbound payloads that cannot be parsed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MalformedPolicy {
    /// Drop silently, never counted.
    #[default]
    Ignore,
    /// Count as `ws_protocol_errors`. The session carries on either way.
    Count,
}

/// Per-session behaviour shared by every session of a scenario.
#[derive(Debug, Clone, PartialEq, TypedBuilder, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionProfile {
    #[builder(default = "public".into(), setter(into))]
    pub room: String,
    /// User ids are `{user_prefix}-{vu}`, the VU number zero-padded to
    /// `user_id_width` digits.
    #[builder(default = "client".into(), setter(into))]
    pub user_prefix: String,
    #[builder(default = 3)]
    pub user_id_width: usize,
    /// Leading words of every chat text.
    #[builder(default = "hello".into(), setter(into))]
    pub text_prefix: String,
    /// How long a session stays active after joining.
    #[serde(with = "crate::config::duration")]
    pub lifetime: Duration,
    /// Periodic chat cadence. `None` sends nothing after the join burst.
    #[builder(default, setter(strip_option))]
    #[serde(with = "crate::config::duration::option")]
    pub send_interval: Option<Duration>,
    /// Chats sent right after the join.
    #[builder(default)]
    pub messages_on_join: u32,
    /// Append `|ts:<unix ms>` to chat text.
    #[builder(default)]
    pub embed_timestamp: bool,
    /// Chat text is right-padded with spaces to this many bytes.
    #[builder(default)]
    pub payload_size: usize,
    /// Delivery latencies at or above this are discarded.
    #[builder(default = Duration::from_secs(60))]
    #[serde(with = "crate::config::duration")]
    pub latency_ceiling: Duration,
    #[builder(default)]
    pub malformed: MalformedPolicy,
}

impl Default for SessionProfile {
    fn default() -> Self {
        Self::builder().lifetime(Duration::from_secs(60)).build()
    }
}

impl SessionProfile {
    pub fn user_id(&self, vu: u64) -> String {
        format!("{}-{vu:0width$}", self.user_prefix, width = self.user_id_width)
    }
}

/// Everything needed to start sessions against one endpoint.
///
/// Shared by an executor and cloned into its VU tasks. Session ids are unique per
/// factory and increase in spawn order.
pub struct SessionFactory<T: Transport> {
    transport: Arc<T>,
    url: Arc<str>,
    profile: Arc<SessionProfile>,
    metrics: Arc<Aggregator>,
    next_id: AtomicU64,
}

impl<T: Transport> SessionFactory<T> {
    pub fn new(
        transport: Arc<T>,
        url: impl Into<Arc<str>>,
        profile: SessionProfile,
        metrics: Arc<Aggregator>,
    ) -> Self {
        Self {
            transport,
            url: url.into(),
            profile: Arc::new(profile),
            metrics,
            next_id: AtomicU64::new(1),
        }
    }

    /// A new session for the VU slot `vu`.
    pub fn session(&self, vu: u64) -> Session<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let user = self.profile.user_id(vu);
        Session::new(
            SessionMachine::new(id, user, self.profile.clone(), Now::current()),
            self.transport.clone(),
            self.url.clone(),
            self.metrics.clone(),
        )
    }

    pub fn metrics(&self) -> &Arc<Aggregator> {
        &self.metrics
    }

    pub fn profile(&self) -> &SessionProfile {
        &self.profile
    }

    /// Number of sessions created so far.
    pub fn created(&self) -> u64 {
        self.next_id.load(Ordering::Relaxed) - 1
    }
}
