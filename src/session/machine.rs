use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use tokio::time::Instant;

use super::{MalformedPolicy, SessionProfile};
use crate::{
    error::{ProtocolError, TransportError},
    metric::{Event, names},
    protocol::{Inbound, Message, chat_text, extract_timestamp},
    transport::Frame,
};

/// Lifecycle of one simulated client.
///
/// ```text
/// Connecting -> Open -> Active -> Leaving -> Closed
///      \          \        \         \
///       +----------+--------+---------+--> Errored
/// ```
///
/// `Closed` is the graceful terminal state, `Errored` the failure one. Both are
/// absorbing: every input received there is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Connecting,
    Open,
    Active,
    Leaving,
    Closed,
    Errored,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Errored)
    }

    /// Transition guard. Only the forward edges of the lifecycle and the error edge
    /// out of any live state are legal.
    pub fn can_transition_to(self, next: Self) -> bool {
        use SessionState::*;
        match (self, next) {
            (Connecting, Open) | (Open, Active) | (Active, Leaving) | (Leaving, Closed) => true,
            (from, Errored) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// Everything that can happen to a session.
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Connected,
    ConnectFailed(TransportError),
    Frame(Frame),
    SendTick,
    LifetimeExpired,
    /// The scheduler asked the session to leave (ramp-down or scenario end).
    Stop,
    TransportFailed(TransportError),
    /// The inbound stream ended without us closing it.
    PeerClosed,
    /// Our own close finished.
    CloseCompleted,
}

/// Side effects requested by the machine, executed in order by the driver.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Send(Message),
    /// Graceful close; the driver answers with `CloseCompleted` or `TransportFailed`.
    Close,
    /// Force close after a failure; the outcome is not reported back.
    Abort,
    Record(Event),
}

/// Clock reading handed to the machine with every input.
#[derive(Debug, Clone, Copy)]
pub struct Now {
    pub instant: Instant,
    pub unix_ms: i64,
}

impl Now {
    pub fn current() -> Self {
        let unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default();
        Self {
            instant: Instant::now(),
            unix_ms,
        }
    }
}

/// Pure protocol state machine of one session.
///
/// Inputs are dispatched synchronously and answered with an ordered list of
/// [`Action`]s. The machine performs no I/O, which keeps every protocol rule
/// testable without a transport.
pub struct SessionMachine {
    id: u64,
    user: String,
    profile: Arc<SessionProfile>,
    state: SessionState,
    created_at: Instant,
    opened_at: Option<Instant>,
    stop_requested: bool,
}

impl SessionMachine {
    pub fn new(id: u64, user: impl Into<String>, profile: Arc<SessionProfile>, now: Now) -> Self {
        Self {
            id,
            user: user.into(),
            profile,
            state: SessionState::Connecting,
            created_at: now.instant,
            opened_at: None,
            stop_requested: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn profile(&self) -> &Arc<SessionProfile> {
        &self.profile
    }

    pub fn opened_at(&self) -> Option<Instant> {
        self.opened_at
    }

    /// Actions for the start of the lifecycle, before the connect is attempted.
    pub fn start(&self) -> Vec<Action> {
        vec![Action::Record(Event::counter(names::WS_SESSIONS, 1))]
    }

    pub fn handle(&mut self, input: Input, now: Now) -> Vec<Action> {
        use SessionState::*;
        match (self.state, input) {
            (Connecting, Input::Connected) => self.on_connected(now),
            (Connecting, Input::ConnectFailed(e) | Input::TransportFailed(e)) => {
                self.fail(e, now)
            }
            (Connecting, Input::Stop | Input::LifetimeExpired) => {
                // leave right after joining, so the lifecycle stays ordered
                self.stop_requested = true;
                Vec::new()
            }
            (Active, Input::Frame(frame)) => self.on_frame(frame, now),
            (Active, Input::SendTick) => vec![
                Action::Send(self.chat(now)),
                Action::Record(Event::counter(names::CHAT_MSGS_SENT, 1)),
            ],
            (Active, Input::Stop | Input::LifetimeExpired) => self.leave(),
            (Open | Active, Input::PeerClosed) => self.fail(TransportError::ClosedByPeer, now),
            (Open | Active | Leaving, Input::TransportFailed(e)) => self.fail(e, now),
            (Leaving, Input::CloseCompleted | Input::PeerClosed) => self.finish(now),
            (state, input) => {
                tracing::trace!("Session {} ignoring {input:?} in {state:?}", self.id);
                Vec::new()
            }
        }
    }

    fn transition(&mut self, next: SessionState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {:?} -> {next:?}",
            self.state
        );
        tracing::trace!("Session {}: {:?} -> {next:?}", self.id, self.state);
        self.state = next;
    }

    fn on_connected(&mut self, now: Now) -> Vec<Action> {
        self.transition(SessionState::Open);
        self.opened_at = Some(now.instant);
        let connecting = now.instant.duration_since(self.created_at);
        let mut actions = vec![
            Action::Record(Event::counter(names::WS_CONNECTS, 1)),
            Action::Record(Event::trend(
                names::WS_CONNECTING,
                connecting.as_secs_f64() * 1_000.0,
            )),
            Action::Send(Message::Join {
                room: self.profile.room.clone(),
                user: self.user.clone(),
            }),
        ];
        self.transition(SessionState::Active);

        for _ in 0..self.profile.messages_on_join {
            actions.push(Action::Send(self.chat(now)));
            actions.push(Action::Record(Event::counter(names::CHAT_MSGS_SENT, 1)));
        }
        if self.stop_requested {
            actions.extend(self.leave());
        }
        actions
    }

    fn on_frame(&mut self, frame: Frame, now: Now) -> Vec<Action> {
        let parsed = match &frame {
            Frame::Text(text) => Inbound::parse(text),
            Frame::Binary(bytes) => Inbound::parse_bytes(bytes),
        };
        match parsed {
            // answered first, ahead of anything else this input produces
            Ok(Inbound::Ping { ts }) => vec![
                Action::Send(Message::Pong { ts }),
                Action::Record(Event::counter(names::WS_PONGS_SENT, 1)),
            ],
            Ok(Inbound::Chat { text }) => {
                let mut actions = vec![Action::Record(Event::counter(
                    names::CHAT_MSGS_RECEIVED,
                    1,
                ))];
                if let Some(latency) = text
                    .as_deref()
                    .and_then(extract_timestamp)
                    .and_then(|sent| self.delivery_latency(sent, now))
                {
                    actions.push(Action::Record(Event::trend(
                        names::MSG_DELIVERY_LATENCY,
                        latency,
                    )));
                }
                actions
            }
            Ok(Inbound::Other(_)) => Vec::new(),
            Err(e) => self.on_malformed(e),
        }
    }

    /// Latency in milliseconds, or `None` when it falls outside `[0, ceiling)`
    /// (clock skew, stale replays).
    fn delivery_latency(&self, sent_at_ms: i64, now: Now) -> Option<f64> {
        let latency = now.unix_ms.checked_sub(sent_at_ms)?;
        let ceiling = i64::try_from(self.profile.latency_ceiling.as_millis()).unwrap_or(i64::MAX);
        (0..ceiling).contains(&latency).then_some(latency as f64)
    }

    fn on_malformed(&self, error: ProtocolError) -> Vec<Action> {
        match self.profile.malformed {
            MalformedPolicy::Ignore => {
                tracing::trace!("Session {} ignoring malformed payload: {error}", self.id);
                Vec::new()
            }
            MalformedPolicy::Count => {
                tracing::debug!("Session {} received malformed payload: {error}", self.id);
                vec![Action::Record(Event::counter(names::WS_PROTOCOL_ERRORS, 1))]
            }
        }
    }

    fn chat(&self, now: Now) -> Message {
        let p = &self.profile;
        Message::Chat {
            room: p.room.clone(),
            user: self.user.clone(),
            text: chat_text(
                &p.text_prefix,
                &self.user,
                p.embed_timestamp.then_some(now.unix_ms),
                p.payload_size,
            ),
        }
    }

    fn leave(&mut self) -> Vec<Action> {
        self.transition(SessionState::Leaving);
        vec![
            Action::Send(Message::Leave {
                user: self.user.clone(),
            }),
            Action::Close,
        ]
    }

    fn finish(&mut self, now: Now) -> Vec<Action> {
        self.transition(SessionState::Closed);
        vec![
            Action::Record(Event::counter(names::WS_DISCONNECTS, 1)),
            self.duration(now),
        ]
    }

    fn fail(&mut self, error: TransportError, now: Now) -> Vec<Action> {
        let was_connected = self.state != SessionState::Connecting;
        tracing::debug!("Session {} failed in {:?}: {error}", self.id, self.state);
        self.transition(SessionState::Errored);

        let mut actions = vec![Action::Record(Event::counter(names::WS_ERRORS, 1))];
        if was_connected {
            // no leave: the transport can no longer be trusted
            actions.push(Action::Abort);
            actions.push(self.duration(now));
        }
        actions
    }

    fn duration(&self, now: Now) -> Action {
        let elapsed = now.instant.duration_since(self.created_at);
        Action::Record(Event::trend(
            names::WS_SESSION_DURATION,
            elapsed.as_secs_f64() * 1_000.0,
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;

    fn profile() -> SessionProfile {
        SessionProfile::builder()
            .lifetime(Duration::from_secs(60))
            .build()
    }

    fn machine(profile: SessionProfile) -> SessionMachine {
        SessionMachine::new(7, "client-007", Arc::new(profile), Now::current())
    }

    fn at(unix_ms: i64) -> Now {
        Now {
            instant: Instant::now(),
            unix_ms,
        }
    }

    fn sends(actions: &[Action]) -> Vec<&Message> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Send(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    fn recorded<'a>(actions: &'a [Action], name: &str) -> Vec<&'a Event> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Record(e) if e.name == name => Some(e),
                _ => None,
            })
            .collect()
    }

    fn active(profile: SessionProfile) -> SessionMachine {
        let mut m = machine(profile);
        m.handle(Input::Connected, Now::current());
        assert_eq!(m.state(), SessionState::Active);
        m
    }

    mod transitions {
        use super::*;

        #[test]
        fn guard_allows_only_forward_edges() {
            use SessionState::*;
            assert!(Connecting.can_transition_to(Open));
            assert!(Open.can_transition_to(Active));
            assert!(Active.can_transition_to(Leaving));
            assert!(Leaving.can_transition_to(Closed));
            assert!(Active.can_transition_to(Errored));
            assert!(!Connecting.can_transition_to(Closed));
            assert!(!Open.can_transition_to(Closed));
            assert!(!Active.can_transition_to(Closed));
            assert!(!Closed.can_transition_to(Errored));
            assert!(!Errored.can_transition_to(Errored));
        }

        #[test]
        fn connected_joins_and_becomes_active() {
            let mut m = machine(profile());
            let actions = m.handle(Input::Connected, Now::current());
            assert_eq!(m.state(), SessionState::Active);
            assert_eq!(
                sends(&actions),
                vec![&Message::Join {
                    room: "public".into(),
                    user: "client-007".into()
                }]
            );
            assert_eq!(recorded(&actions, names::WS_CONNECTS).len(), 1);
            assert_eq!(recorded(&actions, names::WS_CONNECTING).len(), 1);
        }

        #[test]
        fn connect_failure_is_terminal_without_close() {
            let mut m = machine(profile());
            let actions = m.handle(
                Input::ConnectFailed(TransportError::Refused("nope".into())),
                Now::current(),
            );
            assert_eq!(m.state(), SessionState::Errored);
            assert_eq!(recorded(&actions, names::WS_ERRORS).len(), 1);
            assert!(!actions.contains(&Action::Abort));
            assert!(m.handle(Input::Connected, Now::current()).is_empty());
            assert_eq!(m.state(), SessionState::Errored);
        }

        #[test]
        fn stop_leaves_then_closes() {
            let mut m = active(profile());
            let actions = m.handle(Input::Stop, Now::current());
            assert_eq!(m.state(), SessionState::Leaving);
            assert_eq!(
                actions,
                vec![
                    Action::Send(Message::Leave {
                        user: "client-007".into()
                    }),
                    Action::Close
                ]
            );

            let actions = m.handle(Input::CloseCompleted, Now::current());
            assert_eq!(m.state(), SessionState::Closed);
            assert_eq!(recorded(&actions, names::WS_DISCONNECTS).len(), 1);
            assert_eq!(recorded(&actions, names::WS_SESSION_DURATION).len(), 1);
        }

        #[test]
        fn lifetime_expiry_leaves() {
            let mut m = active(profile());
            m.handle(Input::LifetimeExpired, Now::current());
            assert_eq!(m.state(), SessionState::Leaving);
        }

        #[test]
        fn stop_while_connecting_joins_then_leaves() {
            let mut m = machine(profile());
            assert!(m.handle(Input::Stop, Now::current()).is_empty());
            assert_eq!(m.state(), SessionState::Connecting);

            let actions = m.handle(Input::Connected, Now::current());
            let kinds: Vec<_> = sends(&actions).iter().map(|m| m.kind()).collect();
            assert_eq!(kinds, vec!["join", "leave"]);
            assert_eq!(actions.last(), Some(&Action::Close));
            assert_eq!(m.state(), SessionState::Leaving);
        }

        #[test]
        fn transport_failure_aborts_without_leave() {
            let mut m = active(profile());
            let actions = m.handle(
                Input::TransportFailed(TransportError::Reset("rst".into())),
                Now::current(),
            );
            assert_eq!(m.state(), SessionState::Errored);
            assert!(sends(&actions).is_empty());
            assert!(actions.contains(&Action::Abort));
            assert_eq!(recorded(&actions, names::WS_ERRORS).len(), 1);
        }

        #[test]
        fn peer_close_while_active_is_an_error() {
            let mut m = active(profile());
            m.handle(Input::PeerClosed, Now::current());
            assert_eq!(m.state(), SessionState::Errored);
        }

        #[test]
        fn failure_while_leaving_is_an_error() {
            let mut m = active(profile());
            m.handle(Input::Stop, Now::current());
            let actions = m.handle(
                Input::TransportFailed(TransportError::Reset("rst".into())),
                Now::current(),
            );
            assert_eq!(m.state(), SessionState::Errored);
            assert!(recorded(&actions, names::WS_DISCONNECTS).is_empty());
        }
    }

    mod idempotence {
        use super::*;

        #[test]
        fn closing_a_closed_session_counts_once() {
            let mut m = active(profile());
            let mut all = m.handle(Input::Stop, Now::current());
            all.extend(m.handle(Input::CloseCompleted, Now::current()));
            all.extend(m.handle(Input::Stop, Now::current()));
            all.extend(m.handle(Input::CloseCompleted, Now::current()));
            all.extend(m.handle(Input::PeerClosed, Now::current()));
            all.extend(m.handle(Input::LifetimeExpired, Now::current()));

            assert_eq!(m.state(), SessionState::Closed);
            assert_eq!(recorded(&all, names::WS_DISCONNECTS).len(), 1);
            assert_eq!(
                sends(&all).iter().filter(|m| m.kind() == "leave").count(),
                1
            );
        }

        #[test]
        fn second_stop_while_leaving_is_ignored() {
            let mut m = active(profile());
            m.handle(Input::Stop, Now::current());
            assert!(m.handle(Input::Stop, Now::current()).is_empty());
        }
    }

    mod inbound {
        use super::*;

        fn text(v: serde_json::Value) -> Input {
            Input::Frame(Frame::Text(v.to_string()))
        }

        #[test]
        fn ping_gets_exactly_one_pong_first() {
            let mut m = active(profile());
            let actions = m.handle(text(json!({"type": "ping", "ts": 1234})), Now::current());
            assert_eq!(
                actions.first(),
                Some(&Action::Send(Message::Pong { ts: json!(1234) }))
            );
            assert_eq!(sends(&actions).len(), 1);
            assert_eq!(recorded(&actions, names::WS_PONGS_SENT).len(), 1);
        }

        #[test]
        fn chat_counts_and_measures_latency() {
            let mut m = active(profile());
            let actions = m.handle(
                text(json!({"type": "chat", "room": "public", "user": "x", "text": "hi|ts:1000"})),
                at(1_250),
            );
            assert_eq!(recorded(&actions, names::CHAT_MSGS_RECEIVED).len(), 1);
            let latency = recorded(&actions, names::MSG_DELIVERY_LATENCY);
            assert_eq!(latency.len(), 1);
            assert_eq!(latency[0].value, 250.0);
        }

        #[test]
        fn latency_outside_range_is_dropped() {
            let mut m = active(profile());
            // sent "in the future"
            let future = m.handle(
                text(json!({"type": "chat", "text": "hi|ts:2000"})),
                at(1_000),
            );
            // well past the 60s ceiling
            let stale = m.handle(
                text(json!({"type": "chat", "text": "hi|ts:1000"})),
                at(90_000),
            );
            // exactly at the ceiling is already out
            let edge = m.handle(
                text(json!({"type": "chat", "text": "hi|ts:1000"})),
                at(61_000),
            );
            // one millisecond under it still counts
            let under = m.handle(
                text(json!({"type": "chat", "text": "hi|ts:1000"})),
                at(60_999),
            );
            assert!(recorded(&future, names::MSG_DELIVERY_LATENCY).is_empty());
            assert!(recorded(&stale, names::MSG_DELIVERY_LATENCY).is_empty());
            assert!(recorded(&edge, names::MSG_DELIVERY_LATENCY).is_empty());
            assert_eq!(recorded(&edge, names::CHAT_MSGS_RECEIVED).len(), 1);
            let kept = recorded(&under, names::MSG_DELIVERY_LATENCY);
            assert_eq!(kept.len(), 1);
            assert_eq!(kept[0].value, 59_999.0);
            assert_eq!(recorded(&stale, names::CHAT_MSGS_RECEIVED).len(), 1);
        }

        #[test]
        fn chat_without_marker_only_counts() {
            let mut m = active(profile());
            let actions = m.handle(text(json!({"type": "chat", "text": "plain"})), Now::current());
            assert_eq!(actions.len(), 1);
        }

        #[test]
        fn malformed_ignored_by_default() {
            let mut m = active(profile());
            let actions = m.handle(Input::Frame(Frame::Text("{{oops".into())), Now::current());
            assert!(actions.is_empty());
            assert_eq!(m.state(), SessionState::Active);
        }

        #[test]
        fn malformed_counted_when_configured() {
            let mut m = active(
                SessionProfile::builder()
                    .lifetime(Duration::from_secs(1))
                    .malformed(MalformedPolicy::Count)
                    .build(),
            );
            let actions = m.handle(Input::Frame(Frame::Binary(vec![0xff])), Now::current());
            assert_eq!(recorded(&actions, names::WS_PROTOCOL_ERRORS).len(), 1);
            assert_eq!(m.state(), SessionState::Active);
        }

        #[test]
        fn frames_outside_active_are_ignored() {
            let mut m = machine(profile());
            let actions = m.handle(text(json!({"type": "ping", "ts": 1})), Now::current());
            assert!(actions.is_empty());
        }
    }

    mod sending {
        use super::*;

        #[test]
        fn send_tick_emits_chat() {
            let mut m = active(
                SessionProfile::builder()
                    .lifetime(Duration::from_secs(1))
                    .embed_timestamp(true)
                    .payload_size(80)
                    .build(),
            );
            let actions = m.handle(Input::SendTick, at(42));
            let Some(Action::Send(Message::Chat { text, user, .. })) = actions.first() else {
                panic!("expected chat, got {actions:?}");
            };
            assert_eq!(user, "client-007");
            assert_eq!(text.len(), 80);
            assert_eq!(extract_timestamp(text), Some(42));
            assert_eq!(recorded(&actions, names::CHAT_MSGS_SENT).len(), 1);
        }

        #[test]
        fn messages_on_join_follow_the_join() {
            let mut m = machine(
                SessionProfile::builder()
                    .lifetime(Duration::from_secs(1))
                    .messages_on_join(2)
                    .build(),
            );
            let actions = m.handle(Input::Connected, Now::current());
            let kinds: Vec<_> = sends(&actions).iter().map(|m| m.kind()).collect();
            assert_eq!(kinds, vec!["join", "chat", "chat"]);
        }

        #[test]
        fn no_chat_after_leaving() {
            let mut m = active(profile());
            m.handle(Input::Stop, Now::current());
            assert!(m.handle(Input::SendTick, Now::current()).is_empty());
        }
    }
}
