use std::{collections::VecDeque, future::pending, sync::Arc};

use futures::FutureExt;
use tokio::{
    sync::watch::Receiver,
    time::{Instant, Interval, MissedTickBehavior, interval_at, sleep_until},
};

use super::{Action, Input, Now, SessionMachine, SessionState};
use crate::{
    aggregate::Aggregator,
    transport::{Connection, Transport},
};

/// Upper bound of already buffered frames handled ahead of a scheduled send.
const MAX_DRAIN: usize = 256;

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOutcome {
    pub id: u64,
    pub state: SessionState,
}

/// Async driver of one [`SessionMachine`].
///
/// The driver owns the connection and both session timers (periodic send and
/// lifetime). All of them are dropped with the driver once the machine reaches a
/// terminal state.
pub struct Session<T: Transport> {
    machine: SessionMachine,
    transport: Arc<T>,
    url: Arc<str>,
    metrics: Arc<Aggregator>,
}

impl<T: Transport> Session<T> {
    pub(crate) fn new(
        machine: SessionMachine,
        transport: Arc<T>,
        url: Arc<str>,
        metrics: Arc<Aggregator>,
    ) -> Self {
        Self {
            machine,
            transport,
            url,
            metrics,
        }
    }

    pub fn id(&self) -> u64 {
        self.machine.id()
    }

    /// Run the whole lifecycle.
    ///
    /// `stop` flips to `true` when the scheduler wants the session gone; the
    /// session then leaves gracefully. A dropped sender counts as a stop.
    pub async fn run(mut self, mut stop: Receiver<bool>) -> SessionOutcome {
        let id = self.machine.id();
        tracing::debug!("Session {id} ({}) connecting", self.machine.user());
        self.record_all(self.machine.start());

        let mut stopping = false;
        let connected = {
            let connect = self.transport.connect(&self.url);
            tokio::pin!(connect);
            loop {
                tokio::select! {
                    res = &mut connect => break res,
                    _ = stopped(&mut stop), if !stopping => {
                        stopping = true;
                        self.machine.handle(Input::Stop, Now::current());
                    }
                }
            }
        };

        let mut conn = match connected {
            Ok(conn) => conn,
            Err(e) => {
                let actions = self.machine.handle(Input::ConnectFailed(e), Now::current());
                self.record_all(actions);
                return self.outcome();
            }
        };

        let actions = self.machine.handle(Input::Connected, Now::current());
        self.execute(&mut conn, actions).await;

        let profile = self.machine.profile().clone();
        let opened = self.machine.opened_at().unwrap_or_else(Instant::now);
        let lifetime = sleep_until(opened + profile.lifetime);
        tokio::pin!(lifetime);
        let mut send_timer: Option<Interval> = profile.send_interval.map(|every| {
            let mut timer = interval_at(opened + every, every);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            timer
        });

        while self.machine.state() == SessionState::Active {
            let input = tokio::select! {
                // frames that already arrived (pings above all) go before any timer
                _ = stopped(&mut stop), if !stopping => {
                    stopping = true;
                    self.drain(&mut conn).await;
                    Input::Stop
                }
                frame = conn.recv() => match frame {
                    Some(Ok(frame)) => Input::Frame(frame),
                    Some(Err(e)) => Input::TransportFailed(e),
                    None => Input::PeerClosed,
                },
                _ = &mut lifetime => {
                    self.drain(&mut conn).await;
                    Input::LifetimeExpired
                }
                _ = tick(&mut send_timer) => {
                    self.drain(&mut conn).await;
                    Input::SendTick
                }
            };
            let actions = self.machine.handle(input, Now::current());
            self.execute(&mut conn, actions).await;
        }

        let outcome = self.outcome();
        tracing::debug!("Session {id} finished as {:?}", outcome.state);
        outcome
    }

    /// Feed every frame the connection can hand over without waiting.
    async fn drain(&mut self, conn: &mut T::Connection) {
        for _ in 0..MAX_DRAIN {
            if self.machine.state() != SessionState::Active {
                return;
            }
            let input = match conn.recv().now_or_never() {
                Some(Some(Ok(frame))) => Input::Frame(frame),
                Some(Some(Err(e))) => Input::TransportFailed(e),
                Some(None) => Input::PeerClosed,
                None => return,
            };
            let actions = self.machine.handle(input, Now::current());
            self.execute(conn, actions).await;
        }
    }

    /// Carry out actions in order. Outcomes of sends and closes are fed back to the
    /// machine, whose follow-up actions replace whatever was still queued.
    async fn execute(&mut self, conn: &mut T::Connection, actions: Vec<Action>) {
        let mut queue = VecDeque::from(actions);
        while let Some(action) = queue.pop_front() {
            match action {
                Action::Record(event) => self.metrics.record(event),
                Action::Send(message) => {
                    if let Err(e) = conn.send(message.to_json()).await {
                        let next = self.machine.handle(Input::TransportFailed(e), Now::current());
                        queue = next.into();
                    }
                }
                Action::Close => {
                    let input = match conn.close().await {
                        Ok(()) => Input::CloseCompleted,
                        Err(e) => Input::TransportFailed(e),
                    };
                    queue.extend(self.machine.handle(input, Now::current()));
                }
                Action::Abort => {
                    let _ = conn.close().await;
                }
            }
        }
    }

    fn record_all(&self, actions: Vec<Action>) {
        for action in actions {
            if let Action::Record(event) = action {
                self.metrics.record(event);
            }
        }
    }

    fn outcome(&self) -> SessionOutcome {
        SessionOutcome {
            id: self.machine.id(),
            state: self.machine.state(),
        }
    }
}

/// Resolves once a stop is requested or the sender is gone.
async fn stopped(stop: &mut Receiver<bool>) {
    let _ = stop.wait_for(|s| *s).await;
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::{sync::watch, task::JoinSet};

    use super::*;
    use crate::{
        error::TransportError,
        metric::names,
        session::{SessionFactory, SessionProfile},
        transport::MemoryHub,
    };

    fn factory(hub: &MemoryHub, profile: SessionProfile) -> SessionFactory<MemoryHub> {
        SessionFactory::new(
            Arc::new(hub.clone()),
            "mem://chat",
            profile,
            Arc::new(Aggregator::new()),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn full_lifecycle_until_lifetime() {
        let hub = MemoryHub::new();
        let f = factory(
            &hub,
            SessionProfile::builder()
                .lifetime(Duration::from_secs(10))
                .send_interval(Duration::from_secs(1))
                .build(),
        );
        let (_tx, rx) = watch::channel(false);

        let outcome = f.session(1).run(rx).await;

        assert_eq!(outcome.state, SessionState::Closed);
        let snap = f.metrics().snapshot();
        assert_eq!(snap.counter(names::WS_SESSIONS), 1);
        assert_eq!(snap.counter(names::WS_CONNECTS), 1);
        assert_eq!(snap.counter(names::WS_DISCONNECTS), 1);
        assert_eq!(snap.counter(names::WS_ERRORS), 0);
        // ticks at 1s..=9s, the 10s tick races the lifetime
        let sent = snap.counter(names::CHAT_MSGS_SENT);
        assert!((9..=10).contains(&sent), "sent {sent}");

        let stats = hub.stats();
        assert_eq!(stats.joins, 1);
        assert_eq!(stats.leaves, 1);
        assert_eq!(stats.active, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_signal_leaves_early() {
        let hub = MemoryHub::new();
        let f = factory(
            &hub,
            SessionProfile::builder()
                .lifetime(Duration::from_secs(3600))
                .build(),
        );
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(f.session(1).run(rx));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(hub.stats().active, 1);
        tx.send(true).unwrap();

        let outcome = task.await.unwrap();
        assert_eq!(outcome.state, SessionState::Closed);
        assert_eq!(hub.stats().leaves, 1);
        assert_eq!(hub.stats().active, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_connect_still_joins_then_leaves() {
        let hub = MemoryHub::new().with_connect_delay(Duration::from_secs(2));
        let f = factory(&hub, SessionProfile::default());
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(f.session(1).run(rx));

        tokio::time::sleep(Duration::from_millis(500)).await;
        tx.send(true).unwrap();

        let outcome = task.await.unwrap();
        assert_eq!(outcome.state, SessionState::Closed);
        let stats = hub.stats();
        assert_eq!((stats.joins, stats.leaves), (1, 1));
        let snap = f.metrics().snapshot();
        assert_eq!(
            snap.counter(names::WS_CONNECTS),
            snap.counter(names::WS_DISCONNECTS)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn refused_connect_is_errored() {
        let hub = MemoryHub::new();
        hub.set_refusing(true);
        let f = factory(&hub, SessionProfile::default());
        let (_tx, rx) = watch::channel(false);

        let outcome = f.session(1).run(rx).await;

        assert_eq!(outcome.state, SessionState::Errored);
        let snap = f.metrics().snapshot();
        assert_eq!(snap.counter(names::WS_ERRORS), 1);
        assert_eq!(snap.counter(names::WS_CONNECTS), 0);
        assert!(snap.trend(names::WS_SESSION_DURATION).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn answers_server_pings() {
        let hub = MemoryHub::new();
        let f = factory(
            &hub,
            SessionProfile::builder()
                .lifetime(Duration::from_secs(5))
                .build(),
        );
        let (_tx, rx) = watch::channel(false);
        let task = tokio::spawn(f.session(1).run(rx));

        tokio::time::sleep(Duration::from_secs(1)).await;
        hub.ping_all(json!(111));
        hub.ping_all(json!(222));

        task.await.unwrap();
        assert_eq!(hub.stats().pongs, 2);
        assert_eq!(f.metrics().snapshot().counter(names::WS_PONGS_SENT), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn ping_at_the_lifetime_instant_is_answered_before_leaving() {
        let hub = MemoryHub::new().with_broadcast(false);
        let f = Arc::new(factory(
            &hub,
            SessionProfile::builder()
                .lifetime(Duration::from_secs(1))
                .build(),
        ));
        let (_tx, rx) = watch::channel(false);
        let start = Instant::now();
        let mut sessions = JoinSet::new();
        for vu in 1..=200 {
            sessions.spawn(f.session(vu).run(rx.clone()));
        }

        sleep_until(start + Duration::from_secs(1)).await;
        hub.ping_all(json!(1));
        let holding = hub.stats().active;
        assert!(holding > 0);

        while let Some(outcome) = sessions.join_next().await {
            assert_eq!(outcome.unwrap().state, SessionState::Closed);
        }
        let stats = hub.stats();
        assert_eq!(stats.pongs, holding);
        assert_eq!(stats.leaves, 200);
        assert_eq!(stats.active, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_mid_session_aborts_without_leave() {
        let hub = MemoryHub::new();
        let f = factory(
            &hub,
            SessionProfile::builder()
                .lifetime(Duration::from_secs(30))
                .build(),
        );
        let (_tx, rx) = watch::channel(false);
        let task = tokio::spawn(f.session(1).run(rx));

        tokio::time::sleep(Duration::from_secs(1)).await;
        hub.fail_all(TransportError::Reset("injected".into()));

        let outcome = task.await.unwrap();
        assert_eq!(outcome.state, SessionState::Errored);
        assert_eq!(hub.stats().leaves, 0);
        assert_eq!(hub.stats().active, 0);
        let snap = f.metrics().snapshot();
        assert_eq!(snap.counter(names::WS_ERRORS), 1);
        assert_eq!(snap.counter(names::WS_DISCONNECTS), 0);
        assert_eq!(snap.trend(names::WS_SESSION_DURATION).map(|t| t.count()), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn peers_receive_each_others_chat() {
        let hub = MemoryHub::new();
        let f = Arc::new(factory(
            &hub,
            SessionProfile::builder()
                .lifetime(Duration::from_millis(3500))
                .send_interval(Duration::from_secs(1))
                .embed_timestamp(true)
                .build(),
        ));
        let (_tx, rx) = watch::channel(false);
        let a = tokio::spawn(f.session(1).run(rx.clone()));
        let b = tokio::spawn(f.session(2).run(rx));
        a.await.unwrap();
        b.await.unwrap();

        let snap = f.metrics().snapshot();
        assert_eq!(snap.counter(names::CHAT_MSGS_SENT), 6);
        assert_eq!(snap.counter(names::CHAT_MSGS_RECEIVED), 6);
        // paused clock: wall clock latency stays tiny, well under the ceiling
        assert_eq!(
            snap.trend(names::MSG_DELIVERY_LATENCY).map(|t| t.count()),
            Some(6)
        );
    }
}
