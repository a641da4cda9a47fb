// ── Shared reconnect state machine ──
//
// Both transports embed one `Link`. It owns the ConnectionState, the
// attempt counter and the config snapshot of the current connection, and
// implements the fixed-delay reconnect policy with observer veto. Wire
// work stays in the transports, which hand in a `retry` callback.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::EventBus;
use crate::config::{ConnectionConfig, SharedConfig};
use crate::event::LifecycleEvent;
use crate::scheduler::Scheduler;
use crate::state::ConnectionState;
use crate::transport::TransportKind;

pub(crate) struct Link {
    kind: TransportKind,
    bus: EventBus,
    scheduler: Scheduler,
    cancel: CancellationToken,
    state: watch::Sender<ConnectionState>,
    config: SharedConfig,
    attempts: AtomicU32,
}

impl Link {
    pub(crate) fn new(
        kind: TransportKind,
        bus: EventBus,
        scheduler: Scheduler,
        config: SharedConfig,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self {
            kind,
            bus,
            cancel: scheduler.child_token(),
            scheduler,
            state,
            config,
            attempts: AtomicU32::new(0),
        })
    }

    // ── Accessors ────────────────────────────────────────────────────

    pub(crate) fn kind(&self) -> TransportKind {
        self.kind
    }

    pub(crate) fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Cancelled when this instance shuts down.
    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub(crate) fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Current tuning. Setters on the controller show up here at once.
    pub(crate) fn config(&self) -> Arc<ConnectionConfig> {
        self.config.load_full()
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Acquire)
    }

    pub(crate) fn emit(&self, event: LifecycleEvent) -> bool {
        self.bus.emit(self.kind, event)
    }

    // ── Transitions ──────────────────────────────────────────────────

    /// Move to `to` if the current state is one of `from`.
    fn transition(&self, from: &[ConnectionState], to: ConnectionState) -> bool {
        self.state.send_if_modified(|current| {
            if from.contains(current) && current.can_transition_to(to) {
                debug!(transport = %self.kind, from = %current, %to, "state transition");
                *current = to;
                true
            } else {
                false
            }
        })
    }

    /// Explicit connect: `Disconnected → Connecting` with a fresh counter.
    pub(crate) fn begin_connect(&self) -> bool {
        if !self.transition(&[ConnectionState::Disconnected], ConnectionState::Connecting) {
            debug!(transport = %self.kind, state = %self.state(), "connect ignored");
            return false;
        }
        self.attempts.store(0, Ordering::Release);
        true
    }

    /// Timer fired: `ReconnectScheduled → Connecting`.
    fn begin_retry(&self) -> bool {
        self.transition(
            &[ConnectionState::ReconnectScheduled],
            ConnectionState::Connecting,
        )
    }

    /// Link is up: reset the counter and announce it.
    pub(crate) fn mark_connected(&self, endpoint: &str) -> bool {
        if !self.transition(&[ConnectionState::Connecting], ConnectionState::Connected) {
            return false;
        }
        let previous_attempts = self.attempts.swap(0, Ordering::AcqRel);

        info!(transport = %self.kind, endpoint, "link established");
        self.emit(LifecycleEvent::ConnectionEstablished {
            endpoint: endpoint.to_owned(),
            is_reconnect: previous_attempts > 0,
        });
        true
    }

    /// The link dropped or never came up. Moves to `Disconnected` and runs
    /// the reconnect policy; `retry` is invoked when the timer fires.
    pub(crate) fn connection_lost<F>(self: &Arc<Self>, reason: &str, retry: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.transition(
            &[ConnectionState::Connecting, ConnectionState::Connected],
            ConnectionState::Disconnected,
        ) {
            debug!(transport = %self.kind, reason, "loss reported outside an active link");
            return;
        }

        let attempt = self.attempts();
        warn!(transport = %self.kind, reason, attempt, "link lost");
        self.emit(LifecycleEvent::ConnectionLost {
            reason: reason.to_owned(),
            attempt,
        });

        self.schedule_reconnect(retry);
    }

    fn schedule_reconnect<F>(self: &Arc<Self>, retry: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let attempts = self.attempts();
        let config = self.config();
        let max_attempts = config.max_reconnect_attempts;
        let delay = config.reconnect_interval;

        if attempts >= max_attempts {
            error!(
                transport = %self.kind,
                attempts,
                max_attempts,
                "reconnect attempts exhausted, giving up"
            );
            self.emit(LifecycleEvent::ReconnectExhausted {
                attempts,
                max_attempts,
            });
            return;
        }

        let attempt = attempts + 1;
        let allowed = self.emit(LifecycleEvent::ReconnectAttempted {
            attempt,
            max_attempts,
            delay,
        });
        if !allowed {
            info!(transport = %self.kind, attempt, "reconnect vetoed by observer");
            return;
        }

        if !self.transition(
            &[ConnectionState::Disconnected],
            ConnectionState::ReconnectScheduled,
        ) {
            return;
        }
        self.attempts.store(attempt, Ordering::Release);

        info!(
            transport = %self.kind,
            attempt,
            max_attempts,
            delay_secs = delay.as_secs_f64(),
            "reconnect scheduled"
        );

        let link = Arc::clone(self);
        let scheduled = self
            .scheduler
            .schedule(delay, self.cancel.clone(), move || {
                if link.begin_retry() {
                    retry();
                }
            });
        if !scheduled {
            debug!(transport = %self.kind, "scheduler closed, reconnect dropped");
        }
    }

    /// Enter the terminal state and stop every task of this instance.
    /// With `announce`, a `ShutdownNotified` event reports it. Returns
    /// `false` if it was already shutting down.
    pub(crate) fn shutdown(&self, reason: &str, announce: bool) -> bool {
        let entered = self.state.send_if_modified(|current| {
            if current.is_terminal() {
                false
            } else {
                *current = ConnectionState::ShuttingDown;
                true
            }
        });
        if !entered {
            return false;
        }
        self.cancel.cancel();

        info!(transport = %self.kind, reason, "link shut down");
        if announce {
            self.emit(LifecycleEvent::ShutdownNotified {
                reason: reason.to_owned(),
                graceful: true,
            });
        }
        true
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use arc_swap::ArcSwap;

    use super::*;
    use crate::event::{Event, Verdict};

    struct Harness {
        link: Arc<Link>,
        config: SharedConfig,
        events: Arc<Mutex<Vec<LifecycleEvent>>>,
        dials: Arc<AtomicU32>,
    }

    impl Harness {
        fn retune(&self, interval: Duration, max: u32) {
            self.config.store(Arc::new(ConnectionConfig {
                reconnect_interval: interval,
                max_reconnect_attempts: max,
                heartbeat_timeout: Duration::from_secs(20),
            }));
        }
    }

    fn harness(max: u32) -> Harness {
        let bus = EventBus::new("srv-1");
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        bus.register_fn(move |event: &Event| {
            sink.lock().unwrap().push(event.kind.clone());
            Verdict::Allow
        });
        let config: SharedConfig = Arc::new(ArcSwap::from_pointee(ConnectionConfig {
            reconnect_interval: Duration::from_secs(30),
            max_reconnect_attempts: max,
            heartbeat_timeout: Duration::from_secs(20),
        }));
        Harness {
            link: Link::new(TransportKind::Stream, bus, Scheduler::new(), Arc::clone(&config)),
            config,
            events,
            dials: Arc::new(AtomicU32::new(0)),
        }
    }

    /// A dial that always fails.
    fn fail_forever(link: Arc<Link>, dials: Arc<AtomicU32>) -> Box<dyn FnOnce() + Send> {
        Box::new(move || {
            dials.fetch_add(1, Ordering::SeqCst);
            let next = fail_forever(Arc::clone(&link), Arc::clone(&dials));
            link.connection_lost("connection refused", next);
        })
    }

    fn count(events: &[LifecycleEvent], name: &str) -> usize {
        events.iter().filter(|e| e.name() == name).count()
    }

    #[tokio::test(start_paused = true)]
    async fn five_failures_exhaust_the_cap() {
        let h = harness(5);
        assert!(h.link.begin_connect());
        h.link.connection_lost(
            "connection refused",
            fail_forever(Arc::clone(&h.link), Arc::clone(&h.dials)),
        );

        tokio::time::sleep(Duration::from_secs(30 * 10)).await;

        let events = h.events.lock().unwrap().clone();
        assert_eq!(count(&events, "reconnect_attempted"), 5);
        assert_eq!(count(&events, "reconnect_exhausted"), 1);
        assert_eq!(h.dials.load(Ordering::SeqCst), 5);
        assert_eq!(h.link.state(), ConnectionState::Disconnected);
        assert!(matches!(
            events.last(),
            Some(LifecycleEvent::ReconnectExhausted {
                attempts: 5,
                max_attempts: 5
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_are_numbered_and_delay_is_fixed() {
        let h = harness(3);
        h.link.begin_connect();
        h.link.connection_lost(
            "reset",
            fail_forever(Arc::clone(&h.link), Arc::clone(&h.dials)),
        );
        tokio::time::sleep(Duration::from_secs(600)).await;

        let attempts: Vec<(u32, Duration)> = h
            .events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                LifecycleEvent::ReconnectAttempted { attempt, delay, .. } => Some((*attempt, *delay)),
                _ => None,
            })
            .collect();
        let thirty = Duration::from_secs(30);
        assert_eq!(attempts, vec![(1, thirty), (2, thirty), (3, thirty)]);
    }

    #[tokio::test(start_paused = true)]
    async fn retuning_reaches_the_next_loss() {
        let h = harness(5);
        assert!(h.link.begin_connect());
        assert!(h.link.mark_connected("ws://backend"));

        h.retune(Duration::from_secs(5), 1);
        h.link.connection_lost(
            "reset",
            fail_forever(Arc::clone(&h.link), Arc::clone(&h.dials)),
        );
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(h.dials.load(Ordering::SeqCst), 1);
        let events = h.events.lock().unwrap().clone();
        assert!(events.contains(&LifecycleEvent::ReconnectAttempted {
            attempt: 1,
            max_attempts: 1,
            delay: Duration::from_secs(5),
        }));
        assert_eq!(count(&events, "reconnect_exhausted"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pending_retry_keeps_its_delay() {
        let h = harness(5);
        h.link.begin_connect();
        h.link.connection_lost(
            "reset",
            fail_forever(Arc::clone(&h.link), Arc::clone(&h.dials)),
        );
        assert_eq!(h.link.state(), ConnectionState::ReconnectScheduled);

        h.retune(Duration::from_secs(5), 5);
        tokio::time::sleep(Duration::from_secs(29)).await;
        assert_eq!(h.dials.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(h.dials.load(Ordering::SeqCst), 1);
        let delays: Vec<Duration> = h
            .events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                LifecycleEvent::ReconnectAttempted { delay, .. } => Some(*delay),
                _ => None,
            })
            .collect();
        assert_eq!(delays, vec![Duration::from_secs(30), Duration::from_secs(5)]);
    }

    #[tokio::test(start_paused = true)]
    async fn veto_leaves_link_disconnected() {
        let h = harness(5);
        h.link.bus.register_fn(|event: &Event| {
            if event.kind.is_cancellable() {
                Verdict::Veto
            } else {
                Verdict::Allow
            }
        });

        h.link.begin_connect();
        h.link.connection_lost(
            "reset",
            fail_forever(Arc::clone(&h.link), Arc::clone(&h.dials)),
        );
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(h.link.state(), ConnectionState::Disconnected);
        assert_eq!(h.link.attempts(), 0);
        assert_eq!(h.dials.load(Ordering::SeqCst), 0);
        let events = h.events.lock().unwrap().clone();
        assert_eq!(count(&events, "reconnect_attempted"), 1);
        assert_eq!(count(&events, "reconnect_exhausted"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_the_counter() {
        let h = harness(5);
        h.link.begin_connect();

        let link = Arc::clone(&h.link);
        h.link.connection_lost("reset", move || {
            link.mark_connected("ws://backend");
        });
        tokio::time::sleep(Duration::from_secs(31)).await;

        assert_eq!(h.link.state(), ConnectionState::Connected);
        assert_eq!(h.link.attempts(), 0);
        let events = h.events.lock().unwrap().clone();
        assert!(events.contains(&LifecycleEvent::ConnectionEstablished {
            endpoint: "ws://backend".into(),
            is_reconnect: true,
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_connect_after_exhaustion_starts_over() {
        let h = harness(1);
        h.link.begin_connect();
        h.link.connection_lost(
            "reset",
            fail_forever(Arc::clone(&h.link), Arc::clone(&h.dials)),
        );
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(h.link.attempts(), 1);

        assert!(h.link.begin_connect());
        assert_eq!(h.link.attempts(), 0);
        assert_eq!(h.link.state(), ConnectionState::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_is_ignored_while_active() {
        let h = harness(5);
        assert!(h.link.begin_connect());
        assert!(!h.link.begin_connect());
        assert!(h.link.mark_connected("ws://backend"));
        assert!(!h.link.begin_connect());

        let events = h.events.lock().unwrap().clone();
        assert_eq!(count(&events, "connection_established"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_pending_retry() {
        let h = harness(5);
        h.link.begin_connect();
        h.link.connection_lost(
            "reset",
            fail_forever(Arc::clone(&h.link), Arc::clone(&h.dials)),
        );
        assert_eq!(h.link.state(), ConnectionState::ReconnectScheduled);

        assert!(h.link.shutdown("Manual disconnect", true));
        assert!(!h.link.shutdown("Manual disconnect", true));
        assert_eq!(count(&h.events.lock().unwrap(), "shutdown_notified"), 1);
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(h.dials.load(Ordering::SeqCst), 0);
        assert_eq!(h.link.state(), ConnectionState::ShuttingDown);
        assert!(!h.link.begin_connect());
    }

    #[tokio::test(start_paused = true)]
    async fn loss_after_shutdown_is_ignored() {
        let h = harness(5);
        h.link.begin_connect();
        h.link.shutdown("Manual disconnect", true);
        h.link.connection_lost(
            "reset",
            fail_forever(Arc::clone(&h.link), Arc::clone(&h.dials)),
        );

        let events = h.events.lock().unwrap().clone();
        assert_eq!(count(&events, "connection_lost"), 0);
        assert_eq!(count(&events, "reconnect_attempted"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_shutdown_emits_nothing() {
        let h = harness(5);
        h.link.begin_connect();
        assert!(h.link.shutdown("Server shutdown", false));

        assert_eq!(h.link.state(), ConnectionState::ShuttingDown);
        assert_eq!(count(&h.events.lock().unwrap(), "shutdown_notified"), 0);
    }
}
