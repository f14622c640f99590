//! Identity-bound connection manager.
//!
//! [`ConnectionManager`] owns the single transport, the bound identity, the
//! connection state machine and the retry timer. Every transition (API
//! calls, transport callbacks and timer firings) runs under one lock, so no
//! two transitions interleave.
//!
//! Events produced by transitions are appended to an outbox under that same
//! lock and delivered in outbox order by whichever caller finds no delivery
//! in progress. Handlers therefore see events in transition order, run
//! without the lock held, and may call back into the manager; events caused
//! by such a call are delivered after the current handler returns.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::config::{EndpointConfig, SessionConfig};
use crate::error::TransportError;
use crate::events::ConnectionEvent;
use crate::handlers::HandlerRegistry;
use crate::reconnect::{ReconnectScheduler, RetryTarget};
use crate::state::{ConnectionState, ConnectionStatus, Identity};
use crate::transport::{
    CLOSE_NORMAL, CloseInfo, Connector, Transport, TransportEvent, TransportEventSink,
    TransportEvents,
};
use crate::ws::WsConnector;

/// Close reason sent on an explicit disconnect.
pub const DISCONNECT_REASON: &str = "client disconnect";
/// Close reason sent when a new identity replaces the bound one.
pub const IDENTITY_CHANGED_REASON: &str = "identity changed";
/// Close reason sent when a pending connection is replaced for the same identity.
pub const SUPERSEDED_REASON: &str = "superseded";

/// Cloneable handle to the process-wide session.
///
/// Build one at startup and pass clones to whatever needs the connection.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

struct Shared {
    endpoint: EndpointConfig,
    connector: Arc<dyn Connector>,
    handlers: HandlerRegistry,
    inner: Mutex<Inner>,
    this: Weak<Shared>,
}

struct Inner {
    state: ConnectionState,
    identity: Option<Identity>,
    transport: Option<Box<dyn Transport>>,
    /// Bumped for every transport; events from older ones are dropped.
    generation: u64,
    scheduler: ReconnectScheduler,
    /// Events waiting for delivery, in transition order.
    outbox: VecDeque<ConnectionEvent>,
    /// Set while some caller is draining `outbox`.
    delivering: bool,
}

impl ConnectionManager {
    /// Create a manager that opens transports through `connector`.
    #[must_use]
    pub fn new(config: &SessionConfig, connector: Arc<dyn Connector>) -> Self {
        let shared = Arc::new_cyclic(|this| Shared {
            endpoint: config.endpoint.clone(),
            connector,
            handlers: HandlerRegistry::new(),
            inner: Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                identity: None,
                transport: None,
                generation: 0,
                scheduler: ReconnectScheduler::new(config.reconnect.clone()),
                outbox: VecDeque::new(),
                delivering: false,
            }),
            this: this.clone(),
        });
        Self { shared }
    }

    /// Create a manager backed by WebSocket transports.
    #[must_use]
    pub fn with_websocket(config: &SessionConfig) -> Self {
        let connector = WsConnector::new().with_close_timeout(config.endpoint.close_timeout());
        Self::new(config, Arc::new(connector))
    }

    /// Registered event handlers.
    #[must_use]
    pub fn handlers(&self) -> &HandlerRegistry {
        &self.shared.handlers
    }

    /// Bind `identity` and open a connection for it.
    ///
    /// Never fails: an empty identity is ignored with a warning, and a
    /// transport that cannot be constructed is retried in the background.
    /// Calling this while already connected for the same identity does
    /// nothing.
    pub fn connect(&self, identity: &str) {
        let Ok(identity) = Identity::new(identity) else {
            warn!("connect called without an identity, ignoring");
            return;
        };
        let mut inner = self.shared.inner.lock();
        let events = self.shared.open(&mut inner, identity, true);
        self.shared.deliver(inner, events);
    }

    /// Close the connection, cancel any pending retry and unbind the identity.
    ///
    /// Safe to call when nothing is connected.
    pub fn disconnect(&self) {
        let mut inner = self.shared.inner.lock();
        inner.scheduler.cancel();
        inner.scheduler.reset();

        let closed = inner.transport.take().map(|mut transport| {
            transport.close(CLOSE_NORMAL, DISCONNECT_REASON);
            ConnectionEvent::Disconnected(CloseInfo::normal(DISCONNECT_REASON))
        });

        if let Some(identity) = inner.identity.take() {
            info!(identity = %identity, "session disconnected");
        }
        inner.state = ConnectionState::Disconnected;
        self.shared.deliver(inner, closed);
    }

    /// Disconnect because the bound identity itself is no longer valid.
    pub fn logout(&self) {
        info!("logging out, closing session");
        self.disconnect();
    }

    /// Serialize `message` as JSON and send it.
    ///
    /// Returns `false` when not connected or when serialization or the send
    /// fails; the failure is logged, never returned.
    pub fn send_message<T: Serialize + ?Sized>(&self, message: &T) -> bool {
        match serde_json::to_string(message) {
            Ok(text) => self.send_text(&text),
            Err(e) => {
                warn!(error = %e, "failed to serialize outbound message");
                false
            }
        }
    }

    /// Send an already serialized JSON frame. Same rules as [`Self::send_message`].
    pub fn send_text(&self, text: &str) -> bool {
        let mut inner = self.shared.inner.lock();
        if inner.state != ConnectionState::Connected {
            warn!(state = %inner.state, "session not connected, dropping outbound message");
            return false;
        }
        let Some(transport) = inner.transport.as_mut() else {
            return false;
        };
        match transport.send(text) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "failed to send message");
                false
            }
        }
    }

    /// Snapshot of state, identity and attempt count.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        let inner = self.shared.inner.lock();
        ConnectionStatus {
            state: inner.state,
            identity: inner.identity.clone(),
            attempt_count: inner.scheduler.attempts(),
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.inner.lock().state
    }

    /// Bound identity, if any.
    #[must_use]
    pub fn identity(&self) -> Option<Identity> {
        self.shared.inner.lock().identity.clone()
    }

    /// Consecutive reconnect attempts for the bound identity.
    #[must_use]
    pub fn attempt_count(&self) -> u32 {
        self.shared.inner.lock().scheduler.attempts()
    }

    /// Whether the transport is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Whether a reconnect timer is armed.
    #[must_use]
    pub fn has_pending_retry(&self) -> bool {
        self.shared.inner.lock().scheduler.has_pending()
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = self.status();
        f.debug_struct("ConnectionManager")
            .field("state", &status.state)
            .field("identity", &status.identity)
            .field("attempt_count", &status.attempt_count)
            .finish_non_exhaustive()
    }
}

impl Shared {
    /// Open a transport for `identity`. `explicit` is false for timer retries,
    /// which keep the attempt counter.
    fn open(&self, inner: &mut Inner, identity: Identity, explicit: bool) -> Vec<ConnectionEvent> {
        if inner.state == ConnectionState::Connected
            && inner.transport.is_some()
            && inner.identity.as_ref() == Some(&identity)
        {
            debug!(identity = %identity, "already connected, skipping connect");
            return Vec::new();
        }

        inner.scheduler.cancel();
        if explicit {
            inner.scheduler.reset();
        }

        if let Some(mut old) = inner.transport.take() {
            let reason = if inner.identity.as_ref() == Some(&identity) {
                SUPERSEDED_REASON
            } else {
                IDENTITY_CHANGED_REASON
            };
            info!(
                old_identity = ?inner.identity.as_ref().map(Identity::as_str),
                identity = %identity,
                reason,
                "closing existing transport"
            );
            old.close(CLOSE_NORMAL, reason);
        }

        inner.identity = Some(identity.clone());
        inner.state = ConnectionState::Connecting;
        inner.generation += 1;
        let generation = inner.generation;

        let opened = self
            .endpoint
            .url_for(&identity)
            .map_err(|e| TransportError::Construction(e.to_string()))
            .and_then(|url| {
                info!(identity = %identity, generation, url = %url, "opening session transport");
                let sink: Weak<dyn TransportEventSink> = self.this.clone();
                self.connector
                    .open(&url, TransportEvents::new(generation, sink))
            });

        match opened {
            Ok(transport) => {
                inner.transport = Some(transport);
                Vec::new()
            }
            Err(e) => {
                error!(identity = %identity, error = %e, "failed to create transport");
                inner.state = ConnectionState::Disconnected;
                // Construction failures keep retrying at the capped delay;
                // only unexpected closes spend the attempt budget.
                self.schedule_retry(inner, false);
                vec![ConnectionEvent::Error(e)]
            }
        }
    }

    /// Arm a retry for the bound identity. With `capped`, nothing is armed
    /// once the attempt budget is spent.
    fn schedule_retry(&self, inner: &mut Inner, capped: bool) {
        let Some(identity) = inner.identity.clone() else {
            return;
        };

        if capped && inner.scheduler.exhausted() {
            warn!(
                identity = %identity,
                attempts = inner.scheduler.attempts(),
                "maximum reconnect attempts reached, giving up"
            );
            return;
        }

        let target: Weak<dyn RetryTarget> = self.this.clone();
        if let Some(delay) = inner.scheduler.schedule(identity.clone(), target) {
            info!(
                identity = %identity,
                attempt = inner.scheduler.attempts(),
                max_attempts = inner.scheduler.config().max_attempts,
                delay_ms = delay.as_millis() as u64,
                "reconnect scheduled"
            );
        }
    }

    /// Queue `events` and, unless another caller is already delivering,
    /// drain the outbox to the handlers with the lock released per event.
    fn deliver(
        &self,
        mut inner: MutexGuard<'_, Inner>,
        events: impl IntoIterator<Item = ConnectionEvent>,
    ) {
        inner.outbox.extend(events);
        if inner.delivering {
            return;
        }

        inner.delivering = true;
        while let Some(event) = inner.outbox.pop_front() {
            MutexGuard::unlocked(&mut inner, || {
                self.handlers.notify(&event);
            });
        }
        inner.delivering = false;
    }
}

impl TransportEventSink for Shared {
    fn on_transport_event(&self, generation: u64, event: TransportEvent) {
        let mut inner = self.inner.lock();
        if generation != inner.generation || inner.transport.is_none() {
            debug!(generation, current = inner.generation, "ignoring event from stale transport");
            return;
        }

        let events = match event {
            TransportEvent::Open => {
                inner.state = ConnectionState::Connected;
                inner.scheduler.reset();
                info!(identity = ?inner.identity.as_ref().map(Identity::as_str), generation, "session connected");
                vec![ConnectionEvent::Connected]
            }
            TransportEvent::Message(raw) => match serde_json::from_str::<Value>(&raw) {
                Ok(value) => vec![ConnectionEvent::Message(value)],
                Err(e) => {
                    warn!(error = %e, len = raw.len(), "dropping unparseable message");
                    Vec::new()
                }
            },
            TransportEvent::Close(info) => {
                inner.transport = None;
                inner.state = ConnectionState::Disconnected;
                info!(
                    code = info.code,
                    reason = %info.reason,
                    was_clean = info.was_clean,
                    "session transport closed"
                );
                self.schedule_retry(&mut inner, true);
                vec![ConnectionEvent::Disconnected(info)]
            }
            TransportEvent::Error(err) => {
                warn!(error = %err, "session transport error");
                vec![ConnectionEvent::Error(err)]
            }
        };
        self.deliver(inner, events);
    }
}

impl RetryTarget for Shared {
    fn retry_due(&self, token: u64, identity: Identity) {
        let mut inner = self.inner.lock();
        if !inner.scheduler.fire(token) {
            debug!(identity = %identity, "ignoring cancelled retry");
            return;
        }
        if inner.identity.as_ref() != Some(&identity) {
            debug!(identity = %identity, "identity changed since retry was scheduled, ignoring");
            return;
        }
        info!(identity = %identity, attempt = inner.scheduler.attempts(), "reconnecting");
        let events = self.open(&mut inner, identity, false);
        self.deliver(inner, events);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::sleep;
    use url::Url;

    use crate::handlers::ConnectionHandler;

    #[derive(Default)]
    struct TransportLog {
        sent: Vec<String>,
        closed: Option<(u16, String)>,
        fail_send: bool,
    }

    struct MockTransport {
        log: Arc<Mutex<TransportLog>>,
    }

    impl Transport for MockTransport {
        fn send(&mut self, text: &str) -> Result<(), TransportError> {
            let mut log = self.log.lock();
            if log.fail_send {
                return Err(TransportError::Send("socket gone".to_string()));
            }
            log.sent.push(text.to_string());
            Ok(())
        }

        fn close(&mut self, code: u16, reason: &str) {
            self.log.lock().closed = Some((code, reason.to_string()));
        }
    }

    struct Opened {
        url: Url,
        events: TransportEvents,
        log: Arc<Mutex<TransportLog>>,
    }

    #[derive(Default)]
    struct MockConnector {
        opened: Mutex<Vec<Opened>>,
        failures_left: AtomicUsize,
    }

    impl MockConnector {
        fn count(&self) -> usize {
            self.opened.lock().len()
        }

        fn events(&self, index: usize) -> TransportEvents {
            self.opened.lock()[index].events.clone()
        }

        fn last_events(&self) -> TransportEvents {
            let opened = self.opened.lock();
            opened[opened.len() - 1].events.clone()
        }

        fn url(&self, index: usize) -> String {
            self.opened.lock()[index].url.to_string()
        }

        fn log(&self, index: usize) -> Arc<Mutex<TransportLog>> {
            Arc::clone(&self.opened.lock()[index].log)
        }
    }

    impl Connector for MockConnector {
        fn open(
            &self,
            url: &Url,
            events: TransportEvents,
        ) -> Result<Box<dyn Transport>, TransportError> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(TransportError::Construction("refused".to_string()));
            }
            let log = Arc::new(Mutex::new(TransportLog::default()));
            self.opened.lock().push(Opened {
                url: url.clone(),
                events,
                log: Arc::clone(&log),
            });
            Ok(Box::new(MockTransport { log }))
        }
    }

    #[derive(Default)]
    struct EventLog {
        events: Mutex<Vec<ConnectionEvent>>,
    }

    impl ConnectionHandler for EventLog {
        fn handle(&self, event: &ConnectionEvent) -> anyhow::Result<()> {
            self.events.lock().push(event.clone());
            Ok(())
        }
    }

    impl EventLog {
        fn kinds(&self) -> Vec<&'static str> {
            self.events.lock().iter().map(ConnectionEvent::kind).collect()
        }
    }

    fn setup() -> (ConnectionManager, Arc<MockConnector>, Arc<EventLog>) {
        let connector = Arc::new(MockConnector::default());
        let manager = ConnectionManager::new(&SessionConfig::default(), connector.clone());
        let log = Arc::new(EventLog::default());
        manager.handlers().add(log.clone());
        (manager, connector, log)
    }

    fn id(value: &str) -> Identity {
        Identity::new(value).unwrap()
    }

    fn dropped() -> CloseInfo {
        CloseInfo {
            code: 1006,
            reason: String::new(),
            was_clean: false,
        }
    }

    #[test]
    fn test_initial_status() {
        let (manager, connector, _) = setup();
        assert_eq!(
            manager.status(),
            ConnectionStatus {
                state: ConnectionState::Disconnected,
                identity: None,
                attempt_count: 0,
            }
        );
        assert_eq!(connector.count(), 0);
    }

    #[test]
    fn test_connect_with_empty_identity_is_noop() {
        let (manager, connector, log) = setup();
        manager.connect("");
        manager.connect("   ");

        assert_eq!(connector.count(), 0);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(log.kinds().is_empty());
    }

    #[test]
    fn test_connect_then_open() {
        let (manager, connector, log) = setup();

        manager.connect("u1");
        assert_eq!(manager.state(), ConnectionState::Connecting);
        assert_eq!(connector.url(0), "ws://localhost:8080/ws/chat/u1");

        connector.events(0).opened();

        assert_eq!(
            manager.status(),
            ConnectionStatus {
                state: ConnectionState::Connected,
                identity: Some(id("u1")),
                attempt_count: 0,
            }
        );
        assert_eq!(log.kinds(), vec!["connected"]);
    }

    #[test]
    fn test_connect_same_identity_while_connected_is_noop() {
        let (manager, connector, _) = setup();
        manager.connect("u1");
        connector.events(0).opened();

        manager.connect("u1");

        assert_eq!(connector.count(), 1);
        assert!(connector.log(0).lock().closed.is_none());
        assert_eq!(manager.attempt_count(), 0);
        assert!(manager.is_connected());
    }

    #[test]
    fn test_connect_same_identity_while_connecting_supersedes() {
        let (manager, connector, log) = setup();
        manager.connect("u1");
        manager.connect("u1");

        assert_eq!(connector.count(), 2);
        assert_eq!(
            connector.log(0).lock().closed,
            Some((CLOSE_NORMAL, SUPERSEDED_REASON.to_string()))
        );

        // The replaced transport's late events are ignored.
        connector.events(0).opened();
        assert_eq!(manager.state(), ConnectionState::Connecting);
        assert!(log.kinds().is_empty());
    }

    #[test]
    fn test_identity_change_closes_old_transport_first() {
        let (manager, connector, log) = setup();
        manager.connect("idA");
        connector.events(0).opened();

        manager.connect("idB");

        assert_eq!(connector.count(), 2);
        assert_eq!(
            connector.log(0).lock().closed,
            Some((CLOSE_NORMAL, IDENTITY_CHANGED_REASON.to_string()))
        );
        assert_eq!(connector.url(1), "ws://localhost:8080/ws/chat/idB");

        // Old transport reports its close; it must not disturb idB.
        connector.events(0).closed(CloseInfo::normal(IDENTITY_CHANGED_REASON));
        connector.events(1).opened();

        let status = manager.status();
        assert_eq!(status.identity, Some(id("idB")));
        assert_eq!(status.state, ConnectionState::Connected);
        assert!(!manager.has_pending_retry());
        assert_eq!(log.kinds(), vec!["connected", "connected"]);
    }

    #[test]
    fn test_inbound_message_is_parsed() {
        let (manager, connector, log) = setup();
        manager.connect("u1");
        let events = connector.events(0);
        events.opened();

        events.message(r#"{"type":"chat","text":"hello"}"#);

        let recorded = log.events.lock().clone();
        assert_eq!(
            recorded.last(),
            Some(&ConnectionEvent::Message(serde_json::json!({
                "type": "chat",
                "text": "hello"
            })))
        );
    }

    #[test]
    fn test_unparseable_message_is_dropped() {
        let (manager, connector, log) = setup();
        manager.connect("u1");
        let events = connector.events(0);
        events.opened();

        events.message("not json {");

        assert_eq!(log.kinds(), vec!["connected"]);
        assert!(manager.is_connected());
    }

    #[test]
    fn test_transport_error_notifies_without_state_change() {
        let (manager, connector, log) = setup();
        manager.connect("u1");
        connector.events(0).opened();

        connector
            .events(0)
            .error(TransportError::Protocol("reset by peer".to_string()));

        assert_eq!(log.kinds(), vec!["connected", "error"]);
        assert!(manager.is_connected());
        assert!(!manager.has_pending_retry());
    }

    #[test]
    fn test_send_message_when_disconnected() {
        let (manager, connector, _) = setup();
        assert!(!manager.send_message(&serde_json::json!({"a": 1})));

        manager.connect("u1");
        // Still connecting.
        assert!(!manager.send_message(&serde_json::json!({"a": 1})));
        assert!(connector.log(0).lock().sent.is_empty());
    }

    #[test]
    fn test_send_message_when_connected() {
        let (manager, connector, _) = setup();
        manager.connect("u1");
        connector.events(0).opened();

        assert!(manager.send_message(&serde_json::json!({"type": "ping"})));
        assert!(manager.send_text(r#"{"type":"pong"}"#));

        assert_eq!(
            connector.log(0).lock().sent,
            vec![
                r#"{"type":"ping"}"#.to_string(),
                r#"{"type":"pong"}"#.to_string()
            ]
        );
    }

    #[test]
    fn test_send_failure_returns_false() {
        let (manager, connector, _) = setup();
        manager.connect("u1");
        connector.events(0).opened();
        connector.log(0).lock().fail_send = true;

        assert!(!manager.send_message(&serde_json::json!({"type": "ping"})));
    }

    #[test]
    fn test_unserializable_message_returns_false() {
        use std::collections::HashMap;

        let (manager, connector, _) = setup();
        manager.connect("u1");
        connector.events(0).opened();

        // JSON object keys must be strings.
        let mut bad = HashMap::new();
        bad.insert((1, 2), "value");
        assert!(!manager.send_message(&bad));
        assert!(connector.log(0).lock().sent.is_empty());
    }

    #[test]
    fn test_disconnect_when_idle_is_noop() {
        let (manager, _, log) = setup();
        manager.disconnect();
        manager.logout();
        assert!(log.kinds().is_empty());
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_disconnect_closes_and_resets() {
        let (manager, connector, log) = setup();
        manager.connect("u1");
        connector.events(0).opened();

        manager.disconnect();

        assert_eq!(
            connector.log(0).lock().closed,
            Some((CLOSE_NORMAL, DISCONNECT_REASON.to_string()))
        );
        assert_eq!(
            manager.status(),
            ConnectionStatus {
                state: ConnectionState::Disconnected,
                identity: None,
                attempt_count: 0,
            }
        );
        assert_eq!(
            log.events.lock().last(),
            Some(&ConnectionEvent::Disconnected(CloseInfo::normal(
                DISCONNECT_REASON
            )))
        );

        // The transport's own close callback arrives later and is ignored.
        connector.events(0).closed(CloseInfo::normal(DISCONNECT_REASON));
        assert_eq!(log.kinds(), vec!["connected", "disconnected"]);
        assert!(!manager.has_pending_retry());
    }

    #[test]
    fn test_failing_handler_does_not_starve_others() {
        let (manager, connector, log) = setup();
        manager
            .handlers()
            .add(Arc::new(|_: &ConnectionEvent| -> anyhow::Result<()> {
                anyhow::bail!("observer failed")
            }));
        manager
            .handlers()
            .add(Arc::new(|_: &ConnectionEvent| -> anyhow::Result<()> {
                panic!("observer panicked")
            }));

        manager.connect("u1");
        connector.events(0).opened();

        assert_eq!(log.kinds(), vec!["connected"]);
        assert!(manager.is_connected());
    }

    #[test]
    fn test_handler_may_send_from_connected_callback() {
        let (manager, connector, _) = setup();
        let handle = manager.clone();
        manager
            .handlers()
            .add(Arc::new(move |event: &ConnectionEvent| -> anyhow::Result<()> {
                if matches!(event, ConnectionEvent::Connected) {
                    handle.send_message(&serde_json::json!({"type": "hello"}));
                }
                Ok(())
            }));

        manager.connect("u1");
        connector.events(0).opened();

        assert_eq!(connector.log(0).lock().sent, vec![r#"{"type":"hello"}"#]);
    }

    #[test]
    fn test_events_caused_by_handlers_arrive_in_order() {
        let (manager, connector, _) = setup();

        // First handler reacts to Connected by disconnecting.
        let handle = manager.clone();
        manager
            .handlers()
            .add(Arc::new(move |event: &ConnectionEvent| -> anyhow::Result<()> {
                if matches!(event, ConnectionEvent::Connected) {
                    handle.disconnect();
                }
                Ok(())
            }));
        let late = Arc::new(EventLog::default());
        manager.handlers().add(late.clone());

        manager.connect("u1");
        connector.events(0).opened();

        // Every handler sees Connected before the Disconnected it caused.
        assert_eq!(late.kinds(), vec!["connected", "disconnected"]);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_events_from_other_threads_keep_transition_order() {
        let (manager, connector, log) = setup();
        manager.connect("u1");
        let events = connector.events(0);
        events.opened();

        let threads: Vec<_> = (0..4)
            .map(|n| {
                let events = events.clone();
                std::thread::spawn(move || {
                    for i in 0..25 {
                        events.message(format!(r#"{{"thread":{n},"seq":{i}}}"#));
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        let recorded = log.events.lock().clone();
        assert_eq!(recorded.len(), 101);
        // Per sender, messages arrive in the order they were produced.
        for n in 0..4 {
            let seqs: Vec<i64> = recorded
                .iter()
                .filter_map(|event| match event {
                    ConnectionEvent::Message(value) if value["thread"] == n => {
                        value["seq"].as_i64()
                    }
                    _ => None,
                })
                .collect();
            assert_eq!(seqs, (0..25).collect::<Vec<i64>>());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_close_schedules_retry() {
        let (manager, connector, log) = setup();
        manager.connect("u1");

        connector.events(0).closed(dropped());

        assert_eq!(
            manager.status(),
            ConnectionStatus {
                state: ConnectionState::Disconnected,
                identity: Some(id("u1")),
                attempt_count: 1,
            }
        );
        assert!(manager.has_pending_retry());
        assert_eq!(
            log.events.lock().last(),
            Some(&ConnectionEvent::Disconnected(dropped()))
        );

        sleep(Duration::from_millis(999)).await;
        assert_eq!(connector.count(), 1);

        sleep(Duration::from_millis(2)).await;
        assert_eq!(connector.count(), 2);
        assert_eq!(manager.state(), ConnectionState::Connecting);
        assert_eq!(manager.attempt_count(), 1);
        assert!(!manager.has_pending_retry());

        connector.events(1).opened();
        assert_eq!(manager.attempt_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_stop_after_max_attempts() {
        let (manager, connector, _) = setup();
        manager.connect("u1");

        let expected = [1, 2, 4, 8, 16];
        for (attempt, secs) in expected.iter().enumerate() {
            connector.last_events().closed(dropped());
            assert!(manager.has_pending_retry());
            assert_eq!(manager.attempt_count(), attempt as u32 + 1);

            let before = connector.count();
            sleep(Duration::from_secs(*secs) - Duration::from_millis(1)).await;
            assert_eq!(connector.count(), before);
            sleep(Duration::from_millis(2)).await;
            assert_eq!(connector.count(), before + 1);
        }

        // Sixth unexpected close: budget spent.
        connector.last_events().closed(dropped());
        assert!(!manager.has_pending_retry());
        assert_eq!(manager.attempt_count(), 5);

        sleep(Duration::from_secs(120)).await;
        assert_eq!(connector.count(), 6);

        // An explicit connect starts over.
        manager.connect("u1");
        assert_eq!(connector.count(), 7);
        assert_eq!(manager.attempt_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_at_most_one_pending_retry() {
        let (manager, connector, _) = setup();
        manager.connect("u1");
        let first = connector.events(0);
        first.closed(dropped());

        // Duplicate close reports for the same transport change nothing.
        first.closed(dropped());
        first.error(TransportError::Closed);

        assert_eq!(manager.attempt_count(), 1);
        sleep(Duration::from_secs(5)).await;
        assert_eq!(connector.count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_retry() {
        let (manager, connector, _) = setup();
        manager.connect("u1");
        connector.events(0).closed(dropped());
        assert!(manager.has_pending_retry());

        manager.disconnect();
        assert!(!manager.has_pending_retry());

        sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.count(), 1);
        assert_eq!(manager.identity(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_while_connecting() {
        let (manager, connector, log) = setup();
        manager.connect("u1");

        manager.disconnect();

        assert_eq!(
            connector.log(0).lock().closed,
            Some((CLOSE_NORMAL, DISCONNECT_REASON.to_string()))
        );
        connector.events(0).closed(dropped());
        sleep(Duration::from_secs(60)).await;

        assert_eq!(connector.count(), 1);
        assert_eq!(log.kinds(), vec!["disconnected"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_connect_cancels_pending_retry() {
        let (manager, connector, _) = setup();
        manager.connect("u1");
        connector.events(0).closed(dropped());
        assert!(manager.has_pending_retry());

        manager.connect("u2");
        assert!(!manager.has_pending_retry());
        assert_eq!(manager.attempt_count(), 0);
        assert_eq!(connector.count(), 2);

        sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.count(), 2);
        assert_eq!(manager.identity(), Some(id("u2")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_construction_failure_schedules_retry() {
        let (manager, connector, log) = setup();
        connector.failures_left.store(1, Ordering::SeqCst);

        manager.connect("u1");

        assert_eq!(connector.count(), 0);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(manager.identity(), Some(id("u1")));
        assert_eq!(manager.attempt_count(), 1);
        assert_eq!(log.kinds(), vec!["error"]);

        sleep(Duration::from_millis(1001)).await;
        assert_eq!(connector.count(), 1);
        assert_eq!(manager.state(), ConnectionState::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_construction_failures_retry_past_budget() {
        let (manager, connector, log) = setup();
        connector.failures_left.store(usize::MAX, Ordering::SeqCst);

        manager.connect("u1");
        sleep(Duration::from_secs(3600)).await;

        // Delays climb to the 30s cap and stay there; a retry is always armed.
        assert!(manager.has_pending_retry());
        assert!(manager.attempt_count() > 5);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        let kinds = log.kinds();
        assert!(kinds.iter().all(|kind| *kind == "error"));
        // Initial attempt plus every fired retry; the armed one has not run yet.
        assert_eq!(kinds.len(), manager.attempt_count() as usize);

        // Once construction works again the next retry opens normally.
        connector.failures_left.store(0, Ordering::SeqCst);
        sleep(Duration::from_secs(31)).await;
        assert_eq!(connector.count(), 1);
        connector.events(0).opened();
        assert_eq!(manager.attempt_count(), 0);
        assert!(!manager.has_pending_retry());
    }

    #[test]
    fn test_cancelled_retry_is_ignored() {
        let (manager, connector, _) = setup();
        manager.connect("u2");
        assert_eq!(connector.count(), 1);

        // A timer that was cancelled before its task observed the abort.
        manager.shared.retry_due(999, id("u1"));

        assert_eq!(connector.count(), 1);
        assert_eq!(manager.identity(), Some(id("u2")));
    }

    #[test]
    fn test_debug_shows_status() {
        let (manager, _, _) = setup();
        let debug = format!("{manager:?}");
        assert!(debug.contains("ConnectionManager"));
        assert!(debug.contains("Disconnected"));
    }
}
