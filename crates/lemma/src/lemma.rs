//! The Lemma facade and its engine task
//!
//! `Lemma` is a thin handle. All protocol state (handler table, connection
//! state, the discovery client and the messaging session) is owned by one
//! engine task; public calls post commands to it, so they never block and
//! may be made from inside event handlers. `begin` and `end` also publish
//! their target state before posting, so `state()` reflects them at once.
//!
//! ```text
//! Idle --begin--> Discovering --announced--> AwaitingReply --polo--> Registering
//!   ^                  ^                                                  |
//!   |                  +------------ Disconnected <--closed-- Connected <-+
//!   +--end-- (any state)
//! ```

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::{Identity, LemmaConfig};
use crate::discovery::{DiscoveryClient, DiscoveryEvent};
use crate::handlers::{Handler, HandlerTable};
use crate::protocol::{EventValue, Message};
use crate::session::{Session, SessionEvent};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Discovering,
    AwaitingReply,
    Registering,
    Connected,
    Disconnected,
}

enum Command {
    Begin,
    End,
    ConnectHandler(String, Handler),
    Send(String, EventValue),
    Shutdown,
}

/// A guest on the local network
pub struct Lemma {
    identity: Identity,
    cmd_tx: mpsc::UnboundedSender<Command>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    state_rx: watch::Receiver<ConnectionState>,
}

/// Cheap handle for sending events, typically captured by handlers.
///
/// Holds only a weak reference to the engine: once the [`Lemma`] is
/// dropped, sends are silently discarded.
#[derive(Clone)]
pub struct LemmaSender {
    cmd_tx: mpsc::WeakUnboundedSender<Command>,
}

impl LemmaSender {
    /// Send an event to the host. Dropped unless connected.
    pub fn send_message(&self, event_name: &str, value: impl Into<EventValue>) {
        if let Some(tx) = self.cmd_tx.upgrade() {
            let _ = tx.send(Command::Send(event_name.to_string(), value.into()));
        }
    }
}

impl Lemma {
    /// Create a guest. Must be called from within a tokio runtime.
    pub fn new(identity: Identity, config: LemmaConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let state_tx = Arc::new(state_tx);

        let engine = Engine {
            identity: identity.clone(),
            config,
            handlers: HandlerTable::new(),
            state_tx: state_tx.clone(),
            active: false,
            discovery: None,
            session: None,
        };
        tokio::spawn(engine.run(cmd_rx));

        Self {
            identity,
            cmd_tx,
            state_tx,
            state_rx,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Start discovering a host. No-op while already active.
    pub fn begin(&self) {
        // Only an idle guest is inactive, anything else is already running
        self.state_tx.send_if_modified(|state| {
            let idle = *state == ConnectionState::Idle;
            if idle {
                *state = ConnectionState::Discovering;
            }
            idle
        });
        let _ = self.cmd_tx.send(Command::Begin);
    }

    /// Close every socket, cancel every timer and return to `Idle`
    pub fn end(&self) {
        self.state_tx.send_replace(ConnectionState::Idle);
        let _ = self.cmd_tx.send(Command::End);
    }

    pub fn is_connected(&self) -> bool {
        *self.state_rx.borrow() == ConnectionState::Connected
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Watch connection state changes
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Route events named `event_name` to `handler`, replacing any previous one.
    ///
    /// Handlers connected before registration are advertised to the host as
    /// events this guest hears.
    pub fn connect_handler<F>(&self, event_name: &str, handler: F)
    where
        F: Fn(&str, &EventValue) + Send + Sync + 'static,
    {
        let _ = self
            .cmd_tx
            .send(Command::ConnectHandler(event_name.to_string(), Arc::new(handler)));
    }

    /// Send an event to the host. Dropped unless connected.
    pub fn send_message(&self, event_name: &str, value: impl Into<EventValue>) {
        let _ = self
            .cmd_tx
            .send(Command::Send(event_name.to_string(), value.into()));
    }

    /// Handle for sending from inside handlers
    pub fn sender(&self) -> LemmaSender {
        LemmaSender {
            cmd_tx: self.cmd_tx.downgrade(),
        }
    }
}

impl Drop for Lemma {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
    }
}

/// Sole owner of protocol state
struct Engine {
    identity: Identity,
    config: LemmaConfig,
    handlers: HandlerTable,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    /// Set by begin, cleared by end. Gates the automatic return to discovery.
    active: bool,
    discovery: Option<DiscoveryClient>,
    session: Option<Session>,
}

impl Engine {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                // Commands first, so a queued end() beats late session progress
                biased;

                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Shutdown) | None => break,
                        Some(cmd) => self.handle_command(cmd),
                    }
                }
                Some(event) = next_discovery_event(&mut self.discovery) => {
                    self.on_discovery_event(event);
                }
                Some(event) = next_session_event(&mut self.session) => {
                    self.on_session_event(event);
                }
            }
        }

        self.end();
        debug!(guest = %self.identity.guest_name(), "Engine stopped");
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Begin => self.begin(),
            Command::End => self.end(),
            Command::ConnectHandler(name, handler) => {
                self.handlers.connect(name, handler);
            }
            Command::Send(event_name, value) => self.send_event(event_name, value),
            Command::Shutdown => {}
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "Connection state changed");
        }
    }

    fn begin(&mut self) {
        if self.active {
            debug!("begin() while already active, ignoring");
            return;
        }
        self.active = true;
        info!(
            guest = %self.identity.guest_name(),
            room = %self.identity.room_name(),
            "Starting guest"
        );
        self.start_discovery();
    }

    fn end(&mut self) {
        self.active = false;
        if let Some(discovery) = self.discovery.take() {
            discovery.stop();
        }
        if let Some(session) = self.session.take() {
            session.close();
        }
        self.set_state(ConnectionState::Idle);
    }

    fn start_discovery(&mut self) {
        self.discovery = Some(DiscoveryClient::start(&self.identity, &self.config));
        self.set_state(ConnectionState::Discovering);
    }

    fn on_discovery_event(&mut self, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::Announced => {
                if self.state() == ConnectionState::Discovering {
                    self.set_state(ConnectionState::AwaitingReply);
                }
            }
            DiscoveryEvent::HostFound { host, room_name } => {
                if let Some(discovery) = self.discovery.take() {
                    discovery.stop();
                }
                info!(host = %host, room = %room_name, "Registering with host");
                self.set_state(ConnectionState::Registering);
                self.session = Some(Session::connect(
                    host,
                    &self.identity,
                    self.handlers.names_snapshot(),
                    &self.config,
                ));
            }
        }
    }

    fn on_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Registered { local_port } => {
                info!(local_port = local_port, "Connected to host");
                self.set_state(ConnectionState::Connected);
            }
            SessionEvent::Event {
                sender_name,
                event_name,
                value,
            } => {
                debug!(sender = %sender_name, event = %event_name, "Received event");
                self.handlers.dispatch(&event_name, &value);
            }
            SessionEvent::Closed { reason } => {
                warn!(reason = %reason, "Lost session, returning to discovery");
                self.session = None;
                self.set_state(ConnectionState::Disconnected);
                if self.active {
                    self.start_discovery();
                }
            }
        }
    }

    fn send_event(&mut self, event_name: String, value: EventValue) {
        if self.state() != ConnectionState::Connected {
            debug!(event = %event_name, "Not connected, dropping event");
            return;
        }
        let Some(session) = &self.session else {
            return;
        };
        let msg = Message::Event {
            sender_name: self.identity.guest_name().to_string(),
            event_name,
            value,
        };
        if let Err(e) = session.send(msg) {
            warn!(error = %e, "Failed to queue event");
        }
    }
}

async fn next_discovery_event(discovery: &mut Option<DiscoveryClient>) -> Option<DiscoveryEvent> {
    match discovery {
        Some(discovery) => discovery.next_event().await,
        None => std::future::pending().await,
    }
}

async fn next_session_event(session: &mut Option<Session>) -> Option<SessionEvent> {
    match session {
        Some(session) => session.next_event().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::wrap_frame;
    use crate::protocol::RegisterOptions;
    use crate::test_host::{FakeHost, HostConn, TEST_TIMEOUT};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn wait_for(lemma: &Lemma, wanted: fn(ConnectionState) -> bool) {
        let mut rx = lemma.subscribe();
        timeout(TEST_TIMEOUT, rx.wait_for(|s| wanted(*s)))
            .await
            .expect("timed out waiting for state")
            .unwrap();
    }

    /// Run discovery against the fake host and accept the session
    async fn connect(lemma: &Lemma, host: &FakeHost) -> HostConn {
        lemma.begin();
        let (_, guest_addr) = host.recv_marco().await;
        host.reply_polo(guest_addr).await;
        let conn = host.accept().await;
        wait_for(lemma, |s| s == ConnectionState::Connected).await;
        conn
    }

    fn guest(name: &str, host: &FakeHost) -> Lemma {
        Lemma::new(Identity::new(name, "lab").unwrap(), host.config())
    }

    #[tokio::test]
    async fn test_starts_idle() {
        let host = FakeHost::start().await;
        let lemma = guest("Echo", &host);
        assert_eq!(lemma.state(), ConnectionState::Idle);
        assert!(!lemma.is_connected());
    }

    #[tokio::test]
    async fn test_discovers_and_registers() {
        let host = FakeHost::start().await;
        let lemma = guest("Echo", &host);
        lemma.connect_handler("Echo", |_, _| {});
        lemma.connect_handler("Sum", |_, _| {});

        lemma.begin();
        let (marco, guest_addr) = host.recv_marco().await;
        assert!(matches!(marco, Message::Marco { ref guest_name, .. } if guest_name == "Echo"));
        wait_for(&lemma, |s| s == ConnectionState::AwaitingReply).await;

        host.reply_polo(guest_addr).await;
        let mut conn = host.accept().await;

        assert_eq!(
            conn.next_message().await,
            Some(Message::Register {
                guest_name: "Echo".into(),
                local_port: conn.peer_port(),
                hears: vec!["Echo".into(), "Sum".into()],
                speaks: vec![],
                dialect: "Cinder-NoamLemma".into(),
                version: "0.0.0".into(),
                options: RegisterOptions { heartbeat: 1 },
            })
        );
        wait_for(&lemma, |s| s == ConnectionState::Connected).await;
        assert!(lemma.is_connected());
    }

    #[tokio::test]
    async fn test_echo_roundtrip() {
        let host = FakeHost::start().await;
        let lemma = guest("Echo", &host);
        let sender = lemma.sender();
        lemma.connect_handler("Echo", move |_, value| {
            sender.send_message("EchoVerify", value);
        });

        let mut conn = connect(&lemma, &host).await;
        conn.send(&Message::Event {
            sender_name: "host".into(),
            event_name: "Echo".into(),
            value: "42".into(),
        })
        .await;

        let raw = conn.next_raw_matching("EchoVerify").await;
        assert_eq!(raw, b"000034[\"event\",\"Echo\",\"EchoVerify\",\"42\"]".to_vec());
    }

    #[tokio::test]
    async fn test_events_over_connect_back() {
        let host = FakeHost::start().await;
        let lemma = guest("Echo", &host);
        let sender = lemma.sender();
        lemma.connect_handler("Echo", move |_, value| {
            sender.send_message("EchoVerify", value);
        });

        let mut conn = connect(&lemma, &host).await;
        let mut back = conn.connect_back().await;
        back.send(&Message::HeartbeatAck).await;
        back.send(&Message::Event {
            sender_name: "host".into(),
            event_name: "Echo".into(),
            value: "42".into(),
        })
        .await;

        // Replies still go out on the session connection
        let raw = conn.next_raw_matching("EchoVerify").await;
        assert_eq!(raw, b"000034[\"event\",\"Echo\",\"EchoVerify\",\"42\"]".to_vec());

        // Host dropping its event connection ends the session
        host.drain_marcos();
        back.shutdown().await;
        wait_for(&lemma, |s| {
            matches!(s, ConnectionState::Discovering | ConnectionState::AwaitingReply)
        })
        .await;
        let _ = host.recv_marco().await;
    }

    #[tokio::test]
    async fn test_event_split_across_reads() {
        let host = FakeHost::start().await;
        let lemma = guest("Echo", &host);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = seen.clone();
        lemma.connect_handler("Echo", move |_, value| {
            record.lock().unwrap().push(value.as_text().into_owned());
        });

        let mut conn = connect(&lemma, &host).await;
        let bytes = wrap_frame(
            &Message::Event {
                sender_name: "host".into(),
                event_name: "Echo".into(),
                value: "split".into(),
            }
            .encode(),
        )
        .unwrap();

        conn.send_raw(&bytes[..10]).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(seen.lock().unwrap().is_empty());

        conn.send_raw(&bytes[10..]).await;
        timeout(TEST_TIMEOUT, async {
            while seen.lock().unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("handler never ran");
        assert_eq!(*seen.lock().unwrap(), vec!["split".to_string()]);
        assert!(lemma.is_connected());
    }

    #[tokio::test]
    async fn test_bad_frames_do_not_end_session() {
        let host = FakeHost::start().await;
        let lemma = guest("Echo", &host);
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        lemma.connect_handler("Echo", move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let mut conn = connect(&lemma, &host).await;
        conn.send_raw(b"000009{not json").await;
        conn.send_raw(b"000015[\"goodbye\",\"x\"]").await;
        conn.send(&Message::Event {
            sender_name: "host".into(),
            event_name: "Nobody".into(),
            value: 1.into(),
        })
        .await;
        conn.send(&Message::HeartbeatAck).await;
        conn.send(&Message::Event {
            sender_name: "host".into(),
            event_name: "Echo".into(),
            value: "hi".into(),
        })
        .await;

        timeout(TEST_TIMEOUT, async {
            while hits.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("handler never ran");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(lemma.is_connected());
    }

    #[tokio::test]
    async fn test_heartbeat_cadence() {
        let host = FakeHost::start().await;
        let lemma = guest("Echo", &host);
        let mut conn = connect(&lemma, &host).await;

        // 100ms interval, so roughly six in 600ms
        let beats = conn.heartbeats_within(Duration::from_millis(600)).await;
        assert!(beats.len() >= 3, "only {} heartbeats", beats.len());
        assert!(beats.len() <= 8, "{} heartbeats", beats.len());
    }

    #[tokio::test]
    async fn test_heartbeat_stops_after_end() {
        let host = FakeHost::start().await;
        let lemma = guest("Echo", &host);
        let mut conn = connect(&lemma, &host).await;

        lemma.end();
        assert_eq!(lemma.state(), ConnectionState::Idle);

        // The guest closes its side; nothing but already-sent frames remain
        while conn.next_message().await.is_some() {}
        assert!(!lemma.is_connected());
    }

    #[tokio::test]
    async fn test_reconnects_after_host_close() {
        let host = FakeHost::start().await;
        let lemma = guest("Echo", &host);
        let mut conn = connect(&lemma, &host).await;
        host.drain_marcos();

        conn.shutdown().await;
        wait_for(&lemma, |s| {
            matches!(s, ConnectionState::Discovering | ConnectionState::AwaitingReply)
        })
        .await;
        assert!(!lemma.is_connected());

        // The guest closed the old connection, so its heartbeat is gone
        while conn.next_message().await.is_some() {}
        assert!(conn.heartbeats_within(Duration::from_millis(250)).await.is_empty());

        // Fresh announcement from a fresh socket, then a fresh session
        let (marco, guest_addr) = host.recv_marco().await;
        assert!(matches!(marco, Message::Marco { .. }));
        host.reply_polo(guest_addr).await;
        let mut conn = host.accept().await;
        assert!(matches!(
            conn.next_message().await,
            Some(Message::Register { .. })
        ));
        wait_for(&lemma, |s| s == ConnectionState::Connected).await;
    }

    #[tokio::test]
    async fn test_end_is_immediate() {
        let host = FakeHost::start().await;
        let lemma = guest("Echo", &host);
        let _conn = connect(&lemma, &host).await;

        lemma.end();
        assert!(!lemma.is_connected());
        assert_eq!(lemma.state(), ConnectionState::Idle);

        lemma.begin();
        assert_eq!(lemma.state(), ConnectionState::Discovering);
        lemma.end();
        assert_eq!(lemma.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_begin_is_idempotent() {
        let host = FakeHost::start().await;
        let lemma = guest("Echo", &host);

        lemma.begin();
        lemma.begin();
        lemma.begin();

        // Several announcement periods, all from one discovery socket
        let sources = host.marco_sources_within(Duration::from_millis(300)).await;
        assert_eq!(sources.len(), 1);
    }

    #[tokio::test]
    async fn test_begin_while_connected_is_noop() {
        let host = FakeHost::start().await;
        let lemma = guest("Echo", &host);
        let _conn = connect(&lemma, &host).await;
        host.drain_marcos();

        lemma.begin();
        assert!(host.marco_sources_within(Duration::from_millis(200)).await.is_empty());
        assert!(!host.accepts_within(Duration::from_millis(100)).await);
        assert!(lemma.is_connected());
    }

    #[tokio::test]
    async fn test_end_during_discovery() {
        let host = FakeHost::start().await;
        let lemma = guest("Echo", &host);

        lemma.begin();
        let _ = host.recv_marco().await;
        lemma.end();
        wait_for(&lemma, |s| s == ConnectionState::Idle).await;

        // Let any in-flight announcement land, then expect silence
        tokio::time::sleep(Duration::from_millis(20)).await;
        host.drain_marcos();
        assert!(host.marco_sources_within(Duration::from_millis(200)).await.is_empty());

        // And it can start again
        lemma.begin();
        let _ = host.recv_marco().await;
    }

    #[tokio::test]
    async fn test_send_dropped_when_not_connected() {
        let host = FakeHost::start().await;
        let lemma = guest("Echo", &host);
        lemma.send_message("Early", "lost");

        let mut conn = connect(&lemma, &host).await;
        lemma.send_message("Late", 7);

        assert!(matches!(conn.next_non_heartbeat().await, Some(Message::Register { .. })));
        assert_eq!(
            conn.next_non_heartbeat().await,
            Some(Message::Event {
                sender_name: "Echo".into(),
                event_name: "Late".into(),
                value: 7.into(),
            })
        );
    }

    #[tokio::test]
    async fn test_sender_outlives_lemma_safely() {
        let host = FakeHost::start().await;
        let lemma = guest("Echo", &host);
        let sender = lemma.sender();
        drop(lemma);
        sender.send_message("Anything", true);
    }
}
