//! Shared test fixtures: an in-process mock realtime server speaking the
//! protocol over pipe transports, plus a counting token provider.

#![allow(dead_code, reason = "not every test binary uses every fixture")]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use relay_client_sdk::Result;
use relay_client_sdk::auth::{Token, TokenProvider};
use relay_client_sdk::channel::{Channel, ChannelState};
use relay_client_sdk::config::ClientOptions;
use relay_client_sdk::connection::{Connection, ConnectionState};
use relay_client_sdk::error::{Error, Kind, TransportError};
use relay_client_sdk::protocol::{Action, ErrorInfo, ProtocolMessage};
use relay_client_sdk::transport::{Transport, TransportStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use url::Url;

const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Route client logs through the test harness when `RUST_LOG` is set.
pub fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Token provider that mints long-lived tokens and counts requests.
pub struct TestProvider {
    pub calls: AtomicUsize,
}

impl TestProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenProvider for TestProvider {
    async fn request_token(&self, capability: &str) -> Result<Token> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Token::new(
            format!("token-{n}"),
            capability,
            Utc::now() + chrono::Duration::hours(1),
        ))
    }
}

/// Provider that always fails, for auth failure paths.
pub struct FailingProvider;

#[async_trait]
impl TokenProvider for FailingProvider {
    async fn request_token(&self, _capability: &str) -> Result<Token> {
        Err(ErrorInfo::new(80019, 401, "token endpoint unavailable").into())
    }
}

/// Client options tuned for fast test reconnection.
pub fn fast_options() -> ClientOptions {
    let mut options = ClientOptions::new("wss://mock.invalid").expect("static url");
    options.reconnect.initial_backoff = Duration::from_millis(10);
    options.reconnect.max_backoff = Duration::from_millis(50);
    options.reconnect.suspended_retry_interval = Duration::from_millis(50);
    options.heartbeat_interval = Duration::from_millis(500);
    options.heartbeat_timeout = Duration::from_secs(5);
    options
}

struct Session {
    id: String,
    tx: mpsc::UnboundedSender<ProtocolMessage>,
}

/// Scripted realtime server reachable through [`MockServer::transport`].
///
/// Handles the connect/attach/publish/close script automatically; the
/// control methods inject failures for specific scenarios.
pub struct MockServer {
    sessions: Mutex<Vec<Session>>,
    kill_tx: broadcast::Sender<()>,
    connects: AtomicUsize,
    reject_connects: AtomicUsize,
    connect_error: Mutex<Option<ErrorInfo>>,
    resume_error: Mutex<Option<ErrorInfo>>,
    nack_error: Mutex<Option<ErrorInfo>>,
    swallow_publishes: AtomicBool,
    ack_batch: AtomicUsize,
}

impl MockServer {
    pub fn new() -> Arc<Self> {
        init_tracing();
        let (kill_tx, _) = broadcast::channel(4);
        Arc::new(Self {
            sessions: Mutex::new(Vec::new()),
            kill_tx,
            connects: AtomicUsize::new(0),
            reject_connects: AtomicUsize::new(0),
            connect_error: Mutex::new(None),
            resume_error: Mutex::new(None),
            nack_error: Mutex::new(None),
            swallow_publishes: AtomicBool::new(false),
            ack_batch: AtomicUsize::new(0),
        })
    }

    pub fn transport(self: &Arc<Self>) -> Arc<dyn Transport> {
        Arc::new(MockTransport {
            server: Arc::clone(self),
        })
    }

    /// Number of sessions that completed a connect handshake attempt.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Refuse the next `n` transport dials outright.
    pub fn reject_next_connects(&self, n: usize) {
        self.reject_connects.store(n, Ordering::SeqCst);
    }

    /// Answer the next connect handshake with an error frame.
    pub fn fail_next_connect(&self, error: ErrorInfo) {
        *self.connect_error.lock().expect("lock") = Some(error);
    }

    /// Mark the next resume attempt as having lost continuity.
    pub fn fail_next_resume(&self, error: ErrorInfo) {
        *self.resume_error.lock().expect("lock") = Some(error);
    }

    /// Reject publishes with this error instead of acknowledging.
    pub fn nack_publishes(&self, error: Option<ErrorInfo>) {
        *self.nack_error.lock().expect("lock") = error;
    }

    /// Accept publishes without ever acknowledging them.
    pub fn swallow_publishes(&self, swallow: bool) {
        self.swallow_publishes.store(swallow, Ordering::SeqCst);
    }

    /// Group acknowledgements: one ack covering every `n` publishes.
    pub fn batch_acks(&self, n: usize) {
        self.ack_batch.store(n, Ordering::SeqCst);
    }

    /// Sever every live session, as a network partition would.
    pub fn drop_connections(&self) {
        let _ = self.kill_tx.send(());
        self.sessions.lock().expect("lock").clear();
    }

    /// Push a channel-scoped error frame to every live session.
    pub fn fail_channel(&self, channel: &str, error: ErrorInfo) {
        let mut frame = ProtocolMessage::for_channel(Action::Error, channel);
        frame.error = Some(error);
        self.broadcast(&frame);
    }

    fn broadcast(&self, frame: &ProtocolMessage) {
        for session in self.sessions.lock().expect("lock").iter() {
            let _ = session.tx.send(frame.clone());
        }
    }

    fn handle_connect(
        self: &Arc<Self>,
        frame: &ProtocolMessage,
        tx: &mpsc::UnboundedSender<ProtocolMessage>,
    ) -> Option<String> {
        let n = self.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.connect_error.lock().expect("lock").take() {
            let mut reply = ProtocolMessage::new(Action::Error);
            reply.error = Some(error);
            let _ = tx.send(reply);
            return None;
        }

        let id = format!("conn-{n}");
        let mut reply = ProtocolMessage::new(Action::Connected);
        reply.connection_id = Some(id.clone());
        reply.connection_key = Some(format!("key-{n}"));
        if frame.connection_key.is_some() {
            reply.error = self.resume_error.lock().expect("lock").take();
        }
        self.sessions.lock().expect("lock").push(Session {
            id: id.clone(),
            tx: tx.clone(),
        });
        let _ = tx.send(reply);
        Some(id)
    }

    fn handle_publish(
        self: &Arc<Self>,
        frame: ProtocolMessage,
        conn_id: Option<&str>,
        tx: &mpsc::UnboundedSender<ProtocolMessage>,
        serial: &mut i64,
        pending_batch: &mut Vec<i64>,
    ) {
        if self.swallow_publishes.load(Ordering::SeqCst) {
            return;
        }
        let msg_serial = frame.msg_serial.unwrap_or(0);

        if let Some(error) = self.nack_error.lock().expect("lock").clone() {
            let mut reply = ProtocolMessage::new(Action::Nack);
            reply.msg_serial = Some(msg_serial);
            reply.count = Some(1);
            reply.error = Some(error);
            let _ = tx.send(reply);
            return;
        }

        let batch = self.ack_batch.load(Ordering::SeqCst);
        if batch > 1 {
            pending_batch.push(msg_serial);
            if pending_batch.len() >= batch {
                let mut reply = ProtocolMessage::new(Action::Ack);
                reply.msg_serial = Some(pending_batch[0]);
                reply.count = Some(u32::try_from(pending_batch.len()).expect("batch size"));
                pending_batch.clear();
                let _ = tx.send(reply);
            }
        } else {
            let mut reply = ProtocolMessage::new(Action::Ack);
            reply.msg_serial = Some(msg_serial);
            reply.count = Some(1);
            let _ = tx.send(reply);
        }

        // Fan the messages out to every session, publisher included, the
        // way the service would.
        *serial += 1;
        let channel = frame.channel.unwrap_or_default();
        let mut echo = ProtocolMessage::for_channel(Action::Message, channel);
        echo.connection_serial = Some(*serial);
        echo.messages = frame
            .messages
            .into_iter()
            .map(|mut message| {
                message.connection_id = conn_id.map(str::to_owned);
                message.timestamp = Some(Utc::now().timestamp_millis());
                message
            })
            .collect();
        self.broadcast(&echo);
    }

    async fn run_session(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<ProtocolMessage>,
        tx: mpsc::UnboundedSender<ProtocolMessage>,
    ) {
        let mut kill = self.kill_tx.subscribe();
        let mut conn_id: Option<String> = None;
        let mut serial = 0_i64;
        let mut pending_batch = Vec::new();

        loop {
            tokio::select! {
                _ = kill.recv() => break,
                inbound = rx.recv() => {
                    let Some(frame) = inbound else { break };
                    match frame.action {
                        Action::Connect => conn_id = self.handle_connect(&frame, &tx),
                        Action::Attach => {
                            let channel = frame.channel.unwrap_or_default();
                            let _ = tx.send(ProtocolMessage::for_channel(Action::Attached, channel));
                        }
                        Action::Detach => {
                            let channel = frame.channel.unwrap_or_default();
                            let _ = tx.send(ProtocolMessage::for_channel(Action::Detached, channel));
                        }
                        Action::Heartbeat => {
                            let _ = tx.send(ProtocolMessage::new(Action::Heartbeat));
                        }
                        Action::Message => self.handle_publish(
                            frame,
                            conn_id.as_deref(),
                            &tx,
                            &mut serial,
                            &mut pending_batch,
                        ),
                        Action::Close => {
                            let _ = tx.send(ProtocolMessage::new(Action::Closed));
                            break;
                        }
                        _ => {}
                    }
                }
            }
        }

        if let Some(id) = conn_id {
            self.sessions
                .lock()
                .expect("lock")
                .retain(|session| session.id != id);
        }
    }
}

struct MockTransport {
    server: Arc<MockServer>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, _url: &Url) -> Result<Box<dyn TransportStream>> {
        let rejects = self.server.reject_connects.load(Ordering::SeqCst);
        if rejects > 0 {
            self.server.reject_connects.store(rejects - 1, Ordering::SeqCst);
            return Err(Error::with_source(Kind::Transport, TransportError::Closed));
        }

        let (client_tx, server_rx) = mpsc::unbounded_channel();
        let (server_tx, client_rx) = mpsc::unbounded_channel();
        tokio::spawn(Arc::clone(&self.server).run_session(server_rx, server_tx));
        Ok(Box::new(PipeStream {
            tx: client_tx,
            rx: client_rx,
        }))
    }
}

struct PipeStream {
    tx: mpsc::UnboundedSender<ProtocolMessage>,
    rx: mpsc::UnboundedReceiver<ProtocolMessage>,
}

#[async_trait]
impl TransportStream for PipeStream {
    async fn send(&mut self, frame: ProtocolMessage) -> Result<()> {
        self.tx
            .send(frame)
            .map_err(|_e| Error::with_source(Kind::Transport, TransportError::Closed))
    }

    async fn recv(&mut self) -> Result<Option<ProtocolMessage>> {
        Ok(self.rx.recv().await)
    }

    async fn close(&mut self) {}
}

/// Wait until the connection reaches `want`, or panic after a timeout.
pub async fn wait_for_connection_state(connection: &Connection, want: ConnectionState) {
    let mut changes = connection.state_changes();
    timeout(WAIT_TIMEOUT, async {
        loop {
            if changes.borrow_and_update().current == want {
                return;
            }
            changes.changed().await.expect("state stream ended");
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for connection state {want:?}"));
}

/// Wait until the channel reaches `want`, or panic after a timeout.
pub async fn wait_for_channel_state(channel: &Channel, want: ChannelState) {
    timeout(WAIT_TIMEOUT, async {
        while channel.state() != want {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| {
        panic!(
            "timed out waiting for channel state {want:?}, currently {:?}",
            channel.state()
        )
    });
}
