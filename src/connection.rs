#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

//! Connection lifecycle: a single driver task owns the transport stream,
//! serializes all outbound frames, assigns publish serials at write time
//! and is the only writer of connection state.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff as _;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, interval_at, sleep, timeout};
use tracing::{debug, info, trace, warn};

use crate::ack::AckTracker;
use crate::auth::Auth;
use crate::config::{ClientOptions, RecoveryKey};
use crate::error::{Error, Kind, TransportError};
use crate::protocol::{Action, ErrorInfo, ProtocolMessage};
use crate::transport::{Transport, TransportStream};
use crate::Result;

/// How long to wait for the server to confirm an orderly close.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection lifecycle state.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, no connection attempted yet
    Initialized,
    /// Attempting to establish a session
    Connecting,
    /// Session established; frames flow
    Connected,
    /// Session lost; reconnecting with backoff, publishes queue
    Disconnected,
    /// Repeated reconnection failures; retrying at a slower cadence
    Suspended,
    /// Orderly close requested, awaiting server confirmation
    Closing,
    /// Closed; terminal until an explicit reconnect request
    Closed,
    /// Fatal error; terminal until an explicit reconnect request
    Failed,
}

impl ConnectionState {
    /// Whether a transition from `self` to `next` is meaningful.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use ConnectionState::{
            Closed, Closing, Connected, Connecting, Disconnected, Failed, Initialized, Suspended,
        };
        match (self, next) {
            (Initialized, Connecting | Closing | Closed | Failed)
            | (Connecting, Connected | Disconnected | Suspended | Closing | Closed | Failed)
            | (Connected, Connected | Disconnected | Suspended | Closing | Failed)
            | (Disconnected, Connecting | Suspended | Closing | Closed | Failed)
            | (Suspended, Connecting | Closing | Closed | Failed)
            | (Closing, Closed | Failed)
            // Terminal states only leave via an explicit reconnect request.
            | (Closed | Failed, Connecting) => true,
            _ => false,
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }

    /// Whether publishes may be accepted (immediately or queued).
    #[must_use]
    pub const fn accepts_publishes(self) -> bool {
        matches!(
            self,
            Self::Initialized | Self::Connecting | Self::Connected | Self::Disconnected
        )
    }
}

/// One observed connection state transition.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct StateChange {
    pub previous: ConnectionState,
    pub current: ConnectionState,
    /// Server or transport error that caused the transition, when one did.
    pub error: Option<ErrorInfo>,
}

/// Callbacks from the driver task into the channel layer.
///
/// Invoked inline on the driver task, so implementations must not block.
pub(crate) trait ConnectionEvents: Send + Sync + 'static {
    /// A channel-scoped inbound frame (attached, detached, message,
    /// presence, channel error).
    fn on_frame(&self, frame: ProtocolMessage);
    /// The connection state changed.
    fn on_state_change(&self, change: &StateChange);
    /// A resume attempt did not preserve continuity; previously attached
    /// channels must re-attach.
    fn on_resume_failure(&self, error: &ErrorInfo);
}

/// Outbound work for the driver task.
pub(crate) enum Outbound {
    Frame(ProtocolMessage),
    Publish {
        frame: ProtocolMessage,
        tx: oneshot::Sender<Result<()>>,
    },
}

enum Ctrl {
    Connect,
    Close,
}

#[derive(Debug, Default, Clone)]
struct ConnectionDetails {
    id: Option<String>,
    key: Option<String>,
    serial: Option<i64>,
}

/// State shared between the driver task and the public handles.
pub(crate) struct ConnectionInner {
    state_tx: watch::Sender<StateChange>,
    out_tx: mpsc::UnboundedSender<Outbound>,
    ctrl_tx: mpsc::UnboundedSender<Ctrl>,
    details: RwLock<ConnectionDetails>,
}

/// Receiving halves of the driver's work queues, produced alongside the
/// shared state and handed to the driver at spawn time.
pub(crate) struct DriverQueues {
    out_rx: mpsc::UnboundedReceiver<Outbound>,
    ctrl_rx: mpsc::UnboundedReceiver<Ctrl>,
}

impl ConnectionInner {
    pub(crate) fn new() -> (Arc<Self>, DriverQueues) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(StateChange {
            previous: ConnectionState::Initialized,
            current: ConnectionState::Initialized,
            error: None,
        });
        let inner = Arc::new(Self {
            state_tx,
            out_tx,
            ctrl_tx,
            details: RwLock::new(ConnectionDetails::default()),
        });
        (inner, DriverQueues { out_rx, ctrl_rx })
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state_tx.borrow().current
    }

    pub(crate) fn error_reason(&self) -> Option<ErrorInfo> {
        self.state_tx.borrow().error.clone()
    }

    pub(crate) fn state_changes(&self) -> watch::Receiver<StateChange> {
        self.state_tx.subscribe()
    }

    pub(crate) fn connection_id(&self) -> Option<String> {
        self.read_details().id
    }

    pub(crate) fn recovery_key(&self) -> Option<RecoveryKey> {
        let details = self.read_details();
        Some(RecoveryKey {
            connection_key: details.key?,
            connection_serial: details.serial?,
        })
    }

    /// Queue a lifecycle frame for the current or next session.
    pub(crate) fn send_frame(&self, frame: ProtocolMessage) -> Result<()> {
        if self.state().is_terminal() {
            return Err(Error::new(Kind::Closed));
        }
        self.out_tx
            .send(Outbound::Frame(frame))
            .map_err(|_e| Error::new(Kind::Closed))
    }

    /// Queue a publish frame; the serial is assigned when it is written.
    pub(crate) fn send_publish(
        &self,
        frame: ProtocolMessage,
    ) -> Result<oneshot::Receiver<Result<()>>> {
        let state = self.state();
        if !state.accepts_publishes() {
            if state.is_terminal() {
                return Err(Error::new(Kind::Closed));
            }
            return Err(Error::state(format!(
                "cannot publish while connection is {state:?}"
            )));
        }
        let (tx, rx) = oneshot::channel();
        self.out_tx
            .send(Outbound::Publish { frame, tx })
            .map_err(|_e| Error::new(Kind::Closed))?;
        Ok(rx)
    }

    pub(crate) fn request_connect(&self) {
        let _ = self.ctrl_tx.send(Ctrl::Connect);
    }

    pub(crate) fn request_close(&self) {
        let _ = self.ctrl_tx.send(Ctrl::Close);
    }

    fn read_details(&self) -> ConnectionDetails {
        self.details
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Validate a state transition, returning the change if it is valid.
    /// The change becomes visible to watchers via [`Self::publish_state`].
    fn apply_state(
        &self,
        next: ConnectionState,
        error: Option<ErrorInfo>,
    ) -> Option<StateChange> {
        let previous = self.state();
        if !previous.can_transition_to(next) {
            trace!(?previous, ?next, "skipping invalid state transition");
            return None;
        }
        Some(StateChange {
            previous,
            current: next,
            error,
        })
    }

    fn publish_state(&self, change: StateChange) {
        let _ = self.state_tx.send(change);
    }
}

/// Public handle to the connection. Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    pub(crate) fn new(inner: Arc<ConnectionInner>) -> Self {
        Self { inner }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Watch all state transitions, including the error that caused each.
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<StateChange> {
        self.inner.state_changes()
    }

    /// Server-assigned connection id, once connected.
    #[must_use]
    pub fn id(&self) -> Option<String> {
        self.inner.connection_id()
    }

    /// Resume position for recovering this connection in a new client.
    ///
    /// Available once connected and at least one serial-bearing frame has
    /// been delivered.
    #[must_use]
    pub fn recovery_key(&self) -> Option<RecoveryKey> {
        self.inner.recovery_key()
    }

    /// The error behind the current state, if the last transition carried one.
    #[must_use]
    pub fn error_reason(&self) -> Option<ErrorInfo> {
        self.inner.error_reason()
    }

    /// Request a (re)connect. A no-op unless Initialized, Closed or Failed.
    pub fn connect(&self) {
        self.inner.request_connect();
    }

    /// Request an orderly close and wait for the terminal state.
    pub async fn close(&self) {
        self.inner.request_close();
        let mut changes = self.inner.state_changes();
        while !changes.borrow_and_update().current.is_terminal() {
            if changes.changed().await.is_err() {
                return;
            }
        }
    }
}

/// How an established session ended.
enum SessionEnd {
    /// Orderly close, confirmed or timed out
    Closed,
    /// Unrecoverable server error
    Fatal(ErrorInfo),
    /// The server rejected or revoked the auth token; renew and retry
    TokenExpired(ErrorInfo),
    /// Transport dropped, heartbeat starved or server requested reconnect
    Lost { error: Option<ErrorInfo> },
}

/// Reconnection bookkeeping across attempts.
struct RetryCounters {
    failures: u32,
    token_retries: u32,
    backoff: ExponentialBackoff,
}

impl RetryCounters {
    fn new(options: &ClientOptions) -> Self {
        Self {
            failures: 0,
            token_retries: 0,
            backoff: options.reconnect.clone().into(),
        }
    }

    fn reset_on_connected(&mut self) {
        self.failures = 0;
        self.token_retries = 0;
        self.backoff.reset();
    }
}

enum Wait {
    Retry,
    Close,
}

/// The driver task. Owns the transport stream and the ack tracker; the
/// sole writer of connection state and publish serials.
pub(crate) struct Driver {
    options: ClientOptions,
    auth: Arc<Auth>,
    transport: Arc<dyn Transport>,
    events: Arc<dyn ConnectionEvents>,
    inner: Arc<ConnectionInner>,
    out_rx: mpsc::UnboundedReceiver<Outbound>,
    ctrl_rx: mpsc::UnboundedReceiver<Ctrl>,
    acks: AckTracker,
}

impl Driver {
    pub(crate) fn new(
        options: ClientOptions,
        auth: Arc<Auth>,
        transport: Arc<dyn Transport>,
        events: Arc<dyn ConnectionEvents>,
        inner: Arc<ConnectionInner>,
        queues: DriverQueues,
    ) -> Self {
        Self {
            options,
            auth,
            transport,
            events,
            inner,
            out_rx: queues.out_rx,
            ctrl_rx: queues.ctrl_rx,
            acks: AckTracker::default(),
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            // Once terminal, the publish queue must still be serviced: a
            // caller that read a pre-terminal state can enqueue after the
            // terminal drain, and every publish resolves exactly once.
            let ctrl = if self.inner.state().is_terminal() {
                tokio::select! {
                    ctrl = self.ctrl_rx.recv() => ctrl,
                    outbound = self.out_rx.recv() => match outbound {
                        Some(Outbound::Publish { tx, .. }) => {
                            let _ = tx.send(Err(self.terminal_publish_error()));
                            continue;
                        }
                        Some(Outbound::Frame(_)) => continue,
                        None => return,
                    },
                }
            } else {
                self.ctrl_rx.recv().await
            };
            match ctrl {
                Some(Ctrl::Connect) => self.connect_loop().await,
                Some(Ctrl::Close) => {
                    if !self.inner.state().is_terminal() {
                        self.finish(ConnectionState::Closed, None);
                    }
                }
                None => return,
            }
        }
    }

    /// The error a publish resolves with when the connection is terminal.
    fn terminal_publish_error(&self) -> Error {
        match (self.inner.state(), self.inner.error_reason()) {
            (ConnectionState::Failed, Some(info)) => info.into(),
            _ => Error::new(Kind::Closed),
        }
    }

    /// Connect and reconnect until a terminal state is reached.
    async fn connect_loop(&mut self) {
        let mut counters = RetryCounters::new(&self.options);
        loop {
            self.set_state(ConnectionState::Connecting, None);
            let mut last_error = None;
            match self.attempt(&mut counters).await {
                Ok(SessionEnd::Closed) => {
                    self.finish(ConnectionState::Closed, None);
                    return;
                }
                Ok(SessionEnd::Fatal(info)) => {
                    self.finish(ConnectionState::Failed, Some(info));
                    return;
                }
                Ok(SessionEnd::TokenExpired(info)) => {
                    counters.token_retries += 1;
                    if counters.token_retries > 1 {
                        warn!("renewed token rejected again, giving up");
                        self.finish(ConnectionState::Failed, Some(info));
                        return;
                    }
                    match self.auth.renew().await {
                        Ok(_) => {
                            self.set_state(ConnectionState::Disconnected, Some(info));
                            continue;
                        }
                        Err(e) => {
                            let info = auth_failure_info(&e);
                            self.finish(ConnectionState::Failed, Some(info));
                            return;
                        }
                    }
                }
                Ok(SessionEnd::Lost { error }) => {
                    counters.failures += 1;
                    last_error = error;
                }
                Err(e) => {
                    debug!(error = %e, "connection attempt failed");
                    counters.failures += 1;
                    last_error = e.error_info().cloned();
                }
            }

            let wait = if counters.failures >= self.options.reconnect.suspend_after {
                self.set_state(ConnectionState::Suspended, last_error);
                self.options.reconnect.suspended_retry_interval
            } else {
                self.set_state(ConnectionState::Disconnected, last_error);
                counters
                    .backoff
                    .next_backoff()
                    .unwrap_or(self.options.reconnect.max_backoff)
            };
            if matches!(self.wait_for_retry(wait).await, Wait::Close) {
                self.finish(ConnectionState::Closed, None);
                return;
            }
        }
    }

    /// One connection attempt: dial, handshake, then run the session.
    ///
    /// `Err` means a retryable setup failure before the session started.
    async fn attempt(&mut self, counters: &mut RetryCounters) -> Result<SessionEnd> {
        let token = match self.auth.ensure_valid().await {
            Ok(token) => token,
            Err(e) => return Ok(SessionEnd::Fatal(auth_failure_info(&e))),
        };

        let mut stream = self.transport.connect(&self.options.endpoint).await?;

        let recovery = self.recovery_for_attempt();
        let attempted_resume = recovery.is_some();
        let mut connect = ProtocolMessage::new(Action::Connect);
        connect.access_token = Some(token);
        if let Some(key) = recovery {
            connect.connection_key = Some(key.connection_key);
            connect.connection_serial = Some(key.connection_serial);
        }
        stream.send(connect).await?;

        let frame = timeout(self.options.heartbeat_timeout, async {
            loop {
                match stream.recv().await? {
                    Some(frame) if matches!(frame.action, Action::Connected | Action::Error) => {
                        return Ok(frame);
                    }
                    Some(_) => {}
                    None => return Err(Error::from(TransportError::Closed)),
                }
            }
        })
        .await
        .map_err(|_elapsed| Error::from(TransportError::Closed))??;

        if frame.action == Action::Error {
            let info = frame
                .error
                .unwrap_or_else(|| ErrorInfo::new(50000, 500, "connection refused"));
            if info.is_token_error() {
                return Ok(SessionEnd::TokenExpired(info));
            }
            return Ok(SessionEnd::Fatal(info));
        }

        self.on_connected(&frame, attempted_resume);
        counters.reset_on_connected();
        info!(connection_id = ?frame.connection_id, "connection established");

        // Publishes written to the previous transport may have died with
        // it. With continuity preserved their serials are still valid, so
        // they go out again ahead of newly queued work; a failed resume
        // already rejected them all.
        for frame in self.acks.pending_frames() {
            stream.send(frame).await?;
        }

        let end = self.run_session(stream.as_mut()).await;
        stream.close().await;
        Ok(end)
    }

    /// Record details from a `connected` frame and surface any resume
    /// failure it reports.
    fn on_connected(&mut self, frame: &ProtocolMessage, attempted_resume: bool) {
        {
            let mut details = self
                .inner
                .details
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            details.id.clone_from(&frame.connection_id);
            details.key.clone_from(&frame.connection_key);
            // A serial of -1 means connected but nothing delivered yet;
            // it still identifies a resumable position.
            details.serial = frame.connection_serial.or(Some(-1));
        }

        if let Some(error) = &frame.error {
            // Continuity was not preserved: in-flight publishes can never
            // be confirmed and serials restart on the new connection.
            warn!(code = error.code, "connection resumed without continuity");
            self.acks.fail_all(|| error.clone().into());
            self.acks.reset_serials();
            self.set_state(ConnectionState::Connected, Some(error.clone()));
            if attempted_resume {
                self.events.on_resume_failure(error);
            }
        } else {
            self.set_state(ConnectionState::Connected, None);
        }
    }

    /// Run an established session until it ends.
    async fn run_session(&mut self, stream: &mut dyn TransportStream) -> SessionEnd {
        let mut heartbeat = interval_at(
            Instant::now() + self.options.heartbeat_interval,
            self.options.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_inbound = Instant::now();

        loop {
            tokio::select! {
                inbound = stream.recv() => match inbound {
                    Ok(Some(frame)) => {
                        last_inbound = Instant::now();
                        if let Some(end) = self.handle_inbound(frame) {
                            return end;
                        }
                    }
                    Ok(None) => return SessionEnd::Lost { error: None },
                    Err(e) => {
                        debug!(error = %e, "transport read failed");
                        return SessionEnd::Lost { error: None };
                    }
                },
                outbound = self.out_rx.recv() => match outbound {
                    Some(Outbound::Frame(frame)) => {
                        if stream.send(frame).await.is_err() {
                            return SessionEnd::Lost { error: None };
                        }
                    }
                    Some(Outbound::Publish { frame, tx }) => {
                        let frame = self.acks.register(frame, tx);
                        trace!(serial = ?frame.msg_serial, "publishing");
                        if stream.send(frame).await.is_err() {
                            return SessionEnd::Lost { error: None };
                        }
                    }
                    // All handles dropped; nothing can observe this
                    // connection any more.
                    None => return SessionEnd::Closed,
                },
                ctrl = self.ctrl_rx.recv() => match ctrl {
                    Some(Ctrl::Close) => return self.close_session(stream).await,
                    Some(Ctrl::Connect) => {}
                    None => return SessionEnd::Closed,
                },
                _ = heartbeat.tick() => {
                    if last_inbound.elapsed() > self.options.heartbeat_timeout {
                        warn!("heartbeat starved, dropping connection");
                        return SessionEnd::Lost { error: None };
                    }
                    if stream.send(ProtocolMessage::new(Action::Heartbeat)).await.is_err() {
                        return SessionEnd::Lost { error: None };
                    }
                }
            }
        }
    }

    /// Orderly close handshake: send `close`, wait briefly for `closed`.
    async fn close_session(&mut self, stream: &mut dyn TransportStream) -> SessionEnd {
        self.set_state(ConnectionState::Closing, None);
        if stream.send(ProtocolMessage::new(Action::Close)).await.is_err() {
            return SessionEnd::Closed;
        }
        let _ = timeout(CLOSE_TIMEOUT, async {
            loop {
                match stream.recv().await {
                    Ok(Some(frame)) if frame.action == Action::Closed => return,
                    Ok(Some(_)) => {}
                    Ok(None) | Err(_) => return,
                }
            }
        })
        .await;
        SessionEnd::Closed
    }

    /// Dispatch one inbound frame. Returns `Some` when the session ends.
    fn handle_inbound(&mut self, frame: ProtocolMessage) -> Option<SessionEnd> {
        if let Some(serial) = frame.connection_serial {
            self.inner
                .details
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .serial = Some(serial);
        }

        match frame.action {
            Action::Heartbeat => None,
            Action::Ack => {
                self.acks
                    .ack(frame.msg_serial.unwrap_or(0), frame.count.unwrap_or(1));
                None
            }
            Action::Nack => {
                let error = frame
                    .error
                    .unwrap_or_else(|| ErrorInfo::new(50001, 500, "message not delivered"));
                self.acks
                    .nack(frame.msg_serial.unwrap_or(0), frame.count.unwrap_or(1), error);
                None
            }
            Action::Disconnected => {
                let error = frame.error;
                if let Some(info) = &error
                    && info.is_token_error()
                {
                    return Some(SessionEnd::TokenExpired(info.clone()));
                }
                Some(SessionEnd::Lost { error })
            }
            Action::Close | Action::Closed => Some(SessionEnd::Closed),
            Action::Error => {
                if frame.channel.is_some() {
                    // Channel-scoped failure; the connection survives.
                    self.events.on_frame(frame);
                    return None;
                }
                let info = frame
                    .error
                    .unwrap_or_else(|| ErrorInfo::new(50000, 500, "connection error"));
                if info.is_token_error() {
                    return Some(SessionEnd::TokenExpired(info));
                }
                Some(SessionEnd::Fatal(info))
            }
            Action::Connected => {
                // Mid-session refresh of connection details.
                self.on_connected(&frame, false);
                None
            }
            Action::Attached
            | Action::Detached
            | Action::Message
            | Action::Presence => {
                self.events.on_frame(frame);
                None
            }
            Action::Connect | Action::Disconnect | Action::Attach | Action::Detach => {
                trace!(action = %frame.action, "ignoring client-to-server frame");
                None
            }
        }
    }

    /// Sleep between attempts, interruptible by close (or an explicit
    /// connect request, which retries immediately).
    async fn wait_for_retry(&mut self, duration: Duration) -> Wait {
        debug!(?duration, "waiting before reconnecting");
        tokio::select! {
            () = sleep(duration) => Wait::Retry,
            ctrl = self.ctrl_rx.recv() => match ctrl {
                Some(Ctrl::Connect) => Wait::Retry,
                Some(Ctrl::Close) | None => Wait::Close,
            },
        }
    }

    /// Enter a terminal state: resolve every pending and queued publish.
    fn finish(&mut self, state: ConnectionState, error: Option<ErrorInfo>) {
        let make_error: Box<dyn Fn() -> Error> = match (&state, &error) {
            (ConnectionState::Failed, Some(info)) => {
                let info = info.clone();
                Box::new(move || info.clone().into())
            }
            _ => Box::new(|| Error::new(Kind::Closed)),
        };
        self.acks.fail_all(&make_error);
        while let Ok(outbound) = self.out_rx.try_recv() {
            if let Outbound::Publish { tx, .. } = outbound {
                let _ = tx.send(Err(make_error()));
            }
        }
        self.set_state(state, error);
    }

    fn set_state(&self, state: ConnectionState, error: Option<ErrorInfo>) {
        if let Some(change) = self.inner.apply_state(state, error) {
            debug!(previous = ?change.previous, current = ?change.current, "connection state changed");
            // Channels react first so that by the time watchers observe
            // the transition, its channel-level effects are in place.
            self.events.on_state_change(&change);
            self.inner.publish_state(change);
        }
    }

    fn recovery_for_attempt(&self) -> Option<RecoveryKey> {
        self.inner
            .recovery_key()
            .or_else(|| self.options.recover.clone())
    }
}

fn auth_failure_info(e: &Error) -> ErrorInfo {
    e.error_info()
        .cloned()
        .unwrap_or_else(|| ErrorInfo::new(80019, 401, format!("token request failed: {e}")))
}
