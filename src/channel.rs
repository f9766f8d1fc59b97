#![expect(
    clippy::module_name_repetitions,
    reason = "Channel types expose their domain in the name for clarity"
)]

//! Named channels: attach lifecycle, publish confirmation handles and
//! per-subscriber bounded fan-out.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::{broadcast, oneshot};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::config::ClientOptions;
use crate::connection::{ConnectionEvents, ConnectionInner, ConnectionState, StateChange};
use crate::error::{Error, Kind, Lagged};
use crate::protocol::{Action, ErrorInfo, Message, PresenceMessage, ProtocolMessage};
use crate::Result;

/// Channel lifecycle state.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Created, never attached
    Initialized,
    /// Attach requested, awaiting confirmation
    Attaching,
    /// Attached; messages flow
    Attached,
    /// Detach requested, awaiting confirmation
    Detaching,
    /// Detached; no delivery until re-attached
    Detached,
    /// Connection suspended; will re-attach when it recovers
    Suspended,
    /// Channel-scoped fatal error; requires an explicit re-attach
    Failed,
}

impl ChannelState {
    /// Whether a transition from `self` to `next` is meaningful.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use ChannelState::{
            Attached, Attaching, Detached, Detaching, Failed, Initialized, Suspended,
        };
        match (self, next) {
            (Initialized, Attaching | Failed)
            | (Attaching, Attached | Detaching | Detached | Suspended | Failed)
            | (Attached, Attached | Attaching | Detaching | Detached | Suspended | Failed)
            | (Detaching, Detached | Attaching | Failed)
            | (Detached, Attaching | Failed)
            | (Suspended, Attaching | Detaching | Detached | Failed)
            | (Failed, Attaching) => true,
            _ => false,
        }
    }
}

/// Event fanned out to channel subscribers.
#[derive(Debug, Clone)]
enum ChannelEvent {
    Message(Message),
    Presence(PresenceMessage),
    /// Delivery has ended for good (connection closed or channel failed).
    Terminated,
}

struct ChannelStateData {
    current: ChannelState,
    error: Option<ErrorInfo>,
    attach_waiters: Vec<oneshot::Sender<Result<()>>>,
    detach_waiters: Vec<oneshot::Sender<Result<()>>>,
}

struct ChannelInner {
    name: String,
    conn: Arc<ConnectionInner>,
    no_echo: bool,
    client_id: Option<String>,
    state: Mutex<ChannelStateData>,
    fanout: broadcast::Sender<ChannelEvent>,
}

impl ChannelInner {
    fn new(name: String, conn: Arc<ConnectionInner>, options: &ClientOptions) -> Self {
        let (fanout, _) = broadcast::channel(options.queue_capacity);
        Self {
            name,
            conn,
            no_echo: options.no_echo,
            client_id: options.client_id.clone(),
            state: Mutex::new(ChannelStateData {
                current: ChannelState::Initialized,
                error: None,
                attach_waiters: Vec::new(),
                detach_waiters: Vec::new(),
            }),
            fanout,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ChannelStateData> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Apply a state transition under the lock, skipping invalid ones.
    fn set_state(
        data: &mut ChannelStateData,
        name: &str,
        next: ChannelState,
        error: Option<ErrorInfo>,
    ) -> bool {
        if !data.current.can_transition_to(next) {
            trace!(
                channel = name,
                previous = ?data.current,
                ?next,
                "skipping invalid channel transition"
            );
            return false;
        }
        debug!(channel = name, previous = ?data.current, current = ?next, "channel state changed");
        data.current = next;
        data.error = error;
        true
    }

    fn termination_error(&self) -> Error {
        let data = self.lock();
        match (&data.current, &data.error) {
            (ChannelState::Failed, Some(info)) => info.clone().into(),
            _ => Error::new(Kind::Closed),
        }
    }

    /// Queue an attach frame and mark the channel Attaching.
    fn begin_attach(&self, error: Option<ErrorInfo>) -> Result<()> {
        {
            let mut data = self.lock();
            if data.current == ChannelState::Attaching {
                return Ok(());
            }
            if !Self::set_state(&mut data, &self.name, ChannelState::Attaching, error) {
                return Ok(());
            }
        }
        self.conn
            .send_frame(ProtocolMessage::for_channel(Action::Attach, &self.name))
    }

    /// Handle a channel-scoped inbound frame from the driver task.
    fn handle_frame(&self, frame: ProtocolMessage) {
        match frame.action {
            Action::Attached => {
                let waiters = {
                    let mut data = self.lock();
                    Self::set_state(&mut data, &self.name, ChannelState::Attached, frame.error);
                    std::mem::take(&mut data.attach_waiters)
                };
                for tx in waiters {
                    let _ = tx.send(Ok(()));
                }
            }
            Action::Detached => self.handle_detached(frame.error),
            Action::Message => {
                let own_id = self.no_echo.then(|| self.conn.connection_id()).flatten();
                for message in frame.messages {
                    if let Some(own) = &own_id
                        && message.connection_id.as_deref() == Some(own)
                    {
                        trace!(channel = %self.name, "suppressing echoed message");
                        continue;
                    }
                    let _ = self.fanout.send(ChannelEvent::Message(message));
                }
            }
            Action::Presence => {
                for presence in frame.presence {
                    let _ = self.fanout.send(ChannelEvent::Presence(presence));
                }
            }
            Action::Error => {
                let info = frame
                    .error
                    .unwrap_or_else(|| ErrorInfo::new(50000, 500, "channel error"));
                warn!(channel = %self.name, code = info.code, "channel failed");
                self.fail(&info);
            }
            _ => {}
        }
    }

    /// An unsolicited detach re-attaches once; a requested one completes.
    fn handle_detached(&self, error: Option<ErrorInfo>) {
        let (waiters, reattach) = {
            let mut data = self.lock();
            if data.current == ChannelState::Detaching {
                Self::set_state(&mut data, &self.name, ChannelState::Detached, error.clone());
                (std::mem::take(&mut data.detach_waiters), false)
            } else if matches!(data.current, ChannelState::Attached | ChannelState::Attaching) {
                debug!(channel = %self.name, "server detached channel, re-attaching");
                (Vec::new(), true)
            } else {
                Self::set_state(&mut data, &self.name, ChannelState::Detached, error.clone());
                (Vec::new(), false)
            }
        };
        for tx in waiters {
            let _ = tx.send(Ok(()));
        }
        if reattach {
            // Force back through Attaching even though we were Attached.
            {
                let mut data = self.lock();
                Self::set_state(&mut data, &self.name, ChannelState::Attaching, error.clone());
            }
            let _ = self
                .conn
                .send_frame(ProtocolMessage::for_channel(Action::Attach, &self.name));
        }
    }

    /// Move to Failed, resolve all waiters with the error and end delivery.
    fn fail(&self, info: &ErrorInfo) {
        let (attach_waiters, detach_waiters) = {
            let mut data = self.lock();
            Self::set_state(
                &mut data,
                &self.name,
                ChannelState::Failed,
                Some(info.clone()),
            );
            (
                std::mem::take(&mut data.attach_waiters),
                std::mem::take(&mut data.detach_waiters),
            )
        };
        for tx in attach_waiters.into_iter().chain(detach_waiters) {
            let _ = tx.send(Err(info.clone().into()));
        }
        let _ = self.fanout.send(ChannelEvent::Terminated);
    }

    /// Force Detached when the connection goes away for good.
    fn detach_for_shutdown(&self) {
        let (attach_waiters, detach_waiters) = {
            let mut data = self.lock();
            if matches!(data.current, ChannelState::Failed | ChannelState::Detached) {
                return;
            }
            Self::set_state(&mut data, &self.name, ChannelState::Detached, None);
            (
                std::mem::take(&mut data.attach_waiters),
                std::mem::take(&mut data.detach_waiters),
            )
        };
        for tx in attach_waiters {
            let _ = tx.send(Err(Error::new(Kind::Closed)));
        }
        for tx in detach_waiters {
            let _ = tx.send(Ok(()));
        }
        let _ = self.fanout.send(ChannelEvent::Terminated);
    }
}

/// A named channel handle. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[must_use]
    pub fn state(&self) -> ChannelState {
        self.inner.lock().current
    }

    /// The error behind the current state, if the last transition carried one.
    #[must_use]
    pub fn error_reason(&self) -> Option<ErrorInfo> {
        self.inner.lock().error.clone()
    }

    /// Attach and wait for server confirmation.
    pub async fn attach(&self) -> Result<()> {
        let rx = {
            let mut data = self.inner.lock();
            if data.current == ChannelState::Attached {
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            data.attach_waiters.push(tx);
            rx
        };
        self.inner.begin_attach(None)?;
        rx.await.map_err(|_closed| Error::new(Kind::Closed))?
    }

    /// Detach and wait for server confirmation.
    pub async fn detach(&self) -> Result<()> {
        let rx = {
            let mut data = self.inner.lock();
            match data.current {
                ChannelState::Initialized | ChannelState::Detached => return Ok(()),
                ChannelState::Failed => {
                    return Err(Error::state(format!(
                        "cannot detach failed channel {:?}",
                        self.inner.name
                    )));
                }
                _ => {}
            }
            let (tx, rx) = oneshot::channel();
            data.detach_waiters.push(tx);
            if data.current != ChannelState::Detaching {
                ChannelInner::set_state(
                    &mut data,
                    &self.inner.name,
                    ChannelState::Detaching,
                    None,
                );
            }
            rx
        };
        self.inner
            .conn
            .send_frame(ProtocolMessage::for_channel(Action::Detach, self.name()))?;
        rx.await.map_err(|_closed| Error::new(Kind::Closed))?
    }

    /// Publish a single named message. Returns a handle that resolves when
    /// the server acknowledges (or rejects) it.
    ///
    /// Attaches implicitly from Initialized or Detached. Publishing on a
    /// Failed channel is rejected immediately.
    pub fn publish(
        &self,
        name: impl Into<String>,
        data: impl Into<serde_json::Value>,
    ) -> Result<PendingPublish> {
        self.publish_messages(vec![Message::new(name, data)])
    }

    /// Publish a batch of messages as one frame, confirmed atomically.
    pub fn publish_messages(&self, mut messages: Vec<Message>) -> Result<PendingPublish> {
        {
            let data = self.inner.lock();
            if data.current == ChannelState::Failed {
                return Err(Error::state(format!(
                    "cannot publish on failed channel {:?}",
                    self.inner.name
                )));
            }
        }
        if matches!(
            self.state(),
            ChannelState::Initialized | ChannelState::Detached
        ) {
            self.inner.begin_attach(None)?;
        }
        if let Some(client_id) = &self.inner.client_id {
            for message in &mut messages {
                if message.client_id.is_none() {
                    message.client_id = Some(client_id.clone());
                }
            }
        }
        let frame = ProtocolMessage::publish(self.name(), messages);
        let rx = self.inner.conn.send_publish(frame)?;
        Ok(PendingPublish { rx })
    }

    /// Subscribe to all messages on this channel.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.inner.fanout.subscribe(),
            channel: Arc::clone(&self.inner),
            filter: None,
        }
    }

    /// Subscribe to messages with a specific name.
    #[must_use]
    pub fn subscribe_to(&self, name: impl Into<String>) -> Subscription {
        Subscription {
            rx: self.inner.fanout.subscribe(),
            channel: Arc::clone(&self.inner),
            filter: Some(name.into()),
        }
    }

    /// Subscribe to presence events on this channel.
    #[must_use]
    pub fn subscribe_presence(&self) -> PresenceSubscription {
        PresenceSubscription {
            rx: self.inner.fanout.subscribe(),
            channel: Arc::clone(&self.inner),
        }
    }
}

/// A publish awaiting server confirmation.
///
/// Dropping the handle publishes fire-and-forget; the message is still
/// sent and acknowledged, just unobserved.
#[must_use = "dropping this handle discards the delivery confirmation"]
pub struct PendingPublish {
    rx: oneshot::Receiver<Result<()>>,
}

impl PendingPublish {
    /// Wait for the server to acknowledge or reject the publish.
    pub async fn wait(self) -> Result<()> {
        self.rx.await.map_err(|_closed| Error::new(Kind::Closed))?
    }

    /// Wait with a deadline. Elapsing yields a Timeout error; the publish
    /// itself may still succeed on the server.
    pub async fn wait_timeout(self, duration: std::time::Duration) -> Result<()> {
        match timeout(duration, self.rx).await {
            Ok(result) => result.map_err(|_closed| Error::new(Kind::Closed))?,
            Err(_elapsed) => Err(Error::new(Kind::Timeout)),
        }
    }
}

/// A message subscription backed by a bounded queue.
///
/// A slow subscriber drops its oldest messages: `recv` reports the gap as
/// a [`Lagged`] error once, then resumes with the next retained message.
pub struct Subscription {
    rx: broadcast::Receiver<ChannelEvent>,
    channel: Arc<ChannelInner>,
    filter: Option<String>,
}

impl Subscription {
    /// Receive the next message, waiting if none is queued.
    pub async fn recv(&mut self) -> Result<Message> {
        loop {
            match self.rx.recv().await {
                Ok(ChannelEvent::Message(message)) => {
                    if let Some(filter) = &self.filter
                        && message.name.as_deref() != Some(filter.as_str())
                    {
                        continue;
                    }
                    return Ok(message);
                }
                Ok(ChannelEvent::Presence(_)) => {}
                Ok(ChannelEvent::Terminated) => return Err(self.channel.termination_error()),
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    return Err(Lagged { count }.into());
                }
                Err(broadcast::error::RecvError::Closed) => return Err(Error::new(Kind::Closed)),
            }
        }
    }

    /// Stop receiving. Equivalent to dropping the subscription.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

/// A presence subscription backed by the same bounded queue.
pub struct PresenceSubscription {
    rx: broadcast::Receiver<ChannelEvent>,
    channel: Arc<ChannelInner>,
}

impl PresenceSubscription {
    pub async fn recv(&mut self) -> Result<PresenceMessage> {
        loop {
            match self.rx.recv().await {
                Ok(ChannelEvent::Presence(presence)) => return Ok(presence),
                Ok(ChannelEvent::Message(_)) => {}
                Ok(ChannelEvent::Terminated) => return Err(self.channel.termination_error()),
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    return Err(Lagged { count }.into());
                }
                Err(broadcast::error::RecvError::Closed) => return Err(Error::new(Kind::Closed)),
            }
        }
    }
}

/// The channel registry: lazily creates channels and routes connection
/// events into them.
#[derive(Clone)]
pub struct Channels {
    inner: Arc<ChannelsInner>,
}

pub(crate) struct ChannelsInner {
    conn: Arc<ConnectionInner>,
    options: ClientOptions,
    map: DashMap<String, Arc<ChannelInner>>,
}

impl Channels {
    pub(crate) fn new(conn: Arc<ConnectionInner>, options: ClientOptions) -> Self {
        Self {
            inner: Arc::new(ChannelsInner {
                conn,
                options,
                map: DashMap::new(),
            }),
        }
    }

    pub(crate) fn events(&self) -> Arc<ChannelsInner> {
        Arc::clone(&self.inner)
    }

    /// Get or lazily create the channel with the given name.
    ///
    /// Repeated calls with the same name return handles to the same
    /// channel.
    #[must_use]
    pub fn get(&self, name: &str) -> Channel {
        let inner = self
            .inner
            .map
            .entry(name.to_owned())
            .or_insert_with(|| {
                Arc::new(ChannelInner::new(
                    name.to_owned(),
                    Arc::clone(&self.inner.conn),
                    &self.inner.options,
                ))
            })
            .clone();
        Channel { inner }
    }

    /// Whether a channel with this name exists in the registry.
    #[must_use]
    pub fn exists(&self, name: &str) -> bool {
        self.inner.map.contains_key(name)
    }

    /// Handles to every channel currently in the registry.
    #[must_use]
    pub fn all(&self) -> Vec<Channel> {
        self.inner
            .map
            .iter()
            .map(|entry| Channel {
                inner: Arc::clone(entry.value()),
            })
            .collect()
    }

    /// Remove a channel from the registry. Only Initialized, Detached or
    /// Failed channels may be released.
    pub fn release(&self, name: &str) -> Result<()> {
        let Some(entry) = self.inner.map.get(name) else {
            return Ok(());
        };
        let state = entry.value().lock().current;
        drop(entry);
        if !matches!(
            state,
            ChannelState::Initialized | ChannelState::Detached | ChannelState::Failed
        ) {
            return Err(Error::state(format!(
                "cannot release channel {name:?} while {state:?}"
            )));
        }
        self.inner.map.remove(name);
        Ok(())
    }
}

impl ChannelsInner {
    fn for_each(&self, f: impl Fn(&ChannelInner)) {
        for entry in &self.map {
            f(entry.value());
        }
    }
}

impl ConnectionEvents for ChannelsInner {
    fn on_frame(&self, frame: ProtocolMessage) {
        let Some(name) = frame.channel.clone() else {
            trace!(action = %frame.action, "dropping channel frame without a channel");
            return;
        };
        // Frames for channels nobody asked for are dropped, not registered.
        if let Some(entry) = self.map.get(&name) {
            let channel = Arc::clone(entry.value());
            drop(entry);
            channel.handle_frame(frame);
        }
    }

    fn on_state_change(&self, change: &StateChange) {
        match change.current {
            ConnectionState::Suspended => {
                self.for_each(|channel| {
                    let mut data = channel.lock();
                    if matches!(
                        data.current,
                        ChannelState::Attaching | ChannelState::Attached
                    ) {
                        ChannelInner::set_state(
                            &mut data,
                            &channel.name,
                            ChannelState::Suspended,
                            change.error.clone(),
                        );
                    }
                });
            }
            ConnectionState::Connected => {
                // Channels waiting out the outage go back through attach.
                // An Attaching channel's original frame may have died with
                // the old session, so its attach is re-sent outright.
                self.for_each(|channel| {
                    let state = channel.lock().current;
                    match state {
                        ChannelState::Suspended => {
                            let _ = channel.begin_attach(None);
                        }
                        ChannelState::Attaching => {
                            let _ = channel.conn.send_frame(ProtocolMessage::for_channel(
                                Action::Attach,
                                &channel.name,
                            ));
                        }
                        _ => {}
                    }
                });
            }
            ConnectionState::Failed => {
                let info = change
                    .error
                    .clone()
                    .unwrap_or_else(|| ErrorInfo::new(50000, 500, "connection failed"));
                self.for_each(|channel| {
                    let state = channel.lock().current;
                    if !matches!(state, ChannelState::Initialized | ChannelState::Detached) {
                        channel.fail(&info);
                    }
                });
            }
            ConnectionState::Closed => {
                self.for_each(ChannelInner::detach_for_shutdown);
            }
            _ => {}
        }
    }

    fn on_resume_failure(&self, _error: &ErrorInfo) {
        // Suspended and Attaching channels are re-attached by the Connected
        // transition; the broken continuity additionally invalidates
        // channels that stayed Attached.
        self.for_each(|channel| {
            let state = channel.lock().current;
            if state == ChannelState::Attached {
                let _ = channel.begin_attach(None);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_lifecycle_transitions() {
        assert!(ChannelState::Initialized.can_transition_to(ChannelState::Attaching));
        assert!(ChannelState::Attaching.can_transition_to(ChannelState::Attached));
        assert!(ChannelState::Attached.can_transition_to(ChannelState::Detaching));
        assert!(ChannelState::Detaching.can_transition_to(ChannelState::Detached));
        assert!(ChannelState::Detached.can_transition_to(ChannelState::Attaching));
    }

    #[test]
    fn failed_only_leaves_via_attach() {
        assert!(ChannelState::Failed.can_transition_to(ChannelState::Attaching));
        assert!(!ChannelState::Failed.can_transition_to(ChannelState::Attached));
        assert!(!ChannelState::Failed.can_transition_to(ChannelState::Detached));
    }

    #[test]
    fn initialized_cannot_jump_to_attached() {
        assert!(!ChannelState::Initialized.can_transition_to(ChannelState::Attached));
        assert!(!ChannelState::Initialized.can_transition_to(ChannelState::Detaching));
    }

    #[test]
    fn suspension_paths() {
        assert!(ChannelState::Attached.can_transition_to(ChannelState::Suspended));
        assert!(ChannelState::Attaching.can_transition_to(ChannelState::Suspended));
        assert!(ChannelState::Suspended.can_transition_to(ChannelState::Attaching));
        assert!(!ChannelState::Detached.can_transition_to(ChannelState::Suspended));
    }

    #[tokio::test]
    async fn registry_returns_same_channel_for_same_name() {
        let (conn, _queues) = ConnectionInner::new();
        let options = ClientOptions::new("wss://realtime.example.com").unwrap();
        let channels = Channels::new(conn, options);

        let a = channels.get("orders");
        let b = channels.get("orders");
        assert!(Arc::ptr_eq(&a.inner, &b.inner));
        assert!(channels.exists("orders"));
        assert!(!channels.exists("other"));
        assert_eq!(channels.all().len(), 1);
    }

    #[tokio::test]
    async fn release_rejects_active_channels() {
        let (conn, _queues) = ConnectionInner::new();
        let options = ClientOptions::new("wss://realtime.example.com").unwrap();
        let channels = Channels::new(conn, options);

        let channel = channels.get("orders");
        {
            let mut data = channel.inner.lock();
            ChannelInner::set_state(&mut data, "orders", ChannelState::Attaching, None);
            ChannelInner::set_state(&mut data, "orders", ChannelState::Attached, None);
        }
        assert!(channels.release("orders").is_err());

        {
            let mut data = channel.inner.lock();
            ChannelInner::set_state(&mut data, "orders", ChannelState::Detaching, None);
            ChannelInner::set_state(&mut data, "orders", ChannelState::Detached, None);
        }
        channels.release("orders").unwrap();
        assert!(!channels.exists("orders"));
    }

    #[tokio::test]
    async fn frames_for_unknown_channels_are_dropped() {
        let (conn, _queues) = ConnectionInner::new();
        let options = ClientOptions::new("wss://realtime.example.com").unwrap();
        let channels = Channels::new(conn, options);

        let frame = ProtocolMessage::for_channel(Action::Attached, "never-asked-for");
        channels.events().on_frame(frame);
        assert!(!channels.exists("never-asked-for"));
    }
}
