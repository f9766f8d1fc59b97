//! The realtime client: wires auth, the connection driver and the channel
//! registry together.

use std::sync::Arc;

use crate::auth::{Auth, TokenProvider};
use crate::channel::{Channel, Channels};
use crate::config::ClientOptions;
use crate::connection::{Connection, ConnectionInner, Driver};
use crate::transport::{Transport, WebSocketTransport};

/// A realtime pub/sub client.
///
/// Construction spawns a background driver task that owns the connection
/// and begins connecting immediately; must be called within a Tokio
/// runtime. Cheap to clone; all clones share one connection.
///
/// # Example
///
/// ```ignore
/// let options = ClientOptions::new("wss://realtime.example.com")?;
/// let client = Realtime::new(options, Arc::new(MyTokenProvider));
///
/// let channel = client.channels().get("greetings");
/// channel.attach().await?;
/// channel.publish("hello", "world")?.wait().await?;
/// ```
#[derive(Clone)]
pub struct Realtime {
    connection: Connection,
    channels: Channels,
    auth: Arc<Auth>,
}

impl Realtime {
    /// Create a client over the production WebSocket transport and start
    /// connecting.
    #[must_use]
    pub fn new(options: ClientOptions, provider: Arc<dyn TokenProvider>) -> Self {
        Self::with_transport(options, provider, Arc::new(WebSocketTransport))
    }

    /// Create a client over a custom transport. Used for in-process
    /// testing and alternative wire protocols.
    #[must_use]
    pub fn with_transport(
        options: ClientOptions,
        provider: Arc<dyn TokenProvider>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let auth = Arc::new(Auth::new(provider, options.capability.clone()));
        let (inner, queues) = ConnectionInner::new();
        let channels = Channels::new(Arc::clone(&inner), options.clone());
        let driver = Driver::new(
            options,
            Arc::clone(&auth),
            transport,
            channels.events(),
            Arc::clone(&inner),
            queues,
        );
        tokio::spawn(driver.run());
        inner.request_connect();

        Self {
            connection: Connection::new(inner),
            channels,
            auth,
        }
    }

    /// The channel registry.
    #[must_use]
    pub fn channels(&self) -> &Channels {
        &self.channels
    }

    /// Shorthand for `channels().get(name)`.
    #[must_use]
    pub fn channel(&self, name: &str) -> Channel {
        self.channels.get(name)
    }

    /// The connection handle.
    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Token state and renewal.
    #[must_use]
    pub fn auth(&self) -> &Auth {
        &self.auth
    }

    /// Close the connection in an orderly fashion and wait until it is
    /// terminal. Pending publishes are rejected; channels detach.
    pub async fn close(&self) {
        self.connection.close().await;
    }
}
