//! Realtime publish/subscribe messaging client.
//!
//! Connects to a realtime endpoint over WebSocket, maintains the session
//! through disconnections with exponential backoff and resume, and exposes
//! named channels for publishing and subscribing.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use chrono::{Duration, Utc};
//! use relay_client_sdk::auth::{Token, TokenProvider};
//! use relay_client_sdk::config::ClientOptions;
//! use relay_client_sdk::Realtime;
//!
//! struct StaticProvider;
//!
//! #[async_trait::async_trait]
//! impl TokenProvider for StaticProvider {
//!     async fn request_token(&self, capability: &str) -> relay_client_sdk::Result<Token> {
//!         Ok(Token::new("secret", capability, Utc::now() + Duration::hours(1)))
//!     }
//! }
//!
//! # async fn run() -> relay_client_sdk::Result<()> {
//! let options = ClientOptions::new("wss://realtime.example.com")?;
//! let client = Realtime::new(options, Arc::new(StaticProvider));
//!
//! let channel = client.channels().get("greetings");
//! channel.attach().await?;
//!
//! // Publish and wait for the server's delivery confirmation.
//! channel.publish("hello", "world")?.wait().await?;
//!
//! // Subscribe; each subscriber has its own bounded queue.
//! let mut subscription = channel.subscribe();
//! let message = subscription.recv().await?;
//! println!("{:?}: {:?}", message.name, message.data);
//!
//! client.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Delivery guarantees
//!
//! Publishes are confirmed per message in submission order: an `ack` or
//! `nack` from the server resolves the [`channel::PendingPublish`] handle.
//! Across a successful resume, unconfirmed publishes are written to the
//! new transport again and still confirm; when continuity is lost, every
//! outstanding publish is rejected so the caller can decide whether to
//! retry.
//!
//! # Connection recovery
//!
//! The connection retries with exponential backoff after transient
//! failures, moving to `Suspended` (slower cadence) after repeated ones.
//! A [`config::RecoveryKey`] can carry the resume position across
//! processes.

mod ack;
pub mod auth;
pub mod channel;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod transport;

pub use client::Realtime;
pub use error::Error;

/// Convenience alias for results with this crate's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
