use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;

use crate::protocol::ErrorInfo;

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// I/O failure or unexpected stream closure; recovered by reconnecting
    Transport,
    /// Server-sent error frame that is not a token-expiry signal
    Protocol,
    /// Operation invalid for the current connection or channel state
    State,
    /// Token renewal failed or credentials were rejected
    Auth,
    /// The client was closed; no further delivery or acknowledgement
    Closed,
    /// A caller-supplied wait deadline elapsed
    Timeout,
    /// Internal error from dependencies
    Internal,
}

#[derive(Debug)]
pub struct Error {
    kind: Kind,
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    backtrace: Backtrace,
}

impl Error {
    pub fn with_source<S: StdError + Send + Sync + 'static>(kind: Kind, source: S) -> Self {
        Self {
            kind,
            source: Some(Box::new(source)),
            backtrace: Backtrace::capture(),
        }
    }

    #[must_use]
    pub fn new(kind: Kind) -> Self {
        Self {
            kind,
            source: None,
            backtrace: Backtrace::capture(),
        }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    pub fn inner(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.source.as_deref()
    }

    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        let e = self.source.as_deref()?;
        e.downcast_ref::<E>()
    }

    pub fn state<S: Into<String>>(message: S) -> Self {
        StateError {
            reason: message.into(),
        }
        .into()
    }

    /// The server-reported error details, if this error originated from a
    /// protocol `error` or `nack` frame.
    #[must_use]
    pub fn error_info(&self) -> Option<&ErrorInfo> {
        self.downcast_ref::<ErrorInfo>()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(src) => write!(f, "{:?}: {}", self.kind, src),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

/// An operation was rejected because the target is in the wrong state,
/// e.g. publishing on a failed channel. Never transmitted.
#[non_exhaustive]
#[derive(Debug)]
pub struct StateError {
    pub reason: String,
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid state: {}", self.reason)
    }
}

impl StdError for StateError {}

impl From<StateError> for Error {
    fn from(err: StateError) -> Self {
        Error::with_source(Kind::State, err)
    }
}

/// Transport-level failure variants.
#[non_exhaustive]
#[derive(Debug)]
pub enum TransportError {
    /// Error connecting to or communicating with the websocket endpoint
    Connection(tokio_tungstenite::tungstenite::Error),
    /// The underlying stream closed while the session was still wanted
    Closed,
    /// A frame could not be encoded or decoded
    Codec(serde_json::Error),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(e) => write!(f, "transport connection error: {e}"),
            Self::Closed => write!(f, "transport stream closed"),
            Self::Codec(e) => write!(f, "frame codec error: {e}"),
        }
    }
}

impl StdError for TransportError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Connection(e) => Some(e),
            Self::Codec(e) => Some(e),
            Self::Closed => None,
        }
    }
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Error::with_source(Kind::Transport, e)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::with_source(Kind::Transport, TransportError::Connection(e))
    }
}

/// A subscriber fell behind its bounded delivery queue and the oldest
/// messages were dropped. Delivery continues with the next message.
#[non_exhaustive]
#[derive(Debug, Clone, Copy)]
pub struct Lagged {
    /// Number of messages that were missed
    pub count: u64,
}

impl fmt::Display for Lagged {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subscription lagged, missed {} messages", self.count)
    }
}

impl StdError for Lagged {}

impl From<Lagged> for Error {
    fn from(e: Lagged) -> Self {
        Error::with_source(Kind::Internal, e)
    }
}

impl From<ErrorInfo> for Error {
    fn from(info: ErrorInfo) -> Self {
        let kind = if info.is_token_error() {
            Kind::Auth
        } else {
            Kind::Protocol
        };
        Error::with_source(kind, info)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::with_source(Kind::Internal, e)
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::with_source(Kind::Internal, e)
    }
}
