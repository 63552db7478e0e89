//! Transports that accept agent connections.
//!
//! Every IPC channel is a [`Transport`]: binding it yields an [`Acceptor`]
//! plus the help text that tells users how to point clients at it.  The
//! generic [`Listener`](listener::Listener) drives any acceptor: it owns the
//! accept loop, spawns one task per connection, and drains them on shutdown.
//!
//! Transports whose OS primitive is missing on the current host bind to
//! [`TransportError::Unsupported`] instead of failing to compile.

use std::fmt;
use std::io;
use std::time::Duration;

use keyrelay_core::BoxedStream;

pub mod cygwin;
pub mod hyperv;
pub mod listener;
pub mod pageant;
pub mod pipe;
mod polled;
pub mod wsl;

pub use cygwin::CygwinTransport;
pub use hyperv::{HyperVConnector, HyperVTransport};
pub use listener::{Listener, ListenerState};
pub use pageant::PageantTransport;
pub use pipe::NamedPipeTransport;
pub use wsl::WslTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    NamedPipe,
    Wsl,
    Cygwin,
    HyperV,
    Pageant,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NamedPipe => "named-pipe",
            Self::Wsl => "wsl",
            Self::Cygwin => "cygwin",
            Self::HyperV => "hyperv",
            Self::Pageant => "pageant",
        })
    }
}

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("{transport}: bind failed: {source}")]
    Bind {
        transport: TransportKind,
        #[source]
        source: io::Error,
    },
    #[error("{0} is not supported on this host")]
    Unsupported(TransportKind),
    #[error("{transport}: accept failed: {source}")]
    Accept {
        transport: TransportKind,
        #[source]
        source: io::Error,
    },
}

/// How the accept loop notices cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptStrategy {
    /// Accepts are raced against cancellation; dropping the pending accept
    /// interrupts it.
    InterruptOnClose,
    /// Each accept gives up after the deadline and the loop re-checks
    /// cancellation before trying again.
    Poll(Duration),
}

/// Outcome of one accept attempt.
pub enum Accepted {
    Connection(BoxedStream),
    /// The poll deadline passed without a client.
    TimedOut,
    /// The underlying resource was closed; the loop ends gracefully.
    Closed,
}

impl fmt::Debug for Accepted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(_) => f.write_str("Connection(..)"),
            Self::TimedOut => f.write_str("TimedOut"),
            Self::Closed => f.write_str("Closed"),
        }
    }
}

/// A bound OS resource producing connections.  Dropping it releases the
/// resource.
#[async_trait::async_trait]
pub trait Acceptor: Send {
    fn strategy(&self) -> AcceptStrategy;

    async fn accept(&mut self) -> io::Result<Accepted>;
}

/// Result of binding a transport.
pub struct Bound {
    pub acceptor: Box<dyn Acceptor>,
    /// How clients should be configured to reach this transport.
    pub help: String,
}

#[async_trait::async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    fn kind(&self) -> TransportKind;

    async fn bind(&self) -> Result<Bound, TransportError>;
}

/// Serves one accepted connection to completion.
#[async_trait::async_trait]
pub trait ConnectionHandler: Send + Sync {
    async fn handle(&self, stream: BoxedStream);
}
