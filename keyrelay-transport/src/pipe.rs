//! Windows named pipe, the channel used by the Win32 OpenSSH client.

use crate::{Bound, Transport, TransportError, TransportKind};

#[derive(Debug, Clone)]
pub struct NamedPipeTransport {
    pipe_name: String,
}

impl NamedPipeTransport {
    pub fn new(pipe_name: impl Into<String>) -> Self {
        Self {
            pipe_name: pipe_name.into(),
        }
    }

    /// Instructions for OpenSSH and SecureCRT.
    pub fn help_text(&self) -> String {
        format!(
            "set SSH_AUTH_SOCK={name}\nsetx \"VANDYKE_SSH_AUTH_SOCK\" \"{name}\"",
            name = self.pipe_name
        )
    }
}

#[async_trait::async_trait]
impl Transport for NamedPipeTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::NamedPipe
    }

    async fn bind(&self) -> Result<Bound, TransportError> {
        Ok(Bound {
            acceptor: bind_pipe(&self.pipe_name)?,
            help: self.help_text(),
        })
    }
}

#[cfg(windows)]
fn bind_pipe(name: &str) -> Result<Box<dyn crate::Acceptor>, TransportError> {
    let acceptor = imp::PipeAcceptor::bind(name).map_err(|source| TransportError::Bind {
        transport: TransportKind::NamedPipe,
        source,
    })?;
    Ok(Box::new(acceptor))
}

#[cfg(not(windows))]
fn bind_pipe(_name: &str) -> Result<Box<dyn crate::Acceptor>, TransportError> {
    Err(TransportError::Unsupported(TransportKind::NamedPipe))
}

#[cfg(windows)]
mod imp {
    use std::io;

    use tokio::net::windows::named_pipe::{NamedPipeServer, ServerOptions};
    use tracing::debug;

    use crate::{AcceptStrategy, Accepted, Acceptor};

    /// Always holds one unconnected pipe instance so a client arriving while
    /// the previous one is being handed off still finds a server.
    pub(super) struct PipeAcceptor {
        name: String,
        pending: NamedPipeServer,
    }

    impl PipeAcceptor {
        pub(super) fn bind(name: &str) -> io::Result<Self> {
            let pending = ServerOptions::new()
                .first_pipe_instance(true)
                .create(name)?;
            debug!(pipe = name, "named pipe created");
            Ok(Self {
                name: name.to_string(),
                pending,
            })
        }
    }

    #[async_trait::async_trait]
    impl Acceptor for PipeAcceptor {
        fn strategy(&self) -> AcceptStrategy {
            AcceptStrategy::InterruptOnClose
        }

        async fn accept(&mut self) -> io::Result<Accepted> {
            self.pending.connect().await?;
            let next = ServerOptions::new().create(&self.name)?;
            let connected = std::mem::replace(&mut self.pending, next);
            Ok(Accepted::Connection(Box::new(connected)))
        }
    }
}
