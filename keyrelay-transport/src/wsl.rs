//! Bridge for WSL and other Unix-like environments.
//!
//! Listens on a Unix domain socket in the user's home directory.  Where the
//! host cannot provide one, falls back to a loopback TCP port and tells the
//! user how to bridge it with `socat`.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{debug, warn};

use crate::{AcceptStrategy, Accepted, Acceptor, Bound, Transport, TransportError, TransportKind};

const ACCEPT_DEADLINE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct WslTransport {
    home: PathBuf,
    socket_name: String,
    relay_socket: String,
}

impl WslTransport {
    pub fn new(home: PathBuf, socket_name: impl Into<String>, relay_socket: impl Into<String>) -> Self {
        Self {
            home,
            socket_name: socket_name.into(),
            relay_socket: relay_socket.into(),
        }
    }

    pub fn socket_path(&self) -> PathBuf {
        self.home.join(&self.socket_name)
    }

    fn tcp_help(&self, port: u16) -> String {
        format!(
            "socat UNIX-LISTEN:{relay},reuseaddr,fork TCP:localhost:{port} &\n\
             export SSH_AUTH_SOCK={relay}",
            relay = self.relay_socket
        )
    }
}

/// Rewrite a Windows drive path to its WSL mount (`C:\Users\me` becomes
/// `/mnt/c/Users/me`).  Other paths only get their separators normalised.
pub fn win_path_to_unix(path: &str) -> String {
    let bytes = path.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        let drive = char::from(bytes[0].to_ascii_lowercase());
        format!("/mnt/{drive}{}", path[2..].replace('\\', "/"))
    } else {
        path.replace('\\', "/")
    }
}

#[async_trait::async_trait]
impl Transport for WslTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Wsl
    }

    async fn bind(&self) -> Result<Bound, TransportError> {
        let path = self.socket_path();
        match bind_unix(&path) {
            Ok(acceptor) => {
                let help = format!(
                    "export SSH_AUTH_SOCK={}",
                    win_path_to_unix(&path.to_string_lossy())
                );
                return Ok(Bound { acceptor, help });
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unix socket unavailable, falling back to TCP");
            }
        }

        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(|source| TransportError::Bind {
                transport: TransportKind::Wsl,
                source,
            })?;
        let port = listener
            .local_addr()
            .map_err(|source| TransportError::Bind {
                transport: TransportKind::Wsl,
                source,
            })?
            .port();
        debug!(port, "wsl bridge listening on loopback TCP");

        Ok(Bound {
            acceptor: Box::new(TcpAcceptor { listener }),
            help: self.tcp_help(port),
        })
    }
}

/// Remove a stale socket file left behind by an earlier run.
fn remove_stale(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(unix)]
fn bind_unix(path: &Path) -> io::Result<Box<dyn Acceptor>> {
    use std::os::unix::fs::PermissionsExt as _;

    remove_stale(path)?;
    let listener = tokio::net::UnixListener::bind(path)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    debug!(path = %path.display(), "wsl bridge listening");
    Ok(Box::new(UnixAcceptor {
        listener,
        path: path.to_path_buf(),
    }))
}

#[cfg(windows)]
fn bind_unix(path: &Path) -> io::Result<Box<dyn Acceptor>> {
    use socket2::{Domain, SockAddr, Socket, Type};

    remove_stale(path)?;
    let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
    socket.bind(&SockAddr::unix(path)?)?;
    socket.listen(128)?;
    debug!(path = %path.display(), "wsl bridge listening");
    Ok(Box::new(SocketFileAcceptor {
        inner: crate::polled::PolledSocketAcceptor::new(socket, ACCEPT_DEADLINE)?,
        path: path.to_path_buf(),
    }))
}

#[cfg(not(any(unix, windows)))]
fn bind_unix(_path: &Path) -> io::Result<Box<dyn Acceptor>> {
    Err(io::Error::from(io::ErrorKind::Unsupported))
}

#[cfg(unix)]
struct UnixAcceptor {
    listener: tokio::net::UnixListener,
    path: PathBuf,
}

#[cfg(unix)]
#[async_trait::async_trait]
impl Acceptor for UnixAcceptor {
    fn strategy(&self) -> AcceptStrategy {
        AcceptStrategy::Poll(ACCEPT_DEADLINE)
    }

    async fn accept(&mut self) -> io::Result<Accepted> {
        let (stream, _) = self.listener.accept().await?;
        Ok(Accepted::Connection(Box::new(stream)))
    }
}

#[cfg(unix)]
impl Drop for UnixAcceptor {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(windows)]
struct SocketFileAcceptor {
    inner: crate::polled::PolledSocketAcceptor,
    path: PathBuf,
}

#[cfg(windows)]
#[async_trait::async_trait]
impl Acceptor for SocketFileAcceptor {
    fn strategy(&self) -> AcceptStrategy {
        self.inner.strategy()
    }

    async fn accept(&mut self) -> io::Result<Accepted> {
        self.inner.accept().await
    }
}

#[cfg(windows)]
impl Drop for SocketFileAcceptor {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

struct TcpAcceptor {
    listener: TcpListener,
}

#[async_trait::async_trait]
impl Acceptor for TcpAcceptor {
    fn strategy(&self) -> AcceptStrategy {
        AcceptStrategy::Poll(ACCEPT_DEADLINE)
    }

    async fn accept(&mut self) -> io::Result<Accepted> {
        let (stream, peer) = self.listener.accept().await?;
        debug!(%peer, "wsl bridge TCP client");
        Ok(Accepted::Connection(Box::new(stream)))
    }
}
