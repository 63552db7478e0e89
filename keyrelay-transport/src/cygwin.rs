//! Cygwin and MSYS2 emulated Unix sockets.
//!
//! Cygwin implements `AF_UNIX` as a loopback TCP port plus a marker file
//! that names the port and a 16-byte key.  A client connects to the port,
//! sends the key, and expects it echoed; it then sends its pid, uid and gid
//! and expects the server's in return.  After that the stream carries the
//! agent protocol unchanged.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};
use tokio::net::TcpListener;
use tracing::debug;

use crate::{AcceptStrategy, Accepted, Acceptor, Bound, Transport, TransportError, TransportKind};

/// A client that has not finished the handshake by then is dropped.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// The key a client must present, as written into the socket file.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct SocketKey([u8; 16]);

impl SocketKey {
    fn random() -> Self {
        Self(rand::random())
    }

    /// The marker file: `!<socket >PORT s XXXXXXXX-XXXXXXXX-XXXXXXXX-XXXXXXXX`
    /// and a trailing NUL.  Each group is one little-endian word of the key.
    fn file_contents(&self, port: u16) -> Vec<u8> {
        let words: Vec<String> = self
            .0
            .chunks_exact(4)
            .map(|w| format!("{:08X}", u32::from_le_bytes([w[0], w[1], w[2], w[3]])))
            .collect();
        let mut contents = format!("!<socket >{port} s {}", words.join("-")).into_bytes();
        contents.push(0);
        contents
    }
}

impl std::fmt::Debug for SocketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SocketKey(..)")
    }
}

#[derive(Debug, Clone)]
pub struct CygwinTransport {
    path: PathBuf,
}

impl CygwinTransport {
    pub fn new(home: PathBuf, socket_name: impl AsRef<Path>) -> Self {
        Self {
            path: home.join(socket_name),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.path
    }

    fn help(&self) -> String {
        format!(
            "export SSH_AUTH_SOCK=\"$(cygpath -u '{}')\"",
            self.path.display()
        )
    }
}

#[async_trait::async_trait]
impl Transport for CygwinTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Cygwin
    }

    async fn bind(&self) -> Result<Bound, TransportError> {
        let bind_err = |source| TransportError::Bind {
            transport: TransportKind::Cygwin,
            source,
        };
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.map_err(bind_err)?;
        let port = listener.local_addr().map_err(bind_err)?.port();
        let key = SocketKey::random();
        write_socket_file(&self.path, &key.file_contents(port)).map_err(bind_err)?;
        debug!(path = %self.path.display(), port, "cygwin socket listening");

        Ok(Bound {
            acceptor: Box::new(CygwinAcceptor {
                listener,
                key,
                path: self.path.clone(),
            }),
            help: self.help(),
        })
    }
}

fn write_socket_file(path: &Path, contents: &[u8]) -> io::Result<()> {
    use std::io::Write as _;

    match std::fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
        _ => {}
    }
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(windows)]
    {
        use std::os::windows::fs::OpenOptionsExt as _;
        // Cygwin only treats files with the system attribute as sockets.
        const FILE_ATTRIBUTE_SYSTEM: u32 = 0x4;
        options.attributes(FILE_ATTRIBUTE_SYSTEM);
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt as _;
        options.mode(0o600);
    }
    options.open(path)?.write_all(contents)
}

/// Server side of the Cygwin socket handshake.
pub(crate) async fn handshake<S>(stream: &mut S, key: &SocketKey) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let mut presented = [0u8; 16];
    stream.read_exact(&mut presented).await?;
    if presented != key.0 {
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "client presented the wrong socket key",
        ));
    }
    stream.write_all(&presented).await?;

    // pid, uid, gid.  The peer's uid and gid are echoed with our pid.
    let mut credentials = [0u8; 12];
    stream.read_exact(&mut credentials).await?;
    credentials[..4].copy_from_slice(&std::process::id().to_le_bytes());
    stream.write_all(&credentials).await?;
    stream.flush().await
}

struct CygwinAcceptor {
    listener: TcpListener,
    key: SocketKey,
    path: PathBuf,
}

#[async_trait::async_trait]
impl Acceptor for CygwinAcceptor {
    fn strategy(&self) -> AcceptStrategy {
        AcceptStrategy::InterruptOnClose
    }

    async fn accept(&mut self) -> io::Result<Accepted> {
        loop {
            let (mut stream, peer) = self.listener.accept().await?;
            let greeted = handshake(&mut stream, &self.key);
            match tokio::time::timeout(HANDSHAKE_TIMEOUT, greeted).await {
                Ok(Ok(())) => return Ok(Accepted::Connection(Box::new(stream))),
                Ok(Err(e)) => debug!(%peer, error = %e, "cygwin handshake failed"),
                Err(_) => debug!(%peer, "cygwin handshake timed out"),
            }
        }
    }
}

impl Drop for CygwinAcceptor {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
