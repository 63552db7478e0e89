//! Accepting on raw `socket2` sockets that tokio has no listener type for
//! (Hyper-V sockets, vsock, AF_UNIX on Windows).
//!
//! The listening socket is non-blocking and polled; accepted sockets are
//! registered with the reactor through `TcpStream::from_std`, which only
//! relies on plain `recv`/`send` semantics and so works for any stream
//! socket family.

use std::io;
use std::time::Duration;

use socket2::Socket;
use tokio::net::TcpStream;
use tokio::time::Instant;

use crate::{AcceptStrategy, Accepted, Acceptor};

/// Interval between non-blocking accept attempts.
const POLL_INTERVAL: Duration = Duration::from_millis(25);

pub(crate) struct PolledSocketAcceptor {
    socket: Socket,
    deadline: Duration,
}

impl PolledSocketAcceptor {
    /// `socket` must already be bound and listening.
    pub(crate) fn new(socket: Socket, deadline: Duration) -> io::Result<Self> {
        socket.set_nonblocking(true)?;
        Ok(Self { socket, deadline })
    }
}

/// Hand a connected raw socket to the tokio reactor.
pub(crate) fn into_stream(socket: Socket) -> io::Result<TcpStream> {
    socket.set_nonblocking(true)?;
    TcpStream::from_std(std::net::TcpStream::from(socket))
}

#[async_trait::async_trait]
impl Acceptor for PolledSocketAcceptor {
    fn strategy(&self) -> AcceptStrategy {
        AcceptStrategy::Poll(self.deadline)
    }

    async fn accept(&mut self) -> io::Result<Accepted> {
        let started = Instant::now();
        loop {
            match self.socket.accept() {
                Ok((conn, _)) => {
                    return Ok(Accepted::Connection(Box::new(into_stream(conn)?)));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if started.elapsed() >= self.deadline {
                        return Ok(Accepted::TimedOut);
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted
                            | io::ErrorKind::ConnectionAborted
                            | io::ErrorKind::ConnectionReset
                    ) => {}
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read as _, Write as _};
    use std::net::SocketAddr;

    use socket2::{Domain, SockAddr, Type};
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

    fn loopback_listener() -> (Socket, SocketAddr) {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, None).unwrap();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        socket.bind(&SockAddr::from(addr)).unwrap();
        socket.listen(8).unwrap();
        let local = socket.local_addr().unwrap().as_socket().unwrap();
        (socket, local)
    }

    #[tokio::test]
    async fn times_out_without_client() {
        let (socket, _) = loopback_listener();
        let mut acceptor = PolledSocketAcceptor::new(socket, Duration::from_millis(100)).unwrap();
        assert_eq!(
            acceptor.strategy(),
            AcceptStrategy::Poll(Duration::from_millis(100))
        );

        assert!(matches!(acceptor.accept().await.unwrap(), Accepted::TimedOut));
    }

    #[tokio::test]
    async fn accepted_socket_is_an_async_stream() {
        let (socket, addr) = loopback_listener();
        let mut acceptor = PolledSocketAcceptor::new(socket, Duration::from_secs(5)).unwrap();

        let client = std::thread::spawn(move || {
            let mut conn = std::net::TcpStream::connect(addr).unwrap();
            conn.write_all(b"ping").unwrap();
            let mut reply = [0u8; 4];
            conn.read_exact(&mut reply).unwrap();
            reply
        });

        let Accepted::Connection(mut stream) = acceptor.accept().await.unwrap() else {
            panic!("expected a connection");
        };
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        stream.write_all(b"pong").await.unwrap();

        assert_eq!(&client.join().unwrap(), b"pong");
    }
}
