//! Hyper-V socket transport.
//!
//! On a Windows host the agent listens on an `AF_HYPERV` socket for the
//! registered guest communication service; Linux guests (and Linux hosts
//! running the agent themselves) use vsock on the same port.  The
//! [`HyperVConnector`] is the guest side: it reaches the agent on the parent
//! partition and doubles as the guest-mode check at startup.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use keyrelay_core::{BoxedStream, Connector};
use tracing::debug;

use crate::{Bound, Transport, TransportError, TransportKind};

const ACCEPT_DEADLINE: Duration = Duration::from_secs(1);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Service GUID template shared with Linux vsock: the port fills the first
/// field.
const SERVICE_GUID_TAIL: &str = "facb-11e6-bd58-64006a7986d3";

/// Hyper-V service GUID for a port (`22223333-facb-11e6-bd58-64006a7986d3`
/// for the default).
pub fn service_guid(port: u32) -> String {
    format!("{port:08x}-{SERVICE_GUID_TAIL}")
}

#[derive(Debug, Clone)]
pub struct HyperVTransport {
    port: u32,
}

impl HyperVTransport {
    pub fn new(port: u32) -> Self {
        Self { port }
    }
}

#[async_trait]
impl Transport for HyperVTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::HyperV
    }

    async fn bind(&self) -> Result<Bound, TransportError> {
        let acceptor = imp::listen(self.port).map_err(|e| match e.kind() {
            io::ErrorKind::Unsupported => TransportError::Unsupported(TransportKind::HyperV),
            _ => TransportError::Bind {
                transport: TransportKind::HyperV,
                source: e,
            },
        })?;
        debug!(port = self.port, "hyper-v socket listening");
        Ok(Bound {
            acceptor,
            help: format!(
                "Hyper-V guests reach this agent through service {}",
                service_guid(self.port)
            ),
        })
    }
}

/// Connects to the agent running on the Hyper-V host.
#[derive(Debug, Clone)]
pub struct HyperVConnector {
    port: u32,
}

impl HyperVConnector {
    pub fn new(port: u32) -> Self {
        Self { port }
    }

    /// Whether a host agent answers; this is how guest mode is detected.
    pub async fn host_reachable(&self) -> bool {
        match self.connect().await {
            Ok(_) => true,
            Err(e) => {
                debug!(port = self.port, error = %e, "no hyper-v host agent");
                false
            }
        }
    }
}

#[async_trait]
impl Connector for HyperVConnector {
    async fn connect(&self) -> io::Result<BoxedStream> {
        let port = self.port;
        let socket = tokio::task::spawn_blocking(move || imp::connect(port, CONNECT_TIMEOUT))
            .await
            .map_err(io::Error::other)??;
        Ok(Box::new(crate::polled::into_stream(socket)?))
    }
}

#[cfg(windows)]
mod imp {
    use std::io;
    use std::time::Duration;

    use socket2::{Domain, Protocol, SockAddr, Socket, Type};

    use super::ACCEPT_DEADLINE;
    use crate::Acceptor;
    use crate::polled::PolledSocketAcceptor;

    const AF_HYPERV: i32 = 34;
    const HV_PROTOCOL_RAW: i32 = 1;

    #[repr(C)]
    #[derive(Clone, Copy)]
    struct Guid {
        data1: u32,
        data2: u16,
        data3: u16,
        data4: [u8; 8],
    }

    /// Any partition may connect.
    const HV_GUID_WILDCARD: Guid = Guid {
        data1: 0,
        data2: 0,
        data3: 0,
        data4: [0; 8],
    };

    /// The parent (host) partition, as seen from a guest.
    const HV_GUID_PARENT: Guid = Guid {
        data1: 0xa42e_7cda,
        data2: 0xd03f,
        data3: 0x480c,
        data4: [0x9c, 0xc2, 0xa4, 0xde, 0x20, 0xab, 0xb8, 0x78],
    };

    #[repr(C)]
    struct SockAddrHv {
        family: u16,
        reserved: u16,
        vm_id: Guid,
        service_id: Guid,
    }

    fn service_id(port: u32) -> Guid {
        Guid {
            data1: port,
            data2: 0xfacb,
            data3: 0x11e6,
            data4: [0xbd, 0x58, 0x64, 0x00, 0x6a, 0x79, 0x86, 0xd3],
        }
    }

    fn hv_addr(vm_id: Guid, port: u32) -> io::Result<SockAddr> {
        // SAFETY: SockAddrHv is smaller than the zeroed storage handed to the
        // closure, and the length written matches it.
        let ((), addr) = unsafe {
            SockAddr::try_init(|storage, len| {
                storage.cast::<SockAddrHv>().write(SockAddrHv {
                    family: AF_HYPERV as u16,
                    reserved: 0,
                    vm_id,
                    service_id: service_id(port),
                });
                *len = std::mem::size_of::<SockAddrHv>() as _;
                Ok(())
            })
        }?;
        Ok(addr)
    }

    fn socket() -> io::Result<Socket> {
        Socket::new(
            Domain::from(AF_HYPERV),
            Type::STREAM,
            Some(Protocol::from(HV_PROTOCOL_RAW)),
        )
    }

    pub(super) fn listen(port: u32) -> io::Result<Box<dyn Acceptor>> {
        let socket = socket()?;
        socket.bind(&hv_addr(HV_GUID_WILDCARD, port)?)?;
        socket.listen(128)?;
        Ok(Box::new(PolledSocketAcceptor::new(socket, ACCEPT_DEADLINE)?))
    }

    pub(super) fn connect(port: u32, timeout: Duration) -> io::Result<Socket> {
        let socket = socket()?;
        socket.connect_timeout(&hv_addr(HV_GUID_PARENT, port)?, timeout)?;
        Ok(socket)
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
mod imp {
    use std::io;
    use std::time::Duration;

    use socket2::{Domain, SockAddr, Socket, Type};

    use super::ACCEPT_DEADLINE;
    use crate::Acceptor;
    use crate::polled::PolledSocketAcceptor;

    const VMADDR_CID_ANY: u32 = u32::MAX;
    const VMADDR_CID_HOST: u32 = 2;

    pub(super) fn listen(port: u32) -> io::Result<Box<dyn Acceptor>> {
        let socket = Socket::new(Domain::VSOCK, Type::STREAM, None)?;
        socket.bind(&SockAddr::vsock(VMADDR_CID_ANY, port))?;
        socket.listen(128)?;
        Ok(Box::new(PolledSocketAcceptor::new(socket, ACCEPT_DEADLINE)?))
    }

    pub(super) fn connect(port: u32, timeout: Duration) -> io::Result<Socket> {
        let socket = Socket::new(Domain::VSOCK, Type::STREAM, None)?;
        socket.connect_timeout(&SockAddr::vsock(VMADDR_CID_HOST, port), timeout)?;
        Ok(socket)
    }
}

#[cfg(not(any(windows, target_os = "linux", target_os = "android")))]
mod imp {
    use std::io;
    use std::time::Duration;

    use socket2::Socket;

    use crate::Acceptor;

    pub(super) fn listen(_port: u32) -> io::Result<Box<dyn Acceptor>> {
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }

    pub(super) fn connect(_port: u32, _timeout: Duration) -> io::Result<Socket> {
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_port_service_guid() {
        assert_eq!(
            service_guid(0x2222_3333),
            "22223333-facb-11e6-bd58-64006a7986d3"
        );
        assert_eq!(service_guid(0x10), "00000010-facb-11e6-bd58-64006a7986d3");
    }

    #[tokio::test]
    async fn host_unreachable_without_a_host_agent() {
        // Nothing in the test environment listens on this port on the host
        // partition; either the address family is missing or the connect
        // fails.
        let connector = HyperVConnector::new(0x2bad_f00d);
        assert!(!connector.host_reachable().await);
    }
}
