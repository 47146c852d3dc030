#[cfg(test)] use mockall::automock;
use std::io;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tracing::{debug, trace};

/// This is an abstraction for the non-blocking datagram I/O the transport needs, introduced to
///  facilitate mocking / simulating the network for testing
#[cfg_attr(test, automock)]
pub trait DatagramSocket: Send + Sync + 'static {
    fn send_to(&self, buf: &[u8], to: SocketAddr) -> io::Result<usize>;

    /// Receives a single datagram if one is pending, returning `Ok(None)` instead of blocking
    ///  otherwise
    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[cfg_attr(test, automock)]
pub trait SocketFactory: Send + 'static {
    fn bind(&self, addr: SocketAddr) -> io::Result<Arc<dyn DatagramSocket>>;
}

/// NB: `try_*` calls report `WouldBlock` until the runtime has registered the socket's
///  readiness, so the very first send on a fresh socket may not go out
impl DatagramSocket for UdpSocket {
    fn send_to(&self, buf: &[u8], to: SocketAddr) -> io::Result<usize> {
        trace!("UDP socket: sending {} bytes to {:?}", buf.len(), to);
        self.try_send_to(buf, to)
    }

    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match UdpSocket::try_recv_from(self, buf) {
            Ok(received) => Ok(Some(received)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

/// Binds tokio UDP sockets with broadcast enabled. Binding must happen inside a tokio runtime.
pub struct UdpSocketFactory;

impl SocketFactory for UdpSocketFactory {
    fn bind(&self, addr: SocketAddr) -> io::Result<Arc<dyn DatagramSocket>> {
        Handle::try_current()
            .map_err(|e| io::Error::new(ErrorKind::Other, e))?;

        let socket = std::net::UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        socket.set_broadcast(true)?;
        let socket = UdpSocket::from_std(socket)?;
        debug!("bound UDP socket to {:?}", socket.local_addr()?);
        Ok(Arc::new(socket))
    }
}
