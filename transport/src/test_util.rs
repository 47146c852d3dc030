//! In-memory network for exercising connections and registries without real sockets.

use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use rustc_hash::FxHashMap;
use crate::packet_header::Datagram;
use crate::socket::{DatagramSocket, SocketFactory};

#[derive(Clone, Debug)]
pub struct SentDatagram {
    pub from: SocketAddr,
    pub to: SocketAddr,
    pub data: Vec<u8>,
}

impl SentDatagram {
    pub fn decode(&self) -> Datagram {
        Datagram::deser(&self.data).unwrap()
    }
}

type Inbox = Arc<Mutex<VecDeque<(Vec<u8>, SocketAddr)>>>;
type DropFilter = Box<dyn FnMut(&SentDatagram) -> bool + Send>;

#[derive(Default)]
struct SimInner {
    sockets: FxHashMap<SocketAddr, Inbox>,
    next_ephemeral: u16,
    sent: Vec<SentDatagram>,
    drop_filter: Option<DropFilter>,
}

/// A lossless (unless told otherwise) network connecting any number of simulated hosts
#[derive(Clone, Default)]
pub struct SimNetwork {
    inner: Arc<Mutex<SimInner>>,
}

impl SimNetwork {
    pub fn new() -> SimNetwork {
        Default::default()
    }

    /// socket factory for a host with the given IP address
    pub fn host(&self, ip: [u8; 4]) -> SimHost {
        SimHost {
            net: self.clone(),
            ip: Ipv4Addr::from(ip),
        }
    }

    /// datagrams for which the filter returns `true` are lost
    pub fn set_drop_filter(&self, filter: impl FnMut(&SentDatagram) -> bool + Send + 'static) {
        self.inner.lock().unwrap().drop_filter = Some(Box::new(filter));
    }

    pub fn clear_drop_filter(&self) {
        self.inner.lock().unwrap().drop_filter = None;
    }

    /// all datagrams sent since the last call, including lost ones
    pub fn take_sent(&self) -> Vec<SentDatagram> {
        std::mem::take(&mut self.inner.lock().unwrap().sent)
    }

    pub fn is_bound(&self, addr: SocketAddr) -> bool {
        self.inner.lock().unwrap().sockets.contains_key(&addr)
    }

    fn send(&self, from: SocketAddr, to: SocketAddr, data: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        let sent = SentDatagram { from, to, data: data.to_vec() };
        inner.sent.push(sent.clone());

        if let Some(filter) = inner.drop_filter.as_mut() {
            if filter(&sent) {
                return;
            }
        }

        if to.ip() == IpAddr::V4(Ipv4Addr::BROADCAST) {
            for (addr, inbox) in inner.sockets.iter() {
                if addr.port() == to.port() && *addr != from {
                    inbox.lock().unwrap().push_back((sent.data.clone(), from));
                }
            }
        }
        else if let Some(inbox) = inner.sockets.get(&to) {
            inbox.lock().unwrap().push_back((sent.data, from));
        }
    }
}

pub struct SimHost {
    net: SimNetwork,
    ip: Ipv4Addr,
}

impl SocketFactory for SimHost {
    fn bind(&self, addr: SocketAddr) -> io::Result<Arc<dyn DatagramSocket>> {
        let mut inner = self.net.inner.lock().unwrap();
        let port = if addr.port() == 0 {
            inner.next_ephemeral += 1;
            40000 + inner.next_ephemeral
        }
        else {
            addr.port()
        };
        let local = SocketAddr::from((self.ip, port));
        if inner.sockets.contains_key(&local) {
            return Err(io::Error::from(io::ErrorKind::AddrInUse));
        }

        let inbox: Inbox = Default::default();
        inner.sockets.insert(local, inbox.clone());
        Ok(Arc::new(SimSocket {
            net: self.net.clone(),
            local,
            inbox,
        }))
    }
}

pub struct SimSocket {
    net: SimNetwork,
    local: SocketAddr,
    inbox: Inbox,
}

impl Drop for SimSocket {
    fn drop(&mut self) {
        self.net.inner.lock().unwrap().sockets.remove(&self.local);
    }
}

impl DatagramSocket for SimSocket {
    fn send_to(&self, buf: &[u8], to: SocketAddr) -> io::Result<usize> {
        self.net.send(self.local, to, buf);
        Ok(buf.len())
    }

    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.inbox.lock().unwrap().pop_front() {
            Some((data, from)) => {
                let len = data.len().min(buf.len());
                buf[..len].copy_from_slice(&data[..len]);
                Ok(Some((len, from)))
            }
            None => Ok(None),
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local)
    }
}
