use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use rand::Rng;
use rustc_hash::FxHashMap;
use tracing::{debug, error, info, trace, warn};
use crate::config::TransportConfig;
use crate::connection::{BoundSocket, Connection, ConnectionHandle, ConnectionOption, ConnectionState, ConnectionStatus, Ctx};
use crate::endpoint::Endpoint;
use crate::error::{TransportError, TransportResult};
use crate::observer::ConnectionObserver;
use crate::packet_header::{Datagram, PacketKind};
use crate::ring::Received;
use crate::send_pipeline::{Delivery, Transmit};
use crate::socket::{SocketFactory, UdpSocketFactory};
use crate::stats::ConnectionStats;
use crate::tick::Tick;

/// The registry is where all other parts of the transport come together: It owns the
///  connections and the sockets they share, demultiplexes incoming datagrams to their
///  connections, drives timers, and has the API for application code.
///
/// All operations take an explicit tick. The registry itself is not synchronized, see
///  [crate::driver::SharedRegistry] for sharing it between the poll loop and application code.
pub struct Registry {
    config: TransportConfig,
    factory: Box<dyn SocketFactory>,
    observer: Option<Arc<dyn ConnectionObserver>>,
    connections: BTreeMap<ConnectionHandle, Connection>,
    /// sockets by bind port, shared by all connections using that port
    sockets: FxHashMap<u16, BoundSocket>,
    next_handle: u64,
    next_socket_id: u64,
    recv_buf: Vec<u8>,
}

impl Registry {
    pub fn new(config: TransportConfig, factory: Box<dyn SocketFactory>) -> anyhow::Result<Registry> {
        config.validate()?;

        // one spare byte to detect datagrams that exceed the maximum size
        let recv_buf = vec![0; config.max_datagram_size + 1];
        Ok(Registry {
            config,
            factory,
            observer: None,
            connections: Default::default(),
            sockets: Default::default(),
            next_handle: 0,
            next_socket_id: 0,
            recv_buf,
        })
    }

    /// A registry on tokio UDP sockets. Connections must be set up from within a tokio runtime.
    pub fn with_udp_sockets(config: TransportConfig) -> anyhow::Result<Registry> {
        Self::new(config, Box::new(UdpSocketFactory))
    }

    pub fn set_observer(&mut self, observer: Arc<dyn ConnectionObserver>) {
        self.observer = Some(observer);
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Creates an idle connection, to be set up with [Registry::listen] or [Registry::connect]
    pub fn create(&mut self, now: Tick) -> ConnectionHandle {
        self.next_handle += 1;
        let handle = ConnectionHandle::from_raw(self.next_handle);
        self.connections.insert(handle, Connection::new(handle, &self.config, now));
        debug!("created connection {}", handle);
        handle
    }

    /// Binds to the local endpoint `[ip]:port[:port2][#tag]` and waits for a peer's INIT. If an
    ///  ip is given, it is the poke target: we POKE it periodically, and only accept peers with
    ///  that address.
    pub fn listen(&mut self, handle: ConnectionHandle, endpoint: &str, now: Tick) -> TransportResult<()> {
        self.check_reusable(handle)?;
        let endpoint = Endpoint::from_str(endpoint)?;
        let (bind_port, poke_target) = endpoint.for_listen()?;

        self.release_socket(handle);
        let socket = self.bind_socket(bind_port)?;

        let conn = self.connection_mut(handle)?;
        conn.reset_transfer(now);
        conn.socket = Some(socket);
        conn.peer_addr = poke_target;
        conn.conn_ident = endpoint.conn_ident().unwrap_or(0);
        conn.ident_pinned = endpoint.conn_ident().is_some();
        conn.state = ConnectionState::Listening;
        info!("connection {}: listening on {:?}, poke target {:?}", handle, conn.local_addr(), poke_target);
        Ok(())
    }

    /// Connects to the peer endpoint `ip:port[:port2][#tag]`, sending the first INIT right away
    pub fn connect(&mut self, handle: ConnectionHandle, endpoint: &str, now: Tick) -> TransportResult<()> {
        self.check_reusable(handle)?;
        let endpoint = Endpoint::from_str(endpoint)?;
        let (bind_port, peer) = endpoint.for_connect()?;

        self.release_socket(handle);
        let socket = self.bind_socket(bind_port)?;

        let (ctx, conn) = self.parts(handle, now)?;
        conn.reset_transfer(now);
        conn.socket = Some(socket);
        conn.peer_addr = Some(peer);
        conn.conn_ident = endpoint.conn_ident()
            .unwrap_or_else(|| rand::thread_rng().gen_range(1..=u32::MAX));
        conn.ident_pinned = true;
        conn.state = ConnectionState::Connecting;
        info!("connection {}: connecting to {:?} from {:?}", handle, peer, conn.local_addr());

        conn.send_handshake(&ctx, PacketKind::Init);
        Ok(())
    }

    /// Sends a message, transmitting it right away if the unacknowledged byte limit permits.
    ///  Returns the number of records in the send queue.
    pub fn send(&mut self, handle: ConnectionHandle, data: &[u8], delivery: Delivery, now: Tick) -> TransportResult<usize> {
        let (ctx, conn) = self.parts(handle, now)?;
        conn.send(&ctx, data, delivery, Transmit::Immediate)
    }

    /// Like [Registry::send], but reliable records wait for the next poll
    pub(crate) fn enqueue(&mut self, handle: ConnectionHandle, data: &[u8], delivery: Delivery, now: Tick) -> TransportResult<usize> {
        let (ctx, conn) = self.parts(handle, now)?;
        conn.send(&ctx, data, delivery, Transmit::NextPoll)
    }

    /// Takes the oldest received message. Messages received before the connection closed can
    ///  still be taken after it did.
    pub fn receive(&mut self, handle: ConnectionHandle) -> TransportResult<Received> {
        let conn = self.connection_mut(handle)?;
        if let Some(received) = conn.receive_ring.pop() {
            return Ok(received);
        }
        conn.check_failure()?;
        Err(TransportError::NoData)
    }

    /// The oldest received message, without taking it
    pub fn peek(&mut self, handle: ConnectionHandle) -> TransportResult<&Received> {
        let conn = self.connection_mut(handle)?;
        if conn.receive_ring.is_empty() {
            conn.check_failure()?;
            return Err(TransportError::NoData);
        }
        conn.receive_ring.front()
            .ok_or(TransportError::NoData)
    }

    /// [Registry::receive] into a caller supplied buffer, returning the message's length and
    ///  arrival tick. The message stays queued if the buffer is too small.
    pub fn receive_into(&mut self, handle: ConnectionHandle, buf: &mut [u8]) -> TransportResult<(usize, Tick)> {
        let needed = self.peek(handle)?.data.len();
        if buf.len() < needed {
            return Err(TransportError::BufferTooSmall { needed });
        }
        let received = self.receive(handle)?;
        buf[..needed].copy_from_slice(&received.data);
        Ok((needed, received.when))
    }

    pub fn peek_into(&mut self, handle: ConnectionHandle, buf: &mut [u8]) -> TransportResult<(usize, Tick)> {
        let received = self.peek(handle)?;
        let needed = received.data.len();
        if buf.len() < needed {
            return Err(TransportError::BufferTooSmall { needed });
        }
        buf[..needed].copy_from_slice(&received.data);
        Ok((needed, received.when))
    }

    /// Flushes queued records, tells an open peer we are leaving, and releases the socket. The
    ///  connection is idle afterwards and can listen or connect again.
    pub fn unconnect(&mut self, handle: ConnectionHandle, now: Tick) -> TransportResult<()> {
        let (ctx, conn) = self.parts(handle, now)?;
        if conn.state != ConnectionState::Idle {
            conn.flush(&ctx);
            conn.close(&ctx);
        }
        conn.state = ConnectionState::Idle;
        conn.peer_addr = None;
        self.release_socket(handle);
        Ok(())
    }

    /// [Registry::unconnect], and removes the connection. Its handle is invalid afterwards.
    pub fn close(&mut self, handle: ConnectionHandle, now: Tick) -> TransportResult<()> {
        self.unconnect(handle, now)?;
        self.connections.remove(&handle);
        debug!("removed connection {}", handle);
        Ok(())
    }

    pub fn set_option(&mut self, handle: ConnectionHandle, option: ConnectionOption) -> TransportResult<()> {
        let conn = self.connections.get_mut(&handle)
            .ok_or(TransportError::UnknownConnection)?;
        conn.set_option(option, &self.config)
    }

    pub fn connection(&self, handle: ConnectionHandle) -> TransportResult<&Connection> {
        self.connections.get(&handle)
            .ok_or(TransportError::UnknownConnection)
    }

    pub fn state(&self, handle: ConnectionHandle) -> TransportResult<ConnectionState> {
        Ok(self.connection(handle)?.state())
    }

    pub fn status(&self, handle: ConnectionHandle) -> TransportResult<ConnectionStatus> {
        Ok(self.connection(handle)?.status())
    }

    pub fn stats(&self, handle: ConnectionHandle) -> TransportResult<ConnectionStats> {
        Ok(self.connection(handle)?.stats())
    }

    /// Drives the transport: reads one pending datagram per socket and dispatches it, then
    ///  advances every connection's timers. This is repeated while datagrams keep arriving, up
    ///  to the configured maximum. Returns the number of datagrams received.
    pub fn poll_tick(&mut self, now: Tick) -> usize {
        let mut total = 0;
        loop {
            let received = self.receive_pass(now);
            self.timer_pass(now);

            total += received;
            if received == 0 || total >= self.config.max_datagrams_per_poll {
                break;
            }
        }
        total
    }

    fn receive_pass(&mut self, now: Tick) -> usize {
        let mut sockets: Vec<BoundSocket> = Vec::new();
        for bound in self.connections.values().filter_map(|c| c.socket.as_ref()) {
            if !sockets.iter().any(|s| s.is_same(bound)) {
                sockets.push(bound.clone());
            }
        }

        let mut buf = std::mem::take(&mut self.recv_buf);
        let mut num_received = 0;
        for bound in &sockets {
            match bound.socket.try_recv_from(&mut buf) {
                Ok(Some((len, from))) => {
                    num_received += 1;
                    if len >= buf.len() {
                        debug!("oversized datagram from {:?} - dropping", from);
                        continue;
                    }
                    self.dispatch(now, bound, from, &buf[..len]);
                }
                Ok(None) => {}
                Err(e) => debug!("error receiving on port {}: {} - ignoring", bound.bind_port, e),
            }
        }
        self.recv_buf = buf;
        num_received
    }

    fn timer_pass(&mut self, now: Tick) {
        let ctx = Ctx { config: &self.config, observer: self.observer.as_deref(), now };
        for conn in self.connections.values_mut() {
            conn.process_timers(&ctx);
        }
    }

    fn dispatch(&mut self, now: Tick, bound: &BoundSocket, from: SocketAddr, data: &[u8]) {
        let datagram = match Datagram::deser(data) {
            Ok(datagram) => datagram,
            Err(e) => {
                debug!("unparsable datagram from {:?}: {} - dropping", from, e);
                return;
            }
        };
        trace!("received {:?} from {:?}", datagram.header, from);

        let ctx = Ctx { config: &self.config, observer: self.observer.as_deref(), now };
        let connections = &mut self.connections;

        if let Some(conn) = connections.values_mut().find(|c| c.claims(bound.id, from, &datagram)) {
            conn.process_datagram(&ctx, &datagram, data.len());
            return;
        }

        let kind = datagram.header.kind;
        if !kind.is_handshake() {
            debug!("{:?} from {:?} belongs to no connection - dropping", kind, from);
            return;
        }

        fix_up_peer_port(connections, bound, from, datagram.header.ack);
        if matches!(kind, PacketKind::Init | PacketKind::Conn) {
            accept(connections, &ctx, bound, from, &datagram, data.len());
        }
    }

    fn parts(&mut self, handle: ConnectionHandle, now: Tick) -> TransportResult<(Ctx<'_>, &mut Connection)> {
        let conn = self.connections.get_mut(&handle)
            .ok_or(TransportError::UnknownConnection)?;
        let ctx = Ctx { config: &self.config, observer: self.observer.as_deref(), now };
        Ok((ctx, conn))
    }

    fn connection_mut(&mut self, handle: ConnectionHandle) -> TransportResult<&mut Connection> {
        self.connections.get_mut(&handle)
            .ok_or(TransportError::UnknownConnection)
    }

    fn check_reusable(&self, handle: ConnectionHandle) -> TransportResult<()> {
        match self.connection(handle)?.state() {
            ConnectionState::Idle | ConnectionState::Closed => Ok(()),
            state => {
                debug!("connection {}: can not set up in state {:?}", handle, state);
                Err(TransportError::BadState)
            }
        }
    }

    /// The socket bound to `port`, shared with other connections if one exists already. If the
    ///  port is taken by someone else, an ephemeral port is used instead. Sockets on ephemeral
    ///  ports are never shared.
    fn bind_socket(&mut self, port: u16) -> TransportResult<BoundSocket> {
        if let Some(bound) = self.sockets.get(&port) {
            debug!("sharing socket on port {}", port);
            return Ok(bound.clone());
        }

        let addr = SocketAddr::from((self.config.bind_ip, port));
        let (socket, shared) = match self.factory.bind(addr) {
            Ok(socket) => (socket, port != 0),
            Err(e) if port == 0 => {
                error!("could not bind a socket to {:?}: {}", addr, e);
                return Err(TransportError::NoResources);
            }
            Err(e) => {
                warn!("could not bind to {:?}: {} - falling back to an ephemeral port", addr, e);
                match self.factory.bind(SocketAddr::from((self.config.bind_ip, 0))) {
                    Ok(socket) => (socket, false),
                    Err(e) => {
                        error!("could not bind to an ephemeral port either: {}", e);
                        return Err(TransportError::Unexpected);
                    }
                }
            }
        };

        self.next_socket_id += 1;
        let bound = BoundSocket {
            id: self.next_socket_id,
            bind_port: if shared { port } else { 0 },
            socket,
        };
        if shared {
            self.sockets.insert(port, bound.clone());
        }
        Ok(bound)
    }

    /// Detaches the connection's socket, closing it unless another connection still uses it
    fn release_socket(&mut self, handle: ConnectionHandle) {
        let Some(bound) = self.connections.get_mut(&handle).and_then(|c| c.socket.take()) else {
            return;
        };

        let in_use = self.connections.values()
            .any(|c| c.socket.as_ref().is_some_and(|s| s.is_same(&bound)));
        if in_use {
            debug!("connection {}: socket on port {} is still in use", handle, bound.bind_port);
            return;
        }

        if self.sockets.get(&bound.bind_port).is_some_and(|s| s.is_same(&bound)) {
            self.sockets.remove(&bound.bind_port);
        }
        debug!("connection {}: closing socket on port {}", handle, bound.bind_port);
    }
}

/// An unclaimed handshake carrying the identifier of a connection that is still setting up
///  arrives from the expected IP but another port: a NAT re-mapped the peer's port.
fn fix_up_peer_port(connections: &mut BTreeMap<ConnectionHandle, Connection>, bound: &BoundSocket, from: SocketAddr, ident: u32) {
    let candidate = connections.values_mut()
        .find(|c| matches!(c.state, ConnectionState::Connecting | ConnectionState::Listening)
            && c.peer_addr.is_some()
            && c.conn_ident == ident);
    let Some(conn) = candidate else {
        return;
    };
    let Some(peer) = conn.peer_addr else {
        return;
    };

    let same_socket = conn.socket.as_ref().is_some_and(|s| s.id == bound.id);
    if same_socket && peer.ip() == from.ip() && peer.port() != from.port() {
        info!("connection {}: peer port changed from {} to {}", conn.handle, peer.port(), from.port());
        conn.peer_addr = Some(from);
    }
}

/// A listening connection takes over an unclaimed INIT or CONN
fn accept(connections: &mut BTreeMap<ConnectionHandle, Connection>, ctx: &Ctx, bound: &BoundSocket, from: SocketAddr, datagram: &Datagram, wire_len: usize) {
    let ident = datagram.header.ack;
    let candidate = connections.values_mut()
        .find(|c| c.state == ConnectionState::Listening
            && c.socket.as_ref().is_some_and(|s| s.id == bound.id)
            && (!c.ident_pinned || c.conn_ident == ident)
            && c.peer_addr.map_or(true, |target| target.ip() == from.ip()));
    let Some(conn) = candidate else {
        debug!("{:?} from {:?} matches no listening connection - dropping", datagram.header, from);
        return;
    };

    if !conn.ident_pinned {
        debug!("connection {}: adopting connection identifier {:#010x}", conn.handle, ident);
        conn.conn_ident = ident;
        conn.ident_pinned = true;
    }
    info!("connection {}: accepting {:?} from {:?}", conn.handle, datagram.header.kind, from);
    conn.peer_addr = Some(from);
    conn.state = ConnectionState::Connecting;
    conn.process_datagram(ctx, datagram, wire_len);
}
