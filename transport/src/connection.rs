use std::fmt::{Display, Formatter};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};
use crate::config::TransportConfig;
use crate::error::{TransportError, TransportResult};
use crate::observer::ConnectionObserver;
use crate::packet_header::{MetaChunk, ProtocolVersion};
use crate::redundancy::RedundancyLimit;
use crate::ring::{Received, RecordRing, SendRing};
use crate::seq_num::{SeqNum, UnreliableSeq};
use crate::socket::DatagramSocket;
use crate::stats::ConnectionStats;
use crate::tick::{tick_minus, Tick};

/// Identifies a connection inside its [crate::registry::Registry]. Handles are never reused.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct ConnectionHandle(u64);

impl Display for ConnectionHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl ConnectionHandle {
    pub(crate) fn from_raw(raw: u64) -> ConnectionHandle {
        ConnectionHandle(raw)
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ConnectionState {
    Idle,
    /// bound, waiting for a peer's INIT
    Listening,
    /// sending INIT, waiting for CONN (or data)
    Connecting,
    Open,
    Closed,
}

/// Coarse connection status for applications
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ConnectionStatus {
    Connecting,
    Online,
    Offline,
    /// closed after a socket failure
    Failure,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ConnectionOption {
    /// our own client identifier, sent in handshakes and metadata chunks
    ClientIdent(u32),
    /// the peer's client identifier, used for demultiplexing with metadata type 1
    RemoteClientIdent(u32),
    /// 0 (no metadata chunk) or 1 (client identifier pair)
    MetaType(u8),
    /// byte limit for datagrams including redundant copies, 0 for the configured default
    RedundantLimit(usize),
    /// unacknowledged byte limit, 0 for the configured default
    UnackLimit(usize),
}

/// A socket as it is shared between connections bound to the same local port
#[derive(Clone)]
pub(crate) struct BoundSocket {
    pub id: u64,
    pub bind_port: u16,
    pub socket: Arc<dyn DatagramSocket>,
}

impl BoundSocket {
    pub fn is_same(&self, other: &BoundSocket) -> bool {
        self.id == other.id
    }
}

/// Everything a protocol step needs from outside the connection
pub(crate) struct Ctx<'a> {
    pub config: &'a TransportConfig,
    pub observer: Option<&'a dyn ConnectionObserver>,
    pub now: Tick,
}

/// State of a single session. The protocol logic lives in `impl` blocks of the send and
///  receive pipeline modules.
pub struct Connection {
    pub(crate) handle: ConnectionHandle,
    pub(crate) state: ConnectionState,
    pub(crate) socket: Option<BoundSocket>,
    pub(crate) peer_addr: Option<SocketAddr>,

    /// carried in every handshake packet to reject stale or foreign sessions
    pub(crate) conn_ident: u32,
    /// NB: A listener without an explicit identifier adopts the one of the first matching
    ///  handshake, and is pinned from then on
    pub(crate) ident_pinned: bool,
    /// learned from the first handshake the peer sent
    pub(crate) version: Option<ProtocolVersion>,

    pub(crate) client_ident: u32,
    pub(crate) remote_client_ident: u32,
    pub(crate) meta_type: u8,

    pub(crate) unack_limit: usize,
    pub(crate) redundant_limit: usize,
    pub(crate) redundancy: RedundancyLimit,

    pub(crate) send_ring: SendRing,
    pub(crate) receive_ring: RecordRing<Received>,

    /// sequence number for the next reliable record
    pub(crate) snd_seq: SeqNum,
    pub(crate) unreliable_snd_seq: UnreliableSeq,
    /// next reliable sequence number we expect
    pub(crate) rcv_seq: SeqNum,
    pub(crate) unreliable_rcv_seq: UnreliableSeq,
    /// value of `rcv_seq` when we last acknowledged
    pub(crate) rcv_ack: SeqNum,
    /// received bytes we did not acknowledge yet
    pub(crate) rcv_unack: usize,

    pub(crate) send_tick: Tick,
    pub(crate) send_reliable_tick: Tick,
    pub(crate) recv_tick: Tick,

    pub(crate) stats: ConnectionStats,
    /// socket failure that closed the connection, reported once through the API
    pub(crate) failure: Option<io::ErrorKind>,
    pub(crate) failure_reported: bool,
}

impl Connection {
    pub(crate) fn new(handle: ConnectionHandle, config: &TransportConfig, now: Tick) -> Connection {
        let mut result = Connection {
            handle,
            state: ConnectionState::Idle,
            socket: None,
            peer_addr: None,
            conn_ident: 0,
            ident_pinned: false,
            version: None,
            client_ident: 0,
            remote_client_ident: 0,
            meta_type: MetaChunk::TYPE_NONE,
            unack_limit: config.unack_limit,
            redundant_limit: config.redundant_limit,
            redundancy: RedundancyLimit::new(),
            send_ring: SendRing::with_capacity(config.send_queue_len),
            receive_ring: RecordRing::with_capacity(config.receive_queue_len),
            snd_seq: SeqNum::FIRST,
            unreliable_snd_seq: UnreliableSeq::FIRST,
            rcv_seq: SeqNum::FIRST,
            unreliable_rcv_seq: UnreliableSeq::FIRST,
            rcv_ack: SeqNum::FIRST,
            rcv_unack: 0,
            send_tick: now,
            send_reliable_tick: now,
            recv_tick: now,
            stats: ConnectionStats::default(),
            failure: None,
            failure_reported: false,
        };
        result.reset_transfer(now);
        result
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref()
            .and_then(|s| s.socket.local_addr().ok())
    }

    pub fn conn_ident(&self) -> u32 {
        self.conn_ident
    }

    pub fn version(&self) -> Option<ProtocolVersion> {
        self.version
    }

    pub fn stats(&self) -> ConnectionStats {
        self.stats
    }

    pub fn status(&self) -> ConnectionStatus {
        match self.state {
            ConnectionState::Listening | ConnectionState::Connecting => ConnectionStatus::Connecting,
            ConnectionState::Open => ConnectionStatus::Online,
            ConnectionState::Closed if self.failure.is_some() => ConnectionStatus::Failure,
            ConnectionState::Idle | ConnectionState::Closed => ConnectionStatus::Offline,
        }
    }

    /// Puts sequence numbers, queues and timers back to the start of a session. Timers are
    ///  moved into the past so that the first handshake goes out right away.
    pub(crate) fn reset_transfer(&mut self, now: Tick) {
        self.send_ring.clear();
        self.receive_ring.clear();
        self.snd_seq = SeqNum::FIRST;
        self.unreliable_snd_seq = UnreliableSeq::FIRST;
        self.rcv_seq = SeqNum::FIRST;
        self.unreliable_rcv_seq = UnreliableSeq::FIRST;
        self.rcv_ack = SeqNum::FIRST;
        self.rcv_unack = 0;
        self.redundancy = RedundancyLimit::new();
        self.version = None;
        self.failure = None;
        self.failure_reported = false;

        let past = tick_minus(now, 5000);
        self.send_tick = past;
        self.send_reliable_tick = past;
        self.recv_tick = past;
    }

    pub(crate) fn set_option(&mut self, option: ConnectionOption, config: &TransportConfig) -> TransportResult<()> {
        debug!("connection {}: setting {:?}", self.handle, option);
        match option {
            ConnectionOption::ClientIdent(ident) => self.client_ident = ident,
            ConnectionOption::RemoteClientIdent(ident) => self.remote_client_ident = ident,
            ConnectionOption::MetaType(meta_type) => {
                if meta_type != MetaChunk::TYPE_NONE && meta_type != MetaChunk::TYPE_CLIENT_IDENTS {
                    return Err(TransportError::InvalidOption);
                }
                self.meta_type = meta_type;
                self.redundant_limit = self.redundant_limit.min(config.datagram_payload_budget(self.meta_len()));
            }
            ConnectionOption::RedundantLimit(limit) => {
                let limit = if limit == 0 { config.redundant_limit } else { limit };
                self.redundant_limit = limit.min(config.datagram_payload_budget(self.meta_len()));
            }
            ConnectionOption::UnackLimit(limit) => {
                self.unack_limit = if limit == 0 { config.unack_limit } else { limit };
            }
        }
        Ok(())
    }

    pub(crate) fn meta_len(&self) -> usize {
        MetaChunk::len_for_type(self.meta_type)
    }

    pub(crate) fn meta_chunk(&self) -> Option<MetaChunk> {
        if self.meta_type == MetaChunk::TYPE_CLIENT_IDENTS {
            Some(MetaChunk {
                sender: self.client_ident,
                receiver: self.remote_client_ident,
            })
        }
        else {
            None
        }
    }

    /// biggest record that may be consolidated with others, depending on the peer's version
    pub(crate) fn subpacket_limit(&self) -> usize {
        self.version
            .unwrap_or(ProtocolVersion::V1_0)
            .subpacket_limit()
    }

    /// Returns a pending socket failure exactly once, then reports the plain state error
    pub(crate) fn check_failure(&mut self) -> TransportResult<()> {
        match self.failure {
            Some(kind) if !self.failure_reported => {
                self.failure_reported = true;
                Err(TransportError::SocketFailure(kind))
            }
            _ => Ok(()),
        }
    }

    pub(crate) fn fail(&mut self, kind: io::ErrorKind) {
        warn!("connection {}: socket failure {:?} - closing", self.handle, kind);
        self.failure = Some(kind);
        self.state = ConnectionState::Closed;
    }

    /// Ends the session, telling the peer if it is open
    pub(crate) fn close(&mut self, ctx: &Ctx) {
        if self.state == ConnectionState::Open {
            if self.send_ring.has_unsent() {
                warn!("connection {}: closing with unsent data", self.handle);
            }
            else if self.send_ring.has_unacked() {
                warn!("connection {}: closing with unacknowledged data", self.handle);
            }
            self.send_disc(ctx);
        }
        if self.state != ConnectionState::Closed {
            info!("connection {}: closed", self.handle);
        }
        self.state = ConnectionState::Closed;
    }
}
