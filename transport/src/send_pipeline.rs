use std::io;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr};
use bytes::BytesMut;
use tracing::{debug, error, info, trace};
use crate::connection::{Connection, ConnectionState, Ctx};
use crate::error::{TransportError, TransportResult};
use crate::packet_header::{Datagram, HandshakeBody, PacketHeader, PacketKind, ProtocolVersion};
use crate::ring::SendRecord;
use crate::stats::UDP_IP_OVERHEAD;
use crate::subpacket::{encode_subpacket_len, encoded_len};
use crate::tick::elapsed_more_than;

/// upper bound for the number of queued records consolidated into a single datagram
const MAX_FORWARD: usize = 8;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Delivery {
    /// queued, acknowledged and resent until it arrives
    Reliable,
    /// sent right away, no retransmission
    Unreliable,
    /// like [Delivery::Unreliable], but to the broadcast address on the peer's port
    UnreliableBroadcast,
}

/// Whether an accepted reliable record may be transmitted right away
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) enum Transmit {
    Immediate,
    NextPoll,
}

impl Connection {
    /// Puts a single datagram on the wire and does the bookkeeping shared by all outgoing
    ///  traffic. A hard socket error closes the connection.
    pub(crate) fn transmit(&mut self, ctx: &Ctx, to: SocketAddr, datagram: &Datagram) -> io::Result<()> {
        let Some(socket) = self.socket.as_ref().map(|s| s.socket.clone()) else {
            return Err(ErrorKind::NotConnected.into());
        };

        let mut buf = BytesMut::with_capacity(datagram.serialized_len());
        datagram.ser(&mut buf);

        trace!("connection {}: sending {:?} with {} payload bytes to {:?}", self.handle, datagram.header, datagram.payload.len(), to);
        if let Err(e) = socket.send_to(&buf, to) {
            if e.kind() == ErrorKind::WouldBlock {
                debug!("connection {}: socket buffer full, datagram not sent", self.handle);
            }
            else {
                error!("connection {}: error sending to {:?}: {}", self.handle, to, e);
                self.fail(e.kind());
            }
            return Err(e);
        }

        self.send_tick = ctx.now;
        if let PacketKind::Reliable(_) = datagram.header.kind {
            self.send_reliable_tick = ctx.now;
            self.rcv_unack = 0;
        }

        self.stats.packets_sent += 1;
        self.stats.bytes_sent += datagram.payload.len() as u64;
        self.stats.overhead_sent += UDP_IP_OVERHEAD + (buf.len() - datagram.payload.len()) as u64;
        Ok(())
    }

    fn send_to_peer(&mut self, ctx: &Ctx, header: PacketHeader, payload: Vec<u8>) -> io::Result<()> {
        let Some(peer) = self.peer_addr else {
            return Err(ErrorKind::NotConnected.into());
        };
        let datagram = self.datagram(header, payload);
        self.transmit(ctx, peer, &datagram)
    }

    fn datagram(&self, header: PacketHeader, payload: Vec<u8>) -> Datagram {
        Datagram {
            header,
            meta: self.meta_chunk(),
            handshake: None,
            payload,
        }
    }

    /// INIT, CONN or POKE to the peer (or poke target)
    pub(crate) fn send_handshake(&mut self, ctx: &Ctx, kind: PacketKind) {
        debug_assert!(kind.is_handshake());
        let Some(peer) = self.peer_addr else {
            return;
        };

        debug!("connection {}: sending {:?} to {:?}", self.handle, kind, peer);
        let datagram = Datagram {
            header: PacketHeader::new(kind, self.conn_ident),
            meta: self.meta_chunk(),
            handshake: Some(HandshakeBody {
                client_ident: self.client_ident,
                version: ProtocolVersion::CURRENT,
            }),
            payload: vec![],
        };
        let _ = self.transmit(ctx, peer, &datagram);
    }

    pub(crate) fn send_disc(&mut self, ctx: &Ctx) {
        debug!("connection {}: sending DISC", self.handle);
        let _ = self.send_to_peer(ctx, PacketHeader::new(PacketKind::Disc, self.conn_ident), vec![]);
    }

    /// asks the peer to resend everything from the next sequence number we expect
    pub(crate) fn send_nak(&mut self, ctx: &Ctx) {
        debug!("connection {}: sending NAK for {}", self.handle, self.rcv_seq);
        if self.send_to_peer(ctx, PacketHeader::new(PacketKind::Nak, self.rcv_seq.to_raw()), vec![]).is_ok() {
            self.stats.naks_sent += 1;
        }
    }

    /// Refreshes the peer's view of our acknowledgement. If records are outstanding and nothing
    ///  new is queued, the newest outstanding record goes out again (together with its
    ///  predecessors as redundant copies) so that a lost tail is recovered.
    pub(crate) fn send_keepalive(&mut self, ctx: &Ctx) {
        if !self.send_ring.has_unsent() {
            if let Some(seq) = self.send_ring.newest_unacked().map(|r| r.seq) {
                trace!("connection {}: keepalive resending {}", self.handle, seq);
                self.send_ring.step_back();
                self.process_output(ctx);
                return;
            }
        }

        trace!("connection {}: sending keepalive", self.handle);
        self.rcv_ack = self.rcv_seq;
        let header = PacketHeader::new(PacketKind::Reliable(self.snd_seq), self.rcv_seq.prev().to_raw());
        let _ = self.send_to_peer(ctx, header, vec![]);
    }

    /// number of not-yet-sent records that go into the next datagram as forward content
    fn forward_count(&self, first: usize, mut budget: isize, subpacket_limit: usize) -> usize {
        let mut count = 0;
        while count < MAX_FORWARD {
            let Some(record) = self.send_ring.get(first + count) else {
                break;
            };
            let len = record.data.len();

            // a record without a subpacket length encoding travels as the only forward record
            let oversized = len > subpacket_limit;
            if oversized && count > 0 {
                break;
            }

            budget -= (len + encoded_len(len)) as isize;
            if count > 0 && budget <= 0 {
                break;
            }
            count += 1;
            if oversized || budget <= 0 {
                break;
            }
        }
        count
    }

    /// Sends queued records as far as the unacknowledged byte limit permits, consolidating up to
    ///  [MAX_FORWARD] of them per datagram and padding each datagram with redundant copies of
    ///  records still waiting for acknowledgement.
    ///
    /// ```ascii
    /// [main record] [older forward record][len] ... [redundant copy][len] ...
    /// ```
    ///
    /// Every appended subpacket's sequence number is one less than that of its predecessor.
    pub(crate) fn process_output(&mut self, ctx: &Ctx) {
        let mut budget = self.unack_limit as isize - self.send_ring.unacked_bytes() as isize;
        if budget < ctx.config.min_send_bytes as isize && elapsed_more_than(ctx.now, self.send_tick, ctx.config.min_send_interval) {
            budget = ctx.config.min_send_bytes as isize;
        }

        let subpacket_limit = self.subpacket_limit();
        let datagram_budget = ctx.config.datagram_payload_budget(self.meta_len()) as isize;

        while budget > 0 && self.state == ConnectionState::Open && self.send_ring.has_unsent() {
            let first = self.send_ring.unsent_idx();
            let count = self.forward_count(first, datagram_budget.min(budget), subpacket_limit);
            if count == 0 {
                return;
            }

            let main_idx = first + count - 1;
            let Some(main) = self.send_ring.get(main_idx) else {
                return;
            };
            let main_seq = main.seq;

            let mut payload = Vec::with_capacity(datagram_budget as usize);
            let mut extra_count = 0u8;
            for idx in (first..=main_idx).rev() {
                let Some(record) = self.send_ring.get(idx) else {
                    return;
                };
                if let Some(observer) = ctx.observer {
                    observer.on_transmitted(self.handle, &record.data, ctx.now);
                }

                payload.extend_from_slice(&record.data);
                if idx != main_idx {
                    if encode_subpacket_len(&mut payload, record.data.len()).is_err() {
                        return;
                    }
                    extra_count += 1;
                }
            }

            let mut redundant = 0;
            for idx in (0..first).rev() {
                if !self.redundancy.allows(extra_count, main_seq) {
                    break;
                }
                let Some(record) = self.send_ring.get(idx) else {
                    break;
                };
                let len = record.data.len();
                if len > subpacket_limit || payload.len() + len + encoded_len(len) > self.redundant_limit.min(datagram_budget as usize) {
                    break;
                }

                payload.extend_from_slice(&record.data);
                if encode_subpacket_len(&mut payload, len).is_err() {
                    break;
                }
                extra_count += 1;
                redundant += 1;
            }

            if first > 0 {
                self.redundancy.on_resend();
            }

            self.send_ring.mark_sent(count);
            self.rcv_ack = self.rcv_seq;

            let mut header = PacketHeader::new(PacketKind::Reliable(main_seq), self.rcv_seq.prev().to_raw());
            header.extra_count = extra_count;

            let payload_len = payload.len();
            if self.send_to_peer(ctx, header, payload).is_err() {
                return;
            }
            self.stats.redundant_sent += redundant;
            budget -= payload_len as isize;
        }
    }

    /// Transmits every queued record once, each in a datagram of its own. Returns the number of
    ///  records that were queued.
    pub(crate) fn flush(&mut self, ctx: &Ctx) -> usize {
        let num_records = self.send_ring.len();
        if self.state != ConnectionState::Open {
            return num_records;
        }
        debug!("connection {}: flushing {} records", self.handle, num_records);

        let ack = self.rcv_seq.prev().to_raw();
        for idx in 0..num_records {
            let Some(record) = self.send_ring.get(idx) else {
                break;
            };
            let header = PacketHeader::new(PacketKind::Reliable(record.seq), ack);
            let data = record.data.clone();
            if self.send_to_peer(ctx, header, data).is_err() {
                break;
            }
        }
        self.send_ring.mark_sent(num_records);
        num_records
    }

    /// Application send. Returns the number of reliable records in the send ring.
    pub(crate) fn send(&mut self, ctx: &Ctx, data: &[u8], delivery: Delivery, transmit: Transmit) -> TransportResult<usize> {
        self.check_failure()?;
        if self.state != ConnectionState::Open {
            return Err(TransportError::BadState);
        }

        let max = ctx.config.max_message_size.min(ctx.config.datagram_payload_budget(self.meta_len()));
        if data.len() > max {
            return Err(TransportError::OversizedMessage { len: data.len(), max });
        }
        if data.is_empty() {
            return Ok(self.send_ring.len());
        }

        match delivery {
            Delivery::Reliable => self.enqueue_reliable(ctx, data, transmit),
            Delivery::Unreliable => self.send_unreliable(ctx, data, false),
            Delivery::UnreliableBroadcast => self.send_unreliable(ctx, data, true),
        }
    }

    fn send_unreliable(&mut self, ctx: &Ctx, data: &[u8], broadcast: bool) -> TransportResult<usize> {
        let Some(peer) = self.peer_addr else {
            return Err(TransportError::BadState);
        };
        let to = if broadcast {
            SocketAddr::from((Ipv4Addr::BROADCAST, peer.port()))
        }
        else {
            peer
        };

        let header = PacketHeader::new(PacketKind::Unreliable(self.unreliable_snd_seq), self.rcv_seq.prev().to_raw());
        self.unreliable_snd_seq = self.unreliable_snd_seq.next();

        let datagram = self.datagram(header, data.to_vec());
        match self.transmit(ctx, to, &datagram) {
            Ok(()) => Ok(self.send_ring.len()),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Err(TransportError::WouldBlock),
            Err(e) => {
                self.failure_reported = true;
                Err(TransportError::SocketFailure(e.kind()))
            }
        }
    }

    fn enqueue_reliable(&mut self, ctx: &Ctx, data: &[u8], transmit: Transmit) -> TransportResult<usize> {
        let record = SendRecord {
            seq: self.snd_seq,
            when: ctx.now,
            data: data.to_vec(),
        };
        if self.send_ring.push(record).is_err() {
            trace!("connection {}: send queue full", self.handle);
            return Err(TransportError::WouldBlock);
        }
        self.snd_seq = self.snd_seq.next();

        let depth = self.send_ring.len();
        if depth < self.send_ring.capacity() / 2 && transmit == Transmit::Immediate {
            self.process_output(ctx);
        }
        Ok(depth)
    }

    /// Time-driven work of a poll pass: handshake retransmission, pending output, the silence
    ///  timeout and keepalives
    pub(crate) fn process_timers(&mut self, ctx: &Ctx) {
        let config = ctx.config;
        match self.state {
            ConnectionState::Connecting => {
                if elapsed_more_than(ctx.now, self.send_tick, config.handshake_interval) {
                    self.send_handshake(ctx, PacketKind::Init);
                }
            }
            ConnectionState::Listening => {
                if self.peer_addr.is_some() && elapsed_more_than(ctx.now, self.send_tick, config.handshake_interval) {
                    self.send_handshake(ctx, PacketKind::Poke);
                }
            }
            ConnectionState::Open => {
                if self.send_ring.has_unsent() {
                    self.process_output(ctx);
                }

                let timeout = if self.send_ring.len() > 0 { config.unacked_timeout } else { config.idle_timeout };
                if elapsed_more_than(ctx.now, self.recv_tick, timeout) && !elapsed_more_than(ctx.now, self.send_tick, config.recent_send_window) {
                    info!("connection {}: nothing received for {:?} - timing out", self.handle, timeout);
                    self.close(ctx);
                    return;
                }

                if self.state != ConnectionState::Open || self.send_ring.has_unsent() {
                    return;
                }
                let busy = elapsed_more_than(ctx.now, self.send_reliable_tick, config.busy_keepalive)
                    && (self.rcv_ack != self.rcv_seq || self.send_ring.has_unacked());
                let idle = elapsed_more_than(ctx.now, self.send_tick, config.idle_keepalive);
                if busy || idle || self.rcv_unack >= self.unack_limit {
                    self.rcv_unack = 0;
                    self.send_keepalive(ctx);
                }
            }
            ConnectionState::Idle | ConnectionState::Closed => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use rstest::rstest;
    use crate::config::TransportConfig;
    use crate::connection::{BoundSocket, ConnectionHandle};
    use crate::observer::MockConnectionObserver;
    use crate::packet_header::MetaChunk;
    use crate::redundancy::RedundancyLimit;
    use crate::seq_num::{SeqNum, UnreliableSeq};
    use crate::socket::{MockDatagramSocket, SocketFactory};
    use crate::test_util::{SentDatagram, SimNetwork};
    use crate::tick::Tick;

    const NOW: Tick = 100_000;

    fn peer() -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 2], 7001))
    }

    fn open_connection(net: &SimNetwork, config: &TransportConfig) -> Connection {
        let socket = net.host([10, 0, 0, 1]).bind(SocketAddr::from(([0, 0, 0, 0], 7000))).unwrap();
        with_socket(socket, config)
    }

    fn with_socket(socket: Arc<dyn crate::socket::DatagramSocket>, config: &TransportConfig) -> Connection {
        let mut conn = Connection::new(ConnectionHandle::from_raw(1), config, NOW);
        conn.socket = Some(BoundSocket { id: 1, bind_port: 7000, socket });
        conn.peer_addr = Some(peer());
        conn.state = ConnectionState::Open;
        conn.version = Some(ProtocolVersion::CURRENT);
        conn
    }

    fn ctx(config: &TransportConfig) -> Ctx {
        Ctx { config, observer: None, now: NOW }
    }

    fn decoded(sent: &[SentDatagram]) -> Vec<Datagram> {
        sent.iter().map(|d| d.decode()).collect()
    }

    #[rstest]
    #[case::not_open(ConnectionState::Listening, 10, Err(TransportError::BadState))]
    #[case::closed(ConnectionState::Closed, 10, Err(TransportError::BadState))]
    #[case::oversized(ConnectionState::Open, 1457, Err(TransportError::OversizedMessage { len: 1457, max: 1456 }))]
    #[case::max_size(ConnectionState::Open, 1456, Ok(1))]
    #[case::zero_length(ConnectionState::Open, 0, Ok(0))]
    fn test_send_validation(#[case] state: ConnectionState, #[case] len: usize, #[case] expected: TransportResult<usize>) {
        let net = SimNetwork::new();
        let config = TransportConfig::default_ipv4();
        let mut conn = open_connection(&net, &config);
        conn.state = state;

        assert_eq!(conn.send(&ctx(&config), &vec![1; len], Delivery::Reliable, Transmit::NextPoll), expected);
        assert!(net.take_sent().is_empty());
    }

    #[test]
    fn test_consolidation() {
        let net = SimNetwork::new();
        let config = TransportConfig::default_ipv4();
        let mut conn = open_connection(&net, &config);
        let ctx = ctx(&config);

        for i in 0..3u8 {
            conn.send(&ctx, &[i; 10], Delivery::Reliable, Transmit::NextPoll).unwrap();
        }
        assert!(net.take_sent().is_empty());

        conn.process_output(&ctx);

        let sent = decoded(&net.take_sent());
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].header.kind, PacketKind::Reliable(SeqNum::FIRST.delta(2)));
        assert_eq!(sent[0].header.extra_count, 2);
        assert_eq!(sent[0].header.ack, SeqNum::FIRST.prev().to_raw());

        let mut expected = vec![2; 10];
        expected.extend_from_slice(&[1; 10]);
        expected.push(10);
        expected.extend_from_slice(&[0; 10]);
        expected.push(10);
        assert_eq!(sent[0].payload, expected);

        assert!(!conn.send_ring.has_unsent());
        assert_eq!(conn.send_ring.unacked_bytes(), 30);
    }

    #[test]
    fn test_immediate_send_and_redundancy() {
        let net = SimNetwork::new();
        let config = TransportConfig::default_ipv4();
        let mut conn = open_connection(&net, &config);
        let ctx = ctx(&config);

        conn.send(&ctx, &[1; 10], Delivery::Reliable, Transmit::Immediate).unwrap();
        conn.send(&ctx, &[2; 10], Delivery::Reliable, Transmit::Immediate).unwrap();

        let sent = decoded(&net.take_sent());
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].header.kind, PacketKind::Reliable(SeqNum::FIRST));
        assert_eq!(sent[0].header.extra_count, 0);
        assert_eq!(sent[0].payload, vec![1; 10]);

        assert_eq!(sent[1].header.kind, PacketKind::Reliable(SeqNum::FIRST.next()));
        assert_eq!(sent[1].header.extra_count, 1);
        let mut expected = vec![2; 10];
        expected.extend_from_slice(&[1; 10]);
        expected.push(10);
        assert_eq!(sent[1].payload, expected);

        assert_eq!(conn.stats.redundant_sent, 1);
        assert_eq!(conn.redundancy.to_raw(), 0x7000_0000);
    }

    #[test]
    fn test_redundant_limit_bounds_copies() {
        let net = SimNetwork::new();
        let config = TransportConfig::default_ipv4();
        let mut conn = open_connection(&net, &config);
        let ctx = ctx(&config);

        // default redundant limit of 64 bytes: the main record plus at most two 20-byte copies
        for i in 0..4u8 {
            conn.send(&ctx, &[i; 20], Delivery::Reliable, Transmit::NextPoll).unwrap();
            conn.process_output(&ctx);
        }

        let sent = decoded(&net.take_sent());
        let extra_counts = sent.iter().map(|d| d.header.extra_count).collect::<Vec<_>>();
        assert_eq!(extra_counts, vec![0, 1, 2, 2]);
    }

    #[test]
    fn test_redundant_copies_fit_datagram_with_meta_chunk() {
        let net = SimNetwork::new();
        let config = TransportConfig::default_ipv4();
        let mut conn = open_connection(&net, &config);
        conn.meta_type = MetaChunk::TYPE_CLIENT_IDENTS;
        conn.redundant_limit = config.datagram_payload_budget(0);
        conn.unack_limit = 100_000;
        let ctx = ctx(&config);

        for i in 1..=14u8 {
            let len = if i == 7 { 50 } else { 200 };
            conn.send(&ctx, &vec![i; len], Delivery::Reliable, Transmit::NextPoll).unwrap();
        }
        conn.process_output(&ctx);

        let sent = net.take_sent();
        let sizes = sent.iter().map(|d| d.data.len()).collect::<Vec<_>>();
        assert_eq!(sizes, vec![1272, 1422]);
        // the 50-byte record would push the second datagram one byte past the limit
        assert_eq!(decoded(&sent)[1].header.extra_count, 6);
    }

    /// A record beyond the peer's subpacket limit (250 bytes for 1.0, 1530 for 1.1) has no length
    ///  encoding, so it can only travel as the sole forward record of a datagram
    #[rstest]
    #[case::peer_1_0_sends_long_record_alone(ProtocolVersion::V1_0, vec![(256, 0, 10), (257, 0, 600), (258, 0, 20)])]
    #[case::peer_1_1_consolidates_long_record(ProtocolVersion::V1_1, vec![(258, 2, 633)])]
    fn test_subpacket_limit_by_version(#[case] version: ProtocolVersion, #[case] expected: Vec<(u32, u8, usize)>) {
        let net = SimNetwork::new();
        let config = TransportConfig::default_ipv4();
        let mut conn = open_connection(&net, &config);
        conn.version = Some(version);
        conn.unack_limit = 100_000;
        let ctx = ctx(&config);

        for len in [10, 600, 20] {
            conn.send(&ctx, &vec![7; len], Delivery::Reliable, Transmit::NextPoll).unwrap();
        }
        conn.process_output(&ctx);

        let sent = decoded(&net.take_sent()).into_iter()
            .map(|d| (d.header.kind.to_raw(), d.header.extra_count, d.payload.len()))
            .collect::<Vec<_>>();
        assert_eq!(sent, expected);
    }

    #[test]
    fn test_unack_limit_and_min_send_rate() {
        let net = SimNetwork::new();
        let config = TransportConfig::default_ipv4();
        let mut conn = open_connection(&net, &config);

        for i in 0..4u8 {
            conn.send(&ctx(&config), &[i; 1000], Delivery::Reliable, Transmit::NextPoll).unwrap();
        }

        conn.process_output(&ctx(&config));
        let sent = decoded(&net.take_sent());
        assert_eq!(sent.len(), 3);
        assert_eq!(conn.send_ring.unsent_idx(), 3);

        // limit exhausted, and the last send is recent
        let ctx_later = Ctx { config: &config, observer: None, now: NOW + 100 };
        conn.process_output(&ctx_later);
        assert!(net.take_sent().is_empty());

        let ctx_much_later = Ctx { config: &config, observer: None, now: NOW + 251 };
        conn.process_output(&ctx_much_later);
        let sent = decoded(&net.take_sent());
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].header.kind, PacketKind::Reliable(SeqNum::FIRST.delta(3)));
        assert!(!conn.send_ring.has_unsent());
    }

    #[test]
    fn test_send_queue_full() {
        let net = SimNetwork::new();
        let mut config = TransportConfig::default_ipv4();
        config.send_queue_len = 2;
        let mut conn = open_connection(&net, &config);
        let ctx = ctx(&config);

        assert_eq!(conn.send(&ctx, &[1], Delivery::Reliable, Transmit::NextPoll), Ok(1));
        assert_eq!(conn.send(&ctx, &[2], Delivery::Reliable, Transmit::NextPoll), Ok(2));
        assert_eq!(conn.send(&ctx, &[3], Delivery::Reliable, Transmit::NextPoll), Err(TransportError::WouldBlock));
        assert_eq!(conn.snd_seq, SeqNum::FIRST.delta(2));
    }

    #[test]
    fn test_keepalive() {
        let net = SimNetwork::new();
        let config = TransportConfig::default_ipv4();
        let mut conn = open_connection(&net, &config);
        let ctx = ctx(&config);

        conn.send_keepalive(&ctx);
        let sent = decoded(&net.take_sent());
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].header.kind, PacketKind::Reliable(SeqNum::FIRST));
        assert!(sent[0].payload.is_empty());

        conn.send(&ctx, &[5; 10], Delivery::Reliable, Transmit::Immediate).unwrap();
        net.take_sent();

        // the outstanding record goes out again
        conn.send_keepalive(&ctx);
        let sent = decoded(&net.take_sent());
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].header.kind, PacketKind::Reliable(SeqNum::FIRST));
        assert_eq!(sent[0].payload, vec![5; 10]);
        assert_eq!(conn.send_ring.unsent_idx(), 1);
    }

    #[test]
    fn test_flush() {
        let net = SimNetwork::new();
        let config = TransportConfig::default_ipv4();
        let mut conn = open_connection(&net, &config);
        let ctx = ctx(&config);

        conn.send(&ctx, &[1; 10], Delivery::Reliable, Transmit::Immediate).unwrap();
        conn.send(&ctx, &[2; 10], Delivery::Reliable, Transmit::NextPoll).unwrap();
        net.take_sent();

        assert_eq!(conn.flush(&ctx), 2);
        let sent = decoded(&net.take_sent());
        assert_eq!(sent.iter().map(|d| d.header.extra_count).collect::<Vec<_>>(), vec![0, 0]);
        assert_eq!(sent[0].payload, vec![1; 10]);
        assert_eq!(sent[1].payload, vec![2; 10]);
        assert!(!conn.send_ring.has_unsent());
    }

    #[test]
    fn test_unreliable() {
        let net = SimNetwork::new();
        let config = TransportConfig::default_ipv4();
        let mut conn = open_connection(&net, &config);
        let ctx = ctx(&config);

        conn.send(&ctx, &[1, 2], Delivery::Unreliable, Transmit::Immediate).unwrap();
        conn.send(&ctx, &[3], Delivery::UnreliableBroadcast, Transmit::Immediate).unwrap();

        let sent = net.take_sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].to, peer());
        assert_eq!(sent[0].decode().header.kind, PacketKind::Unreliable(UnreliableSeq::FIRST));
        assert_eq!(sent[0].decode().payload, vec![1, 2]);
        assert_eq!(sent[1].to, SocketAddr::from(([255, 255, 255, 255], 7001)));
        assert_eq!(sent[1].decode().header.kind, PacketKind::Unreliable(UnreliableSeq::FIRST.next()));
        assert_eq!(conn.send_ring.len(), 0);
    }

    #[test]
    fn test_handshake_carries_ident_and_version() {
        let net = SimNetwork::new();
        let config = TransportConfig::default_ipv4();
        let mut conn = open_connection(&net, &config);
        conn.conn_ident = 0x1234_5678;
        conn.client_ident = 99;

        conn.send_handshake(&ctx(&config), PacketKind::Init);

        let sent = decoded(&net.take_sent());
        assert_eq!(sent[0].header.kind, PacketKind::Init);
        assert_eq!(sent[0].header.ack, 0x1234_5678);
        assert_eq!(sent[0].handshake, Some(HandshakeBody { client_ident: 99, version: ProtocolVersion::CURRENT }));
    }

    #[test]
    fn test_observer_notified_of_forward_records() {
        let net = SimNetwork::new();
        let config = TransportConfig::default_ipv4();
        let mut conn = open_connection(&net, &config);

        let mut observer = MockConnectionObserver::new();
        observer.expect_on_transmitted()
            .withf(|conn, data, now| *conn == ConnectionHandle::from_raw(1) && data.len() == 3 && *now == NOW)
            .times(2)
            .return_const(());
        let ctx = Ctx { config: &config, observer: Some(&observer), now: NOW };

        conn.send(&ctx, &[1; 3], Delivery::Reliable, Transmit::NextPoll).unwrap();
        conn.send(&ctx, &[2; 3], Delivery::Reliable, Transmit::NextPoll).unwrap();
        conn.process_output(&ctx);
    }

    #[rstest]
    #[case::would_block(ErrorKind::WouldBlock, Err(TransportError::WouldBlock), ConnectionState::Open)]
    #[case::refused(ErrorKind::ConnectionRefused, Err(TransportError::SocketFailure(ErrorKind::ConnectionRefused)), ConnectionState::Closed)]
    fn test_socket_error(#[case] kind: ErrorKind, #[case] expected: TransportResult<usize>, #[case] expected_state: ConnectionState) {
        let mut socket = MockDatagramSocket::new();
        socket.expect_send_to()
            .withf(|_, to| *to == peer())
            .times(1)
            .returning(move |_, _| Err(io::Error::from(kind)));

        let config = TransportConfig::default_ipv4();
        let mut conn = with_socket(Arc::new(socket), &config);

        assert_eq!(conn.send(&ctx(&config), &[1], Delivery::Unreliable, Transmit::Immediate), expected);
        assert_eq!(conn.state, expected_state);
        // a failure reported with the failing call is not reported again
        assert_eq!(conn.check_failure(), Ok(()));
    }

    #[test]
    fn test_redundancy_decays_without_ack() {
        let net = SimNetwork::new();
        let config = TransportConfig::default_ipv4();
        let mut conn = open_connection(&net, &config);
        conn.redundant_limit = 1000;
        conn.unack_limit = 100_000;
        let ctx = ctx(&config);

        for i in 0..16u8 {
            conn.send(&ctx, &[i; 10], Delivery::Reliable, Transmit::NextPoll).unwrap();
        }
        conn.process_output(&ctx);
        for i in 16..20u8 {
            conn.send(&ctx, &[i; 10], Delivery::Reliable, Transmit::NextPoll).unwrap();
            conn.process_output(&ctx);
        }

        let redundant = decoded(&net.take_sent()).iter()
            .skip(1)
            .map(|d| d.header.extra_count)
            .collect::<Vec<_>>();
        // the first datagram carries eight forward records, the second eight forward plus copies
        assert_eq!(redundant, vec![7 + 8, 7, 3, 1, 1]);
        assert!(redundant.windows(2).skip(1).all(|w| w[1] <= w[0]));
        assert_eq!(conn.redundancy.to_raw(), RedundancyLimit::MIN);
    }

    #[test]
    fn test_timers_resend_init() {
        let net = SimNetwork::new();
        let config = TransportConfig::default_ipv4();
        let mut conn = open_connection(&net, &config);
        conn.state = ConnectionState::Connecting;
        conn.send_tick = NOW - 5000;

        let at = |now: Tick| Ctx { config: &config, observer: None, now };

        conn.process_timers(&at(NOW));
        conn.process_timers(&at(NOW + 500));
        conn.process_timers(&at(NOW + 1001));

        let kinds = decoded(&net.take_sent()).iter().map(|d| d.header.kind).collect::<Vec<_>>();
        assert_eq!(kinds, vec![PacketKind::Init, PacketKind::Init]);
        assert_eq!(conn.state, ConnectionState::Connecting);
    }

    #[rstest]
    #[case::with_poke_target(true, 1)]
    #[case::without_poke_target(false, 0)]
    fn test_timers_poke(#[case] has_target: bool, #[case] expected: usize) {
        let net = SimNetwork::new();
        let config = TransportConfig::default_ipv4();
        let mut conn = open_connection(&net, &config);
        conn.state = ConnectionState::Listening;
        conn.send_tick = NOW - 5000;
        if !has_target {
            conn.peer_addr = None;
        }

        conn.process_timers(&ctx(&config));
        conn.process_timers(&ctx(&config));

        let sent = decoded(&net.take_sent());
        assert_eq!(sent.len(), expected);
        assert!(sent.iter().all(|d| d.header.kind == PacketKind::Poke));
    }

    #[rstest]
    #[case::idle_silence(false, 61_000, 100, ConnectionState::Closed)]
    #[case::idle_recent_receive(false, 59_000, 100, ConnectionState::Open)]
    #[case::outstanding_within_timeout(true, 61_000, 100, ConnectionState::Open)]
    #[case::outstanding_silence(true, 121_000, 100, ConnectionState::Closed)]
    #[case::we_were_quiet(false, 61_000, 3000, ConnectionState::Open)]
    fn test_timers_timeout(#[case] outstanding: bool, #[case] recv_age: Tick, #[case] send_age: Tick, #[case] expected: ConnectionState) {
        let net = SimNetwork::new();
        let config = TransportConfig::default_ipv4();
        let mut conn = open_connection(&net, &config);
        if outstanding {
            conn.send_ring.push(SendRecord { seq: SeqNum::FIRST, when: NOW, data: vec![1; 10] }).unwrap();
            conn.send_ring.mark_sent(1);
            conn.snd_seq = SeqNum::FIRST.next();
        }
        conn.recv_tick = NOW.wrapping_sub(recv_age);
        conn.send_tick = NOW - send_age;
        conn.send_reliable_tick = NOW;

        conn.process_timers(&ctx(&config));

        assert_eq!(conn.state, expected);
        let sent = decoded(&net.take_sent());
        if expected == ConnectionState::Closed {
            assert_eq!(sent.last().unwrap().header.kind, PacketKind::Disc);
        }
    }

    #[rstest]
    #[case::quiet(100, 100, false, 0, false, None)]
    #[case::idle(2501, 2501, false, 0, false, Some(0))]
    #[case::unacknowledged_receive(100, 101, true, 0, false, Some(0))]
    #[case::unacknowledged_receive_recent(100, 99, true, 0, false, None)]
    #[case::unack_bytes(100, 100, false, 2048, false, Some(0))]
    #[case::outstanding_record(100, 101, false, 0, true, Some(10))]
    fn test_timers_keepalive(
        #[case] send_age: Tick,
        #[case] reliable_age: Tick,
        #[case] unacked_receive: bool,
        #[case] rcv_unack: usize,
        #[case] outstanding: bool,
        #[case] expected_payload_len: Option<usize>,
    ) {
        let net = SimNetwork::new();
        let config = TransportConfig::default_ipv4();
        let mut conn = open_connection(&net, &config);
        conn.recv_tick = NOW;
        conn.send_tick = NOW - send_age;
        conn.send_reliable_tick = NOW - reliable_age;
        conn.rcv_unack = rcv_unack;
        if unacked_receive {
            conn.rcv_seq = SeqNum::FIRST.next();
        }
        if outstanding {
            conn.send_ring.push(SendRecord { seq: SeqNum::FIRST, when: NOW, data: vec![1; 10] }).unwrap();
            conn.send_ring.mark_sent(1);
            conn.snd_seq = SeqNum::FIRST.next();
        }

        conn.process_timers(&ctx(&config));

        let sent = decoded(&net.take_sent());
        assert_eq!(sent.iter().map(|d| d.payload.len()).collect::<Vec<_>>(), expected_payload_len.into_iter().collect::<Vec<_>>());
        if expected_payload_len.is_some() {
            assert_eq!(conn.rcv_unack, 0);
            assert_eq!(conn.rcv_ack, conn.rcv_seq);
        }
    }

    #[test]
    fn test_timers_send_queued_records() {
        let net = SimNetwork::new();
        let config = TransportConfig::default_ipv4();
        let mut conn = open_connection(&net, &config);
        conn.recv_tick = NOW;
        conn.send(&ctx(&config), &[1; 10], Delivery::Reliable, Transmit::NextPoll).unwrap();

        conn.process_timers(&ctx(&config));

        let sent = decoded(&net.take_sent());
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].payload, vec![1; 10]);
    }
}
