use std::net::SocketAddr;
use tracing::{debug, info, trace, warn};
use crate::connection::{Connection, ConnectionState, Ctx};
use crate::packet_header::{Datagram, PacketHeader, PacketKind};
use crate::ring::Received;
use crate::seq_num::SeqNum;
use crate::stats::UDP_IP_OVERHEAD;
use crate::subpacket::decode_subpacket_len;
use crate::tick::tick_minus;

/// free receive slots kept for reliable records: unreliable ones are dropped below this
const RELIABLE_HEADROOM: usize = 4;

/// What happened to a received (sub)packet
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) enum InputOutcome {
    /// a reliable record is missing, and a NAK went out
    Nak,
    /// duplicate, or empty keepalive
    Old,
    New,
    BufferFull,
}

impl Connection {
    /// Demultiplexing: does a datagram that arrived on socket `socket_id` from `from` belong to
    ///  this connection? Listening connections never claim, they accept unclaimed handshakes.
    pub(crate) fn claims(&self, socket_id: u64, from: SocketAddr, datagram: &Datagram) -> bool {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Open => {}
            ConnectionState::Idle | ConnectionState::Listening | ConnectionState::Closed => return false,
        }
        if self.socket.as_ref().map(|s| s.id) != Some(socket_id) || self.peer_addr != Some(from) {
            return false;
        }

        match &datagram.meta {
            Some(meta) => meta.sender == self.remote_client_ident && meta.receiver == self.client_ident,
            None => match datagram.header.kind {
                PacketKind::Init | PacketKind::Poke => datagram.header.ack == self.conn_ident,
                _ => true,
            }
        }
    }

    /// Entry point for a datagram this connection claimed. `wire_len` is its size on the wire.
    pub(crate) fn process_datagram(&mut self, ctx: &Ctx, datagram: &Datagram, wire_len: usize) {
        let kind = datagram.header.kind;
        let payload_len = datagram.payload.len();
        trace!("connection {}: received {:?} with {} payload bytes", self.handle, datagram.header, payload_len);

        self.stats.overhead_received += UDP_IP_OVERHEAD + wire_len.saturating_sub(payload_len) as u64;

        // data from the peer means it got our INIT, even if its CONN was lost
        if kind.is_data() && self.state == ConnectionState::Connecting {
            info!("connection {}: open (data before CONN)", self.handle);
            self.state = ConnectionState::Open;
        }
        if self.state == ConnectionState::Open {
            self.stats.packets_received += 1;
            self.stats.bytes_received += payload_len as u64;
        }

        if kind.is_setup() {
            self.process_setup(ctx, datagram);
            return;
        }
        if self.state != ConnectionState::Open {
            debug!("connection {}: {:?} in state {:?} - dropping", self.handle, kind, self.state);
            return;
        }
        self.process_data(ctx, &datagram.header, &datagram.payload);
    }

    /// Retires acknowledged records from the send ring. A NAK additionally rewinds the send
    ///  ring and resends everything outstanding right away.
    pub(crate) fn process_flow(&mut self, ctx: &Ctx, kind: PacketKind, ack: u32) {
        let nak = kind == PacketKind::Nak;

        // a NAK names the record that is missing, i.e. acknowledges its predecessor
        let ack = match (nak, SeqNum::from_wire(ack)) {
            (false, _) => ack,
            (true, Some(seq)) => seq.prev().to_raw(),
            (true, None) => ack.wrapping_sub(1),
        };

        let mut retired = false;
        if let Some(ack) = SeqNum::from_wire(ack) {
            while let Some(front) = self.send_ring.front() {
                if ack.diff(front.seq) < 0 {
                    break;
                }
                trace!("connection {}: record {} acknowledged", self.handle, front.seq);
                self.send_ring.retire_front();
                retired = true;
            }
        }
        if retired {
            self.redundancy.on_ack();
        }

        if nak {
            debug!("connection {}: received NAK, resending from {}", self.handle, SeqNum::from_wire(ack).map(|s| s.next()).unwrap_or(SeqNum::FIRST));
            self.stats.naks_received += 1;
            self.send_ring.rewind();
            self.process_output(ctx);
        }
    }

    /// Admission of a single (sub)packet into the receive ring
    pub(crate) fn process_input(&mut self, ctx: &Ctx, kind: PacketKind, data: &[u8]) -> InputOutcome {
        if self.receive_ring.is_full() {
            debug!("connection {}: receive queue full, dropping {:?}", self.handle, kind);
            return InputOutcome::BufferFull;
        }

        let reliable = match kind {
            PacketKind::Unreliable(seq) => {
                self.stats.packets_lost += self.unreliable_rcv_seq.lost_before(seq) as u64;
                self.unreliable_rcv_seq = seq.next();

                if self.receive_ring.free_slots() <= RELIABLE_HEADROOM {
                    trace!("connection {}: dropping unreliable {} to keep room for reliable records", self.handle, seq);
                    return InputOutcome::BufferFull;
                }
                false
            }
            PacketKind::Reliable(seq) => {
                let diff = seq.diff(self.rcv_seq);
                if diff < 0 {
                    return InputOutcome::Old;
                }
                if diff > 0 {
                    debug!("connection {}: received {} while expecting {}", self.handle, seq, self.rcv_seq);
                    self.stats.packets_lost += diff as u64;
                    self.send_nak(ctx);
                    return InputOutcome::Nak;
                }
                if data.is_empty() {
                    return InputOutcome::Old;
                }
                true
            }
            _ => return InputOutcome::Old,
        };

        let received = Received {
            data: data.to_vec(),
            when: ctx.now,
        };
        if self.receive_ring.push(received).is_err() {
            return InputOutcome::BufferFull;
        }

        if reliable {
            self.rcv_seq = self.rcv_seq.next();
            self.rcv_unack += data.len();
        }
        if let Some(observer) = ctx.observer {
            observer.on_delivered(self.handle, data, ctx.now);
        }
        InputOutcome::New
    }

    /// Handles a data datagram or NAK that was dispatched to this connection
    pub(crate) fn process_data(&mut self, ctx: &Ctx, header: &PacketHeader, payload: &[u8]) {
        self.recv_tick = ctx.now;
        match header.kind {
            PacketKind::Nak => self.process_flow(ctx, header.kind, header.ack),
            PacketKind::Reliable(main_seq) if header.extra_count > 0 => self.process_consolidated(ctx, main_seq, header, payload),
            kind => {
                self.process_flow(ctx, kind, header.ack);
                self.process_input(ctx, kind, payload);
            }
        }
    }

    /// Peels subpackets off the end of the payload, oldest first. Processing stops at a corrupt
    ///  length or after a NAK, so that at most one NAK goes out per datagram.
    fn process_consolidated(&mut self, ctx: &Ctx, main_seq: SeqNum, header: &PacketHeader, payload: &[u8]) {
        let extra_count = header.extra_count;
        let mut seq = main_seq.delta(-(extra_count as i32));
        let mut remaining = payload;
        let mut prev_rcv_seq = self.rcv_seq;

        for remaining_extra in (0..=extra_count).rev() {
            let subpacket = if remaining_extra > 0 {
                let (len, len_bytes) = match decode_subpacket_len(remaining) {
                    Ok(decoded) => decoded,
                    Err(e) => {
                        warn!("connection {}: corrupt subpacket in {:?}: {}", self.handle, header, e);
                        return;
                    }
                };
                let Some(start) = remaining.len().checked_sub(len + len_bytes) else {
                    warn!("connection {}: subpacket length {} exceeds the datagram {:?}", self.handle, len, header);
                    return;
                };
                let subpacket = &remaining[start..start + len];
                remaining = &remaining[..start];
                subpacket
            }
            else {
                remaining
            };

            self.process_flow(ctx, PacketKind::Reliable(seq), header.ack);
            let outcome = self.process_input(ctx, PacketKind::Reliable(seq), subpacket);

            if remaining_extra > 0 && prev_rcv_seq != self.rcv_seq {
                trace!("connection {}: redundant copy of {} prevented a loss", self.handle, seq);
                self.stats.packets_saved += 1;
                prev_rcv_seq = self.rcv_seq;
            }
            if outcome == InputOutcome::Nak {
                return;
            }
            seq = seq.next();
        }
    }

    /// Handshake and teardown packets (INIT, CONN, POKE, DISC) for this connection
    pub(crate) fn process_setup(&mut self, ctx: &Ctx, datagram: &Datagram) {
        let kind = datagram.header.kind;
        if datagram.header.ack != self.conn_ident {
            warn!("connection {}: connection identifier mismatch in {:?} (expected {:#010x})", self.handle, datagram.header, self.conn_ident);
            // a new INIT means the peer abandoned the old session
            if kind == PacketKind::Init {
                info!("connection {}: peer restarted the session - closing", self.handle);
                self.state = ConnectionState::Closed;
            }
            return;
        }

        // in the past, so that the timeout does not race with the handshake
        self.recv_tick = tick_minus(ctx.now, 1000);

        if self.version.is_none() {
            if let Some(handshake) = &datagram.handshake {
                debug!("connection {}: peer uses protocol version {}", self.handle, handshake.version);
                self.version = Some(handshake.version);
            }
        }

        match kind {
            PacketKind::Init | PacketKind::Poke => {
                if kind == PacketKind::Init && self.state == ConnectionState::Connecting {
                    info!("connection {}: open (concurrent INIT)", self.handle);
                    self.state = ConnectionState::Open;
                }
                self.send_handshake(ctx, PacketKind::Conn);
            }
            PacketKind::Conn => {
                if self.state == ConnectionState::Connecting {
                    info!("connection {}: open", self.handle);
                    self.state = ConnectionState::Open;
                }
            }
            PacketKind::Disc => {
                if self.state == ConnectionState::Open {
                    info!("connection {}: peer disconnected", self.handle);
                    self.state = ConnectionState::Closed;
                }
            }
            _ => {}
        }
    }
}
