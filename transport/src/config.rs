use std::net::Ipv4Addr;
use std::time::Duration;
use anyhow::bail;
use crate::packet_header::{PacketHeader, MetaChunk};

pub struct TransportConfig {
    /// This is the payload size inside UDP datagrams that the transport assumes, including our own
    ///  header and the optional metadata chunk. Consolidation of queued messages never produces
    ///  a datagram bigger than this.
    ///
    /// With full Ethernet frames and no optional IP headers, this payload is `1500 - 20 - 8 = 1472`
    ///  for IPV4. The transport does not attempt to discover the path MTU, so choosing this value
    ///  too big causes datagrams to be dropped (or fragmented) on some routes.
    pub max_datagram_size: usize,

    /// The width of a queue record, i.e. the biggest message `send` accepts. Must fit into a
    ///  single datagram together with header and metadata chunk.
    pub max_message_size: usize,

    /// Number of records in the send ring. A reliable send into a full ring fails with
    ///  `WouldBlock`.
    pub send_queue_len: usize,
    /// Number of records in the receive ring. Reliable datagrams arriving while it is full are
    ///  dropped and recovered by the sender's redundancy / NAK handling once the application
    ///  drains the ring.
    pub receive_queue_len: usize,

    /// Default for the number of sent-but-unacknowledged bytes a connection may have in flight
    ///  before it waits for acknowledgement. Can be overridden per connection.
    pub unack_limit: usize,
    /// Default for the size in bytes a datagram may grow to by including redundant copies of
    ///  previously sent records. Can be overridden per connection.
    pub redundant_limit: usize,

    /// A connection that sent nothing for `min_send_interval` may send at least this many
    ///  bytes regardless of its unack limit.
    pub min_send_bytes: usize,
    pub min_send_interval: Duration,

    /// Keepalive interval while reliable data is unacknowledged (in either direction)
    pub busy_keepalive: Duration,
    /// Keepalive interval while there is no traffic at all
    pub idle_keepalive: Duration,
    /// Interval for resending INIT while connecting, and for POKE while listening with a
    ///  known peer
    pub handshake_interval: Duration,

    /// Silence after which an open connection with outstanding records is closed
    pub unacked_timeout: Duration,
    /// Silence after which an open connection without outstanding records is closed
    pub idle_timeout: Duration,
    /// A timeout is only acted upon if we sent something within this window. If we did not,
    ///  the silence is ours and not evidence of a dead peer.
    pub recent_send_window: Duration,

    /// Upper bound on the datagrams a single poll pass handles before yielding
    pub max_datagrams_per_poll: usize,

    /// Local interface sockets are bound to
    pub bind_ip: Ipv4Addr,
}

impl TransportConfig {
    /// ipv4 with end-to-end full Ethernet MTU, without optional IP headers
    pub fn default_ipv4() -> TransportConfig {
        TransportConfig {
            max_datagram_size: 1472,
            max_message_size: 1472 - PacketHeader::SERIALIZED_LEN - MetaChunk::SERIALIZED_LEN,
            send_queue_len: 64,
            receive_queue_len: 64,
            unack_limit: 2048,
            redundant_limit: 64,
            min_send_bytes: 256,
            min_send_interval: Duration::from_millis(250),
            busy_keepalive: Duration::from_millis(100),
            idle_keepalive: Duration::from_millis(2500),
            handshake_interval: Duration::from_millis(1000),
            unacked_timeout: Duration::from_secs(120),
            idle_timeout: Duration::from_secs(60),
            recent_send_window: Duration::from_secs(2),
            max_datagrams_per_poll: 64,
            bind_ip: Ipv4Addr::UNSPECIFIED,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_datagram_size < 64 {
            bail!("datagram size {} is too small", self.max_datagram_size);
        }
        if self.max_datagram_size > 65507 {
            bail!("datagram size {} does not fit into a UDP datagram", self.max_datagram_size);
        }
        if self.max_message_size + PacketHeader::SERIALIZED_LEN + MetaChunk::SERIALIZED_LEN > self.max_datagram_size {
            bail!("message size {} plus header and metadata does not fit a datagram of {} bytes", self.max_message_size, self.max_datagram_size);
        }
        if self.send_queue_len < 2 || self.receive_queue_len < 2 {
            bail!("queue lengths must be at least 2");
        }
        if self.unack_limit == 0 {
            bail!("unack limit must not be 0");
        }
        if self.max_datagrams_per_poll == 0 {
            bail!("a poll pass must handle at least one datagram");
        }
        Ok(())
    }

    /// max payload bytes of a single datagram, i.e. after header and (optional) metadata chunk
    pub fn datagram_payload_budget(&self, meta_len: usize) -> usize {
        self.max_datagram_size - PacketHeader::SERIALIZED_LEN - meta_len
    }
}
