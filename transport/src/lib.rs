//! A reliable, session-oriented transport over UDP for small numbers of concurrent peers. It
//!  keeps latency low by consolidating small messages into datagrams and padding datagrams with
//!  redundant copies of recent unacknowledged messages, so that a single lost datagram is usually
//!  recovered without a round trip.
//!
//! ## Design goals
//!
//! * The abstraction is sending / receiving *messages*, each fitting into a single datagram
//! * Reliable messages are delivered exactly once and in order; unreliable messages are
//!    delivered at most once, in whatever order they arrive
//! * Loss is recovered primarily by redundancy: every datagram carries copies of the most recent
//!    unacknowledged messages, as far as the per-connection byte limit allows. The amount of
//!    redundancy decays while acknowledgements are outstanding, and recovers when they arrive.
//! * A receiver that detects a gap sends a negative ack (NAK) right away, and the sender resends
//!    everything from the missing message on
//! * Several connections can share a UDP port: datagrams are demultiplexed by peer address and
//!    a connection identifier
//! * No dedicated threads: an application (or the [driver::SharedRegistry] poll loop) drives the
//!    transport by calling [registry::Registry::poll_tick] periodically
//!
//! ## Header
//!
//! Every datagram starts with two 32-bit words in network byte order (BE):
//!
//! ```ascii
//! 0: sequence word
//!    * bits 31-28: number of extra subpackets consolidated into this datagram
//!    * bits 27-24: metadata type (0: none, 1: client identifier pair)
//!    * bits 23-0:  packet kind, or sequence number
//!      * 1 INIT, 2 CONN, 3 DISC, 4 NAK, 5 POKE
//!      * 128-255: unreliable sequence number
//!      * 256 and up: reliable sequence number (a ring of 2^24 - 256 values)
//! 4: ack word
//!    * handshake packets (INIT, CONN, POKE) and DISC: the connection identifier
//!    * NAK: the reliable sequence number the receiver is missing
//!    * data packets: the last reliable sequence number received in order
//! ```
//!
//! Handshake packets continue with the sender's client identifier (u32), the optional metadata
//!  chunk and the protocol version (major and minor byte). Other packets continue with the
//!  optional metadata chunk, followed by payload. The metadata chunk is two u32 client
//!  identifiers: sender, receiver.
//!
//! ## Consolidation
//!
//! A reliable datagram's sequence number is that of its *main* record, which comes first in the
//!  payload. Older records follow, each with its length appended, in order of decreasing
//!  sequence number:
//!
//! ```ascii
//! [main record] [record main-1][len] [record main-2][len] ...
//! ```
//!
//! The receiver peels these subpackets off the end of the payload, i.e. oldest first. A length
//!  up to 250 is encoded in a single byte, longer ones (up to 1530) in two bytes. Peers with
//!  protocol version 1.0 only understand single-byte lengths.
//!
//! ## Connection lifecycle
//!
//! ```ascii
//! Idle --connect--> Connecting --CONN / INIT / data--> Open
//! Idle --listen--> Listening --INIT / CONN--> Open
//! Open --DISC / timeout / unconnect--> Closed
//! ```
//!
//! A connection that is connecting resends INIT every second. A listening connection with a
//!  known peer (the 'poke target') sends POKE every second, inviting the peer to connect through
//!  whatever NAT is in between.

pub mod config;
pub mod error;
pub mod tick;
pub mod seq_num;
pub mod subpacket;
pub mod packet_header;
pub mod endpoint;
pub mod ring;
pub mod stats;
pub mod socket;
pub mod observer;
pub mod redundancy;
pub mod connection;
mod send_pipeline;
mod receive_pipeline;
pub mod registry;
pub mod driver;

#[cfg(test)] mod test_util;

pub use config::TransportConfig;
pub use connection::{Connection, ConnectionHandle, ConnectionOption, ConnectionState, ConnectionStatus};
pub use driver::SharedRegistry;
pub use error::{TransportError, TransportResult};
pub use observer::ConnectionObserver;
pub use registry::Registry;
pub use ring::Received;
pub use send_pipeline::Delivery;
pub use stats::ConnectionStats;
pub use tick::{Clock, Tick, TokioClock};
