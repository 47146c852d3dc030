/// IP + UDP header bytes accounted as overhead for every datagram
pub const UDP_IP_OVERHEAD: u64 = 28;

/// Traffic counters of a connection. Payload counters only cover traffic while the connection
///  is open, overhead counters cover all datagrams.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub bytes_sent: u64,
    pub packets_sent: u64,
    pub bytes_received: u64,
    pub packets_received: u64,
    /// gaps in the received sequence (reliable and unreliable)
    pub packets_lost: u64,
    /// records that arrived as redundant copies or consolidated subpackets after the main copy
    ///  was lost
    pub packets_saved: u64,
    /// records included in a datagram as a redundant copy of an earlier send
    pub redundant_sent: u64,
    pub naks_sent: u64,
    pub naks_received: u64,
    pub overhead_sent: u64,
    pub overhead_received: u64,
}
