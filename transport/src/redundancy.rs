use crate::packet_header::PacketHeader;
use crate::seq_num::SeqNum;

/// Bounds the number of redundant copies of unacknowledged records that go into a datagram.
///
/// The limit is kept in the format of a datagram's sequence word (extra count in the top
///  nibble), and a record may be appended while the datagram's sequence word is still below
///  the limit. It starts out generous, halves with every datagram that goes out while older
///  records are still waiting for acknowledgement, and doubles whenever an acknowledgement
///  arrives. So a link that stops acknowledging sees rapidly fewer copies per datagram.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RedundancyLimit(u32);

impl RedundancyLimit {
    const SHIFT: u32 = 28;
    pub const MIN: u32 = 1 << Self::SHIFT;
    pub const MAX: u32 = (PacketHeader::MAX_EXTRA as u32) << Self::SHIFT;

    pub fn new() -> RedundancyLimit {
        RedundancyLimit(Self::MAX)
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }

    /// can another record be appended to a datagram with main sequence number `seq` that
    ///  already carries `extra_count` extra subpackets?
    pub fn allows(&self, extra_count: u8, seq: SeqNum) -> bool {
        (((extra_count as u32) << Self::SHIFT) | seq.to_raw()) <= self.0
    }

    /// a datagram went out while older records were unacknowledged
    pub fn on_resend(&mut self) {
        let count = (self.0 >> Self::SHIFT) >> 1;
        self.0 = (count << Self::SHIFT).max(Self::MIN);
    }

    /// an acknowledgement retired records
    pub fn on_ack(&mut self) {
        let count = ((self.0 >> Self::SHIFT) << 1).min(Self::MAX >> Self::SHIFT);
        self.0 = count << Self::SHIFT;
    }
}

impl Default for RedundancyLimit {
    fn default() -> Self {
        Self::new()
    }
}
