use std::fmt::{Display, Formatter};

/// Sequence value of the reliable ring. The 24-bit sequence field of a datagram header starts
///  the reliable space at [SeqNum::FIRST]; values below it are packet types (handshake,
///  NAK) or the unreliable ring.
///
/// NB: Sequence numbers wrap, so they must never be compared with `<` / `>` directly. Use
///  [SeqNum::diff] which yields the signed distance on the ring.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct SeqNum(u32);

impl Display for SeqNum {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SeqNum {
    pub const FIRST: SeqNum = SeqNum(256);
    pub const MASK: u32 = 0x00ff_ffff;
    pub const WINDOW: u32 = (1 << 24) - Self::FIRST.0;

    /// Interprets the low 24 bits of a raw wire value, returning `None` for values below the
    ///  reliable range
    pub fn from_wire(raw: u32) -> Option<SeqNum> {
        let masked = raw & Self::MASK;
        if masked >= Self::FIRST.0 {
            Some(SeqNum(masked))
        }
        else {
            None
        }
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }

    /// position `delta` steps away on the ring
    pub fn delta(&self, delta: i32) -> SeqNum {
        let window = Self::WINDOW as i64;
        let offs = (self.0 as i64 - Self::FIRST.0 as i64 + delta as i64).rem_euclid(window);
        SeqNum(offs as u32 + Self::FIRST.0)
    }

    pub fn next(&self) -> SeqNum {
        self.delta(1)
    }

    pub fn prev(&self) -> SeqNum {
        self.delta(-1)
    }

    /// Signed distance `self - other` on the ring, in the range `-WINDOW/2 .. WINDOW/2`.
    ///  A positive value means `self` was issued after `other`.
    pub fn diff(&self, other: SeqNum) -> i32 {
        let window = Self::WINDOW as i64;
        let raw = self.0 as i64 - other.0 as i64;
        ((raw + 3 * window / 2).rem_euclid(window) - window / 2) as i32
    }
}

/// Sequence value of the unreliable ring `128..=255`. There is no retransmission for unreliable
///  datagrams, the receiver only uses gaps for loss statistics.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct UnreliableSeq(u8);

impl Display for UnreliableSeq {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl UnreliableSeq {
    pub const FIRST: UnreliableSeq = UnreliableSeq(128);

    pub fn from_wire(raw: u32) -> Option<UnreliableSeq> {
        match raw & SeqNum::MASK {
            v @ 128..=255 => Some(UnreliableSeq(v as u8)),
            _ => None,
        }
    }

    pub fn to_raw(&self) -> u32 {
        self.0 as u32
    }

    pub fn next(&self) -> UnreliableSeq {
        if self.0 == u8::MAX {
            Self::FIRST
        }
        else {
            UnreliableSeq(self.0 + 1)
        }
    }

    /// Number of datagrams that went missing between the expected value `self` and the
    ///  actually received value `received`. Values more than 32 behind the expected value are
    ///  treated as reordered stragglers rather than a gap of almost a full ring.
    pub fn lost_before(&self, received: UnreliableSeq) -> u32 {
        let delta = (received.0.wrapping_sub(self.0) & 127) as u32;
        if received.0 > self.0 || delta < 32 {
            delta
        }
        else {
            0
        }
    }
}
