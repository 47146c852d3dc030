use std::fmt::{Debug, Display, Formatter};
use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
use crate::seq_num::{SeqNum, UnreliableSeq};
use crate::subpacket::{MAX_SHORT_LEN, MAX_SUBPACKET_LEN};

const EXTRA_SHIFT: u32 = 28;
const META_SHIFT: u32 = 24;
const NIBBLE: u32 = 0x0f;

/// number of extra (consolidated) subpackets encoded in the top nibble of a raw sequence word
pub fn extract_extra_subpacket_count(seq_word: u32) -> u32 {
    seq_word >> EXTRA_SHIFT
}

/// metadata type encoded in bits 27..24 of a raw sequence word
pub fn extract_metadata_type(seq_word: u32) -> u8 {
    ((seq_word >> META_SHIFT) & NIBBLE) as u8
}

/// Meaning of the 24-bit sequence field of a datagram
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum PacketKind {
    /// connection request, `ack` carries the connection identifier
    Init,
    /// connection confirmation, `ack` carries the connection identifier
    Conn,
    Disc,
    /// negative ack, `ack` carries the sequence number the receiver is missing
    Nak,
    /// firewall / NAT traversal, `ack` carries the connection identifier
    Poke,
    Unreliable(UnreliableSeq),
    Reliable(SeqNum),
}

impl PacketKind {
    const RAW_INIT: u32 = 1;
    const RAW_CONN: u32 = 2;
    const RAW_DISC: u32 = 3;
    const RAW_NAK: u32 = 4;
    const RAW_POKE: u32 = 5;

    pub fn from_raw(raw: u32) -> Option<PacketKind> {
        let masked = raw & SeqNum::MASK;
        match masked {
            Self::RAW_INIT => Some(PacketKind::Init),
            Self::RAW_CONN => Some(PacketKind::Conn),
            Self::RAW_DISC => Some(PacketKind::Disc),
            Self::RAW_NAK => Some(PacketKind::Nak),
            Self::RAW_POKE => Some(PacketKind::Poke),
            _ => {
                if let Some(seq) = SeqNum::from_wire(masked) {
                    Some(PacketKind::Reliable(seq))
                }
                else {
                    UnreliableSeq::from_wire(masked)
                        .map(PacketKind::Unreliable)
                }
            }
        }
    }

    pub fn to_raw(&self) -> u32 {
        match self {
            PacketKind::Init => Self::RAW_INIT,
            PacketKind::Conn => Self::RAW_CONN,
            PacketKind::Disc => Self::RAW_DISC,
            PacketKind::Nak => Self::RAW_NAK,
            PacketKind::Poke => Self::RAW_POKE,
            PacketKind::Unreliable(seq) => seq.to_raw(),
            PacketKind::Reliable(seq) => seq.to_raw(),
        }
    }

    /// handshake packets carry a client identifier and protocol version instead of payload
    pub fn is_handshake(&self) -> bool {
        matches!(self, PacketKind::Init | PacketKind::Conn | PacketKind::Poke)
    }

    pub fn is_setup(&self) -> bool {
        self.is_handshake() || matches!(self, PacketKind::Disc)
    }

    pub fn is_data(&self) -> bool {
        matches!(self, PacketKind::Unreliable(_) | PacketKind::Reliable(_))
    }
}

/// The two leading 32-bit words of every datagram, in network byte order:
///
/// ```ascii
/// 0: seq  bits 31..28: number of extra subpackets (reliable data only)
///         bits 27..24: metadata type
///         bits 23..0:  packet kind / sequence number
/// 4: ack  cumulative ack (data), missing sequence number (NAK), connection identifier (handshake)
/// ```
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct PacketHeader {
    pub kind: PacketKind,
    pub extra_count: u8,
    pub meta_type: u8,
    pub ack: u32,
}

impl Debug for PacketHeader {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}+{} ack={} meta={}", self.kind, self.extra_count, self.ack, self.meta_type)
    }
}

impl PacketHeader {
    pub const SERIALIZED_LEN: usize = 2 * size_of::<u32>();
    /// maximum number of extra subpackets in a single datagram
    pub const MAX_EXTRA: u8 = NIBBLE as u8;

    pub fn new(kind: PacketKind, ack: u32) -> PacketHeader {
        PacketHeader {
            kind,
            extra_count: 0,
            meta_type: 0,
            ack,
        }
    }

    pub fn seq_word(&self) -> u32 {
        ((self.extra_count as u32) << EXTRA_SHIFT)
            | (((self.meta_type as u32) & NIBBLE) << META_SHIFT)
            | self.kind.to_raw()
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.seq_word());
        buf.put_u32(self.ack);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<PacketHeader> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("datagram of {} bytes is too short for a header", buf.remaining());
        }
        let seq_word = buf.get_u32();
        let ack = buf.get_u32();

        let Some(kind) = PacketKind::from_raw(seq_word) else {
            bail!("invalid packet kind {:x}", seq_word);
        };
        let extra_count = extract_extra_subpacket_count(seq_word) as u8;
        if extra_count > 0 && !matches!(kind, PacketKind::Reliable(_)) {
            bail!("extra subpackets in a datagram of kind {:?}", kind);
        }

        Ok(PacketHeader {
            kind,
            extra_count,
            meta_type: extract_metadata_type(seq_word),
            ack,
        })
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub struct ProtocolVersion(u16);

impl Display for ProtocolVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.0 >> 8, self.0 & 0xff)
    }
}

impl ProtocolVersion {
    pub const V1_0: ProtocolVersion = ProtocolVersion(0x0100);
    pub const V1_1: ProtocolVersion = ProtocolVersion(0x0101);
    pub const CURRENT: ProtocolVersion = Self::V1_1;

    pub fn from_raw(raw: u16) -> ProtocolVersion {
        ProtocolVersion(raw)
    }

    pub fn to_raw(&self) -> u16 {
        self.0
    }

    /// The biggest record that may travel as a non-main subpacket. 1.0 peers only understand
    ///  one-byte subpacket lengths.
    pub fn subpacket_limit(&self) -> usize {
        if *self > Self::V1_0 {
            MAX_SUBPACKET_LEN
        }
        else {
            MAX_SHORT_LEN
        }
    }
}

/// Optional chunk identifying sender and receiver independent of their socket addresses
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct MetaChunk {
    pub sender: u32,
    pub receiver: u32,
}

impl MetaChunk {
    pub const SERIALIZED_LEN: usize = 2 * size_of::<u32>();

    /// no metadata chunk
    pub const TYPE_NONE: u8 = 0;
    /// 8-byte chunk with sender and receiver client identifier
    pub const TYPE_CLIENT_IDENTS: u8 = 1;

    pub fn len_for_type(meta_type: u8) -> usize {
        if meta_type == Self::TYPE_CLIENT_IDENTS {
            Self::SERIALIZED_LEN
        }
        else {
            0
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.sender);
        buf.put_u32(self.receiver);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<MetaChunk> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("truncated metadata chunk");
        }
        Ok(MetaChunk {
            sender: buf.get_u32(),
            receiver: buf.get_u32(),
        })
    }
}

/// Body of INIT, CONN and POKE packets. Legacy 1.0 peers send only the client identifier
///  (or nothing at all for CONN).
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct HandshakeBody {
    pub client_ident: u32,
    pub version: ProtocolVersion,
}

impl HandshakeBody {
    pub const SERIALIZED_LEN: usize = size_of::<u32>() + 2;

    pub fn deser(buf: &mut impl Buf) -> HandshakeBody {
        let client_ident = if buf.remaining() >= 4 { buf.get_u32() } else { 0 };
        let version = if buf.remaining() >= 2 {
            ProtocolVersion(buf.get_u16())
        }
        else {
            ProtocolVersion::V1_0
        };
        HandshakeBody {
            client_ident,
            version,
        }
    }
}

/// A complete datagram as it travels on the wire:
///
/// ```ascii
/// handshake: header(8) client-id(4) [metadata(8)] version(2)
/// other:     header(8) [metadata(8)] payload
/// ```
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Datagram {
    pub header: PacketHeader,
    pub meta: Option<MetaChunk>,
    pub handshake: Option<HandshakeBody>,
    pub payload: Vec<u8>,
}

impl Datagram {
    /// offset of the metadata chunk inside the body following the header. It follows the client
    ///  identifier in all handshake packets, CONN included.
    fn meta_offset(kind: PacketKind) -> usize {
        if kind.is_handshake() { 4 } else { 0 }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        let mut header = self.header;
        header.meta_type = if self.meta.is_some() { MetaChunk::TYPE_CLIENT_IDENTS } else { MetaChunk::TYPE_NONE };
        header.ser(buf);

        match &self.handshake {
            Some(hs) => {
                buf.put_u32(hs.client_ident);
                if let Some(meta) = &self.meta {
                    meta.ser(buf);
                }
                buf.put_u8((hs.version.0 >> 8) as u8);
                buf.put_u8((hs.version.0 & 0xff) as u8);
            }
            None => {
                if let Some(meta) = &self.meta {
                    meta.ser(buf);
                }
            }
        }
        buf.put_slice(&self.payload);
    }

    pub fn serialized_len(&self) -> usize {
        PacketHeader::SERIALIZED_LEN
            + self.meta.map(|_| MetaChunk::SERIALIZED_LEN).unwrap_or(0)
            + self.handshake.map(|_| HandshakeBody::SERIALIZED_LEN).unwrap_or(0)
            + self.payload.len()
    }

    pub fn deser(buf: &[u8]) -> anyhow::Result<Datagram> {
        let mut b = buf;
        let header = PacketHeader::deser(&mut b)?;

        let (meta, body) = match header.meta_type {
            MetaChunk::TYPE_NONE => (None, b.to_vec()),
            MetaChunk::TYPE_CLIENT_IDENTS => {
                let offs = Self::meta_offset(header.kind);
                if b.len() < offs + MetaChunk::SERIALIZED_LEN {
                    bail!("datagram too short for metadata chunk");
                }
                let mut meta_buf = &b[offs..];
                let meta = MetaChunk::deser(&mut meta_buf)?;

                let mut body = Vec::with_capacity(b.len() - MetaChunk::SERIALIZED_LEN);
                body.extend_from_slice(&b[..offs]);
                body.extend_from_slice(meta_buf);
                (Some(meta), body)
            }
            other => bail!("unsupported metadata type {}", other),
        };

        if header.kind.is_handshake() {
            let mut body_buf: &[u8] = &body;
            Ok(Datagram {
                header,
                meta,
                handshake: Some(HandshakeBody::deser(&mut body_buf)),
                payload: vec![],
            })
        }
        else {
            Ok(Datagram {
                header,
                meta,
                handshake: None,
                payload: body,
            })
        }
    }
}
