//! Length field of consolidated subpackets.
//!
//! A datagram carrying several records starts with the main (newest) record, followed by the
//!  older ones, each of them *followed* by its length. The receiver peels subpackets off the
//!  end of the datagram, and whatever remains at the start is the main record - its length is
//!  implicit.
//!
//! ```ascii
//! 0..=250:    [len]
//! 251..=1530: [(len-251) & 0xff] [251 + ((len-251) >> 8)]
//! ```
//!
//! Since the length is read backwards, the high byte comes last: a final byte below 251 is a
//!  complete one-byte length.

use anyhow::bail;
use bytes::BufMut;

/// Largest length with a one-byte encoding
pub const MAX_SHORT_LEN: usize = 250;
/// Largest length that can be encoded at all. Records bigger than this can only travel as
///  the main record of a datagram.
pub const MAX_SUBPACKET_LEN: usize = 1530;

const LONG_BIAS: usize = MAX_SHORT_LEN + 1;

/// number of bytes the length field for `len` occupies
pub fn encoded_len(len: usize) -> usize {
    if len <= MAX_SHORT_LEN {
        1
    }
    else {
        2
    }
}

/// appends the length field for `len`, returning the number of bytes written
pub fn encode_subpacket_len(buf: &mut impl BufMut, len: usize) -> anyhow::Result<usize> {
    if len <= MAX_SHORT_LEN {
        buf.put_u8(len as u8);
        return Ok(1);
    }
    if len > MAX_SUBPACKET_LEN {
        bail!("subpacket length {} exceeds the maximum of {}", len, MAX_SUBPACKET_LEN);
    }

    let biased = len - LONG_BIAS;
    buf.put_u8((biased & 0xff) as u8);
    buf.put_u8((LONG_BIAS + (biased >> 8)) as u8);
    Ok(2)
}

/// Decodes the length field at the *end* of `buf`, returning `(len, number of bytes consumed)`
pub fn decode_subpacket_len(buf: &[u8]) -> anyhow::Result<(usize, usize)> {
    let Some((&last, rest)) = buf.split_last() else {
        bail!("no data for subpacket length");
    };

    let last = last as usize;
    if last <= MAX_SHORT_LEN {
        return Ok((last, 1));
    }

    let Some(&low) = rest.last() else {
        bail!("truncated two-byte subpacket length");
    };
    Ok((((last - LONG_BIAS) << 8) + low as usize + LONG_BIAS, 2))
}
