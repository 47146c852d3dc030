use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;
use crc::{Crc, CRC_32_ISO_HDLC};
use tracing::debug;
use crate::error::{TransportError, TransportResult};

const TAG_HASH: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Parsed form of the endpoint strings passed to `listen` and `connect`:
///
/// ```ascii
/// [ip]:port[:port2][#tag]
/// ```
///
/// The tag, if present, determines the connection identifier so that both peers agree on it
///  without exchanging it out of band.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub ip: Ipv4Addr,
    pub port: u16,
    pub port2: Option<u16>,
    pub tag: Option<String>,
}

impl FromStr for Endpoint {
    type Err = TransportError;

    fn from_str(s: &str) -> TransportResult<Endpoint> {
        let (addr_part, tag) = match s.split_once('#') {
            Some((addr, tag)) if !tag.is_empty() => (addr, Some(tag.to_string())),
            Some((addr, _)) => (addr, None),
            None => (s, None),
        };

        let parts = addr_part.split(':').collect::<Vec<_>>();
        let (ip, port, port2) = match parts.as_slice() {
            [port] => ("", *port, None),
            [ip, port] => (*ip, *port, None),
            [ip, port, port2] => (*ip, *port, Some(*port2)),
            _ => {
                debug!("endpoint {:?} has an unsupported format", s);
                return Err(TransportError::BadAddress);
            }
        };

        let ip = if ip.is_empty() {
            Ipv4Addr::UNSPECIFIED
        }
        else {
            Ipv4Addr::from_str(ip).map_err(|_| TransportError::BadAddress)?
        };

        Ok(Endpoint {
            ip,
            port: parse_port(port)?,
            port2: port2.map(parse_port).transpose()?,
            tag,
        })
    }
}

fn parse_port(s: &str) -> TransportResult<u16> {
    u16::from_str(s.trim()).map_err(|_| TransportError::BadAddress)
}

impl Endpoint {
    /// connection identifier derived from the tag, if there is one
    pub fn conn_ident(&self) -> Option<u32> {
        self.tag.as_ref()
            .map(|tag| TAG_HASH.checksum(tag.as_bytes()))
    }

    fn has_ip(&self) -> bool {
        !self.ip.is_unspecified()
    }

    /// `(local bind port, peer address)` for `connect`. Without an explicit second port, the
    ///  peer listens on `port` and we bind to `port + 1`.
    pub fn for_connect(&self) -> TransportResult<(u16, SocketAddr)> {
        if !self.has_ip() {
            return Err(TransportError::BadAddress);
        }
        let (bind_port, peer_port) = match self.port2 {
            Some(port2) => (self.port, port2),
            None => (self.port.checked_add(1).ok_or(TransportError::BadAddress)?, self.port),
        };
        Ok((bind_port, SocketAddr::V4(SocketAddrV4::new(self.ip, peer_port))))
    }

    /// `(local bind port, poke target)` for `listen`
    pub fn for_listen(&self) -> TransportResult<(u16, Option<SocketAddr>)> {
        if !self.has_ip() {
            return Ok((self.port, None));
        }
        let poke_port = match self.port2 {
            Some(port2) => port2,
            None => self.port.checked_add(1).ok_or(TransportError::BadAddress)?,
        };
        Ok((self.port, Some(SocketAddr::V4(SocketAddrV4::new(self.ip, poke_port)))))
    }
}
