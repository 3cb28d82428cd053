//! # STUN Rendezvous Format
//!
//! The rendezvous server pairs a server that announced its public port
//! with a client asking for that server by public address.
//!
//! ```text
//! request: kind u32 | entry
//! entry:   ip [4] (network order) | public_port u16 | private_port u16
//! ```
//!
//! The server answers an `AskInfo` with the entry it holds for the
//! requested address, or an entry with `private_port == 0` when it knows
//! no such peer. When pairing, it also sends the server an entry
//! describing the client.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Result, TransportError};

pub const STUN_ENTRY_SIZE: usize = 8;
pub const STUN_REQUEST_SIZE: usize = 4 + STUN_ENTRY_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum StunRequestKind {
    /// Server announces the public port it listens on.
    PostInfo = 0,
    /// Client asks for the server at `ip:public_port`.
    AskInfo = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StunEntry {
    pub ip: Ipv4Addr,
    pub public_port: u16,
    pub private_port: u16,
}

impl StunEntry {
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.ip.octets());
        buf.put_u16(self.public_port);
        buf.put_u16(self.private_port);
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < STUN_ENTRY_SIZE {
            return None;
        }
        let ip = Ipv4Addr::from(buf.get_u32());
        Some(StunEntry {
            ip,
            public_port: buf.get_u16(),
            private_port: buf.get_u16(),
        })
    }

    /// Where the peer behind this entry can actually be reached.
    pub fn private_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.private_port))
    }

    /// Parse an entry datagram, requiring the exact entry size.
    pub fn from_datagram(data: &[u8]) -> Result<Self> {
        if data.len() != STUN_ENTRY_SIZE {
            return Err(TransportError::Malformed("STUN entry"));
        }
        Self::decode(&mut &data[..]).ok_or(TransportError::Malformed("STUN entry"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StunRequest {
    pub kind: StunRequestKind,
    pub entry: StunEntry,
}

impl StunRequest {
    pub fn post_info(public_port: u16) -> Self {
        StunRequest {
            kind: StunRequestKind::PostInfo,
            entry: StunEntry {
                ip: Ipv4Addr::UNSPECIFIED,
                public_port,
                private_port: 0,
            },
        }
    }

    pub fn ask_info(ip: Ipv4Addr, public_port: u16) -> Self {
        StunRequest {
            kind: StunRequestKind::AskInfo,
            entry: StunEntry {
                ip,
                public_port,
                private_port: 0,
            },
        }
    }

    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(STUN_REQUEST_SIZE);
        buf.put_u32(self.kind as u32);
        self.entry.encode(&mut buf);
        buf
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() != STUN_REQUEST_SIZE {
            return None;
        }
        let kind = match buf.get_u32() {
            0 => StunRequestKind::PostInfo,
            1 => StunRequestKind::AskInfo,
            _ => return None,
        };
        Some(StunRequest {
            kind,
            entry: StunEntry::decode(buf)?,
        })
    }

    /// Check an `AskInfo` response: it must echo the requested ip and
    /// public port, and name a non-zero private port.
    pub fn validate_response(&self, response: &StunEntry) -> Result<()> {
        if response.ip != self.entry.ip || response.public_port != self.entry.public_port {
            return Err(TransportError::StunMismatch);
        }
        if response.private_port == 0 {
            return Err(TransportError::NoSuchPeer);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_layout() {
        let req = StunRequest::ask_info(Ipv4Addr::new(10, 0, 0, 7), 32262);
        let bytes = req.to_bytes();
        assert_eq!(bytes.len(), STUN_REQUEST_SIZE);
        assert_eq!(&bytes[..4], &1u32.to_be_bytes());
        assert_eq!(&bytes[4..8], &[10, 0, 0, 7]);
        assert_eq!(&bytes[8..10], &32262u16.to_be_bytes());
        assert_eq!(&bytes[10..12], &[0, 0]);
        assert_eq!(StunRequest::decode(&mut bytes.freeze()), Some(req));
    }

    #[test]
    fn entry_from_datagram_requires_exact_size() {
        let entry = StunEntry {
            ip: Ipv4Addr::LOCALHOST,
            public_port: 1,
            private_port: 2,
        };
        let mut buf = BytesMut::new();
        entry.encode(&mut buf);
        assert_eq!(StunEntry::from_datagram(&buf).unwrap(), entry);
        assert_eq!(entry.private_addr(), "127.0.0.1:2".parse().unwrap());
        assert!(StunEntry::from_datagram(&buf[..7]).is_err());
    }

    #[test]
    fn response_validation() {
        let req = StunRequest::ask_info(Ipv4Addr::new(1, 2, 3, 4), 5000);
        let mut good = req.entry;
        good.private_port = 41000;
        assert!(req.validate_response(&good).is_ok());

        let mut wrong_ip = good;
        wrong_ip.ip = Ipv4Addr::new(1, 2, 3, 5);
        assert!(matches!(req.validate_response(&wrong_ip), Err(TransportError::StunMismatch)));

        let mut wrong_port = good;
        wrong_port.public_port = 5001;
        assert!(matches!(req.validate_response(&wrong_port), Err(TransportError::StunMismatch)));

        assert!(matches!(req.validate_response(&req.entry), Err(TransportError::NoSuchPeer)));
    }

    #[test]
    fn unknown_kind_rejected() {
        let mut bytes = StunRequest::post_info(80).to_bytes();
        bytes[3] = 9;
        assert!(StunRequest::decode(&mut bytes.freeze()).is_none());
    }
}
