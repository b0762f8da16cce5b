use std::{fmt, net::SocketAddr};

use bytes::Bytes;
use webrtc::rtp;
use webrtc_util::Unmarshal;

use crate::{error::Error, rtp::ssrc::Ssrc};

/// SSRC reported when a datagram does not start with a parseable RTP header.
pub const FALLBACK_SSRC: Ssrc = Ssrc(1);

/// Result of reading the SSRC out of a datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SsrcLookup {
    Parsed(Ssrc),
    /// The header did not parse, [`FALLBACK_SSRC`] stands in.
    Fallback,
}

impl SsrcLookup {
    pub fn ssrc(self) -> Ssrc {
        match self {
            SsrcLookup::Parsed(ssrc) => ssrc,
            SsrcLookup::Fallback => FALLBACK_SSRC,
        }
    }
}

/// One datagram read from a listening socket.
#[derive(Debug, Clone)]
pub struct TransportPacket {
    pub data: Bytes,
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
}

impl TransportPacket {
    pub fn new(data: Bytes, local_addr: SocketAddr, remote_addr: SocketAddr) -> Self {
        Self {
            data,
            local_addr,
            remote_addr,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// SSRC from the RTP header, or [`FALLBACK_SSRC`] when the header does not parse.
    pub fn ssrc(&self) -> Ssrc {
        self.ssrc_lookup().ssrc()
    }

    pub fn ssrc_lookup(&self) -> SsrcLookup {
        let mut buf = self.data.clone();
        match rtp::header::Header::unmarshal(&mut buf) {
            Ok(header) => SsrcLookup::Parsed(Ssrc(header.ssrc)),
            Err(_) => SsrcLookup::Fallback,
        }
    }

    /// Sender SSRC of the first RTCP packet in the compound, bytes 4..8.
    pub fn rtcp_ssrc(&self) -> SsrcLookup {
        match self.data.get(4..8) {
            Some(bytes) => SsrcLookup::Parsed(Ssrc::from_be_slice(bytes)),
            None => SsrcLookup::Fallback,
        }
    }

    pub fn rtp(&self) -> Result<rtp::packet::Packet, Error> {
        let mut buf = self.data.clone();
        let packet = rtp::packet::Packet::unmarshal(&mut buf)?;
        Ok(packet)
    }
}

impl fmt::Display for TransportPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ssrc = match self.ssrc_lookup() {
            SsrcLookup::Parsed(ssrc) => ssrc.full_id().to_string(),
            SsrcLookup::Fallback => "unknown".to_string(),
        };
        write!(
            f,
            "ssrc={}, localAddr={}, remoteAddr={}",
            ssrc, self.local_addr, self.remote_addr
        )
    }
}

#[cfg(test)]
mod tests {
    use webrtc_util::Marshal;

    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    pub(crate) fn rtp_bytes(ssrc: u32, sequence_number: u16) -> Bytes {
        let packet = rtp::packet::Packet {
            header: rtp::header::Header {
                version: 2,
                payload_type: 96,
                sequence_number,
                timestamp: 3000,
                ssrc,
                ..Default::default()
            },
            payload: Bytes::from_static(&[0xde, 0xad]),
        };
        packet.marshal().unwrap()
    }

    #[test]
    fn ssrc_from_rtp_header() {
        let packet = TransportPacket::new(rtp_bytes(0x1234_5678, 1), addr(1), addr(2));
        assert_eq!(packet.ssrc(), Ssrc(0x1234_5678));
        assert_eq!(packet.ssrc_lookup(), SsrcLookup::Parsed(Ssrc(0x1234_5678)));
        assert_eq!(packet.rtp().unwrap().header.sequence_number, 1);
    }

    #[test]
    fn unparseable_header_falls_back() {
        let packet = TransportPacket::new(Bytes::from_static(&[0x80, 0x60]), addr(1), addr(2));
        assert_eq!(packet.ssrc(), FALLBACK_SSRC);
        assert_eq!(packet.ssrc_lookup(), SsrcLookup::Fallback);
        assert!(packet.rtp().is_err());
        assert_eq!(packet.rtcp_ssrc(), SsrcLookup::Fallback);
    }

    #[test]
    fn rtcp_sender_ssrc() {
        let data = Bytes::from_static(&[0x81, 201, 0x00, 0x07, 0x00, 0x00, 0x30, 0x39]);
        let packet = TransportPacket::new(data, addr(1), addr(2));
        assert_eq!(packet.rtcp_ssrc().ssrc(), Ssrc(12345));
    }
}
