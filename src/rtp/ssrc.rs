use std::fmt;

use crate::service_id::ServiceId;

const MEDIA_SRC_ID_MASK: u32 = 0xFFFF_FF80;
const MEDIA_SRC_TYPE_MASK: u32 = 0x0000_0040;
const MEDIA_TYPE_MASK: u32 = 0x0000_0030;
const MEDIA_ATTR_MASK: u32 = 0x0000_000F;
const BASE_MASK: u32 = 0xFFFF_FFF0;

/// SSRC carrying routing identity in its bit layout.
///
/// ```text
///  31                              7   6    5  4  3      0
/// +---------------------------------+----+-----+--------+
/// |          media-src-id           |type|media|  attr  |
/// +---------------------------------+----+-----+--------+
/// ```
///
/// `type` is 1 for server originated sources. Every mutator returns a new value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Ssrc(pub u32);

impl Ssrc {
    /// Parses a decimal SSRC. Unparseable input yields zero.
    pub fn parse(decimal: &str) -> Self {
        Self(decimal.trim().parse::<u32>().unwrap_or_default())
    }

    /// Reads a big-endian SSRC. Anything other than exactly 4 bytes yields zero.
    pub fn from_be_slice(buf: &[u8]) -> Self {
        match <[u8; 4]>::try_from(buf) {
            Ok(bytes) => Self(u32::from_be_bytes(bytes)),
            Err(_) => Self(0),
        }
    }

    pub fn full_id(self) -> u32 {
        self.0
    }

    pub fn decimal(self) -> String {
        self.0.to_string()
    }

    /// The same 32 bits viewed as a service identifier.
    pub fn service_id(self) -> ServiceId {
        ServiceId(self.0)
    }

    pub fn base(self) -> u32 {
        self.0 & BASE_MASK
    }

    pub fn base_ssrc(self) -> Ssrc {
        Ssrc(self.base())
    }

    pub fn index(self) -> u32 {
        self.0 >> 7
    }

    pub fn media_src_id(self) -> u32 {
        self.0 & MEDIA_SRC_ID_MASK
    }

    pub fn media_src_type(self) -> u32 {
        self.0 & MEDIA_SRC_TYPE_MASK
    }

    pub fn is_media_src_type_server(self) -> bool {
        self.0 & MEDIA_SRC_TYPE_MASK == MEDIA_SRC_TYPE_MASK
    }

    pub fn is_media_src_type_client(self) -> bool {
        !self.is_media_src_type_server()
    }

    pub fn set_media_src_type_server(self) -> Ssrc {
        Ssrc(self.0 | MEDIA_SRC_TYPE_MASK)
    }

    pub fn set_media_src_type_client(self) -> Ssrc {
        Ssrc(self.0 & !MEDIA_SRC_TYPE_MASK)
    }

    /// Two bit media discriminator, already shifted down to `0..=3`.
    pub fn media_type(self) -> u32 {
        (self.0 & MEDIA_TYPE_MASK) >> 4
    }

    /// Only the low two bits of `media_type` are used.
    pub fn set_media_type(self, media_type: u32) -> Ssrc {
        Ssrc((self.0 & !MEDIA_TYPE_MASK) | ((media_type & 0x03) << 4))
    }

    pub fn media_attr(self) -> u32 {
        self.0 & MEDIA_ATTR_MASK
    }

    pub fn set_media_attr(self, attr: u32) -> Ssrc {
        Ssrc((self.0 & !MEDIA_ATTR_MASK) | (attr & MEDIA_ATTR_MASK))
    }
}

impl From<u32> for Ssrc {
    fn from(value: u32) -> Self {
        Ssrc(value)
    }
}

impl From<Ssrc> for u32 {
    fn from(value: Ssrc) -> Self {
        value.0
    }
}

impl fmt::Display for Ssrc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}(0x{:x} 0x{:x} 0x{:x} 0x{:x})",
            self.full_id(),
            self.media_src_id(),
            self.media_src_type(),
            self.media_type(),
            self.media_attr()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_src_type_round_trip() {
        let ssrc = Ssrc(0).set_media_src_type_server();
        assert!(ssrc.is_media_src_type_server());
        assert!(!ssrc.is_media_src_type_client());
        assert_eq!(ssrc.full_id(), 0x40);

        let ssrc = ssrc.set_media_src_type_client();
        assert!(ssrc.is_media_src_type_client());
        assert_eq!(ssrc.full_id(), 0);
    }

    #[test]
    fn set_media_type_keeps_other_fields() {
        let original = Ssrc(0xABCD_EF4F);
        let ssrc = original.set_media_type(2);
        assert_eq!(ssrc.media_type(), 2);
        assert_eq!(ssrc.media_src_id(), original.media_src_id());
        assert_eq!(ssrc.media_src_type(), original.media_src_type());
        assert_eq!(ssrc.media_attr(), original.media_attr());

        assert_eq!(Ssrc(0).set_media_type(2).media_type(), 2);
        assert_eq!(Ssrc(0).set_media_type(7).media_type(), 3);
    }

    #[test]
    fn field_mutators_are_independent() {
        let samples = [0u32, 1, 0x40, 0x7F, 0x8000_0000, 0xFFFF_FFFF, 0x1234_5678];
        for value in samples {
            let ssrc = Ssrc(value);
            for media_type in 0..4 {
                let changed = ssrc.set_media_type(media_type);
                assert_eq!(changed.media_type(), media_type);
                assert_eq!(changed.media_src_id(), ssrc.media_src_id());
                assert_eq!(changed.is_media_src_type_server(), ssrc.is_media_src_type_server());
                assert_eq!(changed.media_attr(), ssrc.media_attr());
            }
            for attr in 0..16 {
                let changed = ssrc.set_media_attr(attr);
                assert_eq!(changed.media_attr(), attr);
                assert_eq!(changed.base(), ssrc.base());
            }
            let server = ssrc.set_media_src_type_server();
            assert_eq!(server.media_type(), ssrc.media_type());
            assert_eq!(server.media_attr(), ssrc.media_attr());
            assert_eq!(server.media_src_id(), ssrc.media_src_id());
        }
    }

    #[test]
    fn base_clears_attribute_bits() {
        let ssrc = Ssrc(0x1234_567F);
        assert_eq!(ssrc.base(), 0x1234_5670);
        assert_eq!(ssrc.base_ssrc(), Ssrc(0x1234_5670));
        assert_eq!(ssrc.index(), 0x1234_567F >> 7);
    }

    #[test]
    fn from_be_slice() {
        assert_eq!(Ssrc::from_be_slice(&[0x01, 0x02, 0x03, 0x04]), Ssrc(0x0102_0304));
        assert_eq!(Ssrc::from_be_slice(&[0x01, 0x02, 0x03]), Ssrc(0));
        assert_eq!(Ssrc::from_be_slice(&[0x01, 0x02, 0x03, 0x04, 0x05]), Ssrc(0));
    }

    #[test]
    fn parse_and_display() {
        assert_eq!(Ssrc::parse("4294967295"), Ssrc(u32::MAX));
        assert_eq!(Ssrc::parse("nope"), Ssrc(0));
        assert_eq!(Ssrc(0xC5).decimal(), "197");
        assert_eq!(Ssrc(0xC5).to_string(), "197(0x80 0x40 0x0 0x5)");
    }

    #[test]
    fn reinterpret_as_service_id() {
        let ssrc = Ssrc((2 << 10) + 1);
        let service_id = ssrc.service_id();
        assert_eq!(service_id.service_type(), 2);
        assert_eq!(service_id.id(), 1);
        assert_eq!(u32::from(service_id), ssrc.full_id());
    }
}
