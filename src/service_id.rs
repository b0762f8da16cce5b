use std::str::FromStr;

use strum_macros::{Display, EnumString, FromRepr};

use crate::error::{Error, ServiceIdErrorKind};

const CENTER_MASK: u32 = 0xFC00_0000;
const DOMAIN_MASK: u32 = 0x03FC_0000;
const TYPE_MASK: u32 = 0x0003_FC00;
const ID_MASK: u32 = 0x0000_03FF;
const MAX_DOMAIN: u32 = DOMAIN_MASK >> 18;

/// Backend service kinds that can originate media.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, FromRepr)]
#[repr(u32)]
pub enum ServiceType {
    #[strum(serialize = "UNKNOWN")]
    Unknown = 0,
    #[strum(serialize = "mrs")]
    Mrs = 1,
    #[strum(serialize = "mas")]
    Mas = 2,
    #[strum(serialize = "mcs")]
    Mcs = 3,
    #[strum(serialize = "maps")]
    Maps = 4,
    #[strum(serialize = "rtcs")]
    Rtcs = 5,
    #[strum(serialize = "cc")]
    Cc = 6,
    #[strum(serialize = "mvps")]
    Mvps = 7,
    #[strum(serialize = "rcs")]
    Rcs = 12,
    #[strum(serialize = "mlg")]
    Mlg = 13,
}

/// Service instance identifier packed into 32 bits: center(6) domain(8) type(8) id(10).
///
/// It shares its integer space with [`crate::rtp::ssrc::Ssrc`], so the SSRC of a server
/// originated stream can be read back as the service instance that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ServiceId(pub u32);

impl ServiceId {
    /// Builds an id from `<service-name>_<region>_<numeric-id>`, e.g. `mas_13_1`.
    /// The region token of the string is ignored, `region` is stored in the domain bits.
    /// A `region` above 255 or an id above 1023 does not fit and is rejected.
    pub fn new(service_id: &str, region: u32) -> Result<Self, Error> {
        let items: Vec<&str> = service_id.split('_').collect();
        if items.len() < 3 {
            return Err(Error::new_service_id(
                format!("service id {} has fewer than 3 fields", service_id),
                ServiceIdErrorKind::MalformedError,
            ));
        }
        let service_type = ServiceType::from_str(items[0]).map_err(|_| {
            Error::new_service_id(
                format!("unknown service name {}", items[0]),
                ServiceIdErrorKind::UnknownServiceNameError,
            )
        })?;
        let id = items[2].parse::<u32>()?;
        if id > ID_MASK {
            return Err(Error::new_service_id(
                format!("id {} of service id {} exceeds {}", id, service_id, ID_MASK),
                ServiceIdErrorKind::MalformedError,
            ));
        }
        if region > MAX_DOMAIN {
            return Err(Error::new_service_id(
                format!("region {} exceeds {}", region, MAX_DOMAIN),
                ServiceIdErrorKind::MalformedError,
            ));
        }
        let center = 0u32;

        Ok(Self(
            (center << 26) | (region << 18) | ((service_type as u32) << 10) | id,
        ))
    }

    pub fn center(self) -> u32 {
        (self.0 & CENTER_MASK) >> 26
    }

    pub fn domain(self) -> u32 {
        (self.0 & DOMAIN_MASK) >> 18
    }

    pub fn service_type(self) -> u32 {
        (self.0 & TYPE_MASK) >> 10
    }

    pub fn id(self) -> u32 {
        self.0 & ID_MASK
    }

    /// Renders `<service-name>_<region>_<id>`. The region is passed through as given.
    pub fn to_string_with_region(self, region: &str) -> String {
        let name = ServiceType::from_repr(self.service_type())
            .map(|t| t.to_string())
            .unwrap_or_default();
        format!("{}_{}_{}", name, region, self.id())
    }
}

impl From<ServiceId> for u32 {
    fn from(value: ServiceId) -> Self {
        value.0
    }
}
