use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde_with::{DeserializeFromStr, SerializeDisplay};
use strum_macros::{Display as StrumDisplay, EnumString, FromRepr};
use thiserror::Error;

/// Errors raised while parsing device addresses from text.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddrError {
    /// The textual form did not contain exactly twelve hexadecimal digits.
    #[error("expected 12 hexadecimal digits, got {got}")]
    InvalidDigitCount { got: usize },
    #[error("invalid hexadecimal byte `{value}`")]
    InvalidHexByte { value: String },
    #[error("unrecognised address type `{value}`")]
    UnknownAddrType { value: String },
}

/// Public versus random device address, as tagged on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, StrumDisplay, EnumString, FromRepr)]
#[strum(serialize_all = "lowercase")]
#[repr(u8)]
pub enum AddrType {
    #[default]
    Public = 0x00,
    Random = 0x01,
}

impl AddrType {
    /// Decodes the one-byte wire tag, treating unknown values as an error
    /// at the caller's decode boundary.
    #[must_use]
    pub fn from_wire(tag: u8) -> Option<Self> {
        Self::from_repr(tag)
    }
}

/// A six-byte Bluetooth device address.
///
/// Prints most-significant byte first without separators (`DEADBEEFDEAD`),
/// the format tester parameters use. The wire carries the same bytes in
/// reversed order; [`DeviceAddr::wire_bytes`] and [`DeviceAddr::from_wire`]
/// perform the flip.
///
/// ```
/// use certbridge::DeviceAddr;
///
/// let addr: DeviceAddr = "DE:AD:BE:EF:DE:AD".parse()?;
/// assert_eq!("DEADBEEFDEAD", addr.to_string());
/// assert_eq!([0xAD, 0xDE, 0xEF, 0xBE, 0xAD, 0xDE], addr.wire_bytes());
/// # Ok::<(), certbridge::AddrError>(())
/// ```
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, SerializeDisplay, DeserializeFromStr,
)]
pub struct DeviceAddr([u8; 6]);

impl DeviceAddr {
    /// Wraps printable-order octets (most-significant first).
    #[must_use]
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// Octets in printable order.
    #[must_use]
    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Octets in wire order (least-significant first).
    #[must_use]
    pub fn wire_bytes(&self) -> [u8; 6] {
        let mut bytes = self.0;
        bytes.reverse();
        bytes
    }

    /// Reassembles an address from wire-order octets.
    #[must_use]
    pub fn from_wire(bytes: [u8; 6]) -> Self {
        let mut octets = bytes;
        octets.reverse();
        Self(octets)
    }
}

impl Display for DeviceAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for octet in self.0 {
            write!(f, "{octet:02X}")?;
        }
        Ok(())
    }
}

impl FromStr for DeviceAddr {
    type Err = AddrError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let digits: Vec<char> = value.chars().filter(|c| *c != ':').collect();
        if digits.len() != 12 {
            return Err(AddrError::InvalidDigitCount { got: digits.len() });
        }
        let mut octets = [0u8; 6];
        for (index, octet) in octets.iter_mut().enumerate() {
            let pair: String = digits[index * 2..index * 2 + 2].iter().collect();
            *octet = u8::from_str_radix(&pair, 16)
                .map_err(|_| AddrError::InvalidHexByte { value: pair })?;
        }
        Ok(Self(octets))
    }
}

/// An address together with its type tag, the unit most commands address
/// peers by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PeerAddr {
    pub addr_type: AddrType,
    pub addr: DeviceAddr,
}

impl PeerAddr {
    #[must_use]
    pub const fn new(addr_type: AddrType, addr: DeviceAddr) -> Self {
        Self { addr_type, addr }
    }
}

impl Display for PeerAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.addr, self.addr_type)
    }
}

impl FromStr for PeerAddr {
    type Err = AddrError;

    /// Parses the fixture form `public|DEADBEEFDEAD`.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.split_once('|') {
            Some((kind, addr)) => Ok(Self {
                addr_type: kind.parse().map_err(|_| AddrError::UnknownAddrType {
                    value: kind.to_string(),
                })?,
                addr: addr.parse()?,
            }),
            None => Ok(Self {
                addr_type: AddrType::Public,
                addr: value.parse()?,
            }),
        }
    }
}
