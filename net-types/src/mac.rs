//! MAC address type and logic.

use std::fmt::Display;

/// A [MAC address] type.
///
/// `Mac` is a transparent wrapper around `[u8; 6]` which provides a small
/// collection of methods and type safety.
///
/// [MAC address]: https://en.wikipedia.org/wiki/MAC_address
#[repr(transparent)]
#[cfg_attr(any(test, feature = "bolero"), derive(bolero::TypeGenerator))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct Mac(pub [u8; 6]);

impl From<[u8; 6]> for Mac {
    fn from(value: [u8; 6]) -> Self {
        Mac(value)
    }
}

impl From<Mac> for [u8; 6] {
    fn from(value: Mac) -> Self {
        value.0
    }
}

impl AsRef<[u8; 6]> for Mac {
    fn as_ref(&self) -> &[u8; 6] {
        &self.0
    }
}

/// Errors which can occur while converting a string to a [`Mac`].
#[derive(Debug, thiserror::Error)]
pub enum MacFromStringError {
    /// Invalid string representation of a MAC address.
    #[error("invalid string representation of mac address: {0}")]
    Invalid(String),
}

impl TryFrom<&str> for Mac {
    type Error = MacFromStringError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let mut octets = [0u8; 6];
        let mut parts = value.split(':');
        for octet in &mut octets {
            let part = parts
                .next()
                .ok_or_else(|| MacFromStringError::Invalid(value.to_string()))?;
            if part.len() != 2 || part.chars().any(|c| !c.is_ascii_hexdigit()) {
                return Err(MacFromStringError::Invalid(value.to_string()));
            }
            *octet = u8::from_str_radix(part, 16)
                .map_err(|_| MacFromStringError::Invalid(value.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(MacFromStringError::Invalid(value.to_string()));
        }
        Ok(Mac(octets))
    }
}

impl Mac {
    /// The broadcast `Mac`.
    pub const BROADCAST: Mac = Mac([u8::MAX; 6]);
    /// The zero `Mac`. Illegal as a source or destination in most contexts.
    pub const ZERO: Mac = Mac([0; 6]);

    /// Returns true iff every bit is one.
    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        self == &Mac::BROADCAST
    }

    /// Returns true iff the multicast bit (LSB of the first octet) is set.
    #[must_use]
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 == 0x01
    }

    /// Returns true iff the address is unicast.
    #[must_use]
    pub fn is_unicast(&self) -> bool {
        !self.is_multicast()
    }

    /// Returns true iff every bit is zero.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self == &Mac::ZERO
    }

    /// Returns `Ok(())` iff legal as a source MAC: neither zero nor multicast.
    ///
    /// # Errors
    ///
    /// Returns [`SourceMacError`] if the address is zero or multicast.
    pub fn valid_src(&self) -> Result<(), SourceMacError> {
        if self.is_zero() {
            Err(SourceMacError::Zero(*self))
        } else if self.is_multicast() {
            Err(SourceMacError::Multicast(*self))
        } else {
            Ok(())
        }
    }

    /// Returns `Ok(())` iff legal as a destination MAC: not zero. Broadcast
    /// and multicast destinations are legal (e.g. the sbridge forwarding
    /// table keys on arbitrary destination MACs including broadcast).
    ///
    /// # Errors
    ///
    /// Returns [`DestMacError`] if the address is zero.
    pub fn valid_dst(&self) -> Result<(), DestMacError> {
        if self.is_zero() {
            Err(DestMacError::Zero(*self))
        } else {
            Ok(())
        }
    }
}

impl Display for Mac {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

/// A [`Mac`] which is legal as a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct SourceMac(Mac);

impl SourceMac {
    /// Map a [`Mac`] to a [`SourceMac`].
    ///
    /// # Errors
    ///
    /// Returns [`SourceMacError`] if the supplied [`Mac`] is not a legal source.
    pub fn new(mac: Mac) -> Result<SourceMac, SourceMacError> {
        mac.valid_src().map(|()| SourceMac(mac))
    }

    /// Map the [`SourceMac`] back to an unqualified [`Mac`].
    #[must_use]
    pub const fn inner(self) -> Mac {
        self.0
    }
}

impl Display for SourceMac {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Errors which can occur validating a source MAC.
#[derive(Debug, thiserror::Error)]
pub enum SourceMacError {
    /// Multicast MACs are illegal as a source.
    #[error("multicast mac {0} is illegal as a source mac")]
    Multicast(Mac),
    /// Zero is illegal as a source.
    #[error("zero mac is illegal as a source mac")]
    Zero(Mac),
}

/// Errors which can occur validating a destination MAC.
#[derive(Debug, thiserror::Error)]
pub enum DestMacError {
    /// Zero is illegal as a destination.
    #[error("zero mac is illegal as a destination mac")]
    Zero(Mac),
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // valid in test code
mod test {
    use super::*;

    #[test]
    fn parses_canonical_string() {
        let mac = Mac::try_from("aa:bb:cc:dd:ee:ff").unwrap();
        assert_eq!(mac.to_string(), "aa:bb:cc:dd:ee:ff");
    }

    #[test]
    fn rejects_wrong_octet_count() {
        assert!(Mac::try_from("00:00:00:00:00").is_err());
        assert!(Mac::try_from("00:00:00:00:00:00:00").is_err());
    }

    #[test]
    fn rejects_non_hex_octet() {
        assert!(Mac::try_from("gg:00:00:00:00:00").is_err());
    }

    #[test]
    fn zero_is_invalid_source_and_dest() {
        assert!(Mac::ZERO.valid_src().is_err());
        assert!(Mac::ZERO.valid_dst().is_err());
    }

    #[test]
    fn multicast_is_invalid_source_but_valid_dest() {
        let mcast = Mac([0x01, 0x00, 0x5e, 0x00, 0x00, 0x01]);
        assert!(mcast.valid_src().is_err());
        assert!(mcast.valid_dst().is_ok());
    }

    #[test]
    fn broadcast_is_valid_destination() {
        assert!(Mac::BROADCAST.valid_dst().is_ok());
    }
}
