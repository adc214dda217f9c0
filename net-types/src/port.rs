//! UDP port type.

use std::num::NonZero;

/// Transparent wrapper type for UDP ports.
#[repr(transparent)]
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug)]
pub struct UdpPort(NonZero<u16>);

/// Errors which may occur in the creation of a [`UdpPort`].
#[derive(Debug, thiserror::Error, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub enum UdpPortError {
    /// Zero is reserved and not a legal tunnel-endpoint port.
    #[error("port must be non-zero")]
    Zero,
}

impl UdpPort {
    /// The default VXLAN UDP port (RFC 7348 assigns 4789 via IANA).
    pub const VXLAN_DEFAULT: UdpPort = UdpPort(match NonZero::<u16>::new(4789) {
        Some(port) => port,
        None => unreachable!(),
    });
    /// The default GENEVE UDP port.
    pub const GENEVE_DEFAULT: UdpPort = UdpPort(match NonZero::<u16>::new(6081) {
        Some(port) => port,
        None => unreachable!(),
    });

    /// Create a [`UdpPort`] from a [`NonZero<u16>`].
    #[must_use]
    pub const fn new(port: NonZero<u16>) -> UdpPort {
        UdpPort(port)
    }

    /// Create a [`UdpPort`] from a `u16`.
    ///
    /// # Errors
    ///
    /// Returns [`UdpPortError::Zero`] if `port` is zero.
    pub const fn new_checked(port: u16) -> Result<UdpPort, UdpPortError> {
        match NonZero::new(port) {
            None => Err(UdpPortError::Zero),
            Some(port) => Ok(UdpPort(port)),
        }
    }

    /// Get the raw `u16` value.
    #[must_use]
    pub fn as_u16(self) -> u16 {
        self.0.get()
    }
}

impl From<UdpPort> for u16 {
    fn from(port: UdpPort) -> Self {
        port.0.get()
    }
}

impl TryFrom<u16> for UdpPort {
    type Error = UdpPortError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Self::new_checked(value)
    }
}

impl std::fmt::Display for UdpPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_u16())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn zero_is_rejected() {
        assert_eq!(UdpPort::new_checked(0).unwrap_err(), UdpPortError::Zero);
    }

    #[test]
    fn defaults_match_well_known_ports() {
        assert_eq!(UdpPort::VXLAN_DEFAULT.as_u16(), 4789);
        assert_eq!(UdpPort::GENEVE_DEFAULT.as_u16(), 6081);
    }
}
