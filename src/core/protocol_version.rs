//! Protocol versioning for Betanet v1.2 compliance
//!
//! Implements version negotiation and protocol identification
//! as required by Betanet v1.2 specification.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Betanet protocol version following semantic versioning (MAJOR.MINOR.PATCH).
///
/// Protocol versions determine compatibility between mixnodes in the Betanet network.
/// Nodes with incompatible versions cannot communicate.
///
/// # Compatibility Rules
///
/// - **Major version** must match exactly (breaking changes)
/// - **Minor version** is backward compatible (v1.2 can talk to v1.1, but not vice versa)
/// - **Patch version** is always compatible within the same major.minor
///
/// # Examples
///
/// ```
/// use betanet_mixcore::core::protocol_version::ProtocolVersion;
///
/// let v1_2_0 = ProtocolVersion::V1_2_0;
/// let v1_1_0 = ProtocolVersion::V1_1_0;
///
/// // v1.2.0 is compatible with v1.1.0 (backward compatible)
/// assert!(v1_2_0.is_compatible_with(&v1_1_0));
///
/// // v1.1.0 is NOT compatible with v1.2.0 (can't talk to newer minor)
/// assert!(!v1_1_0.is_compatible_with(&v1_2_0));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProtocolVersion {
    /// Major version number (breaking changes)
    pub major: u8,
    /// Minor version number (backward compatible features)
    pub minor: u8,
    /// Patch version number (bug fixes, no protocol changes)
    pub patch: u8,
}

impl ProtocolVersion {
    /// Betanet v1.2.0 (current target)
    pub const V1_2_0: Self = Self {
        major: 1,
        minor: 2,
        patch: 0,
    };

    /// Betanet v1.1.0 (previous version for backward compatibility testing)
    pub const V1_1_0: Self = Self {
        major: 1,
        minor: 1,
        patch: 0,
    };

    /// Create new protocol version
    pub const fn new(major: u8, minor: u8, patch: u8) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Check if this version is compatible with another version.
    ///
    /// Compatibility is asymmetric: newer minor versions can communicate with older ones,
    /// but not vice versa. This ensures backward compatibility while allowing protocol evolution.
    ///
    /// # Arguments
    ///
    /// * `other` - The protocol version to check compatibility against
    ///
    /// # Returns
    ///
    /// `true` if this version can communicate with `other`, `false` otherwise
    ///
    /// # Examples
    ///
    /// ```
    /// use betanet_mixcore::core::protocol_version::ProtocolVersion;
    ///
    /// let v1_2 = ProtocolVersion::new(1, 2, 0);
    /// let v1_1 = ProtocolVersion::new(1, 1, 0);
    /// let v2_0 = ProtocolVersion::new(2, 0, 0);
    ///
    /// assert!(v1_2.is_compatible_with(&v1_1)); // backward compatible
    /// assert!(!v1_1.is_compatible_with(&v1_2)); // can't talk to newer
    /// assert!(!v1_2.is_compatible_with(&v2_0)); // different major version
    /// ```
    pub fn is_compatible_with(&self, other: &Self) -> bool {
        // Major version must match
        if self.major != other.major {
            return false;
        }

        // Minor version compatibility: higher can talk to lower
        // (backward compatible within same major version)
        self.minor >= other.minor
    }

    /// Encode version as a single byte for efficient wire transmission.
    ///
    /// Format: `0x1M` where M is the minor version (for major version 1).
    /// Returns `0xFF` for unknown/unsupported versions.
    ///
    /// # Returns
    ///
    /// Single byte encoding of the protocol version
    ///
    /// # Examples
    ///
    /// ```
    /// use betanet_mixcore::core::protocol_version::ProtocolVersion;
    ///
    /// let v1_2_0 = ProtocolVersion::new(1, 2, 0);
    /// assert_eq!(v1_2_0.encode_byte(), 0x12); // 0x10 | 0x02
    /// ```
    pub const fn encode_byte(&self) -> u8 {
        if self.major == 1 {
            0x10 | (self.minor & 0x0F)
        } else {
            0xFF // Unknown version
        }
    }

    /// Decode protocol version from a single byte.
    ///
    /// # Arguments
    ///
    /// * `byte` - Encoded version byte (format: `0x1M` for v1.M.0)
    ///
    /// # Returns
    ///
    /// `Some(ProtocolVersion)` if the byte represents a valid version, `None` otherwise
    ///
    /// # Examples
    ///
    /// ```
    /// use betanet_mixcore::core::protocol_version::ProtocolVersion;
    ///
    /// let version = ProtocolVersion::decode_byte(0x12);
    /// assert_eq!(version, Some(ProtocolVersion::new(1, 2, 0)));
    ///
    /// assert_eq!(ProtocolVersion::decode_byte(0xFF), None); // invalid
    /// ```
    pub fn decode_byte(byte: u8) -> Option<Self> {
        if byte & 0xF0 == 0x10 {
            let minor = byte & 0x0F;
            Some(Self::new(1, minor, 0))
        } else {
            None
        }
    }

    /// Convert to protocol ID string for multiaddr compatibility.
    ///
    /// Format: `/betanet/mix/{major}.{minor}.{patch}`
    ///
    /// # Returns
    ///
    /// Protocol ID string suitable for libp2p multiaddr
    ///
    /// # Examples
    ///
    /// ```
    /// use betanet_mixcore::core::protocol_version::ProtocolVersion;
    ///
    /// let v1_2_0 = ProtocolVersion::V1_2_0;
    /// assert_eq!(v1_2_0.to_protocol_id(), "/betanet/mix/1.2.0");
    /// ```
    pub fn to_protocol_id(&self) -> String {
        format!("/betanet/mix/{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::V1_2_0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_encoding() {
        let v1_2 = ProtocolVersion::V1_2_0;
        assert_eq!(v1_2.encode_byte(), 0x12);

        let decoded = ProtocolVersion::decode_byte(0x12);
        assert_eq!(decoded, Some(ProtocolVersion::new(1, 2, 0)));
    }

    #[test]
    fn test_version_compatibility() {
        let v1_2 = ProtocolVersion::V1_2_0;
        let v1_1 = ProtocolVersion::V1_1_0;

        // v1.2 can talk to v1.1 (backward compatible)
        assert!(v1_2.is_compatible_with(&v1_1));

        // v1.1 cannot talk to v1.2 (missing features)
        assert!(!v1_1.is_compatible_with(&v1_2));
    }

    #[test]
    fn test_protocol_id() {
        let v1_2 = ProtocolVersion::V1_2_0;
        assert_eq!(v1_2.to_protocol_id(), "/betanet/mix/1.2.0");
    }

}
