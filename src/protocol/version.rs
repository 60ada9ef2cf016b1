//! Worker protocol versioning
//!
//! The worker announces its protocol version as a `major.minor.patch` string in
//! `ready`; the supervisor accepts any worker with the same major version.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Current worker protocol version
pub const PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion::new(1, 0, 0);

/// Protocol version identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ProtocolVersion {
    /// Create a new version
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }

    /// Whether a peer speaking `other` can be driven by this side
    pub fn is_compatible_with(&self, other: &ProtocolVersion) -> bool {
        self.major == other.major
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        PROTOCOL_VERSION
    }
}

impl FromStr for ProtocolVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().splitn(3, '.');
        let mut next = |name: &str| -> Result<u32, String> {
            match parts.next() {
                Some(p) => p
                    .parse()
                    .map_err(|_| format!("invalid {} component in version '{}'", name, s)),
                None => Ok(0),
            }
        };

        let major = next("major")?;
        let minor = next("minor")?;
        let patch = next("patch")?;
        Ok(Self::new(major, minor, patch))
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_display() {
        assert_eq!(ProtocolVersion::new(1, 2, 3).to_string(), "1.2.3");
    }

    #[test]
    fn test_version_parse() {
        assert_eq!("1.2.3".parse::<ProtocolVersion>().unwrap(), ProtocolVersion::new(1, 2, 3));
        assert_eq!("2".parse::<ProtocolVersion>().unwrap(), ProtocolVersion::new(2, 0, 0));
        assert!("one.two".parse::<ProtocolVersion>().is_err());
    }

    #[test]
    fn test_version_compatibility() {
        let v1_0 = ProtocolVersion::new(1, 0, 0);
        let v1_4 = ProtocolVersion::new(1, 4, 0);
        let v2_0 = ProtocolVersion::new(2, 0, 0);

        assert!(v1_0.is_compatible_with(&v1_4));
        assert!(v1_4.is_compatible_with(&v1_0));
        assert!(!v2_0.is_compatible_with(&v1_0));
    }
}
