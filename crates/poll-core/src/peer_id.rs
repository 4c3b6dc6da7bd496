//! PeerId: identifies one peer context (tab, process) within a namespace.
//!
//! Displays as a 16-character hex string. Used to filter a context's own
//! notifications out of shared media and to tag heartbeat records.

use rand::Rng;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PeerIdError {
    #[error("Invalid peer ID format: expected 16 hex chars")]
    InvalidFormat,
    #[error("Invalid hex: {0}")]
    InvalidHex(#[from] std::num::ParseIntError),
}

/// A unique identifier for a peer context.
///
/// # Examples
/// ```
/// use poll_core::PeerId;
///
/// let peer_id = PeerId::generate();
/// println!("{}", peer_id);  // "a1b2c3d4e5f67890"
///
/// let parsed: PeerId = "a1b2c3d4e5f67890".parse().unwrap();
/// assert_eq!(parsed.as_u64(), 0xa1b2c3d4e5f67890);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(u64);

impl PeerId {
    /// Generate a new random peer ID from OS entropy. Never returns zero.
    pub fn generate() -> Self {
        Self::random(&mut rand::rng())
    }

    /// Generate a peer ID from the given RNG. Never returns zero.
    ///
    /// Seeded RNGs give reproducible IDs in tests.
    pub fn random<R: Rng>(rng: &mut R) -> Self {
        loop {
            let id: u64 = rng.random();
            if id != 0 {
                return Self(id);
            }
        }
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for PeerId {
    type Err = PeerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() == 16 && s.chars().all(|c| c.is_ascii_hexdigit()) {
            let id =
                u64::from_str_radix(&s.to_ascii_lowercase(), 16).map_err(PeerIdError::InvalidHex)?;
            return Ok(Self(id));
        }

        Err(PeerIdError::InvalidFormat)
    }
}

impl From<u64> for PeerId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

// Serialize as hex string for consistency in logs, store records, JSON
impl serde::Serialize for PeerId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for PeerId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_display_zero_padded() {
        let peer_id = PeerId(0xff);
        assert_eq!(peer_id.to_string(), "00000000000000ff");
    }

    #[test]
    fn test_parse_uppercase_hex() {
        let peer_id: PeerId = "A1B2C3D4E5F67890".parse().unwrap();
        assert_eq!(peer_id.as_u64(), 0xa1b2c3d4e5f67890);
    }

    #[test]
    fn test_seeded_rng_is_reproducible() {
        let a = PeerId::random(&mut StdRng::seed_from_u64(7));
        let b = PeerId::random(&mut StdRng::seed_from_u64(7));
        assert_eq!(a, b);
        assert_ne!(a.as_u64(), 0);
    }

    #[test]
    fn test_reject_wrong_length() {
        assert!("a1b2c3d4e5f6789".parse::<PeerId>().is_err()); // 15 chars
        assert!("a1b2c3d4e5f678901".parse::<PeerId>().is_err()); // 17 chars
        assert!("".parse::<PeerId>().is_err());
        assert!("ghijklmnopqrstuv".parse::<PeerId>().is_err()); // non-hex
    }

    #[test]
    fn test_serde_roundtrip() {
        let original = PeerId::generate();
        let json = serde_json::to_string(&original).unwrap();
        assert_eq!(json, format!("\"{}\"", original));
        let parsed: PeerId = serde_json::from_str(&json).unwrap();
        assert_eq!(original, parsed);
    }
}
