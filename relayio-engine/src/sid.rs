use std::{
    fmt::{Debug, Display, Formatter},
    str::FromStr,
};

use base64::Engine;
use rand::Rng;

/// A session id: 12 random bytes rendered as a 16 char URL-safe base64 string.
///
/// Ids are generated once at handshake and never reused; a closed session's
/// entry is removed from the engine, never resurrected.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Sid([u8; 16]);

impl Sid {
    /// Generates a new random session id.
    pub fn new() -> Self {
        let mut raw = [0u8; 12];
        rand::thread_rng().fill(&mut raw);

        let mut encoded = [0u8; 16];
        base64::prelude::BASE64_URL_SAFE_NO_PAD
            .encode_slice(raw, &mut encoded)
            .expect("12 bytes always encode to 16 base64 chars");
        Sid(encoded)
    }

    fn as_str(&self) -> &str {
        // SAFETY: the inner array only ever holds base64 chars
        unsafe { std::str::from_utf8_unchecked(&self.0) }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SidParseError {
    #[error("invalid sid length")]
    InvalidLength,
    #[error("invalid url-safe base64 character")]
    InvalidCharacter,
}

impl FromStr for Sid {
    type Err = SidParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        if bytes.len() != 16 {
            return Err(SidParseError::InvalidLength);
        }
        let mut id = [0u8; 16];
        for (slot, byte) in id.iter_mut().zip(bytes) {
            match byte {
                b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' => *slot = *byte,
                _ => return Err(SidParseError::InvalidCharacter),
            }
        }
        Ok(Sid(id))
    }
}

impl Default for Sid {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for Sid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
impl Debug for Sid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl serde::Serialize for Sid {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

struct SidVisitor;
impl serde::de::Visitor<'_> for SidVisitor {
    type Value = Sid;

    fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
        formatter.write_str("a 16 char url-safe base64 session id")
    }

    fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Self::Value, E> {
        Sid::from_str(v).map_err(serde::de::Error::custom)
    }
}
impl<'de> serde::Deserialize<'de> for Sid {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_str(SidVisitor)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::Sid;

    #[test]
    fn sid_roundtrips_through_str() {
        let sid = Sid::new();
        let parsed = Sid::from_str(&sid.to_string()).unwrap();
        assert_eq!(sid, parsed);
    }

    #[test]
    fn sid_rejects_malformed_input() {
        assert!(Sid::from_str("too-short").is_err());
        assert!(Sid::from_str("abcdefghijklmno#").is_err());
        assert!(Sid::from_str("abcdefghijklmnop").is_ok());
    }

    #[test]
    fn sids_are_unique() {
        let a = Sid::new();
        let b = Sid::new();
        assert_ne!(a, b);
    }
}
