//! User identity: fixed 20-byte ids, normalization, broadcast sentinel.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Width of a user id on the wire.
pub const USER_ID_LEN: usize = 20;

/// A normalized LCP user id: exactly 20 bytes, NUL-padded on the right.
/// Equality and hashing are byte-equality on the padded form.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId([u8; USER_ID_LEN]);

impl UserId {
    /// The broadcast sentinel: 20 bytes of `0xFF`.
    pub const BROADCAST: UserId = UserId([0xFF; USER_ID_LEN]);

    /// Normalize arbitrary bytes into a user id: strip trailing NULs,
    /// truncate to 20 bytes, pad with NULs.
    pub fn normalize(bytes: &[u8]) -> Self {
        let trimmed = strip_trailing_nul(bytes);
        let mut id = [0u8; USER_ID_LEN];
        let n = trimmed.len().min(USER_ID_LEN);
        id[..n].copy_from_slice(&trimmed[..n]);
        UserId(id)
    }

    /// Exact 20-byte constructor for bytes already read off the wire.
    pub fn from_wire(bytes: [u8; USER_ID_LEN]) -> Self {
        UserId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; USER_ID_LEN] {
        &self.0
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// The id without its NUL padding.
    pub fn raw(&self) -> &[u8] {
        strip_trailing_nul(&self.0)
    }

    /// Persisted/display form: UTF-8 decoding of the non-null prefix.
    pub fn display_name(&self) -> String {
        String::from_utf8_lossy(self.raw()).into_owned()
    }
}

fn strip_trailing_nul(bytes: &[u8]) -> &[u8] {
    let end = bytes
        .iter()
        .rposition(|&b| b != 0)
        .map(|i| i + 1)
        .unwrap_or(0);
    &bytes[..end]
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        UserId::normalize(s.as_bytes())
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_broadcast() {
            return f.write_str("*broadcast*");
        }
        f.write_str(&self.display_name())
    }
}

impl fmt::Debug for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserId({})", self)
    }
}

// Stored as the UTF-8 decoding of the non-null prefix, re-normalized on load.
impl Serialize for UserId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.display_name().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for UserId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        Ok(UserId::normalize(s.as_bytes()))
    }
}
