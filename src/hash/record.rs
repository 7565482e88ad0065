// Hash record types
// The 128-bit MD5 key used for storage and comparison, plus per-record metadata

use std::fmt;
use std::str::FromStr;

/// Maximum length of a hit comment shown to the user
pub const MAX_COMMENT_SIZE: usize = 500;

/// A 128-bit MD5 digest
///
/// Ordering is unsigned lexicographic over the 16 raw bytes, which is the
/// order entries are stored in a sorted index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Md5Hash([u8; 16]);

impl Md5Hash {
    /// Length of the raw digest in bytes
    pub const LEN: usize = 16;

    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Build from a raw slice, rejecting anything that is not exactly 16 bytes
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let raw: [u8; 16] = bytes.try_into().ok()?;
        Some(Self(raw))
    }

    /// Parse exactly 32 hex characters (either case)
    pub fn from_hex(text: &str) -> Option<Self> {
        if text.len() != 32 {
            return None;
        }
        let mut raw = [0u8; 16];
        hex::decode_to_slice(text, &mut raw).ok()?;
        Some(Self(raw))
    }

    /// Strict check used by the line-based parser: `^[0-9a-f]{32}$`
    pub fn is_canonical_hex(text: &str) -> bool {
        text.len() == 32 && text.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Canonical lowercase hex form
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Md5Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Error returned when a string is not a valid MD5 hex digest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidMd5(pub String);

impl fmt::Display for InvalidMd5 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}' is not a 32 character hex MD5 hash", self.0)
    }
}

impl std::error::Error for InvalidMd5 {}

impl FromStr for Md5Hash {
    type Err = InvalidMd5;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Md5Hash::from_hex(s.trim()).ok_or_else(|| InvalidMd5(s.to_string()))
    }
}

impl serde::Serialize for Md5Hash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

/// One entry read from a hash set source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashRecord {
    pub md5: Md5Hash,
    /// Secondary digest (SHA-1/SHA-256) as found in the source; never indexed
    pub secondary: Option<String>,
    pub comment: Option<String>,
}

impl HashRecord {
    pub fn new(md5: Md5Hash) -> Self {
        Self {
            md5,
            secondary: None,
            comment: None,
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        let comment = comment.into();
        self.comment = if comment.is_empty() { None } else { Some(comment) };
        self
    }

    pub fn with_secondary(mut self, secondary: impl Into<String>) -> Self {
        let secondary = secondary.into();
        self.secondary = if secondary.is_empty() { None } else { Some(secondary) };
        self
    }
}

/// Result of a verbose lookup: the matched hash and its comments
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct HitInfo {
    pub hash: Md5Hash,
    pub comments: Vec<String>,
}

impl HitInfo {
    pub fn new(hash: Md5Hash) -> Self {
        Self {
            hash,
            comments: Vec::new(),
        }
    }

    /// Join comments with single spaces, cutting at the display cap
    ///
    /// Once the joined text passes `max` characters it is cut to `max` and
    /// "..." is appended; remaining comments are dropped.
    pub fn comment_summary(&self, max: usize) -> String {
        let mut summary = String::new();
        for (i, comment) in self.comments.iter().enumerate() {
            if i > 0 {
                summary.push(' ');
            }
            summary.push_str(comment);
            if summary.chars().count() > max {
                summary = summary.chars().take(max).collect();
                summary.push_str("...");
                break;
            }
        }
        summary
    }
}
