//! Launch Tokens
//!
//! Every module process is launched with a fresh token in its environment
//! and must present it in `register`. Tokens are 32 random bytes, carried as
//! lowercase hex, compared in constant time, and never printed.

use std::fmt;

use rand::RngCore;

/// Size of a launch token in bytes
pub const TOKEN_SIZE: usize = 32;

/// Secret handed to one module process at launch
#[derive(Clone)]
pub struct AuthToken {
    bytes: [u8; TOKEN_SIZE],
}

impl AuthToken {
    /// Generate a new random token
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; TOKEN_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Parse a hex-encoded token; `None` if it is not exactly [`TOKEN_SIZE`] bytes
    #[must_use]
    pub fn from_hex(encoded: &str) -> Option<Self> {
        let decoded = hex::decode(encoded.trim()).ok()?;
        let bytes: [u8; TOKEN_SIZE] = decoded.try_into().ok()?;
        Some(Self { bytes })
    }

    /// Hex encoding, as placed in the module environment
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }

    /// Check a token presented by a module
    #[must_use]
    pub fn validate(&self, provided: &str) -> bool {
        match Self::from_hex(provided) {
            Some(other) => constant_time_compare(&self.bytes, &other.bytes),
            None => false,
        }
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuthToken([REDACTED])")
    }
}

impl PartialEq for AuthToken {
    fn eq(&self, other: &Self) -> bool {
        constant_time_compare(&self.bytes, &other.bytes)
    }
}

impl Eq for AuthToken {}

fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_tokens_differ() {
        assert_ne!(AuthToken::generate(), AuthToken::generate());
    }

    #[test]
    fn test_validate_round_trip() {
        let token = AuthToken::generate();
        let hex = token.to_hex();
        assert_eq!(hex.len(), TOKEN_SIZE * 2);
        assert!(token.validate(&hex));
        assert!(token.validate(&format!("  {hex}\n")));
    }

    #[test]
    fn test_validate_rejects_wrong_or_garbage() {
        let token = AuthToken::generate();
        assert!(!token.validate(&AuthToken::generate().to_hex()));
        assert!(!token.validate("not-hex"));
        assert!(!token.validate(""));
        assert!(!token.validate(&token.to_hex()[..10]));
    }

    #[test]
    fn test_debug_is_redacted() {
        let token = AuthToken::generate();
        let shown = format!("{token:?}");
        assert_eq!(shown, "AuthToken([REDACTED])");
        assert!(!shown.contains(&token.to_hex()));
    }
}
