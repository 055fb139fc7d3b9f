//! Pairing codes.
//!
//! A peer is known on the rendezvous service by a short code that a person can
//! read off one screen and type into another. Codes are case-insensitive at
//! entry and always stored uppercase.

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Length of a freshly generated pairing code.
pub const CODE_LEN: usize = 6;

/// Upper bound accepted from the wire or from user input.
pub const MAX_CODE_LEN: usize = 64;

const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// A validated, uppercase pairing code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerCode(String);

/// The code this endpoint registered under.
pub type LocalIdentity = PeerCode;

/// The code of a peer, as seen from this endpoint.
pub type RemoteIdentity = PeerCode;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("pairing code cannot be empty")]
    Empty,
    #[error("pairing code longer than {MAX_CODE_LEN} characters")]
    TooLong,
    #[error("pairing code contains invalid character {0:?}")]
    InvalidChar(char),
}

impl PeerCode {
    /// Parse user or wire input. Surrounding whitespace is ignored and
    /// lowercase letters are folded to uppercase.
    pub fn parse(input: &str) -> Result<Self, IdentityError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(IdentityError::Empty);
        }
        if trimmed.len() > MAX_CODE_LEN {
            return Err(IdentityError::TooLong);
        }
        if let Some(bad) = trimmed.chars().find(|c| !c.is_ascii_alphanumeric()) {
            return Err(IdentityError::InvalidChar(bad));
        }
        Ok(Self(trimmed.to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PeerCode {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for PeerCode {
    type Error = IdentityError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<PeerCode> for String {
    fn from(code: PeerCode) -> Self {
        code.0
    }
}

impl AsRef<str> for PeerCode {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Hands out pairing codes for local endpoints.
///
/// Codes are not coordinated with anyone; the broker rejects a code that is
/// already registered and the caller may simply ask for another one.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityAllocator;

impl IdentityAllocator {
    pub fn generate(&self) -> LocalIdentity {
        self.generate_with(&mut rand::thread_rng())
    }

    pub fn generate_with<R: Rng + ?Sized>(&self, rng: &mut R) -> LocalIdentity {
        let code: String = (0..CODE_LEN)
            .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
            .collect();
        PeerCode(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn generated_codes_are_six_uppercase_alphanumerics() {
        let allocator = IdentityAllocator;
        for _ in 0..200 {
            let code = allocator.generate();
            assert_eq!(code.as_str().len(), CODE_LEN);
            assert!(
                code.as_str()
                    .chars()
                    .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
            );
        }
    }

    #[test]
    fn seeded_generation_is_deterministic() {
        let allocator = IdentityAllocator;
        let a = allocator.generate_with(&mut StdRng::seed_from_u64(7));
        let b = allocator.generate_with(&mut StdRng::seed_from_u64(7));
        assert_eq!(a, b);
    }

    #[test]
    fn parse_folds_case_and_trims() {
        let code = PeerCode::parse("  7f3k2q ").unwrap();
        assert_eq!(code.as_str(), "7F3K2Q");
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert_eq!(PeerCode::parse("   "), Err(IdentityError::Empty));
        assert_eq!(PeerCode::parse("AB-12"), Err(IdentityError::InvalidChar('-')));
        assert_eq!(
            PeerCode::parse(&"A".repeat(MAX_CODE_LEN + 1)),
            Err(IdentityError::TooLong)
        );
    }

    #[test]
    fn serde_uses_plain_string() {
        let code = PeerCode::parse("abc123").unwrap();
        assert_eq!(serde_json::to_string(&code).unwrap(), "\"ABC123\"");
        let back: PeerCode = serde_json::from_str("\"abc123\"").unwrap();
        assert_eq!(back, code);
        assert!(serde_json::from_str::<PeerCode>("\"a b\"").is_err());
    }
}
