//! Secret handling for the two credentials the platform stores at rest:
//! account passwords and app tokens. Both are hashed with argon2id; a raw
//! app token leaves this module exactly once, at mint time.

use argon2::{
    Algorithm, Argon2, Params, Version,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use rand::Rng;

use crate::error::{Error, Result};

const TOKEN_PREFIX: &str = "warden";
const LOOKUP_LEN: usize = 8;
const SECRET_LEN: usize = 24;

/// A freshly minted app token. `raw` goes to the caller once; only
/// `lookup` and `hash` are persisted.
#[derive(Debug)]
pub struct MintedToken {
    pub raw: String,
    pub lookup: String,
    pub hash: String,
}

pub struct SecretHasher {
    argon2: Argon2<'static>,
}

impl Default for SecretHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl SecretHasher {
    /// 64 MiB, one pass, four lanes: interactive-login cost.
    #[must_use]
    pub fn new() -> Self {
        let params = Params::new(64 * 1024, 1, 4, Some(32)).expect("invalid argon2 params");
        Self {
            argon2: Argon2::new(Algorithm::Argon2id, Version::V0x13, params),
        }
    }

    /// Mints an app token of the form `warden_<lookup>_<secret>`. The
    /// lookup half indexes the app row; the stored hash covers the whole
    /// raw token, so a leaked lookup alone authenticates nothing.
    pub fn mint_token(&self) -> Result<MintedToken> {
        let lookup = random_alphanumeric(LOOKUP_LEN);
        let secret = random_alphanumeric(SECRET_LEN);
        let raw = format!("{TOKEN_PREFIX}_{lookup}_{secret}");
        let hash = self.hash(&raw)?;
        Ok(MintedToken { raw, lookup, hash })
    }

    pub fn hash(&self, secret: &str) -> Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        self.argon2
            .hash_password(secret.as_bytes(), &salt)
            .map(|h| h.to_string())
            .map_err(|e| Error::Internal(format!("hashing failed: {e}")))
    }

    /// `Ok(false)` is a wrong secret; `Err` means the stored hash itself
    /// is unusable.
    pub fn verify(&self, secret: &str, hash: &str) -> Result<bool> {
        let parsed = PasswordHash::new(hash)
            .map_err(|e| Error::Internal(format!("stored hash is malformed: {e}")))?;
        match self.argon2.verify_password(secret.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(argon2::password_hash::Error::Password) => Ok(false),
            Err(e) => Err(Error::Internal(format!("verification failed: {e}"))),
        }
    }
}

/// Splits a presented token into its lookup and secret halves. Anything
/// not matching the minted shape is rejected outright.
pub fn parse_token(token: &str) -> Result<(String, String)> {
    let mut parts = token.split('_');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(TOKEN_PREFIX), Some(lookup), Some(secret), None)
            if lookup.len() == LOOKUP_LEN && secret.len() == SECRET_LEN =>
        {
            Ok((lookup.to_string(), secret.to_string()))
        }
        _ => Err(Error::Unauthorized),
    }
}

/// Uniform random characters from `[a-zA-Z0-9]`. Used for token halves
/// and for generated passwords.
pub fn random_alphanumeric(len: usize) -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minted_token_parses_back() {
        let hasher = SecretHasher::new();
        let minted = hasher.mint_token().unwrap();

        let (lookup, secret) = parse_token(&minted.raw).unwrap();
        assert_eq!(lookup, minted.lookup);
        assert_eq!(minted.raw, format!("warden_{lookup}_{secret}"));
    }

    #[test]
    fn test_minted_token_verifies_against_its_hash() {
        let hasher = SecretHasher::new();
        let minted = hasher.mint_token().unwrap();

        assert!(minted.hash.starts_with("$argon2id$"));
        assert!(hasher.verify(&minted.raw, &minted.hash).unwrap());
    }

    #[test]
    fn test_tampered_token_fails_verification() {
        let hasher = SecretHasher::new();
        let minted = hasher.mint_token().unwrap();

        let mut tampered = minted.raw.clone();
        tampered.pop();
        tampered.push('!');
        assert!(!hasher.verify(&tampered, &minted.hash).unwrap());
    }

    #[test]
    fn test_password_roundtrip() {
        let hasher = SecretHasher::new();
        let hash = hasher.hash("correct horse").unwrap();

        assert!(hasher.verify("correct horse", &hash).unwrap());
        assert!(!hasher.verify("wrong horse", &hash).unwrap());
    }

    #[test]
    fn test_parse_rejects_malformed_tokens() {
        for bad in [
            "",
            "warden",
            "warden_short_123456789012345678901234",
            "other_12345678_123456789012345678901234",
            "warden_12345678_tooshort",
            "warden_12345678_123456789012345678901234_extra",
        ] {
            assert!(parse_token(bad).is_err(), "accepted {bad:?}");
        }
    }
}
