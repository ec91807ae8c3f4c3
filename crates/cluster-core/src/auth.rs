//! Passphrase authentication for join intents.
//!
//! Each request body is signed with HMAC-SHA256. The key is derived from the
//! session passphrase with Argon2id and a fresh random salt per request, so
//! the passphrase never leaves the machine and offline guessing is slow.
//!
//! The `Authorization` header has the form:
//!
//! ```text
//! Cluster-1.0 <hex salt>:<hex mac>
//! ```
//!
//! Verification never says why it failed. A wrong passphrase and a mangled
//! header both produce [`AuthError::InvalidHmac`].

use argon2::{Algorithm, Argon2, Params, Version};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

/// Version tag of the current header format.
pub const HMAC_VERSION: &str = "Cluster-1.0";

/// Argon2id memory cost in KiB (64 MB)
pub const ARGON2_MEMORY_KB: u32 = 65536;

/// Argon2id iteration count
pub const ARGON2_ITERATIONS: u32 = 1;

/// Argon2id parallelism
pub const ARGON2_PARALLELISM: u32 = 4;

pub const SALT_LEN: usize = 16;
pub const KEY_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// Generic verification failure. Deliberately carries no detail.
    #[error("Invalid HMAC")]
    InvalidHmac,

    #[error("Failed to derive key: {0}")]
    KeyDerivation(String),
}

/// Fixed parameters of the HMAC scheme.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HmacConf {
    pub version: String,
    pub memory_kb: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for HmacConf {
    fn default() -> Self {
        Self {
            version: HMAC_VERSION.to_string(),
            memory_kb: ARGON2_MEMORY_KB,
            iterations: ARGON2_ITERATIONS,
            parallelism: ARGON2_PARALLELISM,
        }
    }
}

impl HmacConf {
    /// Override the Argon2 cost parameters. Both sides must agree on them.
    pub fn with_params(mut self, memory_kb: u32, iterations: u32, parallelism: u32) -> Self {
        self.memory_kb = memory_kb;
        self.iterations = iterations;
        self.parallelism = parallelism;
        self
    }

    fn kdf(&self) -> Result<Argon2<'static>, AuthError> {
        let params = Params::new(
            self.memory_kb,
            self.iterations,
            self.parallelism,
            Some(KEY_LEN),
        )
        .map_err(|e| AuthError::KeyDerivation(e.to_string()))?;

        Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
    }
}

/// Signs and verifies request bodies with a shared passphrase.
#[derive(Clone)]
pub struct Authenticator {
    passphrase: String,
    conf: HmacConf,
}

impl Authenticator {
    pub fn new(passphrase: impl Into<String>, conf: HmacConf) -> Self {
        Self {
            passphrase: passphrase.into(),
            conf,
        }
    }

    fn derive_key(&self, salt: &[u8]) -> Result<[u8; KEY_LEN], AuthError> {
        let mut key = [0u8; KEY_LEN];
        self.conf
            .kdf()?
            .hash_password_into(self.passphrase.as_bytes(), salt, &mut key)
            .map_err(|e| AuthError::KeyDerivation(e.to_string()))?;
        Ok(key)
    }

    fn mac(&self, salt: &[u8], body: &[u8]) -> Result<HmacSha256, AuthError> {
        let key = self.derive_key(salt)?;
        let mut mac = HmacSha256::new_from_slice(&key)
            .map_err(|e| AuthError::KeyDerivation(e.to_string()))?;
        mac.update(body);
        Ok(mac)
    }

    /// Build the `Authorization` header value for `body`.
    pub fn sign(&self, body: &[u8]) -> Result<String, AuthError> {
        let salt: [u8; SALT_LEN] = rand::random();
        let mac = self.mac(&salt, body)?.finalize().into_bytes();

        Ok(format!(
            "{} {}:{}",
            self.conf.version,
            hex::encode(salt),
            hex::encode(mac)
        ))
    }

    /// Check an `Authorization` header against `body`.
    pub fn verify(&self, header: Option<&str>, body: &[u8]) -> Result<(), AuthError> {
        let result = self.verify_inner(header, body);
        if let Err(reason) = &result {
            debug!(reason, "HMAC verification failed");
        }

        result.map_err(|_| AuthError::InvalidHmac)
    }

    fn verify_inner(&self, header: Option<&str>, body: &[u8]) -> Result<(), &'static str> {
        let header = header.ok_or("missing header")?;
        let (version, value) = header.split_once(' ').ok_or("malformed header")?;
        if version != self.conf.version {
            return Err("unsupported version");
        }

        let (salt, mac) = value.split_once(':').ok_or("malformed header")?;
        let salt = hex::decode(salt).map_err(|_| "salt is not hex")?;
        let mac = hex::decode(mac).map_err(|_| "mac is not hex")?;
        if salt.is_empty() {
            return Err("empty salt");
        }

        self.mac(&salt, body)
            .map_err(|_| "key derivation failed")?
            .verify_slice(&mac)
            .map_err(|_| "mac mismatch")
    }
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("conf", &self.conf)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) fn test_conf() -> HmacConf {
    HmacConf::default().with_params(64, 1, 1)
}
