//! Single-account encrypted keystore.
//!
//! The ed25519 secret is sealed with AES-256-GCM under a key stretched from
//! the password with PBKDF2-HMAC-SHA256. Salt, nonce and work factor are
//! stored next to the ciphertext, so a keystore decrypts on any machine.
//! Stored as JSON.

use std::path::Path;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use ed25519_dalek::SigningKey;
use giving_types::Address;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::AuthError;

const VERSION: u32 = 2;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

/// PBKDF2 iterations for new keystores.
pub const DEFAULT_KDF_ROUNDS: u32 = 600_000;

#[cfg(test)]
pub(crate) const FAST_KDF_ROUNDS: u32 = 1_000;

/// Key derivation parameters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KdfParams {
    pub rounds: u32,
    salt: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Keystore {
    pub version: u32,
    pub address: Address,
    /// Hex-encoded ed25519 public key
    pub public_key: String,
    pub kdf: KdfParams,
    nonce: String,
    /// Sealed secret followed by the GCM tag
    ciphertext: String,
}

impl Keystore {
    /// Create a keystore for a fresh random key.
    pub fn create(password: &str) -> Result<Self, AuthError> {
        Self::create_with_rounds(password, DEFAULT_KDF_ROUNDS)
    }

    pub fn create_with_rounds(password: &str, rounds: u32) -> Result<Self, AuthError> {
        let mut secret = Zeroizing::new([0u8; 32]);
        rand::rngs::OsRng.fill_bytes(&mut *secret);
        Self::from_secret(&secret, password, rounds)
    }

    /// Wrap an existing 32-byte ed25519 secret.
    pub fn from_secret(secret: &[u8; 32], password: &str, rounds: u32) -> Result<Self, AuthError> {
        let rounds = rounds.max(1);
        let mut salt = [0u8; SALT_LEN];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        let mut nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let public_key = SigningKey::from_bytes(secret).verifying_key().to_bytes();
        let key = derive_key(password, &salt, rounds);
        let ciphertext = cipher(&key)
            .encrypt(Nonce::from_slice(&nonce), secret.as_slice())
            .map_err(|_| AuthError::Encryption)?;

        Ok(Self {
            version: VERSION,
            address: Address::from_public_key(&public_key),
            public_key: hex::encode(public_key),
            kdf: KdfParams {
                rounds,
                salt: hex::encode(salt),
            },
            nonce: hex::encode(nonce),
            ciphertext: hex::encode(ciphertext),
        })
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Decrypt the signing key.
    pub fn decrypt(&self, password: &str) -> Result<SigningKey, AuthError> {
        if self.version != VERSION {
            return Err(AuthError::UnsupportedVersion(self.version));
        }
        if self.kdf.rounds == 0 {
            return Err(AuthError::Corrupt("kdf rounds must be positive".into()));
        }
        let salt = decode_field("salt", &self.kdf.salt)?;
        let nonce: [u8; NONCE_LEN] = decode_field("nonce", &self.nonce)?
            .try_into()
            .map_err(|_| AuthError::Corrupt(format!("nonce must be {NONCE_LEN} bytes")))?;
        let ciphertext = decode_field("ciphertext", &self.ciphertext)?;

        let key = derive_key(password, &salt, self.kdf.rounds);
        // A wrong password and a tampered ciphertext fail the same tag check.
        let plaintext = Zeroizing::new(
            cipher(&key)
                .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
                .map_err(|_| AuthError::WrongPassword)?,
        );
        let secret: Zeroizing<[u8; 32]> = Zeroizing::new(
            plaintext
                .as_slice()
                .try_into()
                .map_err(|_| AuthError::Corrupt("sealed key must be 32 bytes".into()))?,
        );
        let signing_key = SigningKey::from_bytes(&secret);

        let derived = Address::from_public_key(&signing_key.verifying_key().to_bytes());
        if derived != self.address {
            return Err(AuthError::Corrupt(format!(
                "address {} does not match decrypted key {derived}",
                self.address
            )));
        }
        Ok(signing_key)
    }

    pub fn to_json(&self) -> Result<String, AuthError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, AuthError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), AuthError> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, AuthError> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }
}

fn decode_field(name: &str, value: &str) -> Result<Vec<u8>, AuthError> {
    hex::decode(value).map_err(|e| AuthError::Corrupt(format!("{name}: {e}")))
}

fn derive_key(password: &str, salt: &[u8], rounds: u32) -> Zeroizing<[u8; 32]> {
    let mut key = Zeroizing::new([0u8; 32]);
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, rounds, &mut *key);
    key
}

fn cipher(key: &[u8; 32]) -> Aes256Gcm {
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key))
}
