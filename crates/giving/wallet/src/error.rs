use thiserror::Error;

/// Keystore and unlock failures. Messages never carry key material.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("wrong password")]
    WrongPassword,

    #[error("keystore is corrupt: {0}")]
    Corrupt(String),

    #[error("unsupported keystore version {0}")]
    UnsupportedVersion(u32),

    #[error("could not seal the key")]
    Encryption,

    #[error("keystore i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("keystore encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("malformed signed call: {0}")]
    Malformed(String),

    #[error("signer {claimed} does not match public key {derived}")]
    AddressMismatch { claimed: String, derived: String },

    #[error("signature does not verify")]
    Invalid,

    #[error("could not encode call: {0}")]
    Encoding(String),
}
