//! Signing collaborator for the giving core.
//!
//! The wallet is an explicit value: a [`LockedSession`] wraps an encrypted
//! [`Keystore`]; `unlock(password)` yields an [`UnlockedSession`] that holds
//! the decrypted key for as long as it lives and borrows the locked session
//! mutably, so there is one signer at a time. Locking (or dropping) the
//! session wipes the key.

#![deny(unsafe_code)]

pub mod error;
pub mod keystore;
pub mod session;
pub mod signer;

pub use error::{AuthError, SignatureError};
pub use keystore::{KdfParams, Keystore, DEFAULT_KDF_ROUNDS};
pub use session::{LockedSession, UnlockedSession};
pub use signer::{SignedCall, TransactionSigner};
