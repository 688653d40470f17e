use ed25519_dalek::SigningKey;
use giving_types::Address;
use tracing::{info, warn};

use crate::error::AuthError;
use crate::keystore::Keystore;

/// A wallet whose key is still encrypted.
#[derive(Clone, Debug)]
pub struct LockedSession {
    keystore: Keystore,
}

impl LockedSession {
    pub fn new(keystore: Keystore) -> Self {
        Self { keystore }
    }

    pub fn address(&self) -> &Address {
        self.keystore.address()
    }

    pub fn keystore(&self) -> &Keystore {
        &self.keystore
    }

    /// Decrypt the key. The returned session borrows this one mutably, so at
    /// most one unlocked signer exists per wallet.
    pub fn unlock(&mut self, password: &str) -> Result<UnlockedSession<'_>, AuthError> {
        match self.keystore.decrypt(password) {
            Ok(key) => {
                info!(address = %self.keystore.address(), "wallet unlocked");
                Ok(UnlockedSession { wallet: self, key })
            }
            Err(e) => {
                warn!(address = %self.keystore.address(), error = %e, "wallet unlock failed");
                Err(e)
            }
        }
    }
}

/// A wallet with its decrypted key. The key is wiped on drop.
pub struct UnlockedSession<'w> {
    wallet: &'w mut LockedSession,
    key: SigningKey,
}

impl UnlockedSession<'_> {
    pub fn address(&self) -> &Address {
        self.wallet.address()
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.key
    }

    /// Lock explicitly.
    pub fn lock(self) {
        info!(address = %self.wallet.address(), "wallet locked");
    }
}

impl std::fmt::Debug for UnlockedSession<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnlockedSession")
            .field("address", self.address())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::FAST_KDF_ROUNDS;

    #[test]
    fn unlock_and_lock() {
        let mut wallet = LockedSession::new(Keystore::from_secret(&[3u8; 32], "pw", FAST_KDF_ROUNDS).unwrap());
        let address = wallet.address().clone();
        {
            let session = wallet.unlock("pw").unwrap();
            assert_eq!(session.address(), &address);
            assert!(!format!("{session:?}").contains("key"));
            session.lock();
        }
        // usable again once the signer is gone
        assert!(wallet.unlock("pw").is_ok());
    }

    #[test]
    fn wrong_password_keeps_wallet_locked() {
        let mut wallet = LockedSession::new(Keystore::from_secret(&[3u8; 32], "pw", FAST_KDF_ROUNDS).unwrap());
        assert!(matches!(wallet.unlock("nope"), Err(AuthError::WrongPassword)));
        assert!(wallet.unlock("pw").is_ok());
    }
}
