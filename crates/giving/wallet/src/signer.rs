//! Transaction signing.

use ed25519_dalek::{Signature, Signer, Verifier, VerifyingKey};
use giving_types::{Address, DonationId, LedgerCall, TxHash};
use serde::{Deserialize, Serialize};

use crate::error::SignatureError;
use crate::session::UnlockedSession;

/// Supplies the acting address and signs outgoing ledger calls.
pub trait TransactionSigner: Send + Sync {
    fn address(&self) -> &Address;

    /// Sign `call`. `reference` lists the donation records the call is
    /// issued for; the index uses it to attribute pledge moves.
    fn sign_call(&self, call: LedgerCall, reference: Vec<DonationId>) -> Result<SignedCall, SignatureError>;
}

/// A ledger call with its ed25519 signature.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedCall {
    pub from: Address,
    /// Hex-encoded ed25519 public key
    pub public_key: String,
    pub nonce: u64,
    pub call: LedgerCall,
    #[serde(default)]
    pub reference: Vec<DonationId>,
    /// Hex-encoded signature over the canonical payload
    pub signature: String,
}

impl SignedCall {
    fn payload(
        from: &Address,
        nonce: u64,
        call: &LedgerCall,
        reference: &[DonationId],
    ) -> Result<Vec<u8>, SignatureError> {
        serde_json::to_vec(&(from, nonce, call, reference)).map_err(|e| SignatureError::Encoding(e.to_string()))
    }

    /// Check the signature and that `from` belongs to the public key.
    pub fn verify(&self) -> Result<(), SignatureError> {
        let public: [u8; 32] = hex::decode(&self.public_key)
            .map_err(|e| SignatureError::Malformed(e.to_string()))?
            .try_into()
            .map_err(|_| SignatureError::Malformed("public key must be 32 bytes".into()))?;
        let derived = Address::from_public_key(&public);
        if derived != self.from {
            return Err(SignatureError::AddressMismatch {
                claimed: self.from.to_string(),
                derived: derived.to_string(),
            });
        }

        let signature: [u8; 64] = hex::decode(&self.signature)
            .map_err(|e| SignatureError::Malformed(e.to_string()))?
            .try_into()
            .map_err(|_| SignatureError::Malformed("signature must be 64 bytes".into()))?;
        let key = VerifyingKey::from_bytes(&public).map_err(|e| SignatureError::Malformed(e.to_string()))?;
        let payload = Self::payload(&self.from, self.nonce, &self.call, &self.reference)?;
        key.verify(&payload, &Signature::from_bytes(&signature))
            .map_err(|_| SignatureError::Invalid)
    }

    /// Transaction hash: blake3 over payload and signature.
    pub fn tx_hash(&self) -> Result<TxHash, SignatureError> {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&Self::payload(&self.from, self.nonce, &self.call, &self.reference)?);
        hasher.update(self.signature.as_bytes());
        Ok(TxHash::from_digest(hasher.finalize().as_bytes()))
    }
}

impl TransactionSigner for UnlockedSession<'_> {
    fn address(&self) -> &Address {
        UnlockedSession::address(self)
    }

    fn sign_call(&self, call: LedgerCall, reference: Vec<DonationId>) -> Result<SignedCall, SignatureError> {
        let from = UnlockedSession::address(self).clone();
        let nonce = rand::random::<u64>();
        let payload = SignedCall::payload(&from, nonce, &call, &reference)?;
        let key = self.signing_key();
        let signature = key.sign(&payload);
        Ok(SignedCall {
            from,
            public_key: hex::encode(key.verifying_key().as_bytes()),
            nonce,
            call,
            reference,
            signature: hex::encode(signature.to_bytes()),
        })
    }
}
