//! Ledger calling convention: the calls the core issues, the packed
//! multi-withdraw entry format, and mined receipts.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ParseError;
use crate::ids::{strip_hex_prefix, Address, AdminId, PledgeId, TxHash};
use crate::token::Amount;

/// One ledger transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "call", rename_all = "snake_case")]
pub enum LedgerCall {
    /// Create a pledge owned by the giver (or directly by a project).
    Donate {
        giver_id: AdminId,
        receiver_id: AdminId,
        amount: Amount,
        token: Address,
    },
    /// Move `amount` of a pledge to another admin.
    Transfer {
        sender_id: AdminId,
        pledge_id: PledgeId,
        amount: Amount,
        receiver_id: AdminId,
    },
    /// Pull `amount` of a pledge back to its giver.
    Withdraw { pledge_id: PledgeId, amount: Amount },
    /// Pay out several pledges of one milestone in a single transaction.
    MultiWithdraw {
        milestone_id: AdminId,
        pledges: Vec<PackedPledge>,
    },
    /// Cancel an admin; funds unwind back up their delegation chains.
    CancelProject { admin_id: AdminId },
}

impl LedgerCall {
    pub fn name(&self) -> &'static str {
        match self {
            LedgerCall::Donate { .. } => "donate",
            LedgerCall::Transfer { .. } => "transfer",
            LedgerCall::Withdraw { .. } => "withdraw",
            LedgerCall::MultiWithdraw { .. } => "multi_withdraw",
            LedgerCall::CancelProject { .. } => "cancel_project",
        }
    }

    /// Deterministic byte encoding used for signing and hashing.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// An amount drawn from one pledge.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PledgeAmount {
    pub pledge_id: PledgeId,
    pub amount: Amount,
}

/// Fixed-width 32-byte `(amount, pledgeId)` entry.
///
/// Big-endian; bytes `0..24` hold the amount and bytes `24..32` the pledge id.
/// Amounts are `u128`, so bytes `0..8` are always zero.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PackedPledge([u8; 32]);

impl PackedPledge {
    pub fn encode(entry: PledgeAmount) -> Self {
        let mut bytes = [0u8; 32];
        bytes[8..24].copy_from_slice(&entry.amount.0.to_be_bytes());
        bytes[24..32].copy_from_slice(&entry.pledge_id.0.to_be_bytes());
        Self(bytes)
    }

    pub fn decode(&self) -> Result<PledgeAmount, ParseError> {
        if self.0[..8].iter().any(|b| *b != 0) {
            return Err(ParseError::InvalidAmount(self.to_string()));
        }
        let mut amount = [0u8; 16];
        amount.copy_from_slice(&self.0[8..24]);
        let mut pledge = [0u8; 8];
        pledge.copy_from_slice(&self.0[24..32]);
        Ok(PledgeAmount {
            pledge_id: PledgeId(u64::from_be_bytes(pledge)),
            amount: Amount(u128::from_be_bytes(amount)),
        })
    }

    pub fn parse(input: &str) -> Result<Self, ParseError> {
        let bytes = hex::decode(strip_hex_prefix(input))
            .map_err(|e| ParseError::InvalidHex(format!("{input}: {e}")))?;
        let array: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| ParseError::PackedLength(bytes.len()))?;
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for PackedPledge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for PackedPledge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PackedPledge({self})")
    }
}

impl TryFrom<String> for PackedPledge {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PackedPledge> for String {
    fn from(value: PackedPledge) -> Self {
        value.to_string()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptStatus {
    Succeeded,
    Reverted,
}

/// Receipt delivered once a transaction is mined.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxReceipt {
    pub tx_hash: TxHash,
    pub block_number: u64,
    pub status: ReceiptStatus,
    pub confirmations: u32,
}

impl TxReceipt {
    pub fn succeeded(&self) -> bool {
        self.status == ReceiptStatus::Succeeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_layout_is_amount_then_pledge() {
        let packed = PackedPledge::encode(PledgeAmount {
            pledge_id: PledgeId(0x2a),
            amount: Amount(0x0de0b6b3a7640000),
        });
        let expected = format!("0x{}0de0b6b3a7640000000000000000002a", "0".repeat(32));
        assert_eq!(packed.to_string(), expected);
        assert_eq!(packed.to_string().len(), 66);
        assert_eq!(
            packed.decode().unwrap(),
            PledgeAmount {
                pledge_id: PledgeId(42),
                amount: Amount(1_000_000_000_000_000_000)
            }
        );
    }

    #[test]
    fn packed_parse_rejects_wrong_length_and_overflow() {
        assert_eq!(PackedPledge::parse("0x00ff"), Err(ParseError::PackedLength(2)));
        let overflow = format!("0x01{}", "00".repeat(31));
        assert!(PackedPledge::parse(&overflow).unwrap().decode().is_err());
    }

    #[test]
    fn packed_parse_rejects_non_hex_without_panicking() {
        assert!(matches!(PackedPledge::parse("0xaé0"), Err(ParseError::InvalidHex(_))));
        assert!(matches!(PackedPledge::parse("0xabc"), Err(ParseError::InvalidHex(_))));
        assert!(serde_json::from_str::<PackedPledge>("\"0xaé0\"").is_err());
        let wide = format!("0x{}", "é".repeat(32));
        assert!(serde_json::from_str::<PackedPledge>(&format!("\"{wide}\"")).is_err());
    }

    #[test]
    fn ledger_call_serializes_tagged() {
        let call = LedgerCall::Withdraw {
            pledge_id: PledgeId(3),
            amount: Amount(10),
        };
        let json = serde_json::to_value(&call).unwrap();
        assert_eq!(json["call"], "withdraw");
        assert_eq!(call.name(), "withdraw");
        assert!(!call.canonical_bytes().unwrap().is_empty());
    }
}
