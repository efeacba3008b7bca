//! Batch composition: one sender, one output per queued recipient

use crate::error::{FaucetError, FaucetResult};
use crate::queue::QueueEntry;
use serde::{Deserialize, Serialize};

/// An amount of one denomination. Amounts travel as decimal strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    pub denom: String,
    #[serde(with = "amount_string")]
    pub amount: u128,
}

impl Coin {
    pub fn new(denom: impl Into<String>, amount: u128) -> Self {
        Self {
            denom: denom.into(),
            amount,
        }
    }
}

/// One side of a multi-send
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub address: String,
    pub coins: Vec<Coin>,
}

/// A single multi-output transfer built from one queue snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchInstruction {
    pub sender: String,
    pub per_recipient_amount: u128,
    /// The sender's debit: `per_recipient_amount × outputs.len()`
    pub input: Transfer,
    /// In snapshot order
    pub outputs: Vec<Transfer>,
}

impl BatchInstruction {
    pub fn recipient_count(&self) -> usize {
        self.outputs.len()
    }

    pub fn total(&self) -> u128 {
        self.input.coins.iter().map(|c| c.amount).sum()
    }
}

/// Build the batch for `entries`. The snapshot must not be empty.
pub fn compose(
    sender: &str,
    entries: &[QueueEntry],
    per_recipient_amount: u128,
    denom: &str,
) -> FaucetResult<BatchInstruction> {
    if entries.is_empty() {
        return Err(FaucetError::Internal(
            "Cannot compose a batch from an empty snapshot".to_string(),
        ));
    }

    let total = per_recipient_amount
        .checked_mul(entries.len() as u128)
        .ok_or_else(|| FaucetError::Internal("Batch total overflows".to_string()))?;

    let outputs = entries
        .iter()
        .map(|entry| Transfer {
            address: entry.address.clone(),
            coins: vec![Coin::new(denom, per_recipient_amount)],
        })
        .collect();

    Ok(BatchInstruction {
        sender: sender.to_string(),
        per_recipient_amount,
        input: Transfer {
            address: sender.to_string(),
            coins: vec![Coin::new(denom, total)],
        },
        outputs,
    })
}

mod amount_string {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(amount: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(amount)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(D::Error::custom)
    }
}
