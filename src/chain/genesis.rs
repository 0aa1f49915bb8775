use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chain::database::AccountId;

#[derive(Debug, Error)]
pub enum GenesisError {
    #[error("reading genesis file: {0}")]
    Io(#[from] std::io::Error),
    #[error("decoding genesis file: {0}")]
    Decode(#[from] serde_json::Error),
}

/// The chain's starting configuration, loaded once at node startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Genesis {
    #[serde(default)]
    pub date: String,
    pub chain_id: u16,
    pub trans_per_block: u16,
    pub difficulty: u16,
    pub mining_reward: u64,
    pub gas_price: u64,
    pub balances: HashMap<AccountId, u64>,
}

impl Genesis {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, GenesisError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_the_genesis_document() {
        let doc = r#"{
            "date": "2024-03-01T00:00:00Z",
            "chain_id": 1,
            "trans_per_block": 10,
            "difficulty": 6,
            "mining_reward": 700,
            "gas_price": 15,
            "balances": {
                "0xdd6b972ffcc631a62cae1bb9d80b7ff429c8ebb4": 1000000
            }
        }"#;

        let genesis: Genesis = serde_json::from_str(doc).unwrap();
        assert_eq!(genesis.chain_id, 1);
        assert_eq!(genesis.trans_per_block, 10);
        assert_eq!(genesis.difficulty, 6);
        assert_eq!(genesis.mining_reward, 700);
        assert_eq!(genesis.gas_price, 15);
        assert_eq!(genesis.balances.len(), 1);

        let id: AccountId = "0xdd6b972ffcc631a62cae1bb9d80b7ff429c8ebb4".parse().unwrap();
        assert_eq!(genesis.balances[&id], 1000000);
    }

    #[test]
    fn rejects_malformed_balance_addresses() {
        let doc = r#"{
            "chain_id": 1,
            "trans_per_block": 1,
            "difficulty": 1,
            "mining_reward": 1,
            "gas_price": 1,
            "balances": { "not-an-address": 5 }
        }"#;

        assert!(serde_json::from_str::<Genesis>(doc).is_err());
    }
}
