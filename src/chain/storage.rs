use std::collections::BTreeMap;
use std::path::Path;
use std::sync::RwLock;

use thiserror::Error;

use crate::chain::block::BlockData;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("block {0} not found")]
    NotFound(u64),
    #[error("storage database failure: {0}")]
    Database(#[from] sled::Error),
    #[error("encoding block data: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Append-only block log. Implementations persist [`BlockData`] records
/// keyed by block number and iterate them in ascending order from block 1.
pub trait Storage: Send + Sync {
    fn write(&self, data: &BlockData) -> Result<(), StorageError>;
    fn get_block(&self, number: u64) -> Result<BlockData, StorageError>;
    fn for_each(&self) -> Box<dyn Iterator<Item = Result<BlockData, StorageError>>>;
    fn close(&self) -> Result<(), StorageError>;
    fn reset(&self) -> Result<(), StorageError>;
}

/// In-memory block log used by tests and ephemeral nodes.
#[derive(Default)]
pub struct MemoryStorage {
    blocks: RwLock<BTreeMap<u64, BlockData>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn write(&self, data: &BlockData) -> Result<(), StorageError> {
        let mut blocks = self.blocks.write().unwrap();
        blocks.insert(data.header.number, data.clone());
        Ok(())
    }

    fn get_block(&self, number: u64) -> Result<BlockData, StorageError> {
        let blocks = self.blocks.read().unwrap();
        blocks
            .get(&number)
            .cloned()
            .ok_or(StorageError::NotFound(number))
    }

    fn for_each(&self) -> Box<dyn Iterator<Item = Result<BlockData, StorageError>>> {
        let snapshot: Vec<BlockData> = self.blocks.read().unwrap().values().cloned().collect();
        Box::new(snapshot.into_iter().map(Ok))
    }

    fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }

    fn reset(&self) -> Result<(), StorageError> {
        self.blocks.write().unwrap().clear();
        Ok(())
    }
}

/// Durable block log backed by sled. Block numbers are stored as big-endian
/// keys so the natural key order is ascending block order.
pub struct SledStorage {
    db: sled::Db,
    blocks: sled::Tree,
}

const BLOCKS_TREE: &str = "blocks";

impl SledStorage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        let blocks = db.open_tree(BLOCKS_TREE)?;
        Ok(Self { db, blocks })
    }

    fn decode(value: &[u8]) -> Result<BlockData, StorageError> {
        Ok(serde_json::from_slice(value)?)
    }
}

impl Storage for SledStorage {
    fn write(&self, data: &BlockData) -> Result<(), StorageError> {
        let encoded = serde_json::to_vec(data)?;
        self.blocks
            .insert(data.header.number.to_be_bytes(), encoded)?;
        self.blocks.flush()?;
        Ok(())
    }

    fn get_block(&self, number: u64) -> Result<BlockData, StorageError> {
        match self.blocks.get(number.to_be_bytes())? {
            Some(value) => Self::decode(&value),
            None => Err(StorageError::NotFound(number)),
        }
    }

    fn for_each(&self) -> Box<dyn Iterator<Item = Result<BlockData, StorageError>>> {
        Box::new(self.blocks.iter().values().map(|item| match item {
            Ok(value) => Self::decode(&value),
            Err(err) => Err(StorageError::Database(err)),
        }))
    }

    fn close(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }

    fn reset(&self) -> Result<(), StorageError> {
        self.blocks.clear()?;
        self.blocks.flush()?;
        Ok(())
    }
}
