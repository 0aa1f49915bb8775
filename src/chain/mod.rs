use std::sync::Arc;

pub mod block;
pub mod database;
pub mod genesis;
pub mod mempool;
pub mod merkle;
pub mod nameservice;
pub mod node;
pub mod signature;
pub mod state;
pub mod storage;
pub mod transaction;
pub mod worker;

/// Called with preformatted event strings as the chain processes blocks.
/// Purely observational; nothing may depend on delivery order.
pub type EventHandler = Arc<dyn Fn(&str) + Send + Sync>;
