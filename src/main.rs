use std::error::Error;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use log::{debug, info};

use crate::chain::database::public_key_to_account_id;
use crate::chain::genesis::Genesis;
use crate::chain::nameservice::{load_private_key, NameService};
use crate::chain::node::Node;
use crate::chain::state::{Config, State};
use crate::chain::storage::SledStorage;
use crate::chain::worker::Worker;
use crate::chain::EventHandler;
use crate::config::NodeConfig;

mod chain;
mod config;

pub type Result<T> = std::result::Result<T, Box<dyn Error>>;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let config = NodeConfig::from_env();
    config.log_config();

    let genesis = Genesis::load(&config.genesis_path)?;

    // The name service maps every .ecdsa key file in the accounts folder to
    // a human name; the beneficiary's key decides who collects rewards.
    let name_service = Arc::new(NameService::new(&config.accounts_dir)?);
    info!("loaded {} named accounts", name_service.len());

    let beneficiary_path = Path::new(&config.accounts_dir)
        .join(&config.beneficiary)
        .with_extension("ecdsa");
    let beneficiary_key = load_private_key(&beneficiary_path)?;
    let beneficiary_id =
        public_key_to_account_id(&beneficiary_key.public_key(&secp256k1::SECP256K1));
    info!("beneficiary {} -> {beneficiary_id}", config.beneficiary);

    let storage = Arc::new(SledStorage::open(&config.db_path)?);

    let ev: EventHandler = Arc::new(|msg: &str| debug!("{msg}"));

    let state = State::new(Config {
        beneficiary_id,
        genesis,
        storage,
        select_strategy: config.select_strategy.clone(),
        ev: Some(Arc::clone(&ev)),
    })?;

    let worker = Worker::run(Arc::clone(&state), ev);

    let addr = SocketAddr::new(config.bind_ip, config.port);
    let node = Node::serve(addr, Arc::clone(&state), name_service).await?;
    info!("node listening on {}", node.local_addr());

    // If there are transactions left over from a previous run, get mining.
    if state.mempool_length() > 0 {
        worker.signal_start_mining();
    }

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    node.shutdown();
    state.shutdown().await?;

    Ok(())
}
