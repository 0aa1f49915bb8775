use std::env;
use std::net::{IpAddr, Ipv4Addr};

/// Node configuration, read from `CINDER_*` environment variables with
/// sensible defaults for a single local node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub port: u16,
    pub bind_ip: IpAddr,
    pub genesis_path: String,
    pub accounts_dir: String,
    pub db_path: String,
    pub beneficiary: String,
    pub select_strategy: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            port: 7280,
            bind_ip: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            genesis_path: "genesis.json".to_string(),
            accounts_dir: "accounts".to_string(),
            db_path: "blocks.db".to_string(),
            beneficiary: "miner".to_string(),
            select_strategy: "tip".to_string(),
        }
    }
}

impl NodeConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(port) = env::var("CINDER_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                config.port = port;
            }
        }

        if let Ok(bind_ip) = env::var("CINDER_BIND_IP") {
            if let Ok(ip) = bind_ip.parse::<IpAddr>() {
                config.bind_ip = ip;
            }
        }

        if let Ok(genesis_path) = env::var("CINDER_GENESIS_PATH") {
            config.genesis_path = genesis_path;
        }

        if let Ok(accounts_dir) = env::var("CINDER_ACCOUNTS_DIR") {
            config.accounts_dir = accounts_dir;
        }

        if let Ok(db_path) = env::var("CINDER_DB_PATH") {
            config.db_path = db_path;
        }

        if let Ok(beneficiary) = env::var("CINDER_BENEFICIARY") {
            config.beneficiary = beneficiary;
        }

        if let Ok(strategy) = env::var("CINDER_SELECT_STRATEGY") {
            config.select_strategy = strategy;
        }

        config
    }

    pub fn log_config(&self) {
        log::info!(
            "cinder bind={}:{} genesis={} accounts={} db={} beneficiary={} strategy={}",
            self.bind_ip,
            self.port,
            self.genesis_path,
            self.accounts_dir,
            self.db_path,
            self.beneficiary,
            self.select_strategy
        );
    }
}
