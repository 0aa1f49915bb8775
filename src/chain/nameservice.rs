use std::collections::HashMap;
use std::path::Path;

use secp256k1::{SecretKey, SECP256K1};
use thiserror::Error;

use crate::chain::database::{public_key_to_account_id, AccountId};

#[derive(Debug, Error)]
pub enum NameServiceError {
    #[error("walking accounts directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("decoding private key file {file}: {reason}")]
    BadKeyFile { file: String, reason: String },
}

/// Read-only lookup from account ids to human names, built from the
/// `.ecdsa` private key files in the accounts directory. The file stem is
/// the name associated with the derived account.
pub struct NameService {
    accounts: HashMap<AccountId, String>,
}

impl NameService {
    pub fn new(root: impl AsRef<Path>) -> Result<Self, NameServiceError> {
        let mut accounts = HashMap::new();
        load_dir(root.as_ref(), &mut accounts)?;
        Ok(Self { accounts })
    }

    /// The name for the account, falling back to the id itself.
    pub fn lookup(&self, account_id: AccountId) -> String {
        match self.accounts.get(&account_id) {
            Some(name) => name.clone(),
            None => account_id.to_string(),
        }
    }

    pub fn copy(&self) -> HashMap<AccountId, String> {
        self.accounts.clone()
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}

fn load_dir(
    dir: &Path,
    accounts: &mut HashMap<AccountId, String>,
) -> Result<(), NameServiceError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();

        if path.is_dir() {
            load_dir(&path, accounts)?;
            continue;
        }

        if path.extension().and_then(|ext| ext.to_str()) != Some("ecdsa") {
            continue;
        }

        let private_key = load_private_key(&path)?;
        let account_id = public_key_to_account_id(&private_key.public_key(&SECP256K1));

        let name = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or_default()
            .to_string();
        accounts.insert(account_id, name);
    }

    Ok(())
}

/// Reads a hex-encoded secp256k1 private key file.
pub fn load_private_key(path: &Path) -> Result<SecretKey, NameServiceError> {
    let bad = |reason: String| NameServiceError::BadKeyFile {
        file: path.display().to_string(),
        reason,
    };

    let content = std::fs::read_to_string(path)?;
    let bytes = hex::decode(content.trim()).map_err(|err| bad(err.to_string()))?;
    SecretKey::from_slice(&bytes).map_err(|err| bad(err.to_string()))
}
