use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::chain::block::BlockData;
use crate::chain::database::AccountId;
use crate::chain::genesis::Genesis;
use crate::chain::nameservice::NameService;
use crate::chain::state::State;
use crate::chain::transaction::{BlockTx, SignedTx};

/// One request per line of JSON; the node answers with one [`Response`]
/// line. Wallets submit the same `SignedTx` document they sign.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    SubmitTransaction { tx: SignedTx },
    QueryAccount { account: AccountId },
    Accounts,
    Mempool { account: Option<AccountId> },
    LatestBlock,
    Genesis,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Ack,
    Account(AccountInfo),
    Accounts {
        latest_block_hash: String,
        uncommitted: usize,
        accounts: Vec<AccountInfo>,
    },
    Mempool { trans: Vec<BlockTx> },
    Block { block: BlockData },
    Genesis { genesis: Genesis },
    Error { message: String },
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AccountInfo {
    pub account: AccountId,
    pub name: String,
    pub nonce: u64,
    pub balance: u64,
}

/// The node's public service: a JSON-lines TCP listener over the state's
/// query and submit surface.
pub struct Node {
    local_addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl Node {
    pub async fn serve(
        addr: SocketAddr,
        state: Arc<State>,
        name_service: Arc<NameService>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!("node: accepted connection from {peer}");
                        let state = Arc::clone(&state);
                        let name_service = Arc::clone(&name_service);
                        tokio::spawn(async move {
                            if let Err(err) = handle_connection(stream, state, name_service).await {
                                debug!("node: connection {peer} closed: {err}");
                            }
                        });
                    }
                    Err(err) => {
                        warn!("node: accept failed: {err}");
                    }
                }
            }
        });

        Ok(Self { local_addr, handle })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown(&self) {
        self.handle.abort();
    }
}

async fn handle_connection(
    stream: TcpStream,
    state: Arc<State>,
    name_service: Arc<NameService>,
) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => dispatch(request, &state, &name_service),
            Err(err) => Response::Error {
                message: format!("decoding request: {err}"),
            },
        };

        let mut payload = serde_json::to_vec(&response)?;
        payload.push(b'\n');
        writer.write_all(&payload).await?;
    }

    Ok(())
}

fn dispatch(request: Request, state: &Arc<State>, name_service: &Arc<NameService>) -> Response {
    match request {
        Request::SubmitTransaction { tx } => match state.upsert_wallet_transaction(tx) {
            Ok(()) => Response::Ack,
            Err(err) => Response::Error {
                message: err.to_string(),
            },
        },

        Request::QueryAccount { account } => match state.query_account(account) {
            Ok(found) => Response::Account(AccountInfo {
                account: found.account_id,
                name: name_service.lookup(found.account_id),
                nonce: found.nonce,
                balance: found.balance,
            }),
            Err(err) => Response::Error {
                message: err.to_string(),
            },
        },

        Request::Accounts => {
            let mut accounts: Vec<AccountInfo> = state
                .accounts()
                .into_values()
                .map(|account| AccountInfo {
                    account: account.account_id,
                    name: name_service.lookup(account.account_id),
                    nonce: account.nonce,
                    balance: account.balance,
                })
                .collect();
            accounts.sort_by_key(|info| info.account);
            Response::Accounts {
                latest_block_hash: state.latest_block().hash(),
                uncommitted: state.mempool_length(),
                accounts,
            }
        }

        Request::Mempool { account } => {
            // An account filter matches transactions it sent or receives.
            let trans = state
                .mempool()
                .into_iter()
                .filter(|tx| {
                    account.map_or(true, |id| tx.from_id() == id || tx.to_id() == id)
                })
                .collect();
            Response::Mempool { trans }
        }

        Request::LatestBlock => Response::Block {
            block: BlockData::from(&state.latest_block()),
        },

        Request::Genesis => Response::Genesis {
            genesis: state.genesis().clone(),
        },
    }
}
