//! Bitcoin Core RPC adapter
//!
//! Implements the `BitcoinChain` trait over a bitcoind wallet node. The RPC
//! client is blocking, so every call hops onto the blocking pool. HTLC
//! addresses must be watched by the node (importaddress/descriptor wallet)
//! for `utxos` to see them.

use crate::backend::bitcoin::{BitcoinChain, Utxo};
use crate::config::FeeTier;
use crate::error::{SettlerError, SettlerResult};

use async_trait::async_trait;
use bitcoin::{Address, OutPoint, Transaction, Txid};
use bitcoincore_rpc::{Auth, Client, RpcApi};
use std::sync::Arc;
use tracing::debug;

/// Floor applied when the node has no fee estimate (fresh regtest chains)
const FALLBACK_FEE_RATE: u64 = 1;

pub struct BitcoinRpc {
    client: Arc<Client>,
}

impl BitcoinRpc {
    pub fn new(url: &str, user: &str, password: &str) -> SettlerResult<Self> {
        let client = Client::new(url, Auth::UserPass(user.to_string(), password.to_string()))
            .map_err(|e| SettlerError::ChainConnection {
                chain: "bitcoin".into(),
                message: e.to_string(),
            })?;
        Ok(Self {
            client: Arc::new(client),
        })
    }

    async fn blocking<T, F>(&self, op: F) -> SettlerResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Client) -> Result<T, bitcoincore_rpc::Error> + Send + 'static,
    {
        let client = self.client.clone();
        tokio::task::spawn_blocking(move || op(&client))
            .await
            .map_err(|e| SettlerError::Internal(format!("blocking rpc task: {e}")))?
            .map_err(connection_error)
    }
}

fn connection_error(e: bitcoincore_rpc::Error) -> SettlerError {
    SettlerError::ChainConnection {
        chain: "bitcoin".into(),
        message: e.to_string(),
    }
}

/// RPC_INVALID_ADDRESS_OR_KEY: unknown transaction
fn is_not_found(e: &bitcoincore_rpc::Error) -> bool {
    matches!(
        e,
        bitcoincore_rpc::Error::JsonRpc(bitcoincore_rpc::jsonrpc::Error::Rpc(rpc))
            if rpc.code == -5
    )
}

fn conf_target(tier: FeeTier) -> u16 {
    match tier {
        FeeTier::High => 1,
        FeeTier::Medium => 3,
        FeeTier::Low => 6,
        FeeTier::Economy => 12,
        FeeTier::Minimum => 25,
    }
}

#[async_trait]
impl BitcoinChain for BitcoinRpc {
    async fn tip_height(&self) -> SettlerResult<u64> {
        self.blocking(|c| c.get_block_count()).await
    }

    async fn utxos(&self, address: &Address) -> SettlerResult<Vec<Utxo>> {
        let address = address.clone();
        let entries = self
            .blocking(move |c| c.list_unspent(Some(1), None, Some(&[&address]), None, None))
            .await?;
        Ok(entries
            .into_iter()
            .map(|e| Utxo {
                outpoint: OutPoint {
                    txid: e.txid,
                    vout: e.vout,
                },
                value: e.amount,
            })
            .collect())
    }

    async fn tx_height(&self, txid: &Txid) -> SettlerResult<Option<u64>> {
        let txid = *txid;
        let client = self.client.clone();
        let result = tokio::task::spawn_blocking(move || {
            let tip = client.get_block_count()?;
            let info = client.get_raw_transaction_info(&txid, None)?;
            Ok::<_, bitcoincore_rpc::Error>((tip, info.confirmations))
        })
        .await
        .map_err(|e| SettlerError::Internal(format!("blocking rpc task: {e}")))?;

        match result {
            Ok((tip, Some(confirmations))) if confirmations > 0 => {
                Ok(Some(tip + 1 - confirmations as u64))
            }
            Ok(_) => Ok(None),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(connection_error(e)),
        }
    }

    async fn broadcast(&self, tx: &Transaction) -> SettlerResult<Txid> {
        let tx = tx.clone();
        let client = self.client.clone();
        let result = tokio::task::spawn_blocking(move || client.send_raw_transaction(&tx))
            .await
            .map_err(|e| SettlerError::Internal(format!("blocking rpc task: {e}")))?;

        // A node-side rejection is an action failure, not a connection flap
        result.map_err(|e| match &e {
            bitcoincore_rpc::Error::JsonRpc(bitcoincore_rpc::jsonrpc::Error::Rpc(rpc)) => {
                SettlerError::Transaction(format!("broadcast rejected: {}", rpc.message))
            }
            _ => connection_error(e),
        })
    }

    async fn fee_rate(&self, tier: FeeTier) -> SettlerResult<u64> {
        let target = conf_target(tier);
        let estimate = self
            .blocking(move |c| c.estimate_smart_fee(target, None))
            .await?;

        let rate = match estimate.fee_rate {
            // estimatesmartfee reports BTC/kvB
            Some(per_kvb) => (per_kvb.to_sat() / 1000).max(FALLBACK_FEE_RATE),
            None => {
                debug!(?tier, "no fee estimate available, using fallback");
                FALLBACK_FEE_RATE
            }
        };
        Ok(rate)
    }
}
