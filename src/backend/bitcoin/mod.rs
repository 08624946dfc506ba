//! Bitcoin swap backend
//!
//! Builds, signs, and broadcasts the HTLC funding/redeem/refund transactions
//! for UTXO legs. Chain access goes through the `BitcoinChain` trait so the
//! backend stays independent of any particular node or indexer.

pub mod batch;
pub mod htlc;
pub mod rpc;

use crate::backend::{ActionKind, SwapBackend};
use crate::config::FeeTier;
use crate::error::{SettlerError, SettlerResult};
use crate::types::AtomicSwap;

use async_trait::async_trait;
use bitcoin::absolute::LockTime;
use bitcoin::secp256k1::{All, PublicKey, Secp256k1, SecretKey};
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Amount, CompressedPublicKey, Network, OutPoint, ScriptBuf, Sequence, Transaction,
    TxIn, TxOut, Txid, Witness,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A spendable output as reported by the chain backend
#[derive(Debug, Clone)]
pub struct Utxo {
    pub outpoint: OutPoint,
    pub value: Amount,
}

/// Chain indexer/RPC capability consumed by the backend
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BitcoinChain: Send + Sync {
    async fn tip_height(&self) -> SettlerResult<u64>;
    async fn utxos(&self, address: &Address) -> SettlerResult<Vec<Utxo>>;
    /// Confirmation height of a transaction, None while unconfirmed
    async fn tx_height(&self, txid: &Txid) -> SettlerResult<Option<u64>>;
    async fn broadcast(&self, tx: &Transaction) -> SettlerResult<Txid>;
    /// Fee rate in sat/vB for the given tier
    async fn fee_rate(&self, tier: FeeTier) -> SettlerResult<u64>;
}

/// Optional pre-funded capability that redeems and immediately re-deposits
/// in one combined operation to cut settlement latency. Injected, never
/// required.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InstantWallet: Send + Sync {
    async fn redeem_and_deposit(&self, swap: &AtomicSwap, secret: &[u8]) -> SettlerResult<String>;
}

/// One action inside a (possibly batched) Bitcoin transaction
#[derive(Debug, Clone)]
pub struct BatchItem {
    pub kind: ActionKind,
    pub swap: AtomicSwap,
    pub secret: Option<Vec<u8>>,
}

pub struct BitcoinBackend {
    chain: Arc<dyn BitcoinChain>,
    network: Network,
    secp: Secp256k1<All>,
    key: SecretKey,
    wallet_pubkey: [u8; 33],
    wallet_address: Address,
    fee_tier: FeeTier,
    instant: Option<Arc<dyn InstantWallet>>,
}

// Rough vbyte costs for fee estimation
const TX_OVERHEAD_VB: u64 = 11;
const P2WPKH_INPUT_VB: u64 = 68;
const HTLC_INPUT_VB: u64 = 100;
const P2WPKH_OUTPUT_VB: u64 = 31;
const P2WSH_OUTPUT_VB: u64 = 43;
const DUST_SAT: u64 = 546;

impl BitcoinBackend {
    pub fn new(
        chain: Arc<dyn BitcoinChain>,
        network: Network,
        key: SecretKey,
        fee_tier: FeeTier,
    ) -> Self {
        let secp = Secp256k1::new();
        let pubkey = CompressedPublicKey(PublicKey::from_secret_key(&secp, &key));
        let wallet_address = Address::p2wpkh(&pubkey, network);
        Self {
            chain,
            network,
            secp,
            key,
            wallet_pubkey: pubkey.to_bytes(),
            wallet_address,
            fee_tier,
            instant: None,
        }
    }

    pub fn with_instant_wallet(mut self, instant: Arc<dyn InstantWallet>) -> Self {
        self.instant = Some(instant);
        self
    }

    pub fn wallet_address(&self) -> &Address {
        &self.wallet_address
    }

    /// Build, sign, and broadcast one transaction covering all given actions:
    /// initiates become new P2WSH outputs funded from the wallet, redeems and
    /// refunds become inputs spending their HTLC outputs.
    pub async fn execute_batch(&self, items: &[BatchItem]) -> SettlerResult<Txid> {
        if items.is_empty() {
            return Err(SettlerError::Internal("empty batch".into()));
        }

        let fee_rate = self.chain.fee_rate(self.fee_tier).await?;

        // Resolve HTLC spends and initiate outputs
        struct Spend {
            utxo: Utxo,
            script: ScriptBuf,
            sequence: Sequence,
            secret: Option<Vec<u8>>,
        }
        let mut spends: Vec<Spend> = Vec::new();
        let mut initiate_outputs: Vec<TxOut> = Vec::new();
        let mut initiate_total = Amount::ZERO;

        for item in items {
            let htlc = htlc::HtlcScript::from_swap(&item.swap, self.network)?;
            match item.kind {
                ActionKind::Initiate => {
                    let amount = parse_sats(&item.swap.amount)?;
                    initiate_total += amount;
                    initiate_outputs.push(TxOut {
                        value: amount,
                        script_pubkey: htlc.address(self.network).script_pubkey(),
                    });
                }
                ActionKind::Redeem | ActionKind::Refund => {
                    let address = htlc.address(self.network);
                    let utxo = self
                        .chain
                        .utxos(&address)
                        .await?
                        .into_iter()
                        .next()
                        .ok_or_else(|| SettlerError::Transaction(format!(
                            "no HTLC output found at {address}"
                        )))?;
                    let sequence = match item.kind {
                        ActionKind::Refund => Sequence::from_height(htlc.wait_blocks),
                        _ => Sequence::MAX,
                    };
                    spends.push(Spend {
                        utxo,
                        script: htlc.witness_script(),
                        sequence,
                        secret: item.secret.clone(),
                    });
                }
            }
        }

        let spend_total: Amount = spends
            .iter()
            .map(|s| s.utxo.value)
            .fold(Amount::ZERO, |acc, v| acc + v);

        // Select wallet funding for whatever the spends don't cover
        let base_vsize = TX_OVERHEAD_VB
            + HTLC_INPUT_VB * spends.len() as u64
            + P2WSH_OUTPUT_VB * initiate_outputs.len() as u64
            + P2WPKH_OUTPUT_VB;
        let mut funding: Vec<Utxo> = Vec::new();
        let mut funding_total = Amount::ZERO;
        let mut fee = Amount::from_sat(fee_rate * base_vsize);

        if initiate_total + fee > spend_total {
            let mut candidates = self.chain.utxos(&self.wallet_address).await?;
            candidates.sort_by(|a, b| b.value.cmp(&a.value));
            for utxo in candidates {
                if spend_total + funding_total >= initiate_total + fee {
                    break;
                }
                funding_total += utxo.value;
                funding.push(utxo);
                fee = Amount::from_sat(
                    fee_rate * (base_vsize + P2WPKH_INPUT_VB * funding.len() as u64),
                );
            }
            if spend_total + funding_total < initiate_total + fee {
                return Err(SettlerError::InsufficientFunds {
                    chain: self.network.to_string(),
                    have: (spend_total + funding_total).to_string(),
                    need: (initiate_total + fee).to_string(),
                });
            }
        }

        // Assemble: HTLC spends first, then wallet funding inputs
        let mut inputs: Vec<TxIn> = spends
            .iter()
            .map(|s| TxIn {
                previous_output: s.utxo.outpoint,
                script_sig: ScriptBuf::new(),
                sequence: s.sequence,
                witness: Witness::new(),
            })
            .collect();
        inputs.extend(funding.iter().map(|u| TxIn {
            previous_output: u.outpoint,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }));

        let mut outputs = initiate_outputs;
        let wallet_value = spend_total + funding_total - initiate_total - fee;
        if wallet_value >= Amount::from_sat(DUST_SAT) {
            outputs.push(TxOut {
                value: wallet_value,
                script_pubkey: self.wallet_address.script_pubkey(),
            });
        }

        let mut tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: inputs,
            output: outputs,
        };

        // Sign HTLC inputs with their branch witnesses
        let mut witnesses: Vec<Witness> = Vec::with_capacity(tx.input.len());
        for (i, spend) in spends.iter().enumerate() {
            let sig = htlc::sign_p2wsh_input(
                &self.secp,
                &tx,
                i,
                &spend.script,
                spend.utxo.value,
                &self.key,
            )?;
            let witness = match &spend.secret {
                Some(secret) => {
                    htlc::redeem_witness(&sig, &self.wallet_pubkey, secret, &spend.script)
                }
                None => htlc::refund_witness(&sig, &self.wallet_pubkey, &spend.script),
            };
            witnesses.push(witness);
        }

        // Sign wallet funding inputs
        let wallet_spk = self.wallet_address.script_pubkey();
        for (offset, utxo) in funding.iter().enumerate() {
            let index = spends.len() + offset;
            let sig = htlc::sign_p2wpkh_input(
                &self.secp,
                &tx,
                index,
                &wallet_spk,
                utxo.value,
                &self.key,
            )?;
            witnesses.push(htlc::p2wpkh_witness(&sig, &self.wallet_pubkey));
        }

        for (input, witness) in tx.input.iter_mut().zip(witnesses) {
            input.witness = witness;
        }

        let txid = self.chain.broadcast(&tx).await?;
        info!(
            %txid,
            actions = items.len(),
            spends = spends.len(),
            funding = funding.len(),
            fee = %fee,
            "broadcast bitcoin transaction"
        );
        Ok(txid)
    }
}

#[async_trait]
impl SwapBackend for BitcoinBackend {
    async fn initiate(&self, swap: &AtomicSwap) -> SettlerResult<String> {
        let txid = self
            .execute_batch(&[BatchItem {
                kind: ActionKind::Initiate,
                swap: swap.clone(),
                secret: None,
            }])
            .await?;
        Ok(txid.to_string())
    }

    async fn redeem(&self, swap: &AtomicSwap, secret: &[u8]) -> SettlerResult<String> {
        if let Some(instant) = &self.instant {
            debug!(secret_hash = %swap.secret_hash, "redeeming through instant wallet");
            return instant.redeem_and_deposit(swap, secret).await;
        }
        let txid = self
            .execute_batch(&[BatchItem {
                kind: ActionKind::Redeem,
                swap: swap.clone(),
                secret: Some(secret.to_vec()),
            }])
            .await?;
        Ok(txid.to_string())
    }

    async fn refund(&self, swap: &AtomicSwap) -> SettlerResult<String> {
        let txid = self
            .execute_batch(&[BatchItem {
                kind: ActionKind::Refund,
                swap: swap.clone(),
                secret: None,
            }])
            .await?;
        Ok(txid.to_string())
    }

    async fn expired(&self, swap: &AtomicSwap) -> SettlerResult<bool> {
        if swap.initiate_tx_hash.is_empty() {
            return Ok(false);
        }
        let txid = htlc::decode_txid(&swap.initiate_tx_hash)?;
        let Some(initiated_at) = self.chain.tx_height(&txid).await? else {
            debug!(%txid, "initiation not yet confirmed, timelock not running");
            return Ok(false);
        };
        let tip = self.chain.tip_height().await?;
        let elapsed = tip.saturating_sub(initiated_at) + 1;
        if elapsed >= swap.timelock {
            Ok(true)
        } else {
            warn!(
                %txid,
                elapsed,
                wait_blocks = swap.timelock,
                "timelock not yet elapsed"
            );
            Ok(false)
        }
    }
}

fn parse_sats(amount: &str) -> SettlerResult<Amount> {
    amount
        .parse::<u64>()
        .map(Amount::from_sat)
        .map_err(|e| SettlerError::Transaction(format!("invalid sat amount {amount}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Chain, LegStatus};
    use bitcoin::hashes::Hash;
    use mockall::predicate::always;

    fn wallet_key() -> SecretKey {
        SecretKey::from_slice(&[0x11; 32]).unwrap()
    }

    fn leg(kind_amount: &str, timelock: u64) -> AtomicSwap {
        let secp = Secp256k1::new();
        let addr = |byte: u8| {
            let sk = SecretKey::from_slice(&[byte; 32]).unwrap();
            let pk = CompressedPublicKey(PublicKey::from_secret_key(&secp, &sk));
            Address::p2wpkh(&pk, Network::Regtest).to_string()
        };
        AtomicSwap {
            chain: Chain::BitcoinRegtest,
            asset: "primary".into(),
            amount: kind_amount.into(),
            timelock,
            initiator_address: addr(0x11),
            redeemer_address: addr(0x22),
            secret_hash: hex::encode([0xcd; 32]),
            secret: String::new(),
            status: LegStatus::Unknown,
            initiate_tx_hash: String::new(),
            redeem_tx_hash: String::new(),
            refund_tx_hash: String::new(),
        }
    }

    fn utxo(value: u64, index: u32) -> Utxo {
        Utxo {
            outpoint: OutPoint {
                txid: Txid::from_byte_array([index as u8; 32]),
                vout: index,
            },
            value: Amount::from_sat(value),
        }
    }

    #[tokio::test]
    async fn initiate_funds_htlc_and_broadcasts_once() {
        let mut chain = MockBitcoinChain::new();
        chain.expect_fee_rate().returning(|_| Ok(2));
        chain
            .expect_utxos()
            .with(always())
            .returning(|_| Ok(vec![utxo(500_000, 0), utxo(20_000, 1)]));
        chain
            .expect_broadcast()
            .times(1)
            .returning(|tx: &Transaction| {
                // one HTLC output plus change
                assert_eq!(tx.output.len(), 2);
                assert_eq!(tx.output[0].value, Amount::from_sat(100_000));
                assert!(tx.output[0].script_pubkey.is_p2wsh());
                Ok(tx.compute_txid())
            });

        let backend = BitcoinBackend::new(
            Arc::new(chain),
            Network::Regtest,
            wallet_key(),
            FeeTier::Medium,
        );
        let txid = backend.initiate(&leg("100000", 144)).await.unwrap();
        assert!(!txid.is_empty());
    }

    #[tokio::test]
    async fn initiate_fails_without_funds() {
        let mut chain = MockBitcoinChain::new();
        chain.expect_fee_rate().returning(|_| Ok(2));
        chain.expect_utxos().returning(|_| Ok(vec![utxo(100, 0)]));
        chain.expect_broadcast().never();

        let backend = BitcoinBackend::new(
            Arc::new(chain),
            Network::Regtest,
            wallet_key(),
            FeeTier::Medium,
        );
        let err = backend.initiate(&leg("100000", 144)).await.unwrap_err();
        assert!(matches!(err, SettlerError::InsufficientFunds { .. }));
    }

    #[tokio::test]
    async fn redeem_spends_htlc_with_secret_witness() {
        let mut chain = MockBitcoinChain::new();
        chain.expect_fee_rate().returning(|_| Ok(2));
        chain.expect_utxos().returning(|_| Ok(vec![utxo(100_000, 3)]));
        chain
            .expect_broadcast()
            .times(1)
            .returning(|tx: &Transaction| {
                assert_eq!(tx.input.len(), 1);
                let witness = &tx.input[0].witness;
                assert_eq!(witness.len(), 5);
                assert_eq!(witness.nth(2).unwrap(), &[0xeeu8; 32]);
                assert_eq!(witness.nth(3).unwrap(), &[1u8]);
                Ok(tx.compute_txid())
            });

        let backend = BitcoinBackend::new(
            Arc::new(chain),
            Network::Regtest,
            wallet_key(),
            FeeTier::Medium,
        );
        backend
            .redeem(&leg("100000", 144), &[0xee; 32])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn refund_sets_csv_sequence() {
        let mut chain = MockBitcoinChain::new();
        chain.expect_fee_rate().returning(|_| Ok(2));
        chain.expect_utxos().returning(|_| Ok(vec![utxo(100_000, 3)]));
        chain
            .expect_broadcast()
            .times(1)
            .returning(|tx: &Transaction| {
                assert_eq!(tx.input[0].sequence, Sequence::from_height(144));
                assert_eq!(tx.input[0].witness.len(), 4);
                Ok(tx.compute_txid())
            });

        let backend = BitcoinBackend::new(
            Arc::new(chain),
            Network::Regtest,
            wallet_key(),
            FeeTier::Medium,
        );
        backend.refund(&leg("100000", 144)).await.unwrap();
    }

    #[tokio::test]
    async fn expired_tracks_confirmation_height() {
        let mut chain = MockBitcoinChain::new();
        chain.expect_tx_height().returning(|_| Ok(Some(100)));
        chain.expect_tip_height().returning(|| Ok(150));

        let backend = BitcoinBackend::new(
            Arc::new(chain),
            Network::Regtest,
            wallet_key(),
            FeeTier::Medium,
        );
        let mut swap = leg("100000", 144);
        swap.initiate_tx_hash = Txid::from_byte_array([9u8; 32]).to_string();

        // 150 - 100 + 1 = 51 < 144
        assert!(!backend.expired(&swap).await.unwrap());

        swap.timelock = 51;
        assert!(backend.expired(&swap).await.unwrap());
    }

    #[tokio::test]
    async fn instant_wallet_takes_over_redeem() {
        let chain = MockBitcoinChain::new();
        let mut instant = MockInstantWallet::new();
        instant
            .expect_redeem_and_deposit()
            .times(1)
            .returning(|_, _| Ok("instant-tx".into()));

        let backend = BitcoinBackend::new(
            Arc::new(chain),
            Network::Regtest,
            wallet_key(),
            FeeTier::Medium,
        )
        .with_instant_wallet(Arc::new(instant));

        let tx = backend
            .redeem(&leg("100000", 144), &[0xee; 32])
            .await
            .unwrap();
        assert_eq!(tx, "instant-tx");
    }
}
