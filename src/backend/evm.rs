//! EVM swap backend
//!
//! Settles swap legs through the on-chain HTLC contract. The contract keys
//! swaps by `SHA256(secret_hash || initiator_address)`; this derivation must
//! match the contract's exactly. Chain access goes through the `EvmChain`
//! trait with provider failover behind it.

use crate::backend::SwapBackend;
use crate::config::EvmConfig;
use crate::error::{SettlerError, SettlerResult};
use crate::types::AtomicSwap;

use async_trait::async_trait;
use ethers::abi::{self, ParamType, Token};
use ethers::providers::{Http, Middleware, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{
    Address, BlockNumber, Bytes, Filter, Log, TransactionRequest, H256, U256,
};
use ethers::utils::keccak256;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Asset marker for the chain's native coin; anything else is an ERC20
/// contract address
const NATIVE_ASSET: &str = "primary";

/// Chain RPC capability consumed by the backend
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EvmChain: Send + Sync {
    fn chain_id(&self) -> u64;
    async fn block_number(&self) -> SettlerResult<u64>;
    async fn nonce(&self, address: Address) -> SettlerResult<U256>;
    async fn gas_price(&self) -> SettlerResult<U256>;
    async fn estimate_gas(&self, tx: &TypedTransaction) -> SettlerResult<U256>;
    async fn call(&self, tx: &TypedTransaction) -> SettlerResult<Bytes>;
    async fn send_raw(&self, raw: Bytes) -> SettlerResult<H256>;
    /// Block a transaction was mined in, None while pending
    async fn tx_block(&self, hash: H256) -> SettlerResult<Option<u64>>;
    async fn logs(&self, filter: &Filter) -> SettlerResult<Vec<Log>>;
}

pub struct EvmBackend {
    chain: Arc<dyn EvmChain>,
    wallet: LocalWallet,
    contract: Address,
    log_scan_step: u64,
    submit_timeout: Duration,
}

impl EvmBackend {
    pub fn new(
        chain: Arc<dyn EvmChain>,
        wallet: LocalWallet,
        contract: Address,
        log_scan_step: u64,
        submit_timeout: Duration,
    ) -> Self {
        let wallet = wallet.with_chain_id(chain.chain_id());
        Self {
            chain,
            wallet,
            contract,
            log_scan_step,
            submit_timeout,
        }
    }

    /// Build, sign, and submit one contract call
    async fn send_call(&self, to: Address, data: Vec<u8>, value: U256) -> SettlerResult<H256> {
        let from = self.wallet.address();
        let nonce = self.chain.nonce(from).await?;
        let gas_price = self.chain.gas_price().await?;

        let request = TransactionRequest::new()
            .from(from)
            .to(to)
            .data(data)
            .value(value)
            .nonce(nonce)
            .gas_price(gas_price)
            .chain_id(self.chain.chain_id());
        let mut tx: TypedTransaction = request.into();

        // Estimate failure means the call would revert
        let gas = self
            .chain
            .estimate_gas(&tx)
            .await
            .map_err(|e| SettlerError::Contract(format!("gas estimate: {e}")))?;
        tx.set_gas(gas * U256::from(120) / U256::from(100));

        let signature = self
            .wallet
            .sign_transaction(&tx)
            .await
            .map_err(|e| SettlerError::Wallet(format!("sign: {e}")))?;
        let raw = tx.rlp_signed(&signature);

        match timeout(self.submit_timeout, self.chain.send_raw(raw)).await {
            Ok(result) => result,
            Err(_) => Err(SettlerError::Timeout {
                operation: "evm transaction submit".into(),
            }),
        }
    }

    /// ERC20 allowance granted by this wallet to the HTLC contract
    async fn allowance(&self, token: Address) -> SettlerResult<U256> {
        let data = calldata(
            "allowance(address,address)",
            &[
                Token::Address(self.wallet.address()),
                Token::Address(self.contract),
            ],
        );
        let tx: TypedTransaction = TransactionRequest::new().to(token).data(data).into();
        let raw = self.chain.call(&tx).await?;
        let tokens = abi::decode(&[ParamType::Uint(256)], &raw)
            .map_err(|e| SettlerError::Contract(format!("allowance decode: {e}")))?;
        match tokens.into_iter().next() {
            Some(Token::Uint(amount)) => Ok(amount),
            _ => Err(SettlerError::Contract("allowance decode: empty".into())),
        }
    }

    async fn ensure_allowance(&self, token: Address, amount: U256) -> SettlerResult<()> {
        let current = self.allowance(token).await?;
        if current >= amount {
            return Ok(());
        }
        debug!(%token, %current, %amount, "allowance insufficient, approving");
        let data = calldata(
            "approve(address,uint256)",
            &[Token::Address(self.contract), Token::Uint(amount)],
        );
        let hash = self.send_call(token, data, U256::zero()).await?;
        info!(%token, tx = %format_hash(hash), "erc20 approve submitted");
        Ok(())
    }

    fn parse_amount(swap: &AtomicSwap) -> SettlerResult<U256> {
        U256::from_dec_str(&swap.amount)
            .map_err(|e| SettlerError::Transaction(format!("invalid amount {}: {e}", swap.amount)))
    }

    /// Block the leg's HTLC was funded in, per the initiate tx hash
    async fn initiated_at(&self, swap: &AtomicSwap) -> SettlerResult<Option<u64>> {
        if swap.initiate_tx_hash.is_empty() {
            return Ok(None);
        }
        let hash = parse_tx_hash(&swap.initiate_tx_hash)?;
        self.chain.tx_block(hash).await
    }
}

#[async_trait]
impl SwapBackend for EvmBackend {
    async fn initiate(&self, swap: &AtomicSwap) -> SettlerResult<String> {
        let amount = Self::parse_amount(swap)?;
        let redeemer = parse_address(&swap.redeemer_address)?;
        let secret_hash = decode_hash32(&swap.secret_hash)?;

        let value = if swap.asset == NATIVE_ASSET {
            amount
        } else {
            let token = parse_address(&swap.asset)?;
            self.ensure_allowance(token, amount).await?;
            U256::zero()
        };

        let data = calldata(
            "initiate(address,uint256,uint256,bytes32)",
            &[
                Token::Address(redeemer),
                Token::Uint(U256::from(swap.timelock)),
                Token::Uint(amount),
                Token::FixedBytes(secret_hash.to_vec()),
            ],
        );
        let hash = self.send_call(self.contract, data, value).await?;
        info!(secret_hash = %swap.secret_hash, tx = %format_hash(hash), "evm initiate submitted");
        Ok(format_hash(hash))
    }

    async fn redeem(&self, swap: &AtomicSwap, secret: &[u8]) -> SettlerResult<String> {
        let id = swap_id(swap)?;
        let data = calldata(
            "redeem(bytes32,bytes)",
            &[
                Token::FixedBytes(id.to_vec()),
                Token::Bytes(secret.to_vec()),
            ],
        );
        let hash = self.send_call(self.contract, data, U256::zero()).await?;
        info!(secret_hash = %swap.secret_hash, tx = %format_hash(hash), "evm redeem submitted");
        Ok(format_hash(hash))
    }

    async fn refund(&self, swap: &AtomicSwap) -> SettlerResult<String> {
        let id = swap_id(swap)?;
        let data = calldata("refund(bytes32)", &[Token::FixedBytes(id.to_vec())]);
        let hash = self.send_call(self.contract, data, U256::zero()).await?;
        info!(secret_hash = %swap.secret_hash, tx = %format_hash(hash), "evm refund submitted");
        Ok(format_hash(hash))
    }

    async fn expired(&self, swap: &AtomicSwap) -> SettlerResult<bool> {
        let Some(initiated_at) = self.initiated_at(swap).await? else {
            debug!(secret_hash = %swap.secret_hash, "initiation not mined, expiry not running");
            return Ok(false);
        };
        let latest = self.chain.block_number().await?;
        Ok(latest.saturating_sub(initiated_at) >= swap.timelock)
    }

    /// Scan `Redeemed` logs for this swap id in bounded block windows, from
    /// initiation to expiry.
    async fn reveal_secret(&self, swap: &AtomicSwap) -> SettlerResult<Vec<u8>> {
        let id = swap_id(swap)?;
        let Some(initiated_at) = self.initiated_at(swap).await? else {
            return Err(SettlerError::SecretNotFound {
                swap_id: hex::encode(id),
            });
        };
        let latest = self.chain.block_number().await?;
        let end = latest.min(initiated_at + swap.timelock);
        let topic0 = H256::from(keccak256("Redeemed(bytes32,bytes)"));

        let mut from = initiated_at;
        while from <= end {
            let to = end.min(from + self.log_scan_step - 1);
            let filter = Filter::new()
                .address(self.contract)
                .topic0(topic0)
                .topic1(H256::from(id))
                .from_block(from)
                .to_block(to);
            let logs = self.chain.logs(&filter).await?;
            if let Some(log) = logs.first() {
                let tokens = abi::decode(&[ParamType::Bytes], &log.data)
                    .map_err(|e| SettlerError::Contract(format!("redeemed log decode: {e}")))?;
                if let Some(Token::Bytes(secret)) = tokens.into_iter().next() {
                    debug!(swap_id = %hex::encode(id), block = ?log.block_number, "secret recovered from logs");
                    return Ok(secret);
                }
            }
            from = to + 1;
        }

        warn!(swap_id = %hex::encode(id), "no Redeemed event between initiation and expiry");
        Err(SettlerError::SecretNotFound {
            swap_id: hex::encode(id),
        })
    }
}

/// Contract swap id: SHA256(secret_hash || initiator_address)
pub fn swap_id(swap: &AtomicSwap) -> SettlerResult<[u8; 32]> {
    let secret_hash = decode_hash32(&swap.secret_hash)?;
    let initiator = parse_address(&swap.initiator_address)?;
    let mut hasher = Sha256::new();
    hasher.update(secret_hash);
    hasher.update(initiator.as_bytes());
    Ok(hasher.finalize().into())
}

fn calldata(signature: &str, tokens: &[Token]) -> Vec<u8> {
    let mut data = ethers::utils::id(signature).to_vec();
    data.extend(abi::encode(tokens));
    data
}

fn parse_address(s: &str) -> SettlerResult<Address> {
    s.parse()
        .map_err(|e| SettlerError::Contract(format!("invalid evm address {s}: {e}")))
}

fn parse_tx_hash(s: &str) -> SettlerResult<H256> {
    s.parse()
        .map_err(|e| SettlerError::Transaction(format!("invalid tx hash {s}: {e}")))
}

fn decode_hash32(s: &str) -> SettlerResult<[u8; 32]> {
    let bytes = hex::decode(s.trim_start_matches("0x"))
        .map_err(|e| SettlerError::Contract(format!("invalid hex hash {s}: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| SettlerError::Contract(format!("hash {s} is not 32 bytes")))
}

fn format_hash(hash: H256) -> String {
    format!("{hash:#x}")
}

/// Multi-provider RPC wrapper with automatic failover
pub struct EvmRpc {
    chain_id: u64,
    providers: Vec<Provider<Http>>,
    current: AtomicUsize,
}

impl EvmRpc {
    pub fn new(config: &EvmConfig) -> SettlerResult<Self> {
        let chain_id = config.chain.evm_chain_id().ok_or_else(|| {
            SettlerError::Config(format!("{} is not an EVM chain", config.chain))
        })?;

        let mut providers = Vec::new();
        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => providers.push(provider),
                Err(e) => warn!("Failed to create provider for {}: {}", url, e),
            }
        }
        if providers.is_empty() {
            return Err(SettlerError::ChainConnection {
                chain: config.chain.to_string(),
                message: "No valid RPC providers".into(),
            });
        }

        Ok(Self {
            chain_id,
            providers,
            current: AtomicUsize::new(0),
        })
    }

    fn http(&self) -> &Provider<Http> {
        let idx = self.current.load(Ordering::Relaxed);
        &self.providers[idx % self.providers.len()]
    }

    fn failover(&self) {
        let current = self.current.load(Ordering::Relaxed);
        let next = (current + 1) % self.providers.len();
        self.current.store(next, Ordering::Relaxed);
        warn!("evm chain {} failover to provider {}", self.chain_id, next);
    }

    fn connection_error(&self, e: impl std::fmt::Display) -> SettlerError {
        SettlerError::ChainConnection {
            chain: format!("evm:{}", self.chain_id),
            message: e.to_string(),
        }
    }
}

#[async_trait]
impl EvmChain for EvmRpc {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn block_number(&self) -> SettlerResult<u64> {
        for _ in 0..self.providers.len() {
            match self.http().get_block_number().await {
                Ok(block) => return Ok(block.as_u64()),
                Err(e) => {
                    warn!("block number query failed: {e}");
                    self.failover();
                }
            }
        }
        Err(self.connection_error("all providers failed"))
    }

    async fn nonce(&self, address: Address) -> SettlerResult<U256> {
        self.http()
            .get_transaction_count(address, Some(BlockNumber::Pending.into()))
            .await
            .map_err(|e| self.connection_error(e))
    }

    async fn gas_price(&self) -> SettlerResult<U256> {
        self.http()
            .get_gas_price()
            .await
            .map_err(|e| self.connection_error(e))
    }

    async fn estimate_gas(&self, tx: &TypedTransaction) -> SettlerResult<U256> {
        self.http()
            .estimate_gas(tx, None)
            .await
            .map_err(|e| SettlerError::Contract(e.to_string()))
    }

    async fn call(&self, tx: &TypedTransaction) -> SettlerResult<Bytes> {
        self.http()
            .call(tx, None)
            .await
            .map_err(|e| SettlerError::Contract(e.to_string()))
    }

    async fn send_raw(&self, raw: Bytes) -> SettlerResult<H256> {
        match self.http().send_raw_transaction(raw).await {
            Ok(pending) => Ok(pending.tx_hash()),
            Err(e) => {
                let message = e.to_string();
                if message.contains("insufficient funds") {
                    Err(SettlerError::InsufficientFunds {
                        chain: format!("evm:{}", self.chain_id),
                        have: "unknown".into(),
                        need: "unknown".into(),
                    })
                } else {
                    Err(SettlerError::Transaction(message))
                }
            }
        }
    }

    async fn tx_block(&self, hash: H256) -> SettlerResult<Option<u64>> {
        let receipt = self
            .http()
            .get_transaction_receipt(hash)
            .await
            .map_err(|e| self.connection_error(e))?;
        Ok(receipt.and_then(|r| r.block_number).map(|b| b.as_u64()))
    }

    async fn logs(&self, filter: &Filter) -> SettlerResult<Vec<Log>> {
        for _ in 0..self.providers.len() {
            match self.http().get_logs(filter).await {
                Ok(logs) => return Ok(logs),
                Err(e) => {
                    warn!("log query failed: {e}");
                    self.failover();
                }
            }
        }
        Err(self.connection_error("all providers failed to get logs"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Chain, LegStatus};
    use ethers::utils::rlp::Rlp;
    use mockall::predicate::always;

    fn wallet() -> LocalWallet {
        LocalWallet::from_bytes(&[0x42; 32]).unwrap()
    }

    fn contract() -> Address {
        Address::from_low_u64_be(0xc0ffee)
    }

    fn leg(asset: &str) -> AtomicSwap {
        AtomicSwap {
            chain: Chain::Ethereum,
            asset: asset.into(),
            amount: "200000".into(),
            timelock: 7200,
            initiator_address: format!("{:#x}", Address::from_low_u64_be(0xaaaa)),
            redeemer_address: format!("{:#x}", Address::from_low_u64_be(0xbbbb)),
            secret_hash: hex::encode([0xcd; 32]),
            secret: String::new(),
            status: LegStatus::Unknown,
            initiate_tx_hash: String::new(),
            redeem_tx_hash: String::new(),
            refund_tx_hash: String::new(),
        }
    }

    fn backend(chain: MockEvmChain) -> EvmBackend {
        EvmBackend::new(
            Arc::new(chain),
            wallet(),
            contract(),
            500,
            Duration::from_secs(60),
        )
    }

    fn expect_send_path(chain: &mut MockEvmChain, sends: usize) {
        chain.expect_chain_id().return_const(1u64);
        chain.expect_nonce().returning(|_| Ok(U256::from(7)));
        chain
            .expect_gas_price()
            .returning(|| Ok(U256::from(20_000_000_000u64)));
        chain
            .expect_estimate_gas()
            .returning(|_| Ok(U256::from(100_000)));
        chain
            .expect_send_raw()
            .times(sends)
            .returning(|_| Ok(H256::from_low_u64_be(0xfeed)));
    }

    /// Calldata of a signed legacy transaction
    fn raw_calldata(raw: &Bytes) -> Vec<u8> {
        Rlp::new(raw.as_ref()).val_at::<Vec<u8>>(5).unwrap()
    }

    #[test]
    fn swap_id_is_sha256_of_hash_and_initiator() {
        let swap = leg(NATIVE_ASSET);
        let mut hasher = Sha256::new();
        hasher.update([0xcd; 32]);
        hasher.update(Address::from_low_u64_be(0xaaaa).as_bytes());
        let expected: [u8; 32] = hasher.finalize().into();
        assert_eq!(swap_id(&swap).unwrap(), expected);
    }

    #[tokio::test]
    async fn native_initiate_attaches_value() {
        let mut chain = MockEvmChain::new();
        chain.expect_chain_id().return_const(1u64);
        chain.expect_nonce().returning(|_| Ok(U256::from(7)));
        chain
            .expect_gas_price()
            .returning(|| Ok(U256::from(20_000_000_000u64)));
        chain
            .expect_estimate_gas()
            .returning(|_| Ok(U256::from(100_000)));
        chain.expect_send_raw().times(1).returning(|raw| {
            let rlp = Rlp::new(raw.as_ref());
            // legacy layout: [nonce, gas_price, gas, to, value, data, v, r, s]
            let value: U256 = rlp.val_at(4).unwrap();
            assert_eq!(value, U256::from(200_000));
            let data: Vec<u8> = rlp.val_at(5).unwrap();
            assert_eq!(
                &data[..4],
                ethers::utils::id("initiate(address,uint256,uint256,bytes32)").as_slice()
            );
            Ok(H256::from_low_u64_be(0xfeed))
        });

        let tx = backend(chain).initiate(&leg(NATIVE_ASSET)).await.unwrap();
        assert!(tx.starts_with("0x"));
    }

    #[tokio::test]
    async fn erc20_initiate_approves_when_allowance_low() {
        let token = format!("{:#x}", Address::from_low_u64_be(0x70ce));
        let mut chain = MockEvmChain::new();
        // allowance query returns less than the amount
        chain.expect_call().with(always()).returning(|_| {
            Ok(Bytes::from(abi::encode(&[Token::Uint(U256::from(10))])))
        });
        // approve then initiate
        expect_send_path(&mut chain, 2);

        backend(chain).initiate(&leg(&token)).await.unwrap();
    }

    #[tokio::test]
    async fn erc20_initiate_skips_approve_when_covered() {
        let token = format!("{:#x}", Address::from_low_u64_be(0x70ce));
        let mut chain = MockEvmChain::new();
        chain.expect_call().returning(|_| {
            Ok(Bytes::from(abi::encode(&[Token::Uint(U256::MAX)])))
        });
        expect_send_path(&mut chain, 1);

        backend(chain).initiate(&leg(&token)).await.unwrap();
    }

    #[tokio::test]
    async fn redeem_encodes_id_and_secret() {
        let swap = leg(NATIVE_ASSET);
        let id = swap_id(&swap).unwrap();
        let secret = [0xee; 32];

        let mut chain = MockEvmChain::new();
        chain.expect_chain_id().return_const(1u64);
        chain.expect_nonce().returning(|_| Ok(U256::from(7)));
        chain
            .expect_gas_price()
            .returning(|| Ok(U256::from(20_000_000_000u64)));
        chain
            .expect_estimate_gas()
            .returning(|_| Ok(U256::from(100_000)));
        chain.expect_send_raw().times(1).returning(move |raw| {
            let data = raw_calldata(&raw);
            assert_eq!(
                &data[..4],
                ethers::utils::id("redeem(bytes32,bytes)").as_slice()
            );
            let tokens =
                abi::decode(&[ParamType::FixedBytes(32), ParamType::Bytes], &data[4..]).unwrap();
            assert_eq!(tokens[0], Token::FixedBytes(id.to_vec()));
            assert_eq!(tokens[1], Token::Bytes(secret.to_vec()));
            Ok(H256::from_low_u64_be(0xfeed))
        });

        backend(chain).redeem(&swap, &secret).await.unwrap();
    }

    #[tokio::test]
    async fn expired_requires_elapsed_blocks() {
        let mut chain = MockEvmChain::new();
        chain.expect_chain_id().return_const(1u64);
        chain.expect_tx_block().returning(|_| Ok(Some(1000)));
        chain.expect_block_number().returning(|| Ok(5000));

        let mut swap = leg(NATIVE_ASSET);
        swap.initiate_tx_hash = format!("{:#x}", H256::from_low_u64_be(1));

        // 5000 - 1000 = 4000 < 7200
        assert!(!backend(chain).expired(&swap).await.unwrap());

        let mut chain = MockEvmChain::new();
        chain.expect_chain_id().return_const(1u64);
        chain.expect_tx_block().returning(|_| Ok(Some(1000)));
        chain.expect_block_number().returning(|| Ok(8200));
        assert!(backend(chain).expired(&swap).await.unwrap());
    }

    #[tokio::test]
    async fn expired_is_false_while_unmined() {
        let mut chain = MockEvmChain::new();
        chain.expect_chain_id().return_const(1u64);

        // No initiate hash at all
        assert!(!backend(chain).expired(&leg(NATIVE_ASSET)).await.unwrap());
    }

    #[tokio::test]
    async fn reveal_secret_walks_windows() {
        let swap = {
            let mut s = leg(NATIVE_ASSET);
            s.timelock = 1200;
            s.initiate_tx_hash = format!("{:#x}", H256::from_low_u64_be(1));
            s
        };
        let secret = vec![0x5e; 32];
        let encoded = Bytes::from(abi::encode(&[Token::Bytes(secret.clone())]));

        let mut chain = MockEvmChain::new();
        chain.expect_chain_id().return_const(1u64);
        chain.expect_tx_block().returning(|_| Ok(Some(1000)));
        chain.expect_block_number().returning(|| Ok(10_000));

        // First 500-block window empty, second window has the event
        let mut window = 0;
        chain.expect_logs().times(2).returning(move |filter| {
            window += 1;
            if window == 1 {
                assert_eq!(
                    filter.block_option.get_from_block(),
                    Some(&BlockNumber::from(1000u64))
                );
                assert_eq!(
                    filter.block_option.get_to_block(),
                    Some(&BlockNumber::from(1499u64))
                );
                Ok(vec![])
            } else {
                Ok(vec![Log {
                    data: encoded.clone(),
                    block_number: Some(ethers::types::U64::from(1600u64)),
                    ..Default::default()
                }])
            }
        });

        let found = backend(chain).reveal_secret(&swap).await.unwrap();
        assert_eq!(found, secret);
    }

    #[tokio::test]
    async fn reveal_secret_fails_when_no_event() {
        let swap = {
            let mut s = leg(NATIVE_ASSET);
            s.timelock = 400;
            s.initiate_tx_hash = format!("{:#x}", H256::from_low_u64_be(1));
            s
        };

        let mut chain = MockEvmChain::new();
        chain.expect_chain_id().return_const(1u64);
        chain.expect_tx_block().returning(|_| Ok(Some(1000)));
        chain.expect_block_number().returning(|| Ok(10_000));
        chain.expect_logs().times(1).returning(|_| Ok(vec![]));

        assert!(matches!(
            backend(chain).reveal_secret(&swap).await.unwrap_err(),
            SettlerError::SecretNotFound { .. }
        ));
    }
}
