//! Remote order model shared with the order book
//!
//! Orders and their two swap legs are owned by the order book; this engine
//! only reads them. Leg statuses are inferred by the order book's chain
//! indexer, never mutated locally.

use crate::error::{SettlerError, SettlerResult};

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Chains the engine can settle on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Chain {
    Bitcoin,
    BitcoinTestnet,
    BitcoinRegtest,
    Ethereum,
    EthereumSepolia,
    Arbitrum,
}

/// Chain family determines which SwapBackend settles a leg
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChainFamily {
    Bitcoin,
    Evm,
}

impl Chain {
    pub fn family(&self) -> ChainFamily {
        match self {
            Chain::Bitcoin | Chain::BitcoinTestnet | Chain::BitcoinRegtest => ChainFamily::Bitcoin,
            Chain::Ethereum | Chain::EthereumSepolia | Chain::Arbitrum => ChainFamily::Evm,
        }
    }

    pub fn bitcoin_network(&self) -> Option<bitcoin::Network> {
        match self {
            Chain::Bitcoin => Some(bitcoin::Network::Bitcoin),
            Chain::BitcoinTestnet => Some(bitcoin::Network::Testnet),
            Chain::BitcoinRegtest => Some(bitcoin::Network::Regtest),
            _ => None,
        }
    }

    /// Numeric chain id for EVM signing
    pub fn evm_chain_id(&self) -> Option<u64> {
        match self {
            Chain::Ethereum => Some(1),
            Chain::EthereumSepolia => Some(11_155_111),
            Chain::Arbitrum => Some(42_161),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::Bitcoin => "bitcoin",
            Chain::BitcoinTestnet => "bitcoin_testnet",
            Chain::BitcoinRegtest => "bitcoin_regtest",
            Chain::Ethereum => "ethereum",
            Chain::EthereumSepolia => "ethereum_sepolia",
            Chain::Arbitrum => "arbitrum",
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Chain {
    type Err = SettlerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bitcoin" => Ok(Chain::Bitcoin),
            "bitcoin_testnet" => Ok(Chain::BitcoinTestnet),
            "bitcoin_regtest" => Ok(Chain::BitcoinRegtest),
            "ethereum" => Ok(Chain::Ethereum),
            "ethereum_sepolia" => Ok(Chain::EthereumSepolia),
            "arbitrum" => Ok(Chain::Arbitrum),
            other => Err(SettlerError::Config(format!("unknown chain: {other}"))),
        }
    }
}

/// Remote status of one swap leg, as observed by the order book's indexer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegStatus {
    Unknown,
    Detected,
    Initiated,
    Redeemed,
    Expired,
}

/// Remote order status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Created,
    Filled,
    Cancelled,
}

/// One chain-side half of an atomic swap order
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AtomicSwap {
    pub chain: Chain,
    /// "primary" for the chain's native asset, an ERC20 address otherwise
    pub asset: String,
    /// Decimal string; EVM amounts can exceed u64
    pub amount: String,
    /// Relative timelock: wait blocks (Bitcoin CSV) or block expiry (EVM)
    pub timelock: u64,
    pub initiator_address: String,
    pub redeemer_address: String,
    pub secret_hash: String,
    /// Hex secret, empty until revealed on-chain
    #[serde(default)]
    pub secret: String,
    pub status: LegStatus,
    #[serde(default)]
    pub initiate_tx_hash: String,
    #[serde(default)]
    pub redeem_tx_hash: String,
    #[serde(default)]
    pub refund_tx_hash: String,
}

/// A matched order from the order book
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: u64,
    pub secret_hash: String,
    /// Chain/asset pair encoding, e.g. "bitcoin-ethereum:0xA0b8..."
    pub order_pair: String,
    pub maker: String,
    pub taker: String,
    pub status: OrderStatus,
    pub initiator_leg: AtomicSwap,
    pub follower_leg: AtomicSwap,
}

impl Order {
    /// Minimal integrity check before reconciliation; malformed orders are
    /// skipped, never panicked on.
    pub fn validate(&self) -> SettlerResult<()> {
        if self.secret_hash.is_empty() {
            return Err(SettlerError::MalformedOrder {
                order_id: self.id,
                message: "empty secret hash".into(),
            });
        }
        for leg in [&self.initiator_leg, &self.follower_leg] {
            if leg.amount.is_empty() || leg.amount.parse::<u128>().is_err() {
                return Err(SettlerError::MalformedOrder {
                    order_id: self.id,
                    message: format!("unparseable amount on {} leg", leg.chain),
                });
            }
            if leg.initiator_address.is_empty() || leg.redeemer_address.is_empty() {
                return Err(SettlerError::MalformedOrder {
                    order_id: self.id,
                    message: format!("missing address on {} leg", leg.chain),
                });
            }
        }
        Ok(())
    }
}

/// The two chains of an order pair, parsed from "from-to[:token]"
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderPair {
    pub from: Chain,
    pub to: Chain,
    pub to_asset: Option<String>,
}

impl FromStr for OrderPair {
    type Err = SettlerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (pair, token) = match s.split_once(':') {
            Some((p, t)) => (p, Some(t.to_string())),
            None => (s, None),
        };
        let (from, to) = pair
            .split_once('-')
            .ok_or_else(|| SettlerError::Config(format!("malformed order pair: {s}")))?;
        Ok(OrderPair {
            from: from.parse()?,
            to: to.parse()?,
            to_asset: token,
        })
    }
}

impl fmt::Display for OrderPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.to_asset {
            Some(token) => write!(f, "{}-{}:{}", self.from, self.to, token),
            None => write!(f, "{}-{}", self.from, self.to),
        }
    }
}

/// Generate a fresh 32-byte swap secret
pub fn new_secret() -> [u8; 32] {
    let mut secret = [0u8; 32];
    OsRng.fill_bytes(&mut secret);
    secret
}

/// secret_hash = SHA-256(secret)
pub fn hash_secret(secret: &[u8]) -> [u8; 32] {
    Sha256::digest(secret).into()
}
