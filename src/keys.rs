//! Deterministic signing keys
//!
//! Key material is derived from a seed per (chain, account, selector) and
//! resolved once into a chain-family-specific variant. The cache is an owned
//! object passed to whoever builds the backends; there is no process-wide
//! key state.

use crate::error::{SettlerError, SettlerResult};
use crate::types::{Chain, ChainFamily};

use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use bitcoin::CompressedPublicKey;
use dashmap::DashMap;
use ethers::signers::{LocalWallet, Signer};
use sha2::{Digest, Sha256};

/// Chain-family-tagged signing material
#[derive(Clone)]
pub enum SignerKey {
    Btc(SecretKey),
    Evm(LocalWallet),
}

pub struct KeyCache {
    seed: [u8; 32],
    cache: DashMap<(Chain, String, u32), SignerKey>,
}

impl KeyCache {
    pub fn new(seed: [u8; 32]) -> Self {
        Self {
            seed,
            cache: DashMap::new(),
        }
    }

    /// Resolve the signing key for (chain, account, selector), deriving and
    /// caching on first use.
    pub fn key(&self, chain: Chain, account: &str, selector: u32) -> SettlerResult<SignerKey> {
        let cache_key = (chain, account.to_string(), selector);
        if let Some(key) = self.cache.get(&cache_key) {
            return Ok(key.clone());
        }

        let bytes = self.derive_bytes(chain, account, selector);
        let key = match chain.family() {
            ChainFamily::Bitcoin => {
                let sk = SecretKey::from_slice(&bytes)
                    .map_err(|e| SettlerError::Wallet(format!("derived key invalid: {e}")))?;
                SignerKey::Btc(sk)
            }
            ChainFamily::Evm => {
                let wallet = LocalWallet::from_bytes(&bytes)
                    .map_err(|e| SettlerError::Wallet(format!("derived key invalid: {e}")))?;
                SignerKey::Evm(wallet)
            }
        };

        self.cache.insert(cache_key, key.clone());
        Ok(key)
    }

    pub fn btc_key(&self, chain: Chain, account: &str, selector: u32) -> SettlerResult<SecretKey> {
        match self.key(chain, account, selector)? {
            SignerKey::Btc(sk) => Ok(sk),
            SignerKey::Evm(_) => Err(SettlerError::Wallet(format!(
                "{chain} resolved an EVM key for a Bitcoin leg"
            ))),
        }
    }

    pub fn evm_wallet(
        &self,
        chain: Chain,
        account: &str,
        selector: u32,
    ) -> SettlerResult<LocalWallet> {
        match self.key(chain, account, selector)? {
            SignerKey::Evm(wallet) => Ok(wallet),
            SignerKey::Btc(_) => Err(SettlerError::Wallet(format!(
                "{chain} resolved a Bitcoin key for an EVM leg"
            ))),
        }
    }

    /// The address this account uses on `chain`
    pub fn address(&self, chain: Chain, account: &str, selector: u32) -> SettlerResult<String> {
        match self.key(chain, account, selector)? {
            SignerKey::Btc(sk) => {
                let network = chain
                    .bitcoin_network()
                    .ok_or_else(|| SettlerError::Wallet(format!("{chain} is not a Bitcoin chain")))?;
                let secp = Secp256k1::new();
                let pubkey = CompressedPublicKey(PublicKey::from_secret_key(&secp, &sk));
                Ok(bitcoin::Address::p2wpkh(&pubkey, network).to_string())
            }
            SignerKey::Evm(wallet) => Ok(format!("{:#x}", wallet.address())),
        }
    }

    fn derive_bytes(&self, chain: Chain, account: &str, selector: u32) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.seed);
        hasher.update(chain.as_str().as_bytes());
        hasher.update(account.as_bytes());
        hasher.update(selector.to_be_bytes());
        hasher.finalize().into()
    }
}
