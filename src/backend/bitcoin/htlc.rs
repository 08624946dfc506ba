//! Bitcoin HTLC script construction and witness assembly
//!
//! The P2WSH witness script has two branches: the redeemer spends the IF
//! branch by revealing the SHA-256 preimage, the initiator spends the ELSE
//! branch after a CSV relative timelock of `wait_blocks`.

use crate::error::{SettlerError, SettlerResult};
use crate::types::AtomicSwap;

use bitcoin::hashes::Hash;
use bitcoin::opcodes::all::{
    OP_CHECKSIG, OP_CSV, OP_DROP, OP_DUP, OP_ELSE, OP_ENDIF, OP_EQUALVERIFY, OP_HASH160, OP_IF,
    OP_SHA256,
};
use bitcoin::script::Builder;
use bitcoin::secp256k1::{All, Message, Secp256k1, SecretKey};
use bitcoin::sighash::SighashCache;
use bitcoin::{
    Address, Amount, EcdsaSighashType, Network, ScriptBuf, Transaction, Witness,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HtlcScript {
    pub secret_hash: [u8; 32],
    pub redeemer_pubkey_hash: [u8; 20],
    pub initiator_pubkey_hash: [u8; 20],
    pub wait_blocks: u16,
}

impl HtlcScript {
    /// Build the HTLC parameters for one swap leg. Leg addresses must be
    /// P2WPKH so their pubkey hashes can be embedded in the script.
    pub fn from_swap(swap: &AtomicSwap, network: Network) -> SettlerResult<Self> {
        let secret_hash = decode_hash32(&swap.secret_hash)?;
        let initiator = parse_address(&swap.initiator_address, network)?;
        let redeemer = parse_address(&swap.redeemer_address, network)?;
        let wait_blocks = u16::try_from(swap.timelock).map_err(|_| SettlerError::Contract(
            format!("timelock {} exceeds the CSV height range", swap.timelock),
        ))?;

        Ok(Self {
            secret_hash,
            redeemer_pubkey_hash: p2wpkh_pubkey_hash(&redeemer)?,
            initiator_pubkey_hash: p2wpkh_pubkey_hash(&initiator)?,
            wait_blocks,
        })
    }

    pub fn witness_script(&self) -> ScriptBuf {
        Builder::new()
            .push_opcode(OP_IF)
            .push_opcode(OP_SHA256)
            .push_slice(self.secret_hash)
            .push_opcode(OP_EQUALVERIFY)
            .push_opcode(OP_DUP)
            .push_opcode(OP_HASH160)
            .push_slice(self.redeemer_pubkey_hash)
            .push_opcode(OP_ELSE)
            .push_int(self.wait_blocks as i64)
            .push_opcode(OP_CSV)
            .push_opcode(OP_DROP)
            .push_opcode(OP_DUP)
            .push_opcode(OP_HASH160)
            .push_slice(self.initiator_pubkey_hash)
            .push_opcode(OP_ENDIF)
            .push_opcode(OP_EQUALVERIFY)
            .push_opcode(OP_CHECKSIG)
            .into_script()
    }

    pub fn address(&self, network: Network) -> Address {
        Address::p2wsh(&self.witness_script(), network)
    }
}

/// Witness for the hashlock branch: `[sig, pubkey, secret, 0x01, script]`
pub fn redeem_witness(sig: &[u8], pubkey: &[u8; 33], secret: &[u8], script: &ScriptBuf) -> Witness {
    let mut witness = Witness::new();
    witness.push(sig);
    witness.push(pubkey);
    witness.push(secret);
    witness.push([1u8]);
    witness.push(script.as_bytes());
    witness
}

/// Witness for the timelock branch: `[sig, pubkey, <empty>, script]`; the
/// empty selector picks the ELSE branch and the input's sequence must carry
/// `wait_blocks` to satisfy the CSV check.
pub fn refund_witness(sig: &[u8], pubkey: &[u8; 33], script: &ScriptBuf) -> Witness {
    let mut witness = Witness::new();
    witness.push(sig);
    witness.push(pubkey);
    witness.push([0u8; 0]);
    witness.push(script.as_bytes());
    witness
}

/// Witness for a P2WPKH wallet input: `[sig, pubkey]`
pub fn p2wpkh_witness(sig: &[u8], pubkey: &[u8; 33]) -> Witness {
    let mut witness = Witness::new();
    witness.push(sig);
    witness.push(pubkey);
    witness
}

/// DER signature with the sighash-type byte for a P2WSH input
pub fn sign_p2wsh_input(
    secp: &Secp256k1<All>,
    tx: &Transaction,
    input_index: usize,
    witness_script: &ScriptBuf,
    value: Amount,
    key: &SecretKey,
) -> SettlerResult<Vec<u8>> {
    let mut cache = SighashCache::new(tx);
    let sighash = cache
        .p2wsh_signature_hash(input_index, witness_script, value, EcdsaSighashType::All)
        .map_err(|e| SettlerError::Transaction(format!("sighash input {input_index}: {e}")))?;
    Ok(finish_signature(secp, sighash.to_byte_array(), key))
}

/// DER signature with the sighash-type byte for a P2WPKH input
pub fn sign_p2wpkh_input(
    secp: &Secp256k1<All>,
    tx: &Transaction,
    input_index: usize,
    script_pubkey: &ScriptBuf,
    value: Amount,
    key: &SecretKey,
) -> SettlerResult<Vec<u8>> {
    let mut cache = SighashCache::new(tx);
    let sighash = cache
        .p2wpkh_signature_hash(input_index, script_pubkey, value, EcdsaSighashType::All)
        .map_err(|e| SettlerError::Transaction(format!("sighash input {input_index}: {e}")))?;
    Ok(finish_signature(secp, sighash.to_byte_array(), key))
}

fn finish_signature(secp: &Secp256k1<All>, digest: [u8; 32], key: &SecretKey) -> Vec<u8> {
    let msg = Message::from_digest(digest);
    let sig = secp.sign_ecdsa(&msg, key);
    let mut bytes = sig.serialize_der().to_vec();
    bytes.push(EcdsaSighashType::All.to_u32() as u8);
    bytes
}

pub fn parse_address(s: &str, network: Network) -> SettlerResult<Address> {
    s.parse::<Address<bitcoin::address::NetworkUnchecked>>()
        .map_err(|e| SettlerError::Contract(format!("invalid bitcoin address {s}: {e}")))?
        .require_network(network)
        .map_err(|e| SettlerError::Contract(format!("address {s} on wrong network: {e}")))
}

/// Extract the 20-byte pubkey hash from a P2WPKH address
fn p2wpkh_pubkey_hash(address: &Address) -> SettlerResult<[u8; 20]> {
    let spk = address.script_pubkey();
    let bytes = spk.as_bytes();
    if bytes.len() != 22 || bytes[0] != 0x00 || bytes[1] != 0x14 {
        return Err(SettlerError::Contract(format!(
            "expected P2WPKH address, got script {}",
            hex::encode(bytes)
        )));
    }
    let mut out = [0u8; 20];
    out.copy_from_slice(&bytes[2..22]);
    Ok(out)
}

pub fn decode_hash32(s: &str) -> SettlerResult<[u8; 32]> {
    let bytes = hex::decode(s.trim_start_matches("0x"))
        .map_err(|e| SettlerError::Contract(format!("invalid hex hash {s}: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| SettlerError::Contract(format!("hash {s} is not 32 bytes")))
}

pub fn decode_txid(s: &str) -> SettlerResult<bitcoin::Txid> {
    s.parse()
        .map_err(|e| SettlerError::Transaction(format!("invalid txid {s}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::PublicKey;
    use bitcoin::CompressedPublicKey;

    fn test_address(byte: u8) -> Address {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[byte; 32]).unwrap();
        let pk = CompressedPublicKey(PublicKey::from_secret_key(&secp, &sk));
        Address::p2wpkh(&pk, Network::Regtest)
    }

    fn test_script() -> HtlcScript {
        HtlcScript {
            secret_hash: [0xab; 32],
            redeemer_pubkey_hash: p2wpkh_pubkey_hash(&test_address(1)).unwrap(),
            initiator_pubkey_hash: p2wpkh_pubkey_hash(&test_address(2)).unwrap(),
            wait_blocks: 144,
        }
    }

    #[test]
    fn script_has_both_branches() {
        let script = test_script().witness_script();
        let asm = script.to_asm_string();
        assert!(asm.contains("OP_IF"));
        assert!(asm.contains("OP_SHA256"));
        assert!(asm.contains("OP_CSV"));
        assert!(asm.contains("OP_ENDIF"));
        // both pubkey hashes are embedded
        assert!(asm.contains(&hex::encode(test_script().redeemer_pubkey_hash)));
        assert!(asm.contains(&hex::encode(test_script().initiator_pubkey_hash)));
    }

    #[test]
    fn address_is_deterministic() {
        let a = test_script().address(Network::Regtest);
        let b = test_script().address(Network::Regtest);
        assert_eq!(a, b);

        let mut other = test_script();
        other.wait_blocks = 288;
        assert_ne!(a, other.address(Network::Regtest));
    }

    #[test]
    fn witness_layouts() {
        let script = test_script().witness_script();
        let pubkey = [2u8; 33];

        let redeem = redeem_witness(&[1, 2, 3], &pubkey, &[9u8; 32], &script);
        assert_eq!(redeem.len(), 5);
        assert_eq!(redeem.nth(3).unwrap(), &[1u8]);
        assert_eq!(redeem.nth(4).unwrap(), script.as_bytes());

        let refund = refund_witness(&[1, 2, 3], &pubkey, &script);
        assert_eq!(refund.len(), 4);
        assert_eq!(refund.nth(2).unwrap(), &[] as &[u8]);
        assert_eq!(refund.nth(3).unwrap(), script.as_bytes());
    }

    #[test]
    fn from_swap_rejects_oversized_timelock() {
        let swap = AtomicSwap {
            chain: crate::types::Chain::BitcoinRegtest,
            asset: "primary".into(),
            amount: "100000".into(),
            timelock: 70_000,
            initiator_address: test_address(2).to_string(),
            redeemer_address: test_address(1).to_string(),
            secret_hash: hex::encode([0xab; 32]),
            secret: String::new(),
            status: crate::types::LegStatus::Unknown,
            initiate_tx_hash: String::new(),
            redeem_tx_hash: String::new(),
            refund_tx_hash: String::new(),
        };
        assert!(HtlcScript::from_swap(&swap, Network::Regtest).is_err());

        let mut ok = swap;
        ok.timelock = 144;
        let htlc = HtlcScript::from_swap(&ok, Network::Regtest).unwrap();
        assert_eq!(htlc.wait_blocks, 144);
        assert_eq!(htlc.secret_hash, [0xab; 32]);
    }
}
