use std::collections::HashMap;

use crypto::digest::Digest;
use crypto::ed25519;
use crypto::sha2::Sha256;
use failure::format_err;
use log::{error, info};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::errors::{NodeError, Result};
use crate::tx::{TXInput, TXOutput};
use crate::utxoset::UTXOSet;
use crate::wallet::{hash_pub_key, Wallet};

/// Block reward paid by every coinbase transaction.
pub const SUBSIDY: i32 = 10;

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, PartialEq)]
pub struct Transaction {
    /// hash of the canonical byte form, signatures excluded
    pub id: String,
    pub vin: Vec<TXInput>,
    pub vout: Vec<TXOutput>,
}

impl Transaction {
    /// Builds and signs a spend of `amount` from the wallet's outputs to
    /// `to`, returning change to the sender. Inputs are selected greedily in
    /// the UTXO view's iteration order.
    pub fn new_utxo(
        wallet: &Wallet,
        to: &str,
        amount: i32,
        utxo: &UTXOSet,
    ) -> Result<Transaction> {
        if amount <= 0 {
            return Err(format_err!("send amount must be positive, got {}", amount));
        }
        let mut pub_key_hash = wallet.public_key.clone();
        hash_pub_key(&mut pub_key_hash);

        let (accumulated, spendable) = utxo.find_spendable_outputs(&pub_key_hash, amount)?;
        if accumulated < amount {
            error!(
                "spend of {} rejected: only {} unspent",
                amount, accumulated
            );
            return Err(NodeError::InsufficientFunds {
                available: accumulated,
                required: amount,
            }
            .into());
        }

        let mut vin = Vec::new();
        for (txid, outs) in spendable {
            for out_idx in outs {
                vin.push(TXInput {
                    txid: txid.clone(),
                    vout: out_idx,
                    signature: Vec::new(),
                    pub_key: wallet.public_key.clone(),
                });
            }
        }

        let mut vout = vec![TXOutput::new(amount, to)?];
        if accumulated > amount {
            // change comes back to the sender's own pubkey-hash
            vout.push(TXOutput::new_with_key_hash(
                accumulated - amount,
                pub_key_hash,
            ));
        }

        let mut tx = Transaction {
            id: String::new(),
            vin,
            vout,
        };
        tx.id = tx.hash()?;
        utxo.blockchain.sign_transaction(&mut tx, &wallet.secret_key)?;
        Ok(tx)
    }

    /// Reward-issuing transaction with no real predecessor. An empty `data`
    /// is replaced with a random salt so repeated rewards to one miner never
    /// share an ID.
    pub fn new_coinbase(to: String, mut data: String) -> Result<Transaction> {
        info!("new coinbase transaction to {}", to);
        if data.is_empty() {
            let mut salt = [0u8; 20];
            OsRng.fill_bytes(&mut salt);
            data = salt.iter().map(|b| format!("{:02x}", b)).collect();
        }
        let mut tx = Transaction {
            id: String::new(),
            vin: vec![TXInput {
                txid: String::new(),
                vout: -1,
                signature: Vec::new(),
                pub_key: data.into_bytes(),
            }],
            vout: vec![TXOutput::new(SUBSIDY, &to)?],
        };
        tx.id = tx.hash()?;
        Ok(tx)
    }

    pub fn is_coinbase(&self) -> bool {
        self.vin.len() == 1 && self.vin[0].txid.is_empty() && self.vin[0].vout == -1
    }

    /// Hash of the transaction with the id field cleared.
    pub fn hash(&self) -> Result<String> {
        let mut copy = self.clone();
        copy.id = String::new();
        let data = bincode::serialize(&copy)?;
        let mut hasher = Sha256::new();
        hasher.input(&data);
        Ok(hasher.result_str())
    }

    /// Signs every input against a digest of the trimmed transaction with
    /// only the referenced previous output's pubkey-hash filled in, so each
    /// input's signature is independent of the others' signature bytes.
    pub fn sign(
        &mut self,
        private_key: &[u8],
        prev_txs: &HashMap<String, Transaction>,
    ) -> Result<()> {
        if self.is_coinbase() {
            return Ok(());
        }
        let mut tx_copy = self.trimmed_copy();
        for in_id in 0..tx_copy.vin.len() {
            let prev_out = referenced_output(&tx_copy.vin[in_id], prev_txs, &self.id)?;
            tx_copy.vin[in_id].signature.clear();
            tx_copy.vin[in_id].pub_key = prev_out.pub_key_hash.clone();
            tx_copy.id = tx_copy.hash()?;
            tx_copy.vin[in_id].pub_key = Vec::new();
            let signature = ed25519::signature(tx_copy.id.as_bytes(), private_key);
            self.vin[in_id].signature = signature.to_vec();
        }
        Ok(())
    }

    /// Recomputes each input's digest and checks the signature against the
    /// supplied public key, and the key against the output it claims to
    /// spend. Any one bad input fails the whole transaction.
    pub fn verify(&self, prev_txs: &HashMap<String, Transaction>) -> Result<bool> {
        if self.is_coinbase() {
            return Ok(true);
        }
        let mut tx_copy = self.trimmed_copy();
        for in_id in 0..self.vin.len() {
            let vin = &self.vin[in_id];
            let prev_out = referenced_output(vin, prev_txs, &self.id)?;
            if !vin.uses_key(&prev_out.pub_key_hash) {
                return Ok(false);
            }
            tx_copy.vin[in_id].signature.clear();
            tx_copy.vin[in_id].pub_key = prev_out.pub_key_hash.clone();
            tx_copy.id = tx_copy.hash()?;
            tx_copy.vin[in_id].pub_key = Vec::new();
            if !ed25519::verify(tx_copy.id.as_bytes(), &vin.pub_key, &vin.signature) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn trimmed_copy(&self) -> Transaction {
        let vin = self
            .vin
            .iter()
            .map(|v| TXInput {
                txid: v.txid.clone(),
                vout: v.vout,
                signature: Vec::new(),
                pub_key: Vec::new(),
            })
            .collect();
        let vout = self
            .vout
            .iter()
            .map(|v| TXOutput {
                value: v.value,
                pub_key_hash: v.pub_key_hash.clone(),
            })
            .collect();
        Transaction {
            id: self.id.clone(),
            vin,
            vout,
        }
    }
}

fn referenced_output<'a>(
    vin: &TXInput,
    prev_txs: &'a HashMap<String, Transaction>,
    tx_id: &str,
) -> Result<&'a TXOutput> {
    let prev_tx = prev_txs.get(&vin.txid).ok_or_else(|| NodeError::InvalidTransaction {
        id: tx_id.to_string(),
        reason: format!("input references unknown transaction {}", vin.txid),
    })?;
    prev_tx
        .vout
        .get(vin.vout as usize)
        .ok_or_else(|| NodeError::InvalidTransaction {
            id: tx_id.to_string(),
            reason: format!(
                "input references output {} of {}, which has only {} outputs",
                vin.vout,
                vin.txid,
                prev_tx.vout.len()
            ),
        }
        .into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::Wallets;

    fn wallet_pair() -> (Wallet, Wallet, String) {
        let dir = tempfile::tempdir().unwrap();
        let mut ws = Wallets::new(dir.path()).unwrap();
        let from = ws.create_wallet();
        let to = ws.create_wallet();
        (
            ws.get_wallet(&from).unwrap().clone(),
            ws.get_wallet(&to).unwrap().clone(),
            to,
        )
    }

    fn spend_of_coinbase(sender: &Wallet, to_addr: &str) -> (Transaction, HashMap<String, Transaction>) {
        let prev = Transaction::new_coinbase(sender.get_address(), String::new()).unwrap();
        let mut tx = Transaction {
            id: String::new(),
            vin: vec![TXInput {
                txid: prev.id.clone(),
                vout: 0,
                signature: Vec::new(),
                pub_key: sender.public_key.clone(),
            }],
            vout: vec![TXOutput::new(SUBSIDY, to_addr).unwrap()],
        };
        tx.id = tx.hash().unwrap();
        let mut prev_txs = HashMap::new();
        prev_txs.insert(prev.id.clone(), prev);
        (tx, prev_txs)
    }

    #[test]
    fn test_sign_and_verify() {
        let (sender, _, to_addr) = wallet_pair();
        let (mut tx, prev_txs) = spend_of_coinbase(&sender, &to_addr);
        tx.sign(&sender.secret_key, &prev_txs).unwrap();
        assert!(tx.verify(&prev_txs).unwrap());
    }

    #[test]
    fn test_any_flipped_signature_byte_fails_verify() {
        let (sender, _, to_addr) = wallet_pair();
        let (mut tx, prev_txs) = spend_of_coinbase(&sender, &to_addr);
        tx.sign(&sender.secret_key, &prev_txs).unwrap();

        for byte in 0..tx.vin[0].signature.len() {
            let mut tampered = tx.clone();
            tampered.vin[0].signature[byte] ^= 0x01;
            assert!(
                !tampered.verify(&prev_txs).unwrap(),
                "flipped signature byte {} still verified",
                byte
            );
        }
    }

    #[test]
    fn test_wrong_key_fails_verify() {
        let (sender, stranger, to_addr) = wallet_pair();
        let (mut tx, prev_txs) = spend_of_coinbase(&sender, &to_addr);
        // signed by someone who does not own the referenced output
        tx.vin[0].pub_key = stranger.public_key.clone();
        tx.sign(&stranger.secret_key, &prev_txs).unwrap();
        assert!(!tx.verify(&prev_txs).unwrap());
    }

    #[test]
    fn test_coinbase_structure() {
        let (sender, _, to_addr) = wallet_pair();
        let cb = Transaction::new_coinbase(to_addr, String::new()).unwrap();
        assert!(cb.is_coinbase());
        assert_eq!(cb.vout[0].value, SUBSIDY);

        let (tx, _) = spend_of_coinbase(&sender, &sender.get_address());
        assert!(!tx.is_coinbase());
    }

    #[test]
    fn test_repeated_coinbase_ids_differ() {
        let (_, _, to_addr) = wallet_pair();
        let a = Transaction::new_coinbase(to_addr.clone(), String::new()).unwrap();
        let b = Transaction::new_coinbase(to_addr, String::new()).unwrap();
        assert_ne!(a.id, b.id);
    }
}
