use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use crypto::digest::Digest;
use crypto::sha2::Sha256;
use failure::format_err;
use log::info;
use merkle_cbt::merkle_tree::Merge;
use merkle_cbt::CBMT;

use crate::errors::Result;
use crate::transaction::Transaction;

/// Fixed difficulty: a header hash must be below 2^(256 - TARGET_BITS).
/// There is no retargeting in this design.
pub const TARGET_BITS: u32 = 16;

// how many nonces are tried between cancellation polls
const POW_CANCEL_INTERVAL: i32 = 4096;

/// Cooperative stop signal for an in-flight mining run. Cloned into the
/// mining task; cancelling preempts the nonce search at the next poll.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Block {
    timestamp: u128,
    transactions: Vec<Transaction>,
    prev_block_hash: String,
    hash: String,
    height: i32,
    nonce: i32,
}

impl Block {
    /// Mines a block over `transactions` on top of `prev_block_hash`.
    /// Returns `None` when the cancel token preempts the nonce search.
    pub fn mine(
        transactions: Vec<Transaction>,
        prev_block_hash: String,
        height: i32,
        cancel: &CancelToken,
    ) -> Result<Option<Block>> {
        let timestamp = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)?
            .as_millis();
        let mut block = Block {
            timestamp,
            transactions,
            prev_block_hash,
            hash: String::new(),
            height,
            nonce: 0,
        };
        if !block.run_proof_of_work(cancel)? {
            return Ok(None);
        }
        Ok(Some(block))
    }

    pub fn new_genesis_block(coinbase: Transaction) -> Result<Block> {
        Block::mine(vec![coinbase], String::new(), 0, &CancelToken::new())?
            .ok_or_else(|| format_err!("genesis mining interrupted"))
    }

    /// Recomputes the single header hash at the stored nonce and checks both
    /// the proof-of-work inequality and that the stated hash is honest.
    pub fn validate(&self) -> Result<bool> {
        let (raw, hex) = self.hash_attempt()?;
        Ok(&raw[..] < &pow_target()[..] && hex == self.hash)
    }

    fn run_proof_of_work(&mut self, cancel: &CancelToken) -> Result<bool> {
        info!("mining block at height {}", self.height);
        let target = pow_target();
        loop {
            if self.nonce % POW_CANCEL_INTERVAL == 0 && cancel.is_cancelled() {
                info!("mining cancelled at height {}", self.height);
                return Ok(false);
            }
            let (raw, hex) = self.hash_attempt()?;
            if &raw[..] < &target[..] {
                self.hash = hex;
                return Ok(true);
            }
            self.nonce += 1;
        }
    }

    fn hash_attempt(&self) -> Result<([u8; 32], String)> {
        let data = self.prepare_hash_data()?;
        let mut hasher = Sha256::new();
        hasher.input(&data);
        let mut raw = [0u8; 32];
        hasher.result(&mut raw);
        Ok((raw, hasher.result_str()))
    }

    fn prepare_hash_data(&self) -> Result<Vec<u8>> {
        let content = (
            &self.prev_block_hash,
            self.hash_transactions()?,
            self.timestamp,
            TARGET_BITS,
            self.nonce,
        );
        Ok(bincode::serialize(&content)?)
    }

    // merkle root over the transaction hashes
    fn hash_transactions(&self) -> Result<Vec<u8>> {
        let mut leaves = Vec::new();
        for tx in &self.transactions {
            leaves.push(tx.hash()?.as_bytes().to_owned());
        }
        Ok(CBMT::<Vec<u8>, MergeSha256>::build_merkle_root(&leaves))
    }

    pub fn get_transactions(&self) -> &Vec<Transaction> {
        &self.transactions
    }

    pub fn get_hash(&self) -> String {
        self.hash.clone()
    }

    pub fn get_prev_hash(&self) -> String {
        self.prev_block_hash.clone()
    }

    pub fn get_height(&self) -> i32 {
        self.height
    }

    pub fn get_timestamp(&self) -> u128 {
        self.timestamp
    }
}

/// 2^(256 - TARGET_BITS) as 32 big-endian bytes; a hash wins by comparing
/// lexicographically below it.
fn pow_target() -> [u8; 32] {
    let mut target = [0u8; 32];
    let bit = 256 - TARGET_BITS;
    target[((255 - bit) / 8) as usize] = 1 << (bit % 8);
    target
}

struct MergeSha256;

impl Merge for MergeSha256 {
    type Item = Vec<u8>;

    fn merge(left: &Self::Item, right: &Self::Item) -> Self::Item {
        let mut data = left.clone();
        data.extend_from_slice(right);
        let mut hasher = Sha256::new();
        hasher.input(&data);
        let mut out = [0u8; 32];
        hasher.result(&mut out);
        out.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coinbase() -> Transaction {
        let dir = tempfile::tempdir().unwrap();
        let mut ws = crate::wallet::Wallets::new(dir.path()).unwrap();
        let address = ws.create_wallet();
        Transaction::new_coinbase(address, String::new()).unwrap()
    }

    fn hex_to_bytes(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    #[test]
    fn test_mined_block_satisfies_target() {
        let block = Block::new_genesis_block(coinbase()).unwrap();
        assert!(block.validate().unwrap());

        let raw = hex_to_bytes(&block.get_hash());
        assert!(&raw[..] < &pow_target()[..]);
        assert_eq!(block.get_height(), 0);
        assert_eq!(block.get_prev_hash(), "");
    }

    #[test]
    fn test_tampered_nonce_fails_validation() {
        let mut block = Block::new_genesis_block(coinbase()).unwrap();
        block.nonce += 1;
        assert!(!block.validate().unwrap());
    }

    #[test]
    fn test_tampered_hash_fails_validation() {
        let mut block = Block::new_genesis_block(coinbase()).unwrap();
        block.hash = format!("{:0>64}", "f");
        assert!(!block.validate().unwrap());
    }

    #[test]
    fn test_serde_round_trip_preserves_header() {
        let block = Block::new_genesis_block(coinbase()).unwrap();
        let bytes = bincode::serialize(&block).unwrap();
        let decoded: Block = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded.get_hash(), block.get_hash());
        assert_eq!(decoded.get_height(), block.get_height());
        assert_eq!(decoded.get_prev_hash(), block.get_prev_hash());
        assert_eq!(decoded.get_transactions(), block.get_transactions());
        assert!(decoded.validate().unwrap());
    }

    #[test]
    fn test_cancelled_token_preempts_mining() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let mined = Block::mine(vec![coinbase()], String::new(), 0, &cancel).unwrap();
        assert!(mined.is_none());
    }
}
