use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use failure::format_err;
use log::{debug, info, warn};
use sled::{Db, Tree};

use crate::block::{Block, CancelToken};
use crate::errors::{NodeError, Result};
use crate::transaction::Transaction;
use crate::tx::TXOutputs;

const BLOCKS_TREE: &str = "blocks";
const CHAINSTATE_TREE: &str = "chainstate";
const TIP_KEY: &str = "l";

const GENESIS_COINBASE_DATA: &str =
    "The Times 03/Jan/2009 Chancellor on brink of second bailout for banks";

/// What `add_block` did with an incoming block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    /// extended the current tip
    Appended,
    /// a taller connected branch replaced the active chain
    Reorganized,
    /// stored as a side branch, active chain unchanged
    Fork,
    /// already present
    Known,
}

/// Owned handle over the persistent chain: the `blocks` and `chainstate`
/// buckets plus the in-memory tip. Appends are serialized through the tip
/// write lock; everything else reads concurrently.
#[derive(Debug, Clone)]
pub struct Blockchain {
    db: Db,
    blocks: Tree,
    chainstate: Tree,
    tip: Arc<RwLock<String>>,
}

pub struct BlockchainIter<'a> {
    current_hash: String,
    bc: &'a Blockchain,
}

impl Blockchain {
    /// Opens an existing chain. The tip pointer must already exist.
    pub fn open(data_dir: &Path) -> Result<Blockchain> {
        let db = sled::open(data_dir.join("chain"))?;
        let blocks = db.open_tree(BLOCKS_TREE)?;
        let chainstate = db.open_tree(CHAINSTATE_TREE)?;
        let tip = chainstate
            .get(TIP_KEY)?
            .ok_or_else(|| format_err!("no existing blockchain in {:?}; create one first", data_dir))?;
        let lasthash = String::from_utf8(tip.to_vec())?;
        // a tip pointer without its block is an impossible state, not a
        // recoverable error
        blocks
            .get(&lasthash)
            .expect("chainstate is unreadable")
            .expect("chainstate tip points at a missing block");
        debug!("opened blockchain at tip {}", lasthash);
        Ok(Blockchain {
            db,
            blocks,
            chainstate,
            tip: Arc::new(RwLock::new(lasthash)),
        })
    }

    /// Creates a new chain whose genesis block pays `address` the first
    /// coinbase reward. Refuses to overwrite an existing chain.
    pub fn create(data_dir: &Path, address: &str) -> Result<Blockchain> {
        info!("creating new blockchain in {:?}", data_dir);
        let db = sled::open(data_dir.join("chain"))?;
        let blocks = db.open_tree(BLOCKS_TREE)?;
        let chainstate = db.open_tree(CHAINSTATE_TREE)?;
        if chainstate.get(TIP_KEY)?.is_some() {
            return Err(format_err!("blockchain already exists in {:?}", data_dir));
        }
        let cbtx =
            Transaction::new_coinbase(address.to_string(), GENESIS_COINBASE_DATA.to_string())?;
        let genesis = Block::new_genesis_block(cbtx)?;
        blocks.insert(genesis.get_hash(), bincode::serialize(&genesis)?)?;
        chainstate.insert(TIP_KEY, genesis.get_hash().as_bytes())?;
        db.flush()?;
        Ok(Blockchain {
            db,
            blocks,
            chainstate,
            tip: Arc::new(RwLock::new(genesis.get_hash())),
        })
    }

    /// Verifies `transactions`, mines a block on a tip snapshot, and commits
    /// it through the same guarded path as network ingestion. Verification
    /// happens before mining so no work is wasted on invalid content.
    pub fn mine_block(&self, transactions: Vec<Transaction>) -> Result<Block> {
        for tx in &transactions {
            if !self.verify_transaction(tx)? {
                return Err(NodeError::InvalidBlock {
                    hash: String::from("candidate"),
                    reason: format!("transaction {} failed verification", tx.id),
                }
                .into());
            }
        }
        let (prev_hash, height) = {
            let tip = self.tip.read().unwrap();
            (tip.clone(), self.get_block(&tip)?.get_height())
        };
        let block = Block::mine(transactions, prev_hash, height + 1, &CancelToken::new())?
            .ok_or_else(|| format_err!("mining interrupted"))?;
        match self.add_block(block.clone())? {
            BlockStatus::Appended => Ok(block),
            status => Err(format_err!(
                "mined block {} was not appended: {:?}",
                block.get_hash(),
                status
            )),
        }
    }

    /// Ingests a block, locally mined or received from a peer. The block is
    /// fully validated first; the append itself happens under the tip write
    /// lock, so a stale parent is detected at the moment of commit.
    pub fn add_block(&self, block: Block) -> Result<BlockStatus> {
        let hash = block.get_hash();
        if !block.validate()? {
            return Err(NodeError::InvalidBlock {
                hash,
                reason: String::from("header hash does not satisfy the proof-of-work target"),
            }
            .into());
        }
        let coinbases = block
            .get_transactions()
            .iter()
            .filter(|tx| tx.is_coinbase())
            .count();
        if coinbases != 1 {
            return Err(NodeError::InvalidBlock {
                hash,
                reason: format!("expected exactly one coinbase transaction, found {}", coinbases),
            }
            .into());
        }
        for tx in block.get_transactions() {
            if !self.verify_transaction_in_block(tx, block.get_transactions())? {
                return Err(NodeError::InvalidBlock {
                    hash,
                    reason: format!("transaction {} failed verification", tx.id),
                }
                .into());
            }
        }

        let mut tip = self.tip.write().unwrap();
        if self.blocks.contains_key(&hash)? {
            return Ok(BlockStatus::Known);
        }
        let data = bincode::serialize(&block)?;
        if block.get_prev_hash() == *tip {
            let tip_height = self.get_block(&tip)?.get_height();
            if block.get_height() != tip_height + 1 {
                return Err(NodeError::InvalidBlock {
                    hash,
                    reason: format!(
                        "height {} does not follow tip height {}",
                        block.get_height(),
                        tip_height
                    ),
                }
                .into());
            }
            self.blocks.insert(&hash, data)?;
            self.chainstate.insert(TIP_KEY, hash.as_bytes())?;
            self.db.flush()?;
            info!("appended block {} at height {}", hash, block.get_height());
            *tip = hash;
            return Ok(BlockStatus::Appended);
        }

        // competing parent: keep the block, adopt only a taller chain that
        // actually reaches genesis
        self.blocks.insert(&hash, data)?;
        self.db.flush()?;
        let best_height = self.get_block(&tip)?.get_height();
        if block.get_height() > best_height && self.connects_to_genesis(&block)? {
            self.chainstate.insert(TIP_KEY, hash.as_bytes())?;
            self.db.flush()?;
            warn!(
                "reorganize: block {} at height {} replaces tip {} at height {}",
                hash,
                block.get_height(),
                *tip,
                best_height
            );
            *tip = hash;
            return Ok(BlockStatus::Reorganized);
        }
        warn!(
            "{}",
            NodeError::ForkConflict {
                hash,
                height: block.get_height(),
                parent: block.get_prev_hash(),
            }
        );
        Ok(BlockStatus::Fork)
    }

    /// Lazy iterator from the current tip back to genesis.
    pub fn iter(&self) -> BlockchainIter {
        BlockchainIter {
            current_hash: self.tip.read().unwrap().clone(),
            bc: self,
        }
    }

    pub fn get_block(&self, hash: &str) -> Result<Block> {
        let data = self
            .blocks
            .get(hash)?
            .ok_or_else(|| format_err!("block {} is not found", hash))?;
        Ok(bincode::deserialize(&data)?)
    }

    pub fn get_best_height(&self) -> Result<i32> {
        let tip = self.tip.read().unwrap().clone();
        Ok(self.get_block(&tip)?.get_height())
    }

    pub fn get_tip_hash(&self) -> String {
        self.tip.read().unwrap().clone()
    }

    /// Hashes of the active chain, tip first.
    pub fn get_block_hashes(&self) -> Vec<String> {
        self.iter().map(|b| b.get_hash()).collect()
    }

    pub fn has_block(&self, hash: &str) -> Result<bool> {
        Ok(self.blocks.contains_key(hash)?)
    }

    /// Finds a transaction on the active chain.
    pub fn find_transaction(&self, id: &str) -> Result<Transaction> {
        for block in self.iter() {
            for tx in block.get_transactions() {
                if tx.id == id {
                    return Ok(tx.clone());
                }
            }
        }
        Err(format_err!("transaction {} is not found", id))
    }

    pub fn sign_transaction(&self, tx: &mut Transaction, private_key: &[u8]) -> Result<()> {
        let prev_txs = self.resolve_prev_txs(tx, &[])?;
        tx.sign(private_key, &prev_txs)
    }

    /// Signature and balance verification against the active chain.
    pub fn verify_transaction(&self, tx: &Transaction) -> Result<bool> {
        self.verify_with_prev(tx, &[])
    }

    /// Same as `verify_transaction`, but inputs may also resolve against the
    /// containing block and stored side branches — needed while ingesting a
    /// competing branch whose earlier blocks are not on the active chain.
    pub fn verify_transaction_in_block(
        &self,
        tx: &Transaction,
        block_txs: &[Transaction],
    ) -> Result<bool> {
        self.verify_with_prev(tx, block_txs)
    }

    fn verify_with_prev(&self, tx: &Transaction, extra: &[Transaction]) -> Result<bool> {
        if tx.is_coinbase() {
            return Ok(true);
        }
        let prev_txs = self.resolve_prev_txs(tx, extra)?;
        if !tx.verify(&prev_txs)? {
            warn!("transaction {} failed signature verification", tx.id);
            return Ok(false);
        }
        let mut input_sum = 0;
        for vin in &tx.vin {
            input_sum += prev_txs[&vin.txid].vout[vin.vout as usize].value;
        }
        let output_sum: i32 = tx.vout.iter().map(|out| out.value).sum();
        if input_sum != output_sum {
            warn!(
                "transaction {} rejected: input value {} != output value {}",
                tx.id, input_sum, output_sum
            );
            return Ok(false);
        }
        Ok(true)
    }

    fn resolve_prev_txs(
        &self,
        tx: &Transaction,
        extra: &[Transaction],
    ) -> Result<HashMap<String, Transaction>> {
        let mut prev_txs = HashMap::new();
        for vin in &tx.vin {
            let prev = self.find_transaction_anywhere(&vin.txid, extra).map_err(|_| {
                NodeError::InvalidTransaction {
                    id: tx.id.clone(),
                    reason: format!("input references unknown transaction {}", vin.txid),
                }
            })?;
            prev_txs.insert(prev.id.clone(), prev);
        }
        Ok(prev_txs)
    }

    fn find_transaction_anywhere(&self, id: &str, extra: &[Transaction]) -> Result<Transaction> {
        if let Some(tx) = extra.iter().find(|tx| tx.id == id) {
            return Ok(tx.clone());
        }
        if let Ok(tx) = self.find_transaction(id) {
            return Ok(tx);
        }
        // side branches are stored but not on the active iterator
        for kv in self.blocks.iter() {
            let (_, raw) = kv?;
            let block: Block = bincode::deserialize(&raw)?;
            for tx in block.get_transactions() {
                if tx.id == id {
                    return Ok(tx.clone());
                }
            }
        }
        Err(format_err!("transaction {} is not found", id))
    }

    /// Map of every unspent output on the active chain, keyed by transaction
    /// id. This is the source the UTXO bucket is rebuilt from.
    pub fn find_utxo(&self) -> HashMap<String, TXOutputs> {
        let mut utxos: HashMap<String, TXOutputs> = HashMap::new();
        let mut spent: HashMap<String, Vec<i32>> = HashMap::new();
        // tip-to-genesis walk sees every spend before the output it consumes
        for block in self.iter() {
            for tx in block.get_transactions() {
                for (idx, out) in tx.vout.iter().enumerate() {
                    let idx = idx as i32;
                    if spent.get(&tx.id).map_or(false, |v| v.contains(&idx)) {
                        continue;
                    }
                    utxos
                        .entry(tx.id.clone())
                        .or_insert_with(|| TXOutputs {
                            outputs: Vec::new(),
                        })
                        .outputs
                        .push((idx, out.clone()));
                }
                if !tx.is_coinbase() {
                    for vin in &tx.vin {
                        spent.entry(vin.txid.clone()).or_default().push(vin.vout);
                    }
                }
            }
        }
        utxos
    }

    pub(crate) fn utxo_tree(&self) -> Result<Tree> {
        Ok(self.db.open_tree(crate::utxoset::UTXO_TREE)?)
    }

    pub(crate) fn drop_utxo_tree(&self) -> Result<()> {
        self.db.drop_tree(crate::utxoset::UTXO_TREE)?;
        Ok(())
    }

    pub(crate) fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    fn connects_to_genesis(&self, block: &Block) -> Result<bool> {
        let mut current = block.get_prev_hash();
        let mut steps = block.get_height();
        while !current.is_empty() {
            if steps <= 0 {
                return Ok(false);
            }
            match self.blocks.get(&current)? {
                Some(raw) => {
                    let parent: Block = bincode::deserialize(&raw)?;
                    current = parent.get_prev_hash();
                    steps -= 1;
                }
                None => return Ok(false),
            }
        }
        Ok(steps == 0)
    }
}

impl<'a> Iterator for BlockchainIter<'a> {
    type Item = Block;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current_hash.is_empty() {
            return None;
        }
        match self.bc.blocks.get(&self.current_hash) {
            Ok(Some(raw)) => match bincode::deserialize::<Block>(&raw) {
                Ok(block) => {
                    self.current_hash = block.get_prev_hash();
                    Some(block)
                }
                Err(_) => None,
            },
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::CancelToken;
    use crate::tx::{TXInput, TXOutput};
    use crate::wallet::Wallets;

    fn new_chain(dir: &Path) -> (Blockchain, String, String) {
        let mut ws = Wallets::new(dir).unwrap();
        let miner = ws.create_wallet();
        let other = ws.create_wallet();
        ws.save_all().unwrap();
        let bc = Blockchain::create(dir, &miner).unwrap();
        (bc, miner, other)
    }

    // candidate blocks are mined off-handle and committed via add_block
    fn mined_on(prev: &str, height: i32, miner: &str) -> Block {
        let cbtx = Transaction::new_coinbase(miner.to_string(), String::new()).unwrap();
        Block::mine(vec![cbtx], prev.to_string(), height, &CancelToken::new())
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_walk_reaches_genesis_without_repeats() {
        let dir = tempfile::tempdir().unwrap();
        let (bc, miner, _) = new_chain(dir.path());
        let cbtx = Transaction::new_coinbase(miner.clone(), String::new()).unwrap();
        bc.mine_block(vec![cbtx]).unwrap();

        let height = bc.get_best_height().unwrap();
        assert_eq!(height, 1);

        let mut seen = std::collections::HashSet::new();
        let mut steps = 0;
        for block in bc.iter() {
            assert!(seen.insert(block.get_hash()), "repeated hash in chain walk");
            steps += 1;
        }
        assert_eq!(steps, height + 1);

        let genesis = bc.iter().last().unwrap();
        assert_eq!(genesis.get_prev_hash(), "");
        assert_eq!(genesis.get_height(), 0);
    }

    #[test]
    fn test_get_block_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (bc, miner, _) = new_chain(dir.path());
        let cbtx = Transaction::new_coinbase(miner, String::new()).unwrap();
        let mined = bc.mine_block(vec![cbtx]).unwrap();

        let fetched = bc.get_block(&mined.get_hash()).unwrap();
        assert_eq!(fetched.get_hash(), mined.get_hash());
        assert_eq!(fetched.get_height(), mined.get_height());
        assert_eq!(fetched.get_transactions(), mined.get_transactions());
    }

    #[test]
    fn test_open_without_chain_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Blockchain::open(dir.path()).is_err());
    }

    #[test]
    fn test_create_twice_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (bc, miner, _) = new_chain(dir.path());
        drop(bc);
        assert!(Blockchain::create(dir.path(), &miner).is_err());
    }

    #[test]
    fn test_mine_block_rejects_bad_signature() {
        let dir = tempfile::tempdir().unwrap();
        let (bc, miner, other) = new_chain(dir.path());
        let ws = Wallets::new(dir.path()).unwrap();
        let wallet = ws.get_wallet(&miner).unwrap();
        let genesis_cb = bc.iter().last().unwrap().get_transactions()[0].clone();

        let mut tx = Transaction {
            id: String::new(),
            vin: vec![TXInput {
                txid: genesis_cb.id.clone(),
                vout: 0,
                signature: vec![0; 64],
                pub_key: wallet.public_key.clone(),
            }],
            vout: vec![TXOutput::new(crate::transaction::SUBSIDY, &other).unwrap()],
        };
        tx.id = tx.hash().unwrap();

        let cbtx = Transaction::new_coinbase(miner, String::new()).unwrap();
        let err = bc.mine_block(vec![cbtx, tx]).unwrap_err();
        assert!(err.downcast_ref::<NodeError>().is_some());
    }

    #[test]
    fn test_fork_then_longer_branch_reorganizes() {
        let dir = tempfile::tempdir().unwrap();
        let (bc, miner, _) = new_chain(dir.path());
        let genesis_hash = bc.iter().last().unwrap().get_hash();

        let x1 = mined_on(&genesis_hash, 1, &miner);
        assert_eq!(bc.add_block(x1.clone()).unwrap(), BlockStatus::Appended);
        assert_eq!(bc.add_block(x1.clone()).unwrap(), BlockStatus::Known);

        // competing block at the same height is kept off the active chain
        let x2 = mined_on(&genesis_hash, 1, &miner);
        assert_eq!(bc.add_block(x2.clone()).unwrap(), BlockStatus::Fork);
        assert_eq!(*bc.tip.read().unwrap(), x1.get_hash());

        // extending the competitor makes it the taller chain
        let x3 = mined_on(&x2.get_hash(), 2, &miner);
        assert_eq!(bc.add_block(x3.clone()).unwrap(), BlockStatus::Reorganized);
        assert_eq!(*bc.tip.read().unwrap(), x3.get_hash());
        assert_eq!(bc.get_best_height().unwrap(), 2);

        let hashes = bc.get_block_hashes();
        assert_eq!(
            hashes,
            vec![x3.get_hash(), x2.get_hash(), genesis_hash]
        );
    }

    #[test]
    fn test_stale_parent_is_not_appended() {
        let dir = tempfile::tempdir().unwrap();
        let (bc, miner, _) = new_chain(dir.path());
        let genesis_hash = bc.iter().last().unwrap().get_hash();

        let x1 = mined_on(&genesis_hash, 1, &miner);
        bc.add_block(x1).unwrap();
        // mined against a tip that has since moved
        let stale = mined_on(&genesis_hash, 1, &miner);
        assert_eq!(bc.add_block(stale).unwrap(), BlockStatus::Fork);
    }
}
