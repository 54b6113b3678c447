use std::collections::HashMap;

use log::{debug, info};

use crate::block::Block;
use crate::blockchain::Blockchain;
use crate::errors::{NodeError, Result};
use crate::transaction::Transaction;
use crate::tx::{TXOutput, TXOutputs};

pub(crate) const UTXO_TREE: &str = "utxo";

/// Index of unspent outputs derived from the chain. Rebuildable at any time;
/// never the source of truth. Keys are transaction ids, so sled's ordered
/// iteration gives spend selection a deterministic ascending
/// (transaction id, output index) order.
#[derive(Clone)]
pub struct UTXOSet {
    pub blockchain: Blockchain,
}

impl UTXOSet {
    /// Rebuilds the index from a full chain walk, replacing whatever was
    /// there: the old tree is dropped and repopulated, never patched.
    pub fn reindex(&self) -> Result<()> {
        let utxos = self.blockchain.find_utxo();
        let count = utxos.len();
        self.blockchain.drop_utxo_tree()?;
        let tree = self.blockchain.utxo_tree()?;
        for (txid, outs) in utxos {
            tree.insert(txid.as_bytes(), bincode::serialize(&outs)?)?;
        }
        self.blockchain.flush()?;
        info!("reindexed utxo set: {} transactions carry unspent outputs", count);
        Ok(())
    }

    /// Incremental maintenance for a block just appended to the tip: spent
    /// outputs leave the index, the block's new outputs enter it. Must be
    /// applied in block append order.
    pub fn update(&self, block: &Block) -> Result<()> {
        let tree = self.blockchain.utxo_tree()?;
        for tx in block.get_transactions() {
            if !tx.is_coinbase() {
                for vin in &tx.vin {
                    let raw = tree.get(&vin.txid)?.ok_or_else(|| {
                        NodeError::StorageFailure(format!(
                            "utxo entry {} missing while applying block {}",
                            vin.txid,
                            block.get_hash()
                        ))
                    })?;
                    let outs: TXOutputs = bincode::deserialize(&raw)?;
                    let remaining: Vec<(i32, TXOutput)> = outs
                        .outputs
                        .into_iter()
                        .filter(|(idx, _)| *idx != vin.vout)
                        .collect();
                    if remaining.is_empty() {
                        tree.remove(&vin.txid)?;
                    } else {
                        tree.insert(
                            vin.txid.as_bytes(),
                            bincode::serialize(&TXOutputs { outputs: remaining })?,
                        )?;
                    }
                }
            }
            let new_outputs = TXOutputs {
                outputs: tx
                    .vout
                    .iter()
                    .enumerate()
                    .map(|(idx, out)| (idx as i32, out.clone()))
                    .collect(),
            };
            tree.insert(tx.id.as_bytes(), bincode::serialize(&new_outputs)?)?;
        }
        self.blockchain.flush()?;
        debug!("utxo set updated for block {}", block.get_hash());
        Ok(())
    }

    /// Greedy selection of owned outputs until `amount` is covered, in the
    /// index's native ascending order.
    pub fn find_spendable_outputs(
        &self,
        pub_key_hash: &[u8],
        amount: i32,
    ) -> Result<(i32, HashMap<String, Vec<i32>>)> {
        let mut unspent_outputs: HashMap<String, Vec<i32>> = HashMap::new();
        let mut accumulated = 0;
        let tree = self.blockchain.utxo_tree()?;
        for kv in tree.iter() {
            let (k, v) = kv?;
            let txid = String::from_utf8(k.to_vec())?;
            let outs: TXOutputs = bincode::deserialize(&v)?;
            for (idx, out) in &outs.outputs {
                if out.is_locked_with_key(pub_key_hash) && accumulated < amount {
                    accumulated += out.value;
                    unspent_outputs.entry(txid.clone()).or_default().push(*idx);
                    if accumulated >= amount {
                        return Ok((accumulated, unspent_outputs));
                    }
                }
            }
        }
        Ok((accumulated, unspent_outputs))
    }

    /// All outputs spendable by `pub_key_hash`, for balance queries.
    pub fn find_utxo(&self, pub_key_hash: &[u8]) -> Result<Vec<TXOutput>> {
        let mut utxos = Vec::new();
        let tree = self.blockchain.utxo_tree()?;
        for kv in tree.iter() {
            let (_, v) = kv?;
            let outs: TXOutputs = bincode::deserialize(&v)?;
            for (_, out) in outs.outputs {
                if out.is_locked_with_key(pub_key_hash) {
                    utxos.push(out);
                }
            }
        }
        Ok(utxos)
    }

    pub fn count_transactions(&self) -> Result<i32> {
        let mut counter = 0;
        let tree = self.blockchain.utxo_tree()?;
        for kv in tree.iter() {
            kv?;
            counter += 1;
        }
        Ok(counter)
    }

    pub fn is_unspent(&self, txid: &str, vout: i32) -> Result<bool> {
        let tree = self.blockchain.utxo_tree()?;
        match tree.get(txid)? {
            Some(raw) => {
                let outs: TXOutputs = bincode::deserialize(&raw)?;
                Ok(outs.outputs.iter().any(|(idx, _)| *idx == vout))
            }
            None => Ok(false),
        }
    }

    /// Admission check for transactions arriving from peers or the local
    /// client: the signature chain must verify and every input must still be
    /// unspent in this view.
    pub fn validate_transaction(&self, tx: &Transaction) -> Result<()> {
        if tx.is_coinbase() {
            return Err(NodeError::InvalidTransaction {
                id: tx.id.clone(),
                reason: String::from("coinbase transactions are built by miners, never relayed"),
            }
            .into());
        }
        if !self.blockchain.verify_transaction(tx)? {
            return Err(NodeError::InvalidTransaction {
                id: tx.id.clone(),
                reason: String::from("signature verification failed"),
            }
            .into());
        }
        for vin in &tx.vin {
            if !self.is_unspent(&vin.txid, vin.vout)? {
                return Err(NodeError::InvalidTransaction {
                    id: tx.id.clone(),
                    reason: format!(
                        "input ({}, {}) is already spent or unknown",
                        vin.txid, vin.vout
                    ),
                }
                .into());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::CancelToken;
    use crate::blockchain::BlockStatus;
    use crate::tx::TXInput;
    use crate::wallet::{hash_pub_key, Wallets};
    use std::path::Path;

    struct Fixture {
        utxo: UTXOSet,
        wallets: Wallets,
        a: String,
        b: String,
        c: String,
    }

    fn fixture(dir: &Path) -> Fixture {
        let mut ws = Wallets::new(dir).unwrap();
        let a = ws.create_wallet();
        let b = ws.create_wallet();
        let c = ws.create_wallet();
        ws.save_all().unwrap();
        let blockchain = Blockchain::create(dir, &a).unwrap();
        let utxo = UTXOSet { blockchain };
        utxo.reindex().unwrap();
        Fixture {
            utxo,
            wallets: ws,
            a,
            b,
            c,
        }
    }

    fn balance(utxo: &UTXOSet, ws: &Wallets, address: &str) -> i32 {
        let mut pub_key_hash = ws.get_wallet(address).unwrap().public_key.clone();
        hash_pub_key(&mut pub_key_hash);
        utxo.find_utxo(&pub_key_hash)
            .unwrap()
            .iter()
            .map(|out| out.value)
            .sum()
    }

    fn utxo_snapshot(utxo: &UTXOSet) -> Vec<(Vec<u8>, Vec<u8>)> {
        let tree = utxo.blockchain.utxo_tree().unwrap();
        tree.iter()
            .map(|kv| {
                let (k, v) = kv.unwrap();
                (k.to_vec(), v.to_vec())
            })
            .collect()
    }

    #[test]
    fn test_send_scenario_balances() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(dir.path());
        assert_eq!(balance(&f.utxo, &f.wallets, &f.a), 10);

        // A pays B 4, block reward goes to C
        let wallet_a = f.wallets.get_wallet(&f.a).unwrap();
        let tx = Transaction::new_utxo(wallet_a, &f.b, 4, &f.utxo).unwrap();
        let cbtx = Transaction::new_coinbase(f.c.clone(), String::new()).unwrap();
        let block = f.utxo.blockchain.mine_block(vec![cbtx, tx]).unwrap();
        f.utxo.update(&block).unwrap();

        assert_eq!(balance(&f.utxo, &f.wallets, &f.a), 6);
        assert_eq!(balance(&f.utxo, &f.wallets, &f.b), 4);
        // the transfer itself conserved value; only the coinbase minted more
        assert_eq!(
            balance(&f.utxo, &f.wallets, &f.a) + balance(&f.utxo, &f.wallets, &f.b),
            10
        );
        assert_eq!(balance(&f.utxo, &f.wallets, &f.c), 10);
    }

    #[test]
    fn test_insufficient_funds_creates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(dir.path());
        let wallet_a = f.wallets.get_wallet(&f.a).unwrap();
        let before = utxo_snapshot(&f.utxo);

        let err = Transaction::new_utxo(wallet_a, &f.b, 11, &f.utxo).unwrap_err();
        match err.downcast_ref::<NodeError>() {
            Some(NodeError::InsufficientFunds {
                available,
                required,
            }) => {
                assert_eq!(*available, 10);
                assert_eq!(*required, 11);
            }
            other => panic!("expected InsufficientFunds, got {:?}", other),
        }
        assert_eq!(utxo_snapshot(&f.utxo), before);
    }

    #[test]
    fn test_reindex_matches_incremental_update() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(dir.path());
        let wallet_a = f.wallets.get_wallet(&f.a).unwrap();

        let tx = Transaction::new_utxo(wallet_a, &f.b, 4, &f.utxo).unwrap();
        let cbtx = Transaction::new_coinbase(f.c.clone(), String::new()).unwrap();
        let block = f.utxo.blockchain.mine_block(vec![cbtx, tx]).unwrap();
        f.utxo.update(&block).unwrap();

        let incremental = utxo_snapshot(&f.utxo);
        f.utxo.reindex().unwrap();
        let rebuilt = utxo_snapshot(&f.utxo);
        assert_eq!(incremental, rebuilt);
    }

    #[test]
    fn test_double_spend_rejected_after_first_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(dir.path());
        let wallet_a = f.wallets.get_wallet(&f.a).unwrap();
        let genesis_cb = f.utxo.blockchain.iter().last().unwrap().get_transactions()[0].clone();

        // T1 spends the genesis coinbase output and gets mined
        let t1 = Transaction::new_utxo(wallet_a, &f.b, 4, &f.utxo).unwrap();
        assert_eq!(t1.vin[0].txid, genesis_cb.id);
        let cbtx = Transaction::new_coinbase(f.c.clone(), String::new()).unwrap();
        let block = f.utxo.blockchain.mine_block(vec![cbtx, t1]).unwrap();
        f.utxo.update(&block).unwrap();

        // T2 spends the very same output against the post-T1 view
        let mut pub_key_hash = wallet_a.public_key.clone();
        hash_pub_key(&mut pub_key_hash);
        let mut t2 = Transaction {
            id: String::new(),
            vin: vec![TXInput {
                txid: genesis_cb.id.clone(),
                vout: 0,
                signature: Vec::new(),
                pub_key: wallet_a.public_key.clone(),
            }],
            vout: vec![
                crate::tx::TXOutput::new(4, &f.b).unwrap(),
                crate::tx::TXOutput::new_with_key_hash(6, pub_key_hash),
            ],
        };
        t2.id = t2.hash().unwrap();
        f.utxo
            .blockchain
            .sign_transaction(&mut t2, &wallet_a.secret_key)
            .unwrap();

        let err = f.utxo.validate_transaction(&t2).unwrap_err();
        match err.downcast_ref::<NodeError>() {
            Some(NodeError::InvalidTransaction { reason, .. }) => {
                assert!(reason.contains(&genesis_cb.id), "reason should name the input: {}", reason);
            }
            other => panic!("expected InvalidTransaction, got {:?}", other),
        }
    }

    #[test]
    fn test_reorganized_branch_replaces_active_view() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(dir.path());
        let genesis_hash = f.utxo.blockchain.iter().last().unwrap().get_hash();

        let mine_on = |prev: &str, height: i32| {
            let cbtx = Transaction::new_coinbase(f.a.clone(), String::new()).unwrap();
            Block::mine(vec![cbtx], prev.to_string(), height, &CancelToken::new())
                .unwrap()
                .unwrap()
        };

        let x1 = mine_on(&genesis_hash, 1);
        assert_eq!(
            f.utxo.blockchain.add_block(x1.clone()).unwrap(),
            BlockStatus::Appended
        );
        f.utxo.update(&x1).unwrap();

        let x2 = mine_on(&genesis_hash, 1);
        assert_eq!(
            f.utxo.blockchain.add_block(x2.clone()).unwrap(),
            BlockStatus::Fork
        );
        let x3 = mine_on(&x2.get_hash(), 2);
        assert_eq!(
            f.utxo.blockchain.add_block(x3.clone()).unwrap(),
            BlockStatus::Reorganized
        );
        f.utxo.reindex().unwrap();

        // active view now pays out the x2/x3 branch, not x1's coinbase
        assert_eq!(balance(&f.utxo, &f.wallets, &f.a), 30);
        let x1_cb = &x1.get_transactions()[0];
        assert!(!f.utxo.is_unspent(&x1_cb.id, 0).unwrap());
        let x3_cb = &x3.get_transactions()[0];
        assert!(f.utxo.is_unspent(&x3_cb.id, 0).unwrap());
    }
}
