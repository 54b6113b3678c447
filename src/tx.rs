use log::debug;

use crate::errors::Result;
use crate::wallet::{address_to_pub_key_hash, hash_pub_key};

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, PartialEq)]
pub struct TXInput {
    // id of the transaction whose output is being spent
    pub txid: String,
    // index of that output in the previous transaction, -1 for coinbase
    pub vout: i32,
    pub signature: Vec<u8>,
    pub pub_key: Vec<u8>,
}

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, PartialEq)]
pub struct TXOutput {
    pub value: i32,
    // locks the output to the owner of the matching key pair
    pub pub_key_hash: Vec<u8>,
}

/// Unspent outputs of one transaction, each paired with its original output
/// index so partial spends never renumber what remains.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, PartialEq)]
pub struct TXOutputs {
    pub outputs: Vec<(i32, TXOutput)>,
}

impl TXInput {
    /// Whether this input was created by the holder of `pub_key_hash`.
    pub fn uses_key(&self, pub_key_hash: &[u8]) -> bool {
        let mut hashed = self.pub_key.clone();
        hash_pub_key(&mut hashed);
        hashed == pub_key_hash
    }
}

impl TXOutput {
    pub fn new(value: i32, address: &str) -> Result<TXOutput> {
        let mut txo = TXOutput {
            value,
            pub_key_hash: Vec::new(),
        };
        txo.lock(address)?;
        Ok(txo)
    }

    pub fn new_with_key_hash(value: i32, pub_key_hash: Vec<u8>) -> TXOutput {
        TXOutput {
            value,
            pub_key_hash,
        }
    }

    pub fn is_locked_with_key(&self, pub_key_hash: &[u8]) -> bool {
        self.pub_key_hash == pub_key_hash
    }

    fn lock(&mut self, address: &str) -> Result<()> {
        debug!("lock output to {}", address);
        self.pub_key_hash = address_to_pub_key_hash(address)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::Wallets;

    #[test]
    fn test_output_lock_matches_owner_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut ws = Wallets::new(dir.path()).unwrap();
        let address = ws.create_wallet();
        let wallet = ws.get_wallet(&address).unwrap();

        let out = TXOutput::new(5, &address).unwrap();
        let mut pub_key_hash = wallet.public_key.clone();
        hash_pub_key(&mut pub_key_hash);
        assert!(out.is_locked_with_key(&pub_key_hash));

        let other = ws.create_wallet();
        let stranger = ws.get_wallet(&other).unwrap();
        let mut other_hash = stranger.public_key.clone();
        hash_pub_key(&mut other_hash);
        assert!(!out.is_locked_with_key(&other_hash));
    }
}
