use std::collections::HashMap;
use std::path::{Path, PathBuf};

use bitcoincash_addr::{Address, HashType, Scheme};
use crypto::digest::Digest;
use crypto::ed25519;
use crypto::ripemd160::Ripemd160;
use crypto::sha2::Sha256;
use failure::format_err;
use log::{debug, info};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::errors::Result;

const WALLET_TREE: &str = "wallets";

/// An ed25519 key pair. The address is derived, never stored.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
pub struct Wallet {
    pub secret_key: Vec<u8>,
    pub public_key: Vec<u8>,
}

impl Wallet {
    pub fn new() -> Wallet {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        let (secret_key, public_key) = ed25519::keypair(&seed);
        Wallet {
            secret_key: secret_key.to_vec(),
            public_key: public_key.to_vec(),
        }
    }

    /// Base58Check address: version byte + RIPEMD160(SHA256(pubkey)) + 4-byte
    /// double-SHA256 checksum.
    pub fn get_address(&self) -> String {
        let mut pub_hash = self.public_key.clone();
        hash_pub_key(&mut pub_hash);
        let address = Address {
            body: pub_hash,
            scheme: Scheme::Base58,
            hash_type: HashType::Key,
            ..Default::default()
        };
        address.encode().unwrap()
    }
}

/// Reduces a public key to its 20-byte pubkey-hash in place.
pub fn hash_pub_key(pub_key: &mut Vec<u8>) {
    let mut hasher1 = Sha256::new();
    hasher1.input(pub_key);
    pub_key.resize(32, 0);
    hasher1.result(pub_key);
    let mut hasher2 = Ripemd160::new();
    hasher2.input(pub_key);
    pub_key.resize(20, 0);
    hasher2.result(pub_key);
}

/// Decodes the pubkey-hash out of an address, rejecting bad checksums.
pub fn address_to_pub_key_hash(address: &str) -> Result<Vec<u8>> {
    let addr = Address::decode(address)
        .map_err(|e| format_err!("invalid address {}: {:?}", address, e))?;
    Ok(addr.body)
}

/// Reverse-decodes and checks the embedded checksum.
pub fn validate_address(address: &str) -> bool {
    match Address::decode(address) {
        Ok(addr) => matches!(addr.scheme, Scheme::Base58) && addr.body.len() == 20,
        Err(_) => false,
    }
}

/// The address -> key pair map, backed by a wallet database under the data
/// directory. The chain core only ever sees the in-memory map.
pub struct Wallets {
    wallets: HashMap<String, Wallet>,
    path: PathBuf,
}

impl Wallets {
    pub fn new(data_dir: &Path) -> Result<Wallets> {
        let path = data_dir.join(WALLET_TREE);
        let mut wlt = Wallets {
            wallets: HashMap::new(),
            path,
        };
        if !wlt.path.exists() {
            return Ok(wlt);
        }
        let db = sled::open(&wlt.path)?;
        for item in db.iter() {
            let (k, v) = item?;
            let address = String::from_utf8(k.to_vec())?;
            let wallet = bincode::deserialize(&v)?;
            wlt.wallets.insert(address, wallet);
        }
        Ok(wlt)
    }

    pub fn create_wallet(&mut self) -> String {
        let wallet = Wallet::new();
        let address = wallet.get_address();
        self.wallets.insert(address.clone(), wallet);
        info!("created wallet {}", address);
        address
    }

    pub fn get_wallet(&self, address: &str) -> Option<&Wallet> {
        self.wallets.get(address)
    }

    pub fn get_all_addresses(&self) -> Vec<String> {
        self.wallets.keys().cloned().collect()
    }

    pub fn save_all(&self) -> Result<()> {
        let db = sled::open(&self.path)?;
        for (address, wallet) in &self.wallets {
            let data = bincode::serialize(wallet)?;
            db.insert(address.as_bytes(), data)?;
        }
        db.flush()?;
        debug!("saved {} wallets", self.wallets.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_round_trip() {
        let wallet = Wallet::new();
        let address = wallet.get_address();
        assert!(validate_address(&address));

        let mut expected = wallet.public_key.clone();
        hash_pub_key(&mut expected);
        assert_eq!(expected.len(), 20);
        assert_eq!(address_to_pub_key_hash(&address).unwrap(), expected);
    }

    #[test]
    fn test_tampered_address_rejected() {
        let address = Wallet::new().get_address();
        for i in 0..address.len() {
            let mut chars: Vec<char> = address.chars().collect();
            chars[i] = if chars[i] != '2' { '2' } else { '3' };
            let tampered: String = chars.into_iter().collect();
            assert!(
                !validate_address(&tampered),
                "tampered address {} accepted",
                tampered
            );
        }
    }

    #[test]
    fn test_wallets_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let mut ws = Wallets::new(dir.path()).unwrap();
        let a1 = ws.create_wallet();
        let a2 = ws.create_wallet();
        ws.save_all().unwrap();

        let reloaded = Wallets::new(dir.path()).unwrap();
        let mut addresses = reloaded.get_all_addresses();
        addresses.sort();
        let mut expected = vec![a1.clone(), a2];
        expected.sort();
        assert_eq!(addresses, expected);
        assert_eq!(
            reloaded.get_wallet(&a1).unwrap().public_key,
            ws.get_wallet(&a1).unwrap().public_key
        );
    }
}
