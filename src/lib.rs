mod behavior;
pub mod block;
pub mod blockchain;
pub mod cli;
pub mod config;
pub mod errors;
pub mod message;
pub mod server;
pub mod transaction;
pub mod tx;
pub mod utxoset;
pub mod wallet;

pub use block::Block;
pub use blockchain::{BlockStatus, Blockchain};
pub use config::Config;
pub use errors::{NodeError, Result};
pub use message::Message;
pub use server::Server;
pub use transaction::Transaction;
pub use tx::{TXInput, TXOutput, TXOutputs};
pub use utxoset::UTXOSet;
pub use wallet::{validate_address, Wallet, Wallets};
