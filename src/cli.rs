use clap::{arg, Command};
use failure::format_err;

use crate::blockchain::Blockchain;
use crate::config::Config;
use crate::errors::Result;
use crate::server::Server;
use crate::transaction::Transaction;
use crate::utxoset::UTXOSet;
use crate::wallet::{address_to_pub_key_hash, validate_address, Wallets};

const DEFAULT_NODE: &str = "/ip4/127.0.0.1/tcp/8000";

pub struct Cli;

impl Cli {
    pub async fn run() -> Result<()> {
        let matches = Command::new("rustcoin")
            .version("0.1")
            .about("an educational proof-of-work cryptocurrency node")
            .arg(arg!(--datadir <PATH> "data directory, also RUSTCOIN_DATA_DIR").required(false))
            .arg(arg!(--port <PORT> "listen port for startnode, also RUSTCOIN_PORT").required(false))
            .subcommand(Command::new("createwallet").about("create a key pair and print its address"))
            .subcommand(Command::new("listaddresses").about("list all wallet addresses"))
            .subcommand(
                Command::new("createblockchain")
                    .about("create a chain; the genesis reward goes to ADDRESS")
                    .arg(arg!(<ADDRESS> "address receiving the genesis reward")),
            )
            .subcommand(
                Command::new("getbalance")
                    .about("sum the unspent outputs owned by ADDRESS")
                    .arg(arg!(<ADDRESS> "address to query")),
            )
            .subcommand(Command::new("printchain").about("print every block, tip to genesis"))
            .subcommand(Command::new("reindexutxo").about("rebuild the unspent-output index"))
            .subcommand(
                Command::new("send")
                    .about("send AMOUNT from FROM to TO")
                    .arg(arg!(<FROM> "sender address"))
                    .arg(arg!(<TO> "recipient address"))
                    .arg(arg!(<AMOUNT> "amount to send"))
                    .arg(arg!(-m --mine "mine into a local block instead of broadcasting"))
                    .arg(arg!(--node <MULTIADDR> "node to hand the transaction to").required(false)),
            )
            .subcommand(
                Command::new("startnode")
                    .about("run a full node")
                    .arg(arg!([BOOTSTRAP] "multiaddr of a known node to dial on startup"))
                    .arg(arg!(--miner <ADDRESS> "mine into ADDRESS when transactions pool up").required(false)),
            )
            .get_matches();

        let mut config = Config::from_env();
        if let Some(dir) = matches.get_one::<String>("datadir") {
            config.data_dir = dir.into();
        }
        if let Some(port) = matches.get_one::<String>("port") {
            config.listen_port = port.parse()?;
        }

        match matches.subcommand() {
            Some(("createwallet", _)) => cmd_create_wallet(&config),
            Some(("listaddresses", _)) => cmd_list_addresses(&config),
            Some(("createblockchain", sub)) => {
                let address = sub.get_one::<String>("ADDRESS").unwrap();
                cmd_create_blockchain(&config, address)
            }
            Some(("getbalance", sub)) => {
                let address = sub.get_one::<String>("ADDRESS").unwrap();
                cmd_get_balance(&config, address)
            }
            Some(("printchain", _)) => cmd_print_chain(&config),
            Some(("reindexutxo", _)) => cmd_reindex_utxo(&config),
            Some(("send", sub)) => {
                let from = sub.get_one::<String>("FROM").unwrap();
                let to = sub.get_one::<String>("TO").unwrap();
                let amount: i32 = sub.get_one::<String>("AMOUNT").unwrap().parse()?;
                if let Some(node) = sub.get_one::<String>("node") {
                    config.bootstrap = Some(node.clone());
                }
                cmd_send(&config, from, to, amount, sub.get_flag("mine")).await
            }
            Some(("startnode", sub)) => {
                config.bootstrap = sub.get_one::<String>("BOOTSTRAP").cloned();
                let miner = sub.get_one::<String>("miner").cloned().unwrap_or_default();
                cmd_start_node(&config, &miner).await
            }
            _ => Err(format_err!("no command given; try --help")),
        }
    }
}

fn cmd_create_wallet(config: &Config) -> Result<()> {
    let mut ws = Wallets::new(&config.data_dir)?;
    let address = ws.create_wallet();
    ws.save_all()?;
    println!("new address: {}", address);
    Ok(())
}

fn cmd_list_addresses(config: &Config) -> Result<()> {
    let ws = Wallets::new(&config.data_dir)?;
    let mut addresses = ws.get_all_addresses();
    addresses.sort();
    for address in addresses {
        println!("{}", address);
    }
    Ok(())
}

fn cmd_create_blockchain(config: &Config, address: &str) -> Result<()> {
    if !validate_address(address) {
        return Err(format_err!("{} is not a valid address", address));
    }
    let blockchain = Blockchain::create(&config.data_dir, address)?;
    let utxo = UTXOSet { blockchain };
    utxo.reindex()?;
    println!("done; the genesis reward went to {}", address);
    Ok(())
}

fn cmd_get_balance(config: &Config, address: &str) -> Result<()> {
    let pub_key_hash = address_to_pub_key_hash(address)?;
    let blockchain = Blockchain::open(&config.data_dir)?;
    let utxo = UTXOSet { blockchain };
    let balance: i32 = utxo
        .find_utxo(&pub_key_hash)?
        .iter()
        .map(|out| out.value)
        .sum();
    println!("balance of {}: {}", address, balance);
    Ok(())
}

fn cmd_print_chain(config: &Config) -> Result<()> {
    let blockchain = Blockchain::open(&config.data_dir)?;
    for block in blockchain.iter() {
        println!("{}", serde_json::to_string_pretty(&block)?);
    }
    Ok(())
}

fn cmd_reindex_utxo(config: &Config) -> Result<()> {
    let blockchain = Blockchain::open(&config.data_dir)?;
    let utxo = UTXOSet { blockchain };
    utxo.reindex()?;
    let count = utxo.count_transactions()?;
    println!(
        "done; {} transactions carry unspent outputs",
        count
    );
    Ok(())
}

async fn cmd_send(config: &Config, from: &str, to: &str, amount: i32, mine_now: bool) -> Result<()> {
    if !validate_address(from) {
        return Err(format_err!("{} is not a valid address", from));
    }
    if !validate_address(to) {
        return Err(format_err!("{} is not a valid address", to));
    }
    let blockchain = Blockchain::open(&config.data_dir)?;
    let utxo = UTXOSet { blockchain };
    let ws = Wallets::new(&config.data_dir)?;
    let wallet = ws
        .get_wallet(from)
        .ok_or_else(|| format_err!("no wallet for address {}", from))?;
    let tx = Transaction::new_utxo(wallet, to, amount, &utxo)?;

    if mine_now {
        let cbtx = Transaction::new_coinbase(from.to_string(), String::new())?;
        let block = utxo.blockchain.mine_block(vec![cbtx, tx])?;
        utxo.update(&block)?;
        println!("sent {} from {} to {} in block {}", amount, from, to, block.get_hash());
    } else {
        let mut config = config.clone();
        if config.bootstrap.is_none() {
            config.bootstrap = Some(DEFAULT_NODE.to_string());
        }
        Server::send_transaction(&config, &tx, utxo).await?;
        println!("sent {} from {} to {}; a miner will pick it up", amount, from, to);
    }
    Ok(())
}

async fn cmd_start_node(config: &Config, miner: &str) -> Result<()> {
    if !miner.is_empty() {
        if !validate_address(miner) {
            return Err(format_err!("{} is not a valid miner address", miner));
        }
        println!("mining is on; rewards go to {}", miner);
    }
    let blockchain = Blockchain::open(&config.data_dir)?;
    let utxo = UTXOSet { blockchain };
    let mut server = Server::new(config, miner, utxo)?;
    server.run().await
}
