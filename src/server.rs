use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use failure::format_err;
use futures::stream::StreamExt;
use libp2p::identify::{
    Behaviour as IdentifyBehavior, Config as IdentifyConfig, Event as IdentifyEvent,
};
use libp2p::kad::store::MemoryStore;
use libp2p::kad::{self, RoutingUpdate};
use libp2p::request_response::cbor::Behaviour as RequestResponseBehavior;
use libp2p::request_response::{
    Config as RequestResponseConfig, Event as RequestResponseEvent,
    Message as RequestResponseMessage, ProtocolSupport as RequestResponseProtocolSupport,
};
use libp2p::swarm::SwarmEvent;
use libp2p::{identity, noise, tcp, yamux, Multiaddr, PeerId, StreamProtocol, Swarm};
use log::{debug, error, info, warn};
use tokio::sync::mpsc;

use crate::behavior::{Behavior, Event as BehaviorEvent};
use crate::block::{Block, CancelToken};
use crate::blockchain::BlockStatus;
use crate::config::Config;
use crate::errors::{NodeError, Result};
use crate::message::{
    Ack, Blockmsg, DataKind, GetDatamsg, Invmsg, Message, Txmsg, Versionmsg, PROTOCOL_VERSION,
};
use crate::transaction::Transaction;
use crate::utxoset::UTXOSet;

const KAD_PROTOCOL: &str = "/rustcoin/kad/1.0.0";
const MESSAGE_PROTOCOL: &str = "/rustcoin/message/1.0.0";

// a miner waits for this many pooled transactions before starting a block
const MINE_POOL_THRESHOLD: usize = 2;

type MineOutcome = Result<Option<Block>>;

/// One running node: the libp2p swarm, the shared chain state, and an
/// optional mining identity. Peer connections, the mining task and storage
/// writes are coordinated from the single `run` event loop.
pub struct Server {
    mining_address: String,
    swarm: Swarm<Behavior>,
    inner: Arc<Mutex<ServerInner>>,
    mined_tx: mpsc::Sender<MineOutcome>,
    mined_rx: mpsc::Receiver<MineOutcome>,
    /// cancel handle of the in-flight mining run, if any
    mining: Option<CancelToken>,
}

struct ServerInner {
    known_peers: HashSet<PeerId>,
    utxo: UTXOSet,
    blocks_in_transit: Vec<String>,
    mempool: HashMap<String, Transaction>,
}

impl Server {
    pub fn new(config: &Config, mining_address: &str, utxo: UTXOSet) -> Result<Server> {
        let local_key = identity::Keypair::generate_ed25519();
        let mut swarm = libp2p::SwarmBuilder::with_existing_identity(local_key)
            .with_tokio()
            .with_tcp(
                tcp::Config::default(),
                noise::Config::new,
                yamux::Config::default,
            )?
            .with_behaviour(|key| {
                let local_peer_id = PeerId::from(key.public());
                info!("local peer id {local_peer_id}");
                let kad_config = kad::Config::new(StreamProtocol::new(KAD_PROTOCOL));
                let kad_store = MemoryStore::new(local_peer_id);
                let kad = kad::Behaviour::with_config(local_peer_id, kad_store, kad_config);
                let identify_config =
                    IdentifyConfig::new(MESSAGE_PROTOCOL.to_string(), key.public())
                        .with_push_listen_addr_updates(true)
                        .with_interval(Duration::from_secs(30));
                let identify = IdentifyBehavior::new(identify_config);
                let rr = RequestResponseBehavior::<Message, Ack>::new(
                    [(
                        StreamProtocol::new(MESSAGE_PROTOCOL),
                        RequestResponseProtocolSupport::Full,
                    )],
                    RequestResponseConfig::default(),
                );
                Behavior::new(kad, identify, rr)
            })?
            .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(Duration::from_secs(30)))
            .build();

        swarm.behaviour_mut().set_server_mode();
        swarm.listen_on(format!("/ip4/0.0.0.0/tcp/{}", config.listen_port).parse()?)?;
        if let Some(bootstrap) = &config.bootstrap {
            let remote: Multiaddr = bootstrap.parse()?;
            swarm.dial(remote)?;
            info!("dialing bootstrap node {bootstrap}");
        }

        let (mined_tx, mined_rx) = mpsc::channel(4);
        Ok(Server {
            mining_address: mining_address.to_string(),
            swarm,
            inner: Arc::new(Mutex::new(ServerInner {
                known_peers: HashSet::new(),
                utxo,
                blocks_in_transit: Vec::new(),
                mempool: HashMap::new(),
            })),
            mined_tx,
            mined_rx,
            mining: None,
        })
    }

    /// Drives the node: swarm events and finished mining runs, one at a
    /// time. Peer I/O never blocks on mining; mining never blocks the loop.
    pub async fn run(&mut self) -> Result<()> {
        if self.mining_address.is_empty() {
            info!("node started");
        } else {
            info!("node started, mining rewards go to {}", self.mining_address);
        }
        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => {
                    if let Err(e) = self.handle_event(event) {
                        error!("event handling failed: {e}");
                    }
                }
                Some(outcome) = self.mined_rx.recv() => {
                    if let Err(e) = self.handle_mined(outcome) {
                        error!("mined block handling failed: {e}");
                    }
                }
            }
        }
    }

    /// One-shot client used by `send` without `-m`: dial the configured
    /// node, hand the transaction over, wait for the acknowledgement.
    pub async fn send_transaction(config: &Config, tx: &Transaction, utxo: UTXOSet) -> Result<()> {
        if config.bootstrap.is_none() {
            return Err(format_err!("no node address to hand the transaction to"));
        }
        let mut cfg = config.clone();
        // throwaway client, must not collide with a running node's port
        cfg.listen_port = 0;
        let mut server = Server::new(&cfg, "", utxo)?;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
        let mut sent = false;
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .ok_or_else(|| format_err!("timed out handing transaction to the network"))?;
            let event = tokio::time::timeout(remaining, server.swarm.select_next_some())
                .await
                .map_err(|_| format_err!("timed out handing transaction to the network"))?;
            match event {
                SwarmEvent::Behaviour(BehaviorEvent::Identify(IdentifyEvent::Received {
                    peer_id,
                    info,
                    ..
                })) => {
                    for addr in info.listen_addrs {
                        server.swarm.behaviour_mut().register_addr_rr(&peer_id, addr);
                    }
                    if !sent {
                        server.send_tx(&peer_id, tx)?;
                        info!("transaction {} handed to {peer_id}", tx.id);
                        sent = true;
                    }
                }
                SwarmEvent::Behaviour(BehaviorEvent::RequestResponse(
                    RequestResponseEvent::Message {
                        message: RequestResponseMessage::Response { .. },
                        ..
                    },
                )) if sent => return Ok(()),
                SwarmEvent::Behaviour(BehaviorEvent::RequestResponse(
                    RequestResponseEvent::OutboundFailure { error, .. },
                )) if sent => {
                    return Err(format_err!("failed to deliver transaction: {error}"));
                }
                _ => {}
            }
        }
    }

    fn handle_event(&mut self, event: SwarmEvent<BehaviorEvent>) -> Result<()> {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => info!("listening on {address}"),
            SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                debug!("connection established with {peer_id}");
            }
            SwarmEvent::ConnectionClosed { peer_id, .. } => {
                // in-flight state for that peer dies with the connection
                self.remove_peer(&peer_id);
                info!("peer {peer_id} disconnected");
            }
            SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                warn!("outgoing connection to {peer_id:?} failed: {error}");
            }
            SwarmEvent::IncomingConnectionError { error, .. } => {
                warn!("incoming connection failed: {error}");
            }
            SwarmEvent::Behaviour(BehaviorEvent::Identify(event)) => {
                self.handle_identify(event)?;
            }
            SwarmEvent::Behaviour(BehaviorEvent::RequestResponse(event)) => {
                self.handle_request_response(event)?;
            }
            SwarmEvent::Behaviour(BehaviorEvent::Kad(event)) => {
                if let kad::Event::RoutingUpdated { peer, .. } = event {
                    debug!("routing table updated for {peer}");
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn handle_identify(&mut self, event: IdentifyEvent) -> Result<()> {
        match event {
            IdentifyEvent::Received { peer_id, info, .. } => {
                for addr in info.listen_addrs {
                    let routing = self
                        .swarm
                        .behaviour_mut()
                        .register_addr_kad(&peer_id, addr.clone());
                    if let RoutingUpdate::Failed = routing {
                        warn!("failed to register {peer_id} with the routing table");
                    }
                    self.swarm.behaviour_mut().register_addr_rr(&peer_id, addr);
                }
                if self.add_peer(&peer_id) {
                    info!("handshaking with new peer {peer_id}");
                    self.send_version(&peer_id)?;
                }
            }
            IdentifyEvent::Sent { peer_id, .. } => debug!("identify sent to {peer_id}"),
            _ => {}
        }
        Ok(())
    }

    fn handle_request_response(
        &mut self,
        event: RequestResponseEvent<Message, Ack>,
    ) -> Result<()> {
        match event {
            RequestResponseEvent::Message { peer, message, .. } => match message {
                RequestResponseMessage::Request {
                    request, channel, ..
                } => {
                    if self.swarm.behaviour_mut().acknowledge(channel).is_err() {
                        debug!("peer {peer} hung up before the acknowledgement");
                    }
                    if let Err(e) = self.handle_message(request, &peer) {
                        // a misbehaving peer is dropped; everything else is
                        // logged and the node keeps going
                        if let Some(NodeError::ProtocolError { .. }) =
                            e.downcast_ref::<NodeError>()
                        {
                            warn!("{e}; dropping peer {peer}");
                            self.drop_peer(&peer);
                        } else {
                            error!("failed to handle message from {peer}: {e}");
                        }
                    }
                }
                RequestResponseMessage::Response { .. } => {}
            },
            RequestResponseEvent::InboundFailure { peer, error, .. } => {
                warn!("unknown or malformed command from {peer} ignored: {error}");
            }
            RequestResponseEvent::OutboundFailure { peer, error, .. } => {
                warn!("request to {peer} failed: {error}");
            }
            RequestResponseEvent::ResponseSent { .. } => {}
            _ => {}
        }
        Ok(())
    }

    fn handle_message(&mut self, message: Message, peer: &PeerId) -> Result<()> {
        match message {
            Message::Version(data) => self.handle_version(data, peer),
            Message::GetBlocks => self.handle_get_blocks(peer),
            Message::Inv(data) => self.handle_inv(data, peer),
            Message::GetData(data) => self.handle_get_data(data, peer),
            Message::Block(data) => self.handle_block(data, peer),
            Message::Tx(data) => self.handle_tx(data, peer),
        }
    }

    fn handle_version(&mut self, msg: Versionmsg, peer: &PeerId) -> Result<()> {
        info!("peer {peer} is at height {}", msg.best_height);
        if msg.version != PROTOCOL_VERSION {
            return Err(NodeError::ProtocolError {
                peer: peer.to_string(),
                reason: format!("unsupported protocol version {}", msg.version),
            }
            .into());
        }
        self.add_peer(peer);
        let my_height = self.get_best_height()?;
        if my_height < msg.best_height {
            self.send_get_blocks(peer)?;
        } else if my_height > msg.best_height {
            self.send_version(peer)?;
        }
        Ok(())
    }

    fn handle_get_blocks(&mut self, peer: &PeerId) -> Result<()> {
        debug!("peer {peer} asked for our block inventory");
        let hashes = self.inner.lock().unwrap().utxo.blockchain.get_block_hashes();
        self.send_inv(peer, DataKind::Block, hashes)
    }

    fn handle_inv(&mut self, msg: Invmsg, peer: &PeerId) -> Result<()> {
        debug!("inventory from {peer}: {:?} x{}", msg.kind, msg.items.len());
        if msg.items.is_empty() {
            return Err(NodeError::ProtocolError {
                peer: peer.to_string(),
                reason: String::from("empty inventory"),
            }
            .into());
        }
        match msg.kind {
            DataKind::Block => {
                // keep only what we miss, oldest first, so every arriving
                // block finds its parent and its inputs already present
                let mut unknown = Vec::new();
                for hash in &msg.items {
                    if !self.has_block(hash)? {
                        unknown.push(hash.clone());
                    }
                }
                unknown.reverse();
                if unknown.is_empty() {
                    debug!("already in sync with {peer}");
                    return Ok(());
                }
                let first = unknown.remove(0);
                self.replace_in_transit(unknown);
                self.send_get_data(peer, DataKind::Block, &first)
            }
            DataKind::Tx => {
                let txid = &msg.items[0];
                if self.get_mempool_tx(txid).is_none() {
                    self.send_get_data(peer, DataKind::Tx, txid)?;
                }
                Ok(())
            }
        }
    }

    fn handle_get_data(&mut self, msg: GetDatamsg, peer: &PeerId) -> Result<()> {
        debug!("peer {peer} requested {:?} {}", msg.kind, msg.id);
        match msg.kind {
            DataKind::Block => {
                let block = self.get_block(&msg.id).map_err(|_| NodeError::ProtocolError {
                    peer: peer.to_string(),
                    reason: format!("requested unknown block {}", msg.id),
                })?;
                self.send_block(peer, &block)
            }
            DataKind::Tx => {
                let tx = self
                    .get_mempool_tx(&msg.id)
                    .ok_or_else(|| NodeError::ProtocolError {
                        peer: peer.to_string(),
                        reason: format!("requested unknown transaction {}", msg.id),
                    })?;
                self.send_tx(peer, &tx)
            }
        }
    }

    fn handle_block(&mut self, msg: Blockmsg, peer: &PeerId) -> Result<()> {
        let block = msg.block;
        info!(
            "received block {} at height {} from {peer}",
            block.get_hash(),
            block.get_height()
        );
        let status = self.ingest_block(&block)?;
        if let BlockStatus::Fork = status {
            debug!("kept {} as a side branch", block.get_hash());
        }

        let mut in_transit = self.get_in_transit();
        if !in_transit.is_empty() {
            let next = in_transit.remove(0);
            self.replace_in_transit(in_transit);
            self.send_get_data(peer, DataKind::Block, &next)?;
        } else if matches!(status, BlockStatus::Appended | BlockStatus::Reorganized) {
            debug!("synced at height {}", self.get_best_height()?);
        }
        Ok(())
    }

    fn handle_tx(&mut self, msg: Txmsg, peer: &PeerId) -> Result<()> {
        let tx = msg.transaction;
        info!("received transaction {} from {peer}", tx.id);
        if self.get_mempool_tx(&tx.id).is_some() {
            return Ok(());
        }
        if let Err(e) = self.admit_tx(&tx) {
            // rejected from the pool; the sending peer stays connected
            warn!("{e}");
            return Ok(());
        }
        self.insert_mempool(tx.clone());

        let local = *self.swarm.local_peer_id();
        for node in self.get_known_peers() {
            if node != local && &node != peer {
                self.send_inv(&node, DataKind::Tx, vec![tx.id.clone()])?;
            }
        }
        self.maybe_start_mining()
    }

    /// Accepts a block into the chain and keeps the UTXO view and mempool in
    /// step. A moved tip preempts any in-flight mining run.
    fn ingest_block(&self, block: &Block) -> Result<BlockStatus> {
        let mut inner = self.inner.lock().unwrap();
        let status = inner.utxo.blockchain.add_block(block.clone())?;
        match status {
            BlockStatus::Appended => inner.utxo.update(block)?,
            BlockStatus::Reorganized => inner.utxo.reindex()?,
            BlockStatus::Fork | BlockStatus::Known => return Ok(status),
        }
        for tx in block.get_transactions() {
            inner.mempool.remove(&tx.id);
        }
        if let Some(cancel) = &self.mining {
            cancel.cancel();
        }
        Ok(status)
    }

    /// Pool admission: signatures verify, every input is unspent in the UTXO
    /// view, and no pooled transaction already claims one of the inputs.
    fn admit_tx(&self, tx: &Transaction) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        inner.utxo.validate_transaction(tx)?;
        for vin in &tx.vin {
            let claimed = inner.mempool.values().any(|pooled| {
                pooled
                    .vin
                    .iter()
                    .any(|p| p.txid == vin.txid && p.vout == vin.vout)
            });
            if claimed {
                return Err(NodeError::InvalidTransaction {
                    id: tx.id.clone(),
                    reason: format!(
                        "input ({}, {}) already claimed by a pooled transaction",
                        vin.txid, vin.vout
                    ),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Kicks off a background mining run once enough verified transactions
    /// are pooled. The run owns a cancel token and reports back over the
    /// mined-block channel.
    fn maybe_start_mining(&mut self) -> Result<()> {
        if self.mining_address.is_empty() || self.mining.is_some() {
            return Ok(());
        }
        let (txs, prev_hash, height) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.mempool.len() < MINE_POOL_THRESHOLD {
                return Ok(());
            }
            let mut txs = Vec::new();
            let mut stale = Vec::new();
            for tx in inner.mempool.values() {
                if inner.utxo.blockchain.verify_transaction(tx)? {
                    txs.push(tx.clone());
                } else {
                    stale.push(tx.id.clone());
                }
            }
            for id in stale {
                warn!("dropping unverifiable pooled transaction {id}");
                inner.mempool.remove(&id);
            }
            if txs.is_empty() {
                return Ok(());
            }
            txs.push(Transaction::new_coinbase(
                self.mining_address.clone(),
                String::new(),
            )?);
            let prev_hash = inner.utxo.blockchain.get_tip_hash();
            let height = inner.utxo.blockchain.get_best_height()?;
            (txs, prev_hash, height)
        };

        let cancel = CancelToken::new();
        self.mining = Some(cancel.clone());
        let sender = self.mined_tx.clone();
        info!(
            "mining a block with {} transactions at height {}",
            txs.len(),
            height + 1
        );
        tokio::task::spawn_blocking(move || {
            let outcome = Block::mine(txs, prev_hash, height + 1, &cancel);
            let _ = sender.blocking_send(outcome);
        });
        Ok(())
    }

    fn handle_mined(&mut self, outcome: MineOutcome) -> Result<()> {
        self.mining = None;
        match outcome {
            Ok(Some(block)) => {
                let status = self.ingest_block(&block)?;
                if let BlockStatus::Appended = status {
                    info!(
                        "mined block {} at height {}",
                        block.get_hash(),
                        block.get_height()
                    );
                    let local = *self.swarm.local_peer_id();
                    for node in self.get_known_peers() {
                        if node != local {
                            self.send_inv(&node, DataKind::Block, vec![block.get_hash()])?;
                        }
                    }
                } else {
                    warn!("mined block {} went stale: {status:?}", block.get_hash());
                }
            }
            Ok(None) => debug!("mining run cancelled by a newer tip"),
            Err(e) => error!("mining failed: {e}"),
        }
        // pooled transactions may still be waiting on a fresh tip
        self.maybe_start_mining()
    }

    fn send_version(&mut self, peer_id: &PeerId) -> Result<()> {
        let data = Message::Version(Versionmsg {
            version: PROTOCOL_VERSION,
            best_height: self.get_best_height()?,
        });
        self.send_data(peer_id, data)
    }

    fn send_get_blocks(&mut self, peer_id: &PeerId) -> Result<()> {
        self.send_data(peer_id, Message::GetBlocks)
    }

    fn send_inv(&mut self, peer_id: &PeerId, kind: DataKind, items: Vec<String>) -> Result<()> {
        debug!("send inv {kind:?} x{} to {peer_id}", items.len());
        self.send_data(peer_id, Message::Inv(Invmsg { kind, items }))
    }

    fn send_get_data(&mut self, peer_id: &PeerId, kind: DataKind, id: &str) -> Result<()> {
        self.send_data(
            peer_id,
            Message::GetData(GetDatamsg {
                kind,
                id: id.to_string(),
            }),
        )
    }

    fn send_block(&mut self, peer_id: &PeerId, block: &Block) -> Result<()> {
        debug!("send block {} to {peer_id}", block.get_hash());
        self.send_data(
            peer_id,
            Message::Block(Blockmsg {
                block: block.clone(),
            }),
        )
    }

    fn send_tx(&mut self, peer_id: &PeerId, tx: &Transaction) -> Result<()> {
        debug!("send tx {} to {peer_id}", tx.id);
        self.send_data(
            peer_id,
            Message::Tx(Txmsg {
                transaction: tx.clone(),
            }),
        )
    }

    fn send_data(&mut self, peer_id: &PeerId, data: Message) -> Result<()> {
        if peer_id == self.swarm.local_peer_id() {
            return Ok(());
        }
        let request_id = self.swarm.behaviour_mut().send_message(peer_id, data);
        debug!("request {request_id} sent to {peer_id}");
        Ok(())
    }

    fn add_peer(&self, peer_id: &PeerId) -> bool {
        self.inner.lock().unwrap().known_peers.insert(*peer_id)
    }

    fn remove_peer(&self, peer_id: &PeerId) {
        self.inner.lock().unwrap().known_peers.remove(peer_id);
    }

    fn drop_peer(&mut self, peer_id: &PeerId) {
        self.remove_peer(peer_id);
        let _ = self.swarm.disconnect_peer_id(*peer_id);
    }

    fn get_known_peers(&self) -> HashSet<PeerId> {
        self.inner.lock().unwrap().known_peers.clone()
    }

    fn get_mempool_tx(&self, txid: &str) -> Option<Transaction> {
        self.inner.lock().unwrap().mempool.get(txid).cloned()
    }

    fn insert_mempool(&self, tx: Transaction) {
        self.inner.lock().unwrap().mempool.insert(tx.id.clone(), tx);
    }

    fn get_in_transit(&self) -> Vec<String> {
        self.inner.lock().unwrap().blocks_in_transit.clone()
    }

    fn replace_in_transit(&self, hashes: Vec<String>) {
        self.inner.lock().unwrap().blocks_in_transit = hashes;
    }

    fn get_block(&self, hash: &str) -> Result<Block> {
        self.inner.lock().unwrap().utxo.blockchain.get_block(hash)
    }

    fn has_block(&self, hash: &str) -> Result<bool> {
        self.inner.lock().unwrap().utxo.blockchain.has_block(hash)
    }

    fn get_best_height(&self) -> Result<i32> {
        self.inner.lock().unwrap().utxo.blockchain.get_best_height()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::Blockchain;
    use crate::tx::{TXInput, TXOutput};
    use crate::wallet::{hash_pub_key, Wallets};

    #[tokio::test]
    async fn test_pool_rejects_conflicting_spend() {
        let dir = tempfile::tempdir().unwrap();
        let mut ws = Wallets::new(dir.path()).unwrap();
        let a = ws.create_wallet();
        let b = ws.create_wallet();
        let blockchain = Blockchain::create(dir.path(), &a).unwrap();
        let utxo = UTXOSet { blockchain };
        utxo.reindex().unwrap();

        let config = Config {
            data_dir: dir.path().to_path_buf(),
            listen_port: 0,
            bootstrap: None,
        };
        let server = Server::new(&config, "", utxo.clone()).unwrap();

        let wallet_a = ws.get_wallet(&a).unwrap();
        let t1 = Transaction::new_utxo(wallet_a, &b, 4, &utxo).unwrap();
        server.admit_tx(&t1).unwrap();
        server.insert_mempool(t1.clone());

        // a second spend of the same output must not join the pool
        let mut pub_key_hash = wallet_a.public_key.clone();
        hash_pub_key(&mut pub_key_hash);
        let mut t2 = Transaction {
            id: String::new(),
            vin: vec![TXInput {
                txid: t1.vin[0].txid.clone(),
                vout: t1.vin[0].vout,
                signature: Vec::new(),
                pub_key: wallet_a.public_key.clone(),
            }],
            vout: vec![
                TXOutput::new(4, &b).unwrap(),
                TXOutput::new_with_key_hash(6, pub_key_hash),
            ],
        };
        t2.id = t2.hash().unwrap();
        utxo.blockchain
            .sign_transaction(&mut t2, &wallet_a.secret_key)
            .unwrap();

        let err = server.admit_tx(&t2).unwrap_err();
        match err.downcast_ref::<NodeError>() {
            Some(NodeError::InvalidTransaction { reason, .. }) => {
                assert!(reason.contains("already claimed"), "unexpected reason: {reason}");
            }
            other => panic!("expected InvalidTransaction, got {other:?}"),
        }
    }
}
