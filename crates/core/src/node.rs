/// CareLedger node runtime
///
/// Ties the ledger state to the peer network: local operations mutate the
/// state under its lock, then gossip the result once the lock is released.
/// Background tasks accept peers, keep configured peers connected and pull
/// peers' chains once shortly after startup.

use crate::consensus::{Block, HistoryEntry, LedgerState, MinedBlock, MinerContext, Transaction};
use crate::network::message_dispatcher::reward_broadcasts;
use crate::network::{
    ConnectionHandler, ConnectionManager, MessageDispatcher, PeerAction, PeerSummary,
};
use crate::protocol::{HelloMessage, Message, MessagePayload};
use crate::transport::{Endpoint, EndpointConfig, EndpointError};
use crate::workflow::{capabilities_for, Capabilities, WorkflowAction, WorkflowOutcome};
use anyhow::{Context, Result};
use careledger_common::{AccountId, LedgerError, NetworkAddress, NodeConfig, Role};
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Main CareLedger node runtime
pub struct Node {
    config: NodeConfig,

    /// Account this node's operator acts as
    account: AccountId,

    /// Chain, pending pool and balances behind one lock
    state: Arc<RwLock<LedgerState>>,

    /// Workflow strategy for the configured role
    capabilities: Box<dyn Capabilities>,

    /// Present once the node has started
    network: Option<NetworkHandle>,

    tasks: Vec<JoinHandle<()>>,

    running: Arc<RwLock<bool>>,
}

/// Outcome of asking every peer for its chain
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub peers_asked: usize,
    pub replies: usize,
    /// Length of the adopted chain, if any reply replaced ours
    pub adopted: Option<usize>,
    pub chain_length: usize,
}

/// Node status
#[derive(Debug, Clone, Serialize)]
pub struct NodeStats {
    pub node_name: String,
    pub account: AccountId,
    pub role: Role,
    pub listen_addr: Option<SocketAddr>,
    pub is_running: bool,
    pub chain_length: usize,
    pub tip_hash: String,
    pub pending: usize,
    pub accounts: usize,
    pub peer_count: usize,
}

impl Node {
    /// Create a node with the given configuration; nothing is bound until `start`
    pub async fn new(config: NodeConfig) -> Result<Self> {
        let account = config.account_id()?;
        let capabilities = capabilities_for(config.role, account.clone());

        info!(
            "Initializing node {} as {} ({})",
            config.node_name, account, config.role
        );

        Ok(Self {
            state: Arc::new(RwLock::new(LedgerState::new(config.allow_empty_blocks))),
            account,
            capabilities,
            config,
            network: None,
            tasks: Vec::new(),
            running: Arc::new(RwLock::new(false)),
        })
    }

    /// Bind the QUIC endpoint and start the background tasks
    pub async fn start(&mut self) -> Result<()> {
        let bind_addr: SocketAddr = format!("{}:{}", self.config.listen_addr, self.config.listen_port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", self.config.listen_addr, self.config.listen_port))?;
        info!("Starting node on {}...", bind_addr);

        let endpoint = Arc::new(
            Endpoint::new(
                EndpointConfig::with_bind_addr(bind_addr)
                    .with_connect_timeout(self.config.connection_timeout()),
            )
            .await?,
        );

        let hello = HelloMessage::new(self.config.node_name.clone(), endpoint.local_addr().port())
            .with_account(self.account.clone(), self.config.role);
        let connections = Arc::new(ConnectionManager::new(endpoint.clone(), hello));
        let dispatcher = Arc::new(MessageDispatcher::new(self.state.clone(), connections.clone()));
        let network = NetworkHandle {
            connections,
            dispatcher,
        };

        *self.running.write().await = true;
        let acceptor = network.spawn_acceptor(endpoint, self.running.clone());
        let connector = self.spawn_connector(network.clone());
        let initial_sync = self.spawn_initial_sync(network.clone());
        self.tasks.extend([acceptor, connector, initial_sync]);
        self.network = Some(network);

        info!("Node started successfully");
        Ok(())
    }

    /// Stop background tasks and close every peer connection
    pub async fn stop(&self) -> Result<()> {
        info!("Stopping node...");
        *self.running.write().await = false;

        for task in &self.tasks {
            task.abort();
        }
        if let Some(network) = &self.network {
            network.connections.disconnect_all().await;
            network.connections.endpoint().close();
        }
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn account(&self) -> &AccountId {
        &self.account
    }

    pub fn role(&self) -> Role {
        self.config.role
    }

    /// Address peers can reach this node on, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.network
            .as_ref()
            .map(|network| network.connections.endpoint().local_addr())
    }

    /// Shared ledger state
    pub fn state(&self) -> Arc<RwLock<LedgerState>> {
        self.state.clone()
    }

    /// Admit a locally created transaction and gossip it
    pub async fn submit_transaction(&self, tx: Transaction) -> Result<Transaction, LedgerError> {
        let accepted = self.state.write().await.submit(tx)?;
        debug!("Submitted {} transaction {}", accepted.kind.kind_name(), accepted.id);

        self.broadcast(Message::new_transaction(accepted.clone())).await;
        Ok(accepted)
    }

    /// Mine pending transactions into a block and gossip it with any rewards it earned
    pub async fn mine(&self) -> Result<MinedBlock, LedgerError> {
        let mined = self.state.write().await.mine(&MinerContext::now())?;

        self.broadcast(Message::new_block(mined.block.clone())).await;
        for reward in &mined.rewards {
            self.broadcast(Message::new_transaction(reward.clone())).await;
        }
        Ok(mined)
    }

    async fn broadcast(&self, message: Message) {
        if let Some(network) = &self.network {
            network.connections.broadcast(&message, None).await;
        }
    }

    pub async fn get_balances(&self) -> BTreeMap<AccountId, i64> {
        self.state.read().await.balances()
    }

    pub async fn get_pending_transactions(&self) -> Vec<Transaction> {
        self.state.read().await.pool().pending().to_vec()
    }

    pub async fn get_chain(&self) -> Vec<Block> {
        self.state.read().await.chain().blocks().to_vec()
    }

    pub async fn patient_history(&self, patient_id: &str) -> Vec<HistoryEntry> {
        self.state.read().await.patient_history(patient_id)
    }

    /// Rebuild balances from the chain
    pub async fn recalc_balances(&self) -> Result<BTreeMap<AccountId, i64>, LedgerError> {
        self.state.write().await.recalc_balances()
    }

    /// Ask every peer for its chain and adopt the longest valid one
    pub async fn request_sync(&self) -> SyncReport {
        match &self.network {
            Some(network) => network.sync_chains().await,
            None => SyncReport {
                peers_asked: 0,
                replies: 0,
                adopted: None,
                chain_length: self.state.read().await.chain().len(),
            },
        }
    }

    pub async fn list_peers(&self) -> Vec<PeerSummary> {
        match &self.network {
            Some(network) => network.connections.list_peers().await,
            None => Vec::new(),
        }
    }

    /// Dial a peer by `host:port`, then learn its peers
    pub async fn connect_peer(&self, addr: &str) -> Result<(), LedgerError> {
        let addr: NetworkAddress = addr
            .parse()
            .map_err(|e: careledger_common::DomainError| LedgerError::malformed(e.to_string()))?;
        let network = self
            .network
            .as_ref()
            .ok_or_else(|| LedgerError::peer_unreachable("node is not started"))?;

        network
            .connect(&addr)
            .await
            .map_err(|e| LedgerError::peer_unreachable(format!("{}: {}", addr, e)))
    }

    /// Run a workflow action as this node's operator
    ///
    /// The first transaction is the record itself and must be admitted; any
    /// follow-up payment that the pool refuses is reported in the notes.
    pub async fn perform(&self, action: WorkflowAction) -> Result<WorkflowOutcome, LedgerError> {
        let planned = {
            let state = self.state.read().await;
            action.plan(self.capabilities.as_ref(), &state)?
        };
        info!(
            "{} {} performing {}",
            self.config.role,
            self.account,
            action.name()
        );

        let mut outcome = WorkflowOutcome {
            patient_id: planned.patient_id,
            transactions: Vec::new(),
            notes: planned.notes,
        };
        for (i, tx) in planned.transactions.into_iter().enumerate() {
            match self.submit_transaction(tx).await {
                Ok(accepted) => outcome.transactions.push(accepted),
                Err(e) if i == 0 => return Err(e),
                Err(e) => {
                    warn!("Follow-up transaction refused: {}", e);
                    outcome.notes.push(format!("Follow-up transaction refused: {}", e));
                }
            }
        }
        Ok(outcome)
    }

    pub async fn stats(&self) -> NodeStats {
        let ledger = self.state.read().await.stats();
        let peer_count = match &self.network {
            Some(network) => network.connections.connection_count().await,
            None => 0,
        };

        NodeStats {
            node_name: self.config.node_name.clone(),
            account: self.account.clone(),
            role: self.config.role,
            listen_addr: self.local_addr(),
            is_running: self.is_running().await,
            chain_length: ledger.chain_length,
            tip_hash: ledger.tip_hash.to_string(),
            pending: ledger.pending,
            accounts: ledger.accounts,
            peer_count,
        }
    }

    /// Keep configured peers connected
    fn spawn_connector(&self, network: NetworkHandle) -> JoinHandle<()> {
        let (peers, rejected) = self.config.peer_addresses();
        for peer in rejected {
            warn!("Ignoring invalid peer address {:?}", peer);
        }
        let interval = self.config.reconnect_interval();
        let running = self.running.clone();

        tokio::spawn(async move {
            if peers.is_empty() {
                return;
            }
            let mut ticker = tokio::time::interval(interval);
            while *running.read().await {
                ticker.tick().await;
                for peer in &peers {
                    if network.is_connected(peer).await {
                        continue;
                    }
                    if let Err(e) = network.connect(peer).await {
                        debug!("Could not reach peer {}: {}", peer, e);
                    }
                }
            }
        })
    }

    /// Pull peers' chains once the connector has had a chance to run
    fn spawn_initial_sync(&self, network: NetworkHandle) -> JoinHandle<()> {
        let delay = self.config.initial_sync_delay();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let report = network.sync_chains().await;
            info!(
                "Initial sync: {} of {} peers replied, chain length {}",
                report.replies, report.peers_asked, report.chain_length
            );
        })
    }
}

/// Shared handles the background tasks use to talk to peers
#[derive(Clone)]
struct NetworkHandle {
    connections: Arc<ConnectionManager>,
    dispatcher: Arc<MessageDispatcher>,
}

impl NetworkHandle {
    fn spawn_acceptor(&self, endpoint: Arc<Endpoint>, running: Arc<RwLock<bool>>) -> JoinHandle<()> {
        let network = self.clone();
        tokio::spawn(async move {
            while *running.read().await {
                let connection = match endpoint.accept().await {
                    Ok(connection) => connection,
                    Err(EndpointError::Closed) => break,
                    Err(e) => {
                        debug!("Inbound connection failed: {}", e);
                        continue;
                    }
                };

                let network = network.clone();
                tokio::spawn(async move {
                    match network.connections.accept_connection(connection).await {
                        Ok(handler) => network.serve(handler),
                        Err(e) => debug!("Inbound handshake failed: {}", e),
                    }
                });
            }
        })
    }

    /// Read the peer's streams until its connection closes
    fn serve(&self, handler: Arc<ConnectionHandler>) {
        let network = self.clone();
        tokio::spawn(async move {
            let peer = handler.peer_addr();
            handler
                .serve(|message| {
                    let network = network.clone();
                    async move { Ok(network.handle(message, peer).await) }
                })
                .await;

            if network.connections.remove_connection(&handler).await {
                info!("Peer {} disconnected", peer);
            }
        });
    }

    /// Apply one inbound message; follow-up gossip runs on its own task
    async fn handle(&self, message: Message, from: SocketAddr) -> Option<Message> {
        let dispatch = self.dispatcher.dispatch(message, from).await;
        if !dispatch.actions.is_empty() {
            let network = self.clone();
            tokio::spawn(async move { network.run_actions(dispatch.actions).await });
        }
        dispatch.reply
    }

    async fn run_actions(&self, actions: Vec<PeerAction>) {
        for action in actions {
            match action {
                PeerAction::Broadcast { message, exclude } => {
                    self.connections.broadcast(&message, exclude).await;
                }
                PeerAction::RequestChains => {
                    self.sync_chains().await;
                }
                PeerAction::Connect(addresses) => {
                    for addr in addresses {
                        if self.is_connected(&addr).await {
                            continue;
                        }
                        if let Err(e) = self.dial(&addr).await {
                            debug!("Could not reach advertised peer {}: {}", addr, e);
                        }
                    }
                }
            }
        }
    }

    async fn is_connected(&self, addr: &NetworkAddress) -> bool {
        match addr {
            NetworkAddress::Socket(socket_addr) => self.connections.is_connected(socket_addr).await,
            NetworkAddress::Domain { .. } => false,
        }
    }

    /// Connect and serve a peer
    async fn dial(&self, addr: &NetworkAddress) -> Result<Arc<ConnectionHandler>> {
        let handler = self.connections.connect_to_peer(addr).await?;
        self.serve(handler.clone());
        Ok(handler)
    }

    /// Connect to a peer, then to every peer it knows that we do not
    async fn connect(&self, addr: &NetworkAddress) -> Result<()> {
        let handler = self.dial(addr).await?;

        let reply = handler
            .send_request(&Message::new(MessagePayload::PeersRequest))
            .await?;
        if let MessagePayload::PeersResponse { peers } = reply.payload {
            for peer in peers {
                let Ok(peer_addr) = peer.parse::<NetworkAddress>() else {
                    continue;
                };
                if self.is_connected(&peer_addr).await {
                    continue;
                }
                if let Err(e) = self.dial(&peer_addr).await {
                    debug!("Could not reach peer {} learned from {}: {}", peer, addr, e);
                }
            }
        }
        Ok(())
    }

    /// Ask every peer for its chain; replies are offered in arrival order
    async fn sync_chains(&self) -> SyncReport {
        let peers_asked = self.connections.connection_count().await;
        let replies = self
            .connections
            .request_all(&Message::new(MessagePayload::ChainRequest))
            .await;

        let mut report = SyncReport {
            peers_asked,
            replies: replies.len(),
            adopted: None,
            chain_length: 0,
        };

        for (peer, reply) in replies {
            let blocks = match reply.payload {
                MessagePayload::ChainResponse { blocks } => blocks,
                other => {
                    debug!("Peer {} answered chain request with {}", peer, other.message_type());
                    continue;
                }
            };
            if let Ok(adoption) = self.dispatcher.offer_chain(blocks, peer).await {
                report.adopted = Some(adoption.length);
                for action in reward_broadcasts(adoption.rewards) {
                    if let PeerAction::Broadcast { message, exclude } = action {
                        self.connections.broadcast(&message, exclude).await;
                    }
                }
            }
        }

        report.chain_length = self.dispatcher.chain_length().await;
        report
    }
}
