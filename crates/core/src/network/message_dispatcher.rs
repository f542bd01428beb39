/// Routes inbound protocol messages onto the ledger
///
/// The dispatcher takes the ledger lock only for the duration of one ledger
/// step. Anything that has to go back out to the network is returned as a
/// list of `PeerAction`s for the caller to run after the lock is released.

use crate::consensus::{Block, BlockDecision, ChainAdoption, LedgerState, Transaction};
use crate::network::ConnectionManager;
use crate::protocol::{Message, MessagePayload};
use careledger_common::{LedgerError, NetworkAddress};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Network work left over after a message was applied
#[derive(Debug, Clone)]
pub enum PeerAction {
    /// Send to every peer except `exclude`
    Broadcast {
        message: Message,
        exclude: Option<SocketAddr>,
    },

    /// Ask every peer for its chain and consider each reply
    RequestChains,

    /// Dial addresses learned through peer exchange
    Connect(Vec<NetworkAddress>),
}

/// Reply for the sender plus follow-up work
#[derive(Debug, Default)]
pub struct Dispatch {
    pub reply: Option<Message>,
    pub actions: Vec<PeerAction>,
}

impl Dispatch {
    fn reply(message: Message) -> Self {
        Self {
            reply: Some(message),
            actions: Vec::new(),
        }
    }

    fn actions(actions: Vec<PeerAction>) -> Self {
        Self {
            reply: None,
            actions,
        }
    }
}

/// Message dispatcher
pub struct MessageDispatcher {
    state: Arc<RwLock<LedgerState>>,
    connections: Arc<ConnectionManager>,
}

impl MessageDispatcher {
    pub fn new(state: Arc<RwLock<LedgerState>>, connections: Arc<ConnectionManager>) -> Self {
        Self { state, connections }
    }

    /// Apply a message received from the peer at `from`
    pub async fn dispatch(&self, message: Message, from: SocketAddr) -> Dispatch {
        debug!("Dispatching {} from {}", message.message_type(), from);

        match message.payload {
            MessagePayload::Hello(_) => {
                Dispatch::reply(Message::new(MessagePayload::HelloAck(
                    self.connections.local_hello().clone(),
                )))
            }
            MessagePayload::NewTransaction(tx) => self.handle_new_transaction(tx, from).await,
            MessagePayload::NewBlock(block) => {
                let decision = self.state.write().await.consider_foreign_block(block.clone());
                match decision {
                    BlockDecision::Appended(rewards) => {
                        let mut actions = vec![PeerAction::Broadcast {
                            message: Message::new_block(block),
                            exclude: Some(from),
                        }];
                        actions.extend(reward_broadcasts(rewards));
                        Dispatch::actions(actions)
                    }
                    BlockDecision::AlreadyKnown => {
                        debug!("Block {} from {} already known", block.index, from);
                        Dispatch::default()
                    }
                    BlockDecision::PossibleFork => {
                        info!(
                            "Block {} from {} does not extend our tip; requesting chains",
                            block.index, from
                        );
                        Dispatch::actions(vec![PeerAction::RequestChains])
                    }
                    BlockDecision::Rejected(reason) => {
                        warn!("Rejected block {} from {}: {}", block.index, from, reason);
                        Dispatch::default()
                    }
                }
            }
            MessagePayload::ChainRequest => {
                let blocks = self.state.read().await.chain().blocks().to_vec();
                Dispatch::reply(Message::new(MessagePayload::ChainResponse { blocks }))
            }
            MessagePayload::ChainResponse { blocks } => match self.offer_chain(blocks, from).await {
                Ok(adoption) => Dispatch::actions(reward_broadcasts(adoption.rewards).collect()),
                Err(_) => Dispatch::default(),
            },
            MessagePayload::PeersRequest => {
                let peers = self
                    .connections
                    .peer_addresses()
                    .await
                    .into_iter()
                    .filter(|addr| *addr != from)
                    .map(|addr| addr.to_string())
                    .collect();
                Dispatch::reply(Message::new(MessagePayload::PeersResponse { peers }))
            }
            MessagePayload::PeersResponse { peers } => {
                let addresses: Vec<NetworkAddress> = peers
                    .iter()
                    .filter_map(|peer| match peer.parse() {
                        Ok(addr) => Some(addr),
                        Err(e) => {
                            debug!("Ignoring peer {:?} from {}: {}", peer, from, e);
                            None
                        }
                    })
                    .collect();
                if addresses.is_empty() {
                    Dispatch::default()
                } else {
                    Dispatch::actions(vec![PeerAction::Connect(addresses)])
                }
            }
            MessagePayload::HelloAck(_) => Dispatch::default(),
            MessagePayload::Error(err) => {
                warn!("Peer {} reported {:?}: {}", from, err.code, err.message);
                Dispatch::default()
            }
        }
    }

    async fn handle_new_transaction(
        &self,
        tx: Transaction,
        from: SocketAddr,
    ) -> Dispatch {
        let result = self.state.write().await.submit(tx);
        match result {
            Ok(tx) => {
                debug!("Accepted {} transaction {} from {}", tx.kind.kind_name(), tx.id, from);
                Dispatch::actions(vec![PeerAction::Broadcast {
                    message: Message::new_transaction(tx),
                    exclude: Some(from),
                }])
            }
            Err(LedgerError::DuplicateTransaction(id)) => {
                debug!("Transaction {} from {} already known", id, from);
                Dispatch::default()
            }
            Err(e) => {
                warn!("Rejected transaction from {}: {}", from, e);
                Dispatch::default()
            }
        }
    }

    pub async fn chain_length(&self) -> usize {
        self.state.read().await.chain().len()
    }

    /// Offer a peer's chain to the fork-choice rule
    pub async fn offer_chain(
        &self,
        blocks: Vec<Block>,
        from: SocketAddr,
    ) -> Result<ChainAdoption, LedgerError> {
        let result = self.state.write().await.consider_foreign_chain(blocks);
        match &result {
            Ok(adoption) => info!("Adopted chain of length {} from {}", adoption.length, from),
            Err(LedgerError::ChainNotLonger { local, candidate }) => debug!(
                "Chain from {} not longer ({} vs local {})",
                from, candidate, local
            ),
            Err(e) => warn!("Rejected chain from {}: {}", from, e),
        }
        result
    }
}

/// Newly queued rewards go to every peer
pub fn reward_broadcasts(rewards: Vec<Transaction>) -> impl Iterator<Item = PeerAction> {
    rewards.into_iter().map(|tx| PeerAction::Broadcast {
        message: Message::new_transaction(tx),
        exclude: None,
    })
}
