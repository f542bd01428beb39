use crate::consensus::{Block, Transaction};
use careledger_common::{protocol, AccountId, LedgerError, Role, Timestamp};
use serde::{Deserialize, Serialize};

/// Protocol message envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Message type and payload
    pub payload: MessagePayload,

    /// Message ID for tracing a message through logs
    pub message_id: MessageId,

    /// Timestamp when message was created
    pub timestamp: Timestamp,
}

impl Message {
    pub fn new(payload: MessagePayload) -> Self {
        Self {
            payload,
            message_id: MessageId::generate(),
            timestamp: Timestamp::now(),
        }
    }

    pub fn new_transaction(tx: Transaction) -> Self {
        Self::new(MessagePayload::NewTransaction(tx))
    }

    pub fn new_block(block: Block) -> Self {
        Self::new(MessagePayload::NewBlock(block))
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(MessagePayload::Error(ErrorMessage {
            code,
            message: message.into(),
        }))
    }

    pub fn message_type(&self) -> &str {
        self.payload.message_type()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, LedgerError> {
        serde_json::to_vec(self).map_err(|e| LedgerError::malformed(e.to_string()))
    }

    /// Decode and schema-check a message; unknown tags and missing fields
    /// are reported as malformed
    pub fn from_slice(bytes: &[u8]) -> Result<Self, LedgerError> {
        serde_json::from_slice(bytes).map_err(|e| LedgerError::malformed(e.to_string()))
    }
}

/// Unique message identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId([u8; 16]);

impl MessageId {
    pub fn generate() -> Self {
        use rand::Rng;
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..4]))
    }
}

/// All possible message types in the protocol
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MessagePayload {
    // Connection setup
    Hello(HelloMessage),
    HelloAck(HelloMessage),

    // Gossip
    NewTransaction(Transaction),
    NewBlock(Block),

    // Chain synchronisation
    ChainRequest,
    ChainResponse { blocks: Vec<Block> },

    // Peer exchange
    PeersRequest,
    PeersResponse { peers: Vec<String> },

    // General response
    Error(ErrorMessage),
}

impl MessagePayload {
    pub fn message_type(&self) -> &str {
        match self {
            Self::Hello(_) => "hello",
            Self::HelloAck(_) => "hello_ack",
            Self::NewTransaction(_) => "new_transaction",
            Self::NewBlock(_) => "new_block",
            Self::ChainRequest => "chain_request",
            Self::ChainResponse { .. } => "chain_response",
            Self::PeersRequest => "peers_request",
            Self::PeersResponse { .. } => "peers_response",
            Self::Error(_) => "error",
        }
    }

    /// Whether the sender waits for a reply on the same stream
    pub fn expects_reply(&self) -> bool {
        matches!(self, Self::Hello(_) | Self::ChainRequest | Self::PeersRequest)
    }
}

/// First message on every connection, sent by the dialling side and echoed
/// back as `HelloAck` by the listener
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloMessage {
    pub node_name: String,

    pub protocol_version: u32,

    /// Port the sender accepts peers on; combined with the connection's
    /// source IP it becomes the sender's peer address
    pub listen_port: u16,

    /// Random per-process value used to detect a node dialling itself
    pub session_id: u64,

    pub account: Option<AccountId>,

    pub role: Option<Role>,
}

impl HelloMessage {
    pub fn new(node_name: impl Into<String>, listen_port: u16) -> Self {
        use rand::Rng;
        Self {
            node_name: node_name.into(),
            protocol_version: protocol::VERSION,
            listen_port,
            session_id: rand::thread_rng().gen(),
            account: None,
            role: None,
        }
    }

    pub fn with_account(mut self, account: AccountId, role: Role) -> Self {
        self.account = Some(account);
        self.role = Some(role);
        self
    }
}

/// Generic error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    InvalidMessage,
    UnexpectedMessage,
    ProtocolVersionMismatch,
    SelfConnection,
    InternalError,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::TransactionKind;
    use std::collections::BTreeMap;

    fn sample_transaction() -> Transaction {
        Transaction::new(TransactionKind::TestResult {
            patient_id: "p-1".to_string(),
            test_name: "Blood Test".to_string(),
            performed_by: AccountId::new("lab_tech_bob").unwrap(),
            results: BTreeMap::from([("hemoglobin".to_string(), "13.5".to_string())]),
        })
    }

    #[test]
    fn test_message_id_generation() {
        assert_ne!(MessageId::generate(), MessageId::generate());
    }

    #[test]
    fn test_payload_is_tagged_by_type() {
        let msg = Message::new(MessagePayload::ChainRequest);
        let json: serde_json::Value = serde_json::from_slice(&msg.to_bytes().unwrap()).unwrap();
        assert_eq!(json["payload"]["type"], "ChainRequest");
    }

    #[test]
    fn test_transaction_survives_the_wire() {
        let tx = sample_transaction();
        let msg = Message::new_transaction(tx.clone());

        let decoded = Message::from_slice(&msg.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.message_id, msg.message_id);
        match decoded.payload {
            MessagePayload::NewTransaction(received) => assert_eq!(received, tx),
            other => panic!("unexpected payload {}", other.message_type()),
        }
    }

    #[test]
    fn test_block_survives_the_wire() {
        let block = Block::genesis();
        let msg = Message::new_block(block.clone());

        match Message::from_slice(&msg.to_bytes().unwrap()).unwrap().payload {
            MessagePayload::NewBlock(received) => {
                assert_eq!(received.hash, block.hash);
                assert_eq!(received.calculate_hash().unwrap(), block.hash);
            }
            other => panic!("unexpected payload {}", other.message_type()),
        }
    }

    #[test]
    fn test_unknown_tag_is_malformed() {
        let raw = br#"{"payload":{"type":"Teleport"},"message_id":[0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0],"timestamp":1}"#;
        let err = Message::from_slice(raw).unwrap_err();
        assert!(matches!(err, LedgerError::MalformedMessage(_)));
    }

    #[test]
    fn test_missing_field_is_malformed() {
        let raw = br#"{"payload":{"type":"ChainResponse"},"message_id":[0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0],"timestamp":1}"#;
        assert!(matches!(
            Message::from_slice(raw),
            Err(LedgerError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_request_kinds_expect_reply() {
        assert!(MessagePayload::ChainRequest.expects_reply());
        assert!(MessagePayload::PeersRequest.expects_reply());
        assert!(!MessagePayload::NewBlock(Block::genesis()).expects_reply());
    }
}
