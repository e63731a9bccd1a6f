//! Chain node access.
//!
//! [`ChainClient`] is the only way the sync pipeline talks to a node. Raw
//! transactions are normalized here into [`RawTransaction`]: whatever shape the
//! node uses on the wire, the decoder only sees typed events with string
//! attributes.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::ClientResult;

/// Which ingestion path delivered a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOrigin {
    Backfill,
    Live,
}

/// One typed event emitted by a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub kind: String,
    pub attributes: Vec<(String, String)>,
}

impl RawEvent {
    pub fn new(kind: impl Into<String>, attributes: &[(&str, &str)]) -> Self {
        Self {
            kind: kind.into(),
            attributes: attributes
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    /// First value stored under `key`.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// First value stored under any of `keys`, in key order.
    pub fn any_attribute(&self, keys: &[&str]) -> Option<&str> {
        keys.iter().find_map(|key| self.attribute(key))
    }
}

/// A transaction as delivered by the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTransaction {
    pub hash: String,
    pub height: u64,
    /// Block time in Unix seconds. Live feeds may omit it; the pipeline fills
    /// it from the block before decoding.
    pub timestamp: Option<u64>,
    pub events: Vec<RawEvent>,
    pub origin: TxOrigin,
}

/// Header fields the sync needs from a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub height: u64,
    /// Unix seconds.
    pub timestamp: u64,
}

/// Read access to one chain node.
///
/// Heights the node has pruned must surface as
/// [`ClientError::Pruned`](crate::error::ClientError::Pruned) so the backfill
/// can search for the lowest available height.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Latest committed height.
    async fn current_height(&self) -> ClientResult<u64>;

    async fn block(&self, height: u64) -> ClientResult<BlockInfo>;

    /// Every transaction included at `height`.
    async fn block_transactions(&self, height: u64) -> ClientResult<Vec<RawTransaction>>;

    /// Feed of newly committed transactions.
    ///
    /// The channel closing means the subscription dropped; callers resubscribe.
    async fn subscribe(&self) -> ClientResult<mpsc::Receiver<RawTransaction>>;
}
