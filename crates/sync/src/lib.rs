//! Chain sync for the staking indexer.
//!
//! One [`SyncCoordinator`] per network pulls transactions from a
//! [`ChainClient`] along two concurrent paths and feeds both through the same
//! [`Ingestor`]:
//!
//! ```text
//!            ChainClient
//!          ┌─────┴──────┐
//!      backfill        live
//!   (batches, pruning  (push feed,
//!    search, retries)   resubscribe)
//!          └─────┬──────┘
//!            Ingestor ── decode ── admit_and_apply ── on_transaction ── invalidate
//! ```
//!
//! A [`NetworkRegistry`] holds the coordinators of every configured network.

pub mod backfill;
pub mod client;
pub mod coordinator;
pub mod decoder;
pub mod error;
pub mod ingest;
pub mod live;
pub mod registry;
pub mod retry;
pub mod rpc;
pub mod status;

pub use backfill::{Backfill, BackfillReport};
pub use client::{BlockInfo, ChainClient, RawEvent, RawTransaction, TxOrigin};
pub use coordinator::{check_phases, SyncCoordinator, SyncSettings};
pub use decoder::{DecodedMessage, EventDecoder, MessageDecoder, MessageKind, StakeMessage};
pub use error::{ClientError, ClientResult, DecodeError, SyncError, SyncResult};
pub use ingest::{IngestReport, Ingestor};
pub use live::LiveFeed;
pub use registry::{NetworkRegistry, NetworkSync};
pub use retry::RetryPolicy;
pub use rpc::CometRpcClient;
pub use status::{StatusHandle, SyncStatus};
