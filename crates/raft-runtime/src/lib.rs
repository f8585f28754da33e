//! # raft-runtime
//!
//! why: turn the pure raft-core state machine into running nodes
//! relations: drives raft_core::RaftNode, persists through raft_storage, used by the raft-cluster binary and tests
//! what: node actor and client handle, transport contract, in-process network, config, key-value state machine
//!
//! ```no_run
//! use raft_runtime::{ConsensusNode, KvCommand, KvStore, LocalNetwork, NodeConfig};
//! use raft_storage::InMemoryStorage;
//!
//! # async fn demo() -> raft_runtime::Result<()> {
//! let network = LocalNetwork::new();
//! let config = NodeConfig::new(1);
//! let node = ConsensusNode::new(&config, InMemoryStorage::new(), network.transport(1), KvStore::new())?;
//! let handle = node.spawn();
//! network.register(handle.clone()).await;
//!
//! let outcome = handle.submit(KvCommand::set("x", "1").to_bytes()).await?;
//! assert!(outcome.committed);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod local;
pub mod node;
pub mod state_machine;
pub mod transport;

pub use config::NodeConfig;
pub use error::{Error, Result};
pub use local::{LocalNetwork, LocalTransport};
pub use node::{ConsensusNode, RaftHandle, SubmitOutcome};
pub use state_machine::{KvCommand, KvStore, StateMachine};
pub use transport::{Transport, TransportError};
