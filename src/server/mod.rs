//! Keystone's server functionality modules.

mod coordinator;
mod engine;
mod external;
mod membership;
mod messages;
mod node;
mod shipper;
mod sweeper;
mod transport;

pub use coordinator::{OpOutcome, QuorumStats};
pub use external::{ApiCommand, ApiReply, ApiRequest, ApiResult, ClientId,
                   RequestId};
pub use membership::{ClusterConfig, NodeId};
pub use messages::LockTag;
pub use node::{KeystoneNode, ServerConfig};

pub(crate) use coordinator::Coordinator;
pub(crate) use engine::{EngineInput, LeaseEntry, LockEngine};
pub(crate) use external::ExternalApi;
pub(crate) use messages::{LogRecord, NodeReply, NodeRequest, PeerMessage,
                          SeqNum};
pub(crate) use shipper::LogShipper;
pub(crate) use sweeper::Sweeper;
pub(crate) use transport::{PeerCaller, TransportHub};
