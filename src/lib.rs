//! Public interface to the Keystone library, linked by both the server
//! executable and the client executable.
//!
//! Keystone is a distributed, decentralized, in-memory key-value store with
//! atomic check-and-set semantics over short-lived leases, intended as a
//! building block for coordination primitives: mutexes, leader election,
//! and advisory locks. Writes require a quorum across the configured master
//! set; reads are dirty local-snapshot reads.

#![allow(clippy::uninlined_format_args)]

#[macro_use]
mod utils;

mod client;
mod server;

pub use client::ClientApiStub;
pub use server::{
    ApiCommand, ApiReply, ApiRequest, ApiResult, ClientId, ClusterConfig,
    KeystoneNode, NodeId, QuorumStats, RequestId, ServerConfig,
};
pub use utils::KeystoneError;
