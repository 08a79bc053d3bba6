//! Inter-node wire message types.

use crate::server::NodeId;

use get_size::GetSize;

use serde::{Deserialize, Serialize};

/// Per-attempt lock tag type. Generated fresh (randomly) by the coordinator
/// for every write attempt; correlates Promise, Commit, and Abort.
pub type LockTag = u128;

/// Request/reply correlation sequence number type.
pub(crate) type SeqNum = u64;

/// Transaction log record, appended by commits and drained by the
/// replication pump.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize, GetSize)]
pub(crate) enum LogRecord {
    /// Key was written with a fresh lease.
    Write {
        key: String,
        value: String,
        lease_ms: u64,
    },

    /// Key was deleted by an explicit release.
    Delete { key: String },
}

impl LogRecord {
    /// The key this record refers to.
    #[inline]
    pub(crate) fn key(&self) -> &str {
        match self {
            LogRecord::Write { key, .. } => key,
            LogRecord::Delete { key } => key,
        }
    }
}

/// Replied request to a node's state engine.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub(crate) enum NodeRequest {
    /// Phase-1 reservation of exclusive write intent for a key.
    Promise {
        key: String,
        /// Expected current value; `None` means the key is expected absent.
        expected: Option<String>,
        tag: LockTag,
    },

    /// Phase-2 unconditional write; clears the tag's lock rows.
    Commit {
        tag: LockTag,
        key: String,
        value: String,
        lease_ms: u64,
    },

    /// Drops all lock rows held under the tag. Idempotent.
    Abort { tag: LockTag },

    /// Phase-2 lease renewal; ownership identified by value match.
    ExtendCommit {
        tag: LockTag,
        key: String,
        value: String,
        lease_ms: u64,
    },

    /// Phase-2 deletion; ownership identified by value match.
    ReleaseCommit {
        tag: LockTag,
        key: String,
        value: String,
    },

    /// Administrative replacement of the master set.
    SetMasters { masters: Vec<NodeId> },

    /// Administrative replacement of the replica set.
    SetReplicas { replicas: Vec<NodeId> },

    /// Administrative replacement of the write quorum threshold.
    SetW { w: u8 },
}

/// Tagged engine reply. Expected protocol outcomes are values here, never
/// errors.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub(crate) enum NodeReply {
    /// Request took effect.
    Ok,

    /// Another promise currently holds the key.
    AlreadyLocked,

    /// Promise precondition (expected value) did not match.
    NotExpected,

    /// Extend/release value did not match the stored value.
    NotOwner,

    /// Extend/release on a key that is absent.
    NotFound,
}

/// Peer-peer message envelope.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub(crate) enum PeerMessage {
    /// Unicast request expecting a correlated reply.
    Request { seq: SeqNum, req: NodeRequest },

    /// Reply correlated to an earlier request.
    Reply { seq: SeqNum, reply: NodeReply },

    /// Asynchronous trans-log push; applied blindly, no reply.
    ApplyLog {
        origin: NodeId,
        records: Vec<LogRecord>,
    },
}

#[cfg(test)]
mod messages_tests {
    use super::*;

    #[test]
    fn record_key() {
        let w = LogRecord::Write {
            key: "k".into(),
            value: "v".into(),
            lease_ms: 1000,
        };
        let d = LogRecord::Delete { key: "j".into() };
        assert_eq!(w.key(), "k");
        assert_eq!(d.key(), "j");
    }

    #[test]
    fn envelope_roundtrip() -> Result<(), crate::utils::KeystoneError> {
        let msg = PeerMessage::Request {
            seq: 77,
            req: NodeRequest::Promise {
                key: "k".into(),
                expected: None,
                tag: 0xdead_beef_dead_beef_dead_beef_dead_beef,
            },
        };
        let bytes = bincode::serde::encode_to_vec(
            &msg,
            bincode::config::standard(),
        )?;
        let (back, _): (PeerMessage, usize) =
            bincode::serde::decode_from_slice(
                &bytes,
                bincode::config::standard(),
            )?;
        assert_eq!(back, msg);
        Ok(())
    }
}
