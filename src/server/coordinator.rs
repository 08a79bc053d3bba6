//! Keystone write coordinator module implementation.
//!
//! The coordinator is the client-facing half of the two-phase protocol. It
//! is stateless and runs in the caller's task: per operation it generates a
//! fresh random tag, snapshots `(masters, w)` once from configuration, and
//! performs a Promise fan-out followed by (on quorum) a Commit fan-out. A
//! failed quorum is always followed by a best-effort Abort fan-out so
//! losing reservations do not linger past the lock sweep.

use crate::server::{
    ClusterConfig, LockTag, NodeId, NodeReply, NodeRequest, PeerCaller,
};
use crate::utils::KeystoneError;

use serde::{Deserialize, Serialize};

use tokio::sync::watch;
use tokio::time::{Duration, Instant};

/// Quorum tally of a successful write operation: the threshold in effect,
/// the number of masters that granted the promise, and the number of nodes
/// that acknowledged the commit.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub struct QuorumStats {
    pub w: u8,
    pub voted: u8,
    pub committed: u8,
}

/// Client-visible outcome of a coordinated write operation.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum OpOutcome {
    /// Promise quorum achieved and commit fan-out performed.
    Committed(QuorumStats),

    /// Fewer than `w` masters granted the promise; the attempt was aborted.
    NoQuorum {
        /// Quorum threshold the attempt was checked against.
        w: u8,

        /// Number of masters that granted the promise.
        voted: u8,
    },
}

/// The stateless write coordinator.
#[derive(Debug, Clone)]
pub(crate) struct Coordinator {
    /// My node ID.
    me: NodeId,

    /// Peer caller handle of the transport hub.
    caller: PeerCaller,

    /// Configuration snapshots source.
    config: watch::Receiver<ClusterConfig>,
}

impl Coordinator {
    /// Creates a new coordinator handle.
    pub(crate) fn new(
        me: NodeId,
        caller: PeerCaller,
        config: watch::Receiver<ClusterConfig>,
    ) -> Self {
        Coordinator { me, caller, config }
    }

    /// Acquires the lock on a key expected to be absent, installing `value`
    /// with a lease of `lease_ms`.
    pub(crate) async fn lock(
        &self,
        key: String,
        value: String,
        lease_ms: u64,
        timeout: Duration,
    ) -> Result<OpOutcome, KeystoneError> {
        let config = self.config.borrow().clone();
        let tag: LockTag = rand::random();

        let voted = self
            .promise_phase(&config.masters, &key, None, tag, timeout)
            .await?;
        if voted < config.w {
            self.abort_attempt(&config.masters, tag)?;
            return Ok(OpOutcome::NoQuorum { w: config.w, voted });
        }

        // commit goes to all masters, not only those that promised: a
        // master that missed the promise is brought to consistent state by
        // the blind commit, since quorum has been proven
        let committed = self
            .commit_phase(
                &config.masters,
                NodeRequest::Commit {
                    tag,
                    key,
                    value,
                    lease_ms,
                },
                timeout,
            )
            .await?;
        Ok(OpOutcome::Committed(QuorumStats {
            w: config.w,
            voted,
            committed,
        }))
    }

    /// Releases a held key. Ownership is proven by the promise phase CAS on
    /// the caller-supplied value. Replicas learn the deletion synchronously
    /// here rather than waiting for the next log push.
    pub(crate) async fn release(
        &self,
        key: String,
        value: String,
        timeout: Duration,
    ) -> Result<OpOutcome, KeystoneError> {
        let config = self.config.borrow().clone();
        let tag: LockTag = rand::random();

        let voted = self
            .promise_phase(
                &config.masters,
                &key,
                Some(value.clone()),
                tag,
                timeout,
            )
            .await?;
        if voted < config.w {
            self.abort_attempt(&config.masters, tag)?;
            return Ok(OpOutcome::NoQuorum { w: config.w, voted });
        }

        let mut targets = config.masters.clone();
        targets.extend(config.replicas.iter().copied());
        let committed = self
            .commit_phase(
                &targets,
                NodeRequest::ReleaseCommit { tag, key, value },
                timeout,
            )
            .await?;
        Ok(OpOutcome::Committed(QuorumStats {
            w: config.w,
            voted,
            committed,
        }))
    }

    /// Renews the lease on a held key. Sent to masters only; replicas learn
    /// the new expiry through the next log push.
    pub(crate) async fn extend_lease(
        &self,
        key: String,
        value: String,
        lease_ms: u64,
        timeout: Duration,
    ) -> Result<OpOutcome, KeystoneError> {
        let config = self.config.borrow().clone();
        let tag: LockTag = rand::random();

        let voted = self
            .promise_phase(
                &config.masters,
                &key,
                Some(value.clone()),
                tag,
                timeout,
            )
            .await?;
        if voted < config.w {
            self.abort_attempt(&config.masters, tag)?;
            return Ok(OpOutcome::NoQuorum { w: config.w, voted });
        }

        let replies = self
            .caller
            .multi_call(
                &config.masters,
                NodeRequest::ExtendCommit {
                    tag,
                    key,
                    value,
                    lease_ms,
                },
                timeout,
            )
            .await?;
        let committed = replies
            .values()
            .filter(|r| matches!(r, Some(NodeReply::Ok)))
            .count() as u8;

        // nodes that rejected the extend-commit still hold this tag's
        // promise; clear it since no commit landed there
        let rejected: Vec<NodeId> = replies
            .iter()
            .filter(|(_, r)| {
                matches!(
                    r,
                    Some(NodeReply::NotOwner) | Some(NodeReply::NotFound)
                )
            })
            .map(|(&id, _)| id)
            .collect();
        if !rejected.is_empty() {
            self.abort_attempt(&rejected, tag)?;
        }

        Ok(OpOutcome::Committed(QuorumStats {
            w: config.w,
            voted,
            committed,
        }))
    }

    /// Measures the quorum round-trip latency by timing an `Abort` of a
    /// fresh (therefore unheld) tag across all masters. Abort is idempotent
    /// and never fails, making it a harmless probe. Returns the elapsed
    /// milliseconds and the number of masters counted down.
    pub(crate) async fn lag(
        &self,
        timeout: Duration,
    ) -> Result<(u64, u8), KeystoneError> {
        let config = self.config.borrow().clone();
        let tag: LockTag = rand::random();

        let start = Instant::now();
        let replies = self
            .caller
            .multi_call(&config.masters, NodeRequest::Abort { tag }, timeout)
            .await?;
        let elapsed = start.elapsed().as_millis() as u64;
        let down = replies.values().filter(|r| r.is_none()).count() as u8;
        Ok((elapsed, down))
    }

    /// Promise fan-out: returns the number of masters that granted the
    /// reservation. Unreachable or late masters count as negative votes.
    async fn promise_phase(
        &self,
        masters: &[NodeId],
        key: &str,
        expected: Option<String>,
        tag: LockTag,
        timeout: Duration,
    ) -> Result<u8, KeystoneError> {
        let replies = self
            .caller
            .multi_call(
                masters,
                NodeRequest::Promise {
                    key: key.to_string(),
                    expected,
                    tag,
                },
                timeout,
            )
            .await?;
        let voted = replies
            .values()
            .filter(|r| matches!(r, Some(NodeReply::Ok)))
            .count() as u8;
        pf_trace!(self.me;
                  "promise tally for tag {:032x}: {} / {}",
                  tag, voted, masters.len());
        Ok(voted)
    }

    /// Commit fan-out counting successful applications.
    async fn commit_phase(
        &self,
        targets: &[NodeId],
        req: NodeRequest,
        timeout: Duration,
    ) -> Result<u8, KeystoneError> {
        let replies = self.caller.multi_call(targets, req, timeout).await?;
        Ok(replies
            .values()
            .filter(|r| matches!(r, Some(NodeReply::Ok)))
            .count() as u8)
    }

    /// Best-effort Abort fan-out for a failed or partially-rejected
    /// attempt. Fire-and-forget; stragglers are cleaned by the lock sweep.
    fn abort_attempt(
        &self,
        targets: &[NodeId],
        tag: LockTag,
    ) -> Result<(), KeystoneError> {
        pf_debug!(self.me; "aborting attempt tag {:032x}", tag);
        self.caller
            .call_forget(targets, NodeRequest::Abort { tag })
    }
}
