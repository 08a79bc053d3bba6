//! Keystone node state engine module implementation.
//!
//! The engine is the single-writer serialization point of a node: one
//! spawned task owns the data map, the lock map, and the trans-log buffer,
//! and processes all state-mutating inputs one at a time in arrival order.
//! This obviates per-key locking within a node and makes the expiration
//! sweeps trivially race-free against in-flight commits. Dirty readers hold
//! read handles of the data map and may observe a recent-but-not-latest
//! snapshot.

use std::collections::HashMap;
use std::mem;

use crate::server::{
    ClusterConfig, LockTag, LogRecord, NodeId, NodeReply, NodeRequest, SeqNum,
};
use crate::utils::KeystoneError;

use get_size::GetSize;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

/// A leased entry in the data map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LeaseEntry {
    /// Stored opaque value.
    pub(crate) value: String,

    /// Local-clock instant past which the lease sweep may remove the entry.
    pub(crate) expires_at: Instant,
}

/// An exclusive write reservation in the lock map. Keying the lock map by
/// `Key` makes the at-most-one-lock-per-key invariant structural.
#[derive(Debug, Clone, PartialEq, Eq)]
struct LockHold {
    tag: LockTag,
    acquired_at: Instant,
}

/// Cloned state snapshot for tests and observability: the lock map, the
/// data map, and their timer references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DebugSnapshot {
    /// Key -> (stored value, lease expiry instant).
    pub(crate) data: HashMap<String, (String, Instant)>,

    /// Key -> (holding tag, lock acquisition instant).
    pub(crate) locks: HashMap<String, (LockTag, Instant)>,

    /// Number of records currently buffered in the trans-log.
    pub(crate) log_records: usize,
}

/// Inputs to the engine task. All arrive on one channel and inherit its
/// serialization.
#[derive(Debug)]
pub(crate) enum EngineInput {
    /// A replied request from a peer node (or from this node through the
    /// transport loopback).
    Peer {
        peer: NodeId,
        seq: SeqNum,
        req: NodeRequest,
    },

    /// Inbound trans-log push; applied blindly, no reply.
    Apply {
        origin: NodeId,
        records: Vec<LogRecord>,
    },

    /// Lease sweep tick.
    SweepLeases,

    /// Lock sweep tick.
    SweepLocks,

    /// Atomically hand out the buffered trans-log, leaving an empty buffer.
    DrainLog {
        tx_drain: mpsc::UnboundedSender<Vec<LogRecord>>,
    },

    /// Request a cloned state snapshot.
    DebugState {
        tx_state: mpsc::UnboundedSender<DebugSnapshot>,
    },
}

/// The node state engine module.
pub(crate) struct LockEngine {
    /// My node ID.
    me: NodeId,

    /// Sender side of the input channel.
    tx_input: mpsc::UnboundedSender<EngineInput>,

    /// Join handle of the engine logic task. The maps and the trans-log
    /// buffer are owned by that task.
    _engine_handle: JoinHandle<()>,
}

// LockEngine public API implementation
impl LockEngine {
    /// Creates the engine and spawns its logic task. Returns the engine
    /// handle, a watch receiver for configuration snapshots, and a read
    /// handle of the data map for dirty reads.
    pub(crate) fn new_and_setup(
        me: NodeId,
        init_config: ClusterConfig,
        lock_ttl: Duration,
        log_cap_bytes: usize,
        tx_reply: mpsc::UnboundedSender<(NodeId, SeqNum, NodeReply)>,
    ) -> Result<
        (
            Self,
            watch::Receiver<ClusterConfig>,
            flashmap::ReadHandle<String, LeaseEntry>,
        ),
        KeystoneError,
    > {
        init_config.validate()?;
        if lock_ttl.is_zero() {
            return logged_err!(me; "invalid lock_ttl {:?}", lock_ttl);
        }

        let (tx_input, rx_input) = mpsc::unbounded_channel();
        let (data_write, data_read) = flashmap::new::<String, LeaseEntry>();
        let (cfg_tx, cfg_rx) = watch::channel(init_config);

        let mut logic = EngineLogicTask {
            me,
            lock_ttl,
            rx_input,
            tx_reply,
            state: EngineState::new(me, data_write, cfg_tx, log_cap_bytes),
        };
        let engine_handle = tokio::spawn(async move { logic.run().await });

        Ok((
            LockEngine {
                me,
                tx_input,
                _engine_handle: engine_handle,
            },
            cfg_rx,
            data_read,
        ))
    }

    /// Returns a cloned sender of the input channel.
    pub(crate) fn input_sender(&self) -> mpsc::UnboundedSender<EngineInput> {
        self.tx_input.clone()
    }

    /// Submits an input to the engine task.
    pub(crate) fn submit(
        &self,
        input: EngineInput,
    ) -> Result<(), KeystoneError> {
        if self.tx_input.send(input).is_err() {
            return logged_err!(self.me; "engine input channel closed");
        }
        Ok(())
    }
}

/// Engine-owned mutable state with pure transition handlers. Kept separate
/// from the task loop so transitions are unit-testable synchronously.
struct EngineState {
    me: NodeId,

    /// Data map write handle; readers snapshot concurrently.
    data: flashmap::WriteHandle<String, LeaseEntry>,

    /// Lock map: key -> hold. At most one hold per key by construction.
    locks: HashMap<String, LockHold>,

    /// Trans-log buffer accumulated since the last drain.
    trans_log: Vec<LogRecord>,

    /// Key -> index of its newest record in `trans_log`, for coalescing.
    log_index: HashMap<String, usize>,

    /// Approximate bytes currently buffered.
    log_bytes: usize,

    /// Soft cap on buffered bytes; crossing it logs a warning.
    log_cap_bytes: usize,

    /// Configuration publisher.
    cfg_tx: watch::Sender<ClusterConfig>,
}

impl EngineState {
    fn new(
        me: NodeId,
        data: flashmap::WriteHandle<String, LeaseEntry>,
        cfg_tx: watch::Sender<ClusterConfig>,
        log_cap_bytes: usize,
    ) -> Self {
        EngineState {
            me,
            data,
            locks: HashMap::new(),
            trans_log: Vec::new(),
            log_index: HashMap::new(),
            log_bytes: 0,
            log_cap_bytes,
            cfg_tx,
        }
    }

    /// Synthesized handler of replied requests.
    fn handle_request(&mut self, req: NodeRequest, now: Instant) -> NodeReply {
        match req {
            NodeRequest::Promise {
                key,
                expected,
                tag,
            } => self.handle_promise(key, expected, tag, now),
            NodeRequest::Commit {
                tag,
                key,
                value,
                lease_ms,
            } => self.handle_commit(tag, key, value, lease_ms, now),
            NodeRequest::Abort { tag } => self.handle_abort(tag),
            NodeRequest::ExtendCommit {
                tag,
                key,
                value,
                lease_ms,
            } => self.handle_extend_commit(tag, key, value, lease_ms, now),
            NodeRequest::ReleaseCommit { tag, key, value } => {
                self.handle_release_commit(tag, key, value)
            }
            NodeRequest::SetMasters { masters } => {
                self.handle_set_config(|config| config.masters = masters)
            }
            NodeRequest::SetReplicas { replicas } => {
                self.handle_set_config(|config| config.replicas = replicas)
            }
            NodeRequest::SetW { w } => {
                self.handle_set_config(|config| config.w = w)
            }
        }
    }

    /// Phase-1 reservation. First promise processed for a key wins; the
    /// second gets `AlreadyLocked` regardless of tag.
    fn handle_promise(
        &mut self,
        key: String,
        expected: Option<String>,
        tag: LockTag,
        now: Instant,
    ) -> NodeReply {
        if self.locks.contains_key(&key) {
            return NodeReply::AlreadyLocked;
        }

        // preconditions are computed against the current data map; expiry
        // instants are deliberately not consulted here
        let current = self.data.guard().get(&key).map(|e| e.value.clone());
        let granted = match (&expected, &current) {
            (None, None) => true,
            (Some(exp), Some(cur)) => exp == cur,
            _ => false,
        };

        if granted {
            self.locks.insert(
                key,
                LockHold {
                    tag,
                    acquired_at: now,
                },
            );
            NodeReply::Ok
        } else {
            NodeReply::NotExpected
        }
    }

    /// Phase-2 unconditional write. The coordinator is trusted to have
    /// obtained quorum; pairing the write with the lock release avoids an
    /// extra round-trip. A node that missed the promise still applies the
    /// write and simply finds no lock rows to delete.
    fn handle_commit(
        &mut self,
        tag: LockTag,
        key: String,
        value: String,
        lease_ms: u64,
        now: Instant,
    ) -> NodeReply {
        self.locks.retain(|_, hold| hold.tag != tag);
        self.data.guard().insert(
            key.clone(),
            LeaseEntry {
                value: value.clone(),
                expires_at: now + Duration::from_millis(lease_ms),
            },
        );
        self.append_record(LogRecord::Write {
            key,
            value,
            lease_ms,
        });
        NodeReply::Ok
    }

    /// Drops all lock rows held under the tag (typically one). Idempotent;
    /// never fails.
    fn handle_abort(&mut self, tag: LockTag) -> NodeReply {
        self.locks.retain(|_, hold| hold.tag != tag);
        NodeReply::Ok
    }

    /// Lease renewal. The value match, not the tag, authoritatively
    /// identifies the owner; this lets a newly-joined node accept an
    /// extension for a lease it did not originate.
    fn handle_extend_commit(
        &mut self,
        tag: LockTag,
        key: String,
        value: String,
        lease_ms: u64,
        now: Instant,
    ) -> NodeReply {
        let current = self.data.guard().get(&key).map(|e| e.value.clone());
        match current {
            Some(cur) if cur == value => {
                self.data.guard().insert(
                    key.clone(),
                    LeaseEntry {
                        value: value.clone(),
                        expires_at: now + Duration::from_millis(lease_ms),
                    },
                );
                self.locks.retain(|_, hold| hold.tag != tag);
                self.append_record(LogRecord::Write {
                    key,
                    value,
                    lease_ms,
                });
                NodeReply::Ok
            }
            Some(_) => NodeReply::NotOwner,
            None => NodeReply::NotFound,
        }
    }

    /// Ownership-checked deletion.
    fn handle_release_commit(
        &mut self,
        tag: LockTag,
        key: String,
        value: String,
    ) -> NodeReply {
        let current = self.data.guard().get(&key).map(|e| e.value.clone());
        match current {
            Some(cur) if cur == value => {
                self.data.guard().remove(key.clone());
                self.locks.retain(|_, hold| hold.tag != tag);
                self.append_record(LogRecord::Delete { key });
                NodeReply::Ok
            }
            Some(_) => NodeReply::NotOwner,
            None => NodeReply::NotFound,
        }
    }

    /// Administrative configuration replacement. Applied unconditionally
    /// (reconfiguration is best-effort and may pass through transiently
    /// inconsistent intermediate states); a combined config that fails
    /// validation is logged for the operator.
    fn handle_set_config(
        &mut self,
        mutate: impl FnOnce(&mut ClusterConfig),
    ) -> NodeReply {
        self.cfg_tx.send_modify(mutate);
        let config = self.cfg_tx.borrow();
        if let Err(e) = config.validate() {
            pf_warn!(self.me; "admin config now invalid: {}", e);
        } else {
            pf_info!(self.me; "admin config applied: {:?}", *config);
        }
        NodeReply::Ok
    }

    /// Applies an inbound trans-log push blindly. Lease expiry is set
    /// relative to the receiver's clock.
    fn apply_records(
        &mut self,
        origin: NodeId,
        records: Vec<LogRecord>,
        now: Instant,
    ) {
        pf_trace!(self.me; "applying {} records <- {}", records.len(), origin);
        let mut guard = self.data.guard();
        for record in records {
            match record {
                LogRecord::Write {
                    key,
                    value,
                    lease_ms,
                } => {
                    guard.insert(
                        key,
                        LeaseEntry {
                            value,
                            expires_at: now
                                + Duration::from_millis(lease_ms),
                        },
                    );
                }
                LogRecord::Delete { key } => {
                    guard.remove(key);
                }
            }
        }
    }

    /// Lease sweep: removes entries past expiry that have no lock hold. The
    /// lock check keeps a commit in flight from briefly exposing a miss.
    /// Nothing is appended to the trans-log; expiration is a local
    /// clock-driven event on every node independently.
    fn sweep_leases(&mut self, now: Instant) -> usize {
        let mut guard = self.data.guard();
        let expired: Vec<String> = guard
            .iter()
            .filter(|(key, entry)| {
                entry.expires_at < now && !self.locks.contains_key(*key)
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            guard.remove(key.clone());
        }
        expired.len()
    }

    /// Lock sweep: removes holds older than the lock TTL so a crashed or
    /// stalled coordinator cannot block a key forever.
    fn sweep_locks(&mut self, now: Instant, lock_ttl: Duration) -> usize {
        let before = self.locks.len();
        self.locks
            .retain(|_, hold| hold.acquired_at + lock_ttl >= now);
        before - self.locks.len()
    }

    /// Appends a record to the trans-log buffer, coalescing with the key's
    /// previous buffered record (replicas apply last-writer-wins per key, so
    /// only the newest record per key matters within one push).
    fn append_record(&mut self, record: LogRecord) {
        let key = record.key().to_string();
        let record_bytes = record.get_size();
        if let Some(&idx) = self.log_index.get(&key) {
            self.log_bytes =
                self.log_bytes + record_bytes - self.trans_log[idx].get_size();
            self.trans_log[idx] = record;
        } else {
            self.log_index.insert(key, self.trans_log.len());
            self.trans_log.push(record);
            self.log_bytes += record_bytes;
        }
        if self.log_bytes > self.log_cap_bytes {
            pf_warn!(self.me;
                     "trans-log buffer at {} bytes exceeds cap {}",
                     self.log_bytes, self.log_cap_bytes);
        }
    }

    /// Hands out the buffered trans-log, leaving an empty buffer behind.
    fn drain_log(&mut self) -> Vec<LogRecord> {
        self.log_index.clear();
        self.log_bytes = 0;
        mem::take(&mut self.trans_log)
    }

    /// Clones a snapshot of the current state, timer references included.
    fn snapshot(&mut self) -> DebugSnapshot {
        let guard = self.data.guard();
        let data = guard
            .iter()
            .map(|(key, entry)| {
                (key.clone(), (entry.value.clone(), entry.expires_at))
            })
            .collect();
        let locks = self
            .locks
            .iter()
            .map(|(key, hold)| (key.clone(), (hold.tag, hold.acquired_at)))
            .collect();
        DebugSnapshot {
            data,
            locks,
            log_records: self.trans_log.len(),
        }
    }
}

/// Engine logic task.
struct EngineLogicTask {
    me: NodeId,
    lock_ttl: Duration,
    rx_input: mpsc::UnboundedReceiver<EngineInput>,
    tx_reply: mpsc::UnboundedSender<(NodeId, SeqNum, NodeReply)>,
    state: EngineState,
}

impl EngineLogicTask {
    /// Starts the engine logic task loop.
    async fn run(&mut self) {
        pf_debug!(self.me; "engine task spawned");

        while let Some(input) = self.rx_input.recv().await {
            let now = Instant::now();
            match input {
                EngineInput::Peer { peer, seq, req } => {
                    pf_trace!(self.me; "req <- {} {:?}", peer, req);
                    let reply = self.state.handle_request(req, now);
                    if let Err(e) = self.tx_reply.send((peer, seq, reply)) {
                        pf_error!(self.me; "error sending to tx_reply: {}", e);
                    }
                }
                EngineInput::Apply { origin, records } => {
                    self.state.apply_records(origin, records, now);
                }
                EngineInput::SweepLeases => {
                    let swept = self.state.sweep_leases(now);
                    if swept > 0 {
                        pf_debug!(self.me; "lease sweep removed {} keys", swept);
                    }
                }
                EngineInput::SweepLocks => {
                    let swept = self.state.sweep_locks(now, self.lock_ttl);
                    if swept > 0 {
                        pf_debug!(self.me; "lock sweep removed {} holds", swept);
                    }
                }
                EngineInput::DrainLog { tx_drain } => {
                    if tx_drain.send(self.state.drain_log()).is_err() {
                        pf_error!(self.me; "drain channel has been closed");
                    }
                }
                EngineInput::DebugState { tx_state } => {
                    if tx_state.send(self.state.snapshot()).is_err() {
                        pf_error!(self.me; "state channel has been closed");
                    }
                }
            }
        }

        // channel gets closed and no inputs remain
        pf_debug!(self.me; "engine task exitted");
    }
}

#[cfg(test)]
mod engine_tests {
    use super::*;

    const TTL: Duration = Duration::from_millis(1000);

    fn test_state() -> (EngineState, flashmap::ReadHandle<String, LeaseEntry>)
    {
        let (data_write, data_read) = flashmap::new::<String, LeaseEntry>();
        let (cfg_tx, _cfg_rx) = watch::channel(
            ClusterConfig::new(2, vec![0, 1, 2], vec![3]).unwrap(),
        );
        (EngineState::new(0, data_write, cfg_tx, 1024 * 1024), data_read)
    }

    #[test]
    fn promise_absent_grants() {
        let (mut state, _reader) = test_state();
        let now = Instant::now();
        assert_eq!(
            state.handle_promise("k".into(), None, 7, now),
            NodeReply::Ok
        );
        assert_eq!(state.locks.len(), 1);
    }

    #[test]
    fn promise_existing_key_rejected() {
        let (mut state, _reader) = test_state();
        let now = Instant::now();
        state.handle_commit(1, "k".into(), "v".into(), 60_000, now);
        assert_eq!(
            state.handle_promise("k".into(), None, 7, now),
            NodeReply::NotExpected
        );
        assert!(state.locks.is_empty());
    }

    #[test]
    fn promise_value_match() {
        let (mut state, _reader) = test_state();
        let now = Instant::now();
        state.handle_commit(1, "k".into(), "v".into(), 60_000, now);
        assert_eq!(
            state.handle_promise("k".into(), Some("other".into()), 7, now),
            NodeReply::NotExpected
        );
        assert_eq!(
            state.handle_promise("k".into(), Some("v".into()), 7, now),
            NodeReply::Ok
        );
    }

    #[test]
    fn promise_locked_key_rejected() {
        let (mut state, _reader) = test_state();
        let now = Instant::now();
        assert_eq!(
            state.handle_promise("k".into(), None, 7, now),
            NodeReply::Ok
        );
        // second promise for the same key loses regardless of tag
        assert_eq!(
            state.handle_promise("k".into(), None, 8, now),
            NodeReply::AlreadyLocked
        );
        // lock map never holds two entries for one key
        assert_eq!(state.locks.len(), 1);
        assert_eq!(state.locks.get("k").unwrap().tag, 7);
    }

    #[test]
    fn commit_clears_lock_and_writes() {
        let (mut state, reader) = test_state();
        let now = Instant::now();
        assert_eq!(
            state.handle_promise("k".into(), None, 7, now),
            NodeReply::Ok
        );
        assert_eq!(
            state.handle_commit(7, "k".into(), "v".into(), 60_000, now),
            NodeReply::Ok
        );
        assert!(state.locks.is_empty());
        assert_eq!(
            reader.guard().get("k").map(|e| e.value.clone()),
            Some("v".into())
        );
        assert_eq!(state.trans_log.len(), 1);
    }

    #[test]
    fn commit_without_promise_still_writes() {
        let (mut state, reader) = test_state();
        let now = Instant::now();
        // a master that missed the promise is brought up to date by the
        // blind commit
        assert_eq!(
            state.handle_commit(7, "k".into(), "v".into(), 60_000, now),
            NodeReply::Ok
        );
        assert!(reader.guard().contains_key("k"));
    }

    #[test]
    fn abort_idempotent() {
        let (mut state, _reader) = test_state();
        let now = Instant::now();
        state.handle_promise("k".into(), None, 7, now);
        assert_eq!(state.handle_abort(7), NodeReply::Ok);
        assert!(state.locks.is_empty());
        assert_eq!(state.handle_abort(7), NodeReply::Ok);
    }

    #[test]
    fn extend_commit_paths() {
        let (mut state, reader) = test_state();
        let now = Instant::now();
        assert_eq!(
            state.handle_extend_commit(7, "k".into(), "v".into(), 60_000, now),
            NodeReply::NotFound
        );
        state.handle_commit(1, "k".into(), "v".into(), 1_000, now);
        assert_eq!(
            state.handle_extend_commit(
                7,
                "k".into(),
                "other".into(),
                60_000,
                now
            ),
            NodeReply::NotOwner
        );
        let old_expiry = reader.guard().get("k").unwrap().expires_at;
        assert_eq!(
            state.handle_extend_commit(7, "k".into(), "v".into(), 60_000, now),
            NodeReply::Ok
        );
        assert!(reader.guard().get("k").unwrap().expires_at > old_expiry);
    }

    #[test]
    fn release_commit_paths() {
        let (mut state, reader) = test_state();
        let now = Instant::now();
        assert_eq!(
            state.handle_release_commit(7, "k".into(), "v".into()),
            NodeReply::NotFound
        );
        state.handle_commit(1, "k".into(), "v".into(), 60_000, now);
        assert_eq!(
            state.handle_release_commit(7, "k".into(), "other".into()),
            NodeReply::NotOwner
        );
        assert!(reader.guard().contains_key("k"));
        assert_eq!(
            state.handle_release_commit(7, "k".into(), "v".into()),
            NodeReply::Ok
        );
        assert!(!reader.guard().contains_key("k"));
        // a Write then a Delete for the same key coalesce to the Delete
        assert_eq!(state.trans_log.len(), 1);
        assert_eq!(
            state.trans_log[0],
            LogRecord::Delete { key: "k".into() }
        );
    }

    #[test]
    fn sweep_leases_skips_locked() {
        let (mut state, reader) = test_state();
        let now = Instant::now();
        state.handle_commit(1, "gone".into(), "v".into(), 10, now);
        state.handle_commit(2, "held".into(), "v".into(), 10, now);
        state.handle_commit(3, "fresh".into(), "v".into(), 60_000, now);
        // "held" is being re-promised (e.g. an extension in flight)
        assert_eq!(
            state.handle_promise("held".into(), Some("v".into()), 9, now),
            NodeReply::Ok
        );
        let later = now + Duration::from_millis(100);
        assert_eq!(state.sweep_leases(later), 1);
        let guard = reader.guard();
        assert!(!guard.contains_key("gone"));
        assert!(guard.contains_key("held"));
        assert!(guard.contains_key("fresh"));
    }

    #[test]
    fn sweep_locks_by_ttl() {
        let (mut state, _reader) = test_state();
        let now = Instant::now();
        state.handle_promise("stale".into(), None, 7, now);
        let later = now + TTL + Duration::from_millis(1);
        state.handle_promise("young".into(), None, 8, later);
        assert_eq!(state.sweep_locks(later, TTL), 1);
        assert!(!state.locks.contains_key("stale"));
        assert!(state.locks.contains_key("young"));
        // a fresh promise on the swept key now succeeds
        assert_eq!(
            state.handle_promise("stale".into(), None, 9, later),
            NodeReply::Ok
        );
    }

    #[test]
    fn apply_log_idempotent() {
        let (mut state, reader) = test_state();
        let now = Instant::now();
        let records = vec![
            LogRecord::Write {
                key: "a".into(),
                value: "1".into(),
                lease_ms: 60_000,
            },
            LogRecord::Write {
                key: "b".into(),
                value: "2".into(),
                lease_ms: 60_000,
            },
            LogRecord::Delete { key: "a".into() },
        ];
        state.apply_records(1, records.clone(), now);
        let once: HashMap<String, String> = reader
            .guard()
            .iter()
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect();
        state.apply_records(1, records, now);
        let twice: HashMap<String, String> = reader
            .guard()
            .iter()
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect();
        assert_eq!(once, twice);
        assert!(!twice.contains_key("a"));
        assert_eq!(twice.get("b"), Some(&"2".to_string()));
    }

    #[test]
    fn trans_log_coalesces_and_drains() {
        let (mut state, _reader) = test_state();
        let now = Instant::now();
        state.handle_commit(1, "k".into(), "v1".into(), 60_000, now);
        state.handle_commit(2, "k".into(), "v2".into(), 60_000, now);
        state.handle_commit(3, "j".into(), "w".into(), 60_000, now);
        assert_eq!(state.trans_log.len(), 2);
        assert_eq!(
            state.trans_log[0],
            LogRecord::Write {
                key: "k".into(),
                value: "v2".into(),
                lease_ms: 60_000,
            }
        );
        let drained = state.drain_log();
        assert_eq!(drained.len(), 2);
        assert!(state.trans_log.is_empty());
        assert_eq!(state.log_bytes, 0);
        // buffer starts fresh after the drain
        state.handle_commit(4, "k".into(), "v3".into(), 60_000, now);
        assert_eq!(state.trans_log.len(), 1);
    }

    #[test]
    fn snapshot_with_timer_refs() {
        let (mut state, _reader) = test_state();
        let now = Instant::now();
        state.handle_commit(1, "k".into(), "v".into(), 60_000, now);
        state.handle_promise("j".into(), None, 7, now);
        let snap = state.snapshot();
        let (value, expires_at) = snap.data.get("k").unwrap();
        assert_eq!(value, "v");
        assert_eq!(*expires_at, now + Duration::from_millis(60_000));
        let (tag, acquired_at) = snap.locks.get("j").unwrap();
        assert_eq!(*tag, 7);
        assert_eq!(*acquired_at, now);
        assert_eq!(snap.log_records, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn task_request_reply() -> Result<(), KeystoneError> {
        let (tx_reply, mut rx_reply) = mpsc::unbounded_channel();
        let (engine, _cfg_rx, reader) = LockEngine::new_and_setup(
            0,
            ClusterConfig::new(1, vec![0], vec![])?,
            TTL,
            1024 * 1024,
            tx_reply,
        )?;
        engine.submit(EngineInput::Peer {
            peer: 0,
            seq: 1,
            req: NodeRequest::Promise {
                key: "k".into(),
                expected: None,
                tag: 7,
            },
        })?;
        assert_eq!(rx_reply.recv().await, Some((0, 1, NodeReply::Ok)));
        engine.submit(EngineInput::Peer {
            peer: 2,
            seq: 2,
            req: NodeRequest::Commit {
                tag: 7,
                key: "k".into(),
                value: "v".into(),
                lease_ms: 60_000,
            },
        })?;
        assert_eq!(rx_reply.recv().await, Some((2, 2, NodeReply::Ok)));
        assert_eq!(
            reader.guard().get("k").map(|e| e.value.clone()),
            Some("v".into())
        );
        Ok(())
    }
}
