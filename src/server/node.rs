//! Keystone server node wiring and main event loop.

use std::collections::HashMap;
use std::net::SocketAddr;

use crate::server::{
    ApiCommand, ApiReply, ApiRequest, ApiResult, ClientId, ClusterConfig,
    Coordinator, EngineInput, ExternalApi, LeaseEntry, LockEngine,
    LogShipper, NodeId, OpOutcome, NodeRequest, PeerCaller, Sweeper,
    TransportHub,
};
use crate::utils::KeystoneError;

use serde::Deserialize;

use tokio::sync::{mpsc, watch};
use tokio::time::Duration;

/// Configuration parameters struct.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ServerConfig {
    /// Interval between lease expiration sweeps in millisecs.
    pub lease_expire_interval_ms: u64,

    /// Interval between lock expiration sweeps in millisecs.
    pub lock_expire_interval_ms: u64,

    /// Age past which a promise reservation is considered abandoned, in
    /// millisecs. Long enough to cover a commit round-trip, short enough
    /// that a crashed coordinator does not stall the key.
    pub lock_ttl_ms: u64,

    /// Interval between trans-log pushes to replicas in millisecs.
    pub push_trans_interval_ms: u64,

    /// Lease length applied when a client passes zero, in millisecs.
    pub default_lease_ms: u64,

    /// Per-phase operation timeout applied when a client passes zero, in
    /// millisecs.
    pub default_op_timeout_ms: u64,

    /// Soft cap on buffered trans-log bytes.
    pub log_cap_bytes: usize,
}

#[allow(clippy::derivable_impls)]
impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            lease_expire_interval_ms: 1000,
            lock_expire_interval_ms: 1000,
            lock_ttl_ms: 1000,
            push_trans_interval_ms: 1000,
            default_lease_ms: 60_000,
            default_op_timeout_ms: 5000,
            log_cap_bytes: 4 * 1024 * 1024,
        }
    }
}

/// Keystone server node.
pub struct KeystoneNode {
    /// My node ID.
    id: NodeId,

    /// Configuration parameters struct.
    config: ServerConfig,

    /// All node IDs in the static cluster address book (self included);
    /// targets of administrative broadcasts.
    cluster_ids: Vec<NodeId>,

    /// ExternalApi module.
    external: ExternalApi,

    /// LockEngine module.
    engine: LockEngine,

    /// TransportHub module.
    transport: TransportHub,

    /// Write coordinator handle.
    coordinator: Coordinator,

    /// Expiration services module.
    _sweeper: Sweeper,

    /// Replication pump module.
    _shipper: LogShipper,

    /// Read handle of the data map for dirty reads.
    data_reader: flashmap::ReadHandle<String, LeaseEntry>,

    /// Sender side of the done channel used by spawned operation tasks.
    tx_done: mpsc::UnboundedSender<(ClientId, ApiReply)>,

    /// Receiver side of the done channel.
    rx_done: mpsc::UnboundedReceiver<(ClientId, ApiReply)>,
}

// KeystoneNode public API implementation
impl KeystoneNode {
    /// Creates a new node and sets up all functionality modules. The
    /// address book maps every other node's ID to its peer-peer address;
    /// `init_config` seeds the master set, replica set, and `w`.
    pub async fn new_and_setup(
        id: NodeId,
        api_addr: SocketAddr,
        p2p_addr: SocketAddr,
        addr_book: HashMap<NodeId, SocketAddr>,
        init_config: ClusterConfig,
        config_str: Option<&str>,
    ) -> Result<Self, KeystoneError> {
        let config = parsed_config!(config_str => ServerConfig;
                                    lease_expire_interval_ms,
                                    lock_expire_interval_ms,
                                    lock_ttl_ms, push_trans_interval_ms,
                                    default_lease_ms, default_op_timeout_ms,
                                    log_cap_bytes)?;
        if config.default_lease_ms == 0 {
            return logged_err!(id; "invalid config.default_lease_ms 0");
        }
        if config.default_op_timeout_ms == 0 {
            return logged_err!(id; "invalid config.default_op_timeout_ms 0");
        }

        let mut cluster_ids: Vec<NodeId> = addr_book.keys().copied().collect();
        cluster_ids.push(id);
        cluster_ids.sort_unstable();

        let (tx_engine_reply, rx_engine_reply) = mpsc::unbounded_channel();
        let (engine, cfg_rx, data_reader) = LockEngine::new_and_setup(
            id,
            init_config,
            Duration::from_millis(config.lock_ttl_ms),
            config.log_cap_bytes,
            tx_engine_reply,
        )?;
        let tx_engine = engine.input_sender();

        let transport = TransportHub::new_and_setup(
            id,
            p2p_addr,
            addr_book.clone(),
            tx_engine.clone(),
            rx_engine_reply,
        )
        .await?;
        // the lower-ID side of every mesh edge is dialed by the higher-ID
        // side; dial my lower-ID peers now
        for &peer in addr_book.keys().filter(|&&p| p < id) {
            transport.connect_to_peer(peer)?;
        }

        let external = ExternalApi::new_and_setup(id, api_addr).await?;

        let sweeper = Sweeper::new_and_setup(
            id,
            Duration::from_millis(config.lease_expire_interval_ms),
            Duration::from_millis(config.lock_expire_interval_ms),
            tx_engine.clone(),
        )?;

        let shipper = LogShipper::new_and_setup(
            id,
            Duration::from_millis(config.push_trans_interval_ms),
            tx_engine,
            transport.caller(),
            cfg_rx.clone(),
        )?;

        let coordinator = Coordinator::new(id, transport.caller(), cfg_rx);

        let (tx_done, rx_done) = mpsc::unbounded_channel();

        Ok(KeystoneNode {
            id,
            config,
            cluster_ids,
            external,
            engine,
            transport,
            coordinator,
            _sweeper: sweeper,
            _shipper: shipper,
            data_reader,
            tx_done,
            rx_done,
        })
    }

    /// Waits until at least `group` cluster nodes (self included) are
    /// connected. Useful before exercising quorum operations right after
    /// startup.
    pub async fn wait_for_peers(&self, group: u8) -> Result<(), KeystoneError> {
        self.transport.wait_for_group(group).await
    }

    /// Main event loop logic of running this node.
    pub async fn run(&mut self, mut rx_term: watch::Receiver<bool>) {
        pf_info!(self.id; "node event loop starting");

        loop {
            tokio::select! {
                // client request
                req = self.external.get_request() => {
                    let (client, req) = match req {
                        Ok(pair) => pair,
                        Err(e) => {
                            pf_error!(self.id; "error getting request: {}", e);
                            break;
                        }
                    };
                    if let Err(e) = self.handle_request(client, req) {
                        pf_error!(self.id; "error handling request: {}", e);
                    }
                },

                // a spawned operation task finished
                done = self.rx_done.recv() => {
                    let (client, reply) = done.unwrap();
                    if let Err(e) = self.external.send_reply(reply, client) {
                        pf_error!(self.id; "error sending reply: {}", e);
                    }
                },

                // receiving termination signal
                _ = rx_term.changed() => {
                    pf_warn!(self.id; "node caught termination signal");
                    break;
                }
            }
        }
    }
}

// KeystoneNode request dispatch implementation
impl KeystoneNode {
    /// Dispatches one client request. Dirty reads and administrative
    /// broadcasts are served inline; coordinated writes and engine
    /// round-trips run in spawned tasks that report back on the done
    /// channel.
    fn handle_request(
        &mut self,
        client: ClientId,
        req: ApiRequest,
    ) -> Result<(), KeystoneError> {
        let ApiRequest { id, cmd } = req;
        match cmd {
            ApiCommand::Lock {
                key,
                value,
                lease_ms,
                timeout_ms,
            } => {
                let lease_ms = self.lease_or_default(lease_ms);
                let timeout = self.timeout_or_default(timeout_ms);
                let coordinator = self.coordinator.clone();
                let tx_done = self.tx_done.clone();
                tokio::spawn(async move {
                    let result = match coordinator
                        .lock(key, value, lease_ms, timeout)
                        .await
                    {
                        Ok(outcome) => outcome_result(outcome),
                        Err(e) => ApiResult::Error { msg: e.to_string() },
                    };
                    tx_done.send((client, ApiReply { id, result })).ok();
                });
            }

            ApiCommand::Release {
                key,
                value,
                timeout_ms,
            } => {
                let timeout = self.timeout_or_default(timeout_ms);
                let coordinator = self.coordinator.clone();
                let tx_done = self.tx_done.clone();
                tokio::spawn(async move {
                    let result =
                        match coordinator.release(key, value, timeout).await {
                            Ok(outcome) => outcome_result(outcome),
                            Err(e) => ApiResult::Error { msg: e.to_string() },
                        };
                    tx_done.send((client, ApiReply { id, result })).ok();
                });
            }

            ApiCommand::ExtendLease {
                key,
                value,
                lease_ms,
                timeout_ms,
            } => {
                let lease_ms = self.lease_or_default(lease_ms);
                let timeout = self.timeout_or_default(timeout_ms);
                let coordinator = self.coordinator.clone();
                let tx_done = self.tx_done.clone();
                tokio::spawn(async move {
                    let result = match coordinator
                        .extend_lease(key, value, lease_ms, timeout)
                        .await
                    {
                        Ok(outcome) => outcome_result(outcome),
                        Err(e) => ApiResult::Error { msg: e.to_string() },
                    };
                    tx_done.send((client, ApiReply { id, result })).ok();
                });
            }

            ApiCommand::DirtyRead { key } => {
                // served from the data map snapshot without quorum; expiry
                // is deliberately not consulted, so a value past its lease
                // but not yet swept is still returned
                let result = match self.data_reader.guard().get(&key) {
                    Some(entry) => ApiResult::Value {
                        value: entry.value.clone(),
                    },
                    None => ApiResult::NotFound,
                };
                self.external
                    .send_reply(ApiReply { id, result }, client)?;
            }

            ApiCommand::SetNodes { masters, replicas } => {
                let result = self.broadcast_set_nodes(masters, replicas);
                self.external
                    .send_reply(ApiReply { id, result }, client)?;
            }

            ApiCommand::SetW { w } => {
                pf_info!(self.id; "broadcasting set_w {}", w);
                let result = match self
                    .transport
                    .caller()
                    .call_forget(&self.cluster_ids, NodeRequest::SetW { w })
                {
                    Ok(()) => ApiResult::Ok,
                    Err(e) => ApiResult::Error { msg: e.to_string() },
                };
                self.external
                    .send_reply(ApiReply { id, result }, client)?;
            }

            ApiCommand::Summary => {
                let tx_engine = self.engine.input_sender();
                let tx_done = self.tx_done.clone();
                tokio::spawn(async move {
                    let (tx_state, mut rx_state) = mpsc::unbounded_channel();
                    let result = if tx_engine
                        .send(EngineInput::DebugState { tx_state })
                        .is_err()
                    {
                        ApiResult::Error {
                            msg: "engine unavailable".into(),
                        }
                    } else {
                        match rx_state.recv().await {
                            Some(snap) => ApiResult::Summary {
                                keys: snap.data.len(),
                                locks: snap.locks.len(),
                                log_records: snap.log_records,
                            },
                            None => ApiResult::Error {
                                msg: "engine unavailable".into(),
                            },
                        }
                    };
                    tx_done.send((client, ApiReply { id, result })).ok();
                });
            }

            ApiCommand::Lag => {
                let timeout = self.timeout_or_default(0);
                let coordinator = self.coordinator.clone();
                let tx_done = self.tx_done.clone();
                tokio::spawn(async move {
                    let result = match coordinator.lag(timeout).await {
                        Ok((elapsed_ms, down)) => {
                            ApiResult::Lag { elapsed_ms, down }
                        }
                        Err(e) => ApiResult::Error { msg: e.to_string() },
                    };
                    tx_done.send((client, ApiReply { id, result })).ok();
                });
            }
        }
        Ok(())
    }

    /// Best-effort broadcast of a membership replacement to every node in
    /// the static address book. Operators must quiesce writes during
    /// reconfiguration.
    fn broadcast_set_nodes(
        &self,
        masters: Vec<NodeId>,
        replicas: Vec<NodeId>,
    ) -> ApiResult {
        for &id in masters.iter().chain(replicas.iter()) {
            if !self.cluster_ids.contains(&id) {
                return ApiResult::Error {
                    msg: format!("unknown node ID {} in membership", id),
                };
            }
        }
        pf_info!(self.id;
                 "broadcasting set_nodes masters {:?} replicas {:?}",
                 masters, replicas);

        let caller: PeerCaller = self.transport.caller();
        if let Err(e) = caller
            .call_forget(&self.cluster_ids, NodeRequest::SetMasters { masters })
        {
            return ApiResult::Error { msg: e.to_string() };
        }
        if let Err(e) = caller.call_forget(
            &self.cluster_ids,
            NodeRequest::SetReplicas { replicas },
        ) {
            return ApiResult::Error { msg: e.to_string() };
        }
        ApiResult::Ok
    }

    /// Applies the configured default when a client passes a zero lease.
    #[inline]
    fn lease_or_default(&self, lease_ms: u64) -> u64 {
        if lease_ms == 0 {
            self.config.default_lease_ms
        } else {
            lease_ms
        }
    }

    /// Applies the configured default when a client passes a zero timeout.
    #[inline]
    fn timeout_or_default(&self, timeout_ms: u64) -> Duration {
        Duration::from_millis(if timeout_ms == 0 {
            self.config.default_op_timeout_ms
        } else {
            timeout_ms
        })
    }
}

/// Maps a coordinator outcome onto a client-visible result.
fn outcome_result(outcome: OpOutcome) -> ApiResult {
    match outcome {
        OpOutcome::Committed(stats) => ApiResult::Quorum(stats),
        OpOutcome::NoQuorum { w, voted } => ApiResult::NoQuorum { w, voted },
    }
}
