//! Keystone server external API module implementation.
//!
//! Clients connect over TCP, announce a self-chosen random client ID, then
//! exchange length-prefixed request/reply frames. One servant task per
//! client session; requests funnel into a single channel consumed by the
//! node's main event loop, and replies are routed back to the right
//! servant by client ID.

use std::net::SocketAddr;

use crate::server::{NodeId, QuorumStats};
use crate::utils::{
    safe_tcp_read, safe_tcp_write, tcp_bind_with_retry, FrameReadError,
    KeystoneError,
};

use bytes::BytesMut;

use serde::{Deserialize, Serialize};

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Client ID type. Chosen randomly by each client.
pub type ClientId = u64;

/// External API request ID type.
pub type RequestId = u64;

/// Command in a client request.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum ApiCommand {
    /// Acquire the lock on a key expected absent.
    Lock {
        key: String,
        value: String,
        lease_ms: u64,
        timeout_ms: u64,
    },

    /// Release a held key, proving ownership by value.
    Release {
        key: String,
        value: String,
        timeout_ms: u64,
    },

    /// Renew the lease on a held key, proving ownership by value.
    ExtendLease {
        key: String,
        value: String,
        lease_ms: u64,
        timeout_ms: u64,
    },

    /// Non-quorum local-snapshot read; may return a stale or
    /// expired-but-not-swept value.
    DirtyRead { key: String },

    /// Best-effort broadcast replacing the master and replica sets.
    SetNodes {
        masters: Vec<NodeId>,
        replicas: Vec<NodeId>,
    },

    /// Best-effort broadcast replacing the write quorum threshold.
    SetW { w: u8 },

    /// Local state counters.
    Summary,

    /// Quorum round-trip probe.
    Lag,
}

/// Result in a reply back to client.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum ApiResult {
    /// Write achieved promise quorum; tally attached.
    Quorum(QuorumStats),

    /// Write failed to achieve promise quorum and was aborted.
    NoQuorum { w: u8, voted: u8 },

    /// Dirty read hit.
    Value { value: String },

    /// Dirty read miss.
    NotFound,

    /// Administrative broadcast dispatched.
    Ok,

    /// Local state counters.
    Summary {
        keys: usize,
        locks: usize,
        log_records: usize,
    },

    /// Quorum round-trip probe outcome.
    Lag { elapsed_ms: u64, down: u8 },

    /// Request could not be served (e.g. invalid arguments).
    Error { msg: String },
}

/// Request received from client.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct ApiRequest {
    /// Request ID.
    pub id: RequestId,

    /// Command to execute.
    pub cmd: ApiCommand,
}

/// Reply back to client.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct ApiReply {
    /// Request ID corresponding to this reply.
    pub id: RequestId,

    /// Command execution result.
    pub result: ApiResult,
}

/// The external client-facing API module.
pub(crate) struct ExternalApi {
    /// My node ID.
    me: NodeId,

    /// Receiver side of the req channel.
    rx_req: mpsc::UnboundedReceiver<(ClientId, ApiRequest)>,

    /// Map from client ID -> sender side of its reply channel, shared with
    /// the client acceptor task.
    tx_replies:
        flashmap::ReadHandle<ClientId, mpsc::UnboundedSender<ApiReply>>,

    /// Join handle of the client acceptor task.
    _acceptor_handle: JoinHandle<()>,
}

// ExternalApi public API implementation
impl ExternalApi {
    /// Creates a new external API module and spawns the client acceptor
    /// task. Creates a req channel for incoming client requests.
    pub(crate) async fn new_and_setup(
        me: NodeId,
        api_addr: SocketAddr,
    ) -> Result<Self, KeystoneError> {
        let (tx_req, rx_req) = mpsc::unbounded_channel();

        let (tx_replies_write, tx_replies_read) =
            flashmap::new::<ClientId, mpsc::UnboundedSender<ApiReply>>();

        let client_listener = tcp_bind_with_retry(api_addr, 10).await?;
        let mut acceptor = ClientAcceptorTask::new(
            me,
            client_listener,
            tx_req,
            tx_replies_write,
        );
        let acceptor_handle =
            tokio::spawn(async move { acceptor.run().await });

        Ok(ExternalApi {
            me,
            rx_req,
            tx_replies: tx_replies_read,
            _acceptor_handle: acceptor_handle,
        })
    }

    /// Waits for the next client request.
    pub(crate) async fn get_request(
        &mut self,
    ) -> Result<(ClientId, ApiRequest), KeystoneError> {
        match self.rx_req.recv().await {
            Some((client, req)) => Ok((client, req)),
            None => logged_err!(self.me; "req channel has been closed"),
        }
    }

    /// Sends a reply back to a client by sending to its reply channel.
    /// A client that already disconnected is silently skipped.
    pub(crate) fn send_reply(
        &self,
        reply: ApiReply,
        client: ClientId,
    ) -> Result<(), KeystoneError> {
        let tx_replies_guard = self.tx_replies.guard();
        if let Some(tx_reply) = tx_replies_guard.get(&client) {
            tx_reply.send(reply).map_err(KeystoneError::msg)?;
        }
        Ok(())
    }
}

/// Client acceptor task.
struct ClientAcceptorTask {
    me: NodeId,

    client_listener: TcpListener,
    tx_req: mpsc::UnboundedSender<(ClientId, ApiRequest)>,
    tx_replies:
        flashmap::WriteHandle<ClientId, mpsc::UnboundedSender<ApiReply>>,

    tx_exit: mpsc::UnboundedSender<ClientId>,
    rx_exit: mpsc::UnboundedReceiver<ClientId>,
}

impl ClientAcceptorTask {
    fn new(
        me: NodeId,
        client_listener: TcpListener,
        tx_req: mpsc::UnboundedSender<(ClientId, ApiRequest)>,
        tx_replies: flashmap::WriteHandle<
            ClientId,
            mpsc::UnboundedSender<ApiReply>,
        >,
    ) -> Self {
        // exit channel gets notified about termination of servant tasks
        let (tx_exit, rx_exit) = mpsc::unbounded_channel();

        ClientAcceptorTask {
            me,
            client_listener,
            tx_req,
            tx_replies,
            tx_exit,
            rx_exit,
        }
    }

    /// Accepts a new client connection.
    async fn accept_new_client(
        &mut self,
        mut stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), KeystoneError> {
        let id = match stream.read_u64().await {
            Ok(id) => id,
            Err(e) => {
                return logged_err!(self.me; "error receiving client ID: {}", e);
            }
        };

        let mut tx_replies_guard = self.tx_replies.guard();
        if tx_replies_guard.contains_key(&id) {
            return logged_err!(self.me; "duplicate client ID listened: {}", id);
        }
        pf_debug!(self.me; "accepted new client {} '{}'", id, addr);

        let (tx_reply, rx_reply) = mpsc::unbounded_channel();
        tx_replies_guard.insert(id, tx_reply);
        drop(tx_replies_guard);

        let mut servant = ClientServantTask {
            me: self.me,
            id,
            stream: Some(stream),
            rx_reply,
            tx_req: self.tx_req.clone(),
            tx_exit: self.tx_exit.clone(),
        };
        tokio::spawn(async move { servant.run().await });
        Ok(())
    }

    /// Starts the client acceptor task loop.
    async fn run(&mut self) {
        pf_debug!(self.me; "client_acceptor task spawned");

        let local_addr = self.client_listener.local_addr().unwrap();
        pf_info!(self.me; "accepting clients on '{}'", local_addr);

        loop {
            tokio::select! {
                accepted = self.client_listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            if let Err(e) =
                                self.accept_new_client(stream, addr).await
                            {
                                pf_error!(self.me; "error accepting client: {}", e);
                            }
                        }
                        Err(e) => {
                            pf_warn!(self.me; "error accepting connection: {}", e);
                        }
                    }
                },

                // a client servant task exits
                id = self.rx_exit.recv() => {
                    let id = id.unwrap();
                    self.tx_replies.guard().remove(id);
                    pf_debug!(self.me; "client {} disconnected", id);
                },
            }
        }
    }
}

/// Per-client servant task.
struct ClientServantTask {
    me: NodeId,
    id: ClientId,

    stream: Option<TcpStream>,

    rx_reply: mpsc::UnboundedReceiver<ApiReply>,
    tx_req: mpsc::UnboundedSender<(ClientId, ApiRequest)>,
    tx_exit: mpsc::UnboundedSender<ClientId>,
}

impl ClientServantTask {
    /// Starts the per-client servant task loop.
    async fn run(&mut self) {
        pf_debug!(self.me; "servant task for client {} spawned", self.id);

        let (mut conn_read, conn_write) =
            self.stream.take().unwrap().into_split();

        let mut read_buf = BytesMut::with_capacity(8 + 1024);
        let mut write_buf = BytesMut::with_capacity(8 + 1024);
        let mut write_buf_cursor = 0;
        let mut retrying = false;

        loop {
            tokio::select! {
                // receives a request from the client
                req = safe_tcp_read(&mut read_buf, &mut conn_read) => {
                    match req {
                        Ok(req) => {
                            if self.tx_req.send((self.id, req)).is_err() {
                                break; // node torn down
                            }
                        }
                        Err(FrameReadError::BadMessage(e)) => {
                            // a client session is not a cluster message
                            // source; garbage only costs it its session
                            pf_error!(self.me;
                                      "bad frame from client {}: {}",
                                      self.id, e);
                            break;
                        }
                        Err(FrameReadError::Conn(_e)) => break, // client left
                    }
                },

                // gets a reply to send back
                reply = self.rx_reply.recv(), if !retrying => {
                    match reply {
                        Some(reply) => {
                            match safe_tcp_write(
                                &mut write_buf,
                                &mut write_buf_cursor,
                                &conn_write,
                                Some(&reply),
                            ) {
                                Ok(true) => {}
                                Ok(false) => {
                                    retrying = true;
                                }
                                Err(_e) => break, // connection broken
                            }
                        }
                        None => break, // reply channel closed
                    }
                },

                // retrying last unsuccessful reply send
                _ = conn_write.writable(), if retrying => {
                    match safe_tcp_write::<ApiReply, _>(
                        &mut write_buf,
                        &mut write_buf_cursor,
                        &conn_write,
                        None,
                    ) {
                        Ok(true) => {
                            retrying = false;
                        }
                        Ok(false) => {}
                        Err(_e) => break, // connection broken
                    }
                },
            }
        }

        self.tx_exit.send(self.id).ok();
        pf_debug!(self.me; "servant task for client {} exitted", self.id);
    }
}
