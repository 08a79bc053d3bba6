//! Keystone inter-node TCP transport module implementation.
//!
//! The hub maintains one full-duplex connection per peer (lower-ID nodes
//! accept, higher-ID nodes dial, so the mesh heals deterministically after
//! restarts) and exposes the abstract cluster messaging the coordination
//! protocol needs: multi-destination request/reply with a per-call timeout
//! where unreachable destinations simply come back unanswered, plus
//! fire-and-forget casts for trans-log pushes. Messages addressed to this
//! node itself take a local loopback path through the same envelopes, so
//! quorum arithmetic treats all masters uniformly.
//!
//! NOTE: In concept, all messages are sent through unstable communication
//! channels. Here, we use TCP to get the effect of "every message a sender
//! wants to send will be retried until eventually delivered" as long as the
//! connection lives; a broken connection counts the peer as down.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use crate::server::{
    EngineInput, LogRecord, NodeId, NodeReply, NodeRequest, PeerMessage,
    SeqNum,
};
use crate::utils::{
    safe_tcp_read, safe_tcp_write, tcp_bind_with_retry,
    tcp_connect_with_retry, FrameReadError, KeystoneError, Timer,
};

use bytes::BytesMut;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

/// Control messages for the pending-reply table.
#[derive(Debug)]
enum PendingCtl {
    /// Start routing replies with this sequence number to the channel.
    Register {
        seq: SeqNum,
        tx_replies: mpsc::UnboundedSender<(NodeId, NodeReply)>,
    },

    /// Stop routing replies with this sequence number.
    Unregister { seq: SeqNum },
}

/// Cloneable handle for issuing peer calls and casts. Used concurrently by
/// many coordinator tasks and the replication pump.
#[derive(Debug, Clone)]
pub(crate) struct PeerCaller {
    /// My node ID.
    me: NodeId,

    /// Next request sequence number.
    next_seq: Arc<AtomicU64>,

    /// Sender side of the outbound channel.
    tx_out: mpsc::UnboundedSender<(NodeId, PeerMessage)>,

    /// Sender side of the pending-table control channel.
    tx_ctl: mpsc::UnboundedSender<PendingCtl>,
}

impl PeerCaller {
    /// Sends a request to every target and collects replies until all have
    /// answered or the timeout budget elapses. Returns a map from target to
    /// `Some(reply)` or `None` for targets that were unreachable or too
    /// late (counted as down by the caller).
    pub(crate) async fn multi_call(
        &self,
        targets: &[NodeId],
        req: NodeRequest,
        timeout: Duration,
    ) -> Result<HashMap<NodeId, Option<NodeReply>>, KeystoneError> {
        let seq = self.next_seq.fetch_add(1, Ordering::AcqRel);
        let (tx_replies, mut rx_replies) = mpsc::unbounded_channel();
        self.tx_ctl
            .send(PendingCtl::Register { seq, tx_replies })
            .map_err(KeystoneError::msg)?;

        let mut replies: HashMap<NodeId, Option<NodeReply>> =
            targets.iter().map(|&t| (t, None)).collect();
        for &target in targets {
            self.tx_out
                .send((
                    target,
                    PeerMessage::Request {
                        seq,
                        req: req.clone(),
                    },
                ))
                .map_err(KeystoneError::msg)?;
        }

        let mut pending = replies.len();
        let timer = Timer::new();
        timer.kickoff(timeout)?;
        while pending > 0 {
            tokio::select! {
                () = timer.timeout() => break,

                reply = rx_replies.recv() => match reply {
                    Some((peer, reply)) => {
                        if let Some(slot) = replies.get_mut(&peer) {
                            if slot.is_none() {
                                pending -= 1;
                            }
                            *slot = Some(reply);
                        }
                    }
                    None => break, // hub has been torn down
                },
            }
        }

        // best-effort: late replies are dropped by the router afterwards
        self.tx_ctl.send(PendingCtl::Unregister { seq }).ok();
        Ok(replies)
    }

    /// Sends a request to every target without waiting for any reply (the
    /// router drops uncorrelated replies). Used for best-effort aborts.
    pub(crate) fn call_forget(
        &self,
        targets: &[NodeId],
        req: NodeRequest,
    ) -> Result<(), KeystoneError> {
        let seq = self.next_seq.fetch_add(1, Ordering::AcqRel);
        for &target in targets {
            self.tx_out
                .send((
                    target,
                    PeerMessage::Request {
                        seq,
                        req: req.clone(),
                    },
                ))
                .map_err(KeystoneError::msg)?;
        }
        Ok(())
    }

    /// Broadcasts a trans-log push to the targets, fire-and-forget.
    pub(crate) fn cast_apply(
        &self,
        targets: &[NodeId],
        records: Vec<LogRecord>,
    ) -> Result<(), KeystoneError> {
        for &target in targets {
            self.tx_out
                .send((
                    target,
                    PeerMessage::ApplyLog {
                        origin: self.me,
                        records: records.clone(),
                    },
                ))
                .map_err(KeystoneError::msg)?;
        }
        Ok(())
    }
}

/// Inter-node TCP transport hub.
pub(crate) struct TransportHub {
    /// My node ID.
    me: NodeId,

    /// Caller handle template.
    caller: PeerCaller,

    /// Sender side of the connect channel for proactive dials.
    tx_connect: mpsc::UnboundedSender<NodeId>,

    /// Number of currently connected peers, maintained by the acceptor task.
    peer_count: Arc<AtomicU8>,

    /// Join handle of the peer acceptor task.
    _acceptor_handle: JoinHandle<()>,

    /// Join handle of the outbound router task.
    _out_router_handle: JoinHandle<()>,

    /// Join handle of the inbound demux task.
    _demux_handle: JoinHandle<()>,

    /// Join handle of the engine reply forwarder task.
    _reply_forwarder_handle: JoinHandle<()>,
}

// TransportHub public API implementation
impl TransportHub {
    /// Creates a new inter-node transport hub and spawns its tasks. Inbound
    /// requests and log pushes are fed into `tx_engine`; engine replies
    /// arrive on `rx_engine_reply` and are routed back to the requesting
    /// peer (or looped back locally).
    pub(crate) async fn new_and_setup(
        me: NodeId,
        p2p_addr: SocketAddr,
        addr_book: HashMap<NodeId, SocketAddr>,
        tx_engine: mpsc::UnboundedSender<EngineInput>,
        mut rx_engine_reply: mpsc::UnboundedReceiver<(
            NodeId,
            SeqNum,
            NodeReply,
        )>,
    ) -> Result<Self, KeystoneError> {
        if addr_book.contains_key(&me) {
            return logged_err!(me; "address book contains my own ID");
        }

        let (tx_recv, rx_recv) = mpsc::unbounded_channel();
        let (tx_out, rx_out) = mpsc::unbounded_channel();
        let (tx_ctl, rx_ctl) = mpsc::unbounded_channel();
        let (tx_connect, rx_connect) = mpsc::unbounded_channel();

        let (tx_sends_write, tx_sends_read) =
            flashmap::new::<NodeId, mpsc::UnboundedSender<PeerMessage>>();
        let peer_count = Arc::new(AtomicU8::new(0));

        let peer_listener = tcp_bind_with_retry(p2p_addr, 10).await?;
        let mut acceptor = AcceptorTask::new(
            me,
            addr_book,
            peer_listener,
            tx_recv.clone(),
            tx_sends_write,
            peer_count.clone(),
            rx_connect,
            tx_connect.clone(),
        );
        let acceptor_handle = tokio::spawn(async move { acceptor.run().await });

        let mut out_router = OutRouterTask {
            me,
            rx_out,
            tx_sends: tx_sends_read,
            tx_recv,
        };
        let out_router_handle =
            tokio::spawn(async move { out_router.run().await });

        let mut demux = DemuxTask {
            me,
            rx_recv,
            rx_ctl,
            tx_engine,
            pending: HashMap::new(),
        };
        let demux_handle = tokio::spawn(async move { demux.run().await });

        let tx_out_ref = tx_out.clone();
        let reply_forwarder_handle = tokio::spawn(async move {
            while let Some((peer, seq, reply)) = rx_engine_reply.recv().await {
                if tx_out_ref
                    .send((peer, PeerMessage::Reply { seq, reply }))
                    .is_err()
                {
                    break; // outbound channel torn down
                }
            }
        });

        Ok(TransportHub {
            me,
            caller: PeerCaller {
                me,
                next_seq: Arc::new(AtomicU64::new(1)),
                tx_out,
                tx_ctl,
            },
            tx_connect,
            peer_count,
            _acceptor_handle: acceptor_handle,
            _out_router_handle: out_router_handle,
            _demux_handle: demux_handle,
            _reply_forwarder_handle: reply_forwarder_handle,
        })
    }

    /// Returns a cloneable caller handle.
    pub(crate) fn caller(&self) -> PeerCaller {
        self.caller.clone()
    }

    /// Requests a proactive dial to the given peer. Fire-and-forget; the
    /// acceptor task keeps retrying in the background until connected.
    pub(crate) fn connect_to_peer(
        &self,
        id: NodeId,
    ) -> Result<(), KeystoneError> {
        self.tx_connect.send(id).map_err(KeystoneError::msg)
    }

    /// Gets the number of currently connected peers.
    pub(crate) fn connected_count(&self) -> u8 {
        self.peer_count.load(Ordering::Acquire)
    }

    /// Waits until at least enough peers are connected to me to form a
    /// group of the specified size (self included).
    pub(crate) async fn wait_for_group(
        &self,
        group: u8,
    ) -> Result<(), KeystoneError> {
        if group == 0 {
            return logged_err!(self.me; "invalid group size {}", group);
        }
        while self.connected_count() + 1 < group {
            time::sleep(Duration::from_millis(100)).await;
        }
        Ok(())
    }
}

/// Outbound router task: moves addressed messages onto the right per-peer
/// send channel, or loops them back locally if addressed to me. Messages to
/// peers that are not currently connected are dropped silently; the caller
/// counts such peers as down when no reply arrives.
struct OutRouterTask {
    me: NodeId,
    rx_out: mpsc::UnboundedReceiver<(NodeId, PeerMessage)>,
    tx_sends: flashmap::ReadHandle<NodeId, mpsc::UnboundedSender<PeerMessage>>,
    tx_recv: mpsc::UnboundedSender<(NodeId, PeerMessage)>,
}

impl OutRouterTask {
    async fn run(&mut self) {
        pf_debug!(self.me; "out_router task spawned");

        while let Some((dest, msg)) = self.rx_out.recv().await {
            if dest == self.me {
                // local loopback path
                if self.tx_recv.send((self.me, msg)).is_err() {
                    break;
                }
                continue;
            }
            let tx_sends_guard = self.tx_sends.guard();
            if let Some(tx_send) = tx_sends_guard.get(&dest) {
                tx_send.send(msg).ok();
            }
        }

        pf_debug!(self.me; "out_router task exitted");
    }
}

/// Inbound demux task: dispatches received envelopes. Requests and log
/// pushes go to the engine; replies are routed through the pending table to
/// whichever `multi_call` registered their sequence number.
struct DemuxTask {
    me: NodeId,
    rx_recv: mpsc::UnboundedReceiver<(NodeId, PeerMessage)>,
    rx_ctl: mpsc::UnboundedReceiver<PendingCtl>,
    tx_engine: mpsc::UnboundedSender<EngineInput>,
    pending: HashMap<SeqNum, mpsc::UnboundedSender<(NodeId, NodeReply)>>,
}

impl DemuxTask {
    fn handle_message(&mut self, peer: NodeId, msg: PeerMessage) {
        match msg {
            PeerMessage::Request { seq, req } => {
                if self
                    .tx_engine
                    .send(EngineInput::Peer { peer, seq, req })
                    .is_err()
                {
                    pf_error!(self.me; "engine channel has been closed");
                }
            }

            PeerMessage::Reply { seq, reply } => {
                if let Some(tx_replies) = self.pending.get(&seq) {
                    // a closed receiver means the call already returned
                    tx_replies.send((peer, reply)).ok();
                }
                // uncorrelated replies (late, or fire-and-forget) dropped
            }

            PeerMessage::ApplyLog { origin, records } => {
                if self
                    .tx_engine
                    .send(EngineInput::Apply { origin, records })
                    .is_err()
                {
                    pf_error!(self.me; "engine channel has been closed");
                }
            }
        }
    }

    async fn run(&mut self) {
        pf_debug!(self.me; "demux task spawned");

        loop {
            // biased: registrations must win over messages, else a reply
            // looping back locally could race past its own registration
            tokio::select! {
                biased;

                ctl = self.rx_ctl.recv() => match ctl {
                    Some(PendingCtl::Register { seq, tx_replies }) => {
                        self.pending.insert(seq, tx_replies);
                    }
                    Some(PendingCtl::Unregister { seq }) => {
                        self.pending.remove(&seq);
                    }
                    None => break, // hub dropped
                },

                msg = self.rx_recv.recv() => match msg {
                    Some((peer, msg)) => self.handle_message(peer, msg),
                    None => break, // all senders dropped
                },
            }
        }

        pf_debug!(self.me; "demux task exitted");
    }
}

/// Peer acceptor task: accepts incoming peer connections (peers with
/// higher IDs dial me) and dials lower-ID peers proactively, retrying
/// in the background until the mesh edge is up.
struct AcceptorTask {
    me: NodeId,

    addr_book: HashMap<NodeId, SocketAddr>,
    peer_listener: TcpListener,

    tx_recv: mpsc::UnboundedSender<(NodeId, PeerMessage)>,
    tx_sends:
        flashmap::WriteHandle<NodeId, mpsc::UnboundedSender<PeerMessage>>,
    peer_count: Arc<AtomicU8>,

    rx_connect: mpsc::UnboundedReceiver<NodeId>,
    tx_connect: mpsc::UnboundedSender<NodeId>,

    tx_exit: mpsc::UnboundedSender<NodeId>,
    rx_exit: mpsc::UnboundedReceiver<NodeId>,
}

impl AcceptorTask {
    #[allow(clippy::too_many_arguments)]
    fn new(
        me: NodeId,
        addr_book: HashMap<NodeId, SocketAddr>,
        peer_listener: TcpListener,
        tx_recv: mpsc::UnboundedSender<(NodeId, PeerMessage)>,
        tx_sends: flashmap::WriteHandle<
            NodeId,
            mpsc::UnboundedSender<PeerMessage>,
        >,
        peer_count: Arc<AtomicU8>,
        rx_connect: mpsc::UnboundedReceiver<NodeId>,
        tx_connect: mpsc::UnboundedSender<NodeId>,
    ) -> Self {
        // exit channel gets notified about termination of messenger tasks
        let (tx_exit, rx_exit) = mpsc::unbounded_channel();

        AcceptorTask {
            me,
            addr_book,
            peer_listener,
            tx_recv,
            tx_sends,
            peer_count,
            rx_connect,
            tx_connect,
            tx_exit,
            rx_exit,
        }
    }

    /// Schedules a delayed redial of a peer.
    fn schedule_redial(&self, id: NodeId) {
        let tx_connect_ref = self.tx_connect.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_secs(1)).await;
            tx_connect_ref.send(id).ok();
        });
    }

    /// Spawns the messenger task for a fresh peer connection.
    fn add_peer(&mut self, id: NodeId, stream: TcpStream) {
        let (tx_send, rx_send) = mpsc::unbounded_channel();
        self.tx_sends.guard().insert(id, tx_send);
        self.peer_count.fetch_add(1, Ordering::AcqRel);

        let mut messenger = MessengerTask::new(
            self.me,
            id,
            stream,
            rx_send,
            self.tx_recv.clone(),
            self.tx_exit.clone(),
        );
        tokio::spawn(async move { messenger.run().await });
    }

    /// Dials a peer proactively.
    async fn connect_new_peer(
        &mut self,
        id: NodeId,
    ) -> Result<(), KeystoneError> {
        if self.tx_sends.guard().contains_key(&id) {
            return Ok(()); // already connected
        }
        let conn_addr = match self.addr_book.get(&id) {
            Some(&addr) => addr,
            None => {
                return logged_err!(self.me; "unknown peer ID {} to dial", id);
            }
        };

        pf_debug!(self.me; "connecting to peer {} '{}'...", id, conn_addr);
        let mut stream = tcp_connect_with_retry(conn_addr, 1).await?;
        stream.write_u8(self.me).await?; // send my ID

        self.add_peer(id, stream);
        pf_info!(self.me; "connected to peer {}", id);
        Ok(())
    }

    /// Accepts a new inbound peer connection.
    async fn accept_new_peer(
        &mut self,
        mut stream: TcpStream,
    ) -> Result<(), KeystoneError> {
        let id = match stream.read_u8().await {
            Ok(id) => id,
            Err(e) => {
                return logged_err!(self.me; "error receiving peer ID: {}", e);
            }
        };

        if self.tx_sends.guard().contains_key(&id) {
            return logged_err!(self.me; "duplicate peer ID listened: {}", id);
        }

        self.add_peer(id, stream);
        pf_info!(self.me; "waited on peer {}", id);
        Ok(())
    }

    /// Removes handles of a dead peer connection.
    fn remove_left_peer(&mut self, id: NodeId) {
        if self.tx_sends.guard().remove(id).is_some() {
            self.peer_count.fetch_sub(1, Ordering::AcqRel);
        }
        pf_debug!(self.me; "peer {} connection dropped", id);

        // the lower-ID side owns redialing
        if id < self.me {
            self.schedule_redial(id);
        }
    }

    /// Starts the peer acceptor task loop.
    async fn run(&mut self) {
        pf_debug!(self.me; "acceptor task spawned");

        loop {
            tokio::select! {
                // proactive dial request
                to_connect = self.rx_connect.recv() => {
                    let id = match to_connect {
                        Some(id) => id,
                        None => break, // hub dropped
                    };
                    if let Err(e) = self.connect_new_peer(id).await {
                        pf_debug!(self.me; "dial to peer {} failed: {}", id, e);
                        self.schedule_redial(id);
                    }
                },

                // new inbound peer connection
                accepted = self.peer_listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            if let Err(e) = self.accept_new_peer(stream).await {
                                pf_error!(self.me; "error accepting peer: {}", e);
                            }
                        }
                        Err(e) => {
                            pf_warn!(self.me; "error accepting connection: {}", e);
                        }
                    }
                },

                // a messenger task exits
                id = self.rx_exit.recv() => {
                    let id = id.unwrap();
                    self.remove_left_peer(id);
                },
            }
        }

        pf_debug!(self.me; "acceptor task exitted");
    }
}

/// Per-peer messenger task: writes outgoing envelopes onto the socket and
/// feeds incoming envelopes into the recv channel.
struct MessengerTask {
    me: NodeId,

    /// Corresponding peer's ID.
    id: NodeId,

    conn_read: OwnedReadHalf,
    conn_write: OwnedWriteHalf,

    rx_send: mpsc::UnboundedReceiver<PeerMessage>,
    read_buf: BytesMut,

    tx_recv: mpsc::UnboundedSender<(NodeId, PeerMessage)>,
    write_buf: BytesMut,
    write_buf_cursor: usize,
    retrying: bool,

    tx_exit: mpsc::UnboundedSender<NodeId>,
}

impl MessengerTask {
    fn new(
        me: NodeId,
        id: NodeId,
        conn: TcpStream,
        rx_send: mpsc::UnboundedReceiver<PeerMessage>,
        tx_recv: mpsc::UnboundedSender<(NodeId, PeerMessage)>,
        tx_exit: mpsc::UnboundedSender<NodeId>,
    ) -> Self {
        let (conn_read, conn_write) = conn.into_split();

        MessengerTask {
            me,
            id,
            conn_read,
            conn_write,
            rx_send,
            read_buf: BytesMut::with_capacity(8 + 1024),
            tx_recv,
            write_buf: BytesMut::with_capacity(8 + 1024),
            write_buf_cursor: 0,
            retrying: false,
            tx_exit,
        }
    }

    /// Starts the per-peer messenger task loop.
    async fn run(&mut self) {
        pf_debug!(self.me; "messenger task for peer {} spawned", self.id);

        loop {
            tokio::select! {
                // gets an envelope to send out
                msg = self.rx_send.recv(), if !self.retrying => {
                    match msg {
                        Some(msg) => {
                            match safe_tcp_write(
                                &mut self.write_buf,
                                &mut self.write_buf_cursor,
                                &self.conn_write,
                                Some(&msg),
                            ) {
                                Ok(true) => {}
                                Ok(false) => {
                                    pf_debug!(self.me;
                                              "should retry msg send -> {}",
                                              self.id);
                                    self.retrying = true;
                                }
                                Err(_e) => break, // connection broken
                            }
                        }
                        None => break, // send channel closed
                    }
                },

                // retrying last unsuccessful send
                _ = self.conn_write.writable(), if self.retrying => {
                    match safe_tcp_write::<PeerMessage, _>(
                        &mut self.write_buf,
                        &mut self.write_buf_cursor,
                        &self.conn_write,
                        None,
                    ) {
                        Ok(true) => {
                            pf_debug!(self.me;
                                      "finished retrying msg send -> {}",
                                      self.id);
                            self.retrying = false;
                        }
                        Ok(false) => {}
                        Err(_e) => break, // connection broken
                    }
                },

                // receives new envelope from peer
                msg = safe_tcp_read(&mut self.read_buf, &mut self.conn_read) => {
                    match msg {
                        Ok(msg) => {
                            if self.tx_recv.send((self.id, msg)).is_err() {
                                break; // hub torn down
                            }
                        }
                        Err(FrameReadError::BadMessage(e)) => {
                            // a peer frame that does not decode is fatal;
                            // a supervisor is expected to restart us
                            pf_error!(self.me;
                                      "bad message <- {}: {}", self.id, e);
                            std::process::exit(1);
                        }
                        Err(FrameReadError::Conn(_e)) => {
                            break; // peer exited; connection is down
                        }
                    }
                }
            }
        }

        self.tx_exit.send(self.id).ok();
        pf_debug!(self.me; "messenger task for peer {} exitted", self.id);
    }
}

#[cfg(test)]
mod transport_tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::Barrier;

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn api_multi_call() -> Result<(), KeystoneError> {
        let barrier = Arc::new(Barrier::new(3));
        let barrier1 = barrier.clone();
        let barrier2 = barrier.clone();
        tokio::spawn(async move {
            // node 1
            let mut addr_book = HashMap::new();
            addr_book
                .insert(0, "127.0.0.1:31800".parse::<SocketAddr>().unwrap());
            addr_book
                .insert(2, "127.0.0.1:31802".parse::<SocketAddr>().unwrap());
            let (tx_engine, mut rx_engine) = mpsc::unbounded_channel();
            let (tx_engine_reply, rx_engine_reply) = mpsc::unbounded_channel();
            let hub = TransportHub::new_and_setup(
                1,
                "127.0.0.1:31801".parse()?,
                addr_book,
                tx_engine,
                rx_engine_reply,
            )
            .await?;
            hub.connect_to_peer(0)?;
            barrier1.wait().await;
            // reply Ok to whatever request arrives
            while let Some(input) = rx_engine.recv().await {
                if let EngineInput::Peer { peer, seq, .. } = input {
                    tx_engine_reply.send((peer, seq, NodeReply::Ok)).ok();
                }
            }
            Ok::<(), KeystoneError>(())
        });
        tokio::spawn(async move {
            // node 2
            let mut addr_book = HashMap::new();
            addr_book
                .insert(0, "127.0.0.1:31800".parse::<SocketAddr>().unwrap());
            addr_book
                .insert(1, "127.0.0.1:31801".parse::<SocketAddr>().unwrap());
            let (tx_engine, mut rx_engine) = mpsc::unbounded_channel();
            let (tx_engine_reply, rx_engine_reply) = mpsc::unbounded_channel();
            let hub = TransportHub::new_and_setup(
                2,
                "127.0.0.1:31802".parse()?,
                addr_book,
                tx_engine,
                rx_engine_reply,
            )
            .await?;
            hub.connect_to_peer(0)?;
            hub.connect_to_peer(1)?;
            barrier2.wait().await;
            while let Some(input) = rx_engine.recv().await {
                if let EngineInput::Peer { peer, seq, .. } = input {
                    tx_engine_reply
                        .send((peer, seq, NodeReply::AlreadyLocked))
                        .ok();
                }
            }
            Ok::<(), KeystoneError>(())
        });
        // node 0
        let mut addr_book = HashMap::new();
        addr_book.insert(1, "127.0.0.1:31801".parse::<SocketAddr>()?);
        addr_book.insert(2, "127.0.0.1:31802".parse::<SocketAddr>()?);
        let (tx_engine, mut rx_engine) = mpsc::unbounded_channel();
        let (tx_engine_reply, rx_engine_reply) = mpsc::unbounded_channel();
        let hub = TransportHub::new_and_setup(
            0,
            "127.0.0.1:31800".parse()?,
            addr_book,
            tx_engine,
            rx_engine_reply,
        )
        .await?;
        // my own engine replies Ok through the loopback path
        tokio::spawn(async move {
            while let Some(input) = rx_engine.recv().await {
                if let EngineInput::Peer { peer, seq, .. } = input {
                    tx_engine_reply.send((peer, seq, NodeReply::Ok)).ok();
                }
            }
        });
        hub.wait_for_group(3).await?;
        barrier.wait().await;

        let caller = hub.caller();
        let replies = caller
            .multi_call(
                &[0, 1, 2],
                NodeRequest::Abort { tag: 7 },
                Duration::from_millis(2000),
            )
            .await?;
        assert_eq!(replies.get(&0), Some(&Some(NodeReply::Ok)));
        assert_eq!(replies.get(&1), Some(&Some(NodeReply::Ok)));
        assert_eq!(replies.get(&2), Some(&Some(NodeReply::AlreadyLocked)));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn down_peer_times_out() -> Result<(), KeystoneError> {
        let mut addr_book = HashMap::new();
        // peer 1 is never started
        addr_book.insert(1, "127.0.0.1:31811".parse::<SocketAddr>()?);
        let (tx_engine, mut rx_engine) = mpsc::unbounded_channel();
        let (tx_engine_reply, rx_engine_reply) = mpsc::unbounded_channel();
        let hub = TransportHub::new_and_setup(
            0,
            "127.0.0.1:31810".parse()?,
            addr_book,
            tx_engine,
            rx_engine_reply,
        )
        .await?;
        tokio::spawn(async move {
            while let Some(input) = rx_engine.recv().await {
                if let EngineInput::Peer { peer, seq, .. } = input {
                    tx_engine_reply.send((peer, seq, NodeReply::Ok)).ok();
                }
            }
        });

        let caller = hub.caller();
        let replies = caller
            .multi_call(
                &[0, 1],
                NodeRequest::Abort { tag: 7 },
                Duration::from_millis(300),
            )
            .await?;
        assert_eq!(replies.get(&0), Some(&Some(NodeReply::Ok)));
        assert_eq!(replies.get(&1), Some(&None)); // down
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cast_reaches_peer() -> Result<(), KeystoneError> {
        let barrier = Arc::new(Barrier::new(2));
        let barrier1 = barrier.clone();
        let handle = tokio::spawn(async move {
            // node 1
            let mut addr_book = HashMap::new();
            addr_book
                .insert(0, "127.0.0.1:31820".parse::<SocketAddr>().unwrap());
            let (tx_engine, mut rx_engine) = mpsc::unbounded_channel();
            let (_tx_engine_reply, rx_engine_reply) =
                mpsc::unbounded_channel();
            let hub = TransportHub::new_and_setup(
                1,
                "127.0.0.1:31821".parse()?,
                addr_book,
                tx_engine,
                rx_engine_reply,
            )
            .await?;
            hub.connect_to_peer(0)?;
            barrier1.wait().await;
            match rx_engine.recv().await {
                Some(EngineInput::Apply { origin, records }) => {
                    assert_eq!(origin, 0);
                    assert_eq!(records.len(), 1);
                }
                other => panic!("unexpected input: {:?}", other),
            }
            Ok::<(), KeystoneError>(())
        });
        // node 0
        let mut addr_book = HashMap::new();
        addr_book.insert(1, "127.0.0.1:31821".parse::<SocketAddr>()?);
        let (tx_engine, _rx_engine) = mpsc::unbounded_channel();
        let (_tx_engine_reply, rx_engine_reply) = mpsc::unbounded_channel();
        let hub = TransportHub::new_and_setup(
            0,
            "127.0.0.1:31820".parse()?,
            addr_book,
            tx_engine,
            rx_engine_reply,
        )
        .await?;
        hub.wait_for_group(2).await?;
        barrier.wait().await;
        hub.caller().cast_apply(
            &[1],
            vec![LogRecord::Write {
                key: "k".into(),
                value: "v".into(),
                lease_ms: 1000,
            }],
        )?;
        handle.await.map_err(KeystoneError::msg)??;
        Ok(())
    }
}
