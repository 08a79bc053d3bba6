//! Keystone client API communication stub implementation.

use std::net::SocketAddr;

use crate::server::{ApiCommand, ApiReply, ApiRequest, ApiResult, ClientId,
                    RequestId};
use crate::utils::{safe_tcp_read, safe_tcp_write, KeystoneError};

use bytes::BytesMut;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// Client API connection stub. Holds one TCP session to a server node and
/// issues one request at a time.
pub struct ClientApiStub {
    /// My client ID, chosen randomly at connect time.
    id: ClientId,

    /// Read-half split of the TCP connection stream.
    conn_read: OwnedReadHalf,

    /// Write-half split of the TCP connection stream.
    conn_write: OwnedWriteHalf,

    /// Reply read buffer for cancellation safety.
    read_buf: BytesMut,

    /// Request write buffer for deadlock avoidance.
    write_buf: BytesMut,

    /// Request write buffer cursor at first unwritten byte.
    write_buf_cursor: usize,

    /// Next request ID, monotonically increasing.
    next_req: RequestId,
}

impl ClientApiStub {
    /// Connects to the given server address, announcing a fresh random
    /// client ID.
    pub async fn new_and_connect(
        addr: SocketAddr,
    ) -> Result<Self, KeystoneError> {
        let id: ClientId = rand::random();
        pf_debug!(id; "connecting to server '{}'...", addr);

        let mut stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        stream.write_u64(id).await?; // send my client ID
        let (conn_read, conn_write) = stream.into_split();

        Ok(ClientApiStub {
            id,
            conn_read,
            conn_write,
            read_buf: BytesMut::with_capacity(8 + 1024),
            write_buf: BytesMut::with_capacity(8 + 1024),
            write_buf_cursor: 0,
            next_req: 0,
        })
    }

    /// Issues a command and waits for its reply. Replies with a stale
    /// request ID (from an earlier abandoned call) are skipped.
    pub async fn issue(
        &mut self,
        cmd: ApiCommand,
    ) -> Result<ApiResult, KeystoneError> {
        let id = self.next_req;
        self.next_req += 1;
        self.send_req(ApiRequest { id, cmd }).await?;

        loop {
            let reply: ApiReply =
                safe_tcp_read(&mut self.read_buf, &mut self.conn_read)
                    .await?;
            if reply.id == id {
                return Ok(reply.result);
            }
            pf_debug!(self.id; "skipping stale reply for req {}", reply.id);
        }
    }

    /// Sends a request frame, waiting out socket backpressure.
    async fn send_req(&mut self, req: ApiRequest) -> Result<(), KeystoneError> {
        let mut sent = safe_tcp_write(
            &mut self.write_buf,
            &mut self.write_buf_cursor,
            &self.conn_write,
            Some(&req),
        )?;
        while !sent {
            self.conn_write.writable().await?;
            sent = safe_tcp_write::<ApiRequest, _>(
                &mut self.write_buf,
                &mut self.write_buf_cursor,
                &self.conn_write,
                None,
            )?;
        }
        Ok(())
    }
}
