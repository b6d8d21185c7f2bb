use std::net::SocketAddr;
use std::time::{Duration, SystemTime};

use ajplb_common::protocol::error::{AjpError, Result};
use ajplb_common::protocol::MessageBuffer;
use ajplb_common::transport::TcpTransport;
use tokio::net::TcpStream;
use tracing::debug;

/// One connection slot to one backend worker.
///
/// An endpoint may exist without a socket: it is created unconnected and
/// the worker connects it on first use. It owns the [`MessageBuffer`]
/// used by the exchange it is serving, so the buffer is never shared
/// between concurrent requests.
///
/// # Fields
///
/// - `id`: process-unique id, for logging
/// - `worker`: name of the owning worker (a back-reference, not ownership)
/// - `reuse`: whether the last exchange left the connection reusable
/// - `close_on_recycle`: close the socket when handed back to the pool
pub struct Endpoint {
    id: u64,
    worker: String,
    stream: Option<TcpStream>,
    peer: Option<SocketAddr>,
    addr_sequence: u32,
    msg: MessageBuffer,
    last_access: SystemTime,
    last_error: Option<String>,
    bytes_read: u64,
    bytes_written: u64,
    pub reuse: bool,
    pub close_on_recycle: bool,
}

impl Endpoint {
    pub fn new(id: u64, worker: impl Into<String>, packet_size: usize, now: SystemTime) -> Self {
        Self {
            id,
            worker: worker.into(),
            stream: None,
            peer: None,
            addr_sequence: 0,
            msg: MessageBuffer::new(packet_size),
            last_access: now,
            last_error: None,
            bytes_read: 0,
            bytes_written: 0,
            reuse: false,
            close_on_recycle: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn worker(&self) -> &str {
        &self.worker
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Address generation the socket was opened against.
    pub fn addr_sequence(&self) -> u32 {
        self.addr_sequence
    }

    /// Installs a freshly connected socket.
    pub fn attach(&mut self, stream: TcpStream, peer: SocketAddr, addr_sequence: u32) {
        self.stream = Some(stream);
        self.peer = Some(peer);
        self.addr_sequence = addr_sequence;
        self.reuse = true;
        self.last_error = None;
    }

    /// Closes the socket, if any.
    pub fn close(&mut self) {
        if self.stream.take().is_some() {
            debug!(worker = %self.worker, endpoint = self.id, peer = ?self.peer, "closing endpoint socket");
        }
        self.peer = None;
        self.reuse = false;
    }

    /// Closes the socket if the peer has gone away while it sat idle.
    ///
    /// Returns whether a live socket remains.
    pub fn check_alive(&mut self) -> bool {
        let alive = match &self.stream {
            Some(stream) => TcpTransport::is_alive(stream),
            None => return false,
        };
        if !alive {
            debug!(worker = %self.worker, endpoint = self.id, "peer closed idle connection");
            self.close();
        }
        alive
    }

    pub fn message(&self) -> &MessageBuffer {
        &self.msg
    }

    pub fn message_mut(&mut self) -> &mut MessageBuffer {
        &mut self.msg
    }

    /// Replaces the message buffer if its capacity differs from `packet_size`.
    pub fn resize_message(&mut self, packet_size: usize) {
        if self.msg.capacity() != packet_size {
            self.msg = MessageBuffer::new(packet_size);
        }
    }

    /// Sends the packet currently held in the message buffer.
    pub async fn send(&mut self, timeout: Option<Duration>) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(AjpError::NotConnected)?;
        match TcpTransport::send_message(stream, &self.msg, timeout).await {
            Ok(n) => {
                self.bytes_written += n as u64;
                Ok(())
            }
            Err(e) => {
                self.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Receives one packet into the message buffer.
    pub async fn receive(&mut self, expected_tag: u16, timeout: Option<Duration>) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(AjpError::NotConnected)?;
        match TcpTransport::receive_message(stream, &mut self.msg, expected_tag, timeout).await {
            Ok(n) => {
                self.bytes_read += n as u64;
                Ok(())
            }
            Err(e) => {
                self.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    pub fn last_access(&self) -> SystemTime {
        self.last_access
    }

    pub fn touch(&mut self, now: SystemTime) {
        self.last_access = now;
    }

    /// Time since the endpoint was last released, zero if the clock went backwards.
    pub fn idle_for(&self, now: SystemTime) -> Duration {
        now.duration_since(self.last_access).unwrap_or(Duration::ZERO)
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn record_error(&mut self, error: &AjpError) {
        self.last_error = Some(error.to_string());
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Returns and clears the byte counters as `(read, written)`.
    pub fn take_byte_counts(&mut self) -> (u64, u64) {
        let counts = (self.bytes_read, self.bytes_written);
        self.bytes_read = 0;
        self.bytes_written = 0;
        counts
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.id)
            .field("worker", &self.worker)
            .field("connected", &self.stream.is_some())
            .field("peer", &self.peer)
            .field("reuse", &self.reuse)
            .field("close_on_recycle", &self.close_on_recycle)
            .finish()
    }
}
