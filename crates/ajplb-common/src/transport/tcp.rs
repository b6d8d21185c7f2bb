use std::net::SocketAddr;
use std::time::Duration;

use futures::FutureExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tracing::{debug, trace};

use crate::protocol::error::{AjpError, Result};
use crate::protocol::message::MessageBuffer;

/// Socket options applied to every backend connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketOptions {
    /// Upper bound for establishing one TCP connection
    pub connect_timeout: Duration,
    /// Upper bound for each send or receive; `None` waits forever
    pub io_timeout: Option<Duration>,
    pub keepalive: bool,
    /// Send and receive buffer size; `None` keeps the OS default
    pub buffer_size: Option<u32>,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            io_timeout: None,
            keepalive: false,
            buffer_size: None,
        }
    }
}

/// Async TCP transport for AJP packets.
///
/// Packets are framed by the AJP header itself, so the transport only has
/// to write a sealed [`MessageBuffer`] and, on the way back, read a
/// 4-byte header and then exactly the declared body.
///
/// # Wire Protocol
///
/// ```text
/// [2-byte tag] [2-byte body length] [body]
/// ```
///
/// # Example
///
/// ```no_run
/// use ajplb_common::transport::{SocketOptions, TcpTransport};
/// use ajplb_common::protocol::{codes, request, MessageBuffer};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let addrs = TcpTransport::resolve("127.0.0.1", 8009).await?;
/// let (mut stream, _) = TcpTransport::connect_any(&addrs, &SocketOptions::default()).await?;
///
/// let mut msg = MessageBuffer::default();
/// request::encode_cping(&mut msg)?;
/// TcpTransport::send_message(&mut stream, &msg, None).await?;
/// TcpTransport::receive_message(&mut stream, &mut msg, codes::AJP13_SW_HEADER, None).await?;
/// # Ok(())
/// # }
/// ```
pub struct TcpTransport;

impl TcpTransport {
    /// Resolves `host:port` to every address it maps to, in resolver order.
    pub async fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| AjpError::Connect(format!("cannot resolve '{}:{}': {}", host, port, e)))?
            .collect();
        if addrs.is_empty() {
            return Err(AjpError::Connect(format!(
                "'{}:{}' resolved to no addresses",
                host, port
            )));
        }
        Ok(addrs)
    }

    /// Connects to the first reachable address.
    ///
    /// Each address is tried in order with the configured connect timeout,
    /// buffer size and keepalive. Returns the stream together with the
    /// address that accepted it.
    pub async fn connect_any(
        addrs: &[SocketAddr],
        opts: &SocketOptions,
    ) -> Result<(TcpStream, SocketAddr)> {
        let mut last_err = None;
        for addr in addrs {
            match Self::connect_one(*addr, opts).await {
                Ok(stream) => return Ok((stream, *addr)),
                Err(e) => {
                    debug!(%addr, error = %e, "connect attempt failed");
                    last_err = Some(e);
                }
            }
        }
        Err(AjpError::Connect(format!(
            "failed to connect to any of {} address(es): {}",
            addrs.len(),
            last_err
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no addresses".to_string())
        )))
    }

    async fn connect_one(addr: SocketAddr, opts: &SocketOptions) -> Result<TcpStream> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        if opts.keepalive {
            socket.set_keepalive(true)?;
        }
        if let Some(size) = opts.buffer_size {
            socket.set_recv_buffer_size(size)?;
            socket.set_send_buffer_size(size)?;
        }
        let stream = tokio::time::timeout(opts.connect_timeout, socket.connect(addr))
            .await
            .map_err(|_| AjpError::Timeout(opts.connect_timeout.as_millis() as u64))?
            .map_err(|e| Self::map_io_error(e, "connecting"))?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    /// Writes a sealed packet. Returns the number of bytes written.
    pub async fn send_message(
        stream: &mut TcpStream,
        msg: &MessageBuffer,
        timeout: Option<Duration>,
    ) -> Result<usize> {
        trace!("sending packet\n{}", msg.hex_dump());
        let bytes = msg.as_bytes();
        let write = async {
            stream
                .write_all(bytes)
                .await
                .map_err(|e| Self::map_io_error(e, "writing packet"))?;
            stream
                .flush()
                .await
                .map_err(|e| Self::map_io_error(e, "flushing stream"))
        };
        with_timeout(timeout, write).await?;
        Ok(bytes.len())
    }

    /// Reads one packet into `msg`, checking the header tag and size.
    ///
    /// Returns the total number of bytes read, header included.
    ///
    /// # Errors
    ///
    /// - `Framing` if the tag is wrong or the body does not fit `msg`
    /// - `Timeout` if `timeout` elapses first
    /// - `Connect` if the peer closed or reset the connection
    pub async fn receive_message(
        stream: &mut TcpStream,
        msg: &mut MessageBuffer,
        expected_tag: u16,
        timeout: Option<Duration>,
    ) -> Result<usize> {
        msg.reset();
        let read = async {
            stream
                .read_exact(msg.header_mut())
                .await
                .map_err(|e| Self::map_io_error(e, "reading packet header"))?;
            let body = msg.accept_header(expected_tag)?;
            stream
                .read_exact(msg.body_mut())
                .await
                .map_err(|e| Self::map_io_error(e, "reading packet body"))?;
            Ok::<usize, AjpError>(body)
        };
        let body = with_timeout(timeout, read).await?;
        trace!("received packet\n{}", msg.hex_dump());
        Ok(body + crate::protocol::message::AJP_HEADER_LEN)
    }

    /// Non-blocking liveness probe for an idle connection.
    ///
    /// Returns `false` when the peer has closed the socket, reset it, or
    /// sent unsolicited data (an idle AJP connection never carries any).
    pub fn is_alive(stream: &TcpStream) -> bool {
        let mut buf = [0u8; 1];
        match stream.peek(&mut buf).now_or_never() {
            None => true,
            Some(Ok(_)) | Some(Err(_)) => false,
        }
    }

    /// Map IO errors to appropriate AjpError variants
    ///
    /// - Timeouts -> `Timeout`
    /// - Resets, EOF and broken pipes -> `Connect`
    /// - Everything else -> `Io`
    fn map_io_error(err: std::io::Error, context: &str) -> AjpError {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => AjpError::Timeout(0),
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionRefused
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => AjpError::Connect(format!("{}: {}", context, err)),
            _ => AjpError::Io(err),
        }
    }
}

async fn with_timeout<T>(
    timeout: Option<Duration>,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| AjpError::Timeout(limit.as_millis() as u64))?,
        None => fut.await,
    }
}
