//! AJP transport layer
//!
//! This module moves sealed [`MessageBuffer`](crate::protocol::MessageBuffer)
//! packets over TCP.
//!
//! - **[`TcpTransport`]**: address resolution, multi-address connect with
//!   socket options, packet send/receive with per-operation timeouts and a
//!   non-blocking liveness probe for idle connections
//! - **[`SocketOptions`]**: connect timeout, I/O timeout, keepalive and
//!   buffer size
//!
//! Packet sizes are bounded by the receiving buffer's capacity, which the
//! worker sizes from its `max_packet_size`.

pub mod tcp;

pub use tcp::{SocketOptions, TcpTransport};
