//! ajplb Common Types and Transport
//!
//! This crate provides the AJP13 protocol codec, the TCP transport layer
//! and the runtime context shared by every other ajplb crate.
//!
//! # Overview
//!
//! ajplb routes HTTP requests from a front-end web server to backend
//! application servers over AJP13, a binary packet protocol. This crate
//! contains the pieces that everything else is built on:
//!
//! - **Protocol Layer**: [`MessageBuffer`], packet codes, forward request
//!   encoding, reply decoding and the [`AjpError`] type
//! - **Transport Layer**: multi-address TCP connect and packet I/O
//! - **Runtime**: [`RuntimeRegistry`] with the injectable clock and the
//!   cross-process [`SharedStore`](runtime::SharedStore) seam
//! - **States**: member, worker, activation, method and lock enums
//!
//! # Wire Format
//!
//! - **Header**: 2-byte tag (`0x1234` to the container, `AB` back) and
//!   2-byte body length
//! - **Integers**: 1, 2 or 4 bytes, big-endian
//! - **Strings**: 2-byte length, bytes, NUL; `0xFFFF` is null
//! - **Max Packet Size**: 8192 bytes by default, up to 65536
//!
//! # Example
//!
//! ```
//! use ajplb_common::{ForwardRequest, MessageBuffer};
//!
//! let request = ForwardRequest::new("GET", "/index.jsp").with_header("Host", "example.com");
//! let mut msg = MessageBuffer::default();
//! request.encode(&mut msg).unwrap();
//! assert_eq!(msg.header_tag(), 0x1234);
//! ```

pub mod protocol;
pub mod runtime;
pub mod states;
pub mod transport;

pub use protocol::*;
pub use runtime::RuntimeRegistry;
pub use states::{Activation, LbMethod, LockMode, MemberState, WorkerState};
