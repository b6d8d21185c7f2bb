//! AJP13 protocol layer
//!
//! - [`message`]: the bounded [`MessageBuffer`](message::MessageBuffer) codec
//! - [`codes`]: packet prefixes, method, header and attribute codes
//! - [`request`]: FORWARD_REQUEST and body packet encoding
//! - [`response`]: container reply packets
//! - [`error`]: the crate-wide error type

pub mod codes;
pub mod error;
pub mod message;
pub mod request;
pub mod response;

pub use error::{AjpError, Result};
pub use message::{MessageBuffer, AJP_DEF_PACKET_SIZE, AJP_HEADER_LEN, AJP_MAX_PACKET_SIZE};
pub use request::ForwardRequest;
pub use response::{ForwardResponse, ReplyPacket};
