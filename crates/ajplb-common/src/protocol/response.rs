//! Container reply packets.
//!
//! While serving a request the container sends a sequence of packets,
//! each tagged `'A' 'B'`:
//!
//! ```text
//! SEND_HEADERS     status int, reason string, num_headers int,
//!                  (code int | name string) value string ...
//! SEND_BODY_CHUNK  length int, data bytes, NUL
//! GET_BODY_CHUNK   requested length int
//! END_RESPONSE     reuse byte
//! CPONG_REPLY      (no body)
//! ```
//!
//! The decoder is used by the worker; the encoders exist for the
//! container side and for test backends.

use serde::{Deserialize, Serialize};

use super::codes::*;
use super::error::{AjpError, Result};
use super::message::MessageBuffer;

/// The assembled reply to one forwarded request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Whether the container allows the connection to be reused.
    pub reuse: bool,
}

impl ForwardResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// One decoded container packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyPacket {
    SendHeaders {
        status: u16,
        reason: String,
        headers: Vec<(String, String)>,
    },
    BodyChunk(Vec<u8>),
    GetBodyChunk(u16),
    EndResponse { reuse: bool },
    CPong,
}

impl ReplyPacket {
    /// Decodes the packet held in `msg`, whose header has already been accepted.
    pub fn decode(msg: &mut MessageBuffer) -> Result<Self> {
        let prefix = msg.read_u8()?;
        match prefix {
            JK_AJP13_SEND_HEADERS => {
                let status = msg.read_u16()?;
                let reason = msg.read_string()?.unwrap_or_default();
                let count = msg.read_u16()?;
                let mut headers = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let marker = msg.peek_u16()?;
                    let name = if is_coded_header(marker) {
                        msg.read_u16()?;
                        response_header_name(marker)
                            .ok_or_else(|| {
                                AjpError::Framing(format!("unknown response header code {:#06x}", marker))
                            })?
                            .to_string()
                    } else {
                        msg.read_string()?
                            .ok_or_else(|| AjpError::Framing("null response header name".into()))?
                    };
                    let value = msg.read_string()?.unwrap_or_default();
                    headers.push((name, value));
                }
                Ok(ReplyPacket::SendHeaders {
                    status,
                    reason,
                    headers,
                })
            }
            JK_AJP13_SEND_BODY_CHUNK => Ok(ReplyPacket::BodyChunk(msg.read_chunk()?.to_vec())),
            JK_AJP13_GET_BODY_CHUNK => Ok(ReplyPacket::GetBodyChunk(msg.read_u16()?)),
            JK_AJP13_END_RESPONSE => {
                // Some containers omit the reuse flag; treat that as "close".
                let reuse = msg.read_u8().map(|b| b != 0).unwrap_or(false);
                Ok(ReplyPacket::EndResponse { reuse })
            }
            JK_AJP13_CPONG_REPLY => Ok(ReplyPacket::CPong),
            other => Err(AjpError::Framing(format!(
                "unexpected reply packet prefix {}",
                other
            ))),
        }
    }

    /// Encodes this packet as the container would.
    pub fn encode(&self, msg: &mut MessageBuffer) -> Result<()> {
        msg.reset();
        match self {
            ReplyPacket::SendHeaders {
                status,
                reason,
                headers,
            } => {
                msg.append_u8(JK_AJP13_SEND_HEADERS)?;
                msg.append_u16(*status)?;
                msg.append_str(reason)?;
                msg.append_u16(headers.len() as u16)?;
                for (name, value) in headers {
                    match response_header_code(name) {
                        Some(code) => msg.append_u16(code)?,
                        None => msg.append_str(name)?,
                    }
                    msg.append_str(value)?;
                }
            }
            ReplyPacket::BodyChunk(data) => {
                msg.append_u8(JK_AJP13_SEND_BODY_CHUNK)?;
                msg.append_u16(data.len() as u16)?;
                msg.append_bytes(data)?;
                msg.append_u8(0)?;
            }
            ReplyPacket::GetBodyChunk(len) => {
                msg.append_u8(JK_AJP13_GET_BODY_CHUNK)?;
                msg.append_u16(*len)?;
            }
            ReplyPacket::EndResponse { reuse } => {
                msg.append_u8(JK_AJP13_END_RESPONSE)?;
                msg.append_u8(*reuse as u8)?;
            }
            ReplyPacket::CPong => msg.append_u8(JK_AJP13_CPONG_REPLY)?,
        }
        msg.seal(AJP13_SW_HEADER);
        Ok(())
    }
}
