//! Forward request encoding.
//!
//! A request is sent to the container as one FORWARD_REQUEST packet
//! followed by body packets:
//!
//! ```text
//! FORWARD_REQUEST
//!   prefix      byte   (2)
//!   method      byte
//!   protocol    string
//!   req_uri     string
//!   remote_addr string
//!   remote_host string
//!   server_name string
//!   server_port int
//!   is_ssl      byte
//!   num_headers int
//!   headers     (code int | name string) value string
//!   attributes  code byte, value(s) ... 0xFF
//!
//! body packet
//!   length      int
//!   data        bytes
//! ```

use serde::{Deserialize, Serialize};

use super::codes::*;
use super::error::{AjpError, Result};
use super::message::{MessageBuffer, AJP_HEADER_LEN};

/// An HTTP request as handed to the connector by the host server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardRequest {
    pub method: String,
    pub protocol: String,
    /// Request path. Path parameters such as `;jsessionid=...` stay in place.
    pub uri: String,
    pub query_string: Option<String>,
    pub remote_addr: String,
    pub remote_host: Option<String>,
    pub server_name: String,
    pub server_port: u16,
    pub is_ssl: bool,
    pub headers: Vec<(String, String)>,
    pub remote_user: Option<String>,
    pub auth_type: Option<String>,
    /// Route of the member that serves the request, filled in by the balancer.
    pub route: Option<String>,
    /// Shared secret, filled in by the worker.
    pub secret: Option<String>,
    pub attributes: Vec<(String, String)>,
    #[serde(default)]
    pub body: Vec<u8>,
}

impl ForwardRequest {
    /// Creates a request with local defaults for the connection fields.
    pub fn new(method: impl Into<String>, uri: impl Into<String>) -> Self {
        let uri = uri.into();
        let (path, query) = match uri.split_once('?') {
            Some((p, q)) => (p.to_string(), Some(q.to_string())),
            None => (uri, None),
        };
        Self {
            method: method.into(),
            protocol: "HTTP/1.1".to_string(),
            uri: path,
            query_string: query,
            remote_addr: "127.0.0.1".to_string(),
            remote_host: None,
            server_name: "localhost".to_string(),
            server_port: 80,
            is_ssl: false,
            headers: Vec::new(),
            remote_user: None,
            auth_type: None,
            route: None,
            secret: None,
            attributes: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// First value of a header, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values of the Cookie header(s).
    pub fn cookies(&self) -> impl Iterator<Item = &str> {
        self.headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case("cookie"))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_head(&self) -> bool {
        self.method == "HEAD"
    }

    pub fn is_get(&self) -> bool {
        self.method == "GET"
    }

    /// Encodes the FORWARD_REQUEST packet into `msg`.
    ///
    /// A `Content-Length` header is added when the request has a body and
    /// none was supplied.
    pub fn encode(&self, msg: &mut MessageBuffer) -> Result<()> {
        msg.reset();
        msg.append_u8(JK_AJP13_FORWARD_REQUEST)?;

        let code = method_code(&self.method);
        msg.append_u8(code.unwrap_or(SC_M_JK_STORED))?;
        msg.append_str(&self.protocol)?;
        msg.append_str(&self.uri)?;
        msg.append_str(&self.remote_addr)?;
        msg.append_string(Some(self.remote_host.as_deref().unwrap_or(&self.remote_addr)))?;
        msg.append_str(&self.server_name)?;
        msg.append_u16(self.server_port)?;
        msg.append_u8(self.is_ssl as u8)?;

        let add_length = !self.body.is_empty() && self.header("content-length").is_none();
        let count = self.headers.len() + add_length as usize;
        if count > u16::MAX as usize {
            return Err(AjpError::Framing(format!("too many headers: {}", count)));
        }
        msg.append_u16(count as u16)?;
        for (name, value) in &self.headers {
            match request_header_code(name) {
                Some(code) => msg.append_u16(code)?,
                None => msg.append_str(name)?,
            }
            msg.append_str(value)?;
        }
        if add_length {
            msg.append_u16(0xA008)?;
            msg.append_str(&self.body.len().to_string())?;
        }

        if let Some(user) = &self.remote_user {
            msg.append_u8(SC_A_REMOTE_USER)?;
            msg.append_str(user)?;
        }
        if let Some(auth) = &self.auth_type {
            msg.append_u8(SC_A_AUTH_TYPE)?;
            msg.append_str(auth)?;
        }
        if let Some(query) = &self.query_string {
            msg.append_u8(SC_A_QUERY_STRING)?;
            msg.append_str(query)?;
        }
        if let Some(route) = &self.route {
            msg.append_u8(SC_A_ROUTE)?;
            msg.append_str(route)?;
        }
        if let Some(secret) = &self.secret {
            msg.append_u8(SC_A_SECRET)?;
            msg.append_str(secret)?;
        }
        for (name, value) in &self.attributes {
            msg.append_u8(SC_A_REQ_ATTRIBUTE)?;
            msg.append_str(name)?;
            msg.append_str(value)?;
        }
        if code.is_none() {
            msg.append_u8(SC_A_STORED_METHOD)?;
            msg.append_str(&self.method)?;
        }
        msg.append_u8(SC_A_ARE_DONE)?;
        msg.seal(AJP13_WS_HEADER);
        Ok(())
    }

    /// Decodes a FORWARD_REQUEST packet. Used on the container side.
    pub fn decode(msg: &mut MessageBuffer) -> Result<Self> {
        let prefix = msg.read_u8()?;
        if prefix != JK_AJP13_FORWARD_REQUEST {
            return Err(AjpError::Framing(format!(
                "expected forward request, got prefix {}",
                prefix
            )));
        }
        let code = msg.read_u8()?;
        let mut method = method_name(code).map(str::to_string);
        let protocol = required(msg, "protocol")?;
        let uri = required(msg, "req_uri")?;
        let remote_addr = required(msg, "remote_addr")?;
        let remote_host = msg.read_string()?;
        let server_name = required(msg, "server_name")?;
        let server_port = msg.read_u16()?;
        let is_ssl = msg.read_u8()? != 0;

        let count = msg.read_u16()?;
        let mut headers = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let marker = msg.peek_u16()?;
            let name = if is_coded_header(marker) {
                msg.read_u16()?;
                request_header_name(marker)
                    .ok_or_else(|| AjpError::Framing(format!("unknown header code {:#06x}", marker)))?
                    .to_string()
            } else {
                required(msg, "header name")?
            };
            let value = msg.read_string()?.unwrap_or_default();
            headers.push((name, value));
        }

        let mut request = ForwardRequest::new(String::new(), uri);
        request.protocol = protocol;
        request.remote_addr = remote_addr;
        request.remote_host = remote_host;
        request.server_name = server_name;
        request.server_port = server_port;
        request.is_ssl = is_ssl;
        request.headers = headers;

        loop {
            match msg.read_u8()? {
                SC_A_ARE_DONE => break,
                SC_A_REMOTE_USER => request.remote_user = msg.read_string()?,
                SC_A_AUTH_TYPE => request.auth_type = msg.read_string()?,
                SC_A_QUERY_STRING => request.query_string = msg.read_string()?,
                SC_A_ROUTE => request.route = msg.read_string()?,
                SC_A_SECRET => request.secret = msg.read_string()?,
                SC_A_STORED_METHOD => method = msg.read_string()?,
                SC_A_REQ_ATTRIBUTE => {
                    let name = required(msg, "attribute name")?;
                    let value = msg.read_string()?.unwrap_or_default();
                    request.attributes.push((name, value));
                }
                SC_A_SSL_KEY_SIZE => {
                    msg.read_u16()?;
                }
                SC_A_CONTEXT | SC_A_SERVLET_PATH | SC_A_SSL_CERT | SC_A_SSL_CIPHER
                | SC_A_SSL_SESSION => {
                    msg.read_string()?;
                }
                other => {
                    return Err(AjpError::Framing(format!("unknown attribute code {}", other)));
                }
            }
        }
        request.method =
            method.ok_or_else(|| AjpError::Framing(format!("unknown method code {}", code)))?;
        Ok(request)
    }
}

fn required(msg: &mut MessageBuffer, field: &str) -> Result<String> {
    msg.read_string()?
        .ok_or_else(|| AjpError::Framing(format!("missing {}", field)))
}

/// Largest body chunk that fits into one packet of `packet_size` bytes.
pub fn max_body_chunk(packet_size: usize) -> usize {
    packet_size.saturating_sub(AJP_HEADER_LEN + 2)
}

/// Encodes a request body packet. An empty `data` marks the end of the body.
pub fn encode_body_chunk(msg: &mut MessageBuffer, data: &[u8]) -> Result<()> {
    msg.reset();
    if !data.is_empty() {
        if data.len() > u16::MAX as usize {
            return Err(AjpError::Overflow {
                needed: data.len(),
                capacity: u16::MAX as usize,
            });
        }
        msg.append_u16(data.len() as u16)?;
        msg.append_bytes(data)?;
    }
    msg.seal(AJP13_WS_HEADER);
    Ok(())
}

/// Encodes a CPING probe.
pub fn encode_cping(msg: &mut MessageBuffer) -> Result<()> {
    msg.reset();
    msg.append_u8(JK_AJP13_CPING_REQUEST)?;
    msg.seal(AJP13_WS_HEADER);
    Ok(())
}
