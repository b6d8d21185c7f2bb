//! AJP13 numeric codes.
//!
//! Packet prefixes, method codes, well-known header codes and request
//! attribute codes, plus lookups between names and codes.

/// Tag of packets sent from the web server to the container.
pub const AJP13_WS_HEADER: u16 = 0x1234;
/// Tag of packets sent from the container to the web server (`'A' 'B'`).
pub const AJP13_SW_HEADER: u16 = 0x4142;

pub const JK_AJP13_FORWARD_REQUEST: u8 = 2;
pub const JK_AJP13_SEND_BODY_CHUNK: u8 = 3;
pub const JK_AJP13_SEND_HEADERS: u8 = 4;
pub const JK_AJP13_END_RESPONSE: u8 = 5;
pub const JK_AJP13_GET_BODY_CHUNK: u8 = 6;
pub const JK_AJP13_SHUTDOWN: u8 = 7;
pub const JK_AJP13_CPONG_REPLY: u8 = 9;
pub const JK_AJP13_CPING_REQUEST: u8 = 10;

/// Method marker for methods without a dedicated code.
pub const SC_M_JK_STORED: u8 = 0xFF;

pub const SC_A_CONTEXT: u8 = 1;
pub const SC_A_SERVLET_PATH: u8 = 2;
pub const SC_A_REMOTE_USER: u8 = 3;
pub const SC_A_AUTH_TYPE: u8 = 4;
pub const SC_A_QUERY_STRING: u8 = 5;
pub const SC_A_ROUTE: u8 = 6;
pub const SC_A_SSL_CERT: u8 = 7;
pub const SC_A_SSL_CIPHER: u8 = 8;
pub const SC_A_SSL_SESSION: u8 = 9;
pub const SC_A_REQ_ATTRIBUTE: u8 = 10;
pub const SC_A_SSL_KEY_SIZE: u8 = 11;
pub const SC_A_SECRET: u8 = 12;
pub const SC_A_STORED_METHOD: u8 = 13;
pub const SC_A_ARE_DONE: u8 = 0xFF;

const METHODS: [&str; 27] = [
    "OPTIONS",
    "GET",
    "HEAD",
    "POST",
    "PUT",
    "DELETE",
    "TRACE",
    "PROPFIND",
    "PROPPATCH",
    "MKCOL",
    "COPY",
    "MOVE",
    "LOCK",
    "UNLOCK",
    "ACL",
    "REPORT",
    "VERSION-CONTROL",
    "CHECKIN",
    "CHECKOUT",
    "UNCHECKOUT",
    "SEARCH",
    "MKWORKSPACE",
    "UPDATE",
    "LABEL",
    "MERGE",
    "BASELINE-CONTROL",
    "MKACTIVITY",
];

const REQUEST_HEADERS: [&str; 14] = [
    "accept",
    "accept-charset",
    "accept-encoding",
    "accept-language",
    "authorization",
    "connection",
    "content-type",
    "content-length",
    "cookie",
    "cookie2",
    "host",
    "pragma",
    "referer",
    "user-agent",
];

const RESPONSE_HEADERS: [&str; 11] = [
    "Content-Type",
    "Content-Language",
    "Content-Length",
    "Date",
    "Last-Modified",
    "Location",
    "Set-Cookie",
    "Set-Cookie2",
    "Servlet-Engine",
    "Status",
    "WWW-Authenticate",
];

const HEADER_CODE_BASE: u16 = 0xA000;

/// Method code for an HTTP method name (case-sensitive, as on the wire).
pub fn method_code(method: &str) -> Option<u8> {
    METHODS
        .iter()
        .position(|m| *m == method)
        .map(|i| (i + 1) as u8)
}

/// Method name for a method code.
pub fn method_name(code: u8) -> Option<&'static str> {
    METHODS.get((code as usize).checked_sub(1)?).copied()
}

/// Wire code for a well-known request header name (case-insensitive).
pub fn request_header_code(name: &str) -> Option<u16> {
    REQUEST_HEADERS
        .iter()
        .position(|h| h.eq_ignore_ascii_case(name))
        .map(|i| HEADER_CODE_BASE + 1 + i as u16)
}

/// Request header name for a wire code.
pub fn request_header_name(code: u16) -> Option<&'static str> {
    let idx = code.checked_sub(HEADER_CODE_BASE + 1)? as usize;
    REQUEST_HEADERS.get(idx).copied()
}

/// Response header name for a wire code.
pub fn response_header_name(code: u16) -> Option<&'static str> {
    let idx = code.checked_sub(HEADER_CODE_BASE + 1)? as usize;
    RESPONSE_HEADERS.get(idx).copied()
}

/// Wire code for a well-known response header name (case-insensitive).
pub fn response_header_code(name: &str) -> Option<u16> {
    RESPONSE_HEADERS
        .iter()
        .position(|h| h.eq_ignore_ascii_case(name))
        .map(|i| HEADER_CODE_BASE + 1 + i as u16)
}

/// True when a string length field actually holds a header code.
pub fn is_coded_header(len_or_code: u16) -> bool {
    len_or_code & 0xFF00 == HEADER_CODE_BASE
}
