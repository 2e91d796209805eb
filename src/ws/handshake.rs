//! The HTTP upgrade handshake.
//!
//! A client sends a GET with the upgrade headers and a random key; the
//! server answers 101 with the derived accept token. Parsing uses
//! httparse; everything after the header terminator belongs to the
//! framing layer and is handed back untouched.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};

/// RFC 6455 accept-key GUID.
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Largest header block either side will buffer.
pub(crate) const MAX_HEADERS_LEN: usize = 8192;

const MAX_HEADER_COUNT: usize = 32;

/// A parsed upgrade request, handed to the listener hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    pub path: String,
    pub key: String,
    /// Subprotocols offered by the client, in order.
    pub protocols: Vec<String>,
    pub headers: Vec<(String, String)>,
}

/// The response the server is about to send; a hook may override the
/// status (refusing the upgrade) or add headers.
#[derive(Debug, Clone)]
pub struct UpgradeResponse {
    pub status: u16,
    pub reason: String,
    pub protocol: Option<String>,
    pub extra_headers: Vec<(String, String)>,
}

impl UpgradeResponse {
    pub(crate) fn accept() -> UpgradeResponse {
        UpgradeResponse {
            status: 101,
            reason: "Switching Protocols".into(),
            protocol: None,
            extra_headers: Vec::new(),
        }
    }
}

/// Generates the client key: 16 random bytes in base64 (24 chars).
pub(crate) fn make_key() -> String {
    let nonce: [u8; 16] = rand::random();
    BASE64.encode(nonce)
}

/// Derives `Sec-WebSocket-Accept` from a client key.
pub(crate) fn accept_key(key: &str) -> String {
    let mut sha = Sha1::new();
    sha.update(key.as_bytes());
    sha.update(WS_GUID.as_bytes());
    BASE64.encode(sha.finalize())
}

/// Builds the client's upgrade request.
pub(crate) fn build_request(
    host: &str,
    path: &str,
    key: &str,
    protocol: Option<&str>,
) -> String {
    let mut req = format!(
        "GET {} HTTP/1.1\r\n\
         Host: {}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {}\r\n\
         Sec-WebSocket-Version: 13\r\n",
        path, host, key
    );
    if let Some(proto) = protocol {
        req.push_str(&format!("Sec-WebSocket-Protocol: {}\r\n", proto));
    }
    req.push_str("\r\n");
    req
}

/// Builds the server's 101 (or refusal) response.
pub(crate) fn build_response(resp: &UpgradeResponse, key: &str) -> String {
    if resp.status != 101 {
        let mut out = format!("HTTP/1.1 {} {}\r\n", resp.status, resp.reason);
        for (name, value) in &resp.extra_headers {
            out.push_str(&format!("{}: {}\r\n", name, value));
        }
        out.push_str("Content-Length: 0\r\n\r\n");
        return out;
    }
    let mut out = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n",
        accept_key(key)
    );
    if let Some(proto) = &resp.protocol {
        out.push_str(&format!("Sec-WebSocket-Protocol: {}\r\n", proto));
    }
    for (name, value) in &resp.extra_headers {
        out.push_str(&format!("{}: {}\r\n", name, value));
    }
    out.push_str("\r\n");
    out
}

fn header_eq(value: &str, expect: &str) -> bool {
    value.eq_ignore_ascii_case(expect)
}

fn connection_has_upgrade(value: &str) -> bool {
    value
        .split(',')
        .any(|tok| header_eq(tok.trim(), "upgrade"))
}

/// Parses and validates a client upgrade request. `Ok(None)` means the
/// header block is still incomplete. A validation failure carries the
/// HTTP status to answer with.
pub(crate) fn parse_request(
    buf: &[u8],
) -> std::result::Result<Option<(UpgradeRequest, usize)>, u16> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADER_COUNT];
    let mut req = httparse::Request::new(&mut headers);
    let consumed = match req.parse(buf) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(_) => return Err(400),
    };
    if req.method != Some("GET") {
        return Err(405);
    }
    let path = req.path.unwrap_or("/").to_string();

    let mut key = None;
    let mut upgrade_ok = false;
    let mut connection_ok = false;
    let mut version_ok = false;
    let mut protocols = Vec::new();
    let mut all = Vec::new();
    for h in req.headers.iter() {
        let value = match std::str::from_utf8(h.value) {
            Ok(v) => v,
            Err(_) => return Err(400),
        };
        all.push((h.name.to_string(), value.to_string()));
        if header_eq(h.name, "upgrade") {
            upgrade_ok = header_eq(value.trim(), "websocket");
        } else if header_eq(h.name, "connection") {
            connection_ok = connection_has_upgrade(value);
        } else if header_eq(h.name, "sec-websocket-version") {
            version_ok = value.trim() == "13";
        } else if header_eq(h.name, "sec-websocket-key") {
            key = Some(value.trim().to_string());
        } else if header_eq(h.name, "sec-websocket-protocol") {
            protocols.extend(value.split(',').map(|p| p.trim().to_string()));
        }
    }
    if !upgrade_ok || !connection_ok {
        return Err(400);
    }
    if !version_ok {
        return Err(426);
    }
    let Some(key) = key else {
        return Err(400);
    };
    if key.len() != 24 || BASE64.decode(&key).map(|k| k.len()) != Ok(16) {
        return Err(400);
    }
    Ok(Some((
        UpgradeRequest {
            path,
            key,
            protocols,
            headers: all,
        },
        consumed,
    )))
}

/// Parses and validates the server's response against the key we sent.
/// `Ok(None)` while incomplete; the success value is the bytes
/// consumed and the subprotocol the server selected, if any.
pub(crate) fn parse_response(
    buf: &[u8],
    key: &str,
    requested: Option<&str>,
) -> Result<Option<(usize, Option<String>)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADER_COUNT];
    let mut resp = httparse::Response::new(&mut headers);
    let consumed = match resp.parse(buf) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(_) => return Err(Error::ProtocolError),
    };
    if resp.code != Some(101) {
        return Err(Error::ConnRefused);
    }
    let mut accept_ok = false;
    let mut upgrade_ok = false;
    let mut connection_ok = false;
    let mut selected = None;
    for h in resp.headers.iter() {
        let value = match std::str::from_utf8(h.value) {
            Ok(v) => v,
            Err(_) => return Err(Error::ProtocolError),
        };
        if header_eq(h.name, "sec-websocket-accept") {
            accept_ok = value.trim() == accept_key(key);
        } else if header_eq(h.name, "upgrade") {
            upgrade_ok = header_eq(value.trim(), "websocket");
        } else if header_eq(h.name, "connection") {
            connection_ok = connection_has_upgrade(value);
        } else if header_eq(h.name, "sec-websocket-protocol") {
            selected = Some(value.trim().to_string());
        }
    }
    if !accept_ok || !upgrade_ok || !connection_ok {
        return Err(Error::ProtocolError);
    }
    match (&selected, requested) {
        (Some(sel), Some(req)) if !req.split(',').any(|p| p.trim() == sel) => {
            return Err(Error::ProtocolError);
        }
        (Some(_), None) => return Err(Error::ProtocolError),
        _ => {}
    }
    Ok(Some((consumed, selected)))
}

#[cfg(test)]
mod tests {
    use super::*;

    // the worked example from RFC 6455 section 1.3
    const SAMPLE_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";

    #[test]
    fn rfc_sample_accept_key() {
        assert_eq!(accept_key(SAMPLE_KEY), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn request_round_trip() {
        let req = build_request("h", "/", SAMPLE_KEY, None);
        let (parsed, consumed) = parse_request(req.as_bytes()).unwrap().unwrap();
        assert_eq!(consumed, req.len());
        assert_eq!(parsed.key, SAMPLE_KEY);
        assert_eq!(parsed.path, "/");
        assert!(parsed.protocols.is_empty());
    }

    #[test]
    fn request_with_subprotocol() {
        let req = build_request("h", "/sp", SAMPLE_KEY, Some("pair.sp"));
        let (parsed, _) = parse_request(req.as_bytes()).unwrap().unwrap();
        assert_eq!(parsed.protocols, vec!["pair.sp".to_string()]);
    }

    #[test]
    fn request_missing_upgrade_rejected() {
        let req = format!(
            "GET / HTTP/1.1\r\nHost: h\r\nSec-WebSocket-Key: {}\r\n\
             Sec-WebSocket-Version: 13\r\n\r\n",
            SAMPLE_KEY
        );
        assert_eq!(parse_request(req.as_bytes()), Err(400));
    }

    #[test]
    fn request_bad_version_rejected() {
        let req = format!(
            "GET / HTTP/1.1\r\nHost: h\r\nUpgrade: websocket\r\n\
             Connection: upgrade\r\nSec-WebSocket-Key: {}\r\n\
             Sec-WebSocket-Version: 8\r\n\r\n",
            SAMPLE_KEY
        );
        assert_eq!(parse_request(req.as_bytes()), Err(426));
    }

    #[test]
    fn partial_request_asks_for_more() {
        let req = build_request("h", "/", SAMPLE_KEY, None);
        assert_eq!(parse_request(&req.as_bytes()[..20]), Ok(None));
    }

    #[test]
    fn response_round_trip_with_trailing_frame_bytes() {
        let mut resp = build_response(&UpgradeResponse::accept(), SAMPLE_KEY).into_bytes();
        let header_len = resp.len();
        resp.extend_from_slice(&[0x82, 0x01, 0x41]);
        let (consumed, selected) = parse_response(&resp, SAMPLE_KEY, None).unwrap().unwrap();
        assert_eq!(consumed, header_len);
        assert_eq!(selected, None);
    }

    #[test]
    fn response_wrong_accept_rejected() {
        let other = build_response(&UpgradeResponse::accept(), "AAAAAAAAAAAAAAAAAAAAAA==");
        assert_eq!(
            parse_response(other.as_bytes(), SAMPLE_KEY, None),
            Err(Error::ProtocolError)
        );
    }

    #[test]
    fn response_non_101_is_refused() {
        let resp = UpgradeResponse {
            status: 403,
            reason: "Forbidden".into(),
            protocol: None,
            extra_headers: Vec::new(),
        };
        let text = build_response(&resp, SAMPLE_KEY);
        assert_eq!(
            parse_response(text.as_bytes(), SAMPLE_KEY, None),
            Err(Error::ConnRefused)
        );
    }

    #[test]
    fn unsolicited_subprotocol_rejected() {
        let resp = UpgradeResponse {
            protocol: Some("pair.sp".into()),
            ..UpgradeResponse::accept()
        };
        let text = build_response(&resp, SAMPLE_KEY);
        assert_eq!(
            parse_response(text.as_bytes(), SAMPLE_KEY, None),
            Err(Error::ProtocolError)
        );
        assert!(parse_response(text.as_bytes(), SAMPLE_KEY, Some("pair.sp"))
            .unwrap()
            .is_some());
    }
}
