//! # Handshake
//!
//! The HTTP Upgrade exchange that turns a plain TCP stream into a
//! WebSocket connection.
//!
//! The server reads the request's header block, pulls out
//! `Sec-WebSocket-Key`, and answers with the fixed 101 response carrying
//! `Sec-WebSocket-Accept: base64(sha1(key + GUID))`. A request with a
//! missing or malformed key is rejected outright: no upgrade, no
//! registration.

use std::io::Read;
use std::net::TcpStream;
use std::time::Duration;

use base64::Engine;
use sha1::{Digest, Sha1};
use thiserror::Error;

/// WebSocket GUID from RFC 6455. A magic constant that never changes.
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Upper bound on the upgrade request's header block.
const MAX_REQUEST_LEN: usize = 8 * 1024;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("missing Sec-WebSocket-Key header")]
    MissingKey,
    #[error("malformed Sec-WebSocket-Key header")]
    MalformedKey,
    #[error("upgrade request exceeds {MAX_REQUEST_LEN} bytes")]
    RequestTooLarge,
    #[error("io error during handshake: {0}")]
    Io(#[from] std::io::Error),
}

/// Read the upgrade request's header block (through the `\r\n\r\n`
/// terminator) off a fresh TCP stream. Any bytes that arrived after the
/// terminator are returned as surplus so the frame reader can pick them
/// up; a client that pipelines its first frame behind the request must
/// not lose it.
pub fn read_request(stream: &mut TcpStream) -> Result<(String, Vec<u8>), HandshakeError> {
    stream.set_read_timeout(Some(REQUEST_TIMEOUT))?;

    let mut request = Vec::new();
    let mut chunk = [0u8; 1024];
    let mut surplus = Vec::new();
    loop {
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        request.extend_from_slice(&chunk[..n]);
        if let Some(pos) = request.windows(4).position(|w| w == b"\r\n\r\n") {
            surplus = request.split_off(pos + 4);
            break;
        }
        if request.len() > MAX_REQUEST_LEN {
            return Err(HandshakeError::RequestTooLarge);
        }
    }

    stream.set_read_timeout(None)?;
    Ok((String::from_utf8_lossy(&request).into_owned(), surplus))
}

/// Extract the `Sec-WebSocket-Key` value from a raw request, case
/// insensitively. A well-formed key is the base64 encoding of 16 random
/// bytes; anything else is rejected.
pub fn extract_key(request: &str) -> Result<&str, HandshakeError> {
    let key = request
        .lines()
        .find(|line| line.to_lowercase().starts_with("sec-websocket-key:"))
        .and_then(|line| line.split_once(':'))
        .map(|(_, value)| value.trim())
        .ok_or(HandshakeError::MissingKey)?;

    let decoded = base64::engine::general_purpose::STANDARD
        .decode(key)
        .map_err(|_| HandshakeError::MalformedKey)?;
    if decoded.len() != 16 {
        return Err(HandshakeError::MalformedKey);
    }
    Ok(key)
}

/// Accept token: base64(sha1(key + GUID)).
pub fn accept_token(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Build the raw 101 response for an upgrade request, or refuse it.
pub fn upgrade_response(request: &str) -> Result<Vec<u8>, HandshakeError> {
    let key = extract_key(request)?;
    let accept = accept_token(key);
    let response = format!(
        "HTTP/1.1 101 Web Socket Protocol Handshake\r\n\
         Upgrade: WebSocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept
    );
    Ok(response.into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_REQUEST: &str = "GET /chat HTTP/1.1\r\n\
        Host: example.com\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Version: 13\r\n\r\n";

    #[test]
    fn rfc6455_accept_vector() {
        // The canonical test vector from RFC 6455 section 1.3.
        assert_eq!(
            accept_token("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn upgrade_response_carries_accept_header() {
        let response = upgrade_response(SAMPLE_REQUEST).expect("valid request");
        let text = String::from_utf8(response).unwrap();
        assert!(text.starts_with("HTTP/1.1 101 "));
        assert!(text.contains("Upgrade: WebSocket\r\n"));
        assert!(text.contains("Connection: Upgrade\r\n"));
        assert!(text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn key_header_is_case_insensitive() {
        let request = SAMPLE_REQUEST.replace("Sec-WebSocket-Key", "SEC-WEBSOCKET-KEY");
        assert_eq!(extract_key(&request).unwrap(), "dGhlIHNhbXBsZSBub25jZQ==");
    }

    #[test]
    fn missing_key_is_rejected() {
        let request = "GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
        assert!(matches!(
            upgrade_response(request),
            Err(HandshakeError::MissingKey)
        ));
    }

    #[test]
    fn malformed_key_is_rejected() {
        for bad in ["not base64!!!", "c2hvcnQ="] {
            let request = format!("GET / HTTP/1.1\r\nSec-WebSocket-Key: {}\r\n\r\n", bad);
            assert!(matches!(
                upgrade_response(&request),
                Err(HandshakeError::MalformedKey)
            ));
        }
    }
}
