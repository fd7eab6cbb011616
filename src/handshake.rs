//! WebSocket upgrade handshake
//!
//! Parses one HTTP upgrade request off the accepted stream, validates it,
//! computes the `Sec-WebSocket-Accept` key, and builds the 101 response.
//! A single malformed request terminates the connection; there is no retry.

use base64::Engine;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};
use crate::WS_GUID;

/// Maximum HTTP header size (8KB should be enough for any reasonable request)
const MAX_HEADER_SIZE: usize = 8192;

/// The headers of an upgrade request that the server acts on
#[derive(Debug)]
pub struct UpgradeRequest {
    /// The Sec-WebSocket-Key header
    pub key: String,
    /// Requested subprotocol; empty when the header is absent
    pub subprotocol: String,
    /// The Sec-WebSocket-Version header
    pub version: String,
}

/// Parse a WebSocket upgrade request
///
/// Returns the parsed request and the number of bytes consumed, or `None`
/// when more data is needed.
pub fn parse_upgrade_request(buf: &[u8]) -> Result<Option<(UpgradeRequest, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut req = httparse::Request::new(&mut headers);

    match req.parse(buf) {
        Ok(httparse::Status::Complete(len)) => {
            let mut upgrade = None;
            let mut key = None;
            let mut subprotocol = None;
            let mut version = None;

            for header in req.headers.iter() {
                let value = std::str::from_utf8(header.value)
                    .map_err(|_| Error::Handshake("incorrect upgrade request"))?;

                if header.name.eq_ignore_ascii_case("upgrade") {
                    upgrade = Some(value);
                } else if header.name.eq_ignore_ascii_case("sec-websocket-key") {
                    key = Some(value);
                } else if header.name.eq_ignore_ascii_case("sec-websocket-protocol") {
                    subprotocol = Some(value);
                } else if header.name.eq_ignore_ascii_case("sec-websocket-version") {
                    version = Some(value);
                }
            }

            match upgrade {
                Some(value) if value.eq_ignore_ascii_case("websocket") => {}
                _ => return Err(Error::Handshake("upgrade header missing")),
            }

            let key = key.ok_or(Error::Handshake("incorrect upgrade request"))?;

            Ok(Some((
                UpgradeRequest {
                    key: key.to_string(),
                    subprotocol: subprotocol.unwrap_or("").to_string(),
                    version: version.unwrap_or("").to_string(),
                },
                len,
            )))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(_) => Err(Error::Handshake("incorrect upgrade request")),
    }
}

/// Generate the Sec-WebSocket-Accept key
///
/// This computes: Base64(SHA-1(key + GUID))
#[inline]
pub fn generate_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Build the 101 Switching Protocols response
///
/// The `Sec-WebSocket-Protocol` line is emitted only when the negotiated
/// subprotocol is non-empty.
pub fn build_response(accept_key: &str, subprotocol: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(256);

    buf.put_slice(b"HTTP/1.1 101 Switching Protocols\r\n");
    buf.put_slice(b"Upgrade: websocket\r\n");
    buf.put_slice(b"Connection: Upgrade\r\n");
    buf.put_slice(b"Sec-WebSocket-Version: 13\r\n");
    buf.put_slice(b"Sec-WebSocket-Accept: ");
    buf.put_slice(accept_key.as_bytes());

    if !subprotocol.is_empty() {
        buf.put_slice(b"\r\nSec-WebSocket-Protocol: ");
        buf.put_slice(subprotocol.as_bytes());
    }

    buf.put_slice(b"\r\n\r\n");
    buf.freeze()
}

/// Read exactly one upgrade request from the stream
///
/// Returns `None` when the stream ends before a request is available (an
/// idle close, not a protocol violation). Bytes past the request stay in
/// `buf` and seed the frame parser.
pub(crate) async fn read_upgrade_request<R>(
    reader: &mut R,
    buf: &mut BytesMut,
) -> Result<Option<UpgradeRequest>>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some((request, consumed)) = parse_upgrade_request(buf)? {
            buf.advance(consumed);
            return Ok(Some(request));
        }

        if buf.len() > MAX_HEADER_SIZE {
            return Err(Error::Handshake("incorrect upgrade request"));
        }

        let n = reader.read_buf(buf).await?;
        if n == 0 {
            return Ok(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_accept_key() {
        // Test vector from RFC 6455
        let key = "dGhlIHNhbXBsZSBub25jZQ==";
        let accept = generate_accept_key(key);
        assert_eq!(accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn test_parse_upgrade_request() {
        let request = b"GET /chat HTTP/1.1\r\n\
            Host: server.example.com\r\n\
            Upgrade: websocket\r\n\
            Connection: Upgrade\r\n\
            Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
            Sec-WebSocket-Protocol: chat\r\n\
            Sec-WebSocket-Version: 13\r\n\
            \r\n";

        let (req, len) = parse_upgrade_request(request).unwrap().unwrap();
        assert_eq!(req.key, "dGhlIHNhbXBsZSBub25jZQ==");
        assert_eq!(req.subprotocol, "chat");
        assert_eq!(req.version, "13");
        assert_eq!(len, request.len());
    }

    #[test]
    fn test_parse_without_subprotocol() {
        let request = b"GET / HTTP/1.1\r\n\
            Host: server.example.com\r\n\
            Upgrade: websocket\r\n\
            Connection: Upgrade\r\n\
            Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
            Sec-WebSocket-Version: 13\r\n\
            \r\n";

        let (req, _) = parse_upgrade_request(request).unwrap().unwrap();
        assert_eq!(req.subprotocol, "");
    }

    #[test]
    fn test_parse_partial() {
        let request = b"GET /chat HTTP/1.1\r\n\
            Host: server.example.com\r\n";

        assert!(parse_upgrade_request(request).unwrap().is_none());
    }

    #[test]
    fn test_missing_upgrade_header() {
        let request = b"GET /chat HTTP/1.1\r\n\
            Host: server.example.com\r\n\
            Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
            \r\n";

        assert!(matches!(
            parse_upgrade_request(request),
            Err(Error::Handshake("upgrade header missing"))
        ));
    }

    #[test]
    fn test_wrong_upgrade_header() {
        let request = b"GET /chat HTTP/1.1\r\n\
            Upgrade: h2c\r\n\
            Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
            \r\n";

        assert!(matches!(
            parse_upgrade_request(request),
            Err(Error::Handshake("upgrade header missing"))
        ));
    }

    #[test]
    fn test_malformed_request() {
        assert!(parse_upgrade_request(b"\x00\x01bogus\r\n\r\n").is_err());
    }

    #[test]
    fn test_build_response_without_subprotocol() {
        let response = build_response("s3pPLMBiTxaQ9kYGzzhZRbK+xOo=", "");

        assert_eq!(
            response.as_ref(),
            b"HTTP/1.1 101 Switching Protocols\r\n\
              Upgrade: websocket\r\n\
              Connection: Upgrade\r\n\
              Sec-WebSocket-Version: 13\r\n\
              Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\r\n" as &[u8]
        );
    }

    #[test]
    fn test_build_response_with_subprotocol() {
        let response = build_response("s3pPLMBiTxaQ9kYGzzhZRbK+xOo=", "chat");

        assert_eq!(
            response.as_ref(),
            b"HTTP/1.1 101 Switching Protocols\r\n\
              Upgrade: websocket\r\n\
              Connection: Upgrade\r\n\
              Sec-WebSocket-Version: 13\r\n\
              Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\
              Sec-WebSocket-Protocol: chat\r\n\r\n" as &[u8]
        );
    }

    #[tokio::test]
    async fn test_read_request_preserves_leftover() {
        let request = b"GET / HTTP/1.1\r\n\
            Upgrade: websocket\r\n\
            Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
            \r\n\x81\x01a";

        let mut reader = &request[..];
        let mut buf = BytesMut::new();
        let parsed = read_upgrade_request(&mut reader, &mut buf).await.unwrap();
        assert!(parsed.is_some());
        // frame bytes after the request stay buffered
        assert_eq!(buf.as_ref(), &[0x81, 0x01, b'a']);
    }

    #[tokio::test]
    async fn test_read_request_eof_is_idle() {
        let mut reader = &b""[..];
        let mut buf = BytesMut::new();
        let parsed = read_upgrade_request(&mut reader, &mut buf).await.unwrap();
        assert!(parsed.is_none());
    }
}
