//! Connection intake: read the first request head and classify the socket.
//!
//! The upgrade tunnel needs the caller's socket before any HTTP engine has
//! answered on it, so the head is sniffed here with `httparse`. Whatever was
//! read is handed on: to the tunnel as a parsed [`RequestHead`] plus the
//! bytes past it, or back to hyper as a prefix to replay.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Heads larger than this are left for hyper to reject.
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

const MAX_HEADERS: usize = 100;
const READ_CHUNK: usize = 4 * 1024;

/// A parsed request line and its raw header pairs.
///
/// Header names keep their original case; values are the exact bytes after
/// the colon with surrounding whitespace removed. Order and duplicates are
/// preserved.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, Bytes)>,
}

impl RequestHead {
    /// First value for `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_ref())
    }

    /// `Upgrade` is present and some `Connection` header lists the `upgrade`
    /// token.
    pub fn is_upgrade(&self) -> bool {
        self.header("upgrade").is_some()
            && self.headers.iter()
                .filter(|(k, _)| k.eq_ignore_ascii_case("connection"))
                .any(|(_, v)| has_upgrade_token(v))
    }

    fn from_parsed(req: &httparse::Request<'_, '_>) -> Self {
        Self {
            method: req.method.unwrap_or_default().to_owned(),
            path: req.path.unwrap_or_default().to_owned(),
            headers: req.headers.iter()
                .map(|h| (h.name.to_owned(), Bytes::copy_from_slice(h.value)))
                .collect(),
        }
    }
}

/// Shared with the forwarder, which sees the same question through
/// `http::HeaderMap`.
pub(crate) fn has_upgrade_token(value: &[u8]) -> bool {
    value.split(|b| *b == b',')
        .any(|token| token.trim_ascii().eq_ignore_ascii_case(b"upgrade"))
}

/// How a fresh connection is handled.
#[derive(Debug)]
pub enum Intake {
    /// The first request asks for a protocol switch. `buffered` holds the
    /// bytes already read past the end of the head.
    Upgrade { head: RequestHead, buffered: Bytes },
    /// Ordinary HTTP, or something only hyper can judge (HTTP/2 preface,
    /// malformed or oversized head). `buffered` is everything read so far.
    Http { buffered: Bytes },
    /// The peer closed before sending a byte.
    Closed,
}

/// Reads from `io` until the first request head is complete, then
/// classifies it.
pub async fn read<R>(io: &mut R) -> std::io::Result<Intake>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(READ_CHUNK);

    loop {
        buf.reserve(READ_CHUNK);
        if io.read_buf(&mut buf).await? == 0 {
            return Ok(if buf.is_empty() {
                Intake::Closed
            } else {
                Intake::Http { buffered: buf.freeze() }
            });
        }

        match parse(&buf) {
            Ok(Some((head, len))) => {
                if !head.is_upgrade() {
                    return Ok(Intake::Http { buffered: buf.freeze() });
                }
                let buffered = buf.split_off(len).freeze();
                return Ok(Intake::Upgrade { head, buffered });
            }
            Ok(None) if buf.len() < MAX_HEAD_SIZE => continue,
            Ok(None) | Err(_) => {
                return Ok(Intake::Http { buffered: buf.freeze() });
            }
        }
    }
}

/// Parses a complete head out of `buf`, or `None` if more bytes are needed.
///
/// The header count is only bounded by [`MAX_HEAD_SIZE`]: a head with more
/// than [`MAX_HEADERS`] lines is parsed again with room for one header per
/// line read so far.
fn parse(buf: &[u8]) -> Result<Option<(RequestHead, usize)>, httparse::Error> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    match parse_into(buf, &mut headers) {
        Err(httparse::Error::TooManyHeaders) => {
            let lines = buf.iter().filter(|b| **b == b'\n').count();
            let mut headers = vec![httparse::EMPTY_HEADER; lines];
            parse_into(buf, &mut headers)
        }
        parsed => parsed,
    }
}

fn parse_into<'b>(
    buf: &'b [u8],
    headers: &mut [httparse::Header<'b>],
) -> Result<Option<(RequestHead, usize)>, httparse::Error> {
    let mut req = httparse::Request::new(headers);
    Ok(match req.parse(buf)? {
        httparse::Status::Complete(len) => Some((RequestHead::from_parsed(&req), len)),
        httparse::Status::Partial => None,
    })
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;

    async fn intake(chunks: &[&[u8]]) -> Intake {
        let (mut client, mut server) = tokio::io::duplex(MAX_HEAD_SIZE * 2);
        for chunk in chunks {
            client.write_all(chunk).await.unwrap();
        }
        drop(client);
        read(&mut server).await.unwrap()
    }

    #[tokio::test]
    async fn upgrade_request_is_split_at_head() {
        let raw = b"GET /ws?room=1 HTTP/1.1\r\nHost: a\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\nearly";
        match intake(&[raw]).await {
            Intake::Upgrade { head, buffered } => {
                assert_eq!(head.method, "GET");
                assert_eq!(head.path, "/ws?room=1");
                assert_eq!(head.headers.len(), 3);
                assert_eq!(head.headers[1].0, "Upgrade");
                assert_eq!(&buffered[..], b"early");
            }
            other => panic!("expected upgrade, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn head_arriving_in_pieces() {
        match intake(&[b"GET / HTTP/1.1\r\nUpgr", b"ade: websocket\r\nConnection: keep-alive, upgrade\r\n", b"\r\n"]).await {
            Intake::Upgrade { head, buffered } => {
                assert!(head.is_upgrade());
                assert!(buffered.is_empty());
            }
            other => panic!("expected upgrade, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn normal_request_keeps_every_byte() {
        let raw = b"POST /x HTTP/1.1\r\nContent-Length: 3\r\n\r\nabc";
        match intake(&[raw]).await {
            Intake::Http { buffered } => assert_eq!(&buffered[..], &raw[..]),
            other => panic!("expected http, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn upgrade_header_without_connection_token_is_http() {
        let raw = b"GET / HTTP/1.1\r\nUpgrade: websocket\r\nConnection: keep-alive\r\n\r\n";
        assert!(matches!(intake(&[raw]).await, Intake::Http { .. }));
    }

    #[tokio::test]
    async fn http2_preface_is_left_to_hyper() {
        let raw = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";
        assert!(matches!(intake(&[raw]).await, Intake::Http { .. }));
    }

    #[tokio::test]
    async fn partial_head_then_eof() {
        match intake(&[b"GET / HT"]).await {
            Intake::Http { buffered } => assert_eq!(&buffered[..], b"GET / HT"),
            other => panic!("expected http, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn upgrade_with_many_headers_is_still_an_upgrade() {
        let mut raw = b"GET /ws HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n".to_vec();
        for i in 0..MAX_HEADERS + 10 {
            raw.extend_from_slice(format!("X-H{i}: {i}\r\n").as_bytes());
        }
        raw.extend_from_slice(b"\r\nearly");

        match intake(&[&raw]).await {
            Intake::Upgrade { head, buffered } => {
                assert_eq!(head.headers.len(), MAX_HEADERS + 12);
                assert_eq!(head.headers.last().unwrap().0, format!("X-H{}", MAX_HEADERS + 9));
                assert_eq!(&buffered[..], b"early");
            }
            other => panic!("expected upgrade, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn silent_close() {
        assert!(matches!(intake(&[]).await, Intake::Closed));
    }

    #[test]
    fn duplicate_headers_and_case_survive() {
        let mut headers = [httparse::EMPTY_HEADER; 8];
        let mut req = httparse::Request::new(&mut headers);
        req.parse(b"GET / HTTP/1.1\r\nX-Tag: a\r\nx-tag: b\r\n\r\n").unwrap();
        let head = RequestHead::from_parsed(&req);
        assert_eq!(head.headers, vec![
            ("X-Tag".to_owned(), Bytes::from_static(b"a")),
            ("x-tag".to_owned(), Bytes::from_static(b"b")),
        ]);
        assert_eq!(head.header("X-TAG"), Some(&b"a"[..]));
    }

    #[test]
    fn upgrade_token_matching() {
        assert!(has_upgrade_token(b"Upgrade"));
        assert!(has_upgrade_token(b"keep-alive, UPGRADE"));
        assert!(!has_upgrade_token(b"keep-alive"));
        assert!(!has_upgrade_token(b"upgrades"));
    }
}
