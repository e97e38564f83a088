//! HTTP/1.x message heads as seen by the proxy.
//!
//! Headers are kept as an ordered list instead of a map so that duplicates and
//! their original order survive the trip through the proxy.

use crate::error::ProxyError;
use bytes::{Bytes, BytesMut};
use http::Method;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Upper bound on header lines in a single request or response head.
pub const MAX_HEADERS: usize = 100;

const READ_CHUNK: usize = 4096;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, Vec<u8>)>);

impl Headers {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.0.push((name.into(), value.into()));
    }

    /// First value for `name`, compared case-insensitively.
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.get_all(name).next()
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn get_all<'a, 'n>(&'a self, name: &'n str) -> impl Iterator<Item = &'a [u8]> {
        self.0
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn write_to(&self, out: &mut Vec<u8>) {
        for (name, value) in &self.0 {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value);
            out.extend_from_slice(b"\r\n");
        }
    }

    fn from_parsed(headers: &[httparse::Header<'_>]) -> Self {
        Self(
            headers
                .iter()
                .map(|h| (h.name.to_string(), h.value.to_vec()))
                .collect(),
        )
    }
}

/// A parsed client request. The two supported methods carry no body.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    method: Method,
    target: String,
    minor_version: u8,
    headers: Headers,
    buffered: Bytes,
}

impl ProxyRequest {
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Request target exactly as sent: a URL or a `host:port` authority.
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn minor_version(&self) -> u8 {
        self.minor_version
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Bytes the client sent after the header terminator.
    pub fn buffered(&self) -> &Bytes {
        &self.buffered
    }

    /// Parses a head from `buf`, returning `None` while it is incomplete.
    pub fn parse(buf: &[u8]) -> Result<Option<(usize, Self)>, ProxyError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        let len = match req
            .parse(buf)
            .map_err(|e| ProxyError::BadRequest(format!("invalid request head: {}", e)))?
        {
            httparse::Status::Partial => return Ok(None),
            httparse::Status::Complete(len) => len,
        };

        let method_str = req
            .method
            .ok_or_else(|| ProxyError::BadRequest("missing method".to_string()))?;
        let method = Method::from_bytes(method_str.as_bytes())
            .map_err(|_| ProxyError::BadRequest(format!("invalid method: {}", method_str)))?;
        let target = req
            .path
            .ok_or_else(|| ProxyError::BadRequest("missing request target".to_string()))?;

        Ok(Some((
            len,
            Self {
                method,
                target: target.to_string(),
                minor_version: req.version.unwrap_or(1),
                headers: Headers::from_parsed(req.headers),
                buffered: Bytes::new(),
            },
        )))
    }

    /// Reads a request head from `reader`.
    ///
    /// Returns `Ok(None)` when the peer closes before sending a single byte.
    pub async fn read_from<R>(reader: &mut R, max_size: usize) -> Result<Option<Self>, ProxyError>
    where
        R: AsyncRead + Unpin,
    {
        match read_head(reader, &[], max_size, Self::parse).await? {
            Some((mut request, rest)) => {
                request.buffered = rest;
                Ok(Some(request))
            }
            None => Ok(None),
        }
    }
}

/// How the body following a response head is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    Empty,
    Length(u64),
    Chunked,
    UntilClose,
}

/// Head of an upstream response, relayed to the client as received.
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub minor_version: u8,
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
}

impl ProxyResponse {
    pub fn parse(buf: &[u8]) -> Result<Option<(usize, Self)>, ProxyError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut res = httparse::Response::new(&mut headers);
        let len = match res.parse(buf).map_err(|e| {
            ProxyError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid upstream response head: {}", e),
            ))
        })? {
            httparse::Status::Partial => return Ok(None),
            httparse::Status::Complete(len) => len,
        };

        Ok(Some((
            len,
            Self {
                minor_version: res.version.unwrap_or(1),
                status: res.code.unwrap_or(502),
                reason: res.reason.unwrap_or("").to_string(),
                headers: Headers::from_parsed(res.headers),
            },
        )))
    }

    /// Reads a response head; the second element holds body bytes that
    /// arrived together with it.
    pub async fn read_from<R>(reader: &mut R, max_size: usize) -> Result<(Self, Bytes), ProxyError>
    where
        R: AsyncRead + Unpin,
    {
        Self::read_continuing(reader, &[], max_size).await
    }

    /// Like [`ProxyResponse::read_from`], starting from bytes already taken
    /// off `reader`, such as what followed an interim head.
    pub async fn read_continuing<R>(
        reader: &mut R,
        buffered: &[u8],
        max_size: usize,
    ) -> Result<(Self, Bytes), ProxyError>
    where
        R: AsyncRead + Unpin,
    {
        read_head(reader, buffered, max_size, Self::parse).await?.ok_or_else(|| {
            ProxyError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "upstream closed before sending a response",
            ))
        })
    }

    pub fn head_bytes(&self) -> Vec<u8> {
        let mut out = format!(
            "HTTP/1.{} {} {}\r\n",
            self.minor_version, self.status, self.reason
        )
        .into_bytes();
        self.headers.write_to(&mut out);
        out.extend_from_slice(b"\r\n");
        out
    }

    /// `1xx` heads other than `101` are followed by another response head.
    pub fn is_interim(&self) -> bool {
        (100..200).contains(&self.status) && self.status != 101
    }

    pub fn body_framing(&self) -> BodyFraming {
        if (100..200).contains(&self.status) || self.status == 204 || self.status == 304 {
            return BodyFraming::Empty;
        }
        let chunked = self
            .headers
            .get_all("transfer-encoding")
            .filter_map(|v| std::str::from_utf8(v).ok())
            .flat_map(|v| v.split(','))
            .last()
            .is_some_and(|coding| coding.trim().eq_ignore_ascii_case("chunked"));
        if chunked {
            return BodyFraming::Chunked;
        }
        match self
            .headers
            .get_str("content-length")
            .and_then(|v| v.trim().parse::<u64>().ok())
        {
            Some(0) => BodyFraming::Empty,
            Some(len) => BodyFraming::Length(len),
            None => BodyFraming::UntilClose,
        }
    }
}

async fn read_head<R, T, F>(
    reader: &mut R,
    buffered: &[u8],
    max_size: usize,
    parse: F,
) -> Result<Option<(T, Bytes)>, ProxyError>
where
    R: AsyncRead + Unpin,
    F: Fn(&[u8]) -> Result<Option<(usize, T)>, ProxyError>,
{
    let mut buf = BytesMut::with_capacity(READ_CHUNK.max(buffered.len()));
    buf.extend_from_slice(buffered);
    loop {
        if let Some((len, head)) = parse(&buf[..])? {
            let rest = buf.split_off(len);
            return Ok(Some((head, rest.freeze())));
        }
        if buf.len() >= max_size {
            return Err(ProxyError::HeaderTooLarge(max_size));
        }

        buf.reserve(READ_CHUNK);
        let n = reader.read_buf(&mut buf).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(ProxyError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed inside the header section",
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_connect_request() {
        let raw = b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n";
        let (len, req) = ProxyRequest::parse(raw).unwrap().unwrap();
        assert_eq!(len, raw.len());
        assert_eq!(req.method(), Method::CONNECT);
        assert_eq!(req.target(), "example.com:443");
        assert_eq!(req.minor_version(), 1);
        assert_eq!(req.headers().get_str("host"), Some("example.com:443"));
    }

    #[test]
    fn test_partial_head_is_incomplete() {
        let raw = b"GET http://example.com/ HTTP/1.1\r\nHost: exa";
        assert!(ProxyRequest::parse(raw).unwrap().is_none());
    }

    #[test]
    fn test_garbage_is_bad_request() {
        let err = ProxyRequest::parse(b"\x00\x01\x02 nonsense\r\n\r\n").unwrap_err();
        assert!(matches!(err, ProxyError::BadRequest(_)));
    }

    #[test]
    fn test_duplicate_headers_keep_order() {
        let raw = b"GET http://a/ HTTP/1.1\r\nX-Tag: one\r\nAccept: */*\r\nx-tag: two\r\n\r\n";
        let (_, req) = ProxyRequest::parse(raw).unwrap().unwrap();
        let tags: Vec<&[u8]> = req.headers().get_all("X-TAG").collect();
        assert_eq!(tags, vec![b"one".as_slice(), b"two".as_slice()]);
        let names: Vec<&str> = req.headers().iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["X-Tag", "Accept", "x-tag"]);
    }

    #[tokio::test]
    async fn test_read_keeps_bytes_after_head() {
        let mut raw: &[u8] = b"CONNECT a:1 HTTP/1.1\r\n\r\n\x16\x03\x01hello";
        let req = ProxyRequest::read_from(&mut raw, 16 * 1024).await.unwrap().unwrap();
        assert_eq!(req.buffered().as_ref(), b"\x16\x03\x01hello");
    }

    #[tokio::test]
    async fn test_read_from_silent_peer() {
        let mut raw: &[u8] = b"";
        assert!(ProxyRequest::read_from(&mut raw, 1024).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_truncated_head_fails() {
        let mut raw: &[u8] = b"GET http://a/ HTTP/1.1\r\nHost";
        let err = ProxyRequest::read_from(&mut raw, 1024).await.unwrap_err();
        assert!(matches!(err, ProxyError::Io(_)));
    }

    #[tokio::test]
    async fn test_head_size_limit() {
        let long = format!("GET http://a/ HTTP/1.1\r\nX-Big: {}\r\n\r\n", "a".repeat(4096));
        let mut raw = long.as_bytes();
        let err = ProxyRequest::read_from(&mut raw, 512).await.unwrap_err();
        assert!(matches!(err, ProxyError::HeaderTooLarge(512)));
    }

    #[test]
    fn test_response_head_round_trip() {
        let raw = b"HTTP/1.1 203 Quite Alright\r\nSet-Cookie: a=1\r\nServer: x\r\nSet-Cookie: b=2\r\n\r\n";
        let (len, res) = ProxyResponse::parse(raw).unwrap().unwrap();
        assert_eq!(len, raw.len());
        assert_eq!(res.status, 203);
        assert_eq!(res.reason, "Quite Alright");
        assert_eq!(res.head_bytes(), raw.to_vec());
    }

    #[tokio::test]
    async fn test_read_continuing_uses_buffered_bytes_first() {
        let early = b"HTTP/1.1 103 Early Hints\r\nLink: </a.css>\r\n\r\nHTTP/1.1 200 OK\r\nContent-Len";
        let mut raw: &[u8] = early;
        let (interim, rest) = ProxyResponse::read_from(&mut raw, 1024).await.unwrap();
        assert!(interim.is_interim());

        let mut tail: &[u8] = b"gth: 2\r\n\r\nok";
        let (last, body) = ProxyResponse::read_continuing(&mut tail, &rest, 1024).await.unwrap();
        assert!(!last.is_interim());
        assert_eq!(last.status, 200);
        assert_eq!(last.body_framing(), BodyFraming::Length(2));
        assert_eq!(body.as_ref(), b"ok");
    }

    #[test]
    fn test_switching_protocols_is_final() {
        let (_, res) = ProxyResponse::parse(b"HTTP/1.1 101 Switching Protocols\r\n\r\n").unwrap().unwrap();
        assert!(!res.is_interim());
    }

    #[test]
    fn test_body_framing() {
        let parse = |raw: &[u8]| ProxyResponse::parse(raw).unwrap().unwrap().1.body_framing();
        assert_eq!(parse(b"HTTP/1.1 200 OK\r\nContent-Length: 12\r\n\r\n"), BodyFraming::Length(12));
        assert_eq!(
            parse(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: gzip, chunked\r\n\r\n"),
            BodyFraming::Chunked
        );
        assert_eq!(parse(b"HTTP/1.1 200 OK\r\n\r\n"), BodyFraming::UntilClose);
        assert_eq!(parse(b"HTTP/1.1 304 Not Modified\r\nContent-Length: 9\r\n\r\n"), BodyFraming::Empty);
        assert_eq!(parse(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n"), BodyFraming::Empty);
    }
}
