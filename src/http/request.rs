use crate::error::{Error, Result};
use crate::http::headers::Headers;
use crate::http::method::Method;
use crate::http::uri;

/// Largest request head (request line plus headers) we are willing to buffer.
pub const MAX_HEAD_SIZE: usize = 16 * 1024;
const MAX_HEADERS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    pub fn as_str(self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }
}

#[derive(Debug)]
pub struct Request {
    pub method: Method,
    /// The request target exactly as sent.
    pub target: String,
    /// Decoded, dot-resolved path used for routing.
    pub path: String,
    pub query: String,
    pub version: Version,
    pub headers: Headers,
    pub body: Vec<u8>,
}

/// How the request body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    Length(u64),
    Chunked,
}

impl Request {
    /// Parses a request head from the front of `buf`.
    ///
    /// Returns `Ok(None)` while the head is incomplete, otherwise the request
    /// (with an empty body) and the number of bytes the head occupied.
    pub fn parse_head(buf: &[u8]) -> Result<Option<(Request, usize)>> {
        let mut raw_headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut raw = httparse::Request::new(&mut raw_headers);

        let head_len = match raw.parse(buf)? {
            httparse::Status::Complete(len) => len,
            httparse::Status::Partial => {
                if buf.len() > MAX_HEAD_SIZE {
                    return Err(Error::BadRequest("request head too large"));
                }
                return Ok(None);
            }
        };
        if head_len > MAX_HEAD_SIZE {
            return Err(Error::BadRequest("request head too large"));
        }

        let method = Method::parse(raw.method.unwrap_or_default());
        let target = raw.path.unwrap_or("/").to_string();
        let version = match raw.version {
            Some(0) => Version::Http10,
            _ => Version::Http11,
        };

        let mut headers = Headers::new();
        for h in raw.headers.iter() {
            let value = std::str::from_utf8(h.value)
                .map_err(|_| Error::BadRequest("header value is not UTF-8"))?;
            headers.insert(h.name, value);
        }

        if version == Version::Http11 && !headers.contains("host") {
            return Err(Error::BadRequest("missing Host header"));
        }

        let (raw_path, query) = uri::split_target(&target);
        let path = uri::canonicalize(raw_path)?;
        let query = query.to_string();

        Ok(Some((
            Request {
                method,
                target,
                path,
                query,
                version,
                headers,
                body: Vec::new(),
            },
            head_len,
        )))
    }

    pub fn body_framing(&self) -> Result<BodyFraming> {
        if let Some(te) = self.headers.get("transfer-encoding") {
            let last = te.rsplit(',').next().unwrap_or("").trim();
            if last.eq_ignore_ascii_case("chunked") {
                return Ok(BodyFraming::Chunked);
            }
            return Err(Error::BadRequest("unsupported transfer-encoding"));
        }

        match self.headers.get("content-length") {
            Some(v) => v
                .trim()
                .parse::<u64>()
                .map(BodyFraming::Length)
                .map_err(|_| Error::BadRequest("invalid Content-Length")),
            None if self.method.expects_body() => {
                Err(Error::BadRequest("body length not declared"))
            }
            None => Ok(BodyFraming::Length(0)),
        }
    }

    pub fn wants_keep_alive(&self) -> bool {
        match self.version {
            Version::Http11 => !self.headers.has_token("connection", "close"),
            Version::Http10 => self.headers.has_token("connection", "keep-alive"),
        }
    }

    /// The Host header without its port.
    pub fn host(&self) -> Option<&str> {
        let host = self.headers.get("host")?;
        // Bracketed IPv6 literals keep their colons.
        if host.starts_with('[') {
            return host.split_once(']').map(|(h, _)| &h[1..]);
        }
        Some(host.rsplit_once(':').map_or(host, |(h, _)| h))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    Size,
    Data { remaining: u64 },
    DataEnd,
    Trailer,
    Done,
}

/// Incremental request-body decoder that enforces the body ceiling while it
/// consumes input, so nothing past the limit is ever buffered.
#[derive(Debug)]
pub enum BodyDecoder {
    Length { remaining: u64 },
    Chunked(ChunkState),
}

impl BodyDecoder {
    pub fn new(framing: BodyFraming) -> Self {
        match framing {
            BodyFraming::Length(n) => BodyDecoder::Length { remaining: n },
            BodyFraming::Chunked => BodyDecoder::Chunked(ChunkState::Size),
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(
            self,
            BodyDecoder::Length { remaining: 0 } | BodyDecoder::Chunked(ChunkState::Done)
        )
    }

    /// Moves body bytes from `input` into `body` and returns how many input
    /// bytes were consumed. Fails with `PayloadTooLarge` as soon as the body
    /// would exceed `limit`.
    pub fn decode(&mut self, input: &[u8], body: &mut Vec<u8>, limit: usize) -> Result<usize> {
        match self {
            BodyDecoder::Length { remaining } => {
                let take = (*remaining).min(input.len() as u64) as usize;
                if body.len() + take > limit {
                    return Err(Error::PayloadTooLarge);
                }
                body.extend_from_slice(&input[..take]);
                *remaining -= take as u64;
                Ok(take)
            }
            BodyDecoder::Chunked(state) => decode_chunked(state, input, body, limit),
        }
    }
}

fn decode_chunked(
    state: &mut ChunkState,
    input: &[u8],
    body: &mut Vec<u8>,
    limit: usize,
) -> Result<usize> {
    let mut pos = 0;
    loop {
        let rest = &input[pos..];
        match *state {
            ChunkState::Size => match httparse::parse_chunk_size(rest) {
                Ok(httparse::Status::Complete((used, size))) => {
                    pos += used;
                    if size == 0 {
                        *state = ChunkState::Trailer;
                    } else {
                        let room = limit.saturating_sub(body.len()) as u64;
                        if size > room {
                            return Err(Error::PayloadTooLarge);
                        }
                        *state = ChunkState::Data { remaining: size };
                    }
                }
                Ok(httparse::Status::Partial) => return Ok(pos),
                Err(_) => return Err(Error::BadRequest("invalid chunk size")),
            },
            ChunkState::Data { remaining } => {
                if rest.is_empty() {
                    return Ok(pos);
                }
                let take = remaining.min(rest.len() as u64) as usize;
                if body.len() + take > limit {
                    return Err(Error::PayloadTooLarge);
                }
                body.extend_from_slice(&rest[..take]);
                pos += take;
                *state = match remaining - take as u64 {
                    0 => ChunkState::DataEnd,
                    left => ChunkState::Data { remaining: left },
                };
            }
            ChunkState::DataEnd => match rest {
                [] | [b'\r'] => return Ok(pos),
                [b'\n', ..] => {
                    pos += 1;
                    *state = ChunkState::Size;
                }
                [b'\r', b'\n', ..] => {
                    pos += 2;
                    *state = ChunkState::Size;
                }
                _ => return Err(Error::BadRequest("chunk not terminated by CRLF")),
            },
            ChunkState::Trailer => {
                let Some(nl) = rest.iter().position(|&b| b == b'\n') else {
                    return Ok(pos);
                };
                let line = &rest[..nl];
                pos += nl + 1;
                if line.is_empty() || line == b"\r" {
                    *state = ChunkState::Done;
                }
            }
            ChunkState::Done => return Ok(pos),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(raw: &str) -> Request {
        Request::parse_head(raw.as_bytes()).unwrap().unwrap().0
    }

    #[test]
    fn parses_request_line_and_headers() {
        let raw = "GET /a/./b/../c?x=1 HTTP/1.1\r\nHost: Example.com:8000\r\nX-Thing: 1\r\n\r\nrest";
        let (req, len) = Request::parse_head(raw.as_bytes()).unwrap().unwrap();
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.target, "/a/./b/../c?x=1");
        assert_eq!(req.path, "/a/c");
        assert_eq!(req.query, "x=1");
        assert_eq!(req.version, Version::Http11);
        assert_eq!(req.host(), Some("Example.com"));
        assert_eq!(&raw[len..], "rest");
    }

    #[test]
    fn bare_lf_line_endings_are_accepted() {
        let req = head("GET / HTTP/1.1\nHost: h\n\n");
        assert_eq!(req.path, "/");
    }

    #[test]
    fn partial_head_needs_more() {
        assert!(Request::parse_head(b"GET / HTTP/1.1\r\nHo").unwrap().is_none());
    }

    #[test]
    fn oversized_head_is_rejected() {
        let mut raw = b"GET / HTTP/1.1\r\nX: ".to_vec();
        raw.extend(std::iter::repeat_n(b'a', MAX_HEAD_SIZE + 1));
        assert!(matches!(Request::parse_head(&raw), Err(Error::BadRequest(_))));
    }

    #[test]
    fn http11_requires_host() {
        assert!(Request::parse_head(b"GET / HTTP/1.1\r\n\r\n").is_err());
        assert!(Request::parse_head(b"GET / HTTP/1.0\r\n\r\n").unwrap().is_some());
    }

    #[test]
    fn unknown_methods_survive_parsing() {
        let req = head("INVALID / HTTP/1.1\r\nHost: h\r\n\r\n");
        assert_eq!(req.method, Method::Other("INVALID".into()));
    }

    #[test]
    fn body_framing_rules() {
        let req = head("POST / HTTP/1.1\r\nHost: h\r\nContent-Length: 12\r\n\r\n");
        assert_eq!(req.body_framing().unwrap(), BodyFraming::Length(12));

        let req = head("POST / HTTP/1.1\r\nHost: h\r\nTransfer-Encoding: chunked\r\nContent-Length: 3\r\n\r\n");
        assert_eq!(req.body_framing().unwrap(), BodyFraming::Chunked);

        let req = head("POST / HTTP/1.1\r\nHost: h\r\n\r\n");
        assert!(req.body_framing().is_err());

        let req = head("GET / HTTP/1.1\r\nHost: h\r\n\r\n");
        assert_eq!(req.body_framing().unwrap(), BodyFraming::Length(0));
    }

    #[test]
    fn keep_alive_defaults_follow_version() {
        assert!(head("GET / HTTP/1.1\r\nHost: h\r\n\r\n").wants_keep_alive());
        assert!(!head("GET / HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n").wants_keep_alive());
        assert!(!head("GET / HTTP/1.0\r\n\r\n").wants_keep_alive());
        assert!(head("GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n").wants_keep_alive());
    }

    #[test]
    fn length_body_stops_at_declared_size() {
        let mut decoder = BodyDecoder::new(BodyFraming::Length(5));
        let mut body = Vec::new();
        let used = decoder.decode(b"helloGET /", &mut body, 100).unwrap();
        assert_eq!(used, 5);
        assert_eq!(body, b"hello");
        assert!(decoder.is_done());
    }

    #[test]
    fn chunked_body_decodes_across_reads() {
        let wire = b"4\r\nWiki\r\n5;ext=1\r\npedia\r\n0\r\nTrailer: x\r\n\r\nNEXT";
        let mut decoder = BodyDecoder::new(BodyFraming::Chunked);
        let mut body = Vec::new();

        // Feed one byte at a time, the way a slow client would.
        let mut pending = Vec::new();
        for &b in &wire[..wire.len() - 4] {
            pending.push(b);
            let used = decoder.decode(&pending, &mut body, 100).unwrap();
            pending.drain(..used);
        }
        assert!(decoder.is_done());
        assert!(pending.is_empty());
        assert_eq!(body, b"Wikipedia");
    }

    #[test]
    fn chunked_body_over_limit_is_rejected_before_buffering() {
        let mut decoder = BodyDecoder::new(BodyFraming::Chunked);
        let mut body = Vec::new();
        let err = decoder.decode(b"400\r\n", &mut body, 1000).unwrap_err();
        assert!(matches!(err, Error::PayloadTooLarge));
        assert!(body.is_empty());
    }

    #[test]
    fn huge_chunk_size_after_data_is_rejected() {
        let mut decoder = BodyDecoder::new(BodyFraming::Chunked);
        let mut body = Vec::new();
        let err = decoder
            .decode(b"1\r\nA\r\nffffffffffffffff\r\n", &mut body, 1000)
            .unwrap_err();
        assert!(matches!(err, Error::PayloadTooLarge));
        assert_eq!(body, b"A");
    }

    #[test]
    fn chunks_summing_past_limit_are_rejected() {
        let mut decoder = BodyDecoder::new(BodyFraming::Chunked);
        let mut body = Vec::new();
        let used = decoder.decode(b"3\r\nabc\r\n", &mut body, 4).unwrap();
        assert_eq!(used, 8);
        let err = decoder.decode(b"2\r\nde\r\n", &mut body, 4).unwrap_err();
        assert!(matches!(err, Error::PayloadTooLarge));
        assert_eq!(body, b"abc");
    }

    #[test]
    fn length_body_exactly_at_limit_is_accepted() {
        let mut decoder = BodyDecoder::new(BodyFraming::Length(4));
        let mut body = Vec::new();
        decoder.decode(b"abcd", &mut body, 4).unwrap();
        assert!(decoder.is_done());
    }
}
