//! A deliberately small HTTP/1.1 client that shows exactly what went over
//! the wire: raw requests in, parsed replies out, with pipelining support.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

#[derive(Debug)]
pub struct Reply {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Reply {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

pub struct TestClient {
    pub stream: TcpStream,
    buf: Vec<u8>,
}

impl TestClient {
    pub fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).expect("connect");
        stream
            .set_read_timeout(Some(Duration::from_secs(15)))
            .expect("read timeout");
        Self {
            stream,
            buf: Vec::new(),
        }
    }

    pub fn send(&mut self, raw: impl AsRef<[u8]>) -> &mut Self {
        self.stream.write_all(raw.as_ref()).expect("write request");
        self
    }

    /// Reads one final response, skipping interim `1xx` ones.
    pub fn reply(&mut self) -> Reply {
        loop {
            let reply = self.read_one();
            if reply.status >= 200 {
                return reply;
            }
        }
    }

    /// Whether the server closed the connection (EOF with nothing buffered).
    pub fn is_closed(&mut self) -> bool {
        if !self.buf.is_empty() {
            return false;
        }
        let mut byte = [0u8; 1];
        matches!(self.stream.read(&mut byte), Ok(0) | Err(_))
    }

    fn fill(&mut self) -> usize {
        let mut chunk = [0u8; 16 * 1024];
        let n = self.stream.read(&mut chunk).expect("read response");
        self.buf.extend_from_slice(&chunk[..n]);
        n
    }

    fn read_one(&mut self) -> Reply {
        let (status, headers, head_len) = loop {
            let mut raw_headers = [httparse::EMPTY_HEADER; 64];
            let mut parsed = httparse::Response::new(&mut raw_headers);
            if let httparse::Status::Complete(len) = parsed.parse(&self.buf).expect("response head") {
                let headers = parsed
                    .headers
                    .iter()
                    .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()))
                    .collect::<Vec<_>>();
                break (parsed.code.unwrap_or(0), headers, len);
            }
            assert!(self.fill() > 0, "connection closed inside a response head");
        };
        self.buf.drain(..head_len);

        let mut reply = Reply {
            status,
            headers,
            body: Vec::new(),
        };
        if status < 200 || status == 204 || status == 304 {
            return reply;
        }

        let chunked = reply
            .header("transfer-encoding")
            .is_some_and(|v| v.eq_ignore_ascii_case("chunked"));
        let length = reply.header("content-length").map(|v| v.parse::<usize>().expect("length"));

        if chunked {
            reply.body = self.read_chunked();
        } else if let Some(n) = length {
            while self.buf.len() < n {
                assert!(self.fill() > 0, "connection closed inside a body");
            }
            reply.body = self.buf.drain(..n).collect();
        } else {
            while self.fill() > 0 {}
            reply.body = std::mem::take(&mut self.buf);
        }
        reply
    }

    fn read_chunked(&mut self) -> Vec<u8> {
        let mut body = Vec::new();
        loop {
            let (used, size) = loop {
                match httparse::parse_chunk_size(&self.buf).expect("chunk size") {
                    httparse::Status::Complete(found) => break found,
                    httparse::Status::Partial => {
                        assert!(self.fill() > 0, "connection closed inside chunked body");
                    }
                }
            };
            let size = size as usize;
            while self.buf.len() < used + size + 2 {
                assert!(self.fill() > 0, "connection closed inside a chunk");
            }
            if size == 0 {
                self.buf.drain(..used + 2);
                return body;
            }
            body.extend_from_slice(&self.buf[used..used + size]);
            assert_eq!(&self.buf[used + size..used + size + 2], b"\r\n");
            self.buf.drain(..used + size + 2);
        }
    }
}

/// Opens a connection, sends `raw`, and returns the reply.
pub fn roundtrip(addr: SocketAddr, raw: impl AsRef<[u8]>) -> Reply {
    TestClient::connect(addr).send(raw).reply()
}
