use crate::config::VirtualHost;
use crate::error::Error;
use crate::http::request::{BodyDecoder, BodyFraming, Request, Version};
use crate::http::response::{Framing, Response};
use crate::policy::{self, Verdict};
use crate::router::{self, RouteMatch};
use crate::server::gateway::CgiExchange;
use mio::net::TcpStream;
use mio::Token;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::time::Instant;

/// Written ahead of the body when a client asks `Expect: 100-continue`.
const CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// Written bytes are compacted out of the buffer past this offset.
const COMPACT_AFTER: usize = 64 * 1024;

#[derive(Debug)]
pub enum ConnectionState {
    ReadHead,
    ReadBody {
        request: Box<Request>,
        route: RouteMatch,
        decoder: BodyDecoder,
    },
    /// A script is producing the response.
    Cgi,
    /// The whole response is queued; waiting for it to drain.
    WriteResponse,
    /// Write side shut down; unread request bytes are discarded until the
    /// peer closes or the deadline passes.
    Lingering { until: Instant },
}

/// What the server should do after feeding buffered input to the state
/// machine.
#[derive(Debug)]
pub enum Step {
    Wait,
    Respond(Response),
    Fail {
        error: Error,
        host: usize,
        location: Option<usize>,
    },
    Dispatch(Box<Request>, RouteMatch),
}

pub struct Connection {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    pub local: SocketAddr,
    /// Listener the connection was accepted on.
    pub listener: Token,

    pub state: ConnectionState,
    pub read_buffer: Vec<u8>,
    pub write_buffer: Vec<u8>,
    pub bytes_written: usize,
    pub last_activity: Instant,

    pub version: Version,
    pub keep_alive: bool,
    /// Request bytes were left unread; close gently after the response.
    pub discard_input: bool,
    pub peer_closed: bool,
    pub writable_interest: bool,

    /// `METHOD target` of the request being answered, for the access log.
    pub current: Option<String>,
    pub status: u16,
    pub cgi: Option<CgiExchange>,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr, local: SocketAddr, listener: Token) -> Self {
        Self {
            stream,
            peer,
            local,
            listener,
            state: ConnectionState::ReadHead,
            read_buffer: Vec::with_capacity(8192),
            write_buffer: Vec::new(),
            bytes_written: 0,
            last_activity: Instant::now(),
            version: Version::Http11,
            keep_alive: true,
            discard_input: false,
            peer_closed: false,
            writable_interest: false,
            current: None,
            status: 0,
            cgi: None,
        }
    }

    /// Bytes queued but not yet accepted by the socket.
    pub fn pending_write(&self) -> usize {
        self.write_buffer.len() - self.bytes_written
    }

    /// Still working on a response; new input only gets buffered.
    pub fn is_busy(&self) -> bool {
        matches!(self.state, ConnectionState::Cgi | ConnectionState::WriteResponse)
    }

    pub fn is_lingering(&self) -> bool {
        matches!(self.state, ConnectionState::Lingering { .. })
    }

    /// Drives the request state machine over buffered input.
    ///
    /// `hosts` is the whole virtual-host table and `candidates` the hosts
    /// sharing this connection's listener.
    pub fn step(&mut self, hosts: &[VirtualHost], candidates: &[usize]) -> Step {
        let default_host = candidates.first().copied().unwrap_or(0);
        loop {
            match std::mem::replace(&mut self.state, ConnectionState::ReadHead) {
                ConnectionState::ReadHead => {
                    let (request, head_len) = match Request::parse_head(&self.read_buffer) {
                        Ok(Some(parsed)) => parsed,
                        Ok(None) => return Step::Wait,
                        Err(error) => {
                            self.read_buffer.clear();
                            return self.reject(error, default_host, None, true);
                        }
                    };
                    self.read_buffer.drain(..head_len);
                    self.begin(&request);

                    let body_pending = !matches!(request.body_framing(), Ok(BodyFraming::Length(0)));
                    let host = router::select_host(hosts, candidates, request.host());
                    let location = match hosts
                        .get(host)
                        .ok_or(Error::NotFound)
                        .and_then(|h| router::match_location(h, &request.path))
                    {
                        Ok(l) => l,
                        Err(error) => return self.reject(error, host, None, body_pending),
                    };

                    match policy::check(&hosts[host].locations[location], &request) {
                        Err(error) => return self.reject(error, host, Some(location), body_pending),
                        Ok(Verdict::Respond(response)) => {
                            if body_pending {
                                self.keep_alive = false;
                                self.discard_input = true;
                            }
                            return Step::Respond(response);
                        }
                        Ok(Verdict::Proceed(framing)) => {
                            if body_pending
                                && self.read_buffer.is_empty()
                                && request.headers.has_token("expect", "100-continue")
                            {
                                self.write_buffer.extend_from_slice(CONTINUE);
                            }
                            self.state = ConnectionState::ReadBody {
                                request: Box::new(request),
                                route: RouteMatch { host, location },
                                decoder: BodyDecoder::new(framing),
                            };
                        }
                    }
                }
                ConnectionState::ReadBody {
                    mut request,
                    route,
                    mut decoder,
                } => {
                    let limit = hosts[route.host].locations[route.location].client_max_body_size;
                    match decoder.decode(&self.read_buffer, &mut request.body, limit) {
                        Ok(used) => {
                            self.read_buffer.drain(..used);
                        }
                        Err(error) => {
                            return self.reject(error, route.host, Some(route.location), true);
                        }
                    }
                    if decoder.is_done() {
                        return Step::Dispatch(request, route);
                    }
                    self.state = ConnectionState::ReadBody {
                        request,
                        route,
                        decoder,
                    };
                    return Step::Wait;
                }
                other => {
                    self.state = other;
                    return Step::Wait;
                }
            }
        }
    }

    fn begin(&mut self, request: &Request) {
        self.version = request.version;
        self.keep_alive = request.wants_keep_alive();
        self.current = Some(format!("{} {}", request.method, request.target));
    }

    /// Fails the request. When body bytes were left unread the connection
    /// cannot be reused.
    fn reject(&mut self, error: Error, host: usize, location: Option<usize>, body_pending: bool) -> Step {
        if body_pending {
            self.keep_alive = false;
            self.discard_input = true;
        }
        Step::Fail {
            error,
            host,
            location,
        }
    }

    /// Serializes a complete response into the write buffer.
    pub fn queue_response(&mut self, response: &Response) {
        let framing = response.serialize(self.version, self.keep_alive, &mut self.write_buffer);
        if framing == Framing::Close {
            self.keep_alive = false;
        }
        self.status = response.status;
        self.state = ConnectionState::WriteResponse;
    }

    /// Writes queued bytes until the socket would block.
    pub fn write_pending(&mut self) -> io::Result<()> {
        while self.bytes_written < self.write_buffer.len() {
            match self.stream.write(&self.write_buffer[self.bytes_written..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.bytes_written += n;
                    self.last_activity = Instant::now();
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        if self.bytes_written == self.write_buffer.len() {
            self.write_buffer.clear();
            self.bytes_written = 0;
        } else if self.bytes_written > COMPACT_AFTER {
            self.write_buffer.drain(..self.bytes_written);
            self.bytes_written = 0;
        }
        Ok(())
    }

    /// Prepares for the next request on a kept-alive connection. Pipelined
    /// bytes already in the read buffer stay there.
    pub fn reset(&mut self) {
        self.state = ConnectionState::ReadHead;
        self.version = Version::Http11;
        self.keep_alive = true;
        self.current = None;
        self.status = 0;
        self.last_activity = Instant::now();
    }
}
