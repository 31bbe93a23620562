//! Streams a script's output into a client connection.
//!
//! The first bytes go through the header parser. Once the header block is
//! complete the response head is queued and every later read is framed and
//! appended to the connection's write buffer. Reading stops while too much
//! output is waiting for the client.

use crate::cgi::parser::{CgiHeaders, HeaderReader};
use crate::cgi::CgiProcess;
use crate::error::GatewayFailure;
use crate::http::request::Version;
use crate::http::response::{encode_chunk, Body, Framing, Response, LAST_CHUNK};
use crate::router::RouteMatch;
use crate::server::connection::Connection;
use log::{debug, warn};
use mio::Token;
use std::io;

/// Read size for script output.
const READ_CHUNK: usize = 16 * 1024;
/// Pending client output at which reading from the script pauses.
pub const HIGH_WATER: usize = 64 * 1024;
/// Output moved per pump before yielding to other connections.
const PUMP_BUDGET: usize = 1024 * 1024;

/// Result of one pump over the script's output pipe.
#[derive(Debug, PartialEq, Eq)]
pub enum Pump {
    /// The pipe is empty; readiness will bring us back.
    Waiting,
    /// The client is behind; resume once it drains.
    Paused,
    /// Budget used up with data still in the pipe.
    Yield,
    /// The response body is complete.
    Finished,
    /// Writing to the client failed.
    ClientGone,
}

#[derive(Debug)]
struct BodyState {
    framing: Framing,
    /// Bytes still owed under `Content-Length` framing.
    remaining: u64,
}

/// Per-connection CGI state: the process plus where its response stands.
pub struct CgiExchange {
    pub process: CgiProcess,
    pub output_token: Token,
    pub input_token: Option<Token>,
    pub paused: bool,
    /// Where error pages for a failed script come from.
    pub route: RouteMatch,
    headers: HeaderReader,
    body: Option<BodyState>,
    version: Version,
}

impl CgiExchange {
    pub fn new(
        process: CgiProcess,
        output_token: Token,
        input_token: Option<Token>,
        route: RouteMatch,
        version: Version,
    ) -> Self {
        Self {
            process,
            output_token,
            input_token,
            paused: false,
            route,
            headers: HeaderReader::new(),
            body: None,
            version,
        }
    }

    /// Whether the response head has been queued for the client.
    pub fn head_sent(&self) -> bool {
        self.body.is_some()
    }

    /// Feeds script output. Returns `true` when the body is complete.
    fn consume(
        &mut self,
        data: &[u8],
        out: &mut Vec<u8>,
        keep_alive: &mut bool,
        status: &mut u16,
    ) -> Result<bool, GatewayFailure> {
        if self.body.is_some() {
            return Ok(self.emit(data, out));
        }
        let Some((headers, rest)) = self.headers.push(data)? else {
            return Ok(false);
        };

        let response = head_response(&headers);
        let framing = response.framing(self.version);
        response.write_head(framing, *keep_alive, out);
        if framing == Framing::Close {
            *keep_alive = false;
        }
        *status = response.status;

        let remaining = match framing {
            Framing::Length(n) => n,
            _ => 0,
        };
        self.body = Some(BodyState { framing, remaining });
        if remaining == 0 && matches!(framing, Framing::Length(_)) {
            return Ok(true);
        }
        Ok(self.emit(&rest, out))
    }

    fn emit(&mut self, data: &[u8], out: &mut Vec<u8>) -> bool {
        let Some(body) = self.body.as_mut() else {
            return false;
        };
        match body.framing {
            Framing::Chunked => {
                encode_chunk(data, out);
                false
            }
            Framing::Length(_) => {
                let take = body.remaining.min(data.len() as u64) as usize;
                out.extend_from_slice(&data[..take]);
                body.remaining -= take as u64;
                if take < data.len() {
                    debug!("[CGI] dropping {} bytes past Content-Length", data.len() - take);
                }
                body.remaining == 0
            }
            Framing::Close => {
                out.extend_from_slice(data);
                false
            }
        }
    }

    /// Output EOF: terminates the body, or fails if no head was produced.
    fn finish(&mut self, out: &mut Vec<u8>, keep_alive: &mut bool) -> Result<(), GatewayFailure> {
        let Some(body) = &self.body else {
            if self.headers.is_empty() {
                return Err(GatewayFailure::NoOutput);
            }
            return Err(GatewayFailure::BadHeaders("output ended inside the header block"));
        };
        match body.framing {
            Framing::Chunked => out.extend_from_slice(LAST_CHUNK),
            Framing::Length(_) if body.remaining > 0 => {
                warn!(
                    "[CGI] script ended {} bytes short of its Content-Length",
                    body.remaining
                );
                *keep_alive = false;
            }
            Framing::Length(_) => {}
            Framing::Close => *keep_alive = false,
        }
        Ok(())
    }
}

fn head_response(headers: &CgiHeaders) -> Response {
    let mut response = Response::new(headers.status);
    response.reason = headers.reason.clone();
    response.headers = headers.headers.clone();
    // A chunked script body is raw bytes that we frame ourselves.
    response.body = Body::Stream {
        length: headers.content_length.filter(|_| !headers.chunked),
    };
    response
}

impl Connection {
    /// Moves script output into the write buffer, writing to the client
    /// whenever the buffer crosses the high-water mark.
    pub fn pump_cgi(&mut self) -> Result<Pump, GatewayFailure> {
        let mut buf = [0u8; READ_CHUNK];
        let mut moved = 0;

        loop {
            if self.pending_write() >= HIGH_WATER {
                if self.write_pending().is_err() {
                    return Ok(Pump::ClientGone);
                }
                if self.pending_write() >= HIGH_WATER {
                    if let Some(exchange) = self.cgi.as_mut() {
                        if !exchange.paused {
                            debug!("[CGI] pausing pid {}: client is behind", exchange.process.pid());
                            exchange.paused = true;
                        }
                        exchange.process.touch();
                    }
                    return Ok(Pump::Paused);
                }
            }

            let Connection {
                cgi,
                write_buffer,
                keep_alive,
                status,
                ..
            } = &mut *self;
            let Some(exchange) = cgi.as_mut() else {
                return Ok(Pump::Finished);
            };
            if exchange.paused {
                exchange.paused = false;
                exchange.process.touch();
            }

            match exchange.process.read_output(&mut buf) {
                Ok(0) => {
                    exchange.finish(write_buffer, keep_alive)?;
                    return Ok(Pump::Finished);
                }
                Ok(n) => {
                    exchange.process.touch();
                    if exchange.consume(&buf[..n], write_buffer, keep_alive, status)? {
                        return Ok(Pump::Finished);
                    }
                    moved += n;
                    if moved >= PUMP_BUDGET {
                        return Ok(match self.write_pending() {
                            Ok(()) => Pump::Yield,
                            Err(_) => Pump::ClientGone,
                        });
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(match self.write_pending() {
                        Ok(()) => Pump::Waiting,
                        Err(_) => Pump::ClientGone,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(GatewayFailure::Io(e)),
            }
        }
    }
}
