//! The event loop.
//!
//! One `mio` poll drives every listener, client socket, and CGI pipe. Tokens
//! below [`LISTENER_TOKENS`] are listeners; connection and pipe tokens come
//! from a single counter above it, and each pipe token maps back to the
//! connection that owns the script.

pub mod connection;
pub mod gateway;

use crate::cgi::{CgiLaunch, CgiProcess};
use crate::config::Config;
use crate::error::{Error, GatewayFailure, Result};
use crate::handlers::{self, Context, Outcome};
use crate::http::request::Request;
use crate::http::response::Response;
use crate::policy;
use crate::router::RouteMatch;
use connection::{Connection, ConnectionState, Step};
use gateway::{CgiExchange, Pump, HIGH_WATER};
use log::{debug, error, info, warn};
use mio::event::Event;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io::{self, Read};
use std::net::{Shutdown, SocketAddr, ToSocketAddrs};
use std::time::{Duration, Instant};

const LISTENER_TOKENS: usize = 1024;
const READ_CHUNK: usize = 16 * 1024;
/// Input buffered ahead while a response is still in progress.
const MAX_PIPELINED: usize = 64 * 1024;
/// How long unread request bytes are drained after an early response.
const LINGER: Duration = Duration::from_secs(2);
const TICK: Duration = Duration::from_millis(250);

pub struct Server {
    poll: Poll,
    listeners: HashMap<Token, ListenerEntry>,
    connections: HashMap<Token, Connection>,
    pipes: HashMap<Token, (Token, PipeEnd)>,
    /// Work that readiness events will not announce again.
    ready: VecDeque<(Token, Resume)>,
    config: Config,
    next_token: usize,
}

struct ListenerEntry {
    listener: TcpListener,
    addr: SocketAddr,
    /// Virtual hosts answering on this address, default first.
    hosts: Vec<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipeEnd {
    Input,
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resume {
    /// Parse buffered input, then read more.
    Read,
    /// Keep moving script output.
    Pump,
}

impl Server {
    pub fn new(config: Config) -> Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            listeners: HashMap::new(),
            connections: HashMap::new(),
            pipes: HashMap::new(),
            ready: VecDeque::new(),
            config,
            next_token: LISTENER_TOKENS,
        })
    }

    /// Opens one listener per distinct `host:port`.
    pub fn bind(&mut self) -> Result<()> {
        let mut groups: Vec<(String, Vec<usize>)> = Vec::new();
        for (idx, host) in self.config.servers.iter().enumerate() {
            let addr = host.listen_addr();
            match groups.iter_mut().find(|(a, _)| *a == addr) {
                Some((_, hosts)) => hosts.push(idx),
                None => groups.push((addr, vec![idx])),
            }
        }

        for (idx, (addr, hosts)) in groups.into_iter().enumerate().take(LISTENER_TOKENS) {
            let resolved = match addr.to_socket_addrs().map(|mut a| a.next()) {
                Ok(Some(a)) => a,
                Ok(None) => {
                    error!("[Setup] {} resolves to no address", addr);
                    continue;
                }
                Err(e) => {
                    error!("[Setup] cannot resolve {}: {}", addr, e);
                    continue;
                }
            };

            match TcpListener::bind(resolved) {
                Ok(mut listener) => {
                    let token = Token(idx);
                    self.poll
                        .registry()
                        .register(&mut listener, token, Interest::READABLE)?;
                    let local = listener.local_addr()?;
                    info!("[Setup] listening on http://{} ({} host(s))", local, hosts.len());
                    self.listeners.insert(token, ListenerEntry {
                        listener,
                        addr: local,
                        hosts,
                    });
                }
                Err(e) => error!("[Setup] failed to bind {}: {}", resolved, e),
            }
        }

        if self.listeners.is_empty() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "no address could be bound",
            )));
        }
        Ok(())
    }

    /// Bound address serving virtual host `host` (its index in the config).
    pub fn local_addr(&self, host: usize) -> Option<SocketAddr> {
        self.listeners
            .values()
            .find(|l| l.hosts.contains(&host))
            .map(|l| l.addr)
    }

    pub fn run(&mut self) -> Result<()> {
        let mut events = Events::with_capacity(1024);
        info!("[Reactor] event loop started");
        loop {
            self.poll_once(&mut events)?;
        }
    }

    /// One poll, its events, deferred work, and timeout checks.
    pub fn poll_once(&mut self, events: &mut Events) -> Result<()> {
        let timeout = if self.ready.is_empty() { TICK } else { Duration::ZERO };
        if let Err(e) = self.poll.poll(events, Some(timeout)) {
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(e.into());
        }

        for event in events.iter() {
            let token = event.token();
            if self.listeners.contains_key(&token) {
                self.accept_connections(token);
            } else if let Some(&(owner, end)) = self.pipes.get(&token) {
                match end {
                    PipeEnd::Input => self.feed_cgi(owner),
                    PipeEnd::Output => self.pump(owner),
                }
            } else {
                self.handle_client_event(token, event);
            }
        }

        self.run_ready();
        self.check_timeouts();
        Ok(())
    }

    fn allocate_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    fn accept_connections(&mut self, token: Token) {
        loop {
            let Some(entry) = self.listeners.get(&token) else {
                return;
            };
            match entry.listener.accept() {
                Ok((mut stream, peer)) => {
                    let local = stream.local_addr().unwrap_or(entry.addr);
                    let conn_token = self.allocate_token();
                    if let Err(e) =
                        self.poll
                            .registry()
                            .register(&mut stream, conn_token, Interest::READABLE)
                    {
                        warn!("[Network] cannot register {}: {}", peer, e);
                        continue;
                    }
                    let _ = stream.set_nodelay(true);
                    debug!("[Network] accepted {} as {:?}", peer, conn_token);
                    self.connections
                        .insert(conn_token, Connection::new(stream, peer, local, token));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("[Network] accept failed: {}", e);
                    return;
                }
            }
        }
    }

    fn handle_client_event(&mut self, token: Token, event: &Event) {
        if event.is_error() {
            debug!("[Network] socket error on {:?}", token);
            self.close_connection(token);
            return;
        }
        if event.is_readable() || event.is_read_closed() {
            self.read_from_client(token);
        }
        if event.is_writable() {
            self.flush(token);
        }
    }

    fn read_from_client(&mut self, token: Token) {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            let Some(conn) = self.connections.get_mut(&token) else {
                return;
            };
            if conn.is_busy() && conn.read_buffer.len() >= MAX_PIPELINED {
                return;
            }
            match conn.stream.read(&mut buf) {
                Ok(0) => {
                    self.handle_client_eof(token);
                    return;
                }
                Ok(n) => {
                    conn.last_activity = Instant::now();
                    if conn.is_lingering() {
                        continue;
                    }
                    conn.read_buffer.extend_from_slice(&buf[..n]);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("[Network] read from {:?} failed: {}", token, e);
                    self.close_connection(token);
                    return;
                }
            }
            self.advance(token);
        }
    }

    fn handle_client_eof(&mut self, token: Token) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };
        conn.peer_closed = true;
        // A queued response still goes out; anything else ends here.
        if matches!(conn.state, ConnectionState::WriteResponse) {
            conn.keep_alive = false;
            return;
        }
        self.close_connection(token);
    }

    /// Runs the state machine over buffered input and acts on the result.
    fn advance(&mut self, token: Token) {
        let step = {
            let Some(conn) = self.connections.get_mut(&token) else {
                return;
            };
            let Some(entry) = self.listeners.get(&conn.listener) else {
                return;
            };
            conn.step(&self.config.servers, &entry.hosts)
        };

        match step {
            Step::Wait => {
                // An interim `100 Continue` may be waiting.
                if self
                    .connections
                    .get(&token)
                    .is_some_and(|c| c.pending_write() > 0)
                {
                    self.flush(token);
                }
            }
            Step::Respond(response) => self.respond(token, response),
            Step::Fail {
                error,
                host,
                location,
            } => self.fail(token, error, host, location),
            Step::Dispatch(request, route) => self.dispatch(token, *request, route),
        }
    }

    fn dispatch(&mut self, token: Token, mut request: Request, route: RouteMatch) {
        let outcome = {
            let Some(conn) = self.connections.get(&token) else {
                return;
            };
            let host = &self.config.servers[route.host];
            let ctx = Context {
                host,
                location: &host.locations[route.location],
                local: conn.local,
                peer: conn.peer,
            };
            handlers::dispatch(&ctx, &mut request)
        };

        match outcome {
            Ok(Outcome::Respond(response)) => self.respond(token, response),
            Ok(Outcome::Cgi(launch)) => self.start_cgi(token, launch, route),
            Err(error) => self.fail(token, error, route.host, Some(route.location)),
        }
    }

    fn respond(&mut self, token: Token, response: Response) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };
        conn.queue_response(&response);
        self.flush(token);
    }

    fn fail(&mut self, token: Token, error: Error, host: usize, location: Option<usize>) {
        if error.status() >= 500 {
            warn!("[Handler] {:?}: {}", token, error);
        } else {
            debug!("[Handler] {:?}: {}", token, error);
        }
        let response = self.error_response(&error, host, location);
        self.respond(token, response);
    }

    /// The host's custom page for the status if it is readable, otherwise
    /// the built-in one.
    fn error_response(&self, error: &Error, host: usize, location: Option<usize>) -> Response {
        let status = error.status();
        let vhost = self.config.servers.get(host);

        let custom = vhost
            .and_then(|h| h.error_pages.get(&status))
            .and_then(|path| match fs::read(path) {
                Ok(body) => Some(Response::bytes(status, "text/html; charset=utf-8", body)),
                Err(e) => {
                    warn!("[Handler] error page {:?} unreadable: {}", path, e);
                    None
                }
            });
        let mut response = custom.unwrap_or_else(|| Response::error_page(status));

        if status == 405 {
            let allow = match location.and_then(|l| vhost?.locations.get(l)) {
                Some(loc) => policy::allow_header(loc),
                None => "GET, POST, PUT, DELETE".to_string(),
            };
            response.set_header("Allow", allow);
        }
        response
    }

    /// Writes what the socket accepts, then moves the connection on:
    /// resumes a paused script or completes the response.
    fn flush(&mut self, token: Token) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };
        if let Err(e) = conn.write_pending() {
            debug!("[Network] write to {} failed: {}", conn.peer, e);
            self.close_connection(token);
            return;
        }

        let resume = matches!(conn.state, ConnectionState::Cgi)
            && conn.cgi.as_ref().is_some_and(|x| x.paused)
            && conn.pending_write() < HIGH_WATER;
        let finished =
            matches!(conn.state, ConnectionState::WriteResponse) && conn.pending_write() == 0;

        self.sync_interest(token);
        if resume {
            self.pump(token);
        } else if finished {
            self.finish_response(token);
        }
    }

    /// Asks for writability only while output is pending.
    fn sync_interest(&mut self, token: Token) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };
        let want = conn.pending_write() > 0;
        if want == conn.writable_interest {
            return;
        }
        let interest = if want {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        match self.poll.registry().reregister(&mut conn.stream, token, interest) {
            Ok(()) => conn.writable_interest = want,
            Err(e) => {
                warn!("[Network] reregister {:?} failed: {}", token, e);
                self.close_connection(token);
            }
        }
    }

    fn finish_response(&mut self, token: Token) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };
        info!(
            "{} \"{}\" {}",
            conn.peer,
            conn.current.take().as_deref().unwrap_or("-"),
            conn.status
        );

        if conn.keep_alive && !conn.peer_closed {
            conn.reset();
            // Pipelined requests may already be buffered.
            self.ready.push_back((token, Resume::Read));
        } else if conn.discard_input && !conn.peer_closed {
            let _ = conn.stream.shutdown(Shutdown::Write);
            conn.read_buffer.clear();
            conn.state = ConnectionState::Lingering {
                until: Instant::now() + LINGER,
            };
            self.ready.push_back((token, Resume::Read));
        } else {
            self.close_connection(token);
        }
    }

    fn close_connection(&mut self, token: Token) {
        let Some(mut conn) = self.connections.remove(&token) else {
            return;
        };
        if let Some(mut exchange) = conn.cgi.take() {
            warn!(
                "[CGI] killing pid {}: client {} went away",
                exchange.process.pid(),
                conn.peer
            );
            self.release_pipes(&mut exchange);
        }
        let _ = self.poll.registry().deregister(&mut conn.stream);
        debug!("[Network] closed {:?} ({})", token, conn.peer);
    }

    fn start_cgi(&mut self, token: Token, launch: CgiLaunch, route: RouteMatch) {
        if !self.connections.contains_key(&token) {
            return;
        }
        let timeout = Duration::from_secs(self.config.cgi_timeout_seconds);
        let mut process = match CgiProcess::spawn(launch, timeout) {
            Ok(p) => p,
            Err(error) => return self.fail(token, error, route.host, Some(route.location)),
        };

        let output = self.allocate_token();
        let input = process.has_pending_input().then(|| self.allocate_token());
        if let Err(e) = process.register(self.poll.registry(), output, input) {
            let error = GatewayFailure::Io(e).into();
            return self.fail(token, error, route.host, Some(route.location));
        }
        self.pipes.insert(output, (token, PipeEnd::Output));
        if let Some(t) = input {
            self.pipes.insert(t, (token, PipeEnd::Input));
        }

        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };
        debug!("[CGI] pid {} serving {}", process.pid(), conn.peer);
        conn.cgi = Some(CgiExchange::new(process, output, input, route, conn.version));
        conn.state = ConnectionState::Cgi;

        self.feed_cgi(token);
        self.pump(token);
    }

    fn feed_cgi(&mut self, token: Token) {
        let Some(exchange) = self.connections.get_mut(&token).and_then(|c| c.cgi.as_mut()) else {
            return;
        };
        match exchange.process.write_input() {
            Ok(false) => {}
            Ok(true) => {
                if let Some(t) = exchange.input_token.take() {
                    self.pipes.remove(&t);
                }
                exchange.process.close_input(self.poll.registry());
            }
            Err(failure) => self.abort_cgi(token, failure.into()),
        }
    }

    fn pump(&mut self, token: Token) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };
        if conn.cgi.is_none() {
            return;
        }
        match conn.pump_cgi() {
            Ok(Pump::Waiting) | Ok(Pump::Paused) => self.sync_interest(token),
            Ok(Pump::Yield) => {
                self.sync_interest(token);
                self.ready.push_back((token, Resume::Pump));
            }
            Ok(Pump::Finished) => self.finish_cgi(token),
            Ok(Pump::ClientGone) => self.close_connection(token),
            Err(failure) => self.abort_cgi(token, failure.into()),
        }
    }

    fn finish_cgi(&mut self, token: Token) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };
        let Some(mut exchange) = conn.cgi.take() else {
            return;
        };
        conn.state = ConnectionState::WriteResponse;
        self.release_pipes(&mut exchange);

        let pid = exchange.process.pid();
        match exchange.process.terminate() {
            Some(status) if !status.success() => debug!("[CGI] pid {} ended with {}", pid, status),
            _ => debug!("[CGI] pid {} done", pid),
        }
        self.flush(token);
    }

    /// Ends a failed exchange. Before the head went out the client gets an
    /// error response; after that the connection is closed.
    fn abort_cgi(&mut self, token: Token, error: Error) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };
        let Some(mut exchange) = conn.cgi.take() else {
            return;
        };
        warn!(
            "[CGI] pid {} for {} failed: {}",
            exchange.process.pid(),
            conn.peer,
            error
        );
        self.release_pipes(&mut exchange);
        let head_sent = exchange.head_sent();
        let route = exchange.route;
        drop(exchange);

        if head_sent {
            self.close_connection(token);
        } else {
            self.fail(token, error, route.host, Some(route.location));
        }
    }

    fn release_pipes(&mut self, exchange: &mut CgiExchange) {
        self.pipes.remove(&exchange.output_token);
        if let Some(t) = exchange.input_token.take() {
            self.pipes.remove(&t);
        }
        exchange.process.deregister(self.poll.registry());
    }

    fn run_ready(&mut self) {
        // Only work queued before this pass; new entries wait for the next.
        for _ in 0..self.ready.len() {
            let Some((token, resume)) = self.ready.pop_front() else {
                break;
            };
            match resume {
                Resume::Read => {
                    self.advance(token);
                    self.read_from_client(token);
                }
                Resume::Pump => self.pump(token),
            }
        }
    }

    fn check_timeouts(&mut self) {
        let now = Instant::now();
        let idle = Duration::from_secs(self.config.timeout_seconds);
        let mut expired_scripts = Vec::new();
        let mut idle_connections = Vec::new();

        for (&token, conn) in &self.connections {
            match (&conn.state, &conn.cgi) {
                (ConnectionState::Lingering { until }, _) if now >= *until => {
                    idle_connections.push(token)
                }
                // A running script is bounded by its own deadline.
                (_, Some(exchange)) if !exchange.paused => {
                    if exchange.process.is_expired(now) {
                        expired_scripts.push(token);
                    }
                }
                _ if now.duration_since(conn.last_activity) >= idle => {
                    idle_connections.push(token)
                }
                _ => {}
            }
        }

        for token in expired_scripts {
            self.abort_cgi(token, GatewayFailure::Timeout.into());
        }
        for token in idle_connections {
            debug!("[Network] closing idle {:?}", token);
            self.close_connection(token);
        }
    }
}
