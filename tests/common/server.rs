//! Runs a server inside the test process.

use std::net::SocketAddr;
use std::thread;
use webserv::config;
use webserv::server::Server;

/// Parses `config_text`, binds, and runs the event loop on a background
/// thread. Returns the address of the first virtual host.
pub fn start(config_text: &str) -> SocketAddr {
    let cfg = config::parse(config_text).expect("test config must parse");
    let mut server = Server::new(cfg).expect("poll instance");
    server.bind().expect("bind ephemeral port");
    let addr = server.local_addr(0).expect("first host is bound");

    thread::spawn(move || {
        if let Err(e) = server.run() {
            panic!("server loop failed: {}", e);
        }
    });
    addr
}
