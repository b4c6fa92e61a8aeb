//! Networking runtime.
//!
//! A single-threaded, readiness-based server built on mio (epoll on Linux,
//! kqueue on macOS). The pieces:
//! - `BufferPool`: pre-allocated per-connection buffers
//! - `Connection`: per-client framing state machine
//! - `EventLoop`: poll loop owning the listener, connections and keyspace
//! - `request`: payload dispatch for the configured protocol

mod buffer;
mod connection;
mod event_loop;
pub mod request;

pub use buffer::BufferPool;
pub use connection::{ConnState, Connection, ConnectionError};
pub use event_loop::EventLoop;
pub use request::Protocol;

use crate::config::Config;
use std::io;
use std::net::SocketAddr;
use tracing::info;

/// Bind a non-blocking TCP listener with `SO_REUSEADDR` set.
pub fn bind_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}

/// Bind the configured address and serve until a fatal error.
pub fn run(config: Config) -> io::Result<()> {
    let listener = bind_listener(config.listen, config.backlog)?;
    let mut event_loop = EventLoop::new(listener, &config)?;

    info!(
        addr = %event_loop.local_addr()?,
        protocol = ?config.protocol,
        max_payload = config.max_payload,
        "Listening"
    );

    event_loop.run()
}
