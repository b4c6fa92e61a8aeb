//! mio event loop.
//!
//! Readiness-based model: poll tells us when sockets are ready, then the
//! connection state machine performs non-blocking reads and writes until
//! they would block. Uses epoll on Linux, kqueue on macOS, both
//! edge-triggered.
//!
//! A single thread owns the listener, every connection and the keyspace,
//! so request handling needs no synchronization.

use crate::config::Config;
use crate::protocols::frame::FrameCodec;
use crate::runtime::request::{self, Protocol};
use crate::runtime::{BufferPool, ConnState, Connection};
use crate::storage::Keyspace;
use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token};
use slab::Slab;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

const READ_WRITE: Interest = Interest::READABLE.add(Interest::WRITABLE);

/// A registered connection and the interest it is registered with.
struct Session {
    conn: Connection<TcpStream>,
    interest: Interest,
    peer: SocketAddr,
}

/// Everything the event handlers touch, split from `Poll` so the registry
/// can be borrowed alongside.
struct Worker {
    listener: TcpListener,
    sessions: Slab<Session>,
    buffers: BufferPool,
    codec: FrameCodec,
    protocol: Protocol,
    keyspace: Keyspace,
    /// Response payload under construction, reused across requests.
    scratch: Vec<u8>,
    max_connections: usize,
}

/// Single-threaded server loop.
pub struct EventLoop {
    poll: Poll,
    events: Events,
    worker: Worker,
}

impl EventLoop {
    /// Take ownership of a bound listener and register it for accepts.
    pub fn new(listener: std::net::TcpListener, config: &Config) -> io::Result<Self> {
        listener.set_nonblocking(true)?;
        let mut listener = TcpListener::from_std(listener);

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        let codec = FrameCodec::new(config.max_payload);
        // Read + write buffer per connection, each holding one full frame.
        let pool_size = config.max_connections.checked_mul(2).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "max_connections too large")
        })?;
        let buffers = BufferPool::new(pool_size, codec.max_frame_len());

        info!(
            pool_buffers = pool_size,
            buffer_size = codec.max_frame_len(),
            max_connections = config.max_connections,
            "Event loop ready"
        );

        Ok(Self {
            poll,
            events: Events::with_capacity(config.event_capacity),
            worker: Worker {
                listener,
                sessions: Slab::with_capacity(config.max_connections),
                buffers,
                codec,
                protocol: config.protocol,
                keyspace: Keyspace::new(),
                scratch: Vec::with_capacity(config.max_payload),
                max_connections: config.max_connections,
            },
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.worker.listener.local_addr()
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        self.worker.sessions.len()
    }

    pub fn keyspace(&self) -> &Keyspace {
        &self.worker.keyspace
    }

    /// Serve forever. Only returns on a poll failure.
    pub fn run(&mut self) -> io::Result<()> {
        loop {
            self.poll_once(None)?;
        }
    }

    /// Wait for readiness (at most `timeout`) and dispatch every event.
    pub fn poll_once(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        loop {
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        let registry = self.poll.registry();
        for event in self.events.iter() {
            match event.token() {
                LISTENER_TOKEN => self.worker.accept_connections(registry),
                Token(conn_id) => self.worker.connection_event(registry, conn_id, event),
            }
        }
        Ok(())
    }
}

impl Worker {
    fn accept_connections(&mut self, registry: &Registry) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.accept_connection(registry, stream, peer),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "Accept error");
                    break;
                }
            }
        }
    }

    /// Set up one accepted stream. On any failure the stream is dropped,
    /// which closes it.
    fn accept_connection(&mut self, registry: &Registry, stream: TcpStream, peer: SocketAddr) {
        if self.sessions.len() >= self.max_connections {
            warn!(peer = %peer, "Connection limit reached, rejecting connection");
            return;
        }

        let Some((read_buf, write_buf)) = self.buffers.alloc_pair() else {
            warn!(peer = %peer, "Buffer pool exhausted, rejecting connection");
            return;
        };

        let entry = self.sessions.vacant_entry();
        let conn_id = entry.key();
        let mut conn = Connection::new(stream, read_buf, write_buf);

        if let Err(e) = registry.register(conn.stream_mut(), Token(conn_id), Interest::READABLE) {
            warn!(peer = %peer, error = %e, "Failed to register connection");
            let (_stream, read_buf, write_buf) = conn.into_parts();
            self.buffers.free(read_buf);
            self.buffers.free(write_buf);
            return;
        }

        entry.insert(Session {
            conn,
            interest: Interest::READABLE,
            peer,
        });
        debug!(conn_id, peer = %peer, "Accepted connection");
    }

    fn connection_event(&mut self, registry: &Registry, conn_id: usize, event: &Event) {
        let Worker {
            sessions,
            codec,
            protocol,
            keyspace,
            scratch,
            ..
        } = &mut *self;

        // Stale event for a connection closed earlier in this batch.
        let Some(session) = sessions.get_mut(conn_id) else {
            return;
        };

        let protocol = *protocol;
        let max_payload = codec.max_payload();
        let mut handler = |request: &[u8], response: &mut Vec<u8>| {
            request::process(protocol, request, response, keyspace, max_payload)
        };

        // Errors and hangups surface through the next read or write.
        let readable = event.is_readable() || event.is_read_closed() || event.is_error();
        let writable = event.is_writable() || event.is_write_closed() || event.is_error();

        let mut result = Ok(());
        if readable {
            result = session.conn.read_ready(codec, scratch, &mut handler);
        }
        if result.is_ok() && writable && session.conn.state() == ConnState::Writing {
            result = session.conn.write_ready();
            if result.is_ok() && session.conn.state() == ConnState::Reading {
                result = session.conn.read_ready(codec, scratch, &mut handler);
            }
        }

        if let Err(e) = result {
            warn!(conn_id, peer = %session.peer, error = %e, "Closing connection");
        }

        let keep = match session.conn.state() {
            ConnState::Closing => false,
            state => {
                let interest = if state == ConnState::Writing {
                    READ_WRITE
                } else {
                    Interest::READABLE
                };
                if interest == session.interest {
                    true
                } else {
                    match registry.reregister(session.conn.stream_mut(), Token(conn_id), interest) {
                        Ok(()) => {
                            session.interest = interest;
                            true
                        }
                        Err(e) => {
                            warn!(conn_id, peer = %session.peer, error = %e, "Failed to reregister connection");
                            false
                        }
                    }
                }
            }
        };

        if !keep {
            self.close_connection(registry, conn_id);
        }
    }

    /// Remove the session, then deregister and release its resources.
    /// The stream is closed when it is dropped at the end.
    fn close_connection(&mut self, registry: &Registry, conn_id: usize) {
        if let Some(session) = self.sessions.try_remove(conn_id) {
            let (mut stream, read_buf, write_buf) = session.conn.into_parts();
            if let Err(e) = registry.deregister(&mut stream) {
                debug!(conn_id, error = %e, "Failed to deregister connection");
            }
            self.buffers.free(read_buf);
            self.buffers.free(write_buf);

            debug!(conn_id, peer = %session.peer, "Connection closed");
        }
    }
}
