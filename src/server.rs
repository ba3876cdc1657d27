//! Dual-transport server and its event loop.
//!
//! Readiness-based model: poll tells us when sockets are ready, then we
//! perform non-blocking accept/read/recv syscalls. Uses epoll on Linux,
//! kqueue on macOS.
//!
//! One thread runs everything: the stream listener, every accepted stream
//! connection, and the datagram socket are registered with a single `Poll`,
//! and events are handled strictly in the order they are reported. The poll
//! wait is the only place the loop blocks; a `Waker` lets `StopHandle`
//! interrupt it from outside.

use crate::command::{self, Command};
use crate::config::Config;
use crate::stats::ServerStats;
use mio::net::{TcpListener, TcpStream, UdpSocket};
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use slab::Slab;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const DATAGRAM_TOKEN: Token = Token(usize::MAX - 1);
const WAKER_TOKEN: Token = Token(usize::MAX - 2);

/// Events drained per poll wake-up.
const EVENT_CAPACITY: usize = 64;

/// Stream read buffer size. The last byte stays unused, capping a single
/// message at 1023 payload bytes; longer sends are truncated at that limit.
const STREAM_BUF_SIZE: usize = 1024;

/// Datagram receive buffer size, with the same one-byte reserve (2047
/// payload bytes per datagram).
const DATAGRAM_BUF_SIZE: usize = 2048;

/// Where a reply goes: back down the stream connection that delivered the
/// request, or to the source address of the datagram.
enum ReplyTo<'a> {
    Stream(&'a mut TcpStream),
    Datagram(&'a UdpSocket, SocketAddr),
}

/// Handle for requesting shutdown from outside the event loop.
#[derive(Clone)]
pub struct StopHandle {
    running: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl StopHandle {
    /// Clear the running flag and wake the poll so the loop observes it
    /// without waiting for network traffic.
    #[allow(dead_code)] // exercised by external callers and tests
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "Failed to wake event loop");
        }
    }
}

/// Server instance: both endpoints, the poll handle, and the connection
/// registry, all owned by the thread that calls [`Server::run`].
#[derive(Debug)]
pub struct Server {
    listener: TcpListener,
    datagram: UdpSocket,
    poll: Poll,
    connections: Slab<TcpStream>,
    stats: Arc<ServerStats>,
    running: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl Server {
    /// Bind both endpoints and register them with a fresh poll.
    ///
    /// Any create/bind/listen/register failure aborts startup; sockets
    /// opened before the failure are reclaimed on drop.
    pub fn bind(config: &Config) -> io::Result<Self> {
        let addr: SocketAddr = config
            .listen
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let mut listener = bind_stream_listener(addr)?;
        // The datagram socket shares whatever port the listener actually
        // got, which matters when binding to port 0.
        let local = listener.local_addr()?;
        let mut datagram = bind_datagram_socket(local)?;

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        poll.registry()
            .register(&mut datagram, DATAGRAM_TOKEN, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        info!(addr = %local, "Listening on stream and datagram transports");

        Ok(Self {
            listener,
            datagram,
            poll,
            connections: Slab::new(),
            stats: ServerStats::new(),
            running: Arc::new(AtomicBool::new(true)),
            waker,
        })
    }

    /// Actual address of the stream listener.
    #[allow(dead_code)]
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Actual address of the datagram socket.
    #[allow(dead_code)]
    pub fn datagram_local_addr(&self) -> io::Result<SocketAddr> {
        self.datagram.local_addr()
    }

    /// Shared counter handle for external reporting.
    #[allow(dead_code)]
    pub fn stats(&self) -> Arc<ServerStats> {
        Arc::clone(&self.stats)
    }

    /// Handle that stops the loop from another thread.
    #[allow(dead_code)]
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            running: Arc::clone(&self.running),
            waker: Arc::clone(&self.waker),
        }
    }

    /// Run the event loop until the running flag clears or the poll fails.
    ///
    /// Consumes the server; every endpoint still open when the loop exits
    /// is deregistered and closed exactly once.
    pub fn run(mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(EVENT_CAPACITY);
        let mut result = Ok(());

        while self.running.load(Ordering::SeqCst) {
            if let Err(e) = self.poll.poll(&mut events, None) {
                // Signal interruptions are retried transparently
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "Poll failed");
                result = Err(e);
                break;
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => accept_one(
                        &self.listener,
                        self.poll.registry(),
                        &mut self.connections,
                        &self.stats,
                    ),
                    DATAGRAM_TOKEN => {
                        handle_datagram(&self.datagram, &self.stats, &self.running)
                    }
                    WAKER_TOKEN => {
                        // Nothing to read; the running flag is re-checked at
                        // the top of the loop.
                    }
                    Token(conn_id) => {
                        if event.is_readable() {
                            handle_stream_readable(
                                conn_id,
                                self.poll.registry(),
                                &mut self.connections,
                                &self.stats,
                                &self.running,
                            );
                        } else {
                            // Hangup or error without readable data
                            close_connection(
                                conn_id,
                                self.poll.registry(),
                                &mut self.connections,
                                &self.stats,
                            );
                        }
                    }
                }
            }
        }

        // Teardown: deregister everything still registered before the
        // handles drop.
        let registry = self.poll.registry();
        for (conn_id, stream) in self.connections.iter_mut() {
            let _ = registry.deregister(stream);
            trace!(conn_id, "Closing connection at shutdown");
        }
        self.connections.clear();
        let _ = registry.deregister(&mut self.listener);
        let _ = registry.deregister(&mut self.datagram);

        info!("Server stopped");
        result
    }
}

/// Accept at most one pending connection per readiness notification; a
/// backlog of several connects drains across subsequent wake-ups.
fn accept_one(
    listener: &TcpListener,
    registry: &Registry,
    connections: &mut Slab<TcpStream>,
    stats: &ServerStats,
) {
    match listener.accept() {
        Ok((stream, peer)) => {
            let conn_id = connections.insert(stream);
            let stream = &mut connections[conn_id];
            if let Err(e) = registry.register(stream, Token(conn_id), Interest::READABLE) {
                warn!(error = %e, "Failed to register connection");
                connections.remove(conn_id);
                return;
            }
            stats.record_accept();
            debug!(conn_id, peer = %peer, "Accepted connection");
        }
        // Spurious notification, nothing pending
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => debug!(error = %e, "Accept failed"),
    }
}

/// One readiness event, one read, one message.
fn handle_stream_readable(
    conn_id: usize,
    registry: &Registry,
    connections: &mut Slab<TcpStream>,
    stats: &ServerStats,
    running: &AtomicBool,
) {
    let mut buf = [0u8; STREAM_BUF_SIZE];

    let n = {
        let stream = match connections.get_mut(conn_id) {
            Some(stream) => stream,
            None => return,
        };

        match stream.read(&mut buf[..STREAM_BUF_SIZE - 1]) {
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                // Transient; the connection stays registered and the next
                // readiness event retries implicitly.
                trace!(conn_id, error = %e, "Stream read failed");
                return;
            }
        }
    };

    if n == 0 {
        // Orderly close by the peer
        close_connection(conn_id, registry, connections, stats);
        return;
    }

    // Re-borrow for the reply path
    let stream = match connections.get_mut(conn_id) {
        Some(stream) => stream,
        None => return,
    };
    dispatch_message(&buf[..n], ReplyTo::Stream(stream), stats, running);
}

/// Tear down one connection: deregister before the handle is released, then
/// account for the disconnect. Safe to reach at most once per connection.
fn close_connection(
    conn_id: usize,
    registry: &Registry,
    connections: &mut Slab<TcpStream>,
    stats: &ServerStats,
) {
    if let Some(mut stream) = connections.try_remove(conn_id) {
        let _ = registry.deregister(&mut stream);
        stats.record_disconnect();
        debug!(conn_id, "Connection closed");
    }
}

/// Receive one datagram and dispatch it, replying to the captured source
/// address. Datagram peers have no registered state; the address is their
/// only identity.
fn handle_datagram(socket: &UdpSocket, stats: &ServerStats, running: &AtomicBool) {
    let mut buf = [0u8; DATAGRAM_BUF_SIZE];

    let (n, peer) = match socket.recv_from(&mut buf[..DATAGRAM_BUF_SIZE - 1]) {
        Ok(received) => received,
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
        Err(e) => {
            warn!(error = %e, "Datagram receive failed");
            return;
        }
    };

    dispatch_message(&buf[..n], ReplyTo::Datagram(socket, peer), stats, running);
}

/// Dispatch one received message: commands get exactly one rendered reply,
/// anything else is echoed back verbatim through the same transport.
fn dispatch_message(
    message: &[u8],
    reply_to: ReplyTo<'_>,
    stats: &ServerStats,
    running: &AtomicBool,
) {
    if !command::is_command(message) {
        send_reply(reply_to, message);
        return;
    }

    let cmd = Command::parse(message);
    let reply = cmd.response(stats);
    send_reply(reply_to, reply.as_bytes());

    if cmd == Command::Shutdown {
        info!("Shutdown requested");
        running.store(false, Ordering::SeqCst);
    }
}

/// Single non-blocking send; a failed reply is dropped, never retried.
fn send_reply(reply_to: ReplyTo<'_>, payload: &[u8]) {
    let result = match reply_to {
        ReplyTo::Stream(stream) => stream.write(payload),
        ReplyTo::Datagram(socket, peer) => socket.send_to(payload, peer),
    };

    if let Err(e) = result {
        if e.kind() != io::ErrorKind::WouldBlock {
            debug!(error = %e, "Dropping undeliverable reply");
        }
    }
}

/// Create the non-blocking stream listener with a platform-maximum backlog.
fn bind_stream_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(libc::SOMAXCONN)?;

    Ok(TcpListener::from_std(socket.into()))
}

/// Create the non-blocking datagram socket on the listener's address.
fn bind_datagram_socket(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;

    Ok(UdpSocket::from_std(socket.into()))
}
