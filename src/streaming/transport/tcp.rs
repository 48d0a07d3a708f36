//! TCP transport
//!
//! Every packet travels as one length-prefixed frame:
//!
//! ```text
//! ┌──────────────────┬────────────────────────┐
//! │ Length (4 bytes) │ Stream packet          │
//! │ Little-endian u32│ (see streaming::wire)  │
//! └──────────────────┴────────────────────────┘
//! ```
//!
//! Frames larger than [`MAX_FRAME`] are rejected and close the connection.
//!
//! # Threads
//!
//! - `net-io`: accepts (server) and writes queued frames to the peer
//! - `net-reader`: reassembles incoming frames and hands them to the receive
//!   callback; spawned per connection and joined by `net-io`
//!
//! The server streams to exactly one client. Additional clients are accepted
//! and closed immediately.
//!
//! `abort` shuts the attached socket down from the caller's thread, so a
//! write blocked on a stalled peer fails at once instead of waiting out
//! [`WRITE_TIMEOUT`].

use super::{
    ConnectCallback, ErrorCallback, Link, OutboundPacket, ReceiveCallback, SendStatus, Transport,
    TransportConfig,
};
use crate::config::Role;
use crate::core::stats::SessionStats;
use crate::error::{Error, Result, TransportError};
use crate::streaming::wire::MAX_FRAME;

use crossbeam_channel::RecvTimeoutError;
use parking_lot::Mutex;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Listener poll interval while no client is attached
const ACCEPT_POLL: Duration = Duration::from_millis(10);
/// Queue poll interval; bounds shutdown latency of the writer
const QUEUE_POLL: Duration = Duration::from_millis(50);
/// Reader poll interval; bounds shutdown latency of the reader
const READ_POLL: Duration = Duration::from_millis(200);
/// A write stalled this long means the peer is gone
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Length-prefixed TCP transport, server or client role
pub struct TcpTransport {
    config: TransportConfig,
    link: Arc<Link>,
    /// Handle on the attached peer's socket, for `abort`
    peer_socket: PeerSocket,
    io_thread: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

type PeerSocket = Arc<Mutex<Option<TcpStream>>>;

impl TcpTransport {
    pub fn new(config: TransportConfig, stats: Arc<SessionStats>) -> Self {
        let link = Arc::new(Link::new(config.queue_depth, stats));
        Self {
            config,
            link,
            peer_socket: Arc::new(Mutex::new(None)),
            io_thread: None,
            local_addr: None,
        }
    }

    fn start_server(&mut self) -> Result<JoinHandle<()>> {
        let listener = TcpListener::bind(&self.config.addr).map_err(|e| {
            TransportError::ConnectFailed {
                addr: self.config.addr.clone(),
                reason: e.to_string(),
            }
        })?;
        listener.set_nonblocking(true)?;
        let local = listener.local_addr()?;
        self.local_addr = Some(local);
        log::info!("TCP server listening on {}", local);

        let link = Arc::clone(&self.link);
        let peer_socket = Arc::clone(&self.peer_socket);
        spawn_io(move || server_loop(listener, link, peer_socket))
    }

    fn start_client(&mut self) -> Result<JoinHandle<()>> {
        let stream = connect(&self.config.addr, self.config.connect_timeout)?;
        self.local_addr = stream.local_addr().ok();
        let peer = stream.peer_addr()?;
        log::info!("TCP client connected to {}", peer);

        let connection = Connection::attach(stream, peer, &self.link, &self.peer_socket)?;
        let link = Arc::clone(&self.link);
        spawn_io(move || client_loop(connection, link))
    }
}

impl Transport for TcpTransport {
    fn start(&mut self) -> Result<()> {
        if self.io_thread.is_some() {
            return Err(Error::InvalidState("transport already started"));
        }
        let handle = match self.config.role {
            Role::Server => self.start_server()?,
            Role::Client => self.start_client()?,
        };
        self.io_thread = Some(handle);
        Ok(())
    }

    fn send(&self, packet: OutboundPacket) -> std::result::Result<SendStatus, TransportError> {
        self.link.offer(packet, MAX_FRAME)
    }

    fn on_receive(&mut self, callback: ReceiveCallback) {
        self.link.set_receive(callback);
    }

    fn on_error(&mut self, callback: ErrorCallback) {
        self.link.set_error(callback);
    }

    fn on_connect(&mut self, callback: ConnectCallback) {
        self.link.set_connect(callback);
    }

    fn stop(&mut self) {
        self.link.begin_shutdown();
        if let Some(handle) = self.io_thread.take() {
            if handle.join().is_err() {
                log::error!("TCP I/O thread panicked");
            }
            log::info!("TCP transport stopped");
        }
        self.link.finish_shutdown();
    }

    fn abort(&mut self) {
        self.link.begin_abort();
        if let Some(stream) = self.peer_socket.lock().as_ref() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.stop();
        self.link.discard_queued();
    }

    fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_io<F>(body: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name("net-io".to_string())
        .spawn(body)
        .map_err(|e| Error::Other(format!("Failed to spawn net-io thread: {}", e)))
}

/// Connect to the first reachable resolved address within `timeout`
fn connect(addr: &str, timeout: Duration) -> std::result::Result<TcpStream, TransportError> {
    let failed = |reason: String| TransportError::ConnectFailed {
        addr: addr.to_string(),
        reason,
    };
    let candidates = addr.to_socket_addrs().map_err(|e| failed(e.to_string()))?;

    let mut last_error = String::from("no addresses resolved");
    for candidate in candidates {
        match TcpStream::connect_timeout(&candidate, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                log::debug!("Connect to {} failed: {}", candidate, e);
                last_error = e.to_string();
            }
        }
    }
    Err(failed(last_error))
}

/// An attached peer: the write half plus its reader thread
struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    reader: Option<JoinHandle<()>>,
    peer_socket: PeerSocket,
}

impl Connection {
    fn attach(
        stream: TcpStream,
        peer: SocketAddr,
        link: &Arc<Link>,
        peer_socket: &PeerSocket,
    ) -> Result<Self> {
        stream.set_nonblocking(false)?;
        stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
        let read_half = stream.try_clone()?;
        read_half.set_read_timeout(Some(READ_POLL))?;
        let abort_handle = stream.try_clone()?;

        link.connected.store(true, std::sync::atomic::Ordering::Release);
        link.handlers.connected(peer);

        let reader_link = Arc::clone(link);
        let reader = thread::Builder::new()
            .name("net-reader".to_string())
            .spawn(move || reader_loop(read_half, peer, reader_link))
            .map_err(|e| Error::Other(format!("Failed to spawn net-reader thread: {}", e)))?;

        *peer_socket.lock() = Some(abort_handle);
        Ok(Self {
            stream,
            peer,
            reader: Some(reader),
            peer_socket: Arc::clone(peer_socket),
        })
    }

    /// Write one queued packet; false if the peer is gone
    fn deliver(&mut self, packet: &OutboundPacket, link: &Link) -> bool {
        match write_frame(&mut self.stream, &packet.bytes) {
            Ok(()) => {
                link.stats.record_delivered(packet.bytes.len() as u64);
                true
            }
            Err(e) => {
                link.stats.record_dropped_window(packet.samples);
                link.lose_peer(TransportError::ConnectionLost(format!("{}: {}", self.peer, e)));
                false
            }
        }
    }

    /// Write whatever is still queued (dropped instead on abort), then close
    fn flush_and_close(mut self, link: &Link) {
        link.drain_with(|packet| self.deliver(packet, link));
        self.close();
    }

    fn close(mut self) {
        *self.peer_socket.lock() = None;
        let _ = self.stream.shutdown(Shutdown::Both);
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                log::error!("TCP reader thread panicked");
            }
        }
        log::info!("Connection to {} closed", self.peer);
    }
}

fn write_frame(stream: &mut TcpStream, bytes: &[u8]) -> std::io::Result<()> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| std::io::Error::new(ErrorKind::InvalidInput, "frame too large"))?;
    stream.write_all(&len.to_le_bytes())?;
    stream.write_all(bytes)
}

fn server_loop(listener: TcpListener, link: Arc<Link>, peer_socket: PeerSocket) {
    let mut client: Option<Connection> = None;

    while !link.is_shutdown() {
        match listener.accept() {
            Ok((stream, addr)) => {
                if client.is_some() {
                    log::warn!("Rejecting client {}: already streaming to a peer", addr);
                    let _ = stream.shutdown(Shutdown::Both);
                } else {
                    log::info!("Client connected: {}", addr);
                    match Connection::attach(stream, addr, &link, &peer_socket) {
                        Ok(connection) => client = Some(connection),
                        Err(e) => log::warn!("Failed to set up client {}: {}", addr, e),
                    }
                }
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => {
                log::error!("Error accepting client connection: {}", e);
            }
        }

        let Some(connection) = client.as_mut() else {
            thread::sleep(ACCEPT_POLL);
            continue;
        };

        match link.rx.recv_timeout(QUEUE_POLL) {
            Ok(packet) => {
                connection.deliver(&packet, &link);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if !link.is_connected() {
            if let Some(gone) = client.take() {
                gone.close();
            }
        }
    }

    if let Some(connection) = client.take() {
        connection.flush_and_close(&link);
    }
    log::debug!("TCP server loop exiting");
}

fn client_loop(mut connection: Connection, link: Arc<Link>) {
    while !link.is_shutdown() && link.is_connected() {
        match link.rx.recv_timeout(QUEUE_POLL) {
            Ok(packet) => {
                connection.deliver(&packet, &link);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    if link.is_connected() {
        connection.flush_and_close(&link);
    } else {
        connection.close();
    }
    log::debug!("TCP client loop exiting");
}

fn reader_loop(mut stream: TcpStream, peer: SocketAddr, link: Arc<Link>) {
    let mut assembler = FrameAssembler::default();
    let mut chunk = vec![0u8; 64 * 1024];

    while !link.is_shutdown() && link.is_connected() {
        match stream.read(&mut chunk) {
            Ok(0) => {
                link.lose_peer(TransportError::ConnectionLost(format!(
                    "{} closed the connection",
                    peer
                )));
                break;
            }
            Ok(n) => {
                assembler.extend(&chunk[..n]);
                loop {
                    match assembler.next_frame() {
                        Ok(Some(frame)) => link.handlers.received(frame),
                        Ok(None) => break,
                        Err(e) => {
                            link.lose_peer(e);
                            return;
                        }
                    }
                }
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {}
            Err(e) => {
                link.lose_peer(TransportError::ConnectionLost(format!("{}: {}", peer, e)));
                break;
            }
        }
    }
}

/// Reassembles length-prefixed frames from arbitrary read chunks
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buf: Vec<u8>,
    start: usize,
}

impl FrameAssembler {
    pub fn extend(&mut self, data: &[u8]) {
        if self.start > 0 {
            self.buf.drain(..self.start);
            self.start = 0;
        }
        self.buf.extend_from_slice(data);
    }

    /// Next complete frame payload, if buffered
    pub fn next_frame(&mut self) -> std::result::Result<Option<&[u8]>, TransportError> {
        let pending = &self.buf[self.start..];
        if pending.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_le_bytes([pending[0], pending[1], pending[2], pending[3]]) as usize;
        if len > MAX_FRAME {
            return Err(TransportError::Oversized {
                size: len,
                limit: MAX_FRAME,
            });
        }
        if pending.len() < 4 + len {
            return Ok(None);
        }
        let begin = self.start + 4;
        let end = begin + len;
        self.start = end;
        Ok(Some(&self.buf[begin..end]))
    }
}
