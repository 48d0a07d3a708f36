//! UDP transport
//!
//! One stream packet per datagram, no framing, no delivery guarantee.
//!
//! The server binds and waits for a client: the first datagram it receives
//! (normally the 4-byte hello `ACQH`) fixes the peer for the rest of the
//! session, and datagrams from any other address are ignored. The client
//! sends hello every 500 ms until the server starts talking.
//!
//! Send failures (full socket buffer, unreachable peer) drop the packet and
//! count its samples as lost; they never end the session.

use super::{
    ConnectCallback, ErrorCallback, Link, OutboundPacket, ReceiveCallback, SendStatus, Transport,
    TransportConfig,
};
use crate::config::Role;
use crate::core::stats::SessionStats;
use crate::error::{Error, Result, TransportError};
use crate::streaming::wire::MAX_DATAGRAM;

use crossbeam_channel::RecvTimeoutError;
use parking_lot::Mutex;
use std::io::ErrorKind;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Client greeting that registers it with the server
pub const HELLO: &[u8] = b"ACQH";

const HELLO_INTERVAL: Duration = Duration::from_millis(500);
const READ_POLL: Duration = Duration::from_millis(100);
const QUEUE_POLL: Duration = Duration::from_millis(50);
/// Socket buffer still full after this long: drop the datagram
const WRITE_TIMEOUT: Duration = Duration::from_millis(100);

/// Datagram transport, server or client role
pub struct UdpTransport {
    config: TransportConfig,
    link: Arc<Link>,
    peer: Arc<Mutex<Option<SocketAddr>>>,
    threads: Vec<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl UdpTransport {
    pub fn new(config: TransportConfig, stats: Arc<SessionStats>) -> Self {
        let link = Arc::new(Link::new(config.queue_depth, stats));
        Self {
            config,
            link,
            peer: Arc::new(Mutex::new(None)),
            threads: Vec::new(),
            local_addr: None,
        }
    }

    fn bind(&self) -> std::result::Result<UdpSocket, TransportError> {
        let failed = |reason: String| TransportError::ConnectFailed {
            addr: self.config.addr.clone(),
            reason,
        };
        match self.config.role {
            Role::Server => UdpSocket::bind(&self.config.addr).map_err(|e| failed(e.to_string())),
            Role::Client => {
                let server = self
                    .config
                    .addr
                    .to_socket_addrs()
                    .map_err(|e| failed(e.to_string()))?
                    .next()
                    .ok_or_else(|| failed("no addresses resolved".into()))?;
                let any: SocketAddr = if server.is_ipv4() {
                    ([0, 0, 0, 0], 0).into()
                } else {
                    ([0u16; 8], 0).into()
                };
                let socket = UdpSocket::bind(any).map_err(|e| failed(e.to_string()))?;
                *self.peer.lock() = Some(server);
                Ok(socket)
            }
        }
    }
}

impl Transport for UdpTransport {
    fn start(&mut self) -> Result<()> {
        if !self.threads.is_empty() {
            return Err(Error::InvalidState("transport already started"));
        }
        let socket = self.bind()?;
        socket.set_read_timeout(Some(READ_POLL))?;
        socket.set_write_timeout(Some(WRITE_TIMEOUT))?;
        self.local_addr = socket.local_addr().ok();
        let send_socket = socket.try_clone()?;

        let role = self.config.role;
        if role == Role::Client {
            self.link.connected.store(true, Ordering::Release);
            log::info!("UDP client streaming with {}", self.config.addr);
        } else if let Some(local) = self.local_addr {
            log::info!("UDP server bound to {}, waiting for a client", local);
        }

        let (link, peer) = (Arc::clone(&self.link), Arc::clone(&self.peer));
        let reader = thread::Builder::new()
            .name("net-reader".to_string())
            .spawn(move || reader_loop(socket, role, link, peer))
            .map_err(|e| Error::Other(format!("Failed to spawn net-reader thread: {}", e)))?;
        self.threads.push(reader);

        let (link, peer) = (Arc::clone(&self.link), Arc::clone(&self.peer));
        let sender = thread::Builder::new()
            .name("net-io".to_string())
            .spawn(move || sender_loop(send_socket, link, peer))
            .map_err(|e| Error::Other(format!("Failed to spawn net-io thread: {}", e)))?;
        self.threads.push(sender);
        Ok(())
    }

    fn send(&self, packet: OutboundPacket) -> std::result::Result<SendStatus, TransportError> {
        self.link.offer(packet, MAX_DATAGRAM)
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
        let running = !self.threads.is_empty();
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                log::error!("UDP I/O thread panicked");
            }
        }
        if running {
            log::info!("UDP transport stopped");
        }
        self.link.finish_shutdown();
    }

    fn abort(&mut self) {
        self.link.begin_abort();
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

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

fn reader_loop(
    socket: UdpSocket,
    role: Role,
    link: Arc<Link>,
    peer: Arc<Mutex<Option<SocketAddr>>>,
) {
    let mut buf = vec![0u8; 65_536];
    let mut last_hello: Option<Instant> = None;
    let mut heard_from_server = false;
    let mut ignored = 0u64;

    while !link.is_shutdown() {
        if role == Role::Client && !heard_from_server {
            let due = last_hello.is_none_or(|t| t.elapsed() >= HELLO_INTERVAL);
            let server = *peer.lock();
            if let (true, Some(server)) = (due, server) {
                if let Err(e) = socket.send_to(HELLO, server) {
                    log::debug!("Hello to {} failed: {}", server, e);
                }
                last_hello = Some(Instant::now());
            }
        }

        let (n, from) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(ref e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                continue;
            }
            Err(e) => {
                log::warn!("UDP receive error: {}", e);
                continue;
            }
        };
        let data = &buf[..n];

        match role {
            Role::Server => {
                let known = *peer.lock();
                match known {
                    Some(p) if p == from => {}
                    Some(p) => {
                        ignored += 1;
                        if ignored % 100 == 1 {
                            log::warn!("Ignoring datagram from {} (streaming to {})", from, p);
                        }
                        continue;
                    }
                    None => {
                        *peer.lock() = Some(from);
                        link.connected.store(true, Ordering::Release);
                        log::info!("UDP client registered: {}", from);
                        link.handlers.connected(from);
                    }
                }
            }
            Role::Client => {
                if !heard_from_server {
                    log::info!("Receiving from {}", from);
                    heard_from_server = true;
                }
            }
        }

        if data != HELLO {
            link.handlers.received(data);
        }
    }
}

fn sender_loop(socket: UdpSocket, link: Arc<Link>, peer: Arc<Mutex<Option<SocketAddr>>>) {
    let mut failures = 0u64;

    while !link.is_shutdown() {
        match link.rx.recv_timeout(QUEUE_POLL) {
            Ok(packet) => send_packet(&socket, &packet, &link, &peer, &mut failures),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    link.drain_with(|packet| {
        send_packet(&socket, packet, &link, &peer, &mut failures);
        true
    });
    if failures > 0 {
        log::warn!("{} datagrams could not be sent", failures);
    }
}

fn send_packet(
    socket: &UdpSocket,
    packet: &OutboundPacket,
    link: &Link,
    peer: &Mutex<Option<SocketAddr>>,
    failures: &mut u64,
) {
    let Some(dest) = *peer.lock() else {
        link.stats.record_dropped_window(packet.samples);
        return;
    };
    match socket.send_to(&packet.bytes, dest) {
        Ok(n) => link.stats.record_delivered(n as u64),
        Err(e) => {
            link.stats.record_dropped_window(packet.samples);
            *failures += 1;
            if *failures % 100 == 1 {
                log::debug!("Datagram to {} dropped: {}", dest, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Protocol;

    fn config(role: Role, addr: String) -> TransportConfig {
        TransportConfig {
            role,
            protocol: Protocol::Udp,
            addr,
            queue_depth: 64,
            connect_timeout: Duration::from_secs(1),
        }
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_server_learns_peer_from_hello() {
        let mut server = UdpTransport::new(
            config(Role::Server, "127.0.0.1:0".to_string()),
            Arc::new(SessionStats::new()),
        );
        server.start().unwrap();
        assert!(!server.is_connected());
        let packet = OutboundPacket {
            bytes: vec![1; 8],
            samples: 4,
        };
        assert_eq!(server.send(packet).unwrap(), SendStatus::NotConnected);

        let addr = server.local_addr().unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        let mut client = UdpTransport::new(
            config(Role::Client, addr.to_string()),
            Arc::new(SessionStats::new()),
        );
        client.on_receive(Box::new(move |d| sink.lock().push(d.to_vec())));
        client.start().unwrap();

        assert!(wait_until(|| server.is_connected()));
        let packet = OutboundPacket {
            bytes: vec![7; 32],
            samples: 16,
        };
        assert_eq!(server.send(packet).unwrap(), SendStatus::Queued);
        assert!(wait_until(|| !received.lock().is_empty()));
        assert_eq!(received.lock()[0], vec![7; 32]);

        client.stop();
        server.stop();
    }

    #[test]
    fn test_oversized_datagram_rejected() {
        let server = UdpTransport::new(
            config(Role::Server, "127.0.0.1:0".to_string()),
            Arc::new(SessionStats::new()),
        );
        let packet = OutboundPacket {
            bytes: vec![0; MAX_DATAGRAM + 1],
            samples: 1,
        };
        assert!(matches!(
            server.send(packet),
            Err(TransportError::Oversized { .. })
        ));
    }
}
