//! Network transports
//!
//! One [`Transport`] trait over two protocols and two roles:
//!
//! | | Server | Client |
//! |---|---|---|
//! | TCP | accept one peer, reject extras | connect with bounded timeout |
//! | UDP | learn peer from its hello datagram | send hello until data arrives |
//!
//! `send` never blocks: packets go into a bounded queue drained by the
//! `net-io` thread, and a full queue is reported as back-pressure so the
//! caller can drop instead of stalling. Received data, connection events and
//! asynchronous failures are delivered through callbacks from the I/O
//! threads. `stop` joins every I/O thread and clears the callbacks, so
//! nothing fires after it returns.

pub mod tcp;
pub mod udp;

use crate::config::{Protocol, Role, StreamConfig};
use crate::core::stats::SessionStats;
use crate::error::{Result, TransportError};

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

pub use tcp::TcpTransport;
pub use udp::UdpTransport;

/// Called with every received packet (frame payload or datagram)
pub type ReceiveCallback = Box<dyn FnMut(&[u8]) + Send>;
/// Called once per asynchronous failure
pub type ErrorCallback = Box<dyn FnMut(TransportError) + Send>;
/// Called when a peer becomes known
pub type ConnectCallback = Box<dyn FnMut(SocketAddr) + Send>;

/// Encoded packet plus the samples it carries, for loss accounting
#[derive(Debug, Clone)]
pub struct OutboundPacket {
    pub bytes: Vec<u8>,
    /// Samples per channel
    pub samples: u64,
}

/// Immediate outcome of [`Transport::send`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Accepted; delivery happens on the I/O thread
    Queued,
    /// Outbound queue full; packet not taken
    Backpressure,
    /// No peer yet; packet not taken
    NotConnected,
}

/// Network endpoint abstraction
pub trait Transport: Send {
    /// Bind (server) or connect (client) and start the I/O threads
    fn start(&mut self) -> Result<()>;

    /// Queue a packet without blocking
    fn send(&self, packet: OutboundPacket) -> std::result::Result<SendStatus, TransportError>;

    fn on_receive(&mut self, callback: ReceiveCallback);

    fn on_error(&mut self, callback: ErrorCallback);

    fn on_connect(&mut self, callback: ConnectCallback);

    /// Deliver what is already queued, then join the I/O threads; no
    /// callback fires after this returns
    fn stop(&mut self);

    /// Like `stop`, but queued packets are dropped and counted as lost
    fn abort(&mut self) {
        self.stop();
    }

    /// A peer is known and data can flow
    fn is_connected(&self) -> bool;

    /// Bound local address once started
    fn local_addr(&self) -> Option<SocketAddr>;
}

/// Transport selection and tuning
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub role: Role,
    pub protocol: Protocol,
    /// Bind address (server) or peer address (client)
    pub addr: String,
    pub queue_depth: usize,
    pub connect_timeout: Duration,
}

impl TransportConfig {
    pub fn from_stream_config(config: &StreamConfig) -> Self {
        Self {
            role: config.network.role,
            protocol: config.protocol,
            addr: config.endpoint(),
            queue_depth: config.network.queue_depth,
            connect_timeout: config.connect_timeout(),
        }
    }
}

/// Create a transport based on configuration
pub fn create_transport(config: TransportConfig, stats: Arc<SessionStats>) -> Box<dyn Transport> {
    match config.protocol {
        Protocol::Tcp => Box::new(TcpTransport::new(config, stats)),
        Protocol::Udp => Box::new(UdpTransport::new(config, stats)),
    }
}

/// Callback slots shared with the I/O threads
#[derive(Default)]
pub(crate) struct Handlers {
    receive: Mutex<Option<ReceiveCallback>>,
    error: Mutex<Option<ErrorCallback>>,
    connect: Mutex<Option<ConnectCallback>>,
}

impl Handlers {
    pub(crate) fn received(&self, data: &[u8]) {
        if let Some(cb) = self.receive.lock().as_mut() {
            cb(data);
        }
    }

    pub(crate) fn failed(&self, error: TransportError) {
        log::error!("Transport error: {}", error);
        if let Some(cb) = self.error.lock().as_mut() {
            cb(error);
        }
    }

    pub(crate) fn connected(&self, peer: SocketAddr) {
        if let Some(cb) = self.connect.lock().as_mut() {
            cb(peer);
        }
    }

    fn clear(&self) {
        *self.receive.lock() = None;
        *self.error.lock() = None;
        *self.connect.lock() = None;
    }
}

/// State shared between a transport handle and its I/O threads
pub(crate) struct Link {
    tx: Sender<OutboundPacket>,
    pub(crate) rx: Receiver<OutboundPacket>,
    pub(crate) handlers: Handlers,
    pub(crate) shutdown: AtomicBool,
    aborting: AtomicBool,
    pub(crate) connected: AtomicBool,
    pub(crate) stats: Arc<SessionStats>,
}

impl Link {
    pub(crate) fn new(queue_depth: usize, stats: Arc<SessionStats>) -> Self {
        let (tx, rx) = bounded(queue_depth.max(1));
        Self {
            tx,
            rx,
            handlers: Handlers::default(),
            shutdown: AtomicBool::new(false),
            aborting: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            stats,
        }
    }

    #[inline]
    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub(crate) fn offer(
        &self,
        packet: OutboundPacket,
        limit: usize,
    ) -> std::result::Result<SendStatus, TransportError> {
        if self.is_shutdown() {
            return Err(TransportError::ConnectionLost("transport stopped".into()));
        }
        if packet.bytes.len() > limit {
            return Err(TransportError::Oversized {
                size: packet.bytes.len(),
                limit,
            });
        }
        if !self.is_connected() {
            return Ok(SendStatus::NotConnected);
        }
        match self.tx.try_send(packet) {
            Ok(()) => Ok(SendStatus::Queued),
            Err(TrySendError::Full(_)) => Ok(SendStatus::Backpressure),
            Err(TrySendError::Disconnected(_)) => {
                Err(TransportError::ConnectionLost("I/O thread gone".into()))
            }
        }
    }

    /// Count everything still queued as lost
    pub(crate) fn discard_queued(&self) {
        let mut dropped = 0u64;
        while let Ok(packet) = self.rx.try_recv() {
            self.stats.record_dropped_window(packet.samples);
            dropped += 1;
        }
        if dropped > 0 {
            log::warn!("Discarded {} queued packets", dropped);
        }
    }

    /// Mark the peer gone, report it once, and drop the backlog
    pub(crate) fn lose_peer(&self, error: TransportError) {
        let was_connected = self.connected.swap(false, Ordering::AcqRel);
        self.discard_queued();
        if was_connected && !self.is_shutdown() {
            self.handlers.failed(error);
        }
    }

    /// Report a failure that happened before any peer was attached
    pub(crate) fn fail(&self, error: TransportError) {
        if !self.is_shutdown() {
            self.handlers.failed(error);
        }
    }

    pub(crate) fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    /// Shut down without draining the outbound queue
    pub(crate) fn begin_abort(&self) {
        self.aborting.store(true, Ordering::Release);
        self.begin_shutdown();
    }

    #[inline]
    pub(crate) fn is_aborting(&self) -> bool {
        self.aborting.load(Ordering::Acquire)
    }

    /// Drain the backlog at shutdown: deliver it, or count it lost on abort
    pub(crate) fn drain_with(&self, mut deliver: impl FnMut(&OutboundPacket) -> bool) {
        if self.is_aborting() {
            self.discard_queued();
            return;
        }
        while let Ok(packet) = self.rx.try_recv() {
            if !deliver(&packet) {
                break;
            }
        }
    }

    pub(crate) fn finish_shutdown(&self) {
        self.connected.store(false, Ordering::Release);
        self.handlers.clear();
    }

    pub(crate) fn set_receive(&self, callback: ReceiveCallback) {
        *self.handlers.receive.lock() = Some(callback);
    }

    pub(crate) fn set_error(&self, callback: ErrorCallback) {
        *self.handlers.error.lock() = Some(callback);
    }

    pub(crate) fn set_connect(&self, callback: ConnectCallback) {
        *self.handlers.connect.lock() = Some(callback);
    }
}
