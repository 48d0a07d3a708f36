//! Packetization, transports, and sink management

pub mod manager;
pub mod receiver;
pub mod transport;
pub mod wire;

pub use manager::{ManagerState, StreamingManager, SubmitOutcome};
pub use receiver::{PacketReceiver, ReceiverStats};
pub use transport::{Transport, TransportConfig, create_transport};
