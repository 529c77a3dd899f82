//! The transport layer: versioned wire framing, the message set, the
//! sans-io socket state machine, the per-worker [`Sender`] owning all
//! sockets, priority flow control fed by the traffic shaper, and the tokio
//! glue that moves bytes between sockets and the OS.

pub mod compatibility;
pub mod envelope;
pub mod flow_group;
pub mod frame;
pub mod messages;
mod metrics;
pub mod protocol;
pub mod sender;
pub mod socket;
pub mod tcp;
pub mod throttle;
pub mod traffic_shaper;

pub use compatibility::{
    ProtocolVersion, CHECKSUM_SUPPORT, MAX_PROTOCOL_SUPPORTED, MIN_PROTOCOL_SUPPORTED,
};
pub use envelope::{Envelope, EnvelopeId, OnSent};
pub use flow_group::{BwAvailableCallback, FlowGroup, FlowGroupsUpdate, FlowMeter};
pub use frame::{ProtocolHeader, MAX_LEN};
pub use messages::{Address, Message, MessageType};
pub use sender::{ReceivedMessage, Sender, TransportOp};
pub use socket::{Socket, SocketType};
pub use tcp::{ConnectionHandle, Transport, TransportEvent};
pub use throttle::ConnectionThrottle;
pub use traffic_shaper::{ShapingConfig, TrafficShaper};
