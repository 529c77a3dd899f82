use crate::messages::Message;
use logd_primitives::{Priority, Status};
use std::time::Instant;

/// Identifies a registered message within its socket. Ids are assigned in
/// registration order and never reused.
pub type EnvelopeId = u64;

/// Completion callback of a message: called exactly once, either with Ok
/// when the serialized bytes were handed to the OS, or with the close
/// reason of the socket.
pub type OnSent = Box<dyn FnOnce(Status) + Send>;

/// A message registered with a socket, together with its accounting
/// state. Owned by the socket's queues until completion.
pub struct Envelope {
    pub id: EnvelopeId,
    pub msg: Message,
    /// Serialized size including the protocol header, computed at
    /// registration with the socket's current protocol expectation.
    pub cost: usize,
    pub priority: Priority,
    pub on_sent: Option<OnSent>,
    pub enqueue_time: Instant,
    /// Position in the socket's outgoing byte stream at which this
    /// message's bytes end; completion fires when the stream drains past
    /// it.
    pub drain_pos: u64,
}

impl Envelope {
    pub fn complete(mut self, status: Status) {
        if let Some(cb) = self.on_sent.take() {
            cb(status);
        }
    }
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Envelope")
            .field("id", &self.id)
            .field("type", &self.msg.message_type())
            .field("cost", &self.cost)
            .field("priority", &self.priority)
            .finish()
    }
}
