/// Status code carried on every fallible call. Passed by value through
/// return types and completion callbacks; never stored in a thread local.
///
/// Statuses that cross the wire (STORED, APPENDED, TRIMMED, SHUTDOWN) are
/// serialized as their `u8` discriminant, so variants must not be reordered.
#[derive(
    Copy,
    Clone,
    PartialEq,
    Eq,
    Hash,
    Debug,
    thiserror::Error,
    strum::IntoStaticStr,
    strum::FromRepr,
    strum::EnumIter,
)]
#[repr(u8)]
pub enum Status {
    #[error("OK")]
    Ok = 0,

    // Transient failures. The operation may succeed if retried.
    #[error("operation would need to block or failed transiently, try again")]
    Again = 1,
    #[error("timed out")]
    Timedout = 2,
    #[error("connection attempt failed")]
    Connfailed = 3,
    #[error("not connected")]
    Notconn = 4,
    #[error("out of buffer space")]
    Nobufs = 5,
    #[error("callback registered, bandwidth will be granted later")]
    Cbregistered = 6,
    #[error("resource is disabled")]
    Disabled = 7,
    #[error("peer closed the connection")]
    PeerClosed = 8,
    #[error("sequencer append window is full")]
    Seqnobufs = 9,
    #[error("no sequencer for log")]
    Nosequencer = 10,

    // Permanent failures.
    #[error("internal error")]
    Internal = 16,
    #[error("argument or message too big")]
    Toobig = 17,
    #[error("invalid message format")]
    Badmsg = 18,
    #[error("malformed record")]
    MalformedRecord = 19,
    #[error("data corruption detected")]
    Corruption = 20,
    #[error("operation failed")]
    Failed = 21,

    // Logical outcomes.
    #[error("object already exists")]
    Exists = 32,
    #[error("not found")]
    Notfound = 33,
    #[error("not in config")]
    Notinconfig = 34,
    #[error("already done")]
    Already = 35,
    #[error("state is already up to date")]
    Uptodate = 36,
    #[error("aborted")]
    Aborted = 37,
    #[error("peer protocol version too old")]
    Protonosupport = 38,
    #[error("protocol error")]
    Proto = 39,
    #[error("permission denied")]
    Access = 40,
    #[error("message reached a node it was not destined for")]
    DestinationMismatch = 41,
    #[error("peer belongs to another cluster")]
    InvalidCluster = 42,
    #[error("checksum verification failed")]
    ChecksumMismatch = 43,
    #[error("invalid parameter")]
    InvalidParam = 44,
    #[error("object is empty")]
    Empty = 45,
    #[error("object is not empty")]
    Notempty = 46,
    #[error("activation is in progress")]
    Inprogress = 47,
    #[error("operation was preempted by a newer epoch")]
    Preempted = 48,
    #[error("not a storage node")]
    Notstorage = 49,
    #[error("operation is not supported by this peer")]
    Notsupported = 50,
    #[error("peer is unreachable")]
    Unreachable = 51,
    #[error("operation was cancelled")]
    Cancelled = 52,

    // Operational conditions.
    #[error("shutting down")]
    Shutdown = 64,
    #[error("no space left on storage device")]
    Nospc = 65,
    #[error("storage device is low on space")]
    LowOnSpc = 66,
    #[error("peer requires an encrypted connection")]
    Sslrequired = 67,
    #[error("system limit reached")]
    Syslimit = 68,
}

impl Status {
    pub fn name(self) -> &'static str {
        self.into()
    }

    /// Whether retrying the same operation later can reasonably succeed.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Status::Again
                | Status::Timedout
                | Status::Connfailed
                | Status::Notconn
                | Status::Nobufs
                | Status::Cbregistered
                | Status::Disabled
                | Status::PeerClosed
                | Status::Seqnobufs
        )
    }

    pub fn is_permanent(self) -> bool {
        matches!(
            self,
            Status::Internal
                | Status::Toobig
                | Status::Badmsg
                | Status::MalformedRecord
                | Status::Corruption
        )
    }

    /// Statuses that existing clients cannot interpret are downgraded before
    /// hitting the wire.
    pub fn to_wire(self) -> Status {
        match self {
            Status::ChecksumMismatch => Status::Badmsg,
            other => other,
        }
    }

    pub fn from_wire(v: u8) -> Option<Status> {
        Status::from_repr(v)
    }
}
