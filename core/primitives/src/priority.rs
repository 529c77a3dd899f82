/// Priority of a message in the flow-control machinery. Lower discriminant
/// means more important. One flow meter exists per priority in every
/// FlowGroup.
#[derive(
    Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, strum::IntoStaticStr, strum::EnumIter,
)]
#[repr(u8)]
pub enum Priority {
    Max = 0,
    ClientHigh = 1,
    ClientNormal = 2,
    ClientLow = 3,
    Background = 4,
    Idle = 5,
}

impl Priority {
    pub const NUM: usize = 6;

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(i: usize) -> Option<Priority> {
        use Priority::*;
        [Max, ClientHigh, ClientNormal, ClientLow, Background, Idle].get(i).copied()
    }
}

/// Class of traffic a message belongs to. Used for accounting and for
/// picking the flow-control priority.
#[derive(
    Copy, Clone, PartialEq, Eq, Hash, Debug, strum::IntoStaticStr, strum::EnumIter,
)]
pub enum TrafficClass {
    /// HELLO/ACK and connection maintenance. Never throttled.
    Handshake,
    /// Epoch recovery (SEALED, CLEAN, GET_EPOCH_RECOVERY_METADATA).
    Recovery,
    /// Appends and their STOREs.
    Append,
    /// Reads close to the tail.
    ReadTail,
    /// Backlog reads.
    ReadBacklog,
    /// Re-replication traffic generated by rebuilding.
    Rebuild,
    /// Trim requests and replies.
    Trim,
    /// Failure detector gossip.
    FailureDetector,
    /// Config synchronization and other low-volume control traffic.
    Info,
}

impl TrafficClass {
    pub fn priority(self) -> Priority {
        match self {
            TrafficClass::Handshake => Priority::Max,
            TrafficClass::Recovery => Priority::Max,
            TrafficClass::FailureDetector => Priority::Max,
            TrafficClass::Append => Priority::ClientHigh,
            TrafficClass::ReadTail => Priority::ClientNormal,
            TrafficClass::Trim => Priority::ClientNormal,
            TrafficClass::Info => Priority::ClientLow,
            TrafficClass::ReadBacklog => Priority::Background,
            TrafficClass::Rebuild => Priority::Background,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn priority_indexing() {
        for (i, p) in Priority::iter().enumerate() {
            assert_eq!(p.index(), i);
            assert_eq!(Priority::from_index(i), Some(p));
        }
        assert_eq!(Priority::from_index(Priority::NUM), None);
    }

    #[test]
    fn handshake_is_never_throttled_below_max() {
        assert_eq!(TrafficClass::Handshake.priority(), Priority::Max);
    }
}
