//! Priority flow control. Each worker has one [`FlowGroup`] per
//! NodeLocationScope; each group has one token-bucket [`FlowMeter`] per
//! priority. Messages either drain a meter immediately or wait on the
//! group's per-priority FIFO until the traffic shaper deposits budget.

use crate::envelope::Envelope;
use crate::messages::Address;
use logd_primitives::{NodeLocationScope, Priority, Status};
use std::collections::VecDeque;
use std::time::Instant;

/// Called once bandwidth is available at the callback's priority, or with
/// the close/cancel reason.
pub struct BwAvailableCallback {
    pub peer: Address,
    pub callback: Box<dyn FnOnce(Result<(), Status>) + Send>,
}

/// Token bucket for one priority. The level may go negative: a message is
/// admitted whenever the level is positive, whatever its cost, which
/// keeps oversized messages from stalling forever behind a small bucket.
#[derive(Debug)]
pub struct FlowMeter {
    level: i64,
    capacity: i64,
}

impl FlowMeter {
    /// An unconfigured meter passes everything.
    pub fn unlimited() -> FlowMeter {
        FlowMeter { level: i64::MAX / 2, capacity: i64::MAX / 2 }
    }

    pub fn can_drain(&self) -> bool {
        self.level > 0
    }

    pub fn drain(&mut self, cost: usize) -> bool {
        if self.level <= 0 {
            return false;
        }
        self.level -= cost as i64;
        true
    }

    /// Deposits budget, clamping at the burst capacity. Returns the
    /// overflow that did not fit.
    pub fn fill(&mut self, amount: i64, capacity: i64) -> i64 {
        self.capacity = capacity;
        self.level = self.level.saturating_add(amount);
        let overflow = (self.level - self.capacity).max(0);
        self.level = self.level.min(self.capacity);
        overflow
    }

    pub fn level(&self) -> i64 {
        self.level
    }
}

enum Deferred {
    /// A message admitted into the socket but awaiting bandwidth. The
    /// envelope is owned by its socket's pending queue; only its identity
    /// travels through the flow group.
    Msg { peer: Address, envelope_id: u64, cost: usize },
    Callback(BwAvailableCallback),
}

/// What the group tells the Sender to do after a run.
pub enum FlowAction {
    Release { peer: Address, envelope_id: u64 },
    Notify(BwAvailableCallback),
}

/// Budget deposited per scope and priority by one traffic shaper tick.
#[derive(Clone, Debug, Default)]
pub struct FlowGroupsUpdate {
    /// `[scope][priority] -> (deposit, burst capacity)`.
    pub entries: Vec<[(i64, i64); Priority::NUM]>,
}

impl FlowGroupsUpdate {
    pub fn unlimited() -> FlowGroupsUpdate {
        FlowGroupsUpdate { entries: Vec::new() }
    }
}

pub struct FlowGroup {
    scope: NodeLocationScope,
    /// Disabled groups pass everything through untouched.
    enabled: bool,
    meters: [FlowMeter; Priority::NUM],
    queues: [VecDeque<Deferred>; Priority::NUM],
}

impl FlowGroup {
    pub fn new(scope: NodeLocationScope) -> FlowGroup {
        FlowGroup {
            scope,
            enabled: false,
            meters: std::array::from_fn(|_| FlowMeter::unlimited()),
            queues: std::array::from_fn(|_| VecDeque::new()),
        }
    }

    pub fn scope(&self) -> NodeLocationScope {
        self.scope
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            for meter in &mut self.meters {
                *meter = FlowMeter::unlimited();
            }
        }
    }

    pub fn can_drain(&self, priority: Priority) -> bool {
        !self.enabled || self.meters[priority.index()].can_drain()
    }

    /// Attempts to charge the envelope's cost. Queued traffic at the same
    /// priority keeps FIFO order: a newcomer may not jump over it.
    pub fn drain(&mut self, envelope: &Envelope) -> bool {
        if !self.enabled {
            return true;
        }
        if !self.queues[envelope.priority.index()].is_empty() {
            return false;
        }
        self.meters[envelope.priority.index()].drain(envelope.cost)
    }

    pub fn push(&mut self, peer: Address, envelope: &Envelope) {
        self.queues[envelope.priority.index()].push_back(Deferred::Msg {
            peer,
            envelope_id: envelope.id,
            cost: envelope.cost,
        });
    }

    pub fn push_callback(&mut self, cb: BwAvailableCallback, priority: Priority) {
        self.queues[priority.index()].push_back(Deferred::Callback(cb));
    }

    pub fn has_pending_work(&self) -> bool {
        self.queues.iter().any(|q| !q.is_empty())
    }

    /// Applies one shaper deposit. Returns true when queued work may now
    /// be drainable.
    pub fn apply_update(&mut self, entry: &[(i64, i64); Priority::NUM]) -> bool {
        for (meter, (deposit, capacity)) in self.meters.iter_mut().zip(entry.iter()) {
            meter.fill(*deposit, *capacity);
        }
        self.has_pending_work()
    }

    /// Drains queued entries while budget lasts, highest priority first,
    /// FIFO within each priority. Yields once `deadline` passes; the
    /// caller reschedules. Returns (actions, exceeded_deadline).
    pub fn run(&mut self, deadline: Instant) -> (Vec<FlowAction>, bool) {
        let mut actions = Vec::new();
        for pri in 0..Priority::NUM {
            loop {
                if Instant::now() >= deadline {
                    return (actions, true);
                }
                if self.queues[pri].is_empty() {
                    break;
                }
                if self.enabled && !self.meters[pri].can_drain() {
                    break;
                }
                match self.queues[pri].pop_front().unwrap() {
                    Deferred::Msg { peer, envelope_id, cost } => {
                        self.meters[pri].drain(cost);
                        actions.push(FlowAction::Release { peer, envelope_id });
                    }
                    Deferred::Callback(cb) => {
                        actions.push(FlowAction::Notify(cb));
                    }
                }
            }
        }
        (actions, false)
    }

    /// Drops every queued entry belonging to `peer`, cancelling callbacks
    /// with the given reason. Envelope entries are simply forgotten; the
    /// socket completes the envelopes itself on close.
    pub fn cancel_peer(&mut self, peer: Address, reason: Status) {
        for queue in &mut self.queues {
            let mut kept = VecDeque::with_capacity(queue.len());
            while let Some(entry) = queue.pop_front() {
                match entry {
                    Deferred::Msg { peer: p, .. } if p == peer => {}
                    Deferred::Callback(cb) if cb.peer == peer => {
                        (cb.callback)(Err(reason));
                    }
                    other => kept.push_back(other),
                }
            }
            *queue = kept;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{ConfigAdvisoryMessage, Message};
    use logd_primitives::ClientId;
    use std::time::Duration;

    fn envelope(id: u64, priority: Priority, cost: usize) -> Envelope {
        Envelope {
            id,
            msg: Message::ConfigAdvisory(ConfigAdvisoryMessage { config_version: 0 }),
            cost,
            priority,
            on_sent: None,
            enqueue_time: Instant::now(),
            drain_pos: 0,
        }
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[test]
    fn disabled_group_passes_everything() {
        let mut group = FlowGroup::new(NodeLocationScope::Root);
        let e = envelope(1, Priority::Background, 1 << 30);
        assert!(group.drain(&e));
    }

    #[test]
    fn fifo_order_within_priority() {
        let mut group = FlowGroup::new(NodeLocationScope::Root);
        group.set_enabled(true);
        let entry = std::array::from_fn(|_| (0i64, 1000i64));
        group.apply_update(&entry); // drains budget to zero capacity 1000

        let peer = Address::Client(ClientId(1));
        for id in 1..=3 {
            let e = envelope(id, Priority::ClientNormal, 10);
            assert!(!group.drain(&e));
            group.push(peer, &e);
        }

        // Deposit enough for everything and run.
        let entry = std::array::from_fn(|_| (1000i64, 1000i64));
        assert!(group.apply_update(&entry));
        let (actions, exceeded) = group.run(far_deadline());
        assert!(!exceeded);
        let ids: Vec<u64> = actions
            .iter()
            .map(|a| match a {
                FlowAction::Release { envelope_id, .. } => *envelope_id,
                FlowAction::Notify(_) => panic!("no callbacks queued"),
            })
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn newcomer_cannot_jump_queue() {
        let mut group = FlowGroup::new(NodeLocationScope::Root);
        group.set_enabled(true);
        let entry = std::array::from_fn(|_| (0i64, 1000i64));
        group.apply_update(&entry);

        let peer = Address::Client(ClientId(1));
        let first = envelope(1, Priority::ClientNormal, 10);
        assert!(!group.drain(&first));
        group.push(peer, &first);

        // Budget arrives, but an envelope that never queued must still
        // wait behind the queued one.
        let entry = std::array::from_fn(|_| (1000i64, 1000i64));
        group.apply_update(&entry);
        let second = envelope(2, Priority::ClientNormal, 10);
        assert!(!group.drain(&second));
    }

    #[test]
    fn higher_priorities_run_first() {
        let mut group = FlowGroup::new(NodeLocationScope::Root);
        group.set_enabled(true);
        let entry = std::array::from_fn(|_| (0i64, 1000i64));
        group.apply_update(&entry);

        let peer = Address::Client(ClientId(1));
        let low = envelope(1, Priority::Background, 10);
        let high = envelope(2, Priority::Max, 10);
        group.push(peer, &low);
        group.push(peer, &high);

        let entry = std::array::from_fn(|_| (1000i64, 1000i64));
        group.apply_update(&entry);
        let (actions, _) = group.run(far_deadline());
        let ids: Vec<u64> = actions
            .iter()
            .filter_map(|a| match a {
                FlowAction::Release { envelope_id, .. } => Some(*envelope_id),
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec![2, 1]);
    }

    #[test]
    fn cancel_peer_drops_entries_and_fails_callbacks() {
        let mut group = FlowGroup::new(NodeLocationScope::Root);
        group.set_enabled(true);
        let entry = std::array::from_fn(|_| (0i64, 1000i64));
        group.apply_update(&entry);

        let victim = Address::Client(ClientId(1));
        let survivor = Address::Client(ClientId(2));
        let e1 = envelope(1, Priority::ClientNormal, 10);
        let e2 = envelope(2, Priority::ClientNormal, 10);
        group.push(victim, &e1);
        group.push(survivor, &e2);
        let cancelled = std::sync::Arc::new(std::sync::Mutex::new(None));
        let c2 = cancelled.clone();
        group.push_callback(
            BwAvailableCallback {
                peer: victim,
                callback: Box::new(move |r| *c2.lock().unwrap() = Some(r)),
            },
            Priority::ClientNormal,
        );

        group.cancel_peer(victim, Status::PeerClosed);
        assert_eq!(*cancelled.lock().unwrap(), Some(Err(Status::PeerClosed)));

        let entry = std::array::from_fn(|_| (1000i64, 1000i64));
        group.apply_update(&entry);
        let (actions, _) = group.run(far_deadline());
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            FlowAction::Release { peer, envelope_id } => {
                assert_eq!(*peer, survivor);
                assert_eq!(*envelope_id, 2);
            }
            _ => panic!("expected a release"),
        }
    }
}
