//! Backpressure-aware send queue
//!
//! One [`BackpressureQueue`] serves each outbound direction (tasks to shards,
//! replies to clients). A send first tries a non-blocking write. When the
//! target's transport refuses because its buffer is full, the gate closes and
//! the frame is parked; while the gate is closed every later frame is parked
//! behind it without a write attempt. A drain signal flushes the parked frames
//! in FIFO order and reopens the gate only once the queue is empty.
//!
//! With [`GatePolicy::Shared`] the whole direction shares one gate, so a single
//! slow connection holds back every other connection in that direction until
//! it drains. [`GatePolicy::PerConnection`] keeps a gate per target instead.

use crate::config::GatePolicy;
use log::debug;
use shared::ConnId;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use tokio::sync::mpsc::error::TrySendError;
use tokio_tungstenite::tungstenite::Message;

/// A connection the queue can attempt non-blocking writes on
pub trait Outbound {
    fn target(&self) -> &ConnId;
    fn try_send(&self, frame: Message) -> Result<(), TrySendError<Message>>;
}

impl<T: Outbound + ?Sized> Outbound for &T {
    fn target(&self) -> &ConnId {
        (**self).target()
    }

    fn try_send(&self, frame: Message) -> Result<(), TrySendError<Message>> {
        (**self).try_send(frame)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    ToShards,
    ToClients,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ToShards => f.write_str("shard-bound"),
            Direction::ToClients => f.write_str("client-bound"),
        }
    }
}

/// What happened to a frame handed to [`BackpressureQueue::try_send`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The transport accepted it
    Sent,
    /// Parked until the next drain
    Buffered,
    /// The target connection is gone
    Dropped,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub sent: usize,
    pub dropped: usize,
    pub remaining: usize,
}

#[derive(Debug)]
struct Pending {
    target: ConnId,
    frame: Message,
}

#[derive(Debug, Default)]
struct Lane {
    gate_closed: bool,
    pending: VecDeque<Pending>,
}

impl Lane {
    fn park(&mut self, target: ConnId, frame: Message) {
        self.pending.push_back(Pending { target, frame });
    }

    fn flush<H, F>(&mut self, resolve: F) -> FlushReport
    where
        H: Outbound,
        F: Fn(&ConnId) -> Option<H>,
    {
        let mut report = FlushReport::default();

        while let Some(entry) = self.pending.pop_front() {
            let Some(handle) = resolve(&entry.target) else {
                report.dropped += 1;
                continue;
            };
            match handle.try_send(entry.frame) {
                Ok(()) => report.sent += 1,
                Err(TrySendError::Full(frame)) => {
                    // Same instance goes back to the head; order is untouched.
                    self.pending.push_front(Pending {
                        target: entry.target,
                        frame,
                    });
                    break;
                }
                Err(TrySendError::Closed(_)) => report.dropped += 1,
            }
        }

        report.remaining = self.pending.len();
        self.gate_closed = !self.pending.is_empty();
        report
    }
}

pub struct BackpressureQueue {
    direction: Direction,
    policy: GatePolicy,
    shared: Lane,
    lanes: HashMap<ConnId, Lane>,
}

impl BackpressureQueue {
    pub fn new(direction: Direction, policy: GatePolicy) -> Self {
        Self {
            direction,
            policy,
            shared: Lane::default(),
            lanes: HashMap::new(),
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    fn lane_mut(&mut self, target: &ConnId) -> &mut Lane {
        match self.policy {
            GatePolicy::Shared => &mut self.shared,
            GatePolicy::PerConnection => self.lanes.entry(target.clone()).or_default(),
        }
    }

    fn lane(&self, target: &ConnId) -> Option<&Lane> {
        match self.policy {
            GatePolicy::Shared => Some(&self.shared),
            GatePolicy::PerConnection => self.lanes.get(target),
        }
    }

    /// Sends `frame` to `to` now if the gate allows and the transport has
    /// room, otherwise parks it behind whatever is already waiting
    pub fn try_send<H: Outbound>(&mut self, to: &H, frame: Message) -> Delivery {
        let target = to.target().clone();

        if !self.is_open_for(&target) {
            let lane = self.lane_mut(&target);
            lane.park(target, frame);
            return Delivery::Buffered;
        }

        match to.try_send(frame) {
            Ok(()) => Delivery::Sent,
            Err(TrySendError::Full(frame)) => {
                debug!(
                    "{} gate closed: {} is not accepting writes",
                    self.direction, target
                );
                let lane = self.lane_mut(&target);
                lane.gate_closed = true;
                lane.park(target, frame);
                Delivery::Buffered
            }
            Err(TrySendError::Closed(_)) => Delivery::Dropped,
        }
    }

    /// Handles a drain signal from connection `from`
    pub fn on_drain<H, F>(&mut self, from: &ConnId, resolve: F) -> FlushReport
    where
        H: Outbound,
        F: Fn(&ConnId) -> Option<H>,
    {
        let report = match self.policy {
            GatePolicy::Shared => self.shared.flush(resolve),
            GatePolicy::PerConnection => match self.lanes.get_mut(from) {
                Some(lane) => {
                    let report = lane.flush(resolve);
                    if report.remaining == 0 {
                        self.lanes.remove(from);
                    }
                    report
                }
                None => FlushReport::default(),
            },
        };

        if report.sent > 0 || report.dropped > 0 {
            debug!(
                "{} flush after drain from {}: {} sent, {} dropped, {} waiting",
                self.direction, from, report.sent, report.dropped, report.remaining
            );
        }
        report
    }

    /// Discards frames parked for a closed connection. Under a shared gate the
    /// rest of the queue is flushed as well, since the departed connection
    /// will never send the drain that would have reopened it.
    pub fn on_close<H, F>(&mut self, closed: &ConnId, resolve: F) -> FlushReport
    where
        H: Outbound,
        F: Fn(&ConnId) -> Option<H>,
    {
        match self.policy {
            GatePolicy::Shared => {
                let before = self.shared.pending.len();
                self.shared.pending.retain(|entry| &entry.target != closed);
                let discarded = before - self.shared.pending.len();

                let mut report = if self.shared.gate_closed {
                    self.shared.flush(resolve)
                } else {
                    FlushReport::default()
                };
                report.dropped += discarded;
                report
            }
            GatePolicy::PerConnection => {
                let dropped = self.lanes.remove(closed).map_or(0, |lane| lane.pending.len());
                FlushReport {
                    dropped,
                    ..FlushReport::default()
                }
            }
        }
    }

    /// Whether a new frame for `target` would be attempted directly
    pub fn is_open_for(&self, target: &ConnId) -> bool {
        self.lane(target).map_or(true, |lane| !lane.gate_closed)
    }

    pub fn pending_len(&self) -> usize {
        self.shared.pending.len() + self.lanes.values().map(|l| l.pending.len()).sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};

    /// Transport with a fixed amount of room that records what it accepted
    struct FakeSocket {
        id: ConnId,
        room: Cell<usize>,
        closed: Cell<bool>,
        attempts: Cell<usize>,
        written: RefCell<Vec<String>>,
    }

    impl FakeSocket {
        fn new(id: &str, room: usize) -> Self {
            Self {
                id: ConnId::from(id),
                room: Cell::new(room),
                closed: Cell::new(false),
                attempts: Cell::new(0),
                written: RefCell::new(Vec::new()),
            }
        }

        fn written(&self) -> Vec<String> {
            self.written.borrow().clone()
        }
    }

    impl Outbound for FakeSocket {
        fn target(&self) -> &ConnId {
            &self.id
        }

        fn try_send(&self, frame: Message) -> Result<(), TrySendError<Message>> {
            self.attempts.set(self.attempts.get() + 1);
            if self.closed.get() {
                return Err(TrySendError::Closed(frame));
            }
            if self.room.get() == 0 {
                return Err(TrySendError::Full(frame));
            }
            self.room.set(self.room.get() - 1);
            self.written
                .borrow_mut()
                .push(frame.into_text().unwrap_or_default().to_string());
            Ok(())
        }
    }

    fn frame(text: &str) -> Message {
        Message::text(text)
    }

    fn resolver<'a>(sockets: &'a [&'a FakeSocket]) -> impl Fn(&ConnId) -> Option<&'a FakeSocket> {
        move |id| sockets.iter().copied().find(|s| &s.id == id)
    }

    #[test]
    fn test_open_gate_sends_directly() {
        let mut queue = BackpressureQueue::new(Direction::ToShards, GatePolicy::Shared);
        let socket = FakeSocket::new("s1", 4);

        assert_eq!(queue.try_send(&socket, frame("a")), Delivery::Sent);
        assert_eq!(queue.try_send(&socket, frame("b")), Delivery::Sent);
        assert_eq!(socket.written(), vec!["a", "b"]);
        assert_eq!(queue.pending_len(), 0);
        assert!(queue.is_open_for(&socket.id));
    }

    #[test]
    fn test_full_transport_closes_gate() {
        let mut queue = BackpressureQueue::new(Direction::ToShards, GatePolicy::Shared);
        let socket = FakeSocket::new("s1", 1);

        assert_eq!(queue.try_send(&socket, frame("a")), Delivery::Sent);
        assert_eq!(queue.try_send(&socket, frame("b")), Delivery::Buffered);
        assert!(!queue.is_open_for(&socket.id));

        // Gate closed: no further write attempts
        let attempts = socket.attempts.get();
        socket.room.set(10);
        assert_eq!(queue.try_send(&socket, frame("c")), Delivery::Buffered);
        assert_eq!(socket.attempts.get(), attempts);
        assert_eq!(queue.pending_len(), 2);
    }

    #[test]
    fn test_drain_flushes_in_enqueue_order() {
        let mut queue = BackpressureQueue::new(Direction::ToClients, GatePolicy::Shared);
        let socket = FakeSocket::new("c1", 0);

        for text in ["1", "2", "3", "4", "5"] {
            assert_eq!(queue.try_send(&socket, frame(text)), Delivery::Buffered);
        }

        socket.room.set(100);
        let sockets = [&socket];
        let report = queue.on_drain(&socket.id, resolver(&sockets));

        assert_eq!(
            report,
            FlushReport {
                sent: 5,
                dropped: 0,
                remaining: 0
            }
        );
        assert_eq!(socket.written(), vec!["1", "2", "3", "4", "5"]);
        assert!(queue.is_open_for(&socket.id));

        assert_eq!(queue.try_send(&socket, frame("6")), Delivery::Sent);
    }

    #[test]
    fn test_partial_flush_keeps_order_without_duplicates() {
        let mut queue = BackpressureQueue::new(Direction::ToClients, GatePolicy::Shared);
        let socket = FakeSocket::new("c1", 0);
        let sockets = [&socket];

        for text in ["1", "2", "3", "4"] {
            queue.try_send(&socket, frame(text));
        }

        socket.room.set(2);
        let report = queue.on_drain(&socket.id, resolver(&sockets));
        assert_eq!(report.sent, 2);
        assert_eq!(report.remaining, 2);
        assert!(!queue.is_open_for(&socket.id));

        queue.try_send(&socket, frame("5"));

        socket.room.set(10);
        queue.on_drain(&socket.id, resolver(&sockets));
        assert_eq!(socket.written(), vec!["1", "2", "3", "4", "5"]);
        assert_eq!(queue.pending_len(), 0);
    }

    #[test]
    fn test_shared_gate_blocks_other_connections() {
        let mut queue = BackpressureQueue::new(Direction::ToClients, GatePolicy::Shared);
        let slow = FakeSocket::new("slow", 0);
        let fast = FakeSocket::new("fast", 100);
        let sockets = [&slow, &fast];

        assert_eq!(queue.try_send(&slow, frame("s1")), Delivery::Buffered);
        // Head-of-line blocking: fast has room but waits behind slow
        assert_eq!(queue.try_send(&fast, frame("f1")), Delivery::Buffered);
        assert!(fast.written().is_empty());

        // Slow still full: the flush stops at its frame and fast keeps waiting
        let report = queue.on_drain(&slow.id, resolver(&sockets));
        assert_eq!(report.sent, 0);
        assert!(fast.written().is_empty());

        slow.room.set(1);
        let report = queue.on_drain(&slow.id, resolver(&sockets));
        assert_eq!(report.sent, 2);
        assert_eq!(slow.written(), vec!["s1"]);
        assert_eq!(fast.written(), vec!["f1"]);
    }

    #[test]
    fn test_per_connection_gate_isolates_connections() {
        let mut queue = BackpressureQueue::new(Direction::ToClients, GatePolicy::PerConnection);
        let slow = FakeSocket::new("slow", 0);
        let fast = FakeSocket::new("fast", 100);
        let sockets = [&slow, &fast];

        assert_eq!(queue.try_send(&slow, frame("s1")), Delivery::Buffered);
        assert_eq!(queue.try_send(&fast, frame("f1")), Delivery::Sent);
        assert!(!queue.is_open_for(&slow.id));
        assert!(queue.is_open_for(&fast.id));

        // A drain from fast leaves slow's lane alone
        let report = queue.on_drain(&fast.id, resolver(&sockets));
        assert_eq!(report, FlushReport::default());
        assert_eq!(queue.pending_len(), 1);

        slow.room.set(1);
        queue.on_drain(&slow.id, resolver(&sockets));
        assert_eq!(slow.written(), vec!["s1"]);
        assert_eq!(queue.pending_len(), 0);
    }

    #[test]
    fn test_closed_target_is_dropped() {
        let mut queue = BackpressureQueue::new(Direction::ToShards, GatePolicy::Shared);
        let socket = FakeSocket::new("s1", 0);
        socket.closed.set(true);

        assert_eq!(queue.try_send(&socket, frame("a")), Delivery::Dropped);
        assert_eq!(queue.pending_len(), 0);
        assert!(queue.is_open_for(&socket.id));
    }

    #[test]
    fn test_flush_skips_departed_targets() {
        let mut queue = BackpressureQueue::new(Direction::ToClients, GatePolicy::Shared);
        let gone = FakeSocket::new("gone", 0);
        let alive = FakeSocket::new("alive", 0);

        queue.try_send(&gone, frame("g1"));
        queue.try_send(&alive, frame("a1"));
        queue.try_send(&gone, frame("g2"));

        alive.room.set(10);
        let sockets = [&alive];
        let report = queue.on_drain(&alive.id, resolver(&sockets));
        assert_eq!(report.sent, 1);
        assert_eq!(report.dropped, 2);
        assert_eq!(alive.written(), vec!["a1"]);
        assert!(queue.is_open_for(&alive.id));
    }

    #[test]
    fn test_close_of_congested_connection_reopens_shared_gate() {
        let mut queue = BackpressureQueue::new(Direction::ToClients, GatePolicy::Shared);
        let slow = FakeSocket::new("slow", 0);
        let fast = FakeSocket::new("fast", 10);

        queue.try_send(&slow, frame("s1"));
        queue.try_send(&fast, frame("f1"));
        queue.try_send(&slow, frame("s2"));

        let sockets = [&fast];
        let report = queue.on_close(&slow.id, resolver(&sockets));
        assert_eq!(report.sent, 1);
        assert_eq!(report.dropped, 2);
        assert_eq!(fast.written(), vec!["f1"]);
        assert!(queue.is_open_for(&fast.id));
    }

    #[test]
    fn test_close_discards_per_connection_lane() {
        let mut queue = BackpressureQueue::new(Direction::ToShards, GatePolicy::PerConnection);
        let slow = FakeSocket::new("slow", 0);

        queue.try_send(&slow, frame("1"));
        queue.try_send(&slow, frame("2"));

        let sockets: [&FakeSocket; 0] = [];
        let report = queue.on_close(&slow.id, resolver(&sockets));
        assert_eq!(report.dropped, 2);
        assert_eq!(queue.pending_len(), 0);
    }

    #[test]
    fn test_direction_labels() {
        assert_eq!(Direction::ToShards.to_string(), "shard-bound");
        assert_eq!(Direction::ToClients.to_string(), "client-bound");
        let queue = BackpressureQueue::new(Direction::ToClients, GatePolicy::Shared);
        assert_eq!(queue.direction(), Direction::ToClients);
    }
}
