use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::net::SocketAddr;
use std::time::Instant;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TimerKind {
    /// Retransmission deadline of a confirmable message.
    Retransmit { peer: SocketAddr, message_id: u16 },
    /// End of the wait for a response to a request.
    Expire { peer: SocketAddr, token: Vec<u8> },
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Entry {
    deadline: Instant,
    seq: u64,
    kind: TimerKind,
}

/// Min-heap of deadlines.
///
/// Entries are never removed early: the owner checks on pop whether the
/// timer still refers to live state with the same deadline. Equal deadlines
/// pop in scheduling order.
#[derive(Debug, Default)]
pub struct TimerQueue {
    heap: BinaryHeap<Reverse<Entry>>,
    seq: u64,
}

impl TimerQueue {
    pub fn new() -> TimerQueue {
        TimerQueue::default()
    }

    pub fn schedule(&mut self, deadline: Instant, kind: TimerKind) {
        self.seq += 1;
        self.heap.push(Reverse(Entry {
            deadline,
            seq: self.seq,
            kind,
        }));
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse(entry)| entry.deadline)
    }

    /// Pops the earliest timer if it is due at `now`.
    pub fn pop_expired(&mut self, now: Instant) -> Option<(Instant, TimerKind)> {
        if self.next_deadline()? > now {
            return None;
        }
        self.heap
            .pop()
            .map(|Reverse(entry)| (entry.deadline, entry.kind))
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    fn retransmit(message_id: u16) -> TimerKind {
        TimerKind::Retransmit {
            peer: "127.0.0.1:1818".parse().unwrap(),
            message_id,
        }
    }

    #[test]
    fn test_fires_in_deadline_order() {
        let now = Instant::now();
        let mut timers = TimerQueue::new();
        timers.schedule(now + Duration::from_secs(3), retransmit(3));
        timers.schedule(now + Duration::from_secs(1), retransmit(1));
        timers.schedule(now + Duration::from_secs(2), retransmit(2));
        timers.schedule(now + Duration::from_secs(1), retransmit(4));

        assert_eq!(timers.next_deadline(), Some(now + Duration::from_secs(1)));
        assert!(timers.pop_expired(now).is_none());

        let fired: Vec<_> = std::iter::from_fn(|| timers.pop_expired(now + Duration::from_secs(2)))
            .map(|(_, kind)| kind)
            .collect();
        assert_eq!(fired, vec![retransmit(1), retransmit(4), retransmit(2)]);
        assert_eq!(timers.len(), 1);
    }
}
