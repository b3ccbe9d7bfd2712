use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum TransactionState {
    WaitingAck,
    Completed,
    Failed,
}

pub enum TimeoutOutcome {
    /// Send these bytes again and wait until `next_timeout`.
    Retransmit(Bytes),
    GiveUp,
}

/// One confirmable message waiting for its acknowledgement.
#[derive(Debug)]
pub struct Transaction {
    pub peer: SocketAddr,
    pub message_id: u16,
    pub token: Vec<u8>,
    pub original: Bytes,
    pub retransmit_count: u32,
    pub timeout: Duration,
    pub next_timeout: Instant,
    pub state: TransactionState,
}

impl Transaction {
    pub fn new(
        peer: SocketAddr,
        message_id: u16,
        token: Vec<u8>,
        original: Bytes,
        initial_timeout: Duration,
        now: Instant,
    ) -> Transaction {
        Transaction {
            peer,
            message_id,
            token,
            original,
            retransmit_count: 0,
            timeout: initial_timeout,
            next_timeout: now + initial_timeout,
            state: TransactionState::WaitingAck,
        }
    }

    /// Advances the back-off after `next_timeout` passed. Deadlines are
    /// chained off the previous deadline so late polling does not stretch
    /// the schedule.
    pub fn on_timeout(&mut self, max_retransmit: u32) -> TimeoutOutcome {
        if self.retransmit_count >= max_retransmit {
            self.state = TransactionState::Failed;
            return TimeoutOutcome::GiveUp;
        }

        self.retransmit_count += 1;
        self.timeout *= 2;
        self.next_timeout += self.timeout;
        TimeoutOutcome::Retransmit(self.original.clone())
    }

    pub fn complete(&mut self) {
        self.state = TransactionState::Completed;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_backoff_doubles_until_exhausted() {
        let now = Instant::now();
        let peer: SocketAddr = "127.0.0.1:5683".parse().unwrap();
        let mut tx = Transaction::new(
            peer,
            7,
            vec![1],
            Bytes::from_static(b"\x40\x01\x00\x07"),
            Duration::from_secs(2),
            now,
        );
        assert_eq!(tx.next_timeout, now + Duration::from_secs(2));

        let mut expected = now + Duration::from_secs(2);
        for n in 1..=3 {
            match tx.on_timeout(3) {
                TimeoutOutcome::Retransmit(bytes) => assert_eq!(bytes, tx.original),
                TimeoutOutcome::GiveUp => panic!("gave up after {} retransmissions", n - 1),
            }
            expected += Duration::from_secs(2 << n);
            assert_eq!(tx.next_timeout, expected);
            assert_eq!(tx.retransmit_count, n);
            assert_eq!(tx.state, TransactionState::WaitingAck);
        }

        assert!(matches!(tx.on_timeout(3), TimeoutOutcome::GiveUp));
        assert_eq!(tx.state, TransactionState::Failed);
    }
}
