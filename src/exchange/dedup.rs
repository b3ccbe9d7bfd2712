use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use bytes::Bytes;

#[derive(Debug)]
pub struct DedupEntry {
    pub expires_at: Instant,
    /// Last ACK or response sent for this message, resent on duplicates.
    pub reply: Option<Bytes>,
}

/// Recently seen inbound message ids, per peer.
#[derive(Debug, Default)]
pub struct DedupCache {
    entries: HashMap<(SocketAddr, u16), DedupEntry>,
}

impl DedupCache {
    pub fn new() -> DedupCache {
        DedupCache::default()
    }

    /// Looks up a live entry; expired entries count as unseen.
    pub fn get(&self, now: Instant, peer: SocketAddr, message_id: u16) -> Option<&DedupEntry> {
        self.entries
            .get(&(peer, message_id))
            .filter(|entry| entry.expires_at > now)
    }

    pub fn insert(&mut self, peer: SocketAddr, message_id: u16, expires_at: Instant) {
        self.entries.insert(
            (peer, message_id),
            DedupEntry {
                expires_at,
                reply: None,
            },
        );
    }

    /// Records the reply for a seen message. Returns false if the message
    /// is not in the cache.
    pub fn set_reply(&mut self, peer: SocketAddr, message_id: u16, reply: Bytes) -> bool {
        match self.entries.get_mut(&(peer, message_id)) {
            Some(entry) => {
                entry.reply = Some(reply);
                true
            }
            None => false,
        }
    }

    pub fn prune(&mut self, now: Instant) {
        self.entries.retain(|_, entry| entry.expires_at > now);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
