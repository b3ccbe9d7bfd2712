//! Reliable messaging on top of the wire codec.
//!
//! [`Exchange`] holds no socket. It is fed inbound datagrams, outbound
//! requests and responses, and clock readings; it queues datagrams to send
//! ([`Transmit`]) and events for the application ([`Event`]). The owner
//! drains both queues after every call and sleeps until
//! [`Exchange::next_deadline`].

mod dedup;
mod timer;
mod transaction;

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, trace, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub use self::dedup::{DedupCache, DedupEntry};
pub use self::timer::{TimerKind, TimerQueue};
pub use self::transaction::{TimeoutOutcome, Transaction, TransactionState};

use crate::config::TransmissionParameters;
use crate::error::{EncodeError, ExchangeError};
use crate::message::{encode_with_limit, CoapMessage, MessageClass, MessageType, MessageView};

const TOKEN_LENGTH: usize = 4;

/// Identifies a request sent through [`Exchange::send_request`].
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct RequestHandle {
    pub peer: SocketAddr,
    pub message_id: u16,
    pub token: Vec<u8>,
}

#[derive(Debug, PartialEq)]
pub enum Event {
    /// A request delivered for the first time.
    Request {
        peer: SocketAddr,
        message: CoapMessage,
    },
    /// The response to one of our requests.
    Response {
        peer: SocketAddr,
        handle: RequestHandle,
        message: CoapMessage,
    },
    /// One of our requests will never get a response.
    Failed {
        peer: SocketAddr,
        handle: RequestHandle,
        error: ExchangeError,
    },
}

impl Event {
    pub fn peer(&self) -> SocketAddr {
        match self {
            Event::Request { peer, .. } => *peer,
            Event::Response { peer, .. } => *peer,
            Event::Failed { peer, .. } => *peer,
        }
    }
}

/// A datagram the owner has to put on the wire.
#[derive(Clone, Debug, PartialEq)]
pub struct Transmit {
    pub peer: SocketAddr,
    pub payload: Bytes,
}

#[derive(Debug)]
struct PendingRequest {
    message_id: u16,
    expires_at: Instant,
}

pub struct Exchange {
    params: TransmissionParameters,
    transactions: HashMap<(SocketAddr, u16), Transaction>,
    pending: HashMap<(SocketAddr, Vec<u8>), PendingRequest>,
    dedup: DedupCache,
    timers: TimerQueue,
    next_message_id: u16,
    rng: StdRng,
    transmits: VecDeque<Transmit>,
    events: VecDeque<Event>,
}

impl Exchange {
    pub fn new(params: TransmissionParameters) -> Exchange {
        Self::with_rng(params, StdRng::from_entropy())
    }

    /// Deterministic ids, tokens and jitter.
    pub fn with_seed(params: TransmissionParameters, seed: u64) -> Exchange {
        Self::with_rng(params, StdRng::seed_from_u64(seed))
    }

    fn with_rng(params: TransmissionParameters, mut rng: StdRng) -> Exchange {
        Exchange {
            params,
            transactions: HashMap::new(),
            pending: HashMap::new(),
            dedup: DedupCache::new(),
            timers: TimerQueue::new(),
            next_message_id: rng.gen(),
            rng,
            transmits: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    pub fn params(&self) -> &TransmissionParameters {
        &self.params
    }

    /// Sends a request. The message id is always assigned here; a token is
    /// generated when the message has none. A caller-chosen token must not
    /// belong to another pending request to the same peer. Only confirmable
    /// messages are retransmitted, any other type is sent once.
    pub fn send_request(
        &mut self,
        now: Instant,
        peer: SocketAddr,
        mut message: CoapMessage,
    ) -> Result<RequestHandle, EncodeError> {
        if !message.token().is_empty()
            && self.pending.contains_key(&(peer, message.token().to_vec()))
        {
            return Err(EncodeError::TokenInUse);
        }

        message.message_id = self.allocate_message_id();
        if message.token().is_empty() {
            let token = self.generate_token(peer);
            message.set_token(token);
        }

        let bytes = encode_with_limit(&message, self.params.max_message_size)?;
        let handle = RequestHandle {
            peer,
            message_id: message.message_id,
            token: message.token().to_vec(),
        };

        let expires_at = if message.message_type == MessageType::Confirmable {
            let transaction = Transaction::new(
                peer,
                handle.message_id,
                handle.token.clone(),
                bytes.clone(),
                self.initial_timeout(),
                now,
            );
            self.timers.schedule(
                transaction.next_timeout,
                TimerKind::Retransmit {
                    peer,
                    message_id: handle.message_id,
                },
            );
            self.transactions
                .insert((peer, handle.message_id), transaction);
            // Large retransmit counts stretch the schedule past the lifetime.
            now + self
                .params
                .exchange_lifetime()
                .max(self.params.max_transmit_wait())
        } else {
            now + self.params.non_lifetime()
        };

        self.pending.insert(
            (peer, handle.token.clone()),
            PendingRequest {
                message_id: handle.message_id,
                expires_at,
            },
        );
        self.timers.schedule(
            expires_at,
            TimerKind::Expire {
                peer,
                token: handle.token.clone(),
            },
        );

        debug!(
            "send {} {} mid={} token={:02x?} to {}",
            message.message_type,
            crate::message::header::code_to_str(message.code),
            handle.message_id,
            handle.token,
            peer
        );
        self.transmits.push_back(Transmit {
            peer,
            payload: bytes,
        });
        Ok(handle)
    }

    /// Answers `request`. A confirmable request gets a piggybacked ACK with
    /// its own message id; anything else gets a NON with a fresh id. The
    /// encoded reply is remembered so a duplicate of the request gets the
    /// same bytes again.
    pub fn respond(
        &mut self,
        peer: SocketAddr,
        request: &CoapMessage,
        mut response: CoapMessage,
    ) -> Result<(), EncodeError> {
        response.set_token(request.token().to_vec());
        if request.message_type == MessageType::Confirmable {
            response.message_type = MessageType::Acknowledgement;
            response.message_id = request.message_id;
        } else {
            response.message_type = MessageType::NonConfirmable;
            response.message_id = self.allocate_message_id();
        }

        let bytes = encode_with_limit(&response, self.params.max_message_size)?;
        self.dedup.set_reply(peer, request.message_id, bytes.clone());

        trace!("respond {:?} to {}", response, peer);
        self.transmits.push_back(Transmit {
            peer,
            payload: bytes,
        });
        Ok(())
    }

    /// Feeds one received datagram. Undecodable datagrams are dropped.
    pub fn handle_datagram(&mut self, now: Instant, peer: SocketAddr, datagram: &[u8]) {
        match MessageView::parse(datagram) {
            Ok(view) => self.handle_message(now, peer, view.to_message()),
            Err(e) => debug!("dropping datagram from {}: {}", peer, e),
        }
    }

    pub fn handle_message(&mut self, now: Instant, peer: SocketAddr, message: CoapMessage) {
        trace!("received {:?} from {}", message, peer);

        match message.message_type {
            MessageType::Acknowledgement => self.on_acknowledgement(peer, message),
            MessageType::Reset => self.on_reset(peer, message.message_id),
            MessageType::Confirmable | MessageType::NonConfirmable => {
                self.on_message(now, peer, message)
            }
        }
    }

    /// Fires every timer due at `now` and forgets expired dedup entries.
    pub fn handle_timeouts(&mut self, now: Instant) {
        let max_retransmit = self.params.retransmit_limit();

        while let Some((deadline, kind)) = self.timers.pop_expired(now) {
            match kind {
                TimerKind::Retransmit { peer, message_id } => {
                    let key = (peer, message_id);
                    let (outcome, next_timeout) = match self.transactions.get_mut(&key) {
                        Some(tx) if tx.next_timeout == deadline => {
                            (tx.on_timeout(max_retransmit), tx.next_timeout)
                        }
                        _ => continue,
                    };

                    match outcome {
                        TimeoutOutcome::Retransmit(bytes) => {
                            debug!("retransmit mid={} to {}", message_id, peer);
                            self.timers
                                .schedule(next_timeout, TimerKind::Retransmit { peer, message_id });
                            self.transmits.push_back(Transmit {
                                peer,
                                payload: bytes,
                            });
                        }
                        TimeoutOutcome::GiveUp => {
                            if let Some(tx) = self.transactions.remove(&key) {
                                warn!(
                                    "mid={} to {} not acknowledged after {} retransmissions",
                                    message_id, peer, tx.retransmit_count
                                );
                                self.pending.remove(&(peer, tx.token.clone()));
                                self.fail(peer, message_id, tx.token, ExchangeError::Timeout);
                            }
                        }
                    }
                }
                TimerKind::Expire { peer, token } => {
                    let key = (peer, token);
                    match self.pending.get(&key) {
                        Some(request) if request.expires_at == deadline => {}
                        _ => continue,
                    }
                    if let Some(request) = self.pending.remove(&key) {
                        debug!("request mid={} to {} expired", request.message_id, peer);
                        self.transactions.remove(&(peer, request.message_id));
                        self.fail(peer, request.message_id, key.1, ExchangeError::Timeout);
                    }
                }
            }
        }

        self.dedup.prune(now);
    }

    /// Earliest instant at which [`Exchange::handle_timeouts`] has work.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.transmits.pop_front()
    }

    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Stops tracking a request. Nothing is sent and no event is produced.
    pub fn cancel(&mut self, handle: &RequestHandle) -> bool {
        let tx = self
            .transactions
            .remove(&(handle.peer, handle.message_id))
            .is_some();
        let pending = self
            .pending
            .remove(&(handle.peer, handle.token.clone()))
            .is_some();
        tx || pending
    }

    /// Drops every transaction, pending request and queued datagram.
    pub fn cancel_all(&mut self) -> usize {
        let cancelled = self.pending.len();
        debug!(
            "cancelling {} requests and {} transactions",
            cancelled,
            self.transactions.len()
        );
        self.transactions.clear();
        self.pending.clear();
        self.timers.clear();
        self.transmits.clear();
        cancelled
    }

    /// Requests still waiting for a response.
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    pub fn transaction(&self, peer: SocketAddr, message_id: u16) -> Option<&Transaction> {
        self.transactions.get(&(peer, message_id))
    }

    fn on_acknowledgement(&mut self, peer: SocketAddr, message: CoapMessage) {
        let mut tx = match self.transactions.remove(&(peer, message.message_id)) {
            Some(tx) => tx,
            None => {
                trace!("unmatched ACK mid={} from {}", message.message_id, peer);
                return;
            }
        };
        tx.complete();

        if message.is_empty_message() {
            debug!(
                "mid={} acknowledged by {}, waiting for separate response",
                tx.message_id, peer
            );
            return;
        }

        if message.token() != tx.token.as_slice() {
            warn!(
                "piggybacked response from {} carries token {:02x?}, expected {:02x?}",
                peer,
                message.token(),
                tx.token
            );
            return;
        }

        self.deliver_response(peer, message);
    }

    fn on_reset(&mut self, peer: SocketAddr, message_id: u16) {
        if let Some(mut tx) = self.transactions.remove(&(peer, message_id)) {
            tx.complete();
            self.pending.remove(&(peer, tx.token.clone()));
            debug!("mid={} reset by {}", message_id, peer);
            self.fail(peer, message_id, tx.token, ExchangeError::Reset);
            return;
        }

        let token = self
            .pending
            .iter()
            .find(|((p, _), request)| *p == peer && request.message_id == message_id)
            .map(|((_, token), _)| token.clone());
        match token {
            Some(token) => {
                self.pending.remove(&(peer, token.clone()));
                debug!("mid={} reset by {}", message_id, peer);
                self.fail(peer, message_id, token, ExchangeError::Reset);
            }
            None => trace!("unmatched RST mid={} from {}", message_id, peer),
        }
    }

    fn on_message(&mut self, now: Instant, peer: SocketAddr, message: CoapMessage) {
        let message_id = message.message_id;
        let confirmable = message.message_type == MessageType::Confirmable;

        if let Some(entry) = self.dedup.get(now, peer, message_id) {
            match (confirmable, entry.reply.clone()) {
                (true, Some(reply)) => {
                    debug!("duplicate mid={} from {}, resending reply", message_id, peer);
                    self.transmits.push_back(Transmit {
                        peer,
                        payload: reply,
                    });
                }
                _ => debug!("duplicate mid={} from {} dropped", message_id, peer),
            }
            return;
        }

        let lifetime = if confirmable {
            self.params.exchange_lifetime()
        } else {
            self.params.non_lifetime()
        };
        self.dedup.insert(peer, message_id, now + lifetime);

        match message.class() {
            MessageClass::Request(_) => {
                self.events.push_back(Event::Request { peer, message });
            }
            _ if message.is_response() => {
                if self.deliver_response(peer, message) {
                    if confirmable {
                        self.reply_empty(peer, MessageType::Acknowledgement, message_id);
                    }
                } else if confirmable {
                    debug!("unmatched response mid={} from {}, rejecting", message_id, peer);
                    self.reply_empty(peer, MessageType::Reset, message_id);
                }
            }
            // Empty CON is a ping; reserved and signaling codes have no
            // meaning over UDP. Both are rejected.
            _ => {
                if confirmable {
                    self.reply_empty(peer, MessageType::Reset, message_id);
                } else {
                    debug!("ignoring code {:#04x} from {}", message.code, peer);
                }
            }
        }
    }

    fn deliver_response(&mut self, peer: SocketAddr, message: CoapMessage) -> bool {
        let token = message.token().to_vec();
        let request = match self.pending.remove(&(peer, token.clone())) {
            Some(request) => request,
            None => return false,
        };

        // A response implies the request arrived.
        self.transactions.remove(&(peer, request.message_id));

        let handle = RequestHandle {
            peer,
            message_id: request.message_id,
            token,
        };
        self.events.push_back(Event::Response {
            peer,
            handle,
            message,
        });
        true
    }

    fn reply_empty(&mut self, peer: SocketAddr, message_type: MessageType, message_id: u16) {
        let reply = CoapMessage::new_empty(message_type, message_id);
        match encode_with_limit(&reply, self.params.max_message_size) {
            Ok(bytes) => {
                self.dedup.set_reply(peer, message_id, bytes.clone());
                self.transmits.push_back(Transmit {
                    peer,
                    payload: bytes,
                });
            }
            Err(e) => warn!("cannot encode {} for mid={}: {}", message_type, message_id, e),
        }
    }

    fn fail(&mut self, peer: SocketAddr, message_id: u16, token: Vec<u8>, error: ExchangeError) {
        self.events.push_back(Event::Failed {
            peer,
            handle: RequestHandle {
                peer,
                message_id,
                token,
            },
            error,
        });
    }

    fn allocate_message_id(&mut self) -> u16 {
        let id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1);
        id
    }

    fn generate_token(&mut self, peer: SocketAddr) -> Vec<u8> {
        loop {
            let token = self.rng.gen::<[u8; TOKEN_LENGTH]>().to_vec();
            if !self.pending.contains_key(&(peer, token.clone())) {
                return token;
            }
        }
    }

    fn initial_timeout(&mut self) -> Duration {
        let factor = self.params.ack_random_factor;
        if factor <= 1.0 {
            return self.params.ack_timeout;
        }
        self.params.ack_timeout.mul_f64(self.rng.gen_range(1.0..factor))
    }
}
