//! Transmission parameters from RFC 7252 §4.8.
//!
//! The base values can be changed; the derived time spans are computed from
//! them the way §4.8.2 does, so shrinking `ack_timeout` for a test shrinks
//! the dedup window as well.

use std::time::Duration;

/// Default UDP port used by the `coapss` tool.
pub const DEFAULT_PORT: u16 = 1818;

/// Largest datagram the endpoint will send or expect to receive.
pub const COAP_MTU: usize = 1280;

/// Retransmission counts above this are treated as this value.
pub const MAX_RETRANSMIT_LIMIT: u32 = 20;

#[derive(Debug, Clone, PartialEq)]
pub struct TransmissionParameters {
    /// Base retransmission timeout for a confirmable message.
    pub ack_timeout: Duration,
    /// Upper bound of the random factor applied to the first timeout.
    pub ack_random_factor: f64,
    /// Number of retransmissions before giving up, capped at
    /// [`MAX_RETRANSMIT_LIMIT`].
    pub max_retransmit: u32,
    /// Worst-case one-way latency assumed for the network.
    pub max_latency: Duration,
    /// Encoded messages above this size are rejected.
    pub max_message_size: usize,
}

impl Default for TransmissionParameters {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(2),
            ack_random_factor: 1.5,
            max_retransmit: 4,
            max_latency: Duration::from_secs(100),
            max_message_size: COAP_MTU,
        }
    }
}

impl TransmissionParameters {
    /// Retransmissions actually attempted for a CON.
    pub fn retransmit_limit(&self) -> u32 {
        self.max_retransmit.min(MAX_RETRANSMIT_LIMIT)
    }

    /// Time from the first transmission of a CON to its last retransmission.
    pub fn max_transmit_span(&self) -> Duration {
        let factor = ((1u64 << self.retransmit_limit()) - 1) as f64 * self.ack_random_factor;
        self.ack_timeout.mul_f64(factor)
    }

    /// Time from the first transmission of a CON until the sender gives up.
    pub fn max_transmit_wait(&self) -> Duration {
        let factor = ((1u64 << (self.retransmit_limit() + 1)) - 1) as f64 * self.ack_random_factor;
        self.ack_timeout.mul_f64(factor)
    }

    pub fn processing_delay(&self) -> Duration {
        self.ack_timeout
    }

    /// How long a message id of a CON stays reserved.
    pub fn exchange_lifetime(&self) -> Duration {
        self.max_transmit_span() + 2 * self.max_latency + self.processing_delay()
    }

    /// How long a message id of a NON stays reserved.
    pub fn non_lifetime(&self) -> Duration {
        self.max_transmit_span() + self.max_latency
    }
}
