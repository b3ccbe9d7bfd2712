use std::io;

use thiserror::Error;

/// Why an inbound datagram could not be turned into a message.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Fewer bytes than the fixed header.
    #[error("datagram shorter than the CoAP header")]
    Truncated,
    /// Anything else that breaks the wire layout.
    #[error("malformed CoAP message: {0}")]
    Malformed(&'static str),
}

/// Why a message could not be sent. Raised before any I/O happens.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("token is {0} bytes, at most 8 are allowed")]
    TokenTooLong(usize),
    /// Another request to the same peer is still waiting on this token.
    #[error("token is already used by a pending request to this peer")]
    TokenInUse,
    #[error("option {number} value of {length} bytes cannot be encoded")]
    OptionOutOfRange { number: u16, length: usize },
    #[error("message of {size} bytes exceeds the {limit} byte limit")]
    MessageTooLarge { size: usize, limit: usize },
}

/// How a request ended without a response.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
pub enum ExchangeError {
    #[error("no acknowledgement or response before the exchange timed out")]
    Timeout,
    #[error("peer rejected the message with a reset")]
    Reset,
}

/// Errors surfaced by an [`Endpoint`](crate::endpoint::Endpoint).
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error("endpoint is shut down")]
    Closed,
}
