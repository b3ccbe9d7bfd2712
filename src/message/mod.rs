//! CoAP message model and wire format.

pub mod header;
pub mod options;
pub mod packet;

pub use header::{MessageClass, MessageType, RequestType, ResponseType, SignalingType};
pub use options::{CoapOption, ContentFormat};
pub use packet::{decode, encode, encode_with_limit, CoapMessage, MessageView};
