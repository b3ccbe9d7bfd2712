use std::fmt;

/// The only protocol version this crate speaks.
pub const COAP_VERSION: u8 = 1;

/// Size of the fixed header that starts every message.
pub const HEADER_SIZE: usize = 4;

/// Largest token a message may carry.
pub const MAX_TOKEN_LENGTH: usize = 8;

/// Default maximum object lifetime in seconds (Max-Age).
pub const DEFAULT_MAX_AGE: u32 = 60;

/// The URI scheme for CoAP over UDP.
pub const COAP_SCHEME: &str = "coap";

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum MessageType {
    Confirmable,
    NonConfirmable,
    Acknowledgement,
    Reset,
}

impl MessageType {
    pub fn from_bits(bits: u8) -> MessageType {
        match bits & 0x03 {
            0 => MessageType::Confirmable,
            1 => MessageType::NonConfirmable,
            2 => MessageType::Acknowledgement,
            _ => MessageType::Reset,
        }
    }

    pub fn to_bits(self) -> u8 {
        match self {
            MessageType::Confirmable => 0,
            MessageType::NonConfirmable => 1,
            MessageType::Acknowledgement => 2,
            MessageType::Reset => 3,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageType::Confirmable => "CON",
            MessageType::NonConfirmable => "NON",
            MessageType::Acknowledgement => "ACK",
            MessageType::Reset => "RST",
        };
        f.write_str(s)
    }
}

/// The class half of a code byte.
pub const CLASS_REQUEST: u8 = 0;
pub const CLASS_RESPONSE: u8 = 2;
pub const CLASS_CLIENT_ERROR: u8 = 4;
pub const CLASS_SERVER_ERROR: u8 = 5;
pub const CLASS_SIGNALING: u8 = 7;

/// Builds a code byte from its class and detail.
pub const fn code(class: u8, detail: u8) -> u8 {
    (class << 5) | (detail & 0x1F)
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum MessageClass {
    Empty,
    Request(RequestType),
    Response(ResponseType),
    Signaling(SignalingType),
    Reserved(u8),
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum RequestType {
    Get,
    Post,
    Put,
    Delete,
    Fetch,
    Patch,
    IPatch,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ResponseType {
    // 200 Codes
    Created,
    Deleted,
    Valid,
    Changed,
    Content,

    // 400 Codes
    BadRequest,
    Unauthorized,
    BadOption,
    Forbidden,
    NotFound,
    MethodNotAllowed,
    NotAcceptable,
    PreconditionFailed,
    RequestEntityTooLarge,
    UnsupportedContentFormat,

    // 500 Codes
    InternalServerError,
    NotImplemented,
    BadGateway,
    ServiceUnavailable,
    GatewayTimeout,
    ProxyingNotSupported,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum SignalingType {
    Csm,
    Ping,
    Pong,
    Release,
    Abort,
}

impl MessageClass {
    pub fn is_request(&self) -> bool {
        matches!(self, MessageClass::Request(_))
    }

    pub fn is_response(&self) -> bool {
        matches!(self, MessageClass::Response(_))
            || matches!(self, MessageClass::Reserved(c) if is_response_class(*c))
    }
}

/// True for any code in the 2.xx, 4.xx and 5.xx classes, including codes
/// this crate has no name for.
pub fn is_response_class(code: u8) -> bool {
    matches!(
        code >> 5,
        CLASS_RESPONSE | CLASS_CLIENT_ERROR | CLASS_SERVER_ERROR
    )
}

impl From<u8> for MessageClass {
    fn from(code: u8) -> MessageClass {
        match code {
            0x00 => MessageClass::Empty,

            0x01 => MessageClass::Request(RequestType::Get),
            0x02 => MessageClass::Request(RequestType::Post),
            0x03 => MessageClass::Request(RequestType::Put),
            0x04 => MessageClass::Request(RequestType::Delete),
            0x05 => MessageClass::Request(RequestType::Fetch),
            0x06 => MessageClass::Request(RequestType::Patch),
            0x07 => MessageClass::Request(RequestType::IPatch),

            0x41 => MessageClass::Response(ResponseType::Created),
            0x42 => MessageClass::Response(ResponseType::Deleted),
            0x43 => MessageClass::Response(ResponseType::Valid),
            0x44 => MessageClass::Response(ResponseType::Changed),
            0x45 => MessageClass::Response(ResponseType::Content),

            0x80 => MessageClass::Response(ResponseType::BadRequest),
            0x81 => MessageClass::Response(ResponseType::Unauthorized),
            0x82 => MessageClass::Response(ResponseType::BadOption),
            0x83 => MessageClass::Response(ResponseType::Forbidden),
            0x84 => MessageClass::Response(ResponseType::NotFound),
            0x85 => MessageClass::Response(ResponseType::MethodNotAllowed),
            0x86 => MessageClass::Response(ResponseType::NotAcceptable),
            0x8C => MessageClass::Response(ResponseType::PreconditionFailed),
            0x8D => MessageClass::Response(ResponseType::RequestEntityTooLarge),
            0x8F => MessageClass::Response(ResponseType::UnsupportedContentFormat),

            0x90 => MessageClass::Response(ResponseType::InternalServerError),
            0x91 => MessageClass::Response(ResponseType::NotImplemented),
            0x92 => MessageClass::Response(ResponseType::BadGateway),
            0x93 => MessageClass::Response(ResponseType::ServiceUnavailable),
            0x94 => MessageClass::Response(ResponseType::GatewayTimeout),
            0x95 => MessageClass::Response(ResponseType::ProxyingNotSupported),

            0xE1 => MessageClass::Signaling(SignalingType::Csm),
            0xE2 => MessageClass::Signaling(SignalingType::Ping),
            0xE3 => MessageClass::Signaling(SignalingType::Pong),
            0xE4 => MessageClass::Signaling(SignalingType::Release),
            0xE5 => MessageClass::Signaling(SignalingType::Abort),

            other => MessageClass::Reserved(other),
        }
    }
}

impl From<MessageClass> for u8 {
    fn from(class: MessageClass) -> u8 {
        match class {
            MessageClass::Empty => 0x00,

            MessageClass::Request(method) => method.into(),
            MessageClass::Response(status) => status.into(),

            MessageClass::Signaling(SignalingType::Csm) => 0xE1,
            MessageClass::Signaling(SignalingType::Ping) => 0xE2,
            MessageClass::Signaling(SignalingType::Pong) => 0xE3,
            MessageClass::Signaling(SignalingType::Release) => 0xE4,
            MessageClass::Signaling(SignalingType::Abort) => 0xE5,

            MessageClass::Reserved(c) => c,
        }
    }
}

impl From<RequestType> for u8 {
    fn from(method: RequestType) -> u8 {
        match method {
            RequestType::Get => 0x01,
            RequestType::Post => 0x02,
            RequestType::Put => 0x03,
            RequestType::Delete => 0x04,
            RequestType::Fetch => 0x05,
            RequestType::Patch => 0x06,
            RequestType::IPatch => 0x07,
        }
    }
}

impl From<ResponseType> for u8 {
    fn from(status: ResponseType) -> u8 {
        match status {
            ResponseType::Created => code(2, 1),
            ResponseType::Deleted => code(2, 2),
            ResponseType::Valid => code(2, 3),
            ResponseType::Changed => code(2, 4),
            ResponseType::Content => code(2, 5),

            ResponseType::BadRequest => code(4, 0),
            ResponseType::Unauthorized => code(4, 1),
            ResponseType::BadOption => code(4, 2),
            ResponseType::Forbidden => code(4, 3),
            ResponseType::NotFound => code(4, 4),
            ResponseType::MethodNotAllowed => code(4, 5),
            ResponseType::NotAcceptable => code(4, 6),
            ResponseType::PreconditionFailed => code(4, 12),
            ResponseType::RequestEntityTooLarge => code(4, 13),
            ResponseType::UnsupportedContentFormat => code(4, 15),

            ResponseType::InternalServerError => code(5, 0),
            ResponseType::NotImplemented => code(5, 1),
            ResponseType::BadGateway => code(5, 2),
            ResponseType::ServiceUnavailable => code(5, 3),
            ResponseType::GatewayTimeout => code(5, 4),
            ResponseType::ProxyingNotSupported => code(5, 5),
        }
    }
}

/// Formats a code byte the way RFC 7252 writes it, e.g. `2.05`.
pub fn code_to_str(code: u8) -> String {
    let class_code = (0xE0 & code) >> 5;
    let detail_code = 0x1F & code;

    format!("{}.{:02}", class_code, detail_code)
}

/// Parses the `c.dd` form back into a code byte.
pub fn str_to_code(s: &str) -> Option<u8> {
    let (class, detail) = s.split_once('.')?;
    let class = class.parse::<u8>().ok()?;
    let detail = detail.parse::<u8>().ok()?;
    if class > 7 || detail > 31 {
        return None;
    }
    Some(code(class, detail))
}

/// Fixed header fields, packed the way they travel.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Header {
    pub version: u8,
    pub message_type: MessageType,
    pub token_length: u8,
    pub code: u8,
    pub message_id: u16,
}

impl Header {
    /// Reads the first four bytes; the caller checks the length.
    pub fn from_bytes(buf: &[u8; HEADER_SIZE]) -> Header {
        Header {
            version: buf[0] >> 6,
            message_type: MessageType::from_bits((buf[0] >> 4) & 0x03),
            token_length: buf[0] & 0x0F,
            code: buf[1],
            message_id: u16::from_be_bytes([buf[2], buf[3]]),
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let id = self.message_id.to_be_bytes();
        [
            (self.version << 6) | (self.message_type.to_bits() << 4) | (self.token_length & 0x0F),
            self.code,
            id[0],
            id[1],
        ]
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_header_codes() {
        for code in 0..=255u8 {
            let class = MessageClass::from(code);
            assert_eq!(u8::from(class), code);
        }
    }

    #[test]
    fn test_code_strings() {
        assert_eq!(code_to_str(u8::from(ResponseType::Content)), "2.05");
        assert_eq!(code_to_str(u8::from(ResponseType::PreconditionFailed)), "4.12");
        assert_eq!(str_to_code("0.01"), Some(0x01));
        assert_eq!(str_to_code("5.03"), Some(0xA3));
        assert_eq!(str_to_code("8.00"), None);
        assert_eq!(str_to_code("2"), None);
    }

    #[test]
    fn test_response_class() {
        assert!(MessageClass::from(0x45).is_response());
        assert!(MessageClass::from(code(4, 20)).is_response());
        assert!(!MessageClass::from(0x01).is_response());
        assert!(!MessageClass::from(0xE2).is_response());
    }

    #[test]
    fn test_header_bytes() {
        let buf = [0x44, 0x01, 0x84, 0x9e];
        let header = Header::from_bytes(&buf);
        assert_eq!(header.version, 1);
        assert_eq!(header.message_type, MessageType::Confirmable);
        assert_eq!(header.token_length, 4);
        assert_eq!(header.code, 0x01);
        assert_eq!(header.message_id, 33950);
        assert_eq!(header.to_bytes(), buf);
    }
}
