use std::collections::BTreeMap;
use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use super::header::{
    self, Header, MessageClass, MessageType, RequestType, ResponseType, COAP_VERSION,
    HEADER_SIZE, MAX_TOKEN_LENGTH,
};
use super::options::{self, CoapOption, ContentFormat, Options, PAYLOAD_MARKER};
use crate::config::COAP_MTU;
use crate::error::{DecodeError, EncodeError};

/// An owned CoAP message.
///
/// Options are kept by number; values of a repeated option keep the order
/// they were added in, which is also their order on the wire. An empty
/// payload means the message carries no payload marker.
#[derive(Clone, PartialEq, Eq)]
pub struct CoapMessage {
    pub message_type: MessageType,
    pub code: u8,
    pub message_id: u16,
    token: Vec<u8>,
    options: BTreeMap<u16, Vec<Vec<u8>>>,
    pub payload: Vec<u8>,
}

impl Default for CoapMessage {
    fn default() -> Self {
        CoapMessage::new()
    }
}

impl CoapMessage {
    /// An empty confirmable message.
    pub fn new() -> CoapMessage {
        CoapMessage {
            message_type: MessageType::Confirmable,
            code: 0,
            message_id: 0,
            token: Vec::new(),
            options: BTreeMap::new(),
            payload: Vec::new(),
        }
    }

    pub fn new_request(message_type: MessageType, method: RequestType) -> CoapMessage {
        CoapMessage {
            message_type,
            code: method.into(),
            ..CoapMessage::new()
        }
    }

    /// An empty ACK or RST answering `message_id`.
    pub fn new_empty(message_type: MessageType, message_id: u16) -> CoapMessage {
        CoapMessage {
            message_type,
            message_id,
            ..CoapMessage::new()
        }
    }

    /// A response skeleton; type, message id and token are filled in when
    /// the response is sent back.
    pub fn new_response(status: ResponseType) -> CoapMessage {
        CoapMessage {
            message_type: MessageType::NonConfirmable,
            code: status.into(),
            ..CoapMessage::new()
        }
    }

    pub fn class(&self) -> MessageClass {
        MessageClass::from(self.code)
    }

    pub fn set_class(&mut self, class: MessageClass) {
        self.code = class.into();
    }

    pub fn is_empty_message(&self) -> bool {
        self.code == 0
    }

    pub fn is_request(&self) -> bool {
        self.class().is_request()
    }

    pub fn is_response(&self) -> bool {
        header::is_response_class(self.code)
    }

    pub fn token(&self) -> &[u8] {
        &self.token
    }

    pub fn set_token(&mut self, token: Vec<u8>) {
        self.token = token;
    }

    /// Appends a value, keeping earlier values of the same option.
    pub fn add_option(&mut self, option: CoapOption, value: Vec<u8>) {
        self.options.entry(option.into()).or_default().push(value);
    }

    /// Replaces every value of the option.
    pub fn set_option(&mut self, option: CoapOption, values: Vec<Vec<u8>>) {
        if values.is_empty() {
            self.clear_option(option);
        } else {
            self.options.insert(option.into(), values);
        }
    }

    pub fn get_option(&self, option: CoapOption) -> Option<&Vec<Vec<u8>>> {
        self.options.get(&option.into())
    }

    pub fn get_first_option(&self, option: CoapOption) -> Option<&[u8]> {
        self.get_option(option)
            .and_then(|values| values.first())
            .map(|v| v.as_slice())
    }

    pub fn clear_option(&mut self, option: CoapOption) {
        self.options.remove(&option.into());
    }

    /// Every option in wire order.
    pub fn options(&self) -> impl Iterator<Item = (u16, &[u8])> + '_ {
        self.options
            .iter()
            .flat_map(|(number, values)| values.iter().map(move |v| (*number, v.as_slice())))
    }

    /// Splits `path` on `/` into Uri-Path options, replacing any present.
    pub fn set_path(&mut self, path: &str) {
        let segments = path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| s.as_bytes().to_vec())
            .collect();
        self.set_option(CoapOption::UriPath, segments);
    }

    pub fn get_path(&self) -> String {
        match self.get_option(CoapOption::UriPath) {
            Some(segments) => segments
                .iter()
                .map(|s| String::from_utf8_lossy(s))
                .collect::<Vec<_>>()
                .join("/"),
            None => String::new(),
        }
    }

    pub fn set_content_format(&mut self, cf: ContentFormat) {
        self.set_option(
            CoapOption::ContentFormat,
            vec![options::encode_uint(cf as u32)],
        );
    }

    pub fn get_content_format(&self) -> Option<ContentFormat> {
        let value = self.get_first_option(CoapOption::ContentFormat)?;
        let number = options::decode_uint(value)?;
        u16::try_from(number).ok().and_then(ContentFormat::from_u16)
    }

    pub fn set_payload(&mut self, payload: Vec<u8>) {
        self.payload = payload;
    }

    /// Serializes with the default size limit.
    pub fn to_bytes(&self) -> Result<Bytes, EncodeError> {
        encode(self)
    }

    pub fn from_bytes(buf: &[u8]) -> Result<CoapMessage, DecodeError> {
        decode(buf)
    }
}

impl fmt::Debug for CoapMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoapMessage")
            .field("type", &self.message_type)
            .field("code", &header::code_to_str(self.code))
            .field("message_id", &self.message_id)
            .field("token", &self.token)
            .field("options", &self.options)
            .field("payload", &self.payload)
            .finish()
    }
}

/// Encodes `message`, rejecting it if it exceeds [`COAP_MTU`].
pub fn encode(message: &CoapMessage) -> Result<Bytes, EncodeError> {
    encode_with_limit(message, COAP_MTU)
}

pub fn encode_with_limit(message: &CoapMessage, limit: usize) -> Result<Bytes, EncodeError> {
    if message.token.len() > MAX_TOKEN_LENGTH {
        return Err(EncodeError::TokenTooLong(message.token.len()));
    }

    let header = Header {
        version: COAP_VERSION,
        message_type: message.message_type,
        token_length: message.token.len() as u8,
        code: message.code,
        message_id: message.message_id,
    };

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + message.token.len() + message.payload.len() + 16);
    buf.put_slice(&header.to_bytes());
    buf.put_slice(&message.token);
    options::encode_options(&mut buf, &message.options)?;

    if !message.payload.is_empty() {
        buf.put_u8(PAYLOAD_MARKER);
        buf.put_slice(&message.payload);
    }

    if buf.len() > limit {
        return Err(EncodeError::MessageTooLarge {
            size: buf.len(),
            limit,
        });
    }

    Ok(buf.freeze())
}

/// Decodes a datagram into an owned message.
pub fn decode(buf: &[u8]) -> Result<CoapMessage, DecodeError> {
    MessageView::parse(buf).map(|view| view.to_message())
}

/// A validated message borrowing its variable parts from the datagram.
#[derive(Clone, Debug)]
pub struct MessageView<'a> {
    pub header: Header,
    pub token: &'a [u8],
    options: &'a [u8],
    pub payload: &'a [u8],
}

impl<'a> MessageView<'a> {
    pub fn parse(buf: &'a [u8]) -> Result<MessageView<'a>, DecodeError> {
        let fixed: &[u8; HEADER_SIZE] = buf
            .get(..HEADER_SIZE)
            .and_then(|b| b.try_into().ok())
            .ok_or(DecodeError::Truncated)?;
        let header = Header::from_bytes(fixed);

        if header.version != COAP_VERSION {
            return Err(DecodeError::Malformed("unsupported version"));
        }

        let token_length = header.token_length as usize;
        if token_length > MAX_TOKEN_LENGTH {
            return Err(DecodeError::Malformed("token length above 8"));
        }

        let options_start = HEADER_SIZE + token_length;
        let token = buf
            .get(HEADER_SIZE..options_start)
            .ok_or(DecodeError::Malformed("token runs past end of buffer"))?;

        let rest = &buf[options_start..];
        let options_len = options::scan_options(rest)?;
        let (options, tail) = rest.split_at(options_len);

        let payload = match tail.split_first() {
            None => &[][..],
            Some((_, payload)) if payload.is_empty() => {
                return Err(DecodeError::Malformed("payload marker without payload"));
            }
            Some((_, payload)) => payload,
        };

        Ok(MessageView {
            header,
            token,
            options,
            payload,
        })
    }

    pub fn options(&self) -> Options<'a> {
        Options::new(self.options)
    }

    pub fn to_message(&self) -> CoapMessage {
        let mut options: BTreeMap<u16, Vec<Vec<u8>>> = BTreeMap::new();
        for (number, value) in self.options() {
            options.entry(number).or_default().push(value.to_vec());
        }

        CoapMessage {
            message_type: self.header.message_type,
            code: self.header.code,
            message_id: self.header.message_id,
            token: self.token.to_vec(),
            options,
            payload: self.payload.to_vec(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use quickcheck::{Arbitrary, Gen, QuickCheck, TestResult};

    #[test]
    fn test_decode_packet_with_options() {
        let buf = [
            0x44, 0x01, 0x84, 0x9e, 0x51, 0x55, 0x77, 0xe8, 0xb2, 0x48, 0x69, 0x04, 0x54, 0x65,
            0x73, 0x74, 0x43, 0x61, 0x3d, 0x31,
        ];
        let packet = decode(&buf).unwrap();
        assert_eq!(packet.message_type, MessageType::Confirmable);
        assert_eq!(packet.class(), MessageClass::Request(RequestType::Get));
        assert_eq!(packet.message_id, 33950);
        assert_eq!(packet.token(), &[0x51, 0x55, 0x77, 0xE8]);
        assert_eq!(packet.get_path(), "Hi/Test");
        assert_eq!(
            packet.get_option(CoapOption::UriQuery),
            Some(&vec![b"a=1".to_vec()])
        );
        assert!(packet.payload.is_empty());
    }

    #[test]
    fn test_decode_packet_with_payload() {
        let buf = [
            0x64, 0x45, 0x13, 0xFD, 0xD0, 0xE2, 0x4D, 0xAC, 0xFF, 0x48, 0x65, 0x6C, 0x6C, 0x6F,
        ];
        let packet = decode(&buf).unwrap();
        assert_eq!(packet.message_type, MessageType::Acknowledgement);
        assert_eq!(packet.class(), MessageClass::Response(ResponseType::Content));
        assert_eq!(packet.message_id, 5117);
        assert_eq!(packet.token(), &[0xD0, 0xE2, 0x4D, 0xAC]);
        assert_eq!(packet.payload, b"Hello".to_vec());
    }

    #[test]
    fn test_encode_packet_with_options() {
        let mut packet = CoapMessage::new_request(MessageType::Confirmable, RequestType::Get);
        packet.message_id = 33950;
        packet.set_token(vec![0x51, 0x55, 0x77, 0xE8]);
        packet.add_option(CoapOption::UriPath, b"Hi".to_vec());
        packet.add_option(CoapOption::UriPath, b"Test".to_vec());
        packet.add_option(CoapOption::UriQuery, b"a=1".to_vec());
        assert_eq!(
            packet.to_bytes().unwrap().to_vec(),
            vec![
                0x44, 0x01, 0x84, 0x9e, 0x51, 0x55, 0x77, 0xe8, 0xb2, 0x48, 0x69, 0x04, 0x54,
                0x65, 0x73, 0x74, 0x43, 0x61, 0x3d, 0x31
            ]
        );
    }

    #[test]
    fn test_encode_packet_with_payload() {
        let mut packet = CoapMessage::new_response(ResponseType::Content);
        packet.message_type = MessageType::Acknowledgement;
        packet.message_id = 5117;
        packet.set_token(vec![0xD0, 0xE2, 0x4D, 0xAC]);
        packet.payload = b"Hello".to_vec();
        assert_eq!(
            packet.to_bytes().unwrap().to_vec(),
            vec![0x64, 0x45, 0x13, 0xFD, 0xD0, 0xE2, 0x4D, 0xAC, 0xFF, 0x48, 0x65, 0x6C, 0x6C, 0x6F]
        );
    }

    #[test]
    fn test_encode_errors() {
        let mut packet = CoapMessage::new();
        packet.set_token(vec![0; 9]);
        assert_eq!(packet.to_bytes(), Err(EncodeError::TokenTooLong(9)));

        let mut packet = CoapMessage::new_request(MessageType::NonConfirmable, RequestType::Post);
        packet.payload = vec![0; COAP_MTU];
        assert_eq!(
            packet.to_bytes(),
            Err(EncodeError::MessageTooLarge {
                size: COAP_MTU + 5,
                limit: COAP_MTU
            })
        );
        assert!(encode_with_limit(&packet, 2 * COAP_MTU).is_ok());
    }

    #[test]
    fn test_decode_errors() {
        assert_eq!(decode(&[0x40, 0x01, 0x00]), Err(DecodeError::Truncated));
        assert_eq!(decode(&[]), Err(DecodeError::Truncated));
        assert_eq!(
            decode(&[0x49, 0x01, 0x00, 0x01, 0, 0, 0, 0, 0, 0, 0, 0, 0]),
            Err(DecodeError::Malformed("token length above 8"))
        );
        assert_eq!(
            decode(&[0x80, 0x01, 0x00, 0x01]),
            Err(DecodeError::Malformed("unsupported version"))
        );
        assert_eq!(
            decode(&[0x42, 0x01, 0x00, 0x01, 0xAA]),
            Err(DecodeError::Malformed("token runs past end of buffer"))
        );
        assert_eq!(
            decode(&[0x40, 0x01, 0x00, 0x01, 0xFF]),
            Err(DecodeError::Malformed("payload marker without payload"))
        );
        assert_eq!(
            decode(&[0x40, 0x01, 0x00, 0x01, 0xF0]),
            Err(DecodeError::Malformed("reserved option nibble"))
        );
    }

    #[test]
    fn test_view_borrows_from_datagram() {
        let buf = Bytes::from_static(&[
            0x52, 0x02, 0x00, 0x07, 0xA1, 0xB2, 0xB1, b'x', 0xFF, b'h', b'i',
        ]);
        let view = MessageView::parse(&buf).unwrap();
        assert_eq!(view.header.message_type, MessageType::NonConfirmable);
        assert_eq!(view.token, &[0xA1, 0xB2]);
        assert_eq!(view.options().collect::<Vec<_>>(), vec![(11, &b"x"[..])]);
        assert_eq!(view.payload, b"hi");
        assert_eq!(view.payload.as_ptr(), buf[9..].as_ptr());
    }

    #[test]
    fn test_path_and_content_format() {
        let mut packet = CoapMessage::new();
        packet.set_path("/sensors/temp/");
        assert_eq!(packet.get_option(CoapOption::UriPath).map(|v| v.len()), Some(2));
        assert_eq!(packet.get_path(), "sensors/temp");

        assert!(packet.get_content_format().is_none());
        packet.set_content_format(ContentFormat::ApplicationJSON);
        assert_eq!(packet.get_content_format(), Some(ContentFormat::ApplicationJSON));
        packet.set_content_format(ContentFormat::TextPlain);
        assert_eq!(packet.get_first_option(CoapOption::ContentFormat), Some(&[][..]));
        assert_eq!(packet.get_content_format(), Some(ContentFormat::TextPlain));
    }

    impl Arbitrary for CoapMessage {
        fn arbitrary(g: &mut Gen) -> Self {
            let mut message = CoapMessage::new();
            message.message_type = MessageType::from_bits(u8::arbitrary(g));
            message.code = u8::arbitrary(g);
            message.message_id = u16::arbitrary(g);

            let token: Vec<u8> = Vec::arbitrary(g);
            message.set_token(token.into_iter().take(MAX_TOKEN_LENGTH).collect());

            let count = usize::arbitrary(g) % 6;
            for _ in 0..count {
                let number = u16::arbitrary(g);
                let value: Vec<u8> = Vec::arbitrary(g);
                message.add_option(CoapOption::from(number), value);
            }
            message.payload = Vec::arbitrary(g);
            message
        }
    }

    #[test]
    fn test_round_trip() {
        fn run(message: CoapMessage) -> TestResult {
            match encode_with_limit(&message, usize::MAX) {
                Ok(bytes) => TestResult::from_bool(decode(&bytes) == Ok(message)),
                Err(_) => TestResult::discard(),
            }
        }
        QuickCheck::new()
            .tests(2000)
            .quickcheck(run as fn(CoapMessage) -> TestResult)
    }

    #[test]
    fn test_malicious_packet() {
        fn run(x: Vec<u8>) -> TestResult {
            match decode(&x[..]) {
                Ok(packet) => TestResult::from_bool(packet.token().len() == (x[0] & 0x0F) as usize),
                Err(_) => TestResult::passed(),
            }
        }
        QuickCheck::new()
            .tests(10000)
            .gen(Gen::new(1500))
            .quickcheck(run as fn(Vec<u8>) -> TestResult)
    }
}
