use std::collections::BTreeMap;

use bytes::{BufMut, BytesMut};

use crate::error::{DecodeError, EncodeError};

/// Byte that separates the option block from the payload.
pub const PAYLOAD_MARKER: u8 = 0xFF;

const NIBBLE_BYTE_EXT: u8 = 13;
const NIBBLE_WORD_EXT: u8 = 14;
const NIBBLE_RESERVED: u8 = 15;

const BYTE_EXT_BASE: usize = 13;
const WORD_EXT_BASE: usize = 269;

/// Largest delta or length the 16-bit extension can carry.
pub const MAX_EXTENDED_VALUE: usize = WORD_EXT_BASE + u16::MAX as usize;

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum CoapOption {
    IfMatch,
    UriHost,
    ETag,
    IfNoneMatch,
    Observe,
    UriPort,
    LocationPath,
    UriPath,
    ContentFormat,
    MaxAge,
    UriQuery,
    Accept,
    LocationQuery,
    Block2,
    Block1,
    Size2,
    ProxyUri,
    ProxyScheme,
    Size1,
    NoResponse,
    Unknown(u16),
}

impl From<CoapOption> for u16 {
    fn from(option: CoapOption) -> u16 {
        match option {
            CoapOption::IfMatch => 1,
            CoapOption::UriHost => 3,
            CoapOption::ETag => 4,
            CoapOption::IfNoneMatch => 5,
            CoapOption::Observe => 6,
            CoapOption::UriPort => 7,
            CoapOption::LocationPath => 8,
            CoapOption::UriPath => 11,
            CoapOption::ContentFormat => 12,
            CoapOption::MaxAge => 14,
            CoapOption::UriQuery => 15,
            CoapOption::Accept => 17,
            CoapOption::LocationQuery => 20,
            CoapOption::Block2 => 23,
            CoapOption::Block1 => 27,
            CoapOption::Size2 => 28,
            CoapOption::ProxyUri => 35,
            CoapOption::ProxyScheme => 39,
            CoapOption::Size1 => 60,
            CoapOption::NoResponse => 258,
            CoapOption::Unknown(n) => n,
        }
    }
}

impl From<u16> for CoapOption {
    fn from(number: u16) -> CoapOption {
        match number {
            1 => CoapOption::IfMatch,
            3 => CoapOption::UriHost,
            4 => CoapOption::ETag,
            5 => CoapOption::IfNoneMatch,
            6 => CoapOption::Observe,
            7 => CoapOption::UriPort,
            8 => CoapOption::LocationPath,
            11 => CoapOption::UriPath,
            12 => CoapOption::ContentFormat,
            14 => CoapOption::MaxAge,
            15 => CoapOption::UriQuery,
            17 => CoapOption::Accept,
            20 => CoapOption::LocationQuery,
            23 => CoapOption::Block2,
            27 => CoapOption::Block1,
            28 => CoapOption::Size2,
            35 => CoapOption::ProxyUri,
            39 => CoapOption::ProxyScheme,
            60 => CoapOption::Size1,
            258 => CoapOption::NoResponse,
            n => CoapOption::Unknown(n),
        }
    }
}

impl CoapOption {
    /// Critical options must be understood by the receiver.
    pub fn is_critical(self) -> bool {
        u16::from(self) & 0x01 != 0
    }

    /// Unsafe options must be understood by a proxy forwarding them.
    pub fn is_unsafe(self) -> bool {
        u16::from(self) & 0x02 != 0
    }

    pub fn is_no_cache_key(self) -> bool {
        u16::from(self) & 0x1E == 0x1C
    }
}

/// Media types registered for the Content-Format option.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ContentFormat {
    TextPlain = 0,
    ApplicationCoseSign1 = 18,
    ApplicationLinkFormat = 40,
    ApplicationXML = 41,
    ApplicationOctetStream = 42,
    ApplicationRdfXML = 43,
    ApplicationEXI = 47,
    ApplicationJSON = 50,
    ApplicationCBOR = 60,
    ApplicationCoseSign = 98,
}

impl ContentFormat {
    pub fn from_u16(value: u16) -> Option<ContentFormat> {
        Some(match value {
            0 => ContentFormat::TextPlain,
            18 => ContentFormat::ApplicationCoseSign1,
            40 => ContentFormat::ApplicationLinkFormat,
            41 => ContentFormat::ApplicationXML,
            42 => ContentFormat::ApplicationOctetStream,
            43 => ContentFormat::ApplicationRdfXML,
            47 => ContentFormat::ApplicationEXI,
            50 => ContentFormat::ApplicationJSON,
            60 => ContentFormat::ApplicationCBOR,
            98 => ContentFormat::ApplicationCoseSign,
            _ => return None,
        })
    }
}

/// Encodes an unsigned option value with no leading zero bytes.
pub fn encode_uint(value: u32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    bytes[skip..].to_vec()
}

/// Reads an unsigned option value; `None` if it is wider than 4 bytes.
pub fn decode_uint(value: &[u8]) -> Option<u32> {
    if value.len() > 4 {
        return None;
    }
    Some(value.iter().fold(0u32, |acc, b| (acc << 8) | *b as u32))
}

enum Extension {
    None,
    Byte(u8),
    Word(u16),
}

// Picks the smallest form able to carry `value`.
fn split_nibble(value: usize) -> Option<(u8, Extension)> {
    if value < BYTE_EXT_BASE {
        Some((value as u8, Extension::None))
    } else if value < WORD_EXT_BASE {
        Some((NIBBLE_BYTE_EXT, Extension::Byte((value - BYTE_EXT_BASE) as u8)))
    } else if value <= MAX_EXTENDED_VALUE {
        Some((NIBBLE_WORD_EXT, Extension::Word((value - WORD_EXT_BASE) as u16)))
    } else {
        None
    }
}

fn put_extension(buf: &mut BytesMut, ext: Extension) {
    match ext {
        Extension::None => {}
        Extension::Byte(b) => buf.put_u8(b),
        Extension::Word(w) => buf.put_u16(w),
    }
}

/// Writes one option given the number of the option before it.
pub fn encode_option(
    buf: &mut BytesMut,
    previous: u16,
    number: u16,
    value: &[u8],
) -> Result<(), EncodeError> {
    let out_of_range = EncodeError::OptionOutOfRange {
        number,
        length: value.len(),
    };
    let delta = number.checked_sub(previous).ok_or(out_of_range)? as usize;
    let (delta_nibble, delta_ext) = split_nibble(delta).ok_or(out_of_range)?;
    let (length_nibble, length_ext) = split_nibble(value.len()).ok_or(out_of_range)?;

    buf.put_u8((delta_nibble << 4) | length_nibble);
    put_extension(buf, delta_ext);
    put_extension(buf, length_ext);
    buf.put_slice(value);
    Ok(())
}

/// Writes the whole option block in ascending option order.
pub fn encode_options(
    buf: &mut BytesMut,
    options: &BTreeMap<u16, Vec<Vec<u8>>>,
) -> Result<(), EncodeError> {
    let mut previous = 0;
    for (number, values) in options {
        for value in values {
            encode_option(buf, previous, *number, value)?;
            previous = *number;
        }
    }
    Ok(())
}

fn read_extended(buf: &[u8], idx: &mut usize, nibble: u8) -> Result<usize, DecodeError> {
    match nibble {
        NIBBLE_BYTE_EXT => {
            let b = *buf
                .get(*idx)
                .ok_or(DecodeError::Malformed("option extension truncated"))?;
            *idx += 1;
            Ok(b as usize + BYTE_EXT_BASE)
        }
        NIBBLE_WORD_EXT => {
            let w = buf
                .get(*idx..*idx + 2)
                .ok_or(DecodeError::Malformed("option extension truncated"))?;
            *idx += 2;
            Ok(u16::from_be_bytes([w[0], w[1]]) as usize + WORD_EXT_BASE)
        }
        NIBBLE_RESERVED => Err(DecodeError::Malformed("reserved option nibble")),
        n => Ok(n as usize),
    }
}

/// Reads the option starting at `idx`. Returns `None` at the end of the
/// block, i.e. at the end of the buffer or at a payload marker.
pub(crate) fn read_option<'a>(
    buf: &'a [u8],
    idx: usize,
    previous: u16,
) -> Result<Option<(u16, &'a [u8], usize)>, DecodeError> {
    let byte = match buf.get(idx) {
        None | Some(&PAYLOAD_MARKER) => return Ok(None),
        Some(b) => *b,
    };

    let mut idx = idx + 1;
    let delta = read_extended(buf, &mut idx, byte >> 4)?;
    let length = read_extended(buf, &mut idx, byte & 0x0F)?;

    let number = previous as usize + delta;
    if number > u16::MAX as usize {
        return Err(DecodeError::Malformed("option number overflow"));
    }

    let value = buf
        .get(idx..idx + length)
        .ok_or(DecodeError::Malformed("option value past end of buffer"))?;

    Ok(Some((number as u16, value, idx + length)))
}

/// Validates an option block and returns how many bytes it spans.
pub(crate) fn scan_options(buf: &[u8]) -> Result<usize, DecodeError> {
    let mut idx = 0;
    let mut previous = 0;
    while let Some((number, _, next)) = read_option(buf, idx, previous)? {
        previous = number;
        idx = next;
    }
    Ok(idx)
}

/// Iterator over an option block that [`scan_options`] accepted.
#[derive(Clone, Debug)]
pub struct Options<'a> {
    buf: &'a [u8],
    idx: usize,
    previous: u16,
}

impl<'a> Options<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Options<'a> {
        Options {
            buf,
            idx: 0,
            previous: 0,
        }
    }
}

impl<'a> Iterator for Options<'a> {
    type Item = (u16, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let (number, value, next) = read_option(self.buf, self.idx, self.previous).ok()??;
        self.previous = number;
        self.idx = next;
        Some((number, value))
    }
}
