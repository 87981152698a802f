//! Small DER building blocks on top of bcder.

use std::{error, fmt, io};
use std::convert::Infallible;
use bcder::{Mode, OctetString, Tag};
use bcder::decode::DecodeError;
use bcder::encode::{self, Values};
use bytes::Bytes;
use chrono::{DateTime, Timelike, Utc};


//------------ RawDer --------------------------------------------------------

/// Already encoded DER that is written out as is.
#[derive(Clone, Debug)]
pub struct RawDer(Bytes);

impl RawDer {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        RawDer(bytes.into())
    }

    pub fn as_slice(&self) -> &[u8] {
        self.0.as_ref()
    }
}

impl encode::Values for RawDer {
    fn encoded_len(&self, _mode: Mode) -> usize {
        self.0.len()
    }

    fn write_encoded<W: io::Write>(
        &self,
        _mode: Mode,
        target: &mut W
    ) -> Result<(), io::Error> {
        target.write_all(self.0.as_ref())
    }
}


//------------ Encoding helpers ----------------------------------------------

/// Encodes values into a DER byte vector.
pub fn to_vec(values: &impl Values) -> Vec<u8> {
    let mut res = Vec::with_capacity(values.encoded_len(Mode::Der));
    // Writing into a vec cannot fail.
    let _ = values.write_encoded(Mode::Der, &mut res);
    res
}

/// Returns the content octets of an INTEGER for an unsigned big endian value.
pub fn unsigned_content(bytes: &[u8]) -> Vec<u8> {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    let trimmed = &bytes[start..];
    let mut res = Vec::with_capacity(trimmed.len() + 1);
    if trimmed.first().is_none_or(|b| b & 0x80 != 0) {
        res.push(0);
    }
    res.extend_from_slice(trimmed);
    res
}

/// Encodes an unsigned big endian value as an INTEGER.
pub fn unsigned(bytes: &[u8]) -> impl Values {
    OctetString::encode_slice_as(Bytes::from(unsigned_content(bytes)), Tag::INTEGER)
}

/// Encodes a time as a GeneralizedTime with at most millisecond precision.
///
/// Trailing zeroes of the fraction are dropped as DER requires.
pub fn generalized_time(time: DateTime<Utc>) -> impl Values {
    let mut s = time.format("%Y%m%d%H%M%S").to_string();
    let millis = time.nanosecond() / 1_000_000 % 1000;
    if millis != 0 {
        let fraction = format!("{millis:03}");
        s.push('.');
        s.push_str(fraction.trim_end_matches('0'));
    }
    s.push('Z');
    OctetString::encode_slice_as(Bytes::from(s), Tag::GENERALIZED_TIME)
}

/// Encodes a UTF8String.
pub fn utf8_string(s: &str) -> impl Values {
    OctetString::encode_slice_as(Bytes::copy_from_slice(s.as_bytes()), Tag::UTF8_STRING)
}

/// Encodes a BIT STRING with a single named bit set.
pub fn named_bit(bit: usize) -> impl Values {
    let mut content = vec![0u8; bit / 8 + 2];
    content[0] = 7 - (bit % 8) as u8;
    content[bit / 8 + 1] = 0x80 >> (bit % 8);
    OctetString::encode_slice_as(Bytes::from(content), Tag::BIT_STRING)
}

/// Sorts encoded elements as DER requires for a SET OF and joins them.
pub fn set_of_content(mut elements: Vec<Vec<u8>>) -> Vec<u8> {
    elements.sort();
    elements.concat()
}

/// Wraps content octets into a complete TLV with a single byte tag.
pub fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut res = Vec::with_capacity(content.len() + 6);
    res.push(tag);
    let len = content.len();
    if len < 0x80 {
        res.push(len as u8);
    }
    else {
        let len_bytes = len.to_be_bytes();
        let start = len_bytes.iter().position(|b| *b != 0).unwrap_or(0);
        res.push(0x80 | (len_bytes.len() - start) as u8);
        res.extend_from_slice(&len_bytes[start..]);
    }
    res.extend_from_slice(content);
    res
}

/// Tag byte of a universal constructed SET.
pub const SET_TAG: u8 = 0x31;


//------------ CodecError ----------------------------------------------------

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CodecError {
    Decode(String),
    Encode(String),
}

impl CodecError {
    pub fn encode(msg: impl fmt::Display) -> Self {
        CodecError::Encode(msg.to_string())
    }
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CodecError::Decode(msg) => write!(f, "cannot decode: {msg}"),
            CodecError::Encode(msg) => write!(f, "cannot encode: {msg}"),
        }
    }
}

impl error::Error for CodecError {}

impl From<DecodeError<Infallible>> for CodecError {
    fn from(err: DecodeError<Infallible>) -> Self {
        CodecError::Decode(err.to_string())
    }
}


//------------ Tests ---------------------------------------------------------
