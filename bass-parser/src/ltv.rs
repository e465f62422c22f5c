//! Length-Type-Value structures used by codec configuration and metadata
//!
//! Each entry starts with a length byte that counts the type byte plus the
//! value. Zero-length entries are padding and are skipped.

use serde::{Deserialize, Serialize};

use crate::error::{ParseError, ParseResult};

/// Single decoded LTV entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ltv {
    pub kind: u8,
    pub value: Vec<u8>,
}

impl Ltv {
    pub fn new(kind: u8, value: impl Into<Vec<u8>>) -> Self {
        Self { kind, value: value.into() }
    }

    /// Append the wire encoding of this entry to `out`
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.push((self.value.len() + 1) as u8);
        out.push(self.kind);
        out.extend_from_slice(&self.value);
    }
}

/// Decode a complete LTV list, failing if the last entry runs past the buffer
pub fn decode_ltvs(buf: &[u8], context: &'static str) -> ParseResult<Vec<Ltv>> {
    let mut entries = Vec::new();
    let mut idx = 0;

    while idx < buf.len() {
        let length = buf[idx] as usize;
        idx += 1;
        if length == 0 {
            continue;
        }

        let remaining = buf.len() - idx;
        if length > remaining {
            return Err(ParseError::UnexpectedDataLength { context, needed: length, remaining });
        }

        entries.push(Ltv::new(buf[idx], &buf[idx + 1..idx + length]));
        idx += length;
    }

    Ok(entries)
}

/// Encode a list of entries back to their wire form
pub fn encode_ltvs(entries: &[Ltv]) -> Vec<u8> {
    let mut out = Vec::new();
    for entry in entries {
        entry.encode_into(&mut out);
    }
    out
}

/// Value of the first entry of `kind`, stopping at the first malformed entry
fn find(raw: &[u8], kind: u8) -> Option<&[u8]> {
    let mut idx = 0;
    while idx < raw.len() {
        let length = raw[idx] as usize;
        idx += 1;
        if length == 0 {
            continue;
        }
        let end = idx + length;
        if end > raw.len() {
            return None;
        }
        if raw[idx] == kind {
            return Some(&raw[idx + 1..end]);
        }
        idx = end;
    }
    None
}

/// Sampling frequency codes from the Assigned Numbers document
fn sampling_frequency_hz(code: u8) -> Option<u32> {
    let hz = match code {
        0x01 => 8_000,
        0x02 => 11_025,
        0x03 => 16_000,
        0x04 => 22_050,
        0x05 => 24_000,
        0x06 => 32_000,
        0x07 => 44_100,
        0x08 => 48_000,
        0x09 => 88_200,
        0x0A => 96_000,
        0x0B => 176_400,
        0x0C => 192_000,
        0x0D => 384_000,
        _ => return None,
    };
    Some(hz)
}

/// Codec-specific configuration attached to a subgroup or a BIS
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecConfiguration {
    raw: Vec<u8>,
}

impl CodecConfiguration {
    pub const SAMPLING_FREQUENCY: u8 = 0x01;
    pub const FRAME_DURATION: u8 = 0x02;
    pub const AUDIO_CHANNEL_ALLOCATION: u8 = 0x03;
    pub const OCTETS_PER_CODEC_FRAME: u8 = 0x04;
    pub const CODEC_FRAME_BLOCKS_PER_SDU: u8 = 0x05;

    pub fn from_raw(raw: impl Into<Vec<u8>>) -> Self {
        Self { raw: raw.into() }
    }

    pub fn from_ltvs(entries: &[Ltv]) -> Self {
        Self { raw: encode_ltvs(entries) }
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    pub fn ltvs(&self) -> ParseResult<Vec<Ltv>> {
        decode_ltvs(&self.raw, "codec configuration")
    }

    pub fn sampling_frequency_hz(&self) -> Option<u32> {
        match find(&self.raw, Self::SAMPLING_FREQUENCY)? {
            [code] => sampling_frequency_hz(*code),
            _ => None,
        }
    }

    pub fn frame_duration_us(&self) -> Option<u32> {
        match find(&self.raw, Self::FRAME_DURATION)? {
            [0x00] => Some(7_500),
            [0x01] => Some(10_000),
            _ => None,
        }
    }

    pub fn audio_channel_allocation(&self) -> Option<u32> {
        match find(&self.raw, Self::AUDIO_CHANNEL_ALLOCATION)? {
            [a, b, c, d] => Some(u32::from_le_bytes([*a, *b, *c, *d])),
            _ => None,
        }
    }

    pub fn octets_per_codec_frame(&self) -> Option<u16> {
        match find(&self.raw, Self::OCTETS_PER_CODEC_FRAME)? {
            [a, b] => Some(u16::from_le_bytes([*a, *b])),
            _ => None,
        }
    }

    pub fn codec_frame_blocks_per_sdu(&self) -> Option<u8> {
        match find(&self.raw, Self::CODEC_FRAME_BLOCKS_PER_SDU)? {
            [n] => Some(*n),
            _ => None,
        }
    }
}

/// Metadata LTVs attached to a subgroup or a public broadcast announcement
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    raw: Vec<u8>,
}

impl Metadata {
    pub const PREFERRED_AUDIO_CONTEXTS: u8 = 0x01;
    pub const STREAMING_AUDIO_CONTEXTS: u8 = 0x02;
    pub const PROGRAM_INFO: u8 = 0x03;
    pub const LANGUAGE: u8 = 0x04;
    pub const CCID_LIST: u8 = 0x05;
    pub const PARENTAL_RATING: u8 = 0x06;
    pub const PROGRAM_INFO_URI: u8 = 0x07;

    pub fn from_raw(raw: impl Into<Vec<u8>>) -> Self {
        Self { raw: raw.into() }
    }

    pub fn from_ltvs(entries: &[Ltv]) -> Self {
        Self { raw: encode_ltvs(entries) }
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    pub fn ltvs(&self) -> ParseResult<Vec<Ltv>> {
        decode_ltvs(&self.raw, "metadata")
    }

    pub fn streaming_audio_contexts(&self) -> Option<u16> {
        match find(&self.raw, Self::STREAMING_AUDIO_CONTEXTS)? {
            [a, b] => Some(u16::from_le_bytes([*a, *b])),
            _ => None,
        }
    }

    pub fn program_info(&self) -> Option<String> {
        find(&self.raw, Self::PROGRAM_INFO).map(|v| String::from_utf8_lossy(v).into_owned())
    }

    /// ISO 639-3 language code
    pub fn language(&self) -> Option<String> {
        match find(&self.raw, Self::LANGUAGE)? {
            code @ [_, _, _] => std::str::from_utf8(code).ok().map(str::to_owned),
            _ => None,
        }
    }

    pub fn parental_rating(&self) -> Option<u8> {
        match find(&self.raw, Self::PARENTAL_RATING)? {
            [rating] => Some(*rating),
            _ => None,
        }
    }
}
