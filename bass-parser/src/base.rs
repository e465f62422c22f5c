//! Broadcast Audio Source Endpoint (BASE) decoding
//!
//! The BASE is carried in the Basic Audio Announcement service data of the
//! periodic advertising train. It is a three-level structure:
//!
//! 1. presentation delay and subgroup count
//! 2. per subgroup: BIS count, codec id, codec configuration, metadata
//! 3. per BIS: index and BIS-specific codec configuration
//!
//! Every length prefix is checked against the bytes that remain, so a
//! truncated or inconsistent buffer yields an error instead of a partial value.

use serde::{Deserialize, Serialize};

use crate::error::{ParseError, ParseResult};
use crate::ltv::{CodecConfiguration, Metadata};

/// Cursor over a byte buffer that reports truncation with context
struct Reader<'a> {
    buf: &'a [u8],
    idx: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, idx: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.idx
    }

    fn take(&mut self, len: usize, context: &'static str) -> ParseResult<&'a [u8]> {
        if len > self.remaining() {
            return Err(ParseError::UnexpectedDataLength {
                context,
                needed: len,
                remaining: self.remaining(),
            });
        }
        let out = &self.buf[self.idx..self.idx + len];
        self.idx += len;
        Ok(out)
    }

    fn u8(&mut self, context: &'static str) -> ParseResult<u8> {
        Ok(self.take(1, context)?[0])
    }

    fn length_prefixed(&mut self, context: &'static str) -> ParseResult<&'a [u8]> {
        let len = self.u8(context)? as usize;
        self.take(len, context)
    }
}

/// Five-byte codec identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CodecId {
    pub coding_format: u8,
    pub company_id: u16,
    pub vendor_codec_id: u16,
}

impl CodecId {
    pub const BYTE_SIZE: usize = 5;
    pub const LC3: u8 = 0x06;

    pub fn lc3() -> Self {
        Self { coding_format: Self::LC3, company_id: 0, vendor_codec_id: 0 }
    }

    pub fn is_lc3(&self) -> bool {
        self.coding_format == Self::LC3
    }

    fn decode(bytes: &[u8]) -> Self {
        Self {
            coding_format: bytes[0],
            company_id: u16::from_le_bytes([bytes[1], bytes[2]]),
            vendor_codec_id: u16::from_le_bytes([bytes[3], bytes[4]]),
        }
    }
}

/// Broadcast isochronous stream entry of a subgroup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bis {
    pub index: u8,
    pub codec_config: CodecConfiguration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subgroup {
    pub codec_id: CodecId,
    pub codec_config: CodecConfiguration,
    pub metadata: Metadata,
    pub bis: Vec<Bis>,
}

impl Subgroup {
    pub fn bis_indices(&self) -> Vec<u8> {
        self.bis.iter().map(|b| b.index).collect()
    }

    /// Bitmask with bit `index - 1` set for every BIS in the subgroup
    pub fn bis_sync_mask(&self) -> u32 {
        self.bis
            .iter()
            .filter(|b| (1..=32).contains(&b.index))
            .fold(0, |mask, b| mask | 1 << (b.index - 1))
    }
}

/// Decoded BASE
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Base {
    pub presentation_delay_us: u32,
    pub subgroups: Vec<Subgroup>,
}

impl Base {
    pub const PRESENTATION_DELAY_SIZE: usize = 3;

    /// Decode a BASE from Basic Audio Announcement service data
    ///
    /// Bytes after the last BIS entry are ignored.
    pub fn decode(buf: &[u8]) -> ParseResult<Self> {
        let mut reader = Reader::new(buf);

        let delay = reader.take(Self::PRESENTATION_DELAY_SIZE, "presentation delay")?;
        let presentation_delay_us = u32::from_le_bytes([delay[0], delay[1], delay[2], 0]);

        let num_subgroups = reader.u8("subgroup count")?;
        if num_subgroups == 0 {
            return Err(ParseError::InvalidSubgroupCount(num_subgroups));
        }

        let mut subgroups = Vec::with_capacity(num_subgroups as usize);
        for subgroup in 0..num_subgroups as usize {
            subgroups.push(Self::decode_subgroup(&mut reader, subgroup)?);
        }

        Ok(Self { presentation_delay_us, subgroups })
    }

    fn decode_subgroup(reader: &mut Reader<'_>, subgroup: usize) -> ParseResult<Subgroup> {
        // BIS count, codec id and both length bytes must be present up front.
        let minimum = 1 + CodecId::BYTE_SIZE + 2;
        if reader.remaining() < minimum {
            return Err(ParseError::UnexpectedDataLength {
                context: "subgroup header",
                needed: minimum,
                remaining: reader.remaining(),
            });
        }

        let num_bis = reader.u8("BIS count")?;
        if num_bis == 0 {
            return Err(ParseError::InvalidBisCount { subgroup, count: num_bis });
        }

        let codec_id = CodecId::decode(reader.take(CodecId::BYTE_SIZE, "codec id")?);
        let codec_config =
            CodecConfiguration::from_raw(reader.length_prefixed("subgroup codec configuration")?);
        let metadata = Metadata::from_raw(reader.length_prefixed("subgroup metadata")?);

        let mut bis = Vec::with_capacity(num_bis as usize);
        for _ in 0..num_bis {
            let index = reader.u8("BIS index")?;
            let codec_config =
                CodecConfiguration::from_raw(reader.length_prefixed("BIS codec configuration")?);
            bis.push(Bis { index, codec_config });
        }

        Ok(Subgroup { codec_id, codec_config, metadata, bis })
    }

    pub fn bis_count(&self) -> usize {
        self.subgroups.iter().map(|s| s.bis.len()).sum()
    }

    /// Per-subgroup BIS sync masks covering every advertised BIS
    pub fn bis_sync_masks(&self) -> Vec<u32> {
        self.subgroups.iter().map(Subgroup::bis_sync_mask).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rustfmt::skip]
    const TWO_BIS: [u8; 36] = [
        0x20, 0x4E, 0x00,                   // presentation delay 20000 us
        0x01,                               // one subgroup
        0x02,                               // two BIS
        0x06, 0x00, 0x00, 0x00, 0x00,       // LC3
        0x0A,                               // codec configuration length
        0x02, 0x01, 0x08,
        0x02, 0x02, 0x01,
        0x03, 0x04, 0x64, 0x00,
        0x04,                               // metadata length
        0x03, 0x02, 0x04, 0x00,
        0x01, 0x06,                         // BIS 1, config length 6
        0x05, 0x03, 0x01, 0x00, 0x00, 0x00,
        0x02, 0x00,                         // BIS 2, no config
    ];

    #[test]
    fn test_decode_two_bis() {
        let base = Base::decode(&TWO_BIS).unwrap();
        assert_eq!(base.presentation_delay_us, 20_000);
        assert_eq!(base.subgroups.len(), 1);

        let subgroup = &base.subgroups[0];
        assert!(subgroup.codec_id.is_lc3());
        assert_eq!(subgroup.codec_config.sampling_frequency_hz(), Some(48_000));
        assert_eq!(subgroup.metadata.streaming_audio_contexts(), Some(0x0004));
        assert_eq!(subgroup.bis_indices(), vec![1, 2]);
        assert_eq!(subgroup.bis_sync_mask(), 0b11);
        assert_eq!(subgroup.bis[0].codec_config.audio_channel_allocation(), Some(1));
        assert!(subgroup.bis[1].codec_config.is_empty());
        assert_eq!(base.bis_count(), 2);
    }

    #[test]
    fn test_trailing_bytes_ignored() {
        let mut buf = TWO_BIS.to_vec();
        buf.extend_from_slice(&[0xAA, 0xBB]);
        assert_eq!(Base::decode(&buf).unwrap(), Base::decode(&TWO_BIS).unwrap());
    }

    #[rstest]
    #[case::empty(0)]
    #[case::delay_only(3)]
    #[case::header_cut(8)]
    #[case::codec_config_cut(15)]
    #[case::metadata_cut(24)]
    #[case::first_bis_cut(30)]
    #[case::last_bis_cut(35)]
    fn test_truncated_base_is_rejected(#[case] len: usize) {
        let err = Base::decode(&TWO_BIS[..len]).unwrap_err();
        assert!(matches!(err, ParseError::UnexpectedDataLength { .. }), "{err:?}");
    }

    #[test]
    fn test_zero_subgroups_rejected() {
        assert_eq!(
            Base::decode(&[0x00, 0x00, 0x00, 0x00]).unwrap_err(),
            ParseError::InvalidSubgroupCount(0)
        );
    }

    #[test]
    fn test_zero_bis_rejected() {
        #[rustfmt::skip]
        let buf = [
            0x00, 0x00, 0x00,
            0x01,
            0x00,
            0x06, 0x00, 0x00, 0x00, 0x00,
            0x00,
            0x00,
        ];
        assert_eq!(
            Base::decode(&buf).unwrap_err(),
            ParseError::InvalidBisCount { subgroup: 0, count: 0 }
        );
    }

    #[test]
    fn test_declared_subgroups_exceed_data() {
        let mut buf = TWO_BIS.to_vec();
        buf[3] = 0x02;
        assert!(Base::decode(&buf).is_err());
    }
}
