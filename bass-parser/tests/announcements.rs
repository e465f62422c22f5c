//! Decoding of complete advertising records as a scanner would deliver them

use bass_parser::{AdvertisingRecord, BaseDecoder, DecodeOutcome, ParseError};

#[rustfmt::skip]
fn stereo_base() -> Vec<u8> {
    vec![
        0x40, 0x9C, 0x00,                               // 40 ms presentation delay
        0x02,                                           // two subgroups
        // subgroup 0: english, BIS 1 and 2
        0x02,
        0x06, 0x00, 0x00, 0x00, 0x00,
        0x07, 0x02, 0x01, 0x08, 0x03, 0x04, 0x78, 0x00,
        0x05, 0x04, 0x04, b'e', b'n', b'g',
        0x01, 0x06, 0x05, 0x03, 0x01, 0x00, 0x00, 0x00,
        0x02, 0x06, 0x05, 0x03, 0x02, 0x00, 0x00, 0x00,
        // subgroup 1: spanish, BIS 3
        0x01,
        0x06, 0x00, 0x00, 0x00, 0x00,
        0x03, 0x02, 0x01, 0x05,
        0x05, 0x04, 0x04, b's', b'p', b'a',
        0x03, 0x00,
    ]
}

#[test]
fn test_extended_advertising_record() {
    let record = AdvertisingRecord::new()
        .with_service_data(0x1852, [0x0C, 0x0B, 0x0A])
        .with_service_data(0x1856, [0x02, 0x00])
        .with_broadcast_name("Terminal B");

    let id = BaseDecoder::broadcast_id(&record).unwrap().unwrap();
    assert_eq!(id.to_string(), "0x0a0b0c");

    let pba = BaseDecoder::public_broadcast(&record).unwrap().unwrap();
    assert!(pba.has_standard_quality());
    assert!(!pba.is_encrypted());
    assert!(pba.metadata.is_empty());

    assert_eq!(BaseDecoder::broadcast_name(&record).as_deref(), Some("Terminal B"));
    assert_eq!(BaseDecoder::base(&record), Ok(None));
}

#[test]
fn test_periodic_advertising_record_with_two_subgroups() {
    let record = AdvertisingRecord::new().with_service_data(0x1851, stereo_base());

    let DecodeOutcome::Updated(base) = BaseDecoder::refresh(&record) else {
        panic!("expected a decoded BASE");
    };

    assert_eq!(base.presentation_delay_us, 40_000);
    assert_eq!(base.subgroups.len(), 2);
    assert_eq!(base.bis_count(), 3);
    assert_eq!(base.bis_sync_masks(), vec![0b011, 0b100]);

    let english = &base.subgroups[0];
    assert_eq!(english.metadata.language().as_deref(), Some("eng"));
    assert_eq!(english.codec_config.sampling_frequency_hz(), Some(48_000));
    assert_eq!(english.codec_config.octets_per_codec_frame(), Some(120));
    assert_eq!(english.bis[1].codec_config.audio_channel_allocation(), Some(2));

    let spanish = &base.subgroups[1];
    assert_eq!(spanish.metadata.language().as_deref(), Some("spa"));
    assert_eq!(spanish.codec_config.sampling_frequency_hz(), Some(24_000));
}

#[test]
fn test_every_truncation_is_rejected() {
    let full = stereo_base();
    for len in 0..full.len() {
        let record = AdvertisingRecord::new().with_service_data(0x1851, full[..len].to_vec());
        match BaseDecoder::refresh(&record) {
            DecodeOutcome::Retained(ParseError::UnexpectedDataLength { .. }) => {}
            other => panic!("length {len}: unexpected outcome {other:?}"),
        }
    }
}
