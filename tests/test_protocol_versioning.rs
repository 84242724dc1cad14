//! Protocol version byte tests: encoding, decoding, and the backward
//! compatibility ordering used when reasoning about mixed-version networks.

use betanet_mixcore::core::protocol_version::ProtocolVersion;

#[test]
fn v1_2_is_backward_compatible_with_v1_1_and_v1_0() {
    let v1_2 = ProtocolVersion::V1_2_0;
    let v1_1 = ProtocolVersion::V1_1_0;
    let v1_0 = ProtocolVersion::new(1, 0, 0);

    assert!(v1_2.is_compatible_with(&v1_1));
    assert!(v1_2.is_compatible_with(&v1_0));
    assert!(v1_1.is_compatible_with(&v1_0));
}

#[test]
fn older_minor_versions_cannot_talk_to_newer_ones() {
    let v1_1 = ProtocolVersion::V1_1_0;
    let v1_2 = ProtocolVersion::V1_2_0;
    let v1_0 = ProtocolVersion::new(1, 0, 0);

    assert!(!v1_1.is_compatible_with(&v1_2));
    assert!(!v1_0.is_compatible_with(&v1_2));
}

#[test]
fn different_major_versions_are_never_compatible() {
    let v1_2 = ProtocolVersion::new(1, 2, 0);
    let v2_0 = ProtocolVersion::new(2, 0, 0);

    assert!(!v1_2.is_compatible_with(&v2_0));
    assert!(!v2_0.is_compatible_with(&v1_2));
}

#[test]
fn version_byte_encoding_round_trips() {
    let v1_2 = ProtocolVersion::V1_2_0;
    let encoded = v1_2.encode_byte();
    assert_eq!(encoded, 0x12);

    let decoded = ProtocolVersion::decode_byte(encoded);
    assert_eq!(decoded, Some(ProtocolVersion::new(1, 2, 0)));
}

#[test]
fn unknown_version_byte_fails_to_decode() {
    assert_eq!(ProtocolVersion::decode_byte(0xFF), None);
    assert_eq!(ProtocolVersion::decode_byte(0x00), None);
}

#[test]
fn protocol_id_matches_the_betanet_multiaddr_convention() {
    let v1_2 = ProtocolVersion::V1_2_0;
    assert_eq!(v1_2.to_protocol_id(), "/betanet/mix/1.2.0");
}

#[test]
fn display_matches_semver_formatting() {
    let v = ProtocolVersion::new(1, 2, 3);
    assert_eq!(v.to_string(), "1.2.3");
}

#[test]
fn default_version_is_the_current_release() {
    assert_eq!(ProtocolVersion::default(), ProtocolVersion::V1_2_0);
}
