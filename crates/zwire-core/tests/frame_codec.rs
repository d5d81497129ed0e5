//! Frame codec properties.
//!
//! The Serial API checksum is the XOR of 0xff with every byte from the
//! length field through the payload; these tests pin the self-inverse
//! property and single-bit error detection across the input space.

use proptest::prelude::*;

use zwire_core::protocol::{checksum, func, message::Message, REQUEST};

/// Build a frame body (length byte onward, checksum excluded) for an
/// arbitrary payload.
fn body(function: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![(payload.len() + 3) as u8, REQUEST, function];
    out.extend_from_slice(payload);
    out
}

proptest! {
    /// Encoding then verifying any legal payload round-trips.
    #[test]
    fn checksum_self_inverse(function in any::<u8>(), payload in proptest::collection::vec(any::<u8>(), 0..250)) {
        let body = body(function, &payload);
        let cs = checksum(&body);
        // Folding the checksum back into the body yields the fixed seed.
        let folded = body.iter().fold(cs, |acc, b| acc ^ b);
        prop_assert_eq!(folded, 0xff);
    }

    /// Any single-bit flip anywhere in the body is detected.
    #[test]
    fn single_bit_flip_is_detected(
        function in any::<u8>(),
        payload in proptest::collection::vec(any::<u8>(), 0..250),
        flip_byte in any::<prop::sample::Index>(),
        flip_bit in 0u8..8,
    ) {
        let body = body(function, &payload);
        let cs = checksum(&body);

        let mut corrupted = body.clone();
        let idx = flip_byte.index(corrupted.len());
        corrupted[idx] ^= 1 << flip_bit;

        prop_assert_ne!(checksum(&corrupted), cs);
    }

    /// A finalised message carries a verifiable checksum and the documented
    /// layout.
    #[test]
    fn finalized_messages_verify(node_id in 1u8..=232, payload in proptest::collection::vec(any::<u8>(), 0..32)) {
        let mut msg = Message::new("arbitrary", node_id, REQUEST, func::ZW_SEND_DATA, false);
        msg.append_slice(&payload);
        msg.finalize(0).unwrap();

        let buf = msg.buffer();
        prop_assert_eq!(buf[0], 0x01); // SOF
        prop_assert_eq!(usize::from(buf[1]), payload.len() + 3);
        prop_assert_eq!(checksum(&buf[1..buf.len() - 1]), buf[buf.len() - 1]);
    }
}

#[test]
fn known_frame_vector() {
    // GET_VERSION request as it appears on the wire.
    let mut msg = Message::new(
        "get version",
        0xff,
        REQUEST,
        func::ZW_GET_VERSION,
        false,
    );
    msg.finalize(0).unwrap();
    assert_eq!(msg.buffer(), &[0x01, 0x03, 0x00, 0x15, 0xe9]);
}
