//! Property-based tests for BB84 Net
//!
//! Uses proptest to verify invariants across large input spaces.

use proptest::prelude::*;

// ============================================================================
// Bit Pipeline Properties
// ============================================================================

mod bit_properties {
    use super::*;
    use bb84_core::bits::{
        CheckSelection, bits_to_bytes, check_bit_count, decrypt_message, encrypt_message, error_check,
        privacy_amplify, sift, to_bits, xor_stream,
    };
    use bb84_core::{Basis, Bit};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn bits(max_len: usize) -> impl Strategy<Value = Vec<Bit>> {
        prop::collection::vec(0u8..=1, 0..max_len)
    }

    fn basis() -> impl Strategy<Value = Basis> {
        prop_oneof![Just(Basis::Rectilinear), Just(Basis::Diagonal)]
    }

    proptest! {
        /// XOR with the same key twice restores the input
        #[test]
        fn xor_is_self_inverse(key in prop::collection::vec(0u8..=1, 1..64), data in bits(512)) {
            let once = xor_stream(&key, &data).unwrap();
            prop_assert_eq!(once.len(), data.len());
            let twice = xor_stream(&key, &once).unwrap();
            prop_assert_eq!(twice, data);
        }

        /// Any non-empty key decrypts what it encrypted
        #[test]
        fn message_survives_encryption(key in prop::collection::vec(0u8..=1, 1..64), message in "\\PC{0,64}") {
            let ciphertext = encrypt_message(&key, &message).unwrap();
            prop_assert_eq!(decrypt_message(&key, &ciphertext).unwrap(), message);
        }

        /// Text expands to eight bits per byte and packs back unchanged
        #[test]
        fn text_bits_pack_back(message in "\\PC{0,64}") {
            let expanded = to_bits(&message);
            prop_assert_eq!(expanded.len(), message.len() * 8);
            prop_assert!(expanded.iter().all(|&b| b <= 1));
            prop_assert_eq!(bits_to_bytes(&expanded), message.as_bytes().to_vec());
        }

        /// Amplification halves the key, rounding down
        #[test]
        fn amplify_halves(key in bits(512)) {
            let amplified = privacy_amplify(&key);
            if key.len() < 2 {
                prop_assert_eq!(amplified, key);
            } else {
                prop_assert_eq!(amplified.len(), key.len() / 2);
                for (i, bit) in amplified.iter().enumerate() {
                    prop_assert_eq!(*bit, key[2 * i] ^ key[2 * i + 1]);
                }
            }
        }

        /// Sequences of different length never pass the error check
        #[test]
        fn error_check_requires_equal_length(a in bits(64), b in bits(64)) {
            prop_assume!(a.len() != b.len());
            prop_assert!(!error_check(&a, &b));
        }

        /// Identical sequences always pass the error check
        #[test]
        fn error_check_accepts_identical(a in bits(64)) {
            prop_assert!(error_check(&a, &a));
        }

        /// Sifting never yields more bits than the shortest input, and keeps
        /// exactly the positions where the bases agree
        #[test]
        fn sift_keeps_agreeing_positions(
            input in bits(256),
            ours in prop::collection::vec(basis(), 0..256),
            theirs in prop::collection::vec(basis(), 0..256),
        ) {
            let sifted = sift(&input, &ours, &theirs);
            let shortest = input.len().min(ours.len()).min(theirs.len());
            prop_assert!(sifted.len() <= shortest);

            let expected: Vec<Bit> = (0..shortest)
                .filter(|&i| ours[i] == theirs[i])
                .map(|i| input[i])
                .collect();
            prop_assert_eq!(sifted, expected);
        }

        /// Sampled check bits are distinct, in range, and read from the key
        #[test]
        fn check_sample_reads_key(key in bits(512), seed in any::<u64>()) {
            let mut rng = StdRng::seed_from_u64(seed);
            let selection = CheckSelection::sample(&key, 0.2, &mut rng);
            prop_assert_eq!(selection.len(), check_bit_count(key.len(), 0.2));
            prop_assert!(selection.len() <= key.len() / 5);

            let mut seen = selection.indices.clone();
            seen.sort_unstable();
            seen.dedup();
            prop_assert_eq!(seen.len(), selection.len());

            for (&index, &value) in selection.indices.iter().zip(&selection.values) {
                prop_assert!(index < key.len());
                prop_assert_eq!(value, key[index]);
            }
        }
    }

    /// Random bases agree about half the time
    #[test]
    fn sift_keeps_about_half() {
        let mut rng = StdRng::seed_from_u64(0xBB84);
        let n = 10_000;
        let input = bb84_core::bits::random_bits(n, &mut rng);
        let ours = bb84_core::bits::random_bases(n, &mut rng);
        let theirs = bb84_core::bits::random_bases(n, &mut rng);

        let kept = sift(&input, &ours, &theirs).len();
        assert!((4_500..=5_500).contains(&kept), "kept {kept} of {n}");
    }
}

// ============================================================================
// Frame Codec Properties
// ============================================================================

mod frame_properties {
    use super::*;
    use bb84_core::frame::{Frame, Inbound, LegacyMessage, decode_line};

    proptest! {
        /// Encoded frames are single lines that decode to the same frame
        #[test]
        fn init_frame_is_one_line(required_key_bits in 1usize..1_000_000) {
            let frame = Frame::Init { required_key_bits };
            let line = frame.to_line().unwrap();
            prop_assert!(!line.contains('\n'));
            match decode_line(&line).unwrap() {
                Inbound::Frame(decoded) => prop_assert_eq!(decoded, frame),
                Inbound::Legacy(_) => prop_assert!(false, "decoded as legacy"),
            }
        }

        /// Arbitrary text never panics the decoder
        #[test]
        fn decode_never_panics(line in "\\PC{0,256}") {
            let _ = decode_line(&line);
        }

        /// Legacy lines keep `|` inside the message body
        #[test]
        fn legacy_message_body_may_contain_pipes(
            sender in "[a-z]{1,16}",
            body in "[a-z| ]{1,64}",
        ) {
            let line = LegacyMessage::now(sender.clone(), body.clone()).to_line();
            let parsed = LegacyMessage::parse(&line).unwrap();
            prop_assert_eq!(parsed.sender, sender);
            prop_assert_eq!(parsed.message, body);
        }
    }
}

// ============================================================================
// Discovery Announcement Properties
// ============================================================================

mod announcement_properties {
    use super::*;
    use bb84_discovery::Announcement;

    proptest! {
        /// Random datagrams never panic the announcement decoder
        #[test]
        fn decode_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..600)) {
            let _ = Announcement::from_bytes(&bytes);
        }
    }
}
