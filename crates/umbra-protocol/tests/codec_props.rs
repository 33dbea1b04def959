//! Property tests for the wire codec and replay window

use proptest::prelude::*;
use umbra_protocol::session::replay::{ReplayWindow, WINDOW_SIZE};
use umbra_protocol::wire::messages::{
    CloseMessage, DataFrame, ErrorMessage, Message, Response, SessionId,
};
use umbra_protocol::wire::{codec, Decoded, Phase};

fn roundtrip(message: &Message, flags: u8, sequence: u64) -> (u8, u64, Message) {
    let bytes = codec::encode(message, flags, sequence);
    match codec::decode(&bytes, Phase::Established) {
        Ok(Decoded::Message { header, message }) => (header.flags, header.sequence, message),
        other => panic!("decode failed: {:?}", other.err()),
    }
}

proptest! {
    #[test]
    fn response_roundtrips(
        session in prop::array::uniform16(any::<u8>()),
        proof in prop::array::uniform32(any::<u8>()),
        capabilities in any::<u32>(),
        flags in any::<u8>(),
    ) {
        let msg = Message::Response(Response {
            session_id: SessionId(session),
            proof,
            capabilities,
        });

        let (got_flags, _, decoded) = roundtrip(&msg, flags, 0);
        prop_assert_eq!(got_flags, flags);
        match decoded {
            Message::Response(r) => {
                prop_assert_eq!(r.session_id.as_bytes(), &session);
                prop_assert_eq!(r.proof, proof);
                prop_assert_eq!(r.capabilities, capabilities);
            }
            other => prop_assert!(false, "wrong variant: {:?}", other),
        }
    }

    #[test]
    fn data_roundtrips(
        session in prop::array::uniform16(any::<u8>()),
        nonce in prop::array::uniform12(any::<u8>()),
        ciphertext in prop::collection::vec(any::<u8>(), 16..512),
        sequence in any::<u64>(),
    ) {
        let msg = Message::Data(DataFrame {
            session_id: SessionId(session),
            nonce,
            ciphertext: ciphertext.clone(),
        });

        let (_, got_sequence, decoded) = roundtrip(&msg, 0, sequence);
        prop_assert_eq!(got_sequence, sequence);
        match decoded {
            Message::Data(d) => {
                prop_assert_eq!(d.nonce, nonce);
                prop_assert_eq!(d.ciphertext, ciphertext);
            }
            other => prop_assert!(false, "wrong variant: {:?}", other),
        }
    }

    #[test]
    fn error_and_close_roundtrip(
        code in any::<u16>(),
        text in "[ -~]{0,128}",
    ) {
        let (_, _, decoded) = roundtrip(
            &Message::Error(ErrorMessage { code, message: text.clone() }),
            0,
            0,
        );
        match decoded {
            Message::Error(e) => {
                prop_assert_eq!(e.code, code);
                prop_assert_eq!(e.message, text.clone());
            }
            other => prop_assert!(false, "wrong variant: {:?}", other),
        }

        let (_, _, decoded) = roundtrip(
            &Message::Close(CloseMessage { code, reason: text.clone() }),
            0,
            0,
        );
        match decoded {
            Message::Close(c) => {
                prop_assert_eq!(c.code, code);
                prop_assert_eq!(c.reason, text);
            }
            other => prop_assert!(false, "wrong variant: {:?}", other),
        }
    }

    /// Arbitrary bytes never panic the decoder; they parse or error cleanly
    #[test]
    fn decoder_is_total(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
        let _ = codec::decode(&bytes, Phase::Handshake);
        let _ = codec::decode(&bytes, Phase::Established);
    }

    /// Any in-window permutation of fresh counters is accepted exactly once
    #[test]
    fn replay_window_accepts_each_counter_once(
        mut counters in prop::collection::vec(0u64..WINDOW_SIZE, 1..64),
    ) {
        let mut window = ReplayWindow::new();
        let mut accepted = std::collections::HashSet::new();

        for &counter in &counters {
            match window.precheck(counter) {
                Ok(()) => {
                    window.commit(counter);
                    prop_assert!(
                        accepted.insert(counter),
                        "counter {} accepted twice", counter
                    );
                }
                Err(_) => {
                    // Either a duplicate or below the window after a
                    // far-ahead commit shifted it
                    let high = window.high_water().unwrap_or(0);
                    prop_assert!(
                        accepted.contains(&counter) || high >= counter + WINDOW_SIZE,
                        "fresh in-window counter {} rejected (high {})", counter, high
                    );
                }
            }
        }

        // Every accepted counter is now a replay
        counters.sort_unstable();
        counters.dedup();
        for counter in counters {
            if accepted.contains(&counter) {
                prop_assert!(window.precheck(counter).is_err());
            }
        }
    }
}
