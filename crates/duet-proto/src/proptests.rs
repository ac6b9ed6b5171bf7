use proptest::prelude::*;

use crate::events::{ClientEvent, SendMessage};
use crate::ids::ConversationId;
use crate::validation::{sizes, validate_payload};

proptest! {
    #[test]
    fn payload_accepts_only_exact_nonce(nonce_len in 0usize..64, ct_len in 16usize..256) {
        let nonce = vec![0u8; nonce_len];
        let ct = vec![0u8; ct_len];
        let ok = validate_payload(&nonce, &ct, sizes::DEFAULT_MAX_CIPHERTEXT).is_ok();
        prop_assert_eq!(ok, nonce_len == sizes::NONCE_SIZE);
    }

    #[test]
    fn send_message_survives_json(
        nonce in proptest::collection::vec(any::<u8>(), sizes::NONCE_SIZE),
        ciphertext in proptest::collection::vec(any::<u8>(), 16..512),
    ) {
        let event = ClientEvent::SendMessage(SendMessage {
            conversation_id: ConversationId::new(),
            nonce,
            ciphertext,
        });
        let text = serde_json::to_string(&event).unwrap();
        let back: ClientEvent = serde_json::from_str(&text).unwrap();
        prop_assert_eq!(back, event);
    }
}
