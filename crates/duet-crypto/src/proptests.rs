#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use crate::identity::IdentityKeypair;
    use crate::session_key::SessionKey;

    fn session_pair() -> (SessionKey, SessionKey) {
        let a = IdentityKeypair::generate();
        let b = IdentityKeypair::generate();
        (
            SessionKey::derive(&a, b.public()).unwrap(),
            SessionKey::derive(&b, a.public()).unwrap(),
        )
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn test_seal_open_round_trip(message in any::<Vec<u8>>()) {
            let (k, _) = session_pair();
            let sealed = k.seal(&message).unwrap();
            prop_assert_eq!(k.open(&sealed.nonce, &sealed.ciphertext).unwrap(), message);
        }

        #[test]
        fn test_agreement_symmetry(message in any::<Vec<u8>>()) {
            let (ab, ba) = session_pair();
            let sealed = ab.seal(&message).unwrap();
            prop_assert_eq!(ba.open(&sealed.nonce, &sealed.ciphertext).unwrap(), message);
        }

        #[test]
        fn test_nonce_freshness(message in any::<Vec<u8>>()) {
            let (k, _) = session_pair();
            let first = k.seal(&message).unwrap();
            let second = k.seal(&message).unwrap();
            prop_assert_ne!(&first.nonce, &second.nonce);
            prop_assert_ne!(&first.ciphertext, &second.ciphertext);
        }

        #[test]
        fn test_ciphertext_bit_flip_detected(
            message in proptest::collection::vec(any::<u8>(), 0..256),
            bit in any::<usize>(),
        ) {
            let (k, _) = session_pair();
            let sealed = k.seal(&message).unwrap();
            let mut ct = sealed.ciphertext.clone();
            let bit = bit % (ct.len() * 8);
            ct[bit / 8] ^= 1 << (bit % 8);
            prop_assert!(k.open(&sealed.nonce, &ct).is_err());
        }

        #[test]
        fn test_nonce_bit_flip_detected(
            message in proptest::collection::vec(any::<u8>(), 0..256),
            bit in 0usize..(24 * 8),
        ) {
            let (k, _) = session_pair();
            let sealed = k.seal(&message).unwrap();
            let mut nonce = sealed.nonce.clone();
            nonce[bit / 8] ^= 1 << (bit % 8);
            prop_assert!(k.open(&nonce, &sealed.ciphertext).is_err());
        }
    }
}
