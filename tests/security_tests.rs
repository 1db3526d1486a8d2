//! Security properties of the token engine
//!
//! Test categories:
//! 1. Attribute Codec
//! 2. Token Cipher
//! 3. Keyring Selection
//! 4. Keyring Persistence
//! 5. Token Catalog
//! 6. Concurrency
//!
//! ## Running tests
//!
//! ```bash
//! cargo test --features test-constants --test security_tests
//! ```

use webauth::crypto::{parse_at, parse_with_key_at};
use webauth::keyring::KEYRING_VERSION;
use webauth::tokens::{decode_token_at, encode_token_at, token_from_attrs, token_to_attrs};
use webauth::*;

const NOW: u64 = 1_700_000_000;

fn key(fill: u8) -> Key {
    Key::new(KeyType::Aes, vec![fill; 32]).unwrap()
}

fn sample_attrs() -> AttrList {
    let mut attrs = AttrList::new();
    attrs.add_str("t", "app").unwrap();
    attrs.add_str("s", "alice;admin").unwrap();
    attrs.add_time("et", NOW + 3600).unwrap();
    attrs
}

// ============================================================
// 1. ATTRIBUTE CODEC
// ============================================================

mod attribute_codec {
    use super::*;

    /// Separators inside values are escaped and the length is exact
    #[test]
    fn separator_in_value_is_escaped() {
        let mut attrs = AttrList::new();
        attrs.add("x", b"a;b;;c".to_vec()).unwrap();
        let bytes = attrs.encode().unwrap();
        assert_eq!(bytes, b"x=a;;b;;;;c;".to_vec());
        assert_eq!(attrs.encoded_length(), bytes.len());
        assert_eq!(AttrList::decode(&bytes).unwrap(), attrs);
    }

    /// Malformed input is rejected, never misread
    #[test]
    fn malformed_input_is_corrupt() {
        for bad in [&b"x"[..], b"x=1", b"=1;", b"x=1;y", b"x=a;b;"] {
            assert!(
                matches!(AttrList::decode(bad), Err(WebAuthError::Corrupt(_))),
                "{:?} must be rejected",
                String::from_utf8_lossy(bad)
            );
        }
    }

    /// Names that would break framing are refused on the way in
    #[test]
    fn invalid_names_refused() {
        let mut attrs = AttrList::new();
        assert!(attrs.add("", b"v".to_vec()).is_err());
        assert!(attrs.add("a=b", b"v".to_vec()).is_err());
        assert!(attrs.add("a;b", b"v".to_vec()).is_err());
        assert!(attrs.is_empty());
    }

    /// Times wider than the wire format are refused
    #[test]
    fn time_overflow_refused() {
        let mut attrs = AttrList::new();
        assert!(matches!(
            attrs.add_time("ct", u64::from(u32::MAX) + 1),
            Err(WebAuthError::InvalidInput(_))
        ));
    }
}

// ============================================================
// 2. TOKEN CIPHER
// ============================================================

mod token_cipher {
    use super::*;

    /// Every single-byte modification of the raw token is detected
    #[test]
    fn tampering_is_detected() {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine;

        let k = key(1);
        let token = create_with_key(&sample_attrs(), NOW, &k).unwrap();
        let raw = STANDARD.decode(&token).unwrap();
        for i in (0..raw.len()).step_by(7) {
            let mut bad = raw.clone();
            bad[i] ^= 0x01;
            let result = parse_with_key_at(&STANDARD.encode(&bad), 0, &k, NOW);
            assert!(result.is_err(), "flip at byte {i} went unnoticed");
        }
    }

    /// Encrypting the same list twice never yields the same token
    #[test]
    fn ciphertext_is_randomized() {
        let k = key(2);
        let a = create_with_key(&sample_attrs(), NOW, &k).unwrap();
        let b = create_with_key(&sample_attrs(), NOW, &k).unwrap();
        assert_ne!(a, b);
        assert_eq!(a.len(), token_length(&sample_attrs()));
    }

    /// The first four raw bytes are the big-endian creation hint
    #[test]
    fn hint_prefix_is_creation_time() {
        let token = create_with_key(&sample_attrs(), NOW, &key(7)).unwrap();
        let raw = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, &token).unwrap();
        assert_eq!(hex::encode(&raw[..4]), format!("{:08x}", NOW));
    }

    /// Plaintext never shows through the transport encoding
    #[test]
    fn plaintext_not_visible() {
        let token = create_with_key(&sample_attrs(), NOW, &key(3)).unwrap();
        assert!(!token.contains("alice"));
        let raw = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, &token).unwrap();
        assert!(!raw.windows(5).any(|w| w == b"alice"));
    }

    /// Short or non-base64 input is corrupt, a wrong key is an integrity failure
    #[test]
    fn failure_classes() {
        let k = key(4);
        assert!(matches!(parse_with_key_at("", 0, &k, NOW), Err(WebAuthError::Corrupt(_))));
        assert!(matches!(parse_with_key_at("!!!", 0, &k, NOW), Err(WebAuthError::Corrupt(_))));
        let short = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, [0u8; MIN_TOKEN_LEN - 1]);
        assert!(matches!(parse_with_key_at(&short, 0, &k, NOW), Err(WebAuthError::Corrupt(_))));

        let token = create_with_key(&sample_attrs(), NOW, &k).unwrap();
        assert!(matches!(
            parse_with_key_at(&token, 0, &key(5), NOW),
            Err(WebAuthError::BadIntegrity)
        ));
    }

    /// TTL is measured from the creation hint
    #[test]
    fn ttl_boundary() {
        let k = key(6);
        let token = create_with_key(&sample_attrs(), NOW, &k).unwrap();
        assert!(parse_with_key_at(&token, 300, &k, NOW + 300).is_ok());
        assert!(matches!(
            parse_with_key_at(&token, 300, &k, NOW + 301),
            Err(WebAuthError::Expired(_))
        ));
        assert!(parse_with_key_at(&token, 0, &k, NOW + 1_000_000).is_ok());
    }
}

// ============================================================
// 3. KEYRING SELECTION
// ============================================================

mod keyring_selection {
    use super::*;

    fn ring() -> Keyring {
        let mut ring = Keyring::new();
        ring.add(100, 100, 1000, key(1));
        ring.add(500, 500, 2000, key(2));
        ring.add(900, 3000, 4000, key(3));
        ring
    }

    /// Encryption picks the longest-lived key already in effect
    #[test]
    fn encrypt_prefers_longest_lived_active_key() {
        let ring = ring();
        assert_eq!(ring.best_key(KeyUsage::Encrypt, 600).unwrap().as_bytes(), key(2).as_bytes());
        assert_eq!(ring.best_key(KeyUsage::Encrypt, 200).unwrap().as_bytes(), key(1).as_bytes());
        assert_eq!(ring.best_key(KeyUsage::Encrypt, 3500).unwrap().as_bytes(), key(3).as_bytes());
        assert!(ring.best_key(KeyUsage::Encrypt, 50).is_none());
    }

    /// Decryption picks a key whose window covers the hint
    #[test]
    fn decrypt_window() {
        let ring = ring();
        assert_eq!(ring.best_key(KeyUsage::Decrypt, 150).unwrap().as_bytes(), key(1).as_bytes());
        assert_eq!(ring.best_key(KeyUsage::Decrypt, 1500).unwrap().as_bytes(), key(2).as_bytes());
        assert!(ring.best_key(KeyUsage::Decrypt, 2500).is_none());
    }

    /// A token whose hint matches no window still parses with any ring key
    #[test]
    fn parse_tries_every_key() {
        let mut ring = Keyring::new();
        ring.add(1, 1, 10, key(7));
        let token = create_with_key(&sample_attrs(), NOW, &key(7)).unwrap();
        assert!(parse_at(&token, 0, &ring, NOW).is_ok());

        let mut other = Keyring::new();
        other.add(1, 1, u64::from(u32::MAX), key(8));
        assert!(matches!(parse_at(&token, 0, &other, NOW), Err(WebAuthError::BadIntegrity)));
    }

    #[test]
    fn empty_ring_is_bad_key() {
        let token = create_with_key(&sample_attrs(), NOW, &key(1)).unwrap();
        assert!(matches!(parse_at(&token, 0, &Keyring::new(), NOW), Err(WebAuthError::BadKey(_))));
        assert!(matches!(create(&sample_attrs(), NOW, &Keyring::new()), Err(WebAuthError::BadKey(_))));
    }

    /// Rotation adds a key once the newest is older than its lifetime and
    /// tokens sealed before rotation still parse afterwards
    #[test]
    fn rotation_keeps_old_tokens_readable() {
        let policy = RotationPolicy { lifetime: 100, validity: 10_000, grace: 500 };
        let mut ring = Keyring::with_generated_key(NOW, 10_000).unwrap();
        let token = create(&sample_attrs(), NOW, &ring).unwrap();

        let report = ring.rotate(NOW + 150, &policy).unwrap();
        assert!(report.added);
        assert_eq!(ring.len(), 2);
        assert!(parse_at(&token, 0, &ring, NOW + 150).is_ok());

        // A second pass in the same period changes nothing
        assert!(!ring.rotate(NOW + 160, &policy).unwrap().changed());
    }
}

// ============================================================
// 4. KEYRING PERSISTENCE
// ============================================================

mod keyring_persistence {
    use super::*;

    #[test]
    fn file_round_trip_preserves_order_and_windows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keyring");
        let mut ring = Keyring::new();
        ring.add(10, 20, 30, Key::new(KeyType::Aes, vec![1; 16]).unwrap());
        ring.add(40, 50, 60, Key::new(KeyType::Aes, vec![2; 24]).unwrap());
        ring.write_file(&path).unwrap();

        let back = Keyring::read_file(&path).unwrap();
        assert_eq!(back.len(), 2);
        let e = &back.entries()[1];
        assert_eq!((e.creation_time, e.valid_from, e.valid_till), (40, 50, 60));
        assert_eq!(e.key.as_bytes(), &[2u8; 24][..]);
    }

    /// A keyring from a future version is refused, not guessed at
    #[test]
    fn unknown_version_fails_closed() {
        let mut attrs = AttrList::new();
        attrs.add_u32("v", KEYRING_VERSION + 1).unwrap();
        attrs.add_u32("n", 0).unwrap();
        let err = Keyring::decode(&attrs.encode().unwrap()).unwrap_err();
        assert!(matches!(err, WebAuthError::KeyringVersion(v) if v == KEYRING_VERSION + 1));
    }

    #[test]
    fn missing_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent");
        match Keyring::read_file(&path) {
            Err(WebAuthError::KeyringIo { path: p, .. }) => assert_eq!(p, path),
            other => panic!("expected KeyringIo, got {other:?}"),
        }
    }

    #[test]
    fn shared_keyring_creates_file_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keyring");
        let first = SharedKeyring::open(FileKeyringStore::new(&path), true, None, NOW).unwrap();
        let key = first.snapshot().entries()[0].key.as_bytes().to_vec();

        let second = SharedKeyring::open(FileKeyringStore::new(&path), false, None, NOW).unwrap();
        assert_eq!(second.snapshot().entries()[0].key.as_bytes(), &key[..]);
    }
}

// ============================================================
// 5. TOKEN CATALOG
// ============================================================

mod token_catalog {
    use super::*;

    fn ring() -> Keyring {
        let mut ring = Keyring::new();
        ring.add(1, 1, u64::from(u32::MAX), key(9));
        ring
    }

    /// A token of one kind cannot be passed off as another
    #[test]
    fn type_confusion_rejected() {
        let ring = ring();
        let proxy = ProxyToken {
            subject: "alice".into(),
            proxy_type: "krb5".into(),
            webkdc_proxy: vec![1, 2, 3],
            creation: 0,
            expiration: NOW + 60,
        };
        let sealed = encode_token_at(&Token::Proxy(proxy), &ring, NOW).unwrap();
        assert!(matches!(
            decode_token_at(&sealed, Some(TokenType::App), 0, &ring, NOW),
            Err(WebAuthError::Corrupt(_))
        ));
        assert!(matches!(
            decode_token_at(&sealed, Some(TokenType::Proxy), 0, &ring, NOW),
            Ok(Token::Proxy(_))
        ));
    }

    /// Expiration is enforced on decode
    #[test]
    fn expired_token_rejected() {
        let ring = ring();
        let app = AppToken {
            subject: Some("alice".into()),
            expiration: NOW + 10,
            ..Default::default()
        };
        let sealed = encode_token_at(&Token::App(app), &ring, NOW).unwrap();
        assert!(decode_token_at(&sealed, None, 0, &ring, NOW + 10).is_ok());
        assert!(matches!(
            decode_token_at(&sealed, None, 0, &ring, NOW + 11),
            Err(WebAuthError::Expired(_))
        ));
    }

    /// Creation time is filled in when left at zero
    #[test]
    fn creation_defaults_to_now() {
        let err = ErrorToken { code: 7, message: "bad".into(), creation: 0 };
        let attrs = token_to_attrs(&Token::Error(err), NOW).unwrap();
        match token_from_attrs(&attrs, None, NOW).unwrap() {
            Token::Error(e) => assert_eq!(e.creation, NOW),
            other => panic!("expected error token, got {other:?}"),
        }
    }

    /// Encode-time semantic violations are the caller's fault
    #[test]
    fn invalid_tokens_refused_on_encode() {
        let ring = ring();
        let request = RequestToken {
            requested_type: "everything".into(),
            return_url: "https://app.example.com/".into(),
            ..Default::default()
        };
        assert!(matches!(
            encode_token_at(&Token::Request(request), &ring, NOW),
            Err(WebAuthError::InvalidInput(_))
        ));
    }
}

// ============================================================
// 6. CONCURRENCY
// ============================================================

mod concurrency {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Parses running while the ring rotates never fail
    #[test]
    fn rotation_under_concurrent_parses() {
        let policy = RotationPolicy { lifetime: 1, validity: 1_000_000, grace: 1_000_000 };
        let store = InMemoryKeyringStore::new();
        let shared = SharedKeyring::open(store.clone(), true, Some(policy), NOW).unwrap();
        let token = create(&sample_attrs(), NOW, &shared.snapshot()).unwrap();
        let done = AtomicBool::new(false);

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..100 {
                        let ring = shared.snapshot();
                        assert!(parse_at(&token, 0, &ring, NOW).is_ok());
                    }
                });
            }
            s.spawn(|| {
                for step in 1..=20 {
                    shared.rotate_if_needed(NOW + step * 2).unwrap();
                }
                done.store(true, Ordering::SeqCst);
            });
        });

        assert!(done.load(Ordering::SeqCst));
        assert!(shared.snapshot().len() > 1);
        assert!(store.save_count() > 1);
    }

    #[test]
    fn shared_handles_are_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SharedKeyring>();
        assert_send_sync::<ServiceTokenCache>();
        assert_send_sync::<Keyring>();
    }
}
