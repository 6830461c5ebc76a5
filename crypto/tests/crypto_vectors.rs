use lepago_crypto::aead::{ChallengeCipher, EncryptedEnvelope, AEAD_IV_LEN, AEAD_TAG_LEN};
use lepago_crypto::hashes::{leading_zero_nibbles, sha256};
use lepago_crypto::ml_kem::{
    KeyExchangeEngine, MlKemKeyPair, ML_KEM_CIPHERTEXT_LEN, ML_KEM_PUBLIC_KEY_LEN,
    ML_KEM_SECRET_KEY_LEN, ML_KEM_SHARED_SECRET_LEN,
};
use lepago_crypto::traits::{KemKeyPair, KemPublicKey};
use lepago_crypto::CryptoError;
use proptest::prelude::*;

const VECTOR_KEY: [u8; 32] = [
    0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25,
    26, 27, 28, 29, 30, 31,
];

// SHA-256("deadbeef22095"), the first digest with four leading zero nibbles.
const DEADBEEF_SOLUTION: &str = "0000f40c48d983de204a5c71e7b7565d886696f4d6ee737761a66b4ceec17358";

#[test]
fn aes_gcm_16_byte_iv_vector() {
    let plaintext = hex::decode(DEADBEEF_SOLUTION).unwrap();
    let cipher = ChallengeCipher::new(&VECTOR_KEY).unwrap();
    let envelope = cipher.encrypt_with_iv([0u8; 16], &plaintext).unwrap();

    assert_eq!(
        hex::encode(&envelope.ciphertext),
        "c8beac36fd1c8d0a3a3f2681947b6e5a0d5d6bf58b8534fcea85355709b681ee"
    );
    assert_eq!(
        hex::encode(envelope.auth_tag),
        "dbe73d29db0b633ffac510e100add1b0"
    );
    assert_eq!(
        envelope.to_base64(),
        "AAAAAAAAAAAAAAAAAAAAAMi+rDb9HI0KOj8mgZR7bloNXWv1i4U0/OqFNVcJtoHu2+c9KdsLYz/6xRDhAK3RsA=="
    );
    assert_eq!(cipher.decrypt(&envelope).unwrap(), plaintext);
}

#[test]
fn aes_gcm_empty_plaintext_vector() {
    let cipher = ChallengeCipher::new(&VECTOR_KEY).unwrap();
    let envelope = cipher.encrypt_with_iv([0u8; 16], b"").unwrap();
    assert!(envelope.ciphertext.is_empty());
    assert_eq!(
        hex::encode(envelope.auth_tag),
        "56d4352cf736c5da72108d33917df4a5"
    );
}

#[test]
fn deadbeef_solution_digest() {
    let digest = sha256(b"deadbeef22095");
    assert_eq!(hex::encode(digest), DEADBEEF_SOLUTION);
    assert_eq!(leading_zero_nibbles(&digest), 4);
}

#[test]
fn ml_kem_1024_parameter_sizes() {
    let keys = KeyExchangeEngine::new().generate_key_pair();
    let (ct, ss) = keys
        .public_key()
        .encapsulate(&mut rand::thread_rng())
        .expect("encapsulate");
    assert_eq!(keys.public_key_bytes().len(), ML_KEM_PUBLIC_KEY_LEN);
    assert_eq!(keys.secret_key_bytes().len(), ML_KEM_SECRET_KEY_LEN);
    assert_eq!(ct.as_bytes().len(), ML_KEM_CIPHERTEXT_LEN);
    assert_eq!(ss.as_bytes().len(), ML_KEM_SHARED_SECRET_LEN);
}

#[test]
fn persisted_encodings_decapsulate_peer_ciphertext() {
    let engine = KeyExchangeEngine::new();
    let keys = engine.generate_key_pair();
    let public = keys.public_key_bytes();
    let private = keys.secret_key_bytes();
    drop(keys);

    let restored = MlKemKeyPair::from_parts(&public, &private).expect("restore");
    let (ct, peer_ss) = restored
        .public_key()
        .encapsulate(&mut rand::thread_rng())
        .expect("encapsulate");
    let ss = engine.decapsulate(ct.as_bytes(), &private).expect("decapsulate");
    assert_eq!(ss, peer_ss);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn aead_round_trip(key in any::<[u8; 32]>(), plaintext in proptest::collection::vec(any::<u8>(), 0..256)) {
        let cipher = ChallengeCipher::new(&key).unwrap();
        let envelope = cipher.encrypt(&plaintext).unwrap();
        prop_assert_eq!(cipher.decrypt(&envelope).unwrap(), plaintext.clone());
        let wire = EncryptedEnvelope::from_wire(&envelope.to_wire()).unwrap();
        prop_assert_eq!(cipher.decrypt(&wire).unwrap(), plaintext);
    }

    #[test]
    fn any_flipped_bit_is_rejected(
        key in any::<[u8; 32]>(),
        plaintext in proptest::collection::vec(any::<u8>(), 0..64),
        position in any::<prop::sample::Index>(),
        bit in 0u8..8,
    ) {
        let cipher = ChallengeCipher::new(&key).unwrap();
        let envelope = cipher.encrypt(&plaintext).unwrap();
        let mut wire = envelope.to_wire();
        // flip inside ciphertext or tag
        let authenticated = AEAD_IV_LEN..wire.len();
        let idx = authenticated.start + position.index(authenticated.len());
        wire[idx] ^= 1 << bit;
        let tampered = EncryptedEnvelope::from_wire(&wire).unwrap();
        prop_assert_eq!(cipher.decrypt(&tampered), Err(CryptoError::AuthenticationTagMismatch));
        prop_assert_eq!(wire.len(), AEAD_IV_LEN + plaintext.len() + AEAD_TAG_LEN);
    }
}
