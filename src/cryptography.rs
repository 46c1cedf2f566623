use crypto_secretbox::aead::{Aead, KeyInit};
use crypto_secretbox::{Nonce, XSalsa20Poly1305};
use hkdf::Hkdf;
use sha2::Sha256;

use crate::error::{Error, Result};
use crate::{KEY_SIZE, NONCE_SIZE};

/// A 32-byte symmetric key.
pub type Key = [u8; KEY_SIZE];

/// A 24-byte secretbox nonce, interpreted as a little-endian counter.
pub type RecordNonce = [u8; NONCE_SIZE];

pub const ZERO_NONCE: RecordNonce = [0u8; NONCE_SIZE];

/// Derives a subkey from an input key using HKDF-SHA256 (RFC 5869, empty salt).
///
/// All transit key material hangs off the session key through this one
/// function; the `info` string selects which subkey is produced.
pub fn derive_key(ikm: &[u8], info: &[u8]) -> Key {
    let hkdf = Hkdf::<Sha256>::new(None, ikm);
    let mut subkey = [0u8; KEY_SIZE];
    hkdf.expand(info, &mut subkey)
        .expect("32 bytes is a valid length for HKDF");
    subkey
}

/// Derives the transit key from the wormhole session key.
///
/// The info string is the application id with "/transit-key" appended, so
/// different applications sharing a mailbox server get unrelated transit
/// keys even from the same session key.
pub fn derive_transit_key(session_key: &Key, appid: &str) -> Key {
    let mut info = appid.as_bytes().to_vec();
    info.extend_from_slice(b"/transit-key");
    derive_key(session_key, &info)
}

/// The five transit subkeys, derived once per transfer.
///
/// Exactly one record key is used per direction: the sender encrypts with
/// `sender_record` and the receiver decrypts with it; the final ack travels
/// the other way under `receiver_record`.
#[derive(Clone)]
pub struct TransitKeys {
    pub sender_handshake: Key,
    pub receiver_handshake: Key,
    pub sender_record: Key,
    pub receiver_record: Key,
    pub relay_handshake: Key,
}

impl TransitKeys {
    pub fn derive(transit_key: &Key) -> Self {
        TransitKeys {
            sender_handshake: derive_key(transit_key, b"transit_sender"),
            receiver_handshake: derive_key(transit_key, b"transit_receiver"),
            sender_record: derive_key(transit_key, b"transit_record_sender_key"),
            receiver_record: derive_key(transit_key, b"transit_record_receiver_key"),
            relay_handshake: derive_key(transit_key, b"transit_relay"),
        }
    }
}

/// Encrypt one record with XSalsa20-Poly1305.
///
/// The nonce bytes are prepended to the sealed box, so the wire form is
/// `nonce(24) || ciphertext+tag`. The nonce is a little-endian counter;
/// the caller is responsible for never reusing a value with the same key.
pub fn encrypt_record(key: &Key, nonce: &RecordNonce, plaintext: &[u8]) -> Vec<u8> {
    let cipher = XSalsa20Poly1305::new(key.into());
    let sealed = cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .expect("secretbox encryption of an in-memory chunk cannot fail");

    let mut record = Vec::with_capacity(NONCE_SIZE + sealed.len());
    record.extend_from_slice(nonce);
    record.extend_from_slice(&sealed);
    record
}

/// Decrypt one record produced by [`encrypt_record`].
///
/// Splits the leading 24 bytes off as the nonce, then verifies and opens the
/// rest. Returns the recovered nonce alongside the plaintext so callers can
/// check sequencing. Any authentication failure (tampering, wrong key,
/// truncation) comes back as `DecryptionFailed`.
pub fn decrypt_record(key: &Key, record: &[u8]) -> Result<(RecordNonce, Vec<u8>)> {
    if record.len() < NONCE_SIZE {
        return Err(Error::DecryptionFailed);
    }
    let mut nonce = ZERO_NONCE;
    nonce.copy_from_slice(&record[..NONCE_SIZE]);

    let cipher = XSalsa20Poly1305::new(key.into());
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&nonce), &record[NONCE_SIZE..])
        .map_err(|_| Error::DecryptionFailed)?;
    Ok((nonce, plaintext))
}

/// Increment a nonce as a little-endian integer: add one to byte 0 and
/// propagate the carry upward.
pub fn nudge(nonce: &mut RecordNonce) {
    for byte in nonce.iter_mut() {
        let (value, carry) = byte.overflowing_add(1);
        *byte = value;
        if !carry {
            break;
        }
    }
}
