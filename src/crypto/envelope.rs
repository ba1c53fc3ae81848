//! Envelope encryption of endpoint passwords.
//!
//! Wire format: `salt_hex-iv_hex-ciphertext_hex`. Key derivation is
//! PBKDF2-HMAC-SHA256 with 1,000 iterations producing a 32-byte key from an
//! 8-byte salt; the cipher is AES-256-GCM with a 12-byte IV and no AAD.

// crates.io
use aes_gcm::{
	aead::{Aead, KeyInit, Payload},
	Aes256Gcm, Nonce,
};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;
// self
use crate::_prelude::*;

const SALT_LEN: usize = 8;
const IV_LEN: usize = 12;
const KEY_LEN: usize = 32;
const PBKDF2_ROUNDS: u32 = 1_000;

fn derive_key(passphrase: &[u8], salt: &[u8]) -> [u8; KEY_LEN] {
	let mut key = [0u8; KEY_LEN];

	pbkdf2_hmac::<Sha256>(passphrase, salt, PBKDF2_ROUNDS, &mut key);

	key
}

/// Encrypt `plaintext` under `key`, returning the `salt-iv-ciphertext` envelope.
pub fn encrypt(plaintext: &str, key: &[u8]) -> Result<String> {
	let mut salt = [0u8; SALT_LEN];
	let mut iv = [0u8; IV_LEN];

	rand::rng().fill_bytes(&mut salt);
	rand::rng().fill_bytes(&mut iv);

	let derived = derive_key(key, &salt);
	let cipher = Aes256Gcm::new_from_slice(&derived)
		.map_err(|err| Error::Envelope(format!("invalid key length: {err}")))?;
	let nonce = Nonce::from_slice(&iv);
	let ciphertext = cipher
		.encrypt(nonce, Payload { msg: plaintext.as_bytes(), aad: b"" })
		.map_err(|err| Error::Envelope(format!("encryption failed: {err}")))?;

	Ok(format!("{}-{}-{}", hex::encode(salt), hex::encode(iv), hex::encode(ciphertext)))
}

/// Decrypt an envelope produced by [`encrypt`] using the same `key`.
pub fn decrypt(envelope: &str, key: &[u8]) -> Result<String> {
	let mut parts = envelope.splitn(3, '-');
	let salt_hex = parts.next().ok_or_else(|| malformed(envelope))?;
	let iv_hex = parts.next().ok_or_else(|| malformed(envelope))?;
	let ciphertext_hex = parts.next().ok_or_else(|| malformed(envelope))?;

	let salt = hex::decode(salt_hex).map_err(|err| Error::Envelope(err.to_string()))?;
	let iv = hex::decode(iv_hex).map_err(|err| Error::Envelope(err.to_string()))?;
	let ciphertext = hex::decode(ciphertext_hex).map_err(|err| Error::Envelope(err.to_string()))?;

	if salt.len() != SALT_LEN || iv.len() != IV_LEN {
		return Err(Error::Envelope("unexpected salt or iv length".into()));
	}

	let derived = derive_key(key, &salt);
	let cipher = Aes256Gcm::new_from_slice(&derived)
		.map_err(|err| Error::Envelope(format!("invalid key length: {err}")))?;
	let nonce = Nonce::from_slice(&iv);
	let plaintext = cipher
		.decrypt(nonce, Payload { msg: &ciphertext, aad: b"" })
		.map_err(|_| Error::Envelope("decryption failed: wrong key or corrupted envelope".into()))?;

	String::from_utf8(plaintext).map_err(|err| Error::Envelope(err.to_string()))
}

fn malformed(envelope: &str) -> Error {
	Error::Envelope(format!("malformed envelope, expected salt-iv-ciphertext: {envelope:?}"))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn decrypt_of_encrypt_round_trips() {
		let key = b"a 128-bit-or-longer key material";

		for plaintext in ["", "hunter2", "p@ss with spaces and üñîçødé"] {
			let envelope = encrypt(plaintext, key).unwrap();
			let decoded = decrypt(&envelope, key).unwrap();

			assert_eq!(decoded, plaintext);
		}
	}

	#[test]
	fn wrong_key_fails_to_decrypt() {
		let envelope = encrypt("secret", b"key-one-is-long-enough").unwrap();

		assert!(decrypt(&envelope, b"key-two-is-long-enough").is_err());
	}

	#[test]
	fn malformed_envelope_is_rejected() {
		assert!(decrypt("not-an-envelope", b"key").is_err());
	}
}
