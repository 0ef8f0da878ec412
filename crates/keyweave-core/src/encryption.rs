// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Symmetric encryption for credential values and private keys.
//!
//! AES-256-GCM with a fresh random nonce per message. Every call takes
//! associated data so a ciphertext cannot be moved onto another envelope.

use aes_gcm::{
	aead::{Aead, KeyInit, OsRng, Payload},
	Aes256Gcm, Key, Nonce,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::{Error, Result};

/// Size of encryption keys in bytes (256 bits for AES-256).
pub const KEY_SIZE: usize = 32;

/// Size of AES-GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;

/// Ciphertext with the nonce it was sealed under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedData {
	#[serde(with = "crate::base64_bytes")]
	pub nonce: Vec<u8>,
	#[serde(with = "crate::base64_bytes")]
	pub ciphertext: Vec<u8>,
}

/// Generate a random encryption key.
pub fn generate_key() -> Zeroizing<[u8; KEY_SIZE]> {
	let mut key = Zeroizing::new([0u8; KEY_SIZE]);
	OsRng.fill_bytes(key.as_mut());
	key
}

/// Generate a random nonce.
///
/// 96-bit random nonces are safe well past the number of messages a single
/// keyring key or master key will ever seal.
pub fn generate_nonce() -> [u8; NONCE_SIZE] {
	let mut nonce = [0u8; NONCE_SIZE];
	OsRng.fill_bytes(&mut nonce);
	nonce
}

pub fn encrypt(key: &[u8; KEY_SIZE], plaintext: &[u8], aad: &[u8]) -> Result<EncryptedData> {
	let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));

	let nonce_bytes = generate_nonce();
	let nonce = Nonce::from_slice(&nonce_bytes);

	let ciphertext = cipher
		.encrypt(nonce, Payload { msg: plaintext, aad })
		.map_err(|e| Error::Encryption(format!("AES-GCM seal failed: {e}")))?;

	Ok(EncryptedData {
		nonce: nonce_bytes.to_vec(),
		ciphertext,
	})
}

pub fn decrypt(key: &[u8; KEY_SIZE], encrypted: &EncryptedData, aad: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
	if encrypted.nonce.len() != NONCE_SIZE {
		return Err(Error::Decryption(format!(
			"nonce must be {NONCE_SIZE} bytes, got {}",
			encrypted.nonce.len()
		)));
	}

	let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
	let nonce = Nonce::from_slice(&encrypted.nonce);

	let plaintext = cipher
		.decrypt(
			nonce,
			Payload {
				msg: &encrypted.ciphertext,
				aad,
			},
		)
		.map_err(|_| Error::Decryption("authentication tag mismatch".to_string()))?;

	Ok(Zeroizing::new(plaintext))
}

/// Decrypt a payload that must be exactly one key long.
pub fn decrypt_key(
	key: &[u8; KEY_SIZE],
	encrypted: &EncryptedData,
	aad: &[u8],
) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
	let plaintext = decrypt(key, encrypted, aad)?;
	if plaintext.len() != KEY_SIZE {
		return Err(Error::InvalidKeySize {
			expected: KEY_SIZE,
			actual: plaintext.len(),
		});
	}

	let mut out = Zeroizing::new([0u8; KEY_SIZE]);
	out.copy_from_slice(&plaintext);
	Ok(out)
}
