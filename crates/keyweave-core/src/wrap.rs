// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Wrapping keyring keys for individual members.
//!
//! Each wrap uses a fresh ephemeral X25519 secret. The shared secret with the
//! recipient's encryption key is hashed together with both public keys into
//! an AES-256-GCM key that seals the keyring key.

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::encryption::{self, EncryptedData, KEY_SIZE};
use crate::error::{Error, Result};

const WRAP_DOMAIN: &[u8] = b"keyweave/keyring-wrap/v1";
pub const PUBLIC_KEY_SIZE: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedKey {
	#[serde(with = "crate::base64_bytes")]
	pub ephemeral_public: Vec<u8>,
	#[serde(flatten)]
	pub sealed: EncryptedData,
}

pub fn public_key_from_bytes(bytes: &[u8]) -> Result<PublicKey> {
	let arr: [u8; PUBLIC_KEY_SIZE] = bytes.try_into().map_err(|_| Error::InvalidKeySize {
		expected: PUBLIC_KEY_SIZE,
		actual: bytes.len(),
	})?;
	Ok(PublicKey::from(arr))
}

fn wrapping_key(shared: &[u8; 32], ephemeral: &PublicKey, recipient: &PublicKey) -> Zeroizing<[u8; KEY_SIZE]> {
	let mut hasher = Sha256::new();
	hasher.update(WRAP_DOMAIN);
	hasher.update(shared);
	hasher.update(ephemeral.as_bytes());
	hasher.update(recipient.as_bytes());

	let mut key = Zeroizing::new([0u8; KEY_SIZE]);
	key.copy_from_slice(&hasher.finalize());
	key
}

/// Seal `key` so only the holder of `recipient`'s secret can open it.
/// `aad` binds the wrap to the member record that carries it.
pub fn wrap_key(recipient: &PublicKey, key: &[u8; KEY_SIZE], aad: &[u8]) -> Result<WrappedKey> {
	let ephemeral = EphemeralSecret::random_from_rng(OsRng);
	let ephemeral_public = PublicKey::from(&ephemeral);
	let shared = ephemeral.diffie_hellman(recipient);
	if !shared.was_contributory() {
		return Err(Error::Encryption("recipient public key is degenerate".to_string()));
	}

	let kek = wrapping_key(shared.as_bytes(), &ephemeral_public, recipient);
	let sealed = encryption::encrypt(&kek, key, aad)?;

	Ok(WrappedKey {
		ephemeral_public: ephemeral_public.as_bytes().to_vec(),
		sealed,
	})
}

pub fn unwrap_key(secret: &StaticSecret, wrapped: &WrappedKey, aad: &[u8]) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
	let ephemeral = public_key_from_bytes(&wrapped.ephemeral_public)
		.map_err(|e| Error::Decryption(format!("ephemeral key: {e}")))?;
	let recipient = PublicKey::from(secret);
	let shared = secret.diffie_hellman(&ephemeral);

	let kek = wrapping_key(shared.as_bytes(), &ephemeral, &recipient);
	encryption::decrypt_key(&kek, &wrapped.sealed, aad)
}
