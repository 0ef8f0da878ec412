// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Claimed keypairs.
//!
//! Every identity owns a signing keypair (Ed25519) and an encryption keypair
//! (X25519). The public half is published with one or more [`Claim`]s: a
//! signature by some signing key over `{public key, owner, purpose}`. The
//! private half only ever leaves this module sealed under the owner's master
//! key.

use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature as Ed25519Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::encryption::{self, EncryptedData, KEY_SIZE};
use crate::envelope::{Body, Unsigned};
use crate::error::{Error, Result};
use crate::id::{canonical_json, Id, IdType};

// =============================================================================
// Bodies
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyPurpose {
	Signing,
	Encryption,
}

impl fmt::Display for KeyPurpose {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			KeyPurpose::Signing => f.write_str("signing"),
			KeyPurpose::Encryption => f.write_str("encryption"),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeyBody {
	pub owner_id: Id,
	pub purpose: KeyPurpose,
	#[serde(with = "crate::base64_bytes")]
	pub key: Vec<u8>,
	pub created_at: DateTime<Utc>,
}

impl Body for PublicKeyBody {
	const KIND: IdType = IdType::PublicKey;

	fn identity(&self) -> serde_json::Value {
		json!({
			"owner_id": self.owner_id,
			"purpose": self.purpose,
			"key": STANDARD.encode(&self.key),
		})
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivateKeyBody {
	pub owner_id: Id,
	pub public_key_id: Id,
	pub key: EncryptedData,
}

impl Body for PrivateKeyBody {
	const KIND: IdType = IdType::PrivateKey;

	fn identity(&self) -> serde_json::Value {
		json!({ "public_key_id": self.public_key_id })
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
	/// Owner of the signing key that made this claim.
	pub signer_id: Id,
	pub signer_key_id: Id,
	pub created_at: DateTime<Utc>,
	#[serde(with = "crate::base64_bytes")]
	pub signature: Vec<u8>,
}

impl Claim {
	pub fn is_self_signed(&self, key_id: &Id) -> bool {
		self.signer_key_id == *key_id
	}
}

/// The bytes a claim signs: the claimed key's identity plus who vouches and when.
fn claim_payload(key_id: &Id, body: &PublicKeyBody, signer_key_id: &Id, created_at: DateTime<Utc>) -> Result<Vec<u8>> {
	canonical_json(&json!({
		"public_key_id": key_id,
		"owner_id": body.owner_id,
		"purpose": body.purpose,
		"key": STANDARD.encode(&body.key),
		"signer_key_id": signer_key_id,
		"created_at": created_at,
	}))
}

/// Check `claim`'s signature over `key` against the signer's public key.
pub(crate) fn claim_signature_valid(key: &Unsigned<PublicKeyBody>, claim: &Claim, signer: &PublicKeyBody) -> bool {
	match claim_payload(&key.id, &key.body, &claim.signer_key_id, claim.created_at) {
		Ok(payload) => verify_ed25519(&signer.key, &payload, &claim.signature),
		Err(_) => false,
	}
}

pub(crate) fn verify_ed25519(public: &[u8], message: &[u8], signature: &[u8]) -> bool {
	let Ok(public) = <[u8; 32]>::try_from(public) else {
		return false;
	};
	let Ok(verifying) = VerifyingKey::from_bytes(&public) else {
		return false;
	};
	let Ok(signature) = Ed25519Signature::from_slice(signature) else {
		return false;
	};
	verifying.verify_strict(message, &signature).is_ok()
}

// =============================================================================
// Claimed keys
// =============================================================================

/// A published public key with the claims vouching for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimedPublicKey {
	pub public_key: Unsigned<PublicKeyBody>,
	pub claims: Vec<Claim>,
}

impl ClaimedPublicKey {
	pub fn id(&self) -> Id {
		self.public_key.id
	}

	pub fn body(&self) -> &PublicKeyBody {
		&self.public_key.body
	}
}

/// A keypair as stored by the registry: public key, sealed private key, claims.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimedKeyPair {
	pub public_key: Unsigned<PublicKeyBody>,
	pub private_key: Unsigned<PrivateKeyBody>,
	pub claims: Vec<Claim>,
}

fn private_key_aad(public_key_id: &Id) -> Vec<u8> {
	let mut aad = b"keyweave/private-key/".to_vec();
	aad.extend_from_slice(public_key_id.as_bytes());
	aad
}

impl ClaimedKeyPair {
	fn seal(
		owner_id: Id,
		purpose: KeyPurpose,
		public: Vec<u8>,
		secret: &[u8; KEY_SIZE],
		master_key: &[u8; KEY_SIZE],
	) -> Result<Self> {
		let public_key = Unsigned::new(PublicKeyBody {
			owner_id,
			purpose,
			key: public,
			created_at: Utc::now(),
		})?;
		let sealed = encryption::encrypt(master_key, secret, &private_key_aad(&public_key.id))?;
		let private_key = Unsigned::new(PrivateKeyBody {
			owner_id,
			public_key_id: public_key.id,
			key: sealed,
		})?;

		Ok(Self {
			public_key,
			private_key,
			claims: Vec::new(),
		})
	}

	/// Generate a signing keypair for `owner_id`, sealed under `master_key`.
	/// The returned pair is unclaimed.
	pub fn generate_signing(owner_id: Id, master_key: &[u8; KEY_SIZE]) -> Result<(Self, SigningKeyPair)> {
		let key = SigningKey::generate(&mut OsRng);
		let secret = Zeroizing::new(key.to_bytes());
		let stored = Self::seal(
			owner_id,
			KeyPurpose::Signing,
			key.verifying_key().to_bytes().to_vec(),
			&secret,
			master_key,
		)?;
		let live = SigningKeyPair {
			owner_id,
			public_key_id: stored.id(),
			key,
		};
		Ok((stored, live))
	}

	/// Generate an encryption keypair for `owner_id`, sealed under `master_key`.
	pub fn generate_encryption(owner_id: Id, master_key: &[u8; KEY_SIZE]) -> Result<(Self, EncryptionKeyPair)> {
		let secret = StaticSecret::random_from_rng(OsRng);
		let bytes = Zeroizing::new(secret.to_bytes());
		let stored = Self::seal(
			owner_id,
			KeyPurpose::Encryption,
			PublicKey::from(&secret).as_bytes().to_vec(),
			&bytes,
			master_key,
		)?;
		let live = EncryptionKeyPair {
			owner_id,
			public_key_id: stored.id(),
			secret,
		};
		Ok((stored, live))
	}

	pub fn id(&self) -> Id {
		self.public_key.id
	}

	pub fn owner_id(&self) -> Id {
		self.public_key.body.owner_id
	}

	pub fn purpose(&self) -> KeyPurpose {
		self.public_key.body.purpose
	}

	pub fn public(&self) -> ClaimedPublicKey {
		ClaimedPublicKey {
			public_key: self.public_key.clone(),
			claims: self.claims.clone(),
		}
	}

	/// Add a claim by `signer` vouching for this keypair.
	pub fn claim_with(&mut self, signer: &SigningKeyPair) -> Result<()> {
		let created_at = Utc::now();
		let payload = claim_payload(&self.public_key.id, &self.public_key.body, &signer.public_key_id, created_at)?;
		self.claims.push(Claim {
			signer_id: signer.owner_id,
			signer_key_id: signer.public_key_id,
			created_at,
			signature: signer.sign(&payload),
		});
		Ok(())
	}

	fn open(&self, purpose: KeyPurpose, master_key: &[u8; KEY_SIZE]) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
		self.public_key.check_id()?;
		self.private_key.check_id()?;
		if self.purpose() != purpose {
			return Err(Error::Validation(format!(
				"keypair {} is a {} key, not {purpose}",
				self.id(),
				self.purpose()
			)));
		}
		if self.private_key.body.public_key_id != self.public_key.id
			|| self.private_key.body.owner_id != self.public_key.body.owner_id
		{
			return Err(Error::Malformed(format!(
				"private key {} does not belong to public key {}",
				self.private_key.id,
				self.public_key.id
			)));
		}
		encryption::decrypt_key(
			master_key,
			&self.private_key.body.key,
			&private_key_aad(&self.public_key.id),
		)
	}

	pub fn unlock_signing(&self, master_key: &[u8; KEY_SIZE]) -> Result<SigningKeyPair> {
		let secret = self.open(KeyPurpose::Signing, master_key)?;
		let key = SigningKey::from_bytes(&secret);
		if key.verifying_key().as_bytes().as_slice() != self.public_key.body.key.as_slice() {
			return Err(Error::Malformed(format!(
				"private key does not match public key {}",
				self.id()
			)));
		}
		Ok(SigningKeyPair {
			owner_id: self.owner_id(),
			public_key_id: self.id(),
			key,
		})
	}

	pub fn unlock_encryption(&self, master_key: &[u8; KEY_SIZE]) -> Result<EncryptionKeyPair> {
		let bytes = self.open(KeyPurpose::Encryption, master_key)?;
		let secret = StaticSecret::from(*bytes);
		if PublicKey::from(&secret).as_bytes().as_slice() != self.public_key.body.key.as_slice() {
			return Err(Error::Malformed(format!(
				"private key does not match public key {}",
				self.id()
			)));
		}
		Ok(EncryptionKeyPair {
			owner_id: self.owner_id(),
			public_key_id: self.id(),
			secret,
		})
	}
}

// =============================================================================
// Unlocked keypairs
// =============================================================================

/// A decrypted Ed25519 signing key. Zeroized on drop.
#[derive(Clone)]
pub struct SigningKeyPair {
	owner_id: Id,
	public_key_id: Id,
	key: SigningKey,
}

impl SigningKeyPair {
	pub fn owner_id(&self) -> Id {
		self.owner_id
	}

	pub fn public_key_id(&self) -> Id {
		self.public_key_id
	}

	pub fn sign(&self, message: &[u8]) -> Vec<u8> {
		self.key.sign(message).to_bytes().to_vec()
	}
}

impl fmt::Debug for SigningKeyPair {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("SigningKeyPair")
			.field("owner_id", &self.owner_id)
			.field("public_key_id", &self.public_key_id)
			.field("key", &"[REDACTED]")
			.finish()
	}
}

/// A decrypted X25519 encryption key. Zeroized on drop.
#[derive(Clone)]
pub struct EncryptionKeyPair {
	owner_id: Id,
	public_key_id: Id,
	secret: StaticSecret,
}

impl EncryptionKeyPair {
	pub fn owner_id(&self) -> Id {
		self.owner_id
	}

	pub fn public_key_id(&self) -> Id {
		self.public_key_id
	}

	pub(crate) fn secret(&self) -> &StaticSecret {
		&self.secret
	}
}

impl fmt::Debug for EncryptionKeyPair {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("EncryptionKeyPair")
			.field("owner_id", &self.owner_id)
			.field("public_key_id", &self.public_key_id)
			.field("secret", &"[REDACTED]")
			.finish()
	}
}
