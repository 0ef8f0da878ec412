// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Keyrings and their members.
//!
//! A keyring owns one random symmetric key for a path expression. The key is
//! never stored in the clear: each member gets a [`KeyringMemberBody`] holding
//! the key wrapped to that member's encryption key. Revoking a member rotates
//! to a new generation with a fresh key, wrapped only for those who remain.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::encryption::{generate_key, KEY_SIZE};
use crate::envelope::{Body, Unsigned, Verified};
use crate::error::{Error, Result};
use crate::id::{Id, IdType};
use crate::keypair::EncryptionKeyPair;
use crate::pathexp::PathExp;
use crate::trust::Recipient;
use crate::wrap::{self, WrappedKey};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyringBody {
	pub pathexp: PathExp,
	pub generation: u32,
	/// The generation this one replaced.
	pub previous: Option<Id>,
	pub created_at: DateTime<Utc>,
}

impl Body for KeyringBody {
	const KIND: IdType = IdType::Keyring;

	fn identity(&self) -> serde_json::Value {
		json!({
			"pathexp": self.pathexp,
			"generation": self.generation,
			"previous": self.previous,
			"created_at": self.created_at,
		})
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyringMemberBody {
	pub keyring_id: Id,
	pub owner_id: Id,
	/// The member's encryption key the keyring key is wrapped to.
	pub encrypting_key_id: Id,
	pub wrapped: WrappedKey,
}

impl Body for KeyringMemberBody {
	const KIND: IdType = IdType::KeyringMember;

	fn identity(&self) -> serde_json::Value {
		json!({
			"keyring_id": self.keyring_id,
			"owner_id": self.owner_id,
		})
	}
}

/// A keyring's plaintext symmetric key. Zeroized on drop.
pub struct KeyringKey {
	keyring_id: Id,
	key: Zeroizing<[u8; KEY_SIZE]>,
}

impl KeyringKey {
	pub fn keyring_id(&self) -> Id {
		self.keyring_id
	}

	pub(crate) fn bytes(&self) -> &[u8; KEY_SIZE] {
		&self.key
	}
}

impl fmt::Debug for KeyringKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("KeyringKey")
			.field("keyring_id", &self.keyring_id)
			.field("key", &"[REDACTED]")
			.finish()
	}
}

/// A new keyring generation with its member records and plaintext key.
#[derive(Debug)]
pub struct Rotation {
	pub keyring: Unsigned<KeyringBody>,
	pub members: Vec<Unsigned<KeyringMemberBody>>,
	pub key: KeyringKey,
}

fn member_aad(keyring_id: &Id, owner_id: &Id) -> Vec<u8> {
	let mut aad = b"keyweave/keyring-member/".to_vec();
	aad.extend_from_slice(keyring_id.as_bytes());
	aad.extend_from_slice(owner_id.as_bytes());
	aad
}

fn wrap_for(keyring_id: Id, key: &[u8; KEY_SIZE], recipient: &Recipient) -> Result<Unsigned<KeyringMemberBody>> {
	let wrapped = wrap::wrap_key(&recipient.public, key, &member_aad(&keyring_id, &recipient.owner_id))?;
	Unsigned::new(KeyringMemberBody {
		keyring_id,
		owner_id: recipient.owner_id,
		encrypting_key_id: recipient.public_key_id,
		wrapped,
	})
}

fn new_generation(body: KeyringBody, recipients: &[Recipient]) -> Result<Rotation> {
	if recipients.is_empty() {
		return Err(Error::Validation("a keyring needs at least one member".to_string()));
	}

	let keyring = Unsigned::new(body)?;
	let key = generate_key();
	let members = recipients
		.iter()
		.map(|r| wrap_for(keyring.id, &key, r))
		.collect::<Result<Vec<_>>>()?;

	Ok(Rotation {
		key: KeyringKey {
			keyring_id: keyring.id,
			key,
		},
		keyring,
		members,
	})
}

/// Create generation 1 of a keyring for `pathexp`, wrapped for `recipients`.
pub fn create_keyring(pathexp: PathExp, recipients: &[Recipient]) -> Result<Rotation> {
	let rotation = new_generation(
		KeyringBody {
			pathexp,
			generation: 1,
			previous: None,
			created_at: Utc::now(),
		},
		recipients,
	)?;
	info!(
		keyring_id = %rotation.keyring.id,
		pathexp = %rotation.keyring.body.pathexp,
		members = rotation.members.len(),
		"created keyring"
	);
	Ok(rotation)
}

/// Wrap the current key for one more member. The generation is unchanged.
pub fn add_member(key: &KeyringKey, recipient: &Recipient) -> Result<Unsigned<KeyringMemberBody>> {
	debug!(keyring_id = %key.keyring_id, owner_id = %recipient.owner_id, "wrapping keyring key for new member");
	wrap_for(key.keyring_id, &key.key, recipient)
}

/// Rotate `keyring` to a new generation without `revoked`.
///
/// `members` are the current generation's member records; `remaining` must
/// hold a recipient for every member except `revoked`. Credentials sealed
/// under earlier generations are left as they are.
pub fn revoke_member(
	keyring: &Verified<KeyringBody>,
	members: &[Verified<KeyringMemberBody>],
	revoked: Id,
	remaining: &[Recipient],
) -> Result<Rotation> {
	if !members.iter().any(|m| m.body().owner_id == revoked) {
		return Err(Error::Validation(format!(
			"{revoked} is not a member of keyring {}",
			keyring.id()
		)));
	}
	if remaining.iter().any(|r| r.owner_id == revoked) {
		return Err(Error::Internal("revoked identity listed as remaining".to_string()));
	}
	if remaining.is_empty() {
		return Err(Error::Validation(
			"cannot revoke the last member of a keyring".to_string(),
		));
	}

	let rotation = new_generation(
		KeyringBody {
			pathexp: keyring.body().pathexp.clone(),
			generation: keyring.body().generation + 1,
			previous: Some(keyring.id()),
			created_at: Utc::now(),
		},
		remaining,
	)?;
	info!(
		previous = %keyring.id(),
		keyring_id = %rotation.keyring.id,
		generation = rotation.keyring.body.generation,
		revoked = %revoked,
		"rotated keyring"
	);
	Ok(rotation)
}

/// Recover a keyring's key using the caller's member record.
pub fn unwrap_keyring_key(
	keyring_id: Id,
	members: &[Verified<KeyringMemberBody>],
	me: &EncryptionKeyPair,
) -> Result<KeyringKey> {
	let Some(record) = members
		.iter()
		.map(Verified::body)
		.find(|m| m.keyring_id == keyring_id && m.owner_id == me.owner_id())
	else {
		return Err(Error::NotAMember { keyring_id });
	};

	if record.encrypting_key_id != me.public_key_id() {
		return Err(Error::UntrustedKey {
			key_id: record.encrypting_key_id,
			reason: format!(
				"keyring {keyring_id} is wrapped to a key this session does not hold"
			),
		});
	}

	let key = wrap::unwrap_key(me.secret(), &record.wrapped, &member_aad(&keyring_id, &record.owner_id))?;
	Ok(KeyringKey { keyring_id, key })
}
