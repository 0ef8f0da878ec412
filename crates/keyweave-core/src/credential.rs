// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Credential values sealed under a keyring key.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use keyweave_common_secret::SecretString;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::json;

use crate::encryption::{self, EncryptedData};
use crate::envelope::{Body, Unsigned, Verified};
use crate::error::{Error, Result};
use crate::id::{Id, IdType};
use crate::keyring::KeyringKey;
use crate::pathexp::PathExp;

const MAX_NAME_LEN: usize = 64;

/// A credential name: a letter, then letters, digits or `_`. Stored lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CredentialName(String);

impl CredentialName {
	pub fn parse(input: &str) -> Result<Self> {
		let mut chars = input.chars();
		let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
			&& input.len() <= MAX_NAME_LEN
			&& chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
		if !valid {
			return Err(Error::InvalidName(input.to_string()));
		}
		Ok(Self(input.to_ascii_lowercase()))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for CredentialName {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for CredentialName {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self> {
		Self::parse(s)
	}
}

impl Serialize for CredentialName {
	fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
		serializer.serialize_str(&self.0)
	}
}

impl<'de> Deserialize<'de> for CredentialName {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
		let s = String::deserialize(deserializer)?;
		Self::parse(&s).map_err(serde::de::Error::custom)
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialBody {
	pub name: CredentialName,
	pub pathexp: PathExp,
	/// The keyring generation this version is sealed under.
	pub keyring_id: Id,
	/// `None` marks the credential as unset from this version on.
	pub value: Option<EncryptedData>,
	pub created_at: DateTime<Utc>,
}

impl CredentialBody {
	pub fn is_unset(&self) -> bool {
		self.value.is_none()
	}
}

impl Body for CredentialBody {
	const KIND: IdType = IdType::Credential;

	fn identity(&self) -> serde_json::Value {
		json!({
			"name": self.name,
			"pathexp": self.pathexp,
		})
	}
}

fn value_aad(id: &Id, version: u32) -> Vec<u8> {
	let mut aad = b"keyweave/credential/".to_vec();
	aad.extend_from_slice(id.as_bytes());
	aad.extend_from_slice(&version.to_be_bytes());
	aad
}

/// Seal `value` as `version` of `(pathexp, name)`. A `None` value produces an
/// unset marker.
pub fn seal_credential(
	name: CredentialName,
	pathexp: PathExp,
	key: &KeyringKey,
	value: Option<&SecretString>,
	version: u32,
) -> Result<Unsigned<CredentialBody>> {
	let mut body = CredentialBody {
		name,
		pathexp,
		keyring_id: key.keyring_id(),
		value: None,
		created_at: Utc::now(),
	};
	let id = body.content_id()?;
	if let Some(value) = value {
		body.value = Some(encryption::encrypt(
			key.bytes(),
			value.expose().as_bytes(),
			&value_aad(&id, version),
		)?);
	}
	Unsigned::with_version(body, version)
}

/// Decrypt a verified credential. Returns `None` for an unset marker.
pub fn open_credential(credential: &Verified<CredentialBody>, key: &KeyringKey) -> Result<Option<SecretString>> {
	let body = credential.body();
	if body.keyring_id != key.keyring_id() {
		return Err(Error::Internal(format!(
			"credential {} is sealed under keyring {}, not {}",
			credential.id(),
			body.keyring_id,
			key.keyring_id()
		)));
	}
	let Some(sealed) = &body.value else {
		return Ok(None);
	};

	let plaintext = encryption::decrypt(key.bytes(), sealed, &value_aad(&credential.id(), credential.version()))?;
	let text = String::from_utf8(plaintext.to_vec())
		.map_err(|_| Error::Decryption("credential value is not UTF-8".to_string()))?;
	Ok(Some(SecretString::new(text)))
}
