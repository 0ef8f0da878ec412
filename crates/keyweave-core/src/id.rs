// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Content-addressed identifiers.
//!
//! An [`Id`] is 18 bytes: a format version, an [`IdType`] tag and the first 16
//! bytes of SHA-256 over the canonical JSON of an object's identity fields.
//! Anyone holding the object can recompute its ID, which is how envelopes
//! detect a body that was swapped underneath a valid-looking ID.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

pub const ID_VERSION: u8 = 0x01;
pub const ID_LEN: usize = 18;
const HASH_LEN: usize = ID_LEN - 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum IdType {
	User = 0x01,
	Machine = 0x02,
	MachineToken = 0x03,
	Membership = 0x04,
	PublicKey = 0x05,
	PrivateKey = 0x06,
	Keyring = 0x07,
	KeyringMember = 0x08,
	Credential = 0x09,
}

impl IdType {
	fn from_byte(b: u8) -> Option<Self> {
		Some(match b {
			0x01 => IdType::User,
			0x02 => IdType::Machine,
			0x03 => IdType::MachineToken,
			0x04 => IdType::Membership,
			0x05 => IdType::PublicKey,
			0x06 => IdType::PrivateKey,
			0x07 => IdType::Keyring,
			0x08 => IdType::KeyringMember,
			0x09 => IdType::Credential,
			_ => return None,
		})
	}
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id([u8; ID_LEN]);

impl Id {
	/// Derive the ID of an object of `kind` from its identity fields.
	pub fn derive(kind: IdType, identity: &serde_json::Value) -> Result<Self> {
		let canonical = canonical_json(identity)?;
		let digest = Sha256::digest(&canonical);

		let mut bytes = [0u8; ID_LEN];
		bytes[0] = ID_VERSION;
		bytes[1] = kind as u8;
		bytes[2..].copy_from_slice(&digest[..HASH_LEN]);
		Ok(Self(bytes))
	}

	pub fn kind(&self) -> IdType {
		// Construction guarantees a known tag.
		IdType::from_byte(self.0[1]).unwrap_or(IdType::User)
	}

	pub fn as_bytes(&self) -> &[u8; ID_LEN] {
		&self.0
	}

	pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
		let arr: [u8; ID_LEN] = bytes
			.try_into()
			.map_err(|_| Error::InvalidId(format!("expected {ID_LEN} bytes, got {}", bytes.len())))?;
		if arr[0] != ID_VERSION {
			return Err(Error::InvalidId(format!("unknown id version {:#04x}", arr[0])));
		}
		if IdType::from_byte(arr[1]).is_none() {
			return Err(Error::InvalidId(format!("unknown id type {:#04x}", arr[1])));
		}
		Ok(Self(arr))
	}
}

/// Serialize `value` as JSON with object keys in sorted order.
///
/// `serde_json::Value` stores objects in a `BTreeMap`, so a round trip
/// through `Value` yields a stable byte form for hashing and signing.
pub fn canonical_json<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
	let value = serde_json::to_value(value)?;
	Ok(serde_json::to_vec(&value)?)
}

impl fmt::Display for Id {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&hex::encode(self.0))
	}
}

impl fmt::Debug for Id {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "Id({self})")
	}
}

impl FromStr for Id {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self> {
		let bytes = hex::decode(s).map_err(|e| Error::InvalidId(format!("{s:?}: {e}")))?;
		Self::from_bytes(&bytes)
	}
}

impl Serialize for Id {
	fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
		serializer.serialize_str(&self.to_string())
	}
}

impl<'de> Deserialize<'de> for Id {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
		let s = String::deserialize(deserializer)?;
		s.parse().map_err(serde::de::Error::custom)
	}
}
