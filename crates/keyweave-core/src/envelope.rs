// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Versioned, content-addressed envelopes.
//!
//! Three states, with one-way conversions between them:
//!
//! ```text
//! Unsigned<T> ──sign(keypair)──▶ Signed<T> ──verify(trust graph)──▶ Verified<T>
//! ```
//!
//! A [`Signed`] envelope from the registry keeps its body private; callers
//! only reach the body through [`Signed::verify`], which recomputes the
//! content ID and checks the signature against a trusted signing key.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::id::{canonical_json, Id, IdType};
use crate::keypair::{verify_ed25519, KeyPurpose, SigningKeyPair};
use crate::trust::TrustGraph;

/// A domain object that can travel in an envelope.
pub trait Body: Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static {
	const KIND: IdType;

	/// The immutable fields the content ID is derived from.
	fn identity(&self) -> serde_json::Value;

	fn content_id(&self) -> Result<Id> {
		Id::derive(Self::KIND, &self.identity())
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
	pub signer_id: Id,
	pub public_key_id: Id,
	pub signed_at: DateTime<Utc>,
	#[serde(with = "crate::base64_bytes")]
	pub value: Vec<u8>,
}

#[derive(Serialize)]
struct SigningPayload<'a, T> {
	id: &'a Id,
	version: u32,
	body: &'a T,
	signed_at: DateTime<Utc>,
}

fn signing_payload<T: Body>(id: &Id, version: u32, body: &T, signed_at: DateTime<Utc>) -> Result<Vec<u8>> {
	canonical_json(&SigningPayload {
		id,
		version,
		body,
		signed_at,
	})
}

// =============================================================================
// Unsigned
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unsigned<T> {
	pub id: Id,
	pub version: u32,
	pub body: T,
}

impl<T: Body> Unsigned<T> {
	pub fn new(body: T) -> Result<Self> {
		Self::with_version(body, 1)
	}

	pub fn with_version(body: T, version: u32) -> Result<Self> {
		if version == 0 {
			return Err(Error::Validation("envelope versions start at 1".to_string()));
		}
		Ok(Self {
			id: body.content_id()?,
			version,
			body,
		})
	}

	/// Reject an envelope whose ID does not match its body.
	pub fn check_id(&self) -> Result<()> {
		let computed = self.body.content_id()?;
		if computed != self.id {
			return Err(Error::ContentIdMismatch {
				claimed: self.id,
				computed,
			});
		}
		Ok(())
	}

	pub fn sign(self, signer: &SigningKeyPair) -> Result<Signed<T>> {
		let signed_at = Utc::now();
		let payload = signing_payload(&self.id, self.version, &self.body, signed_at)?;
		let value = signer.sign(&payload);

		Ok(Signed {
			id: self.id,
			version: self.version,
			body: self.body,
			signature: Signature {
				signer_id: signer.owner_id(),
				public_key_id: signer.public_key_id(),
				signed_at,
				value,
			},
		})
	}
}

// =============================================================================
// Signed
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signed<T> {
	id: Id,
	version: u32,
	body: T,
	signature: Signature,
}

impl<T: Body> Signed<T> {
	pub fn id(&self) -> Id {
		self.id
	}

	pub fn version(&self) -> u32 {
		self.version
	}

	pub fn signature(&self) -> &Signature {
		&self.signature
	}

	/// The body before any check. Only for storage layers that index
	/// envelopes; decisions must be made on [`Signed::verify`]'s output.
	pub fn unverified_body(&self) -> &T {
		&self.body
	}

	pub fn verify(&self, trust: &TrustGraph) -> Result<Verified<T>> {
		let computed = self.body.content_id()?;
		if computed != self.id {
			return Err(Error::ContentIdMismatch {
				claimed: self.id,
				computed,
			});
		}

		let sig = &self.signature;
		let key = trust.trusted_key(&sig.public_key_id, KeyPurpose::Signing, sig.signed_at)?;
		if key.owner_id != sig.signer_id {
			return Err(Error::UntrustedKey {
				key_id: sig.public_key_id,
				reason: format!("key belongs to {}, not signer {}", key.owner_id, sig.signer_id),
			});
		}

		let payload = signing_payload(&self.id, self.version, &self.body, sig.signed_at)?;
		if !verify_ed25519(&key.key, &payload, &sig.value) {
			return Err(Error::SignatureInvalid(self.id));
		}

		Ok(Verified {
			signed: self.clone(),
		})
	}
}

// =============================================================================
// Verified
// =============================================================================

/// A signed envelope whose content ID and signature have been checked.
#[derive(Debug, Clone)]
pub struct Verified<T> {
	signed: Signed<T>,
}

impl<T: Body> Verified<T> {
	pub fn id(&self) -> Id {
		self.signed.id
	}

	pub fn version(&self) -> u32 {
		self.signed.version
	}

	pub fn body(&self) -> &T {
		&self.signed.body
	}

	pub fn signer_id(&self) -> Id {
		self.signed.signature.signer_id
	}

	pub fn signed_at(&self) -> DateTime<Utc> {
		self.signed.signature.signed_at
	}

	/// The original signed form, for resubmitting to the registry.
	pub fn signed(&self) -> &Signed<T> {
		&self.signed
	}
}
