// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The trust graph: which public keys may be believed, and for what.
//!
//! A key is trusted for a purpose when one of its claims leads, through
//! trusted signing keys, to a self-signed root:
//!
//! ```text
//! alice/signing ◀─self─ alice/signing      (root: alice's only self-signed key)
//! alice/encryption ◀──── alice/signing
//! build-bot/signing ◀─── alice/signing     (alice created the machine)
//! build-bot/encryption ◀─ build-bot/signing
//! ```
//!
//! Rules:
//! - A self-signed claim makes a root only if it is the owner's sole
//!   self-signed signing key. Competing roots cancel each other out.
//! - A claim by another identity's key counts only if that identity is an
//!   administrator, or created the (machine) owner.
//! - Claims and keys dated after the time in question are ignored.
//! - Chains longer than [`MAX_CHAIN_DEPTH`] are not followed.
//!
//! Graphs are built per operation and never cached, so a claim that stops
//! being served stops being honoured.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use x25519_dalek::PublicKey;

use crate::error::{Error, Result};
use crate::id::Id;
use crate::keypair::{claim_signature_valid, Claim, ClaimedPublicKey, KeyPurpose, PublicKeyBody};
use crate::wrap::public_key_from_bytes;

pub const MAX_CHAIN_DEPTH: usize = 8;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustPolicy {
	/// Identities whose signing keys may claim keys for anyone.
	#[serde(default)]
	pub administrators: BTreeSet<Id>,
}

/// A member-to-be: an identity and the encryption key to wrap for.
#[derive(Clone)]
pub struct Recipient {
	pub owner_id: Id,
	pub public_key_id: Id,
	pub public: PublicKey,
}

impl std::fmt::Debug for Recipient {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Recipient")
			.field("owner_id", &self.owner_id)
			.field("public_key_id", &self.public_key_id)
			.finish()
	}
}

#[derive(Debug, Clone)]
pub struct TrustGraph {
	policy: TrustPolicy,
	keys: HashMap<Id, ClaimedPublicKey>,
	/// owner -> identity that created it
	delegations: HashMap<Id, Id>,
}

impl TrustGraph {
	pub fn new(policy: TrustPolicy) -> Self {
		Self {
			policy,
			keys: HashMap::new(),
			delegations: HashMap::new(),
		}
	}

	/// Add a public key. Claims for a key already present are merged.
	pub fn insert(&mut self, key: ClaimedPublicKey) -> Result<()> {
		key.public_key.check_id()?;
		match self.keys.get_mut(&key.id()) {
			Some(existing) => {
				for claim in key.claims {
					if !existing.claims.contains(&claim) {
						existing.claims.push(claim);
					}
				}
			}
			None => {
				self.keys.insert(key.id(), key);
			}
		}
		Ok(())
	}

	/// Record that `creator` created `owner`, letting `creator`'s signing keys
	/// vouch for `owner`'s keys.
	pub fn delegate(&mut self, owner: Id, creator: Id) {
		self.delegations.insert(owner, creator);
	}

	/// The creator recorded for `owner` by [`delegate`](Self::delegate).
	pub fn creator_of(&self, owner: &Id) -> Option<Id> {
		self.delegations.get(owner).copied()
	}

	/// Owners whose keys are present.
	pub fn owners(&self) -> BTreeSet<Id> {
		self.keys.values().map(|k| k.body().owner_id).collect()
	}

	/// Owners of signing keys referenced by claims but not yet present.
	pub fn missing_signers(&self) -> BTreeSet<Id> {
		self.keys
			.values()
			.flat_map(|k| k.claims.iter())
			.filter(|c| !self.keys.contains_key(&c.signer_key_id))
			.map(|c| c.signer_id)
			.collect()
	}

	pub fn is_trusted(&self, key_id: &Id, purpose: KeyPurpose, as_of: DateTime<Utc>) -> bool {
		self.trusted_at(key_id, purpose, as_of, 0, &mut Vec::new())
	}

	/// The key's body, if it is trusted for `purpose` at `as_of`.
	pub fn trusted_key(&self, key_id: &Id, purpose: KeyPurpose, as_of: DateTime<Utc>) -> Result<&PublicKeyBody> {
		let Some(entry) = self.keys.get(key_id) else {
			return Err(Error::UntrustedKey {
				key_id: *key_id,
				reason: "unknown key".to_string(),
			});
		};
		if !self.is_trusted(key_id, purpose, as_of) {
			return Err(Error::UntrustedKey {
				key_id: *key_id,
				reason: format!("no trusted claim for {purpose} as of {as_of}"),
			});
		}
		Ok(entry.body())
	}

	/// The newest trusted encryption key of `owner`.
	pub fn recipient(&self, owner: Id, as_of: DateTime<Utc>) -> Result<Recipient> {
		let newest = self
			.keys
			.values()
			.filter(|k| k.body().owner_id == owner && k.body().purpose == KeyPurpose::Encryption)
			.filter(|k| self.is_trusted(&k.id(), KeyPurpose::Encryption, as_of))
			.max_by_key(|k| (k.body().created_at, k.id()));

		let Some(key) = newest else {
			return Err(Error::NoTrustedKey {
				owner_id: owner,
				purpose: KeyPurpose::Encryption.to_string(),
			});
		};
		Ok(Recipient {
			owner_id: owner,
			public_key_id: key.id(),
			public: public_key_from_bytes(&key.body().key)?,
		})
	}

	fn trusted_at(
		&self,
		key_id: &Id,
		purpose: KeyPurpose,
		as_of: DateTime<Utc>,
		depth: usize,
		chain: &mut Vec<Id>,
	) -> bool {
		if depth > MAX_CHAIN_DEPTH || chain.contains(key_id) {
			return false;
		}
		let Some(entry) = self.keys.get(key_id) else {
			return false;
		};
		let body = entry.body();
		if body.purpose != purpose || body.created_at > as_of {
			return false;
		}

		chain.push(*key_id);
		let trusted = entry
			.claims
			.iter()
			.filter(|c| c.created_at <= as_of)
			.any(|claim| self.claim_holds(entry, claim, as_of, depth, chain));
		chain.pop();
		trusted
	}

	fn claim_holds(
		&self,
		entry: &ClaimedPublicKey,
		claim: &Claim,
		as_of: DateTime<Utc>,
		depth: usize,
		chain: &mut Vec<Id>,
	) -> bool {
		let Some(signer) = self.keys.get(&claim.signer_key_id) else {
			return false;
		};
		let signer_body = signer.body();
		if signer_body.purpose != KeyPurpose::Signing || signer_body.owner_id != claim.signer_id {
			return false;
		}
		if !claim_signature_valid(&entry.public_key, claim, signer_body) {
			debug!(key_id = %entry.id(), signer_key_id = %claim.signer_key_id, "claim signature invalid");
			return false;
		}

		let owner = entry.body().owner_id;
		if claim.is_self_signed(&entry.id()) {
			return self.is_sole_root(owner, &entry.id(), as_of);
		}
		if claim.signer_id != owner && !self.may_vouch_for(&claim.signer_id, &owner) {
			return false;
		}
		self.trusted_at(&claim.signer_key_id, KeyPurpose::Signing, as_of, depth + 1, chain)
	}

	fn may_vouch_for(&self, signer_owner: &Id, owner: &Id) -> bool {
		self.policy.administrators.contains(signer_owner) || self.delegations.get(owner) == Some(signer_owner)
	}

	fn is_sole_root(&self, owner: Id, key_id: &Id, as_of: DateTime<Utc>) -> bool {
		let mut roots = self.keys.values().filter(|k| {
			let body = k.body();
			body.owner_id == owner
				&& body.purpose == KeyPurpose::Signing
				&& body.created_at <= as_of
				&& k.claims.iter().any(|c| {
					c.is_self_signed(&k.id())
						&& c.created_at <= as_of
						&& claim_signature_valid(&k.public_key, c, body)
				})
		});

		match (roots.next(), roots.next()) {
			(Some(only), None) => only.id() == *key_id,
			_ => false,
		}
	}
}
