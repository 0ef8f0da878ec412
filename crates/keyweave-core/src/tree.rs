// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Credential trees: one keyring generation with its members and credentials.
//! This is the unit the registry stores and returns.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::credential::{CredentialBody, CredentialName};
use crate::envelope::{Body, Signed, Verified};
use crate::error::{Error, Result};
use crate::id::Id;
use crate::keyring::{KeyringBody, KeyringMemberBody};
use crate::pathexp::PathExp;
use crate::trust::TrustGraph;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialTree {
	pub keyring: Signed<KeyringBody>,
	#[serde(default)]
	pub members: Vec<Signed<KeyringMemberBody>>,
	#[serde(default)]
	pub credentials: Vec<Signed<CredentialBody>>,
}

impl CredentialTree {
	/// Identities whose signatures appear anywhere in the tree.
	pub fn signers(&self) -> BTreeSet<Id> {
		std::iter::once(self.keyring.signature().signer_id)
			.chain(self.members.iter().map(|m| m.signature().signer_id))
			.chain(self.credentials.iter().map(|c| c.signature().signer_id))
			.collect()
	}

	/// Verify every envelope and check they all belong to this keyring.
	pub fn verify(&self, trust: &TrustGraph) -> Result<VerifiedTree> {
		let keyring = self.keyring.verify(trust)?;
		let keyring_id = keyring.id();
		let pathexp = keyring.body().pathexp.clone();

		let members = verify_all(&self.members, trust, |m: &KeyringMemberBody| {
			m.keyring_id == keyring_id
		})?;
		let credentials = verify_all(&self.credentials, trust, |c: &CredentialBody| {
			c.keyring_id == keyring_id && c.pathexp == pathexp
		})?;

		Ok(VerifiedTree {
			keyring,
			members,
			credentials,
		})
	}
}

fn verify_all<T: Body>(
	envelopes: &[Signed<T>],
	trust: &TrustGraph,
	belongs: impl Fn(&T) -> bool,
) -> Result<Vec<Verified<T>>> {
	envelopes
		.iter()
		.map(|e| {
			let verified = e.verify(trust)?;
			if !belongs(verified.body()) {
				return Err(Error::Malformed(format!(
					"{} does not belong to its credential tree",
					verified.id()
				)));
			}
			Ok(verified)
		})
		.collect()
}

#[derive(Debug, Clone)]
pub struct VerifiedTree {
	pub keyring: Verified<KeyringBody>,
	pub members: Vec<Verified<KeyringMemberBody>>,
	pub credentials: Vec<Verified<CredentialBody>>,
}

impl VerifiedTree {
	pub fn pathexp(&self) -> &PathExp {
		&self.keyring.body().pathexp
	}

	pub fn generation(&self) -> u32 {
		self.keyring.body().generation
	}

	/// Sort key for picking the current generation. Two keyrings created
	/// concurrently for one scope share a generation; the higher keyring ID
	/// wins so every reader picks the same one.
	pub fn generation_order(&self) -> (u32, Id) {
		(self.generation(), self.keyring.id())
	}

	pub fn is_member(&self, owner: &Id) -> bool {
		self.members.iter().any(|m| m.body().owner_id == *owner)
	}

	pub fn member_ids(&self) -> BTreeSet<Id> {
		self.members.iter().map(|m| m.body().owner_id).collect()
	}

	/// The newest version of `name` in this tree.
	pub fn latest(&self, name: &CredentialName) -> Option<&Verified<CredentialBody>> {
		self.credentials
			.iter()
			.filter(|c| c.body().name == *name)
			.max_by_key(|c| c.version())
	}

	pub fn names(&self) -> BTreeSet<CredentialName> {
		self.credentials.iter().map(|c| c.body().name.clone()).collect()
	}
}

/// The highest-generation tree, if any.
pub fn current_generation(trees: &[VerifiedTree]) -> Option<&VerifiedTree> {
	trees.iter().max_by_key(|t| t.generation_order())
}

/// The highest version of `name` across `trees`, or 0.
pub fn latest_version(trees: &[VerifiedTree], name: &CredentialName) -> u32 {
	trees
		.iter()
		.filter_map(|t| t.latest(name))
		.map(|c| c.version())
		.max()
		.unwrap_or(0)
}
