// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Credential graph resolution: which value does a concrete path see?
//!
//! Trees are grouped into scopes by path expression; a scope's generations
//! share one credential history. For a name at a path:
//!
//! 1. keep scopes whose expression matches the path and whose newest version
//!    of the name is not unset
//! 2. pick the most specific scope; a tie is an error, never a coin flip
//! 3. the caller must be a member of that scope's current generation
//! 4. unwrap the key of the generation that sealed the newest version, and
//!    decrypt

use std::collections::{BTreeMap, BTreeSet};

use keyweave_common_secret::SecretString;
use tracing::debug;

use crate::credential::{open_credential, CredentialBody, CredentialName};
use crate::envelope::Verified;
use crate::error::{Error, ErrorKind, Result};
use crate::keypair::EncryptionKeyPair;
use crate::keyring::unwrap_keyring_key;
use crate::pathexp::{PathExp, ResourcePath};
use crate::tree::VerifiedTree;

/// All generations of one path expression.
struct Scope<'a> {
	pathexp: &'a PathExp,
	trees: Vec<&'a VerifiedTree>,
}

struct Candidate<'a> {
	scope: &'a Scope<'a>,
	sealed_in: &'a VerifiedTree,
	credential: &'a Verified<CredentialBody>,
}

impl<'a> Scope<'a> {
	fn current(&self) -> Option<&'a VerifiedTree> {
		self.trees.iter().copied().max_by_key(|t| t.generation_order())
	}

	fn latest(&self, name: &CredentialName) -> Option<(&'a VerifiedTree, &'a Verified<CredentialBody>)> {
		self.trees
			.iter()
			.copied()
			.filter_map(|t| t.latest(name).map(|c| (t, c)))
			.max_by_key(|(t, c)| (c.version(), t.generation_order()))
	}
}

fn matching_scopes<'a>(trees: &'a [VerifiedTree], path: &ResourcePath) -> Vec<Scope<'a>> {
	let mut grouped: BTreeMap<&PathExp, Vec<&VerifiedTree>> = BTreeMap::new();
	for tree in trees.iter().filter(|t| t.pathexp().matches(path)) {
		grouped.entry(tree.pathexp()).or_default().push(tree);
	}
	grouped
		.into_iter()
		.map(|(pathexp, trees)| Scope { pathexp, trees })
		.collect()
}

fn select<'a>(
	scopes: &'a [Scope<'a>],
	path: &ResourcePath,
	name: &CredentialName,
) -> Result<Option<Candidate<'a>>> {
	let candidates: Vec<Candidate<'a>> = scopes
		.iter()
		.filter_map(|scope| {
			let (sealed_in, credential) = scope.latest(name)?;
			if credential.body().is_unset() {
				return None;
			}
			Some(Candidate {
				scope,
				sealed_in,
				credential,
			})
		})
		.collect();

	let Some(best) = candidates.iter().map(|c| c.scope.pathexp.specificity()).max() else {
		return Ok(None);
	};
	let mut tied: Vec<Candidate<'a>> = candidates
		.into_iter()
		.filter(|c| c.scope.pathexp.specificity() == best)
		.collect();

	if tied.len() > 1 {
		return Err(Error::AmbiguousScope {
			name: name.to_string(),
			path: path.to_string(),
			candidates: tied.iter().map(|c| c.scope.pathexp.to_string()).collect(),
		});
	}
	Ok(tied.pop())
}

fn open(candidate: &Candidate<'_>, me: &EncryptionKeyPair) -> Result<SecretString> {
	let Some(current) = candidate.scope.current() else {
		return Err(Error::Internal("scope without trees".to_string()));
	};
	if !current.is_member(&me.owner_id()) {
		return Err(Error::NotAMember {
			keyring_id: current.keyring.id(),
		});
	}

	let sealed_in = candidate.sealed_in;
	let key = unwrap_keyring_key(sealed_in.keyring.id(), &sealed_in.members, me)?;
	debug!(
		name = %candidate.credential.body().name,
		pathexp = %candidate.scope.pathexp,
		version = candidate.credential.version(),
		generation = sealed_in.generation(),
		"resolved credential"
	);

	open_credential(candidate.credential, &key)?
		.ok_or_else(|| Error::Internal("selected an unset credential".to_string()))
}

/// Resolve and decrypt `name` as seen from `path`.
pub fn resolve_credential(
	trees: &[VerifiedTree],
	path: &ResourcePath,
	name: &CredentialName,
	me: &EncryptionKeyPair,
) -> Result<SecretString> {
	let scopes = matching_scopes(trees, path);
	match select(&scopes, path, name)? {
		Some(candidate) => open(&candidate, me),
		None => Err(Error::NotFound(format!("credential {name} at {path}"))),
	}
}

/// Everything visible from one path.
#[derive(Debug, Default)]
pub struct Resolution {
	pub values: BTreeMap<CredentialName, SecretString>,
	/// Names that are ambiguous at the path or that the caller may not read.
	pub skipped: BTreeMap<CredentialName, Error>,
}

/// Resolve every credential name visible from `path`.
///
/// Each name is decided on its own. Ambiguity and missing access only skip
/// that name; integrity failures abort the whole call.
pub fn resolve_all(trees: &[VerifiedTree], path: &ResourcePath, me: &EncryptionKeyPair) -> Result<Resolution> {
	let scopes = matching_scopes(trees, path);
	let names: BTreeSet<CredentialName> = scopes
		.iter()
		.flat_map(|s| s.trees.iter().flat_map(|t| t.names()))
		.collect();

	let mut resolution = Resolution::default();
	for name in names {
		let outcome = match select(&scopes, path, &name) {
			Ok(Some(candidate)) => open(&candidate, me),
			Ok(None) => continue,
			Err(err) => Err(err),
		};
		match outcome {
			Ok(value) => {
				resolution.values.insert(name, value);
			}
			Err(err) if matches!(err.kind(), ErrorKind::AmbiguousScope | ErrorKind::Authorization) => {
				debug!(%name, error = %err, "skipping credential");
				resolution.skipped.insert(name, err);
			}
			Err(err) => return Err(err),
		}
	}
	Ok(resolution)
}
