// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Credential operations: the session's keys applied to registry data.
//!
//! Every operation fetches what it needs, verifies it against a trust graph
//! built for that operation, and performs at most one registry write. Nothing
//! is cached between operations.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use keyweave_common_secret::SecretString;
use keyweave_core::tree::{current_generation, latest_version};
use keyweave_core::trust::MAX_CHAIN_DEPTH;
use keyweave_core::{
	add_member, create_keyring, enroll, new_machine, resolve_all, resolve_credential, revoke_member,
	seal_credential, unwrap_keyring_key, CredentialName, CredentialTree, Error, Id, IdType, IdentityInfo,
	IdentityKind, KdfParams, KeyringKey, MachineSegment, PathExp, Recipient, Resolution, ResourcePath,
	Result, TrustGraph, TrustPolicy, VerifiedTree,
};
use keyweave_registry::{ProfileUpdate, Registry, RegistryResult, TreeQuery};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::config::DaemonConfig;
use crate::session::{ActiveSession, LoginCredential, SessionHandle, Status, Who};

/// Settings the engine and session share.
#[derive(Debug, Clone)]
pub struct EngineOptions {
	pub kdf: KdfParams,
	pub trust: TrustPolicy,
	/// Upper bound on every registry call.
	pub timeout: Duration,
}

impl From<&DaemonConfig> for EngineOptions {
	fn from(config: &DaemonConfig) -> Self {
		Self {
			kdf: config.kdf,
			trust: config.trust.clone(),
			timeout: config.registry.timeout(),
		}
	}
}

/// Run one registry call under `timeout`. No retries.
pub(crate) async fn registry_call<T>(
	timeout: Duration,
	call: impl Future<Output = RegistryResult<T>>,
) -> Result<T> {
	match tokio::time::timeout(timeout, call).await {
		Ok(result) => result.map_err(Error::from),
		Err(_) => Err(Error::Transport(format!(
			"registry call timed out after {}s",
			timeout.as_secs_f32()
		))),
	}
}

/// Fetch signer keys until every claim in `trust` has its signer, recording
/// machine creators as delegations along the way.
///
/// A creator is only recorded once the machine envelope verifies under the
/// graph as built so far and was signed by that creator.
pub(crate) async fn complete_trust<R: Registry + ?Sized>(
	registry: &R,
	trust: &mut TrustGraph,
	timeout: Duration,
) -> Result<()> {
	let mut requested = BTreeSet::new();
	let mut delegated = BTreeSet::new();

	for _ in 0..=MAX_CHAIN_DEPTH {
		for machine in trust.owners().into_iter().filter(|o| o.kind() == IdType::Machine) {
			if delegated.insert(machine) {
				let creator = verified_creator(registry, trust, machine, &mut requested, timeout).await?;
				trust.delegate(machine, creator);
			}
		}

		if !fetch_signers(registry, trust, Vec::new(), &mut requested, timeout).await? {
			return Ok(());
		}
	}
	Ok(())
}

/// The user who created `machine`, proven by the machine envelope's
/// signature.
async fn verified_creator<R: Registry + ?Sized>(
	registry: &R,
	trust: &mut TrustGraph,
	machine: Id,
	requested: &mut BTreeSet<Id>,
	timeout: Duration,
) -> Result<Id> {
	let segment = registry_call(timeout, registry.get_machine(&machine)).await?;
	if segment.machine.id() != machine {
		return Err(Error::Malformed(format!(
			"registry returned machine {} for {machine}",
			segment.machine.id()
		)));
	}
	let creator = segment.machine.unverified_body().created_by;
	if creator.kind() != IdType::User {
		return Err(Error::Malformed(format!("machine {machine} names {creator} as its creator")));
	}

	let wanted = if trust.owners().contains(&creator) {
		Vec::new()
	} else {
		vec![creator]
	};
	for _ in 0..=MAX_CHAIN_DEPTH {
		if !fetch_signers(registry, trust, wanted.clone(), requested, timeout).await? {
			break;
		}
	}

	let verified = segment.machine.verify(trust)?;
	if verified.signer_id() != creator {
		return Err(Error::UntrustedKey {
			key_id: segment.machine.signature().public_key_id,
			reason: format!("machine {machine} is not signed by its creator {creator}"),
		});
	}
	debug!(%machine, %creator, "verified machine creator");
	Ok(creator)
}

/// Fetch keys for `extra` owners and for signers the graph is missing,
/// skipping owners already asked for. Returns false if there was nothing to
/// fetch.
async fn fetch_signers<R: Registry + ?Sized>(
	registry: &R,
	trust: &mut TrustGraph,
	extra: Vec<Id>,
	requested: &mut BTreeSet<Id>,
	timeout: Duration,
) -> Result<bool> {
	let missing: Vec<Id> = extra
		.into_iter()
		.chain(trust.missing_signers())
		.filter(|owner| requested.insert(*owner))
		.collect();
	if missing.is_empty() {
		return Ok(false);
	}
	debug!(count = missing.len(), "fetching signer keys");
	for key in registry_call(timeout, registry.list_public_keys(&missing)).await? {
		trust.insert(key)?;
	}
	Ok(true)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CredentialVersion {
	pub name: CredentialName,
	pub pathexp: PathExp,
	pub version: u32,
	pub keyring_id: Id,
	pub unset: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyringSummary {
	pub keyring_id: Id,
	pub pathexp: PathExp,
	pub generation: u32,
	pub members: BTreeSet<Id>,
}

impl From<&VerifiedTree> for KeyringSummary {
	fn from(tree: &VerifiedTree) -> Self {
		Self {
			keyring_id: tree.keyring.id(),
			pathexp: tree.pathexp().clone(),
			generation: tree.generation(),
			members: tree.member_ids(),
		}
	}
}

/// A machine as returned to its creator. `secret` is never shown again.
#[derive(Debug)]
pub struct CreatedMachine {
	pub machine_id: Id,
	pub token_id: Id,
	pub secret: SecretString,
	pub segment: MachineSegment,
}

/// The daemon's operations over one session and one registry.
pub struct CredentialEngine<R: ?Sized> {
	session: SessionHandle,
	options: EngineOptions,
	registry: Arc<R>,
}

impl<R: Registry + ?Sized> CredentialEngine<R> {
	pub fn new(registry: Arc<R>, options: EngineOptions) -> Self {
		Self {
			session: SessionHandle::new(),
			options,
			registry,
		}
	}

	pub fn session(&self) -> &SessionHandle {
		&self.session
	}

	pub fn registry(&self) -> &R {
		&self.registry
	}

	async fn call<T>(&self, call: impl Future<Output = RegistryResult<T>>) -> Result<T> {
		registry_call(self.options.timeout, call).await
	}

	// =========================================================================
	// Session
	// =========================================================================

	pub async fn login(&self, credential: &LoginCredential) -> Result<IdentityInfo> {
		self.session.login(&*self.registry, credential, &self.options).await
	}

	pub async fn logout(&self) {
		self.session.logout(&*self.registry, &self.options).await
	}

	pub async fn who(&self) -> Who {
		self.session.who().await
	}

	pub async fn status(&self) -> Status {
		self.session.status(&*self.registry).await
	}

	// =========================================================================
	// Accounts
	// =========================================================================

	/// Sign up a new user. The account starts unverified.
	#[instrument(skip(self, passphrase))]
	pub async fn enroll_user(&self, name: &str, email: &str, passphrase: &SecretString) -> Result<IdentityInfo> {
		let (name, email, passphrase) = (name.to_string(), email.to_string(), passphrase.clone());
		let params = self.options.kdf;
		let enrollment = tokio::task::spawn_blocking(move || enroll(&name, &email, &passphrase, &params))
			.await
			.map_err(|e| Error::Internal(format!("enrollment task failed: {e}")))??;
		let info = self.call(self.registry.register_user(&enrollment)).await?;
		info!(user_id = %info.id, "enrolled user");
		Ok(info)
	}

	#[instrument(skip(self, code))]
	pub async fn verify_email(&self, code: &str) -> Result<IdentityInfo> {
		let code = code.trim();
		if code.is_empty() {
			return Err(Error::Validation("verification code must not be empty".to_string()));
		}
		let session = self.session.require_logged_in().await?;
		let info = self.call(self.registry.verify_email(code)).await?;
		drop(session);
		self.session.update_identity(info.clone()).await;
		Ok(info)
	}

	#[instrument(skip(self))]
	pub async fn update_profile(&self, name: Option<&str>, email: Option<&str>) -> Result<IdentityInfo> {
		let update = ProfileUpdate {
			name: name.map(str::trim).map(str::to_string),
			email: email.map(|e| e.trim().to_ascii_lowercase()),
		};
		if update.is_empty() {
			return Err(Error::Validation("nothing to update".to_string()));
		}
		if update.name.as_deref() == Some("") {
			return Err(Error::Validation("name must not be empty".to_string()));
		}
		if update.email.as_deref().is_some_and(|e| !e.contains('@')) {
			return Err(Error::Validation("invalid email address".to_string()));
		}
		let session = self.session.require_logged_in().await?;
		let info = self.call(self.registry.update_profile(&update)).await?;
		// update_identity takes the write lock
		drop(session);
		self.session.update_identity(info.clone()).await;
		Ok(info)
	}

	// =========================================================================
	// Machines
	// =========================================================================

	/// Create a machine with one token, owned by the logged-in user.
	#[instrument(skip(self))]
	pub async fn create_machine(&self, org: &str, name: &str, teams: &[String]) -> Result<CreatedMachine> {
		let session = self.session.require_active().await?;
		if session.identity().kind != IdentityKind::User {
			return Err(Error::Unauthorized);
		}

		let creator = session.signing().clone();
		let (org, name, teams) = (org.to_string(), name.to_string(), teams.to_vec());
		let params = self.options.kdf;
		let built = tokio::task::spawn_blocking(move || new_machine(&org, &name, &teams, &creator, &params))
			.await
			.map_err(|e| Error::Internal(format!("machine creation task failed: {e}")))??;

		let segment = self.call(self.registry.create_machine(&built.creation)).await?;
		info!(machine_id = %built.machine_id, token_id = %built.token_id, "created machine");
		Ok(CreatedMachine {
			machine_id: built.machine_id,
			token_id: built.token_id,
			secret: built.secret,
			segment,
		})
	}

	/// Fetch a machine and verify its envelopes.
	#[instrument(skip(self))]
	pub async fn get_machine(&self, id: Id) -> Result<MachineSegment> {
		if id.kind() != IdType::Machine {
			return Err(Error::Validation(format!("{id} is not a machine id")));
		}
		let session = self.session.require_active().await?;
		let segment = self.call(self.registry.get_machine(&id)).await?;
		if segment.machine.id() != id {
			return Err(Error::Malformed(format!("registry returned machine {} for {id}", segment.machine.id())));
		}

		let signers: BTreeSet<Id> = std::iter::once(segment.machine.signature().signer_id)
			.chain(segment.memberships.iter().map(|m| m.signature().signer_id))
			.chain(segment.tokens.iter().map(|t| t.token.signature().signer_id))
			.collect();
		let trust = self.trust_for(&session, signers).await?;

		segment.machine.verify(&trust)?;
		for membership in &segment.memberships {
			membership.verify(&trust)?;
		}
		for token in &segment.tokens {
			token.token.verify(&trust)?;
		}
		Ok(segment)
	}

	// =========================================================================
	// Credentials
	// =========================================================================

	/// Seal `value` as the next version of `name` in `pathexp`, creating the
	/// keyring if the scope has none.
	#[instrument(skip(self, value), fields(pathexp = %pathexp, name = %name))]
	pub async fn set_credential(
		&self,
		pathexp: &PathExp,
		name: &CredentialName,
		value: &SecretString,
	) -> Result<CredentialVersion> {
		self.write_credential(pathexp, name, Some(value)).await
	}

	/// Record `name` as unset in `pathexp`. Broader scopes show through again.
	#[instrument(skip(self), fields(pathexp = %pathexp, name = %name))]
	pub async fn unset_credential(&self, pathexp: &PathExp, name: &CredentialName) -> Result<CredentialVersion> {
		self.write_credential(pathexp, name, None).await
	}

	async fn write_credential(
		&self,
		pathexp: &PathExp,
		name: &CredentialName,
		value: Option<&SecretString>,
	) -> Result<CredentialVersion> {
		let session = self.session.require_active().await?;
		let query = TreeQuery::for_pathexp(pathexp.clone()).with_name(name.clone());
		let trees = self.verified_trees(&session, &query).await?;

		let (mut tree, key) = match current_generation(&trees) {
			Some(current) => {
				let key = unwrap_keyring_key(current.keyring.id(), &current.members, session.encryption())?;
				let tree = CredentialTree {
					keyring: current.keyring.signed().clone(),
					members: Vec::new(),
					credentials: Vec::new(),
				};
				(tree, key)
			}
			None if value.is_none() => {
				return Err(Error::NotFound(format!("{name} is not set in {pathexp}")));
			}
			None => {
				let me = self.own_recipient(&session).await?;
				let rotation = create_keyring(pathexp.clone(), &[me])?;
				info!(keyring_id = %rotation.keyring.id, "creating keyring for new scope");
				let tree = CredentialTree {
					keyring: rotation.keyring.sign(session.signing())?,
					members: sign_all(rotation.members, &session)?,
					credentials: Vec::new(),
				};
				(tree, rotation.key)
			}
		};

		let previous = latest_version(&trees, name);
		if value.is_none() && previous == 0 {
			return Err(Error::NotFound(format!("{name} is not set in {pathexp}")));
		}
		let version = previous + 1;
		let credential = seal_credential(name.clone(), pathexp.clone(), &key, value, version)?;
		tree.credentials.push(credential.sign(session.signing())?);

		self.call(self.registry.post_credential_tree(&tree)).await?;
		info!(version, keyring_id = %key.keyring_id(), unset = value.is_none(), "stored credential");
		Ok(CredentialVersion {
			name: name.clone(),
			pathexp: pathexp.clone(),
			version,
			keyring_id: key.keyring_id(),
			unset: value.is_none(),
		})
	}

	/// The value of `name` as seen from `path`.
	#[instrument(skip(self), fields(path = %path, name = %name))]
	pub async fn get_credential(&self, path: &ResourcePath, name: &CredentialName) -> Result<SecretString> {
		let session = self.session.require_active().await?;
		let query = TreeQuery::at_path(path.clone()).with_name(name.clone());
		let trees = self.verified_trees(&session, &query).await?;
		resolve_credential(&trees, path, name, session.encryption())
	}

	/// Every credential visible from `path`. Names that are ambiguous there,
	/// or that the caller cannot read, come back in `skipped`.
	#[instrument(skip(self), fields(path = %path))]
	pub async fn get_credentials(&self, path: &ResourcePath) -> Result<Resolution> {
		let session = self.session.require_active().await?;
		let trees = self.verified_trees(&session, &TreeQuery::at_path(path.clone())).await?;
		let resolution = resolve_all(&trees, path, session.encryption())?;
		if !resolution.skipped.is_empty() {
			warn!(skipped = resolution.skipped.len(), "some credentials could not be resolved");
		}
		Ok(resolution)
	}

	// =========================================================================
	// Keyrings
	// =========================================================================

	/// Create a keyring for a scope that has none, with the caller as its
	/// only member.
	#[instrument(skip(self), fields(pathexp = %pathexp))]
	pub async fn create_keyring(&self, pathexp: &PathExp) -> Result<KeyringSummary> {
		let session = self.session.require_active().await?;
		let trees = self.verified_trees(&session, &TreeQuery::for_pathexp(pathexp.clone())).await?;
		if let Some(current) = current_generation(&trees) {
			return Err(Error::Validation(format!(
				"{pathexp} already has keyring {}",
				current.keyring.id()
			)));
		}

		let me = self.own_recipient(&session).await?;
		let rotation = create_keyring(pathexp.clone(), &[me])?;
		let tree = CredentialTree {
			keyring: rotation.keyring.sign(session.signing())?,
			members: sign_all(rotation.members, &session)?,
			credentials: Vec::new(),
		};
		self.post_tree(&session, tree).await
	}

	/// Give `identity` access to the current generation of `pathexp`.
	#[instrument(skip(self), fields(pathexp = %pathexp, identity = %identity))]
	pub async fn add_member(&self, pathexp: &PathExp, identity: Id) -> Result<KeyringSummary> {
		require_identity(identity)?;
		let session = self.session.require_active().await?;
		let trees = self.verified_trees(&session, &TreeQuery::for_pathexp(pathexp.clone())).await?;
		let current = current_scope(&trees, pathexp)?;
		if current.is_member(&identity) {
			return Err(Error::Validation(format!("{identity} is already a member of {pathexp}")));
		}

		let key = self.current_key(current, &session)?;
		let recipient = self.recipient(&session, identity).await?;
		let member = add_member(&key, &recipient)?;
		let tree = CredentialTree {
			keyring: current.keyring.signed().clone(),
			members: vec![member.sign(session.signing())?],
			credentials: Vec::new(),
		};
		self.post_tree(&session, tree).await
	}

	/// Rotate `pathexp` to a new generation without `identity`.
	#[instrument(skip(self), fields(pathexp = %pathexp, identity = %identity))]
	pub async fn revoke_member(&self, pathexp: &PathExp, identity: Id) -> Result<KeyringSummary> {
		require_identity(identity)?;
		let session = self.session.require_active().await?;
		let trees = self.verified_trees(&session, &TreeQuery::for_pathexp(pathexp.clone())).await?;
		let current = current_scope(&trees, pathexp)?;
		// only members may rotate
		self.current_key(current, &session)?;

		let mut remaining = Vec::new();
		for owner in current.member_ids().into_iter().filter(|o| *o != identity) {
			remaining.push(self.recipient(&session, owner).await?);
		}
		let rotation = revoke_member(&current.keyring, &current.members, identity, &remaining)?;
		let tree = CredentialTree {
			keyring: rotation.keyring.sign(session.signing())?,
			members: sign_all(rotation.members, &session)?,
			credentials: Vec::new(),
		};
		self.post_tree(&session, tree).await
	}

	// =========================================================================
	// Helpers
	// =========================================================================

	async fn post_tree(&self, session: &ActiveSession, tree: CredentialTree) -> Result<KeyringSummary> {
		let stored = self.call(self.registry.post_credential_tree(&tree)).await?;
		let trust = self.trust_for(session, stored.signers()).await?;
		let verified = stored.verify(&trust)?;
		if verified.keyring.id() != tree.keyring.id() {
			return Err(Error::Malformed("registry stored a different keyring".to_string()));
		}
		Ok(KeyringSummary::from(&verified))
	}

	fn current_key(&self, current: &VerifiedTree, session: &ActiveSession) -> Result<KeyringKey> {
		unwrap_keyring_key(current.keyring.id(), &current.members, session.encryption())
	}

	async fn verified_trees(&self, session: &ActiveSession, query: &TreeQuery) -> Result<Vec<VerifiedTree>> {
		let trees = self.call(self.registry.list_credential_trees(query)).await?;
		let signers = trees.iter().flat_map(CredentialTree::signers).collect();
		let trust = self.trust_for(session, signers).await?;
		let verified = trees
			.iter()
			.map(|tree| tree.verify(&trust))
			.collect::<Result<Vec<_>>>()?;
		debug!(trees = verified.len(), "verified credential trees");
		Ok(verified)
	}

	/// A fresh trust graph holding the caller's keys and those of `owners`.
	async fn trust_for(&self, session: &ActiveSession, mut owners: BTreeSet<Id>) -> Result<TrustGraph> {
		owners.insert(session.identity_id());
		let owners: Vec<Id> = owners.into_iter().collect();

		let mut trust = TrustGraph::new(self.options.trust.clone());
		for key in self.call(self.registry.list_public_keys(&owners)).await? {
			trust.insert(key)?;
		}
		complete_trust(&*self.registry, &mut trust, self.options.timeout).await?;
		Ok(trust)
	}

	async fn recipient(&self, session: &ActiveSession, owner: Id) -> Result<Recipient> {
		let trust = self.trust_for(session, BTreeSet::from([owner])).await?;
		trust.recipient(owner, Utc::now())
	}

	async fn own_recipient(&self, session: &ActiveSession) -> Result<Recipient> {
		let me = self.recipient(session, session.identity_id()).await?;
		if me.public_key_id != session.encryption().public_key_id() {
			return Err(Error::UntrustedKey {
				key_id: session.encryption().public_key_id(),
				reason: "session encryption key is not the newest trusted key".to_string(),
			});
		}
		Ok(me)
	}
}

fn require_identity(id: Id) -> Result<()> {
	match id.kind() {
		IdType::User | IdType::Machine => Ok(()),
		other => Err(Error::Validation(format!("{id} is a {other:?} id, not a user or machine"))),
	}
}

fn current_scope<'a>(trees: &'a [VerifiedTree], pathexp: &PathExp) -> Result<&'a VerifiedTree> {
	current_generation(trees).ok_or_else(|| Error::NotFound(format!("no keyring for {pathexp}")))
}

fn sign_all<T: keyweave_core::Body>(
	envelopes: Vec<keyweave_core::Unsigned<T>>,
	session: &ActiveSession,
) -> Result<Vec<keyweave_core::Signed<T>>> {
	envelopes.into_iter().map(|e| e.sign(session.signing())).collect()
}
