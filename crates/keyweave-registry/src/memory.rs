// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! In-process registry.
//!
//! Holds everything in one shared store. Each [`MemoryRegistry`] handle has
//! its own bearer token, so several daemons (one per identity) can share a
//! store the way they would share a remote registry.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use keyweave_common_secret::SecretString;
use keyweave_core::{
	verify_login_proof, AuthInfo, ClaimedKeyPair, ClaimedPublicKey, CredentialTree, Enrollment, Id,
	IdType, IdentityInfo, IdentityKind, IdentityState, MachineCreation, MachineSegment, TokenSegment,
	UserBody,
};
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::error::{RegistryError, RegistryResult};
use crate::types::{LoginChallenge, LoginMaterial, ProfileUpdate, TreeQuery};
use crate::Registry;

struct UserRecord {
	id: Id,
	body: UserBody,
	state: IdentityState,
	auth_key: Vec<u8>,
	keypairs: Vec<ClaimedKeyPair>,
	verification_code: String,
}

impl UserRecord {
	fn info(&self) -> IdentityInfo {
		IdentityInfo {
			id: self.id,
			kind: IdentityKind::User,
			name: self.body.name.clone(),
			email: Some(self.body.email.clone()),
			state: self.state,
			created_by: None,
		}
	}
}

struct MachineRecord {
	segment: MachineSegment,
	auth_keys: BTreeMap<Id, Vec<u8>>,
}

impl MachineRecord {
	fn info(&self) -> IdentityInfo {
		let body = self.segment.machine.unverified_body();
		IdentityInfo {
			id: self.segment.machine.id(),
			kind: IdentityKind::Machine,
			name: body.name.clone(),
			email: None,
			state: IdentityState::Active,
			created_by: Some(body.created_by),
		}
	}

	fn public_keys(&self) -> impl Iterator<Item = ClaimedPublicKey> + '_ {
		self.segment
			.tokens
			.iter()
			.flat_map(|t| t.keypairs.iter().map(ClaimedKeyPair::public))
	}
}

#[derive(Clone)]
struct Principal {
	identity_id: Id,
	kind: IdentityKind,
}

#[derive(Default)]
struct Store {
	users: BTreeMap<Id, UserRecord>,
	emails: BTreeMap<String, Id>,
	machines: BTreeMap<Id, MachineRecord>,
	tokens: BTreeMap<Id, Id>,
	trees: BTreeMap<Id, CredentialTree>,
	challenges: BTreeMap<String, Vec<u8>>,
	sessions: BTreeMap<String, Principal>,
}

impl Store {
	fn public_keys_of(&self, owner: &Id) -> Vec<ClaimedPublicKey> {
		if let Some(user) = self.users.get(owner) {
			return user.keypairs.iter().map(ClaimedKeyPair::public).collect();
		}
		if let Some(machine) = self.machines.get(owner) {
			return machine.public_keys().collect();
		}
		Vec::new()
	}

	fn identity_state(&self, principal: &Principal) -> IdentityState {
		match self.users.get(&principal.identity_id) {
			Some(user) => user.state,
			None => IdentityState::Active,
		}
	}

	fn user_mut(&mut self, principal: &Principal) -> RegistryResult<&mut UserRecord> {
		if principal.kind != IdentityKind::User {
			return Err(RegistryError::Unauthorized("only users have profiles".to_string()));
		}
		self.users
			.get_mut(&principal.identity_id)
			.ok_or_else(|| RegistryError::NotFound(format!("user {}", principal.identity_id)))
	}
}

fn random_bytes<const N: usize>() -> [u8; N] {
	let mut bytes = [0u8; N];
	OsRng.fill_bytes(&mut bytes);
	bytes
}

fn verification_code() -> String {
	hex::encode(random_bytes::<4>())
}

/// A registry that lives in memory. Cloning via [`MemoryRegistry::handle`]
/// shares the store but not the auth token.
pub struct MemoryRegistry {
	store: Arc<Mutex<Store>>,
	auth_token: RwLock<Option<SecretString>>,
}

impl Default for MemoryRegistry {
	fn default() -> Self {
		Self::new()
	}
}

impl MemoryRegistry {
	pub fn new() -> Self {
		Self {
			store: Arc::new(Mutex::new(Store::default())),
			auth_token: RwLock::new(None),
		}
	}

	/// Another client of the same store, logged out.
	pub fn handle(&self) -> Self {
		Self {
			store: Arc::clone(&self.store),
			auth_token: RwLock::new(None),
		}
	}

	/// The code that would have been emailed to `email`.
	pub async fn verification_code(&self, email: &str) -> Option<String> {
		let store = self.store.lock().await;
		let id = store.emails.get(&email.to_ascii_lowercase())?;
		store.users.get(id).map(|u| u.verification_code.clone())
	}

	/// Number of credential trees stored, one per keyring generation.
	pub async fn tree_count(&self) -> usize {
		self.store.lock().await.trees.len()
	}

	async fn principal(&self, store: &Store) -> RegistryResult<Principal> {
		let token = self.auth_token.read().await;
		let token = token
			.as_ref()
			.ok_or_else(|| RegistryError::Unauthorized("missing auth token".to_string()))?;
		store
			.sessions
			.get(token.expose())
			.cloned()
			.ok_or_else(|| RegistryError::Unauthorized("invalid auth token".to_string()))
	}

	async fn active_principal(&self, store: &Store) -> RegistryResult<Principal> {
		let principal = self.principal(store).await?;
		if store.identity_state(&principal) == IdentityState::Unverified {
			return Err(RegistryError::Unverified);
		}
		Ok(principal)
	}
}

#[async_trait]
impl Registry for MemoryRegistry {
	async fn begin_login(&self, identifier: &str) -> RegistryResult<LoginChallenge> {
		let mut store = self.store.lock().await;

		let (salt, kdf) = match identifier.parse::<Id>() {
			Ok(token_id) if token_id.kind() == IdType::MachineToken => {
				let machine = store
					.tokens
					.get(&token_id)
					.and_then(|m| store.machines.get(m))
					.ok_or_else(|| RegistryError::Unauthorized("unknown machine token".to_string()))?;
				machine
					.segment
					.tokens
					.iter()
					.find(|t| t.token.id() == token_id)
					.map(|t| {
						let body = t.token.unverified_body();
						(body.salt.clone(), body.kdf)
					})
					.ok_or_else(|| RegistryError::Unauthorized("unknown machine token".to_string()))?
			}
			_ => {
				let email = identifier.to_ascii_lowercase();
				store
					.emails
					.get(&email)
					.and_then(|id| store.users.get(id))
					.map(|u| (u.body.salt.clone(), u.body.kdf))
					.ok_or_else(|| RegistryError::Unauthorized("unknown identity".to_string()))?
			}
		};

		let login_token = random_bytes::<32>().to_vec();
		store.challenges.insert(identifier.to_ascii_lowercase(), login_token.clone());
		Ok(LoginChallenge { salt, kdf, login_token })
	}

	async fn complete_login(&self, identifier: &str, proof: &[u8]) -> RegistryResult<LoginMaterial> {
		let mut store = self.store.lock().await;
		let key = identifier.to_ascii_lowercase();
		let login_token = store
			.challenges
			.remove(&key)
			.ok_or_else(|| RegistryError::Unauthorized("no login in progress".to_string()))?;

		let auth_token = hex::encode(random_bytes::<32>());
		let rejected = || RegistryError::Unauthorized("invalid credentials".to_string());

		let (principal, material) = match identifier.parse::<Id>() {
			Ok(token_id) if token_id.kind() == IdType::MachineToken => {
				let machine_id = *store.tokens.get(&token_id).ok_or_else(rejected)?;
				let machine = store.machines.get(&machine_id).ok_or_else(rejected)?;
				let auth_key = machine.auth_keys.get(&token_id).ok_or_else(rejected)?;
				if !verify_login_proof(auth_key, &login_token, proof) {
					return Err(rejected());
				}
				let token = machine
					.segment
					.tokens
					.iter()
					.find(|t| t.token.id() == token_id)
					.ok_or_else(rejected)?;
				let creator = machine.segment.machine.unverified_body().created_by;
				let material = LoginMaterial {
					auth_token: SecretString::new(auth_token.clone()),
					identity: machine.info(),
					auth: AuthInfo {
						kind: IdentityKind::Machine,
						id: token_id,
						identifier: token_id.to_string(),
					},
					keypairs: token.keypairs.clone(),
					public_keys: store.public_keys_of(&creator),
				};
				let principal = Principal {
					identity_id: machine_id,
					kind: IdentityKind::Machine,
				};
				(principal, material)
			}
			_ => {
				let user = store
					.emails
					.get(&key)
					.and_then(|id| store.users.get(id))
					.ok_or_else(rejected)?;
				if !verify_login_proof(&user.auth_key, &login_token, proof) {
					return Err(rejected());
				}
				let material = LoginMaterial {
					auth_token: SecretString::new(auth_token.clone()),
					identity: user.info(),
					auth: AuthInfo {
						kind: IdentityKind::User,
						id: user.id,
						identifier: user.body.email.clone(),
					},
					keypairs: user.keypairs.clone(),
					public_keys: Vec::new(),
				};
				let principal = Principal {
					identity_id: user.id,
					kind: IdentityKind::User,
				};
				(principal, material)
			}
		};

		debug!(identity_id = %principal.identity_id, "login completed");
		store.sessions.insert(auth_token, principal);
		Ok(material)
	}

	async fn logout(&self) -> RegistryResult<()> {
		let mut store = self.store.lock().await;
		if let Some(token) = self.auth_token.read().await.as_ref() {
			store.sessions.remove(token.expose());
		}
		Ok(())
	}

	async fn set_auth_token(&self, token: Option<SecretString>) {
		*self.auth_token.write().await = token;
	}

	async fn has_auth_token(&self) -> bool {
		self.auth_token.read().await.is_some()
	}

	async fn register_user(&self, enrollment: &Enrollment) -> RegistryResult<IdentityInfo> {
		let mut store = self.store.lock().await;
		let user = &enrollment.user;
		user.check_id()
			.map_err(|e| RegistryError::BadRequest(e.to_string()))?;
		if enrollment.keypairs.iter().any(|k| k.owner_id() != user.id) {
			return Err(RegistryError::BadRequest("keypair owned by another identity".to_string()));
		}
		if store.emails.contains_key(&user.body.email) || store.users.contains_key(&user.id) {
			return Err(RegistryError::BadRequest("identity already registered".to_string()));
		}

		let record = UserRecord {
			id: user.id,
			body: user.body.clone(),
			state: IdentityState::Unverified,
			auth_key: enrollment.auth_key.clone(),
			keypairs: enrollment.keypairs.clone(),
			verification_code: verification_code(),
		};
		let info = record.info();
		store.emails.insert(user.body.email.clone(), user.id);
		store.users.insert(user.id, record);
		info!(user_id = %user.id, "registered user");
		Ok(info)
	}

	async fn verify_email(&self, code: &str) -> RegistryResult<IdentityInfo> {
		let mut store = self.store.lock().await;
		let principal = self.principal(&store).await?;
		let user = store.user_mut(&principal)?;
		if user.verification_code != code {
			return Err(RegistryError::BadRequest("invalid verification code".to_string()));
		}
		user.state = IdentityState::Active;
		Ok(user.info())
	}

	async fn update_profile(&self, update: &ProfileUpdate) -> RegistryResult<IdentityInfo> {
		let mut store = self.store.lock().await;
		let principal = self.principal(&store).await?;

		let new_email = update.email.as_ref().map(|e| e.to_ascii_lowercase());
		if let Some(email) = &new_email {
			if store.emails.get(email).is_some_and(|id| *id != principal.identity_id) {
				return Err(RegistryError::BadRequest("email already registered".to_string()));
			}
		}

		let user = store.user_mut(&principal)?;
		let old_email = user.body.email.clone();
		if let Some(name) = &update.name {
			user.body.name = name.clone();
		}
		if let Some(email) = new_email.filter(|e| *e != old_email) {
			user.body.email = email.clone();
			user.state = IdentityState::Unverified;
			user.verification_code = verification_code();
			let info = user.info();
			store.emails.remove(&old_email);
			store.emails.insert(email, principal.identity_id);
			return Ok(info);
		}
		Ok(user.info())
	}

	async fn list_public_keys(&self, owners: &[Id]) -> RegistryResult<Vec<ClaimedPublicKey>> {
		let store = self.store.lock().await;
		self.active_principal(&store).await?;
		Ok(owners.iter().flat_map(|o| store.public_keys_of(o)).collect())
	}

	async fn post_credential_tree(&self, tree: &CredentialTree) -> RegistryResult<CredentialTree> {
		let mut store = self.store.lock().await;
		self.active_principal(&store).await?;

		let keyring_id = tree.keyring.id();
		let stored = store.trees.entry(keyring_id).or_insert_with(|| CredentialTree {
			keyring: tree.keyring.clone(),
			members: Vec::new(),
			credentials: Vec::new(),
		});

		for credential in &tree.credentials {
			let taken = stored
				.credentials
				.iter()
				.any(|c| c.id() == credential.id() && c.version() == credential.version());
			if taken {
				return Err(RegistryError::BadRequest(format!(
					"credential {} version {} already exists",
					credential.id(),
					credential.version()
				)));
			}
		}
		for member in &tree.members {
			stored.members.retain(|m| m.id() != member.id());
			stored.members.push(member.clone());
		}
		stored.credentials.extend(tree.credentials.iter().cloned());

		debug!(%keyring_id, members = stored.members.len(), credentials = stored.credentials.len(), "stored credential tree");
		Ok(stored.clone())
	}

	async fn list_credential_trees(&self, query: &TreeQuery) -> RegistryResult<Vec<CredentialTree>> {
		query.validate()?;
		let store = self.store.lock().await;
		self.active_principal(&store).await?;

		let trees = store
			.trees
			.values()
			.filter(|tree| {
				let pathexp = &tree.keyring.unverified_body().pathexp;
				query.path.as_ref().map_or(true, |p| pathexp.matches(p))
					&& query.pathexp.as_ref().map_or(true, |p| pathexp == p)
					&& query
						.owner_id
						.map_or(true, |o| tree.members.iter().any(|m| m.unverified_body().owner_id == o))
			})
			.map(|tree| {
				let mut tree = tree.clone();
				if let Some(name) = &query.name {
					tree.credentials.retain(|c| c.unverified_body().name == *name);
				}
				tree
			})
			.collect();
		Ok(trees)
	}

	async fn create_machine(&self, creation: &MachineCreation) -> RegistryResult<MachineSegment> {
		let mut store = self.store.lock().await;
		let principal = self.active_principal(&store).await?;
		if principal.kind != IdentityKind::User {
			return Err(RegistryError::Unauthorized("only users can create machines".to_string()));
		}

		let machine_id = creation.machine.id();
		if creation.machine.unverified_body().created_by != principal.identity_id {
			return Err(RegistryError::Unauthorized("machine created_by must be the caller".to_string()));
		}
		if store.machines.contains_key(&machine_id) {
			return Err(RegistryError::BadRequest(format!("machine {machine_id} already exists")));
		}
		if creation.tokens.is_empty() {
			return Err(RegistryError::BadRequest("a machine needs at least one token".to_string()));
		}

		let mut auth_keys = BTreeMap::new();
		let mut tokens = Vec::with_capacity(creation.tokens.len());
		for token in &creation.tokens {
			if token.token.unverified_body().machine_id != machine_id
				|| token.keypairs.iter().any(|k| k.owner_id() != machine_id)
			{
				return Err(RegistryError::BadRequest("token does not belong to the machine".to_string()));
			}
			auth_keys.insert(token.token.id(), token.auth_key.clone());
			tokens.push(TokenSegment {
				token: token.token.clone(),
				keypairs: token.keypairs.clone(),
			});
		}

		let segment = MachineSegment {
			machine: creation.machine.clone(),
			memberships: creation.memberships.clone(),
			tokens,
		};
		for token_id in auth_keys.keys() {
			store.tokens.insert(*token_id, machine_id);
		}
		store.machines.insert(
			machine_id,
			MachineRecord {
				segment: segment.clone(),
				auth_keys,
			},
		);
		info!(%machine_id, "created machine");
		Ok(segment)
	}

	async fn get_machine(&self, id: &Id) -> RegistryResult<MachineSegment> {
		let store = self.store.lock().await;
		self.active_principal(&store).await?;
		store
			.machines
			.get(id)
			.map(|m| m.segment.clone())
			.ok_or_else(|| RegistryError::NotFound(format!("machine {id}")))
	}
}

impl std::fmt::Debug for MemoryRegistry {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("MemoryRegistry")
			.field(
				"has_auth_token",
				&self.auth_token.try_read().map(|t| t.is_some()).unwrap_or(false),
			)
			.finish()
	}
}
