// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The engine against a registry that rewrites what it returns.
//!
//! [`TamperingRegistry`] forwards every call to an honest in-memory registry
//! and can rewrite machine segments, public key listings and credential
//! trees on the way back, or hold a call until a test releases it.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use keyweave_common_secret::SecretString;
use keyweave_core::encryption::generate_key;
use keyweave_core::{
	ClaimedKeyPair, ClaimedPublicKey, CredentialName, CredentialTree, Enrollment, ErrorKind, Id, IdentityInfo,
	IdentityState, KdfParams, MachineCreation, MachineSegment, PathExp, ResourcePath, SigningKeyPair,
	TrustPolicy, Unsigned,
};
use keyweave_daemon::{CredentialEngine, EngineOptions, LoginCredential, WhoKind};
use keyweave_registry::{
	LoginChallenge, LoginMaterial, MemoryRegistry, ProfileUpdate, Registry, RegistryResult, TreeQuery,
};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::Notify;

const PASSPHRASE: &str = "correct horse battery staple";

type Rewrite<T> = Box<dyn Fn(T) -> T + Send + Sync>;

#[derive(Default)]
struct Rewrites {
	machines: Option<Rewrite<MachineSegment>>,
	keys: Option<Rewrite<Vec<ClaimedPublicKey>>>,
	trees: Option<Rewrite<Vec<CredentialTree>>>,
	/// Holds `verify_email` and `list_credential_trees` until notified.
	gate: Option<Arc<Notify>>,
}

struct TamperingRegistry {
	inner: MemoryRegistry,
	rewrites: Mutex<Rewrites>,
}

impl TamperingRegistry {
	fn new(inner: MemoryRegistry) -> Self {
		Self {
			inner,
			rewrites: Mutex::new(Rewrites::default()),
		}
	}

	fn rewrite_machines(&self, f: impl Fn(MachineSegment) -> MachineSegment + Send + Sync + 'static) {
		self.rewrites.lock().unwrap().machines = Some(Box::new(f));
	}

	fn rewrite_keys(&self, f: impl Fn(Vec<ClaimedPublicKey>) -> Vec<ClaimedPublicKey> + Send + Sync + 'static) {
		self.rewrites.lock().unwrap().keys = Some(Box::new(f));
	}

	fn rewrite_trees(&self, f: impl Fn(Vec<CredentialTree>) -> Vec<CredentialTree> + Send + Sync + 'static) {
		self.rewrites.lock().unwrap().trees = Some(Box::new(f));
	}

	fn hold_calls(&self, gate: Arc<Notify>) {
		self.rewrites.lock().unwrap().gate = Some(gate);
	}

	fn honest(&self) {
		*self.rewrites.lock().unwrap() = Rewrites::default();
	}

	async fn wait_at_gate(&self) {
		let gate = self.rewrites.lock().unwrap().gate.clone();
		if let Some(gate) = gate {
			gate.notified().await;
		}
	}
}

#[async_trait]
impl Registry for TamperingRegistry {
	async fn begin_login(&self, identifier: &str) -> RegistryResult<LoginChallenge> {
		self.inner.begin_login(identifier).await
	}

	async fn complete_login(&self, identifier: &str, proof: &[u8]) -> RegistryResult<LoginMaterial> {
		self.inner.complete_login(identifier, proof).await
	}

	async fn logout(&self) -> RegistryResult<()> {
		self.inner.logout().await
	}

	async fn set_auth_token(&self, token: Option<SecretString>) {
		self.inner.set_auth_token(token).await
	}

	async fn has_auth_token(&self) -> bool {
		self.inner.has_auth_token().await
	}

	async fn register_user(&self, enrollment: &Enrollment) -> RegistryResult<IdentityInfo> {
		self.inner.register_user(enrollment).await
	}

	async fn verify_email(&self, code: &str) -> RegistryResult<IdentityInfo> {
		self.wait_at_gate().await;
		self.inner.verify_email(code).await
	}

	async fn update_profile(&self, update: &ProfileUpdate) -> RegistryResult<IdentityInfo> {
		self.inner.update_profile(update).await
	}

	async fn list_public_keys(&self, owners: &[Id]) -> RegistryResult<Vec<ClaimedPublicKey>> {
		let keys = self.inner.list_public_keys(owners).await?;
		let rewrites = self.rewrites.lock().unwrap();
		Ok(match &rewrites.keys {
			Some(rewrite) => rewrite(keys),
			None => keys,
		})
	}

	async fn post_credential_tree(&self, tree: &CredentialTree) -> RegistryResult<CredentialTree> {
		self.inner.post_credential_tree(tree).await
	}

	async fn list_credential_trees(&self, query: &TreeQuery) -> RegistryResult<Vec<CredentialTree>> {
		self.wait_at_gate().await;
		let trees = self.inner.list_credential_trees(query).await?;
		let rewrites = self.rewrites.lock().unwrap();
		Ok(match &rewrites.trees {
			Some(rewrite) => rewrite(trees),
			None => trees,
		})
	}

	async fn create_machine(&self, creation: &MachineCreation) -> RegistryResult<MachineSegment> {
		self.inner.create_machine(creation).await
	}

	async fn get_machine(&self, id: &Id) -> RegistryResult<MachineSegment> {
		let segment = self.inner.get_machine(id).await?;
		let rewrites = self.rewrites.lock().unwrap();
		Ok(match &rewrites.machines {
			Some(rewrite) => rewrite(segment),
			None => segment,
		})
	}
}

type Engine = CredentialEngine<TamperingRegistry>;

fn options() -> EngineOptions {
	EngineOptions {
		kdf: KdfParams::insecure_for_tests(),
		trust: TrustPolicy::default(),
		timeout: Duration::from_secs(5),
	}
}

fn engine(registry: &MemoryRegistry) -> Engine {
	CredentialEngine::new(Arc::new(TamperingRegistry::new(registry.handle())), options())
}

fn user_login(email: &str) -> LoginCredential {
	LoginCredential::User {
		email: email.to_string(),
		passphrase: SecretString::from(PASSPHRASE),
	}
}

async fn enrolled(registry: &MemoryRegistry, email: &str) -> Engine {
	let engine = engine(registry);
	engine
		.enroll_user("Test", email, &SecretString::from(PASSPHRASE))
		.await
		.unwrap();
	engine.login(&user_login(email)).await.unwrap();
	engine
}

async fn user(registry: &MemoryRegistry, email: &str) -> Engine {
	let engine = enrolled(registry, email).await;
	let code = registry.verification_code(email).await.unwrap();
	engine.verify_email(&code).await.unwrap();
	engine
}

async fn identity_of(engine: &Engine) -> Id {
	engine.who().await.identity.unwrap().id
}

async fn signer_of(engine: &Engine) -> SigningKeyPair {
	engine.session().require_active().await.unwrap().signing().clone()
}

/// Edit a value through its wire form.
fn tamper<T: Serialize + DeserializeOwned>(value: &T, edit: impl FnOnce(&mut serde_json::Value)) -> T {
	let mut json = serde_json::to_value(value).unwrap();
	edit(&mut json);
	serde_json::from_value(json).unwrap()
}

fn pathexp(s: &str) -> PathExp {
	PathExp::parse(s).unwrap()
}

fn path(s: &str) -> ResourcePath {
	ResourcePath::parse(s).unwrap()
}

fn name(s: &str) -> CredentialName {
	CredentialName::parse(s).unwrap()
}

fn secret(s: &str) -> SecretString {
	SecretString::from(s)
}

/// An encryption key for `owner` that `signer` vouches for.
fn rogue_encryption_key(owner: Id, signer: &SigningKeyPair) -> ClaimedPublicKey {
	let (mut rogue, _) = ClaimedKeyPair::generate_encryption(owner, &generate_key()).unwrap();
	rogue.claim_with(signer).unwrap();
	rogue.public()
}

#[tokio::test]
async fn machine_record_naming_another_creator_is_rejected() {
	let registry = MemoryRegistry::new();
	let alice = user(&registry, "alice@example.com").await;
	let mallory = user(&registry, "mallory@example.com").await;
	let scope = pathexp("/acme/web/*/*/*/*");
	alice.set_credential(&scope, &name("API_KEY"), &secret("v1")).await.unwrap();
	let created = alice.create_machine("acme", "ci", &[]).await.unwrap();
	let machine_id = created.machine_id;

	// keep the machine ID but name mallory as creator and sign as mallory
	let mallory_id = identity_of(&mallory).await;
	let mallory_signer = signer_of(&mallory).await;
	let mut body = created.segment.machine.unverified_body().clone();
	body.created_by = mallory_id;
	let forged = Unsigned {
		id: machine_id,
		version: 1,
		body,
	}
	.sign(&mallory_signer)
	.unwrap();
	alice.registry().rewrite_machines(move |mut segment| {
		segment.machine = forged.clone();
		segment
	});
	let rogue = rogue_encryption_key(machine_id, &mallory_signer);
	alice.registry().rewrite_keys(move |mut keys| {
		keys.push(rogue.clone());
		keys
	});

	let err = alice.add_member(&scope, machine_id).await.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::Integrity);

	// nothing was written: the honest registry still accepts the machine as new
	alice.registry().honest();
	let summary = alice.add_member(&scope, machine_id).await.unwrap();
	assert!(summary.members.contains(&machine_id));
}

#[tokio::test]
async fn machine_record_with_a_rederived_id_is_rejected() {
	let registry = MemoryRegistry::new();
	let alice = user(&registry, "alice@example.com").await;
	let mallory = user(&registry, "mallory@example.com").await;
	let scope = pathexp("/acme/web/*/*/*/*");
	alice.set_credential(&scope, &name("API_KEY"), &secret("v1")).await.unwrap();
	let created = alice.create_machine("acme", "ci", &[]).await.unwrap();

	let mallory_id = identity_of(&mallory).await;
	let mallory_signer = signer_of(&mallory).await;
	let mut body = created.segment.machine.unverified_body().clone();
	body.created_by = mallory_id;
	let forged = Unsigned::new(body).unwrap().sign(&mallory_signer).unwrap();
	assert_ne!(forged.id(), created.machine_id);
	alice.registry().rewrite_machines(move |mut segment| {
		segment.machine = forged.clone();
		segment
	});

	let err = alice.add_member(&scope, created.machine_id).await.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::Integrity);
}

#[tokio::test]
async fn another_machines_record_is_rejected() {
	let registry = MemoryRegistry::new();
	let alice = user(&registry, "alice@example.com").await;
	let scope = pathexp("/acme/web/*/*/*/*");
	alice.set_credential(&scope, &name("API_KEY"), &secret("v1")).await.unwrap();
	let wanted = alice.create_machine("acme", "ci", &[]).await.unwrap();
	let other = alice.create_machine("acme", "deploy", &[]).await.unwrap();

	// both records are honestly signed by alice; only the ID differs
	let swapped = other.segment.clone();
	alice.registry().rewrite_machines(move |_| swapped.clone());

	let err = alice.add_member(&scope, wanted.machine_id).await.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::Integrity);
}

#[tokio::test]
async fn machine_record_signed_by_someone_else_is_rejected() {
	let registry = MemoryRegistry::new();
	let alice = user(&registry, "alice@example.com").await;
	let mallory = user(&registry, "mallory@example.com").await;
	let scope = pathexp("/acme/web/*/*/*/*");
	alice.set_credential(&scope, &name("API_KEY"), &secret("v1")).await.unwrap();
	let created = alice.create_machine("acme", "ci", &[]).await.unwrap();

	// the body still names alice, but mallory signed it
	let mallory_signer = signer_of(&mallory).await;
	let resigned = Unsigned {
		id: created.machine_id,
		version: 1,
		body: created.segment.machine.unverified_body().clone(),
	}
	.sign(&mallory_signer)
	.unwrap();
	alice.registry().rewrite_machines(move |mut segment| {
		segment.machine = resigned.clone();
		segment
	});
	let rogue = rogue_encryption_key(created.machine_id, &mallory_signer);
	alice.registry().rewrite_keys(move |mut keys| {
		keys.push(rogue.clone());
		keys
	});

	let err = alice.add_member(&scope, created.machine_id).await.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::Authorization);
}

#[tokio::test]
async fn machine_login_rejects_a_forged_creator() {
	let registry = MemoryRegistry::new();
	let alice = user(&registry, "alice@example.com").await;
	let mallory = user(&registry, "mallory@example.com").await;
	let created = alice.create_machine("acme", "ci", &[]).await.unwrap();

	let mallory_signer = signer_of(&mallory).await;
	let resigned = Unsigned {
		id: created.machine_id,
		version: 1,
		body: created.segment.machine.unverified_body().clone(),
	}
	.sign(&mallory_signer)
	.unwrap();

	let machine = engine(&registry);
	machine.registry().rewrite_machines(move |mut segment| {
		segment.machine = resigned.clone();
		segment
	});
	let err = machine
		.login(&LoginCredential::Machine {
			token_id: created.token_id,
			secret: created.secret.clone(),
		})
		.await
		.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::Authorization);
	assert_eq!(machine.who().await.kind, WhoKind::NoSession);
}

#[tokio::test]
async fn competing_root_key_untrusts_the_signer() {
	let registry = MemoryRegistry::new();
	let alice = user(&registry, "alice@example.com").await;
	let at = path("/acme/web/prod/api/user1/1");
	alice.set_credential(&pathexp("/acme/web/*/*/*/*"), &name("API_KEY"), &secret("v1")).await.unwrap();

	// a second self-signed signing key for alice, with an encryption key under it
	let alice_id = identity_of(&alice).await;
	let (mut root, root_signer) = ClaimedKeyPair::generate_signing(alice_id, &generate_key()).unwrap();
	root.claim_with(&root_signer).unwrap();
	let injected = [root.public(), rogue_encryption_key(alice_id, &root_signer)];
	alice.registry().rewrite_keys(move |mut keys| {
		keys.extend(injected.iter().cloned());
		keys
	});

	let err = alice.get_credential(&at, &name("API_KEY")).await.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::Authorization);

	alice.registry().honest();
	assert_eq!(alice.get_credential(&at, &name("API_KEY")).await.unwrap().expose(), "v1");
}

#[tokio::test]
async fn member_record_rewritten_to_another_owner_is_rejected() {
	let registry = MemoryRegistry::new();
	let alice = user(&registry, "alice@example.com").await;
	let mallory = user(&registry, "mallory@example.com").await;
	alice.set_credential(&pathexp("/acme/web/*/*/*/*"), &name("API_KEY"), &secret("v1")).await.unwrap();

	let mallory_id = serde_json::to_value(identity_of(&mallory).await).unwrap();
	alice.registry().rewrite_trees(move |trees| {
		trees
			.iter()
			.map(|tree| tamper(tree, |json| json["members"][0]["body"]["owner_id"] = mallory_id.clone()))
			.collect()
	});

	let err = alice
		.get_credential(&path("/acme/web/prod/api/user1/1"), &name("API_KEY"))
		.await
		.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::Integrity);
}

#[tokio::test]
async fn member_record_moved_between_trees_is_rejected() {
	let registry = MemoryRegistry::new();
	let alice = user(&registry, "alice@example.com").await;
	alice.set_credential(&pathexp("/acme/*/*/*/*/*"), &name("REGION"), &secret("eu")).await.unwrap();
	alice.set_credential(&pathexp("/acme/web/*/*/*/*"), &name("API_KEY"), &secret("v1")).await.unwrap();

	// each member record is validly signed, just filed under the wrong keyring
	alice.registry().rewrite_trees(|mut trees| {
		if trees.len() == 2 {
			let moved = trees[1].members.clone();
			trees[0].members = moved;
		}
		trees
	});

	let err = alice.get_credentials(&path("/acme/web/prod/api/user1/1")).await.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::Integrity);
}

#[tokio::test]
async fn renumbered_generation_is_rejected() {
	let registry = MemoryRegistry::new();
	let alice = user(&registry, "alice@example.com").await;
	let bob = user(&registry, "bob@example.com").await;
	let scope = pathexp("/acme/web/*/*/*/*");
	let at = path("/acme/web/prod/api/user1/1");
	alice.set_credential(&scope, &name("API_KEY"), &secret("v1")).await.unwrap();
	alice.add_member(&scope, identity_of(&bob).await).await.unwrap();
	let rotated = alice.revoke_member(&scope, identity_of(&bob).await).await.unwrap();
	assert_eq!(rotated.generation, 2);

	// present the old generation as the newest one
	alice.registry().rewrite_trees(|trees| {
		trees
			.iter()
			.map(|tree| {
				if tree.keyring.unverified_body().generation == 1 {
					tamper(tree, |json| json["keyring"]["body"]["generation"] = serde_json::json!(3))
				} else {
					tree.clone()
				}
			})
			.collect()
	});

	let err = alice.get_credential(&at, &name("API_KEY")).await.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::Integrity);
}

#[tokio::test]
async fn cancelled_read_leaves_the_session_usable() {
	let registry = MemoryRegistry::new();
	let alice = user(&registry, "alice@example.com").await;
	let at = path("/acme/web/prod/api/user1/1");
	alice.set_credential(&pathexp("/acme/web/*/*/*/*"), &name("API_KEY"), &secret("v1")).await.unwrap();

	let gate = Arc::new(Notify::new());
	alice.registry().hold_calls(gate.clone());
	let read = tokio::time::timeout(Duration::from_millis(50), alice.get_credential(&at, &name("API_KEY"))).await;
	assert!(read.is_err());

	alice.registry().honest();
	assert!(alice.session().is_logged_in().await);
	assert_eq!(alice.get_credential(&at, &name("API_KEY")).await.unwrap().expose(), "v1");

	// and logout does not wait on the abandoned read
	tokio::time::timeout(Duration::from_secs(1), alice.logout()).await.unwrap();
	assert_eq!(alice.who().await.kind, WhoKind::NoSession);
}

#[tokio::test]
async fn logout_waits_for_an_in_flight_verification() {
	let registry = MemoryRegistry::new();
	let carol = Arc::new(enrolled(&registry, "carol@example.com").await);
	let code = registry.verification_code("carol@example.com").await.unwrap();

	let gate = Arc::new(Notify::new());
	carol.registry().hold_calls(gate.clone());
	let verifying = tokio::spawn({
		let carol = Arc::clone(&carol);
		async move { carol.verify_email(&code).await }
	});
	tokio::time::sleep(Duration::from_millis(20)).await;

	let logout = tokio::spawn({
		let carol = Arc::clone(&carol);
		async move { carol.logout().await }
	});
	tokio::time::sleep(Duration::from_millis(20)).await;
	assert!(!logout.is_finished());

	gate.notify_one();
	let info = verifying.await.unwrap().unwrap();
	assert_eq!(info.state, IdentityState::Active);
	logout.await.unwrap();
	assert_eq!(carol.who().await.kind, WhoKind::NoSession);
}
