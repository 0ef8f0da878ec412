// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The session: one logged-in identity and its unlocked keys.
//!
//! ```text
//! LoggedOut ──login──▶ LoggingIn ──ok──▶ LoggedIn ──logout──▶ LoggedOut
//!                          │
//!                          └──error / cancelled──▶ LoggedOut
//! ```
//!
//! Operations hold the read lock for their whole duration. Login and logout
//! take the write lock, so they wait for in-flight operations and block new
//! ones until they finish. Key material lives only inside
//! [`ActiveSession`] and is zeroized when it is dropped.
//!
//! An operation that panics while holding the session marks it for wiping
//! as its [`SessionGuard`] unwinds; the next caller finds it logged out. A
//! cancelled operation just releases the lock.

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use keyweave_common_secret::SecretString;
use keyweave_core::{
	derive_keys, login_proof, AuthInfo, ClaimedKeyPair, EncryptionKeyPair, Error, Id, IdType,
	IdentityInfo, IdentityKind, IdentityState, KeyPurpose, Result, SigningKeyPair, TrustGraph, KEY_SIZE,
};
use keyweave_registry::Registry;
use serde::Serialize;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, instrument, warn};
use zeroize::{Zeroize, Zeroizing};

use crate::engine::{complete_trust, registry_call, EngineOptions};

/// What a caller logs in with.
#[derive(Debug, Clone)]
pub enum LoginCredential {
	User { email: String, passphrase: SecretString },
	Machine { token_id: Id, secret: SecretString },
}

impl LoginCredential {
	pub fn kind(&self) -> IdentityKind {
		match self {
			Self::User { .. } => IdentityKind::User,
			Self::Machine { .. } => IdentityKind::Machine,
		}
	}

	/// Local checks, done before any registry round trip.
	pub fn valid(&self) -> Result<()> {
		match self {
			Self::User { email, passphrase } => {
				if !email.contains('@') {
					return Err(Error::Validation(format!("invalid email address {email:?}")));
				}
				if passphrase.is_empty() {
					return Err(Error::Validation("passphrase must not be empty".to_string()));
				}
			}
			Self::Machine { token_id, secret } => {
				if token_id.kind() != IdType::MachineToken {
					return Err(Error::Validation(format!("{token_id} is not a machine token id")));
				}
				if secret.is_empty() {
					return Err(Error::Validation("token secret must not be empty".to_string()));
				}
			}
		}
		Ok(())
	}

	/// The secret fed to the key derivation: passphrase or token secret.
	pub fn passphrase(&self) -> &SecretString {
		match self {
			Self::User { passphrase, .. } => passphrase,
			Self::Machine { secret, .. } => secret,
		}
	}

	pub fn identifier(&self) -> String {
		match self {
			Self::User { email, .. } => email.trim().to_ascii_lowercase(),
			Self::Machine { token_id, .. } => token_id.to_string(),
		}
	}
}

/// A logged-in identity's working key material.
pub struct ActiveSession {
	identity: IdentityInfo,
	auth: AuthInfo,
	master_key: Zeroizing<[u8; KEY_SIZE]>,
	signing: SigningKeyPair,
	encryption: EncryptionKeyPair,
}

impl ActiveSession {
	pub fn identity(&self) -> &IdentityInfo {
		&self.identity
	}

	pub fn identity_id(&self) -> Id {
		self.identity.id
	}

	pub fn auth(&self) -> &AuthInfo {
		&self.auth
	}

	/// Seals keypairs generated for this identity.
	pub fn master_key(&self) -> &[u8; KEY_SIZE] {
		&self.master_key
	}

	pub fn signing(&self) -> &SigningKeyPair {
		&self.signing
	}

	pub fn encryption(&self) -> &EncryptionKeyPair {
		&self.encryption
	}

	pub fn is_unverified(&self) -> bool {
		self.identity.state == IdentityState::Unverified
	}

	/// Zero the master key in place. The unlocked signing and encryption
	/// keys zeroize themselves when dropped.
	fn wipe(&mut self) {
		self.master_key.zeroize();
	}
}

impl Drop for ActiveSession {
	fn drop(&mut self) {
		self.wipe();
	}
}

impl std::fmt::Debug for ActiveSession {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ActiveSession")
			.field("identity", &self.identity.id)
			.field("kind", &self.identity.kind)
			.field("master_key", &"[REDACTED]")
			.finish()
	}
}

#[derive(Debug, Default)]
pub enum SessionState {
	#[default]
	LoggedOut,
	LoggingIn,
	LoggedIn(Box<ActiveSession>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WhoKind {
	User,
	Machine,
	NoSession,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Who {
	#[serde(rename = "type")]
	pub kind: WhoKind,
	pub identity: Option<IdentityInfo>,
	pub auth: Option<AuthInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Status {
	/// A registry auth token is held.
	pub token: bool,
	/// A master key is held.
	pub passphrase: bool,
}

/// Resets an interrupted login. If the login future is dropped while the
/// state is still `LoggingIn`, the state falls back to `LoggedOut`.
struct LoginGuard<'a> {
	state: RwLockWriteGuard<'a, SessionState>,
}

impl Drop for LoginGuard<'_> {
	fn drop(&mut self) {
		if matches!(*self.state, SessionState::LoggingIn) {
			*self.state = SessionState::LoggedOut;
		}
	}
}

/// Read access to the active session for the length of one operation.
pub struct SessionGuard<'a> {
	active: RwLockReadGuard<'a, ActiveSession>,
	wipe_pending: &'a AtomicBool,
}

impl Deref for SessionGuard<'_> {
	type Target = ActiveSession;

	fn deref(&self) -> &ActiveSession {
		&self.active
	}
}

impl Drop for SessionGuard<'_> {
	fn drop(&mut self) {
		if std::thread::panicking() {
			self.wipe_pending.store(true, Ordering::SeqCst);
		}
	}
}

/// Shared handle to the daemon's session. Clones refer to the same session.
#[derive(Debug, Clone, Default)]
pub struct SessionHandle {
	state: Arc<RwLock<SessionState>>,
	/// Set when a wipe could not take the lock; the next caller performs it.
	wipe_pending: Arc<AtomicBool>,
}

impl SessionHandle {
	pub fn new() -> Self {
		Self::default()
	}

	/// Log in, replacing any current session.
	///
	/// On failure the session is left `LoggedOut`, whatever it was before.
	#[instrument(skip(self, registry, credential, options), fields(kind = ?credential.kind()))]
	pub async fn login<R: Registry + ?Sized>(
		&self,
		registry: &R,
		credential: &LoginCredential,
		options: &EngineOptions,
	) -> Result<IdentityInfo> {
		credential.valid()?;

		let mut guard = LoginGuard {
			state: self.state.write().await,
		};
		self.wipe_pending.store(false, Ordering::SeqCst);
		// the previous session's keys are dropped (and zeroized) here
		*guard.state = SessionState::LoggingIn;

		match establish(registry, credential, options).await {
			Ok(active) => {
				let identity = active.identity.clone();
				info!(identity_id = %identity.id, kind = ?identity.kind, "logged in");
				*guard.state = SessionState::LoggedIn(Box::new(active));
				Ok(identity)
			}
			Err(err) => {
				warn!(error = %err, "login failed");
				registry.set_auth_token(None).await;
				Err(err)
			}
		}
	}

	/// Wipe the session, then tell the registry. Key material is gone before
	/// the registry call starts, and a failed registry call is only logged.
	#[instrument(skip(self, registry, options))]
	pub async fn logout<R: Registry + ?Sized>(&self, registry: &R, options: &EngineOptions) {
		let previous = {
			let mut state = self.state.write().await;
			self.wipe_pending.store(false, Ordering::SeqCst);
			std::mem::take(&mut *state)
		};
		let was_logged_in = matches!(previous, SessionState::LoggedIn(_));
		drop(previous);

		if was_logged_in {
			if let Err(err) = registry_call(options.timeout, registry.logout()).await {
				warn!(error = %err, "registry logout failed");
			}
			info!("logged out");
		}
		registry.set_auth_token(None).await;
	}

	/// Wipe without waiting on the lock. For panic and shutdown paths that
	/// cannot await. Returns false if an operation holds the session; the
	/// wipe is then left to whoever next touches it.
	pub fn try_wipe(&self) -> bool {
		match self.state.try_write() {
			Ok(mut state) => {
				*state = SessionState::LoggedOut;
				self.wipe_pending.store(false, Ordering::SeqCst);
				true
			}
			Err(_) => {
				self.wipe_pending.store(true, Ordering::SeqCst);
				false
			}
		}
	}

	/// Carry out a wipe deferred by [`try_wipe`](Self::try_wipe) or by a
	/// panicking operation.
	async fn settle(&self) {
		if !self.wipe_pending.load(Ordering::SeqCst) {
			return;
		}
		let mut state = self.state.write().await;
		if self.wipe_pending.swap(false, Ordering::SeqCst) {
			*state = SessionState::LoggedOut;
			warn!("session wiped after an interrupted operation");
		}
	}

	pub async fn who(&self) -> Who {
		self.settle().await;
		match &*self.state.read().await {
			SessionState::LoggedIn(active) => Who {
				kind: match active.identity.kind {
					IdentityKind::User => WhoKind::User,
					IdentityKind::Machine => WhoKind::Machine,
				},
				identity: Some(active.identity.clone()),
				auth: Some(active.auth.clone()),
			},
			_ => Who {
				kind: WhoKind::NoSession,
				identity: None,
				auth: None,
			},
		}
	}

	pub async fn status<R: Registry + ?Sized>(&self, registry: &R) -> Status {
		let passphrase = self.is_logged_in().await;
		Status {
			token: registry.has_auth_token().await,
			passphrase,
		}
	}

	pub async fn is_logged_in(&self) -> bool {
		self.settle().await;
		matches!(&*self.state.read().await, SessionState::LoggedIn(_))
	}

	/// The session, for operations allowed on unverified accounts.
	pub async fn require_logged_in(&self) -> Result<SessionGuard<'_>> {
		self.settle().await;
		let active = RwLockReadGuard::try_map(self.state.read().await, |state| match state {
			SessionState::LoggedIn(active) => Some(&**active),
			_ => None,
		})
		.map_err(|_| Error::NotAuthenticated)?;
		Ok(SessionGuard {
			active,
			wipe_pending: &self.wipe_pending,
		})
	}

	/// The session, for everything else.
	pub async fn require_active(&self) -> Result<SessionGuard<'_>> {
		let active = self.require_logged_in().await?;
		if active.is_unverified() {
			return Err(Error::Unverified);
		}
		Ok(active)
	}

	/// Replace the cached identity after a profile change.
	pub async fn update_identity(&self, identity: IdentityInfo) {
		if let SessionState::LoggedIn(active) = &mut *self.state.write().await {
			if active.identity.id == identity.id {
				active.identity = identity;
			}
		}
	}
}

fn login_failure(err: Error) -> Error {
	match err {
		Error::Unauthorized | Error::NotFound(_) => Error::Authentication("invalid credentials".to_string()),
		other => other,
	}
}

async fn establish<R: Registry + ?Sized>(
	registry: &R,
	credential: &LoginCredential,
	options: &EngineOptions,
) -> Result<ActiveSession> {
	let identifier = credential.identifier();
	let challenge = registry_call(options.timeout, registry.begin_login(&identifier))
		.await
		.map_err(login_failure)?;

	// stretch with what the identity enrolled with, never less than configured
	let params = challenge.kdf;
	if !params.at_least(&options.kdf) {
		return Err(Error::Authentication(format!(
			"registry offered weaker key derivation ({} KiB, {} iterations) than configured",
			params.memory_kib, params.iterations
		)));
	}
	params.validate()?;

	let secret = credential.passphrase().clone();
	let salt = challenge.salt.clone();
	let keys = tokio::task::spawn_blocking(move || derive_keys(secret.expose().as_bytes(), &salt, &params))
		.await
		.map_err(|e| Error::Internal(format!("key derivation task failed: {e}")))??;

	let proof = login_proof(&keys.auth, &challenge.login_token)?;
	let material = registry_call(options.timeout, registry.complete_login(&identifier, &proof))
		.await
		.map_err(login_failure)?;
	registry.set_auth_token(Some(material.auth_token.clone())).await;

	let identity = material.identity;
	if identity.kind != credential.kind() {
		return Err(Error::Authentication(format!(
			"registry returned a {:?} identity for a {:?} login",
			identity.kind,
			credential.kind()
		)));
	}

	let mut trust = TrustGraph::new(options.trust.clone());
	for key in material.keypairs.iter().map(ClaimedKeyPair::public).chain(material.public_keys) {
		trust.insert(key)?;
	}
	if identity.state == IdentityState::Active {
		complete_trust(registry, &mut trust, options.timeout).await?;
	}
	if identity.kind == IdentityKind::Machine && trust.creator_of(&identity.id) != identity.created_by {
		return Err(Error::Malformed(format!(
			"machine {} is not signed by the creator the registry reports",
			identity.id
		)));
	}

	let signing = unlock_newest(&material.keypairs, &identity, &trust, KeyPurpose::Signing, |kp| {
		kp.unlock_signing(&keys.master)
	})?;
	let encryption = unlock_newest(&material.keypairs, &identity, &trust, KeyPurpose::Encryption, |kp| {
		kp.unlock_encryption(&keys.master)
	})?;

	debug!(
		signing_key = %signing.public_key_id(),
		encryption_key = %encryption.public_key_id(),
		"unlocked session keys"
	);
	Ok(ActiveSession {
		identity,
		auth: material.auth,
		master_key: keys.master.clone(),
		signing,
		encryption,
	})
}

/// Unlock the newest trusted keypair of `purpose` owned by the identity.
fn unlock_newest<T>(
	keypairs: &[ClaimedKeyPair],
	identity: &IdentityInfo,
	trust: &TrustGraph,
	purpose: KeyPurpose,
	unlock: impl Fn(&ClaimedKeyPair) -> Result<T>,
) -> Result<T> {
	let now = Utc::now();
	let newest = keypairs
		.iter()
		.filter(|kp| kp.owner_id() == identity.id && kp.purpose() == purpose)
		.filter(|kp| trust.is_trusted(&kp.id(), purpose, now))
		.max_by_key(|kp| (kp.public_key.body.created_at, kp.id()));

	let Some(keypair) = newest else {
		return Err(Error::Authentication(format!("no trusted {purpose} keypair for {}", identity.id)));
	};
	unlock(keypair).map_err(|err| match err.kind() {
		keyweave_core::ErrorKind::Integrity => {
			Error::Authentication("wrong passphrase or token secret".to_string())
		}
		_ => err,
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn credential_identifiers() {
		let user = LoginCredential::User {
			email: " Alice@Example.com ".to_string(),
			passphrase: SecretString::from("pw"),
		};
		assert_eq!(user.identifier(), "alice@example.com");
		assert_eq!(user.kind(), IdentityKind::User);
		assert!(user.valid().is_ok());
		assert_eq!(user.passphrase().expose(), "pw");
	}

	#[test]
	fn credential_validation_is_local() {
		let no_at = LoginCredential::User {
			email: "alice".to_string(),
			passphrase: SecretString::from("pw"),
		};
		assert_eq!(no_at.valid().unwrap_err().kind(), keyweave_core::ErrorKind::Validation);

		let user_id = Id::derive(IdType::User, &serde_json::json!({"salt": "x"})).unwrap();
		let wrong_kind = LoginCredential::Machine {
			token_id: user_id,
			secret: SecretString::from("s"),
		};
		assert_eq!(wrong_kind.valid().unwrap_err().kind(), keyweave_core::ErrorKind::Validation);
	}

	#[tokio::test]
	async fn logged_out_session_rejects_use() {
		let session = SessionHandle::new();
		assert_eq!(session.who().await.kind, WhoKind::NoSession);
		assert!(matches!(session.require_active().await, Err(Error::NotAuthenticated)));
		assert!(matches!(session.require_logged_in().await, Err(Error::NotAuthenticated)));
		assert!(session.try_wipe());
	}

	fn active(state: IdentityState) -> ActiveSession {
		let id = Id::derive(IdType::User, &serde_json::json!({"salt": "session-tests"})).unwrap();
		let master = keyweave_core::encryption::generate_key();
		let (_, signing) = ClaimedKeyPair::generate_signing(id, &master).unwrap();
		let (_, encryption) = ClaimedKeyPair::generate_encryption(id, &master).unwrap();
		ActiveSession {
			identity: IdentityInfo {
				id,
				kind: IdentityKind::User,
				name: "Test".to_string(),
				email: Some("test@example.com".to_string()),
				state,
				created_by: None,
			},
			auth: AuthInfo {
				kind: IdentityKind::User,
				id,
				identifier: "test@example.com".to_string(),
			},
			master_key: master,
			signing,
			encryption,
		}
	}

	async fn logged_in(state: IdentityState) -> SessionHandle {
		let session = SessionHandle::new();
		*session.state.write().await = SessionState::LoggedIn(Box::new(active(state)));
		session
	}

	#[test]
	fn wipe_zeroes_the_master_key() {
		let mut active = active(IdentityState::Active);
		assert!(active.master_key().iter().any(|b| *b != 0));
		active.wipe();
		assert!(active.master_key().iter().all(|b| *b == 0));
	}

	#[tokio::test]
	async fn unverified_session_is_limited_to_logged_in_operations() {
		let session = logged_in(IdentityState::Unverified).await;
		assert!(session.require_logged_in().await.is_ok());
		assert!(matches!(session.require_active().await, Err(Error::Unverified)));
	}

	#[tokio::test]
	async fn panicking_operation_wipes_the_session() {
		let session = logged_in(IdentityState::Active).await;
		let held = session.clone();
		let task = tokio::spawn(async move {
			let active = held.require_active().await.unwrap();
			assert_eq!(active.identity().name, "Test");
			panic!("operation failed while holding the session");
		});
		assert!(task.await.unwrap_err().is_panic());

		assert!(!session.is_logged_in().await);
		assert!(matches!(session.require_active().await, Err(Error::NotAuthenticated)));
		assert_eq!(session.who().await.kind, WhoKind::NoSession);
	}

	#[tokio::test]
	async fn busy_wipe_is_finished_by_the_next_caller() {
		let session = logged_in(IdentityState::Active).await;
		let active = session.require_active().await.unwrap();
		assert!(!session.try_wipe());
		assert_eq!(active.identity().name, "Test");
		drop(active);

		assert!(!session.is_logged_in().await);
		assert!(session.try_wipe());
	}

	#[tokio::test]
	async fn cancelled_operation_releases_the_session() {
		let session = logged_in(IdentityState::Active).await;
		let held = session.clone();
		let operation = async move {
			let _active = held.require_active().await.unwrap();
			std::future::pending::<()>().await;
		};
		let result = tokio::time::timeout(std::time::Duration::from_millis(20), operation).await;
		assert!(result.is_err());

		// cancellation is not a failure: the session stays usable
		assert!(session.is_logged_in().await);
		assert!(session.try_wipe());
		assert!(!session.is_logged_in().await);
	}

	#[tokio::test]
	async fn dropped_login_guard_resets_to_logged_out() {
		let session = SessionHandle::new();
		{
			let mut guard = LoginGuard {
				state: session.state.write().await,
			};
			*guard.state = SessionState::LoggingIn;
		}
		assert!(matches!(*session.state.read().await, SessionState::LoggedOut));
	}
}
