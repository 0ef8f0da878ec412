// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Registry access for the keyweave daemon.
//!
//! The registry stores signed, encrypted envelopes and never sees plaintext.
//! Nothing it returns is trusted until `keyweave-core` has verified it.
//!
//! Two implementations share the [`Registry`] trait:
//! - [`HttpRegistry`] talks to a remote registry over HTTPS.
//! - [`MemoryRegistry`] keeps everything in process, for tests and local
//!   development.
//!
//! Neither retries. A resubmitted envelope could create a duplicate
//! version, so failures surface to the caller.

mod error;
mod http;
mod memory;
mod types;

use async_trait::async_trait;
use keyweave_common_secret::SecretString;
use keyweave_core::{
	ClaimedPublicKey, CredentialTree, Enrollment, Id, IdentityInfo, MachineCreation, MachineSegment,
};

pub use error::{ErrorBody, RegistryError, RegistryResult, UNVERIFIED_MARKER};
pub use http::{HttpRegistry, RegistryConfig, DEFAULT_REGISTRY_URL};
pub use memory::MemoryRegistry;
pub use types::{LoginChallenge, LoginMaterial, ProfileUpdate, TreeQuery};

/// The endpoints the daemon consumes.
#[async_trait]
pub trait Registry: Send + Sync {
	/// Start a login for an email address or machine token ID.
	async fn begin_login(&self, identifier: &str) -> RegistryResult<LoginChallenge>;

	/// Finish a login with `HMAC-SHA256(auth_key, login_token)`.
	async fn complete_login(&self, identifier: &str, proof: &[u8]) -> RegistryResult<LoginMaterial>;

	/// Invalidate the current auth token on the registry side.
	async fn logout(&self) -> RegistryResult<()>;

	/// Install or clear the bearer token used for subsequent calls.
	async fn set_auth_token(&self, token: Option<SecretString>);

	async fn has_auth_token(&self) -> bool;

	async fn register_user(&self, enrollment: &Enrollment) -> RegistryResult<IdentityInfo>;

	async fn verify_email(&self, code: &str) -> RegistryResult<IdentityInfo>;

	async fn update_profile(&self, update: &ProfileUpdate) -> RegistryResult<IdentityInfo>;

	/// Claimed public keys belonging to any of `owners`.
	async fn list_public_keys(&self, owners: &[Id]) -> RegistryResult<Vec<ClaimedPublicKey>>;

	/// `POST /credentialtree`.
	async fn post_credential_tree(&self, tree: &CredentialTree) -> RegistryResult<CredentialTree>;

	/// `GET /credentialtree`.
	async fn list_credential_trees(&self, query: &TreeQuery) -> RegistryResult<Vec<CredentialTree>>;

	/// `POST /machines`.
	async fn create_machine(&self, creation: &MachineCreation) -> RegistryResult<MachineSegment>;

	/// `GET /machines/{id}`.
	async fn get_machine(&self, id: &Id) -> RegistryResult<MachineSegment>;
}
