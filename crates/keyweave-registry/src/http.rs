// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! HTTP registry client.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keyweave_common_secret::SecretString;
use keyweave_core::{
	ClaimedPublicKey, CredentialTree, Enrollment, Id, IdentityInfo, MachineCreation, MachineSegment,
};
use reqwest::header::AUTHORIZATION;
use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};

use crate::error::{ErrorBody, RegistryError, RegistryResult};
use crate::types::{
	BeginLoginRequest, CompleteLoginRequest, LoginChallenge, LoginMaterial, ProfileUpdate, TreeQuery,
	VerifyEmailRequest,
};
use crate::Registry;

pub const DEFAULT_REGISTRY_URL: &str = "https://registry.keyweave.dev";

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Configuration for the registry client.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
	pub url: String,
	pub timeout: Duration,
	/// Whether to allow plain HTTP. Default: false (require HTTPS).
	pub allow_insecure: bool,
}

impl Default for RegistryConfig {
	fn default() -> Self {
		Self {
			url: DEFAULT_REGISTRY_URL.to_string(),
			timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
			allow_insecure: false,
		}
	}
}

/// Registry reached over HTTPS, authenticated with a bearer token.
pub struct HttpRegistry {
	http_client: reqwest::Client,
	base_url: String,
	auth_token: Arc<RwLock<Option<SecretString>>>,
}

impl HttpRegistry {
	pub fn new(config: RegistryConfig) -> RegistryResult<Self> {
		if !config.allow_insecure && !config.url.starts_with("https://") {
			return Err(RegistryError::Configuration(
				"registry URL must use HTTPS (set allow_insecure for local development)".into(),
			));
		}

		let http_client = reqwest::Client::builder()
			.timeout(config.timeout)
			.redirect(reqwest::redirect::Policy::none())
			.build()
			.map_err(|e| RegistryError::Configuration(format!("failed to create HTTP client: {e}")))?;

		Ok(Self {
			http_client,
			base_url: config.url.trim_end_matches('/').to_string(),
			auth_token: Arc::new(RwLock::new(None)),
		})
	}

	fn url(&self, path: &str) -> String {
		format!("{}{}", self.base_url, path)
	}

	async fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
		match self.auth_token.read().await.as_ref() {
			Some(token) => request.header(AUTHORIZATION, format!("Bearer {}", token.expose())),
			None => request,
		}
	}

	async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> RegistryResult<T> {
		let response = self.authorize(request).await.send().await?;
		let response = check_status(response).await?;
		response
			.json()
			.await
			.map_err(|e| RegistryError::InvalidResponse(e.to_string()))
	}

	async fn send_empty(&self, request: RequestBuilder) -> RegistryResult<()> {
		let response = self.authorize(request).await.send().await?;
		check_status(response).await?;
		Ok(())
	}
}

async fn check_status(response: Response) -> RegistryResult<Response> {
	let status = response.status();
	if status.is_success() {
		return Ok(response);
	}

	let text = response.text().await.unwrap_or_default();
	match serde_json::from_str::<ErrorBody>(&text) {
		Ok(body) => {
			debug!(status = %status, kind = %body.kind, "registry returned error");
			Err(RegistryError::from_body(body))
		}
		Err(_) => {
			warn!(status = %status, "registry returned unparseable error body");
			Err(RegistryError::InvalidResponse(format!(
				"HTTP {}: {}",
				status,
				sanitize_body_for_error(&text, 200)
			)))
		}
	}
}

#[async_trait]
impl Registry for HttpRegistry {
	#[instrument(skip(self))]
	async fn begin_login(&self, identifier: &str) -> RegistryResult<LoginChallenge> {
		let request = BeginLoginRequest {
			identifier: identifier.to_string(),
		};
		self.send(self.http_client.post(self.url("/login/begin")).json(&request)).await
	}

	#[instrument(skip(self, proof))]
	async fn complete_login(&self, identifier: &str, proof: &[u8]) -> RegistryResult<LoginMaterial> {
		let request = CompleteLoginRequest {
			identifier: identifier.to_string(),
			proof: proof.to_vec(),
		};
		self.send(self.http_client.post(self.url("/login/complete")).json(&request)).await
	}

	#[instrument(skip(self))]
	async fn logout(&self) -> RegistryResult<()> {
		self.send_empty(self.http_client.post(self.url("/logout"))).await
	}

	async fn set_auth_token(&self, token: Option<SecretString>) {
		*self.auth_token.write().await = token;
	}

	async fn has_auth_token(&self) -> bool {
		self.auth_token.read().await.is_some()
	}

	#[instrument(skip(self, enrollment), fields(user_id = %enrollment.user.id))]
	async fn register_user(&self, enrollment: &Enrollment) -> RegistryResult<IdentityInfo> {
		self.send(self.http_client.post(self.url("/users")).json(enrollment)).await
	}

	#[instrument(skip(self, code))]
	async fn verify_email(&self, code: &str) -> RegistryResult<IdentityInfo> {
		let request = VerifyEmailRequest { code: code.to_string() };
		self.send(self.http_client.post(self.url("/users/verify")).json(&request)).await
	}

	#[instrument(skip(self))]
	async fn update_profile(&self, update: &ProfileUpdate) -> RegistryResult<IdentityInfo> {
		self.send(self.http_client.patch(self.url("/users/self")).json(update)).await
	}

	#[instrument(skip(self))]
	async fn list_public_keys(&self, owners: &[Id]) -> RegistryResult<Vec<ClaimedPublicKey>> {
		let query: Vec<(&str, String)> = owners.iter().map(|id| ("owner_id", id.to_string())).collect();
		self.send(self.http_client.get(self.url("/keypairs")).query(&query)).await
	}

	#[instrument(skip(self, tree), fields(keyring_id = %tree.keyring.id()))]
	async fn post_credential_tree(&self, tree: &CredentialTree) -> RegistryResult<CredentialTree> {
		self.send(self.http_client.post(self.url("/credentialtree")).json(tree)).await
	}

	#[instrument(skip(self))]
	async fn list_credential_trees(&self, query: &TreeQuery) -> RegistryResult<Vec<CredentialTree>> {
		query.validate()?;
		self.send(self.http_client.get(self.url("/credentialtree")).query(&query.to_pairs())).await
	}

	#[instrument(skip(self, creation), fields(machine_id = %creation.machine.id()))]
	async fn create_machine(&self, creation: &MachineCreation) -> RegistryResult<MachineSegment> {
		self.send(self.http_client.post(self.url("/machines")).json(creation)).await
	}

	#[instrument(skip(self))]
	async fn get_machine(&self, id: &Id) -> RegistryResult<MachineSegment> {
		self.send(self.http_client.get(self.url(&format!("/machines/{id}")))).await
	}
}

impl std::fmt::Debug for HttpRegistry {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("HttpRegistry")
			.field("base_url", &self.base_url)
			.field(
				"has_auth_token",
				&self.auth_token.try_read().map(|t| t.is_some()).unwrap_or(false),
			)
			.finish()
	}
}

fn sanitize_body_for_error(body: &str, max_len: usize) -> String {
	let sanitized: String = body
		.chars()
		.filter(|c| !c.is_control() || *c == ' ')
		.take(max_len)
		.collect();
	if body.chars().count() > max_len {
		format!("{sanitized}...")
	} else {
		sanitized
	}
}
