// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Request and response types exchanged with the registry.

use keyweave_common_secret::SecretString;
use keyweave_core::{
	AuthInfo, ClaimedKeyPair, ClaimedPublicKey, CredentialName, Id, IdentityInfo, KdfParams, PathExp,
	ResourcePath,
};
use serde::{Deserialize, Serialize};

use crate::error::{RegistryError, RegistryResult};

/// Filter for `GET /credentialtree`. `path` and `pathexp` are mutually
/// exclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeQuery {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub path: Option<ResourcePath>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub pathexp: Option<PathExp>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub name: Option<CredentialName>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub owner_id: Option<Id>,
}

impl TreeQuery {
	/// Trees whose path expression matches `path`.
	pub fn at_path(path: ResourcePath) -> Self {
		Self {
			path: Some(path),
			..Self::default()
		}
	}

	/// Trees for exactly `pathexp`.
	pub fn for_pathexp(pathexp: PathExp) -> Self {
		Self {
			pathexp: Some(pathexp),
			..Self::default()
		}
	}

	pub fn with_name(mut self, name: CredentialName) -> Self {
		self.name = Some(name);
		self
	}

	pub fn validate(&self) -> RegistryResult<()> {
		if self.path.is_some() && self.pathexp.is_some() {
			return Err(RegistryError::BadRequest(
				"path and pathexp are mutually exclusive".to_string(),
			));
		}
		Ok(())
	}

	/// Query string pairs, in a stable order.
	pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
		let mut pairs = Vec::new();
		if let Some(path) = &self.path {
			pairs.push(("path", path.to_string()));
		}
		if let Some(pathexp) = &self.pathexp {
			pairs.push(("pathexp", pathexp.to_string()));
		}
		if let Some(name) = &self.name {
			pairs.push(("name", name.to_string()));
		}
		if let Some(owner) = &self.owner_id {
			pairs.push(("owner_id", owner.to_string()));
		}
		pairs
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeginLoginRequest {
	pub identifier: String,
}

/// First step of the login handshake. `kdf` is what the identity enrolled
/// with, stored beside the salt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginChallenge {
	#[serde(with = "keyweave_core::base64_bytes")]
	pub salt: Vec<u8>,
	pub kdf: KdfParams,
	#[serde(with = "keyweave_core::base64_bytes")]
	pub login_token: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteLoginRequest {
	pub identifier: String,
	#[serde(with = "keyweave_core::base64_bytes")]
	pub proof: Vec<u8>,
}

/// Everything a successful login hands back. Keypairs still carry sealed
/// private keys; `public_keys` are the signer keys the claims refer to.
#[derive(Debug, Clone, Deserialize)]
pub struct LoginMaterial {
	pub auth_token: SecretString,
	pub identity: IdentityInfo,
	pub auth: AuthInfo,
	pub keypairs: Vec<ClaimedKeyPair>,
	#[serde(default)]
	pub public_keys: Vec<ClaimedPublicKey>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyEmailRequest {
	pub code: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileUpdate {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub email: Option<String>,
}

impl ProfileUpdate {
	pub fn is_empty(&self) -> bool {
		self.name.is_none() && self.email.is_none()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn path_and_pathexp_are_exclusive() {
		let mut query = TreeQuery::at_path(ResourcePath::parse("/acme/web/prod/api/u1/1").unwrap());
		assert!(query.validate().is_ok());
		query.pathexp = Some(PathExp::parse("/acme/*/*/*/*/*").unwrap());
		assert!(matches!(query.validate(), Err(RegistryError::BadRequest(_))));
	}

	#[test]
	fn login_challenge_carries_enrolled_kdf_params() {
		let json = r#"{
			"salt": "AAECAwQFBgcICQoLDA0ODw==",
			"kdf": {"memory_kib": 65536, "iterations": 3, "parallelism": 4},
			"login_token": "dG9rZW4="
		}"#;
		let challenge: LoginChallenge = serde_json::from_str(json).unwrap();
		assert_eq!(challenge.salt.len(), 16);
		assert_eq!(
			challenge.kdf,
			KdfParams {
				memory_kib: 65536,
				iterations: 3,
				parallelism: 4,
			}
		);

		let missing = r#"{"salt": "AAECAwQFBgcICQoLDA0ODw==", "login_token": "dG9rZW4="}"#;
		assert!(serde_json::from_str::<LoginChallenge>(missing).is_err());
	}

	#[test]
	fn query_pairs_skip_unset_filters() {
		let query = TreeQuery::for_pathexp(PathExp::parse("/acme/web/*/*/*/*").unwrap())
			.with_name(CredentialName::parse("API_KEY").unwrap());
		assert_eq!(
			query.to_pairs(),
			vec![
				("pathexp", "/acme/web/*/*/*/*".to_string()),
				("name", "api_key".to_string()),
			]
		);
	}
}
