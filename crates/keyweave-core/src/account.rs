// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Identities: users, machines and machine tokens.
//!
//! Signup and machine creation are built here as pure functions; the daemon
//! submits the result to the registry. Both derive key material with Argon2id
//! and so belong on a blocking thread.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use keyweave_common_secret::SecretString;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::envelope::{Body, Signed, Unsigned};
use crate::error::{Error, Result};
use crate::id::{Id, IdType};
use crate::kdf::{derive_keys, generate_salt, KdfParams};
use crate::keypair::{ClaimedKeyPair, SigningKeyPair};

const TOKEN_SECRET_SIZE: usize = 32;
const DEFAULT_MACHINE_TEAM: &str = "machine";

// =============================================================================
// Bodies
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserBody {
	pub name: String,
	pub email: String,
	#[serde(with = "crate::base64_bytes")]
	pub salt: Vec<u8>,
	/// Parameters the passphrase was stretched with.
	pub kdf: KdfParams,
	pub created_at: DateTime<Utc>,
}

impl Body for UserBody {
	const KIND: IdType = IdType::User;

	fn identity(&self) -> serde_json::Value {
		json!({ "salt": URL_SAFE_NO_PAD.encode(&self.salt) })
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineBody {
	pub org: String,
	pub name: String,
	pub created_by: Id,
	pub created_at: DateTime<Utc>,
}

impl Body for MachineBody {
	const KIND: IdType = IdType::Machine;

	fn identity(&self) -> serde_json::Value {
		json!({
			"org": self.org,
			"name": self.name,
			"created_by": self.created_by,
			"created_at": self.created_at,
		})
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineTokenBody {
	pub machine_id: Id,
	#[serde(with = "crate::base64_bytes")]
	pub salt: Vec<u8>,
	pub kdf: KdfParams,
	pub created_by: Id,
	pub created_at: DateTime<Utc>,
}

impl Body for MachineTokenBody {
	const KIND: IdType = IdType::MachineToken;

	fn identity(&self) -> serde_json::Value {
		json!({
			"machine_id": self.machine_id,
			"salt": URL_SAFE_NO_PAD.encode(&self.salt),
		})
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipBody {
	pub owner_id: Id,
	pub org: String,
	pub team: String,
}

impl Body for MembershipBody {
	const KIND: IdType = IdType::Membership;

	fn identity(&self) -> serde_json::Value {
		json!({
			"owner_id": self.owner_id,
			"org": self.org,
			"team": self.team,
		})
	}
}

// =============================================================================
// Identity descriptions
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityKind {
	User,
	Machine,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityState {
	Active,
	Unverified,
}

/// An identity as described by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityInfo {
	pub id: Id,
	pub kind: IdentityKind,
	pub name: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub email: Option<String>,
	pub state: IdentityState,
	/// For machines: the user who created it.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub created_by: Option<Id>,
}

/// What a session authenticated with: the user itself, or a machine token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthInfo {
	pub kind: IdentityKind,
	pub id: Id,
	/// Email address or token ID used to log in.
	pub identifier: String,
}

// =============================================================================
// Registry payloads
// =============================================================================

/// Everything the registry needs to create a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Enrollment {
	pub user: Unsigned<UserBody>,
	pub keypairs: Vec<ClaimedKeyPair>,
	/// Lets the registry check login proofs. Not the master key.
	#[serde(with = "crate::base64_bytes")]
	pub auth_key: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenSegment {
	pub token: Signed<MachineTokenBody>,
	pub keypairs: Vec<ClaimedKeyPair>,
}

/// A machine with its memberships and tokens, as `GET /machines/{id}` returns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineSegment {
	pub machine: Signed<MachineBody>,
	pub memberships: Vec<Signed<MembershipBody>>,
	pub tokens: Vec<TokenSegment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenCreation {
	pub token: Signed<MachineTokenBody>,
	pub keypairs: Vec<ClaimedKeyPair>,
	#[serde(with = "crate::base64_bytes")]
	pub auth_key: Vec<u8>,
}

/// The body of `POST /machines`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineCreation {
	pub machine: Signed<MachineBody>,
	pub memberships: Vec<Signed<MembershipBody>>,
	pub tokens: Vec<TokenCreation>,
}

// =============================================================================
// Builders
// =============================================================================

fn require_slug(what: &str, value: &str) -> Result<String> {
	let lowered = value.trim().to_ascii_lowercase();
	let mut chars = lowered.chars();
	let ok = matches!(chars.next(), Some(c) if c.is_ascii_alphanumeric())
		&& lowered.len() <= 64
		&& chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
	if !ok {
		return Err(Error::Validation(format!("invalid {what} {value:?}")));
	}
	Ok(lowered)
}

fn require_email(email: &str) -> Result<String> {
	let email = email.trim().to_ascii_lowercase();
	match email.split_once('@') {
		Some((local, domain)) if !local.is_empty() && domain.contains('.') && !domain.contains('@') => Ok(email),
		_ => Err(Error::Validation(format!("invalid email address {email:?}"))),
	}
}

/// Build signup material for a new user: identity, self-signed signing key,
/// claimed encryption key, and the auth key for login proofs.
pub fn enroll(name: &str, email: &str, passphrase: &SecretString, params: &KdfParams) -> Result<Enrollment> {
	let name = name.trim();
	if name.is_empty() {
		return Err(Error::Validation("name must not be empty".to_string()));
	}
	let email = require_email(email)?;
	if passphrase.expose().len() < 8 {
		return Err(Error::Validation("passphrase must be at least 8 characters".to_string()));
	}

	let salt = generate_salt();
	let keys = derive_keys(passphrase.expose().as_bytes(), &salt, params)?;

	let user = Unsigned::new(UserBody {
		name: name.to_string(),
		email,
		salt: salt.to_vec(),
		kdf: *params,
		created_at: Utc::now(),
	})?;

	let (mut signing, signer) = ClaimedKeyPair::generate_signing(user.id, &keys.master)?;
	signing.claim_with(&signer)?;
	let (mut encryption, _) = ClaimedKeyPair::generate_encryption(user.id, &keys.master)?;
	encryption.claim_with(&signer)?;

	info!(user_id = %user.id, "built enrollment");
	Ok(Enrollment {
		user,
		keypairs: vec![signing, encryption],
		auth_key: keys.auth.to_vec(),
	})
}

/// A freshly built machine. `secret` is shown to the user once and never
/// stored.
#[derive(Debug)]
pub struct NewMachine {
	pub machine_id: Id,
	pub token_id: Id,
	pub secret: SecretString,
	pub creation: MachineCreation,
}

/// Build a machine owned by `creator`'s identity, with one token.
///
/// The machine's signing key is claimed by `creator`, so it is trusted
/// through the creator's chain; its encryption key is claimed by its own
/// signing key.
pub fn new_machine(
	org: &str,
	name: &str,
	teams: &[String],
	creator: &SigningKeyPair,
	params: &KdfParams,
) -> Result<NewMachine> {
	let org = require_slug("org", org)?;
	let name = require_slug("machine name", name)?;
	let mut teams = teams
		.iter()
		.map(|t| require_slug("team", t))
		.collect::<Result<Vec<_>>>()?;
	if teams.is_empty() {
		teams.push(DEFAULT_MACHINE_TEAM.to_string());
	}
	teams.sort();
	teams.dedup();

	let machine = Unsigned::new(MachineBody {
		org: org.clone(),
		name,
		created_by: creator.owner_id(),
		created_at: Utc::now(),
	})?;
	let machine_id = machine.id;

	let mut raw = [0u8; TOKEN_SECRET_SIZE];
	OsRng.fill_bytes(&mut raw);
	let secret = SecretString::new(URL_SAFE_NO_PAD.encode(raw));
	zeroize::Zeroize::zeroize(&mut raw);

	let salt = generate_salt();
	let keys = derive_keys(secret.expose().as_bytes(), &salt, params)?;
	let token = Unsigned::new(MachineTokenBody {
		machine_id,
		salt: salt.to_vec(),
		kdf: *params,
		created_by: creator.owner_id(),
		created_at: Utc::now(),
	})?;
	let token_id = token.id;

	let (mut signing, machine_signer) = ClaimedKeyPair::generate_signing(machine_id, &keys.master)?;
	signing.claim_with(creator)?;
	let (mut encryption, _) = ClaimedKeyPair::generate_encryption(machine_id, &keys.master)?;
	encryption.claim_with(&machine_signer)?;

	let memberships = teams
		.into_iter()
		.map(|team| {
			Unsigned::new(MembershipBody {
				owner_id: machine_id,
				org: org.clone(),
				team,
			})?
			.sign(creator)
		})
		.collect::<Result<Vec<_>>>()?;

	info!(%machine_id, %token_id, org = %org, "built machine");
	Ok(NewMachine {
		machine_id,
		token_id,
		secret,
		creation: MachineCreation {
			machine: machine.sign(creator)?,
			memberships,
			tokens: vec![TokenCreation {
				token: token.sign(creator)?,
				keypairs: vec![signing, encryption],
				auth_key: keys.auth.to_vec(),
			}],
		},
	})
}
