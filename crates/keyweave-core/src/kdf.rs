// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Key derivation for login.
//!
//! A passphrase (users) or token secret (machines) is stretched with Argon2id
//! into 64 bytes:
//! - the first half is the **master key**, which seals the identity's private
//!   keys and never leaves the daemon
//! - the second half is the **auth key**, which proves knowledge of the
//!   secret to the registry by MACing a one-time login token
//!
//! # Security Note
//!
//! Default parameters match argon2's production defaults:
//! - Memory: 19456 KiB (~19 MiB)
//! - Iterations: 2
//! - Parallelism: 1
//!
//! [`KdfParams::insecure_for_tests`] exists for fast test runs and MUST NOT be
//! used in production.

use argon2::{Algorithm, Argon2, Params, Version};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::encryption::KEY_SIZE;
use crate::error::{Error, Result};

pub const SALT_SIZE: usize = 16;
const OUTPUT_SIZE: usize = KEY_SIZE * 2;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
	pub memory_kib: u32,
	pub iterations: u32,
	pub parallelism: u32,
}

impl Default for KdfParams {
	fn default() -> Self {
		Self {
			memory_kib: Params::DEFAULT_M_COST,
			iterations: Params::DEFAULT_T_COST,
			parallelism: Params::DEFAULT_P_COST,
		}
	}
}

impl KdfParams {
	/// Fast, insecure parameters for tests ONLY.
	pub fn insecure_for_tests() -> Self {
		Self {
			memory_kib: 1024,
			iterations: 1,
			parallelism: 1,
		}
	}

	fn argon2(&self) -> Result<Argon2<'static>> {
		let params = Params::new(
			self.memory_kib,
			self.iterations,
			self.parallelism,
			Some(OUTPUT_SIZE),
		)
		.map_err(|e| Error::InvalidKdfParams(e.to_string()))?;
		Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
	}

	pub fn validate(&self) -> Result<()> {
		self.argon2().map(|_| ())
	}

	/// At least as costly as `floor` in memory and iterations.
	pub fn at_least(&self, floor: &KdfParams) -> bool {
		self.memory_kib >= floor.memory_kib && self.iterations >= floor.iterations
	}
}

pub struct DerivedKeys {
	pub master: Zeroizing<[u8; KEY_SIZE]>,
	pub auth: Zeroizing<[u8; KEY_SIZE]>,
}

impl std::fmt::Debug for DerivedKeys {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("DerivedKeys")
			.field("master", &"[REDACTED]")
			.field("auth", &"[REDACTED]")
			.finish()
	}
}

pub fn generate_salt() -> [u8; SALT_SIZE] {
	let mut salt = [0u8; SALT_SIZE];
	OsRng.fill_bytes(&mut salt);
	salt
}

/// Stretch `secret` into the master and auth keys. CPU and memory heavy;
/// async callers should run it on a blocking thread.
pub fn derive_keys(secret: &[u8], salt: &[u8], params: &KdfParams) -> Result<DerivedKeys> {
	let mut out = Zeroizing::new([0u8; OUTPUT_SIZE]);
	params
		.argon2()?
		.hash_password_into(secret, salt, out.as_mut())
		.map_err(|e| Error::InvalidKdfParams(e.to_string()))?;

	let mut master = Zeroizing::new([0u8; KEY_SIZE]);
	let mut auth = Zeroizing::new([0u8; KEY_SIZE]);
	master.copy_from_slice(&out[..KEY_SIZE]);
	auth.copy_from_slice(&out[KEY_SIZE..]);
	Ok(DerivedKeys { master, auth })
}

pub fn login_proof(auth_key: &[u8; KEY_SIZE], login_token: &[u8]) -> Result<Vec<u8>> {
	let mut mac =
		HmacSha256::new_from_slice(auth_key).map_err(|e| Error::Internal(format!("hmac key: {e}")))?;
	mac.update(login_token);
	Ok(mac.finalize().into_bytes().to_vec())
}

/// Constant-time check of a login proof, for registries that hold the auth key.
pub fn verify_login_proof(auth_key: &[u8], login_token: &[u8], proof: &[u8]) -> bool {
	match HmacSha256::new_from_slice(auth_key) {
		Ok(mut mac) => {
			mac.update(login_token);
			mac.verify_slice(proof).is_ok()
		}
		Err(_) => false,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn derivation_is_deterministic() {
		let params = KdfParams::insecure_for_tests();
		let salt = generate_salt();
		let a = derive_keys(b"correct horse", &salt, &params).unwrap();
		let b = derive_keys(b"correct horse", &salt, &params).unwrap();
		assert_eq!(a.master.as_slice(), b.master.as_slice());
		assert_eq!(a.auth.as_slice(), b.auth.as_slice());
		assert_ne!(a.master.as_slice(), a.auth.as_slice());
	}

	#[test]
	fn different_salt_or_secret_changes_keys() {
		let params = KdfParams::insecure_for_tests();
		let salt = generate_salt();
		let base = derive_keys(b"secret", &salt, &params).unwrap();
		let other_secret = derive_keys(b"secret!", &salt, &params).unwrap();
		let other_salt = derive_keys(b"secret", &generate_salt(), &params).unwrap();
		assert_ne!(base.master.as_slice(), other_secret.master.as_slice());
		assert_ne!(base.master.as_slice(), other_salt.master.as_slice());
	}

	#[test]
	fn proof_verifies_only_for_matching_key_and_token() {
		let keys = derive_keys(b"pw", &generate_salt(), &KdfParams::insecure_for_tests()).unwrap();
		let proof = login_proof(&keys.auth, b"token-1").unwrap();

		assert!(verify_login_proof(keys.auth.as_slice(), b"token-1", &proof));
		assert!(!verify_login_proof(keys.auth.as_slice(), b"token-2", &proof));
		assert!(!verify_login_proof(keys.master.as_slice(), b"token-1", &proof));
	}

	#[test]
	fn invalid_params_are_rejected() {
		let params = KdfParams {
			memory_kib: 1,
			iterations: 0,
			parallelism: 1,
		};
		assert!(matches!(params.validate(), Err(Error::InvalidKdfParams(_))));
	}

	#[test]
	fn short_salt_is_rejected() {
		let result = derive_keys(b"pw", b"abc", &KdfParams::insecure_for_tests());
		assert!(result.is_err());
	}

	#[test]
	fn cost_floor_compares_memory_and_iterations() {
		let floor = KdfParams::insecure_for_tests();
		assert!(KdfParams::default().at_least(&floor));
		assert!(floor.at_least(&floor));
		assert!(!floor.at_least(&KdfParams::default()));

		let fewer_passes = KdfParams {
			iterations: 1,
			..KdfParams::default()
		};
		assert!(!fewer_passes.at_least(&KdfParams::default()));
	}

	#[test]
	fn defaults_match_production_strength() {
		let params = KdfParams::default();
		assert_eq!(params.memory_kib, 19456);
		assert_eq!(params.iterations, 2);
		assert_eq!(params.parallelism, 1);
	}

	#[test]
	fn debug_is_redacted() {
		let keys = derive_keys(b"pw", &generate_salt(), &KdfParams::insecure_for_tests()).unwrap();
		assert!(format!("{keys:?}").contains("[REDACTED]"));
	}
}
