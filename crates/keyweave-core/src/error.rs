// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Error types for the credential graph.

use thiserror::Error;

use crate::id::Id;

/// Result type alias for credential graph operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`], for callers that branch on failure
/// class rather than on the exact variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
	/// Malformed input; rejected before any registry round trip.
	Validation,
	/// Login failed or no session is active.
	Authentication,
	/// The identity exists but has not verified its email address.
	UnverifiedAccount,
	/// Not a keyring member, or no trusted claim.
	Authorization,
	/// Two equally specific scopes match a path.
	AmbiguousScope,
	/// A signature, content ID or ciphertext failed to verify.
	Integrity,
	NotFound,
	/// The registry was unreachable, timed out, or answered unexpectedly.
	Transport,
	Internal,
}

/// Errors that can occur in the credential graph.
#[derive(Debug, Error)]
pub enum Error {
	// =========================================================================
	// Validation Errors
	// =========================================================================
	#[error("invalid path expression {input:?}: {reason}")]
	InvalidPathExp { input: String, reason: String },

	#[error("invalid path {input:?}: {reason}")]
	InvalidPath { input: String, reason: String },

	#[error("invalid credential name {0:?}")]
	InvalidName(String),

	#[error("invalid id: {0}")]
	InvalidId(String),

	#[error("invalid key derivation parameters: {0}")]
	InvalidKdfParams(String),

	#[error("{0}")]
	Validation(String),

	// =========================================================================
	// Session Errors
	// =========================================================================
	#[error("not authenticated: log in first")]
	NotAuthenticated,

	#[error("authentication failed: {0}")]
	Authentication(String),

	#[error("account is unverified: verify your email address to continue")]
	Unverified,

	// =========================================================================
	// Access Errors
	// =========================================================================
	#[error("not a member of keyring {keyring_id}")]
	NotAMember { keyring_id: Id },

	#[error("untrusted key {key_id}: {reason}")]
	UntrustedKey { key_id: Id, reason: String },

	#[error("no trusted {purpose} key for {owner_id}")]
	NoTrustedKey { owner_id: Id, purpose: String },

	#[error("You are unauthorized to perform this action.")]
	Unauthorized,

	// =========================================================================
	// Resolution Errors
	// =========================================================================
	#[error("ambiguous scope for {name:?} at {path}: {candidates:?} are equally specific")]
	AmbiguousScope {
		name: String,
		path: String,
		candidates: Vec<String>,
	},

	#[error("not found: {0}")]
	NotFound(String),

	// =========================================================================
	// Integrity Errors
	// =========================================================================
	#[error("content id mismatch: envelope claims {claimed}, body hashes to {computed}")]
	ContentIdMismatch { claimed: Id, computed: Id },

	#[error("invalid signature on {0}")]
	SignatureInvalid(Id),

	#[error("decryption failed: {0}")]
	Decryption(String),

	#[error("malformed envelope: {0}")]
	Malformed(String),

	// =========================================================================
	// Infrastructure Errors
	// =========================================================================
	#[error("encryption failed: {0}")]
	Encryption(String),

	#[error("invalid key size: expected {expected}, got {actual}")]
	InvalidKeySize { expected: usize, actual: usize },

	#[error("registry error: {0}")]
	Transport(String),

	#[error("serialization failed: {0}")]
	Serialization(#[from] serde_json::Error),

	#[error("internal error: {0}")]
	Internal(String),
}

impl Error {
	pub fn kind(&self) -> ErrorKind {
		match self {
			Error::InvalidPathExp { .. }
			| Error::InvalidPath { .. }
			| Error::InvalidName(_)
			| Error::InvalidId(_)
			| Error::InvalidKdfParams(_)
			| Error::Validation(_) => ErrorKind::Validation,

			Error::NotAuthenticated | Error::Authentication(_) => ErrorKind::Authentication,

			Error::Unverified => ErrorKind::UnverifiedAccount,

			Error::NotAMember { .. }
			| Error::UntrustedKey { .. }
			| Error::NoTrustedKey { .. }
			| Error::Unauthorized => ErrorKind::Authorization,

			Error::AmbiguousScope { .. } => ErrorKind::AmbiguousScope,

			Error::NotFound(_) => ErrorKind::NotFound,

			Error::ContentIdMismatch { .. }
			| Error::SignatureInvalid(_)
			| Error::Decryption(_)
			| Error::Malformed(_) => ErrorKind::Integrity,

			Error::Transport(_) => ErrorKind::Transport,

			Error::Encryption(_)
			| Error::InvalidKeySize { .. }
			| Error::Serialization(_)
			| Error::Internal(_) => ErrorKind::Internal,
		}
	}

	/// Returns true if this error should be logged at error level.
	pub fn is_internal(&self) -> bool {
		self.kind() == ErrorKind::Internal
	}
}
