// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Error types for the registry client.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Marker the registry puts in an `unauthorized` error for accounts that
/// have not verified their email address.
pub const UNVERIFIED_MARKER: &str = "wrong identity state: unverified";

/// Error body returned by the registry: `{"type": "...", "error": ["..."]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
	#[serde(rename = "type")]
	pub kind: String,
	#[serde(default)]
	pub error: Vec<String>,
}

impl ErrorBody {
	pub fn new(kind: &str, message: impl Into<String>) -> Self {
		Self {
			kind: kind.to_string(),
			error: vec![message.into()],
		}
	}

	fn message(&self) -> String {
		self.error.join("; ")
	}
}

/// Errors that can occur when talking to the registry.
#[derive(Debug, Error)]
pub enum RegistryError {
	/// The identity has not verified its email address.
	#[error("account is unverified")]
	Unverified,

	#[error("unauthorized: {0}")]
	Unauthorized(String),

	#[error("not found: {0}")]
	NotFound(String),

	#[error("bad request: {0}")]
	BadRequest(String),

	/// Any other error type the registry reports.
	#[error("registry returned {kind}: {message}")]
	Api { kind: String, message: String },

	/// HTTP error.
	#[error("HTTP error: {0}")]
	Http(#[from] reqwest::Error),

	/// Invalid response.
	#[error("invalid response: {0}")]
	InvalidResponse(String),

	/// Configuration error.
	#[error("configuration error: {0}")]
	Configuration(String),
}

impl RegistryError {
	/// Classify a registry error body.
	pub fn from_body(body: ErrorBody) -> Self {
		let message = body.message();
		match body.kind.as_str() {
			"unauthorized" if message.contains(UNVERIFIED_MARKER) => Self::Unverified,
			"unauthorized" => Self::Unauthorized(message),
			"not_found" => Self::NotFound(message),
			"bad_request" => Self::BadRequest(message),
			_ => Self::Api {
				kind: body.kind,
				message,
			},
		}
	}
}

impl From<RegistryError> for keyweave_core::Error {
	fn from(err: RegistryError) -> Self {
		match err {
			RegistryError::Unverified => Self::Unverified,
			RegistryError::Unauthorized(_) => Self::Unauthorized,
			RegistryError::NotFound(m) => Self::NotFound(m),
			RegistryError::BadRequest(m) => Self::Validation(m),
			other => Self::Transport(other.to_string()),
		}
	}
}

/// Result type for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

#[cfg(test)]
mod tests {
	use super::*;
	use keyweave_core::ErrorKind;

	fn classify(kind: &str, message: &str) -> keyweave_core::Error {
		RegistryError::from_body(ErrorBody::new(kind, message)).into()
	}

	#[test]
	fn unverified_is_distinguished_from_unauthorized() {
		assert_eq!(
			classify("unauthorized", "wrong identity state: unverified").kind(),
			ErrorKind::UnverifiedAccount
		);
		let other = classify("unauthorized", "bad token");
		assert_eq!(other.kind(), ErrorKind::Authorization);
		assert_eq!(other.to_string(), "You are unauthorized to perform this action.");
	}

	#[test]
	fn remaining_types_map_to_their_kinds() {
		assert_eq!(classify("not_found", "no machine").kind(), ErrorKind::NotFound);
		assert_eq!(classify("bad_request", "bad pathexp").kind(), ErrorKind::Validation);
		assert_eq!(classify("internal", "boom").kind(), ErrorKind::Transport);
	}

	#[test]
	fn error_body_parses_the_wire_shape() {
		let body: ErrorBody = serde_json::from_str(r#"{"type":"not_found","error":["a","b"]}"#).unwrap();
		assert_eq!(body.kind, "not_found");
		assert!(matches!(RegistryError::from_body(body), RegistryError::NotFound(m) if m == "a; b"));
	}
}
