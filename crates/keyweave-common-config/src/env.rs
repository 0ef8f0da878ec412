// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Reading secrets and typed overrides from the process environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::{env, fs};

use keyweave_common_secret::SecretString;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SecretEnvError {
	#[error("failed to read secret file at {path}: {source}")]
	Io {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("secret file path in {var} is empty")]
	EmptyPath { var: String },
}

#[derive(Debug, Error)]
#[error("invalid value for {var}: {message}")]
pub struct EnvValueError {
	pub var: String,
	pub message: String,
}

/// Load a secret from `{var}_FILE` (preferred) or `{var}`.
///
/// A single trailing newline is stripped from file contents, since token
/// files written by `echo` or an editor usually carry one. Returns `Ok(None)`
/// when neither variable is set.
pub fn load_secret_env(var: &str) -> Result<Option<SecretString>, SecretEnvError> {
	let file_var = format!("{var}_FILE");

	if let Ok(path_str) = env::var(&file_var) {
		if path_str.is_empty() {
			return Err(SecretEnvError::EmptyPath { var: file_var });
		}

		let path = PathBuf::from(&path_str);
		let content = fs::read_to_string(&path).map_err(|source| SecretEnvError::Io {
			path: path.clone(),
			source,
		})?;
		let content = SecretString::new(content);

		let trimmed = content
			.expose()
			.strip_suffix('\n')
			.unwrap_or(content.expose())
			.to_string();
		return Ok(Some(SecretString::new(trimmed)));
	}

	Ok(env::var(var).ok().map(SecretString::new))
}

/// Parse `{var}` if it is set and non-empty.
pub fn env_override<T>(var: &str) -> Result<Option<T>, EnvValueError>
where
	T: FromStr,
	T::Err: std::fmt::Display,
{
	match env::var(var) {
		Ok(raw) if !raw.trim().is_empty() => raw
			.trim()
			.parse()
			.map(Some)
			.map_err(|e: T::Err| EnvValueError {
				var: var.to_string(),
				message: e.to_string(),
			}),
		_ => Ok(None),
	}
}

/// Read a boolean flag; `1`, `true`, `yes` and `on` (any case) are true.
pub fn env_flag(var: &str) -> Option<bool> {
	env::var(var).ok().map(|v| {
		matches!(
			v.trim().to_ascii_lowercase().as_str(),
			"1" | "true" | "yes" | "on"
		)
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Write;
	use tempfile::NamedTempFile;

	#[test]
	fn missing_secret_is_none() {
		let var = "KEYWEAVE_TEST_UNSET_SECRET";
		env::remove_var(var);
		env::remove_var(format!("{var}_FILE"));

		assert!(load_secret_env(var).unwrap().is_none());
	}

	#[test]
	fn reads_direct_value() {
		let var = "KEYWEAVE_TEST_DIRECT_SECRET";
		env::set_var(var, "token-secret");
		env::remove_var(format!("{var}_FILE"));

		assert_eq!(load_secret_env(var).unwrap().unwrap().expose(), "token-secret");

		env::remove_var(var);
	}

	#[test]
	fn file_takes_precedence_and_loses_one_newline() {
		let var = "KEYWEAVE_TEST_FILE_SECRET";
		let mut file = NamedTempFile::new().unwrap();
		writeln!(file, "from-file").unwrap();

		env::set_var(var, "from-env");
		env::set_var(format!("{var}_FILE"), file.path().to_str().unwrap());

		assert_eq!(load_secret_env(var).unwrap().unwrap().expose(), "from-file");

		env::remove_var(var);
		env::remove_var(format!("{var}_FILE"));
	}

	#[test]
	fn empty_file_path_is_rejected() {
		let var = "KEYWEAVE_TEST_EMPTY_PATH_SECRET";
		env::set_var(format!("{var}_FILE"), "");

		assert!(matches!(
			load_secret_env(var),
			Err(SecretEnvError::EmptyPath { .. })
		));

		env::remove_var(format!("{var}_FILE"));
	}

	#[test]
	fn unreadable_file_is_an_io_error() {
		let var = "KEYWEAVE_TEST_MISSING_FILE_SECRET";
		env::set_var(format!("{var}_FILE"), "/nonexistent/keyweave/secret");

		assert!(matches!(load_secret_env(var), Err(SecretEnvError::Io { .. })));

		env::remove_var(format!("{var}_FILE"));
	}

	#[test]
	fn typed_override_parses_and_reports_errors() {
		env::set_var("KEYWEAVE_TEST_TIMEOUT", "45");
		assert_eq!(env_override::<u64>("KEYWEAVE_TEST_TIMEOUT").unwrap(), Some(45));

		env::set_var("KEYWEAVE_TEST_TIMEOUT", "soon");
		let err = env_override::<u64>("KEYWEAVE_TEST_TIMEOUT").unwrap_err();
		assert_eq!(err.var, "KEYWEAVE_TEST_TIMEOUT");

		env::remove_var("KEYWEAVE_TEST_TIMEOUT");
		assert_eq!(env_override::<u64>("KEYWEAVE_TEST_TIMEOUT").unwrap(), None);
	}

	#[test]
	fn flags_accept_common_spellings() {
		env::set_var("KEYWEAVE_TEST_FLAG", "Yes");
		assert_eq!(env_flag("KEYWEAVE_TEST_FLAG"), Some(true));
		env::set_var("KEYWEAVE_TEST_FLAG", "0");
		assert_eq!(env_flag("KEYWEAVE_TEST_FLAG"), Some(false));
		env::remove_var("KEYWEAVE_TEST_FLAG");
		assert_eq!(env_flag("KEYWEAVE_TEST_FLAG"), None);
	}
}
