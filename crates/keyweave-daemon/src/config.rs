// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Daemon configuration.
//!
//! Layers merge in order: built-in defaults, the TOML file, then
//! `KEYWEAVE_*` environment variables. Each layer is all `Option`s;
//! [`DaemonConfigLayer::finalize`] fills the gaps and validates.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use keyweave_common_config::{env_flag, env_override, EnvValueError};
use keyweave_core::{Id, KdfParams, TrustPolicy};
use keyweave_registry::{RegistryConfig, DEFAULT_REGISTRY_URL};
use serde::{Deserialize, Serialize};
use tracing::debug;

const CONFIG_FILE_NAME: &str = "config.toml";
const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	#[error("Invalid value for {key}: {message}")]
	InvalidValue { key: String, message: String },

	#[error("Failed to parse TOML config at {path}: {source}")]
	TomlParse {
		path: PathBuf,
		#[source]
		source: toml::de::Error,
	},

	#[error("Failed to read config file {path}: {source}")]
	FileRead {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("Validation error: {0}")]
	Validation(String),
}

impl From<EnvValueError> for ConfigError {
	fn from(e: EnvValueError) -> Self {
		ConfigError::InvalidValue {
			key: e.var,
			message: e.message,
		}
	}
}

// =============================================================================
// Sections
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RegistryConfigLayer {
	pub url: Option<String>,
	pub timeout_secs: Option<u64>,
	pub allow_insecure: Option<bool>,
}

impl RegistryConfigLayer {
	pub fn merge(&mut self, other: Self) {
		if other.url.is_some() {
			self.url = other.url;
		}
		if other.timeout_secs.is_some() {
			self.timeout_secs = other.timeout_secs;
		}
		if other.allow_insecure.is_some() {
			self.allow_insecure = other.allow_insecure;
		}
	}

	pub fn finalize(self) -> RegistrySection {
		RegistrySection {
			url: self.url.unwrap_or_else(|| DEFAULT_REGISTRY_URL.to_string()),
			timeout_secs: self.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS),
			allow_insecure: self.allow_insecure.unwrap_or(false),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegistrySection {
	pub url: String,
	pub timeout_secs: u64,
	pub allow_insecure: bool,
}

impl RegistrySection {
	pub fn timeout(&self) -> Duration {
		Duration::from_secs(self.timeout_secs)
	}

	pub fn client_config(&self) -> RegistryConfig {
		RegistryConfig {
			url: self.url.clone(),
			timeout: self.timeout(),
			allow_insecure: self.allow_insecure,
		}
	}
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct KdfConfigLayer {
	pub memory_kib: Option<u32>,
	pub iterations: Option<u32>,
	pub parallelism: Option<u32>,
}

impl KdfConfigLayer {
	pub fn merge(&mut self, other: Self) {
		if other.memory_kib.is_some() {
			self.memory_kib = other.memory_kib;
		}
		if other.iterations.is_some() {
			self.iterations = other.iterations;
		}
		if other.parallelism.is_some() {
			self.parallelism = other.parallelism;
		}
	}

	pub fn finalize(self) -> KdfParams {
		let defaults = KdfParams::default();
		KdfParams {
			memory_kib: self.memory_kib.unwrap_or(defaults.memory_kib),
			iterations: self.iterations.unwrap_or(defaults.iterations),
			parallelism: self.parallelism.unwrap_or(defaults.parallelism),
		}
	}
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TrustConfigLayer {
	pub administrators: Option<Vec<String>>,
}

impl TrustConfigLayer {
	pub fn merge(&mut self, other: Self) {
		if other.administrators.is_some() {
			self.administrators = other.administrators;
		}
	}

	pub fn finalize(self) -> Result<TrustPolicy, ConfigError> {
		let administrators = self
			.administrators
			.unwrap_or_default()
			.iter()
			.map(|raw| {
				raw.trim().parse::<Id>().map_err(|e| ConfigError::InvalidValue {
					key: "trust.administrators".to_string(),
					message: e.to_string(),
				})
			})
			.collect::<Result<BTreeSet<_>, _>>()?;
		Ok(TrustPolicy { administrators })
	}
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
	#[default]
	Pretty,
	Json,
}

impl std::str::FromStr for LogFormat {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_ascii_lowercase().as_str() {
			"pretty" => Ok(Self::Pretty),
			"json" => Ok(Self::Json),
			other => Err(format!("expected pretty or json, got {other:?}")),
		}
	}
}

fn default_level() -> String {
	"info".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfigLayer {
	pub level: Option<String>,
	pub format: Option<LogFormat>,
}

impl LoggingConfigLayer {
	pub fn merge(&mut self, other: Self) {
		if other.level.is_some() {
			self.level = other.level;
		}
		if other.format.is_some() {
			self.format = other.format;
		}
	}

	pub fn finalize(self) -> LoggingConfig {
		LoggingConfig {
			level: self.level.unwrap_or_else(default_level),
			format: self.format.unwrap_or_default(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
	pub level: String,
	pub format: LogFormat,
}

// =============================================================================
// Top level
// =============================================================================

/// Configuration layer: every field optional so layers can merge.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DaemonConfigLayer {
	#[serde(default)]
	pub root_dir: Option<PathBuf>,
	#[serde(default)]
	pub registry: Option<RegistryConfigLayer>,
	#[serde(default)]
	pub kdf: Option<KdfConfigLayer>,
	#[serde(default)]
	pub trust: Option<TrustConfigLayer>,
	#[serde(default)]
	pub logging: Option<LoggingConfigLayer>,
}

impl DaemonConfigLayer {
	/// Merge another layer into this one. Other layer takes precedence.
	pub fn merge(&mut self, other: DaemonConfigLayer) {
		if other.root_dir.is_some() {
			self.root_dir = other.root_dir;
		}
		merge_option(&mut self.registry, other.registry, RegistryConfigLayer::merge);
		merge_option(&mut self.kdf, other.kdf, KdfConfigLayer::merge);
		merge_option(&mut self.trust, other.trust, TrustConfigLayer::merge);
		merge_option(&mut self.logging, other.logging, LoggingConfigLayer::merge);
	}

	/// Parse a TOML file. A missing file is an empty layer.
	pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
		if !path.exists() {
			debug!(path = %path.display(), "config file not found, skipping");
			return Ok(Self::default());
		}
		let content = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
			path: path.to_path_buf(),
			source,
		})?;
		toml::from_str(&content).map_err(|source| ConfigError::TomlParse {
			path: path.to_path_buf(),
			source,
		})
	}

	/// `KEYWEAVE_*` environment variables.
	pub fn from_env() -> Result<Self, ConfigError> {
		let mut layer = Self {
			root_dir: env_override::<PathBuf>("KEYWEAVE_ROOT")?,
			..Self::default()
		};

		let registry = RegistryConfigLayer {
			url: env_override("KEYWEAVE_REGISTRY_URL")?,
			timeout_secs: env_override("KEYWEAVE_REGISTRY_TIMEOUT_SECS")?,
			allow_insecure: env_flag("KEYWEAVE_ALLOW_INSECURE"),
		};
		if registry != RegistryConfigLayer::default() {
			layer.registry = Some(registry);
		}

		let kdf = KdfConfigLayer {
			memory_kib: env_override("KEYWEAVE_KDF_MEMORY_KIB")?,
			iterations: env_override("KEYWEAVE_KDF_ITERATIONS")?,
			parallelism: env_override("KEYWEAVE_KDF_PARALLELISM")?,
		};
		if kdf != KdfConfigLayer::default() {
			layer.kdf = Some(kdf);
		}

		if let Some(raw) = env_override::<String>("KEYWEAVE_ADMINISTRATORS")? {
			let administrators = raw
				.split(',')
				.map(str::trim)
				.filter(|s| !s.is_empty())
				.map(str::to_string)
				.collect();
			layer.trust = Some(TrustConfigLayer {
				administrators: Some(administrators),
			});
		}

		let logging = LoggingConfigLayer {
			level: env_override("KEYWEAVE_LOG_LEVEL")?,
			format: env_override("KEYWEAVE_LOG_FORMAT")?,
		};
		if logging != LoggingConfigLayer::default() {
			layer.logging = Some(logging);
		}

		Ok(layer)
	}

	pub fn finalize(self) -> Result<DaemonConfig, ConfigError> {
		let root_dir = match self.root_dir {
			Some(dir) => dir,
			None => default_root_dir()?,
		};
		let config = DaemonConfig {
			root_dir,
			registry: self.registry.unwrap_or_default().finalize(),
			kdf: self.kdf.unwrap_or_default().finalize(),
			trust: self.trust.unwrap_or_default().finalize()?,
			logging: self.logging.unwrap_or_default().finalize(),
		};
		config.validate()?;
		Ok(config)
	}
}

fn merge_option<T, F>(target: &mut Option<T>, source: Option<T>, merge_fn: F)
where
	F: FnOnce(&mut T, T),
{
	match (target.as_mut(), source) {
		(Some(t), Some(s)) => merge_fn(t, s),
		(None, Some(s)) => *target = Some(s),
		_ => {}
	}
}

fn default_root_dir() -> Result<PathBuf, ConfigError> {
	dirs::home_dir()
		.map(|home| home.join(".keyweave"))
		.ok_or_else(|| ConfigError::Validation("cannot determine home directory; set KEYWEAVE_ROOT".to_string()))
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
	pub root_dir: PathBuf,
	pub registry: RegistrySection,
	pub kdf: KdfParams,
	pub trust: TrustPolicy,
	pub logging: LoggingConfig,
}

impl DaemonConfig {
	/// Load defaults, then the config file, then the environment.
	///
	/// The file is `config_path` when given, otherwise `config.toml` in the
	/// root directory (which itself may come from `KEYWEAVE_ROOT`).
	pub fn load(config_path: Option<&Path>) -> Result<Self, ConfigError> {
		let env = DaemonConfigLayer::from_env()?;
		let file_path = match config_path {
			Some(path) => path.to_path_buf(),
			None => match &env.root_dir {
				Some(root) => root.join(CONFIG_FILE_NAME),
				None => default_root_dir()?.join(CONFIG_FILE_NAME),
			},
		};

		let mut layer = DaemonConfigLayer::default();
		layer.merge(DaemonConfigLayer::from_file(&file_path)?);
		layer.merge(env);
		layer.finalize()
	}

	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.registry.url.trim().is_empty() {
			return Err(ConfigError::Validation("registry.url must not be empty".to_string()));
		}
		if self.registry.timeout_secs == 0 {
			return Err(ConfigError::InvalidValue {
				key: "registry.timeout_secs".to_string(),
				message: "must be greater than zero".to_string(),
			});
		}
		if !self.registry.allow_insecure && !self.registry.url.starts_with("https://") {
			return Err(ConfigError::Validation(
				"registry.url must use HTTPS unless registry.allow_insecure is set".to_string(),
			));
		}
		self.kdf.validate().map_err(|e| ConfigError::InvalidValue {
			key: "kdf".to_string(),
			message: e.to_string(),
		})
	}
}
