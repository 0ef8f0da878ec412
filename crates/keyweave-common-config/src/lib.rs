// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Environment helpers shared by the keyweave daemon and its tooling.
//!
//! - [`load_secret_env`] reads secrets (machine token secrets, passphrases for
//!   unattended setups) using the `VAR` / `VAR_FILE` convention
//! - [`env_override`] and [`env_flag`] read typed, optional overrides for the
//!   layered daemon configuration

pub mod env;

pub use keyweave_common_secret::{Secret, SecretString, REDACTED};

pub use env::{env_flag, env_override, load_secret_env, EnvValueError, SecretEnvError};
