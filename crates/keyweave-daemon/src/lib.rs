// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The keyweave daemon.
//!
//! Holds one session per process and runs credential operations against the
//! registry on its behalf. Everything the registry returns is verified
//! locally before it is used.

pub mod config;
pub mod engine;
pub mod session;

pub use config::{ConfigError, DaemonConfig, DaemonConfigLayer, LogFormat, LoggingConfig, RegistrySection};
pub use engine::{CreatedMachine, CredentialEngine, CredentialVersion, EngineOptions, KeyringSummary};
pub use session::{
	ActiveSession, LoginCredential, SessionGuard, SessionHandle, SessionState, Status, Who, WhoKind,
};
