// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The keyweave credential graph.
//!
//! Everything the registry stores is built here: content-addressed IDs,
//! path expressions, signed envelopes, claimed keypairs and the trust graph
//! that decides which signatures count, keyrings wrapped for their members,
//! and encrypted credentials. The crate performs no I/O; the daemon fetches
//! envelopes from the registry and hands them to these functions.
//!
//! # Flow
//!
//! ```text
//! registry trees ──verify──▶ VerifiedTree ──resolve──▶ sealing keyring
//!                                                         │
//!                         session encryption key ──unwrap─┘──▶ KeyringKey ──open──▶ value
//! ```

pub mod account;
pub mod base64_bytes;
pub mod credential;
pub mod encryption;
pub mod envelope;
pub mod error;
pub mod id;
pub mod kdf;
pub mod keypair;
pub mod keyring;
pub mod pathexp;
pub mod resolve;
pub mod tree;
pub mod trust;
pub mod wrap;

pub use account::{
	enroll, new_machine, AuthInfo, Enrollment, IdentityInfo, IdentityKind, IdentityState, MachineBody,
	MachineCreation, MachineSegment, MachineTokenBody, MembershipBody, NewMachine, TokenCreation,
	TokenSegment, UserBody,
};
pub use credential::{open_credential, seal_credential, CredentialBody, CredentialName};
pub use encryption::{EncryptedData, KEY_SIZE, NONCE_SIZE};
pub use envelope::{Body, Signature, Signed, Unsigned, Verified};
pub use error::{Error, ErrorKind, Result};
pub use id::{Id, IdType};
pub use kdf::{derive_keys, generate_salt, login_proof, verify_login_proof, DerivedKeys, KdfParams};
pub use keypair::{
	Claim, ClaimedKeyPair, ClaimedPublicKey, EncryptionKeyPair, KeyPurpose, PrivateKeyBody,
	PublicKeyBody, SigningKeyPair,
};
pub use keyring::{
	add_member, create_keyring, revoke_member, unwrap_keyring_key, KeyringBody, KeyringKey,
	KeyringMemberBody, Rotation,
};
pub use pathexp::{PathExp, ResourcePath, Segment, Specificity};
pub use resolve::{resolve_all, resolve_credential, Resolution};
pub use tree::{CredentialTree, VerifiedTree};
pub use trust::{Recipient, TrustGraph, TrustPolicy};
pub use wrap::WrappedKey;
