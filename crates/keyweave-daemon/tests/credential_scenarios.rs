// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! End-to-end credential flows against the in-memory registry.

use std::sync::Arc;
use std::time::Duration;

use keyweave_common_secret::SecretString;
use keyweave_core::{CredentialName, ErrorKind, IdentityState, KdfParams, PathExp, ResourcePath, TrustPolicy};
use keyweave_daemon::{CredentialEngine, EngineOptions, LoginCredential, WhoKind};
use keyweave_registry::MemoryRegistry;

const PASSPHRASE: &str = "correct horse battery staple";

type Engine = CredentialEngine<MemoryRegistry>;

fn options() -> EngineOptions {
	EngineOptions {
		kdf: KdfParams::insecure_for_tests(),
		trust: TrustPolicy::default(),
		timeout: Duration::from_secs(5),
	}
}

fn engine(registry: &MemoryRegistry) -> Engine {
	CredentialEngine::new(Arc::new(registry.handle()), options())
}

fn user_login(email: &str, passphrase: &str) -> LoginCredential {
	LoginCredential::User {
		email: email.to_string(),
		passphrase: SecretString::from(passphrase),
	}
}

/// Enrolled, logged in and verified.
async fn user(registry: &MemoryRegistry, email: &str) -> Engine {
	let engine = engine(registry);
	engine
		.enroll_user("Test", email, &SecretString::from(PASSPHRASE))
		.await
		.unwrap();
	engine.login(&user_login(email, PASSPHRASE)).await.unwrap();
	let code = registry.verification_code(email).await.unwrap();
	let info = engine.verify_email(&code).await.unwrap();
	assert_eq!(info.state, IdentityState::Active);
	engine
}

fn pathexp(s: &str) -> PathExp {
	PathExp::parse(s).unwrap()
}

fn path(s: &str) -> ResourcePath {
	ResourcePath::parse(s).unwrap()
}

fn name(s: &str) -> CredentialName {
	CredentialName::parse(s).unwrap()
}

fn secret(s: &str) -> SecretString {
	SecretString::from(s)
}

#[tokio::test]
async fn most_specific_scope_wins() {
	let registry = MemoryRegistry::new();
	let alice = user(&registry, "alice@example.com").await;
	let key = name("API_KEY");

	alice
		.set_credential(&pathexp("/acme/*/*/*/*/*"), &key, &secret("v1"))
		.await
		.unwrap();
	let stored = alice
		.set_credential(&pathexp("/acme/web/prod/*/*/*"), &key, &secret("v2"))
		.await
		.unwrap();
	assert_eq!(stored.version, 1);

	let value = alice.get_credential(&path("/acme/web/prod/api/user1/1"), &key).await.unwrap();
	assert_eq!(value.expose(), "v2");

	let value = alice.get_credential(&path("/acme/cli/prod/api/user1/1"), &key).await.unwrap();
	assert_eq!(value.expose(), "v1");

	// names compare case-insensitively
	let all = alice.get_credentials(&path("/acme/web/prod/api/user1/1")).await.unwrap();
	assert_eq!(all.values.len(), 1);
	assert_eq!(all.values[&name("api_key")].expose(), "v2");
}

#[tokio::test]
async fn versions_increase_and_unset_falls_back() {
	let registry = MemoryRegistry::new();
	let alice = user(&registry, "alice@example.com").await;
	let key = name("DB_URL");
	let web = pathexp("/acme/web/*/*/*/*");
	let at = path("/acme/web/prod/api/user1/1");

	alice.set_credential(&pathexp("/acme/*/*/*/*/*"), &key, &secret("broad")).await.unwrap();
	alice.set_credential(&web, &key, &secret("first")).await.unwrap();
	let second = alice.set_credential(&web, &key, &secret("second")).await.unwrap();
	assert_eq!(second.version, 2);
	assert_eq!(alice.get_credential(&at, &key).await.unwrap().expose(), "second");

	let unset = alice.unset_credential(&web, &key).await.unwrap();
	assert!(unset.unset);
	assert_eq!(unset.version, 3);
	assert_eq!(alice.get_credential(&at, &key).await.unwrap().expose(), "broad");

	let err = alice.unset_credential(&pathexp("/acme/api/*/*/*/*"), &key).await.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn equally_specific_scopes_are_ambiguous() {
	let registry = MemoryRegistry::new();
	let alice = user(&registry, "alice@example.com").await;
	let key = name("TOKEN");

	alice.set_credential(&pathexp("/acme/[web|api]/*/*/*/*"), &key, &secret("p")).await.unwrap();
	alice.set_credential(&pathexp("/acme/[web|www]/*/*/*/*"), &key, &secret("q")).await.unwrap();

	let err = alice.get_credential(&path("/acme/web/prod/x/y/1"), &key).await.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::AmbiguousScope);

	let value = alice.get_credential(&path("/acme/www/prod/x/y/1"), &key).await.unwrap();
	assert_eq!(value.expose(), "q");
}

#[tokio::test]
async fn bulk_reads_report_unresolvable_names_alongside_values() {
	let registry = MemoryRegistry::new();
	let alice = user(&registry, "alice@example.com").await;
	let bob = user(&registry, "bob@example.com").await;
	let at = path("/acme/web/prod/x/y/1");

	alice.set_credential(&pathexp("/acme/[web|api]/*/*/*/*"), &name("TOKEN"), &secret("p")).await.unwrap();
	alice.set_credential(&pathexp("/acme/[web|www]/*/*/*/*"), &name("TOKEN"), &secret("q")).await.unwrap();
	alice.set_credential(&pathexp("/acme/*/*/*/*/*"), &name("REGION"), &secret("eu")).await.unwrap();
	bob.set_credential(&pathexp("/acme/web/prod/*/*/*"), &name("BOB_ONLY"), &secret("b")).await.unwrap();

	let all = alice.get_credentials(&at).await.unwrap();
	assert_eq!(all.values.len(), 1);
	assert_eq!(all.values[&name("region")].expose(), "eu");
	assert_eq!(all.skipped[&name("token")].kind(), ErrorKind::AmbiguousScope);
	assert_eq!(all.skipped[&name("bob_only")].kind(), ErrorKind::Authorization);
}

#[tokio::test]
async fn revoked_member_loses_access() {
	let registry = MemoryRegistry::new();
	let alice = user(&registry, "alice@example.com").await;
	let bob = user(&registry, "bob@example.com").await;
	let scope = pathexp("/acme/web/*/*/*/*");
	let at = path("/acme/web/prod/api/user1/1");
	let key = name("API_KEY");

	alice.set_credential(&scope, &key, &secret("v1")).await.unwrap();
	let err = bob.get_credential(&at, &key).await.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::Authorization);

	let bob_id = bob.who().await.identity.unwrap().id;
	let summary = alice.add_member(&scope, bob_id).await.unwrap();
	assert!(summary.members.contains(&bob_id));
	assert_eq!(bob.get_credential(&at, &key).await.unwrap().expose(), "v1");

	let summary = alice.revoke_member(&scope, bob_id).await.unwrap();
	assert_eq!(summary.generation, 2);
	assert!(!summary.members.contains(&bob_id));

	let err = bob.get_credential(&at, &key).await.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::Authorization);
	let err = bob.set_credential(&scope, &key, &secret("mine")).await.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::Authorization);

	// old versions stay readable for the remaining members
	assert_eq!(alice.get_credential(&at, &key).await.unwrap().expose(), "v1");
	let next = alice.set_credential(&scope, &key, &secret("v2")).await.unwrap();
	assert_eq!(next.version, 2);
	assert_eq!(alice.get_credential(&at, &key).await.unwrap().expose(), "v2");

	let alice_id = alice.who().await.identity.unwrap().id;
	let err = alice.revoke_member(&scope, alice_id).await.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn keyrings_are_created_once() {
	let registry = MemoryRegistry::new();
	let alice = user(&registry, "alice@example.com").await;
	let scope = pathexp("/acme/web/prod/*/*/*");

	let summary = alice.create_keyring(&scope).await.unwrap();
	assert_eq!(summary.generation, 1);
	assert_eq!(summary.members.len(), 1);

	let err = alice.create_keyring(&scope).await.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn machine_reads_what_its_creator_shares() {
	let registry = MemoryRegistry::new();
	let alice = user(&registry, "alice@example.com").await;
	let scope = pathexp("/acme/web/*/*/*/*");
	let key = name("API_KEY");
	alice.set_credential(&scope, &key, &secret("v1")).await.unwrap();

	let created = alice.create_machine("acme", "ci", &[]).await.unwrap();
	let segment = alice.get_machine(created.machine_id).await.unwrap();
	assert_eq!(segment.tokens.len(), 1);
	alice.add_member(&scope, created.machine_id).await.unwrap();

	let machine = engine(&registry);
	let identity = machine
		.login(&LoginCredential::Machine {
			token_id: created.token_id,
			secret: created.secret.clone(),
		})
		.await
		.unwrap();
	assert_eq!(identity.id, created.machine_id);
	assert_eq!(machine.who().await.kind, WhoKind::Machine);

	let value = machine.get_credential(&path("/acme/web/prod/api/ci/1"), &key).await.unwrap();
	assert_eq!(value.expose(), "v1");

	// machines cannot create machines
	let err = machine.create_machine("acme", "other", &[]).await.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::Authorization);
}

#[tokio::test]
async fn tampered_machine_secret_fails_authentication() {
	let registry = MemoryRegistry::new();
	let alice = user(&registry, "alice@example.com").await;
	let created = alice.create_machine("acme", "ci", &[]).await.unwrap();

	let machine = engine(&registry);
	let tampered = format!("{}A", created.secret.expose());
	let err = machine
		.login(&LoginCredential::Machine {
			token_id: created.token_id,
			secret: SecretString::from(tampered.as_str()),
		})
		.await
		.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::Authentication);

	assert_eq!(machine.who().await.kind, WhoKind::NoSession);
	let status = machine.status().await;
	assert!(!status.token);
	assert!(!status.passphrase);
}

#[tokio::test]
async fn wrong_passphrase_leaves_session_logged_out() {
	let registry = MemoryRegistry::new();
	let alice = user(&registry, "alice@example.com").await;
	assert!(alice.session().is_logged_in().await);

	let err = alice.login(&user_login("alice@example.com", "not the passphrase")).await.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::Authentication);
	assert!(!alice.session().is_logged_in().await);

	let err = alice.get_credential(&path("/acme/web/prod/api/user1/1"), &name("x")).await.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::Authentication);
}

#[tokio::test]
async fn login_stretches_with_the_enrolled_parameters() {
	let registry = MemoryRegistry::new();
	let enrolled = KdfParams {
		memory_kib: 2048,
		..KdfParams::insecure_for_tests()
	};
	let enroller = CredentialEngine::new(Arc::new(registry.handle()), EngineOptions { kdf: enrolled, ..options() });
	enroller
		.enroll_user("Dana", "dana@example.com", &SecretString::from(PASSPHRASE))
		.await
		.unwrap();

	// configured cheaper than the account: the stored parameters win
	let daemon = engine(&registry);
	let info = daemon.login(&user_login("dana@example.com", PASSPHRASE)).await.unwrap();
	assert_eq!(info.email.as_deref(), Some("dana@example.com"));

	// an account cheaper than the configured floor is refused
	let strict = CredentialEngine::new(
		Arc::new(registry.handle()),
		EngineOptions {
			kdf: KdfParams {
				memory_kib: 4096,
				..KdfParams::insecure_for_tests()
			},
			..options()
		},
	);
	let err = strict.login(&user_login("dana@example.com", PASSPHRASE)).await.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::Authentication);
	assert!(!strict.session().is_logged_in().await);
}

#[tokio::test]
async fn unverified_accounts_are_gated() {
	let registry = MemoryRegistry::new();
	let carol = engine(&registry);
	carol
		.enroll_user("Carol", "carol@example.com", &SecretString::from(PASSPHRASE))
		.await
		.unwrap();
	let info = carol.login(&user_login("carol@example.com", PASSPHRASE)).await.unwrap();
	assert_eq!(info.state, IdentityState::Unverified);

	let err = carol
		.set_credential(&pathexp("/acme/*/*/*/*/*"), &name("x"), &secret("y"))
		.await
		.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::UnverifiedAccount);

	let info = carol.update_profile(Some("Caroline"), None).await.unwrap();
	assert_eq!(info.name, "Caroline");
	assert_eq!(carol.who().await.identity.unwrap().name, "Caroline");

	let code = registry.verification_code("carol@example.com").await.unwrap();
	carol.verify_email(&code).await.unwrap();
	carol
		.set_credential(&pathexp("/acme/*/*/*/*/*"), &name("x"), &secret("y"))
		.await
		.unwrap();
}

#[tokio::test]
async fn logout_wipes_the_session() {
	let registry = MemoryRegistry::new();
	let alice = user(&registry, "alice@example.com").await;
	assert_eq!(alice.who().await.kind, WhoKind::User);

	alice.logout().await;
	assert_eq!(alice.who().await.kind, WhoKind::NoSession);
	assert!(!alice.status().await.token);
	let err = alice.create_keyring(&pathexp("/acme/*/*/*/*/*")).await.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::Authentication);
}
