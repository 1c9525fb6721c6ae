//! Login and bearer-token resolution.

use std::{collections::HashMap, time::Duration};

use anyhow::anyhow;
use argon2::{
    Algorithm, Argon2, Params, PasswordHash, PasswordHasher, PasswordVerifier, Version,
    password_hash::{SaltString, rand_core::OsRng},
};
use chrono::Utc;
use elephant_adapter::{
    AnyTokenBackend, MemoryTokenBackend, RedbTokenBackend, TokenBackend, TokenRecord,
};
use rand::RngCore;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::{
    config::{AuthConfig, UserEntry},
    error::{ProxyError, ProxyResult},
};

const TOKEN_BYTES: usize = 24;
const MAX_MINT_ATTEMPTS: usize = 4;

/// Login body as sent by `npm login` (`PUT /-/user/org.couchdb.user:<name>`).
#[derive(Debug, Clone, Deserialize)]
pub struct Credentials {
    #[serde(alias = "user")]
    pub name: String,
    #[serde(alias = "pass")]
    pub password: String,
}

/// Issues and resolves bearer tokens for the configured users.
///
/// Only the SHA-256 digest of a token reaches the backend.
pub struct TokenStore<B> {
    backend: B,
    users: HashMap<String, String>,
    /// Verified in place of a real hash for unknown users, so both ways of
    /// failing a login cost one Argon2 verification.
    decoy: Option<String>,
    ttl: Option<Duration>,
}

impl<B: TokenBackend> TokenStore<B> {
    pub fn new(backend: B, users: &[UserEntry], ttl: Option<Duration>) -> Self {
        let users = users
            .iter()
            .map(|user| (user.name.clone(), user.password_hash.clone()))
            .collect();
        let decoy = decoy_hash(&users);
        Self {
            backend,
            users,
            decoy,
            ttl,
        }
    }

    /// Verifies the credentials and mints a fresh token bound to the user.
    pub async fn authenticate(&self, credentials: &Credentials) -> ProxyResult<String> {
        let (hash, known) = match self.users.get(&credentials.name) {
            Some(hash) => (hash.clone(), true),
            None => match &self.decoy {
                Some(decoy) => (decoy.clone(), false),
                None => return Err(ProxyError::Unauthorized),
            },
        };

        let password = credentials.password.clone();
        let verified = tokio::task::spawn_blocking(move || verify_password(&hash, &password))
            .await
            .map_err(|err| anyhow!("password verification task failed: {err}"))?;
        if !known {
            debug!(user = %credentials.name, "login for unknown user");
            return Err(ProxyError::Unauthorized);
        }
        if !verified {
            debug!(user = %credentials.name, "login with wrong password");
            return Err(ProxyError::Unauthorized);
        }

        let record = TokenRecord {
            username: credentials.name.clone(),
            created_at: Utc::now(),
        };
        for _ in 0..MAX_MINT_ATTEMPTS {
            let token = random_token_hex(TOKEN_BYTES);
            if self
                .backend
                .insert_if_absent(&token_key(&token), &record)
                .await?
            {
                info!(user = %credentials.name, "issued auth token");
                return Ok(token);
            }
            warn!("token collision, minting another");
        }
        Err(anyhow!("could not mint a unique token").into())
    }

    /// Resolves a bearer token to its username.
    pub async fn find_by_token(&self, token: &str) -> ProxyResult<String> {
        if !is_well_formed(token) {
            return Err(ProxyError::Unauthorized);
        }
        let key = token_key(token);
        let Some(record) = self.backend.get(&key).await? else {
            return Err(ProxyError::Unauthorized);
        };

        if let Some(ttl) = self.ttl {
            let age = (Utc::now() - record.created_at)
                .to_std()
                .unwrap_or_default();
            if age >= ttl {
                debug!(user = %record.username, "auth token expired");
                self.backend.remove(&key).await?;
                return Err(ProxyError::Unauthorized);
            }
        }
        Ok(record.username)
    }

    /// Deletes a token. Returns whether it existed.
    pub async fn revoke(&self, token: &str) -> ProxyResult<bool> {
        if !is_well_formed(token) {
            return Ok(false);
        }
        let removed = self.backend.remove(&token_key(token)).await?;
        if removed {
            info!("revoked auth token");
        }
        Ok(removed)
    }

    pub async fn issued(&self) -> ProxyResult<usize> {
        Ok(self.backend.count().await?)
    }
}

/// In-memory tokens unless `auth.tokens_path` names a redb file.
pub fn open_backend(config: &AuthConfig) -> anyhow::Result<AnyTokenBackend> {
    let backend = match &config.tokens_path {
        Some(path) => AnyTokenBackend::Redb(RedbTokenBackend::open(path)?),
        None => AnyTokenBackend::Memory(MemoryTokenBackend::new()),
    };
    info!(backend = backend.kind(), "token store ready");
    Ok(backend)
}

/// Argon2id PHC string for a password, suitable for `[[auth.users]]`.
pub fn hash_password(password: &str) -> anyhow::Result<String> {
    hash_with(&Argon2::default(), password)
}

fn hash_with(argon2: &Argon2<'_>, password: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    argon2
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| anyhow!("hashing password: {err}"))
}

/// A throwaway hash with the same cost as the configured ones. `None` when
/// no users are configured, since every login fails the same way then.
fn decoy_hash(users: &HashMap<String, String>) -> Option<String> {
    if users.is_empty() {
        return None;
    }
    let argon2 = users
        .values()
        .find_map(|hash| {
            let parsed = PasswordHash::new(hash).ok()?;
            let algorithm = Algorithm::try_from(parsed.algorithm).ok()?;
            let params = Params::try_from(&parsed).ok()?;
            Some(Argon2::new(algorithm, Version::V0x13, params))
        })
        .unwrap_or_default();
    match hash_with(&argon2, &random_token_hex(TOKEN_BYTES)) {
        Ok(hash) => Some(hash),
        Err(err) => {
            warn!(error = %err, "could not prepare decoy password hash");
            None
        }
    }
}

fn verify_password(hash: &str, password: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        warn!("configured password hash is not a valid PHC string");
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

fn random_token_hex(bytes: usize) -> String {
    let mut buf = vec![0_u8; bytes];
    rand::rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

fn token_key(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

fn is_well_formed(token: &str) -> bool {
    !token.is_empty() && token.len() <= 256 && token.chars().all(|c| c.is_ascii_graphic())
}


#[cfg(test)]
mod tests {
    use super::testing::cheap_hash;
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    fn store(ttl: Option<Duration>) -> TokenStore<MemoryTokenBackend> {
        let users = vec![
            UserEntry {
                name: "a".to_string(),
                password_hash: cheap_hash("secret"),
            },
            UserEntry {
                name: "b".to_string(),
                password_hash: cheap_hash("other"),
            },
        ];
        TokenStore::new(MemoryTokenBackend::new(), &users, ttl)
    }

    fn credentials(name: &str, password: &str) -> Credentials {
        Credentials {
            name: name.to_string(),
            password: password.to_string(),
        }
    }

    #[tokio::test]
    async fn login_then_lookup_round_trip() {
        let store = store(None);
        let token = store.authenticate(&credentials("a", "secret")).await.unwrap();

        assert_eq!(token.len(), TOKEN_BYTES * 2);
        assert_eq!(store.find_by_token(&token).await.unwrap(), "a");
        assert!(matches!(
            store.find_by_token("garbage").await,
            Err(ProxyError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn every_login_mints_a_new_token() {
        let store = store(None);
        let first = store.authenticate(&credentials("a", "secret")).await.unwrap();
        let second = store.authenticate(&credentials("a", "secret")).await.unwrap();

        assert_ne!(first, second);
        assert_eq!(store.issued().await.unwrap(), 2);
        assert_eq!(store.find_by_token(&first).await.unwrap(), "a");
        assert_eq!(store.find_by_token(&second).await.unwrap(), "a");
    }

    #[tokio::test]
    async fn unknown_user_and_wrong_password_look_the_same() {
        let store = store(None);
        let wrong_password = store.authenticate(&credentials("a", "nope")).await.unwrap_err();
        let unknown_user = store.authenticate(&credentials("zed", "secret")).await.unwrap_err();

        assert!(matches!(wrong_password, ProxyError::Unauthorized));
        assert!(matches!(unknown_user, ProxyError::Unauthorized));
        assert_eq!(wrong_password.to_string(), unknown_user.to_string());
        assert_eq!(store.issued().await.unwrap(), 0);
    }

    #[test]
    fn unknown_users_are_checked_against_a_decoy_of_equal_cost() {
        let store = store(None);
        let decoy = store.decoy.as_deref().unwrap();
        let decoy = PasswordHash::new(decoy).unwrap();
        let configured = PasswordHash::new(&store.users["a"]).unwrap();

        assert_eq!(decoy.algorithm, configured.algorithm);
        assert_eq!(
            Params::try_from(&decoy).unwrap(),
            Params::try_from(&configured).unwrap()
        );
        assert!(!verify_password(decoy.to_string().as_str(), "secret"));
    }

    #[test]
    fn no_users_means_no_decoy() {
        let store = TokenStore::new(MemoryTokenBackend::new(), &[], None);
        assert!(store.decoy.is_none());
    }

    #[tokio::test]
    async fn password_of_another_user_is_rejected() {
        let store = store(None);
        assert!(store.authenticate(&credentials("a", "other")).await.is_err());
        let token = store.authenticate(&credentials("b", "other")).await.unwrap();
        assert_eq!(store.find_by_token(&token).await.unwrap(), "b");
    }

    #[tokio::test]
    async fn malformed_tokens_are_invalid() {
        let store = store(None);
        let oversized = "x".repeat(300);
        for token in ["", "has space", "tab\there", oversized.as_str()] {
            assert!(matches!(
                store.find_by_token(token).await,
                Err(ProxyError::Unauthorized)
            ));
        }
    }

    #[tokio::test]
    async fn revoked_token_stops_resolving() {
        let store = store(None);
        let token = assert_ok!(store.authenticate(&credentials("a", "secret")).await);

        assert!(assert_ok!(store.revoke(&token).await));
        assert!(!assert_ok!(store.revoke(&token).await));
        assert_err!(store.find_by_token(&token).await);
    }

    #[tokio::test]
    async fn expired_token_is_invalid_and_purged() {
        let store = store(Some(Duration::from_millis(20)));
        let token = store.authenticate(&credentials("a", "secret")).await.unwrap();
        assert_eq!(store.find_by_token(&token).await.unwrap(), "a");

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(matches!(
            store.find_by_token(&token).await,
            Err(ProxyError::Unauthorized)
        ));
        assert_eq!(store.issued().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn concurrent_logins_get_distinct_tokens() {
        let store = std::sync::Arc::new(store(None));
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let store = std::sync::Arc::clone(&store);
                tokio::spawn(async move { store.authenticate(&credentials("a", "secret")).await })
            })
            .collect();

        let mut tokens = std::collections::HashSet::new();
        for task in tasks {
            tokens.insert(task.await.unwrap().unwrap());
        }
        assert_eq!(tokens.len(), 8);
        assert_eq!(store.issued().await.unwrap(), 8);
    }

    #[test]
    fn credentials_accept_short_aliases() {
        let parsed: Credentials =
            serde_json::from_str(r#"{"user":"a","pass":"secret"}"#).unwrap();
        assert_eq!(parsed.name, "a");
        let parsed: Credentials = serde_json::from_str(
            r#"{"_id":"org.couchdb.user:a","name":"a","password":"secret","type":"user"}"#,
        )
        .unwrap();
        assert_eq!(parsed.password, "secret");
    }

    #[test]
    fn hash_password_produces_verifiable_phc() {
        let hash = cheap_hash("hunter2");
        assert!(hash.starts_with("$argon2id$"));
        assert!(verify_password(&hash, "hunter2"));
        assert!(!verify_password(&hash, "hunter3"));
        assert!(!verify_password("not-a-phc", "hunter2"));
    }

    #[tokio::test]
    async fn tokens_survive_reopening_redb_backend() {
        let dir = tempfile::tempdir().unwrap();
        let config = AuthConfig {
            tokens_path: Some(dir.path().join("state/tokens.redb")),
            token_ttl_secs: None,
            users: vec![UserEntry {
                name: "a".to_string(),
                password_hash: cheap_hash("secret"),
            }],
        };

        let token = {
            let backend = open_backend(&config).unwrap();
            assert_eq!(backend.kind(), "redb");
            let store = TokenStore::new(backend, &config.users, None);
            store.authenticate(&credentials("a", "secret")).await.unwrap()
        };

        let store = TokenStore::new(open_backend(&config).unwrap(), &config.users, None);
        assert_eq!(store.find_by_token(&token).await.unwrap(), "a");
    }

    #[test]
    fn default_backend_is_memory() {
        let backend = open_backend(&AuthConfig::default()).unwrap();
        assert_eq!(backend.kind(), "memory");
    }

    #[test]
    fn token_key_is_sha256_hex() {
        let key = token_key("abc");
        assert_eq!(
            key,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
