use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// redb file holding issued tokens. Tokens live in memory when unset.
    #[serde(default)]
    pub tokens_path: Option<PathBuf>,
    /// Token lifetime. Tokens never expire when unset.
    #[serde(default)]
    pub token_ttl_secs: Option<u64>,
    #[serde(default)]
    pub users: Vec<UserEntry>,
}

impl AuthConfig {
    pub fn normalize_paths(&mut self, base_dir: &Path) {
        if let Some(path) = self.tokens_path.as_mut()
            && path.is_relative()
        {
            *path = base_dir.join(&*path);
        }
    }

    pub fn token_ttl(&self) -> Option<Duration> {
        self.token_ttl_secs.map(Duration::from_secs)
    }
}

/// A user allowed to log in. `password_hash` is an Argon2 PHC string,
/// as printed by `elephant hash-password`.
#[derive(Debug, Clone, Deserialize)]
pub struct UserEntry {
    pub name: String,
    pub password_hash: String,
}
