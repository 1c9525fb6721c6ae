use super::*;
use std::io::Write;
use tempfile::{NamedTempFile, tempdir};

const ALICE_HASH: &str =
    "$argon2id$v=19$m=19456,t=2,p=1$c29tZXNhbHRzb21lc2FsdA$3Gl0kqSIqRYmf4OzmJ7oHjN3p4b7bYl1rnUqeGUSGv0";

// === DEFAULT VALUE TESTS ===

#[test]
fn test_default_config() {
    let config = Config::default();
    assert_eq!(config.server.host, "0.0.0.0");
    assert_eq!(config.server.port, 4873);
    assert_eq!(config.server.workers, num_cpus::get());
    assert!(config.server.public_host.is_none());
    assert_eq!(config.upstream.url.as_str(), "https://registry.npmjs.org/");
    assert_eq!(config.upstream.timeout_secs, 30);
    assert!(config.upstream.circuit_breaker);
    assert_eq!(config.cache.package_max_age_secs, 300);
    assert_eq!(config.cache.tarball_max_age_secs, 86_400);
    assert!(!config.cache.stale_if_error);
    assert_eq!(config.storage.path, PathBuf::from("./storage"));
    assert!(config.auth.tokens_path.is_none());
    assert!(config.auth.token_ttl_secs.is_none());
    assert!(config.auth.users.is_empty());
    assert_eq!(config.logging.level, "info");
    assert!(!config.logging.json);
}

#[test]
fn test_upstream_authority() {
    let upstream = UpstreamConfig::default();
    assert_eq!(upstream.authority(), "registry.npmjs.org");

    let toml = r#"
        [upstream]
        url = "http://localhost:8080/npm/"
    "#;
    let config = Config::from_toml(toml).unwrap();
    assert_eq!(config.upstream.authority(), "localhost:8080");
}

#[test]
fn test_cache_control_values() {
    let cache = CacheConfig::default();
    assert_eq!(cache.package_cache_control(), "public, max-age=300");
    assert_eq!(cache.tarball_cache_control(), "public, max-age=86400");
    assert_eq!(cache.package_max_age().as_secs(), 300);
}

#[test]
fn test_fallback_public_host() {
    let mut server = ServerConfig::default();
    assert_eq!(server.fallback_public_host(), "0.0.0.0:4873");
    server.public_host = Some("npm.internal.example".to_string());
    assert_eq!(server.fallback_public_host(), "npm.internal.example");
}

// === TOML PARSING TESTS ===

#[test]
fn test_parse_full_config() {
    let toml = format!(
        r#"
        [server]
        host = "127.0.0.1"
        port = 8080
        workers = 2
        public_host = "npm.example.com"

        [upstream]
        url = "https://registry.example.org/"
        timeout_secs = 5
        circuit_breaker = false

        [cache]
        package_max_age_secs = 60
        tarball_max_age_secs = 3600
        stale_if_error = true

        [storage]
        path = "/var/lib/elephant"

        [auth]
        tokens_path = "/var/lib/elephant/tokens.redb"
        token_ttl_secs = 86400

        [[auth.users]]
        name = "alice"
        password_hash = "{ALICE_HASH}"

        [logging]
        level = "debug"
        json = true
    "#
    );
    let config = Config::from_toml(&toml).unwrap();
    assert_eq!(config.server.bind_addr(), "127.0.0.1:8080");
    assert_eq!(config.server.workers, 2);
    assert_eq!(config.upstream.authority(), "registry.example.org");
    assert_eq!(config.upstream.timeout().as_secs(), 5);
    assert!(!config.upstream.circuit_breaker);
    assert_eq!(config.cache.package_max_age_secs, 60);
    assert!(config.cache.stale_if_error);
    assert_eq!(config.storage.path, PathBuf::from("/var/lib/elephant"));
    assert_eq!(config.auth.token_ttl().map(|d| d.as_secs()), Some(86_400));
    assert_eq!(config.auth.users.len(), 1);
    assert_eq!(config.auth.users[0].name, "alice");
    assert!(config.logging.json);
    config.validate().unwrap();
}

#[test]
fn test_parse_invalid_toml() {
    assert!(Config::from_toml("[server\nport = 1").is_err());
}

#[test]
fn test_parse_invalid_upstream_url() {
    let toml = r#"
        [upstream]
        url = "not a url"
    "#;
    assert!(Config::from_toml(toml).is_err());
}

// === VALIDATION TESTS ===

#[test]
fn test_validate_default_config() {
    Config::default().validate().unwrap();
}

#[test]
fn test_validate_rejects_unsupported_scheme() {
    let toml = r#"
        [upstream]
        url = "ftp://registry.example.org/"
    "#;
    let config = Config::from_toml(toml).unwrap();
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("unsupported upstream scheme"));
}

#[test]
fn test_validate_rejects_zero_timeout() {
    let mut config = Config::default();
    config.upstream.timeout_secs = 0;
    assert!(config.validate().is_err());
}

#[test]
fn test_validate_rejects_duplicate_users() {
    let mut config = Config::default();
    for _ in 0..2 {
        config.auth.users.push(UserEntry {
            name: "alice".to_string(),
            password_hash: ALICE_HASH.to_string(),
        });
    }
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("duplicate auth user"));
}

#[test]
fn test_validate_rejects_plaintext_password() {
    let mut config = Config::default();
    config.auth.users.push(UserEntry {
        name: "alice".to_string(),
        password_hash: "hunter2".to_string(),
    });
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("invalid password_hash"));
}

// === LOADING TESTS ===

#[test]
fn test_load_resolves_relative_paths_against_config_dir() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("elephant.toml");
    std::fs::write(
        &path,
        r#"
        [storage]
        path = "cache"

        [auth]
        tokens_path = "state/tokens.redb"
    "#,
    )
    .unwrap();

    let config = Config::load(Some(path)).unwrap();
    assert_eq!(config.storage.path, dir.path().join("cache"));
    assert_eq!(
        config.auth.tokens_path,
        Some(dir.path().join("state/tokens.redb"))
    );
}

#[test]
fn test_load_keeps_absolute_paths() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "[storage]\npath = \"/srv/elephant\"").unwrap();

    let config = Config::load(Some(file.path().to_path_buf())).unwrap();
    assert_eq!(config.storage.path, PathBuf::from("/srv/elephant"));
}

#[test]
fn test_load_missing_file_uses_defaults() {
    let dir = tempdir().unwrap();
    let config = Config::load(Some(dir.path().join("absent.toml"))).unwrap();
    assert_eq!(config.server.port, 4873);
    assert!(config.storage.path.is_absolute());
}

#[test]
fn test_load_reports_invalid_file() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "[cache]\npackage_max_age_secs = \"soon\"").unwrap();

    let err = Config::load(Some(file.path().to_path_buf())).unwrap_err();
    assert!(format!("{err:#}").contains("invalid config"));
}
