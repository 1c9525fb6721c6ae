use std::time::Instant;

use rama::http::{Body, Method, Request};

use crate::registry::RegistryPath;

/// How a request was answered, for the access log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Pass,
    Fresh,
    NotModified,
    NotFound,
    Error,
}

impl std::fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheStatus::Pass => write!(f, "pass"),
            CacheStatus::Fresh => write!(f, "fresh"),
            CacheStatus::NotModified => write!(f, "not-modified"),
            CacheStatus::NotFound => write!(f, "not-found"),
            CacheStatus::Error => write!(f, "error"),
        }
    }
}

/// Request context for tracking request lifecycle
pub struct RequestContext {
    pub start: Instant,
    pub method: Method,
    pub path: String,
    pub cache: CacheStatus,
    pub user: Option<String>,
}

impl RequestContext {
    pub fn from_request(req: &Request<Body>) -> Self {
        Self {
            start: Instant::now(),
            method: req.method().clone(),
            path: req.uri().path().to_string(),
            cache: CacheStatus::Pass,
            user: None,
        }
    }

    pub fn summary(&self) -> String {
        format!("{} {}", self.method.as_str(), self.path)
    }
}

/// A request resolved to one of the registry operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Homepage,
    Ping,
    Login,
    Whoami,
    Logout { token: String },
    Metadata { name: String },
    Tarball { name: String, filename: String },
    Publish { name: String },
    Unsupported,
}

impl Route {
    pub fn resolve(method: &Method, path: &str) -> Self {
        match (method, path) {
            (&Method::GET, "/") => return Self::Homepage,
            (&Method::GET, "/-/ping") => return Self::Ping,
            (&Method::GET, "/-/whoami") => return Self::Whoami,
            _ => {}
        }

        if let Some(token) = path.strip_prefix("/-/user/token/") {
            return match *method {
                Method::DELETE if !token.is_empty() => Self::Logout {
                    token: token.to_string(),
                },
                _ => Self::Unsupported,
            };
        }
        if let Some(user) = path.strip_prefix("/-/user/") {
            return match *method {
                Method::PUT if !user.is_empty() => Self::Login,
                _ => Self::Unsupported,
            };
        }
        if path.starts_with("/-/") {
            return Self::Unsupported;
        }

        match (method, RegistryPath::from_path(path)) {
            (&Method::GET, Some(RegistryPath::Package { name })) => Self::Metadata { name },
            (&Method::GET, Some(RegistryPath::Tarball { name, filename })) => {
                Self::Tarball { name, filename }
            }
            (&Method::PUT, Some(RegistryPath::Package { name })) => Self::Publish { name },
            _ => Self::Unsupported,
        }
    }

    /// Routes that need a resolved bearer token before anything else runs.
    pub fn requires_auth(&self) -> bool {
        matches!(
            self,
            Self::Whoami | Self::Logout { .. } | Self::Publish { .. }
        )
    }
}
