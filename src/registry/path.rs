use percent_encoding::percent_decode_str;

/// A registry path addressed by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryPath {
    /// `/lodash`, `/@types/node`, `/@types%2fnode`
    Package { name: String },
    /// `/lodash/-/lodash-4.17.21.tgz`, `/@types/node/-/node-18.0.0.tgz`
    Tarball { name: String, filename: String },
}

impl RegistryPath {
    pub fn from_path(path: &str) -> Option<Self> {
        let trimmed = path.trim_start_matches('/');
        if trimmed.is_empty() {
            return None;
        }

        // %40 -> @, %2f -> /
        let decoded = percent_decode_str(trimmed).decode_utf8().ok()?;
        let decoded = decoded.trim_start_matches('/');
        if decoded.is_empty() || decoded.contains('\\') {
            return None;
        }

        match decoded.split_once("/-/") {
            Some((name_part, filename)) => {
                let name = parse_package_name(name_part)?;
                if !is_valid_tarball_name(filename) {
                    return None;
                }
                Some(Self::Tarball {
                    name,
                    filename: filename.to_string(),
                })
            }
            None => parse_package_name(decoded).map(|name| Self::Package { name }),
        }
    }
}

fn parse_package_name(raw: &str) -> Option<String> {
    if raw.split('/').any(|segment| segment.is_empty() || segment == "." || segment == "..") {
        return None;
    }
    is_valid_package_name(raw).then(|| raw.to_string())
}

/// Validates a full package name, scoped or not.
pub fn is_valid_package_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 214 {
        return false;
    }

    match name.strip_prefix('@') {
        Some(scoped) => match scoped.split_once('/') {
            Some((scope, pkg)) => is_valid_name_component(scope) && is_valid_name_component(pkg),
            None => false,
        },
        None => is_valid_name_component(name),
    }
}

fn is_valid_name_component(component: &str) -> bool {
    !component.is_empty()
        && !component.starts_with('.')
        && !component.starts_with('_')
        && component
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '~'))
}

pub fn is_valid_tarball_name(name: &str) -> bool {
    name.len() > ".tgz".len()
        && name.ends_with(".tgz")
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '+'))
}

/// Relative storage location of a cached tarball: `tarballs/{name}/{filename}`.
pub fn tarball_storage_path(name: &str, filename: &str) -> String {
    format!(
        "tarballs/{}/{}",
        sanitize_segment(name),
        sanitize_segment(filename)
    )
}

fn sanitize_segment(input: &str) -> String {
    let sanitized: String = input
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@' | '+') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if sanitized.is_empty() || sanitized.chars().all(|c| c == '.') {
        "artifact".to_string()
    } else {
        sanitized
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn package(name: &str) -> Option<RegistryPath> {
        Some(RegistryPath::Package {
            name: name.to_string(),
        })
    }

    fn tarball(name: &str, filename: &str) -> Option<RegistryPath> {
        Some(RegistryPath::Tarball {
            name: name.to_string(),
            filename: filename.to_string(),
        })
    }

    #[test]
    fn parses_unscoped_package() {
        assert_eq!(RegistryPath::from_path("/lodash"), package("lodash"));
    }

    #[test]
    fn parses_scoped_package() {
        assert_eq!(RegistryPath::from_path("/@types/node"), package("@types/node"));
    }

    #[test]
    fn parses_encoded_scoped_package() {
        assert_eq!(RegistryPath::from_path("/@types%2fnode"), package("@types/node"));
        assert_eq!(RegistryPath::from_path("/%40types%2Fnode"), package("@types/node"));
    }

    #[test]
    fn parses_unscoped_tarball() {
        assert_eq!(
            RegistryPath::from_path("/lodash/-/lodash-4.17.21.tgz"),
            tarball("lodash", "lodash-4.17.21.tgz")
        );
    }

    #[test]
    fn parses_scoped_tarball() {
        assert_eq!(
            RegistryPath::from_path("/@types/node/-/node-18.0.0.tgz"),
            tarball("@types/node", "node-18.0.0.tgz")
        );
    }

    #[test]
    fn tarball_filename_need_not_match_package() {
        // Upstream decides what exists; the proxy only vets the shape.
        assert_eq!(
            RegistryPath::from_path("/pkg/-/pkg-1.0.0-beta+build.1.tgz"),
            tarball("pkg", "pkg-1.0.0-beta+build.1.tgz")
        );
    }

    #[test]
    fn rejects_path_traversal() {
        assert!(RegistryPath::from_path("/../etc/passwd").is_none());
        assert!(RegistryPath::from_path("/foo/../bar").is_none());
        assert!(RegistryPath::from_path("/..%2fetc/passwd").is_none());
        assert!(RegistryPath::from_path("/%2e%2e/secret").is_none());
        assert!(RegistryPath::from_path("/pkg/-/..%2f..%2fsecret.tgz").is_none());
        assert!(RegistryPath::from_path("/pkg%5c..%5csecret").is_none());
    }

    #[test]
    fn rejects_unscoped_extra_segments() {
        assert!(RegistryPath::from_path("/lodash/4.17.21").is_none());
        assert!(RegistryPath::from_path("/@scope").is_none());
        assert!(RegistryPath::from_path("/@scope/name/extra").is_none());
    }

    #[test]
    fn rejects_non_tgz_tarball() {
        assert!(RegistryPath::from_path("/lodash/-/lodash.zip").is_none());
        assert!(RegistryPath::from_path("/lodash/-/.tgz").is_none());
    }

    #[test]
    fn rejects_empty() {
        assert!(RegistryPath::from_path("/").is_none());
        assert!(RegistryPath::from_path("").is_none());
    }

    #[test]
    fn package_name_rules() {
        assert!(is_valid_package_name("left-pad"));
        assert!(is_valid_package_name("@angular/core"));
        assert!(!is_valid_package_name("_private"));
        assert!(!is_valid_package_name(".hidden"));
        assert!(!is_valid_package_name("@/core"));
        assert!(!is_valid_package_name("with space"));
        assert!(!is_valid_package_name(&"a".repeat(215)));
    }

    #[test]
    fn storage_path_flattens_scope() {
        assert_eq!(
            tarball_storage_path("@types/node", "node-18.0.0.tgz"),
            "tarballs/@types_node/node-18.0.0.tgz"
        );
        assert_eq!(
            tarball_storage_path("lodash", "lodash-4.17.21.tgz"),
            "tarballs/lodash/lodash-4.17.21.tgz"
        );
    }

    #[test]
    fn storage_path_neutralizes_dot_segments() {
        assert_eq!(tarball_storage_path("..", ".."), "tarballs/artifact/artifact");
    }
}
