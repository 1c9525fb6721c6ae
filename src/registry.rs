//! npm registry data model and request path grammar.
//!
//! Handles both scoped (`@org/package`) and unscoped packages.

mod document;
mod path;

pub use document::{Dist, PackageDocument, PackageMetadata, VersionDescriptor};
pub use path::{RegistryPath, is_valid_package_name, is_valid_tarball_name, tarball_storage_path};
