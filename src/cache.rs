mod coalesce;
mod metadata;
mod tarball;

pub use metadata::{MetadataCache, PackageLookup};
pub use tarball::{Tarball, TarballCache, TarballLookup};
