mod storage;
mod tokens;

pub use storage::{FileHandle, FilesystemStorage, TempFile};
pub use tokens::{
    AnyTokenBackend, MemoryTokenBackend, RedbTokenBackend, TokenBackend, TokenRecord,
};
