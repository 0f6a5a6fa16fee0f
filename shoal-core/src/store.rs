//! Contract the protocol engine assumes from the filesystem manager.

use thiserror::Error;

use crate::protocol::FileDescriptor;

/// Failure inside the store itself. Fatal for the session that hit it.
/// Application-level refusals (unsafe path, stale version, missing file)
/// are `bool` returns on the trait, not errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no local file with content {md5}")]
    UnknownContent { md5: String },
    #[error("no loader open for {path}")]
    NoLoader { path: String },
}

/// The filesystem manager as seen by the protocol engine: safe-path
/// checks, existence queries, loader lifecycle, chunked I/O and directory
/// operations. Persistence, content hashing and conflict detection all
/// live behind this trait.
pub trait FileStore: Send + Sync {
    /// Rejects names that would escape the share root.
    fn is_safe_path_name(&self, path: &str) -> bool;

    /// Name present, any content.
    fn file_name_exists(&self, path: &str) -> bool;

    /// Name present with exactly this content.
    fn file_matches(&self, path: &str, md5: &str) -> bool;

    fn dir_name_exists(&self, path: &str) -> bool;

    /// Open a staging slot for an incoming file.
    fn create_file_loader(&self, path: &str, descriptor: &FileDescriptor)
        -> Result<(), StoreError>;

    /// Open staging for an overwrite. `false` when there is nothing to
    /// overwrite or the on-disk version is newer.
    fn modify_file_loader(
        &self,
        path: &str,
        md5: &str,
        last_modified: i64,
    ) -> Result<bool, StoreError>;

    /// Complete the loader from a local file that already has the target
    /// content, skipping the transfer. `true` on shortcut success.
    fn check_shortcut(&self, path: &str) -> Result<bool, StoreError>;

    /// Write one chunk into the loader.
    fn write_file(&self, path: &str, bytes: &[u8], position: u64) -> Result<(), StoreError>;

    /// Whether the loader has received every byte and the content checks
    /// out against the advertised hash.
    fn check_write_complete(&self, path: &str) -> Result<bool, StoreError>;

    /// Finalize or abandon the loader.
    fn cancel_file_loader(&self, path: &str) -> Result<(), StoreError>;

    /// Read bytes out of a known local file version.
    fn read_file(&self, md5: &str, position: u64, length: u64) -> Result<Vec<u8>, StoreError>;

    /// Delete iff hash and timestamp match.
    fn delete_file(&self, path: &str, last_modified: i64, md5: &str) -> bool;

    fn make_directory(&self, path: &str) -> bool;

    fn delete_directory(&self, path: &str) -> bool;
}

/// A local share-directory change, as produced by the watcher. The node
/// fans each event out to every handshake-completed session as one
/// protocol request.
#[derive(Debug, Clone)]
pub enum FileSystemEvent {
    FileCreate {
        path: String,
        descriptor: FileDescriptor,
    },
    FileModify {
        path: String,
        descriptor: FileDescriptor,
    },
    FileDelete {
        path: String,
        descriptor: FileDescriptor,
    },
    DirectoryCreate {
        path: String,
    },
    DirectoryDelete {
        path: String,
    },
}
