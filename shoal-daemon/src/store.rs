//! Disk-backed file store: share-directory index, staged loaders with an
//! incrementally-fed content hash, shortcut completion, and the rescan
//! that produces filesystem events.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use md5::{Digest, Md5};
use parking_lot::{Mutex, RwLock};
use shoal_core::protocol::FileDescriptor;
use shoal_core::store::{FileStore, FileSystemEvent, StoreError};
use tracing::{debug, warn};

/// Name of the staging directory inside the share root. Skipped by the
/// scanner; never a sync target.
const STAGING_DIR: &str = ".shoal";

#[derive(Default, Clone)]
struct Index {
    files: HashMap<String, FileDescriptor>,
    dirs: HashSet<String>,
}

/// An in-progress inbound file. Bytes accumulate in a staging file until
/// the content matches the advertised hash, then the file is promoted
/// into place.
struct Loader {
    descriptor: FileDescriptor,
    staging: PathBuf,
    /// Sorted, non-overlapping byte ranges written so far.
    written: Vec<(u64, u64)>,
    /// Running hash over the contiguous prefix `[0, hashed)`.
    hasher: Md5,
    hashed: u64,
    /// Expected size when known (create); modify loaders finish purely on
    /// a hash match.
    expected_size: Option<u64>,
    promoted: bool,
}

impl Loader {
    fn record(&mut self, start: u64, len: u64) {
        if len == 0 {
            return;
        }
        self.written.push((start, start + len));
        self.written.sort_unstable();
        let mut merged: Vec<(u64, u64)> = Vec::with_capacity(self.written.len());
        for &(start, end) in &self.written {
            match merged.last_mut() {
                Some(last) if start <= last.1 => last.1 = last.1.max(end),
                _ => merged.push((start, end)),
            }
        }
        self.written = merged;
    }

    /// Length of the contiguous prefix received so far.
    fn prefix_len(&self) -> u64 {
        match self.written.first() {
            Some(&(0, end)) => end,
            _ => 0,
        }
    }

    /// Feed the running hash as the contiguous prefix grows.
    fn extend_hash(&mut self) -> io::Result<()> {
        let prefix = self.prefix_len();
        if prefix <= self.hashed {
            return Ok(());
        }
        let mut file = fs::File::open(&self.staging)?;
        file.seek(SeekFrom::Start(self.hashed))?;
        let mut remaining = prefix - self.hashed;
        let mut buf = [0u8; 64 * 1024];
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let n = file.read(&mut buf[..want])?;
            if n == 0 {
                break;
            }
            self.hasher.update(&buf[..n]);
            self.hashed += n as u64;
            remaining -= n as u64;
        }
        Ok(())
    }

    /// Whether the bytes received so far are the advertised content.
    fn content_matches(&self) -> bool {
        if let Some(size) = self.expected_size {
            if self.prefix_len() < size {
                return false;
            }
        }
        self.hashed == self.prefix_len()
            && hex::encode(self.hasher.clone().finalize()) == self.descriptor.md5
    }
}

/// Share-directory store. The index mirrors what is on disk; loaders
/// stage inbound transfers under `.shoal/`.
pub struct DiskStore {
    root: PathBuf,
    index: RwLock<Index>,
    loaders: Mutex<HashMap<String, Loader>>,
}

impl DiskStore {
    /// Open a store rooted at `root`, creating the root and the staging
    /// directory, and index the existing tree.
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(STAGING_DIR))?;
        let store = Self {
            root,
            index: RwLock::new(Index::default()),
            loaders: Mutex::new(HashMap::new()),
        };
        let mut index = Index::default();
        store.walk(&store.root, &HashMap::new(), &mut index)?;
        *store.index.write() = index;
        Ok(store)
    }

    /// Rescan the share directory and report what changed since the last
    /// scan (or construction), updating the index along the way.
    pub fn scan(&self) -> Result<Vec<FileSystemEvent>, StoreError> {
        let previous = self.index.read().clone();
        let mut fresh = Index::default();
        self.walk(&self.root, &previous.files, &mut fresh)?;

        let mut events = Vec::new();
        // Directories first so file events land in already-created
        // directories downstream.
        for dir in &fresh.dirs {
            if !previous.dirs.contains(dir) {
                events.push(FileSystemEvent::DirectoryCreate { path: dir.clone() });
            }
        }
        for (path, descriptor) in &fresh.files {
            match previous.files.get(path) {
                None => events.push(FileSystemEvent::FileCreate {
                    path: path.clone(),
                    descriptor: descriptor.clone(),
                }),
                Some(old) if old.md5 != descriptor.md5 => {
                    events.push(FileSystemEvent::FileModify {
                        path: path.clone(),
                        descriptor: descriptor.clone(),
                    })
                }
                Some(_) => {}
            }
        }
        for (path, descriptor) in &previous.files {
            if !fresh.files.contains_key(path) {
                events.push(FileSystemEvent::FileDelete {
                    path: path.clone(),
                    descriptor: descriptor.clone(),
                });
            }
        }
        for dir in &previous.dirs {
            if !fresh.dirs.contains(dir) {
                events.push(FileSystemEvent::DirectoryDelete { path: dir.clone() });
            }
        }

        *self.index.write() = fresh;
        Ok(events)
    }

    fn walk(
        &self,
        dir: &Path,
        previous: &HashMap<String, FileDescriptor>,
        out: &mut Index,
    ) -> io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let Some(rel) = self.relative_name(&path) else {
                continue;
            };
            if rel == STAGING_DIR {
                continue;
            }
            let meta = entry.metadata()?;
            if meta.is_dir() {
                out.dirs.insert(rel);
                self.walk(&path, previous, out)?;
            } else if meta.is_file() {
                match describe_file(&path, &meta, previous.get(&rel)) {
                    Ok(descriptor) => {
                        out.files.insert(rel, descriptor);
                    }
                    Err(err) => warn!(path = %path.display(), %err, "skipping unreadable file"),
                }
            }
        }
        Ok(())
    }

    fn relative_name(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<String> = rel
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("/"))
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    /// Staging file for a loader; the name is a hash of the path so
    /// nested sync paths never need directories under `.shoal/`.
    fn staging_path(&self, path: &str) -> PathBuf {
        let name = hex::encode(Md5::digest(path.as_bytes()));
        self.root.join(STAGING_DIR).join(name)
    }

    fn open_loader(
        &self,
        path: &str,
        descriptor: FileDescriptor,
        expected_size: Option<u64>,
    ) -> Result<(), StoreError> {
        let staging = self.staging_path(path);
        // Truncate anything left behind by an aborted transfer.
        fs::File::create(&staging)?;
        self.loaders.lock().insert(
            path.to_string(),
            Loader {
                descriptor,
                staging,
                written: Vec::new(),
                hasher: Md5::new(),
                hashed: 0,
                expected_size,
                promoted: false,
            },
        );
        debug!(path = %path, "file loader opened");
        Ok(())
    }
}

impl FileStore for DiskStore {
    fn is_safe_path_name(&self, path: &str) -> bool {
        if path.is_empty() {
            return false;
        }
        let normal_only = Path::new(path)
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        normal_only && path != STAGING_DIR && !path.starts_with(".shoal/")
    }

    fn file_name_exists(&self, path: &str) -> bool {
        self.index.read().files.contains_key(path)
    }

    fn file_matches(&self, path: &str, md5: &str) -> bool {
        self.index
            .read()
            .files
            .get(path)
            .is_some_and(|fd| fd.md5 == md5)
    }

    fn dir_name_exists(&self, path: &str) -> bool {
        self.index.read().dirs.contains(path)
    }

    fn create_file_loader(
        &self,
        path: &str,
        descriptor: &FileDescriptor,
    ) -> Result<(), StoreError> {
        let expected = descriptor.file_size;
        self.open_loader(path, descriptor.clone(), Some(expected))
    }

    fn modify_file_loader(
        &self,
        path: &str,
        md5: &str,
        last_modified: i64,
    ) -> Result<bool, StoreError> {
        let existing = match self.index.read().files.get(path) {
            Some(fd) => fd.clone(),
            None => return Ok(false),
        };
        if existing.last_modified > last_modified {
            return Ok(false);
        }
        let descriptor = FileDescriptor {
            md5: md5.to_string(),
            last_modified,
            file_size: existing.file_size,
        };
        // The incoming size is unknown here; the loader finishes when the
        // content hash matches.
        self.open_loader(path, descriptor, None)?;
        Ok(true)
    }

    fn check_shortcut(&self, path: &str) -> Result<bool, StoreError> {
        let mut loaders = self.loaders.lock();
        let loader = loaders.get(path).ok_or_else(|| StoreError::NoLoader {
            path: path.to_string(),
        })?;
        let source = self
            .index
            .read()
            .files
            .iter()
            .find(|(_, fd)| fd.md5 == loader.descriptor.md5)
            .map(|(source, _)| source.clone());
        let Some(source) = source else {
            return Ok(false);
        };
        let target = self.resolve(path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(self.resolve(&source), &target)?;
        let descriptor = loader.descriptor.clone();
        let staging = loader.staging.clone();
        loaders.remove(path);
        let _ = fs::remove_file(staging);
        self.index.write().files.insert(path.to_string(), descriptor);
        debug!(path = %path, from = %source, "loader completed by local shortcut");
        Ok(true)
    }

    fn write_file(&self, path: &str, bytes: &[u8], position: u64) -> Result<(), StoreError> {
        let mut loaders = self.loaders.lock();
        let loader = loaders.get_mut(path).ok_or_else(|| StoreError::NoLoader {
            path: path.to_string(),
        })?;
        let mut file = fs::OpenOptions::new().write(true).open(&loader.staging)?;
        file.seek(SeekFrom::Start(position))?;
        file.write_all(bytes)?;
        loader.record(position, bytes.len() as u64);
        loader.extend_hash()?;
        Ok(())
    }

    fn check_write_complete(&self, path: &str) -> Result<bool, StoreError> {
        let mut loaders = self.loaders.lock();
        let loader = loaders.get_mut(path).ok_or_else(|| StoreError::NoLoader {
            path: path.to_string(),
        })?;
        if loader.promoted {
            return Ok(true);
        }
        if !loader.content_matches() {
            return Ok(false);
        }
        let target = self.resolve(path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&loader.staging, &target)?;
        loader.promoted = true;
        let descriptor = FileDescriptor {
            file_size: loader.prefix_len(),
            ..loader.descriptor.clone()
        };
        self.index.write().files.insert(path.to_string(), descriptor);
        debug!(path = %path, "transfer complete, file promoted");
        Ok(true)
    }

    fn cancel_file_loader(&self, path: &str) -> Result<(), StoreError> {
        let Some(loader) = self.loaders.lock().remove(path) else {
            return Ok(());
        };
        if !loader.promoted {
            let _ = fs::remove_file(&loader.staging);
            debug!(path = %path, "file loader abandoned");
        }
        Ok(())
    }

    fn read_file(&self, md5: &str, position: u64, length: u64) -> Result<Vec<u8>, StoreError> {
        let source = self
            .index
            .read()
            .files
            .iter()
            .find(|(_, fd)| fd.md5 == md5)
            .map(|(path, _)| path.clone());
        let source = source.ok_or_else(|| StoreError::UnknownContent {
            md5: md5.to_string(),
        })?;
        let mut file = fs::File::open(self.resolve(&source))?;
        file.seek(SeekFrom::Start(position))?;
        let mut buf = vec![0u8; length as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn delete_file(&self, path: &str, last_modified: i64, md5: &str) -> bool {
        let mut index = self.index.write();
        match index.files.get(path) {
            Some(fd) if fd.md5 == md5 && fd.last_modified <= last_modified => {}
            _ => return false,
        }
        if fs::remove_file(self.resolve(path)).is_err() {
            return false;
        }
        index.files.remove(path);
        true
    }

    fn make_directory(&self, path: &str) -> bool {
        if fs::create_dir_all(self.resolve(path)).is_err() {
            return false;
        }
        self.index.write().dirs.insert(path.to_string());
        true
    }

    fn delete_directory(&self, path: &str) -> bool {
        if fs::remove_dir(self.resolve(path)).is_err() {
            return false;
        }
        self.index.write().dirs.remove(path);
        true
    }
}

fn describe_file(
    path: &Path,
    meta: &fs::Metadata,
    previous: Option<&FileDescriptor>,
) -> io::Result<FileDescriptor> {
    let last_modified = meta
        .modified()?
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    let file_size = meta.len();
    // Unchanged size and mtime: trust the previous hash instead of
    // re-reading the whole file every scan.
    if let Some(prev) = previous {
        if prev.file_size == file_size && prev.last_modified == last_modified {
            return Ok(prev.clone());
        }
    }
    let md5 = hash_file(path)?;
    Ok(FileDescriptor {
        md5,
        last_modified,
        file_size,
    })
}

fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Md5::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
