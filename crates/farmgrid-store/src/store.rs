//! Store — cached keyed access to a directory tree.
//!
//! Keys are sequences of path segments relative to the store root; the
//! empty key is the root directory. `Entry` values are cheap handles (key
//! plus the kind observed when the handle was made); the store owns every
//! cached listing and payload. Payloads come back as `Arc<Payload>` and are
//! immutable: to change one, build a new value and `write` it.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::{Mutex, RwLock};
use regex::Regex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::codec::{Codec, Payload};
use crate::error::{StoreError, StoreResult};
use crate::lock::{FileLock, LOCK_PREFIX};

/// Convert an io error on `path` into a `StoreError`, keeping "missing"
/// distinguishable.
fn io_err(path: &Path, e: std::io::Error) -> StoreError {
    match e.kind() {
        ErrorKind::NotFound => StoreError::NotFound(path.display().to_string()),
        _ => StoreError::Io(format!("{}: {e}", path.display())),
    }
}

fn display_key(path: &[String]) -> String {
    if path.is_empty() {
        "/".to_string()
    } else {
        path.join("/")
    }
}

/// What a key refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    File,
    /// Listed by a cached directory but gone from disk.
    Absent,
}

/// Handle to one key in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    path: Vec<String>,
    kind: EntryKind,
}

impl Entry {
    pub fn path(&self) -> &[String] {
        &self.path
    }

    /// Last path segment; `None` for the root.
    pub fn name(&self) -> Option<&str> {
        self.path.last().map(String::as_str)
    }

    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    /// Key of a child of this entry.
    pub fn child_path(&self, name: &str) -> Vec<String> {
        let mut path = self.path.clone();
        path.push(name.to_string());
        path
    }
}

/// Store tuning.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Skip cross-process lock markers; file I/O is serialised in-process
    /// instead.
    pub single_process: bool,
    /// How long a directory listing is trusted.
    pub dir_ttl: Duration,
    /// Age after which a lock marker is considered abandoned.
    pub lock_timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            single_process: false,
            dir_ttl: Duration::from_secs(30),
            lock_timeout: Duration::from_secs(30),
        }
    }
}

/// Modification stamp used to decide whether a cached payload is current.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Stamp {
    modified: SystemTime,
    len: u64,
}

impl Stamp {
    fn of(meta: &fs::Metadata) -> Self {
        Self {
            modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            len: meta.len(),
        }
    }
}

struct DirState {
    children: BTreeMap<String, EntryKind>,
    refreshed: Instant,
    /// suffix → whether this subtree holds a file with that suffix.
    contains_suffix: HashMap<String, bool>,
}

struct FileState {
    stamp: Stamp,
    payload: Option<Arc<Payload>>,
}

struct Inner {
    root: PathBuf,
    options: RwLock<StoreOptions>,
    codecs: RwLock<Vec<Arc<dyn Codec>>>,
    dirs: Mutex<HashMap<Vec<String>, DirState>>,
    files: Mutex<HashMap<Vec<String>, FileState>>,
    /// Serialises file I/O in single-process mode.
    io: Mutex<()>,
}

/// Thread-safe keyed store rooted at a directory. Cloning shares caches.
#[derive(Clone)]
pub struct Store {
    inner: Arc<Inner>,
}

impl Store {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: &Path, options: StoreOptions) -> StoreResult<Self> {
        fs::create_dir_all(root).map_err(|e| io_err(root, e))?;
        debug!(?root, single_process = options.single_process, "store opened");
        Ok(Self {
            inner: Arc::new(Inner {
                root: root.to_path_buf(),
                options: RwLock::new(options),
                codecs: RwLock::new(Vec::new()),
                dirs: Mutex::new(HashMap::new()),
                files: Mutex::new(HashMap::new()),
                io: Mutex::new(()),
            }),
        })
    }

    /// Register a codec; files whose name ends with its suffix become
    /// readable and writable.
    pub fn register(&self, codec: impl Codec + 'static) {
        self.inner.codecs.write().push(Arc::new(codec));
    }

    /// Builder form of [`Store::register`].
    pub fn with_codec(self, codec: impl Codec + 'static) -> Self {
        self.register(codec);
        self
    }

    pub fn root_dir(&self) -> &Path {
        &self.inner.root
    }

    pub fn dir_ttl(&self) -> Duration {
        self.inner.options.read().dir_ttl
    }

    pub fn set_dir_ttl(&self, ttl: Duration) {
        self.inner.options.write().dir_ttl = ttl;
    }

    /// Drop every cached listing and payload.
    pub fn clear_cache(&self) {
        self.inner.dirs.lock().clear();
        self.inner.files.lock().clear();
    }

    /// Filesystem path of a key.
    pub fn real_path(&self, path: &[String]) -> PathBuf {
        let mut real = self.inner.root.clone();
        for part in path {
            real.push(part);
        }
        real
    }

    // ── Lookup ─────────────────────────────────────────────────────

    /// The root directory entry.
    pub fn root(&self) -> Entry {
        Entry {
            path: Vec::new(),
            kind: EntryKind::Directory,
        }
    }

    /// Look up a key. Every directory along the way has its listing
    /// refreshed if it is older than the TTL; a missing segment, or a
    /// segment that is not a directory, is `NotFound`.
    pub fn get<S: AsRef<str>>(&self, path: &[S]) -> StoreResult<Entry> {
        let path: Vec<String> = path.iter().map(|s| s.as_ref().to_string()).collect();
        if path.is_empty() {
            return Ok(self.root());
        }

        let mut kind = EntryKind::Directory;
        for depth in 0..path.len() {
            if kind != EntryKind::Directory {
                return Err(StoreError::NotFound(display_key(&path)));
            }
            let dir = &path[..depth];
            kind = self
                .child_kind(dir, &path[depth])?
                .ok_or_else(|| StoreError::NotFound(display_key(&path)))?;
        }

        Ok(Entry { path, kind })
    }

    /// Whether a key exists (as far as the cached listings know).
    pub fn contains<S: AsRef<str>>(&self, path: &[S]) -> bool {
        matches!(self.get(path), Ok(entry) if entry.kind != EntryKind::Absent)
    }

    /// Look up a direct child of a directory entry.
    pub fn child(&self, dir: &Entry, name: &str) -> StoreResult<Entry> {
        self.get(&dir.child_path(name))
    }

    /// Names in a directory, sorted.
    pub fn list(&self, dir: &Entry) -> StoreResult<Vec<String>> {
        self.with_listing(&dir.path, |children| children.keys().cloned().collect())
    }

    /// Child entries of a directory, sorted by name.
    pub fn children(&self, dir: &Entry) -> StoreResult<Vec<Entry>> {
        self.with_listing(&dir.path, |children| {
            children
                .iter()
                .map(|(name, kind)| Entry {
                    path: dir.child_path(name),
                    kind: *kind,
                })
                .collect()
        })
    }

    /// Kind of `name` inside directory `dir`, or `None` if not listed.
    fn child_kind(&self, dir: &[String], name: &str) -> StoreResult<Option<EntryKind>> {
        self.with_listing(dir, |children| children.get(name).copied())
    }

    /// Run `f` over the directory's listing, refreshing it first if stale.
    fn with_listing<T>(
        &self,
        dir: &[String],
        f: impl FnOnce(&BTreeMap<String, EntryKind>) -> T,
    ) -> StoreResult<T> {
        let ttl = self.dir_ttl();
        {
            let dirs = self.inner.dirs.lock();
            if let Some(state) = dirs.get(dir) {
                if state.refreshed.elapsed() < ttl {
                    return Ok(f(&state.children));
                }
            }
        }

        let children = match self.scan_dir(dir) {
            Ok(children) => children,
            Err(e) => {
                self.inner.dirs.lock().remove(dir);
                return Err(e);
            }
        };

        let mut dirs = self.inner.dirs.lock();
        let state = DirState {
            children,
            refreshed: Instant::now(),
            contains_suffix: HashMap::new(),
        };
        let result = f(&state.children);
        dirs.insert(dir.to_vec(), state);
        Ok(result)
    }

    /// Read a directory from disk, hiding lock markers.
    fn scan_dir(&self, dir: &[String]) -> StoreResult<BTreeMap<String, EntryKind>> {
        let real = self.real_path(dir);
        let read = fs::read_dir(&real).map_err(|e| match e.kind() {
            ErrorKind::NotFound | ErrorKind::NotADirectory => {
                StoreError::NotFound(display_key(dir))
            }
            _ => io_err(&real, e),
        })?;

        let mut children = BTreeMap::new();
        for item in read {
            let item = item.map_err(|e| io_err(&real, e))?;
            let name = item.file_name().to_string_lossy().into_owned();
            if name.starts_with(LOCK_PREFIX) {
                continue;
            }
            let kind = match item.file_type() {
                Ok(ft) if ft.is_symlink() => match fs::metadata(item.path()) {
                    Ok(meta) if meta.is_dir() => EntryKind::Directory,
                    Ok(_) => EntryKind::File,
                    Err(_) => EntryKind::Absent,
                },
                Ok(ft) if ft.is_dir() => EntryKind::Directory,
                Ok(_) => EntryKind::File,
                Err(_) => EntryKind::Absent,
            };
            children.insert(name, kind);
        }
        debug!(dir = %display_key(dir), count = children.len(), "directory listing refreshed");
        Ok(children)
    }

    /// Record a child in the cached listing of `dir`, if there is one.
    fn note_child(&self, dir: &[String], name: &str, kind: EntryKind) {
        if let Some(state) = self.inner.dirs.lock().get_mut(dir) {
            state.children.insert(name.to_string(), kind);
            state.contains_suffix.clear();
        }
    }

    fn forget_child(&self, dir: &[String], name: &str) {
        if let Some(state) = self.inner.dirs.lock().get_mut(dir) {
            state.children.remove(name);
            state.contains_suffix.clear();
        }
    }

    // ── File contents ──────────────────────────────────────────────

    fn codec_for(&self, name: &str) -> Option<Arc<dyn Codec>> {
        self.inner
            .codecs
            .read()
            .iter()
            .find(|codec| name.ends_with(codec.suffix()))
            .cloned()
    }

    fn file_codec(&self, entry: &Entry) -> StoreResult<Arc<dyn Codec>> {
        let name = entry
            .name()
            .ok_or_else(|| StoreError::InvalidOperation("the root is not a file".to_string()))?;
        self.codec_for(name)
            .ok_or_else(|| StoreError::UnsupportedType(display_key(&entry.path)))
    }

    /// Read and decode a file.
    ///
    /// Returns `Ok(None)` when the file exists but cannot be decoded. The
    /// decoded payload is cached against the file's modification stamp and
    /// reused until the file changes on disk.
    pub fn read(&self, entry: &Entry) -> StoreResult<Option<Arc<Payload>>> {
        let codec = self.file_codec(entry)?;
        let real = self.real_path(&entry.path);

        let meta = match fs::metadata(&real) {
            Ok(meta) => meta,
            Err(e) => {
                self.inner.files.lock().remove(&entry.path);
                return Err(io_err(&real, e));
            }
        };
        if meta.is_dir() {
            return Err(StoreError::InvalidOperation(format!(
                "{} is a directory",
                display_key(&entry.path)
            )));
        }
        let stamp = Stamp::of(&meta);

        if let Some(cached) = self.inner.files.lock().get(&entry.path) {
            if cached.stamp == stamp {
                return Ok(cached.payload.clone());
            }
        }

        let bytes = self.read_bytes(&real)?;

        let payload = codec.decode(&bytes).map(Arc::new);
        if payload.is_none() {
            warn!(path = %display_key(&entry.path), "file could not be decoded");
        }

        self.inner.files.lock().insert(
            entry.path.clone(),
            FileState {
                stamp,
                payload: payload.clone(),
            },
        );
        Ok(payload)
    }

    /// Encode and write a file, replacing its contents.
    ///
    /// With cross-process locking enabled the bytes are staged inside the
    /// lock marker and renamed into place, so concurrent readers see either
    /// the old or the new file, never a partial one.
    pub fn write(&self, entry: &Entry, payload: Payload) -> StoreResult<()> {
        let codec = self.file_codec(entry)?;
        let real = self.real_path(&entry.path);
        if real.is_dir() {
            return Err(StoreError::InvalidOperation(format!(
                "cannot write data into directory {}",
                display_key(&entry.path)
            )));
        }

        let bytes = codec.encode(&payload)?;
        let meta = self.write_bytes(&real, &bytes)?;

        self.inner.files.lock().insert(
            entry.path.clone(),
            FileState {
                stamp: Stamp::of(&meta),
                payload: Some(Arc::new(payload)),
            },
        );
        if let Some((name, dir)) = entry.path.split_last() {
            self.note_child(dir, name, EntryKind::File);
        }
        debug!(path = %display_key(&entry.path), bytes = bytes.len(), "file written");
        Ok(())
    }

    fn read_bytes(&self, real: &Path) -> StoreResult<Vec<u8>> {
        let _io = self.single_process().then(|| self.inner.io.lock());
        fs::read(real).map_err(|e| io_err(real, e))
    }

    /// Returns the metadata of the written file, taken before the lock (or
    /// the io mutex) is released so it cannot describe another writer's file.
    fn write_bytes(&self, real: &Path, bytes: &[u8]) -> StoreResult<fs::Metadata> {
        if self.single_process() {
            let _io = self.inner.io.lock();
            fs::write(real, bytes).map_err(|e| io_err(real, e))?;
            return fs::metadata(real).map_err(|e| io_err(real, e));
        }

        let lock = FileLock::acquire(real, self.lock_timeout())?;
        let scratch = lock.scratch_path();
        fs::write(&scratch, bytes).map_err(|e| io_err(&scratch, e))?;
        fs::rename(&scratch, real).map_err(|e| io_err(real, e))?;
        let meta = fs::metadata(real).map_err(|e| io_err(real, e));
        drop(lock);
        meta
    }

    /// Decode a JSON file into `T`. Undecodable content, or JSON that does
    /// not match `T`, reads as `None`.
    pub fn read_json<T: DeserializeOwned>(&self, entry: &Entry) -> StoreResult<Option<T>> {
        let Some(payload) = self.read(entry)? else {
            return Ok(None);
        };
        let Some(value) = payload.as_json() else {
            return Ok(None);
        };
        match T::deserialize(value) {
            Ok(typed) => Ok(Some(typed)),
            Err(e) => {
                warn!(path = %display_key(&entry.path), error = %e, "file does not match expected shape");
                Ok(None)
            }
        }
    }

    /// Serialise `value` as JSON and write it.
    pub fn write_json<T: Serialize>(&self, entry: &Entry, value: &T) -> StoreResult<()> {
        let json = serde_json::to_value(value).map_err(|e| StoreError::Encode(e.to_string()))?;
        self.write(entry, Payload::Json(json))
    }

    // ── Structure ──────────────────────────────────────────────────

    /// Ensure a directory exists at `path`, creating intermediate
    /// directories. A non-directory along the way is `InvalidOperation`.
    pub fn create_directory<S: AsRef<str>>(&self, path: &[S]) -> StoreResult<Entry> {
        let path: Vec<String> = path.iter().map(|s| s.as_ref().to_string()).collect();
        for part in &path {
            validate_name(part)?;
        }

        let real = self.real_path(&path);
        if let Err(e) = fs::create_dir_all(&real) {
            return Err(match e.kind() {
                ErrorKind::AlreadyExists | ErrorKind::NotADirectory => {
                    StoreError::InvalidOperation(format!(
                        "cannot create directory {}: a file is in the way",
                        display_key(&path)
                    ))
                }
                _ => io_err(&real, e),
            });
        }

        for depth in 0..path.len() {
            self.note_child(&path[..depth], &path[depth], EntryKind::Directory);
        }
        Ok(Entry {
            path,
            kind: EntryKind::Directory,
        })
    }

    /// Create (or overwrite) file `name` inside directory `dir`.
    pub fn create_file(&self, dir: &Entry, name: &str, payload: Payload) -> StoreResult<Entry> {
        let entry = self.prepare_file(dir, name)?;
        self.write(&entry, payload)?;
        Ok(Entry {
            kind: EntryKind::File,
            ..entry
        })
    }

    /// JSON form of [`Store::create_file`].
    pub fn create_json_file<T: Serialize>(
        &self,
        dir: &Entry,
        name: &str,
        value: &T,
    ) -> StoreResult<Entry> {
        let json = serde_json::to_value(value).map_err(|e| StoreError::Encode(e.to_string()))?;
        self.create_file(dir, name, Payload::Json(json))
    }

    /// Copy the bytes of `source` into file `name` inside `dir`.
    pub fn clone_file(&self, dir: &Entry, name: &str, source: &Entry) -> StoreResult<Entry> {
        let src_real = self.real_path(&source.path);
        let src_meta = fs::metadata(&src_real).map_err(|e| io_err(&src_real, e))?;
        if src_meta.is_dir() {
            return Err(StoreError::InvalidOperation(
                "only files can be cloned".to_string(),
            ));
        }

        let entry = self.prepare_file(dir, name)?;
        let real = self.real_path(&entry.path);

        if self.single_process() {
            let _io = self.inner.io.lock();
            fs::copy(&src_real, &real).map_err(|e| io_err(&real, e))?;
        } else {
            let lock = FileLock::acquire(&real, self.lock_timeout())?;
            let scratch = lock.scratch_path();
            fs::copy(&src_real, &scratch).map_err(|e| io_err(&scratch, e))?;
            fs::rename(&scratch, &real).map_err(|e| io_err(&real, e))?;
        }

        self.inner.files.lock().remove(&entry.path);
        self.note_child(&dir.path, name, EntryKind::File);
        Ok(Entry {
            kind: EntryKind::File,
            ..entry
        })
    }

    /// Check that `name` may become a file inside `dir`.
    fn prepare_file(&self, dir: &Entry, name: &str) -> StoreResult<Entry> {
        validate_name(name)?;
        let dir_real = self.real_path(&dir.path);
        if !dir_real.is_dir() {
            return Err(StoreError::InvalidOperation(format!(
                "can only create files within directories, {} is not one",
                display_key(&dir.path)
            )));
        }

        let path = dir.child_path(name);
        if self.real_path(&path).is_dir() {
            return Err(StoreError::InvalidOperation(format!(
                "cannot replace directory {} with a file",
                display_key(&path)
            )));
        }
        Ok(Entry {
            path,
            kind: EntryKind::Absent,
        })
    }

    /// Delete a file. Directories cannot be removed through the store.
    pub fn remove(&self, entry: &Entry) -> StoreResult<()> {
        let real = self.real_path(&entry.path);
        let meta = fs::metadata(&real).map_err(|e| io_err(&real, e))?;
        if meta.is_dir() {
            return Err(StoreError::InvalidOperation(format!(
                "cannot remove directory {}",
                display_key(&entry.path)
            )));
        }

        if self.single_process() {
            let _io = self.inner.io.lock();
            fs::remove_file(&real).map_err(|e| io_err(&real, e))?;
        } else {
            let _lock = FileLock::acquire(&real, self.lock_timeout())?;
            fs::remove_file(&real).map_err(|e| io_err(&real, e))?;
        }

        self.inner.files.lock().remove(&entry.path);
        if let Some((name, dir)) = entry.path.split_last() {
            self.forget_child(dir, name);
        }
        debug!(path = %display_key(&entry.path), "file removed");
        Ok(())
    }

    /// Last modification time, straight from the filesystem.
    pub fn modified(&self, entry: &Entry) -> StoreResult<SystemTime> {
        let real = self.real_path(&entry.path);
        fs::metadata(&real)
            .and_then(|m| m.modified())
            .map_err(|e| io_err(&real, e))
    }

    /// Size in bytes; zero for directories and vanished files.
    pub fn size(&self, entry: &Entry) -> u64 {
        match fs::metadata(self.real_path(&entry.path)) {
            Ok(meta) if meta.is_file() => meta.len(),
            _ => 0,
        }
    }

    // ── Iteration ──────────────────────────────────────────────────

    /// Depth-first walk yielding the key of `from` and everything below
    /// it, `from` first.
    pub fn iter(&self, from: &Entry) -> Iter<'_> {
        let stack = if from.kind == EntryKind::Absent {
            Vec::new()
        } else {
            vec![(from.path.clone(), from.kind)]
        };
        Iter { store: self, stack }
    }

    /// Number of entries `iter` would yield.
    pub fn count(&self, from: &Entry) -> usize {
        self.iter(from).count()
    }

    /// Like [`Store::iter`] but yields only files ending in `suffix`,
    /// skipping directories whose name matches `exclude` and subtrees known
    /// to contain no such file.
    pub fn iter_by_suffix<'a>(
        &'a self,
        from: &Entry,
        suffix: &str,
        exclude: Option<&'a Regex>,
    ) -> SuffixIter<'a> {
        let stack = if from.kind == EntryKind::Absent {
            Vec::new()
        } else {
            vec![(from.path.clone(), from.kind)]
        };
        SuffixIter {
            store: self,
            suffix: suffix.to_string(),
            exclude,
            stack,
        }
    }

    /// Whether the subtree at `path` holds a file ending in `suffix`. The
    /// answer for a directory is cached until its listing is refreshed.
    fn contains_suffix(&self, path: &[String], kind: EntryKind, suffix: &str) -> bool {
        match kind {
            EntryKind::Absent => false,
            EntryKind::File => path.last().is_some_and(|n| n.ends_with(suffix)),
            EntryKind::Directory => {
                let children = match self.with_listing(path, |c| {
                    c.iter().map(|(n, k)| (n.clone(), *k)).collect::<Vec<_>>()
                }) {
                    Ok(children) => children,
                    Err(_) => return false,
                };

                if let Some(known) = self
                    .inner
                    .dirs
                    .lock()
                    .get(path)
                    .and_then(|state| state.contains_suffix.get(suffix).copied())
                {
                    return known;
                }

                let found = children.iter().any(|(name, kind)| {
                    let mut child = path.to_vec();
                    child.push(name.clone());
                    self.contains_suffix(&child, *kind, suffix)
                });

                if let Some(state) = self.inner.dirs.lock().get_mut(path) {
                    state.contains_suffix.insert(suffix.to_string(), found);
                }
                found
            }
        }
    }

    fn single_process(&self) -> bool {
        self.inner.options.read().single_process
    }

    fn lock_timeout(&self) -> Duration {
        self.inner.options.read().lock_timeout
    }
}

/// Reject names the store cannot represent as a single path segment.
fn validate_name(name: &str) -> StoreResult<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.starts_with(LOCK_PREFIX)
    {
        return Err(StoreError::InvalidOperation(format!(
            "invalid entry name: {name:?}"
        )));
    }
    Ok(())
}

/// Lazy depth-first walk returned by [`Store::iter`].
pub struct Iter<'a> {
    store: &'a Store,
    stack: Vec<(Vec<String>, EntryKind)>,
}

impl Iterator for Iter<'_> {
    type Item = Vec<String>;

    fn next(&mut self) -> Option<Self::Item> {
        let (path, kind) = self.stack.pop()?;
        if kind == EntryKind::Directory {
            if let Ok(children) = self.store.with_listing(&path, |c| {
                c.iter().map(|(n, k)| (n.clone(), *k)).collect::<Vec<_>>()
            }) {
                for (name, child_kind) in children.into_iter().rev() {
                    if child_kind == EntryKind::Absent {
                        continue;
                    }
                    let mut child = path.clone();
                    child.push(name);
                    self.stack.push((child, child_kind));
                }
            }
        }
        Some(path)
    }
}

/// Pruned walk returned by [`Store::iter_by_suffix`].
pub struct SuffixIter<'a> {
    store: &'a Store,
    suffix: String,
    exclude: Option<&'a Regex>,
    stack: Vec<(Vec<String>, EntryKind)>,
}

impl Iterator for SuffixIter<'_> {
    type Item = Vec<String>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some((path, kind)) = self.stack.pop() {
            match kind {
                EntryKind::File => {
                    if path.last().is_some_and(|n| n.ends_with(&self.suffix)) {
                        return Some(path);
                    }
                }
                EntryKind::Directory => {
                    let Ok(children) = self.store.with_listing(&path, |c| {
                        c.iter().map(|(n, k)| (n.clone(), *k)).collect::<Vec<_>>()
                    }) else {
                        continue;
                    };
                    for (name, child_kind) in children.into_iter().rev() {
                        if self.exclude.is_some_and(|re| re.is_match(&name)) {
                            continue;
                        }
                        let mut child = path.clone();
                        child.push(name);
                        if self.store.contains_suffix(&child, child_kind, &self.suffix) {
                            self.stack.push((child, child_kind));
                        }
                    }
                }
                EntryKind::Absent => {}
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{JsonCodec, RawCodec};
    use serde::Deserialize;
    use serde_json::json;

    fn options() -> StoreOptions {
        StoreOptions {
            single_process: false,
            dir_ttl: Duration::ZERO,
            lock_timeout: Duration::from_secs(5),
        }
    }

    fn test_store(dir: &Path) -> Store {
        Store::open(dir, options()).unwrap().with_codec(JsonCodec)
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Record {
        name: String,
        frames: Vec<i64>,
    }

    // ── Read / write ───────────────────────────────────────────────

    #[test]
    fn write_then_read_round_trips_with_and_without_cache() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let payload = json!({"name": "shot010", "todo": [1, 2, 3], "pause": false});

        let entry = store
            .create_file(&store.root(), "job.json", Payload::Json(payload.clone()))
            .unwrap();
        let read = store.read(&entry).unwrap().unwrap();
        assert_eq!(read.as_json(), Some(&payload));

        // Cold caches.
        store.clear_cache();
        let read = store.read(&entry).unwrap().unwrap();
        assert_eq!(read.as_json(), Some(&payload));

        // A second store over the same tree.
        let other = test_store(dir.path());
        let entry = other.get(&["job.json"]).unwrap();
        assert_eq!(other.read(&entry).unwrap().unwrap().as_json(), Some(&payload));
    }

    #[test]
    fn typed_json_helpers() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let record = Record {
            name: "a".into(),
            frames: vec![4, 5],
        };

        let entry = store
            .create_json_file(&store.root(), "rec.json", &record)
            .unwrap();
        assert_eq!(store.read_json::<Record>(&entry).unwrap(), Some(record));

        // JSON of the wrong shape reads as no data.
        store.write(&entry, Payload::Json(json!([1, 2]))).unwrap();
        assert_eq!(store.read_json::<Record>(&entry).unwrap(), None);
    }

    #[test]
    fn external_write_is_observed_on_next_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let entry = store
            .create_file(&store.root(), "n.json", Payload::Json(json!({"v": 1})))
            .unwrap();
        assert_eq!(store.read(&entry).unwrap().unwrap().as_json(), Some(&json!({"v": 1})));

        fs::write(dir.path().join("n.json"), br#"{"v": 2, "extra": true}"#).unwrap();
        assert_eq!(
            store.read(&entry).unwrap().unwrap().as_json(),
            Some(&json!({"v": 2, "extra": true}))
        );
    }

    #[test]
    fn corrupt_file_reads_as_no_data() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("bad.json"), b"{ truncated").unwrap();
        let store = test_store(dir.path());

        let entry = store.get(&["bad.json"]).unwrap();
        assert!(store.read(&entry).unwrap().is_none());
    }

    #[test]
    fn unregistered_suffix_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("notes.txt"), b"hello").unwrap();
        let store = test_store(dir.path());

        let entry = store.get(&["notes.txt"]).unwrap();
        assert!(matches!(store.read(&entry), Err(StoreError::UnsupportedType(_))));

        store.register(RawCodec::new(".txt"));
        let payload = store.read(&entry).unwrap().unwrap();
        assert_eq!(payload.as_bytes(), Some(&b"hello"[..]));
    }

    #[test]
    fn write_leaves_no_lock_marker_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        store
            .create_file(&store.root(), "a.json", Payload::Json(json!(1)))
            .unwrap();

        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.json".to_string()]);
    }

    #[test]
    fn single_process_mode_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(
            dir.path(),
            StoreOptions {
                single_process: true,
                ..options()
            },
        )
        .unwrap()
        .with_codec(JsonCodec);

        let entry = store
            .create_file(&store.root(), "a.json", Payload::Json(json!({"x": 1})))
            .unwrap();
        store.clear_cache();
        assert_eq!(store.read(&entry).unwrap().unwrap().as_json(), Some(&json!({"x": 1})));
    }

    #[test]
    fn racing_writers_never_cache_the_losing_payload() {
        let dir = tempfile::tempdir().unwrap();
        let a = test_store(dir.path());
        let b = test_store(dir.path());
        let entry = a
            .create_file(&a.root(), "job.json", Payload::Json(json!({"w": ""})))
            .unwrap();
        let barrier = std::sync::Barrier::new(2);

        for round in 0..200 {
            std::thread::scope(|s| {
                for (store, tag) in [(&a, "a"), (&b, "bb")] {
                    let (entry, barrier) = (&entry, &barrier);
                    s.spawn(move || {
                        barrier.wait();
                        let value = json!({"w": tag.repeat(round % 7 + 1), "round": round});
                        store.write(entry, Payload::Json(value)).unwrap();
                    });
                }
            });

            let on_disk: serde_json::Value =
                serde_json::from_slice(&fs::read(dir.path().join("job.json")).unwrap()).unwrap();
            for store in [&a, &b] {
                assert_eq!(
                    store.read(&entry).unwrap().unwrap().as_json(),
                    Some(&on_disk),
                    "round {round}"
                );
            }
        }
    }

    #[test]
    fn single_process_writes_cache_their_own_stamp() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(
            dir.path(),
            StoreOptions {
                single_process: true,
                ..options()
            },
        )
        .unwrap()
        .with_codec(JsonCodec);
        let entry = store
            .create_file(&store.root(), "a.json", Payload::Json(json!(0)))
            .unwrap();

        std::thread::scope(|s| {
            for n in 1..=4 {
                let (store, entry) = (store.clone(), &entry);
                s.spawn(move || {
                    for _ in 0..50 {
                        store.write(entry, Payload::Json(json!(vec![n; n * 3]))).unwrap();
                    }
                });
            }
        });

        let on_disk: serde_json::Value =
            serde_json::from_slice(&fs::read(dir.path().join("a.json")).unwrap()).unwrap();
        assert_eq!(store.read(&entry).unwrap().unwrap().as_json(), Some(&on_disk));
    }

    // ── Lookup & caching ───────────────────────────────────────────

    #[test]
    fn get_through_a_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        store
            .create_file(&store.root(), "a.json", Payload::Json(json!(1)))
            .unwrap();

        assert!(matches!(store.get(&["a.json", "child"]), Err(StoreError::NotFound(_))));
        assert!(matches!(store.get(&["missing"]), Err(StoreError::NotFound(_))));
        assert!(store.contains(&["a.json"]));
        assert!(!store.contains(&["a.json", "child"]));
    }

    #[test]
    fn lock_markers_are_hidden() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join(".lock_a.json")).unwrap();
        fs::write(dir.path().join("a.json"), b"1").unwrap();
        let store = test_store(dir.path());

        assert_eq!(store.list(&store.root()).unwrap(), vec!["a.json".to_string()]);
        assert!(!store.contains(&[".lock_a.json"]));
    }

    #[test]
    fn stale_listing_is_tolerated_until_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(
            dir.path(),
            StoreOptions {
                dir_ttl: Duration::from_secs(3600),
                ..options()
            },
        )
        .unwrap()
        .with_codec(JsonCodec);

        assert!(!store.contains(&["late.json"]));
        fs::write(dir.path().join("late.json"), b"{}").unwrap();
        // Listing is cached and still fresh.
        assert!(!store.contains(&["late.json"]));

        store.set_dir_ttl(Duration::ZERO);
        assert!(store.contains(&["late.json"]));
    }

    #[test]
    fn files_created_through_the_store_are_listed_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(
            dir.path(),
            StoreOptions {
                dir_ttl: Duration::from_secs(3600),
                ..options()
            },
        )
        .unwrap()
        .with_codec(JsonCodec);

        assert!(store.list(&store.root()).unwrap().is_empty());
        store
            .create_file(&store.root(), "new.json", Payload::Json(json!({})))
            .unwrap();
        assert!(store.contains(&["new.json"]));
    }

    #[test]
    fn vanished_file_is_absent_or_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(
            dir.path(),
            StoreOptions {
                dir_ttl: Duration::from_secs(3600),
                ..options()
            },
        )
        .unwrap()
        .with_codec(JsonCodec);
        let entry = store
            .create_file(&store.root(), "gone.json", Payload::Json(json!(1)))
            .unwrap();

        fs::remove_file(dir.path().join("gone.json")).unwrap();
        assert!(matches!(store.read(&entry), Err(StoreError::NotFound(_))));
    }

    // ── Structure ──────────────────────────────────────────────────

    #[test]
    fn create_directory_and_files_inside() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());

        let sub = store.create_directory(&["proj", "assets"]).unwrap();
        assert!(sub.is_dir());
        // Idempotent.
        store.create_directory(&["proj", "assets"]).unwrap();

        store
            .create_file(&sub, "chair.json", Payload::Json(json!({"p": 1})))
            .unwrap();
        let entry = store.get(&["proj", "assets", "chair.json"]).unwrap();
        assert!(entry.is_file());
    }

    #[test]
    fn create_directory_through_file_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        store
            .create_file(&store.root(), "a.json", Payload::Json(json!(1)))
            .unwrap();

        let result = store.create_directory(&["a.json", "sub"]);
        assert!(matches!(result, Err(StoreError::InvalidOperation(_))));
    }

    #[test]
    fn remove_files_but_not_directories() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let sub = store.create_directory(&["sub"]).unwrap();
        let file = store
            .create_file(&sub, "x.json", Payload::Json(json!(1)))
            .unwrap();

        assert!(matches!(store.remove(&sub), Err(StoreError::InvalidOperation(_))));

        store.remove(&file).unwrap();
        assert!(!store.contains(&["sub", "x.json"]));
        assert!(!dir.path().join("sub/x.json").exists());
    }

    #[test]
    fn clone_copies_bytes_under_new_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let original = store
            .create_file(&store.root(), "a.json", Payload::Json(json!({"k": "v"})))
            .unwrap();

        let copy = store.clone_file(&store.root(), "b.json", &original).unwrap();
        assert_eq!(store.read(&copy).unwrap().unwrap().as_json(), Some(&json!({"k": "v"})));

        // Independent afterwards.
        store.write(&original, Payload::Json(json!({"k": "changed"}))).unwrap();
        assert_eq!(store.read(&copy).unwrap().unwrap().as_json(), Some(&json!({"k": "v"})));
    }

    #[test]
    fn invalid_names_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        for name in ["", "..", "a/b", ".lock_x.json"] {
            let result = store.create_file(&store.root(), name, Payload::Json(json!(1)));
            assert!(matches!(result, Err(StoreError::InvalidOperation(_))), "{name:?}");
        }
    }

    // ── Iteration ──────────────────────────────────────────────────

    fn build_tree(store: &Store) {
        let a = store.create_directory(&["a"]).unwrap();
        let b = store.create_directory(&["a", "b"]).unwrap();
        let c = store.create_directory(&["c"]).unwrap();
        store.create_directory(&["old"]).unwrap();
        store
            .create_file(&a, "one.json", Payload::Json(json!(1)))
            .unwrap();
        store
            .create_file(&b, "two.json", Payload::Json(json!(2)))
            .unwrap();
        store.register(RawCodec::new(".blend"));
        store
            .create_file(&c, "scene.blend", Payload::Bytes(vec![0]))
            .unwrap();
        let old = store.get(&["old"]).unwrap();
        store
            .create_file(&old, "stale.json", Payload::Json(json!(0)))
            .unwrap();
    }

    #[test]
    fn iter_is_depth_first_with_root_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        build_tree(&store);

        let paths: Vec<String> = store
            .iter(&store.root())
            .map(|p| p.join("/"))
            .collect();
        assert_eq!(
            paths,
            vec![
                "", "a", "a/b", "a/b/two.json", "a/one.json", "c", "c/scene.blend", "old",
                "old/stale.json",
            ]
        );
        assert_eq!(store.count(&store.root()), 9);

        let sub = store.get(&["a"]).unwrap();
        assert_eq!(store.iter(&sub).next(), Some(vec!["a".to_string()]));
    }

    #[test]
    fn iter_by_suffix_prunes_and_excludes() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        build_tree(&store);

        let all: Vec<String> = store
            .iter_by_suffix(&store.root(), ".json", None)
            .map(|p| p.join("/"))
            .collect();
        assert_eq!(all, vec!["a/b/two.json", "a/one.json", "old/stale.json"]);

        let exclude = Regex::new("^old$").unwrap();
        let filtered: Vec<String> = store
            .iter_by_suffix(&store.root(), ".json", Some(&exclude))
            .map(|p| p.join("/"))
            .collect();
        assert_eq!(filtered, vec!["a/b/two.json", "a/one.json"]);

        let blends: Vec<String> = store
            .iter_by_suffix(&store.root(), ".blend", None)
            .map(|p| p.join("/"))
            .collect();
        assert_eq!(blends, vec!["c/scene.blend"]);
    }

    #[test]
    fn suffix_cache_is_reset_by_new_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let sub = store.create_directory(&["sub"]).unwrap();

        assert_eq!(store.iter_by_suffix(&store.root(), ".json", None).count(), 0);
        store
            .create_file(&sub, "late.json", Payload::Json(json!(1)))
            .unwrap();
        // With a zero TTL the root listing is refreshed on the next walk,
        // which resets its cached answer.
        assert_eq!(store.iter_by_suffix(&store.root(), ".json", None).count(), 1);
    }
}
