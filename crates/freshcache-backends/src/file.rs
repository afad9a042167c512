//! File-per-entry cache store
//!
//! Each entry lives at `cache_dir/[shard/...]<physical key><suffix>` and
//! starts with an 8-byte big-endian unix expiry (0 = never) followed by the
//! payload. Writes go through a temporary file in the target directory so
//! readers never observe a half-written entry.

use std::{
    fs::{self, File},
    io::{self, ErrorKind, Read},
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use freshcache::{
    clock::{Clock, SystemClock},
    gc::GcPolicy,
    store::{CacheStore, GarbageCollect},
    PhysicalKey, Result,
};
use parking_lot::Mutex;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{BackendError, BackendResult};

/// Default entry file suffix
pub const DEFAULT_SUFFIX: &str = ".bin";

const HEADER_LEN: usize = 8;

const ADD_LOCK_STRIPES: usize = 64;

/// Temporary files untouched for this long belong to a crashed writer
pub const STALE_TEMP_AGE: Duration = Duration::from_secs(3600);

/// File-based cache store
#[derive(Debug)]
pub struct FileStore {
    cache_dir: PathBuf,
    suffix: String,
    directory_levels: usize,
    gc_policy: GcPolicy,
    clock: Arc<dyn Clock>,
    add_locks: Box<[Mutex<()>]>,
}

impl FileStore {
    /// Create a store rooted at `cache_dir`, creating the directory if needed
    pub fn new(cache_dir: impl AsRef<Path>) -> BackendResult<Self> {
        let cache_dir = cache_dir.as_ref().to_path_buf();

        if !cache_dir.exists() {
            fs::create_dir_all(&cache_dir)?;
            debug!("Created cache directory: {}", cache_dir.display());
        } else if !cache_dir.is_dir() {
            return Err(BackendError::InvalidConfig(format!(
                "cache path is not a directory: {}",
                cache_dir.display()
            )));
        }

        Ok(Self {
            cache_dir,
            suffix: DEFAULT_SUFFIX.to_string(),
            directory_levels: 0,
            gc_policy: GcPolicy::default(),
            clock: Arc::new(SystemClock),
            add_locks: (0..ADD_LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        })
    }

    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    /// Spread entries over `levels` nested directories named after key prefixes
    pub fn with_directory_levels(mut self, levels: usize) -> Self {
        self.directory_levels = levels;
        self
    }

    pub fn with_gc_policy(mut self, gc_policy: GcPolicy) -> Self {
        self.gc_policy = gc_policy;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Location of the entry for `key`
    pub fn entry_path(&self, key: &PhysicalKey) -> PathBuf {
        let mut path = self.cache_dir.clone();
        for shard in key.shards(self.directory_levels) {
            path.push(shard);
        }
        path.push(format!("{}{}", key, self.suffix));
        path
    }

    fn encode(&self, payload: &[u8], ttl_secs: u64) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
        bytes.extend_from_slice(&self.clock.expires_at(ttl_secs).to_be_bytes());
        bytes.extend_from_slice(payload);
        bytes
    }

    /// Unique hidden sibling of `path`, swept once stale
    fn temp_path(&self, path: &Path) -> PathBuf {
        let parent = path.parent().unwrap_or(self.cache_dir.as_path());
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("entry");
        parent.join(format!(".{}.{:016x}.tmp", name, rand::random::<u64>()))
    }

    /// Write `bytes` next to `path` under a unique temporary name
    fn write_temp(&self, path: &Path, bytes: &[u8]) -> io::Result<PathBuf> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let temp = self.temp_path(path);
        fs::write(&temp, bytes)?;
        Ok(temp)
    }

    fn add_lock(&self, key: &PhysicalKey) -> &Mutex<()> {
        let stripe = key
            .as_str()
            .get(..4)
            .and_then(|prefix| usize::from_str_radix(prefix, 16).ok())
            .unwrap_or(0);
        &self.add_locks[stripe % self.add_locks.len()]
    }

    /// Move an expired entry out of the way.
    ///
    /// The rename is atomic, so of several claimants only one gets the file.
    /// A claimed file that turns out to be live (written after our expiry
    /// check) is linked back and the add loses.
    fn claim_expired(&self, path: &Path) -> io::Result<bool> {
        let tombstone = self.temp_path(path);
        match fs::rename(path, &tombstone) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e),
        }

        let live = match read_expiry(&tombstone)? {
            Some(expires_at) => !self.clock.is_expired(expires_at),
            None => false,
        };
        if live {
            match fs::hard_link(&tombstone, path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => {
                    let _ = fs::remove_file(&tombstone);
                    return Err(e);
                }
            }
        }
        remove_if_present(&tombstone)?;
        Ok(!live)
    }

    fn is_entry(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| !name.starts_with('.') && name.ends_with(&self.suffix))
    }

    fn is_stale_temp(path: &Path, entry: &walkdir::DirEntry) -> bool {
        let is_temp = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with('.') && name.ends_with(".tmp"));
        if !is_temp {
            return false;
        }
        entry
            .metadata()
            .ok()
            .and_then(|meta| meta.modified().ok())
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .is_some_and(|age| age >= STALE_TEMP_AGE)
    }

    fn sweep(&self, expired_only: bool) -> BackendResult<usize> {
        let mut removed = 0;

        for entry in WalkDir::new(&self.cache_dir).min_depth(1) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping unreadable cache path during GC: {}", e);
                    continue;
                }
            };
            let path = entry.path();
            if !entry.file_type().is_file() {
                continue;
            }
            if Self::is_stale_temp(path, &entry) {
                match fs::remove_file(path) {
                    Ok(()) => debug!("Removed stale temporary file: {}", path.display()),
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => warn!("Failed to remove temporary file {}: {}", path.display(), e),
                }
                continue;
            }
            if !self.is_entry(path) {
                continue;
            }

            if expired_only {
                match read_expiry(path) {
                    Ok(Some(expires_at)) if !self.clock.is_expired(expires_at) => continue,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Failed to read cache entry {}: {}", path.display(), e);
                        continue;
                    }
                }
            }

            match fs::remove_file(path) {
                Ok(()) => {
                    removed += 1;
                    debug!("Removed cache entry: {}", path.display());
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove cache entry {}: {}", path.display(), e),
            }
        }

        Ok(removed)
    }
}

/// Read a whole entry; `None` when the file does not exist
fn read_entry(path: &Path) -> io::Result<Option<(u64, Vec<u8>)>> {
    let mut bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    if bytes.len() < HEADER_LEN {
        // Truncated header: treat as long expired
        return Ok(Some((1, Vec::new())));
    }
    let payload = bytes.split_off(HEADER_LEN);
    Ok(Some((expiry_from(&bytes), payload)))
}

/// Read only the expiry header; `Some(1)` for a truncated file
fn read_expiry(path: &Path) -> io::Result<Option<u64>> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let mut header = [0u8; HEADER_LEN];
    match file.read_exact(&mut header) {
        Ok(()) => Ok(Some(u64::from_be_bytes(header))),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(Some(1)),
        Err(e) => Err(e),
    }
}

fn expiry_from(header: &[u8]) -> u64 {
    let mut buf = [0u8; HEADER_LEN];
    buf.copy_from_slice(&header[..HEADER_LEN]);
    u64::from_be_bytes(buf)
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

impl CacheStore for FileStore {
    fn get_raw(&self, key: &PhysicalKey) -> Result<Option<Vec<u8>>> {
        let path = self.entry_path(key);
        let Some((expires_at, payload)) = read_entry(&path)? else {
            return Ok(None);
        };

        if self.clock.is_expired(expires_at) {
            debug!("Cache entry expired: {}", path.display());
            if let Err(e) = remove_if_present(&path) {
                warn!("Failed to remove expired cache entry {}: {}", path.display(), e);
            }
            return Ok(None);
        }
        Ok(Some(payload))
    }

    fn set_raw(&self, key: &PhysicalKey, payload: &[u8], ttl_secs: u64) -> Result<bool> {
        self.gc_policy.maybe_sweep("file", || self.gc(true));

        let path = self.entry_path(key);
        let temp = self.write_temp(&path, &self.encode(payload, ttl_secs))?;
        if let Err(e) = fs::rename(&temp, &path) {
            let _ = fs::remove_file(&temp);
            return Err(e.into());
        }
        Ok(true)
    }

    fn add_raw(&self, key: &PhysicalKey, payload: &[u8], ttl_secs: u64) -> Result<bool> {
        self.gc_policy.maybe_sweep("file", || self.gc(true));

        let path = self.entry_path(key);
        let _guard = self.add_lock(key).lock();
        match read_expiry(&path)? {
            Some(expires_at) if !self.clock.is_expired(expires_at) => return Ok(false),
            Some(_) => {
                if !self.claim_expired(&path)? {
                    return Ok(false);
                }
            }
            None => {}
        }

        // hard_link fails if the target exists, so exactly one writer wins
        let temp = self.write_temp(&path, &self.encode(payload, ttl_secs))?;
        let linked = fs::hard_link(&temp, &path);
        let _ = fs::remove_file(&temp);
        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn delete_raw(&self, key: &PhysicalKey) -> Result<bool> {
        remove_if_present(&self.entry_path(key))?;
        Ok(true)
    }

    fn flush_raw(&self) -> Result<bool> {
        let removed = self.sweep(false)?;
        debug!("Flushed {} cache entries from {}", removed, self.cache_dir.display());
        Ok(true)
    }
}

impl GarbageCollect for FileStore {
    fn gc(&self, expired_only: bool) -> Result<usize> {
        Ok(self.sweep(expired_only)?)
    }
}
