//! Key/value backends behind the state store.
//!
//! A backend is a small synchronous key/value API with per-key TTLs and the
//! few atomic primitives the lock and rate limiter need. `MemoryBackend`
//! serves single-process runs and tests. `FileBackend` keeps one JSON
//! envelope per key in a directory, so several orchestrator processes that
//! share the directory see the same records.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Synchronous key/value storage with expiry.
///
/// Implementations must be safe to call from several threads. The async
/// `StateStore` runs every call on the blocking pool.
pub trait KvBackend: Send + Sync + 'static {
    /// Read a live value.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a value, replacing any previous one. `None` means no expiry.
    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Write only if no live value exists. Returns whether it was written.
    fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool>;

    /// Remove a value. Returns whether a live value was removed.
    fn delete(&self, key: &str) -> Result<bool>;

    /// Remove the value only if it currently equals `expected`.
    fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool>;

    /// Increment an integer counter, creating it at 1 with `ttl` if absent.
    fn incr(&self, key: &str, ttl: Option<Duration>) -> Result<u64>;

    /// Live keys starting with `prefix`, sorted.
    fn keys(&self, prefix: &str) -> Result<Vec<String>>;
}

fn poisoned() -> Error {
    Error::Infrastructure("memory backend lock poisoned".to_string())
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn new(value: &str, ttl: Option<Duration>) -> Self {
        Self {
            value: value.to_string(),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// In-process backend. Expired entries are dropped lazily on access.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, MemoryEntry>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .map(|entries| entries.values().filter(|e| e.is_live(now)).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KvBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock().map_err(|_| poisoned())?;
        let now = Instant::now();
        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut entries = self.entries.lock().map_err(|_| poisoned())?;
        entries.insert(key.to_string(), MemoryEntry::new(value, ttl));
        Ok(())
    }

    fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        let mut entries = self.entries.lock().map_err(|_| poisoned())?;
        let now = Instant::now();
        if entries.get(key).is_some_and(|e| e.is_live(now)) {
            return Ok(false);
        }
        entries.insert(key.to_string(), MemoryEntry::new(value, ttl));
        Ok(true)
    }

    fn delete(&self, key: &str) -> Result<bool> {
        let mut entries = self.entries.lock().map_err(|_| poisoned())?;
        let now = Instant::now();
        Ok(entries.remove(key).is_some_and(|e| e.is_live(now)))
    }

    fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        let mut entries = self.entries.lock().map_err(|_| poisoned())?;
        let now = Instant::now();
        match entries.get(key) {
            Some(entry) if entry.is_live(now) && entry.value == expected => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn incr(&self, key: &str, ttl: Option<Duration>) -> Result<u64> {
        let mut entries = self.entries.lock().map_err(|_| poisoned())?;
        let now = Instant::now();
        let current = match entries.get(key) {
            Some(entry) if entry.is_live(now) => Some(entry.clone()),
            _ => None,
        };

        let (count, expires_at) = match current {
            Some(entry) => {
                let count: u64 = entry.value.parse().map_err(|_| {
                    Error::Infrastructure(format!("value at {} is not a counter", key))
                })?;
                (count + 1, entry.expires_at)
            }
            None => (1, ttl.map(|ttl| now + ttl)),
        };

        entries.insert(
            key.to_string(),
            MemoryEntry {
                value: count.to_string(),
                expires_at,
            },
        );
        Ok(count)
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let entries = self.entries.lock().map_err(|_| poisoned())?;
        let now = Instant::now();
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && e.is_live(now))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// On-disk record for one key.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    key: String,
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl Envelope {
    fn new(key: &str, value: &str, ttl: Option<Duration>) -> Self {
        Self {
            key: key.to_string(),
            value: value.to_string(),
            expires_at: ttl.and_then(|ttl| chrono::Duration::from_std(ttl).ok().map(|d| Utc::now() + d)),
        }
    }

    fn is_live(&self) -> bool {
        self.expires_at.map_or(true, |at| at > Utc::now())
    }
}

/// How long a mutation waits for another process's key guard.
const GUARD_WAIT: Duration = Duration::from_secs(2);
/// A guard file older than this is left over from a crashed process.
const GUARD_STALE: Duration = Duration::from_secs(10);
const GUARD_POLL: Duration = Duration::from_millis(5);

/// Directory-backed store: one `<encoded key>.json` file per key.
///
/// Writes go through a temp file and rename. Read-modify-write operations
/// (`incr`, `compare_and_delete`) hold a per-key `.guard` file created with
/// `create_new`, which is atomic across processes on a shared filesystem.
#[derive(Debug, Clone)]
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    /// Open (and create if needed) a backend rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        debug!(dir = %dir.display(), "file backend opened");
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", encode_key(key)))
    }

    fn read_envelope(&self, path: &Path) -> Result<Option<Envelope>> {
        match fs::read_to_string(path) {
            Ok(raw) => {
                let envelope: Envelope = serde_json::from_str(&raw)?;
                if envelope.is_live() {
                    Ok(Some(envelope))
                } else {
                    let _ = fs::remove_file(path);
                    Ok(None)
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_envelope(&self, path: &Path, envelope: &Envelope) -> Result<()> {
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
        fs::write(&tmp, serde_json::to_vec(envelope)?)?;
        if let Err(e) = fs::rename(&tmp, path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    fn with_guard<T>(&self, key: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let guard = self.dir.join(format!("{}.guard", encode_key(key)));
        let deadline = Instant::now() + GUARD_WAIT;

        loop {
            match OpenOptions::new().write(true).create_new(true).open(&guard) {
                Ok(mut file) => {
                    let _ = write!(file, "{}", std::process::id());
                    break;
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let stale = fs::metadata(&guard)
                        .and_then(|m| m.modified())
                        .ok()
                        .and_then(|t| t.elapsed().ok())
                        .is_some_and(|age| age > GUARD_STALE);
                    if stale {
                        warn!(key, "removing stale key guard");
                        let _ = fs::remove_file(&guard);
                        continue;
                    }
                    if Instant::now() >= deadline {
                        return Err(Error::LockUnavailable(format!("key guard for {}", key)));
                    }
                    std::thread::sleep(GUARD_POLL);
                }
                Err(e) => return Err(e.into()),
            }
        }

        let result = f();
        let _ = fs::remove_file(&guard);
        result
    }
}

impl KvBackend for FileBackend {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.read_envelope(&self.path_for(key))?.map(|e| e.value))
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.write_envelope(&self.path_for(key), &Envelope::new(key, value, ttl))
    }

    fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        let path = self.path_for(key);
        // Clears an expired record so create_new can succeed.
        self.read_envelope(&path)?;

        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                let envelope = Envelope::new(key, value, ttl);
                file.write_all(&serde_json::to_vec(&envelope)?)?;
                file.sync_all()?;
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key);
        let live = self.read_envelope(&path)?.is_some();
        match fs::remove_file(&path) {
            Ok(()) => Ok(live),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        self.with_guard(key, || {
            let path = self.path_for(key);
            match self.read_envelope(&path)? {
                Some(envelope) if envelope.value == expected => {
                    fs::remove_file(&path)?;
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }

    fn incr(&self, key: &str, ttl: Option<Duration>) -> Result<u64> {
        self.with_guard(key, || {
            let path = self.path_for(key);
            let envelope = match self.read_envelope(&path)? {
                Some(mut envelope) => {
                    let count: u64 = envelope.value.parse().map_err(|_| {
                        Error::Infrastructure(format!("value at {} is not a counter", key))
                    })?;
                    envelope.value = (count + 1).to_string();
                    envelope
                }
                None => Envelope::new(key, "1", ttl),
            };
            self.write_envelope(&path, &envelope)?;
            envelope
                .value
                .parse()
                .map_err(|_| Error::Infrastructure(format!("value at {} is not a counter", key)))
        })
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(key) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(decode_key)
            else {
                continue;
            };
            if !key.starts_with(prefix) {
                continue;
            }
            // Records can disappear between listing and reading.
            if self.read_envelope(&path)?.is_some() {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// Percent-encode everything except ASCII alphanumerics, `-` and `_`.
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

fn decode_key(encoded: &str) -> Option<String> {
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = encoded.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
