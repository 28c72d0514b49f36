//! Timestamp-validated artifact cache.
//!
//! Layout: one entry per output name directly under the cache root. An entry
//! is an opaque file or directory; its modification time is the only
//! freshness signal. Entries are only ever created by renaming a finished
//! temporary directory into place, so readers need no locking.

pub mod key;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::BuildError;
use crate::logging::{operations, status};

pub use key::output_name;

/// Marker embedded in the name of in-progress temporary directories. `~` never
/// survives [`key::output_name`], so no published entry carries it.
const TEMP_MARKER: &str = "~tmp";

/// Get default cache directory following XDG conventions
///
/// - Linux/Unix: $XDG_CACHE_HOME/rtbuild or ~/.cache/rtbuild
/// - macOS: ~/Library/Caches/rtbuild
/// - Windows: %LOCALAPPDATA%/rtbuild
pub fn default_cache_dir() -> PathBuf {
    if let Some(cache_dir) = dirs::cache_dir() {
        cache_dir.join("rtbuild")
    } else {
        PathBuf::from(".rtbuild/cache")
    }
}

/// Return the newest modification time among `paths`.
///
/// `None` for an empty slice. Any stat failure is returned as an error.
pub fn newest_timestamp(paths: &[PathBuf]) -> Result<Option<SystemTime>> {
    let mut newest: Option<SystemTime> = None;
    for path in paths {
        let modified = fs::metadata(path)
            .and_then(|m| m.modified())
            .map_err(|e| BuildError::io(path, e))?;
        newest = Some(match newest {
            Some(current) if current >= modified => current,
            _ => modified,
        });
    }
    Ok(newest)
}

/// A cache entry as seen by [`ArtifactCache::list`]
#[derive(Debug, Clone)]
pub struct CacheEntryInfo {
    pub name: String,
    pub path: PathBuf,
    pub modified: DateTime<Utc>,
    pub size_bytes: u64,
}

/// Cache statistics
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: u64,
    pub root: PathBuf,
}

/// Artifact cache rooted at a single directory
#[derive(Debug, Clone)]
pub struct ArtifactCache {
    root: PathBuf,
}

impl ArtifactCache {
    /// Create a cache handle. The root directory is created lazily.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Final location of the entry named `output_name`
    pub fn entry_path(&self, output_name: &str) -> PathBuf {
        self.root.join(output_name)
    }

    /// Look up a fresh entry.
    ///
    /// Returns `Ok(None)` when there is no entry or when the entry is not
    /// strictly newer than every file in `source_files`. A stale entry is
    /// deleted before returning.
    pub fn load(&self, output_name: &str, source_files: &[PathBuf]) -> Result<Option<PathBuf>> {
        let cache_path = self.entry_path(output_name);
        let entry_modified = match fs::metadata(&cache_path) {
            Ok(meta) => meta
                .modified()
                .map_err(|e| BuildError::io(&cache_path, e))?,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(
                    operation = operations::CACHE_LOAD,
                    status = status::MISS,
                    output_name,
                    "cache miss"
                );
                return Ok(None);
            }
            Err(e) => return Err(BuildError::io(&cache_path, e).into()),
        };

        let source_modified = newest_timestamp(source_files)?;

        let fresh = match source_modified {
            Some(newest) => entry_modified > newest,
            None => true,
        };

        if fresh {
            debug!(
                operation = operations::CACHE_LOAD,
                status = status::HIT,
                output_name,
                "cache hit"
            );
            return Ok(Some(cache_path));
        }

        info!(
            operation = operations::CACHE_LOAD,
            status = status::STALE,
            output_name,
            "evicting stale cache entry"
        );
        remove_path(&cache_path)?;
        Ok(None)
    }

    /// Publish the file or directory at `temp_path` as `output_name`.
    ///
    /// `temp_path` must be on the same filesystem as the cache root (see
    /// [`ArtifactCache::temp_dir`]) so that the rename is atomic.
    pub fn store(
        &self,
        temp_path: &Path,
        output_name: &str,
        source_files: &[PathBuf],
    ) -> Result<PathBuf> {
        if source_files.is_empty() {
            return Err(BuildError::EmptySourceSet {
                name: output_name.to_string(),
            }
            .into());
        }

        fs::create_dir_all(&self.root).map_err(|e| BuildError::io(&self.root, e))?;

        let cache_path = self.entry_path(output_name);
        if let Err(first) = fs::rename(temp_path, &cache_path) {
            if !cache_path.exists() {
                return Err(BuildError::io(temp_path, first).into());
            }
            // A directory rename cannot replace a non-empty directory.
            remove_path(&cache_path)?;
            if let Err(second) = fs::rename(temp_path, &cache_path) {
                if !cache_path.exists() {
                    return Err(BuildError::io(temp_path, second).into());
                }
                // Another writer published the same entry in between.
                debug!(
                    operation = operations::CACHE_STORE,
                    output_name, "entry republished concurrently, keeping it"
                );
                remove_path(temp_path)?;
            }
        }

        info!(
            operation = operations::CACHE_STORE,
            status = status::SUCCESS,
            output_name,
            path = %cache_path.display(),
            "stored artifact"
        );
        Ok(cache_path)
    }

    /// Create a fresh temporary directory inside the cache root for building
    /// `output_name`. The caller owns it until it is passed to [`store`].
    ///
    /// [`store`]: ArtifactCache::store
    pub fn temp_dir(&self, output_name: &str) -> Result<PathBuf> {
        fs::create_dir_all(&self.root).map_err(|e| BuildError::io(&self.root, e))?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("{output_name}{TEMP_MARKER}"))
            .tempdir_in(&self.root)
            .map_err(|e| BuildError::io(&self.root, e))?;
        Ok(dir.keep())
    }

    /// Remove a single entry. Removing a missing entry is not an error.
    pub fn remove(&self, output_name: &str) -> Result<()> {
        let path = self.entry_path(output_name);
        remove_path(&path)?;
        debug!(operation = operations::CACHE_REMOVE, output_name, "removed entry");
        Ok(())
    }

    /// List published entries, sorted by name
    pub fn list(&self) -> Result<Vec<CacheEntryInfo>> {
        let read_dir = match fs::read_dir(&self.root) {
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(BuildError::io(&self.root, e).into()),
        };

        let mut entries = Vec::new();
        for dir_entry in read_dir {
            let dir_entry = dir_entry.map_err(|e| BuildError::io(&self.root, e))?;
            let name = dir_entry.file_name().to_string_lossy().into_owned();
            if name.contains(TEMP_MARKER) {
                continue;
            }
            let path = dir_entry.path();
            let modified = dir_entry
                .metadata()
                .and_then(|m| m.modified())
                .map_err(|e| BuildError::io(&path, e))?;
            let size_bytes = disk_usage(&path)
                .with_context(|| format!("Failed to measure cache entry: {}", path.display()))?;

            entries.push(CacheEntryInfo {
                name,
                path,
                modified: DateTime::<Utc>::from(modified),
                size_bytes,
            });
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Remove every entry, including abandoned temporary directories.
    /// Returns the number of paths removed.
    pub fn clear(&self) -> Result<usize> {
        let read_dir = match fs::read_dir(&self.root) {
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(BuildError::io(&self.root, e).into()),
        };

        let mut removed = 0;
        for dir_entry in read_dir {
            let dir_entry = dir_entry.map_err(|e| BuildError::io(&self.root, e))?;
            remove_path(&dir_entry.path())?;
            removed += 1;
        }
        info!(operation = operations::CACHE_REMOVE, removed, "cleared cache");
        Ok(removed)
    }

    pub fn stats(&self) -> Result<CacheStats> {
        let entries = self.list()?;
        Ok(CacheStats {
            entries: entries.len(),
            total_bytes: entries.iter().map(|e| e.size_bytes).sum(),
            root: self.root.clone(),
        })
    }
}

/// Delete a file or directory tree, ignoring a missing path.
fn remove_path(path: &Path) -> Result<()> {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(BuildError::io(path, e).into()),
    }
}

/// Total size of the regular files below `path`.
fn disk_usage(path: &Path) -> Result<u64> {
    let mut total = 0;
    for entry in WalkDir::new(path) {
        let entry = entry?;
        if entry.file_type().is_file() {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::time::Duration;
    use tempfile::TempDir;

    fn set_mtime(path: &Path, time: SystemTime) {
        File::options()
            .write(!path.is_dir())
            .read(path.is_dir())
            .open(path)
            .unwrap()
            .set_modified(time)
            .unwrap();
    }

    fn write_sources(dir: &Path, names: &[&str]) -> Vec<PathBuf> {
        names
            .iter()
            .map(|name| {
                let path = dir.join(name);
                fs::write(&path, format!("/* {name} */")).unwrap();
                path
            })
            .collect()
    }

    /// Publish an entry and pin its mtime
    fn publish(cache: &ArtifactCache, name: &str, sources: &[PathBuf], mtime: SystemTime) -> PathBuf {
        let tmp = cache.temp_dir(name).unwrap();
        fs::write(tmp.join("lib.a"), b"!<arch>\n").unwrap();
        let path = cache.store(&tmp, name, sources).unwrap();
        set_mtime(&path, mtime);
        path
    }

    #[test]
    fn test_newest_timestamp() {
        let temp = TempDir::new().unwrap();
        let sources = write_sources(temp.path(), &["a.c", "b.c", "c.c"]);
        let base = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        set_mtime(&sources[0], base);
        set_mtime(&sources[1], base + Duration::from_secs(50));
        set_mtime(&sources[2], base + Duration::from_secs(10));

        let newest = newest_timestamp(&sources).unwrap();
        assert_eq!(newest, Some(base + Duration::from_secs(50)));
        assert_eq!(newest_timestamp(&[]).unwrap(), None);
    }

    #[test]
    fn test_newest_timestamp_missing_file() {
        let temp = TempDir::new().unwrap();
        let err = newest_timestamp(&[temp.path().join("missing.c")]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::Io { .. })
        ));
    }

    #[test]
    fn test_load_missing_entry() {
        let temp = TempDir::new().unwrap();
        let cache = ArtifactCache::new(temp.path().join("cache"));
        let sources = write_sources(temp.path(), &["a.c"]);
        assert!(cache.load("libc-arm", &sources).unwrap().is_none());
    }

    #[test]
    fn test_store_then_load_hit() {
        let temp = TempDir::new().unwrap();
        let cache = ArtifactCache::new(temp.path().join("cache"));
        let sources = write_sources(temp.path(), &["a.c", "b.c"]);
        let old = SystemTime::now() - Duration::from_secs(3600);
        for source in &sources {
            set_mtime(source, old);
        }

        let stored = publish(&cache, "libc-arm", &sources, SystemTime::now());
        assert_eq!(stored, cache.entry_path("libc-arm"));
        assert!(stored.join("lib.a").is_file());

        let loaded = cache.load("libc-arm", &sources).unwrap();
        assert_eq!(loaded, Some(stored.clone()));
        // A second lookup is still a hit.
        assert_eq!(cache.load("libc-arm", &sources).unwrap(), Some(stored));
    }

    #[test]
    fn test_stale_entry_is_evicted() {
        let temp = TempDir::new().unwrap();
        let cache = ArtifactCache::new(temp.path().join("cache"));
        let sources = write_sources(temp.path(), &["a.c", "b.c"]);
        let entry_time = SystemTime::now() - Duration::from_secs(600);
        let path = publish(&cache, "libc-arm", &sources, entry_time);

        set_mtime(&sources[1], entry_time + Duration::from_secs(1));

        assert!(cache.load("libc-arm", &sources).unwrap().is_none());
        assert!(!path.exists());
    }

    #[test]
    fn test_equal_timestamp_is_stale() {
        let temp = TempDir::new().unwrap();
        let cache = ArtifactCache::new(temp.path().join("cache"));
        let sources = write_sources(temp.path(), &["a.c"]);
        let instant = SystemTime::now() - Duration::from_secs(600);
        set_mtime(&sources[0], instant);
        let path = publish(&cache, "libc-arm", &sources, instant);

        assert!(cache.load("libc-arm", &sources).unwrap().is_none());
        assert!(!path.exists());
    }

    #[test]
    fn test_load_propagates_source_stat_error() {
        let temp = TempDir::new().unwrap();
        let cache = ArtifactCache::new(temp.path().join("cache"));
        let sources = write_sources(temp.path(), &["a.c"]);
        publish(&cache, "libc-arm", &sources, SystemTime::now());

        let missing = vec![temp.path().join("gone.c")];
        assert!(cache.load("libc-arm", &missing).is_err());
        // Entry must survive a failed freshness check.
        assert!(cache.entry_path("libc-arm").exists());
    }

    #[test]
    fn test_store_requires_sources() {
        let temp = TempDir::new().unwrap();
        let cache = ArtifactCache::new(temp.path().join("cache"));
        let tmp = cache.temp_dir("empty").unwrap();

        let err = cache.store(&tmp, "empty", &[]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::EmptySourceSet { .. })
        ));
        assert!(!cache.entry_path("empty").exists());
        assert!(tmp.exists());
    }

    #[test]
    fn test_store_replaces_existing_entry() {
        let temp = TempDir::new().unwrap();
        let cache = ArtifactCache::new(temp.path().join("cache"));
        let sources = write_sources(temp.path(), &["a.c"]);

        let first = cache.temp_dir("libm").unwrap();
        fs::write(first.join("lib.a"), b"first").unwrap();
        cache.store(&first, "libm", &sources).unwrap();

        let second = cache.temp_dir("libm").unwrap();
        fs::write(second.join("lib.a"), b"second").unwrap();
        let path = cache.store(&second, "libm", &sources).unwrap();

        assert_eq!(fs::read(path.join("lib.a")).unwrap(), b"second");
        assert!(!first.exists());
        assert!(!second.exists());
    }

    #[test]
    fn test_store_single_file_entry() {
        let temp = TempDir::new().unwrap();
        let cache = ArtifactCache::new(temp.path().join("cache"));
        let sources = write_sources(temp.path(), &["crt1.c"]);

        fs::create_dir_all(cache.root()).unwrap();
        let tmp_file = cache.root().join("crt1.o~tmp42");
        fs::write(&tmp_file, b"obj").unwrap();
        let path = cache.store(&tmp_file, "crt1.o", &sources).unwrap();
        assert!(path.is_file());
    }

    #[test]
    fn test_list_stats_and_clear() {
        let temp = TempDir::new().unwrap();
        let cache = ArtifactCache::new(temp.path().join("cache"));
        let sources = write_sources(temp.path(), &["a.c"]);

        for name in ["musl-x86_64", "compiler-rt-arm"] {
            let tmp = cache.temp_dir(name).unwrap();
            fs::write(tmp.join("lib.a"), vec![0u8; 100]).unwrap();
            cache.store(&tmp, name, &sources).unwrap();
        }
        // An abandoned build directory is not a published entry.
        let abandoned = cache.temp_dir("picolibc-arm").unwrap();

        let entries = cache.list().unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["compiler-rt-arm", "musl-x86_64"]);
        assert!(entries.iter().all(|e| e.size_bytes == 100));

        let stats = cache.stats().unwrap();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.total_bytes, 200);

        assert_eq!(cache.clear().unwrap(), 3);
        assert!(cache.list().unwrap().is_empty());
        assert!(!abandoned.exists());
    }

    #[test]
    fn test_list_keeps_entries_named_like_tmp() {
        let temp = TempDir::new().unwrap();
        let cache = ArtifactCache::new(temp.path().join("cache"));
        let sources = write_sources(temp.path(), &["a.c"]);

        let name = output_name("foo.tmpl", "arm--none-eabi", "", &[]);
        let tmp = cache.temp_dir(&name).unwrap();
        assert!(tmp.file_name().unwrap().to_string_lossy().contains(TEMP_MARKER));
        fs::write(tmp.join("lib.a"), b"!<arch>\n").unwrap();
        cache.store(&tmp, &name, &sources).unwrap();
        let _abandoned = cache.temp_dir(&name).unwrap();

        let names: Vec<_> = cache.list().unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec![name]);
    }

    #[test]
    fn test_list_without_root() {
        let temp = TempDir::new().unwrap();
        let cache = ArtifactCache::new(temp.path().join("never-created"));
        assert!(cache.list().unwrap().is_empty());
        assert_eq!(cache.clear().unwrap(), 0);
    }

    #[test]
    fn test_remove_missing_is_ok() {
        let temp = TempDir::new().unwrap();
        let cache = ArtifactCache::new(temp.path());
        cache.remove("nothing-here").unwrap();
    }

    #[test]
    fn test_default_cache_dir() {
        let cache_dir = default_cache_dir();
        assert!(cache_dir.to_string_lossy().contains("rtbuild"));
    }
}
