//! # AST Cache
//!
//! Thread-safe LRU cache of parsed documents keyed by canonical absolute
//! path. Entries are validated against the file's current mtime and size on
//! every hit (optional sha256 content validation for extra safety), so a
//! stale entry can never be served. Dependency edges let an invalidation
//! cascade through documents that import the changed file.
//!
//! All mutations run under a single lock; `get_or_parse` performs the read
//! and parse inside the critical section, which is the simplest correct
//! design (concurrent parsers of the same file would be acceptable, with the
//! last writer winning).

use crate::ast::Document;
use crate::error::{QuillError, Result};
use lru::LruCache;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime};

/// Default cache capacity.
pub const DEFAULT_MAX_ENTRIES: usize = 100;

/// A cached AST entry with validation metadata.
struct CacheEntry {
    ast: Arc<Document>,
    mtime: SystemTime,
    size: u64,
    hash: Option<String>,
    created_at: Instant,
    access_count: u64,
    last_accessed: Instant,
}

impl CacheEntry {
    fn touch(&mut self) {
        self.access_count += 1;
        self.last_accessed = Instant::now();
    }
}

/// Statistics for cache performance monitoring.
#[derive(Debug, Clone, Default)]
pub struct AstCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
    pub evictions: u64,
    pub entries_count: usize,
}

impl AstCacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Per-entry details exposed by [`AstCache::cache_info`].
#[derive(Debug, Clone)]
pub struct CacheEntryInfo {
    pub path: String,
    pub size: u64,
    pub access_count: u64,
    pub age: std::time::Duration,
}

struct CacheState {
    cache: LruCache<String, CacheEntry>,
    /// importer → set of files it depends on.
    dependencies: HashMap<String, HashSet<String>>,
    stats: AstCacheStats,
}

/// Thread-safe LRU cache for parsed document ASTs.
pub struct AstCache {
    state: Mutex<CacheState>,
    enable_hash: bool,
}

impl Default for AstCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES, false)
    }
}

impl AstCache {
    /// Create a cache with the given capacity. `enable_hash` adds sha256
    /// content validation on top of mtime+size (slower but safer).
    pub fn new(max_entries: usize, enable_hash: bool) -> Self {
        let capacity = NonZeroUsize::new(max_entries.max(1)).expect("capacity is non-zero");
        Self {
            state: Mutex::new(CacheState {
                cache: LruCache::new(capacity),
                dependencies: HashMap::new(),
                stats: AstCacheStats::default(),
            }),
            enable_hash,
        }
    }

    fn normalize(path: impl AsRef<Path>) -> String {
        let path = path.as_ref();
        path.canonicalize()
            .unwrap_or_else(|_| PathBuf::from(path))
            .to_string_lossy()
            .into_owned()
    }

    fn file_info(path: &str) -> Option<(SystemTime, u64)> {
        std::fs::metadata(path)
            .ok()
            .map(|m| (m.modified().unwrap_or(SystemTime::UNIX_EPOCH), m.len()))
    }

    fn content_hash(content: &str) -> String {
        hex::encode(Sha256::digest(content.as_bytes()))
    }

    /// Get a cached AST if present and still valid against the file on disk.
    pub fn get(&self, path: impl AsRef<Path>) -> Option<Arc<Document>> {
        #[derive(PartialEq)]
        enum Status {
            Absent,
            Stale,
            Valid,
        }

        let key = Self::normalize(path);
        let file_info = Self::file_info(&key);
        let mut state = self.state.lock().expect("ast cache lock");

        let status = match state.cache.peek(&key) {
            None => Status::Absent,
            Some(entry) => match file_info {
                Some((mtime, size)) if entry.mtime == mtime && entry.size == size => {
                    Status::Valid
                }
                _ => Status::Stale,
            },
        };

        match status {
            Status::Absent => {
                state.stats.misses += 1;
                None
            }
            Status::Stale => {
                state.cache.pop(&key);
                state.stats.misses += 1;
                state.stats.invalidations += 1;
                None
            }
            Status::Valid => {
                // `get_mut` refreshes LRU recency; touch the metadata too.
                let entry = state.cache.get_mut(&key).expect("entry just validated");
                entry.touch();
                let ast = entry.ast.clone();
                state.stats.hits += 1;
                Some(ast)
            }
        }
    }

    /// Get the cached AST or parse the file. `content` may pass the file's
    /// text when the caller already read it.
    pub fn get_or_parse<F>(
        &self,
        path: impl AsRef<Path>,
        parse: F,
        content: Option<&str>,
    ) -> Result<Arc<Document>>
    where
        F: FnOnce(&str) -> Result<Document>,
    {
        let key = Self::normalize(&path);

        if let Some(cached) = self.get(&key) {
            // When hash validation is on and the caller supplied content,
            // double-check before trusting mtime+size.
            if !self.enable_hash || content.is_none() {
                return Ok(cached);
            }
            let matches = {
                let state = self.state.lock().expect("ast cache lock");
                state
                    .cache
                    .peek(&key)
                    .and_then(|e| e.hash.as_deref().map(|h| h == Self::content_hash(content.unwrap())))
                    .unwrap_or(false)
            };
            if matches {
                return Ok(cached);
            }
            self.invalidate(Some(key.as_str()));
        }

        let text = match content {
            Some(text) => text.to_string(),
            None => std::fs::read_to_string(&key)?,
        };
        let ast = Arc::new(parse(&text)?);

        let (mtime, size) =
            Self::file_info(&key).unwrap_or((SystemTime::UNIX_EPOCH, text.len() as u64));
        let hash = self.enable_hash.then(|| Self::content_hash(&text));

        let mut state = self.state.lock().expect("ast cache lock");
        let entry = CacheEntry {
            ast: ast.clone(),
            mtime,
            size,
            hash,
            created_at: Instant::now(),
            access_count: 0,
            last_accessed: Instant::now(),
        };
        // push returns the evicted LRU victim, or the replaced value for the
        // same key; same-key replacement is not an eviction.
        let evicted = state.cache.push(key, entry);
        if let Some((old_key, _)) = evicted {
            if !state.cache.contains(&old_key) {
                state.stats.evictions += 1;
            }
        }
        state.stats.entries_count = state.cache.len();
        Ok(ast)
    }

    /// Manually insert an AST (used by preloading front-ends).
    pub fn put(&self, path: impl AsRef<Path>, ast: Document, content: Option<&str>) {
        let key = Self::normalize(path);
        let (mtime, size) = Self::file_info(&key).unwrap_or((SystemTime::UNIX_EPOCH, 0));
        let hash = match (self.enable_hash, content) {
            (true, Some(text)) => Some(Self::content_hash(text)),
            _ => None,
        };
        let mut state = self.state.lock().expect("ast cache lock");
        let entry = CacheEntry {
            ast: Arc::new(ast),
            mtime,
            size,
            hash,
            created_at: Instant::now(),
            access_count: 0,
            last_accessed: Instant::now(),
        };
        let evicted = state.cache.push(key, entry);
        if let Some((old_key, _)) = evicted {
            if !state.cache.contains(&old_key) {
                state.stats.evictions += 1;
            }
        }
        state.stats.entries_count = state.cache.len();
    }

    /// Invalidate a single path (and everything that depends on it,
    /// transitively) or the whole cache.
    pub fn invalidate(&self, path: Option<&str>) {
        let mut state = self.state.lock().expect("ast cache lock");
        match path {
            None => {
                let count = state.cache.len() as u64;
                state.cache.clear();
                state.dependencies.clear();
                state.stats.invalidations += count;
            }
            Some(path) => {
                let key = Self::normalize(path);
                let mut to_remove = vec![key];
                let mut removed = HashSet::new();

                while let Some(target) = to_remove.pop() {
                    if !removed.insert(target.clone()) {
                        continue;
                    }
                    if state.cache.pop(&target).is_some() {
                        state.stats.invalidations += 1;
                    }
                    // Everything importing `target` goes too.
                    let dependents: Vec<String> = state
                        .dependencies
                        .iter()
                        .filter(|(_, deps)| deps.contains(&target))
                        .map(|(importer, _)| importer.clone())
                        .collect();
                    to_remove.extend(dependents);
                }
            }
        }
        state.stats.entries_count = state.cache.len();
    }

    /// Record that `importer` depends on `importee`.
    pub fn register_dependency(&self, importer: impl AsRef<Path>, importee: impl AsRef<Path>) {
        let importer = Self::normalize(importer);
        let importee = Self::normalize(importee);
        let mut state = self.state.lock().expect("ast cache lock");
        state
            .dependencies
            .entry(importer)
            .or_default()
            .insert(importee);
    }

    /// Preload a set of files, ignoring individual failures.
    pub fn preload<F>(&self, paths: &[PathBuf], mut parse: F)
    where
        F: FnMut(&str) -> Result<Document>,
    {
        for path in paths {
            let _ = self.get_or_parse(path, &mut parse, None);
        }
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> AstCacheStats {
        let mut state = self.state.lock().expect("ast cache lock");
        state.stats.entries_count = state.cache.len();
        state.stats.clone()
    }

    /// Reset counters, keeping resident entries.
    pub fn reset_stats(&self) {
        let mut state = self.state.lock().expect("ast cache lock");
        let entries = state.cache.len();
        state.stats = AstCacheStats {
            entries_count: entries,
            ..AstCacheStats::default()
        };
    }

    /// Drop every entry and dependency edge.
    pub fn clear(&self) {
        let mut state = self.state.lock().expect("ast cache lock");
        state.cache.clear();
        state.dependencies.clear();
        state.stats.entries_count = 0;
    }

    /// Resident keys, most recent first (diagnostics and tests).
    pub fn resident_keys(&self) -> Vec<String> {
        let state = self.state.lock().expect("ast cache lock");
        state.cache.iter().map(|(k, _)| k.clone()).collect()
    }

    /// Detailed per-entry information.
    pub fn cache_info(&self) -> Vec<CacheEntryInfo> {
        let state = self.state.lock().expect("ast cache lock");
        state
            .cache
            .iter()
            .map(|(path, entry)| CacheEntryInfo {
                path: path.clone(),
                size: entry.size,
                access_count: entry.access_count,
                age: entry.created_at.elapsed(),
            })
            .collect()
    }
}

/// File-watcher integration: tracks known mtimes and invalidates the cache
/// when an external change is signalled.
pub struct CacheWatcher {
    cache: Arc<AstCache>,
    watching: Mutex<HashMap<String, SystemTime>>,
}

impl CacheWatcher {
    pub fn new(cache: Arc<AstCache>) -> Self {
        Self {
            cache,
            watching: Mutex::new(HashMap::new()),
        }
    }

    /// Poll a file; invalidate and return true when its mtime moved since
    /// the last check.
    pub fn check_and_invalidate(&self, path: impl AsRef<Path>) -> bool {
        let key = AstCache::normalize(path);
        let current = match std::fs::metadata(&key).and_then(|m| m.modified()) {
            Ok(mtime) => mtime,
            Err(_) => return false,
        };

        let mut watching = self.watching.lock().expect("watcher lock");
        match watching.get(&key) {
            Some(known) if *known != current => {
                watching.insert(key.clone(), current);
                drop(watching);
                self.cache.invalidate(Some(&key));
                true
            }
            Some(_) => false,
            None => {
                watching.insert(key, current);
                false
            }
        }
    }

    /// Callback for external change events (hot reload).
    pub fn on_file_changed(&self, path: impl AsRef<Path>) {
        let key = AstCache::normalize(path);
        self.cache.invalidate(Some(&key));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{ComponentNode, Document};
    use std::io::Write;

    fn component(name: &str) -> Document {
        Document::Component(ComponentNode {
            name: name.into(),
            statements: vec![],
        })
    }

    fn write_file(dir: &tempfile::TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.sync_all().unwrap();
        path
    }

    #[test]
    fn test_parse_once_for_unchanged_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "a.q", "<q:component name=\"A\"/>");
        let cache = AstCache::default();

        let mut parses = 0;
        for _ in 0..3 {
            cache
                .get_or_parse(
                    &path,
                    |_| {
                        parses += 1;
                        Ok(component("A"))
                    },
                    None,
                )
                .unwrap();
        }
        assert_eq!(parses, 1);
        assert_eq!(cache.stats().hits, 2);
    }

    #[test]
    fn test_invalidate_then_get_misses() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "a.q", "x");
        let cache = AstCache::default();
        cache
            .get_or_parse(&path, |_| Ok(component("A")), None)
            .unwrap();

        cache.invalidate(Some(path.to_str().unwrap()));
        assert!(cache.get(&path).is_none());
    }

    #[test]
    fn test_mtime_change_invalidates() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "a.q", "v1");
        let cache = AstCache::default();
        cache
            .get_or_parse(&path, |_| Ok(component("v1")), None)
            .unwrap();

        // Force a metadata change; content length changes too.
        std::thread::sleep(std::time::Duration::from_millis(20));
        write_file(&dir, "a.q", "v2 longer");

        let mut reparsed = false;
        cache
            .get_or_parse(
                &path,
                |_| {
                    reparsed = true;
                    Ok(component("v2"))
                },
                None,
            )
            .unwrap();
        assert!(reparsed);
    }

    #[test]
    fn test_lru_eviction_keeps_most_recent() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_file(&dir, "a.q", "a");
        let b = write_file(&dir, "b.q", "b");
        let c = write_file(&dir, "c.q", "c");

        let cache = AstCache::new(2, false);
        cache.get_or_parse(&a, |_| Ok(component("a")), None).unwrap();
        cache.get_or_parse(&b, |_| Ok(component("b")), None).unwrap();
        // Touch `a` so `b` is the LRU victim.
        cache.get(&a).unwrap();
        cache.get_or_parse(&c, |_| Ok(component("c")), None).unwrap();

        let keys = cache.resident_keys();
        assert_eq!(keys.len(), 2);
        assert!(keys.iter().any(|k| k.ends_with("a.q")));
        assert!(keys.iter().any(|k| k.ends_with("c.q")));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_dependency_invalidation_cascades() {
        let dir = tempfile::tempdir().unwrap();
        let layout = write_file(&dir, "layout.q", "layout");
        let page = write_file(&dir, "page.q", "page");
        let cache = AstCache::default();

        cache
            .get_or_parse(&layout, |_| Ok(component("layout")), None)
            .unwrap();
        cache
            .get_or_parse(&page, |_| Ok(component("page")), None)
            .unwrap();
        cache.register_dependency(&page, &layout);

        cache.invalidate(Some(layout.to_str().unwrap()));
        assert!(cache.get(&page).is_none());
    }

    #[test]
    fn test_watcher_invalidates_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "w.q", "v1");
        let cache = Arc::new(AstCache::default());
        cache
            .get_or_parse(&path, |_| Ok(component("w")), None)
            .unwrap();

        let watcher = CacheWatcher::new(cache.clone());
        assert!(!watcher.check_and_invalidate(&path)); // first sighting

        std::thread::sleep(std::time::Duration::from_millis(20));
        write_file(&dir, "w.q", "v2 changed");
        assert!(watcher.check_and_invalidate(&path));
        assert!(cache.get(&path).is_none());
    }
}
