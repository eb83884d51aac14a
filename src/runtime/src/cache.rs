//! On-disk shader cache.
//!
//! Entries are keyed by a 128-bit content hash and live in a directory
//! versioned by the compiler build, so a driver or compiler update starts a
//! fresh cache instead of serving stale bytecode.

use log::{debug, warn};
use std::fs;
use std::path::PathBuf;
use xxhash_rust::xxh3::Xxh3;

/// Fixed key the compiler's internal state blob is stored under.
pub const COMPILER_STATE_KEY: u128 = 0x17cb_474e_4c55_4dbc_bc2e_d513_2115_bda3;

/// Hash a multi-part key into the cache's 128-bit key space.
pub fn hash_parts(parts: &[&[u8]]) -> u128 {
    let mut hasher = Xxh3::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.digest128()
}

/// A handle to one device's cache directory. All operations are best
/// effort: a cache failure degrades to a recompile, never to an API error.
pub struct ShaderCache {
    dir: Option<PathBuf>,
}

impl ShaderCache {
    /// `root` of `None` disables the cache entirely.
    pub fn new(root: Option<PathBuf>, device_key: u64, compiler_version: u64) -> Self {
        let dir = root.and_then(|root| {
            let dir = root
                .join(format!("{:016x}", device_key))
                .join(format!("{:016x}", compiler_version));
            match fs::create_dir_all(&dir) {
                Ok(()) => Some(dir),
                Err(err) => {
                    warn!("disabling shader cache, cannot create {:?}: {}", dir, err);
                    None
                }
            }
        });
        ShaderCache { dir }
    }

    /// A cache that never hits.
    pub fn disabled() -> Self {
        ShaderCache { dir: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.dir.is_some()
    }

    fn path_for(&self, key: u128) -> Option<PathBuf> {
        self.dir.as_ref().map(|dir| dir.join(format!("{:032x}.bin", key)))
    }

    pub fn store(&self, key: u128, value: &[u8]) {
        if let Some(path) = self.path_for(key) {
            // Write through a temp name so a torn write never becomes a
            // readable entry.
            let tmp = path.with_extension("tmp");
            let result = fs::write(&tmp, value).and_then(|()| fs::rename(&tmp, &path));
            if let Err(err) = result {
                warn!("shader cache store failed for {:032x}: {}", key, err);
            }
        }
    }

    pub fn find(&self, key: u128) -> Option<Vec<u8>> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(bytes) => {
                debug!("shader cache hit for {:032x}", key);
                Some(bytes)
            }
            Err(_) => None,
        }
    }

    /// Drop the handle; entries stay on disk for the next session.
    pub fn close(&mut self) {
        self.dir = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_values() {
        let root = tempfile::tempdir().unwrap();
        let cache = ShaderCache::new(Some(root.path().to_path_buf()), 1, 2);
        let key = hash_parts(&[b"kernel void f() {}", b"-DX=1"]);
        assert!(cache.find(key).is_none());
        cache.store(key, b"bytecode");
        assert_eq!(cache.find(key).unwrap(), b"bytecode");
    }

    #[test]
    fn versions_are_isolated() {
        let root = tempfile::tempdir().unwrap();
        let old = ShaderCache::new(Some(root.path().to_path_buf()), 1, 1);
        let new = ShaderCache::new(Some(root.path().to_path_buf()), 1, 2);
        old.store(42, b"stale");
        assert!(new.find(42).is_none());
    }

    #[test]
    fn disabled_cache_never_hits() {
        let cache = ShaderCache::disabled();
        cache.store(1, b"x");
        assert!(cache.find(1).is_none());
        assert!(!cache.is_enabled());
    }

    #[test]
    fn hash_is_sensitive_to_part_content() {
        let a = hash_parts(&[b"source", b"-DA"]);
        let b = hash_parts(&[b"source", b"-DB"]);
        assert_ne!(a, b);
    }
}
