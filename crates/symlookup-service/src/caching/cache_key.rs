use std::fmt::{self, Write};
use std::hash::{Hash, Hasher};

use sha2::{Digest, Sha256};
use symlookup_sources::ModuleKey;

/// Version of the converted artifact format.
///
/// Bump this whenever the converter produces incompatible output. Entries of other versions live
/// under a different directory and are never read.
pub const SYMCACHE_VERSION: u32 = 1;

/// Identifies one entry of the symbol cache.
///
/// An entry is keyed by the module and by whether try sources contributed to it, so symbols of a
/// try build are never handed to a request that did not ask for them.
#[derive(Debug, Clone, Eq)]
pub struct CacheKey {
    module: ModuleKey,
    include_try: bool,
    hash: [u8; 32],
}

impl CacheKey {
    pub fn new(module: ModuleKey, include_try: bool) -> Self {
        let sources = if include_try { "regular+try" } else { "regular" };
        let metadata = format!(
            "module: {}\ndebug_id: {}\nsources: {sources}\n",
            module.debug_filename(),
            module.debug_id()
        );
        let hash = Sha256::digest(metadata.as_bytes());

        Self {
            module,
            include_try,
            hash: hash.into(),
        }
    }

    pub fn module(&self) -> &ModuleKey {
        &self.module
    }

    pub fn include_try(&self) -> bool {
        self.include_try
    }

    /// Returns the relative path inside the cache for this key.
    ///
    /// The relative path is a sha-256 hash hex-formatted like so:
    /// `v$version/aa/bbccdd/eeff...`
    pub fn cache_path(&self) -> String {
        let mut path = format!("v{SYMCACHE_VERSION}/{:02x}/", self.hash[0]);
        for b in &self.hash[1..4] {
            let _ = write!(path, "{b:02x}");
        }
        path.push('/');
        for b in &self.hash[4..] {
            let _ = write!(path, "{b:02x}");
        }
        path
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.module)?;
        if self.include_try {
            f.write_str(" (with try)")?;
        }
        Ok(())
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_path() {
        let module = ModuleKey::new("xul.pdb", "44e4ec8c2f41492b9369d6b9a059577c2").unwrap();
        let key = CacheKey::new(module.clone(), false);

        let path = key.cache_path();
        let mut segments = path.split('/');
        assert_eq!(segments.next(), Some("v1"));
        assert_eq!(segments.next().map(str::len), Some(2));
        assert_eq!(segments.next().map(str::len), Some(6));
        assert_eq!(segments.next().map(str::len), Some(56));
        assert_eq!(segments.next(), None);

        // stable across constructions, but different per source set
        assert_eq!(CacheKey::new(module.clone(), false).cache_path(), path);
        let with_try = CacheKey::new(module, true);
        assert_ne!(with_try.cache_path(), path);
        assert_ne!(with_try, key);
    }

    #[test]
    fn test_normalized_ids_share_key() {
        let a = CacheKey::new(ModuleKey::new("xul.pdb", "abcd-ef").unwrap(), false);
        let b = CacheKey::new(ModuleKey::new("xul.pdb", "ABCDEF").unwrap(), false);
        assert_eq!(a, b);
        assert_eq!(a.cache_path(), b.cache_path());
        assert_eq!(a.to_string(), "xul.pdb/ABCDEF");
    }
}
