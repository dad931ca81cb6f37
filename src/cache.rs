//! Content-addressed output cache used to resume interrupted accuracy runs.

use crate::error::{Result, SutError};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Key of one batch: the unordered set of its sample indices.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Indices are sorted before joining, so any permutation of the same
    /// batch maps to the same key.
    pub fn from_indices(indices: impl IntoIterator<Item = usize>) -> Self {
        let joined = indices.into_iter().sorted_unstable().join("_");
        Self(format!("q{joined}"))
    }

    pub fn file_name(&self) -> String {
        format!("{}.bin", self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Outputs of one batch keyed by sample index, so a replay can hand each
/// request its own row whatever order the batch arrives in.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedOutputs {
    pub outputs: BTreeMap<usize, Vec<u32>>,
}

impl CachedOutputs {
    pub fn from_rows(rows: impl IntoIterator<Item = (usize, Vec<u32>)>) -> Self {
        Self {
            outputs: rows.into_iter().collect(),
        }
    }

    pub fn get(&self, index: usize) -> Option<&[u32]> {
        self.outputs.get(&index).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }
}

#[derive(Clone, Debug)]
pub struct OutputCache {
    dir: PathBuf,
}

impl OutputCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(key.file_name())
    }

    pub fn load(&self, key: &CacheKey) -> Result<Option<CachedOutputs>> {
        let path = self.path(key);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        let cached = bincode::deserialize(&bytes).map_err(|_| SutError::cache_decode(&path))?;
        debug!("loaded cached outputs from {}", path.display());
        Ok(Some(cached))
    }

    pub fn store(&self, key: &CacheKey, outputs: &CachedOutputs) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path(key);
        let bytes = bincode::serialize(outputs)
            .map_err(|e| SutError::Io(std::io::Error::other(e.to_string())))?;
        write_atomic(&path, &bytes)?;
        Ok(path)
    }
}

// An interrupted run must never leave a truncated entry behind.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("bin.tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_ignores_order() {
        let a = CacheKey::from_indices([12, 3, 7]);
        let b = CacheKey::from_indices([7, 12, 3]);
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "q3_7_12");
        assert_eq!(a.file_name(), "q3_7_12.bin");
    }

    #[test]
    fn store_then_load() {
        let dir = std::env::temp_dir().join(format!("llama_sut_cache_{}", std::process::id()));
        let cache = OutputCache::new(&dir);
        let key = CacheKey::from_indices([1, 0]);
        assert!(cache.load(&key).unwrap().is_none());

        let outputs = CachedOutputs::from_rows([(1, vec![5, 6, 2]), (0, vec![7])]);
        let path = cache.store(&key, &outputs).unwrap();
        assert!(path.ends_with("q0_1.bin"));
        let loaded = cache.load(&key).unwrap().unwrap();
        assert_eq!(loaded, outputs);
        assert_eq!(loaded.get(1), Some(&[5, 6, 2][..]));
        assert_eq!(loaded.get(0), Some(&[7][..]));
        assert_eq!(loaded.get(2), None);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn corrupt_entry_is_reported() {
        let dir = std::env::temp_dir().join(format!("llama_sut_corrupt_{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let cache = OutputCache::new(&dir);
        let key = CacheKey::from_indices([4]);
        fs::write(cache.path(&key), [0xff, 0x01]).unwrap();
        assert!(matches!(
            cache.load(&key),
            Err(SutError::CacheDecode { .. })
        ));
        let _ = fs::remove_dir_all(&dir);
    }
}
