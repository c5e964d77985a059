//! In-memory image of one list.
//!
//! Values are kept exactly as encoded in the list's file so a foreign byte
//! order survives rewrites; [`Codec`] is applied at the handle boundary.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::{Path, PathBuf};

use crate::codec::Codec;
use crate::datafile::{read_data_file, write_data_file, DataFileContents, LoadMode};
use crate::error::StoreResult;
use crate::format::FileHeader;
use crate::log::LogOp;
use crate::record::{CounterRecord, MetaKey, SCHEMA_VERSION};

/// Ordered token → encoded value map backed by a data file.
#[derive(Debug)]
pub struct Table {
    path: PathBuf,
    header: FileHeader,
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl Table {
    /// Create a new list file stamped with the current schema version.
    pub fn create(path: &Path, buffer_bytes: usize) -> StoreResult<Self> {
        let header = FileHeader::native();
        let mut entries = BTreeMap::new();
        let version = CounterRecord::counts(SCHEMA_VERSION, 0);
        let key = MetaKey::WordlistVersion.token().to_vec();
        entries.insert(key, Codec::NATIVE.encode(&version, false));
        write_data_file(path, &header, &entries, buffer_bytes)?;
        Ok(Self {
            path: path.to_path_buf(),
            header,
            entries,
        })
    }

    /// Empty image for a list whose file does not exist yet.
    pub fn empty(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            header: FileHeader::native(),
            entries: BTreeMap::new(),
        }
    }

    /// Load the list's data file.
    pub fn load(path: &Path, mode: LoadMode, buffer_bytes: usize) -> StoreResult<Self> {
        read_data_file(path, mode, buffer_bytes).map(|c| Self::from_contents(path, c))
    }

    pub fn from_contents(path: &Path, contents: DataFileContents) -> Self {
        Self {
            path: path.to_path_buf(),
            header: contents.header,
            entries: contents.entries,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    /// Codec matching the file's byte order.
    pub fn codec(&self) -> Codec {
        Codec::for_order(self.header.byte_order)
    }

    pub fn get(&self, key: &[u8]) -> Option<&Vec<u8>> {
        self.entries.get(key)
    }

    pub fn insert(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.entries.insert(key, value);
    }

    pub fn remove(&mut self, key: &[u8]) -> Option<Vec<u8>> {
        self.entries.remove(key)
    }

    /// Apply a logged mutation.
    pub fn apply(&mut self, op: &LogOp) {
        match &op.value {
            Some(v) => self.insert(op.key.clone(), v.clone()),
            None => {
                self.remove(&op.key);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in token order.
    pub fn iter(&self) -> impl Iterator<Item = (&Vec<u8>, &Vec<u8>)> {
        self.entries.iter()
    }

    /// Up to `limit` entries with tokens strictly after `after`.
    pub fn chunk_after(&self, after: Option<&[u8]>, limit: usize) -> Vec<(Vec<u8>, Vec<u8>)> {
        let lower = match after {
            Some(k) => Bound::Excluded(k),
            None => Bound::Unbounded,
        };
        self.entries
            .range::<[u8], _>((lower, Bound::Unbounded))
            .take(limit)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Rewrite the data file from this image.
    pub fn rewrite(&self, buffer_bytes: usize) -> StoreResult<u64> {
        write_data_file(&self.path, &self.header, &self.entries, buffer_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const BUF: usize = 64 * 1024;

    fn op(key: &[u8], value: Option<Vec<u8>>) -> LogOp {
        LogOp {
            list: "spam".into(),
            key: key.to_vec(),
            value,
        }
    }

    #[test]
    fn test_create_apply_rewrite_load() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("spam.db");
        let mut t = Table::create(&path, BUF).unwrap();
        let raw = t.get(b".WORDLIST_VERSION").unwrap();
        assert_eq!(Codec::NATIVE.decode(raw).unwrap().spam_count, SCHEMA_VERSION);

        t.apply(&op(b"cash", Some(vec![2; 8])));
        t.apply(&op(b"free", Some(vec![3; 8])));
        t.apply(&op(b"cash", None));
        t.rewrite(BUF).unwrap();

        let loaded = Table::load(&path, LoadMode::Strict, BUF).unwrap();
        let keys: Vec<_> = loaded.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(keys, vec![b".WORDLIST_VERSION".to_vec(), b"free".to_vec()]);
        assert!(!loaded.codec().byte_order_differs());
    }

    #[test]
    fn test_chunk_after() {
        let tmp = TempDir::new().unwrap();
        let mut t = Table::empty(&tmp.path().join("good.db"));
        for k in [b"a", b"b", b"c", b"d", b"e"] {
            t.insert(k.to_vec(), vec![0; 8]);
        }
        let first: Vec<_> = t.chunk_after(None, 2).into_iter().map(|(k, _)| k).collect();
        assert_eq!(first, vec![b"a".to_vec(), b"b".to_vec()]);
        let next: Vec<_> = t
            .chunk_after(Some(&b"b"[..]), 10)
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(next, vec![b"c".to_vec(), b"d".to_vec(), b"e".to_vec()]);
        assert!(t.chunk_after(Some(&b"e"[..]), 10).is_empty());
    }
}
