//! Versioned key-value store.
//!
//! Both the history and the state engine persist through this wrapper: every
//! mutation is committed atomically under a version tag, an undo record per
//! version allows rolling the data column back to any tag still inside the
//! retained window, and a schema-version guard refuses databases written by
//! a newer node.

use std::path::Path;
use std::sync::Arc;

use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, Direction, IteratorMode,
    MultiThreaded, Options, WriteBatch,
};
use serde::{Deserialize, Serialize};

use crate::errors::{ChainError, ChainResult};
use crate::types::VersionTag;

pub const STORE_SCHEMA_VERSION: u32 = 1;

const CF_DATA: &str = "data";
const CF_UNDO: &str = "undo";
const CF_META: &str = "meta";

const SCHEMA_VERSION_KEY: &[u8] = b"schema_version";
const VERSIONS_KEY: &[u8] = b"versions";

/// Prior values of every key a version touched, for rollback.
#[derive(Serialize, Deserialize)]
struct UndoRecord {
    entries: Vec<(Vec<u8>, Option<Vec<u8>>)>,
}

pub struct VersionedStore {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
    keep_versions: usize,
}

impl VersionedStore {
    pub fn open(path: &Path, keep_versions: usize) -> ChainResult<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_DATA, Options::default()),
            ColumnFamilyDescriptor::new(CF_UNDO, Options::default()),
            ColumnFamilyDescriptor::new(CF_META, Options::default()),
        ];
        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cf_descriptors)?;
        let store = Self {
            db: Arc::new(db),
            keep_versions: keep_versions.max(1),
        };
        store.ensure_schema_supported()?;
        Ok(store)
    }

    fn cf(&self, name: &str) -> ChainResult<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| ChainError::Fatal(format!("missing column family {name}")))
    }

    fn ensure_schema_supported(&self) -> ChainResult<()> {
        let meta = self.cf(CF_META)?;
        match self.db.get_cf(&meta, SCHEMA_VERSION_KEY)? {
            Some(bytes) => {
                let found: [u8; 4] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| ChainError::Fatal("invalid schema version encoding".into()))?;
                let found = u32::from_be_bytes(found);
                if found != STORE_SCHEMA_VERSION {
                    return Err(ChainError::Config(format!(
                        "database schema version {found} is not the supported {STORE_SCHEMA_VERSION}"
                    )));
                }
                Ok(())
            }
            None => {
                self.db.put_cf(
                    &meta,
                    SCHEMA_VERSION_KEY,
                    STORE_SCHEMA_VERSION.to_be_bytes(),
                )?;
                Ok(())
            }
        }
    }

    pub fn get(&self, key: &[u8]) -> ChainResult<Option<Vec<u8>>> {
        let data = self.cf(CF_DATA)?;
        Ok(self.db.get_cf(&data, key)?)
    }

    pub fn contains(&self, key: &[u8]) -> ChainResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// All data entries under `prefix`, in key order.
    pub fn prefix_scan(&self, prefix: &[u8]) -> ChainResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let data = self.cf(CF_DATA)?;
        let mut out = Vec::new();
        let iter = self
            .db
            .iterator_cf(&data, IteratorMode::From(prefix, Direction::Forward));
        for entry in iter {
            let (key, value) = entry?;
            if !key.starts_with(prefix) {
                break;
            }
            out.push((key.to_vec(), value.to_vec()));
        }
        Ok(out)
    }

    fn versions_list(&self) -> ChainResult<Vec<[u8; 32]>> {
        let meta = self.cf(CF_META)?;
        match self.db.get_cf(&meta, VERSIONS_KEY)? {
            Some(bytes) => Ok(bincode::deserialize(&bytes)?),
            None => Ok(Vec::new()),
        }
    }

    /// Retained version tags, newest last.
    pub fn rollback_versions(&self) -> ChainResult<Vec<VersionTag>> {
        Ok(self
            .versions_list()?
            .into_iter()
            .map(VersionTag)
            .collect())
    }

    pub fn current_version(&self) -> ChainResult<Option<VersionTag>> {
        Ok(self.versions_list()?.last().copied().map(VersionTag))
    }

    /// Applies `inserts` and `removes` to the data column as one atomic
    /// batch committed under `version`, recording prior values for rollback
    /// and pruning undo records that fall out of the retained window.
    pub fn commit(
        &self,
        version: VersionTag,
        inserts: &[(Vec<u8>, Vec<u8>)],
        removes: &[Vec<u8>],
    ) -> ChainResult<()> {
        let mut versions = self.versions_list()?;
        if versions.contains(version.as_bytes()) {
            return Err(ChainError::Fatal(format!(
                "version {version} committed twice"
            )));
        }

        let data = self.cf(CF_DATA)?;
        let undo = self.cf(CF_UNDO)?;
        let meta = self.cf(CF_META)?;

        let mut undo_entries = Vec::with_capacity(inserts.len() + removes.len());
        for (key, _) in inserts {
            undo_entries.push((key.clone(), self.db.get_cf(&data, key)?));
        }
        for key in removes {
            undo_entries.push((key.clone(), self.db.get_cf(&data, key)?));
        }

        let mut batch = WriteBatch::default();
        for (key, value) in inserts {
            batch.put_cf(&data, key, value);
        }
        for key in removes {
            batch.delete_cf(&data, key);
        }
        let record = UndoRecord {
            entries: undo_entries,
        };
        batch.put_cf(&undo, version.as_bytes(), bincode::serialize(&record)?);

        versions.push(*version.as_bytes());
        while versions.len() > self.keep_versions {
            let expired = versions.remove(0);
            batch.delete_cf(&undo, expired);
        }
        batch.put_cf(&meta, VERSIONS_KEY, bincode::serialize(&versions)?);

        self.db.write(batch)?;
        Ok(())
    }

    /// Index maintenance outside the undo log: applies the writes atomically
    /// without recording a version. Entries written this way are not touched
    /// by [`VersionedStore::rollback_to`].
    pub fn put_unversioned(
        &self,
        inserts: &[(Vec<u8>, Vec<u8>)],
        removes: &[Vec<u8>],
    ) -> ChainResult<()> {
        let data = self.cf(CF_DATA)?;
        let mut batch = WriteBatch::default();
        for (key, value) in inserts {
            batch.put_cf(&data, key, value);
        }
        for key in removes {
            batch.delete_cf(&data, key);
        }
        self.db.write(batch)?;
        Ok(())
    }

    /// Restores the data column to the state it had right after `version`
    /// was committed. Fails with `NotApplicable` when `version` has left the
    /// retained window.
    pub fn rollback_to(&self, version: &VersionTag) -> ChainResult<()> {
        let mut versions = self.versions_list()?;
        let position = versions
            .iter()
            .position(|v| v == version.as_bytes())
            .ok_or_else(|| {
                ChainError::NotApplicable(format!("version {version} outside rollback window"))
            })?;

        let data = self.cf(CF_DATA)?;
        let undo = self.cf(CF_UNDO)?;
        let meta = self.cf(CF_META)?;

        let mut batch = WriteBatch::default();
        for newer in versions[position + 1..].iter().rev() {
            let record_bytes = self.db.get_cf(&undo, newer)?.ok_or_else(|| {
                ChainError::Fatal(format!(
                    "undo record missing for retained version {}",
                    hex::encode(newer)
                ))
            })?;
            let record: UndoRecord = bincode::deserialize(&record_bytes)?;
            for (key, prior) in record.entries {
                match prior {
                    Some(value) => batch.put_cf(&data, key, value),
                    None => batch.delete_cf(&data, key),
                }
            }
            batch.delete_cf(&undo, newer);
        }
        versions.truncate(position + 1);
        batch.put_cf(&meta, VERSIONS_KEY, bincode::serialize(&versions)?);

        self.db.write(batch)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ModifierId;

    fn version(tag: u8) -> VersionTag {
        ModifierId([tag; 32])
    }

    fn open_store(keep: usize) -> (tempfile::TempDir, VersionedStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = VersionedStore::open(dir.path(), keep).unwrap();
        (dir, store)
    }

    #[test]
    fn commit_and_get() {
        let (_dir, store) = open_store(10);
        store
            .commit(
                version(1),
                &[(b"a".to_vec(), b"1".to_vec())],
                &[],
            )
            .unwrap();
        assert_eq!(store.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.current_version().unwrap(), Some(version(1)));
    }

    #[test]
    fn rollback_restores_prior_values() {
        let (_dir, store) = open_store(10);
        store
            .commit(version(1), &[(b"a".to_vec(), b"1".to_vec())], &[])
            .unwrap();
        store
            .commit(
                version(2),
                &[(b"a".to_vec(), b"2".to_vec()), (b"b".to_vec(), b"x".to_vec())],
                &[],
            )
            .unwrap();
        store
            .commit(version(3), &[], &[b"a".to_vec()])
            .unwrap();

        store.rollback_to(&version(1)).unwrap();
        assert_eq!(store.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.get(b"b").unwrap(), None);
        assert_eq!(store.current_version().unwrap(), Some(version(1)));
    }

    #[test]
    fn rollback_outside_window_fails_cleanly() {
        let (_dir, store) = open_store(3);
        for tag in 1..=5u8 {
            store
                .commit(version(tag), &[(vec![tag], vec![tag])], &[])
                .unwrap();
        }
        let err = store.rollback_to(&version(1)).unwrap_err();
        assert!(matches!(err, ChainError::NotApplicable(_)));
        // Data is untouched by the failed rollback.
        assert_eq!(store.get(&[5u8]).unwrap(), Some(vec![5u8]));
        let retained = store.rollback_versions().unwrap();
        assert_eq!(retained.len(), 3);
        assert_eq!(retained.last(), Some(&version(5)));
    }

    #[test]
    fn duplicate_version_is_fatal() {
        let (_dir, store) = open_store(10);
        store.commit(version(1), &[], &[]).unwrap();
        assert!(matches!(
            store.commit(version(1), &[], &[]),
            Err(ChainError::Fatal(_))
        ));
    }

    #[test]
    fn prefix_scan_is_bounded() {
        let (_dir, store) = open_store(10);
        store
            .commit(
                version(1),
                &[
                    (b"a:1".to_vec(), b"x".to_vec()),
                    (b"a:2".to_vec(), b"y".to_vec()),
                    (b"b:1".to_vec(), b"z".to_vec()),
                ],
                &[],
            )
            .unwrap();
        let hits = store.prefix_scan(b"a:").unwrap();
        assert_eq!(hits.len(), 2);
    }
}
