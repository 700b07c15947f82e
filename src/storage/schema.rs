//! RocksDB schema: column families and the database manager.
//!
//! One column family per durable table, a shared block cache, bloom
//! filters on point-lookup families, and synced atomic write batches
//! for every multi-row mutation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamily, ColumnFamilyDescriptor, DBCompressionType,
    IteratorMode, Options, WriteBatch, WriteOptions, DB,
};

/// Column family names, one per table.
pub mod cf_names {
    pub const UTXOS: &str = "cf_utxos";
    pub const TRANSACTIONS: &str = "cf_transactions";
    pub const BLOCKS: &str = "cf_blocks";
    pub const VAULT_DEPOSITS: &str = "cf_vault_deposits";
    pub const VAULT_WITHDRAWALS: &str = "cf_vault_withdrawals";
    pub const RECEIPTS: &str = "cf_receipts";
    pub const META: &str = "cf_meta";

    pub const ALL: [&str; 7] = [
        UTXOS,
        TRANSACTIONS,
        BLOCKS,
        VAULT_DEPOSITS,
        VAULT_WITHDRAWALS,
        RECEIPTS,
        META,
    ];
}

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Database directory.
    pub path: PathBuf,

    /// Write buffer size per column family.
    pub write_buffer_size: usize,

    /// Shared block cache size.
    pub block_cache_size: usize,

    /// Maximum open files.
    pub max_open_files: i32,

    /// Bloom filters on point-lookup column families.
    pub enable_bloom_filters: bool,

    /// Compression for all column families.
    pub compression_type: DBCompressionType,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./firth_db"),
            write_buffer_size: 64 * 1024 * 1024,
            block_cache_size: 256 * 1024 * 1024,
            max_open_files: 1000,
            enable_bloom_filters: true,
            compression_type: DBCompressionType::Lz4,
        }
    }
}

impl DbConfig {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    fn cf_options(&self, cf_name: &str, shared_cache: &Cache) -> Options {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_write_buffer_size(self.write_buffer_size);
        opts.set_compression_type(self.compression_type);

        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_cache(shared_cache);
        // Blocks are scanned by height range; the rest are point lookups.
        if self.enable_bloom_filters && cf_name != cf_names::BLOCKS {
            block_opts.set_bloom_filter(10.0, false);
            block_opts.set_cache_index_and_filter_blocks(true);
        }
        opts.set_block_based_table_factory(&block_opts);
        opts
    }
}

/// Shared handle over the open database.
#[derive(Clone)]
pub struct DatabaseManager {
    db: Arc<DB>,
}

impl DatabaseManager {
    /// Open (or create) the database with every column family.
    pub fn open(config: DbConfig) -> Result<Self> {
        let path: &Path = &config.path;
        let shared_cache = Cache::new_lru_cache(config.block_cache_size);

        let descriptors: Vec<ColumnFamilyDescriptor> = cf_names::ALL
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, config.cf_options(name, &shared_cache)))
            .collect();

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);

        let db = DB::open_cf_descriptors(&db_opts, path, descriptors)
            .with_context(|| format!("failed to open database at {}", config.path.display()))?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Column family handle lookup.
    pub fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| anyhow!("column family '{name}' not found"))
    }

    pub fn get_cf(&self, cf_name: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let cf = self.cf(cf_name)?;
        self.db
            .get_cf(cf, key)
            .with_context(|| format!("failed to read key from {cf_name}"))
    }

    pub fn put_cf(&self, cf_name: &str, key: &[u8], value: &[u8]) -> Result<()> {
        let cf = self.cf(cf_name)?;
        self.db
            .put_cf(cf, key, value)
            .with_context(|| format!("failed to write key to {cf_name}"))
    }

    pub fn delete_cf(&self, cf_name: &str, key: &[u8]) -> Result<()> {
        let cf = self.cf(cf_name)?;
        self.db
            .delete_cf(cf, key)
            .with_context(|| format!("failed to delete key from {cf_name}"))
    }

    /// Iterate a column family from the start.
    pub fn iterate_cf(
        &self,
        cf_name: &str,
    ) -> Result<impl Iterator<Item = Result<(Box<[u8]>, Box<[u8]>), rocksdb::Error>> + '_> {
        let cf = self.cf(cf_name)?;
        Ok(self.db.iterator_cf(cf, IteratorMode::Start))
    }

    /// Iterate a column family from the end (largest key first).
    pub fn iterate_cf_reverse(
        &self,
        cf_name: &str,
    ) -> Result<impl Iterator<Item = Result<(Box<[u8]>, Box<[u8]>), rocksdb::Error>> + '_> {
        let cf = self.cf(cf_name)?;
        Ok(self.db.iterator_cf(cf, IteratorMode::End))
    }

    pub fn batch(&self) -> WriteBatch {
        WriteBatch::default()
    }

    /// Commit a write batch with a synced write, so a commit that
    /// returned is durable across a crash.
    pub fn write(&self, batch: WriteBatch) -> Result<()> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(true);
        self.db
            .write_opt(batch, &write_opts)
            .context("failed to commit write batch")
    }

    /// Approximate per-family key counts, for diagnostics.
    pub fn cf_key_counts(&self) -> Result<HashMap<String, u64>> {
        let mut counts = HashMap::new();
        for name in cf_names::ALL {
            let cf = self.cf(name)?;
            let estimate = self
                .db
                .property_int_value_cf(cf, "rocksdb.estimate-num-keys")
                .with_context(|| format!("failed to read key estimate for {name}"))?
                .unwrap_or(0);
            counts.insert(name.to_string(), estimate);
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn opens_with_every_column_family() {
        let dir = tempdir().unwrap();
        let db = DatabaseManager::open(DbConfig::at(dir.path().join("db"))).unwrap();
        for name in cf_names::ALL {
            assert!(db.cf(name).is_ok(), "missing {name}");
        }
        assert!(db.cf("cf_nonexistent").is_err());
    }

    #[test]
    fn put_get_delete_round_trip() {
        let dir = tempdir().unwrap();
        let db = DatabaseManager::open(DbConfig::at(dir.path().join("db"))).unwrap();

        db.put_cf(cf_names::UTXOS, b"genesis:0", b"{}").unwrap();
        assert_eq!(
            db.get_cf(cf_names::UTXOS, b"genesis:0").unwrap().as_deref(),
            Some(b"{}".as_ref())
        );
        db.delete_cf(cf_names::UTXOS, b"genesis:0").unwrap();
        assert_eq!(db.get_cf(cf_names::UTXOS, b"genesis:0").unwrap(), None);
    }

    #[test]
    fn batch_commit_is_atomic_and_reverse_iteration_orders_keys() {
        let dir = tempdir().unwrap();
        let db = DatabaseManager::open(DbConfig::at(dir.path().join("db"))).unwrap();

        let mut batch = db.batch();
        let cf = db.cf(cf_names::BLOCKS).unwrap();
        batch.put_cf(cf, 0u64.to_be_bytes(), b"zero");
        batch.put_cf(cf, 1u64.to_be_bytes(), b"one");
        batch.put_cf(cf, 2u64.to_be_bytes(), b"two");
        db.write(batch).unwrap();

        let first = db
            .iterate_cf_reverse(cf_names::BLOCKS)
            .unwrap()
            .next()
            .unwrap()
            .unwrap();
        assert_eq!(first.0.as_ref(), &2u64.to_be_bytes()[..]);
        assert_eq!(first.1.as_ref(), b"two".as_ref());
    }
}
