use std::sync::Mutex;

use async_trait::async_trait;
use rocksdb::{
    ColumnFamilyDescriptor, DBCompressionType, Direction, IteratorMode, Options, WriteBatch, DB,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use starknet_api::hash::StarkFelt;

use crate::felt::{felt_from_bytes, felt_hex};
use crate::model::{Address, BlockResolution, Class, Proxy, ProxyUpgrade, StorageDiff};
use crate::repository::{AddressRepository, ClassRepository, ProxyRepository};

const ADDRESS: &str = "address";
const ADDRESS_ID: &str = "address_id";
const CLASS: &str = "class";
const CLASS_ID: &str = "class_id";
const PROXY: &str = "proxy";
const PROXY_UPGRADE: &str = "proxy_upgrade";
const STORAGE_DIFF: &str = "storage_diff";
const META: &str = "meta";

const COLUMNS: [&str; 8] = [
    ADDRESS,
    ADDRESS_ID,
    CLASS,
    CLASS_ID,
    PROXY,
    PROXY_UPGRADE,
    STORAGE_DIFF,
    META,
];

const PROXY_UPGRADE_SEQ: &[u8] = b"proxy_upgrade_seq";

pub struct Database {
    db: DB,
    /// Serializes find-or-insert and block commits.
    write_lock: Mutex<()>,
}

#[derive(thiserror::Error, Debug)]
pub enum DatabaseError {
    #[error("Not found")]
    NotFound,
    #[error("Integrity error: {0}")]
    Integrity(String),
    #[error("Column not found: {0}")]
    ColumnNotFound(String),
    #[error("Decode error")]
    DecodeError,
    #[error("Encode error")]
    EncodeError,
    #[error("Write lock poisoned")]
    LockPoisoned,
    #[error("RocksDB error: {0}")]
    RocksDBError(rocksdb::Error),
}

impl Database {
    pub fn new(path: &str) -> Result<Self, DatabaseError> {
        let mut db_opts = Options::default();
        db_opts.set_compression_type(DBCompressionType::Zstd);
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let descriptors = COLUMNS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect::<Vec<_>>();

        let db = DB::open_cf_descriptors(&db_opts, path, descriptors)
            .map_err(DatabaseError::RocksDBError)?;

        Ok(Database {
            db,
            write_lock: Mutex::new(()),
        })
    }

    fn cf(&self, cf: &str) -> Result<&rocksdb::ColumnFamily, DatabaseError> {
        self.db
            .cf_handle(cf)
            .ok_or(DatabaseError::ColumnNotFound(cf.to_string()))
    }

    fn get(&self, cf: &str, key: &[u8]) -> Result<Option<Vec<u8>>, DatabaseError> {
        self.db
            .get_cf(self.cf(cf)?, key)
            .map_err(DatabaseError::RocksDBError)
    }

    fn get_row<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<T, DatabaseError> {
        let encoded = self.get(cf, key)?.ok_or(DatabaseError::NotFound)?;
        bincode::deserialize(&encoded).map_err(|_| DatabaseError::DecodeError)
    }

    fn iter(&self, cf: &str, mode: IteratorMode) -> Result<rocksdb::DBIterator, DatabaseError> {
        Ok(self.db.iterator_cf(self.cf(cf)?, mode))
    }

    fn last_id(&self, cf: &str) -> Result<u64, DatabaseError> {
        match self.iter(cf, IteratorMode::End)?.next() {
            Some(item) => {
                let (key, _) = item.map_err(DatabaseError::RocksDBError)?;
                decode_u64(&key)
            }
            None => Ok(0),
        }
    }

    pub fn flush(&self) -> Result<(), DatabaseError> {
        self.db.flush().map_err(DatabaseError::RocksDBError)
    }

    /// Highest address id ever persisted, zero on an empty store.
    pub fn max_address_id(&self) -> Result<u64, DatabaseError> {
        self.last_id(ADDRESS_ID)
    }

    pub fn max_class_id(&self) -> Result<u64, DatabaseError> {
        self.last_id(CLASS_ID)
    }

    /// Shared find-by-hash-else-insert over a `hash -> id` and an `id -> row` column.
    fn find_or_insert<T>(
        &self,
        (hash_cf, id_cf): (&str, &str),
        hash: &StarkFelt,
        id: u64,
        row: T,
    ) -> Result<T, DatabaseError>
    where
        T: Serialize + DeserializeOwned,
    {
        let _guard = self.write_lock.lock().map_err(|_| DatabaseError::LockPoisoned)?;

        if let Some(existing) = self.get(hash_cf, hash.bytes())? {
            return self.get_row(id_cf, &existing);
        }

        let id_key = id.to_be_bytes();
        if self.get(id_cf, &id_key)?.is_some() {
            return Err(DatabaseError::Integrity(format!(
                "{hash_cf} id {id} is already bound, cannot assign it to {}",
                felt_hex(hash)
            )));
        }

        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(hash_cf)?, hash.bytes(), id_key);
        batch.put_cf(self.cf(id_cf)?, id_key, encode(&row)?);
        self.db.write(batch).map_err(DatabaseError::RocksDBError)?;
        Ok(row)
    }

    /// Writes everything a resolved block produced in a single batch. Returns the proxy
    /// upgrades with their sequence ids assigned.
    pub fn commit_block(
        &self,
        block: &BlockResolution,
    ) -> Result<Vec<ProxyUpgrade>, DatabaseError> {
        let _guard = self.write_lock.lock().map_err(|_| DatabaseError::LockPoisoned)?;
        let mut batch = WriteBatch::default();

        for address in &block.addresses {
            let id_key = address.id.to_be_bytes();
            batch.put_cf(self.cf(ADDRESS)?, address.hash.bytes(), id_key);
            batch.put_cf(self.cf(ADDRESS_ID)?, id_key, encode(address)?);
        }

        for diff in &block.storage_diffs {
            batch.put_cf(
                self.cf(STORAGE_DIFF)?,
                storage_diff_key(diff.contract_id, &diff.key, diff.height),
                diff.value.bytes(),
            );
        }

        let mut seq = match self.get(META, PROXY_UPGRADE_SEQ)? {
            Some(bytes) => decode_u64(&bytes)?,
            None => 0,
        };
        let mut upgrades = Vec::with_capacity(block.proxy_upgrades.len());
        for upgrade in &block.proxy_upgrades {
            seq += 1;
            let upgrade = ProxyUpgrade {
                id: seq,
                ..upgrade.clone()
            };
            let mut key = upgrade.hash.bytes().to_vec();
            key.extend_from_slice(&upgrade.height.to_be_bytes());
            key.extend_from_slice(&seq.to_be_bytes());
            batch.put_cf(self.cf(PROXY_UPGRADE)?, key, encode(&upgrade)?);

            let proxy = upgrade.to_proxy();
            batch.put_cf(
                self.cf(PROXY)?,
                proxy_key(&proxy.hash, proxy.selector.as_ref()),
                encode(&proxy)?,
            );
            upgrades.push(upgrade);
        }
        batch.put_cf(self.cf(META)?, PROXY_UPGRADE_SEQ, seq.to_be_bytes());

        self.db.write(batch).map_err(DatabaseError::RocksDBError)?;
        Ok(upgrades)
    }

    /// Latest write to `key` of a contract at or below `height`, or the latest overall.
    pub fn storage_value(
        &self,
        contract_id: u64,
        key: &StarkFelt,
        height: Option<u64>,
    ) -> Result<Option<StorageDiff>, DatabaseError> {
        let seek = storage_diff_key(contract_id, key, height.unwrap_or(u64::MAX));
        let prefix = &seek[..40];
        let mut iter = self.iter(STORAGE_DIFF, IteratorMode::From(&seek, Direction::Reverse))?;

        let Some(item) = iter.next() else {
            return Ok(None);
        };
        let (db_key, value) = item.map_err(DatabaseError::RocksDBError)?;
        if !db_key.starts_with(prefix) {
            return Ok(None);
        }

        Ok(Some(StorageDiff {
            height: decode_u64(&db_key[40..])?,
            contract_id,
            key: *key,
            value: felt_from_bytes(&value).ok_or(DatabaseError::DecodeError)?,
        }))
    }

    /// Upgrade history of one proxy, ordered by height then sequence id.
    pub fn proxy_upgrades(&self, hash: &StarkFelt) -> Result<Vec<ProxyUpgrade>, DatabaseError> {
        let prefix = hash.bytes();
        let mut upgrades = Vec::new();
        for item in self.iter(PROXY_UPGRADE, IteratorMode::From(prefix, Direction::Forward))? {
            let (key, encoded) = item.map_err(DatabaseError::RocksDBError)?;
            if !key.starts_with(prefix) {
                break;
            }
            upgrades.push(bincode::deserialize(&encoded).map_err(|_| DatabaseError::DecodeError)?);
        }
        Ok(upgrades)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, DatabaseError> {
    bincode::serialize(value).map_err(|_| DatabaseError::EncodeError)
}

fn decode_u64(bytes: &[u8]) -> Result<u64, DatabaseError> {
    let bytes: [u8; 8] = bytes.try_into().map_err(|_| DatabaseError::DecodeError)?;
    Ok(u64::from_be_bytes(bytes))
}

fn storage_diff_key(contract_id: u64, key: &StarkFelt, height: u64) -> Vec<u8> {
    let mut db_key = Vec::with_capacity(48);
    db_key.extend_from_slice(&contract_id.to_be_bytes());
    db_key.extend_from_slice(key.bytes());
    db_key.extend_from_slice(&height.to_be_bytes());
    db_key
}

fn proxy_key(hash: &StarkFelt, selector: Option<&StarkFelt>) -> Vec<u8> {
    let mut db_key = hash.bytes().to_vec();
    if let Some(selector) = selector {
        db_key.extend_from_slice(selector.bytes());
    }
    db_key
}

#[async_trait]
impl AddressRepository for Database {
    async fn address_by_hash(&self, hash: &StarkFelt) -> Result<Address, DatabaseError> {
        let id = self.get(ADDRESS, hash.bytes())?.ok_or(DatabaseError::NotFound)?;
        self.get_row(ADDRESS_ID, &id)
    }

    async fn address_by_id(&self, id: u64) -> Result<Address, DatabaseError> {
        self.get_row(ADDRESS_ID, &id.to_be_bytes())
    }

    async fn find_or_create_address(&self, candidate: Address) -> Result<Address, DatabaseError> {
        let hash = candidate.hash;
        let id = candidate.id;
        self.find_or_insert((ADDRESS, ADDRESS_ID), &hash, id, candidate)
    }
}

#[async_trait]
impl ClassRepository for Database {
    async fn class_by_hash(&self, hash: &StarkFelt) -> Result<Class, DatabaseError> {
        let id = self.get(CLASS, hash.bytes())?.ok_or(DatabaseError::NotFound)?;
        self.get_row(CLASS_ID, &id)
    }

    async fn class_by_id(&self, id: u64) -> Result<Class, DatabaseError> {
        self.get_row(CLASS_ID, &id.to_be_bytes())
    }

    async fn find_or_create_class(&self, candidate: Class) -> Result<Class, DatabaseError> {
        let hash = candidate.hash;
        let id = candidate.id;
        self.find_or_insert((CLASS, CLASS_ID), &hash, id, candidate)
    }
}

#[async_trait]
impl ProxyRepository for Database {
    async fn proxy_by_hash(
        &self,
        hash: &StarkFelt,
        selector: Option<&StarkFelt>,
    ) -> Result<Proxy, DatabaseError> {
        self.get_row(PROXY, &proxy_key(hash, selector))
    }
}
