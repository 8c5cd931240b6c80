//! In-memory collaborators for unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use starknet_api::hash::StarkFelt;

use crate::db::DatabaseError;
use crate::model::{Address, Class, Proxy};
use crate::repository::{AddressRepository, ClassRepository, ProxyRepository};
use crate::upstream::{ClassSource, UpstreamError};

#[derive(Default)]
pub struct MemoryStore {
    pub addresses: Mutex<HashMap<StarkFelt, Address>>,
    pub classes: Mutex<HashMap<StarkFelt, Class>>,
    pub proxies: Mutex<HashMap<StarkFelt, Proxy>>,
    pub address_reads: AtomicUsize,
}

impl MemoryStore {
    pub fn put_class(&self, class: Class) {
        self.classes.lock().unwrap().insert(class.hash, class);
    }

    pub fn put_address(&self, address: Address) {
        self.addresses.lock().unwrap().insert(address.hash, address);
    }

    pub fn address_count(&self) -> usize {
        self.addresses.lock().unwrap().len()
    }
}

#[async_trait]
impl AddressRepository for MemoryStore {
    async fn address_by_hash(&self, hash: &StarkFelt) -> Result<Address, DatabaseError> {
        self.address_reads.fetch_add(1, Ordering::SeqCst);
        self.addresses
            .lock()
            .unwrap()
            .get(hash)
            .cloned()
            .ok_or(DatabaseError::NotFound)
    }

    async fn address_by_id(&self, id: u64) -> Result<Address, DatabaseError> {
        self.addresses
            .lock()
            .unwrap()
            .values()
            .find(|address| address.id == id)
            .cloned()
            .ok_or(DatabaseError::NotFound)
    }

    async fn find_or_create_address(&self, candidate: Address) -> Result<Address, DatabaseError> {
        let mut addresses = self.addresses.lock().unwrap();
        Ok(addresses
            .entry(candidate.hash)
            .or_insert(candidate)
            .clone())
    }
}

#[async_trait]
impl ClassRepository for MemoryStore {
    async fn class_by_hash(&self, hash: &StarkFelt) -> Result<Class, DatabaseError> {
        self.classes
            .lock()
            .unwrap()
            .get(hash)
            .cloned()
            .ok_or(DatabaseError::NotFound)
    }

    async fn class_by_id(&self, id: u64) -> Result<Class, DatabaseError> {
        self.classes
            .lock()
            .unwrap()
            .values()
            .find(|class| class.id == id)
            .cloned()
            .ok_or(DatabaseError::NotFound)
    }

    async fn find_or_create_class(&self, candidate: Class) -> Result<Class, DatabaseError> {
        let mut classes = self.classes.lock().unwrap();
        Ok(classes.entry(candidate.hash).or_insert(candidate).clone())
    }
}

#[async_trait]
impl ProxyRepository for MemoryStore {
    async fn proxy_by_hash(
        &self,
        hash: &StarkFelt,
        _selector: Option<&StarkFelt>,
    ) -> Result<Proxy, DatabaseError> {
        self.proxies
            .lock()
            .unwrap()
            .get(hash)
            .cloned()
            .ok_or(DatabaseError::NotFound)
    }
}

/// Serves a fixed ABI for every class hash except the ones marked as failing.
#[derive(Default)]
pub struct StaticClassSource {
    pub failing: Vec<StarkFelt>,
    pub fetches: AtomicUsize,
}

#[async_trait]
impl ClassSource for StaticClassSource {
    async fn class_abi(&self, hash: &StarkFelt) -> Result<Option<Vec<u8>>, UpstreamError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.failing.contains(hash) {
            return Err(UpstreamError::Status(500));
        }
        Ok(Some(br#"[{"type":"function","name":"get"}]"#.to_vec()))
    }
}
