//! Narrow read/dedup-create interfaces the resolution engine needs from the store.

use async_trait::async_trait;
use starknet_api::hash::StarkFelt;

use crate::db::DatabaseError;
use crate::model::{Address, Class, Proxy};

#[async_trait]
pub trait AddressRepository: Send + Sync {
    async fn address_by_hash(&self, hash: &StarkFelt) -> Result<Address, DatabaseError>;

    async fn address_by_id(&self, id: u64) -> Result<Address, DatabaseError>;

    /// Inserts `candidate` unless a row with the same hash exists, in which case the
    /// existing row is returned untouched. Never creates two rows for one hash.
    async fn find_or_create_address(&self, candidate: Address) -> Result<Address, DatabaseError>;
}

#[async_trait]
pub trait ClassRepository: Send + Sync {
    async fn class_by_hash(&self, hash: &StarkFelt) -> Result<Class, DatabaseError>;

    async fn class_by_id(&self, id: u64) -> Result<Class, DatabaseError>;

    /// Same contract as [`AddressRepository::find_or_create_address`].
    async fn find_or_create_class(&self, candidate: Class) -> Result<Class, DatabaseError>;
}

#[async_trait]
pub trait ProxyRepository: Send + Sync {
    async fn proxy_by_hash(
        &self,
        hash: &StarkFelt,
        selector: Option<&StarkFelt>,
    ) -> Result<Proxy, DatabaseError>;
}
