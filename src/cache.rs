//! Fetch-or-populate cache in front of the address, class and proxy repositories.
//!
//! Concurrent misses on one key are coalesced into a single load, failed loads leave
//! nothing behind, and every entry lives for a fixed time-to-live.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use starknet_api::hash::StarkFelt;

use crate::db::DatabaseError;
use crate::felt::felt_hex;
use crate::model::{Address, Class, Proxy};
use crate::repository::{AddressRepository, ClassRepository, ProxyRepository};

pub const DEFAULT_TTL: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_CAPACITY: u64 = 50_000;
/// How long a store read for an address without a class is reused.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(5);

/// Parsed ABI entries of a class.
pub type Abi = Vec<serde_json::Value>;

/// Cache key, namespaced by entity kind and lookup axis.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    ClassByHash(StarkFelt),
    ClassById(u64),
    ClassForAddress(StarkFelt),
    AddressByHash(StarkFelt),
    AbiByAddress(StarkFelt),
    AbiByAddressId(u64),
    AbiByClassHash(StarkFelt),
    Proxy(StarkFelt, Option<StarkFelt>),
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::ClassByHash(hash) => write!(f, "class:hash:{}", felt_hex(hash)),
            CacheKey::ClassById(id) => write!(f, "class:id:{id}"),
            CacheKey::ClassForAddress(hash) => write!(f, "class:address:{}", felt_hex(hash)),
            CacheKey::AddressByHash(hash) => write!(f, "address:hash:{}", felt_hex(hash)),
            CacheKey::AbiByAddress(hash) => write!(f, "abi:address:{}", felt_hex(hash)),
            CacheKey::AbiByAddressId(id) => write!(f, "abi:address_id:{id}"),
            CacheKey::AbiByClassHash(hash) => write!(f, "abi:class_hash:{}", felt_hex(hash)),
            CacheKey::Proxy(hash, Some(selector)) => {
                write!(f, "proxy:{}:{}", felt_hex(hash), felt_hex(selector))
            }
            CacheKey::Proxy(hash, None) => write!(f, "proxy:{}:", felt_hex(hash)),
        }
    }
}

#[derive(Debug, Clone)]
pub enum CachedValue {
    Class(Class),
    Address(Address),
    Abi(Arc<Abi>),
    Proxy(Proxy),
}

impl CachedValue {
    fn kind(&self) -> &'static str {
        match self {
            CachedValue::Class(_) => "class",
            CachedValue::Address(_) => "address",
            CachedValue::Abi(_) => "abi",
            CachedValue::Proxy(_) => "proxy",
        }
    }
}

#[derive(thiserror::Error, Debug, Clone)]
pub enum CacheError {
    #[error("entity not found")]
    NotFound,
    #[error("unknown class id for address: {0}")]
    AddressWithoutClass(String),
    #[error("class has no abi: {0}")]
    ClassWithoutAbi(String),
    #[error("cached value under {key} is a {found}, expected a {expected}")]
    WrongKind {
        key: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("invalid abi: {0}")]
    InvalidAbi(String),
    #[error("store error: {0}")]
    Store(Arc<DatabaseError>),
}

impl CacheError {
    /// Entity absent from the store, or present without an ABI.
    pub fn is_not_found(&self) -> bool {
        matches!(self, CacheError::NotFound | CacheError::ClassWithoutAbi(_))
    }
}

impl From<DatabaseError> for CacheError {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::NotFound => CacheError::NotFound,
            err => CacheError::Store(Arc::new(err)),
        }
    }
}

macro_rules! expect_kind {
    ($value:expr, $key:expr, $variant:ident, $expected:literal) => {
        match $value {
            CachedValue::$variant(inner) => Ok(inner),
            other => Err(CacheError::WrongKind {
                key: $key.to_string(),
                expected: $expected,
                found: other.kind(),
            }),
        }
    };
}

pub struct EntityCache {
    entries: Cache<CacheKey, CachedValue>,
    refreshes: Cache<StarkFelt, Address>,
    capacity: u64,
    addresses: Arc<dyn AddressRepository>,
    classes: Arc<dyn ClassRepository>,
    proxies: Arc<dyn ProxyRepository>,
}

impl EntityCache {
    pub fn new(
        addresses: Arc<dyn AddressRepository>,
        classes: Arc<dyn ClassRepository>,
        proxies: Arc<dyn ProxyRepository>,
    ) -> Self {
        Self::with_options(addresses, classes, proxies, DEFAULT_TTL, DEFAULT_CAPACITY)
    }

    pub fn with_options(
        addresses: Arc<dyn AddressRepository>,
        classes: Arc<dyn ClassRepository>,
        proxies: Arc<dyn ProxyRepository>,
        ttl: Duration,
        capacity: u64,
    ) -> Self {
        let entries = Cache::builder()
            .max_capacity(capacity)
            .time_to_live(ttl)
            .build();
        EntityCache {
            entries,
            refreshes: refresh_cache(capacity, DEFAULT_REFRESH_INTERVAL.min(ttl)),
            capacity,
            addresses,
            classes,
            proxies,
        }
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refreshes = refresh_cache(self.capacity, interval);
        self
    }

    /// Returns the live entry for `key`, or runs `loader` once for all concurrent callers
    /// and stores its result. A failed load is not cached.
    pub async fn fetch_or_load<F>(&self, key: CacheKey, loader: F) -> Result<CachedValue, CacheError>
    where
        F: Future<Output = Result<CachedValue, CacheError>>,
    {
        self.entries
            .try_get_with(key, loader)
            .await
            .map_err(|err| err.as_ref().clone())
    }

    /// Replaces the entry for `key` and restarts its time-to-live.
    pub async fn set(&self, key: CacheKey, value: CachedValue) {
        self.entries.insert(key, value).await;
    }

    pub async fn class_by_hash(&self, hash: &StarkFelt) -> Result<Class, CacheError> {
        let key = CacheKey::ClassByHash(*hash);
        let value = self
            .fetch_or_load(key.clone(), async {
                Ok::<_, CacheError>(CachedValue::Class(self.classes.class_by_hash(hash).await?))
            })
            .await?;
        expect_kind!(value, key, Class, "class")
    }

    pub async fn class_by_id(&self, id: u64) -> Result<Class, CacheError> {
        let key = CacheKey::ClassById(id);
        let value = self
            .fetch_or_load(key.clone(), async {
                Ok::<_, CacheError>(CachedValue::Class(self.classes.class_by_id(id).await?))
            })
            .await?;
        expect_kind!(value, key, Class, "class")
    }

    pub async fn set_class(&self, class: Class) {
        self.set(CacheKey::ClassById(class.id), CachedValue::Class(class.clone()))
            .await;
        self.set(CacheKey::ClassByHash(class.hash), CachedValue::Class(class))
            .await;
    }

    /// Address by contract hash.
    ///
    /// A cached address without a class is re-read from the store at most once per refresh
    /// interval, so a class bound by another worker becomes visible before the entry expires.
    pub async fn address_by_hash(&self, hash: &StarkFelt) -> Result<Address, CacheError> {
        let key = CacheKey::AddressByHash(*hash);
        let value = self
            .fetch_or_load(key.clone(), async {
                Ok::<_, CacheError>(CachedValue::Address(
                    self.addresses.address_by_hash(hash).await?,
                ))
            })
            .await?;
        let address = expect_kind!(value, key, Address, "address")?;
        if address.class_id.is_some() {
            return Ok(address);
        }

        let refreshed = self
            .refreshes
            .try_get_with(*hash, async {
                Ok::<_, CacheError>(self.addresses.address_by_hash(hash).await?)
            })
            .await
            .map_err(|err| err.as_ref().clone());
        match refreshed {
            Ok(stored) if stored.class_id.is_some() => {
                self.set_address(stored.clone()).await;
                Ok(stored)
            }
            Ok(_) | Err(CacheError::NotFound) => Ok(address),
            Err(err) => Err(err),
        }
    }

    /// Caches a committed address and drops the lookups derived from its previous class.
    pub async fn set_address(&self, address: Address) {
        let (hash, id) = (address.hash, address.id);
        self.set(CacheKey::AddressByHash(hash), CachedValue::Address(address))
            .await;
        self.refreshes.invalidate(&hash).await;
        for key in [
            CacheKey::ClassForAddress(hash),
            CacheKey::AbiByAddress(hash),
            CacheKey::AbiByAddressId(id),
        ] {
            self.entries.invalidate(&key).await;
        }
    }

    pub async fn class_for_address(&self, hash: &StarkFelt) -> Result<Class, CacheError> {
        let key = CacheKey::ClassForAddress(*hash);
        let value = self
            .fetch_or_load(key.clone(), async {
                let address = self.address_by_hash(hash).await?;
                let class_id = address
                    .class_id
                    .ok_or_else(|| CacheError::AddressWithoutClass(felt_hex(hash)))?;
                Ok::<_, CacheError>(CachedValue::Class(self.class_by_id(class_id).await?))
            })
            .await?;
        expect_kind!(value, key, Class, "class")
    }

    pub async fn abi_by_address(&self, hash: &StarkFelt) -> Result<Arc<Abi>, CacheError> {
        let key = CacheKey::AbiByAddress(*hash);
        let value = self
            .fetch_or_load(key.clone(), async {
                let class = self.class_for_address(hash).await?;
                Ok::<_, CacheError>(CachedValue::Abi(parse_abi(&class)?))
            })
            .await?;
        expect_kind!(value, key, Abi, "abi")
    }

    pub async fn abi_by_address_id(&self, id: u64) -> Result<Arc<Abi>, CacheError> {
        let key = CacheKey::AbiByAddressId(id);
        let value = self
            .fetch_or_load(key.clone(), async {
                let address = self.addresses.address_by_id(id).await?;
                let class_id = address
                    .class_id
                    .ok_or_else(|| CacheError::AddressWithoutClass(format!("id {id}")))?;
                let class = self.class_by_id(class_id).await?;
                Ok::<_, CacheError>(CachedValue::Abi(parse_abi(&class)?))
            })
            .await?;
        expect_kind!(value, key, Abi, "abi")
    }

    pub async fn abi_by_class_hash(&self, hash: &StarkFelt) -> Result<Arc<Abi>, CacheError> {
        let key = CacheKey::AbiByClassHash(*hash);
        let value = self
            .fetch_or_load(key.clone(), async {
                let class = self.class_by_hash(hash).await?;
                Ok::<_, CacheError>(CachedValue::Abi(parse_abi(&class)?))
            })
            .await?;
        expect_kind!(value, key, Abi, "abi")
    }

    pub async fn proxy(
        &self,
        hash: &StarkFelt,
        selector: Option<&StarkFelt>,
    ) -> Result<Proxy, CacheError> {
        let key = CacheKey::Proxy(*hash, selector.copied());
        let value = self
            .fetch_or_load(key.clone(), async {
                Ok::<_, CacheError>(CachedValue::Proxy(
                    self.proxies.proxy_by_hash(hash, selector).await?,
                ))
            })
            .await?;
        expect_kind!(value, key, Proxy, "proxy")
    }

    pub async fn set_proxy(&self, proxy: Proxy) {
        self.set(
            CacheKey::Proxy(proxy.hash, proxy.selector),
            CachedValue::Proxy(proxy),
        )
        .await;
    }

    pub async fn contains(&self, key: &CacheKey) -> bool {
        self.entries.get(key).await.is_some()
    }
}

fn refresh_cache(capacity: u64, interval: Duration) -> Cache<StarkFelt, Address> {
    Cache::builder()
        .max_capacity(capacity)
        .time_to_live(interval)
        .build()
}

fn parse_abi(class: &Class) -> Result<Arc<Abi>, CacheError> {
    let bytes = class
        .abi
        .as_ref()
        .ok_or_else(|| CacheError::ClassWithoutAbi(felt_hex(&class.hash)))?;
    serde_json::from_slice(bytes)
        .map(Arc::new)
        .map_err(|err| CacheError::InvalidAbi(format!("{}: {err}", felt_hex(&class.hash))))
}
