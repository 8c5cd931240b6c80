//! Turns one block's state diff into classes, addresses, storage diffs and proxy upgrades.
//!
//! Phases run strictly in order: legacy declared contracts, declared classes, deployed
//! contracts (and class replacements), storage diffs. Every input list is processed in
//! felt byte order so a block always resolves to the same output.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use starknet_api::hash::StarkFelt;
use tokio_util::sync::CancellationToken;

use crate::cache::{CacheError, EntityCache};
use crate::felt::felt_hex;
use crate::id::IdGenerator;
use crate::model::{
    Address, BlockResolution, Class, EntityKind, ProxyAction, ProxyUpgrade, StorageDiff,
};
use crate::proxy::{BlockProxies, ProxySlots};
use crate::repository::{AddressRepository, ClassRepository};
use crate::state_update::{DeclaredClass, DeployedContract, KeyValue, StateDiff};
use crate::upstream::{ClassSource, UpstreamError};

#[derive(thiserror::Error, Debug)]
pub enum ResolveError {
    #[error("fetch class 0x{hash}: {source}")]
    Upstream { hash: String, source: UpstreamError },
    #[error("class 0x{hash}: {source}")]
    Class { hash: String, source: CacheError },
    #[error("address 0x{hash}: {source}")]
    Address { hash: String, source: CacheError },
    #[error("integrity error: {0}")]
    Integrity(String),
    #[error("resolution of block {height} cancelled")]
    Cancelled { height: u64 },
}

impl ResolveError {
    fn class(hash: &StarkFelt, source: impl Into<CacheError>) -> Self {
        ResolveError::Class {
            hash: felt_hex(hash),
            source: source.into(),
        }
    }

    fn address(hash: &StarkFelt, source: impl Into<CacheError>) -> Self {
        ResolveError::Address {
            hash: felt_hex(hash),
            source: source.into(),
        }
    }
}

/// Entities the block touched so far. Nothing here reaches the shared cache before the
/// block is committed.
struct BlockContext<'a> {
    height: u64,
    ct: &'a CancellationToken,
    addresses: BTreeMap<u64, Address>,
    address_index: HashMap<StarkFelt, u64>,
    classes: Vec<Class>,
    proxies: BlockProxies,
    storage_diffs: Vec<StorageDiff>,
}

impl BlockContext<'_> {
    fn check_cancelled(&self) -> Result<(), ResolveError> {
        if self.ct.is_cancelled() {
            return Err(ResolveError::Cancelled {
                height: self.height,
            });
        }
        Ok(())
    }

    fn address(&self, hash: &StarkFelt) -> Option<&Address> {
        self.address_index
            .get(hash)
            .and_then(|id| self.addresses.get(id))
    }

    fn touch_address(&mut self, address: Address) {
        self.address_index.insert(address.hash, address.id);
        self.addresses.insert(address.id, address);
    }
}

#[derive(Clone)]
pub struct Resolver {
    cache: Arc<EntityCache>,
    addresses: Arc<dyn AddressRepository>,
    classes: Arc<dyn ClassRepository>,
    source: Arc<dyn ClassSource>,
    address_ids: Arc<IdGenerator>,
    class_ids: Arc<IdGenerator>,
    proxy_slots: ProxySlots,
}

impl Resolver {
    pub fn new(
        cache: Arc<EntityCache>,
        addresses: Arc<dyn AddressRepository>,
        classes: Arc<dyn ClassRepository>,
        source: Arc<dyn ClassSource>,
        address_ids: Arc<IdGenerator>,
        class_ids: Arc<IdGenerator>,
    ) -> Self {
        Resolver {
            cache,
            addresses,
            classes,
            source,
            address_ids,
            class_ids,
            proxy_slots: ProxySlots::default(),
        }
    }

    pub fn with_proxy_slots(mut self, proxy_slots: ProxySlots) -> Self {
        self.proxy_slots = proxy_slots;
        self
    }

    pub fn cache(&self) -> &Arc<EntityCache> {
        &self.cache
    }

    pub async fn resolve_state_diff(
        &self,
        height: u64,
        diff: &StateDiff,
        ct: &CancellationToken,
    ) -> Result<BlockResolution, ResolveError> {
        let mut ctx = BlockContext {
            height,
            ct,
            addresses: BTreeMap::new(),
            address_index: HashMap::new(),
            classes: Vec::new(),
            proxies: BlockProxies::default(),
            storage_diffs: Vec::new(),
        };

        self.parse_declared_contracts(&mut ctx, &diff.old_declared_contracts)
            .await?;
        self.parse_declared_classes(&mut ctx, &diff.declared_classes)
            .await?;
        self.parse_deployed_contracts(&mut ctx, &diff.deployed_contracts)
            .await?;
        self.parse_deployed_contracts(&mut ctx, &diff.replaced_classes)
            .await?;
        self.parse_storage_diffs(&mut ctx, &diff.storage_diffs)
            .await?;

        let storage_diff_count = ctx.storage_diffs.len();
        Ok(BlockResolution {
            height,
            storage_diffs: ctx.storage_diffs,
            storage_diff_count,
            proxy_upgrades: ctx.proxies.flush(),
            addresses: ctx.addresses.into_values().collect(),
            classes: ctx.classes,
        })
    }

    async fn parse_declared_contracts(
        &self,
        ctx: &mut BlockContext<'_>,
        declared: &[StarkFelt],
    ) -> Result<(), ResolveError> {
        let mut declared = declared.iter().collect::<Vec<_>>();
        declared.sort_by(|a, b| a.bytes().cmp(b.bytes()));

        for hash in declared {
            ctx.check_cancelled()?;
            self.resolve_class(ctx, hash, None).await?;
        }
        Ok(())
    }

    async fn parse_declared_classes(
        &self,
        ctx: &mut BlockContext<'_>,
        declared: &[DeclaredClass],
    ) -> Result<(), ResolveError> {
        let mut declared = declared.iter().collect::<Vec<_>>();
        declared.sort_by(|a, b| a.class_hash.bytes().cmp(b.class_hash.bytes()));

        for class in declared {
            ctx.check_cancelled()?;
            let abi = match &class.abi {
                None | Some(serde_json::Value::Null) => None,
                Some(serde_json::Value::String(abi)) => Some(abi.as_bytes().to_vec()),
                Some(abi) => Some(serde_json::to_vec(abi).map_err(|e| {
                    ResolveError::Integrity(format!(
                        "abi of class 0x{}: {e}",
                        felt_hex(&class.class_hash)
                    ))
                })?),
            };
            self.resolve_class(ctx, &class.class_hash, abi).await?;
        }
        Ok(())
    }

    async fn parse_deployed_contracts(
        &self,
        ctx: &mut BlockContext<'_>,
        contracts: &[DeployedContract],
    ) -> Result<(), ResolveError> {
        let mut contracts = contracts.iter().collect::<Vec<_>>();
        contracts.sort_by(|a, b| a.address.bytes().cmp(b.address.bytes()));

        for contract in contracts {
            ctx.check_cancelled()?;
            let class = self.resolve_class(ctx, &contract.class_hash, None).await?;
            self.resolve_address(ctx, &contract.address, Some(class.id))
                .await?;
        }
        Ok(())
    }

    async fn parse_storage_diffs(
        &self,
        ctx: &mut BlockContext<'_>,
        diffs: &HashMap<StarkFelt, Vec<KeyValue>>,
    ) -> Result<(), ResolveError> {
        let mut contracts = diffs.iter().collect::<Vec<_>>();
        contracts.sort_by(|(a, _), (b, _)| a.bytes().cmp(b.bytes()));

        for (hash, updates) in contracts {
            ctx.check_cancelled()?;
            let address = self.resolve_address(ctx, hash, None).await?;

            // Stable: repeated writes to one key keep their input order.
            let mut updates = updates.iter().collect::<Vec<_>>();
            updates.sort_by(|a, b| a.key.bytes().cmp(b.key.bytes()));

            for update in updates {
                ctx.storage_diffs.push(StorageDiff {
                    height: ctx.height,
                    contract_id: address.id,
                    key: update.key,
                    value: update.value,
                });

                if self.proxy_slots.contains(&update.key) {
                    self.parse_proxy_upgrade(ctx, &address, &update.value)
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn parse_proxy_upgrade(
        &self,
        ctx: &mut BlockContext<'_>,
        proxy: &Address,
        target: &StarkFelt,
    ) -> Result<(), ResolveError> {
        let Some((entity_id, entity_kind)) = self.find_proxy_entity(target).await? else {
            log::warn!(
                "⚠️ unknown proxy target 0x{} for 0x{} at block {}",
                felt_hex(target),
                felt_hex(&proxy.hash),
                ctx.height
            );
            return Ok(());
        };

        ctx.proxies.add_by_hash(
            proxy.hash,
            ProxyUpgrade {
                id: 0,
                hash: proxy.hash,
                contract_id: proxy.id,
                entity_hash: *target,
                entity_id,
                entity_kind,
                action: ProxyAction::Update,
                height: ctx.height,
            },
        );
        Ok(())
    }

    /// Looks the target up as a class first, then as an address.
    async fn find_proxy_entity(
        &self,
        hash: &StarkFelt,
    ) -> Result<Option<(u64, EntityKind)>, ResolveError> {
        match self.cache.class_by_hash(hash).await {
            Ok(class) => return Ok(Some((class.id, EntityKind::Class))),
            Err(CacheError::NotFound) => {}
            Err(err) => return Err(ResolveError::class(hash, err)),
        }

        match self.cache.address_by_hash(hash).await {
            Ok(address) => Ok(Some((address.id, EntityKind::Address))),
            Err(CacheError::NotFound) => Ok(None),
            Err(err) => Err(ResolveError::address(hash, err)),
        }
    }

    async fn resolve_class(
        &self,
        ctx: &mut BlockContext<'_>,
        hash: &StarkFelt,
        abi: Option<Vec<u8>>,
    ) -> Result<Class, ResolveError> {
        match self.cache.class_by_hash(hash).await {
            Ok(class) => return Ok(class),
            Err(CacheError::NotFound) => {}
            Err(err) => return Err(ResolveError::class(hash, err)),
        }

        let abi = match abi {
            Some(abi) => Some(abi),
            None => self
                .source
                .class_abi(hash)
                .await
                .map_err(|source| ResolveError::Upstream {
                    hash: felt_hex(hash),
                    source,
                })?,
        };

        let candidate = Class {
            id: self.class_ids.next_id(),
            hash: *hash,
            abi,
            height: ctx.height,
        };
        let candidate_id = candidate.id;
        let class = self
            .classes
            .find_or_create_class(candidate)
            .await
            .map_err(|err| ResolveError::class(hash, err))?;
        if class.hash != *hash {
            return Err(ResolveError::Integrity(format!(
                "class 0x{} stored under hash 0x{}",
                felt_hex(hash),
                felt_hex(&class.hash)
            )));
        }

        if class.id == candidate_id {
            log::debug!("new class 0x{} with id {}", felt_hex(hash), class.id);
            ctx.classes.push(class.clone());
        }
        self.cache.set_class(class.clone()).await;
        Ok(class)
    }

    /// Finds the address for `hash` or creates it, binding it to `class_id` when given.
    ///
    /// A rebinding only lives in the block context until the block is committed.
    async fn resolve_address(
        &self,
        ctx: &mut BlockContext<'_>,
        hash: &StarkFelt,
        class_id: Option<u64>,
    ) -> Result<Address, ResolveError> {
        let known = match ctx.address(hash) {
            Some(address) => Ok(address.clone()),
            None => self.cache.address_by_hash(hash).await,
        };
        let mut address = match known {
            Ok(address) => address,
            Err(CacheError::NotFound) => {
                let candidate = Address {
                    id: self.address_ids.next_id(),
                    hash: *hash,
                    class_id,
                    height: ctx.height,
                };
                let address = self
                    .addresses
                    .find_or_create_address(candidate)
                    .await
                    .map_err(|err| ResolveError::address(hash, err))?;
                if address.hash != *hash {
                    return Err(ResolveError::Integrity(format!(
                        "address 0x{} stored under hash 0x{}",
                        felt_hex(hash),
                        felt_hex(&address.hash)
                    )));
                }
                log::debug!("address 0x{} has id {}", felt_hex(hash), address.id);
                ctx.touch_address(address.clone());
                address
            }
            Err(err) => return Err(ResolveError::address(hash, err)),
        };

        if class_id.is_some() && address.class_id != class_id {
            address.class_id = class_id;
            ctx.touch_address(address.clone());
        }
        Ok(address)
    }
}
