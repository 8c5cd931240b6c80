use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::cache::EntityCache;
use crate::config::Config;
use crate::copy::storage_diffs_copy;
use crate::db::{Database, DatabaseError};
use crate::felt::felt_hex;
use crate::id::IdGenerator;
use crate::model::{BlockResolution, ProxyAction};
use crate::resolver::{ResolveError, Resolver};
use crate::state_update::StateDiff;
use crate::upstream::{FeederGateway, UpstreamError};

const COPY_COMMAND_FILE: &str = "storage_diff.sql";

#[derive(thiserror::Error, Debug)]
pub enum IndexerError {
    #[error("fetch error at block {block}: {source}")]
    Fetch { block: u64, source: UpstreamError },
    #[error("block {block}: {source}")]
    Resolve { block: u64, source: ResolveError },
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
    #[error("copy payload: {0}")]
    Io(#[from] std::io::Error),
}

pub struct Indexer {
    db: Arc<Database>,
    gateway: Arc<FeederGateway>,
    resolver: Resolver,
    copy_dir: Option<PathBuf>,
    concurrent_requests: usize,
}

impl Indexer {
    pub fn new(db: Arc<Database>, gateway: Arc<FeederGateway>, resolver: Resolver) -> Self {
        Indexer {
            db,
            gateway,
            resolver,
            copy_dir: None,
            concurrent_requests: 20,
        }
    }

    /// Opens the store and wires the cache, id sequences and gateway from `config`.
    pub fn open(config: &Config) -> Result<Self, IndexerError> {
        let db = Arc::new(Database::new(&config.db)?);
        let gateway = Arc::new(FeederGateway::new(&config.gateway, config.max_attempts));

        let address_ids = Arc::new(IdGenerator::new(db.max_address_id()?));
        let class_ids = Arc::new(IdGenerator::new(db.max_class_id()?));
        log::info!(
            "💾 Last ids: address {}, class {}",
            address_ids.last_id(),
            class_ids.last_id()
        );

        let cache = Arc::new(
            EntityCache::with_options(
                db.clone(),
                db.clone(),
                db.clone(),
                config.cache_ttl(),
                config.cache_capacity,
            )
            .with_refresh_interval(config.address_refresh_interval()),
        );
        let resolver = Resolver::new(
            cache,
            db.clone(),
            db.clone(),
            gateway.clone(),
            address_ids,
            class_ids,
        );

        let mut indexer = Indexer::new(db, gateway, resolver);
        indexer.copy_dir = config.copy_dir.clone();
        indexer.concurrent_requests = config.concurrent_requests.max(1);
        Ok(indexer)
    }

    pub fn with_copy_dir(mut self, copy_dir: PathBuf) -> Self {
        self.copy_dir = Some(copy_dir);
        self
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn flush(&self) -> Result<(), IndexerError> {
        Ok(self.db.flush()?)
    }

    /// Indexes `start_block..=end_block` in height order. Returns the last indexed block.
    pub async fn sync(
        &self,
        start_block: u64,
        end_block: u64,
        ct: &CancellationToken,
    ) -> Result<Option<u64>, IndexerError> {
        let mut last = None;

        for batch_start in (start_block..=end_block).step_by(self.concurrent_requests) {
            if ct.is_cancelled() {
                break;
            }
            let batch_end = end_block.min(batch_start + self.concurrent_requests as u64 - 1);
            log::info!("Processing block: {} to {}", batch_start, batch_end);

            let time = std::time::Instant::now();
            let fetches = (batch_start..=batch_end)
                .map(|number| async move { (number, self.gateway.state_update(number).await) })
                .collect::<Vec<_>>();
            let results = futures::future::join_all(fetches).await;
            log::info!("Fetched and deserialized in {:?}", time.elapsed());

            let time = std::time::Instant::now();
            for (block, result) in results {
                let state_update = result.map_err(|source| IndexerError::Fetch { block, source })?;
                self.index_block(block, &state_update.state_diff, ct).await?;
                last = Some(block);
            }
            log::info!("Processed blocks in {:?}", time.elapsed());
        }
        Ok(last)
    }

    /// Resolves one block, commits it and refreshes the cache with what was written.
    pub async fn index_block(
        &self,
        block: u64,
        diff: &StateDiff,
        ct: &CancellationToken,
    ) -> Result<BlockResolution, IndexerError> {
        let mut resolution = self
            .resolver
            .resolve_state_diff(block, diff, ct)
            .await
            .map_err(|source| IndexerError::Resolve { block, source })?;

        let cache = self.resolver.cache();
        for upgrade in resolution.proxy_upgrades.iter_mut() {
            match cache.proxy(&upgrade.hash, None).await {
                Ok(previous) if previous.entity_hash != upgrade.entity_hash => log::info!(
                    "🔀 Proxy 0x{} moved from 0x{} to 0x{}",
                    felt_hex(&upgrade.hash),
                    felt_hex(&previous.entity_hash),
                    felt_hex(&upgrade.entity_hash)
                ),
                Ok(_) => {}
                Err(err) if err.is_not_found() => upgrade.action = ProxyAction::Add,
                Err(err) => log::warn!(
                    "⚠️ Previous binding of proxy 0x{}: {err}",
                    felt_hex(&upgrade.hash)
                ),
            }
        }

        resolution.proxy_upgrades = self.db.commit_block(&resolution)?;
        for address in &resolution.addresses {
            cache.set_address(address.clone()).await;
        }
        for upgrade in &resolution.proxy_upgrades {
            cache.set_proxy(upgrade.to_proxy()).await;
        }

        if let Some(dir) = &self.copy_dir {
            if let Some(payload) = storage_diffs_copy(&resolution.storage_diffs) {
                tokio::fs::create_dir_all(dir).await?;
                tokio::fs::write(dir.join(format!("storage_diff_{block}.csv")), payload.as_bytes())
                    .await?;
                tokio::fs::write(dir.join(COPY_COMMAND_FILE), &payload.command).await?;
            }
        }

        log::debug!(
            "Block {}: {} storage diffs, {} proxy upgrades, {} new classes",
            block,
            resolution.storage_diff_count,
            resolution.proxy_upgrades.len(),
            resolution.classes.len()
        );
        Ok(resolution)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::felt::{felt, storage_var_address};
    use crate::model::EntityKind;
    use crate::repository::{AddressRepository, ClassRepository};
    use crate::state_update::KeyValue;
    use crate::testing::StaticClassSource;

    fn slot_hex() -> String {
        format!("0x{}", felt_hex(&storage_var_address("Proxy_implementation_hash")))
    }

    async fn mount_state_update(server: &MockServer, block: u64, state_diff: serde_json::Value) {
        Mock::given(method("GET"))
            .and(path("/feeder_gateway/get_state_update"))
            .and(query_param("blockNumber", block.to_string()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "block_hash": "0x1",
                "new_root": "0x2",
                "old_root": "0x3",
                "state_diff": state_diff,
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn sync_indexes_and_exports_blocks() {
        let server = MockServer::start().await;
        mount_state_update(&server, 0, json!({"old_declared_contracts": ["0xcc"]})).await;
        mount_state_update(
            &server,
            1,
            json!({
                "old_declared_contracts": ["0xaa"],
                "deployed_contracts": [{"address": "0xbeef", "class_hash": "0xaa"}],
                "storage_diffs": {"0xbeef": [{"key": slot_hex(), "value": "0xcc"}]},
            }),
        )
        .await;
        Mock::given(method("GET"))
            .and(path("/feeder_gateway/get_class_by_hash"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"abi": []})))
            .mount(&server)
            .await;

        let db_dir = tempfile::tempdir().unwrap();
        let copy_dir = tempfile::tempdir().unwrap();
        let config = Config {
            gateway: format!("{}/feeder_gateway", server.uri()),
            db: db_dir.path().to_str().unwrap().to_string(),
            start_block: 0,
            end_block: 1,
            concurrent_requests: 1,
            max_attempts: 1,
            cache_ttl_secs: 600,
            cache_capacity: 1_000,
            address_refresh_secs: 5,
            copy_dir: Some(copy_dir.path().to_path_buf()),
        };
        let indexer = Indexer::open(&config).unwrap();

        let last = indexer.sync(0, 1, &CancellationToken::new()).await.unwrap();
        assert_eq!(last, Some(1));

        let db = indexer.db();
        let cc = db.class_by_hash(&felt("0xcc")).await.unwrap();
        let aa = db.class_by_hash(&felt("0xaa")).await.unwrap();
        assert_eq!((cc.id, aa.id), (1, 2));
        let beef = db.address_by_hash(&felt("0xbeef")).await.unwrap();
        assert_eq!(beef.class_id, Some(aa.id));

        let slot = storage_var_address("Proxy_implementation_hash");
        let stored = db.storage_value(beef.id, &slot, None).unwrap().unwrap();
        assert_eq!((stored.height, stored.value), (1, felt("0xcc")));

        let history = db.proxy_upgrades(&felt("0xbeef")).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].entity_id, cc.id);
        assert_eq!(history[0].entity_kind, EntityKind::Class);
        assert_eq!(history[0].action, ProxyAction::Add);

        assert!(!copy_dir.path().join("storage_diff_0.csv").exists());
        let body = std::fs::read_to_string(copy_dir.path().join("storage_diff_1.csv")).unwrap();
        assert!(body.starts_with(&format!("1,{},", beef.id)));
        let command = std::fs::read_to_string(copy_dir.path().join(COPY_COMMAND_FILE)).unwrap();
        assert!(command.starts_with("COPY storage_diff (height, contract_id, key, value)"));

        // Ids continue after a restart.
        drop(indexer);
        let reopened = Indexer::open(&config).unwrap();
        let diff = StateDiff {
            deployed_contracts: vec![crate::state_update::DeployedContract {
                address: felt("0xf00d"),
                class_hash: felt("0xcc"),
            }],
            ..Default::default()
        };
        let block = reopened
            .index_block(2, &diff, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(block.addresses[0].id, beef.id + 1);
    }

    #[tokio::test]
    async fn sync_stops_on_fetch_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let db_dir = tempfile::tempdir().unwrap();
        let config = Config {
            gateway: format!("{}/feeder_gateway", server.uri()),
            db: db_dir.path().to_str().unwrap().to_string(),
            start_block: 0,
            end_block: 0,
            concurrent_requests: 4,
            max_attempts: 1,
            cache_ttl_secs: 600,
            cache_capacity: 1_000,
            address_refresh_secs: 5,
            copy_dir: None,
        };
        let indexer = Indexer::open(&config).unwrap();

        assert_matches!(
            indexer.sync(0, 0, &CancellationToken::new()).await,
            Err(IndexerError::Fetch { block: 0, source: UpstreamError::Status(404) })
        );
    }

    #[tokio::test]
    async fn second_binding_is_an_update() {
        let db_dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::new(db_dir.path().to_str().unwrap()).unwrap());
        let cache = Arc::new(EntityCache::new(db.clone(), db.clone(), db.clone()));
        let resolver = Resolver::new(
            cache,
            db.clone(),
            db.clone(),
            Arc::new(StaticClassSource::default()),
            Arc::new(IdGenerator::new(0)),
            Arc::new(IdGenerator::new(0)),
        );
        let gateway = Arc::new(FeederGateway::new("http://127.0.0.1:9", 0));
        let indexer = Indexer::new(db.clone(), gateway, resolver);
        let ct = CancellationToken::new();

        let declare = StateDiff {
            old_declared_contracts: vec![felt("0xaa"), felt("0xbb")],
            ..Default::default()
        };
        indexer.index_block(1, &declare, &ct).await.unwrap();

        let slot = storage_var_address("_implementation");
        for (block, target) in [(2, "0xaa"), (3, "0xbb")] {
            let diff = StateDiff {
                storage_diffs: HashMap::from([(
                    felt("0xbeef"),
                    vec![KeyValue {
                        key: slot,
                        value: felt(target),
                    }],
                )]),
                ..Default::default()
            };
            indexer.index_block(block, &diff, &ct).await.unwrap();
        }

        let history = db.proxy_upgrades(&felt("0xbeef")).unwrap();
        assert_eq!(
            history
                .iter()
                .map(|u| (u.id, u.height, u.action))
                .collect::<Vec<_>>(),
            vec![(1, 2, ProxyAction::Add), (2, 3, ProxyAction::Update)]
        );
        let class = db.class_by_id(history[1].entity_id).await.unwrap();
        assert_eq!(class.hash, felt("0xbb"));
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        db: Arc<Database>,
        cache: Arc<EntityCache>,
        address_ids: Arc<IdGenerator>,
        class_ids: Arc<IdGenerator>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let db = Arc::new(Database::new(dir.path().to_str().unwrap()).unwrap());
            let cache = Arc::new(EntityCache::new(db.clone(), db.clone(), db.clone()));
            Fixture {
                _dir: dir,
                db,
                cache,
                address_ids: Arc::new(IdGenerator::new(0)),
                class_ids: Arc::new(IdGenerator::new(0)),
            }
        }

        /// Indexer over the shared store and cache, fetching classes from `source`.
        fn indexer(&self, source: StaticClassSource) -> Indexer {
            let resolver = Resolver::new(
                self.cache.clone(),
                self.db.clone(),
                self.db.clone(),
                Arc::new(source),
                self.address_ids.clone(),
                self.class_ids.clone(),
            );
            let gateway = Arc::new(FeederGateway::new("http://127.0.0.1:9", 0));
            Indexer::new(self.db.clone(), gateway, resolver)
        }
    }

    fn storage_write(contract: &str, key: &str, value: &str) -> StateDiff {
        StateDiff {
            storage_diffs: HashMap::from([(
                felt(contract),
                vec![KeyValue {
                    key: felt(key),
                    value: felt(value),
                }],
            )]),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn failed_block_is_fully_indexed_on_retry() {
        let f = Fixture::new();
        let copy_dir = tempfile::tempdir().unwrap();
        let ct = CancellationToken::new();
        let flaky = f
            .indexer(StaticClassSource {
                failing: vec![felt("0xbad")],
                ..Default::default()
            })
            .with_copy_dir(copy_dir.path().to_path_buf());

        flaky
            .index_block(1, &storage_write("0xbeef", "0x1", "0x1"), &ct)
            .await
            .unwrap();

        let block = StateDiff {
            deployed_contracts: vec![
                crate::state_update::DeployedContract {
                    address: felt("0xbeef"),
                    class_hash: felt("0xaa"),
                },
                crate::state_update::DeployedContract {
                    address: felt("0xf00d"),
                    class_hash: felt("0xbad"),
                },
            ],
            ..storage_write("0xbeef", "0x2", "0x2")
        };
        assert_matches!(
            flaky.index_block(2, &block, &ct).await,
            Err(IndexerError::Resolve { block: 2, source: ResolveError::Upstream { .. } })
        );
        let beef = felt("0xbeef");
        assert_eq!(f.db.address_by_hash(&beef).await.unwrap().class_id, None);
        assert_eq!(f.cache.address_by_hash(&beef).await.unwrap().class_id, None);
        assert!(!copy_dir.path().join("storage_diff_2.csv").exists());

        let healthy = f
            .indexer(StaticClassSource::default())
            .with_copy_dir(copy_dir.path().to_path_buf());
        let resolution = healthy.index_block(2, &block, &ct).await.unwrap();

        let aa = f.db.class_by_hash(&felt("0xaa")).await.unwrap();
        assert!(resolution
            .addresses
            .iter()
            .any(|a| a.hash == beef && a.class_id == Some(aa.id)));
        assert_eq!(f.db.address_by_hash(&beef).await.unwrap().class_id, Some(aa.id));
        assert_eq!(f.cache.class_for_address(&beef).await.unwrap().id, aa.id);
        assert!(copy_dir.path().join("storage_diff_2.csv").exists());
    }

    #[tokio::test]
    async fn replaced_class_is_visible_through_the_cache() {
        let f = Fixture::new();
        let indexer = f.indexer(StaticClassSource::default());
        let ct = CancellationToken::new();
        let beef = felt("0xbeef");

        let deploy = StateDiff {
            old_declared_contracts: vec![felt("0xa1"), felt("0xa2")],
            deployed_contracts: vec![crate::state_update::DeployedContract {
                address: beef,
                class_hash: felt("0xa1"),
            }],
            ..Default::default()
        };
        indexer.index_block(1, &deploy, &ct).await.unwrap();
        let a1 = f.db.class_by_hash(&felt("0xa1")).await.unwrap();
        assert_eq!(f.cache.class_for_address(&beef).await.unwrap().id, a1.id);
        assert!(f.cache.abi_by_address(&beef).await.is_ok());

        let replace = StateDiff {
            replaced_classes: vec![crate::state_update::DeployedContract {
                address: beef,
                class_hash: felt("0xa2"),
            }],
            ..Default::default()
        };
        indexer.index_block(2, &replace, &ct).await.unwrap();
        let a2 = f.db.class_by_hash(&felt("0xa2")).await.unwrap();
        assert_eq!(f.cache.address_by_hash(&beef).await.unwrap().class_id, Some(a2.id));
        assert_eq!(f.cache.class_for_address(&beef).await.unwrap().id, a2.id);
        assert!(!f.cache.contains(&crate::cache::CacheKey::AbiByAddress(beef)).await);
    }
}
