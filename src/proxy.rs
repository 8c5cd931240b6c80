use std::collections::{HashMap, HashSet};

use starknet_api::hash::StarkFelt;

use crate::felt::storage_var_address;
use crate::model::ProxyUpgrade;

/// Storage variables holding the implementation of the common proxy contracts.
pub const PROXY_STORAGE_VARS: [&str; 5] = [
    "Proxy_implementation_hash",
    "Proxy_implementation_address",
    "_implementation",
    "implementation",
    "_implementation_hash",
];

/// Storage keys that, when written, point a proxy at a new implementation.
#[derive(Debug, Clone)]
pub struct ProxySlots {
    keys: HashSet<StarkFelt>,
}

impl ProxySlots {
    pub fn new<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        ProxySlots {
            keys: names.into_iter().map(storage_var_address).collect(),
        }
    }

    pub fn contains(&self, key: &StarkFelt) -> bool {
        self.keys.contains(key)
    }
}

impl Default for ProxySlots {
    fn default() -> Self {
        Self::new(PROXY_STORAGE_VARS)
    }
}

/// Proxy upgrades observed in one block, keeping only the last one per proxy.
#[derive(Debug, Default)]
pub struct BlockProxies {
    upgrades: HashMap<StarkFelt, ProxyUpgrade>,
}

impl BlockProxies {
    pub fn add_by_hash(&mut self, hash: StarkFelt, upgrade: ProxyUpgrade) {
        self.upgrades.insert(hash, upgrade);
    }

    pub fn len(&self) -> usize {
        self.upgrades.len()
    }

    pub fn is_empty(&self) -> bool {
        self.upgrades.is_empty()
    }

    /// Collected upgrades ordered by proxy contract id.
    pub fn flush(self) -> Vec<ProxyUpgrade> {
        let mut upgrades = self.upgrades.into_values().collect::<Vec<_>>();
        upgrades.sort_by_key(|upgrade| upgrade.contract_id);
        upgrades
    }
}
