use serde::{Deserialize, Serialize};
use starknet_api::hash::StarkFelt;

use crate::felt::serde_bytes;

/// Compiled contract code, identified by its class hash.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Class {
    pub id: u64,
    #[serde(with = "serde_bytes")]
    pub hash: StarkFelt,
    /// Raw JSON of the class ABI.
    pub abi: Option<Vec<u8>>,
    pub height: u64,
}

/// A deployed contract instance.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub id: u64,
    #[serde(with = "serde_bytes")]
    pub hash: StarkFelt,
    pub class_id: Option<u64>,
    /// Height at which the address was first observed.
    pub height: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Class,
    Address,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyAction {
    /// First binding of the proxy.
    Add,
    Update,
}

/// Current binding of an upgradeable contract to its implementation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Proxy {
    pub contract_id: u64,
    #[serde(with = "serde_bytes")]
    pub hash: StarkFelt,
    #[serde(with = "serde_bytes::option")]
    pub selector: Option<StarkFelt>,
    pub entity_kind: EntityKind,
    pub entity_id: u64,
    #[serde(with = "serde_bytes")]
    pub entity_hash: StarkFelt,
}

/// Append-only record of a proxy pointing at a new entity.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ProxyUpgrade {
    /// Assigned when the block is committed, zero before that.
    pub id: u64,
    #[serde(with = "serde_bytes")]
    pub hash: StarkFelt,
    pub contract_id: u64,
    #[serde(with = "serde_bytes")]
    pub entity_hash: StarkFelt,
    pub entity_id: u64,
    pub entity_kind: EntityKind,
    pub action: ProxyAction,
    pub height: u64,
}

impl ProxyUpgrade {
    pub fn to_proxy(&self) -> Proxy {
        Proxy {
            contract_id: self.contract_id,
            hash: self.hash,
            selector: None,
            entity_kind: self.entity_kind,
            entity_id: self.entity_id,
            entity_hash: self.entity_hash,
        }
    }
}

/// One write to one storage slot of a contract.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StorageDiff {
    pub height: u64,
    pub contract_id: u64,
    #[serde(with = "serde_bytes")]
    pub key: StarkFelt,
    #[serde(with = "serde_bytes")]
    pub value: StarkFelt,
}

/// Everything the resolution of one block produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockResolution {
    pub height: u64,
    pub storage_diffs: Vec<StorageDiff>,
    pub storage_diff_count: usize,
    pub proxy_upgrades: Vec<ProxyUpgrade>,
    /// Addresses created or re-bound to a class in this block, by id.
    pub addresses: Vec<Address>,
    /// Classes created in this block.
    pub classes: Vec<Class>,
}
