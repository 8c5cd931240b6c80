use serde::Deserialize;
use starknet_api::hash::StarkFelt;
use std::collections::HashMap;

#[derive(Deserialize, Debug, Clone)]
pub struct StateUpdate {
    pub block_hash: StarkFelt,
    pub new_root: StarkFelt,
    pub old_root: StarkFelt,
    pub state_diff: StateDiff,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct StateDiff {
    #[serde(default)]
    pub storage_diffs: HashMap<StarkFelt, Vec<KeyValue>>,
    #[serde(default)]
    pub deployed_contracts: Vec<DeployedContract>,
    #[serde(default)]
    pub old_declared_contracts: Vec<StarkFelt>,
    #[serde(default)]
    pub declared_classes: Vec<DeclaredClass>,
    #[serde(default)]
    pub replaced_classes: Vec<DeployedContract>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct KeyValue {
    pub key: StarkFelt,
    pub value: StarkFelt,
}

#[derive(Deserialize, Debug, Clone)]
pub struct DeployedContract {
    pub address: StarkFelt,
    pub class_hash: StarkFelt,
}

#[derive(Deserialize, Debug, Clone)]
pub struct DeclaredClass {
    pub class_hash: StarkFelt,
    #[serde(default)]
    pub compiled_class_hash: Option<StarkFelt>,
    /// Inline ABI, when the producer ships it with the diff.
    #[serde(default)]
    pub abi: Option<serde_json::Value>,
}
