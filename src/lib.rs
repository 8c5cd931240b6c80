//! StarkNet state diff indexer.
//!
//! [`resolver::Resolver`] turns a block's state diff into classes, addresses, storage
//! diffs and proxy upgrades, backed by the [`cache::EntityCache`] in front of the store.
//! [`copy`] encodes storage diffs for PostgreSQL bulk loading.

pub mod cache;
pub mod config;
pub mod copy;
pub mod db;
pub mod felt;
pub mod id;
pub mod indexer;
pub mod model;
pub mod proxy;
pub mod repository;
pub mod resolver;
pub mod state_update;
pub mod upstream;

#[cfg(test)]
mod testing;
