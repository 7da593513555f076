// src/resource/registry.rs
//! Named gate registry
//!
//! Gates are created from configuration at startup. Path locks are gates
//! with capacity 1 and a breaker that never opens, created on first use and
//! kept apart from the configured gates: they are not resources, do not show
//! up in snapshots, and are dropped once nothing holds or waits on them.

use crate::resource::circuit_breaker::CircuitBreakerConfig;
use crate::resource::gate::{GateSnapshot, ResourceGate};
use crate::utils::config::ResourceConfig;
use crate::utils::errors::{OrchestratorError, Result};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, trace};

const PATH_LOCK_PREFIX: &str = "path:";

/// Registry of resource gates keyed by resource name
pub struct GateRegistry {
    gates: DashMap<String, Arc<ResourceGate>>,
    path_locks: DashMap<String, Arc<ResourceGate>>,
    /// Waiters allowed on a path lock
    path_lock_waiters: usize,
}

impl GateRegistry {
    pub fn new() -> Self {
        Self {
            gates: DashMap::new(),
            path_locks: DashMap::new(),
            path_lock_waiters: 64,
        }
    }

    pub fn from_configs(configs: &[ResourceConfig]) -> Result<Self> {
        let registry = Self::new();
        for config in configs {
            registry.register(config)?;
        }
        info!("Registered {} resource gates", registry.gates.len());
        Ok(registry)
    }

    /// Register (or replace) a gate
    pub fn register(&self, config: &ResourceConfig) -> Result<Arc<ResourceGate>> {
        config.validate()?;
        let gate = Arc::new(ResourceGate::new(config));
        debug!(
            "Gate '{}' registered (max_concurrent={}, max_waiters={})",
            config.name, config.max_concurrent, config.max_waiters
        );
        self.gates.insert(config.name.clone(), Arc::clone(&gate));
        Ok(gate)
    }

    pub fn get(&self, name: &str) -> Result<Arc<ResourceGate>> {
        self.gates
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| OrchestratorError::UnknownResource {
                name: name.to_string(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.gates.contains_key(name)
    }

    /// Exclusive lock for a file path, created on first use
    pub fn path_lock(&self, path: &str) -> Arc<ResourceGate> {
        if let Some(lock) = self.path_locks.get(path) {
            return Arc::clone(lock.value());
        }

        self.prune_path_locks();
        let entry = self.path_locks.entry(path.to_string()).or_insert_with(|| {
            debug!("Creating path lock for '{}'", path);
            Arc::new(ResourceGate::with_breaker(
                format!("{PATH_LOCK_PREFIX}{path}"),
                1,
                self.path_lock_waiters,
                CircuitBreakerConfig::never_trips(),
                10,
            ))
        });
        Arc::clone(entry.value())
    }

    /// Drop path locks nobody holds, waits on, or references.
    ///
    /// Permits and waiters keep an `Arc` to their gate, so a lock whose only
    /// reference is the map is idle.
    pub fn prune_path_locks(&self) -> usize {
        let before = self.path_locks.len();
        self.path_locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        let pruned = before.saturating_sub(self.path_locks.len());
        if pruned > 0 {
            trace!("Pruned {} idle path locks", pruned);
        }
        pruned
    }

    /// Live path locks
    pub fn path_lock_count(&self) -> usize {
        self.path_locks.len()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.gates.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Snapshots of all gates, sorted by name
    pub fn snapshots(&self) -> Vec<GateSnapshot> {
        let mut snapshots: Vec<GateSnapshot> =
            self.gates.iter().map(|e| e.value().snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    pub fn len(&self) -> usize {
        self.gates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gates.is_empty()
    }
}

impl Default for GateRegistry {
    fn default() -> Self {
        Self::new()
    }
}
