//! Endpoint registry
//!
//! One [`ResilientEndpoint`] per name, created on first use from a
//! [`LexguardConfig`]. The registry is an ordinary value owned by the caller;
//! there is no process-wide instance. Two names never share a breaker.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::config::LexguardConfig;
use crate::endpoint::{EndpointSnapshot, ResilientEndpoint};
use crate::error::{LexguardError, Result};

pub struct EndpointRegistry {
    config: LexguardConfig,
    endpoints: DashMap<String, Arc<ResilientEndpoint>>,
}

impl EndpointRegistry {
    pub fn new(config: LexguardConfig) -> Self {
        Self {
            config,
            endpoints: DashMap::new(),
        }
    }

    pub fn config(&self) -> &LexguardConfig {
        &self.config
    }

    /// Endpoint for `name`, building it with its config overrides on first use.
    ///
    /// Fails only when the effective settings for `name` are invalid.
    pub fn get_or_create(&self, name: &str) -> Result<Arc<ResilientEndpoint>> {
        if let Some(existing) = self.endpoints.get(name) {
            return Ok(Arc::clone(existing.value()));
        }

        let policy = self.config.policy_for(name)?;
        let breaker_config = self.config.breaker_config_for(name)?;

        // entry() re-checks under the shard lock, so racing creators agree on one endpoint
        let endpoint = self
            .endpoints
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(endpoint = name, "Registering endpoint");
                Arc::new(ResilientEndpoint::new(name, policy, breaker_config))
            })
            .value()
            .clone();
        Ok(endpoint)
    }

    pub fn get(&self, name: &str) -> Result<Arc<ResilientEndpoint>> {
        self.endpoints
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| LexguardError::EndpointNotFound {
                name: name.to_string(),
            })
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.endpoints.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Snapshot of every endpoint, sorted by name
    pub fn snapshots(&self) -> Vec<EndpointSnapshot> {
        let mut snapshots: Vec<EndpointSnapshot> =
            self.endpoints.iter().map(|e| e.value().snapshot()).collect();
        snapshots.sort_by(|a, b| a.breaker.name.cmp(&b.breaker.name));
        snapshots
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

impl Default for EndpointRegistry {
    fn default() -> Self {
        Self::new(LexguardConfig::default())
    }
}

impl std::fmt::Debug for EndpointRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointRegistry")
            .field("endpoints", &self.names())
            .finish()
    }
}
