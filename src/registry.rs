//! Named pool registry
//!
//! A process-scoped mapping from pool names to pools. Registries are plain
//! values meant to be passed by reference; a conventional process-wide
//! instance is available through [`PoolRegistry::global`] for hosts that
//! want singleton-style access.
//!
//! Registry operations are serialized by a single mutex over the name map.
//! The mutex is never held across pool construction or close, so registry
//! mutations do not block pool operations.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use futures::future::join_all;
use parking_lot::Mutex;
use tracing::info;

use crate::config::PoolConfig;
use crate::error::{Error, Result};
use crate::pool::Pool;
use crate::session::SessionFactory;

/// Mapping from pool name to pool.
pub struct PoolRegistry {
    pools: Mutex<HashMap<String, Pool>>,
}

impl PoolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// The process-wide default registry.
    pub fn global() -> &'static PoolRegistry {
        static GLOBAL: OnceLock<PoolRegistry> = OnceLock::new();
        GLOBAL.get_or_init(PoolRegistry::new)
    }

    /// Create, register, and return a pool under `name`.
    ///
    /// Fails if the name is taken or pool construction fails. The name is
    /// reserved only once construction succeeds; two racing `create` calls
    /// for the same name build two pools and the loser is closed.
    pub async fn create(
        &self,
        name: &str,
        config: PoolConfig,
        factory: Arc<dyn SessionFactory>,
    ) -> Result<Pool> {
        if self.pools.lock().contains_key(name) {
            return Err(Error::configuration(format!(
                "pool '{name}' is already registered"
            )));
        }

        let pool = Pool::new(config, factory).await?;

        let lost_race = {
            let mut pools = self.pools.lock();
            if pools.contains_key(name) {
                true
            } else {
                pools.insert(name.to_string(), pool.clone());
                false
            }
        };
        if lost_race {
            pool.close().await;
            return Err(Error::configuration(format!(
                "pool '{name}' is already registered"
            )));
        }

        info!("registered pool '{}'", name);
        Ok(pool)
    }

    /// Look up a pool by name.
    pub fn get(&self, name: &str) -> Option<Pool> {
        self.pools.lock().get(name).cloned()
    }

    /// Close and forget the named pool. Returns whether the name was known.
    pub async fn close(&self, name: &str) -> bool {
        let pool = self.pools.lock().remove(name);
        match pool {
            Some(pool) => {
                pool.close().await;
                info!("closed pool '{}'", name);
                true
            }
            None => false,
        }
    }

    /// Close every registered pool, best-effort in parallel, and forget
    /// them all.
    pub async fn close_all(&self) {
        let pools: Vec<(String, Pool)> = {
            let mut map = self.pools.lock();
            map.drain().collect()
        };
        let count = pools.len();
        join_all(pools.iter().map(|(_, pool)| pool.close())).await;
        info!("closed {} pools", count);
    }

    /// Names of all registered pools.
    pub fn names(&self) -> Vec<String> {
        self.pools.lock().keys().cloned().collect()
    }

    /// Number of registered pools.
    pub fn len(&self) -> usize {
        self.pools.lock().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.pools.lock().is_empty()
    }
}

impl Default for PoolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
