//! Operator registry
//!
//! Maps operator type names to factories and caches constructed instances by
//! `(library, type, id)`. Construction is singleflight: concurrent callers
//! asking for the same key share one in-flight construction instead of each
//! building a duplicate.

use parking_lot::{Mutex, RwLock};
use serde_json::Value as JsonValue;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;

use super::{BoxFuture, Operator, OperatorIdentity, OperatorSpec, OperatorState};
use crate::errors::RegistryError;

/// Async constructor for one operator type
pub type OperatorFactory =
    Arc<dyn Fn(OperatorSpec) -> BoxFuture<anyhow::Result<Arc<dyn Operator>>> + Send + Sync>;

type Slot = Arc<OnceCell<Arc<dyn Operator>>>;

/// Introspection record for a cached instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorInfo {
    pub identity: OperatorIdentity,
    pub capabilities: BTreeSet<String>,
    pub state: OperatorState,
}

#[derive(Default)]
pub struct OperatorRegistry {
    factories: RwLock<HashMap<String, OperatorFactory>>,
    instances: Mutex<HashMap<OperatorIdentity, Slot>>,
    constructions: AtomicUsize,
}

impl OperatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /* ===================== Registration ===================== */

    /// Register a factory for `operator_type`
    ///
    /// Re-registering a type replaces the previous factory. Instances already
    /// cached are kept.
    pub fn register(&self, operator_type: impl Into<String>, factory: OperatorFactory) {
        let operator_type = operator_type.into();
        let mut factories = self.factories.write();
        if factories.contains_key(&operator_type) {
            tracing::warn!(operator_type = %operator_type, "operator type re-registered; factory replaced");
        }
        factories.insert(operator_type, factory);
    }

    /// Register an async closure as a factory
    pub fn register_fn<F, Fut>(&self, operator_type: impl Into<String>, factory: F)
    where
        F: Fn(OperatorSpec) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Arc<dyn Operator>>> + Send + 'static,
    {
        let factory: OperatorFactory = Arc::new(
            move |spec: OperatorSpec| -> BoxFuture<anyhow::Result<Arc<dyn Operator>>> {
                Box::pin(factory(spec))
            },
        );
        self.register(operator_type, factory);
    }

    pub fn is_registered(&self, operator_type: &str) -> bool {
        self.factories.read().contains_key(operator_type)
    }

    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.read().keys().cloned().collect();
        types.sort();
        types
    }

    /* ===================== Instances ===================== */

    /// Get the cached instance for `(library, type, id)` or construct it
    ///
    /// Returns the same `Arc` for every call with the same key. A failed
    /// construction caches nothing; the next caller tries again.
    pub async fn create_operator(
        &self,
        library: &str,
        operator_type: &str,
        id: &str,
        config: JsonValue,
    ) -> Result<Arc<dyn Operator>, RegistryError> {
        let factory = self
            .factories
            .read()
            .get(operator_type)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownOperatorType(operator_type.to_string()))?;

        let identity = OperatorIdentity::new(library, operator_type, id);
        let slot = {
            let mut instances = self.instances.lock();
            instances
                .entry(identity.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let operator = slot
            .get_or_try_init(|| async {
                self.constructions.fetch_add(1, Ordering::SeqCst);
                tracing::debug!(operator = %identity, "constructing operator");

                let spec = OperatorSpec {
                    identity: identity.clone(),
                    config,
                };
                factory(spec).await.map_err(|e| RegistryError::Construction {
                    key: identity.to_string(),
                    message: format!("{:#}", e),
                })
            })
            .await?;

        Ok(operator.clone())
    }

    /// Cached instance for a key, without constructing
    pub fn cached(&self, identity: &OperatorIdentity) -> Option<Arc<dyn Operator>> {
        self.instances
            .lock()
            .get(identity)
            .and_then(|slot| slot.get().cloned())
    }

    /// Drop a cached instance. The next `create_operator` builds a new one.
    pub fn evict(&self, identity: &OperatorIdentity) -> Option<Arc<dyn Operator>> {
        self.instances
            .lock()
            .remove(identity)
            .and_then(|slot| slot.get().cloned())
    }

    pub fn describe(&self) -> Vec<OperatorInfo> {
        let mut infos: Vec<OperatorInfo> = self
            .snapshot()
            .into_iter()
            .map(|op| OperatorInfo {
                identity: op.identity().clone(),
                capabilities: op.capabilities(),
                state: op.state(),
            })
            .collect();
        infos.sort_by(|a, b| a.identity.cmp(&b.identity));
        infos
    }

    /// Stop every cached instance that can be stopped from its current state
    pub async fn stop_all(&self) -> usize {
        let mut stopped = 0;
        for op in self.snapshot() {
            match op.stop().await {
                Ok(()) => stopped += 1,
                Err(e) => {
                    tracing::debug!(operator = %op.identity(), error = %e, "operator not stopped")
                }
            }
        }
        stopped
    }

    /// Number of factory invocations so far
    pub fn constructions(&self) -> usize {
        self.constructions.load(Ordering::SeqCst)
    }

    fn snapshot(&self) -> Vec<Arc<dyn Operator>> {
        self.instances
            .lock()
            .values()
            .filter_map(|slot| slot.get().cloned())
            .collect()
    }
}
