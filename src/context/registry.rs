//! Registry of execution contexts, one pool per operation family.
//!
//! Built once at startup and passed to whoever needs contexts. Handles are leased for one
//! request at a time, so a handle never sees a second request while one is outstanding.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use super::collaborator::CollaboratorFactory;
use super::handle::{ContextState, ExecutionContextHandle};
use crate::batch::{Task, TaskDispatcher};
use crate::config::{ContextConfig, RpcConfig};
use crate::protocol::{OperationFamily, ResponseData};
use crate::rpc::RpcError;
use crate::{OffloadError, Result};

struct FamilyPool {
    handles: Vec<Arc<ExecutionContextHandle>>,
    idle: Arc<Mutex<Vec<usize>>>,
    permits: Arc<Semaphore>,
}

/// Exclusive use of one handle until dropped.
#[derive(Debug)]
pub struct ContextLease {
    handle: Arc<ExecutionContextHandle>,
    index: usize,
    idle: Arc<Mutex<Vec<usize>>>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for ContextLease {
    type Target = ExecutionContextHandle;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl Drop for ContextLease {
    fn drop(&mut self) {
        // Runs before `_permit` is released, so the next waiter always finds an idle index.
        self.idle.lock().push(self.index);
    }
}

/// Owns every execution context handle of the application.
pub struct ContextRegistry {
    families: HashMap<OperationFamily, FamilyPool>,
}

impl std::fmt::Debug for ContextRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for (family, pool) in &self.families {
            map.entry(family, &pool.handles.len());
        }
        map.finish()
    }
}

impl ContextRegistry {
    pub fn builder() -> ContextRegistryBuilder {
        ContextRegistryBuilder::default()
    }

    pub fn families(&self) -> impl Iterator<Item = OperationFamily> + '_ {
        self.families.keys().copied()
    }

    pub fn handles(&self, family: OperationFamily) -> &[Arc<ExecutionContextHandle>] {
        self.families
            .get(&family)
            .map(|pool| pool.handles.as_slice())
            .unwrap_or(&[])
    }

    /// Leases an idle handle of `family`, waiting while all of them are leased.
    pub async fn acquire(&self, family: OperationFamily) -> std::result::Result<ContextLease, RpcError> {
        let pool = self
            .families
            .get(&family)
            .ok_or_else(|| RpcError::ChannelNotReady {
                context: family.to_string(),
            })?;

        let permit = pool
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| RpcError::Terminated {
                context: family.to_string(),
            })?;
        let index = pool
            .idle
            .lock()
            .pop()
            .ok_or_else(|| RpcError::ChannelNotReady {
                context: family.to_string(),
            })?;

        debug!(family = %family, index = index, "Leased execution context");
        Ok(ContextLease {
            handle: pool.handles[index].clone(),
            index,
            idle: pool.idle.clone(),
            _permit: permit,
        })
    }

    /// Initializes every handle, returning the first failure after all attempts finish.
    pub async fn initialize_all(&self) -> std::result::Result<(), RpcError> {
        let handles: Vec<_> = self.families.values().flat_map(|p| p.handles.iter()).collect();
        let results = join_all(handles.iter().map(|handle| handle.initialize())).await;

        let mut first_error = None;
        for (handle, result) in handles.iter().zip(results) {
            if let Err(e) = result {
                warn!(context = handle.name(), error = %e, "Execution context failed to start");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => {
                info!(contexts = handles.len(), "All execution contexts ready");
                Ok(())
            }
        }
    }

    pub fn terminate_all(&self) {
        for pool in self.families.values() {
            pool.permits.close();
            for handle in &pool.handles {
                handle.terminate();
            }
        }
    }

    /// Count of handles in each state, for diagnostics.
    pub fn state_counts(&self) -> HashMap<ContextState, usize> {
        let mut counts = HashMap::new();
        for handle in self.families.values().flat_map(|p| p.handles.iter()) {
            *counts.entry(handle.state()).or_insert(0) += 1;
        }
        counts
    }
}

#[async_trait]
impl TaskDispatcher for ContextRegistry {
    async fn dispatch(&self, task: &Task) -> std::result::Result<ResponseData, RpcError> {
        let lease = self.acquire(task.operation.family()).await?;
        lease.submit(task.operation, task.input.clone()).await
    }
}

#[derive(Default)]
pub struct ContextRegistryBuilder {
    context_config: ContextConfig,
    rpc_config: RpcConfig,
    factories: Vec<(OperationFamily, CollaboratorFactory)>,
}

impl ContextRegistryBuilder {
    pub fn with_context_config(mut self, config: ContextConfig) -> Self {
        self.context_config = config;
        self
    }

    pub fn with_rpc_config(mut self, config: RpcConfig) -> Self {
        self.rpc_config = config;
        self
    }

    /// Serves `family` with collaborators built by `factory`.
    pub fn family(mut self, family: OperationFamily, factory: CollaboratorFactory) -> Self {
        self.factories.retain(|(existing, _)| *existing != family);
        self.factories.push((family, factory));
        self
    }

    pub fn build(self) -> Result<ContextRegistry> {
        let per_family = self.context_config.contexts_per_family;
        if per_family == 0 {
            return Err(OffloadError::Config(
                "contexts_per_family must be at least 1".to_string(),
            ));
        }
        if self.factories.is_empty() {
            return Err(OffloadError::Config(
                "context registry needs at least one operation family".to_string(),
            ));
        }

        let mut families = HashMap::new();
        for (family, factory) in self.factories {
            let handles = (0..per_family)
                .map(|i| {
                    Arc::new(
                        ExecutionContextHandle::new(format!("{}-{}", family, i), factory.clone())
                            .with_context_config(self.context_config.clone())
                            .with_rpc_config(self.rpc_config.clone()),
                    )
                })
                .collect();
            families.insert(
                family,
                FamilyPool {
                    handles,
                    idle: Arc::new(Mutex::new((0..per_family).rev().collect())),
                    permits: Arc::new(Semaphore::new(per_family)),
                },
            );
        }

        info!(
            families = families.len(),
            contexts_per_family = per_family,
            "Built context registry"
        );
        Ok(ContextRegistry { families })
    }
}
