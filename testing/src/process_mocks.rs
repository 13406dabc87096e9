//! In-memory process registry for the start-process saga.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Panics only on a poisoned lock

use futures::future::BoxFuture;
use relayflow_runtime::start_process::{ProcessInstance, ProcessRegistry, RoleBinding};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

#[derive(Debug, Default)]
struct State {
    instances: HashMap<Uuid, ProcessInstance>,
    bindings: HashMap<Uuid, Vec<RoleBinding>>,
    fail_create: bool,
    fail_bind: bool,
    fail_unbind: bool,
}

/// Process instances and role bindings in memory, with switchable failures.
#[derive(Clone, Debug, Default)]
pub struct InMemoryProcessRegistry {
    state: Arc<Mutex<State>>,
}

impl InMemoryProcessRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `create_instance` fail.
    pub fn fail_create(&self, fail: bool) {
        self.state.lock().unwrap().fail_create = fail;
    }

    /// Make `bind_roles` fail.
    pub fn fail_bind(&self, fail: bool) {
        self.state.lock().unwrap().fail_bind = fail;
    }

    /// Make `delete_role_bindings` fail.
    pub fn fail_unbind(&self, fail: bool) {
        self.state.lock().unwrap().fail_unbind = fail;
    }

    /// A stored instance.
    #[must_use]
    pub fn instance(&self, id: Uuid) -> Option<ProcessInstance> {
        self.state.lock().unwrap().instances.get(&id).cloned()
    }

    /// Number of stored instances.
    #[must_use]
    pub fn instance_count(&self) -> usize {
        self.state.lock().unwrap().instances.len()
    }

    /// Role bindings of an instance.
    #[must_use]
    pub fn bindings(&self, id: Uuid) -> Vec<RoleBinding> {
        self.state
            .lock()
            .unwrap()
            .bindings
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }
}

impl ProcessRegistry for InMemoryProcessRegistry {
    fn create_instance<'a>(
        &'a self,
        instance: &'a ProcessInstance,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            if state.fail_create {
                anyhow::bail!("process registry unavailable");
            }
            state.instances.insert(instance.id, instance.clone());
            Ok(())
        })
    }

    fn bind_roles<'a>(
        &'a self,
        instance_id: Uuid,
        bindings: &'a [RoleBinding],
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            if state.fail_bind {
                anyhow::bail!("role binding rejected");
            }
            state
                .bindings
                .entry(instance_id)
                .or_default()
                .extend_from_slice(bindings);
            Ok(())
        })
    }

    fn delete_role_bindings(&self, instance_id: Uuid) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            if state.fail_unbind {
                anyhow::bail!("role bindings could not be deleted");
            }
            state.bindings.remove(&instance_id);
            Ok(())
        })
    }
}
