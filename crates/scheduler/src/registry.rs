use std::sync::Arc;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use tracing::{debug, info};

use kiln_core::{validate_provider, KilnError, ResourceKind, ResourceProvider};

/// Point-in-time view of one registered resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceInfo {
    pub id: String,
    pub kind: ResourceKind,
    pub capacity: usize,
    pub active: usize,
    pub online: bool,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl ResourceInfo {
    /// `active / capacity`, 0.0 for a zero-capacity resource.
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            self.active as f64 / self.capacity as f64
        }
    }

    /// Online with at least one free unit.
    pub fn is_available(&self) -> bool {
        self.online && self.active < self.capacity
    }
}

struct ResourceEntry {
    provider: Arc<dyn ResourceProvider>,
    info: ResourceInfo,
    /// Set through the API; takes precedence over the provider's answer.
    capacity_override: Option<usize>,
    online_override: Option<bool>,
}

impl ResourceEntry {
    fn poll(&mut self) {
        let polled_capacity = self
            .capacity_override
            .unwrap_or_else(|| self.provider.capacity());
        // Never report less capacity than is already handed out.
        if polled_capacity < self.info.active {
            debug!(
                resource = %self.info.id,
                capacity = polled_capacity,
                active = self.info.active,
                "capacity shrank below active count; holding at active"
            );
        }
        self.info.capacity = polled_capacity.max(self.info.active);
        self.info.online = self
            .online_override
            .unwrap_or_else(|| self.provider.is_online());
        if self.info.online {
            self.info.last_heartbeat = Utc::now();
        }
    }
}

/// Registered resources of one instance, kept in registration order.
///
/// Registration order is the tie-breaker for equally scored resources, so
/// removal uses `shift_remove` to keep the remaining order intact.
#[derive(Default)]
pub struct ResourceRegistry {
    entries: IndexMap<String, ResourceEntry>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn ResourceProvider>) -> Result<(), KilnError> {
        validate_provider(provider.as_ref())?;
        let id = provider.id().to_string();
        if self.entries.contains_key(&id) {
            return Err(KilnError::InvalidResource(format!(
                "resource {} is already registered",
                id
            )));
        }
        let now = Utc::now();
        let info = ResourceInfo {
            id: id.clone(),
            kind: provider.kind(),
            capacity: provider.capacity(),
            active: 0,
            online: provider.is_online(),
            registered_at: now,
            last_heartbeat: now,
        };
        info!(resource = %id, kind = %info.kind, capacity = info.capacity, "resource registered");
        self.entries.insert(
            id,
            ResourceEntry {
                provider,
                info,
                capacity_override: None,
                online_override: None,
            },
        );
        Ok(())
    }

    /// Remove a resource, returning its last state.
    pub fn unregister(&mut self, id: &str) -> Result<ResourceInfo, KilnError> {
        let entry = self
            .entries
            .shift_remove(id)
            .ok_or_else(|| KilnError::ResourceNotFound(id.to_string()))?;
        info!(resource = %id, active = entry.info.active, "resource unregistered");
        Ok(entry.info)
    }

    pub fn get(&self, id: &str) -> Option<ResourceInfo> {
        self.entries.get(id).map(|e| e.info.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// All resources in registration order.
    pub fn list(&self) -> Vec<ResourceInfo> {
        self.entries.values().map(|e| e.info.clone()).collect()
    }

    /// Online resources with spare capacity, in registration order.
    pub fn available(&self) -> Vec<ResourceInfo> {
        self.entries
            .values()
            .filter(|e| e.info.is_available())
            .map(|e| e.info.clone())
            .collect()
    }

    /// Take one capacity unit. Fails unless the resource is online with room.
    pub fn reserve(&mut self, id: &str) -> Result<(), KilnError> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| KilnError::ResourceNotFound(id.to_string()))?;
        if !entry.info.is_available() {
            return Err(KilnError::NoResourceAvailable(id.to_string()));
        }
        entry.info.active += 1;
        Ok(())
    }

    /// Return one capacity unit. `false` if the resource is gone.
    pub fn release(&mut self, id: &str) -> bool {
        match self.entries.get_mut(id) {
            Some(entry) => {
                entry.info.active = entry.info.active.saturating_sub(1);
                true
            }
            None => false,
        }
    }

    pub fn set_capacity(&mut self, id: &str, capacity: usize) -> Result<(), KilnError> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| KilnError::ResourceNotFound(id.to_string()))?;
        if capacity == 0 {
            return Err(KilnError::InvalidResource(format!(
                "resource {} must have positive capacity",
                id
            )));
        }
        if capacity < entry.info.active {
            return Err(KilnError::InvalidResource(format!(
                "resource {} has {} active tasks, cannot shrink to {}",
                id, entry.info.active, capacity
            )));
        }
        entry.capacity_override = Some(capacity);
        entry.info.capacity = capacity;
        Ok(())
    }

    pub fn set_online(&mut self, id: &str, online: bool) -> Result<(), KilnError> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| KilnError::ResourceNotFound(id.to_string()))?;
        entry.online_override = Some(online);
        entry.info.online = online;
        Ok(())
    }

    pub fn heartbeat(&mut self, id: &str) -> Result<(), KilnError> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| KilnError::ResourceNotFound(id.to_string()))?;
        entry.info.last_heartbeat = Utc::now();
        Ok(())
    }

    /// Re-poll every provider for online state and capacity.
    pub fn refresh(&mut self) {
        for entry in self.entries.values_mut() {
            entry.poll();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_capacity(&self) -> usize {
        self.entries.values().map(|e| e.info.capacity).sum()
    }

    pub fn total_active(&self) -> usize {
        self.entries.values().map(|e| e.info.active).sum()
    }
}
