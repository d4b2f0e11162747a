use serde::{Deserialize, Serialize};

use crate::error::KilnError;

/// What kind of execution target a resource represents.
///
/// The engine treats every kind identically; the tag exists for reporting
/// and for callers that route by kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    ComputeNode,
    AcceleratorStream,
    ModelInstance,
    Other(String),
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::ComputeNode => write!(f, "compute_node"),
            ResourceKind::AcceleratorStream => write!(f, "accelerator_stream"),
            ResourceKind::ModelInstance => write!(f, "model_instance"),
            ResourceKind::Other(name) => write!(f, "{}", name),
        }
    }
}

/// Capability a caller supplies when registering an execution target.
///
/// The scheduler polls `is_online()` and `capacity()` on every loop tick,
/// so implementations backed by live hardware state stay current.
pub trait ResourceProvider: Send + Sync {
    fn id(&self) -> &str;
    /// Maximum concurrent tasks.
    fn capacity(&self) -> usize;
    fn is_online(&self) -> bool;
    fn kind(&self) -> ResourceKind {
        ResourceKind::ComputeNode
    }
}

/// A static resource description, for targets whose capacity and online
/// state are managed through the scheduler API rather than polled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub id: String,
    pub kind: ResourceKind,
    pub capacity: usize,
    pub online: bool,
}

impl ResourceSpec {
    pub fn new(id: impl Into<String>, capacity: usize) -> Self {
        Self {
            id: id.into(),
            kind: ResourceKind::ComputeNode,
            capacity,
            online: true,
        }
    }

    pub fn kind(mut self, kind: ResourceKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn offline(mut self) -> Self {
        self.online = false;
        self
    }
}

impl ResourceProvider for ResourceSpec {
    fn id(&self) -> &str {
        &self.id
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn is_online(&self) -> bool {
        self.online
    }

    fn kind(&self) -> ResourceKind {
        self.kind.clone()
    }
}

/// Validate a provider before it enters a registry.
pub fn validate_provider(provider: &dyn ResourceProvider) -> Result<(), KilnError> {
    if provider.id().trim().is_empty() {
        return Err(KilnError::InvalidResource("resource id must not be empty".into()));
    }
    if provider.capacity() == 0 {
        return Err(KilnError::InvalidResource(format!(
            "resource {} must have positive capacity",
            provider.id()
        )));
    }
    Ok(())
}
