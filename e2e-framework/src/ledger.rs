//! Record of objects a scenario created, so teardown can remove them

use std::fmt;
use std::sync::Mutex;

use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Namespace,
    StorageClass,
    PersistentVolumeClaim,
    /// Only pre-provisioned volumes; dynamic ones go with their claim.
    PersistentVolume,
    Pod,
    VolumeSnapshot,
    /// A label key set on every node; `name` is the label key.
    NodeLabel,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceKind::Namespace => "namespace",
            ResourceKind::StorageClass => "storageclass",
            ResourceKind::PersistentVolumeClaim => "pvc",
            ResourceKind::PersistentVolume => "pv",
            ResourceKind::Pod => "pod",
            ResourceKind::VolumeSnapshot => "volumesnapshot",
            ResourceKind::NodeLabel => "nodelabel",
        };
        write!(f, "{}", s)
    }
}

/// (kind, namespace, name) of a cluster object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceRef {
    pub fn namespaced(kind: ResourceKind, namespace: &str, name: &str) -> Self {
        Self {
            kind,
            namespace: Some(namespace.to_string()),
            name: name.to_string(),
        }
    }

    pub fn cluster(kind: ResourceKind, name: &str) -> Self {
        Self {
            kind,
            namespace: None,
            name: name.to_string(),
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// Name of the `index`-th derived object of a batch.
pub fn indexed_name(unique_name: &str, index: usize) -> String {
    format!("{}{}", unique_name, index)
}

/// Creation-ordered list of objects awaiting teardown.
///
/// Shared between a scenario and any batch it dispatches, so recording
/// goes through a mutex.
#[derive(Debug, Default)]
pub struct CleanupLedger {
    entries: Mutex<Vec<ResourceRef>>,
}

impl CleanupLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ResourceRef>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a created object. Re-recording an existing entry is a no-op.
    pub fn record(&self, r: ResourceRef) {
        let mut entries = self.lock();
        if !entries.contains(&r) {
            debug!(resource = %r, "Recorded for teardown");
            entries.push(r);
        }
    }

    /// Drop an entry the scenario already deleted itself.
    pub fn forget(&self, r: &ResourceRef) {
        self.lock().retain(|e| e != r);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn contains(&self, r: &ResourceRef) -> bool {
        self.lock().contains(r)
    }

    /// Take every entry, most recently created first.
    pub fn drain_reverse(&self) -> Vec<ResourceRef> {
        let mut entries = std::mem::take(&mut *self.lock());
        entries.reverse();
        entries
    }
}
