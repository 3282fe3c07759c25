//! In-process single-flight guard per (tenant, sync kind).

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use super::SyncKind;
use crate::entities::TenantId;

#[derive(Debug, Clone, Default)]
pub struct TenantLocks {
    held: Arc<Mutex<HashSet<(TenantId, SyncKind)>>>,
}

impl TenantLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` if another unit of work already holds this slot.
    pub fn try_acquire(&self, tenant: TenantId, kind: SyncKind) -> Option<TenantLockGuard> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if !held.insert((tenant, kind)) {
            return None;
        }
        Some(TenantLockGuard {
            held: Arc::clone(&self.held),
            key: (tenant, kind),
        })
    }

    pub fn is_held(&self, tenant: TenantId, kind: SyncKind) -> bool {
        let held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        held.contains(&(tenant, kind))
    }
}

/// Releases the slot on drop
#[derive(Debug)]
pub struct TenantLockGuard {
    held: Arc<Mutex<HashSet<(TenantId, SyncKind)>>>,
    key: (TenantId, SyncKind),
}

impl Drop for TenantLockGuard {
    fn drop(&mut self) {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        held.remove(&self.key);
    }
}
