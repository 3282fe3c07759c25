// 🎛️ Task Orchestrator - fan-out, retry, single-flight, audit
//
// "Sync everyone" enumerates tenants and spawns one independent unit of work
// per tenant. Each unit of work:
//   - skips immediately if the same (tenant, kind) is already running
//   - checks the tenant exists before touching the bank
//   - retries retryable failures with exponential backoff
//   - leaves a sync_completed / sync_failed event in the audit trail
//
// Enumeration failure fails the fan-out task; one tenant failing never
// affects its siblings.

pub mod locks;
pub mod retry;
pub mod tasks;

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use tracing::{error, info, instrument, warn};

pub use locks::{TenantLockGuard, TenantLocks};
pub use retry::{run_with_retry, RetryExhausted, RetryPolicy};
pub use tasks::{TaskHandle, TaskId, TaskRecord, TaskRegistry, TaskStatus};

use crate::accounts::AccountSynchronizer;
use crate::auth::Authenticator;
use crate::config::Settings;
use crate::db::{self, Event, SharedConnection};
use crate::entities::{Tenant, TenantId};
use crate::error::{PhaseExt, SyncError, SyncFailure, SyncPhase};
use crate::transactions::TransactionSynchronizer;

const ACTOR: &str = "orchestrator";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncKind {
    Accounts,
    Transactions,
}

impl SyncKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncKind::Accounts => "accounts",
            SyncKind::Transactions => "transactions",
        }
    }
}

impl fmt::Display for SyncKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One spawned per-tenant task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchedTask {
    pub tenant_id: TenantId,
    pub tenant_name: String,
    pub task_id: TaskId,
}

/// Result payload of a fan-out task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchSummary {
    pub total_tenants: usize,
    pub tasks_dispatched: usize,
    pub tasks: Vec<DispatchedTask>,
}

#[derive(Clone)]
pub struct Orchestrator {
    db: SharedConnection,
    accounts: AccountSynchronizer,
    transactions: TransactionSynchronizer,
    policy: RetryPolicy,
    registry: TaskRegistry,
    locks: TenantLocks,
}

impl Orchestrator {
    pub fn new(auth: Authenticator, db: SharedConnection, settings: &Settings) -> Self {
        let accounts = AccountSynchronizer::new(auth.clone(), db.clone(), settings.sync.clone());
        let transactions = TransactionSynchronizer::new(auth, db.clone(), settings.sync.clone());
        Self::from_parts(
            db,
            accounts,
            transactions,
            RetryPolicy::from_config(&settings.retry),
        )
    }

    pub fn from_parts(
        db: SharedConnection,
        accounts: AccountSynchronizer,
        transactions: TransactionSynchronizer,
        policy: RetryPolicy,
    ) -> Self {
        Orchestrator {
            db,
            accounts,
            transactions,
            policy,
            registry: TaskRegistry::new(),
            locks: TenantLocks::new(),
        }
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn locks(&self) -> &TenantLocks {
        &self.locks
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn task_status(&self, id: &TaskId) -> Option<TaskStatus> {
        self.registry.status(id)
    }

    // ========================================================================
    // DISPATCH
    // ========================================================================

    pub fn dispatch_sync_all_accounts(&self) -> TaskHandle {
        self.dispatch_all(SyncKind::Accounts)
    }

    pub fn dispatch_sync_tenant_accounts(&self, tenant: TenantId) -> TaskHandle {
        self.dispatch_tenant(SyncKind::Accounts, tenant)
    }

    pub fn dispatch_sync_all_transactions(&self) -> TaskHandle {
        self.dispatch_all(SyncKind::Transactions)
    }

    pub fn dispatch_sync_tenant_transactions(&self, tenant: TenantId) -> TaskHandle {
        self.dispatch_tenant(SyncKind::Transactions, tenant)
    }

    fn dispatch_tenant(&self, kind: SyncKind, tenant: TenantId) -> TaskHandle {
        let this = self.clone();
        self.registry
            .spawn(&format!("sync_tenant_{}", kind), Some(tenant), async move {
                this.run_tenant(kind, tenant).await
            })
    }

    fn dispatch_all(&self, kind: SyncKind) -> TaskHandle {
        let this = self.clone();
        self.registry
            .spawn(&format!("sync_all_{}", kind), None, async move {
                let summary = this.fan_out(kind).map_err(|failure| {
                    error!(kind = %kind, error = %failure, "tenant enumeration failed");
                    failure.to_string()
                })?;
                serde_json::to_value(summary).map_err(|e| e.to_string())
            })
    }

    /// Enumerate tenants and spawn one task each
    pub fn fan_out(&self, kind: SyncKind) -> Result<DispatchSummary, SyncFailure> {
        self.fan_out_with_handles(kind).map(|(summary, _)| summary)
    }

    /// Like `fan_out`, also returning the per-tenant handles to wait on
    pub fn fan_out_with_handles(
        &self,
        kind: SyncKind,
    ) -> Result<(DispatchSummary, Vec<TaskHandle>), SyncFailure> {
        let tenants: Vec<Tenant> = db::with_connection(&self.db, db::list_tenants)
            .map_err(SyncError::from)
            .phase(SyncPhase::Enumerate)?;

        let mut tasks = Vec::with_capacity(tenants.len());
        let mut handles = Vec::with_capacity(tenants.len());

        for tenant in &tenants {
            let handle = self.dispatch_tenant(kind, tenant.id);
            tasks.push(DispatchedTask {
                tenant_id: tenant.id,
                tenant_name: tenant.name.clone(),
                task_id: handle.id(),
            });
            handles.push(handle);
        }

        info!(kind = %kind, tenants = tenants.len(), "dispatched per-tenant sync tasks");

        let summary = DispatchSummary {
            total_tenants: tenants.len(),
            tasks_dispatched: tasks.len(),
            tasks,
        };
        Ok((summary, handles))
    }

    // ========================================================================
    // UNIT OF WORK
    // ========================================================================

    /// One tenant, one kind, with retries. The error string is the terminal
    /// failure message reported on the task.
    #[instrument(skip(self), fields(tenant = %tenant, kind = %kind))]
    pub async fn run_tenant(&self, kind: SyncKind, tenant: TenantId) -> Result<serde_json::Value, String> {
        let Some(_guard) = self.locks.try_acquire(tenant, kind) else {
            info!("sync already running for this tenant, skipping");
            return Ok(json!({
                "tenant_id": tenant,
                "kind": kind,
                "skipped": true,
            }));
        };

        let label = format!("{} sync for tenant {}", kind, tenant);
        let outcome = run_with_retry(&self.policy, &label, |_| self.attempt(kind, tenant)).await;

        match outcome {
            Ok(summary) => {
                self.audit(&tenant, "sync_completed", summary.clone());
                Ok(summary)
            }
            Err(exhausted) => {
                let message = format!(
                    "tenant {}: {} sync failed after {} attempt(s) in phase {}: {}",
                    tenant,
                    kind,
                    exhausted.attempts,
                    exhausted.failure.phase,
                    exhausted.failure.error
                );
                error!(
                    phase = %exhausted.failure.phase,
                    attempts = exhausted.attempts,
                    error_kind = exhausted.failure.error.kind(),
                    "{}",
                    message
                );
                self.audit(
                    &tenant,
                    "sync_failed",
                    json!({
                        "kind": kind,
                        "phase": exhausted.failure.phase,
                        "attempts": exhausted.attempts,
                        "error_kind": exhausted.failure.error.kind(),
                        "error": exhausted.failure.error.to_string(),
                    }),
                );
                Err(message)
            }
        }
    }

    async fn attempt(&self, kind: SyncKind, tenant: TenantId) -> Result<serde_json::Value, SyncFailure> {
        self.ensure_tenant(&tenant)?;

        match kind {
            SyncKind::Accounts => {
                let result = self.accounts.sync(&tenant).await?;
                Ok(json!({
                    "tenant_id": tenant,
                    "kind": kind,
                    "inserted": result.inserted,
                    "updated": result.updated,
                    "total": result.total(),
                }))
            }
            SyncKind::Transactions => {
                let result = self.transactions.sync(&tenant).await?;
                Ok(json!({
                    "tenant_id": tenant,
                    "kind": kind,
                    "inserted": result.report.inserted,
                    "duplicates": result.report.duplicates,
                    "pages_fetched": result.pages_fetched,
                    "ids_seen": result.ids_seen,
                }))
            }
        }
    }

    fn ensure_tenant(&self, tenant: &TenantId) -> Result<Tenant, SyncFailure> {
        db::with_connection(&self.db, |conn| db::get_tenant(conn, tenant))
            .map_err(SyncError::from)
            .and_then(|found| found.ok_or_else(|| SyncError::NotFound(format!("tenant {}", tenant))))
            .phase(SyncPhase::Enumerate)
    }

    fn audit(&self, tenant: &TenantId, event_type: &str, data: serde_json::Value) {
        let event = Event::new(event_type, "tenant", &tenant.to_string(), data, ACTOR);
        if let Err(e) = db::with_connection(&self.db, |conn| db::insert_event(conn, &event)) {
            warn!(error = %e, event_type, "failed to record audit event");
        }
    }
}
