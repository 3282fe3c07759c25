// ⏰ Scheduler - periodic fan-out and housekeeping
//
// Accounts, transactions and maintenance tick on independent intervals. The
// first tick fires one full period after start.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{info, warn};

use crate::config::{SchedulerConfig, StorageConfig};
use crate::db::{self, SharedConnection};
use crate::error::SyncResult;
use crate::orchestrator::{Orchestrator, SyncKind};
use crate::session_store::SqliteSessionStore;

/// Finished task records older than this are dropped from the registry
const TASK_RETENTION_HOURS: i64 = 24;

/// Running tick loops; aborted on drop
pub struct Scheduler {
    loops: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn start(orchestrator: Orchestrator, config: &SchedulerConfig) -> Self {
        if !config.enabled {
            info!("scheduler disabled");
            return Scheduler { loops: Vec::new() };
        }

        let loops = vec![
            spawn_loop(
                orchestrator.clone(),
                SyncKind::Accounts,
                Duration::from_secs(config.accounts_interval_secs.max(1)),
            ),
            spawn_loop(
                orchestrator,
                SyncKind::Transactions,
                Duration::from_secs(config.transactions_interval_secs.max(1)),
            ),
        ];

        Scheduler { loops }
    }

    /// Add the housekeeping loop. No-op when the scheduler is disabled.
    pub fn with_maintenance(mut self, maintenance: Maintenance, config: &SchedulerConfig) -> Self {
        if config.enabled {
            let period = Duration::from_secs(config.maintenance_interval_secs.max(1));
            self.loops.push(spawn_maintenance(maintenance, period));
        }
        self
    }

    pub fn is_running(&self) -> bool {
        self.loops.iter().any(|handle| !handle.is_finished())
    }

    pub fn shutdown(&mut self) {
        for handle in self.loops.drain(..) {
            handle.abort();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_loop(orchestrator: Orchestrator, kind: SyncKind, period: Duration) -> JoinHandle<()> {
    info!(kind = %kind, period_secs = period.as_secs(), "scheduling periodic sync");

    tokio::spawn(async move {
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;

            let handle = match kind {
                SyncKind::Accounts => orchestrator.dispatch_sync_all_accounts(),
                SyncKind::Transactions => orchestrator.dispatch_sync_all_transactions(),
            };
            info!(kind = %kind, task_id = %handle.id(), "scheduled sync dispatched");

            let cutoff = Utc::now() - chrono::Duration::hours(TASK_RETENTION_HOURS);
            orchestrator.registry().prune_finished(cutoff);
        }
    })
}

fn spawn_maintenance(maintenance: Maintenance, period: Duration) -> JoinHandle<()> {
    info!(period_secs = period.as_secs(), "scheduling maintenance");

    tokio::spawn(async move {
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if let Err(e) = maintenance.run() {
                warn!(error = %e, "maintenance failed, retrying next tick");
            }
        }
    })
}

// ============================================================================
// MAINTENANCE
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub events_deleted: usize,
    pub sessions_purged: usize,
}

/// Deletes expired audit events and session entries
#[derive(Clone)]
pub struct Maintenance {
    db: SharedConnection,
    sessions: Option<Arc<SqliteSessionStore>>,
    retention: chrono::Duration,
    batch_size: usize,
}

impl Maintenance {
    pub fn new(db: SharedConnection, storage: &StorageConfig) -> Self {
        Maintenance {
            db,
            sessions: None,
            retention: storage.event_retention(),
            batch_size: storage.event_purge_batch,
        }
    }

    pub fn with_sessions(mut self, sessions: Arc<SqliteSessionStore>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn run(&self) -> SyncResult<MaintenanceReport> {
        let cutoff = Utc::now() - self.retention;
        let events_deleted = db::with_connection(&self.db, |conn| {
            db::delete_events_older_than(conn, cutoff, self.batch_size)
        })?;

        let sessions_purged = match &self.sessions {
            Some(store) => store.purge_expired()?,
            None => 0,
        };

        let report = MaintenanceReport {
            events_deleted,
            sessions_purged,
        };
        info!(
            events_deleted = report.events_deleted,
            sessions_purged = report.sessions_purged,
            "maintenance completed"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Authenticator;
    use crate::bank::BankClient;
    use crate::config::{BankConfig, Settings};
    use crate::clock::ManualClock;
    use crate::db::Event;
    use crate::session_store::{MemorySessionStore, SessionStore};

    fn create_test_orchestrator() -> Orchestrator {
        let client = BankClient::new(BankConfig::for_base_url("http://127.0.0.1:9")).unwrap();
        let auth = Authenticator::new(Arc::new(MemorySessionStore::new()), client);
        let conn = db::open_shared_in_memory().unwrap();
        Orchestrator::new(auth, conn, &Settings::default())
    }

    fn config(enabled: bool) -> SchedulerConfig {
        SchedulerConfig {
            enabled,
            accounts_interval_secs: 60,
            transactions_interval_secs: 3600,
            maintenance_interval_secs: 7200,
        }
    }

    #[tokio::test]
    async fn test_disabled_scheduler_spawns_nothing() {
        let scheduler = Scheduler::start(create_test_orchestrator(), &config(false));
        assert!(!scheduler.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_tick_waits_one_period() {
        let orchestrator = create_test_orchestrator();
        let mut scheduler = Scheduler::start(orchestrator.clone(), &config(true));
        assert!(scheduler.is_running());

        time::sleep(Duration::from_secs(59)).await;
        assert!(orchestrator.registry().list().is_empty());

        time::sleep(Duration::from_secs(2)).await;
        let names: Vec<String> = orchestrator
            .registry()
            .list()
            .into_iter()
            .map(|record| record.name)
            .collect();
        assert_eq!(names, vec!["sync_all_accounts"]);

        scheduler.shutdown();
        assert!(scheduler.loops.is_empty());
    }

    fn insert_event_aged(conn: &SharedConnection, age: chrono::Duration) {
        let mut event = Event::new("sync_completed", "tenant", "t1", serde_json::json!({}), "orchestrator");
        event.timestamp = Utc::now() - age;
        db::with_connection(conn, |c| db::insert_event(c, &event)).unwrap();
    }

    fn count(conn: &SharedConnection, table: &str) -> i64 {
        db::with_connection(conn, |c| {
            Ok(c.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))?)
        })
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_maintenance_tick_applies_retention() {
        let conn = db::open_shared_in_memory().unwrap();
        insert_event_aged(&conn, chrono::Duration::days(45));
        insert_event_aged(&conn, chrono::Duration::days(2));

        let clock = ManualClock::new(Utc::now());
        let sessions = Arc::new(SqliteSessionStore::with_clock(conn.clone(), Arc::new(clock.clone())));
        sessions
            .set_with_ttl("bank:otp:abandoned", "{}".to_string(), chrono::Duration::seconds(65))
            .await
            .unwrap();
        sessions.set("bank:t:credentials", "{}".to_string()).await.unwrap();
        clock.advance(chrono::Duration::seconds(66));

        let maintenance =
            Maintenance::new(conn.clone(), &StorageConfig::default()).with_sessions(sessions);
        let _scheduler = Scheduler::start(create_test_orchestrator(), &config(true))
            .with_maintenance(maintenance, &config(true));

        time::sleep(Duration::from_secs(7199)).await;
        assert_eq!(count(&conn, "events"), 2);
        assert_eq!(count(&conn, "session_entries"), 2);

        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(count(&conn, "events"), 1);
        assert_eq!(count(&conn, "session_entries"), 1);
    }

    #[test]
    fn test_maintenance_without_session_store() {
        let conn = db::open_shared_in_memory().unwrap();
        insert_event_aged(&conn, chrono::Duration::days(31));

        let report = Maintenance::new(conn, &StorageConfig::default()).run().unwrap();

        assert_eq!(
            report,
            MaintenanceReport {
                events_deleted: 1,
                sessions_purged: 0,
            }
        );
    }
}
