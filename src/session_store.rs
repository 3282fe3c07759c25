// 🗝️ Session Store - keyed TTL cache for per-tenant bank session state
//
// Holds device ids, credentials, confirmation sessions, token pairs and
// business contexts. Absence of a key is never an error: callers treat it as
// "this state must be (re)established".

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::db::{self, SharedConnection};
use crate::entities::TenantId;
use crate::error::SyncResult;

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, key: &str) -> SyncResult<Option<String>>;

    /// Store without expiry.
    async fn set(&self, key: &str, value: String) -> SyncResult<()>;

    async fn set_with_ttl(&self, key: &str, value: String, ttl: Duration) -> SyncResult<()>;

    /// Returns true if the key existed.
    async fn delete(&self, key: &str) -> SyncResult<bool>;

    /// Remaining lifetime; `None` for missing keys and keys without expiry.
    async fn ttl_remaining(&self, key: &str) -> SyncResult<Option<Duration>>;
}

// ============================================================================
// TYPED HELPERS
// ============================================================================

/// Read a JSON value. Undecodable entries are treated as absent.
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn SessionStore,
    key: &str,
) -> SyncResult<Option<T>> {
    let Some(raw) = store.get(key).await? else {
        return Ok(None);
    };

    match serde_json::from_str(&raw) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            warn!(key, error = %e, "discarding undecodable session entry");
            Ok(None)
        }
    }
}

pub async fn set_json<T: Serialize>(store: &dyn SessionStore, key: &str, value: &T) -> SyncResult<()> {
    let raw = serde_json::to_string(value).map_err(anyhow::Error::from)?;
    store.set(key, raw).await
}

pub async fn set_json_with_ttl<T: Serialize>(
    store: &dyn SessionStore,
    key: &str,
    value: &T,
    ttl: Duration,
) -> SyncResult<()> {
    let raw = serde_json::to_string(value).map_err(anyhow::Error::from)?;
    store.set_with_ttl(key, raw, ttl).await
}

// ============================================================================
// KEYS
// ============================================================================

/// Key namespace: `bank:{tenant}:{purpose}`, plus `bank:otp:{session}`.
pub struct SessionKey;

impl SessionKey {
    const NAMESPACE: &'static str = "bank";

    pub fn device(tenant: &TenantId) -> String {
        format!("{}:{}:device", Self::NAMESPACE, tenant)
    }

    pub fn credentials(tenant: &TenantId) -> String {
        format!("{}:{}:credentials", Self::NAMESPACE, tenant)
    }

    pub fn tokens(tenant: &TenantId) -> String {
        format!("{}:{}:tokens", Self::NAMESPACE, tenant)
    }

    pub fn business_context(tenant: &TenantId) -> String {
        format!("{}:{}:business_context", Self::NAMESPACE, tenant)
    }

    pub fn confirmation(session_id: &Uuid) -> String {
        format!("{}:otp:{}", Self::NAMESPACE, session_id)
    }
}

// ============================================================================
// IN-MEMORY STORE
// ============================================================================

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

/// Process-local store. Clones share the same backing map.
#[derive(Clone)]
pub struct MemorySessionStore {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
    clock: Arc<dyn Clock>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        MemorySessionStore {
            entries: Arc::new(RwLock::new(HashMap::new())),
            clock,
        }
    }

    /// Number of live entries
    pub async fn len(&self) -> usize {
        let now = self.clock.now();
        let entries = self.entries.read().await;
        entries.values().filter(|e| !e.is_expired(now)).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, key: &str) -> SyncResult<Option<String>> {
        let now = self.clock.now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                None => return Ok(None),
                Some(entry) if !entry.is_expired(now) => return Ok(Some(entry.value.clone())),
                Some(_) => {}
            }
        }

        // Expired: purge lazily
        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(|e| e.is_expired(now)) {
            entries.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: String) -> SyncResult<()> {
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn set_with_ttl(&self, key: &str, value: String, ttl: Duration) -> SyncResult<()> {
        let expires_at = self.clock.now() + ttl;
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Some(expires_at),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> SyncResult<bool> {
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        Ok(entries.remove(key).is_some_and(|e| !e.is_expired(now)))
    }

    async fn ttl_remaining(&self, key: &str) -> SyncResult<Option<Duration>> {
        let now = self.clock.now();
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|e| !e.is_expired(now))
            .and_then(|e| e.expires_at)
            .map(|at| at - now))
    }
}

// ============================================================================
// SQLITE STORE
// ============================================================================

/// Durable store in the `session_entries` table, so state survives
/// between CLI invocations and server restarts.
#[derive(Clone)]
pub struct SqliteSessionStore {
    db: SharedConnection,
    clock: Arc<dyn Clock>,
}

impl SqliteSessionStore {
    pub fn new(db: SharedConnection) -> Self {
        Self::with_clock(db, Arc::new(SystemClock))
    }

    pub fn with_clock(db: SharedConnection, clock: Arc<dyn Clock>) -> Self {
        SqliteSessionStore { db, clock }
    }

    /// Remove every expired entry
    pub fn purge_expired(&self) -> SyncResult<usize> {
        let now = self.clock.now();
        Ok(db::with_connection(&self.db, |conn| {
            db::purge_expired_session_entries(conn, now)
        })?)
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn get(&self, key: &str) -> SyncResult<Option<String>> {
        let now = self.clock.now();
        Ok(db::with_connection(&self.db, |conn| db::get_session_entry(conn, key, now))?)
    }

    async fn set(&self, key: &str, value: String) -> SyncResult<()> {
        Ok(db::with_connection(&self.db, |conn| {
            db::put_session_entry(conn, key, &value, None)
        })?)
    }

    async fn set_with_ttl(&self, key: &str, value: String, ttl: Duration) -> SyncResult<()> {
        let expires_at = self.clock.now() + ttl;
        Ok(db::with_connection(&self.db, |conn| {
            db::put_session_entry(conn, key, &value, Some(expires_at))
        })?)
    }

    async fn delete(&self, key: &str) -> SyncResult<bool> {
        let now = self.clock.now();
        Ok(db::with_connection(&self.db, |conn| db::delete_session_entry(conn, key, now))?)
    }

    async fn ttl_remaining(&self, key: &str) -> SyncResult<Option<Duration>> {
        let now = self.clock.now();
        let expiry = db::with_connection(&self.db, |conn| db::session_entry_expiry(conn, key, now))?;
        Ok(expiry.map(|at| at - now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde::Deserialize;

    fn store_with_clock() -> (MemorySessionStore, ManualClock) {
        let clock = ManualClock::default();
        let store = MemorySessionStore::with_clock(Arc::new(clock.clone()));
        (store, clock)
    }

    #[tokio::test]
    async fn test_missing_key_is_none() {
        let store = MemorySessionStore::new();

        assert_eq!(store.get("bank:nope:tokens").await.unwrap(), None);
        assert_eq!(store.ttl_remaining("bank:nope:tokens").await.unwrap(), None);
        assert!(!store.delete("bank:nope:tokens").await.unwrap());
    }

    #[tokio::test]
    async fn test_ttl_expiry_with_manual_clock() {
        let (store, clock) = store_with_clock();

        store
            .set_with_ttl("otp", "payload".into(), Duration::seconds(65))
            .await
            .unwrap();

        clock.advance(Duration::seconds(30));
        assert_eq!(store.get("otp").await.unwrap(), Some("payload".to_string()));
        assert_eq!(
            store.ttl_remaining("otp").await.unwrap(),
            Some(Duration::seconds(35))
        );

        clock.advance(Duration::seconds(36));
        assert_eq!(store.get("otp").await.unwrap(), None);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_set_without_ttl_never_expires() {
        let (store, clock) = store_with_clock();

        store.set("creds", "secret".into()).await.unwrap();
        clock.advance(Duration::days(365));

        assert_eq!(store.get("creds").await.unwrap(), Some("secret".to_string()));
        assert_eq!(store.ttl_remaining("creds").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_writes_visible_to_clones() {
        let store = MemorySessionStore::new();
        let other = store.clone();

        store.set("k", "v".into()).await.unwrap();

        assert_eq!(other.get("k").await.unwrap(), Some("v".to_string()));
        assert!(other.delete("k").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        code: String,
    }

    #[tokio::test]
    async fn test_json_helpers_treat_garbage_as_absent() {
        let store = MemorySessionStore::new();

        set_json(&store, "good", &Sample { code: "A1".into() }).await.unwrap();
        store.set("bad", "{not json".into()).await.unwrap();

        let good: Option<Sample> = get_json(&store, "good").await.unwrap();
        let bad: Option<Sample> = get_json(&store, "bad").await.unwrap();

        assert_eq!(good, Some(Sample { code: "A1".into() }));
        assert_eq!(bad, None);
    }

    #[tokio::test]
    async fn test_sqlite_store_matches_memory_semantics() {
        let clock = ManualClock::default();
        let db = db::open_shared_in_memory().unwrap();
        let store = SqliteSessionStore::with_clock(db.clone(), Arc::new(clock.clone()));

        store.set("creds", "secret".into()).await.unwrap();
        store
            .set_with_ttl("otp", "payload".into(), Duration::seconds(65))
            .await
            .unwrap();

        assert_eq!(store.ttl_remaining("otp").await.unwrap(), Some(Duration::seconds(65)));
        assert_eq!(store.ttl_remaining("creds").await.unwrap(), None);

        clock.advance(Duration::seconds(66));
        assert_eq!(store.get("otp").await.unwrap(), None);
        assert!(!store.delete("otp").await.unwrap());

        // a second handle on the same database sees the same entries
        let reopened = SqliteSessionStore::with_clock(db, Arc::new(clock.clone()));
        assert_eq!(reopened.get("creds").await.unwrap(), Some("secret".to_string()));
        assert_eq!(reopened.purge_expired().unwrap(), 0);
    }

    #[test]
    fn test_key_shapes() {
        let tenant = TenantId::from(Uuid::nil());
        let session = Uuid::nil();

        assert_eq!(
            SessionKey::device(&tenant),
            "bank:00000000-0000-0000-0000-000000000000:device"
        );
        assert_eq!(
            SessionKey::business_context(&tenant),
            "bank:00000000-0000-0000-0000-000000000000:business_context"
        );
        assert_eq!(
            SessionKey::confirmation(&session),
            "bank:otp:00000000-0000-0000-0000-000000000000"
        );
    }
}
