// 🧾 Transaction Synchronizer
//
// Two phases:
//   1. Discovery: page through paymentOrders/inBank and keep the ids storage
//      has never seen. Newest orders come first, so by default paging stops
//      at the first page that is not entirely new.
//   2. Hydration: fetch each unknown order's detail, one at a time, then
//      insert the whole batch in one SQLite transaction.
//
// A failure anywhere before the insert leaves the ledger untouched.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::auth::{Authenticator, BankSession};
use crate::bank::models::PaymentOrderDetail;
use crate::business::{BusinessContext, BusinessContextResolver};
use crate::config::SyncSettings;
use crate::db::{self, InsertReport, SharedConnection};
use crate::entities::{Direction, TenantId, Transaction, TransactionStatus};
use crate::error::{PhaseExt, SyncError, SyncFailure, SyncPhase, SyncResult};

const DEFAULT_CURRENCY: &str = "UZS";

/// When discovery stops paging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryMode {
    /// Stop after the first page that contains any known id (or no ids)
    #[default]
    EarlyStop,
    /// Always page to `totalPages`
    Exhaustive,
}

impl DiscoveryMode {
    pub fn from_settings(settings: &SyncSettings) -> Self {
        if settings.exhaustive_discovery {
            DiscoveryMode::Exhaustive
        } else {
            DiscoveryMode::EarlyStop
        }
    }
}

/// Ids collected by the discovery phase
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Discovery {
    pub unknown_ids: Vec<String>,
    pub pages_fetched: u32,
    pub ids_seen: usize,
}

/// Outcome of one transaction sync
#[derive(Debug, Clone, Default, Serialize)]
pub struct NewTransactions {
    pub transactions: Vec<Transaction>,
    pub pages_fetched: u32,
    pub ids_seen: usize,
    pub report: InsertReport,
}

impl NewTransactions {
    pub fn count(&self) -> usize {
        self.report.inserted
    }
}

#[derive(Clone)]
pub struct TransactionSynchronizer {
    auth: Authenticator,
    resolver: BusinessContextResolver,
    db: SharedConnection,
    settings: SyncSettings,
    mode: DiscoveryMode,
}

impl TransactionSynchronizer {
    pub fn new(auth: Authenticator, db: SharedConnection, settings: SyncSettings) -> Self {
        let mode = DiscoveryMode::from_settings(&settings);
        TransactionSynchronizer {
            resolver: BusinessContextResolver::new(auth.clone()),
            auth,
            db,
            settings,
            mode,
        }
    }

    pub fn with_mode(mut self, mode: DiscoveryMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn mode(&self) -> DiscoveryMode {
        self.mode
    }

    #[instrument(skip(self), fields(tenant = %tenant, mode = ?self.mode))]
    pub async fn sync(&self, tenant: &TenantId) -> Result<NewTransactions, SyncFailure> {
        let session = self.auth.authorize(tenant).await.phase(SyncPhase::Authenticate)?;
        let context = self.resolver.resolve(tenant).await.phase(SyncPhase::ResolveContext)?;

        let discovered = self.discover(&session, &context).await;
        let discovery = self
            .auth
            .discard_refused_token(tenant, discovered)
            .await
            .phase(SyncPhase::Discover)?;

        if discovery.unknown_ids.is_empty() {
            info!(pages = discovery.pages_fetched, "no new transactions");
            return Ok(NewTransactions {
                pages_fetched: discovery.pages_fetched,
                ids_seen: discovery.ids_seen,
                ..Default::default()
            });
        }

        let hydrated = self
            .hydrate(tenant, &session, &context, &discovery.unknown_ids)
            .await;
        let transactions = self
            .auth
            .discard_refused_token(tenant, hydrated)
            .await
            .phase(SyncPhase::Hydrate)?;

        let report = db::with_connection(&self.db, |conn| db::insert_transactions(conn, &transactions))
            .map_err(SyncError::from)
            .phase(SyncPhase::PersistTransactions)?;

        info!(
            inserted = report.inserted,
            duplicates = report.duplicates,
            pages = discovery.pages_fetched,
            "transactions synced"
        );

        Ok(NewTransactions {
            transactions,
            pages_fetched: discovery.pages_fetched,
            ids_seen: discovery.ids_seen,
            report,
        })
    }

    /// Page through the list and collect ids storage does not know yet.
    pub async fn discover(
        &self,
        session: &BankSession,
        context: &BusinessContext,
    ) -> SyncResult<Discovery> {
        let client = self.auth.client();
        let mut discovery = Discovery::default();
        let mut collected: HashSet<String> = HashSet::new();
        let mut page_number = 1;

        loop {
            let page = client
                .transactions_page(session, context, page_number, self.settings.page_size)
                .await?;
            discovery.pages_fetched += 1;

            let page_ids: Vec<String> = page.items.into_iter().filter_map(|item| item.id).collect();
            discovery.ids_seen += page_ids.len();

            let unknown = db::with_connection(&self.db, |conn| {
                db::get_non_existing_transaction_ids(conn, &page_ids)
            })?;

            debug!(
                page_number,
                total_pages = page.total_pages,
                ids = page_ids.len(),
                unknown = unknown.len(),
                "transactions page"
            );

            let page_entirely_new = !page_ids.is_empty() && unknown.len() == page_ids.len();

            for id in unknown {
                // the list can shift between pages while new orders arrive
                if collected.insert(id.clone()) {
                    discovery.unknown_ids.push(id);
                }
            }

            if self.mode == DiscoveryMode::EarlyStop && !page_entirely_new {
                break;
            }
            if page_number >= page.total_pages {
                break;
            }

            page_number += 1;
            tokio::time::sleep(self.settings.page_delay()).await;
        }

        Ok(discovery)
    }

    /// Fetch full detail for every id, sequentially and paced.
    async fn hydrate(
        &self,
        tenant: &TenantId,
        session: &BankSession,
        context: &BusinessContext,
        ids: &[String],
    ) -> SyncResult<Vec<Transaction>> {
        let client = self.auth.client();
        let mut transactions = Vec::with_capacity(ids.len());

        for (i, id) in ids.iter().enumerate() {
            let detail = client.transaction_detail(session, context, id).await?;
            transactions.push(map_payment_order(*tenant, id, detail));

            if i + 1 < ids.len() {
                tokio::time::sleep(self.settings.detail_delay()).await;
            }
        }

        Ok(transactions)
    }
}

/// Payment-order detail → ledger row
pub fn map_payment_order(tenant: TenantId, requested_id: &str, detail: PaymentOrderDetail) -> Transaction {
    let transaction_id = detail
        .id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| requested_id.to_string());

    let currency = detail
        .currency
        .and_then(|c| c.alpha_code)
        .filter(|code| !code.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_CURRENCY.to_string());

    let document_date = detail.proved_date.as_deref().and_then(|raw| {
        let parsed = parse_document_date(raw);
        if parsed.is_none() {
            debug!(transaction_id = %transaction_id, raw, "unparseable document date, leaving it unset");
        }
        parsed
    });

    Transaction {
        id: Uuid::new_v4().to_string(),
        tenant_id: tenant,
        transaction_id,
        receiver_name: detail.receiver_name,
        receiver_inn: detail.receiver_inn_or_pinfl,
        receiver_account: detail.receiver_account_number,
        receiver_bank_code: detail.receiver_branch,
        sender_name: detail.sender_name,
        sender_inn: detail.sender_inn,
        sender_account: detail.sender_account_number,
        sender_bank_code: detail.sender_branch,
        payment_amount: detail.amount,
        currency,
        payment_description: detail.payment_purpose,
        payment_purpose_code: detail.payment_purpose_code,
        payment_number: detail.payment_number,
        direction: detail.direction.map(Direction::from),
        document_date,
        status: TransactionStatus::Completed,
        created_at: Utc::now(),
    }
}

/// RFC 3339, or a naive ISO timestamp / date taken as UTC.
pub fn parse_document_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }

    chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}
