// 💳 Account Synchronizer
//
// authorize → resolve business context → page through filtered-accounts →
// normalize → one upsert keyed by account number. Safe to re-run.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::auth::{Authenticator, BankSession};
use crate::bank::models::AccountItem;
use crate::business::{BusinessContext, BusinessContextResolver};
use crate::clock::{Clock, SystemClock};
use crate::config::SyncSettings;
use crate::db::{self, SharedConnection, UpsertResult};
use crate::entities::{BankAccount, BankType, TenantId};
use crate::error::{PhaseExt, SyncError, SyncFailure, SyncPhase, SyncResult};

const DEFAULT_CURRENCY: &str = "UZS";

#[derive(Clone)]
pub struct AccountSynchronizer {
    auth: Authenticator,
    resolver: BusinessContextResolver,
    db: SharedConnection,
    settings: SyncSettings,
    clock: Arc<dyn Clock>,
}

impl AccountSynchronizer {
    pub fn new(auth: Authenticator, db: SharedConnection, settings: SyncSettings) -> Self {
        AccountSynchronizer {
            resolver: BusinessContextResolver::new(auth.clone()),
            auth,
            db,
            settings,
            clock: Arc::new(SystemClock),
        }
    }

    /// Use `clock` for the `updated_at` stamp
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[instrument(skip(self), fields(tenant = %tenant))]
    pub async fn sync(&self, tenant: &TenantId) -> Result<UpsertResult, SyncFailure> {
        let session = self.auth.authorize(tenant).await.phase(SyncPhase::Authenticate)?;
        let context = self.resolver.resolve(tenant).await.phase(SyncPhase::ResolveContext)?;

        let fetched = self.fetch_all(&session, &context).await;
        let items = self
            .auth
            .discard_refused_token(tenant, fetched)
            .await
            .phase(SyncPhase::FetchAccounts)?;

        let accounts = dedupe_by_number(
            items
                .into_iter()
                .map(|item| normalize_account(*tenant, item))
                .collect(),
        );

        if accounts.is_empty() {
            info!("bank reported no accounts");
            return Ok(UpsertResult::default());
        }

        let now = self.clock.now();
        let result = db::with_connection(&self.db, |conn| db::upsert_bank_accounts(conn, &accounts, now))
            .map_err(SyncError::from)
            .phase(SyncPhase::PersistAccounts)?;

        info!(
            inserted = result.inserted,
            updated = result.updated,
            "accounts synced"
        );
        Ok(result)
    }

    async fn fetch_all(
        &self,
        session: &BankSession,
        context: &BusinessContext,
    ) -> SyncResult<Vec<AccountItem>> {
        let client = self.auth.client();
        let mut items = Vec::new();
        let mut page_number = 1;

        loop {
            let page = client
                .accounts_page(session, context, page_number, self.settings.page_size)
                .await?;
            debug!(page_number, total_pages = page.total_pages, count = page.items.len(), "accounts page");
            items.extend(page.items);

            if page_number >= page.total_pages {
                break;
            }

            page_number += 1;
            tokio::time::sleep(self.settings.page_delay()).await;
        }

        Ok(items)
    }
}

/// Wire item → storage row. Balance is already in major units.
pub fn normalize_account(tenant: TenantId, item: AccountItem) -> BankAccount {
    let currency = item
        .currency
        .and_then(|c| c.alpha_code)
        .filter(|code| !code.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_CURRENCY.to_string());

    BankAccount::new(
        tenant,
        BankType::Kapitalbank,
        item.number,
        currency,
        item.current_balance,
        item.branch,
    )
}

/// One row per account number, the last listing wins. A single upsert
/// statement cannot touch the same key twice.
fn dedupe_by_number(accounts: Vec<BankAccount>) -> Vec<BankAccount> {
    let mut position: HashMap<String, usize> = HashMap::new();
    let mut unique: Vec<BankAccount> = Vec::with_capacity(accounts.len());

    for account in accounts {
        match position.get(&account.account_number) {
            Some(&i) => unique[i] = account,
            None => {
                position.insert(account.account_number.clone(), unique.len());
                unique.push(account);
            }
        }
    }

    unique
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use serde_json::json;

    #[test]
    fn test_normalize_account() {
        let tenant = TenantId::new();
        let item: AccountItem = serde_json::from_value(json!({
            "number": "20208000900123456001",
            "branch": "01158",
            "currency": {"alphaCode": "USD"},
            "currentBalance": 500
        }))
        .unwrap();

        let account = normalize_account(tenant, item);

        assert_eq!(account.tenant_id, tenant);
        assert_eq!(account.bank_type, BankType::Kapitalbank);
        assert_eq!(account.currency, "USD");
        assert_eq!(account.balance, Decimal::new(500, 2));
        assert_eq!(account.mfo_number.as_deref(), Some("01158"));
    }

    #[test]
    fn test_normalize_account_without_currency() {
        let item: AccountItem = serde_json::from_value(json!({"number": "1"})).unwrap();
        let account = normalize_account(TenantId::new(), item);
        assert_eq!(account.currency, "UZS");
        assert_eq!(account.balance, Decimal::ZERO);
        assert_eq!(account.mfo_number, None);
    }

    #[test]
    fn test_dedupe_keeps_last_listing() {
        let tenant = TenantId::new();
        let account = |number: &str, cents: i64| {
            BankAccount::new(tenant, BankType::Kapitalbank, number.into(), "UZS".into(), Decimal::new(cents, 2), None)
        };

        let unique = dedupe_by_number(vec![account("A", 100), account("B", 200), account("A", 300)]);

        assert_eq!(unique.len(), 2);
        assert_eq!(unique[0].account_number, "A");
        assert_eq!(unique[0].balance, Decimal::new(300, 2));
    }
}
