// 🏢 Business-Context Resolver
//
// Every account and payment-order endpoint is addressed as
// /business/{code}/{branch}/... . The pair is fetched once per tenant and
// cached for 30 days.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::auth::Authenticator;
use crate::entities::TenantId;
use crate::error::{SyncError, SyncResult};
use crate::session_store::{get_json, set_json_with_ttl, SessionKey};

const CONTEXT_TTL_DAYS: i64 = 30;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessContext {
    pub business_code: String,
    pub branch: String,
}

#[derive(Clone)]
pub struct BusinessContextResolver {
    auth: Authenticator,
}

impl BusinessContextResolver {
    pub fn new(auth: Authenticator) -> Self {
        BusinessContextResolver { auth }
    }

    /// Cached context, or the first business the bank lists for this user.
    #[instrument(skip(self), fields(tenant = %tenant))]
    pub async fn resolve(&self, tenant: &TenantId) -> SyncResult<BusinessContext> {
        let store = self.auth.store().as_ref();
        let key = SessionKey::business_context(tenant);

        if let Some(cached) = get_json::<BusinessContext>(store, &key).await? {
            debug!("business context served from cache");
            return Ok(cached);
        }

        let session = self.auth.authorize(tenant).await?;
        let listed = self.auth.client().business_list(&session).await;
        let businesses = self.auth.discard_refused_token(tenant, listed).await?;
        let first = businesses.into_iter().next().ok_or_else(|| {
            SyncError::NotFound(format!("bank lists no business for tenant {}", tenant))
        })?;

        let context = BusinessContext {
            business_code: first.business_code,
            branch: first.branch,
        };
        set_json_with_ttl(store, &key, &context, Duration::days(CONTEXT_TTL_DAYS)).await?;
        info!(business_code = %context.business_code, branch = %context.branch, "business context resolved");

        Ok(context)
    }
}
