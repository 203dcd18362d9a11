//! Lytex payment-gateway client.
//!
//! Owns the per-slot token cache, the dual-source invoice lookup and
//! the paginated invoice listing. The provider is the source of truth
//! for payment status but only exposes an eventually-consistent HTTP
//! API, so callers treat every answer as a snapshot.

use crate::config::{LytexConfig, LytexCredentials};
use crate::models::IntegrationSource;
use crate::services::metrics::LYTEX_REQUEST_DURATION;
use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, StatusCode};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use service_core::error::AppError;
use tokio::sync::RwLock;

/// Tokens are refreshed once their expiry is closer than this margin,
/// so an in-flight batch never runs into a mid-chunk 401.
const REFRESH_MARGIN_MINUTES: i64 = 5;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ObtainTokenRequest<'a> {
    client_id: &'a str,
    client_secret: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    access_token: String,
    #[allow(dead_code)]
    refresh_token: Option<String>,
    /// Lifetime in seconds.
    expires_in: i64,
}

#[derive(Debug, Clone)]
pub struct CachedToken {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

impl CachedToken {
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at - now > Duration::minutes(REFRESH_MARGIN_MINUTES)
    }
}

/// An invoice answered by one of the credential slots. The raw payload
/// is kept verbatim for the extractors and the audit snapshot.
#[derive(Debug, Clone)]
pub struct FetchedInvoice {
    pub raw: Value,
    pub source: IntegrationSource,
}

/// One page of the provider's invoice listing.
#[derive(Debug, Clone)]
pub struct InvoicePage {
    pub invoices: Vec<Value>,
    pub has_more: bool,
}

impl InvoicePage {
    /// The listing body is either `{ "data": [...] }` or a bare array
    /// depending on API version; a full page signals more to come.
    pub fn from_body(body: Value, limit: u32) -> Self {
        let invoices = match body {
            Value::Array(items) => items,
            Value::Object(mut map) => map
                .remove("data")
                .and_then(|d| d.as_array().cloned())
                .unwrap_or_default(),
            _ => Vec::new(),
        };
        let has_more = invoices.len() as u32 == limit && limit > 0;
        Self { invoices, has_more }
    }
}

/// Seam between the reconciliation engine and the payment provider.
#[async_trait]
pub trait InvoiceGateway: Send + Sync {
    /// Warm the primary credential slot before a batch. A failed
    /// primary exchange is a run-fatal configuration problem, not a
    /// per-item error.
    async fn authenticate_primary(&self) -> Result<(), AppError>;

    /// Lookup across both credential slots; `None` means not found
    /// anywhere (a valid outcome, not an error).
    async fn find_invoice(&self, invoice_id: &str) -> Result<Option<FetchedInvoice>, AppError>;

    /// One page of the invoice listing on a specific slot, optionally
    /// filtered by provider status.
    async fn list_invoices(
        &self,
        source: IntegrationSource,
        status: Option<&str>,
        page: u32,
        limit: u32,
    ) -> Result<InvoicePage, AppError>;

    /// The slots this gateway can currently serve. Secondary is
    /// optional and its absence is not an error.
    async fn available_sources(&self) -> Vec<IntegrationSource>;
}

/// HTTP client against the Lytex API, one instance per run context so
/// per-tenant credentials stay isolated.
pub struct LytexClient {
    http: Client,
    config: LytexConfig,
    primary_token: RwLock<Option<CachedToken>>,
    secondary_token: RwLock<Option<CachedToken>>,
}

impl LytexClient {
    pub fn new(config: LytexConfig) -> Result<Self, AppError> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| AppError::ConfigError(anyhow!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            config,
            primary_token: RwLock::new(None),
            secondary_token: RwLock::new(None),
        })
    }

    async fn exchange(&self, credentials: &LytexCredentials) -> Result<CachedToken, AppError> {
        let url = format!("{}/auth/obtain_token", self.config.base_url);
        let timer = LYTEX_REQUEST_DURATION
            .with_label_values(&["obtain_token"])
            .start_timer();

        let response = self
            .http
            .post(&url)
            .json(&ObtainTokenRequest {
                client_id: &credentials.client_id,
                client_secret: credentials.client_secret.expose_secret(),
            })
            .send()
            .await
            .map_err(|e| AppError::GatewayError(anyhow!("Token exchange failed: {}", e)))?;
        timer.observe_duration();

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::GatewayError(anyhow!(
                "Token exchange rejected ({}): {}",
                status,
                body
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| AppError::GatewayError(anyhow!("Malformed token response: {}", e)))?;

        Ok(CachedToken {
            access_token: token.access_token,
            expires_at: Utc::now() + Duration::seconds(token.expires_in),
        })
    }

    /// Valid bearer token for a slot.
    ///
    /// Missing secondary credentials yield `Ok(None)`; a failed
    /// secondary exchange degrades to primary-only mode with a
    /// warning. Only the primary exchange is allowed to fail the run.
    /// Two callers racing into a refresh is accepted: the exchange is
    /// idempotent against the provider.
    pub async fn token(&self, source: IntegrationSource) -> Result<Option<String>, AppError> {
        let (cache, credentials) = match source {
            IntegrationSource::Primary => (&self.primary_token, Some(&self.config.primary)),
            IntegrationSource::Secondary => (&self.secondary_token, self.config.secondary.as_ref()),
        };

        let Some(credentials) = credentials else {
            return Ok(None);
        };

        if let Some(cached) = cache.read().await.as_ref() {
            if cached.is_fresh(Utc::now()) {
                return Ok(Some(cached.access_token.clone()));
            }
        }

        match self.exchange(credentials).await {
            Ok(token) => {
                let access = token.access_token.clone();
                *cache.write().await = Some(token);
                tracing::debug!(source = source.as_str(), "Lytex token refreshed");
                Ok(Some(access))
            }
            Err(e) if source == IntegrationSource::Secondary => {
                tracing::warn!(
                    error = %e,
                    "Secondary integration token exchange failed, continuing primary-only"
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Single-slot invoice lookup. `Ok(None)` is reserved for HTTP 404;
    /// every other non-success status is an error, so systemic
    /// failures are never masked as "not found".
    async fn get_invoice(
        &self,
        token: &str,
        invoice_id: &str,
    ) -> Result<Option<Value>, AppError> {
        let url = format!("{}/invoices/{}", self.config.base_url, invoice_id);
        let timer = LYTEX_REQUEST_DURATION
            .with_label_values(&["get_invoice"])
            .start_timer();

        let response = self
            .http
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| AppError::GatewayError(anyhow!("Invoice lookup failed: {}", e)))?;
        timer.observe_duration();

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::GatewayError(anyhow!(
                "Invoice lookup rejected ({}): {}",
                status,
                body
            )));
        }

        let invoice = response
            .json()
            .await
            .map_err(|e| AppError::GatewayError(anyhow!("Malformed invoice payload: {}", e)))?;
        Ok(Some(invoice))
    }
}

#[async_trait]
impl InvoiceGateway for LytexClient {
    async fn authenticate_primary(&self) -> Result<(), AppError> {
        self.token(IntegrationSource::Primary)
            .await?
            .ok_or_else(|| AppError::ConfigError(anyhow!("Primary credentials not configured")))?;
        Ok(())
    }

    async fn find_invoice(&self, invoice_id: &str) -> Result<Option<FetchedInvoice>, AppError> {
        let primary_token = self
            .token(IntegrationSource::Primary)
            .await?
            .ok_or_else(|| AppError::ConfigError(anyhow!("Primary credentials not configured")))?;

        if let Some(raw) = self.get_invoice(&primary_token, invoice_id).await? {
            return Ok(Some(FetchedInvoice {
                raw,
                source: IntegrationSource::Primary,
            }));
        }

        // 404 on primary, and only that, falls through to the
        // secondary slot when one is configured.
        if let Some(secondary_token) = self.token(IntegrationSource::Secondary).await? {
            if let Some(raw) = self.get_invoice(&secondary_token, invoice_id).await? {
                return Ok(Some(FetchedInvoice {
                    raw,
                    source: IntegrationSource::Secondary,
                }));
            }
        }

        Ok(None)
    }

    async fn list_invoices(
        &self,
        source: IntegrationSource,
        status: Option<&str>,
        page: u32,
        limit: u32,
    ) -> Result<InvoicePage, AppError> {
        let token = self.token(source).await?.ok_or_else(|| {
            AppError::ConfigError(anyhow!(
                "No credentials for {} integration",
                source.as_str()
            ))
        })?;

        let url = format!("{}/invoices", self.config.base_url);
        let mut query: Vec<(&str, String)> =
            vec![("page", page.to_string()), ("limit", limit.to_string())];
        if let Some(status) = status {
            query.push(("status", status.to_string()));
        }

        let timer = LYTEX_REQUEST_DURATION
            .with_label_values(&["list_invoices"])
            .start_timer();
        let response = self
            .http
            .get(&url)
            .bearer_auth(&token)
            .query(&query)
            .send()
            .await
            .map_err(|e| AppError::GatewayError(anyhow!("Invoice listing failed: {}", e)))?;
        timer.observe_duration();

        let http_status = response.status();
        if !http_status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::GatewayError(anyhow!(
                "Invoice listing rejected ({}): {}",
                http_status,
                body
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| AppError::GatewayError(anyhow!("Malformed listing payload: {}", e)))?;
        Ok(InvoicePage::from_body(body, limit))
    }

    async fn available_sources(&self) -> Vec<IntegrationSource> {
        match self.token(IntegrationSource::Secondary).await {
            Ok(Some(_)) => vec![IntegrationSource::Primary, IntegrationSource::Secondary],
            _ => vec![IntegrationSource::Primary],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn token_is_stale_inside_the_refresh_margin() {
        let now = Utc::now();
        let fresh = CachedToken {
            access_token: "t".into(),
            expires_at: now + Duration::minutes(30),
        };
        assert!(fresh.is_fresh(now));

        let near_expiry = CachedToken {
            access_token: "t".into(),
            expires_at: now + Duration::minutes(4),
        };
        assert!(!near_expiry.is_fresh(now));

        let expired = CachedToken {
            access_token: "t".into(),
            expires_at: now - Duration::minutes(1),
        };
        assert!(!expired.is_fresh(now));
    }

    #[test]
    fn invoice_page_accepts_wrapped_and_bare_bodies() {
        let page = InvoicePage::from_body(json!({ "data": [{"_id": "a"}, {"_id": "b"}] }), 2);
        assert_eq!(page.invoices.len(), 2);
        assert!(page.has_more);

        let page = InvoicePage::from_body(json!([{"_id": "a"}]), 50);
        assert_eq!(page.invoices.len(), 1);
        assert!(!page.has_more);

        let page = InvoicePage::from_body(json!({ "unexpected": true }), 50);
        assert!(page.invoices.is_empty());
        assert!(!page.has_more);
    }
}
