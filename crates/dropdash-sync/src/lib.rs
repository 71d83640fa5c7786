//! Order import: pull-based reconciliation against the store platform, push-based
//! webhook ingestion, and the runtime configuration both are built from.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dropdash_adapters::{
    verify_webhook_signature, OrderSource, ShopifyConfig, SourceError, WebhookOrderPayload,
    DEFAULT_API_VERSION,
};
use dropdash_core::{
    canonical_store_url, CallerId, Order, Product, StoreCredentials, ValidationError,
};
use dropdash_storage::{InsertOutcome, Store, StoreError};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "dropdash-sync";

pub const DEFAULT_BIND: &str = "0.0.0.0:8000";
pub const DEFAULT_USER_AGENT: &str = "dropdash/0.1";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: Option<String>,
    pub bind_addr: String,
    pub auth_secret: String,
    pub webhook_secret: Option<String>,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub shopify_api_version: String,
}

impl AppConfig {
    /// Reads the process environment after loading `.env` if one exists.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let http_timeout_secs = match get("DROPDASH_HTTP_TIMEOUT_SECS") {
            Some(raw) => raw
                .trim()
                .parse()
                .with_context(|| format!("invalid DROPDASH_HTTP_TIMEOUT_SECS `{raw}`"))?,
            None => 20,
        };

        Ok(Self {
            database_url: get("DATABASE_URL"),
            bind_addr: get("DROPDASH_BIND").unwrap_or_else(|| DEFAULT_BIND.to_string()),
            auth_secret: get("DROPDASH_AUTH_SECRET")
                .context("DROPDASH_AUTH_SECRET must be set to verify bearer tokens")?,
            webhook_secret: get("DROPDASH_WEBHOOK_SECRET"),
            http_timeout_secs,
            user_agent: get("DROPDASH_USER_AGENT")
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            shopify_api_version: get("DROPDASH_SHOPIFY_API_VERSION")
                .unwrap_or_else(|| DEFAULT_API_VERSION.to_string()),
        })
    }

    pub fn database_url(&self) -> Result<&str> {
        self.database_url
            .as_deref()
            .context("DATABASE_URL must be set")
    }

    pub fn shopify_config(&self) -> ShopifyConfig {
        ShopifyConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            api_version: self.shopify_api_version.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("{0}")]
    NotFound(String),
    #[error("unauthorized: {0}")]
    Auth(String),
    #[error("order source failed: {0}")]
    Upstream(#[source] SourceError),
    #[error("storage failed: {0}")]
    Storage(#[source] StoreError),
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { .. } => Self::NotFound(err.to_string()),
            other => Self::Storage(other),
        }
    }
}

impl From<SourceError> for SyncError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::InvalidStore(source) => Self::Validation(source),
            other => Self::Upstream(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOutcome {
    pub imported_count: usize,
}

impl SyncOutcome {
    pub fn message(&self) -> String {
        format!("Synchronized {} orders", self.imported_count)
    }
}

/// Imports orders created since the product's newest external order.
pub struct Reconciler {
    store: Arc<dyn Store>,
    source: Arc<dyn OrderSource>,
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn Store>, source: Arc<dyn OrderSource>) -> Self {
        Self {
            store,
            source,
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn product_lock(&self, product_id: Uuid) -> Arc<Mutex<()>> {
        let mut map = self.locks.lock().await;
        map.entry(product_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Loads the caller's product and reconciles it.
    pub async fn reconcile_owned(
        &self,
        caller: CallerId,
        product_id: Uuid,
    ) -> Result<SyncOutcome, SyncError> {
        let product = self.store.owned_product(caller, product_id).await?;
        self.reconcile(&product).await
    }

    /// Drops the product's lock entry once no other reconcile holds a handle to it.
    async fn release_lock(&self, product_id: Uuid, lock: Arc<Mutex<()>>) {
        let mut map = self.locks.lock().await;
        drop(lock);
        if map
            .get(&product_id)
            .is_some_and(|entry| Arc::strong_count(entry) == 1)
        {
            map.remove(&product_id);
        }
    }

    #[tracing::instrument(skip(self, product), fields(product_id = %product.id))]
    pub async fn reconcile(&self, product: &Product) -> Result<SyncOutcome, SyncError> {
        let credentials = product
            .store_credentials()
            .ok_or(ValidationError::Missing {
                field: "store_credentials",
            })?;

        let lock = self.product_lock(product.id).await;
        let outcome = {
            let _held = lock.lock().await;
            self.import_new_orders(product, &credentials).await
        };
        self.release_lock(product.id, lock).await;
        outcome
    }

    /// Fetches since the cursor and inserts unseen orders in one batch. A single
    /// malformed order fails the whole run so the cursor never moves past it.
    async fn import_new_orders(
        &self,
        product: &Product,
        credentials: &StoreCredentials,
    ) -> Result<SyncOutcome, SyncError> {
        let since: Option<DateTime<Utc>> = self.store.external_order_cursor(product.id).await?;
        let fetched = self.source.fetch_orders(credentials, since).await?;
        let fetched_count = fetched.len();
        let mut known = self.store.external_order_ids(product.id).await?;

        let mut rows = Vec::new();
        for order in fetched {
            if !known.insert(order.id.clone()) {
                continue;
            }
            let row = order
                .to_new_order(product.id, product.product_cost, order.numbered_label())
                .map_err(|err| {
                    warn!(order_id = %order.id, error = %err, "malformed order, aborting sync");
                    err
                })?;
            rows.push(row);
        }

        let imported_count = if rows.is_empty() {
            0
        } else {
            self.store.insert_orders(rows).await?
        };
        info!(
            fetched = fetched_count,
            imported = imported_count,
            since = ?since,
            "reconciled product orders"
        );
        Ok(SyncOutcome { imported_count })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ack {
    Inserted(Order),
    /// The order was already recorded; nothing changed.
    Duplicate,
}

impl Ack {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate)
    }
}

/// Records single orders pushed by the store platform.
pub struct WebhookIngestor {
    store: Arc<dyn Store>,
    secret: Option<Vec<u8>>,
}

impl WebhookIngestor {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            secret: None,
        }
    }

    /// Requires every body to carry a valid HMAC signature for `secret`.
    pub fn with_secret(mut self, secret: impl Into<Vec<u8>>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    pub fn verify(&self, body: &[u8], signature: Option<&str>) -> Result<(), SyncError> {
        let Some(secret) = &self.secret else {
            return Ok(());
        };
        let signature = signature.ok_or_else(|| SyncError::Auth("missing signature".into()))?;
        if verify_webhook_signature(secret, body, signature) {
            Ok(())
        } else {
            Err(SyncError::Auth("signature mismatch".into()))
        }
    }

    /// Entry point for raw HTTP deliveries.
    pub async fn ingest_raw(
        &self,
        body: &[u8],
        store_domain: Option<&str>,
        signature: Option<&str>,
    ) -> Result<Ack, SyncError> {
        let store_domain = store_domain
            .filter(|d| !d.trim().is_empty())
            .ok_or(ValidationError::Missing {
                field: "store_domain",
            })?;
        self.verify(body, signature)?;
        let payload: WebhookOrderPayload =
            serde_json::from_slice(body).map_err(|err| ValidationError::Malformed {
                field: "body",
                reason: err.to_string(),
            })?;
        self.ingest(&payload, store_domain).await
    }

    #[tracing::instrument(skip(self, payload), fields(order_id = %payload.id))]
    pub async fn ingest(
        &self,
        payload: &WebhookOrderPayload,
        store_domain: &str,
    ) -> Result<Ack, SyncError> {
        let store_url = canonical_store_url(store_domain)?;
        let product = self
            .store
            .product_by_store_url(&store_url)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("no product for store {store_url}")))?;

        let order = payload
            .to_new_order(product.id, product.product_cost, payload.display_label())
            .map_err(|err| match err {
                SourceError::InvalidOrder { source, .. } => SyncError::Validation(source),
                other => SyncError::from(other),
            })?;

        match self.store.insert_external_order(order).await? {
            InsertOutcome::Inserted(order) => {
                info!(product_id = %product.id, "webhook order recorded");
                Ok(Ack::Inserted(order))
            }
            InsertOutcome::Duplicate => {
                info!(product_id = %product.id, "webhook order already recorded");
                Ok(Ack::Duplicate)
            }
        }
    }
}
