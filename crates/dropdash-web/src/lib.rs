//! JSON HTTP API for the dashboard: webhook intake, manual sync, metrics, charts and
//! owner-scoped product/order/expense management.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        FromRequestParts, Path, Query, State,
    },
    http::{header, request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use chrono::{Duration, NaiveDate, Utc};
use dropdash_adapters::{OrderSource, ShopifyOrderSource, HMAC_HEADER, SHOP_DOMAIN_HEADER};
use dropdash_core::{
    CallerId, Expense, ExpenseDraft, NewOrder, Order, OrderUpdate, Product, ProductDraft,
    ValidationError,
};
use dropdash_metrics::{
    daily_series, dashboard_metrics, monthly_series, per_product_totals, product_summaries,
    DashboardMetrics, DateRange, ProductSummary, DEFAULT_WINDOW_DAYS, DEFAULT_WINDOW_MONTHS,
};
use dropdash_storage::{Store, StoreError};
use dropdash_sync::{AppConfig, Reconciler, SyncError, WebhookIngestor};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "dropdash-web";

/// Longest chart window a request may ask for.
pub const MAX_WINDOW_DAYS: u32 = 366;
pub const MAX_WINDOW_MONTHS: u32 = 120;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Upstream(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(%status, error = %self, "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        Self::BadRequest(err.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { .. } => Self::NotFound(err.to_string()),
            StoreError::Conflict(msg) => Self::Conflict(msg),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::Validation(err) => err.into(),
            SyncError::NotFound(msg) => Self::NotFound(msg),
            SyncError::Auth(msg) => Self::Unauthorized(msg),
            SyncError::Upstream(_) => Self::Upstream(err.to_string()),
            SyncError::Storage(err) => err.into(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: Uuid,
    exp: i64,
}

/// HS256 signing and verification of bearer tokens whose subject is the user id.
#[derive(Clone)]
pub struct TokenKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl TokenKeys {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    pub fn issue(&self, user_id: Uuid, ttl: Duration) -> anyhow::Result<String> {
        let claims = Claims {
            sub: user_id,
            exp: (Utc::now() + ttl).timestamp(),
        };
        encode(&Header::default(), &claims, &self.encoding).context("signing bearer token")
    }

    pub fn verify(&self, token: &str) -> Result<CallerId, ApiError> {
        decode::<Claims>(token, &self.decoding, &Validation::default())
            .map(|data| CallerId(data.claims.sub))
            .map_err(|err| ApiError::Unauthorized(format!("invalid bearer token: {err}")))
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub reconciler: Arc<Reconciler>,
    pub ingestor: Arc<WebhookIngestor>,
    pub tokens: TokenKeys,
}

impl AppState {
    pub fn new(
        store: Arc<dyn Store>,
        source: Arc<dyn OrderSource>,
        auth_secret: &str,
        webhook_secret: Option<&str>,
    ) -> Self {
        let mut ingestor = WebhookIngestor::new(store.clone());
        if let Some(secret) = webhook_secret {
            ingestor = ingestor.with_secret(secret);
        }
        Self {
            reconciler: Arc::new(Reconciler::new(store.clone(), source)),
            ingestor: Arc::new(ingestor),
            tokens: TokenKeys::new(auth_secret),
            store,
        }
    }

    /// Wires the live Shopify client from configuration.
    pub fn from_config(config: &AppConfig, store: Arc<dyn Store>) -> anyhow::Result<Self> {
        let source = ShopifyOrderSource::new(config.shopify_config())
            .context("building order source client")?;
        Ok(Self::new(
            store,
            Arc::new(source),
            &config.auth_secret,
            config.webhook_secret.as_deref(),
        ))
    }
}

/// The caller identified by a valid `Authorization: Bearer` token.
pub struct AuthenticatedUser(pub CallerId);

impl FromRequestParts<Arc<AppState>> for AuthenticatedUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ApiError::Unauthorized("missing bearer token".into()))?;
        state.tokens.verify(token).map(Self)
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/webhooks/orders", post(webhook_handler))
        .route("/api/sync", post(sync_handler))
        .route("/api/dashboard", get(dashboard_handler))
        .route("/api/charts/daily", get(daily_chart_handler))
        .route("/api/charts/monthly", get(monthly_chart_handler))
        .route("/api/charts/products", get(product_chart_handler))
        .route("/api/products", get(list_products_handler).post(create_product_handler))
        .route(
            "/api/products/{id}",
            get(get_product_handler)
                .patch(update_product_handler)
                .delete(delete_product_handler),
        )
        .route("/api/products/{id}/visibility", post(visibility_handler))
        .route(
            "/api/products/{id}/orders",
            get(list_orders_handler).post(create_order_handler),
        )
        .route(
            "/api/orders/{id}",
            patch(update_order_handler).delete(delete_order_handler),
        )
        .route(
            "/api/products/{id}/expenses",
            get(list_expenses_handler).post(create_expense_handler),
        )
        .route(
            "/api/expenses/{id}",
            patch(update_expense_handler).delete(delete_expense_handler),
        )
        .with_state(Arc::new(state))
}

pub async fn serve(config: &AppConfig, state: AppState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "dashboard api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

type ApiResult<T> = Result<T, ApiError>;

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn webhook_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<serde_json::Value>> {
    let header_str = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    let ack = state
        .ingestor
        .ingest_raw(&body, header_str(SHOP_DOMAIN_HEADER), header_str(HMAC_HEADER))
        .await?;
    Ok(Json(json!({ "success": true, "duplicate": ack.is_duplicate() })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyncRequest {
    #[serde(default)]
    product_id: Option<Uuid>,
}

async fn sync_handler(
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(caller): AuthenticatedUser,
    payload: Result<Json<SyncRequest>, JsonRejection>,
) -> ApiResult<Json<serde_json::Value>> {
    let Json(request) = payload?;
    let product_id = request
        .product_id
        .ok_or(ValidationError::Missing { field: "productId" })?;
    let outcome = state.reconciler.reconcile_owned(caller, product_id).await?;
    Ok(Json(json!({
        "success": true,
        "message": outcome.message(),
        "count": outcome.imported_count,
    })))
}

/// Visible products of the caller with their orders and expenses.
async fn visible_book(
    state: &AppState,
    caller: CallerId,
) -> ApiResult<(Vec<Product>, Vec<Order>, Vec<Expense>)> {
    let products = state.store.list_products(caller, true).await?;
    let ids: Vec<Uuid> = products.iter().map(|p| p.id).collect();
    let orders = state.store.list_orders(&ids).await?;
    let expenses = state.store.list_expenses(&ids).await?;
    Ok((products, orders, expenses))
}

#[derive(Debug, Default, Deserialize)]
struct DashboardQuery {
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
}

#[derive(Debug, Serialize)]
struct DashboardResponse {
    metrics: DashboardMetrics,
    products: Vec<ProductSummary>,
}

async fn dashboard_handler(
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(caller): AuthenticatedUser,
    query: Result<Query<DashboardQuery>, QueryRejection>,
) -> ApiResult<Json<DashboardResponse>> {
    let Query(query) = query?;
    let range = DateRange {
        start: query.start,
        end: query.end,
    };
    if let (Some(start), Some(end)) = (range.start, range.end) {
        if start > end {
            return Err(ValidationError::Malformed {
                field: "start",
                reason: format!("{start} is after {end}"),
            }
            .into());
        }
    }

    // The range narrows the headline metrics only; the product table stays all-time.
    let (products, orders, expenses) = visible_book(&state, caller).await?;
    let metrics = if range.is_unbounded() {
        dashboard_metrics(&orders, &expenses, products.len(), today())
    } else {
        dashboard_metrics(
            &range.filter_orders(&orders),
            &range.filter_expenses(&expenses),
            products.len(),
            today(),
        )
    };
    Ok(Json(DashboardResponse {
        metrics,
        products: product_summaries(&products, &orders, &expenses),
    }))
}

#[derive(Debug, Deserialize)]
struct WindowQuery {
    days: Option<u32>,
    months: Option<u32>,
}

async fn daily_chart_handler(
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(caller): AuthenticatedUser,
    query: Result<Query<WindowQuery>, QueryRejection>,
) -> ApiResult<impl IntoResponse> {
    let Query(query) = query?;
    let days = query.days.unwrap_or(DEFAULT_WINDOW_DAYS).min(MAX_WINDOW_DAYS);
    let (_, orders, expenses) = visible_book(&state, caller).await?;
    Ok(Json(daily_series(&orders, &expenses, days, today())))
}

async fn monthly_chart_handler(
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(caller): AuthenticatedUser,
    query: Result<Query<WindowQuery>, QueryRejection>,
) -> ApiResult<impl IntoResponse> {
    let Query(query) = query?;
    let months = query
        .months
        .unwrap_or(DEFAULT_WINDOW_MONTHS)
        .min(MAX_WINDOW_MONTHS);
    let (_, orders, expenses) = visible_book(&state, caller).await?;
    Ok(Json(monthly_series(&orders, &expenses, months, today())))
}

async fn product_chart_handler(
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(caller): AuthenticatedUser,
) -> ApiResult<impl IntoResponse> {
    let (products, orders, expenses) = visible_book(&state, caller).await?;
    Ok(Json(per_product_totals(&products, &orders, &expenses)))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProductListQuery {
    #[serde(default)]
    visible_only: bool,
}

async fn list_products_handler(
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(caller): AuthenticatedUser,
    query: Result<Query<ProductListQuery>, QueryRejection>,
) -> ApiResult<Json<Vec<Product>>> {
    let Query(query) = query?;
    Ok(Json(state.store.list_products(caller, query.visible_only).await?))
}

async fn create_product_handler(
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(caller): AuthenticatedUser,
    payload: Result<Json<ProductDraft>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Product>)> {
    let Json(draft) = payload?;
    let product = state.store.create_product(caller, draft.validate()?).await?;
    Ok((StatusCode::CREATED, Json(product)))
}

async fn get_product_handler(
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(caller): AuthenticatedUser,
    path: Result<Path<Uuid>, PathRejection>,
) -> ApiResult<Json<Product>> {
    let Path(id) = path?;
    Ok(Json(state.store.owned_product(caller, id).await?))
}

async fn update_product_handler(
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(caller): AuthenticatedUser,
    path: Result<Path<Uuid>, PathRejection>,
    payload: Result<Json<ProductDraft>, JsonRejection>,
) -> ApiResult<Json<Product>> {
    let Path(id) = path?;
    let Json(draft) = payload?;
    Ok(Json(
        state
            .store
            .update_product(caller, id, draft.validate()?)
            .await?,
    ))
}

async fn delete_product_handler(
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(caller): AuthenticatedUser,
    path: Result<Path<Uuid>, PathRejection>,
) -> ApiResult<StatusCode> {
    let Path(id) = path?;
    state.store.delete_product(caller, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VisibilityRequest {
    is_visible: bool,
}

async fn visibility_handler(
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(caller): AuthenticatedUser,
    path: Result<Path<Uuid>, PathRejection>,
    payload: Result<Json<VisibilityRequest>, JsonRejection>,
) -> ApiResult<Json<Product>> {
    let Path(id) = path?;
    let Json(request) = payload?;
    Ok(Json(
        state
            .store
            .set_product_visibility(caller, id, request.is_visible)
            .await?,
    ))
}

async fn list_orders_handler(
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(caller): AuthenticatedUser,
    path: Result<Path<Uuid>, PathRejection>,
) -> ApiResult<Json<Vec<Order>>> {
    let Path(product_id) = path?;
    state.store.owned_product(caller, product_id).await?;
    Ok(Json(state.store.list_orders(&[product_id]).await?))
}

/// Manual orders carry no external id.
async fn create_order_handler(
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(caller): AuthenticatedUser,
    path: Result<Path<Uuid>, PathRejection>,
    payload: Result<Json<OrderUpdate>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Order>)> {
    let Path(product_id) = path?;
    let Json(input) = payload?;
    let order = NewOrder {
        product_id,
        external_order_id: None,
        order_date: input.order_date,
        revenue: input.revenue,
        cost: input.cost,
        customer_email: input.customer_email,
        order_number: input.order_number,
    }
    .validate()?;
    let order = state.store.create_order(caller, order).await?;
    Ok((StatusCode::CREATED, Json(order)))
}

async fn update_order_handler(
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(caller): AuthenticatedUser,
    path: Result<Path<Uuid>, PathRejection>,
    payload: Result<Json<OrderUpdate>, JsonRejection>,
) -> ApiResult<Json<Order>> {
    let Path(order_id) = path?;
    let Json(update) = payload?;
    Ok(Json(
        state
            .store
            .update_order(caller, order_id, update.validate()?)
            .await?,
    ))
}

async fn delete_order_handler(
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(caller): AuthenticatedUser,
    path: Result<Path<Uuid>, PathRejection>,
) -> ApiResult<StatusCode> {
    let Path(order_id) = path?;
    state.store.delete_order(caller, order_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_expenses_handler(
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(caller): AuthenticatedUser,
    path: Result<Path<Uuid>, PathRejection>,
) -> ApiResult<Json<Vec<Expense>>> {
    let Path(product_id) = path?;
    state.store.owned_product(caller, product_id).await?;
    Ok(Json(state.store.list_expenses(&[product_id]).await?))
}

async fn create_expense_handler(
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(caller): AuthenticatedUser,
    path: Result<Path<Uuid>, PathRejection>,
    payload: Result<Json<ExpenseDraft>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Expense>)> {
    let Path(product_id) = path?;
    let Json(draft) = payload?;
    let expense = state
        .store
        .create_expense(caller, product_id, draft.validate()?)
        .await?;
    Ok((StatusCode::CREATED, Json(expense)))
}

async fn update_expense_handler(
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(caller): AuthenticatedUser,
    path: Result<Path<Uuid>, PathRejection>,
    payload: Result<Json<ExpenseDraft>, JsonRejection>,
) -> ApiResult<Json<Expense>> {
    let Path(expense_id) = path?;
    let Json(draft) = payload?;
    Ok(Json(
        state
            .store
            .update_expense(caller, expense_id, draft.validate()?)
            .await?,
    ))
}

async fn delete_expense_handler(
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(caller): AuthenticatedUser,
    path: Result<Path<Uuid>, PathRejection>,
) -> ApiResult<StatusCode> {
    let Path(expense_id) = path?;
    state.store.delete_expense(caller, expense_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
