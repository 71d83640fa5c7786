//! Persistence boundary for products, orders and expenses.
//!
//! Owner-scoped operations take the caller explicitly and report a product owned by
//! someone else exactly like a missing one. Reads return empty vectors for "no rows".

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dropdash_core::{
    CallerId, Expense, ExpenseDraft, NewOrder, Order, OrderUpdate, Product, ProductDraft,
};
use thiserror::Error;
use uuid::Uuid;

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "dropdash-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: Uuid) -> Self {
        Self::NotFound { entity, id }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    pub(crate) fn store_url_taken(store_url: &str) -> Self {
        Self::Conflict(format!("store {store_url} is already connected to a product"))
    }
}

/// Result of inserting a single externally-keyed order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(Order),
    /// `(product_id, external_order_id)` already present; nothing written.
    Duplicate,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn create_product(&self, caller: CallerId, draft: ProductDraft)
        -> Result<Product, StoreError>;

    async fn owned_product(&self, caller: CallerId, product_id: Uuid)
        -> Result<Product, StoreError>;

    /// Caller's products, newest first.
    async fn list_products(&self, caller: CallerId, visible_only: bool)
        -> Result<Vec<Product>, StoreError>;

    async fn update_product(
        &self,
        caller: CallerId,
        product_id: Uuid,
        draft: ProductDraft,
    ) -> Result<Product, StoreError>;

    async fn set_product_visibility(
        &self,
        caller: CallerId,
        product_id: Uuid,
        visible: bool,
    ) -> Result<Product, StoreError>;

    /// Deletes the product together with its orders and expenses.
    async fn delete_product(&self, caller: CallerId, product_id: Uuid) -> Result<(), StoreError>;

    /// Exact match on the canonical `https://{host}` store URL.
    async fn product_by_store_url(&self, store_url: &str) -> Result<Option<Product>, StoreError>;

    /// Orders of the given products, most recent first.
    async fn list_orders(&self, product_ids: &[Uuid]) -> Result<Vec<Order>, StoreError>;

    async fn create_order(&self, caller: CallerId, order: NewOrder) -> Result<Order, StoreError>;

    async fn update_order(
        &self,
        caller: CallerId,
        order_id: Uuid,
        update: OrderUpdate,
    ) -> Result<Order, StoreError>;

    async fn delete_order(&self, caller: CallerId, order_id: Uuid) -> Result<(), StoreError>;

    /// Latest `order_date` among the product's externally-sourced orders.
    async fn external_order_cursor(&self, product_id: Uuid)
        -> Result<Option<DateTime<Utc>>, StoreError>;

    async fn external_order_ids(&self, product_id: Uuid) -> Result<HashSet<String>, StoreError>;

    /// Inserts one order, treating an existing external id as a no-op.
    async fn insert_external_order(&self, order: NewOrder) -> Result<InsertOutcome, StoreError>;

    /// Inserts the whole batch or nothing. Rows whose external id already exists are
    /// skipped; the return value counts rows actually written.
    async fn insert_orders(&self, orders: Vec<NewOrder>) -> Result<usize, StoreError>;

    /// Expenses of the given products, most recent first.
    async fn list_expenses(&self, product_ids: &[Uuid]) -> Result<Vec<Expense>, StoreError>;

    async fn create_expense(
        &self,
        caller: CallerId,
        product_id: Uuid,
        draft: ExpenseDraft,
    ) -> Result<Expense, StoreError>;

    async fn update_expense(
        &self,
        caller: CallerId,
        expense_id: Uuid,
        draft: ExpenseDraft,
    ) -> Result<Expense, StoreError>;

    async fn delete_expense(&self, caller: CallerId, expense_id: Uuid) -> Result<(), StoreError>;
}
