use std::collections::HashSet;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dropdash_core::{
    CallerId, Expense, ExpenseDraft, NewOrder, Order, OrderUpdate, Product, ProductDraft,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{InsertOutcome, Store, StoreError};

const STORE_URL_CONSTRAINT: &str = "products_store_url_unique";

const PRODUCT_COLUMNS: &str = "id, user_id, name, product_cost, store_url, access_token, \
                               is_visible, created_at, updated_at";
const ORDER_COLUMNS: &str = "o.id, o.product_id, o.external_order_id, o.order_date, o.revenue, \
                             o.cost, o.customer_email, o.order_number, o.created_at";
const EXPENSE_COLUMNS: &str = "e.id, e.product_id, e.description, e.amount, e.expense_date, \
                               e.created_at";

/// PostgreSQL-backed store.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }

    async fn ensure_user(&self, caller: CallerId) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO users (id) VALUES ($1) ON CONFLICT (id) DO NOTHING")
            .bind(caller.user_id())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn product_from_row(row: &PgRow) -> Result<Product, sqlx::Error> {
    Ok(Product {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        name: row.try_get("name")?,
        product_cost: row.try_get("product_cost")?,
        store_url: row.try_get("store_url")?,
        access_token: row.try_get("access_token")?,
        is_visible: row.try_get("is_visible")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn order_from_row(row: &PgRow) -> Result<Order, sqlx::Error> {
    Ok(Order {
        id: row.try_get("id")?,
        product_id: row.try_get("product_id")?,
        external_order_id: row.try_get("external_order_id")?,
        order_date: row.try_get("order_date")?,
        revenue: row.try_get("revenue")?,
        cost: row.try_get("cost")?,
        customer_email: row.try_get("customer_email")?,
        order_number: row.try_get("order_number")?,
        created_at: row.try_get("created_at")?,
    })
}

fn expense_from_row(row: &PgRow) -> Result<Expense, sqlx::Error> {
    Ok(Expense {
        id: row.try_get("id")?,
        product_id: row.try_get("product_id")?,
        description: row.try_get("description")?,
        amount: row.try_get("amount")?,
        expense_date: row.try_get("expense_date")?,
        created_at: row.try_get("created_at")?,
    })
}

fn store_url_conflict(err: sqlx::Error, store_url: Option<&str>) -> StoreError {
    let taken = err
        .as_database_error()
        .and_then(|db| db.constraint())
        .is_some_and(|name| name == STORE_URL_CONSTRAINT);
    match store_url {
        Some(url) if taken => StoreError::store_url_taken(url),
        _ => StoreError::Database(err),
    }
}

async fn insert_order_row(
    tx: &mut Transaction<'_, Postgres>,
    order: &NewOrder,
) -> Result<Option<Order>, sqlx::Error> {
    let row = sqlx::query(&format!(
        r#"
        INSERT INTO orders AS o
               (id, product_id, external_order_id, order_date, revenue, cost,
                customer_email, order_number)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT (product_id, external_order_id) DO NOTHING
        RETURNING {ORDER_COLUMNS}
        "#
    ))
    .bind(Uuid::new_v4())
    .bind(order.product_id)
    .bind(&order.external_order_id)
    .bind(order.order_date)
    .bind(order.revenue)
    .bind(order.cost)
    .bind(&order.customer_email)
    .bind(&order.order_number)
    .fetch_optional(&mut **tx)
    .await?;
    row.as_ref().map(order_from_row).transpose()
}

#[async_trait]
impl Store for PgStore {
    async fn create_product(
        &self,
        caller: CallerId,
        draft: ProductDraft,
    ) -> Result<Product, StoreError> {
        self.ensure_user(caller).await?;
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO products (id, user_id, name, product_cost, store_url, access_token, is_visible)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {PRODUCT_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(caller.user_id())
        .bind(&draft.name)
        .bind(draft.product_cost)
        .bind(&draft.store_url)
        .bind(&draft.access_token)
        .bind(draft.is_visible)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| store_url_conflict(err, draft.store_url.as_deref()))?;
        Ok(product_from_row(&row)?)
    }

    async fn owned_product(
        &self,
        caller: CallerId,
        product_id: Uuid,
    ) -> Result<Product, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products WHERE id = $1 AND user_id = $2"
        ))
        .bind(product_id)
        .bind(caller.user_id())
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(product_from_row(&row)?),
            None => Err(StoreError::not_found("product", product_id)),
        }
    }

    async fn list_products(
        &self,
        caller: CallerId,
        visible_only: bool,
    ) -> Result<Vec<Product>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {PRODUCT_COLUMNS}
              FROM products
             WHERE user_id = $1
               AND (is_visible OR NOT $2)
             ORDER BY created_at DESC
            "#
        ))
        .bind(caller.user_id())
        .bind(visible_only)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(product_from_row).collect::<Result<_, _>>()?)
    }

    async fn update_product(
        &self,
        caller: CallerId,
        product_id: Uuid,
        draft: ProductDraft,
    ) -> Result<Product, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE products
               SET name = $3,
                   product_cost = $4,
                   store_url = $5,
                   access_token = $6,
                   is_visible = $7,
                   updated_at = NOW()
             WHERE id = $1 AND user_id = $2
            RETURNING {PRODUCT_COLUMNS}
            "#
        ))
        .bind(product_id)
        .bind(caller.user_id())
        .bind(&draft.name)
        .bind(draft.product_cost)
        .bind(&draft.store_url)
        .bind(&draft.access_token)
        .bind(draft.is_visible)
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| store_url_conflict(err, draft.store_url.as_deref()))?;
        match row {
            Some(row) => Ok(product_from_row(&row)?),
            None => Err(StoreError::not_found("product", product_id)),
        }
    }

    async fn set_product_visibility(
        &self,
        caller: CallerId,
        product_id: Uuid,
        visible: bool,
    ) -> Result<Product, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE products
               SET is_visible = $3, updated_at = NOW()
             WHERE id = $1 AND user_id = $2
            RETURNING {PRODUCT_COLUMNS}
            "#
        ))
        .bind(product_id)
        .bind(caller.user_id())
        .bind(visible)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(product_from_row(&row)?),
            None => Err(StoreError::not_found("product", product_id)),
        }
    }

    async fn delete_product(&self, caller: CallerId, product_id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM products WHERE id = $1 AND user_id = $2")
            .bind(product_id)
            .bind(caller.user_id())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("product", product_id));
        }
        Ok(())
    }

    async fn product_by_store_url(&self, store_url: &str) -> Result<Option<Product>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {PRODUCT_COLUMNS}
              FROM products
             WHERE store_url = $1
             ORDER BY created_at ASC
             LIMIT 1
            "#
        ))
        .bind(store_url)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(product_from_row).transpose()?)
    }

    async fn list_orders(&self, product_ids: &[Uuid]) -> Result<Vec<Order>, StoreError> {
        if product_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(&format!(
            r#"
            SELECT {ORDER_COLUMNS}
              FROM orders o
             WHERE o.product_id = ANY($1)
             ORDER BY o.order_date DESC
            "#
        ))
        .bind(product_ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(order_from_row).collect::<Result<_, _>>()?)
    }

    async fn create_order(&self, caller: CallerId, order: NewOrder) -> Result<Order, StoreError> {
        self.owned_product(caller, order.product_id).await?;
        let mut tx = self.pool.begin().await?;
        let inserted = insert_order_row(&mut tx, &order).await?;
        tx.commit().await?;
        inserted.ok_or_else(|| {
            StoreError::Conflict(format!(
                "order {} already recorded for product {}",
                order.external_order_id.as_deref().unwrap_or_default(),
                order.product_id
            ))
        })
    }

    async fn update_order(
        &self,
        caller: CallerId,
        order_id: Uuid,
        update: OrderUpdate,
    ) -> Result<Order, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE orders AS o
               SET order_date = $3,
                   revenue = $4,
                   cost = $5,
                   customer_email = $6,
                   order_number = $7
              FROM products p
             WHERE o.id = $1
               AND p.id = o.product_id
               AND p.user_id = $2
            RETURNING {ORDER_COLUMNS}
            "#
        ))
        .bind(order_id)
        .bind(caller.user_id())
        .bind(update.order_date)
        .bind(update.revenue)
        .bind(update.cost)
        .bind(&update.customer_email)
        .bind(&update.order_number)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(order_from_row(&row)?),
            None => Err(StoreError::not_found("order", order_id)),
        }
    }

    async fn delete_order(&self, caller: CallerId, order_id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM orders o
             USING products p
             WHERE o.id = $1
               AND p.id = o.product_id
               AND p.user_id = $2
            "#,
        )
        .bind(order_id)
        .bind(caller.user_id())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("order", order_id));
        }
        Ok(())
    }

    async fn external_order_cursor(
        &self,
        product_id: Uuid,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT MAX(order_date) AS cursor
              FROM orders
             WHERE product_id = $1
               AND external_order_id IS NOT NULL
            "#,
        )
        .bind(product_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("cursor")?)
    }

    async fn external_order_ids(&self, product_id: Uuid) -> Result<HashSet<String>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT external_order_id
              FROM orders
             WHERE product_id = $1
               AND external_order_id IS NOT NULL
            "#,
        )
        .bind(product_id)
        .fetch_all(&self.pool)
        .await?;
        let mut out = HashSet::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("external_order_id")?;
            out.insert(id);
        }
        Ok(out)
    }

    async fn insert_external_order(&self, order: NewOrder) -> Result<InsertOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        let inserted = insert_order_row(&mut tx, &order).await?;
        tx.commit().await?;
        Ok(match inserted {
            Some(order) => InsertOutcome::Inserted(order),
            None => {
                debug!(
                    product_id = %order.product_id,
                    external_order_id = ?order.external_order_id,
                    "order already stored"
                );
                InsertOutcome::Duplicate
            }
        })
    }

    async fn insert_orders(&self, orders: Vec<NewOrder>) -> Result<usize, StoreError> {
        if orders.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0usize;
        for order in &orders {
            if insert_order_row(&mut tx, order).await?.is_some() {
                inserted += 1;
            }
        }
        tx.commit().await?;
        debug!(requested = orders.len(), inserted, "order batch committed");
        Ok(inserted)
    }

    async fn list_expenses(&self, product_ids: &[Uuid]) -> Result<Vec<Expense>, StoreError> {
        if product_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(&format!(
            r#"
            SELECT {EXPENSE_COLUMNS}
              FROM expenses e
             WHERE e.product_id = ANY($1)
             ORDER BY e.expense_date DESC
            "#
        ))
        .bind(product_ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(expense_from_row).collect::<Result<_, _>>()?)
    }

    async fn create_expense(
        &self,
        caller: CallerId,
        product_id: Uuid,
        draft: ExpenseDraft,
    ) -> Result<Expense, StoreError> {
        self.owned_product(caller, product_id).await?;
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO expenses AS e (id, product_id, description, amount, expense_date)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {EXPENSE_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(product_id)
        .bind(&draft.description)
        .bind(draft.amount)
        .bind(draft.expense_date)
        .fetch_one(&self.pool)
        .await?;
        Ok(expense_from_row(&row)?)
    }

    async fn update_expense(
        &self,
        caller: CallerId,
        expense_id: Uuid,
        draft: ExpenseDraft,
    ) -> Result<Expense, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE expenses AS e
               SET description = $3,
                   amount = $4,
                   expense_date = $5
              FROM products p
             WHERE e.id = $1
               AND p.id = e.product_id
               AND p.user_id = $2
            RETURNING {EXPENSE_COLUMNS}
            "#
        ))
        .bind(expense_id)
        .bind(caller.user_id())
        .bind(&draft.description)
        .bind(draft.amount)
        .bind(draft.expense_date)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(expense_from_row(&row)?),
            None => Err(StoreError::not_found("expense", expense_id)),
        }
    }

    async fn delete_expense(&self, caller: CallerId, expense_id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM expenses e
             USING products p
             WHERE e.id = $1
               AND p.id = e.product_id
               AND p.user_id = $2
            "#,
        )
        .bind(expense_id)
        .bind(caller.user_id())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("expense", expense_id));
        }
        Ok(())
    }
}
