use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dropdash_core::{
    CallerId, Expense, ExpenseDraft, NewOrder, Order, OrderUpdate, Product, ProductDraft,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{InsertOutcome, Store, StoreError};

#[derive(Debug, Default)]
struct Tables {
    products: Vec<Product>,
    orders: Vec<Order>,
    expenses: Vec<Expense>,
}

impl Tables {
    fn owned_product(&self, caller: CallerId, product_id: Uuid) -> Result<&Product, StoreError> {
        self.products
            .iter()
            .find(|p| p.id == product_id && p.is_owned_by(caller))
            .ok_or_else(|| StoreError::not_found("product", product_id))
    }

    fn owns(&self, caller: CallerId, product_id: Uuid) -> bool {
        self.owned_product(caller, product_id).is_ok()
    }

    fn claim_store_url(&self, store_url: Option<&str>, product_id: Uuid) -> Result<(), StoreError> {
        match store_url {
            Some(url)
                if self
                    .products
                    .iter()
                    .any(|p| p.id != product_id && p.store_url.as_deref() == Some(url)) =>
            {
                Err(StoreError::store_url_taken(url))
            }
            _ => Ok(()),
        }
    }

    fn has_external(&self, product_id: Uuid, external_order_id: Option<&str>) -> bool {
        let Some(external_order_id) = external_order_id else {
            return false;
        };
        self.orders.iter().any(|o| {
            o.product_id == product_id && o.external_order_id.as_deref() == Some(external_order_id)
        })
    }

    fn push_order(&mut self, order: NewOrder) -> Order {
        let stored = Order {
            id: Uuid::new_v4(),
            product_id: order.product_id,
            external_order_id: order.external_order_id,
            order_date: order.order_date,
            revenue: order.revenue,
            cost: order.cost,
            customer_email: order.customer_email,
            order_number: order.order_number,
            created_at: Utc::now(),
        };
        self.orders.push(stored.clone());
        stored
    }
}

/// In-process store with the same ownership and uniqueness rules as [`crate::PgStore`].
///
/// Backs `serve --in-memory` and the test suites.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored orders across all products.
    pub async fn order_count(&self) -> usize {
        self.tables.lock().await.orders.len()
    }
}

fn newest_first<T, K: Ord>(mut rows: Vec<T>, key: impl Fn(&T) -> K) -> Vec<T> {
    rows.sort_by(|a, b| key(b).cmp(&key(a)));
    rows
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_product(
        &self,
        caller: CallerId,
        draft: ProductDraft,
    ) -> Result<Product, StoreError> {
        let mut tables = self.tables.lock().await;
        let id = Uuid::new_v4();
        tables.claim_store_url(draft.store_url.as_deref(), id)?;
        let now = Utc::now();
        let product = Product {
            id,
            user_id: caller.user_id(),
            name: draft.name,
            product_cost: draft.product_cost,
            store_url: draft.store_url,
            access_token: draft.access_token,
            is_visible: draft.is_visible,
            created_at: now,
            updated_at: now,
        };
        tables.products.push(product.clone());
        Ok(product)
    }

    async fn owned_product(
        &self,
        caller: CallerId,
        product_id: Uuid,
    ) -> Result<Product, StoreError> {
        let tables = self.tables.lock().await;
        tables.owned_product(caller, product_id).cloned()
    }

    async fn list_products(
        &self,
        caller: CallerId,
        visible_only: bool,
    ) -> Result<Vec<Product>, StoreError> {
        let tables = self.tables.lock().await;
        let rows: Vec<Product> = tables
            .products
            .iter()
            .filter(|p| p.is_owned_by(caller) && (p.is_visible || !visible_only))
            .cloned()
            .collect();
        Ok(newest_first(rows, |p| p.created_at))
    }

    async fn update_product(
        &self,
        caller: CallerId,
        product_id: Uuid,
        draft: ProductDraft,
    ) -> Result<Product, StoreError> {
        let mut tables = self.tables.lock().await;
        tables.owned_product(caller, product_id)?;
        tables.claim_store_url(draft.store_url.as_deref(), product_id)?;
        let product = tables
            .products
            .iter_mut()
            .find(|p| p.id == product_id && p.is_owned_by(caller))
            .ok_or_else(|| StoreError::not_found("product", product_id))?;
        product.name = draft.name;
        product.product_cost = draft.product_cost;
        product.store_url = draft.store_url;
        product.access_token = draft.access_token;
        product.is_visible = draft.is_visible;
        product.updated_at = Utc::now();
        Ok(product.clone())
    }

    async fn set_product_visibility(
        &self,
        caller: CallerId,
        product_id: Uuid,
        visible: bool,
    ) -> Result<Product, StoreError> {
        let mut tables = self.tables.lock().await;
        let product = tables
            .products
            .iter_mut()
            .find(|p| p.id == product_id && p.is_owned_by(caller))
            .ok_or_else(|| StoreError::not_found("product", product_id))?;
        product.is_visible = visible;
        product.updated_at = Utc::now();
        Ok(product.clone())
    }

    async fn delete_product(&self, caller: CallerId, product_id: Uuid) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        tables.owned_product(caller, product_id)?;
        tables.products.retain(|p| p.id != product_id);
        tables.orders.retain(|o| o.product_id != product_id);
        tables.expenses.retain(|e| e.product_id != product_id);
        Ok(())
    }

    async fn product_by_store_url(&self, store_url: &str) -> Result<Option<Product>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .products
            .iter()
            .filter(|p| p.store_url.as_deref() == Some(store_url))
            .min_by_key(|p| p.created_at)
            .cloned())
    }

    async fn list_orders(&self, product_ids: &[Uuid]) -> Result<Vec<Order>, StoreError> {
        let tables = self.tables.lock().await;
        let rows: Vec<Order> = tables
            .orders
            .iter()
            .filter(|o| product_ids.contains(&o.product_id))
            .cloned()
            .collect();
        Ok(newest_first(rows, |o| o.order_date))
    }

    async fn create_order(&self, caller: CallerId, order: NewOrder) -> Result<Order, StoreError> {
        let mut tables = self.tables.lock().await;
        tables.owned_product(caller, order.product_id)?;
        if tables.has_external(order.product_id, order.external_order_id.as_deref()) {
            return Err(StoreError::Conflict(format!(
                "order {} already recorded for product {}",
                order.external_order_id.as_deref().unwrap_or_default(),
                order.product_id
            )));
        }
        Ok(tables.push_order(order))
    }

    async fn update_order(
        &self,
        caller: CallerId,
        order_id: Uuid,
        update: OrderUpdate,
    ) -> Result<Order, StoreError> {
        let mut tables = self.tables.lock().await;
        let product_id = tables
            .orders
            .iter()
            .find(|o| o.id == order_id)
            .map(|o| o.product_id)
            .filter(|pid| tables.owns(caller, *pid))
            .ok_or_else(|| StoreError::not_found("order", order_id))?;
        let order = tables
            .orders
            .iter_mut()
            .find(|o| o.id == order_id && o.product_id == product_id)
            .ok_or_else(|| StoreError::not_found("order", order_id))?;
        order.order_date = update.order_date;
        order.revenue = update.revenue;
        order.cost = update.cost;
        order.customer_email = update.customer_email;
        order.order_number = update.order_number;
        Ok(order.clone())
    }

    async fn delete_order(&self, caller: CallerId, order_id: Uuid) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let owned = tables
            .orders
            .iter()
            .any(|o| o.id == order_id && tables.owns(caller, o.product_id));
        if !owned {
            return Err(StoreError::not_found("order", order_id));
        }
        tables.orders.retain(|o| o.id != order_id);
        Ok(())
    }

    async fn external_order_cursor(
        &self,
        product_id: Uuid,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .orders
            .iter()
            .filter(|o| o.product_id == product_id && o.is_external())
            .map(|o| o.order_date)
            .max())
    }

    async fn external_order_ids(&self, product_id: Uuid) -> Result<HashSet<String>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .orders
            .iter()
            .filter(|o| o.product_id == product_id)
            .filter_map(|o| o.external_order_id.clone())
            .collect())
    }

    async fn insert_external_order(&self, order: NewOrder) -> Result<InsertOutcome, StoreError> {
        let mut tables = self.tables.lock().await;
        if !tables.products.iter().any(|p| p.id == order.product_id) {
            return Err(StoreError::not_found("product", order.product_id));
        }
        if tables.has_external(order.product_id, order.external_order_id.as_deref()) {
            return Ok(InsertOutcome::Duplicate);
        }
        Ok(InsertOutcome::Inserted(tables.push_order(order)))
    }

    async fn insert_orders(&self, orders: Vec<NewOrder>) -> Result<usize, StoreError> {
        let mut tables = self.tables.lock().await;
        if let Some(missing) = orders
            .iter()
            .find(|o| !tables.products.iter().any(|p| p.id == o.product_id))
        {
            return Err(StoreError::not_found("product", missing.product_id));
        }
        let mut inserted = 0usize;
        for order in orders {
            if tables.has_external(order.product_id, order.external_order_id.as_deref()) {
                continue;
            }
            tables.push_order(order);
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn list_expenses(&self, product_ids: &[Uuid]) -> Result<Vec<Expense>, StoreError> {
        let tables = self.tables.lock().await;
        let rows: Vec<Expense> = tables
            .expenses
            .iter()
            .filter(|e| product_ids.contains(&e.product_id))
            .cloned()
            .collect();
        Ok(newest_first(rows, |e| e.expense_date))
    }

    async fn create_expense(
        &self,
        caller: CallerId,
        product_id: Uuid,
        draft: ExpenseDraft,
    ) -> Result<Expense, StoreError> {
        let mut tables = self.tables.lock().await;
        tables.owned_product(caller, product_id)?;
        let expense = Expense {
            id: Uuid::new_v4(),
            product_id,
            description: draft.description,
            amount: draft.amount,
            expense_date: draft.expense_date,
            created_at: Utc::now(),
        };
        tables.expenses.push(expense.clone());
        Ok(expense)
    }

    async fn update_expense(
        &self,
        caller: CallerId,
        expense_id: Uuid,
        draft: ExpenseDraft,
    ) -> Result<Expense, StoreError> {
        let mut tables = self.tables.lock().await;
        let product_id = tables
            .expenses
            .iter()
            .find(|e| e.id == expense_id)
            .map(|e| e.product_id)
            .filter(|pid| tables.owns(caller, *pid))
            .ok_or_else(|| StoreError::not_found("expense", expense_id))?;
        let expense = tables
            .expenses
            .iter_mut()
            .find(|e| e.id == expense_id && e.product_id == product_id)
            .ok_or_else(|| StoreError::not_found("expense", expense_id))?;
        expense.description = draft.description;
        expense.amount = draft.amount;
        expense.expense_date = draft.expense_date;
        Ok(expense.clone())
    }

    async fn delete_expense(&self, caller: CallerId, expense_id: Uuid) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let owned = tables
            .expenses
            .iter()
            .any(|e| e.id == expense_id && tables.owns(caller, e.product_id));
        if !owned {
            return Err(StoreError::not_found("expense", expense_id));
        }
        tables.expenses.retain(|e| e.id != expense_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};
    use rust_decimal::Decimal;

    fn draft(name: &str, store_url: Option<&str>) -> ProductDraft {
        ProductDraft {
            name: name.into(),
            product_cost: Decimal::new(1000, 2),
            store_url: store_url.map(str::to_string),
            access_token: Some("token".into()),
            is_visible: true,
        }
    }

    fn external(product_id: Uuid, id: &str) -> NewOrder {
        NewOrder {
            product_id,
            external_order_id: Some(id.into()),
            order_date: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap(),
            revenue: Decimal::new(2500, 2),
            cost: Decimal::new(1000, 2),
            customer_email: None,
            order_number: Some(format!("#{id}")),
        }
    }

    #[tokio::test]
    async fn products_of_other_users_look_missing() {
        let store = MemoryStore::new();
        let owner = CallerId(Uuid::new_v4());
        let stranger = CallerId(Uuid::new_v4());
        let product = store.create_product(owner, draft("Lamp", None)).await.unwrap();

        let err = store.owned_product(stranger, product.id).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(store
            .delete_product(stranger, product.id)
            .await
            .unwrap_err()
            .is_not_found());
        assert!(store.list_products(stranger, false).await.unwrap().is_empty());
        assert_eq!(store.list_products(owner, false).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn external_ids_are_unique_per_product() {
        let store = MemoryStore::new();
        let owner = CallerId(Uuid::new_v4());
        let a = store.create_product(owner, draft("A", None)).await.unwrap();
        let b = store.create_product(owner, draft("B", None)).await.unwrap();

        let first = store.insert_external_order(external(a.id, "1001")).await.unwrap();
        assert!(matches!(first, InsertOutcome::Inserted(_)));
        let again = store.insert_external_order(external(a.id, "1001")).await.unwrap();
        assert_eq!(again, InsertOutcome::Duplicate);
        let other_product = store.insert_external_order(external(b.id, "1001")).await.unwrap();
        assert!(matches!(other_product, InsertOutcome::Inserted(_)));

        let batch = vec![external(a.id, "1001"), external(a.id, "1002"), external(a.id, "1002")];
        assert_eq!(store.insert_orders(batch).await.unwrap(), 1);
        assert_eq!(store.order_count().await, 3);
    }

    #[tokio::test]
    async fn batch_with_unknown_product_writes_nothing() {
        let store = MemoryStore::new();
        let owner = CallerId(Uuid::new_v4());
        let a = store.create_product(owner, draft("A", None)).await.unwrap();
        let batch = vec![external(a.id, "1"), external(Uuid::new_v4(), "2")];
        assert!(store.insert_orders(batch).await.unwrap_err().is_not_found());
        assert_eq!(store.order_count().await, 0);
    }

    #[tokio::test]
    async fn cursor_tracks_latest_external_order_only() {
        let store = MemoryStore::new();
        let owner = CallerId(Uuid::new_v4());
        let product = store.create_product(owner, draft("A", None)).await.unwrap();
        assert_eq!(store.external_order_cursor(product.id).await.unwrap(), None);

        let mut later_manual = external(product.id, "x");
        later_manual.external_order_id = None;
        later_manual.order_date = Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).single().unwrap();
        store.create_order(owner, later_manual).await.unwrap();
        store.insert_external_order(external(product.id, "7")).await.unwrap();

        assert_eq!(
            store.external_order_cursor(product.id).await.unwrap(),
            Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single()
        );
        let ids = store.external_order_ids(product.id).await.unwrap();
        assert_eq!(ids, HashSet::from(["7".to_string()]));
    }

    #[tokio::test]
    async fn deleting_product_cascades() {
        let store = MemoryStore::new();
        let owner = CallerId(Uuid::new_v4());
        let product = store.create_product(owner, draft("A", None)).await.unwrap();
        store.insert_external_order(external(product.id, "1")).await.unwrap();
        store
            .create_expense(
                owner,
                product.id,
                ExpenseDraft {
                    description: "ads".into(),
                    amount: Decimal::new(500, 2),
                    expense_date: NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(),
                },
            )
            .await
            .unwrap();

        store.delete_product(owner, product.id).await.unwrap();
        assert!(store.list_orders(&[product.id]).await.unwrap().is_empty());
        assert!(store.list_expenses(&[product.id]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn external_order_for_unknown_product_is_rejected() {
        let store = MemoryStore::new();
        let err = store
            .insert_external_order(external(Uuid::new_v4(), "1"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(store.order_count().await, 0);
    }

    #[tokio::test]
    async fn store_url_belongs_to_one_product() {
        let store = MemoryStore::new();
        let owner = CallerId(Uuid::new_v4());
        let other = CallerId(Uuid::new_v4());
        let url = "https://shop.example.com";
        let first = store.create_product(owner, draft("A", Some(url))).await.unwrap();

        let err = store.create_product(other, draft("B", Some(url))).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.product_by_store_url(url).await.unwrap().unwrap().id, first.id);

        let second = store.create_product(other, draft("B", None)).await.unwrap();
        let err = store
            .update_product(other, second.id, draft("B", Some(url)))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.owned_product(other, second.id).await.unwrap().store_url, None);

        // Re-saving a product with its own URL is not a conflict.
        let renamed = store
            .update_product(owner, first.id, draft("A2", Some(url)))
            .await
            .unwrap();
        assert_eq!(renamed.name, "A2");
    }

    #[tokio::test]
    async fn store_url_lookup_is_exact() {
        let store = MemoryStore::new();
        let owner = CallerId(Uuid::new_v4());
        store
            .create_product(owner, draft("A", Some("https://shop.example.com")))
            .await
            .unwrap();
        assert!(store
            .product_by_store_url("https://shop.example.com")
            .await
            .unwrap()
            .is_some());
        assert!(store
            .product_by_store_url("https://other.example.com")
            .await
            .unwrap()
            .is_none());
    }
}
