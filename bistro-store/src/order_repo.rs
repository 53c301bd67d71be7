use async_trait::async_trait;
use bistro_order::repository::{check_assignable, check_completable, ORDER_NUMBER_ATTEMPTS};
use bistro_order::{
    ContactInfo, CreateOutcome, FulfillmentMode, Order, OrderError, OrderFilter, OrderLineItem,
    OrderRepository, OrderResult, OrderStatus, PaymentMethod, PaymentStatus,
};
use bistro_shared::Masked;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};
use std::collections::HashMap;
use tracing::{error, warn};
use uuid::Uuid;

const ORDER_COLUMNS: &str = "id, order_number, customer_id, contact_name, contact_email, \
    contact_phone, delivery_address, fulfillment_mode, payment_method, subtotal_cents, \
    delivery_fee_cents, total_cents, currency, payment_reference, payment_status, status, \
    assigned_courier, created_at, updated_at";

const ITEM_COLUMNS: &str = "id, order_id, product_id, variant_id, name, quantity, \
    unit_price_cents, line_total_cents, note";

/// Postgres-backed order store. Every mutation is a single conditional
/// statement or one transaction holding the row lock.
pub struct PgOrderRepository {
    pool: PgPool,
}

impl PgOrderRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct OrderRow {
    id: Uuid,
    order_number: String,
    customer_id: Option<String>,
    contact_name: String,
    contact_email: Option<String>,
    contact_phone: Option<String>,
    delivery_address: Option<String>,
    fulfillment_mode: String,
    payment_method: String,
    subtotal_cents: i64,
    delivery_fee_cents: i64,
    total_cents: i64,
    currency: String,
    payment_reference: Option<String>,
    payment_status: String,
    status: String,
    assigned_courier: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct OrderItemRow {
    id: Uuid,
    order_id: Uuid,
    product_id: Uuid,
    variant_id: Option<Uuid>,
    name: String,
    quantity: i32,
    unit_price_cents: i64,
    line_total_cents: i64,
    note: Option<String>,
}

impl OrderItemRow {
    fn into_item(self) -> OrderResult<OrderLineItem> {
        let quantity = u32::try_from(self.quantity)
            .map_err(|_| OrderError::Store(format!("negative quantity on item {}", self.id)))?;
        Ok(OrderLineItem {
            id: self.id,
            product_id: self.product_id,
            variant_id: self.variant_id,
            name: self.name,
            quantity,
            unit_price_cents: self.unit_price_cents,
            line_total_cents: self.line_total_cents,
            note: self.note,
        })
    }
}

impl OrderRow {
    fn into_order(self, items: Vec<OrderLineItem>) -> OrderResult<Order> {
        let fulfillment_mode = self
            .fulfillment_mode
            .parse::<FulfillmentMode>()
            .map_err(|e| OrderError::Store(e.to_string()))?;
        Ok(Order {
            id: self.id,
            order_number: self.order_number,
            customer_id: self.customer_id,
            contact: ContactInfo {
                name: self.contact_name,
                email: self.contact_email.map(Masked::new),
                phone: self.contact_phone.map(Masked::new),
                address: self.delivery_address,
            },
            fulfillment_mode,
            payment_method: parse_column::<PaymentMethod>(&self.payment_method)?,
            subtotal_cents: self.subtotal_cents,
            delivery_fee_cents: self.delivery_fee_cents,
            total_cents: self.total_cents,
            currency: self.currency,
            payment_reference: self.payment_reference,
            payment_status: parse_column::<PaymentStatus>(&self.payment_status)?,
            status: parse_column::<OrderStatus>(&self.status)?,
            assigned_courier: self.assigned_courier,
            items,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Stored enum columns that no longer parse mean the row is corrupt, not that
/// the caller sent bad input.
fn parse_column<T>(value: &str) -> OrderResult<T>
where
    T: std::str::FromStr<Err = OrderError>,
{
    value.parse::<T>().map_err(|e| OrderError::Store(e.to_string()))
}

/// Explicitly named in the migration so clashes can be told apart from
/// payment reference conflicts.
const ORDER_NUMBER_CONSTRAINT: &str = "orders_order_number_key";

fn is_order_number_clash(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.constraint() == Some(ORDER_NUMBER_CONSTRAINT))
}

fn db_err(e: sqlx::Error) -> OrderError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => OrderError::Conflict,
        _ => {
            error!("Database error: {}", e);
            OrderError::Store(e.to_string())
        }
    }
}

async fn insert_order(tx: &mut Transaction<'_, Postgres>, order: &Order) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO orders (id, order_number, customer_id, contact_name, contact_email, contact_phone,
            delivery_address, fulfillment_mode, payment_method, subtotal_cents, delivery_fee_cents,
            total_cents, currency, payment_reference, payment_status, status, assigned_courier,
            created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
        "#,
    )
    .bind(order.id)
    .bind(&order.order_number)
    .bind(&order.customer_id)
    .bind(&order.contact.name)
    .bind(order.contact.email.as_ref().map(|m| m.expose().as_str()))
    .bind(order.contact.phone.as_ref().map(|m| m.expose().as_str()))
    .bind(&order.contact.address)
    .bind(order.fulfillment_mode.as_str())
    .bind(order.payment_method.as_str())
    .bind(order.subtotal_cents)
    .bind(order.delivery_fee_cents)
    .bind(order.total_cents)
    .bind(&order.currency)
    .bind(&order.payment_reference)
    .bind(order.payment_status.as_str())
    .bind(order.status.as_str())
    .bind(&order.assigned_courier)
    .bind(order.created_at)
    .bind(order.updated_at)
    .execute(&mut **tx)
    .await?;

    insert_items(tx, order).await
}

async fn insert_items(tx: &mut Transaction<'_, Postgres>, order: &Order) -> Result<(), sqlx::Error> {
    for (position, item) in order.items.iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO order_items (id, order_id, position, product_id, variant_id, name, quantity,
                unit_price_cents, line_total_cents, note)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(item.id)
        .bind(order.id)
        .bind(i32::try_from(position).unwrap_or(i32::MAX))
        .bind(item.product_id)
        .bind(item.variant_id)
        .bind(&item.name)
        .bind(i32::try_from(item.quantity).unwrap_or(i32::MAX))
        .bind(item.unit_price_cents)
        .bind(item.line_total_cents)
        .bind(&item.note)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

impl PgOrderRepository {
    async fn insert_new(&self, order: &Order) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        insert_order(&mut tx, order).await?;
        tx.commit().await
    }

    /// Insert unless the payment reference is already stored. `false` means
    /// another order holds it.
    async fn insert_unless_referenced(
        &self,
        order: &Order,
        reference: &str,
    ) -> Result<bool, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let inserted: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO orders (id, order_number, customer_id, contact_name, contact_email, contact_phone,
                delivery_address, fulfillment_mode, payment_method, subtotal_cents, delivery_fee_cents,
                total_cents, currency, payment_reference, payment_status, status, assigned_courier,
                created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            ON CONFLICT (payment_reference) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(order.id)
        .bind(&order.order_number)
        .bind(&order.customer_id)
        .bind(&order.contact.name)
        .bind(order.contact.email.as_ref().map(|m| m.expose().as_str()))
        .bind(order.contact.phone.as_ref().map(|m| m.expose().as_str()))
        .bind(&order.contact.address)
        .bind(order.fulfillment_mode.as_str())
        .bind(order.payment_method.as_str())
        .bind(order.subtotal_cents)
        .bind(order.delivery_fee_cents)
        .bind(order.total_cents)
        .bind(&order.currency)
        .bind(reference)
        .bind(order.payment_status.as_str())
        .bind(order.status.as_str())
        .bind(&order.assigned_courier)
        .bind(order.created_at)
        .bind(order.updated_at)
        .fetch_optional(&mut *tx)
        .await?;

        if inserted.is_none() {
            tx.rollback().await?;
            return Ok(false);
        }
        insert_items(&mut tx, order).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn load_items(&self, order_id: Uuid) -> OrderResult<Vec<OrderLineItem>> {
        let sql = format!(
            "SELECT {} FROM order_items WHERE order_id = $1 ORDER BY position",
            ITEM_COLUMNS
        );
        sqlx::query_as::<_, OrderItemRow>(&sql)
            .bind(order_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?
            .into_iter()
            .map(OrderItemRow::into_item)
            .collect()
    }

    async fn hydrate(&self, row: OrderRow) -> OrderResult<Order> {
        let items = self.load_items(row.id).await?;
        row.into_order(items)
    }

    async fn hydrate_all(&self, rows: Vec<OrderRow>) -> OrderResult<Vec<Order>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<Uuid> = rows.iter().map(|row| row.id).collect();
        let sql = format!(
            "SELECT {} FROM order_items WHERE order_id = ANY($1) ORDER BY order_id, position",
            ITEM_COLUMNS
        );
        let item_rows = sqlx::query_as::<_, OrderItemRow>(&sql)
            .bind(&ids)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        let mut items: HashMap<Uuid, Vec<OrderLineItem>> = HashMap::new();
        for row in item_rows {
            let order_id = row.order_id;
            items.entry(order_id).or_default().push(row.into_item()?);
        }

        rows.into_iter()
            .map(|row| {
                let order_items = items.remove(&row.id).unwrap_or_default();
                row.into_order(order_items)
            })
            .collect()
    }

    async fn fetch_row(&self, clause: &str, value: &str) -> OrderResult<Option<OrderRow>> {
        let sql = format!("SELECT {} FROM orders WHERE {} = $1", ORDER_COLUMNS, clause);
        sqlx::query_as::<_, OrderRow>(&sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)
    }
}

#[async_trait]
impl OrderRepository for PgOrderRepository {
    async fn create_order(&self, order: &Order) -> OrderResult<Order> {
        let mut order = order.clone();
        let mut attempts = 1;
        loop {
            match self.insert_new(&order).await {
                Ok(()) => return Ok(order),
                Err(e) if is_order_number_clash(&e) && attempts < ORDER_NUMBER_ATTEMPTS => {
                    warn!(order_number = %order.order_number, "Order number taken, drawing another");
                    order.renumber();
                    attempts += 1;
                }
                Err(e) => return Err(db_err(e)),
            }
        }
    }

    async fn create_or_get_by_reference(&self, order: &Order) -> OrderResult<CreateOutcome> {
        let reference = order.payment_reference.as_deref().ok_or_else(|| {
            OrderError::Validation("order has no payment reference".to_string())
        })?;

        let mut order = order.clone();
        let mut attempts = 1;
        loop {
            match self.insert_unless_referenced(&order, reference).await {
                Ok(true) => return Ok(CreateOutcome::Created(order)),
                Ok(false) => break,
                Err(e) if is_order_number_clash(&e) && attempts < ORDER_NUMBER_ATTEMPTS => {
                    warn!(order_number = %order.order_number, "Order number taken, drawing another");
                    order.renumber();
                    attempts += 1;
                }
                Err(e) => return Err(db_err(e)),
            }
        }

        // Another writer holds the reference; its row is committed by now.
        let existing = self
            .fetch_row("payment_reference", reference)
            .await?
            .ok_or(OrderError::Conflict)?;
        Ok(CreateOutcome::Existing(self.hydrate(existing).await?))
    }

    async fn get_order(&self, id: Uuid) -> OrderResult<Option<Order>> {
        let sql = format!("SELECT {} FROM orders WHERE id = $1", ORDER_COLUMNS);
        let row = sqlx::query_as::<_, OrderRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        match row {
            Some(row) => Ok(Some(self.hydrate(row).await?)),
            None => Ok(None),
        }
    }

    async fn get_by_payment_reference(&self, reference: &str) -> OrderResult<Option<Order>> {
        match self.fetch_row("payment_reference", reference).await? {
            Some(row) => Ok(Some(self.hydrate(row).await?)),
            None => Ok(None),
        }
    }

    async fn update_status(
        &self,
        id: Uuid,
        expected: OrderStatus,
        next: OrderStatus,
        payment_status: Option<PaymentStatus>,
    ) -> OrderResult<Order> {
        let sql = format!(
            "UPDATE orders SET status = $1, payment_status = COALESCE($2, payment_status), \
             updated_at = NOW() WHERE id = $3 AND status = $4 RETURNING {}",
            ORDER_COLUMNS
        );
        let row = sqlx::query_as::<_, OrderRow>(&sql)
            .bind(next.as_str())
            .bind(payment_status.map(|p| p.as_str()))
            .bind(id)
            .bind(expected.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        match row {
            Some(row) => self.hydrate(row).await,
            // Zero rows: either the order is gone or its status moved on.
            None => match self.get_order(id).await? {
                Some(_) => Err(OrderError::Conflict),
                None => Err(OrderError::NotFound),
            },
        }
    }

    async fn assign_courier(
        &self,
        id: Uuid,
        courier_id: &str,
        capacity: u32,
    ) -> OrderResult<Order> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        // Serializes every assignment for this courier until commit.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(courier_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        let current: Option<(String, String)> =
            sqlx::query_as("SELECT status, fulfillment_mode FROM orders WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err)?;
        let (status, mode) = current.ok_or(OrderError::NotFound)?;
        let mode = mode
            .parse::<FulfillmentMode>()
            .map_err(|e| OrderError::Store(e.to_string()))?;
        check_assignable(parse_column::<OrderStatus>(&status)?, mode)?;

        let (active,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM orders WHERE assigned_courier = $1 AND status = 'delivering'",
        )
        .bind(courier_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        if active >= i64::from(capacity) {
            return Err(OrderError::CourierAtCapacity);
        }

        let sql = format!(
            "UPDATE orders SET status = 'delivering', assigned_courier = $2, updated_at = NOW() \
             WHERE id = $1 AND status = 'ready' RETURNING {}",
            ORDER_COLUMNS
        );
        let row = sqlx::query_as::<_, OrderRow>(&sql)
            .bind(id)
            .bind(courier_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .ok_or(OrderError::Conflict)?;
        tx.commit().await.map_err(db_err)?;

        self.hydrate(row).await
    }

    async fn complete_delivery(&self, id: Uuid, courier_id: &str) -> OrderResult<Order> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let current: Option<(String, Option<String>)> =
            sqlx::query_as("SELECT status, assigned_courier FROM orders WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err)?;
        let (status, assigned) = current.ok_or(OrderError::NotFound)?;
        check_completable(
            parse_column::<OrderStatus>(&status)?,
            assigned.as_deref(),
            courier_id,
        )?;

        let sql = format!(
            "UPDATE orders SET status = 'completed', updated_at = NOW() \
             WHERE id = $1 AND status = 'delivering' RETURNING {}",
            ORDER_COLUMNS
        );
        let row = sqlx::query_as::<_, OrderRow>(&sql)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .ok_or(OrderError::Conflict)?;
        tx.commit().await.map_err(db_err)?;

        self.hydrate(row).await
    }

    async fn count_active_deliveries(&self, courier_id: &str) -> OrderResult<u32> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM orders WHERE assigned_courier = $1 AND status = 'delivering'",
        )
        .bind(courier_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    async fn list_orders(&self, filter: &OrderFilter) -> OrderResult<Vec<Order>> {
        let mut query: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {} FROM orders WHERE TRUE", ORDER_COLUMNS));
        if let Some(customer_id) = &filter.customer_id {
            query.push(" AND customer_id = ").push_bind(customer_id.clone());
        }
        if !filter.statuses.is_empty() {
            let statuses: Vec<String> = filter
                .statuses
                .iter()
                .map(|s| s.as_str().to_string())
                .collect();
            query.push(" AND status = ANY(").push_bind(statuses).push(")");
        }
        if let Some(mode) = filter.fulfillment_mode {
            query.push(" AND fulfillment_mode = ").push_bind(mode.as_str());
        }
        if let Some(courier) = &filter.assigned_courier {
            query.push(" AND assigned_courier = ").push_bind(courier.clone());
        }
        query.push(" ORDER BY created_at DESC");

        let rows = query
            .build_query_as::<OrderRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        self.hydrate_all(rows).await
    }
}
