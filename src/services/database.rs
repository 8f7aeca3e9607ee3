//! Database service for returns-service.
//!
//! Owns the returns/return_items/store_credits tables and implements the
//! order-store, store-credit and inventory-ledger contracts against the shared
//! retail schema. Settlement runs its own transaction and reaches the
//! connection-scoped helpers here through `pub(crate)` associated functions.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Acquire, PgConnection};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{
    CreateReturn, CreditTransactionType, ListReturnsFilter, OrderLine, OrderSummary,
    PaymentInstrument, Return, ReturnItem, ReturnStatus, StoreCredit,
};
use crate::services::credit::{generate_code, MAX_CODE_ATTEMPTS};
use crate::services::lifecycle;
use crate::services::metrics::{DB_QUERY_DURATION, RETURNS_CREATED};
use crate::services::validation::{plan_return, ReturnPlan};

const RETURN_COLUMNS: &str = "return_id, return_number, order_id, customer_id, return_type, \
     status, refund_subtotal_cents, refund_tax_cents, refund_total_cents, restocking_fee_cents, \
     refund_method, processor_refund_ref, store_credit_id, initiated_by, approved_by, \
     processed_by, rejection_reason, notes, initiated_utc, approved_utc, completed_utc";

const RETURN_ITEM_COLUMNS: &str = "return_item_id, return_id, order_line_id, product_id, \
     quantity, unit_price_cents, refund_amount_cents, reason_code, reason_notes, condition, \
     disposition";

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "returns-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Return Operations
    // -------------------------------------------------------------------------

    /// Create a return: validate quantities against the order and prior
    /// returns, compute the refund, insert the return and its items.
    ///
    /// The affected order lines are locked for the duration of the
    /// transaction so two concurrent creations on the same line cannot
    /// together exceed the line's sold quantity.
    #[instrument(skip(self, input), fields(order_id = %input.order_id, item_count = input.items.len()))]
    pub async fn create_return(
        &self,
        input: &CreateReturn,
    ) -> Result<(Return, Vec<ReturnItem>), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_return"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let order = Self::load_order(&mut tx, input.order_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!("Order {} not found", input.order_id))
            })?;

        // FOR UPDATE: serializes concurrent return creations on these lines
        // until this transaction commits.
        let line_ids: Vec<Uuid> = input.items.iter().map(|i| i.order_line_id).collect();
        Self::load_order_lines_locked(&mut tx, input.order_id, &line_ids).await?;

        let already_returned = Self::load_returned_quantities(&mut tx, &line_ids).await?;

        // Full/partial detection needs every line of the order, not just the
        // requested ones.
        let lines = Self::load_order_lines(&mut tx, input.order_id).await?;

        let plan: ReturnPlan = plan_return(
            &order,
            &lines,
            &already_returned,
            &input.items,
            input.return_type_override,
        )?;

        let return_id = Uuid::new_v4();
        let created = sqlx::query_as::<_, Return>(&format!(
            r#"
            INSERT INTO returns (return_id, return_number, order_id, customer_id, return_type,
                status, refund_subtotal_cents, refund_tax_cents, refund_total_cents,
                refund_method, initiated_by, notes)
            VALUES ($1, 'RET-' || lpad(nextval('return_number_seq')::text, 6, '0'),
                $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING {RETURN_COLUMNS}
            "#
        ))
        .bind(return_id)
        .bind(input.order_id)
        .bind(order.customer_id)
        .bind(plan.return_type.as_str())
        .bind(ReturnStatus::Initiated.as_str())
        .bind(plan.subtotal_cents)
        .bind(plan.tax_cents)
        .bind(plan.total_cents)
        .bind(input.refund_method.as_str())
        .bind(input.initiated_by)
        .bind(&input.notes)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to insert return: {}", e)))?;

        let mut items = Vec::with_capacity(plan.items.len());
        for planned in &plan.items {
            let item = sqlx::query_as::<_, ReturnItem>(&format!(
                r#"
                INSERT INTO return_items (return_item_id, return_id, order_line_id, product_id,
                    quantity, unit_price_cents, refund_amount_cents, reason_code, reason_notes,
                    condition)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                RETURNING {RETURN_ITEM_COLUMNS}
                "#
            ))
            .bind(Uuid::new_v4())
            .bind(return_id)
            .bind(planned.order_line_id)
            .bind(planned.product_id)
            .bind(planned.quantity)
            .bind(planned.unit_price_cents)
            .bind(planned.refund_amount_cents)
            .bind(&planned.reason_code)
            .bind(&planned.reason_notes)
            .bind(planned.condition.as_str())
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to insert return item: {}", e))
            })?;
            items.push(item);
        }

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();
        RETURNS_CREATED
            .with_label_values(&[plan.return_type.as_str()])
            .inc();

        info!(
            return_id = %created.return_id,
            return_number = %created.return_number,
            refund_total_cents = created.refund_total_cents,
            "Return created"
        );

        Ok((created, items))
    }

    /// Get a return by ID.
    #[instrument(skip(self), fields(return_id = %return_id))]
    pub async fn get_return(&self, return_id: Uuid) -> Result<Option<Return>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_return"])
            .start_timer();

        let record = sqlx::query_as::<_, Return>(&format!(
            "SELECT {RETURN_COLUMNS} FROM returns WHERE return_id = $1"
        ))
        .bind(return_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get return: {}", e)))?;

        timer.observe_duration();

        Ok(record)
    }

    /// Get a return together with its items.
    #[instrument(skip(self), fields(return_id = %return_id))]
    pub async fn get_return_with_items(
        &self,
        return_id: Uuid,
    ) -> Result<Option<(Return, Vec<ReturnItem>)>, AppError> {
        let record = match self.get_return(return_id).await? {
            Some(r) => r,
            None => return Ok(None),
        };
        let items = self.get_return_items(return_id).await?;
        Ok(Some((record, items)))
    }

    /// Get all items of a return.
    #[instrument(skip(self), fields(return_id = %return_id))]
    pub async fn get_return_items(&self, return_id: Uuid) -> Result<Vec<ReturnItem>, AppError> {
        let items = sqlx::query_as::<_, ReturnItem>(&format!(
            "SELECT {RETURN_ITEM_COLUMNS} FROM return_items WHERE return_id = $1 ORDER BY return_item_id"
        ))
        .bind(return_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to get return items: {}", e))
        })?;

        Ok(items)
    }

    /// List returns with optional filters and cursor pagination.
    #[instrument(skip(self))]
    pub async fn list_returns(&self, filter: &ListReturnsFilter) -> Result<Vec<Return>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_returns"])
            .start_timer();

        let limit = i64::from(filter.page_size.clamp(1, 100));

        let returns = if let Some(cursor) = filter.page_token {
            sqlx::query_as::<_, Return>(&format!(
                r#"
                SELECT {RETURN_COLUMNS}
                FROM returns
                WHERE ($1::text IS NULL OR status = $1)
                  AND ($2::uuid IS NULL OR order_id = $2)
                  AND ($3::uuid IS NULL OR customer_id = $3)
                  AND return_id > $4
                ORDER BY return_id
                LIMIT $5
                "#
            ))
            .bind(filter.status.map(|s| s.as_str()))
            .bind(filter.order_id)
            .bind(filter.customer_id)
            .bind(cursor)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
        } else {
            sqlx::query_as::<_, Return>(&format!(
                r#"
                SELECT {RETURN_COLUMNS}
                FROM returns
                WHERE ($1::text IS NULL OR status = $1)
                  AND ($2::uuid IS NULL OR order_id = $2)
                  AND ($3::uuid IS NULL OR customer_id = $3)
                ORDER BY return_id
                LIMIT $4
                "#
            ))
            .bind(filter.status.map(|s| s.as_str()))
            .bind(filter.order_id)
            .bind(filter.customer_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
        }
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list returns: {}", e)))?;

        timer.observe_duration();

        Ok(returns)
    }

    /// Sum of quantities already returned for an order line, excluding
    /// cancelled and rejected returns.
    #[instrument(skip(self), fields(order_line_id = %order_line_id))]
    pub async fn sum_returned_quantity(&self, order_line_id: Uuid) -> Result<i64, AppError> {
        let sum: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(ri.quantity), 0)
            FROM return_items ri
            JOIN returns r ON r.return_id = ri.return_id
            WHERE ri.order_line_id = $1
              AND r.status NOT IN ('cancelled', 'rejected')
            "#,
        )
        .bind(order_line_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to sum returned quantity: {}", e))
        })?;

        Ok(sum.unwrap_or(0))
    }

    /// Transition a return through the lifecycle state machine, recording the
    /// acting user and edge-specific fields. The row is locked while the
    /// transition is checked and applied.
    ///
    /// `completed` is reserved for settlement and refused here.
    #[instrument(skip(self), fields(return_id = %return_id, to = %to))]
    pub async fn transition_return(
        &self,
        return_id: Uuid,
        to: ReturnStatus,
        actor: Uuid,
        reason: Option<&str>,
    ) -> Result<Return, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["transition_return"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let current = Self::load_return_locked(&mut tx, return_id).await?;
        let from = current.parsed_status().ok_or_else(|| {
            AppError::DatabaseError(anyhow::anyhow!(
                "Return {} has unrecognized status '{}'",
                return_id,
                current.status
            ))
        })?;

        lifecycle::ensure_transition(from, to)?;

        let updated = match to {
            ReturnStatus::Approved => {
                sqlx::query_as::<_, Return>(&format!(
                    r#"
                    UPDATE returns
                    SET status = $2, approved_by = $3, approved_utc = $4
                    WHERE return_id = $1
                    RETURNING {RETURN_COLUMNS}
                    "#
                ))
                .bind(return_id)
                .bind(to.as_str())
                .bind(actor)
                .bind(Utc::now())
                .fetch_one(&mut *tx)
                .await
            }
            ReturnStatus::Rejected => {
                let reason = reason.ok_or_else(|| {
                    AppError::InvalidInput(anyhow::anyhow!("Rejecting a return requires a reason"))
                })?;
                sqlx::query_as::<_, Return>(&format!(
                    r#"
                    UPDATE returns
                    SET status = $2, approved_by = $3, approved_utc = $4, rejection_reason = $5
                    WHERE return_id = $1
                    RETURNING {RETURN_COLUMNS}
                    "#
                ))
                .bind(return_id)
                .bind(to.as_str())
                .bind(actor)
                .bind(Utc::now())
                .bind(reason)
                .fetch_one(&mut *tx)
                .await
            }
            ReturnStatus::Processing => {
                sqlx::query_as::<_, Return>(&format!(
                    r#"
                    UPDATE returns
                    SET status = $2, processed_by = $3
                    WHERE return_id = $1
                    RETURNING {RETURN_COLUMNS}
                    "#
                ))
                .bind(return_id)
                .bind(to.as_str())
                .bind(actor)
                .fetch_one(&mut *tx)
                .await
            }
            ReturnStatus::Cancelled => {
                sqlx::query_as::<_, Return>(&format!(
                    r#"
                    UPDATE returns
                    SET status = $2
                    WHERE return_id = $1
                    RETURNING {RETURN_COLUMNS}
                    "#
                ))
                .bind(return_id)
                .bind(to.as_str())
                .fetch_one(&mut *tx)
                .await
            }
            ReturnStatus::Completed => {
                return Err(AppError::InvalidInput(anyhow::anyhow!(
                    "Completion is driven by refund settlement, not a direct transition"
                )));
            }
            ReturnStatus::Initiated => {
                // Unreachable: no edge leads back to initiated.
                return Err(AppError::InvalidTransition { from, to });
            }
        }
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to update return status: {}", e))
        })?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();

        info!(
            return_id = %return_id,
            from = %from,
            to = %to,
            "Return status transitioned"
        );

        Ok(updated)
    }

    // -------------------------------------------------------------------------
    // Connection-scoped helpers (shared with settlement's transaction)
    // -------------------------------------------------------------------------

    pub(crate) async fn load_return_locked(
        conn: &mut PgConnection,
        return_id: Uuid,
    ) -> Result<Return, AppError> {
        sqlx::query_as::<_, Return>(&format!(
            "SELECT {RETURN_COLUMNS} FROM returns WHERE return_id = $1 FOR UPDATE"
        ))
        .bind(return_id)
        .fetch_optional(conn)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to lock return: {}", e)))?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Return {} not found", return_id)))
    }

    pub(crate) async fn load_return_items(
        conn: &mut PgConnection,
        return_id: Uuid,
    ) -> Result<Vec<ReturnItem>, AppError> {
        sqlx::query_as::<_, ReturnItem>(&format!(
            "SELECT {RETURN_ITEM_COLUMNS} FROM return_items WHERE return_id = $1 ORDER BY return_item_id"
        ))
        .bind(return_id)
        .fetch_all(conn)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to load return items: {}", e))
        })
    }

    /// Persist an item's disposition. Done before the inventory ledger call
    /// so a failed ledger write cannot leave the disposition undetermined on
    /// retry.
    pub(crate) async fn set_item_disposition(
        conn: &mut PgConnection,
        return_item_id: Uuid,
        disposition: &str,
    ) -> Result<(), AppError> {
        sqlx::query("UPDATE return_items SET disposition = $2 WHERE return_item_id = $1")
            .bind(return_item_id)
            .bind(disposition)
            .execute(conn)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to set disposition: {}", e))
            })?;
        Ok(())
    }

    /// Final settlement update: terminal status, resolved method and
    /// references, processor actor, completion timestamp.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn finalize_return(
        conn: &mut PgConnection,
        return_id: Uuid,
        method: &str,
        restocking_fee_cents: i64,
        processor_refund_ref: Option<&str>,
        store_credit_id: Option<Uuid>,
        processed_by: Uuid,
    ) -> Result<Return, AppError> {
        sqlx::query_as::<_, Return>(&format!(
            r#"
            UPDATE returns
            SET status = 'completed',
                refund_method = $2,
                restocking_fee_cents = $3,
                processor_refund_ref = $4,
                store_credit_id = $5,
                processed_by = $6,
                completed_utc = $7
            WHERE return_id = $1
            RETURNING {RETURN_COLUMNS}
            "#
        ))
        .bind(return_id)
        .bind(method)
        .bind(restocking_fee_cents)
        .bind(processor_refund_ref)
        .bind(store_credit_id)
        .bind(processed_by)
        .bind(Utc::now())
        .fetch_one(conn)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to finalize return: {}", e))
        })
    }

    pub(crate) async fn load_order(
        conn: &mut PgConnection,
        order_id: Uuid,
    ) -> Result<Option<OrderSummary>, AppError> {
        sqlx::query_as::<_, OrderSummary>(
            r#"
            SELECT order_id, customer_id, status, tax_rate, tax_exempt, total_cents
            FROM orders
            WHERE order_id = $1
            "#,
        )
        .bind(order_id)
        .fetch_optional(conn)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get order: {}", e)))
    }

    pub(crate) async fn load_order_lines(
        conn: &mut PgConnection,
        order_id: Uuid,
    ) -> Result<Vec<OrderLine>, AppError> {
        sqlx::query_as::<_, OrderLine>(
            r#"
            SELECT order_line_id, order_id, product_id, quantity, unit_price_cents
            FROM order_lines
            WHERE order_id = $1
            ORDER BY order_line_id
            "#,
        )
        .bind(order_id)
        .fetch_all(conn)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get order lines: {}", e)))
    }

    /// Lock the named order lines for the rest of the transaction.
    pub(crate) async fn load_order_lines_locked(
        conn: &mut PgConnection,
        order_id: Uuid,
        line_ids: &[Uuid],
    ) -> Result<Vec<OrderLine>, AppError> {
        sqlx::query_as::<_, OrderLine>(
            r#"
            SELECT order_line_id, order_id, product_id, quantity, unit_price_cents
            FROM order_lines
            WHERE order_id = $1 AND order_line_id = ANY($2)
            ORDER BY order_line_id
            FOR UPDATE
            "#,
        )
        .bind(order_id)
        .bind(line_ids)
        .fetch_all(conn)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to lock order lines: {}", e)))
    }

    /// Returned quantity per order line across non-cancelled/non-rejected
    /// returns.
    pub(crate) async fn load_returned_quantities(
        conn: &mut PgConnection,
        line_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, i64>, AppError> {
        let rows: Vec<(Uuid, i64)> = sqlx::query_as(
            r#"
            SELECT ri.order_line_id, COALESCE(SUM(ri.quantity), 0)
            FROM return_items ri
            JOIN returns r ON r.return_id = ri.return_id
            WHERE ri.order_line_id = ANY($1)
              AND r.status NOT IN ('cancelled', 'rejected')
            GROUP BY ri.order_line_id
            "#,
        )
        .bind(line_ids)
        .fetch_all(conn)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to sum returned quantities: {}", e))
        })?;

        Ok(rows.into_iter().collect())
    }

    /// Completed, non-refund payment instruments on the order, largest first.
    /// Instrument id breaks ties for a deterministic allocation order.
    pub(crate) async fn load_completed_payment_instruments(
        conn: &mut PgConnection,
        order_id: Uuid,
    ) -> Result<Vec<PaymentInstrument>, AppError> {
        sqlx::query_as::<_, PaymentInstrument>(
            r#"
            SELECT payment_id, order_id, method, amount_cents, processor_ref
            FROM order_payments
            WHERE order_id = $1
              AND status = 'completed'
              AND amount_cents > 0
            ORDER BY amount_cents DESC, payment_id
            "#,
        )
        .bind(order_id)
        .fetch_all(conn)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to load payment instruments: {}", e))
        })
    }

    /// Append one negative-amount payment ledger entry for a refund
    /// allocation, linked to the original instrument and (when present) the
    /// processor's refund reference.
    pub(crate) async fn append_refund_payment_entry(
        conn: &mut PgConnection,
        order_id: Uuid,
        method: &str,
        amount_cents: i64,
        parent_payment_id: Option<Uuid>,
        processor_ref: Option<&str>,
        return_id: Uuid,
    ) -> Result<Uuid, AppError> {
        let payment_id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO order_payments (payment_id, order_id, method, amount_cents, status,
                processor_ref, parent_payment_id, reference_return_id, created_utc)
            VALUES ($1, $2, $3, $4, 'completed', $5, $6, $7, now())
            "#,
        )
        .bind(payment_id)
        .bind(order_id)
        .bind(method)
        .bind(amount_cents)
        .bind(processor_ref)
        .bind(parent_payment_id)
        .bind(return_id)
        .execute(conn)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to append refund entry: {}", e))
        })?;
        Ok(payment_id)
    }

    /// Recompute the order's aggregate paid/due amounts from the full set of
    /// its payment entries. Never incremental, so it stays correct no matter
    /// how many prior partial returns touched the order.
    pub(crate) async fn recompute_paid_due(
        conn: &mut PgConnection,
        order_id: Uuid,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE orders
            SET amount_paid_cents = sub.paid,
                amount_due_cents = orders.total_cents - sub.paid
            FROM (
                SELECT COALESCE(SUM(amount_cents), 0) AS paid
                FROM order_payments
                WHERE order_id = $1 AND status = 'completed'
            ) sub
            WHERE orders.order_id = $1
            "#,
        )
        .bind(order_id)
        .execute(conn)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to recompute paid/due: {}", e))
        })?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Store Credit Operations
    // -------------------------------------------------------------------------

    /// Create a store credit with a fresh code and one `issue` transaction
    /// row referencing the source return. Retries code generation on
    /// collision up to a fixed bound.
    pub(crate) async fn create_store_credit(
        conn: &mut PgConnection,
        customer_id: Option<Uuid>,
        amount_cents: i64,
        source_return_id: Uuid,
    ) -> Result<StoreCredit, AppError> {
        Self::create_store_credit_with(conn, customer_id, amount_cents, source_return_id, generate_code)
            .await
    }

    /// Each INSERT attempt runs in its own savepoint: a unique violation
    /// aborts the enclosing Postgres transaction otherwise, which would
    /// reject the retry statement outright.
    async fn create_store_credit_with(
        conn: &mut PgConnection,
        customer_id: Option<Uuid>,
        amount_cents: i64,
        source_return_id: Uuid,
        mut next_code: impl FnMut() -> String + Send,
    ) -> Result<StoreCredit, AppError> {
        let mut attempts = 0;
        let credit = loop {
            attempts += 1;
            let code = next_code();

            let mut sp = conn.begin().await.map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to create savepoint: {}", e))
            })?;
            let result = sqlx::query_as::<_, StoreCredit>(
                r#"
                INSERT INTO store_credits (credit_id, code, customer_id, original_amount_cents,
                    balance_cents, source_return_id)
                VALUES ($1, $2, $3, $4, $4, $5)
                RETURNING credit_id, code, customer_id, original_amount_cents, balance_cents,
                    source_return_id, created_utc
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(&code)
            .bind(customer_id)
            .bind(amount_cents)
            .bind(source_return_id)
            .fetch_one(&mut *sp)
            .await;

            match result {
                Ok(credit) => {
                    sp.commit().await.map_err(|e| {
                        AppError::DatabaseError(anyhow::anyhow!(
                            "Failed to commit savepoint: {}",
                            e
                        ))
                    })?;
                    break credit;
                }
                Err(sqlx::Error::Database(ref db_err)) if db_err.is_unique_violation() => {
                    sp.rollback().await.ok();
                    if attempts >= MAX_CODE_ATTEMPTS {
                        return Err(AppError::Internal(anyhow::anyhow!(
                            "Store credit code generation exhausted after {} attempts",
                            attempts
                        )));
                    }
                    continue;
                }
                Err(e) => {
                    sp.rollback().await.ok();
                    return Err(AppError::DatabaseError(anyhow::anyhow!(
                        "Failed to create store credit: {}",
                        e
                    )));
                }
            }
        };

        sqlx::query(
            r#"
            INSERT INTO store_credit_transactions (credit_txn_id, credit_id, amount_cents,
                txn_type, reference_return_id)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(credit.credit_id)
        .bind(amount_cents)
        .bind(CreditTransactionType::Issue.as_str())
        .bind(source_return_id)
        .execute(conn)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to record credit issue: {}", e))
        })?;

        info!(
            credit_id = %credit.credit_id,
            amount_cents = amount_cents,
            "Store credit issued"
        );

        Ok(credit)
    }

    // -------------------------------------------------------------------------
    // Inventory Ledger Operations
    // -------------------------------------------------------------------------

    /// Restore a returned quantity to sellable on-hand stock and append a
    /// ledger row tagged with the return number.
    pub(crate) async fn restore_stock(
        conn: &mut PgConnection,
        product_id: Uuid,
        quantity: i32,
        reason: &str,
        return_id: Uuid,
        return_number: &str,
        actor: Uuid,
    ) -> Result<String, AppError> {
        let after: i64 = sqlx::query_scalar(
            r#"
            UPDATE products
            SET quantity_on_hand = quantity_on_hand + $2
            WHERE product_id = $1
            RETURNING quantity_on_hand
            "#,
        )
        .bind(product_id)
        .bind(i64::from(quantity))
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to restore stock: {}", e)))?
        .ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("Product {} not found", product_id))
        })?;

        let before = after - i64::from(quantity);

        sqlx::query(
            r#"
            INSERT INTO inventory_transactions (txn_id, product_id, quantity_delta,
                quantity_before, quantity_after, reason, reference_type, reference_id,
                reference_number, actor_id, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6, 'return', $7, $8, $9, now())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(product_id)
        .bind(i64::from(quantity))
        .bind(before)
        .bind(after)
        .bind(reason)
        .bind(return_id)
        .bind(return_number)
        .bind(actor)
        .execute(conn)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to append inventory entry: {}", e))
        })?;

        Ok(format!(
            "Restored {} unit(s), on-hand now {}",
            quantity, after
        ))
    }

    /// Append an audit-only inventory entry (zero delta, before == after) so
    /// write-offs stay traceable without affecting availability.
    pub(crate) async fn append_inventory_audit(
        conn: &mut PgConnection,
        product_id: Uuid,
        reason: &str,
        return_id: Uuid,
        return_number: &str,
        actor: Uuid,
    ) -> Result<String, AppError> {
        let on_hand: i64 = sqlx::query_scalar(
            "SELECT quantity_on_hand FROM products WHERE product_id = $1",
        )
        .bind(product_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to read product: {}", e)))?
        .ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("Product {} not found", product_id))
        })?;

        sqlx::query(
            r#"
            INSERT INTO inventory_transactions (txn_id, product_id, quantity_delta,
                quantity_before, quantity_after, reason, reference_type, reference_id,
                reference_number, actor_id, created_utc)
            VALUES ($1, $2, 0, $3, $3, $4, 'return', $5, $6, $7, now())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(product_id)
        .bind(on_hand)
        .bind(reason)
        .bind(return_id)
        .bind(return_number)
        .bind(actor)
        .execute(conn)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to append audit entry: {}", e))
        })?;

        Ok("Recorded without stock adjustment".to_string())
    }

    /// Record a cash-drawer movement for a cash refund. Callers treat a
    /// failure here as a warning, never as a settlement failure.
    pub(crate) async fn record_till_movement(
        conn: &mut PgConnection,
        till_session_id: Uuid,
        amount_cents: i64,
        reason: &str,
        return_number: &str,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO till_movements (movement_id, till_session_id, amount_cents, reason,
                reference_number, created_utc)
            VALUES ($1, $2, $3, $4, $5, now())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(till_session_id)
        .bind(amount_cents)
        .bind(reason)
        .bind(return_number)
        .execute(conn)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to record till movement: {}", e))
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_db() -> Database {
        let url = std::env::var("TEST_DATABASE_URL")
            .expect("TEST_DATABASE_URL must be set to run database integration tests");
        let db = Database::new(&url, 2, 1).await.expect("connect");
        db.run_migrations().await.expect("migrate");
        db
    }

    async fn seed_taken_code(pool: &PgPool) -> String {
        let code = generate_code();
        sqlx::query(
            r#"
            INSERT INTO store_credits (credit_id, code, original_amount_cents, balance_cents)
            VALUES ($1, $2, 1000, 1000)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&code)
        .execute(pool)
        .await
        .expect("seed store credit");
        code
    }

    #[tokio::test]
    #[ignore]
    async fn code_collision_retries_without_aborting_the_transaction() {
        let db = test_db().await;
        let taken = seed_taken_code(db.pool()).await;
        let fresh = generate_code();

        let mut tx = db.pool().begin().await.unwrap();

        // First draw collides, second succeeds.
        let mut codes = vec![fresh.clone(), taken.clone()];
        let credit = Database::create_store_credit_with(
            &mut tx,
            None,
            2_500,
            Uuid::new_v4(),
            move || codes.pop().unwrap(),
        )
        .await
        .expect("Collision should be retried, not surfaced");
        assert_eq!(credit.code, fresh);
        assert_eq!(credit.balance_cents, 2_500);

        // The transaction survived the unique violation and still accepts
        // statements.
        let issues: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM store_credit_transactions WHERE credit_id = $1",
        )
        .bind(credit.credit_id)
        .fetch_one(&mut *tx)
        .await
        .expect("transaction must remain usable after the collision");
        assert_eq!(issues, 1);

        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn code_generation_exhaustion_is_an_internal_error() {
        let db = test_db().await;
        let taken = seed_taken_code(db.pool()).await;

        let mut tx = db.pool().begin().await.unwrap();

        let err = Database::create_store_credit_with(
            &mut tx,
            None,
            2_500,
            Uuid::new_v4(),
            move || taken.clone(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::Internal(_)));

        tx.rollback().await.unwrap();
    }
}
