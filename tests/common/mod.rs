//! Common test utilities for returns-service integration tests.

use std::sync::Mutex;

use async_trait::async_trait;
use returns_service::error::AppError;
use returns_service::services::processor::{CardProcessor, ProcessorRefund, RefundReason};
use returns_service::services::Database;
use sqlx::PgPool;
use std::sync::Once;
use uuid::Uuid;

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,returns_service=debug,sqlx=warn")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Connect to the test database and ensure the schema exists.
pub async fn test_db() -> Database {
    init_tracing();

    let database_url = std::env::var("TEST_DATABASE_URL")
        .expect("TEST_DATABASE_URL must be set to run database integration tests");

    let db = Database::new(&database_url, 2, 1)
        .await
        .expect("Failed to connect to test database");
    db.run_migrations().await.expect("Migrations failed");
    ensure_retail_schema(db.pool()).await;
    db
}

/// The wider retail schema the returns core reads and writes through its
/// order-store/inventory contracts. Provisioned by other services in
/// production; created here for isolated tests.
async fn ensure_retail_schema(pool: &PgPool) {
    let statements = [
        r#"CREATE TABLE IF NOT EXISTS orders (
            order_id UUID PRIMARY KEY,
            customer_id UUID,
            status TEXT NOT NULL,
            tax_rate NUMERIC NOT NULL DEFAULT 0,
            tax_exempt BOOLEAN NOT NULL DEFAULT false,
            total_cents BIGINT NOT NULL,
            amount_paid_cents BIGINT NOT NULL DEFAULT 0,
            amount_due_cents BIGINT NOT NULL DEFAULT 0
        )"#,
        r#"CREATE TABLE IF NOT EXISTS order_lines (
            order_line_id UUID PRIMARY KEY,
            order_id UUID NOT NULL,
            product_id UUID NOT NULL,
            quantity INT NOT NULL,
            unit_price_cents BIGINT NOT NULL
        )"#,
        r#"CREATE TABLE IF NOT EXISTS order_payments (
            payment_id UUID PRIMARY KEY,
            order_id UUID NOT NULL,
            method TEXT NOT NULL,
            amount_cents BIGINT NOT NULL,
            status TEXT NOT NULL,
            processor_ref TEXT,
            parent_payment_id UUID,
            reference_return_id UUID,
            created_utc TIMESTAMPTZ NOT NULL DEFAULT now()
        )"#,
        r#"CREATE TABLE IF NOT EXISTS products (
            product_id UUID PRIMARY KEY,
            quantity_on_hand BIGINT NOT NULL DEFAULT 0
        )"#,
        r#"CREATE TABLE IF NOT EXISTS inventory_transactions (
            txn_id UUID PRIMARY KEY,
            product_id UUID NOT NULL,
            quantity_delta BIGINT NOT NULL,
            quantity_before BIGINT NOT NULL,
            quantity_after BIGINT NOT NULL,
            reason TEXT NOT NULL,
            reference_type TEXT NOT NULL,
            reference_id UUID,
            reference_number TEXT,
            actor_id UUID,
            created_utc TIMESTAMPTZ NOT NULL DEFAULT now()
        )"#,
        r#"CREATE TABLE IF NOT EXISTS till_movements (
            movement_id UUID PRIMARY KEY,
            till_session_id UUID NOT NULL,
            amount_cents BIGINT NOT NULL,
            reason TEXT NOT NULL,
            reference_number TEXT,
            created_utc TIMESTAMPTZ NOT NULL DEFAULT now()
        )"#,
    ];

    for statement in statements {
        sqlx::query(statement)
            .execute(pool)
            .await
            .expect("Failed to create retail schema table");
    }
}

/// A seeded order line for test assertions.
#[derive(Debug, Clone)]
pub struct SeededLine {
    pub order_line_id: Uuid,
    pub product_id: Uuid,
    pub quantity: i32,
    pub unit_price_cents: i64,
}

/// Insert a completed order with the given lines (quantity, unit price) and
/// payments (method, amount, processor ref).
pub async fn seed_order(
    pool: &PgPool,
    tax_rate: &str,
    tax_exempt: bool,
    lines: &[(i32, i64)],
    payments: &[(&str, i64, Option<&str>)],
) -> (Uuid, Vec<SeededLine>) {
    let order_id = Uuid::new_v4();
    let customer_id = Uuid::new_v4();
    let total_cents: i64 = lines
        .iter()
        .map(|(qty, price)| i64::from(*qty) * price)
        .sum();

    sqlx::query(
        r#"
        INSERT INTO orders (order_id, customer_id, status, tax_rate, tax_exempt, total_cents,
            amount_paid_cents, amount_due_cents)
        VALUES ($1, $2, 'completed', $3::numeric, $4, $5, $5, 0)
        "#,
    )
    .bind(order_id)
    .bind(customer_id)
    .bind(tax_rate)
    .bind(tax_exempt)
    .bind(total_cents)
    .execute(pool)
    .await
    .expect("Failed to seed order");

    let mut seeded = Vec::with_capacity(lines.len());
    for (quantity, unit_price_cents) in lines {
        let order_line_id = Uuid::new_v4();
        let product_id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO order_lines (order_line_id, order_id, product_id, quantity, unit_price_cents)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(order_line_id)
        .bind(order_id)
        .bind(product_id)
        .bind(quantity)
        .bind(unit_price_cents)
        .execute(pool)
        .await
        .expect("Failed to seed order line");

        sqlx::query("INSERT INTO products (product_id, quantity_on_hand) VALUES ($1, 100)")
            .bind(product_id)
            .execute(pool)
            .await
            .expect("Failed to seed product");

        seeded.push(SeededLine {
            order_line_id,
            product_id,
            quantity: *quantity,
            unit_price_cents: *unit_price_cents,
        });
    }

    for (method, amount_cents, processor_ref) in payments {
        sqlx::query(
            r#"
            INSERT INTO order_payments (payment_id, order_id, method, amount_cents, status, processor_ref)
            VALUES ($1, $2, $3, $4, 'completed', $5)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(order_id)
        .bind(method)
        .bind(amount_cents)
        .bind(processor_ref)
        .execute(pool)
        .await
        .expect("Failed to seed payment");
    }

    (order_id, seeded)
}

/// On-hand stock for a product.
pub async fn on_hand(pool: &PgPool, product_id: Uuid) -> i64 {
    sqlx::query_scalar("SELECT quantity_on_hand FROM products WHERE product_id = $1")
        .bind(product_id)
        .fetch_one(pool)
        .await
        .expect("Failed to read product stock")
}

/// Count refund (negative) payment entries linked to a return.
pub async fn refund_entry_count(pool: &PgPool, return_id: Uuid) -> i64 {
    sqlx::query_scalar(
        "SELECT COUNT(*) FROM order_payments WHERE reference_return_id = $1 AND amount_cents < 0",
    )
    .bind(return_id)
    .fetch_one(pool)
    .await
    .expect("Failed to count refund entries")
}

/// Card processor double recording calls; fails every call when `fail` is
/// set.
pub struct MockProcessor {
    pub fail: bool,
    pub calls: Mutex<Vec<(String, i64)>>,
}

impl MockProcessor {
    pub fn ok() -> Self {
        Self {
            fail: false,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            calls: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl CardProcessor for MockProcessor {
    async fn refund(
        &self,
        processor_ref: &str,
        amount_cents: i64,
        _reason: RefundReason,
    ) -> Result<ProcessorRefund, AppError> {
        self.calls
            .lock()
            .unwrap()
            .push((processor_ref.to_string(), amount_cents));
        if self.fail {
            return Err(AppError::ExternalProcessorError(anyhow::anyhow!(
                "simulated processor outage"
            )));
        }
        Ok(ProcessorRefund {
            id: format!("re_{}", Uuid::new_v4().simple()),
            status: "succeeded".to_string(),
        })
    }
}
