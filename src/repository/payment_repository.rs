use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::{FromRow, SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::{
    domain::{Payment, PaymentMethod, PaymentStatus},
    error::{AppError, Result},
    repository::{parse_opt_uuid, parse_uuid, to_utc, PaymentRepository},
};

const PAYMENT_COLUMNS: &str = r#"
    id, payer_id, membership_id, amount, currency, method, status,
    external_ref, receipt_code, failure_reason, notes, contact_email, version,
    completed_at, created_at, updated_at
"#;

#[derive(FromRow)]
struct PaymentRow {
    id: String,
    payer_id: String,
    membership_id: Option<String>,
    amount: i64,
    currency: String,
    method: String,
    status: String,
    external_ref: Option<String>,
    receipt_code: Option<String>,
    failure_reason: Option<String>,
    notes: String,
    contact_email: Option<String>,
    version: i64,
    completed_at: Option<NaiveDateTime>,
    created_at: NaiveDateTime,
    updated_at: NaiveDateTime,
}

#[derive(Debug, Clone)]
pub struct NewPayment {
    pub payer_id: Uuid,
    pub membership_id: Option<Uuid>,
    pub amount: i64,
    pub currency: String,
    pub method: PaymentMethod,
    pub notes: String,
    pub contact_email: Option<String>,
}

/// A guarded status change. Applies only if the row is still at
/// `expected_version` and in one of the `from` states.
#[derive(Debug, Clone)]
pub struct Transition<'a> {
    pub from: &'a [PaymentStatus],
    pub to: PaymentStatus,
    pub expected_version: i64,
    /// Attached only when the row has none yet.
    pub external_ref: Option<&'a str>,
    /// Attached only when the row has none yet.
    pub receipt_code: Option<&'a str>,
    pub failure_reason: Option<&'a str>,
    pub notes: Option<&'a str>,
}

impl<'a> Transition<'a> {
    pub fn new(from: &'a [PaymentStatus], to: PaymentStatus, expected_version: i64) -> Self {
        Self {
            from,
            to,
            expected_version,
            external_ref: None,
            receipt_code: None,
            failure_reason: None,
            notes: None,
        }
    }
}

pub struct SqlitePaymentRepository {
    pool: SqlitePool,
}

impl SqlitePaymentRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_payment(row: PaymentRow) -> Result<Payment> {
        Ok(Payment {
            id: parse_uuid(&row.id)?,
            payer_id: parse_uuid(&row.payer_id)?,
            membership_id: parse_opt_uuid(row.membership_id)?,
            amount: row.amount,
            currency: row.currency,
            method: PaymentMethod::parse(&row.method)
                .ok_or_else(|| AppError::Database(format!("Invalid payment method: {}", row.method)))?,
            status: PaymentStatus::parse(&row.status)
                .ok_or_else(|| AppError::Database(format!("Invalid payment status: {}", row.status)))?,
            external_ref: row.external_ref,
            receipt_code: row.receipt_code,
            failure_reason: row.failure_reason,
            notes: row.notes,
            contact_email: row.contact_email,
            version: row.version,
            completed_at: row.completed_at.map(to_utc),
            created_at: to_utc(row.created_at),
            updated_at: to_utc(row.updated_at),
        })
    }

    pub async fn insert(conn: &mut SqliteConnection, new: NewPayment) -> Result<Payment> {
        let id = Uuid::new_v4();
        let now = Utc::now().naive_utc();

        sqlx::query(
            r#"
            INSERT INTO payments (
                id, payer_id, membership_id, amount, currency, method,
                status, notes, contact_email, version, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)
            "#
        )
        .bind(id.to_string())
        .bind(new.payer_id.to_string())
        .bind(new.membership_id.map(|m| m.to_string()))
        .bind(new.amount)
        .bind(&new.currency)
        .bind(new.method.as_str())
        .bind(PaymentStatus::Pending.as_str())
        .bind(&new.notes)
        .bind(&new.contact_email)
        .bind(now)
        .bind(now)
        .execute(&mut *conn)
        .await?;

        Self::fetch(conn, id).await?.ok_or_else(|| {
            AppError::Database("Failed to retrieve created payment".to_string())
        })
    }

    pub async fn fetch(conn: &mut SqliteConnection, id: Uuid) -> Result<Option<Payment>> {
        let sql = format!("SELECT {} FROM payments WHERE id = ?", PAYMENT_COLUMNS);
        let row = sqlx::query_as::<_, PaymentRow>(&sql)
            .bind(id.to_string())
            .fetch_optional(&mut *conn)
            .await?;

        row.map(Self::row_to_payment).transpose()
    }

    pub async fn fetch_by_external_ref(
        conn: &mut SqliteConnection,
        external_ref: &str,
    ) -> Result<Option<Payment>> {
        let sql = format!("SELECT {} FROM payments WHERE external_ref = ?", PAYMENT_COLUMNS);
        let row = sqlx::query_as::<_, PaymentRow>(&sql)
            .bind(external_ref)
            .fetch_optional(&mut *conn)
            .await?;

        row.map(Self::row_to_payment).transpose()
    }

    /// Returns the id of a different payment already bound to `receipt_code`.
    pub async fn receipt_owner(
        conn: &mut SqliteConnection,
        receipt_code: &str,
        excluding: Uuid,
    ) -> Result<Option<Uuid>> {
        let owner: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT id FROM payments WHERE receipt_code = ? AND id != ?
            UNION
            SELECT payment_id FROM mpesa_transactions WHERE receipt_code = ? AND payment_id != ?
            LIMIT 1
            "#
        )
        .bind(receipt_code)
        .bind(excluding.to_string())
        .bind(receipt_code)
        .bind(excluding.to_string())
        .fetch_optional(&mut *conn)
        .await?;

        owner.map(|(id,)| parse_uuid(&id)).transpose()
    }

    /// Compare-and-swap on (version, status). Returns false when another
    /// writer moved the row first.
    pub async fn transition(
        conn: &mut SqliteConnection,
        id: Uuid,
        transition: &Transition<'_>,
    ) -> Result<bool> {
        if transition.from.is_empty() {
            return Err(AppError::Internal("Transition requires at least one source state".to_string()));
        }

        let placeholders = vec!["?"; transition.from.len()].join(", ");
        let sql = format!(
            r#"
            UPDATE payments
            SET status = ?,
                version = version + 1,
                external_ref = COALESCE(external_ref, ?),
                receipt_code = COALESCE(receipt_code, ?),
                failure_reason = COALESCE(?, failure_reason),
                notes = COALESCE(?, notes),
                completed_at = COALESCE(?, completed_at),
                updated_at = ?
            WHERE id = ? AND version = ? AND status IN ({})
            "#,
            placeholders
        );

        let now = Utc::now().naive_utc();
        let completed_at = (transition.to == PaymentStatus::Completed).then_some(now);

        let mut query = sqlx::query(&sql)
            .bind(transition.to.as_str())
            .bind(transition.external_ref)
            .bind(transition.receipt_code)
            .bind(transition.failure_reason)
            .bind(transition.notes)
            .bind(completed_at)
            .bind(now)
            .bind(id.to_string())
            .bind(transition.expected_version);
        for status in transition.from {
            query = query.bind(status.as_str());
        }

        let result = query.execute(&mut *conn).await?;
        Ok(result.rows_affected() == 1)
    }

    /// Binds the gateway reference to a payment that has none yet. A payment
    /// keeps its first reference for life.
    pub async fn attach_external_ref(
        conn: &mut SqliteConnection,
        id: Uuid,
        external_ref: &str,
        status: PaymentStatus,
    ) -> Result<bool> {
        let now = Utc::now().naive_utc();
        let result = sqlx::query(
            r#"
            UPDATE payments
            SET external_ref = ?, status = ?, version = version + 1, updated_at = ?
            WHERE id = ? AND external_ref IS NULL AND status IN ('Pending', 'Processing')
            "#
        )
        .bind(external_ref)
        .bind(status.as_str())
        .bind(now)
        .bind(id.to_string())
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Takes the SQLite write lock at the start of a transaction so that the
    /// read, compare and write that follow run against a stable snapshot.
    pub async fn lock_for_write(conn: &mut SqliteConnection) -> Result<()> {
        sqlx::query("UPDATE payments SET version = version WHERE 0")
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    pub async fn link_membership(
        conn: &mut SqliteConnection,
        id: Uuid,
        membership_id: Uuid,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE payments SET membership_id = ?, updated_at = ? WHERE id = ? AND membership_id IS NULL"
        )
        .bind(membership_id.to_string())
        .bind(Utc::now().naive_utc())
        .bind(id.to_string())
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Records a receipt learned after completion (e.g. a poll completed the
    /// payment without one and the webhook brings it later). Not a transition.
    pub async fn backfill_receipt(
        conn: &mut SqliteConnection,
        id: Uuid,
        receipt_code: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE payments SET receipt_code = ?, updated_at = ? WHERE id = ? AND receipt_code IS NULL"
        )
        .bind(receipt_code)
        .bind(Utc::now().naive_utc())
        .bind(id.to_string())
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl PaymentRepository for SqlitePaymentRepository {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Payment>> {
        let mut conn = self.pool.acquire().await?;
        Self::fetch(&mut conn, id).await
    }

    async fn find_by_external_ref(&self, external_ref: &str) -> Result<Option<Payment>> {
        let mut conn = self.pool.acquire().await?;
        Self::fetch_by_external_ref(&mut conn, external_ref).await
    }

    async fn find_by_receipt(&self, receipt_code: &str) -> Result<Option<Payment>> {
        let sql = format!("SELECT {} FROM payments WHERE receipt_code = ?", PAYMENT_COLUMNS);
        let row = sqlx::query_as::<_, PaymentRow>(&sql)
            .bind(receipt_code)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::row_to_payment).transpose()
    }

    async fn find_by_payer(&self, payer_id: Uuid) -> Result<Vec<Payment>> {
        let sql = format!(
            "SELECT {} FROM payments WHERE payer_id = ? ORDER BY created_at DESC",
            PAYMENT_COLUMNS
        );
        let rows = sqlx::query_as::<_, PaymentRow>(&sql)
            .bind(payer_id.to_string())
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(Self::row_to_payment)
            .collect()
    }

    async fn list_open_created_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Payment>> {
        let sql = format!(
            r#"
            SELECT {} FROM payments
            WHERE status IN ('Pending', 'Processing') AND created_at < ?
            ORDER BY created_at ASC
            "#,
            PAYMENT_COLUMNS
        );
        let rows = sqlx::query_as::<_, PaymentRow>(&sql)
            .bind(cutoff.naive_utc())
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(Self::row_to_payment)
            .collect()
    }
}
