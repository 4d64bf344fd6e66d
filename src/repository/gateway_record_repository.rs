use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use sqlx::{FromRow, SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::{
    domain::{GatewaySubRecord, MpesaTransaction, NewSubRecord, Payment, PaymentMethod, SubRecordStatus, WalletOrder},
    error::{AppError, Result},
    repository::{parse_uuid, to_utc, GatewayRecordRepository},
};

#[derive(FromRow)]
struct MpesaRow {
    payment_id: String,
    phone_number: String,
    amount: i64,
    checkout_request_id: Option<String>,
    merchant_request_id: Option<String>,
    receipt_code: Option<String>,
    result_code: Option<String>,
    result_description: Option<String>,
    status: String,
    created_at: NaiveDateTime,
    updated_at: NaiveDateTime,
}

#[derive(FromRow)]
struct WalletRow {
    payment_id: String,
    order_id: Option<String>,
    approval_url: Option<String>,
    capture_id: Option<String>,
    capture_status: String,
    created_at: NaiveDateTime,
    updated_at: NaiveDateTime,
}

/// Outcome fields copied onto a sub-record when its payment settles.
#[derive(Debug, Clone, Default)]
pub struct SubRecordResult<'a> {
    pub receipt_code: Option<&'a str>,
    pub result_code: Option<&'a str>,
    pub result_description: Option<&'a str>,
}

pub struct SqliteGatewayRecordRepository {
    pool: SqlitePool,
}

impl SqliteGatewayRecordRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn parse_status(s: &str) -> Result<SubRecordStatus> {
        SubRecordStatus::parse(s)
            .ok_or_else(|| AppError::Database(format!("Invalid sub-record status: {}", s)))
    }

    fn row_to_mpesa(row: MpesaRow) -> Result<MpesaTransaction> {
        Ok(MpesaTransaction {
            payment_id: parse_uuid(&row.payment_id)?,
            phone_number: row.phone_number,
            amount: row.amount,
            checkout_request_id: row.checkout_request_id,
            merchant_request_id: row.merchant_request_id,
            receipt_code: row.receipt_code,
            result_code: row.result_code,
            result_description: row.result_description,
            status: Self::parse_status(&row.status)?,
            created_at: to_utc(row.created_at),
            updated_at: to_utc(row.updated_at),
        })
    }

    fn row_to_wallet(row: WalletRow) -> Result<WalletOrder> {
        Ok(WalletOrder {
            payment_id: parse_uuid(&row.payment_id)?,
            order_id: row.order_id,
            approval_url: row.approval_url,
            capture_id: row.capture_id,
            capture_status: Self::parse_status(&row.capture_status)?,
            created_at: to_utc(row.created_at),
            updated_at: to_utc(row.updated_at),
        })
    }

    pub async fn insert(
        conn: &mut SqliteConnection,
        payment: &Payment,
        record: &NewSubRecord,
    ) -> Result<()> {
        let now = Utc::now().naive_utc();
        match (payment.method, record) {
            (PaymentMethod::Mpesa, NewSubRecord::Mpesa { phone_number }) => {
                sqlx::query(
                    r#"
                    INSERT INTO mpesa_transactions (
                        payment_id, phone_number, amount, status, created_at, updated_at
                    ) VALUES (?, ?, ?, ?, ?, ?)
                    "#
                )
                .bind(payment.id.to_string())
                .bind(phone_number)
                .bind(payment.amount)
                .bind(SubRecordStatus::Pending.as_str())
                .bind(now)
                .bind(now)
                .execute(&mut *conn)
                .await?;
            }
            (PaymentMethod::PayPal, NewSubRecord::Wallet) => {
                sqlx::query(
                    r#"
                    INSERT INTO wallet_orders (payment_id, capture_status, created_at, updated_at)
                    VALUES (?, ?, ?, ?)
                    "#
                )
                .bind(payment.id.to_string())
                .bind(SubRecordStatus::Pending.as_str())
                .bind(now)
                .bind(now)
                .execute(&mut *conn)
                .await?;
            }
            (method, _) => {
                return Err(AppError::Internal(format!(
                    "Sub-record does not match payment method {:?}",
                    method
                )));
            }
        }
        Ok(())
    }

    pub async fn mark_mpesa_accepted(
        conn: &mut SqliteConnection,
        payment_id: Uuid,
        checkout_request_id: &str,
        merchant_request_id: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE mpesa_transactions
            SET checkout_request_id = COALESCE(checkout_request_id, ?),
                merchant_request_id = COALESCE(merchant_request_id, ?),
                status = CASE WHEN status = 'Pending' THEN 'Accepted' ELSE status END,
                updated_at = ?
            WHERE payment_id = ?
            "#
        )
        .bind(checkout_request_id)
        .bind(merchant_request_id)
        .bind(Utc::now().naive_utc())
        .bind(payment_id.to_string())
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn mark_wallet_created(
        conn: &mut SqliteConnection,
        payment_id: Uuid,
        order_id: &str,
        approval_url: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE wallet_orders
            SET order_id = COALESCE(order_id, ?),
                approval_url = COALESCE(approval_url, ?),
                capture_status = CASE WHEN capture_status = 'Pending' THEN 'Accepted' ELSE capture_status END,
                updated_at = ?
            WHERE payment_id = ?
            "#
        )
        .bind(order_id)
        .bind(approval_url)
        .bind(Utc::now().naive_utc())
        .bind(payment_id.to_string())
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Mirrors a settled payment onto whichever sub-record it owns.
    pub async fn settle(
        conn: &mut SqliteConnection,
        payment: &Payment,
        status: SubRecordStatus,
        result: &SubRecordResult<'_>,
    ) -> Result<()> {
        let now = Utc::now().naive_utc();
        match payment.method {
            PaymentMethod::Mpesa => {
                sqlx::query(
                    r#"
                    UPDATE mpesa_transactions
                    SET status = ?,
                        receipt_code = COALESCE(receipt_code, ?),
                        result_code = COALESCE(?, result_code),
                        result_description = COALESCE(?, result_description),
                        updated_at = ?
                    WHERE payment_id = ?
                    "#
                )
                .bind(status.as_str())
                .bind(result.receipt_code)
                .bind(result.result_code)
                .bind(result.result_description)
                .bind(now)
                .bind(payment.id.to_string())
                .execute(&mut *conn)
                .await?;
            }
            PaymentMethod::PayPal => {
                sqlx::query(
                    r#"
                    UPDATE wallet_orders
                    SET capture_status = ?,
                        capture_id = COALESCE(capture_id, ?),
                        updated_at = ?
                    WHERE payment_id = ?
                    "#
                )
                .bind(status.as_str())
                .bind(result.receipt_code)
                .bind(now)
                .bind(payment.id.to_string())
                .execute(&mut *conn)
                .await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl GatewayRecordRepository for SqliteGatewayRecordRepository {
    async fn find_for_payment(&self, payment: &Payment) -> Result<Option<GatewaySubRecord>> {
        match payment.method {
            PaymentMethod::Mpesa => {
                let row = sqlx::query_as::<_, MpesaRow>(
                    r#"
                    SELECT payment_id, phone_number, amount, checkout_request_id,
                           merchant_request_id, receipt_code, result_code,
                           result_description, status, created_at, updated_at
                    FROM mpesa_transactions
                    WHERE payment_id = ?
                    "#
                )
                .bind(payment.id.to_string())
                .fetch_optional(&self.pool)
                .await?;

                row.map(|r| Self::row_to_mpesa(r).map(GatewaySubRecord::Mpesa)).transpose()
            }
            PaymentMethod::PayPal => {
                let row = sqlx::query_as::<_, WalletRow>(
                    r#"
                    SELECT payment_id, order_id, approval_url, capture_id,
                           capture_status, created_at, updated_at
                    FROM wallet_orders
                    WHERE payment_id = ?
                    "#
                )
                .bind(payment.id.to_string())
                .fetch_optional(&self.pool)
                .await?;

                row.map(|r| Self::row_to_wallet(r).map(GatewaySubRecord::Wallet)).transpose()
            }
        }
    }

    async fn find_mpesa_by_checkout_id(&self, checkout_request_id: &str) -> Result<Option<MpesaTransaction>> {
        let row = sqlx::query_as::<_, MpesaRow>(
            r#"
            SELECT payment_id, phone_number, amount, checkout_request_id,
                   merchant_request_id, receipt_code, result_code,
                   result_description, status, created_at, updated_at
            FROM mpesa_transactions
            WHERE checkout_request_id = ?
            "#
        )
        .bind(checkout_request_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_mpesa).transpose()
    }
}
