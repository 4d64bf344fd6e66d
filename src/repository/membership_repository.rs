use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::{FromRow, SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::{
    domain::{CreateMembershipRequest, Membership, MembershipStatus, Referral},
    error::{AppError, Result},
    repository::{parse_opt_uuid, parse_uuid, to_utc, MembershipRepository},
};

const MEMBERSHIP_COLUMNS: &str = r#"
    id, owner_id, plan, status, start_at, end_at, membership_number,
    gifted_by, source_payment_id, created_at, updated_at
"#;

#[derive(FromRow)]
struct MembershipRow {
    id: String,
    owner_id: String,
    plan: String,
    status: String,
    start_at: Option<NaiveDateTime>,
    end_at: Option<NaiveDateTime>,
    membership_number: Option<String>,
    gifted_by: Option<String>,
    source_payment_id: Option<String>,
    created_at: NaiveDateTime,
    updated_at: NaiveDateTime,
}

#[derive(FromRow)]
struct ReferralRow {
    id: String,
    payer_id: String,
    membership_id: String,
    payment_id: String,
    created_at: NaiveDateTime,
}

pub struct SqliteMembershipRepository {
    pool: SqlitePool,
}

impl SqliteMembershipRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_membership(row: MembershipRow) -> Result<Membership> {
        Ok(Membership {
            id: parse_uuid(&row.id)?,
            owner_id: parse_uuid(&row.owner_id)?,
            plan: row.plan,
            status: MembershipStatus::parse(&row.status)
                .ok_or_else(|| AppError::Database(format!("Invalid membership status: {}", row.status)))?,
            start_at: row.start_at.map(to_utc),
            end_at: row.end_at.map(to_utc),
            membership_number: row.membership_number,
            gifted_by: parse_opt_uuid(row.gifted_by)?,
            source_payment_id: parse_opt_uuid(row.source_payment_id)?,
            created_at: to_utc(row.created_at),
            updated_at: to_utc(row.updated_at),
        })
    }

    fn row_to_referral(row: ReferralRow) -> Result<Referral> {
        Ok(Referral {
            id: parse_uuid(&row.id)?,
            payer_id: parse_uuid(&row.payer_id)?,
            membership_id: parse_uuid(&row.membership_id)?,
            payment_id: parse_uuid(&row.payment_id)?,
            created_at: to_utc(row.created_at),
        })
    }

    pub async fn insert(conn: &mut SqliteConnection, request: CreateMembershipRequest) -> Result<Membership> {
        let id = Uuid::new_v4();
        let now = Utc::now().naive_utc();

        sqlx::query(
            r#"
            INSERT INTO memberships (id, owner_id, plan, status, gifted_by, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#
        )
        .bind(id.to_string())
        .bind(request.owner_id.to_string())
        .bind(&request.plan)
        .bind(MembershipStatus::Pending.as_str())
        .bind(request.gifted_by.map(|g| g.to_string()))
        .bind(now)
        .bind(now)
        .execute(&mut *conn)
        .await?;

        Self::fetch(conn, id).await?.ok_or_else(|| {
            AppError::Database("Failed to retrieve created membership".to_string())
        })
    }

    pub async fn fetch(conn: &mut SqliteConnection, id: Uuid) -> Result<Option<Membership>> {
        let sql = format!("SELECT {} FROM memberships WHERE id = ?", MEMBERSHIP_COLUMNS);
        let row = sqlx::query_as::<_, MembershipRow>(&sql)
            .bind(id.to_string())
            .fetch_optional(&mut *conn)
            .await?;

        row.map(Self::row_to_membership).transpose()
    }

    pub async fn number_exists(conn: &mut SqliteConnection, number: &str) -> Result<bool> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM memberships WHERE membership_number = ?"
        )
        .bind(number)
        .fetch_one(&mut *conn)
        .await?;

        Ok(count > 0)
    }

    pub async fn activate(
        conn: &mut SqliteConnection,
        id: Uuid,
        start_at: DateTime<Utc>,
        end_at: DateTime<Utc>,
        membership_number: &str,
        source_payment_id: Uuid,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE memberships
            SET status = ?, start_at = ?, end_at = ?, membership_number = ?,
                source_payment_id = ?, updated_at = ?
            WHERE id = ?
            "#
        )
        .bind(MembershipStatus::Active.as_str())
        .bind(start_at.naive_utc())
        .bind(end_at.naive_utc())
        .bind(membership_number)
        .bind(source_payment_id.to_string())
        .bind(Utc::now().naive_utc())
        .bind(id.to_string())
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn set_status(conn: &mut SqliteConnection, id: Uuid, status: MembershipStatus) -> Result<()> {
        sqlx::query("UPDATE memberships SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(Utc::now().naive_utc())
            .bind(id.to_string())
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Moves a membership from `from` to `to`. Returns false when it was no
    /// longer in `from`.
    pub async fn transition_status(
        conn: &mut SqliteConnection,
        id: Uuid,
        from: MembershipStatus,
        to: MembershipStatus,
    ) -> Result<bool> {
        let result = sqlx::query("UPDATE memberships SET status = ?, updated_at = ? WHERE id = ? AND status = ?")
            .bind(to.as_str())
            .bind(Utc::now().naive_utc())
            .bind(id.to_string())
            .bind(from.as_str())
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Expires every other active membership of `owner_id`.
    pub async fn supersede_active(conn: &mut SqliteConnection, owner_id: Uuid, keep: Uuid) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE memberships
            SET status = ?, updated_at = ?
            WHERE owner_id = ? AND id != ? AND status = ?
            "#
        )
        .bind(MembershipStatus::Expired.as_str())
        .bind(Utc::now().naive_utc())
        .bind(owner_id.to_string())
        .bind(keep.to_string())
        .bind(MembershipStatus::Active.as_str())
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected())
    }

    /// Most recently issued number for an owner, reused across renewals.
    pub async fn latest_number_for_owner(conn: &mut SqliteConnection, owner_id: Uuid) -> Result<Option<String>> {
        let number = sqlx::query_scalar::<_, String>(
            r#"
            SELECT membership_number FROM memberships
            WHERE owner_id = ? AND membership_number IS NOT NULL
            ORDER BY updated_at DESC
            LIMIT 1
            "#
        )
        .bind(owner_id.to_string())
        .fetch_optional(&mut *conn)
        .await?;

        Ok(number)
    }

    /// Latest membership of an owner that has ever been activated.
    pub async fn latest_activated_for_owner(conn: &mut SqliteConnection, owner_id: Uuid) -> Result<Option<Membership>> {
        let sql = format!(
            r#"
            SELECT {} FROM memberships
            WHERE owner_id = ? AND start_at IS NOT NULL
            ORDER BY start_at DESC
            LIMIT 1
            "#,
            MEMBERSHIP_COLUMNS
        );
        let row = sqlx::query_as::<_, MembershipRow>(&sql)
            .bind(owner_id.to_string())
            .fetch_optional(&mut *conn)
            .await?;

        row.map(Self::row_to_membership).transpose()
    }

    /// Inserts a referral once per membership. Returns false on replay.
    pub async fn record_referral(
        conn: &mut SqliteConnection,
        payer_id: Uuid,
        membership_id: Uuid,
        payment_id: Uuid,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO referrals (id, payer_id, membership_id, payment_id, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#
        )
        .bind(Uuid::new_v4().to_string())
        .bind(payer_id.to_string())
        .bind(membership_id.to_string())
        .bind(payment_id.to_string())
        .bind(Utc::now().naive_utc())
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl MembershipRepository for SqliteMembershipRepository {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Membership>> {
        let mut conn = self.pool.acquire().await?;
        Self::fetch(&mut conn, id).await
    }

    async fn list_by_owner(&self, owner_id: Uuid) -> Result<Vec<Membership>> {
        let sql = format!(
            "SELECT {} FROM memberships WHERE owner_id = ? ORDER BY created_at DESC",
            MEMBERSHIP_COLUMNS
        );
        let rows = sqlx::query_as::<_, MembershipRow>(&sql)
            .bind(owner_id.to_string())
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(Self::row_to_membership)
            .collect()
    }

    async fn list_referrals_by_payer(&self, payer_id: Uuid) -> Result<Vec<Referral>> {
        let rows = sqlx::query_as::<_, ReferralRow>(
            r#"
            SELECT id, payer_id, membership_id, payment_id, created_at
            FROM referrals
            WHERE payer_id = ?
            ORDER BY created_at DESC
            "#
        )
        .bind(payer_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(Self::row_to_referral)
            .collect()
    }
}
