use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use sqlx::{FromRow, SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::{
    domain::{ProfileCache, ProfileMembershipStatus, ProfileProjection},
    error::{AppError, Result},
    repository::{parse_uuid, to_utc, ProfileRepository},
};

#[derive(FromRow)]
struct ProfileRow {
    owner_id: String,
    membership_status: String,
    membership_expiry: Option<NaiveDateTime>,
    membership_number: Option<String>,
    updated_at: NaiveDateTime,
}

pub struct SqliteProfileRepository {
    pool: SqlitePool,
}

impl SqliteProfileRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_profile(row: ProfileRow) -> Result<ProfileCache> {
        Ok(ProfileCache {
            owner_id: parse_uuid(&row.owner_id)?,
            membership_status: ProfileMembershipStatus::parse(&row.membership_status).ok_or_else(|| {
                AppError::Database(format!("Invalid profile status: {}", row.membership_status))
            })?,
            membership_expiry: row.membership_expiry.map(to_utc),
            membership_number: row.membership_number,
            updated_at: to_utc(row.updated_at),
        })
    }

    /// Overwrites the cached membership fields for an owner.
    pub async fn write_projection(
        conn: &mut SqliteConnection,
        owner_id: Uuid,
        projection: &ProfileProjection,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO profiles (owner_id, membership_status, membership_expiry, membership_number, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(owner_id) DO UPDATE SET
                membership_status = excluded.membership_status,
                membership_expiry = excluded.membership_expiry,
                membership_number = COALESCE(excluded.membership_number, profiles.membership_number),
                updated_at = excluded.updated_at
            "#
        )
        .bind(owner_id.to_string())
        .bind(projection.status.as_str())
        .bind(projection.expiry.map(|dt| dt.naive_utc()))
        .bind(&projection.number)
        .bind(Utc::now().naive_utc())
        .execute(&mut *conn)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ProfileRepository for SqliteProfileRepository {
    async fn find(&self, owner_id: Uuid) -> Result<Option<ProfileCache>> {
        let row = sqlx::query_as::<_, ProfileRow>(
            r#"
            SELECT owner_id, membership_status, membership_expiry, membership_number, updated_at
            FROM profiles
            WHERE owner_id = ?
            "#
        )
        .bind(owner_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_profile).transpose()
    }
}
