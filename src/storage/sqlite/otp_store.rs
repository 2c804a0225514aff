//! SQLite OtpStore implementation.

use async_trait::async_trait;
use sea_query::{Expr, Query, SqliteQueryBuilder};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::model::OtpState;
use crate::storage::schema::OtpStates;
use crate::storage::{OtpStore, Result};

use super::{parse_opt_ts, ts};

/// SQLite implementation of OtpStore.
pub struct SqliteOtpStore {
    pool: SqlitePool,
}

impl SqliteOtpStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_state(owner: Uuid, row: &sqlx::sqlite::SqliteRow) -> Result<OtpState> {
        let expires_at: Option<String> = row.get("expires_at");
        let last_request_at: Option<String> = row.get("last_request_at");
        let locked_until: Option<String> = row.get("locked_until");
        let request_count: i64 = row.get("request_count");
        let failed_attempts: i64 = row.get("failed_attempts");

        Ok(OtpState {
            owner_id: owner,
            code_hash: row.get("code_hash"),
            expires_at: parse_opt_ts(expires_at)?,
            request_count: request_count as u32,
            last_request_at: parse_opt_ts(last_request_at)?,
            failed_attempts: failed_attempts as u32,
            locked_until: parse_opt_ts(locked_until)?,
        })
    }
}

#[async_trait]
impl OtpStore for SqliteOtpStore {
    async fn init(&self) -> Result<()> {
        sqlx::raw_sql(crate::storage::schema::CREATE_OTP_TABLE)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get(&self, owner: Uuid) -> Result<Option<OtpState>> {
        let query = Query::select()
            .columns([
                OtpStates::CodeHash,
                OtpStates::ExpiresAt,
                OtpStates::RequestCount,
                OtpStates::LastRequestAt,
                OtpStates::FailedAttempts,
                OtpStates::LockedUntil,
            ])
            .from(OtpStates::Table)
            .and_where(Expr::col(OtpStates::OwnerId).eq(owner.to_string()))
            .to_string(SqliteQueryBuilder);
        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        row.map(|r| Self::row_to_state(owner, &r)).transpose()
    }

    async fn put(&self, state: &OtpState) -> Result<()> {
        sqlx::query(
            "INSERT INTO otp_states \
             (owner_id, code_hash, expires_at, request_count, last_request_at, \
              failed_attempts, locked_until) \
             VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(owner_id) DO UPDATE SET \
             code_hash = excluded.code_hash, \
             expires_at = excluded.expires_at, \
             request_count = excluded.request_count, \
             last_request_at = excluded.last_request_at, \
             failed_attempts = excluded.failed_attempts, \
             locked_until = excluded.locked_until",
        )
        .bind(state.owner_id.to_string())
        .bind(state.code_hash.clone())
        .bind(state.expires_at.map(ts))
        .bind(state.request_count as i64)
        .bind(state.last_request_at.map(ts))
        .bind(state.failed_attempts as i64)
        .bind(state.locked_until.map(ts))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_code(&self, owner: Uuid) -> Result<()> {
        let query = Query::update()
            .table(OtpStates::Table)
            .values([
                (OtpStates::CodeHash, Option::<String>::None.into()),
                (OtpStates::ExpiresAt, Option::<String>::None.into()),
                (OtpStates::FailedAttempts, 0i64.into()),
            ])
            .and_where(Expr::col(OtpStates::OwnerId).eq(owner.to_string()))
            .to_string(SqliteQueryBuilder);
        sqlx::query(&query).execute(&self.pool).await?;
        Ok(())
    }
}
