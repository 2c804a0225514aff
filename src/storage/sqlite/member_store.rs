//! SQLite MemberStore implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_query::{Expr, Order, Query, SqliteQueryBuilder};
use sqlx::{Row, SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::model::{Member, NewMember, Tombstone, ROOT_MEMBER_NO};
use crate::storage::schema::{Counters, Members, Tombstones};
use crate::storage::{MemberStore, Result, StorageError};

use super::{parse_opt_ts, parse_opt_uuid, parse_ts, parse_uuid, begin_immediate, commit, rollback, ts};

const MEMBER_NO_COUNTER: &str = "member_no";

/// SQLite implementation of MemberStore.
pub struct SqliteMemberStore {
    pool: SqlitePool,
    width_cap: u32,
}

impl SqliteMemberStore {
    pub fn new(pool: SqlitePool, width_cap: u32) -> Self {
        Self { pool, width_cap }
    }

    fn row_to_member(row: &sqlx::sqlite::SqliteRow) -> Result<Member> {
        let id: String = row.get("id");
        let sponsor: Option<String> = row.get("sponsor_id");
        let parent: Option<String> = row.get("parent_id");
        let joined_at: String = row.get("joined_at");
        let deadline: Option<String> = row.get("placement_deadline");
        let split: i64 = row.get("is_split_sponsor");
        let active: i64 = row.get("active");
        let kyc: i64 = row.get("kyc_verified");
        let archived: i64 = row.get("archived");

        Ok(Member {
            id: parse_uuid(&id)?,
            member_no: row.get("member_no"),
            referral_code: row.get("referral_code"),
            sponsor_id: parse_opt_uuid(sponsor)?,
            parent_id: parse_opt_uuid(parent)?,
            is_split_sponsor: split != 0,
            package_minor: row.get("package_minor"),
            active: active != 0,
            kyc_verified: kyc != 0,
            joined_at: parse_ts(&joined_at)?,
            placement_deadline: parse_opt_ts(deadline)?,
            archived: archived != 0,
        })
    }

    fn select_all() -> sea_query::SelectStatement {
        Query::select()
            .columns([
                Members::Id,
                Members::MemberNo,
                Members::ReferralCode,
                Members::SponsorId,
                Members::ParentId,
                Members::IsSplitSponsor,
                Members::PackageMinor,
                Members::Active,
                Members::KycVerified,
                Members::JoinedAt,
                Members::PlacementDeadline,
                Members::Archived,
            ])
            .from(Members::Table)
            .to_owned()
    }

    async fn fetch_one(&self, query: &str, what: &'static str, key: String) -> Result<Member> {
        let row = sqlx::query(query).fetch_optional(&self.pool).await?;
        match row {
            Some(row) => Self::row_to_member(&row),
            None => Err(StorageError::NotFound { what, key }),
        }
    }

    async fn count_children_on(conn: &mut SqliteConnection, parent: Uuid) -> Result<u32> {
        let query = Query::select()
            .expr(Expr::col(Members::Id).count())
            .from(Members::Table)
            .and_where(Expr::col(Members::ParentId).eq(parent.to_string()))
            .and_where(Expr::col(Members::Archived).eq(0))
            .to_string(SqliteQueryBuilder);
        let row = sqlx::query(&query).fetch_one(&mut *conn).await?;
        let count: i64 = row.get(0);
        Ok(count as u32)
    }

    async fn get_on(conn: &mut SqliteConnection, id: Uuid) -> Result<Member> {
        let query = Self::select_all()
            .and_where(Expr::col(Members::Id).eq(id.to_string()))
            .to_string(SqliteQueryBuilder);
        let row = sqlx::query(&query).fetch_optional(&mut *conn).await?;
        match row {
            Some(row) => Self::row_to_member(&row),
            None => Err(StorageError::NotFound {
                what: "member",
                key: id.to_string(),
            }),
        }
    }

    async fn root_id_on(conn: &mut SqliteConnection) -> Result<Uuid> {
        let query = Query::select()
            .column(Members::Id)
            .from(Members::Table)
            .and_where(Expr::col(Members::MemberNo).eq(ROOT_MEMBER_NO))
            .to_string(SqliteQueryBuilder);
        let row = sqlx::query(&query).fetch_optional(&mut *conn).await?;
        match row {
            Some(row) => {
                let id: String = row.get("id");
                parse_uuid(&id)
            }
            None => Err(StorageError::NotFound {
                what: "member",
                key: ROOT_MEMBER_NO.to_string(),
            }),
        }
    }
}

#[async_trait]
impl MemberStore for SqliteMemberStore {
    async fn init(&self) -> Result<()> {
        sqlx::raw_sql(crate::storage::schema::CREATE_MEMBERS_TABLES)
            .execute(&self.pool)
            .await?;

        let mut conn = self.pool.acquire().await?;
        // Seed the reserved root once.
        if Self::root_id_on(&mut conn).await.is_err() {
            let query = Query::insert()
                .into_table(Members::Table)
                .columns([
                    Members::Id,
                    Members::MemberNo,
                    Members::ReferralCode,
                    Members::SponsorId,
                    Members::ParentId,
                    Members::IsSplitSponsor,
                    Members::PackageMinor,
                    Members::Active,
                    Members::KycVerified,
                    Members::JoinedAt,
                    Members::PlacementDeadline,
                    Members::Archived,
                ])
                .values_panic([
                    Uuid::new_v4().to_string().into(),
                    ROOT_MEMBER_NO.into(),
                    "root".into(),
                    Option::<String>::None.into(),
                    Option::<String>::None.into(),
                    0i64.into(),
                    0i64.into(),
                    1i64.into(),
                    1i64.into(),
                    ts(Utc::now()).into(),
                    Option::<String>::None.into(),
                    0i64.into(),
                ])
                .to_string(SqliteQueryBuilder);
            sqlx::query(&query).execute(&mut *conn).await?;
        }
        Ok(())
    }

    async fn insert(&self, member: NewMember) -> Result<Member> {
        let mut conn = self.pool.acquire().await?;
        begin_immediate(&mut conn).await?;

        let result: Result<Member> = async {
            if let Some(parent) = member.parent_id {
                let root = Self::root_id_on(&mut conn).await?;
                Self::get_on(&mut conn, parent).await?;
                if parent != root
                    && Self::count_children_on(&mut conn, parent).await? >= self.width_cap
                {
                    return Err(StorageError::CapExceeded { parent });
                }
            }

            let query = Query::insert()
                .into_table(Members::Table)
                .columns([
                    Members::Id,
                    Members::MemberNo,
                    Members::ReferralCode,
                    Members::SponsorId,
                    Members::ParentId,
                    Members::IsSplitSponsor,
                    Members::PackageMinor,
                    Members::Active,
                    Members::KycVerified,
                    Members::JoinedAt,
                    Members::PlacementDeadline,
                    Members::Archived,
                ])
                .values_panic([
                    member.id.to_string().into(),
                    member.member_no.clone().into(),
                    member.referral_code.clone().into(),
                    member.sponsor_id.map(|u| u.to_string()).into(),
                    member.parent_id.map(|u| u.to_string()).into(),
                    i64::from(member.is_split_sponsor).into(),
                    0i64.into(),
                    0i64.into(),
                    0i64.into(),
                    ts(member.joined_at).into(),
                    member.placement_deadline.map(ts).into(),
                    0i64.into(),
                ])
                .to_string(SqliteQueryBuilder);
            sqlx::query(&query).execute(&mut *conn).await?;

            Self::get_on(&mut conn, member.id).await
        }
        .await;

        match result {
            Ok(row) => {
                commit(&mut conn).await?;
                Ok(row)
            }
            Err(e) => {
                rollback(&mut conn).await;
                Err(e)
            }
        }
    }

    async fn get(&self, id: Uuid) -> Result<Member> {
        let query = Self::select_all()
            .and_where(Expr::col(Members::Id).eq(id.to_string()))
            .to_string(SqliteQueryBuilder);
        self.fetch_one(&query, "member", id.to_string()).await
    }

    async fn find_by_referral(&self, code: &str) -> Result<Option<Member>> {
        let query = Self::select_all()
            .and_where(Expr::col(Members::ReferralCode).eq(code))
            .and_where(Expr::col(Members::Archived).eq(0))
            .to_string(SqliteQueryBuilder);
        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        row.map(|r| Self::row_to_member(&r)).transpose()
    }

    async fn find_by_member_no(&self, member_no: &str) -> Result<Option<Member>> {
        let query = Self::select_all()
            .and_where(Expr::col(Members::MemberNo).eq(member_no))
            .to_string(SqliteQueryBuilder);
        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        row.map(|r| Self::row_to_member(&r)).transpose()
    }

    async fn get_root(&self) -> Result<Member> {
        let query = Self::select_all()
            .and_where(Expr::col(Members::MemberNo).eq(ROOT_MEMBER_NO))
            .to_string(SqliteQueryBuilder);
        self.fetch_one(&query, "member", ROOT_MEMBER_NO.to_string())
            .await
    }

    async fn count_children(&self, id: Uuid) -> Result<u32> {
        let mut conn = self.pool.acquire().await?;
        Self::count_children_on(&mut conn, id).await
    }

    async fn list_children(&self, id: Uuid) -> Result<Vec<Member>> {
        let query = Self::select_all()
            .and_where(Expr::col(Members::ParentId).eq(id.to_string()))
            .and_where(Expr::col(Members::Archived).eq(0))
            .order_by(Members::JoinedAt, Order::Asc)
            .to_string(SqliteQueryBuilder);
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_member).collect()
    }

    async fn assign_parent(&self, member: Uuid, parent: Uuid, split: bool) -> Result<Member> {
        let mut conn = self.pool.acquire().await?;
        begin_immediate(&mut conn).await?;

        let result: Result<Member> = async {
            let current = Self::get_on(&mut conn, member).await?;
            if current.parent_id.is_some() {
                return Err(StorageError::StatusConflict {
                    message: format!("member {member} is already placed"),
                });
            }
            let root = Self::root_id_on(&mut conn).await?;
            Self::get_on(&mut conn, parent).await?;
            if parent != root
                && Self::count_children_on(&mut conn, parent).await? >= self.width_cap
            {
                return Err(StorageError::CapExceeded { parent });
            }

            let query = Query::update()
                .table(Members::Table)
                .values([
                    (Members::ParentId, parent.to_string().into()),
                    (Members::IsSplitSponsor, i64::from(split).into()),
                    (Members::PlacementDeadline, Option::<String>::None.into()),
                ])
                .and_where(Expr::col(Members::Id).eq(member.to_string()))
                .to_string(SqliteQueryBuilder);
            sqlx::query(&query).execute(&mut *conn).await?;

            Self::get_on(&mut conn, member).await
        }
        .await;

        match result {
            Ok(row) => {
                commit(&mut conn).await?;
                Ok(row)
            }
            Err(e) => {
                rollback(&mut conn).await;
                Err(e)
            }
        }
    }

    async fn set_placement_deadline(&self, member: Uuid, deadline: DateTime<Utc>) -> Result<()> {
        let query = Query::update()
            .table(Members::Table)
            .values([(Members::PlacementDeadline, ts(deadline).into())])
            .and_where(Expr::col(Members::Id).eq(member.to_string()))
            .to_string(SqliteQueryBuilder);
        let result = sqlx::query(&query).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound {
                what: "member",
                key: member.to_string(),
            });
        }
        Ok(())
    }

    async fn record_funding(&self, member: Uuid, delta_minor: i64) -> Result<Member> {
        let mut conn = self.pool.acquire().await?;
        begin_immediate(&mut conn).await?;

        let result: Result<Member> = async {
            Self::get_on(&mut conn, member).await?;
            let query = Query::update()
                .table(Members::Table)
                .value(
                    Members::PackageMinor,
                    Expr::col(Members::PackageMinor).add(delta_minor),
                )
                .value(Members::Active, 1i64)
                .and_where(Expr::col(Members::Id).eq(member.to_string()))
                .to_string(SqliteQueryBuilder);
            sqlx::query(&query).execute(&mut *conn).await?;
            Self::get_on(&mut conn, member).await
        }
        .await;

        match result {
            Ok(row) => {
                commit(&mut conn).await?;
                Ok(row)
            }
            Err(e) => {
                rollback(&mut conn).await;
                Err(e)
            }
        }
    }

    async fn set_kyc(&self, member: Uuid, verified: bool) -> Result<()> {
        let query = Query::update()
            .table(Members::Table)
            .values([(Members::KycVerified, i64::from(verified).into())])
            .and_where(Expr::col(Members::Id).eq(member.to_string()))
            .to_string(SqliteQueryBuilder);
        let result = sqlx::query(&query).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound {
                what: "member",
                key: member.to_string(),
            });
        }
        Ok(())
    }

    async fn archive(&self, member: Uuid, tombstone: Tombstone) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        begin_immediate(&mut conn).await?;

        let result: Result<()> = async {
            Self::get_on(&mut conn, member).await?;
            let query = Query::update()
                .table(Members::Table)
                .values([(Members::Archived, 1i64.into())])
                .and_where(Expr::col(Members::Id).eq(member.to_string()))
                .to_string(SqliteQueryBuilder);
            sqlx::query(&query).execute(&mut *conn).await?;

            let query = Query::insert()
                .into_table(Tombstones::Table)
                .columns([
                    Tombstones::MemberId,
                    Tombstones::MemberNo,
                    Tombstones::SweptMinor,
                    Tombstones::Actor,
                    Tombstones::ArchivedAt,
                ])
                .values_panic([
                    tombstone.member_id.to_string().into(),
                    tombstone.member_no.clone().into(),
                    tombstone.swept_minor.into(),
                    tombstone.actor.clone().into(),
                    ts(tombstone.archived_at).into(),
                ])
                .to_string(SqliteQueryBuilder);
            sqlx::query(&query).execute(&mut *conn).await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => commit(&mut conn).await,
            Err(e) => {
                rollback(&mut conn).await;
                Err(e)
            }
        }
    }

    async fn next_member_no(&self) -> Result<u64> {
        // Single increment-and-read under the write lock; never two calls.
        let mut conn = self.pool.acquire().await?;
        begin_immediate(&mut conn).await?;

        let result: Result<u64> = async {
            sqlx::query("INSERT OR IGNORE INTO counters (name, value) VALUES (?, 0)")
                .bind(MEMBER_NO_COUNTER)
                .execute(&mut *conn)
                .await?;
            let query = Query::update()
                .table(Counters::Table)
                .value(Counters::Value, Expr::col(Counters::Value).add(1i64))
                .and_where(Expr::col(Counters::Name).eq(MEMBER_NO_COUNTER))
                .to_string(SqliteQueryBuilder);
            sqlx::query(&query).execute(&mut *conn).await?;

            let query = Query::select()
                .column(Counters::Value)
                .from(Counters::Table)
                .and_where(Expr::col(Counters::Name).eq(MEMBER_NO_COUNTER))
                .to_string(SqliteQueryBuilder);
            let row = sqlx::query(&query).fetch_one(&mut *conn).await?;
            let value: i64 = row.get("value");
            Ok(value as u64)
        }
        .await;

        match result {
            Ok(value) => {
                commit(&mut conn).await?;
                Ok(value)
            }
            Err(e) => {
                rollback(&mut conn).await;
                Err(e)
            }
        }
    }

    async fn list_funded(&self) -> Result<Vec<Member>> {
        let query = Self::select_all()
            .and_where(Expr::col(Members::Active).eq(1))
            .and_where(Expr::col(Members::Archived).eq(0))
            .and_where(Expr::col(Members::PackageMinor).gt(0))
            .and_where(Expr::col(Members::MemberNo).ne(ROOT_MEMBER_NO))
            .order_by(Members::JoinedAt, Order::Asc)
            .to_string(SqliteQueryBuilder);
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_member).collect()
    }
}
