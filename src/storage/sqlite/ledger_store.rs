//! SQLite LedgerStore implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_query::{Expr, Order, Query, SqliteQueryBuilder};
use sqlx::{Row, SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::model::{
    BalanceSummary, EntryStatus, EntryType, FundingEvent, FundingStatus, LedgerEntry,
    LineageSnapshot,
};
use crate::storage::schema::{Balances, FundingEvents, Ledger};
use crate::storage::{
    BalanceEffect, LedgerFilter, LedgerStore, Result, StorageError, TransferPosting,
};

use super::{begin_immediate, commit, parse_opt_ts, parse_ts, parse_uuid, rollback, ts};

/// SQLite implementation of LedgerStore.
pub struct SqliteLedgerStore {
    pool: SqlitePool,
}

impl SqliteLedgerStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> Result<LedgerEntry> {
        let id: String = row.get("id");
        let owner: String = row.get("owner_id");
        let entry_type: String = row.get("entry_type");
        let status: String = row.get("status");
        let meta: String = row.get("meta");
        let created_at: String = row.get("created_at");

        Ok(LedgerEntry {
            id: parse_uuid(&id)?,
            owner_id: parse_uuid(&owner)?,
            entry_type: EntryType::parse(&entry_type).ok_or_else(|| {
                StorageError::Backend(format!("unknown entry type {entry_type:?}"))
            })?,
            amount_minor: row.get("amount_minor"),
            status: EntryStatus::parse(&status)
                .ok_or_else(|| StorageError::Backend(format!("unknown status {status:?}")))?,
            actor: row.get("actor"),
            meta: serde_json::from_str(&meta)?,
            created_at: parse_ts(&created_at)?,
        })
    }

    fn row_to_funding(row: &sqlx::sqlite::SqliteRow) -> Result<FundingEvent> {
        let id: String = row.get("id");
        let owner: String = row.get("owner_id");
        let status: String = row.get("status");
        let ledger_entry: Option<String> = row.get("ledger_entry_id");
        let verified_at: Option<String> = row.get("verified_at");
        let lineage: Option<String> = row.get("lineage");
        let created_at: String = row.get("created_at");

        Ok(FundingEvent {
            id: parse_uuid(&id)?,
            order_no: row.get("order_no"),
            owner_id: parse_uuid(&owner)?,
            source_amount_minor: row.get("source_amount_minor"),
            source_currency: row.get("source_currency"),
            settled_minor: row.get("settled_minor"),
            status: FundingStatus::parse(&status)
                .ok_or_else(|| StorageError::Backend(format!("unknown status {status:?}")))?,
            ledger_entry_id: ledger_entry.as_deref().map(parse_uuid).transpose()?,
            verified_at: parse_opt_ts(verified_at)?,
            lineage: lineage
                .as_deref()
                .map(serde_json::from_str::<LineageSnapshot>)
                .transpose()?,
            created_at: parse_ts(&created_at)?,
        })
    }

    fn select_entries() -> sea_query::SelectStatement {
        Query::select()
            .columns([
                Ledger::Id,
                Ledger::OwnerId,
                Ledger::EntryType,
                Ledger::AmountMinor,
                Ledger::Status,
                Ledger::Actor,
                Ledger::Meta,
                Ledger::CreatedAt,
            ])
            .from(Ledger::Table)
            .to_owned()
    }

    fn select_funding() -> sea_query::SelectStatement {
        Query::select()
            .columns([
                FundingEvents::Id,
                FundingEvents::OrderNo,
                FundingEvents::OwnerId,
                FundingEvents::SourceAmountMinor,
                FundingEvents::SourceCurrency,
                FundingEvents::SettledMinor,
                FundingEvents::Status,
                FundingEvents::LedgerEntryId,
                FundingEvents::VerifiedAt,
                FundingEvents::Lineage,
                FundingEvents::CreatedAt,
            ])
            .from(FundingEvents::Table)
            .to_owned()
    }

    async fn insert_entry_on(conn: &mut SqliteConnection, entry: &LedgerEntry) -> Result<()> {
        let query = Query::insert()
            .into_table(Ledger::Table)
            .columns([
                Ledger::Id,
                Ledger::OwnerId,
                Ledger::EntryType,
                Ledger::AmountMinor,
                Ledger::Status,
                Ledger::Actor,
                Ledger::Meta,
                Ledger::CreatedAt,
            ])
            .values_panic([
                entry.id.to_string().into(),
                entry.owner_id.to_string().into(),
                entry.entry_type.as_str().into(),
                entry.amount_minor.into(),
                entry.status.as_str().into(),
                entry.actor.clone().into(),
                serde_json::to_string(&entry.meta)?.into(),
                ts(entry.created_at).into(),
            ])
            .to_string(SqliteQueryBuilder);
        sqlx::query(&query).execute(&mut *conn).await?;
        Ok(())
    }

    /// Upsert the balance row and apply the deltas. Runs inside the caller's
    /// transaction.
    async fn apply_effect_on(
        conn: &mut SqliteConnection,
        owner: Uuid,
        effect: BalanceEffect,
    ) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO balances (owner_id, available_minor, lifetime_minor) \
             VALUES (?, 0, 0)",
        )
        .bind(owner.to_string())
        .execute(&mut *conn)
        .await?;

        if effect == BalanceEffect::NONE {
            return Ok(());
        }

        let query = Query::update()
            .table(Balances::Table)
            .value(
                Balances::AvailableMinor,
                Expr::col(Balances::AvailableMinor).add(effect.available),
            )
            .value(
                Balances::LifetimeMinor,
                Expr::col(Balances::LifetimeMinor).add(effect.lifetime),
            )
            .and_where(Expr::col(Balances::OwnerId).eq(owner.to_string()))
            .to_string(SqliteQueryBuilder);
        sqlx::query(&query).execute(&mut *conn).await?;
        Ok(())
    }

    async fn balance_on(
        conn: &mut SqliteConnection,
        owner: Uuid,
    ) -> Result<Option<BalanceSummary>> {
        let query = Query::select()
            .columns([
                Balances::OwnerId,
                Balances::AvailableMinor,
                Balances::LifetimeMinor,
            ])
            .from(Balances::Table)
            .and_where(Expr::col(Balances::OwnerId).eq(owner.to_string()))
            .to_string(SqliteQueryBuilder);
        let row = sqlx::query(&query).fetch_optional(&mut *conn).await?;
        match row {
            Some(row) => Ok(Some(BalanceSummary {
                owner_id: owner,
                available_minor: row.get("available_minor"),
                lifetime_minor: row.get("lifetime_minor"),
            })),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl LedgerStore for SqliteLedgerStore {
    async fn init(&self) -> Result<()> {
        sqlx::raw_sql(crate::storage::schema::CREATE_LEDGER_TABLES)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn append(&self, entry: &LedgerEntry, effect: BalanceEffect) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        begin_immediate(&mut conn).await?;

        let result: Result<()> = async {
            Self::insert_entry_on(&mut conn, entry).await?;
            Self::apply_effect_on(&mut conn, entry.owner_id, effect).await
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

    async fn update_status(
        &self,
        id: Uuid,
        expected: EntryStatus,
        next: EntryStatus,
        effect: BalanceEffect,
    ) -> Result<LedgerEntry> {
        let mut conn = self.pool.acquire().await?;
        begin_immediate(&mut conn).await?;

        let result: Result<LedgerEntry> = async {
            let query = Query::update()
                .table(Ledger::Table)
                .values([(Ledger::Status, next.as_str().into())])
                .and_where(Expr::col(Ledger::Id).eq(id.to_string()))
                .and_where(Expr::col(Ledger::Status).eq(expected.as_str()))
                .to_string(SqliteQueryBuilder);
            let updated = sqlx::query(&query).execute(&mut *conn).await?;
            if updated.rows_affected() == 0 {
                // Distinguish missing from mismatched for the caller.
                let probe = Self::select_entries()
                    .and_where(Expr::col(Ledger::Id).eq(id.to_string()))
                    .to_string(SqliteQueryBuilder);
                let row = sqlx::query(&probe).fetch_optional(&mut *conn).await?;
                return match row {
                    Some(row) => {
                        let entry = Self::row_to_entry(&row)?;
                        Err(StorageError::StatusConflict {
                            message: format!(
                                "entry {id} is {}, expected {}",
                                entry.status.as_str(),
                                expected.as_str()
                            ),
                        })
                    }
                    None => Err(StorageError::NotFound {
                        what: "ledger entry",
                        key: id.to_string(),
                    }),
                };
            }

            let query = Self::select_entries()
                .and_where(Expr::col(Ledger::Id).eq(id.to_string()))
                .to_string(SqliteQueryBuilder);
            let row = sqlx::query(&query).fetch_one(&mut *conn).await?;
            let entry = Self::row_to_entry(&row)?;
            Self::apply_effect_on(&mut conn, entry.owner_id, effect).await?;
            Ok(entry)
        }
        .await;

        match result {
            Ok(entry) => {
                commit(&mut conn).await?;
                Ok(entry)
            }
            Err(e) => {
                rollback(&mut conn).await;
                Err(e)
            }
        }
    }

    async fn get_entry(&self, id: Uuid) -> Result<LedgerEntry> {
        let query = Self::select_entries()
            .and_where(Expr::col(Ledger::Id).eq(id.to_string()))
            .to_string(SqliteQueryBuilder);
        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        match row {
            Some(row) => Self::row_to_entry(&row),
            None => Err(StorageError::NotFound {
                what: "ledger entry",
                key: id.to_string(),
            }),
        }
    }

    async fn list_for_owner(&self, owner: Uuid, filter: &LedgerFilter) -> Result<Vec<LedgerEntry>> {
        // Statement builders are not Send; render to SQL before awaiting.
        let sql = {
            let mut query = Self::select_entries()
                .and_where(Expr::col(Ledger::OwnerId).eq(owner.to_string()))
                .order_by(Ledger::CreatedAt, Order::Asc)
                .to_owned();
            if let Some(entry_type) = filter.entry_type {
                query.and_where(Expr::col(Ledger::EntryType).eq(entry_type.as_str()));
            }
            if let Some(status) = filter.status {
                query.and_where(Expr::col(Ledger::Status).eq(status.as_str()));
            }
            query.to_string(SqliteQueryBuilder)
        };
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_entry).collect()
    }

    async fn balance(&self, owner: Uuid) -> Result<Option<BalanceSummary>> {
        let mut conn = self.pool.acquire().await?;
        Self::balance_on(&mut conn, owner).await
    }

    async fn ensure_balance(&self, owner: Uuid) -> Result<BalanceSummary> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query(
            "INSERT OR IGNORE INTO balances (owner_id, available_minor, lifetime_minor) \
             VALUES (?, 0, 0)",
        )
        .bind(owner.to_string())
        .execute(&mut *conn)
        .await?;
        Self::balance_on(&mut conn, owner)
            .await?
            .ok_or(StorageError::NotFound {
                what: "balance",
                key: owner.to_string(),
            })
    }

    async fn apply_transfer(
        &self,
        posting: &TransferPosting,
    ) -> Result<(LedgerEntry, LedgerEntry)> {
        let mut conn = self.pool.acquire().await?;
        begin_immediate(&mut conn).await?;

        let result: Result<(LedgerEntry, LedgerEntry)> = async {
            let sender_balance = Self::balance_on(&mut conn, posting.sender)
                .await?
                .ok_or(StorageError::NotFound {
                    what: "balance",
                    key: posting.sender.to_string(),
                })?;
            if sender_balance.available_minor < posting.amount_minor {
                return Err(StorageError::InsufficientFunds {
                    owner: posting.sender,
                });
            }

            let base_meta = |counterpart: Uuid| -> Result<serde_json::Value> {
                let mut meta = posting.meta.clone();
                if let Some(map) = meta.as_object_mut() {
                    map.insert(
                        "transaction_id".to_string(),
                        serde_json::json!(posting.tx_id),
                    );
                    map.insert("counterpart".to_string(), serde_json::json!(counterpart));
                }
                Ok(meta)
            };

            let out_entry = LedgerEntry {
                id: Uuid::new_v4(),
                owner_id: posting.sender,
                entry_type: posting.out_type,
                amount_minor: -posting.amount_minor,
                status: EntryStatus::Posted,
                actor: posting.actor.clone(),
                meta: base_meta(posting.recipient)?,
                created_at: posting.created_at,
            };
            let in_entry = LedgerEntry {
                id: Uuid::new_v4(),
                owner_id: posting.recipient,
                entry_type: posting.in_type,
                amount_minor: posting.amount_minor,
                status: EntryStatus::Posted,
                actor: posting.actor.clone(),
                meta: base_meta(posting.sender)?,
                created_at: posting.created_at,
            };

            Self::insert_entry_on(&mut conn, &out_entry).await?;
            Self::insert_entry_on(&mut conn, &in_entry).await?;
            Self::apply_effect_on(
                &mut conn,
                posting.sender,
                BalanceEffect::available(-posting.amount_minor),
            )
            .await?;
            let credit = if posting.credit_lifetime {
                BalanceEffect::earning(posting.amount_minor)
            } else {
                BalanceEffect::available(posting.amount_minor)
            };
            Self::apply_effect_on(&mut conn, posting.recipient, credit).await?;

            Ok((out_entry, in_entry))
        }
        .await;

        match result {
            Ok(pair) => {
                commit(&mut conn).await?;
                Ok(pair)
            }
            Err(e) => {
                rollback(&mut conn).await;
                Err(e)
            }
        }
    }

    async fn insert_funding(&self, event: &FundingEvent) -> Result<()> {
        let query = Query::insert()
            .into_table(FundingEvents::Table)
            .columns([
                FundingEvents::Id,
                FundingEvents::OrderNo,
                FundingEvents::OwnerId,
                FundingEvents::SourceAmountMinor,
                FundingEvents::SourceCurrency,
                FundingEvents::SettledMinor,
                FundingEvents::Status,
                FundingEvents::LedgerEntryId,
                FundingEvents::VerifiedAt,
                FundingEvents::Lineage,
                FundingEvents::CreatedAt,
            ])
            .values_panic([
                event.id.to_string().into(),
                event.order_no.clone().into(),
                event.owner_id.to_string().into(),
                event.source_amount_minor.into(),
                event.source_currency.clone().into(),
                event.settled_minor.into(),
                event.status.as_str().into(),
                event.ledger_entry_id.map(|u| u.to_string()).into(),
                event.verified_at.map(ts).into(),
                event
                    .lineage
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?
                    .into(),
                ts(event.created_at).into(),
            ])
            .to_string(SqliteQueryBuilder);
        sqlx::query(&query).execute(&self.pool).await?;
        Ok(())
    }

    async fn get_funding(&self, id: Uuid) -> Result<FundingEvent> {
        let query = Self::select_funding()
            .and_where(Expr::col(FundingEvents::Id).eq(id.to_string()))
            .to_string(SqliteQueryBuilder);
        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        match row {
            Some(row) => Self::row_to_funding(&row),
            None => Err(StorageError::NotFound {
                what: "funding event",
                key: id.to_string(),
            }),
        }
    }

    async fn find_funding_by_order(&self, order_no: &str) -> Result<Option<FundingEvent>> {
        let query = Self::select_funding()
            .and_where(Expr::col(FundingEvents::OrderNo).eq(order_no))
            .to_string(SqliteQueryBuilder);
        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        row.map(|r| Self::row_to_funding(&r)).transpose()
    }

    async fn mark_funding_verified(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        lineage: LineageSnapshot,
    ) -> Result<FundingEvent> {
        // Conditional swap: the WHERE clause is the idempotency guard.
        let query = Query::update()
            .table(FundingEvents::Table)
            .values([
                (
                    FundingEvents::Status,
                    FundingStatus::Verified.as_str().into(),
                ),
                (FundingEvents::VerifiedAt, ts(at).into()),
                (
                    FundingEvents::Lineage,
                    serde_json::to_string(&lineage)?.into(),
                ),
            ])
            .and_where(Expr::col(FundingEvents::Id).eq(id.to_string()))
            .and_where(Expr::col(FundingEvents::Status).eq(FundingStatus::Pending.as_str()))
            .to_string(SqliteQueryBuilder);
        let updated = sqlx::query(&query).execute(&self.pool).await?;
        if updated.rows_affected() == 0 {
            let current = self.get_funding(id).await?;
            return Err(StorageError::StatusConflict {
                message: format!("funding event {id} is {}", current.status.as_str()),
            });
        }
        self.get_funding(id).await
    }

    async fn mark_funding_failed(
        &self,
        id: Uuid,
        status: FundingStatus,
    ) -> Result<FundingEvent> {
        let query = Query::update()
            .table(FundingEvents::Table)
            .values([(FundingEvents::Status, status.as_str().into())])
            .and_where(Expr::col(FundingEvents::Id).eq(id.to_string()))
            .and_where(Expr::col(FundingEvents::Status).eq(FundingStatus::Pending.as_str()))
            .to_string(SqliteQueryBuilder);
        let updated = sqlx::query(&query).execute(&self.pool).await?;
        if updated.rows_affected() == 0 {
            let current = self.get_funding(id).await?;
            return Err(StorageError::StatusConflict {
                message: format!("funding event {id} is {}", current.status.as_str()),
            });
        }
        self.get_funding(id).await
    }

    async fn count_verified_funding(&self, owner: Uuid) -> Result<u32> {
        let query = Query::select()
            .expr(Expr::col(FundingEvents::Id).count())
            .from(FundingEvents::Table)
            .and_where(Expr::col(FundingEvents::OwnerId).eq(owner.to_string()))
            .and_where(Expr::col(FundingEvents::Status).eq(FundingStatus::Verified.as_str()))
            .to_string(SqliteQueryBuilder);
        let row = sqlx::query(&query).fetch_one(&self.pool).await?;
        let count: i64 = row.get(0);
        Ok(count as u32)
    }
}
