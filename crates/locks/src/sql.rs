// SPDX-License-Identifier: LGPL-2.1-or-later
// Copyright (C) 2025 Shahzad A. Bhatti <bhatti@plexobject.com>
//
// This file is part of PlexSpaces.
//
// PlexSpaces is free software: you can redistribute it and/or modify
// it under the terms of the GNU Lesser General Public License as published by
// the Free Software Foundation, either version 2.1 of the License, or
// (at your option) any later version.
//
// PlexSpaces is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public License
// along with PlexSpaces. If not, see <https://www.gnu.org/licenses/>.

//! SQL-based lease store implementations (SQLite and PostgreSQL).
//!
//! Both backends use a single `locks` table keyed by resource id:
//!
//! - Row-based leases; the primary key decides insert races
//! - Explicit expiration compared against the database clock
//! - Conditional `UPDATE`/`DELETE` statements scoped by `(host, owner)`
//!
//! SQLite stores `expiration_time` as epoch milliseconds computed by SQLite
//! itself; PostgreSQL uses `TIMESTAMPTZ` and `now()`.

use crate::{LeaseRow, LeaseStore, StoreError, StoreResult};
use async_trait::async_trait;
use std::collections::HashSet;
use tracing::instrument;

#[cfg(feature = "sqlite-backend")]
use chrono::{DateTime, Utc};
#[cfg(feature = "sqlite-backend")]
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
#[cfg(feature = "sqlite-backend")]
use std::str::FromStr;

#[cfg(feature = "postgres-backend")]
use sqlx::postgres::{PgPool, PgPoolOptions};

/// Upper bound on a single lease so the timestamp arithmetic cannot overflow.
const MAX_HOLD_SEC: u64 = 100 * 365 * 24 * 3600;

fn clamp_hold(hold_sec: u64) -> i64 {
    hold_sec.min(MAX_HOLD_SEC) as i64
}

/// SQLite-based lease store.
///
/// Schema:
///
/// ```sql
/// CREATE TABLE IF NOT EXISTS locks (
///   resource_id TEXT PRIMARY KEY,
///   host TEXT NOT NULL,
///   owner TEXT NOT NULL,
///   expiration_time INTEGER NOT NULL DEFAULT 0
/// );
/// ```
///
/// `expiration_time` is UNIX epoch milliseconds, always derived from
/// SQLite's `julianday('now')`.
#[cfg(feature = "sqlite-backend")]
#[derive(Clone)]
pub struct SqliteLeaseStore {
    pool: SqlitePool,
}

#[cfg(feature = "sqlite-backend")]
impl SqliteLeaseStore {
    /// Connect and create the schema if needed.
    ///
    /// `database_url` is any valid `sqlx` SQLite URL, e.g.:
    /// - `sqlite::memory:` (in-memory, single shared connection)
    /// - `sqlite://locks.db`
    #[instrument(skip(database_url))]
    pub async fn new(database_url: &str) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

        // An in-memory database lives and dies with its connection, so keep
        // exactly one open for the lifetime of the pool.
        let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        let pool = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new().max_connections(5).connect_with(options).await?
        };

        Self::from_pool(pool).await
    }

    /// Wrap an existing pool, creating the schema if needed.
    pub async fn from_pool(pool: SqlitePool) -> StoreResult<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS locks (
              resource_id TEXT PRIMARY KEY,
              host TEXT NOT NULL,
              owner TEXT NOT NULL,
              expiration_time INTEGER NOT NULL DEFAULT 0
            );
        "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(r#"CREATE INDEX IF NOT EXISTS idx_locks_host_owner ON locks(host, owner);"#)
            .execute(&pool)
            .await?;

        sqlx::query(r#"CREATE INDEX IF NOT EXISTS idx_locks_expiration ON locks(expiration_time);"#)
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    /// Underlying pool, for diagnostics and tests.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[cfg(feature = "sqlite-backend")]
#[async_trait]
impl LeaseStore for SqliteLeaseStore {
    #[instrument(skip(self), fields(resource_id = %resource_id, host = %host))]
    async fn insert(&self, resource_id: &str, host: &str, owner: &str, hold_sec: u64) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"INSERT INTO locks (resource_id, host, owner, expiration_time)
               VALUES (?1, ?2, ?3,
                       CAST((julianday('now') - 2440587.5) * 86400000.0 AS INTEGER) + ?4 * 1000)"#,
        )
        .bind(resource_id)
        .bind(host)
        .bind(owner)
        .bind(clamp_hold(hold_sec))
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => Ok(done.rows_affected() > 0),
            Err(e) => {
                let err = StoreError::from(e);
                if err.is_unique_violation() {
                    Ok(false)
                } else {
                    Err(err)
                }
            }
        }
    }

    #[instrument(skip(self), fields(resource_id = %resource_id, host = %host))]
    async fn take_over_expired(&self, resource_id: &str, host: &str, owner: &str, hold_sec: u64) -> StoreResult<u64> {
        let done = sqlx::query(
            r#"UPDATE locks
                  SET host = ?2,
                      owner = ?3,
                      expiration_time = CAST((julianday('now') - 2440587.5) * 86400000.0 AS INTEGER) + ?4 * 1000
                WHERE resource_id = ?1
                  AND expiration_time <= CAST((julianday('now') - 2440587.5) * 86400000.0 AS INTEGER)"#,
        )
        .bind(resource_id)
        .bind(host)
        .bind(owner)
        .bind(clamp_hold(hold_sec))
        .execute(&self.pool)
        .await?;

        Ok(done.rows_affected())
    }

    #[instrument(skip(self), fields(resource_id = %resource_id, host = %host))]
    async fn extend_own(&self, resource_id: &str, host: &str, owner: &str, hold_sec: u64) -> StoreResult<u64> {
        let done = sqlx::query(
            r#"UPDATE locks
                  SET expiration_time = CAST((julianday('now') - 2440587.5) * 86400000.0 AS INTEGER) + ?4 * 1000
                WHERE resource_id = ?1 AND host = ?2 AND owner = ?3"#,
        )
        .bind(resource_id)
        .bind(host)
        .bind(owner)
        .bind(clamp_hold(hold_sec))
        .execute(&self.pool)
        .await?;

        Ok(done.rows_affected())
    }

    #[instrument(skip(self), fields(resource_id = %resource_id, host = %host))]
    async fn delete_own(&self, resource_id: &str, host: &str, owner: &str) -> StoreResult<u64> {
        let done = sqlx::query(r#"DELETE FROM locks WHERE resource_id = ?1 AND host = ?2 AND owner = ?3"#)
            .bind(resource_id)
            .bind(host)
            .bind(owner)
            .execute(&self.pool)
            .await?;

        Ok(done.rows_affected())
    }

    #[instrument(skip(self))]
    async fn delete_expired(&self) -> StoreResult<u64> {
        let done = sqlx::query(
            r#"DELETE FROM locks
                WHERE expiration_time < CAST((julianday('now') - 2440587.5) * 86400000.0 AS INTEGER)"#,
        )
        .execute(&self.pool)
        .await?;

        Ok(done.rows_affected())
    }

    #[instrument(skip(self, owner), fields(host = %host))]
    async fn list_owned(&self, host: &str, owner: &str) -> StoreResult<HashSet<String>> {
        let rows = sqlx::query(
            r#"SELECT resource_id FROM locks
                WHERE host = ?1 AND owner = ?2
                  AND expiration_time > CAST((julianday('now') - 2440587.5) * 86400000.0 AS INTEGER)"#,
        )
        .bind(host)
        .bind(owner)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| row.try_get::<String, _>("resource_id").map_err(StoreError::from))
            .collect()
    }

    #[instrument(skip(self), fields(resource_id = %resource_id))]
    async fn get(&self, resource_id: &str) -> StoreResult<Option<LeaseRow>> {
        let row = sqlx::query(
            r#"SELECT resource_id, host, owner, expiration_time FROM locks WHERE resource_id = ?1"#,
        )
        .bind(resource_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> Result<LeaseRow, sqlx::Error> {
            let expiration_ms: i64 = row.try_get("expiration_time")?;
            Ok(LeaseRow {
                resource_id: row.try_get("resource_id")?,
                host: row.try_get("host")?,
                owner: row.try_get("owner")?,
                expiration_time: DateTime::<Utc>::from_timestamp_millis(expiration_ms).unwrap_or_default(),
            })
        })
        .transpose()
        .map_err(StoreError::from)
    }
}

/// PostgreSQL-based lease store.
///
/// Same table as [`SqliteLeaseStore`], with `expiration_time TIMESTAMPTZ`
/// compared against `now()`. Suitable for multi-node deployments.
#[cfg(feature = "postgres-backend")]
#[derive(Clone)]
pub struct PgLeaseStore {
    pool: PgPool,
}

#[cfg(feature = "postgres-backend")]
impl PgLeaseStore {
    /// Connect with up to `max_connections` connections and create the
    /// schema if needed.
    #[instrument(skip(database_url))]
    pub async fn new(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Self::from_pool(pool).await
    }

    /// Wrap an existing pool, creating the schema if needed.
    pub async fn from_pool(pool: PgPool) -> StoreResult<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS locks (
              resource_id VARCHAR(128) PRIMARY KEY,
              host VARCHAR(128) NOT NULL,
              owner VARCHAR(128) NOT NULL,
              expiration_time TIMESTAMPTZ NOT NULL DEFAULT 'epoch'
            );
        "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(r#"CREATE INDEX IF NOT EXISTS idx_locks_host_owner ON locks(host, owner);"#)
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[cfg(feature = "postgres-backend")]
#[async_trait]
impl LeaseStore for PgLeaseStore {
    #[instrument(skip(self), fields(resource_id = %resource_id, host = %host))]
    async fn insert(&self, resource_id: &str, host: &str, owner: &str, hold_sec: u64) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"INSERT INTO locks (resource_id, host, owner, expiration_time)
               VALUES ($1, $2, $3, now() + make_interval(secs => $4))"#,
        )
        .bind(resource_id)
        .bind(host)
        .bind(owner)
        .bind(clamp_hold(hold_sec) as f64)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => Ok(done.rows_affected() > 0),
            Err(e) => {
                let err = StoreError::from(e);
                if err.is_unique_violation() {
                    Ok(false)
                } else {
                    Err(err)
                }
            }
        }
    }

    #[instrument(skip(self), fields(resource_id = %resource_id, host = %host))]
    async fn take_over_expired(&self, resource_id: &str, host: &str, owner: &str, hold_sec: u64) -> StoreResult<u64> {
        let done = sqlx::query(
            r#"UPDATE locks
                  SET host = $2, owner = $3, expiration_time = now() + make_interval(secs => $4)
                WHERE resource_id = $1 AND expiration_time <= now()"#,
        )
        .bind(resource_id)
        .bind(host)
        .bind(owner)
        .bind(clamp_hold(hold_sec) as f64)
        .execute(&self.pool)
        .await?;

        Ok(done.rows_affected())
    }

    #[instrument(skip(self), fields(resource_id = %resource_id, host = %host))]
    async fn extend_own(&self, resource_id: &str, host: &str, owner: &str, hold_sec: u64) -> StoreResult<u64> {
        let done = sqlx::query(
            r#"UPDATE locks
                  SET expiration_time = now() + make_interval(secs => $4)
                WHERE resource_id = $1 AND host = $2 AND owner = $3"#,
        )
        .bind(resource_id)
        .bind(host)
        .bind(owner)
        .bind(clamp_hold(hold_sec) as f64)
        .execute(&self.pool)
        .await?;

        Ok(done.rows_affected())
    }

    #[instrument(skip(self), fields(resource_id = %resource_id, host = %host))]
    async fn delete_own(&self, resource_id: &str, host: &str, owner: &str) -> StoreResult<u64> {
        let done = sqlx::query(r#"DELETE FROM locks WHERE resource_id = $1 AND host = $2 AND owner = $3"#)
            .bind(resource_id)
            .bind(host)
            .bind(owner)
            .execute(&self.pool)
            .await?;

        Ok(done.rows_affected())
    }

    #[instrument(skip(self))]
    async fn delete_expired(&self) -> StoreResult<u64> {
        let done = sqlx::query(r#"DELETE FROM locks WHERE expiration_time < now()"#)
            .execute(&self.pool)
            .await?;

        Ok(done.rows_affected())
    }

    #[instrument(skip(self, owner), fields(host = %host))]
    async fn list_owned(&self, host: &str, owner: &str) -> StoreResult<HashSet<String>> {
        let rows = sqlx::query(
            r#"SELECT resource_id FROM locks WHERE host = $1 AND owner = $2 AND expiration_time > now()"#,
        )
        .bind(host)
        .bind(owner)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| row.try_get::<String, _>("resource_id").map_err(StoreError::from))
            .collect()
    }

    #[instrument(skip(self), fields(resource_id = %resource_id))]
    async fn get(&self, resource_id: &str) -> StoreResult<Option<LeaseRow>> {
        let row = sqlx::query(
            r#"SELECT resource_id, host, owner, expiration_time FROM locks WHERE resource_id = $1"#,
        )
        .bind(resource_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> Result<LeaseRow, sqlx::Error> {
            Ok(LeaseRow {
                resource_id: row.try_get("resource_id")?,
                host: row.try_get("host")?,
                owner: row.try_get("owner")?,
                expiration_time: row.try_get("expiration_time")?,
            })
        })
        .transpose()
        .map_err(StoreError::from)
    }
}
