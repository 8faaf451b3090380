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

//! Error types for distributed lock operations.

use thiserror::Error;

/// Result type for lock manager operations.
pub type LockResult<T> = Result<T, LockError>;

/// Result type for lease store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced by the lock manager API.
///
/// Store failures during acquire/extend/free never show up here; they are
/// converted into lock state transitions and callbacks. Construction,
/// configuration, manual scans and snapshot encoding return these.
#[derive(Error, Debug)]
pub enum LockError {
    /// Rejected argument (negative hold time, empty resource id, ...)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The manager instance that owns the lock is no longer running
    #[error("Lock manager instance is not active: {0}")]
    StaleInstance(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Lease store failure
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<serde_json::Error> for LockError {
    fn from(err: serde_json::Error) -> Self {
        LockError::SerializationError(err.to_string())
    }
}

/// Broad category of a store failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    /// Primary key already present (insert lost the race)
    UniqueViolation,
    /// Driver or connection level failure
    Connection,
    /// Any other database error
    Database,
}

/// Failure reported by a [`LeaseStore`](crate::LeaseStore).
///
/// `code` carries the vendor code (SQLSTATE for PostgreSQL, the extended
/// result code for SQLite) or one of the synthetic connectivity codes
/// `io`, `pool-timed-out`, `pool-closed`. The retry governor classifies
/// errors by this code alone.
#[derive(Error, Debug, Clone)]
#[error("Store error{}: {message}", .code.as_ref().map(|c| format!(" [{c}]")).unwrap_or_default())]
pub struct StoreError {
    pub kind: StoreErrorKind,
    pub code: Option<String>,
    pub message: String,
}

impl StoreError {
    pub fn new(kind: StoreErrorKind, code: Option<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
        }
    }

    /// Database error with a vendor code.
    pub fn database(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::Database, Some(code.into()), message)
    }

    /// Connectivity failure with a synthetic code.
    pub fn connection(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::Connection, Some(code.into()), message)
    }

    pub fn is_unique_violation(&self) -> bool {
        self.kind == StoreErrorKind::UniqueViolation
    }
}

#[cfg(any(feature = "sqlite-backend", feature = "postgres-backend"))]
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) => {
                let code = db.code().map(|c| c.into_owned());
                let kind = if db.is_unique_violation() {
                    StoreErrorKind::UniqueViolation
                } else {
                    StoreErrorKind::Database
                };
                StoreError::new(kind, code, format!("SQL error: {}", db.message()))
            }
            sqlx::Error::Io(e) => StoreError::connection("io", format!("SQL I/O error: {e}")),
            sqlx::Error::PoolTimedOut => StoreError::connection("pool-timed-out", "SQL pool timed out"),
            sqlx::Error::PoolClosed => StoreError::connection("pool-closed", "SQL pool closed"),
            other => StoreError::new(StoreErrorKind::Database, None, format!("SQL error: {other}")),
        }
    }
}
