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

//! Lease store trait: the shared table every node coordinates through.

use crate::StoreResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;

/// One row of the lease table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRow {
    pub resource_id: String,
    pub host: String,
    pub owner: String,
    pub expiration_time: DateTime<Utc>,
}

/// Atomic row operations against the shared lease table.
///
/// ## Purpose
/// All cross-node coordination happens through these calls. The primary key
/// on `resource_id` and the `WHERE` clauses of each statement are the only
/// arbiter between nodes; implementations must not add any locking that
/// spans processes.
///
/// ## Time
/// Every expiration is computed and compared with the store's own clock, so
/// client clock skew does not move lease boundaries.
///
/// ## Example
/// ```rust,ignore
/// use resource_locks::{LeaseStore, memory::MemoryLeaseStore};
///
/// let store = MemoryLeaseStore::new();
/// assert!(store.insert("R1", "host-a", "owner-1", 30).await?);
/// assert!(!store.insert("R1", "host-b", "owner-2", 30).await?);
/// ```
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Insert a fresh row expiring `hold_sec` from now.
    ///
    /// ## Returns
    /// - `Ok(true)`: row inserted
    /// - `Ok(false)`: a row for `resource_id` already exists
    async fn insert(&self, resource_id: &str, host: &str, owner: &str, hold_sec: u64) -> StoreResult<bool>;

    /// Take over an existing row, but only if it has expired.
    ///
    /// Returns the number of rows updated (0 when the row is still held).
    async fn take_over_expired(&self, resource_id: &str, host: &str, owner: &str, hold_sec: u64) -> StoreResult<u64>;

    /// Push out the expiration of a row this `(host, owner)` already holds.
    ///
    /// Returns the number of rows updated (0 when the row is missing or
    /// belongs to someone else).
    async fn extend_own(&self, resource_id: &str, host: &str, owner: &str, hold_sec: u64) -> StoreResult<u64>;

    /// Delete a row this `(host, owner)` holds. No match is not an error.
    async fn delete_own(&self, resource_id: &str, host: &str, owner: &str) -> StoreResult<u64>;

    /// Delete every expired row regardless of owner.
    async fn delete_expired(&self) -> StoreResult<u64>;

    /// Resource ids held by `(host, owner)` whose lease has not expired.
    async fn list_owned(&self, host: &str, owner: &str) -> StoreResult<HashSet<String>>;

    /// Current row for `resource_id`, expired or not.
    async fn get(&self, resource_id: &str) -> StoreResult<Option<LeaseRow>>;
}
