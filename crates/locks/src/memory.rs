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

//! In-memory lease store implementation (for testing).

use crate::{LeaseRow, LeaseStore, StoreResult};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

/// In-memory lease store (for testing).
///
/// ## Purpose
/// Provides the lease-table semantics of the SQL backends without a
/// database, for tests and single-process deployments. Several lock
/// managers sharing one instance behave like nodes sharing one table.
///
/// ## Limitations
/// - Not persistent (rows lost on restart)
/// - Not distributed (single process only)
/// - "Server time" is this process's wall clock
#[derive(Clone, Default)]
pub struct MemoryLeaseStore {
    rows: Arc<RwLock<HashMap<String, LeaseRow>>>,
}

impl MemoryLeaseStore {
    /// Create a new in-memory lease store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows, expired or not.
    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }
}

/// Upper bound on a single lease so the timestamp arithmetic cannot overflow.
const MAX_HOLD_SEC: u64 = 100 * 365 * 24 * 3600;

fn expires_in(hold_sec: u64) -> chrono::DateTime<Utc> {
    Utc::now() + Duration::seconds(hold_sec.min(MAX_HOLD_SEC) as i64)
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn insert(&self, resource_id: &str, host: &str, owner: &str, hold_sec: u64) -> StoreResult<bool> {
        let mut rows = self.rows.write().await;
        if rows.contains_key(resource_id) {
            return Ok(false);
        }
        rows.insert(
            resource_id.to_string(),
            LeaseRow {
                resource_id: resource_id.to_string(),
                host: host.to_string(),
                owner: owner.to_string(),
                expiration_time: expires_in(hold_sec),
            },
        );
        Ok(true)
    }

    async fn take_over_expired(&self, resource_id: &str, host: &str, owner: &str, hold_sec: u64) -> StoreResult<u64> {
        let mut rows = self.rows.write().await;
        match rows.get_mut(resource_id) {
            Some(row) if row.expiration_time <= Utc::now() => {
                row.host = host.to_string();
                row.owner = owner.to_string();
                row.expiration_time = expires_in(hold_sec);
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn extend_own(&self, resource_id: &str, host: &str, owner: &str, hold_sec: u64) -> StoreResult<u64> {
        let mut rows = self.rows.write().await;
        match rows.get_mut(resource_id) {
            Some(row) if row.host == host && row.owner == owner => {
                row.expiration_time = expires_in(hold_sec);
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn delete_own(&self, resource_id: &str, host: &str, owner: &str) -> StoreResult<u64> {
        let mut rows = self.rows.write().await;
        let ours = rows
            .get(resource_id)
            .map(|row| row.host == host && row.owner == owner)
            .unwrap_or(false);
        if ours {
            rows.remove(resource_id);
            Ok(1)
        } else {
            Ok(0)
        }
    }

    async fn delete_expired(&self) -> StoreResult<u64> {
        let mut rows = self.rows.write().await;
        let now = Utc::now();
        let before = rows.len();
        rows.retain(|_, row| row.expiration_time >= now);
        Ok((before - rows.len()) as u64)
    }

    async fn list_owned(&self, host: &str, owner: &str) -> StoreResult<HashSet<String>> {
        let rows = self.rows.read().await;
        let now = Utc::now();
        Ok(rows
            .values()
            .filter(|row| row.host == host && row.owner == owner && row.expiration_time > now)
            .map(|row| row.resource_id.clone())
            .collect())
    }

    async fn get(&self, resource_id: &str) -> StoreResult<Option<LeaseRow>> {
        Ok(self.rows.read().await.get(resource_id).cloned())
    }
}
