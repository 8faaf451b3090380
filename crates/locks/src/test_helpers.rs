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

//! Shared fixtures for the crate's unit tests.

use crate::memory::MemoryLeaseStore;
use crate::{LeaseRow, LeaseStore, Lock, LockCallback, LockingConfig, StoreError, StoreResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::time::{Duration, Instant};

/// Callback that counts notifications.
#[derive(Default)]
pub(crate) struct Recorder {
    available: AtomicUsize,
    unavailable: AtomicUsize,
}

impl Recorder {
    pub(crate) fn available(&self) -> usize {
        self.available.load(Ordering::SeqCst)
    }

    pub(crate) fn unavailable(&self) -> usize {
        self.unavailable.load(Ordering::SeqCst)
    }
}

impl LockCallback for Recorder {
    fn lock_available(&self, _lock: &Lock) {
        self.available.fetch_add(1, Ordering::SeqCst);
    }

    fn lock_unavailable(&self, _lock: &Lock) {
        self.unavailable.fetch_add(1, Ordering::SeqCst);
    }
}

/// Memory store that logs calls, can hold row writes at a gate and fails
/// calls with errors queued per operation name.
#[derive(Default)]
pub(crate) struct TestStore {
    inner: MemoryLeaseStore,
    calls: Mutex<Vec<&'static str>>,
    failures: Mutex<HashMap<&'static str, VecDeque<StoreError>>>,
    gate: Option<Arc<Semaphore>>,
}

impl TestStore {
    pub(crate) fn gated() -> (Arc<Self>, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let store = Self {
            gate: Some(gate.clone()),
            ..Default::default()
        };
        (Arc::new(store), gate)
    }

    /// Store whose next `errors.len()` calls to `op` fail.
    pub(crate) fn failing(op: &'static str, errors: Vec<StoreError>) -> Arc<Self> {
        let store = Self::default();
        store.failures.lock().insert(op, errors.into());
        Arc::new(store)
    }

    pub(crate) fn count(&self, op: &str) -> usize {
        self.calls.lock().iter().filter(|c| **c == op).count()
    }

    fn next_failure(&self, op: &'static str) -> StoreResult<()> {
        match self.failures.lock().get_mut(op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn injected(&self, op: &'static str) -> StoreResult<()> {
        self.calls.lock().push(op);
        self.next_failure(op)
    }

    /// Logs the call, then waits at the gate if there is one.
    async fn enter(&self, op: &'static str) -> StoreResult<()> {
        self.calls.lock().push(op);
        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        self.next_failure(op)
    }
}

#[async_trait]
impl LeaseStore for TestStore {
    async fn insert(&self, resource_id: &str, host: &str, owner: &str, hold_sec: u64) -> StoreResult<bool> {
        self.enter("insert").await?;
        self.inner.insert(resource_id, host, owner, hold_sec).await
    }

    async fn take_over_expired(&self, resource_id: &str, host: &str, owner: &str, hold_sec: u64) -> StoreResult<u64> {
        self.injected("take_over_expired")?;
        self.inner.take_over_expired(resource_id, host, owner, hold_sec).await
    }

    async fn extend_own(&self, resource_id: &str, host: &str, owner: &str, hold_sec: u64) -> StoreResult<u64> {
        self.enter("extend_own").await?;
        self.inner.extend_own(resource_id, host, owner, hold_sec).await
    }

    async fn delete_own(&self, resource_id: &str, host: &str, owner: &str) -> StoreResult<u64> {
        self.enter("delete_own").await?;
        self.inner.delete_own(resource_id, host, owner).await
    }

    async fn delete_expired(&self) -> StoreResult<u64> {
        self.injected("delete_expired")?;
        self.inner.delete_expired().await
    }

    async fn list_owned(&self, host: &str, owner: &str) -> StoreResult<HashSet<String>> {
        self.injected("list_owned")?;
        self.inner.list_owned(host, owner).await
    }

    async fn get(&self, resource_id: &str) -> StoreResult<Option<LeaseRow>> {
        self.inner.get(resource_id).await
    }
}

/// Config with immediate retries; scans effectively never fire on their own.
pub(crate) fn config() -> LockingConfig {
    LockingConfig {
        host: "test-host".to_string(),
        retry_secs: 0,
        ..Default::default()
    }
}

/// Poll `cond` until it holds or five seconds pass.
pub(crate) async fn wait_for(cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
