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

//! Lock manager: process-wide entry point for acquire/extend/free.
//!
//! ## Design
//! - **Registration**: a concurrent map from resource id to the most recent
//!   lock record. A resource already present is denied in-process without
//!   touching the store.
//! - **Sequencing**: every store operation for a record goes through that
//!   record's [`RequestSequencer`](crate::sequencer::RequestSequencer), so
//!   at most one is in flight per lock and callers never wait.
//! - **Lease protocol**: acquire inserts, falling back to taking over an
//!   expired row; extend updates our own row, falling back to acquire;
//!   release deletes our own row.
//! - **Retries**: transient store errors are retried after a fixed delay
//!   while keeping the sequencer slot; anything else denies the lock.
//! - **Identity**: rows are owned by `(host, incarnation token)`; the token
//!   is new for every started manager, so rows left by a previous run are
//!   never mistaken for ours.

use crate::config::LockingConfig;
use crate::lock::{validate_hold, Lock, LockCallback, LockRecord, LockSnapshot, LockState};
use crate::pool::WorkerPool;
use crate::registry::InstanceRegistry;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::scanner::ExpirationScanner;
use crate::sequencer::LockOp;
use crate::{LeaseStore, LockError, LockResult, StoreResult};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

/// Options for [`LockManager::acquire_with`].
#[derive(Debug, Clone, Copy, Default)]
pub struct AcquireOptions {
    /// Hand back an existing `ACTIVE` lock held by the same owner key
    /// instead of denying the request.
    pub reentrant: bool,
}

/// Shared state of one running manager instance.
pub(crate) struct ManagerCore {
    instance_id: Ulid,
    host: String,
    owner: String,
    store: Arc<dyn LeaseStore>,
    policy: RetryPolicy,
    pool: WorkerPool,
    registry: Arc<InstanceRegistry>,
    resources: DashMap<String, Arc<LockRecord>>,
    /// Bumped on every grant; lets a scan ignore grants that landed after
    /// its query.
    grant_counter: AtomicU64,
}

/// What `acquire` decided while holding the map entry.
enum Admission {
    Enqueue(Arc<LockRecord>),
    Reenter(Arc<LockRecord>),
    Deny,
}

impl ManagerCore {
    pub(crate) fn instance_id(&self) -> Ulid {
        self.instance_id
    }

    pub(crate) fn is_current(&self) -> bool {
        self.registry.is_current(self.instance_id)
    }

    pub(crate) fn pool_handle(&self) -> WorkerPool {
        self.pool.clone()
    }

    fn new_record(&self, resource_id: &str, owner_key: &str, hold_sec: u64, state: LockState, callback: Arc<dyn LockCallback>) -> Arc<LockRecord> {
        LockRecord::new(
            resource_id.to_string(),
            owner_key.to_string(),
            hold_sec,
            state,
            callback,
            self.instance_id,
            self.registry.clone(),
        )
    }

    pub(crate) fn acquire(
        self: &Arc<Self>,
        resource_id: &str,
        owner_key: &str,
        hold_sec: i64,
        callback: Arc<dyn LockCallback>,
        options: AcquireOptions,
    ) -> LockResult<Lock> {
        if resource_id.is_empty() {
            return Err(LockError::InvalidArgument("resource_id must not be empty".to_string()));
        }
        if owner_key.is_empty() {
            return Err(LockError::InvalidArgument("owner_key must not be empty".to_string()));
        }
        let hold_sec = validate_hold(hold_sec)?;

        if !self.is_current() {
            info!(%resource_id, instance_id = %self.instance_id, "acquire on inactive lock manager");
            let lock = Lock::from_record(self.new_record(resource_id, owner_key, hold_sec, LockState::Unavailable, callback.clone()));
            callback.lock_unavailable(&lock);
            return Ok(lock);
        }

        let admission = match self.resources.entry(resource_id.to_string()) {
            Entry::Vacant(entry) => {
                let record = self.new_record(resource_id, owner_key, hold_sec, LockState::Waiting, callback.clone());
                entry.insert(record.clone());
                Admission::Enqueue(record)
            }
            Entry::Occupied(entry) => {
                let existing = entry.get();
                if options.reentrant && existing.owner_key() == owner_key && existing.state() == LockState::Active {
                    Admission::Reenter(existing.clone())
                } else {
                    Admission::Deny
                }
            }
        };

        match admission {
            Admission::Enqueue(record) => {
                debug!(%resource_id, %owner_key, hold_sec, "lock requested");
                self.enqueue(&record, LockOp::Acquire);
                Ok(Lock::from_record(record))
            }
            Admission::Reenter(record) => {
                debug!(%resource_id, %owner_key, "re-entrant acquire of active lock");
                let lock = Lock::from_record(record);
                callback.lock_available(&lock);
                Ok(lock)
            }
            Admission::Deny => {
                info!(%resource_id, %owner_key, "lock denied: resource already claimed in this process");
                let lock = Lock::from_record(self.new_record(resource_id, owner_key, hold_sec, LockState::Unavailable, callback.clone()));
                callback.lock_unavailable(&lock);
                Ok(lock)
            }
        }
    }

    pub(crate) fn extend(self: &Arc<Self>, record: &Arc<LockRecord>, hold_sec: u64, callback: Arc<dyn LockCallback>) {
        match record.begin_extend(hold_sec, callback) {
            Ok(()) => {
                debug!(resource_id = %record.resource_id(), hold_sec, "lock extension requested");
                self.enqueue(record, LockOp::Extend);
            }
            Err(callback) => {
                debug!(resource_id = %record.resource_id(), "extend on unavailable lock");
                callback.lock_unavailable(&Lock::from_record(record.clone()));
            }
        }
    }

    pub(crate) fn free(self: &Arc<Self>, record: &Arc<LockRecord>) -> bool {
        if !record.begin_free() {
            return false;
        }
        self.forget(record);
        debug!(resource_id = %record.resource_id(), "lock freed");
        self.enqueue(record, LockOp::Release);
        true
    }

    /// Drop `record` from the map unless a newer record took its place.
    fn forget(&self, record: &Arc<LockRecord>) {
        self.resources
            .remove_if(record.resource_id(), |_, current| Arc::ptr_eq(current, record));
    }

    fn enqueue(self: &Arc<Self>, record: &Arc<LockRecord>, op: LockOp) {
        if record.sequencer.submit(op) {
            let core = self.clone();
            let record = record.clone();
            self.pool.spawn(async move { core.run(record, op).await });
        }
    }

    /// Drive `op` and every successor parked behind it until the slot
    /// empties.
    async fn run(self: Arc<Self>, record: Arc<LockRecord>, mut op: LockOp) {
        let mut retries = 0;
        loop {
            let outcome = match self.pool.permit().await {
                Some(_permit) => self.execute(&record, op).await,
                None => {
                    debug!(resource_id = %record.resource_id(), ?op, "worker pool closed, abandoning operation");
                    self.give_up(&record, op);
                    Ok(())
                }
            };

            if let Err(err) = outcome {
                match self.policy.decide(&err, retries) {
                    RetryDecision::RetryAfter(delay) => {
                        warn!(resource_id = %record.resource_id(), ?op, retries, error = %err, "transient store error, retrying");
                        tokio::time::sleep(delay).await;
                        match record.sequencer.take_pending() {
                            Some(next) => {
                                op = next;
                                retries = 0;
                            }
                            None => retries += 1,
                        }
                        continue;
                    }
                    RetryDecision::GiveUp(class) => {
                        error!(resource_id = %record.resource_id(), ?op, ?class, retries, error = %err, "store operation failed");
                        self.give_up(&record, op);
                    }
                }
            }

            match record.sequencer.complete(op) {
                Some(next) => {
                    op = next;
                    retries = 0;
                }
                None => break,
            }
        }
    }

    async fn execute(&self, record: &Arc<LockRecord>, op: LockOp) -> StoreResult<()> {
        match op {
            LockOp::Acquire | LockOp::Extend => {
                if record.state() == LockState::Unavailable {
                    // freed while queued; the release parked behind us cleans up
                    return Ok(());
                }
                if !self.is_current() {
                    self.deny(record, "lock manager is no longer active");
                    return Ok(());
                }
                let hold_sec = record.hold_sec();
                let granted = match op {
                    LockOp::Extend => self.extend_lease(record.resource_id(), hold_sec).await?,
                    _ => self.acquire_lease(record.resource_id(), hold_sec).await?,
                };
                if granted {
                    self.grant(record);
                } else {
                    self.deny(record, "resource held by another owner");
                }
                Ok(())
            }
            LockOp::Release => {
                let deleted = self.store.delete_own(record.resource_id(), &self.host, &self.owner).await?;
                debug!(resource_id = %record.resource_id(), deleted, "lease released");
                Ok(())
            }
        }
    }

    /// Insert, or take over an expired row.
    async fn acquire_lease(&self, resource_id: &str, hold_sec: u64) -> StoreResult<bool> {
        if self.store.insert(resource_id, &self.host, &self.owner, hold_sec).await? {
            return Ok(true);
        }
        Ok(self.store.take_over_expired(resource_id, &self.host, &self.owner, hold_sec).await? > 0)
    }

    /// Update our own row; a missing row is treated as a fresh acquire.
    async fn extend_lease(&self, resource_id: &str, hold_sec: u64) -> StoreResult<bool> {
        if self.store.extend_own(resource_id, &self.host, &self.owner, hold_sec).await? > 0 {
            return Ok(true);
        }
        debug!(%resource_id, "no row to extend, re-acquiring");
        self.acquire_lease(resource_id, hold_sec).await
    }

    fn grant(&self, record: &Arc<LockRecord>) {
        let seq = self.grant_counter.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(callback) = record.grant(seq) {
            debug!(resource_id = %record.resource_id(), "lock granted");
            callback.lock_available(&Lock::from_record(record.clone()));
        }
    }

    fn deny(&self, record: &Arc<LockRecord>, reason: &str) {
        if let Some(callback) = record.deny() {
            self.forget(record);
            info!(resource_id = %record.resource_id(), %reason, "lock unavailable");
            callback.lock_unavailable(&Lock::from_record(record.clone()));
        }
    }

    fn give_up(&self, record: &Arc<LockRecord>, op: LockOp) {
        match op {
            LockOp::Acquire | LockOp::Extend => self.deny(record, "store operation failed"),
            LockOp::Release => {
                warn!(resource_id = %record.resource_id(), "could not delete lease row; it will expire on its own");
            }
        }
    }

    /// Self-check: find active locks whose row is gone or expired.
    pub(crate) async fn check_expired(&self) -> StoreResult<usize> {
        let _permit = match self.pool.permit().await {
            Some(permit) => permit,
            None => return Ok(0),
        };
        let cutoff = self.grant_counter.load(Ordering::SeqCst);
        let owned = self.store.list_owned(&self.host, &self.owner).await?;

        let suspects: Vec<Arc<LockRecord>> = self
            .resources
            .iter()
            .filter(|entry| !owned.contains(entry.key()))
            .map(|entry| entry.value().clone())
            .collect();

        let mut expired = 0;
        for record in suspects {
            if let Some(callback) = record.expire(cutoff) {
                self.forget(&record);
                warn!(resource_id = %record.resource_id(), "lease lost");
                callback.lock_unavailable(&Lock::from_record(record.clone()));
                expired += 1;
            }
        }
        debug!(owned = owned.len(), expired, "expiration check complete");
        Ok(expired)
    }

    /// Housekeeping: delete every expired row in the table.
    pub(crate) async fn purge_expired(&self) -> StoreResult<u64> {
        let _permit = match self.pool.permit().await {
            Some(permit) => permit,
            None => return Ok(0),
        };
        let purged = self.store.delete_expired().await?;
        if purged > 0 {
            info!(purged, "purged expired lease rows");
        }
        Ok(purged)
    }

    pub(crate) fn reattach(&self, snapshot: LockSnapshot, callback: Arc<dyn LockCallback>) -> Lock {
        if snapshot.instance_id == self.instance_id && self.is_current() {
            let live = self
                .resources
                .get(&snapshot.resource_id)
                .map(|entry| entry.value().clone())
                .filter(|record| record.owner_key() == snapshot.owner_key && record.state() != LockState::Unavailable);
            if let Some(record) = live {
                record.set_callback(callback);
                return Lock::from_record(record);
            }
        }
        debug!(resource_id = %snapshot.resource_id, "reattached lock has no live counterpart");
        Lock::detached(snapshot, self.registry.clone(), callback)
    }
}

/// Distributed lock manager.
///
/// ## Purpose
/// Grants lease-based locks on named resources, coordinating with other
/// processes only through a shared [`LeaseStore`]. Calls never block on
/// the store: outcomes arrive through [`LockCallback`].
///
/// ## Example
/// ```rust,ignore
/// use resource_locks::{LockManager, LockingConfig, InstanceRegistry, memory::MemoryLeaseStore};
/// use std::sync::Arc;
///
/// let manager = LockManager::start(
///     LockingConfig::default(),
///     Arc::new(MemoryLeaseStore::new()),
///     InstanceRegistry::global(),
/// )?;
/// let lock = manager.acquire("loop-42", "policy-a", 60, callback)?;
/// // ... later
/// lock.extend(120, callback)?;
/// lock.free();
/// ```
pub struct LockManager {
    core: Arc<ManagerCore>,
    scanner: Mutex<Option<ExpirationScanner>>,
    config: LockingConfig,
}

impl LockManager {
    /// Start a manager over `store` and make it the active instance of
    /// `registry`. Must be called inside a tokio runtime.
    pub fn start(config: LockingConfig, store: Arc<dyn LeaseStore>, registry: Arc<InstanceRegistry>) -> LockResult<Self> {
        config.validate()?;
        let pool = WorkerPool::new(config.max_threads)?;

        let core = Arc::new(ManagerCore {
            instance_id: Ulid::new(),
            host: config.host.clone(),
            owner: Ulid::new().to_string(),
            store,
            policy: RetryPolicy::from_config(&config),
            pool,
            registry: registry.clone(),
            resources: DashMap::new(),
            grant_counter: AtomicU64::new(0),
        });

        registry.install(core.clone());
        let scanner = ExpirationScanner::start(core.clone(), &config);

        info!(
            instance_id = %core.instance_id,
            host = %core.host,
            owner = %core.owner,
            max_threads = config.max_threads,
            "lock manager started"
        );

        Ok(Self {
            core,
            scanner: Mutex::new(Some(scanner)),
            config,
        })
    }

    /// Open the store named by `config.db_url` and start a manager on the
    /// process-wide registry.
    #[cfg(any(feature = "sqlite-backend", feature = "postgres-backend"))]
    pub async fn connect(config: LockingConfig) -> LockResult<Self> {
        config.validate()?;
        let store: Arc<dyn LeaseStore> = open_store(&config).await?;
        Self::start(config, store, InstanceRegistry::global())
    }

    /// Stop background scans, deregister this instance and refuse further
    /// store work. Outstanding locks become unavailable on next use; their
    /// rows expire on their own.
    pub fn stop(&self) {
        if let Some(scanner) = self.scanner.lock().take() {
            scanner.stop();
        }
        if self.core.registry.uninstall(self.core.instance_id) {
            info!(instance_id = %self.core.instance_id, "lock manager stopped");
        }
        self.core.pool.close();
    }

    pub fn acquire(&self, resource_id: &str, owner_key: &str, hold_sec: i64, callback: Arc<dyn LockCallback>) -> LockResult<Lock> {
        self.core.acquire(resource_id, owner_key, hold_sec, callback, AcquireOptions::default())
    }

    pub fn acquire_with(
        &self,
        resource_id: &str,
        owner_key: &str,
        hold_sec: i64,
        callback: Arc<dyn LockCallback>,
        options: AcquireOptions,
    ) -> LockResult<Lock> {
        self.core.acquire(resource_id, owner_key, hold_sec, callback, options)
    }

    /// Re-bind a deserialized lock to this manager.
    ///
    /// Returns a handle sharing the live record when this manager created
    /// the lock and still tracks it for the same owner; otherwise an
    /// unavailable handle.
    pub fn reattach(&self, snapshot: LockSnapshot, callback: Arc<dyn LockCallback>) -> Lock {
        self.core.reattach(snapshot, callback)
    }

    /// Run one self-check pass now. Returns how many locks were found lost.
    pub async fn check_expired(&self) -> LockResult<usize> {
        self.ensure_alive()?;
        Ok(self.core.check_expired().await?)
    }

    /// Run one global cleanup pass now. Returns how many rows were deleted.
    pub async fn purge_expired(&self) -> LockResult<u64> {
        self.ensure_alive()?;
        Ok(self.core.purge_expired().await?)
    }

    fn ensure_alive(&self) -> LockResult<()> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(LockError::StaleInstance(self.core.instance_id.to_string()))
        }
    }

    pub fn is_alive(&self) -> bool {
        self.core.is_current()
    }

    pub fn instance_id(&self) -> Ulid {
        self.core.instance_id
    }

    pub fn host(&self) -> &str {
        &self.core.host
    }

    /// Incarnation token written to every row this manager owns.
    pub fn owner(&self) -> &str {
        &self.core.owner
    }

    pub fn config(&self) -> &LockingConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn LeaseStore> {
        &self.core.store
    }

    /// Number of resources this process currently claims.
    pub fn lock_count(&self) -> usize {
        self.core.resources.len()
    }

    pub fn is_locked(&self, resource_id: &str) -> bool {
        self.core.resources.contains_key(resource_id)
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(any(feature = "sqlite-backend", feature = "postgres-backend"))]
async fn open_store(config: &LockingConfig) -> LockResult<Arc<dyn LeaseStore>> {
    if config.db_url.starts_with("postgres") {
        return open_postgres(config).await;
    }
    if config.db_url.starts_with("sqlite") {
        return open_sqlite(config).await;
    }
    Err(LockError::ConfigError(format!("unsupported db-url: {}", config.db_url)))
}

#[cfg(feature = "sqlite-backend")]
async fn open_sqlite(config: &LockingConfig) -> LockResult<Arc<dyn LeaseStore>> {
    let store = crate::sql::SqliteLeaseStore::new(&config.db_url).await?;
    Ok(Arc::new(store))
}

#[cfg(all(feature = "postgres-backend", not(feature = "sqlite-backend")))]
async fn open_sqlite(_config: &LockingConfig) -> LockResult<Arc<dyn LeaseStore>> {
    Err(LockError::ConfigError("built without sqlite-backend".to_string()))
}

#[cfg(feature = "postgres-backend")]
async fn open_postgres(config: &LockingConfig) -> LockResult<Arc<dyn LeaseStore>> {
    let max_connections = u32::try_from(config.max_threads).unwrap_or(u32::MAX);
    let store = crate::sql::PgLeaseStore::new(&config.db_url, max_connections).await?;
    Ok(Arc::new(store))
}

#[cfg(all(feature = "sqlite-backend", not(feature = "postgres-backend")))]
async fn open_postgres(_config: &LockingConfig) -> LockResult<Arc<dyn LeaseStore>> {
    Err(LockError::ConfigError("built without postgres-backend".to_string()))
}
