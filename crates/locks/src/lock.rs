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

//! Lock handles and their in-process records.
//!
//! A [`Lock`] is a cheap clonable handle onto one `LockRecord`: one
//! acquire attempt or grant for a resource. The record carries the lock
//! state machine:
//!
//! ```text
//! WAITING --store grants--> ACTIVE --extend--> WAITING
//! WAITING --denied/failed--> UNAVAILABLE
//! ACTIVE  --free/lease lost--> UNAVAILABLE
//! WAITING --free--> UNAVAILABLE
//! ```
//!
//! `UNAVAILABLE` is terminal. Callbacks are never invoked while the record
//! mutex is held.

use crate::registry::InstanceRegistry;
use crate::sequencer::RequestSequencer;
use crate::{LockError, LockResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::debug;
use ulid::Ulid;

/// State of one lock record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockState {
    /// Request submitted, outcome pending
    Waiting,
    /// Lease currently held
    Active,
    /// Terminal: denied, freed, expired or lost
    Unavailable,
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LockState::Waiting => "WAITING",
            LockState::Active => "ACTIVE",
            LockState::Unavailable => "UNAVAILABLE",
        };
        f.write_str(s)
    }
}

/// Notification sink for lock outcomes.
///
/// Each method fires at most once per state transition. Calls normally come
/// from a worker task; denials detected inside `acquire`/`extend` fire on
/// the caller's thread before the call returns. Implementations should be
/// quick and hand heavy work elsewhere.
pub trait LockCallback: Send + Sync {
    /// The lock became `ACTIVE`.
    fn lock_available(&self, lock: &Lock);

    /// The lock became `UNAVAILABLE`.
    fn lock_unavailable(&self, lock: &Lock);
}

/// Persisted form of a lock: no callback, no manager reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockSnapshot {
    pub resource_id: String,
    pub owner_key: String,
    pub hold_sec: u64,
    pub state: LockState,
    /// Manager instance the lock was created under
    pub instance_id: Ulid,
}

impl LockSnapshot {
    pub fn to_json(&self) -> LockResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> LockResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

struct RecordInner {
    state: LockState,
    hold_sec: u64,
    callback: Arc<dyn LockCallback>,
    /// Manager-wide sequence number of the latest grant
    grant_seq: u64,
}

pub(crate) struct LockRecord {
    resource_id: String,
    owner_key: String,
    instance_id: Ulid,
    registry: Arc<InstanceRegistry>,
    pub(crate) sequencer: RequestSequencer,
    inner: Mutex<RecordInner>,
}

impl LockRecord {
    pub(crate) fn new(
        resource_id: String,
        owner_key: String,
        hold_sec: u64,
        state: LockState,
        callback: Arc<dyn LockCallback>,
        instance_id: Ulid,
        registry: Arc<InstanceRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            resource_id,
            owner_key,
            instance_id,
            registry,
            sequencer: RequestSequencer::new(),
            inner: Mutex::new(RecordInner {
                state,
                hold_sec,
                callback,
                grant_seq: 0,
            }),
        })
    }

    pub(crate) fn resource_id(&self) -> &str {
        &self.resource_id
    }

    pub(crate) fn owner_key(&self) -> &str {
        &self.owner_key
    }

    pub(crate) fn state(&self) -> LockState {
        self.inner.lock().state
    }

    pub(crate) fn hold_sec(&self) -> u64 {
        self.inner.lock().hold_sec
    }

    pub(crate) fn set_callback(&self, callback: Arc<dyn LockCallback>) {
        self.inner.lock().callback = callback;
    }

    /// `WAITING -> ACTIVE`. Returns the callback to notify, or `None` when
    /// the lock was already active or has become unavailable meanwhile.
    pub(crate) fn grant(&self, grant_seq: u64) -> Option<Arc<dyn LockCallback>> {
        let mut inner = self.inner.lock();
        match inner.state {
            LockState::Waiting => {
                inner.state = LockState::Active;
                inner.grant_seq = grant_seq;
                Some(inner.callback.clone())
            }
            LockState::Active => {
                inner.grant_seq = grant_seq;
                None
            }
            LockState::Unavailable => None,
        }
    }

    /// `WAITING | ACTIVE -> UNAVAILABLE`. Returns the callback to notify,
    /// or `None` if the lock was already unavailable.
    pub(crate) fn deny(&self) -> Option<Arc<dyn LockCallback>> {
        let mut inner = self.inner.lock();
        match inner.state {
            LockState::Unavailable => None,
            _ => {
                inner.state = LockState::Unavailable;
                Some(inner.callback.clone())
            }
        }
    }

    /// `ACTIVE -> UNAVAILABLE` for a lease found missing by a scan that
    /// started after grant number `cutoff`. Locks granted later, or with an
    /// extend in flight, are left alone.
    pub(crate) fn expire(&self, cutoff: u64) -> Option<Arc<dyn LockCallback>> {
        let mut inner = self.inner.lock();
        if inner.state == LockState::Active && inner.grant_seq <= cutoff {
            inner.state = LockState::Unavailable;
            Some(inner.callback.clone())
        } else {
            None
        }
    }

    /// `WAITING | ACTIVE -> UNAVAILABLE` on behalf of `free`. Only the
    /// caller that performs the transition gets `true`.
    pub(crate) fn begin_free(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == LockState::Unavailable {
            false
        } else {
            inner.state = LockState::Unavailable;
            true
        }
    }

    /// `ACTIVE | WAITING -> WAITING` with a new hold time and callback.
    /// Hands the callback back if the lock is already unavailable.
    pub(crate) fn begin_extend(
        &self,
        hold_sec: u64,
        callback: Arc<dyn LockCallback>,
    ) -> Result<(), Arc<dyn LockCallback>> {
        let mut inner = self.inner.lock();
        if inner.state == LockState::Unavailable {
            return Err(callback);
        }
        inner.state = LockState::Waiting;
        inner.hold_sec = hold_sec;
        inner.callback = callback;
        Ok(())
    }

    fn snapshot(&self) -> LockSnapshot {
        let inner = self.inner.lock();
        LockSnapshot {
            resource_id: self.resource_id.clone(),
            owner_key: self.owner_key.clone(),
            hold_sec: inner.hold_sec,
            state: inner.state,
            instance_id: self.instance_id,
        }
    }
}

/// Handle onto a lock attempt or grant.
#[derive(Clone)]
pub struct Lock {
    record: Arc<LockRecord>,
}

impl Lock {
    pub(crate) fn from_record(record: Arc<LockRecord>) -> Self {
        Self { record }
    }

    /// An unavailable lock that belongs to no running manager.
    pub(crate) fn detached(
        snapshot: LockSnapshot,
        registry: Arc<InstanceRegistry>,
        callback: Arc<dyn LockCallback>,
    ) -> Self {
        Self::from_record(LockRecord::new(
            snapshot.resource_id,
            snapshot.owner_key,
            snapshot.hold_sec,
            LockState::Unavailable,
            callback,
            snapshot.instance_id,
            registry,
        ))
    }

    pub fn resource_id(&self) -> &str {
        self.record.resource_id()
    }

    pub fn owner_key(&self) -> &str {
        self.record.owner_key()
    }

    pub fn hold_sec(&self) -> u64 {
        self.record.hold_sec()
    }

    pub fn state(&self) -> LockState {
        self.record.state()
    }

    pub fn is_active(&self) -> bool {
        self.state() == LockState::Active
    }

    pub fn is_waiting(&self) -> bool {
        self.state() == LockState::Waiting
    }

    pub fn is_unavailable(&self) -> bool {
        self.state() == LockState::Unavailable
    }

    /// Manager instance this lock was created under.
    pub fn instance_id(&self) -> Ulid {
        self.record.instance_id
    }

    pub fn snapshot(&self) -> LockSnapshot {
        self.record.snapshot()
    }

    /// Ask for the lease to be extended to `hold_sec` seconds from now.
    ///
    /// The lock goes back to `WAITING` and `callback` replaces the current
    /// one; the outcome arrives through it. On a lock that is already
    /// unavailable, or whose manager is gone, `callback` is told
    /// `lock_unavailable` before this returns and nothing is sent to the
    /// store.
    ///
    /// Extending a lock whose acquire is still in flight replaces the
    /// acquire's callback too: the acquire's grant is reported to
    /// `callback` as `lock_available`, before the new hold time has been
    /// written. The extend that follows runs against an already active
    /// lock and does not notify again.
    pub fn extend(&self, hold_sec: i64, callback: Arc<dyn LockCallback>) -> LockResult<()> {
        let hold_sec = validate_hold(hold_sec)?;
        match self.record.registry.resolve(self.record.instance_id) {
            Some(core) => core.extend(&self.record, hold_sec, callback),
            None => {
                debug!(resource_id = %self.resource_id(), "extend on lock whose manager is gone");
                self.record.begin_free();
                callback.lock_unavailable(self);
            }
        }
        Ok(())
    }

    /// Release the lock.
    ///
    /// Returns `true` only for the call that moves the lock to
    /// `UNAVAILABLE`; repeated or concurrent calls get `false`. The store
    /// row is deleted in the background and a failure to delete it is not
    /// reported.
    pub fn free(&self) -> bool {
        match self.record.registry.resolve(self.record.instance_id) {
            Some(core) => core.free(&self.record),
            None => {
                debug!(resource_id = %self.resource_id(), "free on lock whose manager is gone");
                self.record.begin_free();
                false
            }
        }
    }
}

impl fmt::Debug for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lock")
            .field("resource_id", &self.record.resource_id)
            .field("owner_key", &self.record.owner_key)
            .field("state", &self.state())
            .field("hold_sec", &self.hold_sec())
            .finish()
    }
}

pub(crate) fn validate_hold(hold_sec: i64) -> LockResult<u64> {
    u64::try_from(hold_sec)
        .map_err(|_| LockError::InvalidArgument(format!("hold_sec must be >= 0, got {hold_sec}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop;

    impl LockCallback for Nop {
        fn lock_available(&self, _lock: &Lock) {}
        fn lock_unavailable(&self, _lock: &Lock) {}
    }

    fn record(state: LockState) -> Arc<LockRecord> {
        LockRecord::new(
            "R1".to_string(),
            "owner-a".to_string(),
            30,
            state,
            Arc::new(Nop),
            Ulid::new(),
            InstanceRegistry::new(),
        )
    }

    #[test]
    fn test_grant_only_from_waiting() {
        let r = record(LockState::Waiting);
        assert!(r.grant(1).is_some());
        assert_eq!(r.state(), LockState::Active);
        assert!(r.grant(2).is_none());

        let r = record(LockState::Unavailable);
        assert!(r.grant(1).is_none());
        assert_eq!(r.state(), LockState::Unavailable);
    }

    #[test]
    fn test_unavailable_is_terminal() {
        let r = record(LockState::Active);
        assert!(r.deny().is_some());
        assert!(r.deny().is_none());
        assert!(r.begin_extend(10, Arc::new(Nop)).is_err());
        assert!(!r.begin_free());
        assert!(r.grant(5).is_none());
        assert_eq!(r.state(), LockState::Unavailable);
    }

    #[test]
    fn test_free_transitions_once() {
        let r = record(LockState::Waiting);
        assert!(r.begin_free());
        assert!(!r.begin_free());
    }

    #[test]
    fn test_extend_returns_to_waiting() {
        let r = record(LockState::Active);
        assert!(r.begin_extend(90, Arc::new(Nop)).is_ok());
        assert_eq!(r.state(), LockState::Waiting);
        assert_eq!(r.hold_sec(), 90);
    }

    #[test]
    fn test_expire_respects_cutoff() {
        let r = record(LockState::Waiting);
        r.grant(7);
        assert!(r.expire(6).is_none());
        assert_eq!(r.state(), LockState::Active);
        assert!(r.expire(7).is_some());
        assert_eq!(r.state(), LockState::Unavailable);

        let r = record(LockState::Waiting);
        assert!(r.expire(100).is_none());
    }

    #[test]
    fn test_snapshot_serde() {
        let r = record(LockState::Active);
        let snapshot = Lock::from_record(r).snapshot();
        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("\"ACTIVE\""));
        let back = LockSnapshot::from_json(&json).unwrap();
        assert_eq!(back, snapshot);

        assert!(matches!(LockSnapshot::from_json("{\"resource_id\": 7}"), Err(LockError::SerializationError(_))));
    }

    #[test]
    fn test_validate_hold() {
        assert_eq!(validate_hold(0).unwrap(), 0);
        assert_eq!(validate_hold(100).unwrap(), 100);
        assert!(matches!(validate_hold(-1), Err(LockError::InvalidArgument(_))));
    }
}
