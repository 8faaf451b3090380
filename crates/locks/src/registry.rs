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

//! Registry of the running lock manager instance.
//!
//! Lock handles do not point at their manager directly. They remember the
//! instance id they were created under and resolve it through a registry
//! each time they are used, so a handle that outlives its manager (or was
//! deserialized after a restart) finds nothing and fails as unavailable.

use crate::lock::{Lock, LockCallback, LockSnapshot};
use crate::manager::ManagerCore;
use parking_lot::RwLock;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};
use ulid::Ulid;

/// Single-slot holder of the currently active manager.
#[derive(Default)]
pub struct InstanceRegistry {
    current: RwLock<Option<Arc<ManagerCore>>>,
}

static GLOBAL: OnceLock<Arc<InstanceRegistry>> = OnceLock::new();

impl InstanceRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Process-wide registry used when none is injected.
    pub fn global() -> Arc<Self> {
        GLOBAL.get_or_init(InstanceRegistry::new).clone()
    }

    /// Make `core` the active instance, returning the one it replaced.
    pub(crate) fn install(&self, core: Arc<ManagerCore>) -> Option<Arc<ManagerCore>> {
        let previous = self.current.write().replace(core);
        if let Some(prev) = &previous {
            info!(instance_id = %prev.instance_id(), "replacing active lock manager instance");
        }
        previous
    }

    /// Clear the slot, but only if `instance_id` is still the active one.
    pub(crate) fn uninstall(&self, instance_id: Ulid) -> bool {
        let mut current = self.current.write();
        if current.as_ref().map(|c| c.instance_id()) == Some(instance_id) {
            *current = None;
            debug!(%instance_id, "lock manager instance deregistered");
            true
        } else {
            false
        }
    }

    /// The active instance, if it is `instance_id`.
    pub(crate) fn resolve(&self, instance_id: Ulid) -> Option<Arc<ManagerCore>> {
        self.current
            .read()
            .as_ref()
            .filter(|c| c.instance_id() == instance_id)
            .cloned()
    }

    pub(crate) fn current(&self) -> Option<Arc<ManagerCore>> {
        self.current.read().clone()
    }

    pub fn is_current(&self, instance_id: Ulid) -> bool {
        self.resolve(instance_id).is_some()
    }

    /// Id of the active instance.
    pub fn current_instance(&self) -> Option<Ulid> {
        self.current.read().as_ref().map(|c| c.instance_id())
    }

    /// Re-bind a deserialized lock to whichever manager is active now.
    pub fn reattach(self: &Arc<Self>, snapshot: LockSnapshot, callback: Arc<dyn LockCallback>) -> Lock {
        match self.current() {
            Some(core) => core.reattach(snapshot, callback),
            None => Lock::detached(snapshot, self.clone(), callback),
        }
    }
}
