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

//! # Distributed Resource Locks
//!
//! ## Purpose
//! Lease-based mutual exclusion on named resources (for example a control
//! loop id) across equivalent nodes, with a shared SQL table as the only
//! coordination medium. No lock server, no quorum: the table's primary key
//! and expiration timestamps decide every race.
//!
//! ## Architecture
//! - **[`LockManager`]**: process-wide entry point; maps resource ids to lock
//!   records, owns the host identity and the per-start incarnation token
//! - **[`Lock`]**: handle onto one lock record and its state machine
//!   (`WAITING`, `ACTIVE`, `UNAVAILABLE`)
//! - **Request sequencer**: one in-flight store operation per lock; newer
//!   requests supersede parked ones, a free supersedes everything
//! - **[`LeaseStore`]**: insert / take over expired / extend own / delete own
//! - **Retry governor**: transient error codes from configuration get a
//!   bounded number of fixed-delay retries
//! - **Expiration scanner**: periodic purge of expired rows and detection of
//!   leases this node lost without noticing
//! - **[`InstanceRegistry`]**: single slot naming the active manager, so
//!   handles from a stopped or previous instance fail as unavailable
//!
//! ## Backend Support
//!
//! - **InMemory**: HashMap-based (feature: `memory-backend`)
//! - **SQLite**: Persistent, single host (feature: `sqlite-backend`)
//! - **PostgreSQL**: Distributed, multi-node (feature: `postgres-backend`)
//!
//! ## Examples
//!
//! ### Basic Usage
//! ```rust,no_run
//! use resource_locks::{InstanceRegistry, Lock, LockCallback, LockManager, LockingConfig};
//! use resource_locks::memory::MemoryLeaseStore;
//! use std::sync::Arc;
//!
//! struct Logger;
//!
//! impl LockCallback for Logger {
//!     fn lock_available(&self, lock: &Lock) {
//!         println!("got {}", lock.resource_id());
//!     }
//!     fn lock_unavailable(&self, lock: &Lock) {
//!         println!("lost {}", lock.resource_id());
//!     }
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = LockManager::start(
//!     LockingConfig::default(),
//!     Arc::new(MemoryLeaseStore::new()),
//!     InstanceRegistry::global(),
//! )?;
//!
//! // Returns immediately in WAITING; the outcome arrives through the callback
//! let lock = manager.acquire("control-loop-7", "policy-a", 60, Arc::new(Logger))?;
//!
//! // Push the lease out
//! lock.extend(120, Arc::new(Logger))?;
//!
//! // Release
//! assert!(lock.free());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod lock;
pub mod manager;
pub mod pool;
pub mod registry;
pub mod retry;
mod scanner;
pub mod sequencer;
pub mod store;

#[cfg(feature = "memory-backend")]
pub mod memory;

#[cfg(any(feature = "sqlite-backend", feature = "postgres-backend"))]
pub mod sql;

#[cfg(all(test, feature = "memory-backend"))]
pub(crate) mod test_helpers;

pub use config::LockingConfig;
pub use error::{LockError, LockResult, StoreError, StoreErrorKind, StoreResult};
pub use lock::{Lock, LockCallback, LockSnapshot, LockState};
pub use manager::{AcquireOptions, LockManager};
pub use registry::InstanceRegistry;
pub use store::{LeaseRow, LeaseStore};
