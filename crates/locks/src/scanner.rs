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

//! Background expiration scanner.
//!
//! ## Design
//! Two independent loops run on the manager's worker pool:
//! - **Cleanup**: deletes every expired row in the table, whoever owns it,
//!   so resources left by crashed nodes do not stay stuck.
//! - **Self-check**: lists the rows this instance still owns and fails every
//!   active lock whose row is gone or expired, so lost leases reach the
//!   owner through `lock_unavailable`.
//!
//! A pass that hits a store error is retried after the shorter
//! `check-retry-seconds` interval instead of waiting a full cycle. Both
//! loops exit once stopped or once their manager is no longer the active
//! instance.

use crate::config::LockingConfig;
use crate::manager::ManagerCore;
use crate::StoreResult;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, warn};

pub(crate) struct ExpirationScanner {
    shutdown_tx: watch::Sender<bool>,
    _handles: Vec<JoinHandle<()>>,
}

/// Timing of one scan loop.
#[derive(Debug, Clone, Copy)]
struct Cadence {
    every: Duration,
    after_error: Duration,
}

impl ExpirationScanner {
    pub(crate) fn start(core: Arc<ManagerCore>, config: &LockingConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let pool = core.pool_handle();

        let cleanup = {
            let core = core.clone();
            let cadence = Cadence {
                every: config.cleanup_interval(),
                after_error: config.check_retry_interval(),
            };
            pool.spawn(scan_loop("cleanup", core, cadence, shutdown_rx.clone(), |core| async move {
                core.purge_expired().await.map(|_| ())
            }))
        };

        let self_check = {
            let cadence = Cadence {
                every: config.expire_check_interval(),
                after_error: config.check_retry_interval(),
            };
            pool.spawn(scan_loop("self-check", core, cadence, shutdown_rx, |core| async move {
                core.check_expired().await.map(|_| ())
            }))
        };

        Self {
            shutdown_tx,
            _handles: vec![cleanup, self_check],
        }
    }

    pub(crate) fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn scan_loop<F, Fut>(
    name: &'static str,
    core: Arc<ManagerCore>,
    cadence: Cadence,
    mut shutdown_rx: watch::Receiver<bool>,
    pass: F,
) where
    F: Fn(Arc<ManagerCore>) -> Fut,
    Fut: Future<Output = StoreResult<()>>,
{
    let mut delay = cadence.every;
    loop {
        if *shutdown_rx.borrow_and_update() {
            break;
        }

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
                continue;
            }
        }

        if *shutdown_rx.borrow() || !core.is_current() {
            break;
        }

        delay = match pass(core.clone()).await {
            Ok(()) => cadence.every,
            Err(e) => {
                warn!(scan = name, error = %e, retry_in = ?cadence.after_error, "scan failed, retrying early");
                cadence.after_error
            }
        };
    }
    debug!(scan = name, "scan loop stopped");
}

#[cfg(all(test, feature = "memory-backend"))]
mod tests {
    use crate::test_helpers::{config, TestStore};
    use crate::{InstanceRegistry, LockManager, LockingConfig, StoreError};
    use tokio::time::{sleep, Duration};

    fn scan_config() -> LockingConfig {
        LockingConfig {
            expire_check_secs: 60,
            cleanup_secs: 60,
            check_retry_secs: 5,
            ..config()
        }
    }

    /// One failure of `op` pulls the next pass of its loop forward to the
    /// retry interval; after that the normal cadence resumes, and nothing
    /// runs once the manager is stopped.
    async fn assert_failed_pass_retries_early(op: &'static str) {
        let store = TestStore::failing(op, vec![StoreError::connection("io", "connection reset")]);
        let manager = LockManager::start(scan_config(), store.clone(), InstanceRegistry::new()).unwrap();

        sleep(Duration::from_secs(61)).await;
        assert_eq!(store.count(op), 1);

        sleep(Duration::from_secs(5)).await;
        assert_eq!(store.count(op), 2);

        sleep(Duration::from_secs(30)).await;
        assert_eq!(store.count(op), 2);

        manager.stop();
        sleep(Duration::from_secs(600)).await;
        assert_eq!(store.count(op), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_self_check_retries_early_after_error() {
        assert_failed_pass_retries_early("list_owned").await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_retries_early_after_error() {
        assert_failed_pass_retries_early("delete_expired").await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_scans_stop_when_instance_replaced() {
        let store = TestStore::failing("list_owned", Vec::new());
        let registry = InstanceRegistry::new();
        let first = LockManager::start(scan_config(), store.clone(), registry.clone()).unwrap();

        sleep(Duration::from_secs(61)).await;
        assert_eq!(store.count("list_owned"), 1);

        let _second = LockManager::start(
            LockingConfig {
                expire_check_secs: 3600,
                ..scan_config()
            },
            store.clone(),
            registry,
        )
        .unwrap();
        assert!(!first.is_alive());

        sleep(Duration::from_secs(300)).await;
        assert_eq!(store.count("list_owned"), 1);
    }
}
