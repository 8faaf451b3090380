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

//! SQLite lease store and lock manager integration tests.
//!
//! These tests verify:
//! - Row-level insert / takeover / extend / delete semantics
//! - Lock acquisition, extension and release through the manager
//! - Competing manager incarnations sharing one table
//! - Lease loss detection and global cleanup
//! - Handle serialization and reattachment

#[cfg(feature = "sqlite-backend")]
mod tests {
    use resource_locks::sql::SqliteLeaseStore;
    use resource_locks::{
        InstanceRegistry, LeaseStore, Lock, LockCallback, LockManager, LockSnapshot, LockingConfig,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::time::{sleep, Duration, Instant};

    #[derive(Default)]
    struct Recorder {
        available: AtomicUsize,
        unavailable: AtomicUsize,
    }

    impl Recorder {
        fn available(&self) -> usize {
            self.available.load(Ordering::SeqCst)
        }

        fn unavailable(&self) -> usize {
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

    /// Create a new SQLite lease store with in-memory database
    async fn create_store() -> Arc<SqliteLeaseStore> {
        Arc::new(SqliteLeaseStore::new("sqlite::memory:").await.unwrap())
    }

    fn create_manager(store: Arc<SqliteLeaseStore>, host: &str) -> LockManager {
        let _ = tracing_subscriber::fmt().with_env_filter("debug").try_init();
        let config = LockingConfig {
            host: host.to_string(),
            retry_secs: 0,
            ..Default::default()
        };
        LockManager::start(config, store, InstanceRegistry::new()).unwrap()
    }

    async fn wait_for(cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            sleep(Duration::from_millis(10)).await;
        }
        cond()
    }

    #[tokio::test]
    async fn test_sqlite_insert_is_exclusive() {
        let store = create_store().await;

        assert!(store.insert("loop-1", "node-1", "inc-1", 30).await.unwrap());
        assert!(!store.insert("loop-1", "node-2", "inc-2", 30).await.unwrap());

        let row = store.get("loop-1").await.unwrap().unwrap();
        assert_eq!(row.host, "node-1");
        assert_eq!(row.owner, "inc-1");
        assert!(row.expiration_time > chrono::Utc::now() + chrono::Duration::seconds(20));
    }

    #[tokio::test]
    async fn test_sqlite_take_over_only_when_expired() {
        let store = create_store().await;

        store.insert("loop-1", "node-1", "inc-1", 30).await.unwrap();
        assert_eq!(store.take_over_expired("loop-1", "node-2", "inc-2", 30).await.unwrap(), 0);

        store.insert("loop-2", "node-1", "inc-1", 0).await.unwrap();
        sleep(Duration::from_millis(5)).await;
        assert_eq!(store.take_over_expired("loop-2", "node-2", "inc-2", 30).await.unwrap(), 1);

        let row = store.get("loop-2").await.unwrap().unwrap();
        assert_eq!(row.host, "node-2");
        assert_eq!(row.owner, "inc-2");
    }

    #[tokio::test]
    async fn test_sqlite_extend_and_delete_require_ownership() {
        let store = create_store().await;
        store.insert("loop-1", "node-1", "inc-1", 30).await.unwrap();

        assert_eq!(store.extend_own("loop-1", "node-1", "inc-2", 300).await.unwrap(), 0);
        assert_eq!(store.extend_own("loop-1", "node-1", "inc-1", 300).await.unwrap(), 1);
        let row = store.get("loop-1").await.unwrap().unwrap();
        assert!(row.expiration_time > chrono::Utc::now() + chrono::Duration::seconds(200));

        assert_eq!(store.delete_own("loop-1", "node-2", "inc-1").await.unwrap(), 0);
        assert_eq!(store.delete_own("loop-1", "node-1", "inc-1").await.unwrap(), 1);
        assert!(store.get("loop-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sqlite_list_owned_skips_expired() {
        let store = create_store().await;
        store.insert("live", "node-1", "inc-1", 30).await.unwrap();
        store.insert("stale", "node-1", "inc-1", 0).await.unwrap();
        store.insert("other", "node-2", "inc-2", 30).await.unwrap();
        sleep(Duration::from_millis(5)).await;

        let owned = store.list_owned("node-1", "inc-1").await.unwrap();
        assert_eq!(owned.len(), 1);
        assert!(owned.contains("live"));

        assert_eq!(store.delete_expired().await.unwrap(), 1);
        assert!(store.get("stale").await.unwrap().is_none());

        // Verify remaining rows directly
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM locks")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_sqlite_acquire_extend_free() {
        let store = create_store().await;
        let manager = create_manager(store.clone(), "node-1");
        let cb = Arc::new(Recorder::default());

        let lock = manager.acquire("loop-1", "policy-a", 30, cb.clone()).unwrap();
        assert!(wait_for(|| lock.is_active()).await);
        assert_eq!(cb.available(), 1);

        let row = store.get("loop-1").await.unwrap().unwrap();
        assert_eq!(row.host, "node-1");
        assert_eq!(row.owner, manager.owner());

        lock.extend(600, cb.clone()).unwrap();
        assert!(wait_for(|| cb.available() == 2).await);
        let row = store.get("loop-1").await.unwrap().unwrap();
        assert!(row.expiration_time > chrono::Utc::now() + chrono::Duration::seconds(500));

        assert!(lock.free());
        assert!(!lock.free());

        let mut released = false;
        for _ in 0..100 {
            if store.get("loop-1").await.unwrap().is_none() {
                released = true;
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert!(released);
        assert_eq!(cb.unavailable(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_sqlite_two_nodes_one_winner() {
        let store = create_store().await;
        let node_1 = create_manager(store.clone(), "node-1");
        let node_2 = create_manager(store.clone(), "node-2");

        let cb_1 = Arc::new(Recorder::default());
        let cb_2 = Arc::new(Recorder::default());
        let lock_1 = node_1.acquire("loop-1", "policy-a", 30, cb_1.clone()).unwrap();
        let lock_2 = node_2.acquire("loop-1", "policy-b", 30, cb_2.clone()).unwrap();

        assert!(wait_for(|| !lock_1.is_waiting() && !lock_2.is_waiting()).await);
        assert!(lock_1.is_active() ^ lock_2.is_active());
        assert_eq!(cb_1.available() + cb_2.available(), 1);
        assert_eq!(cb_1.unavailable() + cb_2.unavailable(), 1);

        let row = store.get("loop-1").await.unwrap().unwrap();
        let winner = if lock_1.is_active() { &node_1 } else { &node_2 };
        assert_eq!(row.owner, winner.owner());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_sqlite_freed_resource_can_be_taken_by_other_node() {
        let store = create_store().await;
        let node_1 = create_manager(store.clone(), "node-1");
        let node_2 = create_manager(store.clone(), "node-2");
        let cb = Arc::new(Recorder::default());

        let lock_1 = node_1.acquire("loop-1", "policy-a", 30, cb.clone()).unwrap();
        assert!(wait_for(|| lock_1.is_active()).await);
        assert!(lock_1.free());

        let mut released = false;
        for _ in 0..100 {
            if store.get("loop-1").await.unwrap().is_none() {
                released = true;
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert!(released);

        let cb_2 = Arc::new(Recorder::default());
        let lock_2 = node_2.acquire("loop-1", "policy-b", 30, cb_2.clone()).unwrap();
        assert!(wait_for(|| lock_2.is_active()).await);
        assert_eq!(cb_2.available(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_sqlite_lease_loss_detected() {
        let store = create_store().await;
        let manager = create_manager(store.clone(), "node-1");
        let cb = Arc::new(Recorder::default());

        let lock = manager.acquire("loop-1", "policy-a", 30, cb.clone()).unwrap();
        assert!(wait_for(|| lock.is_active()).await);

        // Simulate an operator deleting the row
        sqlx::query("DELETE FROM locks WHERE resource_id = 'loop-1'")
            .execute(store.pool())
            .await
            .unwrap();

        assert_eq!(manager.check_expired().await.unwrap(), 1);
        assert!(lock.is_unavailable());
        assert_eq!(cb.unavailable(), 1);
        assert_eq!(manager.check_expired().await.unwrap(), 0);
        assert_eq!(cb.unavailable(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_sqlite_crashed_node_row_is_taken_over() {
        let store = create_store().await;
        store.insert("loop-1", "crashed-node", "dead-incarnation", 0).await.unwrap();
        sleep(Duration::from_millis(5)).await;

        let manager = create_manager(store.clone(), "node-1");
        let cb = Arc::new(Recorder::default());
        let lock = manager.acquire("loop-1", "policy-a", 30, cb.clone()).unwrap();
        assert!(wait_for(|| lock.is_active()).await);

        let row = store.get("loop-1").await.unwrap().unwrap();
        assert_eq!(row.host, "node-1");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_sqlite_purge_expired() {
        let store = create_store().await;
        store.insert("abandoned-1", "crashed-node", "dead", 0).await.unwrap();
        store.insert("abandoned-2", "crashed-node", "dead", 0).await.unwrap();
        let manager = create_manager(store.clone(), "node-1");
        sleep(Duration::from_millis(5)).await;

        assert_eq!(manager.purge_expired().await.unwrap(), 2);
        assert_eq!(manager.purge_expired().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_sqlite_snapshot_reattach() {
        let store = create_store().await;
        let manager = create_manager(store.clone(), "node-1");
        let cb = Arc::new(Recorder::default());
        let lock = manager.acquire("loop-1", "policy-a", 30, cb.clone()).unwrap();
        assert!(wait_for(|| lock.is_active()).await);

        let json = serde_json::to_string(&lock.snapshot()).unwrap();
        let snapshot: LockSnapshot = serde_json::from_str(&json).unwrap();
        let revived = manager.reattach(snapshot, cb.clone());
        assert!(revived.is_active());

        revived.extend(120, cb.clone()).unwrap();
        assert!(wait_for(|| cb.available() == 2).await);
        assert!(lock.is_active());
        assert_eq!(lock.hold_sec(), 120);

        assert!(revived.free());
        assert!(!lock.free());
    }
}
