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

//! Shared worker pool for store operations.
//!
//! Tasks run on the tokio runtime the manager was started in; a semaphore
//! bounds how many of them talk to the store at once, so the pool size is
//! the `max-threads` setting rather than one task per lock.

use crate::{LockError, LockResult};
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

#[derive(Clone)]
pub struct WorkerPool {
    runtime: Handle,
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    /// Create a pool bound to the current tokio runtime.
    pub fn new(size: usize) -> LockResult<Self> {
        if size == 0 {
            return Err(LockError::ConfigError("worker pool size must be > 0".to_string()));
        }
        let runtime = Handle::try_current().map_err(|e| {
            LockError::ConfigError(format!("lock manager must be started inside a tokio runtime: {e}"))
        })?;
        Ok(Self {
            runtime,
            permits: Arc::new(Semaphore::new(size)),
            size,
        })
    }

    pub fn spawn<F>(&self, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.runtime.spawn(task)
    }

    /// Wait for a free worker. `None` once the pool has been closed.
    pub async fn permit(&self) -> Option<OwnedSemaphorePermit> {
        self.permits.clone().acquire_owned().await.ok()
    }

    /// Refuse all further work; tasks waiting for a permit give up.
    pub fn close(&self) {
        self.permits.close();
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    pub fn size(&self) -> usize {
        self.size
    }
}
