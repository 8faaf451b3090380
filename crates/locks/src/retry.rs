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

//! Retry governor: decides whether a failed store operation is retried.
//!
//! Classification is a set lookup on the error code, parsed once from
//! configuration. There is no backoff curve; every retry waits the same
//! fixed delay and the number of retries is bounded.

use crate::config::LockingConfig;
use crate::StoreError;
use std::collections::HashSet;
use std::time::Duration;

/// How a store failure should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Expected to clear on its own (connectivity, deadlock, busy)
    Transient,
    /// Will not clear with a retry (schema, auth, constraint)
    Permanent,
}

/// Outcome of asking the governor what to do after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Run the same operation again after the delay
    RetryAfter(Duration),
    /// Give up and deny
    GiveUp(FailureClass),
}

/// Bounded fixed-delay retry policy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    transient_codes: HashSet<String>,
    max_retries: u32,
    delay: Duration,
}

impl RetryPolicy {
    pub fn new(transient_codes: impl IntoIterator<Item = String>, max_retries: u32, delay: Duration) -> Self {
        Self {
            transient_codes: transient_codes.into_iter().collect(),
            max_retries,
            delay,
        }
    }

    pub fn from_config(config: &LockingConfig) -> Self {
        Self::new(
            config.transient_error_codes.iter().cloned(),
            config.max_retries,
            config.retry_interval(),
        )
    }

    pub fn classify(&self, err: &StoreError) -> FailureClass {
        match &err.code {
            Some(code) if self.transient_codes.contains(code) => FailureClass::Transient,
            _ => FailureClass::Permanent,
        }
    }

    /// Decide what follows failure number `retries_done + 1`.
    pub fn decide(&self, err: &StoreError, retries_done: u32) -> RetryDecision {
        match self.classify(err) {
            FailureClass::Transient if retries_done < self.max_retries => RetryDecision::RetryAfter(self.delay),
            class => RetryDecision::GiveUp(class),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}
