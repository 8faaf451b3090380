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

//! Per-lock request sequencer.
//!
//! Each lock owns one slot. At most one store operation for that lock runs
//! at a time; a request arriving while one runs is parked as the single
//! pending successor, replacing whatever was parked before. A release is
//! never replaced, and once a release has run the slot is closed for good.
//! Nobody waits on the slot: callers either get told to dispatch now or
//! leave their request parked and return.

use parking_lot::Mutex;

/// A store operation queued against one lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOp {
    Acquire,
    Extend,
    Release,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Idle,
    Running { pending: Option<LockOp> },
    Closed,
}

/// Single-slot "next request" holder for one lock.
#[derive(Debug)]
pub struct RequestSequencer {
    slot: Mutex<Slot>,
}

impl Default for RequestSequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestSequencer {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot::Idle),
        }
    }

    /// Offer `op` to the slot.
    ///
    /// Returns `true` when the slot was idle and the caller must dispatch
    /// `op` right away. Returns `false` when `op` was parked behind the
    /// running operation or dropped because the slot is closed.
    pub fn submit(&self, op: LockOp) -> bool {
        let mut slot = self.slot.lock();
        match *slot {
            Slot::Idle => {
                *slot = Slot::Running { pending: None };
                true
            }
            Slot::Running { pending } => {
                let next = match pending {
                    Some(LockOp::Release) => LockOp::Release,
                    _ => op,
                };
                *slot = Slot::Running { pending: Some(next) };
                false
            }
            Slot::Closed => false,
        }
    }

    /// Called by the running operation when it finishes.
    ///
    /// Returns the parked successor, which becomes the running operation,
    /// or `None` when the slot is now empty.
    pub fn complete(&self, finished: LockOp) -> Option<LockOp> {
        let mut slot = self.slot.lock();
        if finished == LockOp::Release {
            *slot = Slot::Closed;
            return None;
        }
        match *slot {
            Slot::Running { pending: Some(next) } => {
                *slot = Slot::Running { pending: None };
                Some(next)
            }
            Slot::Running { pending: None } => {
                *slot = Slot::Idle;
                None
            }
            Slot::Idle | Slot::Closed => None,
        }
    }

    /// Called by a running operation that wants another attempt.
    ///
    /// A successor parked in the meantime wins over the retry and is
    /// returned as the new running operation; `None` means the retry keeps
    /// the slot.
    pub fn take_pending(&self) -> Option<LockOp> {
        let mut slot = self.slot.lock();
        match *slot {
            Slot::Running { pending: Some(next) } => {
                *slot = Slot::Running { pending: None };
                Some(next)
            }
            _ => None,
        }
    }

    /// True while an operation holds the slot.
    pub fn is_busy(&self) -> bool {
        matches!(*self.slot.lock(), Slot::Running { .. })
    }

    /// True once a release has run.
    pub fn is_closed(&self) -> bool {
        matches!(*self.slot.lock(), Slot::Closed)
    }
}
