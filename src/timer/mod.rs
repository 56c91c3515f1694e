// Library providing proactive (completion-based) asynchronous I/O event
// dispatch for building scalable network services
//
// SPDX-License-Identifier: Apache-2.0
//
// Written in 2022-2023 by
//     Dr. Maxim Orlovsky <orlovsky@cyphernet.org>
//
// Copyright 2022-2023 Cyphernet DAO, Switzerland
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Timer scheduling for the proactor.
//!
//! A timer queue is a priority-ordered collection of pending timers keyed
//! by absolute expiration time. Three interchangeable containers are
//! provided (an ordered [`list::TimerList`], a binary [`heap::TimerHeap`]
//! and a hashed [`wheel::TimerWheel`]) all sharing the [`TimerQueue`]
//! contract and each guarding its state with its own re-entrant lock, so
//! that expiration upcalls may schedule or cancel further timers on the
//! same thread.

pub mod heap;
pub mod list;
pub(crate) mod thread;
pub mod wheel;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::completion::{Act, Handler, TimerFired};
use crate::port::{CompletionEvent, PostCompletion};
use crate::Error;

/// Integer handle of a scheduled timer, used for cancellation.
///
/// Ids are unique within their queue for the queue's lifetime; a repeating
/// timer keeps its id across firings.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Display)]
#[display("timer#{0}")]
pub struct TimerId(pub(crate) u64);

/// A pending timer held by a [`TimerQueue`].
pub struct TimerNode {
    pub id: TimerId,
    pub handler: Arc<dyn Handler>,
    pub act: Act,
    /// Absolute expiration time.
    pub expiry: Instant,
    /// Zero for a one-shot timer; a repeating timer re-inserts itself at
    /// `expiry + interval` on each firing.
    pub interval: Duration,
}

impl TimerNode {
    fn renew(&self) -> TimerNode {
        TimerNode {
            id: self.id,
            handler: self.handler.clone(),
            act: self.act.clone(),
            expiry: self.expiry + self.interval,
            interval: self.interval,
        }
    }
}

/// Outcome of [`TimerQueue::schedule`].
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct Scheduled {
    /// Id assigned to the new timer.
    pub id: TimerId,
    /// Whether the new timer became the earliest deadline of the queue, in
    /// which case the timer thread must be woken to re-read its wait.
    pub earliest: bool,
}

/// Contract shared by all timer queue containers.
///
/// Implementations serialize access internally with a re-entrant lock:
/// every method may be called from any thread, and [`Self::expire`] holds
/// the lock while invoking the upcall so that same-thread re-entry
/// (cascading scheduling, cancellation from an upcall) is permitted rather
/// than deadlocking.
pub trait TimerQueue: Send + Sync {
    /// Inserts a timer expiring at the given absolute time.
    ///
    /// The insert and the became-earliest check are performed atomically
    /// under the queue lock.
    fn schedule(
        &self,
        handler: Arc<dyn Handler>,
        act: Act,
        expiry: Instant,
        interval: Duration,
    ) -> Scheduled;

    /// Removes the timer with the given id. Returns whether a pending node
    /// was removed; a timer whose expiration has already been handed to the
    /// upcall is not suppressed.
    fn cancel(&self, id: TimerId) -> bool;

    /// Removes every pending timer registered for clones of the given
    /// handler. Returns the number of nodes removed.
    fn cancel_handler(&self, handler: &Arc<dyn Handler>) -> usize;

    /// The minimum expiration time over all pending nodes, or `None` when
    /// the queue is empty.
    fn earliest_time(&self) -> Option<Instant>;

    fn is_empty(&self) -> bool;

    fn len(&self) -> usize;

    /// Pops every node whose expiration is at or before now, re-inserts
    /// repeating nodes at `expiry + interval`, and invokes the upcall once
    /// per popped node. Returns the number of dispatched expirations.
    fn expire(&self) -> usize;

    /// The upcall functor through which expirations are turned into
    /// synthetic completions. Bound to its proactor on installation.
    fn upcall(&self) -> &TimeoutUpcall;
}

/// Functor converting a timer expiration into a synthetic completion packet
/// enqueued into the owning proactor's completion queue.
///
/// A given upcall is bound to at most one proactor for its whole lifetime;
/// the binding is established when the queue is installed.
#[derive(Default)]
pub struct TimeoutUpcall {
    port: Mutex<Option<Arc<dyn PostCompletion>>>,
}

impl TimeoutUpcall {
    pub fn new() -> Self { default!() }

    /// Wires the upcall to the completion queue of its proactor.
    ///
    /// Errors with [`Error::AlreadyBound`] when a binding already exists:
    /// an upcall serves one (and only one) proactor.
    pub fn bind(&self, port: Arc<dyn PostCompletion>) -> Result<(), Error> {
        let mut slot = self.port.lock().expect("timeout upcall poisoned");
        if slot.is_some() {
            return Err(Error::AlreadyBound);
        }
        *slot = Some(port);
        Ok(())
    }

    pub fn is_bound(&self) -> bool {
        self.port.lock().expect("timeout upcall poisoned").is_some()
    }

    /// Allocates a [`TimerFired`] packet for the expired node and posts it
    /// as a synthetic completion (zero bytes, null key).
    ///
    /// On a post failure the packet is deallocated and the error returned;
    /// the caller keeps expiring the remaining due nodes.
    pub fn fire(&self, handler: Arc<dyn Handler>, act: Act, time: Instant) -> Result<(), Error> {
        let port = self.port.lock().expect("timeout upcall poisoned").clone();
        let Some(port) = port else {
            #[cfg(feature = "log")]
            log::error!(target: "timers", "timeout upcall has no completion queue to post to");
            return Err(Error::Unbound);
        };
        let packet = Box::new(TimerFired::new(handler, act, time));
        port.post(CompletionEvent::synthetic(packet)).map_err(|err| {
            #[cfg(feature = "log")]
            log::error!(target: "timers", "failed to post timer expiration: {err}");
            err
        })
    }
}
