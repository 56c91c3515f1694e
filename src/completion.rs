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

//! Units of asynchronous work-in-flight.
//!
//! A [`Completion`] packet is the ownership-transfer primitive of the
//! proactor: it is allocated when an operation (or a timer expiration) is
//! initiated, rides through the completion queue inside the opaque packet
//! slot of a [`crate::port::CompletionEvent`], and is consumed exactly once
//! by the worker thread which dequeues it.

use std::any::Any;
use std::sync::Arc;
use std::time::Instant;

use crate::port::{CompletionKey, OsCode};

/// Asynchronous completion token: opaque application context attached when
/// an operation or a timer is initiated and handed back, untouched, to the
/// handler on completion.
///
/// For repeating timers the same token is cloned per firing.
pub type Act = Arc<dyn Any + Send + Sync>;

/// Application-side recipient of timer notifications.
///
/// Operation-specific completion entry points (read, write, accept and the
/// like) are defined by the I/O layer producing those operations; the
/// proactor core only ever calls back through `handle_timeout`.
pub trait Handler: Send + Sync {
    /// Called on a proactor worker thread once per timer expiration.
    ///
    /// `time` is the expiration instant the timer was scheduled for, which
    /// is always at or before the real time of the call.
    fn handle_timeout(&self, time: Instant, act: Act);
}

/// Completion callback contract for packets travelling through the
/// completion queue.
///
/// Consuming `Box<Self>` is what guarantees the exactly-once destruction of
/// the packet: the box is freed when `complete` returns and, because it has
/// been moved into the callee, also when `complete` unwinds.
pub trait Completion: Send {
    /// Invoked exactly once on the worker thread which dequeued the packet.
    ///
    /// `success` is false when the OS reported a per-operation failure; in
    /// that case `error` carries the code captured by the poster at enqueue
    /// time.
    fn complete(self: Box<Self>, bytes: u64, success: bool, key: CompletionKey, error: OsCode);
}

/// Synthetic completion produced by a timer expiration.
///
/// Allocated by the timeout upcall once per firing and posted into the same
/// completion queue as real I/O, so that `handle_timeout` runs on a worker
/// thread and never on the timer thread itself.
pub struct TimerFired {
    handler: Arc<dyn Handler>,
    act: Act,
    time: Instant,
}

impl TimerFired {
    pub fn new(handler: Arc<dyn Handler>, act: Act, time: Instant) -> Self {
        TimerFired { handler, act, time }
    }

    /// Expiration instant this packet was produced for.
    pub fn time(&self) -> Instant { self.time }
}

impl Completion for TimerFired {
    fn complete(self: Box<Self>, _bytes: u64, _success: bool, _key: CompletionKey, _error: OsCode) {
        self.handler.handle_timeout(self.time, self.act);
    }
}
