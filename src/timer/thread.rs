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

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crossbeam_channel as chan;
use parking_lot::RwLock;

use super::TimerQueue;
use crate::Error;

/// Auto-reset event used to wake the timer thread when the earliest
/// deadline changes.
///
/// Backed by a single-slot channel: a signal wakes exactly one wait and the
/// event re-arms immediately; signalling an already-signalled event is a
/// no-op.
pub(crate) struct TimerEvent {
    tx: chan::Sender<()>,
}

impl TimerEvent {
    pub(crate) fn signal(&self) -> Result<(), Error> {
        match self.tx.try_send(()) {
            Ok(()) | Err(chan::TrySendError::Full(())) => Ok(()),
            Err(chan::TrySendError::Disconnected(())) => {
                Err(Error::ResourceExhausted("timer thread is gone"))
            }
        }
    }
}

/// Dedicated worker expiring due timers.
///
/// The thread blocks on whichever comes first, the earliest timer deadline
/// or the event, and on a deadline wake dispatches the due nodes through
/// the queue's upcall. Dropping the event sender is the orderly shutdown
/// signal; the loop observes it as a disconnected wait and returns.
pub(crate) struct TimerThread {
    event: TimerEvent,
    handle: thread::JoinHandle<()>,
}

pub(crate) type QueueCell = Arc<RwLock<Option<Arc<dyn TimerQueue>>>>;

impl TimerThread {
    pub(crate) fn spawn(queue: QueueCell) -> Self {
        let (tx, rx) = chan::bounded(1);
        let handle = thread::spawn(move || Self::run(queue, rx));
        TimerThread { event: TimerEvent { tx }, handle }
    }

    pub(crate) fn signal(&self) -> Result<(), Error> { self.event.signal() }

    /// Stops the thread and waits for it to exit.
    pub(crate) fn shutdown(self) {
        let TimerThread { event, handle } = self;
        drop(event);
        handle.join().unwrap_or_else(|_| {
            #[cfg(feature = "log")]
            log::error!(target: "timers", "timer thread has panicked");
        });
    }

    fn run(queue: QueueCell, event: chan::Receiver<()>) {
        loop {
            let current = match queue.read().clone() {
                Some(queue) => queue,
                None => break,
            };
            // The deadline is recomputed on every pass: a signal means the
            // scheduling has changed under us.
            let wait = current
                .earliest_time()
                .map(|t| t.saturating_duration_since(Instant::now()));
            match wait {
                Some(deadline) => match event.recv_timeout(deadline) {
                    Ok(()) => continue,
                    Err(chan::RecvTimeoutError::Timeout) => {
                        current.expire();
                    }
                    Err(chan::RecvTimeoutError::Disconnected) => break,
                },
                // Empty queue: sleep until signalled.
                None => match event.recv() {
                    Ok(()) => continue,
                    Err(chan::RecvError) => break,
                },
            }
        }
        #[cfg(feature = "log")]
        log::debug!(target: "timers", "timer thread is shut down");
    }
}
