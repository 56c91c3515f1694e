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

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::completion::{Act, Handler};
use crate::port::{CompletionEvent, CompletionKey, CompletionPort, Handle, PostCompletion, SyncQueue};
use crate::timer::list::TimerList;
use crate::timer::thread::{QueueCell, TimerThread};
use crate::timer::{TimerId, TimerQueue};
use crate::Error;

/// Proactive completion dispatcher.
///
/// The proactor owns a completion queue and an internal timer thread; the
/// worker threads looping in [`Self::handle_events`] are owned by the
/// caller. Workers dequeue finished operations (real I/O posted by an
/// outside I/O layer, or synthetic timer expirations) and run each
/// packet's completion callback exactly once.
///
/// ```no_run
/// use std::sync::Arc;
/// use std::time::{Duration, Instant};
/// use proactor::{Act, Handler, Proactor};
///
/// struct Echo;
/// impl Handler for Echo {
///     fn handle_timeout(&self, time: Instant, _act: Act) {
///         println!("timer scheduled for {time:?} has fired");
///     }
/// }
///
/// let proactor = Proactor::new(1).unwrap();
/// proactor
///     .schedule_timer(Arc::new(Echo), Arc::new(()), Duration::from_millis(50))
///     .unwrap();
/// proactor.handle_events(Some(Duration::from_secs(1))).unwrap();
/// ```
pub struct Proactor<P: CompletionPort = SyncQueue> {
    port: Arc<P>,
    /// Worker concurrency hint handed to the completion queue on creation.
    threads: AtomicUsize,
    /// Shared with the timer thread; `None` once the proactor is closed.
    /// An externally supplied queue stays alive through the caller's own
    /// reference and is never freed here.
    timer_queue: QueueCell,
    timer_thread: Mutex<Option<TimerThread>>,
}

impl Proactor<SyncQueue> {
    /// Creates a proactor over the portable in-process completion queue
    /// with a default (list-based) timer queue.
    pub fn new(threads: usize) -> Result<Self, Error> { Self::with_port(threads, None) }

    /// Creates a proactor over the portable in-process completion queue
    /// with a caller-owned timer queue.
    ///
    /// The caller retains ownership: dropping the proactor leaves the queue
    /// intact. The queue's upcall must not be bound to another proactor.
    pub fn with_timer_queue(
        threads: usize,
        timer_queue: Arc<dyn TimerQueue>,
    ) -> Result<Self, Error> {
        Self::with_port(threads, Some(timer_queue))
    }
}

impl<P: CompletionPort + 'static> Proactor<P> {
    /// Creates a proactor over a custom completion queue implementation.
    ///
    /// `threads` is the worker concurrency hint the queue is created with.
    /// Fails with [`Error::ResourceExhausted`] when the queue cannot be
    /// created and with [`Error::AlreadyBound`] when the supplied timer
    /// queue already serves another proactor.
    pub fn with_port(
        threads: usize,
        timer_queue: Option<Arc<dyn TimerQueue>>,
    ) -> Result<Self, Error> {
        let port = Arc::new(P::create(threads)?);
        let queue = timer_queue.unwrap_or_else(|| Arc::new(TimerList::new()));
        queue.upcall().bind(port.clone() as Arc<dyn PostCompletion>)?;
        let cell: QueueCell = Arc::new(RwLock::new(Some(queue)));
        let timer_thread = TimerThread::spawn(cell.clone());
        Ok(Proactor {
            port,
            threads: AtomicUsize::new(threads),
            timer_queue: cell,
            timer_thread: Mutex::new(Some(timer_thread)),
        })
    }

    /// Replaces the installed timer queue.
    ///
    /// `None` installs a fresh list-based queue. The proactor's reference
    /// to the old queue is dropped; a queue the caller still holds stays
    /// alive. Errors with [`Error::Closed`] on a closed proactor and with
    /// [`Error::AlreadyBound`] when the new queue already serves another
    /// proactor. A failed call has no side effects: the old queue stays
    /// installed and the supplied queue is left unbound, free to be
    /// installed on another proactor.
    pub fn set_timer_queue(&self, timer_queue: Option<Arc<dyn TimerQueue>>) -> Result<(), Error> {
        let queue = timer_queue.unwrap_or_else(|| Arc::new(TimerList::new()));
        {
            let mut cell = self.timer_queue.write();
            // The closed check must precede the bind: a binding is
            // permanent, and taking it on behalf of a dead proactor would
            // waste the caller's queue.
            if cell.is_none() {
                return Err(Error::Closed);
            }
            queue.upcall().bind(self.port.clone() as Arc<dyn PostCompletion>)?;
            *cell = Some(queue);
        }
        // Deadlines of the new queue are unrelated to the wait in progress.
        let _ = self.signal_timer_event();
        Ok(())
    }
}

impl<P: CompletionPort> Proactor<P> {
    /// Associates an OS handle with the completion queue under the given
    /// opaque completion key.
    ///
    /// Idempotent: re-registering an already registered handle succeeds.
    /// No locking happens here: the completion queue is itself
    /// thread-safe.
    pub fn register_handle(&self, handle: Handle, key: CompletionKey) -> Result<(), Error> {
        self.port.associate(handle, key)
    }

    /// Enqueues a completion packet, as the I/O layer does when an
    /// operation finishes. The packet will be dispatched by exactly one
    /// worker inside [`Self::handle_events`].
    pub fn post(&self, event: CompletionEvent) -> Result<(), Error> { self.port.post(event) }

    /// Schedules a one-shot timer expiring `delay` from now.
    ///
    /// Returns the timer id usable with [`Self::cancel_timer`].
    pub fn schedule_timer(
        &self,
        handler: Arc<dyn Handler>,
        act: Act,
        delay: Duration,
    ) -> Result<TimerId, Error> {
        self.schedule_timer_with_interval(handler, act, delay, Duration::ZERO)
    }

    /// Schedules a repeating timer firing every `interval`, first in
    /// `interval` from now.
    pub fn schedule_repeating_timer(
        &self,
        handler: Arc<dyn Handler>,
        act: Act,
        interval: Duration,
    ) -> Result<TimerId, Error> {
        self.schedule_timer_with_interval(handler, act, interval, interval)
    }

    /// Schedules a timer expiring `delay` from now; a non-zero `interval`
    /// makes it re-insert itself at `previous expiry + interval` after each
    /// firing.
    pub fn schedule_timer_with_interval(
        &self,
        handler: Arc<dyn Handler>,
        act: Act,
        delay: Duration,
        interval: Duration,
    ) -> Result<TimerId, Error> {
        let expiry = Instant::now() + delay;
        let queue = self.installed_timer_queue()?;
        let scheduled = queue.schedule(handler, act, expiry, interval);
        if scheduled.earliest {
            // The new timer moved the deadline forward: wake the timer
            // thread so it re-reads the earliest time.
            if self.signal_timer_event().is_err() {
                queue.cancel(scheduled.id);
                return Err(Error::ResourceExhausted("timer thread is not running"));
            }
        }
        Ok(scheduled.id)
    }

    /// Cancels a pending timer. Returns whether a node was removed; an
    /// expiration already handed to the completion queue is not suppressed
    /// and its `handle_timeout` will still run.
    ///
    /// No event signal is needed: even if the cancelled timer was the
    /// earliest, the timer thread merely gets an extra wakeup.
    pub fn cancel_timer(&self, id: TimerId) -> bool {
        match self.installed_timer_queue() {
            Ok(queue) => queue.cancel(id),
            Err(_) => false,
        }
    }

    /// Cancels every pending timer registered for clones of the given
    /// handler, returning the number of removed nodes.
    pub fn cancel_handler_timers(&self, handler: &Arc<dyn Handler>) -> usize {
        match self.installed_timer_queue() {
            Ok(queue) => queue.cancel_handler(handler),
            Err(_) => 0,
        }
    }

    /// Dequeues and dispatches a single completion.
    ///
    /// Blocks up to `timeout` (`None` blocks until a completion arrives).
    /// On a successful dequeue the packet's completion callback runs on
    /// this thread, with `success = false` and the captured OS code when
    /// the operation failed, and the packet is destroyed, panics
    /// notwithstanding. Returns [`Error::TimedOut`] when the deadline is
    /// exhausted and [`Error::Closed`] once the proactor is closed.
    pub fn handle_events(&self, timeout: Option<Duration>) -> Result<(), Error> {
        let CompletionEvent { bytes, key, success, error, packet } = self.port.dequeue(timeout)?;
        // The packet box moves into its own callback: freed on return and
        // on unwind alike.
        packet.complete(bytes, success, key, error);
        Ok(())
    }

    /// Same as [`Self::handle_events`], decrementing `budget` by the time
    /// spent in the call. Suited for dispatch loops running on an overall
    /// deadline.
    pub fn handle_events_within(&self, budget: &mut Duration) -> Result<(), Error> {
        let started = Instant::now();
        let res = self.handle_events(Some(*budget));
        *budget = budget.saturating_sub(started.elapsed());
        res
    }

    /// Worker concurrency hint the completion queue was created with.
    pub fn number_of_threads(&self) -> usize { self.threads.load(Ordering::Relaxed) }

    /// Updates the stored concurrency hint. Affects bookkeeping only: the
    /// completion queue keeps the concurrency it was created with.
    pub fn set_number_of_threads(&self, threads: usize) {
        self.threads.store(threads, Ordering::Relaxed);
    }

    /// The currently installed timer queue, or `None` once the proactor is
    /// closed.
    pub fn timer_queue(&self) -> Option<Arc<dyn TimerQueue>> { self.timer_queue.read().clone() }

    /// Shuts the proactor down: stops and joins the timer thread, releases
    /// the timer queue, then closes the completion queue. Workers blocked
    /// in [`Self::handle_events`] observe [`Error::Closed`] within their
    /// current wait. Idempotent; also run on drop.
    pub fn close(&self) -> Result<(), Error> {
        if let Some(thread) = self.timer_thread.lock().expect("proactor poisoned").take() {
            thread.shutdown();
        }
        self.timer_queue.write().take();
        self.port.close()
    }

    /// Reserved by the dispatcher design; never implemented.
    pub fn run_event_loop(&self) -> Result<(), Error> { Err(Error::NotImplemented) }

    /// Reserved by the dispatcher design; never implemented.
    pub fn end_event_loop(&self) -> Result<(), Error> { Err(Error::NotImplemented) }

    /// Reserved by the dispatcher design; never implemented.
    pub fn wake_up_dispatch_threads(&self) -> Result<(), Error> { Err(Error::NotImplemented) }

    fn installed_timer_queue(&self) -> Result<Arc<dyn TimerQueue>, Error> {
        self.timer_queue.read().clone().ok_or(Error::Closed)
    }

    fn signal_timer_event(&self) -> Result<(), Error> {
        match &*self.timer_thread.lock().expect("proactor poisoned") {
            Some(thread) => thread.signal(),
            None => Err(Error::Closed),
        }
    }
}

impl<P: CompletionPort> Drop for Proactor<P> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
