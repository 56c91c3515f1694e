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

//! Abstract completion queue and its portable in-process implementation.
//!
//! The OS completion-port primitive is modelled as an opaque serialized
//! queue of finished packets. Real I/O layers may back it with an actual
//! kernel port; [`SyncQueue`] provides the portable implementation used by
//! default, built on a crossbeam channel.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crossbeam_channel as chan;

use crate::completion::Completion;
use crate::Error;

/// Opaque OS handle associated with a completion queue.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Display)]
#[display("handle({0})")]
pub struct Handle(pub u64);

/// Opaque completion key attached on [`CompletionPort::associate`] and
/// reported back with each dequeued packet. Synthetic completions carry the
/// null key.
pub type CompletionKey = u64;

/// Raw OS error code captured together with a failed operation. Zero means
/// no error.
pub type OsCode = u32;

/// A single entry of the completion queue.
///
/// The field layout is the wire ABI between the proactor and any module
/// which posts packets: byte count and completion key ride in their own
/// slots, while the boxed [`Completion`] packet rides in the opaque overlap
/// slot. The per-operation outcome is captured by the poster at enqueue
/// time, which keeps the error code attached to its packet across the
/// asynchronous boundary.
pub struct CompletionEvent {
    pub bytes: u64,
    pub key: CompletionKey,
    pub success: bool,
    pub error: OsCode,
    pub packet: Box<dyn Completion>,
}

impl CompletionEvent {
    /// Packet of a successfully completed operation.
    pub fn new(packet: Box<dyn Completion>, bytes: u64, key: CompletionKey) -> Self {
        CompletionEvent { bytes, key, success: true, error: 0, packet }
    }

    /// Packet of an operation the OS has reported failed.
    pub fn failed(packet: Box<dyn Completion>, key: CompletionKey, error: OsCode) -> Self {
        CompletionEvent { bytes: 0, key, success: false, error, packet }
    }

    /// Synthetic completion: zero bytes, null key, successful outcome.
    pub fn synthetic(packet: Box<dyn Completion>) -> Self {
        CompletionEvent { bytes: 0, key: 0, success: true, error: 0, packet }
    }
}

/// Narrow posting capability of a completion queue.
///
/// This is the only interface handed out to modules which enqueue packets
/// from outside the dequeue loop (the timeout upcall in particular), so
/// that they cannot dequeue, associate or close.
pub trait PostCompletion: Send + Sync {
    /// Enqueues a completion packet.
    ///
    /// The event is consumed unconditionally: when posting fails the packet
    /// it carries is deallocated before the error is returned.
    fn post(&self, event: CompletionEvent) -> Result<(), Error>;
}

/// Abstract OS completion queue: an opaque serialized multi-consumer queue
/// of finished operation packets.
pub trait CompletionPort: PostCompletion {
    /// Creates a fresh queue bound to the given worker concurrency hint.
    fn create(concurrency: usize) -> Result<Self, Error>
    where Self: Sized;

    /// Associates an OS handle with the queue under an opaque completion
    /// key.
    ///
    /// Re-associating an already associated handle is accepted silently.
    fn associate(&self, handle: Handle, key: CompletionKey) -> Result<(), Error>;

    /// Blocks until a packet is available, the timeout elapses
    /// ([`Error::TimedOut`]) or the queue is closed ([`Error::Closed`]).
    /// `None` waits indefinitely.
    fn dequeue(&self, timeout: Option<Duration>) -> Result<CompletionEvent, Error>;

    /// Closes the queue, waking every consumer blocked in
    /// [`Self::dequeue`] with [`Error::Closed`]. Idempotent.
    fn close(&self) -> Result<(), Error>;
}

/// Portable in-process completion queue.
///
/// Serialization and consumer wakeup are delegated to a crossbeam channel;
/// closing the queue takes the single producer out of its slot and drops
/// it, which disconnects every blocked consumer within its current wait.
/// Packets still buffered at close time are drained in order before
/// consumers start observing [`Error::Closed`].
pub struct SyncQueue {
    tx: Mutex<Option<chan::Sender<CompletionEvent>>>,
    rx: chan::Receiver<CompletionEvent>,
    handles: Mutex<HashMap<Handle, CompletionKey>>,
}

impl PostCompletion for SyncQueue {
    fn post(&self, event: CompletionEvent) -> Result<(), Error> {
        match &*self.tx.lock().expect("completion queue poisoned") {
            Some(tx) => tx.send(event).map_err(|_| Error::Closed),
            None => Err(Error::Closed),
        }
    }
}

impl CompletionPort for SyncQueue {
    fn create(_concurrency: usize) -> Result<Self, Error> {
        // The concurrency hint controls how many workers the OS wakes at
        // once; an in-process channel wakes one consumer per message and
        // needs no limiter.
        let (tx, rx) = chan::unbounded();
        Ok(SyncQueue {
            tx: Mutex::new(Some(tx)),
            rx,
            handles: Mutex::new(empty!()),
        })
    }

    fn associate(&self, handle: Handle, key: CompletionKey) -> Result<(), Error> {
        if self.tx.lock().expect("completion queue poisoned").is_none() {
            return Err(Error::Closed);
        }
        let mut handles = self.handles.lock().expect("completion queue poisoned");
        if handles.contains_key(&handle) {
            // The OS reports "already associated" for repeated
            // registrations; this is not an error.
            #[cfg(feature = "log")]
            log::trace!(target: "proactor", "{handle} is already associated with the completion queue");
            return Ok(());
        }
        handles.insert(handle, key);
        Ok(())
    }

    fn dequeue(&self, timeout: Option<Duration>) -> Result<CompletionEvent, Error> {
        match timeout {
            Some(timeout) => self.rx.recv_timeout(timeout).map_err(|err| match err {
                chan::RecvTimeoutError::Timeout => Error::TimedOut,
                chan::RecvTimeoutError::Disconnected => Error::Closed,
            }),
            None => self.rx.recv().map_err(|_| Error::Closed),
        }
    }

    fn close(&self) -> Result<(), Error> {
        self.tx.lock().expect("completion queue poisoned").take();
        self.handles.lock().expect("completion queue poisoned").clear();
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct NoopPacket;
    impl Completion for NoopPacket {
        fn complete(self: Box<Self>, _: u64, _: bool, _: CompletionKey, _: OsCode) {}
    }

    #[test]
    fn associate_is_idempotent() {
        let queue = SyncQueue::create(1).unwrap();
        queue.associate(Handle(7), 1).unwrap();
        queue.associate(Handle(7), 1).unwrap();
        queue.associate(Handle(8), 2).unwrap();
    }

    #[test]
    fn dequeue_times_out_on_empty_queue() {
        let queue = SyncQueue::create(1).unwrap();
        assert_eq!(queue.dequeue(Some(Duration::ZERO)).err(), Some(Error::TimedOut));
    }

    #[test]
    fn close_disconnects_and_rejects_posts() {
        let queue = SyncQueue::create(1).unwrap();
        queue.post(CompletionEvent::synthetic(Box::new(NoopPacket))).unwrap();
        queue.close().unwrap();
        // Buffered packets drain first, then the queue reads as closed.
        assert!(queue.dequeue(Some(Duration::ZERO)).is_ok());
        assert!(matches!(queue.dequeue(Some(Duration::ZERO)), Err(Error::Closed)));
        assert!(matches!(
            queue.post(CompletionEvent::synthetic(Box::new(NoopPacket))),
            Err(Error::Closed)
        ));
        assert!(matches!(queue.associate(Handle(1), 0), Err(Error::Closed)));
    }
}
