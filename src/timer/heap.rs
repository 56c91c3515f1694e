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

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::ReentrantMutex;

use super::{Scheduled, TimeoutUpcall, TimerId, TimerNode, TimerQueue};
use crate::completion::{Act, Handler};

/// Timer queue over a binary min-heap: O(log n) schedule, O(1) earliest.
///
/// Cancellation is lazy: the node is dropped from the id index at once and
/// its heap entry is discarded whenever it surfaces. The insertion sequence
/// number breaks expiry ties so that timers scheduled for the same instant
/// fire in scheduling order.
pub struct TimerHeap {
    upcall: TimeoutUpcall,
    state: ReentrantMutex<RefCell<HeapState>>,
}

#[derive(Eq, PartialEq)]
struct HeapEntry {
    expiry: Instant,
    seq: u64,
    id: TimerId,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap, the earliest deadline must
        // surface first.
        other.expiry.cmp(&self.expiry).then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.cmp(other)) }
}

struct HeapState {
    heap: BinaryHeap<HeapEntry>,
    /// Live nodes; heap entries whose id is absent here are stale remains
    /// of a cancellation.
    nodes: HashMap<TimerId, TimerNode>,
    next_id: u64,
    next_seq: u64,
}

impl HeapState {
    fn push(&mut self, node: TimerNode) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(HeapEntry { expiry: node.expiry, seq, id: node.id });
        self.nodes.insert(node.id, node);
    }

    /// Discards stale heap entries until a live minimum surfaces.
    fn prune(&mut self) {
        while let Some(entry) = self.heap.peek() {
            if self.nodes.contains_key(&entry.id) {
                break;
            }
            self.heap.pop();
        }
    }

    fn earliest(&mut self) -> Option<Instant> {
        self.prune();
        self.heap.peek().map(|e| e.expiry)
    }
}

impl TimerHeap {
    pub fn new() -> Self {
        TimerHeap {
            upcall: TimeoutUpcall::new(),
            state: ReentrantMutex::new(RefCell::new(HeapState {
                heap: empty!(),
                nodes: empty!(),
                next_id: 1,
                next_seq: 0,
            })),
        }
    }
}

impl Default for TimerHeap {
    fn default() -> Self { Self::new() }
}

impl TimerQueue for TimerHeap {
    fn schedule(
        &self,
        handler: Arc<dyn Handler>,
        act: Act,
        expiry: Instant,
        interval: Duration,
    ) -> Scheduled {
        let lock = self.state.lock();
        let mut state = lock.borrow_mut();
        let id = TimerId(state.next_id);
        state.next_id += 1;
        let earliest = state.earliest().map_or(true, |t| expiry < t);
        state.push(TimerNode { id, handler, act, expiry, interval });
        Scheduled { id, earliest }
    }

    fn cancel(&self, id: TimerId) -> bool {
        let lock = self.state.lock();
        let result = lock.borrow_mut().nodes.remove(&id).is_some();
        result
    }

    fn cancel_handler(&self, handler: &Arc<dyn Handler>) -> usize {
        let lock = self.state.lock();
        let mut state = lock.borrow_mut();
        let before = state.nodes.len();
        state.nodes.retain(|_, n| !Arc::ptr_eq(&n.handler, handler));
        before - state.nodes.len()
    }

    fn earliest_time(&self) -> Option<Instant> {
        let lock = self.state.lock();
        let earliest = lock.borrow_mut().earliest();
        earliest
    }

    fn is_empty(&self) -> bool { self.state.lock().borrow().nodes.is_empty() }

    fn len(&self) -> usize { self.state.lock().borrow().nodes.len() }

    fn expire(&self) -> usize {
        let lock = self.state.lock();
        let now = Instant::now();
        let due = {
            let mut state = lock.borrow_mut();
            let mut due = Vec::new();
            loop {
                state.prune();
                match state.heap.peek() {
                    Some(entry) if entry.expiry <= now => {
                        let entry = state.heap.pop().expect("peeked entry present");
                        let node = state
                            .nodes
                            .remove(&entry.id)
                            .expect("live entry backed by a node");
                        if !node.interval.is_zero() {
                            state.push(node.renew());
                        }
                        due.push(node);
                    }
                    _ => break,
                }
            }
            due
        };
        let count = due.len();
        for node in due {
            let _ = self.upcall.fire(node.handler, node.act, node.expiry);
        }
        count
    }

    fn upcall(&self) -> &TimeoutUpcall { &self.upcall }
}

#[cfg(test)]
mod test {
    use super::*;

    struct Noop;
    impl Handler for Noop {
        fn handle_timeout(&self, _time: Instant, _act: Act) {}
    }

    fn schedule_in(queue: &TimerHeap, handler: &Arc<dyn Handler>, delay_ms: u64) -> Scheduled {
        queue.schedule(
            handler.clone(),
            Arc::new(()),
            Instant::now() + Duration::from_millis(delay_ms),
            Duration::ZERO,
        )
    }

    #[test]
    fn earliest_tracks_minimum() {
        let queue = TimerHeap::new();
        let handler: Arc<dyn Handler> = Arc::new(Noop);
        let far = schedule_in(&queue, &handler, 500);
        assert!(far.earliest);
        let near = schedule_in(&queue, &handler, 50);
        assert!(near.earliest);
        let mid = schedule_in(&queue, &handler, 200);
        assert!(!mid.earliest);
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn lazy_cancel_uncovers_next_deadline() {
        let queue = TimerHeap::new();
        let handler: Arc<dyn Handler> = Arc::new(Noop);
        let near = schedule_in(&queue, &handler, 50);
        schedule_in(&queue, &handler, 200);
        let before = queue.earliest_time().unwrap();
        assert!(queue.cancel(near.id));
        assert!(!queue.cancel(near.id));
        assert!(queue.earliest_time().unwrap() > before);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn cancel_by_handler_removes_all_clones() {
        let queue = TimerHeap::new();
        let victim: Arc<dyn Handler> = Arc::new(Noop);
        let bystander: Arc<dyn Handler> = Arc::new(Noop);
        schedule_in(&queue, &victim, 100);
        schedule_in(&queue, &victim, 200);
        schedule_in(&queue, &bystander, 300);
        assert_eq!(queue.cancel_handler(&victim), 2);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn unbound_expire_counts_due_nodes() {
        let queue = TimerHeap::new();
        let handler: Arc<dyn Handler> = Arc::new(Noop);
        queue.schedule(handler.clone(), Arc::new(()), Instant::now(), Duration::ZERO);
        schedule_in(&queue, &handler, 10_000);
        assert_eq!(queue.expire(), 1);
        assert_eq!(queue.len(), 1);
    }
}
