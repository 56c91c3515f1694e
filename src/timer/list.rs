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
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::ReentrantMutex;

use super::{Scheduled, TimeoutUpcall, TimerId, TimerNode, TimerQueue};
use crate::completion::{Act, Handler};

/// Timer queue over a time-ordered list: O(n) schedule, O(1) earliest.
///
/// This is the default container installed by a proactor constructed
/// without an explicit queue; it wins for the small timer populations
/// typical of per-connection timeouts.
pub struct TimerList {
    upcall: TimeoutUpcall,
    state: ReentrantMutex<RefCell<ListState>>,
}

struct ListState {
    /// Nodes in ascending expiry order.
    nodes: VecDeque<TimerNode>,
    next_id: u64,
}

impl ListState {
    fn insert(&mut self, node: TimerNode) -> usize {
        let pos = self.nodes.partition_point(|n| n.expiry <= node.expiry);
        self.nodes.insert(pos, node);
        pos
    }
}

impl TimerList {
    pub fn new() -> Self {
        TimerList {
            upcall: TimeoutUpcall::new(),
            state: ReentrantMutex::new(RefCell::new(ListState {
                nodes: empty!(),
                next_id: 1,
            })),
        }
    }
}

impl Default for TimerList {
    fn default() -> Self { Self::new() }
}

impl TimerQueue for TimerList {
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
        let pos = state.insert(TimerNode { id, handler, act, expiry, interval });
        Scheduled { id, earliest: pos == 0 }
    }

    fn cancel(&self, id: TimerId) -> bool {
        let lock = self.state.lock();
        let mut state = lock.borrow_mut();
        match state.nodes.iter().position(|n| n.id == id) {
            Some(pos) => {
                state.nodes.remove(pos);
                true
            }
            None => false,
        }
    }

    fn cancel_handler(&self, handler: &Arc<dyn Handler>) -> usize {
        let lock = self.state.lock();
        let mut state = lock.borrow_mut();
        let before = state.nodes.len();
        state.nodes.retain(|n| !Arc::ptr_eq(&n.handler, handler));
        before - state.nodes.len()
    }

    fn earliest_time(&self) -> Option<Instant> {
        self.state.lock().borrow().nodes.front().map(|n| n.expiry)
    }

    fn is_empty(&self) -> bool { self.state.lock().borrow().nodes.is_empty() }

    fn len(&self) -> usize { self.state.lock().borrow().nodes.len() }

    fn expire(&self) -> usize {
        let lock = self.state.lock();
        let now = Instant::now();
        let due = {
            let mut state = lock.borrow_mut();
            let split = state.nodes.partition_point(|n| n.expiry <= now);
            let mut due = Vec::with_capacity(split);
            for _ in 0..split {
                let node = state.nodes.pop_front().expect("due nodes counted above");
                if !node.interval.is_zero() {
                    state.insert(node.renew());
                }
                due.push(node);
            }
            due
        };
        // The borrow is released, but the re-entrant lock is still held:
        // upcalls may schedule or cancel on this thread.
        let count = due.len();
        for node in due {
            let _ = self.upcall.fire(node.handler, node.act, node.expiry);
        }
        count
    }

    fn upcall(&self) -> &TimeoutUpcall { &self.upcall }
}
