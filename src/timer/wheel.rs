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
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::ReentrantMutex;

use super::{Scheduled, TimeoutUpcall, TimerId, TimerNode, TimerQueue};
use crate::completion::{Act, Handler};

/// Number of spokes; must be a power of two so the spoke of a tick is a
/// bitwise and.
const SPOKES: usize = 512;
const SPOKE_MASK: u64 = SPOKES as u64 - 1;
/// Time span of a single spoke.
const RESOLUTION: Duration = Duration::from_millis(10);

/// Timer queue over a single-level hashed timing wheel: O(1) schedule and
/// cancel, built for large populations of near-future deadlines.
///
/// Nodes are hashed into one of 512 spokes of 10 ms each; deadlines beyond
/// the 5.12 s wheel span simply stay in their spoke for further rounds,
/// filtered by their absolute expiry on every pass. The earliest deadline
/// is kept as a cache and recomputed by a spoke scan only when the cached
/// minimum leaves the wheel.
pub struct TimerWheel {
    upcall: TimeoutUpcall,
    state: ReentrantMutex<RefCell<WheelState>>,
}

struct WheelState {
    spokes: Vec<Vec<TimerNode>>,
    /// Spoke index per live timer id, for O(1) cancellation.
    spoke_of: HashMap<TimerId, usize>,
    /// Reference point for tick arithmetic.
    epoch: Instant,
    /// Last tick processed by `expire`.
    last_tick: u64,
    earliest: Option<Instant>,
    next_id: u64,
}

impl WheelState {
    fn tick_of(&self, time: Instant) -> u64 {
        (time.saturating_duration_since(self.epoch).as_millis() as u64)
            / RESOLUTION.as_millis() as u64
    }

    fn spoke_of_time(&self, time: Instant) -> usize { (self.tick_of(time) & SPOKE_MASK) as usize }

    fn insert(&mut self, node: TimerNode) {
        let spoke = self.spoke_of_time(node.expiry);
        self.spoke_of.insert(node.id, spoke);
        if self.earliest.map_or(true, |t| node.expiry < t) {
            self.earliest = Some(node.expiry);
        }
        self.spokes[spoke].push(node);
    }

    fn recompute_earliest(&mut self) {
        self.earliest = self.spokes.iter().flatten().map(|n| n.expiry).min();
    }

    fn len(&self) -> usize { self.spoke_of.len() }
}

impl TimerWheel {
    pub fn new() -> Self {
        TimerWheel {
            upcall: TimeoutUpcall::new(),
            state: ReentrantMutex::new(RefCell::new(WheelState {
                spokes: (0..SPOKES).map(|_| Vec::new()).collect(),
                spoke_of: empty!(),
                epoch: Instant::now(),
                last_tick: 0,
                earliest: None,
                next_id: 1,
            })),
        }
    }
}

impl Default for TimerWheel {
    fn default() -> Self { Self::new() }
}

impl TimerQueue for TimerWheel {
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
        let earliest = state.earliest.map_or(true, |t| expiry < t);
        state.insert(TimerNode { id, handler, act, expiry, interval });
        Scheduled { id, earliest }
    }

    fn cancel(&self, id: TimerId) -> bool {
        let lock = self.state.lock();
        let mut state = lock.borrow_mut();
        let Some(spoke) = state.spoke_of.remove(&id) else {
            return false;
        };
        let pos = state.spokes[spoke]
            .iter()
            .position(|n| n.id == id)
            .expect("spoke index out of sync");
        let node = state.spokes[spoke].swap_remove(pos);
        if state.earliest == Some(node.expiry) {
            state.recompute_earliest();
        }
        true
    }

    fn cancel_handler(&self, handler: &Arc<dyn Handler>) -> usize {
        let lock = self.state.lock();
        let mut state = lock.borrow_mut();
        let mut removed = 0;
        for spoke in 0..SPOKES {
            let mut pos = 0;
            while pos < state.spokes[spoke].len() {
                if Arc::ptr_eq(&state.spokes[spoke][pos].handler, handler) {
                    let node = state.spokes[spoke].swap_remove(pos);
                    state.spoke_of.remove(&node.id);
                    removed += 1;
                } else {
                    pos += 1;
                }
            }
        }
        if removed > 0 {
            state.recompute_earliest();
        }
        removed
    }

    fn earliest_time(&self) -> Option<Instant> { self.state.lock().borrow().earliest }

    fn is_empty(&self) -> bool { self.state.lock().borrow().spoke_of.is_empty() }

    fn len(&self) -> usize { self.state.lock().borrow().len() }

    fn expire(&self) -> usize {
        let lock = self.state.lock();
        let now = Instant::now();
        let due = {
            let mut state = lock.borrow_mut();
            let now_tick = state.tick_of(now);
            // A full revolution visits every spoke once; a shorter gap only
            // the spokes the hand swept over.
            let gap = now_tick - state.last_tick;
            let visits = if gap >= SPOKES as u64 { SPOKES as u64 } else { gap + 1 };
            let mut due = Vec::new();
            for tick in (now_tick + 1 - visits)..=now_tick {
                let spoke = (tick & SPOKE_MASK) as usize;
                let mut pos = 0;
                while pos < state.spokes[spoke].len() {
                    if state.spokes[spoke][pos].expiry <= now {
                        let node = state.spokes[spoke].swap_remove(pos);
                        state.spoke_of.remove(&node.id);
                        if !node.interval.is_zero() {
                            state.insert(node.renew());
                        }
                        due.push(node);
                    } else {
                        pos += 1;
                    }
                }
            }
            state.last_tick = now_tick;
            if !due.is_empty() {
                state.recompute_earliest();
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

    fn handler() -> Arc<dyn Handler> { Arc::new(Noop) }

    #[test]
    fn spokes_hash_by_resolution() {
        let wheel = TimerWheel::new();
        let h = handler();
        let base = Instant::now();
        for ms in [0u64, 10, 250, 5_000, 60_000] {
            wheel.schedule(h.clone(), Arc::new(()), base + Duration::from_millis(ms), Duration::ZERO);
        }
        assert_eq!(wheel.len(), 5);
        assert!(wheel.earliest_time().unwrap() <= base + Duration::from_millis(1));
    }

    #[test]
    fn expire_skips_future_rounds() {
        let wheel = TimerWheel::new();
        let h = handler();
        let now = Instant::now();
        wheel.schedule(h.clone(), Arc::new(()), now, Duration::ZERO);
        // Same spoke, one wheel revolution later.
        let far = now + RESOLUTION * SPOKES as u32;
        wheel.schedule(h.clone(), Arc::new(()), far, Duration::ZERO);
        assert_eq!(wheel.expire(), 1);
        assert_eq!(wheel.len(), 1);
        assert_eq!(wheel.earliest_time(), Some(far));
    }

    #[test]
    fn cancel_restores_earliest() {
        let wheel = TimerWheel::new();
        let h = handler();
        let now = Instant::now();
        let near = wheel.schedule(h.clone(), Arc::new(()), now + Duration::from_millis(20), Duration::ZERO);
        wheel.schedule(h.clone(), Arc::new(()), now + Duration::from_millis(300), Duration::ZERO);
        assert!(wheel.cancel(near.id));
        let earliest = wheel.earliest_time().unwrap();
        assert!(earliest >= now + Duration::from_millis(299));
    }
}
