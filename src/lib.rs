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

//! Implementation of the proactor pattern.
//!
//! Unlike a reactor, which waits for resources to become ready, a proactor
//! waits for the *completion* of previously initiated asynchronous
//! operations and dispatches each finished operation to a user-supplied
//! handler. The [`Proactor`] here couples a multi-consumer completion
//! queue, dequeued by caller-owned worker threads via
//! [`Proactor::handle_events`], with an integrated timer scheduler whose
//! expirations are delivered through the very same queue as synthetic
//! completions, so timer handlers always run on a worker thread and never on
//! the internal timer thread.
//!
//! The OS completion-port primitive is abstracted behind the
//! [`port::CompletionPort`] trait; the portable in-process
//! [`port::SyncQueue`] serves as the default backing. Timer queues come in
//! three interchangeable flavors (ordered list, binary heap and hashed
//! timing wheel) selected at runtime through the [`timer::TimerQueue`]
//! trait.

#[macro_use]
extern crate amplify;
#[cfg(feature = "log")]
extern crate log_crate as log;

pub mod completion;
mod error;
pub mod port;
mod proactor;
pub mod timer;

pub use completion::{Act, Completion, Handler, TimerFired};
pub use error::Error;
pub use port::{
    CompletionEvent, CompletionKey, CompletionPort, Handle, OsCode, PostCompletion, SyncQueue,
};
pub use proactor::Proactor;
pub use timer::heap::TimerHeap;
pub use timer::list::TimerList;
pub use timer::wheel::TimerWheel;
pub use timer::{Scheduled, TimeoutUpcall, TimerId, TimerQueue};
