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

use crate::port::OsCode;

/// Errors produced by the proactor, its completion queue and its timer
/// machinery.
///
/// Per-operation I/O failures are not represented here: they travel inside
/// the completion packet as the `success = false` flag plus the captured OS
/// error code and never unwind past [`crate::Proactor::handle_events`].
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, Error)]
#[display(doc_comments)]
pub enum Error {
    /// completion queue operation failed with OS code {0}
    Os(OsCode),

    /// completion dequeue has exhausted its wait deadline
    //
    // A marker reported on a normal return path, not a failure of the
    // dispatcher.
    TimedOut,

    /// completion queue is closed
    Closed,

    /// system resources exhausted: {0}
    ResourceExhausted(&'static str),

    /// timeout upcall is already bound to a proactor
    AlreadyBound,

    /// timeout upcall is not bound to any proactor
    Unbound,

    /// operation is reserved by the dispatcher design and not implemented
    NotImplemented,
}
