// Single-threaded I/O event demultiplexer with callback-based dispatch
//
// SPDX-License-Identifier: Apache-2.0
//
// Written in 2022-2024 by
//     Dr. Maxim Orlovsky <orlovsky@cyphernet.org>
//
// Copyright 2022-2024 Cyphernet Labs, IDCS, Switzerland
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

#![deny(
    non_upper_case_globals,
    non_camel_case_types,
    non_snake_case,
    unused_mut,
    unused_imports,
    dead_code,
    //missing_docs
)]

//! Implementation of the reactor pattern over raw file descriptors.
//!
//! [`Reactor`] watches a set of file descriptors registered with it and
//! invokes caller-supplied callbacks whenever a descriptor becomes ready for
//! reading or writing. All callbacks run serially on a single dedicated
//! thread blocked inside [`Reactor::run`]; any other thread - including a
//! callback itself - may register and unregister descriptors, stop the loop
//! or wait for it to go quiet using the coordination API.
//!
//! The crate also provides [`Event`], a counting notification primitive
//! which can be watched by a reactor like any other descriptor, allowing
//! threads to hand work over to the reactor thread without losing wakeups.
//!
//! All descriptors are polled in level-triggered mode; the crate targets
//! Linux (epoll and eventfd).

#[macro_use]
extern crate amplify;

mod event;
pub mod poller;
mod reactor;

pub use event::Event;
pub use poller::{IoEv, IoType, Poller};
pub use reactor::{ReactableId, Reactor, ReadyCallback};
