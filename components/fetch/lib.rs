/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Backend fetches.
//!
//! A fetch runs on its own named thread and reports through a [`BusyObj`]:
//! the request that started it (and, for a streaming refresh, nobody at
//! all) observes the fetch by waiting for the busy object to reach a
//! terminal state. The fetch owns promotion: on success it attaches the
//! built object to the metadata core and wakes the bucket's waiting list,
//! on failure it abandons the core the same way.

#![deny(unsafe_code)]

pub mod backend;
pub mod busyobj;
pub mod esi;
pub mod thread;
mod worker;

pub use backend::{Backend, BereqHead, Beresp, FetchError};
pub use busyobj::{BusyObj, FetchState};
pub use worker::begin;
