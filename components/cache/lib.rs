/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! The shared object index of the caching proxy.
//!
//! Objects are keyed by a 32-byte content digest. Each digest owns an
//! [`ObjHead`] bucket, which groups the variants (one [`ObjCore`] per
//! variance-axis value) and carries the waiting list of requests suspended
//! on an in-progress build. The index is shared by every worker; all
//! mutation goes through its API and is serialized per bucket.
//!
//! A lookup that runs into a busy build either parks the caller's wakeup
//! slot on the waiting list (top-level requests, which can release their
//! worker) or blocks on the bucket until the build resolves (embedded
//! sub-requests, which cannot).

#![deny(unsafe_code)]

pub mod index;
pub mod object;
pub mod vary;
pub mod waiter;

pub use index::{Index, LookupArgs, LookupOutcome};
pub use object::{EsiSegment, Exp, ObjBody, ObjCore, ObjFlags, ObjHead, Object};
pub use vary::VaryKey;
pub use waiter::WaitSlot;

/// 32-byte lookup digest, produced by the policy hash hook.
pub type Digest = [u8; 32];

/// Per-worker cache counters, charged to the session when a request ends.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    pub cache_hit: u64,
    pub cache_hitpass: u64,
    pub cache_miss: u64,
}
