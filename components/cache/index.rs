/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! The digest-keyed index and its lookup protocol.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use breakwater_config::{DebugFlags, ParamsHandle};
use http::HeaderMap;
use log::debug;
use parking_lot::Mutex;

use crate::object::{ObjCore, ObjFlags, ObjHead};
use crate::waiter::WaitSlot;
use crate::Digest;

/// What a lookup produced.
pub enum LookupOutcome {
    /// A usable variant. `boc` accompanies a stale-but-graced hit: a busy
    /// core for the refresh build the caller is expected to start.
    Hit {
        oc: Arc<ObjCore>,
        boc: Option<Arc<ObjCore>>,
    },
    /// Nothing usable; a busy core has been inserted for the caller's
    /// build.
    Miss { boc: Arc<ObjCore> },
    /// Another worker is populating this bucket. The caller's wait slot
    /// has been parked on the waiting list; the caller must disembark.
    Busy,
}

/// Inputs of one lookup, besides the suspension mode.
pub struct LookupArgs<'a> {
    pub digest: &'a Digest,
    pub req_headers: &'a HeaderMap,
    /// Skip matching entirely and insert a fresh busy core. Purge and the
    /// `hash_always_miss` request flag use this.
    pub always_miss: bool,
    /// Ignore busy builds instead of suspending on them; a second
    /// concurrent build of the same bucket becomes possible. Opting in
    /// relaxes the one-build-per-bucket guarantee.
    pub ignore_busy: bool,
}

/// The shared object index.
pub struct Index {
    params: ParamsHandle,
    buckets: Mutex<HashMap<Digest, Arc<ObjHead>>>,
}

impl Index {
    pub fn new(params: ParamsHandle) -> Arc<Index> {
        Arc::new(Index {
            params,
            buckets: Mutex::new(HashMap::new()),
        })
    }

    /// A completed build wakes this many waiting-list entries.
    pub fn rush_max(&self) -> usize {
        1usize << self.params.load().rush_exponent
    }

    fn get_or_create_head(&self, digest: &Digest) -> Arc<ObjHead> {
        let mut buckets = self.buckets.lock();
        buckets
            .entry(*digest)
            .or_insert_with(|| ObjHead::new(*digest))
            .clone()
    }

    /// The bucket for a digest, if one exists. Diagnostics and tests.
    pub fn head_of(&self, digest: &Digest) -> Option<Arc<ObjHead>> {
        self.buckets.lock().get(digest).cloned()
    }

    /// Look the request up in the index.
    ///
    /// With a `waiter` slot, a busy bucket parks the slot and returns
    /// [`LookupOutcome::Busy`]; the caller releases its worker and resumes
    /// when rushed. Without one, a busy bucket blocks the calling thread
    /// until the build resolves — embedded sub-requests take this path
    /// because they cannot disembark mid-delivery.
    pub fn lookup(&self, args: LookupArgs<'_>, waiter: Option<&Arc<WaitSlot>>) -> LookupOutcome {
        let head = self.get_or_create_head(args.digest);
        let debug_wl = self
            .params
            .load()
            .debug
            .contains(DebugFlags::WAITINGLIST);

        let mut inner = head.inner.lock();
        loop {
            if args.always_miss {
                let boc = head.insert_busy(&mut inner);
                return LookupOutcome::Miss { boc };
            }

            let now = Instant::now();
            let mut busy_seen = false;
            let mut exact: Option<Arc<ObjCore>> = None;
            let mut graced: Option<Arc<ObjCore>> = None;

            inner.variants.retain(|oc| {
                let st = oc.state.lock();
                if st.flags.contains(ObjFlags::FAILED) {
                    return false;
                }
                if st.flags.contains(ObjFlags::BUSY) {
                    if !args.ignore_busy {
                        busy_seen = true;
                    }
                    return true;
                }
                if !st.exp.usable(now) {
                    // Expired past grace; reap on the way through.
                    return false;
                }
                let vary_ok = match st.obj.as_ref().and_then(|o| o.vary.as_ref()) {
                    Some(vary) => vary.matches(args.req_headers),
                    None => true,
                };
                if vary_ok {
                    if st.exp.fresh(now) {
                        let newer = match &exact {
                            Some(cur) => st.exp.entered > cur.exp().entered,
                            None => true,
                        };
                        if newer {
                            exact = Some(oc.clone());
                        }
                    } else if graced.is_none() {
                        graced = Some(oc.clone());
                    }
                }
                true
            });

            if let Some(oc) = exact {
                // Wakeups are batched; a request that got its hit pulls
                // the next batch so a long waiting list keeps draining.
                if !busy_seen && !inner.waiters.is_empty() {
                    head.unbusied(&mut inner, self.rush_max());
                }
                return LookupOutcome::Hit { oc, boc: None };
            }
            if let Some(oc) = graced {
                // Deliver stale; start a refresh unless one already runs.
                let boc = if busy_seen {
                    None
                } else {
                    Some(head.insert_busy(&mut inner))
                };
                return LookupOutcome::Hit { oc, boc };
            }
            if busy_seen {
                match waiter {
                    Some(slot) => {
                        inner.waiters.push_back(slot.clone());
                        if debug_wl {
                            debug!(
                                "objhead {:02x}{:02x}..: lookup parked ({} waiting)",
                                args.digest[0],
                                args.digest[1],
                                inner.waiters.len()
                            );
                        }
                        return LookupOutcome::Busy;
                    }
                    None => {
                        // No waiting list available; block until the
                        // build resolves, then rescan.
                        head.unbusy.wait(&mut inner);
                        continue;
                    }
                }
            }

            let boc = head.insert_busy(&mut inner);
            return LookupOutcome::Miss { boc };
        }
    }

    /// A transient, headless core for builds that never enter the index:
    /// pass fetches and synthetic error responses.
    pub fn new_objcore(&self) -> Arc<ObjCore> {
        ObjCore::new_transient()
    }

    /// Give up one reference to a core. Dropping a still-busy core
    /// abandons its build: the core is failed and its waiters rushed so
    /// they can retry. Returns the residual reference count.
    pub fn deref(&self, oc: Arc<ObjCore>) -> usize {
        if oc.is_busy() {
            oc.fail(self.rush_max());
        }
        let residual = Arc::strong_count(&oc).saturating_sub(1);
        drop(oc);
        residual
    }

    /// Back out of a built-but-undelivered object together with its
    /// core; the error state's restart path discards its synthetic
    /// response this way. Such cores are transient and never entered a
    /// bucket, so backing out collapses into a plain [`Index::deref`] —
    /// the object storage goes when the last reference does.
    pub fn drop_obj(&self, oc: Arc<ObjCore>) -> usize {
        self.deref(oc)
    }

    /// Invalidate every settled variant under the bucket. Builds in
    /// flight are left to promote; they will carry fresh content anyway.
    /// Returns the number of variants dropped.
    pub fn purge(&self, head: &Arc<ObjHead>) -> usize {
        let mut inner = head.inner.lock();
        let before = inner.variants.len();
        inner
            .variants
            .retain(|oc| oc.state.lock().flags.contains(ObjFlags::BUSY));
        let dropped = before - inner.variants.len();
        debug!(
            "objhead {:02x}{:02x}..: purged {} variant(s)",
            head.digest()[0],
            head.digest()[1],
            dropped
        );
        dropped
    }
}
