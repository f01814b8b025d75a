/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Stored objects, their metadata cores, and the keyed buckets grouping
//! the variants of one digest.

use std::collections::VecDeque;
use std::ops::Range;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use http::{HeaderMap, StatusCode};
use log::debug;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::vary::VaryKey;
use crate::waiter::WaitSlot;
use crate::Digest;

bitflags::bitflags! {
    /// Core state flags. `BUSY` marks an entry another worker is still
    /// populating; `PASS` marks a hit-for-pass entry; `FAILED` marks an
    /// abandoned build awaiting removal.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct ObjFlags: u8 {
        const BUSY = 1 << 0;
        const PASS = 1 << 1;
        const FAILED = 1 << 2;
    }
}

/// Expiry record of one variant.
#[derive(Clone, Copy, Debug)]
pub struct Exp {
    pub entered: Instant,
    pub ttl: Duration,
    pub grace: Duration,
}

impl Exp {
    pub fn new(entered: Instant, ttl: Duration, grace: Duration) -> Exp {
        Exp {
            entered,
            ttl,
            grace,
        }
    }

    /// Within TTL.
    pub fn fresh(&self, now: Instant) -> bool {
        now.duration_since(self.entered) < self.ttl
    }

    /// Within TTL + grace; a stale-but-usable object may be delivered
    /// while a refresh fetch runs.
    pub fn usable(&self, now: Instant) -> bool {
        now.duration_since(self.entered) < self.ttl + self.grace
    }
}

impl Default for Exp {
    fn default() -> Exp {
        Exp {
            entered: Instant::now(),
            ttl: Duration::ZERO,
            grace: Duration::ZERO,
        }
    }
}

/// One pre-parsed span of an ESI-carrying body: either literal bytes of
/// the stored body or an include to expand as an embedded sub-request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EsiSegment {
    Bytes(Range<usize>),
    Include(String),
}

/// Body storage. Hit-for-pass entries drop their body after delivery but
/// keep the head as a marker, so the body is replaceable with `Freed`.
#[derive(Clone, Debug)]
pub enum ObjBody {
    Complete(Arc<Vec<u8>>),
    Freed,
}

#[derive(Debug)]
struct ObjTimes {
    last_lru: Instant,
    last_use: Instant,
}

/// A complete stored response.
#[derive(Debug)]
pub struct Object {
    pub status: StatusCode,
    /// Reason-phrase override; `None` means the canonical phrase.
    pub reason: Option<String>,
    pub headers: HeaderMap,
    pub gzipped: bool,
    /// Present when the fetch pre-parsed include markup out of the body.
    pub esi: Option<Vec<EsiSegment>>,
    /// The variance-axis values this variant was stored under.
    pub vary: Option<VaryKey>,
    /// Log id of the fetch transaction that built the object.
    pub vxid: u32,
    body: Mutex<ObjBody>,
    times: Mutex<ObjTimes>,
}

impl Object {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Vec<u8>) -> Object {
        let now = Instant::now();
        Object {
            status,
            reason: None,
            headers,
            gzipped: false,
            esi: None,
            vary: None,
            vxid: 0,
            body: Mutex::new(ObjBody::Complete(Arc::new(body))),
            times: Mutex::new(ObjTimes {
                last_lru: now,
                last_use: now,
            }),
        }
    }

    /// Snapshot of the body, `None` once freed.
    pub fn body(&self) -> Option<Arc<Vec<u8>>> {
        match &*self.body.lock() {
            ObjBody::Complete(bytes) => Some(bytes.clone()),
            ObjBody::Freed => None,
        }
    }

    pub fn body_len(&self) -> Option<usize> {
        self.body().map(|b| b.len())
    }

    /// Drop the stored body, keeping the head as metadata. Used on
    /// hit-for-pass entries after delivery.
    pub fn free_store(&self) {
        *self.body.lock() = ObjBody::Freed;
    }

    /// Refresh the LRU stamp if `lru_timeout` has elapsed since the last
    /// touch. Returns whether a touch happened.
    pub fn touch_lru(&self, now: Instant, lru_timeout: Duration) -> bool {
        let mut times = self.times.lock();
        if now.duration_since(times.last_lru) > lru_timeout {
            times.last_lru = now;
            true
        } else {
            false
        }
    }

    /// Record delivery time. Writes go through the object's lock, never
    /// racily.
    pub fn record_use(&self, now: Instant) {
        self.times.lock().last_use = now;
    }

    pub fn last_use(&self) -> Instant {
        self.times.lock().last_use
    }
}

pub(crate) struct OcState {
    pub flags: ObjFlags,
    pub exp: Exp,
    pub obj: Option<Arc<Object>>,
    /// Request-side variance material kept for the fetch that will
    /// populate this core.
    pub vary_material: Option<HeaderMap>,
}

/// Metadata entry of one variant. Reference counted; the index holds one
/// reference through the owning bucket, each request holding the core
/// holds another.
pub struct ObjCore {
    head: Weak<ObjHead>,
    pub(crate) state: Mutex<OcState>,
}

impl ObjCore {
    /// A transient core with no bucket: pass fetches and synthetic
    /// responses use these.
    pub fn new_transient() -> Arc<ObjCore> {
        Arc::new(ObjCore {
            head: Weak::new(),
            state: Mutex::new(OcState {
                flags: ObjFlags::BUSY,
                exp: Exp::default(),
                obj: None,
                vary_material: None,
            }),
        })
    }

    pub fn flags(&self) -> ObjFlags {
        self.state.lock().flags
    }

    pub fn is_busy(&self) -> bool {
        self.flags().contains(ObjFlags::BUSY)
    }

    pub fn object(&self) -> Option<Arc<Object>> {
        self.state.lock().obj.clone()
    }

    pub fn exp(&self) -> Exp {
        self.state.lock().exp
    }

    pub fn objhead(&self) -> Option<Arc<ObjHead>> {
        self.head.upgrade()
    }

    pub fn set_vary_material(&self, headers: HeaderMap) {
        self.state.lock().vary_material = Some(headers);
    }

    pub fn take_vary_material(&self) -> Option<HeaderMap> {
        self.state.lock().vary_material.take()
    }

    /// Attach the built object and open the core for lookups: clear
    /// `BUSY`, set `PASS` for hit-for-pass builds, then wake waiters on
    /// the owning bucket.
    pub fn promote(&self, obj: Arc<Object>, exp: Exp, hit_for_pass: bool, rush_max: usize) {
        match self.objhead() {
            Some(head) => {
                let mut inner = head.inner.lock();
                {
                    let mut st = self.state.lock();
                    debug_assert!(st.flags.contains(ObjFlags::BUSY));
                    st.flags.remove(ObjFlags::BUSY);
                    if hit_for_pass {
                        st.flags.insert(ObjFlags::PASS);
                    }
                    st.exp = exp;
                    st.obj = Some(obj);
                }
                head.unbusied(&mut inner, rush_max);
            }
            None => {
                let mut st = self.state.lock();
                st.flags.remove(ObjFlags::BUSY);
                if hit_for_pass {
                    st.flags.insert(ObjFlags::PASS);
                }
                st.exp = exp;
                st.obj = Some(obj);
            }
        }
    }

    /// Abandon the build: mark the core failed, unlink it from the bucket
    /// and wake waiters so they can retry the lookup.
    pub fn fail(self: &Arc<Self>, rush_max: usize) {
        match self.objhead() {
            Some(head) => {
                let mut inner = head.inner.lock();
                {
                    let mut st = self.state.lock();
                    st.flags.remove(ObjFlags::BUSY);
                    st.flags.insert(ObjFlags::FAILED);
                    st.obj = None;
                }
                inner.variants.retain(|oc| !Arc::ptr_eq(oc, self));
                head.unbusied(&mut inner, rush_max);
            }
            None => {
                let mut st = self.state.lock();
                st.flags.remove(ObjFlags::BUSY);
                st.flags.insert(ObjFlags::FAILED);
                st.obj = None;
            }
        }
    }
}

impl std::fmt::Debug for ObjCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("ObjCore")
            .field("flags", &st.flags)
            .field("has_obj", &st.obj.is_some())
            .finish()
    }
}

pub(crate) struct OhInner {
    pub variants: Vec<Arc<ObjCore>>,
    pub waiters: VecDeque<Arc<WaitSlot>>,
}

/// One keyed bucket: the variants sharing a primary digest plus the
/// waiting list of requests suspended on a busy build.
pub struct ObjHead {
    digest: Digest,
    pub(crate) inner: Mutex<OhInner>,
    /// Signalled whenever a build on this bucket resolves; used by
    /// callers that block instead of joining the waiting list.
    pub(crate) unbusy: Condvar,
}

impl ObjHead {
    pub(crate) fn new(digest: Digest) -> Arc<ObjHead> {
        Arc::new(ObjHead {
            digest,
            inner: Mutex::new(OhInner {
                variants: Vec::new(),
                waiters: VecDeque::new(),
            }),
            unbusy: Condvar::new(),
        })
    }

    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    /// Append a fresh busy core for a build about to start.
    pub(crate) fn insert_busy(self: &Arc<Self>, inner: &mut OhInner) -> Arc<ObjCore> {
        let oc = Arc::new(ObjCore {
            head: Arc::downgrade(self),
            state: Mutex::new(OcState {
                flags: ObjFlags::BUSY,
                exp: Exp::default(),
                obj: None,
                vary_material: None,
            }),
        });
        inner.variants.push(oc.clone());
        oc
    }

    /// A build on this bucket resolved: rush up to `rush_max` waiting-list
    /// entries (FIFO) and wake blocked lookups. Runs the wakeups after the
    /// bucket lock is released.
    pub(crate) fn unbusied(&self, inner: &mut MutexGuard<'_, OhInner>, rush_max: usize) {
        let n = rush_max.min(inner.waiters.len());
        let rushed: Vec<Arc<WaitSlot>> = inner.waiters.drain(..n).collect();
        if !rushed.is_empty() {
            debug!(
                "objhead {:02x}{:02x}..: rushing {} waiter(s)",
                self.digest[0],
                self.digest[1],
                rushed.len()
            );
        }
        MutexGuard::unlocked(inner, || {
            for slot in rushed {
                slot.rush();
            }
        });
        self.unbusy.notify_all();
    }

    /// Number of parked waiters, for tests and diagnostics.
    pub fn waiting(&self) -> usize {
        self.inner.lock().waiters.len()
    }
}

impl std::fmt::Debug for ObjHead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ObjHead")
            .field("variants", &inner.variants.len())
            .field("waiters", &inner.waiters.len())
            .finish()
    }
}
