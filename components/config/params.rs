/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Run-time parameters for a single breakwater process.
//!
//! Every subsystem reads parameters through a [`ParamsHandle`], which hands
//! out an immutable snapshot. A writer replaces the whole struct at once, so
//! a request that loaded a snapshot keeps consistent values for its entire
//! lifetime even if an operator reconfigures the process mid-flight.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

bitflags::bitflags! {
    /// Debugging switches, all off in production.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct DebugFlags: u32 {
        /// Log a diagnostic line on every state the request engine enters.
        const REQ_STATE = 1 << 0;
        /// Log waiting-list park/rush traffic on the object index.
        const WAITINGLIST = 1 << 1;
    }
}

/// Global tunables, read-mostly.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Params {
    /// How many times one request may be restarted by policy before the
    /// engine gives up and emits a 503.
    pub max_restarts: u32,

    /// Whether the engine normalizes `Accept-Encoding` and selects the
    /// gunzip response mode for clients that cannot take gzip.
    pub http_gzip_support: bool,

    /// Byte budget for a synthetic (error/purge) response body.
    pub http_resp_size: usize,

    /// Maximum number of headers copied onto a synthetic response.
    pub http_max_hdr: usize,

    /// Minimum interval between LRU touches on a delivered object.
    pub lru_timeout: Duration,

    /// When set, delivery never writes back `last_use` on stored objects.
    pub obj_readonly: bool,

    /// TTL applied to fetched objects whose backend response carries none.
    pub default_ttl: Duration,

    /// Grace added after TTL expiry; a graced hit is delivered stale while
    /// a background refresh runs.
    pub default_grace: Duration,

    /// Lifetime of a hit-for-pass marker entry.
    pub hitpass_ttl: Duration,

    /// A completed fetch wakes `2^rush_exponent` waiting requests.
    pub rush_exponent: u32,

    /// Size of the per-worker scratch workspace.
    pub workspace_session: usize,

    /// Number of request-driving worker threads.
    pub worker_threads: usize,

    pub debug: DebugFlags,
}

impl Default for Params {
    fn default() -> Params {
        Params {
            max_restarts: 4,
            http_gzip_support: true,
            http_resp_size: 32 * 1024,
            http_max_hdr: 64,
            lru_timeout: Duration::from_secs(2),
            obj_readonly: false,
            default_ttl: Duration::from_secs(120),
            default_grace: Duration::from_secs(10),
            hitpass_ttl: Duration::from_secs(120),
            rush_exponent: 3,
            workspace_session: 16 * 1024,
            worker_threads: 4,
            debug: DebugFlags::empty(),
        }
    }
}

/// Shared handle to the live parameter set.
///
/// Cloning the handle is cheap; so is `load`, which only bumps an `Arc`.
#[derive(Clone, Default)]
pub struct ParamsHandle {
    inner: Arc<RwLock<Arc<Params>>>,
}

impl ParamsHandle {
    pub fn new(params: Params) -> ParamsHandle {
        ParamsHandle {
            inner: Arc::new(RwLock::new(Arc::new(params))),
        }
    }

    /// A consistent snapshot of the current parameters.
    pub fn load(&self) -> Arc<Params> {
        self.inner.read().clone()
    }

    /// Replace the whole parameter set atomically.
    pub fn store(&self, params: Params) {
        *self.inner.write() = Arc::new(params);
    }
}
