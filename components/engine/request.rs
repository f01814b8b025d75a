/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! The per-request context the state machine runs on.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use cache::{Digest, ObjCore, Object, WaitSlot};
use crossbeam_channel::Sender;
use fetch::BusyObj;
use http::header::HeaderName;
use http::{HeaderMap, HeaderValue, Method, Version};
use policy::ResponseHead;

use crate::session::Session;

/// The states. `step` always names the state the request will run next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    Recv,
    Lookup,
    Miss,
    Pass,
    Fetch,
    PrepResp,
    Deliver,
    Error,
    Pipe,
    Purge,
    Restart,
}

impl Step {
    /// Upper-case state label, the way the diagnostics spell it.
    pub fn name(self) -> &'static str {
        match self {
            Step::Recv => "RECV",
            Step::Lookup => "LOOKUP",
            Step::Miss => "MISS",
            Step::Pass => "PASS",
            Step::Fetch => "FETCH",
            Step::PrepResp => "PREPRESP",
            Step::Deliver => "DELIVER",
            Step::Error => "ERROR",
            Step::Pipe => "PIPE",
            Step::Purge => "PURGE",
            Step::Restart => "RESTART",
        }
    }
}

/// What one dispatch of the engine produced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dispatch {
    /// Run the next state.
    More,
    /// The request is parked on a waiting list; release the worker.
    Disembark,
    /// Terminated, accounting settled.
    Done,
}

/// Why the connection must close after the response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// Body framed by connection close (HTTP/1.0 without a length).
    TxEof,
    /// A synthetic error response was sent.
    TxError,
    /// No memory for a synthetic response.
    Overload,
    /// The connection was handed to the pipe shuttle.
    TxPipe,
}

bitflags::bitflags! {
    /// Response framing / filtering mode, chosen while preparing the
    /// response.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct ResMode: u8 {
        const LEN = 1 << 0;
        const CHUNKED = 1 << 1;
        const EOF = 1 << 2;
        const ESI = 1 << 3;
        const ESI_CHILD = 1 << 4;
        const GUNZIP = 1 << 5;
    }
}

/// Per-request accounting, charged to the session when the request ends.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AcctReq {
    pub fetch: u64,
    pub pass: u64,
    pub pipe: u64,
    pub error: u64,
}

impl AcctReq {
    pub fn charge(&mut self, other: &AcctReq) {
        self.fetch += other.fetch;
        self.pass += other.pass;
        self.pipe += other.pipe;
        self.error += other.error;
    }
}

/// The parsed client request the wire layer hands us.
#[derive(Clone, Debug)]
pub struct ReqHttp {
    pub method: Method,
    pub url: String,
    pub version: Version,
    pub headers: HeaderMap,
}

/// A delivered (or deliverable) stored object: the metadata core plus the
/// materialized object, held together so the core's flags stay reachable
/// through delivery.
#[derive(Clone)]
pub struct ObjHandle {
    pub oc: Arc<ObjCore>,
    pub obj: Arc<Object>,
}

static VXID_SEQ: AtomicU32 = AtomicU32::new(1000);

/// Allocate a fresh log id.
pub fn next_vxid() -> u32 {
    VXID_SEQ.fetch_add(1, Ordering::Relaxed)
}

/// Everything the state machine knows about one request.
pub struct Req {
    /// Log id; zeroed when the request ends.
    pub vxid: u32,
    pub step: Step,
    pub esi_level: u32,
    pub restarts: u32,

    pub err_code: u16,
    pub err_reason: Option<String>,

    pub http: ReqHttp,
    /// Response head being prepared; torn down on delivery and restart.
    pub resp: Option<ResponseHead>,
    /// Request body chain, freed at request end.
    pub body: VecDeque<Vec<u8>>,

    pub obj: Option<ObjHandle>,
    pub objcore: Option<Arc<ObjCore>>,
    pub busyobj: Option<Arc<BusyObj>>,

    /// Selected director, an index into the engine's director set.
    pub director: Option<usize>,

    pub digest: Option<Digest>,
    pub wantbody: bool,
    pub res_mode: ResMode,
    pub doclose: Option<CloseReason>,

    // Policy-settable request flags, cleared on entry to the receive
    // state.
    pub disable_esi: bool,
    pub hash_always_miss: bool,
    pub hash_ignore_busy: bool,

    /// Variance-axis buffer: the header snapshot a build started from
    /// this request will capture its vary key from.
    pub vary_b: Option<HeaderMap>,
    /// Waiting-list slot of the lookup in flight, if any.
    pub wait_slot: Option<Arc<WaitSlot>>,

    pub acct: AcctReq,
    pub t_req: Instant,
    pub t_resp: Option<Instant>,
    pub resp_bodybytes: u64,

    pub sess: Session,
    /// Where to hand the finished request back to, when somebody waits
    /// for it.
    pub done_tx: Option<Sender<Box<Req>>>,
}

impl Req {
    pub fn new(http: ReqHttp, sess: Session) -> Req {
        Req {
            vxid: next_vxid(),
            step: Step::Recv,
            esi_level: 0,
            restarts: 0,
            err_code: 0,
            err_reason: None,
            http,
            resp: None,
            body: VecDeque::new(),
            obj: None,
            objcore: None,
            busyobj: None,
            director: None,
            digest: None,
            wantbody: true,
            res_mode: ResMode::empty(),
            doclose: None,
            disable_esi: false,
            hash_always_miss: false,
            hash_ignore_busy: false,
            vary_b: None,
            wait_slot: None,
            acct: AcctReq::default(),
            t_req: Instant::now(),
            t_resp: None,
            resp_bodybytes: 0,
            sess,
            done_tx: None,
        }
    }

    /// Drop any request body still unconsumed.
    pub fn discard_body(&mut self) {
        self.body.clear();
    }

    /// Flatten the body chain for a backend that wants it whole.
    pub fn take_body(&mut self) -> Option<Vec<u8>> {
        if self.body.is_empty() {
            return None;
        }
        let mut joined = Vec::new();
        while let Some(chunk) = self.body.pop_front() {
            joined.extend_from_slice(&chunk);
        }
        Some(joined)
    }
}

/// Fold repeated occurrences of a header into one comma-joined value, in
/// place. Canonicalizes `Cache-Control` before policy sees it.
pub fn collect_header(headers: &mut HeaderMap, name: HeaderName) {
    let values: Vec<HeaderValue> = headers.get_all(&name).iter().cloned().collect();
    if values.len() < 2 {
        return;
    }
    let mut joined = Vec::new();
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            joined.extend_from_slice(b", ");
        }
        joined.extend_from_slice(value.as_bytes());
    }
    if let Ok(value) = HeaderValue::from_bytes(&joined) {
        headers.remove(&name);
        headers.insert(name, value);
    }
}

/// Whether the client advertised it can take a gzipped body.
pub fn accepts_gzip(headers: &HeaderMap) -> bool {
    headers
        .get_all(http::header::ACCEPT_ENCODING)
        .iter()
        .any(|v| v.to_str().is_ok_and(|t| t.contains("gzip")))
}
