/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! The state handlers and the central dispatcher.
//!
//! Control flow is linear within a handler; across handlers it runs
//! entirely through `req.step`. Handlers return [`Dispatch::More`] to keep
//! the loop spinning, [`Dispatch::Disembark`] when the request was parked
//! on a waiting list, and [`Dispatch::Done`] when it terminated.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use breakwater_config::{DebugFlags, ParamsHandle};
use cache::{Exp, Index, LookupArgs, LookupOutcome, ObjFlags, Object, WaitSlot};
use fetch::{Backend, BereqHead, FetchState};
use headers::{Date, HeaderMapExt};
use http::header::{
    HeaderName, ACCEPT_ENCODING, CACHE_CONTROL, CONNECTION, SERVER, TE, TRANSFER_ENCODING, UPGRADE,
};
use http::{HeaderValue, Method, StatusCode, Version};
use log::{debug, warn};
use policy::{HashKey, HookCtx, PolicyProgram, ResponseHead, Verdict};

use crate::pool::Worker;
use crate::request::{
    accepts_gzip, collect_header, CloseReason, Dispatch, ObjHandle, Req, ReqHttp, ResMode, Step,
};
use crate::response;
use crate::session::Session;

/// Include expansion stops recursing at this depth.
const MAX_ESI_DEPTH: u32 = 5;

/// The request engine: the index, the policy program, the director set
/// and the parameters, shared by every worker.
pub struct Engine {
    index: Arc<Index>,
    policy: Arc<dyn PolicyProgram>,
    directors: Vec<Arc<dyn Backend>>,
    params: ParamsHandle,
}

impl Engine {
    pub fn new(
        index: Arc<Index>,
        policy: Arc<dyn PolicyProgram>,
        directors: Vec<Arc<dyn Backend>>,
        params: ParamsHandle,
    ) -> Arc<Engine> {
        assert!(!directors.is_empty(), "an engine needs at least one director");
        Arc::new(Engine {
            index,
            policy,
            directors,
            params,
        })
    }

    pub fn index(&self) -> &Arc<Index> {
        &self.index
    }

    pub fn params(&self) -> &ParamsHandle {
        &self.params
    }

    fn backend_for(&self, req: &Req) -> Arc<dyn Backend> {
        let idx = req.director.unwrap_or(0);
        self.directors
            .get(idx)
            .unwrap_or(&self.directors[0])
            .clone()
    }

    /// Assemble the backend request head from the client request.
    fn build_bereq(&self, req: &Req) -> BereqHead {
        let mut headers = req.http.headers.clone();
        for name in [CONNECTION, TE, TRANSFER_ENCODING, UPGRADE] {
            headers.remove(name);
        }
        headers.insert(
            HeaderName::from_static("x-breakwater"),
            HeaderValue::from(req.vxid),
        );
        BereqHead {
            method: req.http.method.clone(),
            url: req.http.url.clone(),
            version: req.http.version,
            headers,
        }
    }

    /*------------------------------------------------------------------
     * We have a refcounted object with a settled body; prepare a
     * response. Fetches are waited out before this state and refreshes
     * run detached, so no fetch context is attached here.
     */

    fn cnt_prepresp(&self, _wrk: &mut Worker, req: &mut Req) -> Dispatch {
        assert!(req.busyobj.is_none());
        let params = self.params.load();
        let handle = req
            .obj
            .clone()
            .expect("preparing a response without an object");

        req.res_mode = ResMode::empty();

        if !req.disable_esi && handle.obj.esi.is_some() {
            // With include expansion ahead, the aggregate length is
            // unknowable.
            req.res_mode |= ResMode::ESI;
        } else {
            req.res_mode |= ResMode::LEN;
        }

        if req.esi_level > 0 {
            // An included fragment is always spliced, never framed.
            req.res_mode.remove(ResMode::LEN);
            req.res_mode |= ResMode::ESI_CHILD;
        }

        if params.http_gzip_support && handle.obj.gzipped && !accepts_gzip(&req.http.headers) {
            // We don't know what it uncompresses to.
            req.res_mode.remove(ResMode::LEN);
            req.res_mode |= ResMode::GUNZIP;
        }

        if !req
            .res_mode
            .intersects(ResMode::LEN | ResMode::CHUNKED | ResMode::EOF)
        {
            if !req.wantbody {
                // Nothing.
            } else if req.http.version >= Version::HTTP_11 {
                req.res_mode |= ResMode::CHUNKED;
            } else {
                req.res_mode |= ResMode::EOF;
                req.doclose = Some(CloseReason::TxEof);
            }
        }

        let t_resp = Instant::now();
        req.t_resp = Some(t_resp);
        if handle.oc.objhead().is_some() {
            handle.obj.touch_lru(t_resp, params.lru_timeout);
            if !params.obj_readonly {
                handle.obj.record_use(t_resp);
            }
        }

        let mut resp = response::build_head(req, &handle, &params);
        let mut backend = req.director.unwrap_or(0);
        let handling = {
            let mut ctx = hook_ctx(req, &mut backend);
            self.policy.deliver(&mut ctx, &mut resp)
        };
        req.director = Some(backend);
        req.resp = Some(resp);

        match handling {
            Verdict::Deliver => {
                req.err_code = 0;
                req.err_reason = None;
                req.step = Step::Deliver;
            }
            Verdict::Restart if req.restarts < params.max_restarts => {
                // Drop the object before re-entering.
                req.obj = None;
                req.resp = None;
                req.step = Step::Restart;
            }
            Verdict::Restart => {
                // Restart budget exhausted; deliver what we have.
                req.err_code = 0;
                req.err_reason = None;
                req.step = Step::Deliver;
            }
            other => panic!("illegal verdict {:?} from the deliver hook", other),
        }
        Dispatch::More
    }

    /*------------------------------------------------------------------
     * Deliver an already stored object. The body is complete by the
     * time we get here: the fetch state waited the build out, and a
     * background refresh never hands its context this far.
     */

    fn cnt_deliver(&self, wrk: &mut Worker, req: &mut Req) -> Dispatch {
        assert!(req.busyobj.is_none());
        let handle = req.obj.clone().expect("delivering without an object");

        req.director = None;
        req.restarts = 0;

        if let Err(err) = response::write_obj(self, wrk, req) {
            warn!("vxid {} delivery failed: {}", req.vxid, err);
            req.doclose = Some(CloseReason::TxError);
        }

        // No point in keeping the body of a hit-for-pass marker around.
        if handle.oc.flags().contains(ObjFlags::PASS) {
            handle.obj.free_store();
        }

        req.obj = None;
        req.resp = None;
        Dispatch::Done
    }

    /*------------------------------------------------------------------
     * Emit an error.
     */

    fn cnt_error(&self, wrk: &mut Worker, req: &mut Req) -> Dispatch {
        assert!(req.obj.is_none() && req.objcore.is_none() && req.busyobj.is_none());
        let params = self.params.load();

        req.acct.error += 1;
        let oc = self.index.new_objcore();

        if params.http_resp_size == 0 {
            // No storage budget for a synthetic response; drop the
            // connection instead.
            req.doclose = Some(CloseReason::Overload);
            req.director = None;
            let _ = self.index.deref(oc);
            return Dispatch::Done;
        }

        if req.err_code < 100 || req.err_code > 999 {
            req.err_code = 501;
        }
        let status =
            StatusCode::from_u16(req.err_code).unwrap_or(StatusCode::NOT_IMPLEMENTED);

        let mut synth = ResponseHead::new(status);
        synth.reason = req.err_reason.clone();
        synth.headers.typed_insert(Date::from(SystemTime::now()));
        synth
            .headers
            .insert(SERVER, HeaderValue::from_static("breakwater"));

        let mut backend = req.director.unwrap_or(0);
        let handling = {
            let mut ctx = hook_ctx(req, &mut backend);
            self.policy.error(&mut ctx, &mut synth)
        };
        req.director = Some(backend);

        if handling == Verdict::Restart && req.restarts < params.max_restarts {
            // Discard the synthetic response we were about to build.
            let _ = self.index.drop_obj(oc);
            req.step = Step::Restart;
            return Dispatch::More;
        }
        // A restart verdict with the budget exhausted degrades to
        // delivery of the synthetic response.

        let reason = synth.reason.clone().unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("Unknown Error")
                .to_owned()
        });
        let body = wrk.scratch.with(|buf| {
            use std::io::Write;
            let _ = write!(
                buf,
                "<!DOCTYPE html>\n<html>\n<head><title>{} {}</title></head>\n\
                 <body>\n<h1>Error {} {}</h1>\n<p>{}</p>\n\
                 <p>XID: {}</p>\n<hr>\n<p>breakwater cache server</p>\n</body>\n</html>\n",
                status.as_u16(),
                reason,
                status.as_u16(),
                reason,
                reason,
                req.vxid,
            );
            buf.truncate(params.http_resp_size);
            buf.clone()
        });

        let obj = {
            let mut obj = Object::new(synth.status, synth.headers.clone(), body);
            obj.reason = synth.reason.clone();
            obj.vxid = req.vxid;
            Arc::new(obj)
        };
        oc.promote(
            obj.clone(),
            Exp::new(Instant::now(), Duration::ZERO, Duration::ZERO),
            false,
            0,
        );
        req.obj = Some(ObjHandle { oc, obj });

        // We always close when we take this path.
        req.doclose = Some(CloseReason::TxError);
        req.wantbody = true;
        req.err_code = 0;
        req.err_reason = None;
        req.step = Step::PrepResp;
        Dispatch::More
    }

    /*------------------------------------------------------------------
     * Wait out a fetch we started (pass/miss) and intend to deliver.
     */

    fn cnt_fetch(&self, _wrk: &mut Worker, req: &mut Req) -> Dispatch {
        req.acct.fetch += 1;
        let bo = req.busyobj.clone().expect("fetch state without a busyobj");

        // Pass-through has already forwarded the body; drop the rest.
        req.discard_body();

        let terminal = bo.wait_terminal();
        if terminal == FetchState::Failed {
            req.busyobj = None;
            req.err_code = 503;
            req.step = Step::Error;
        } else {
            debug_assert_eq!(terminal, FetchState::Finished);
            req.err_code = bo.err_code();
            let obj = bo.fetch_obj().expect("finished fetch without an object");
            req.obj = Some(ObjHandle {
                oc: bo.objcore(),
                obj,
            });
            req.busyobj = None;
            req.step = Step::PrepResp;
        }
        Dispatch::More
    }

    /*------------------------------------------------------------------
     * LOOKUP
     * Hash things together and look the object up in the shared index.
     *
     * The state may be re-entered: losing the bucket to a busy build
     * parks the request and disembarks the worker, and the rush brings
     * the request back here with `step` unchanged.
     */

    fn cnt_lookup(&self, wrk: &mut Worker, req: &mut Req) -> Dispatch {
        assert!(req.objcore.is_none() && req.obj.is_none() && req.busyobj.is_none());
        let digest = req.digest.expect("lookup without a digest");

        // Prepare the variance buffer; a build started from this request
        // captures its vary key out of it.
        req.vary_b = Some(req.http.headers.clone());

        let slot = Arc::new(WaitSlot::new());
        let waiter = (req.esi_level == 0).then_some(&slot);
        let outcome = self.index.lookup(
            LookupArgs {
                digest: &digest,
                req_headers: &req.http.headers,
                always_miss: req.hash_always_miss,
                ignore_busy: req.hash_ignore_busy,
            },
            waiter,
        );

        if let LookupOutcome::Busy = outcome {
            // We lost the bucket to a busy object. The slot is already
            // parked; disembark the worker. We return here when the busy
            // object has been resolved.
            req.wait_slot = Some(slot);
            return Dispatch::Disembark;
        }
        req.wait_slot = None;

        let (oc, boc) = match outcome {
            LookupOutcome::Miss { boc } => {
                if let Some(buf) = req.vary_b.take() {
                    boc.set_vary_material(buf);
                }
                debug!("vxid {} Debug MISS", req.vxid);
                req.objcore = Some(boc);
                req.step = Step::Miss;
                return Dispatch::More;
            }
            LookupOutcome::Hit { oc, boc } => (oc, boc),
            LookupOutcome::Busy => unreachable!(),
        };

        match &boc {
            Some(boc) => {
                debug_assert!(boc.is_busy());
                if let Some(buf) = req.vary_b.take() {
                    boc.set_vary_material(buf);
                }
            }
            None => req.vary_b = None,
        }

        if oc.flags().contains(ObjFlags::PASS) {
            // Found a hit-for-pass marker.
            debug_assert!(boc.is_none());
            let _ = self.index.deref(oc);
            wrk.stats.cache_hitpass += 1;
            debug!("vxid {} Debug HIT-FOR-PASS", req.vxid);
            req.step = Step::Pass;
            return Dispatch::More;
        }

        let obj = oc.object().expect("settled core without an object");
        debug!("vxid {} Hit {}", req.vxid, obj.vxid);
        req.obj = Some(ObjHandle { oc, obj });

        let mut backend = req.director.unwrap_or(0);
        let handling = {
            let mut ctx = hook_ctx(req, &mut backend);
            self.policy.lookup(&mut ctx)
        };
        req.director = Some(backend);

        match handling {
            Verdict::Deliver => {
                if let Some(boc) = boc {
                    // Stale hit: refresh in the background. The fetch
                    // carries on detached, so our handle goes right away.
                    let bo = fetch::begin(
                        self.params.load(),
                        self.backend_for(req),
                        boc,
                        self.build_bereq(req),
                        None,
                        false,
                        self.index.rush_max(),
                        req.vxid,
                    );
                    drop(bo);
                } else {
                    req.discard_body();
                }
                wrk.stats.cache_hit += 1;
                req.step = Step::PrepResp;
            }
            Verdict::Fetch => {
                let Some(boc) = boc else {
                    panic!("fetch verdict from the lookup hook without a refresh core");
                };
                req.obj = None;
                req.objcore = Some(boc);
                req.step = Step::Miss;
            }
            Verdict::Pass | Verdict::Restart | Verdict::Error => {
                // Drop our object, we won't need it.
                req.obj = None;
                if let Some(boc) = boc {
                    let _ = self.index.deref(boc);
                }
                req.vary_b = None;
                req.step = match handling {
                    Verdict::Pass => {
                        wrk.stats.cache_hit += 1;
                        Step::Pass
                    }
                    Verdict::Restart => Step::Restart,
                    _ => Step::Error,
                };
            }
            other => panic!("illegal verdict {:?} from the lookup hook", other),
        }
        Dispatch::More
    }

    /*------------------------------------------------------------------
     * We had a miss; ask the policy, proceed as instructed.
     */

    fn cnt_miss(&self, wrk: &mut Worker, req: &mut Req) -> Dispatch {
        assert!(req.obj.is_none() && req.busyobj.is_none());
        assert!(
            req.objcore.as_ref().is_some_and(|oc| oc.is_busy()),
            "miss state needs a busy objcore"
        );

        let mut backend = req.director.unwrap_or(0);
        let handling = {
            let mut ctx = hook_ctx(req, &mut backend);
            self.policy.miss(&mut ctx)
        };
        req.director = Some(backend);

        match handling {
            Verdict::Error | Verdict::Restart | Verdict::Pass => {
                req.vary_b = None;
                let oc = req.objcore.take().expect("miss state lost its objcore");
                let _ = self.index.deref(oc);
                req.step = match handling {
                    Verdict::Error => Step::Error,
                    Verdict::Restart => Step::Restart,
                    _ => Step::Pass,
                };
            }
            Verdict::Fetch => {
                wrk.stats.cache_miss += 1;
                let oc = req.objcore.take().expect("miss state lost its objcore");
                req.busyobj = Some(fetch::begin(
                    self.params.load(),
                    self.backend_for(req),
                    oc,
                    self.build_bereq(req),
                    None,
                    false,
                    self.index.rush_max(),
                    req.vxid,
                ));
                req.step = Step::Fetch;
            }
            other => panic!("illegal verdict {:?} from the miss hook", other),
        }
        Dispatch::More
    }

    /*------------------------------------------------------------------
     * Bypass the cache: fetch into a transient core that never enters
     * the index.
     */

    fn cnt_pass(&self, _wrk: &mut Worker, req: &mut Req) -> Dispatch {
        assert!(req.obj.is_none() && req.objcore.is_none() && req.busyobj.is_none());

        let mut backend = req.director.unwrap_or(0);
        let handling = {
            let mut ctx = hook_ctx(req, &mut backend);
            self.policy.pass(&mut ctx)
        };
        req.director = Some(backend);

        match handling {
            Verdict::Error => {
                req.step = Step::Error;
                return Dispatch::More;
            }
            Verdict::Restart => {
                panic!("restart from the pass hook is not supported");
            }
            Verdict::Fetch => {}
            other => panic!("illegal verdict {:?} from the pass hook", other),
        }
        req.acct.pass += 1;

        let oc = self.index.new_objcore();
        let body = req.take_body();
        req.busyobj = Some(fetch::begin(
            self.params.load(),
            self.backend_for(req),
            oc,
            self.build_bereq(req),
            body,
            true,
            self.index.rush_max(),
            req.vxid,
        ));
        req.step = Step::Fetch;
        Dispatch::More
    }

    /*------------------------------------------------------------------
     * Ship the request to the backend unchanged and shuttle bytes until
     * one of the ends closes.
     */

    fn cnt_pipe(&self, _wrk: &mut Worker, req: &mut Req) -> Dispatch {
        assert!(req.busyobj.is_none());
        assert_eq!(req.esi_level, 0, "pipe is a root-request affair");

        req.acct.pipe += 1;
        let mut bereq = self.build_bereq(req);

        let mut backend = req.director.unwrap_or(0);
        let handling = {
            let mut ctx = hook_ctx(req, &mut backend);
            self.policy.pipe(&mut ctx, &mut bereq.headers)
        };
        req.director = Some(backend);
        match handling {
            Verdict::Pipe => {}
            Verdict::Error => panic!("error handling in the pipe hook is not implemented"),
            other => panic!("illegal verdict {:?} from the pipe hook", other),
        }

        let body = req.take_body().unwrap_or_default();
        match self.backend_for(req).pipe(&bereq, &body) {
            Ok(raw) => {
                req.resp_bodybytes = raw.len() as u64;
                if let Err(err) = req
                    .sess
                    .transport
                    .send_body(&raw)
                    .and_then(|_| req.sess.transport.done())
                {
                    warn!("vxid {} pipe write failed: {}", req.vxid, err);
                }
            }
            Err(err) => {
                warn!("vxid {} pipe failed: {}", req.vxid, err);
            }
        }
        req.doclose = Some(CloseReason::TxPipe);
        Dispatch::Done
    }

    /*------------------------------------------------------------------
     * RESTART
     */

    fn cnt_restart(&self, _wrk: &mut Worker, req: &mut Req) -> Dispatch {
        let params = self.params.load();
        req.director = None;
        req.restarts += 1;
        if req.restarts >= params.max_restarts {
            req.err_code = 503;
            req.step = Step::Error;
        } else {
            req.err_code = 0;
            req.err_reason = None;
            req.step = Step::Recv;
        }
        Dispatch::More
    }

    /*------------------------------------------------------------------
     * RECV
     * We have a complete request; set everything up and start it. We
     * come here both with a client request and with an interior request
     * during include delivery.
     */

    fn cnt_recv(&self, _wrk: &mut Worker, req: &mut Req) -> Dispatch {
        assert!(req.obj.is_none() && req.objcore.is_none() && req.busyobj.is_none());
        let params = self.params.load();

        debug!(
            "vxid {} ReqStart {} {} {}",
            req.vxid, req.sess.peer, req.http.method, req.http.url
        );

        if req.err_code != 0 {
            req.step = Step::Error;
            return Dispatch::More;
        }

        // By default we use the first backend.
        assert!(req.director.is_none());
        req.director = Some(0);

        req.disable_esi = false;
        req.hash_always_miss = false;
        req.hash_ignore_busy = false;

        collect_header(&mut req.http.headers, CACHE_CONTROL);

        let mut backend = 0;
        let recv_handling = {
            let mut ctx = hook_ctx(req, &mut backend);
            self.policy.recv(&mut ctx)
        };
        req.director = Some(backend);

        if params.http_gzip_support
            && recv_handling != Verdict::Pipe
            && recv_handling != Verdict::Pass
        {
            if accepts_gzip(&req.http.headers) {
                req.http
                    .headers
                    .insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
            } else {
                req.http.headers.remove(ACCEPT_ENCODING);
            }
        }

        let mut key = HashKey::new();
        let hash_handling = {
            let mut ctx = hook_ctx(req, &mut backend);
            self.policy.hash(&mut ctx, &mut key)
        };
        assert_eq!(
            hash_handling,
            Verdict::Lookup,
            "the hash hook must conclude with a lookup"
        );
        req.digest = Some(key.finish());

        req.wantbody = req.http.method != Method::HEAD;

        match recv_handling {
            Verdict::Purge => req.step = Step::Purge,
            Verdict::Hash => req.step = Step::Lookup,
            Verdict::Pipe => {
                if req.esi_level > 0 {
                    // Pipe cannot serve an embedded fragment; reject it
                    // with a synthetic error instead.
                    req.err_code = 503;
                    req.err_reason = Some("pipe on embedded request".to_owned());
                    req.step = Step::Error;
                } else {
                    req.step = Step::Pipe;
                }
            }
            Verdict::Pass => req.step = Step::Pass,
            Verdict::Error => req.step = Step::Error,
            other => panic!("illegal verdict {:?} from the recv hook", other),
        }
        Dispatch::More
    }

    /*------------------------------------------------------------------
     * PURGE
     * Find the bucket, invalidate every settled variant under it, then
     * synthesize the answer through the error state.
     */

    fn cnt_purge(&self, _wrk: &mut Worker, req: &mut Req) -> Dispatch {
        assert!(req.objcore.is_none() && req.busyobj.is_none());
        let digest = req.digest.expect("purge without a digest");

        req.vary_b = Some(req.http.headers.clone());
        let outcome = self.index.lookup(
            LookupArgs {
                digest: &digest,
                req_headers: &req.http.headers,
                always_miss: true,
                ignore_busy: false,
            },
            None,
        );
        let LookupOutcome::Miss { boc } = outcome else {
            unreachable!("an always-miss lookup cannot hit");
        };
        // No build will consume the variance buffer.
        req.vary_b = None;

        let head = boc.objhead().expect("busy core without a bucket");
        let _ = self.index.purge(&head);
        let _ = self.index.deref(boc);

        let mut backend = req.director.unwrap_or(0);
        {
            let mut ctx = hook_ctx(req, &mut backend);
            let _ = self.policy.purge(&mut ctx);
        }
        req.director = Some(backend);

        req.step = Step::Error;
        Dispatch::More
    }

    /*------------------------------------------------------------------
     * Central state engine dispatcher.
     *
     * Kick the request around until it has had enough.
     */

    fn cnt_diag(&self, req: &Req) {
        debug!(
            "vxid {} STP_{} sess {} obj {} esi {}",
            req.vxid,
            req.step.name(),
            req.sess.peer,
            req.obj.is_some(),
            req.esi_level,
        );
    }

    pub fn cnt_request(&self, wrk: &mut Worker, req: &mut Req) -> Dispatch {
        // Possible entrance states.
        assert!(
            matches!(req.step, Step::Recv | Step::Lookup),
            "illegal entrance state {:?}",
            req.step
        );
        assert_ne!(req.vxid, 0);

        let mut nxt = Dispatch::More;
        while nxt == Dispatch::More {
            // We don't want the scratch workspace used for anything of
            // long duration, so mandate that it be empty on state
            // transitions.
            assert!(wrk.scratch.is_empty());

            if self.params.load().debug.contains(DebugFlags::REQ_STATE) {
                self.cnt_diag(req);
            }
            nxt = match req.step {
                Step::Recv => self.cnt_recv(wrk, req),
                Step::Lookup => self.cnt_lookup(wrk, req),
                Step::Miss => self.cnt_miss(wrk, req),
                Step::Pass => self.cnt_pass(wrk, req),
                Step::Fetch => self.cnt_fetch(wrk, req),
                Step::PrepResp => self.cnt_prepresp(wrk, req),
                Step::Deliver => self.cnt_deliver(wrk, req),
                Step::Error => self.cnt_error(wrk, req),
                Step::Pipe => self.cnt_pipe(wrk, req),
                Step::Purge => self.cnt_purge(wrk, req),
                Step::Restart => self.cnt_restart(wrk, req),
            };
            assert!(wrk.scratch.is_empty());
        }

        if nxt == Dispatch::Done {
            self.finish(req);
        }
        nxt
    }

    fn finish(&self, req: &mut Req) {
        assert!(req.obj.is_none() && req.objcore.is_none() && req.busyobj.is_none());

        let t_idle = Instant::now();
        req.sess.t_idle = t_idle;

        debug!("vxid {} Length {}", req.vxid, req.resp_bodybytes);
        let t_resp = req.t_resp.unwrap_or(t_idle);
        debug!(
            "vxid {} ReqEnd {:.9} {:.9} {:.9}",
            req.vxid,
            t_resp.duration_since(req.t_req).as_secs_f64(),
            t_idle.duration_since(t_resp).as_secs_f64(),
            t_idle.duration_since(req.t_req).as_secs_f64(),
        );

        // Free the pending request-body chain.
        req.body.clear();

        req.sess.acct.charge(&req.acct);
        req.acct = Default::default();

        debug!("vxid {} End", req.vxid);
        // The wire layer allocates a fresh log id when it needs one.
        req.vxid = 0;
    }

    /// Drive one embedded include as a sub-request on the current worker
    /// and return the produced fragment bytes.
    pub(crate) fn esi_child(&self, wrk: &mut Worker, parent: &Req, src: &str) -> Vec<u8> {
        let level = parent.esi_level + 1;
        if level > MAX_ESI_DEPTH {
            warn!(
                "vxid {} include {} dropped: nesting deeper than {}",
                parent.vxid, src, MAX_ESI_DEPTH
            );
            return Vec::new();
        }

        let (sess, shared) = Session::buffered(parent.sess.peer.clone());
        let http = ReqHttp {
            method: Method::GET,
            url: src.to_owned(),
            version: parent.http.version,
            headers: parent.http.headers.clone(),
        };
        let mut child = Req::new(http, sess);
        child.esi_level = level;

        let nxt = self.cnt_request(wrk, &mut child);
        // Children never join waiting lists, so they cannot disembark.
        debug_assert_eq!(nxt, Dispatch::Done);
        shared.body()
    }
}

/// Borrow the policy-visible view out of a request.
fn hook_ctx<'a>(req: &'a mut Req, backend: &'a mut usize) -> HookCtx<'a> {
    let esi_level = req.esi_level;
    let restarts = req.restarts;
    let Req {
        http,
        disable_esi,
        hash_always_miss,
        hash_ignore_busy,
        err_code,
        err_reason,
        ..
    } = req;
    let ReqHttp {
        method,
        url,
        headers,
        ..
    } = http;
    HookCtx {
        method,
        url: url.as_str(),
        headers,
        esi_level,
        restarts,
        backend,
        disable_esi,
        hash_always_miss,
        hash_ignore_busy,
        err_code,
        err_reason,
    }
}
