/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! The fetch task itself.

use std::sync::Arc;
use std::time::{Duration, Instant};

use breakwater_config::Params;
use cache::{Exp, Object, VaryKey};
use http::header::CONTENT_ENCODING;
use http::HeaderMap;
use log::{debug, warn};

use crate::backend::{self, Backend, Beresp};
use crate::busyobj::{BusyObj, FetchState};
use crate::esi;
use crate::thread::spawn_named;

/// Start a backend fetch for the given metadata core.
///
/// `is_pass` builds into a transient core and never enters the index.
/// The returned busy object is already shared with the fetch thread; the
/// caller may drop it immediately to run the fetch detached (background
/// refresh), or hold it and wait for a terminal state.
pub fn begin(
    params: Arc<Params>,
    backend: Arc<dyn Backend>,
    oc: Arc<cache::ObjCore>,
    bereq: backend::BereqHead,
    req_body: Option<Vec<u8>>,
    is_pass: bool,
    rush_max: usize,
    vxid: u32,
) -> Arc<BusyObj> {
    let bo = BusyObj::new(vxid, is_pass, oc.clone(), bereq);
    let task_bo = bo.clone();
    let spawned = spawn_named(format!("fetch-{}", vxid), move || {
        run_fetch(params, backend, task_bo, req_body, rush_max);
    });
    if let Err(err) = spawned {
        warn!("vxid {} could not spawn fetch thread: {}", vxid, err);
        oc.fail(rush_max);
        bo.fail(503);
    }
    bo
}

fn run_fetch(
    params: Arc<Params>,
    backend: Arc<dyn Backend>,
    bo: Arc<BusyObj>,
    req_body: Option<Vec<u8>>,
    rush_max: usize,
) {
    bo.advance(FetchState::Fetch);
    let result = backend.transact(bo.bereq(), req_body.as_deref());
    match result {
        Ok(beresp) => {
            let oc = bo.objcore();
            let vary_material = oc.take_vary_material();
            let req_headers = vary_material.as_ref().unwrap_or(&bo.bereq().headers);
            let obj = Arc::new(build_object(&beresp, req_headers, bo.vxid()));

            let hit_for_pass = bo.is_pass()
                || beresp.uncacheable
                || backend::uncacheable_by_headers(&beresp.headers);
            let ttl = if hit_for_pass {
                params.hitpass_ttl
            } else {
                beresp
                    .ttl
                    .or_else(|| backend::ttl_from_headers(&beresp.headers))
                    .unwrap_or(params.default_ttl)
            };
            let grace = if hit_for_pass {
                Duration::ZERO
            } else {
                beresp.grace.unwrap_or(params.default_grace)
            };

            oc.promote(obj.clone(), Exp::new(Instant::now(), ttl, grace), hit_for_pass, rush_max);
            debug!(
                "vxid {} fetch from {} finished: {} ({} bytes{})",
                bo.vxid(),
                backend.name(),
                obj.status,
                obj.body_len().unwrap_or(0),
                if hit_for_pass { ", hit-for-pass" } else { "" },
            );
            bo.finish(obj, 0);
        }
        Err(err) => {
            warn!("vxid {} fetch from {} failed: {}", bo.vxid(), backend.name(), err);
            bo.objcore().fail(rush_max);
            bo.fail(503);
        }
    }
}

fn build_object(beresp: &Beresp, req_headers: &HeaderMap, vxid: u32) -> Object {
    let mut obj = Object::new(beresp.status, beresp.headers.clone(), beresp.body.clone());
    obj.vxid = vxid;
    obj.gzipped = beresp
        .headers
        .get_all(CONTENT_ENCODING)
        .iter()
        .any(|v| v.to_str().is_ok_and(|t| t.contains("gzip")));
    if beresp.do_esi {
        obj.esi = esi::parse(&beresp.body);
    }
    obj.vary = VaryKey::capture(&beresp.headers, req_headers);
    obj
}
