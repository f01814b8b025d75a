/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Shared test plumbing: a programmable in-memory backend and a rig that
//! wires an engine to it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use breakwater_config::{Params, ParamsHandle};
use cache::Index;
use engine::{Engine, Req, ReqHttp, Session, SharedBuffer, Worker};
use fetch::{Backend, BereqHead, Beresp, FetchError};
use http::header::HOST;
use http::{HeaderMap, Method, StatusCode, Version};
use parking_lot::Mutex;
use policy::{DefaultPolicy, PolicyProgram};

/// One canned backend answer.
#[derive(Clone)]
pub struct Route {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    pub uncacheable: bool,
    pub do_esi: bool,
    pub ttl: Option<Duration>,
    pub grace: Option<Duration>,
}

impl Route {
    pub fn ok(body: &str) -> Route {
        Route {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: body.as_bytes().to_vec(),
            uncacheable: false,
            do_esi: false,
            ttl: None,
            grace: None,
        }
    }

    pub fn esi(body: &str) -> Route {
        let mut route = Route::ok(body);
        route.do_esi = true;
        route
    }

    pub fn header(mut self, name: http::header::HeaderName, value: &str) -> Route {
        self.headers.insert(name, value.parse().unwrap());
        self
    }

    pub fn uncacheable(mut self) -> Route {
        self.uncacheable = true;
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Route {
        self.ttl = Some(ttl);
        self
    }

    pub fn grace(mut self, grace: Duration) -> Route {
        self.grace = Some(grace);
        self
    }
}

/// Programmable backend: canned routes, a transaction counter, an
/// optional per-transaction delay and a kill switch.
pub struct StaticBackend {
    routes: Mutex<HashMap<String, Route>>,
    pub fetches: AtomicUsize,
    started: AtomicUsize,
    delay: Mutex<Option<Duration>>,
    down: AtomicBool,
}

impl StaticBackend {
    pub fn new() -> Arc<StaticBackend> {
        Arc::new(StaticBackend {
            routes: Mutex::new(HashMap::new()),
            fetches: AtomicUsize::new(0),
            started: AtomicUsize::new(0),
            delay: Mutex::new(None),
            down: AtomicBool::new(false),
        })
    }

    /// Transactions entered, including those still sleeping on a delay.
    pub fn started_count(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn route(&self, url: &str, route: Route) {
        self.routes.lock().insert(url.to_owned(), route);
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl Backend for StaticBackend {
    fn name(&self) -> &str {
        "static"
    }

    fn transact(&self, bereq: &BereqHead, _body: Option<&[u8]>) -> Result<Beresp, FetchError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = *self.delay.lock() {
            std::thread::sleep(delay);
        }
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            return Err(FetchError::Unreachable("test backend is down".to_owned()));
        }
        let routes = self.routes.lock();
        match routes.get(&bereq.url) {
            Some(route) => {
                let mut beresp =
                    Beresp::new(route.status, route.headers.clone(), route.body.clone());
                beresp.uncacheable = route.uncacheable;
                beresp.do_esi = route.do_esi;
                beresp.ttl = route.ttl;
                beresp.grace = route.grace;
                Ok(beresp)
            }
            None => Ok(Beresp::new(
                StatusCode::NOT_FOUND,
                HeaderMap::new(),
                b"not found".to_vec(),
            )),
        }
    }

    fn pipe(&self, _bereq: &BereqHead, client_bytes: &[u8]) -> Result<Vec<u8>, FetchError> {
        let mut raw = b"PIPED:".to_vec();
        raw.extend_from_slice(client_bytes);
        Ok(raw)
    }
}

/// An engine wired to one static backend over a fresh index.
pub struct Rig {
    pub engine: Arc<Engine>,
    pub index: Arc<Index>,
    pub backend: Arc<StaticBackend>,
    pub params: ParamsHandle,
}

pub fn rig_with(policy: Arc<dyn PolicyProgram>, params: Params) -> Rig {
    let _ = env_logger::builder().is_test(true).try_init();
    let params = ParamsHandle::new(params);
    let index = Index::new(params.clone());
    let backend = StaticBackend::new();
    let engine = Engine::new(
        index.clone(),
        policy,
        vec![backend.clone() as Arc<dyn Backend>],
        params.clone(),
    );
    Rig {
        engine,
        index,
        backend,
        params,
    }
}

pub fn rig() -> Rig {
    rig_with(Arc::new(DefaultPolicy), Params::default())
}

pub fn worker() -> Worker {
    Worker::new(16 * 1024)
}

pub fn request_with(
    method: Method,
    url: &str,
    version: Version,
    headers: HeaderMap,
) -> (Box<Req>, SharedBuffer) {
    let (sess, shared) = Session::buffered("127.0.0.1:50000");
    let mut headers = headers;
    if !headers.contains_key(HOST) {
        headers.insert(HOST, "origin.example".parse().unwrap());
    }
    let req = Req::new(
        ReqHttp {
            method,
            url: url.to_owned(),
            version,
            headers,
        },
        sess,
    );
    (Box::new(req), shared)
}

pub fn request(url: &str) -> (Box<Req>, SharedBuffer) {
    request_with(Method::GET, url, Version::HTTP_11, HeaderMap::new())
}
