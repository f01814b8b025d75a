/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Fetch lifecycle: terminal signalling and core promotion.

use std::sync::Arc;
use std::time::Duration;

use breakwater_config::Params;
use cache::{ObjCore, ObjFlags};
use fetch::{Backend, BereqHead, Beresp, FetchError, FetchState};
use http::header::CACHE_CONTROL;
use http::{HeaderMap, Method, StatusCode, Version};

struct OneShotBackend {
    status: StatusCode,
    headers: HeaderMap,
    body: Vec<u8>,
    fail: bool,
    delay: Option<Duration>,
}

impl OneShotBackend {
    fn ok(body: &[u8]) -> OneShotBackend {
        OneShotBackend {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: body.to_vec(),
            fail: false,
            delay: None,
        }
    }
}

impl Backend for OneShotBackend {
    fn name(&self) -> &str {
        "oneshot"
    }

    fn transact(&self, _bereq: &BereqHead, _body: Option<&[u8]>) -> Result<Beresp, FetchError> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        if self.fail {
            return Err(FetchError::Unreachable("down".to_owned()));
        }
        Ok(Beresp::new(self.status, self.headers.clone(), self.body.clone()))
    }
}

fn bereq(url: &str) -> BereqHead {
    BereqHead {
        method: Method::GET,
        url: url.to_owned(),
        version: Version::HTTP_11,
        headers: HeaderMap::new(),
    }
}

fn begin(backend: Arc<dyn Backend>) -> (Arc<fetch::BusyObj>, Arc<ObjCore>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let oc = ObjCore::new_transient();
    let bo = fetch::begin(
        Arc::new(Params::default()),
        backend,
        oc.clone(),
        bereq("/x"),
        None,
        true,
        8,
        42,
    );
    (bo, oc)
}

#[test]
fn successful_fetch_finishes_and_promotes() {
    let (bo, oc) = begin(Arc::new(OneShotBackend::ok(b"payload")));

    assert_eq!(bo.wait_terminal(), FetchState::Finished);
    assert_eq!(bo.err_code(), 0);

    let obj = bo.fetch_obj().expect("a finished fetch carries its object");
    assert_eq!(obj.body().unwrap().as_slice(), b"payload");

    assert!(!oc.is_busy());
    assert!(oc.object().is_some());
}

#[test]
fn failed_fetch_reports_and_fails_the_core() {
    let backend = OneShotBackend {
        fail: true,
        ..OneShotBackend::ok(b"")
    };
    let (bo, oc) = begin(Arc::new(backend));

    assert_eq!(bo.wait_terminal(), FetchState::Failed);
    assert_eq!(bo.err_code(), 503);
    assert!(bo.fetch_obj().is_none());
    assert!(oc.flags().contains(ObjFlags::FAILED));
}

#[test]
fn wait_terminal_blocks_until_the_fetch_lands() {
    let backend = OneShotBackend {
        delay: Some(Duration::from_millis(80)),
        ..OneShotBackend::ok(b"slow")
    };
    let (bo, _oc) = begin(Arc::new(backend));

    let waiter = {
        let bo = bo.clone();
        std::thread::spawn(move || bo.wait_terminal())
    };
    assert_eq!(waiter.join().unwrap(), FetchState::Finished);
    assert_eq!(bo.fetch_obj().unwrap().body().unwrap().as_slice(), b"slow");
}

#[test]
fn cache_control_drives_the_ttl() {
    let mut headers = HeaderMap::new();
    headers.insert(CACHE_CONTROL, "max-age=300".parse().unwrap());
    let backend = OneShotBackend {
        headers,
        ..OneShotBackend::ok(b"aged")
    };

    // A cacheable (non-pass) fetch records the header-derived TTL.
    let oc = ObjCore::new_transient();
    let bo = fetch::begin(
        Arc::new(Params::default()),
        Arc::new(backend),
        oc.clone(),
        bereq("/aged"),
        None,
        false,
        8,
        43,
    );
    assert_eq!(bo.wait_terminal(), FetchState::Finished);
    assert_eq!(oc.exp().ttl, Duration::from_secs(300));
}

#[test]
fn uncacheable_response_promotes_a_pass_marker() {
    let mut headers = HeaderMap::new();
    headers.insert(CACHE_CONTROL, "no-store".parse().unwrap());
    let backend = OneShotBackend {
        headers,
        ..OneShotBackend::ok(b"secret")
    };

    let oc = ObjCore::new_transient();
    let bo = fetch::begin(
        Arc::new(Params::default()),
        Arc::new(backend),
        oc.clone(),
        bereq("/secret"),
        None,
        false,
        8,
        44,
    );
    assert_eq!(bo.wait_terminal(), FetchState::Finished);
    assert!(oc.flags().contains(ObjFlags::PASS));
    assert_eq!(oc.exp().ttl, Params::default().hitpass_ttl);
}
