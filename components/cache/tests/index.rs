/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Index behavior: lookup outcomes, waiting lists, grace and purge.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use breakwater_config::{Params, ParamsHandle};
use cache::{Exp, Index, LookupArgs, LookupOutcome, ObjFlags, Object, WaitSlot};
use http::header::{ACCEPT_LANGUAGE, VARY};
use http::{HeaderMap, StatusCode};

fn index() -> Arc<Index> {
    let _ = env_logger::builder().is_test(true).try_init();
    Index::new(ParamsHandle::new(Params::default()))
}

fn digest(n: u8) -> [u8; 32] {
    [n; 32]
}

fn exp(ttl: Duration, grace: Duration) -> Exp {
    Exp::new(Instant::now(), ttl, grace)
}

fn obj(body: &str) -> Arc<Object> {
    Arc::new(Object::new(
        StatusCode::OK,
        HeaderMap::new(),
        body.as_bytes().to_vec(),
    ))
}

fn lookup(
    index: &Index,
    digest: &[u8; 32],
    headers: &HeaderMap,
    waiter: Option<&Arc<WaitSlot>>,
) -> LookupOutcome {
    index.lookup(
        LookupArgs {
            digest,
            req_headers: headers,
            always_miss: false,
            ignore_busy: false,
        },
        waiter,
    )
}

#[test]
fn miss_then_promote_then_hit() {
    let index = index();
    let key = digest(1);
    let headers = HeaderMap::new();

    let LookupOutcome::Miss { boc } = lookup(&index, &key, &headers, None) else {
        panic!("cold index must miss");
    };
    assert!(boc.is_busy());

    boc.promote(obj("body"), exp(Duration::from_secs(60), Duration::ZERO), false, 8);

    // Same key, same outcome, twice in a row.
    for _ in 0..2 {
        let LookupOutcome::Hit { oc, boc } = lookup(&index, &key, &headers, None) else {
            panic!("promoted entry must hit");
        };
        assert!(boc.is_none());
        assert_eq!(oc.object().unwrap().body().unwrap().as_slice(), b"body");
        let _ = index.deref(oc);
    }
}

#[test]
fn busy_bucket_parks_a_waiter() {
    let index = index();
    let key = digest(2);
    let headers = HeaderMap::new();

    let LookupOutcome::Miss { boc } = lookup(&index, &key, &headers, None) else {
        panic!();
    };

    let woken = Arc::new(AtomicUsize::new(0));
    let slot = Arc::new(WaitSlot::new());
    let outcome = lookup(&index, &key, &headers, Some(&slot));
    assert!(matches!(outcome, LookupOutcome::Busy));

    let head = index.head_of(&key).unwrap();
    assert_eq!(head.waiting(), 1);

    let observed = woken.clone();
    slot.park(Box::new(move || {
        observed.fetch_add(1, Ordering::SeqCst);
    }));

    boc.promote(obj("x"), exp(Duration::from_secs(60), Duration::ZERO), false, 8);
    assert_eq!(woken.load(Ordering::SeqCst), 1);
    assert_eq!(head.waiting(), 0);
}

#[test]
fn abandoned_build_rushes_waiters() {
    let index = index();
    let key = digest(3);
    let headers = HeaderMap::new();

    let LookupOutcome::Miss { boc } = lookup(&index, &key, &headers, None) else {
        panic!();
    };
    let slot = Arc::new(WaitSlot::new());
    assert!(matches!(
        lookup(&index, &key, &headers, Some(&slot)),
        LookupOutcome::Busy
    ));

    let woken = Arc::new(AtomicUsize::new(0));
    let observed = woken.clone();
    slot.park(Box::new(move || {
        observed.fetch_add(1, Ordering::SeqCst);
    }));

    // Dropping the busy core abandons the build and lets waiters retry.
    let _ = index.deref(boc);
    assert_eq!(woken.load(Ordering::SeqCst), 1);

    // The retry misses and gets its own build.
    assert!(matches!(
        lookup(&index, &key, &headers, None),
        LookupOutcome::Miss { .. }
    ));
}

#[test]
fn blocking_lookup_waits_out_the_build() {
    let index = index();
    let key = digest(4);
    let headers = HeaderMap::new();

    let LookupOutcome::Miss { boc } = lookup(&index, &key, &headers, None) else {
        panic!();
    };

    let thread_index = index.clone();
    let waiter = std::thread::spawn(move || {
        // No waiting-list slot: this lookup blocks on the bucket.
        match lookup(&thread_index, &digest(4), &HeaderMap::new(), None) {
            LookupOutcome::Hit { oc, .. } => {
                oc.object().unwrap().body().unwrap().as_slice().to_vec()
            }
            _ => panic!("expected a hit after the build resolves"),
        }
    });

    std::thread::sleep(Duration::from_millis(50));
    boc.promote(obj("settled"), exp(Duration::from_secs(60), Duration::ZERO), false, 8);

    assert_eq!(waiter.join().unwrap(), b"settled");
}

#[test]
fn vary_separates_variants() {
    let index = index();
    let key = digest(5);

    let mut en = HeaderMap::new();
    en.insert(ACCEPT_LANGUAGE, "en".parse().unwrap());
    let mut de = HeaderMap::new();
    de.insert(ACCEPT_LANGUAGE, "de".parse().unwrap());

    // Build the English variant.
    let LookupOutcome::Miss { boc } = lookup(&index, &key, &en, None) else {
        panic!();
    };
    let mut resp_headers = HeaderMap::new();
    resp_headers.insert(VARY, "accept-language".parse().unwrap());
    let mut stored = Object::new(StatusCode::OK, resp_headers.clone(), b"english".to_vec());
    stored.vary = cache::VaryKey::capture(&resp_headers, &en);
    boc.promote(
        Arc::new(stored),
        exp(Duration::from_secs(60), Duration::ZERO),
        false,
        8,
    );

    // The German request does not match it.
    let LookupOutcome::Miss { boc } = lookup(&index, &key, &de, None) else {
        panic!("different variance point must miss");
    };
    let mut stored = Object::new(StatusCode::OK, resp_headers.clone(), b"german".to_vec());
    stored.vary = cache::VaryKey::capture(&resp_headers, &de);
    boc.promote(
        Arc::new(stored),
        exp(Duration::from_secs(60), Duration::ZERO),
        false,
        8,
    );

    // Both variants are now retrievable under the one digest.
    let LookupOutcome::Hit { oc, .. } = lookup(&index, &key, &en, None) else {
        panic!();
    };
    assert_eq!(oc.object().unwrap().body().unwrap().as_slice(), b"english");
    let LookupOutcome::Hit { oc, .. } = lookup(&index, &key, &de, None) else {
        panic!();
    };
    assert_eq!(oc.object().unwrap().body().unwrap().as_slice(), b"german");
}

#[test]
fn graced_hit_carries_a_refresh_core() {
    let index = index();
    let key = digest(6);
    let headers = HeaderMap::new();

    let LookupOutcome::Miss { boc } = lookup(&index, &key, &headers, None) else {
        panic!();
    };
    boc.promote(obj("stale"), exp(Duration::ZERO, Duration::from_secs(60)), false, 8);

    let LookupOutcome::Hit { oc, boc } = lookup(&index, &key, &headers, None) else {
        panic!("graced entry must still hit");
    };
    assert_eq!(oc.object().unwrap().body().unwrap().as_slice(), b"stale");
    let refresh = boc.expect("a refresh core accompanies a graced hit");
    assert!(refresh.is_busy());

    // While the refresh runs, further graced hits do not double up.
    let LookupOutcome::Hit { boc: second, .. } = lookup(&index, &key, &headers, None) else {
        panic!();
    };
    assert!(second.is_none());

    let _ = index.deref(refresh);
}

#[test]
fn expired_beyond_grace_is_reaped() {
    let index = index();
    let key = digest(7);
    let headers = HeaderMap::new();

    let LookupOutcome::Miss { boc } = lookup(&index, &key, &headers, None) else {
        panic!();
    };
    boc.promote(obj("gone"), exp(Duration::ZERO, Duration::ZERO), false, 8);

    assert!(matches!(
        lookup(&index, &key, &headers, None),
        LookupOutcome::Miss { .. }
    ));
}

#[test]
fn purge_drops_settled_variants() {
    let index = index();
    let key = digest(8);
    let headers = HeaderMap::new();

    let LookupOutcome::Miss { boc } = lookup(&index, &key, &headers, None) else {
        panic!();
    };
    boc.promote(obj("old"), exp(Duration::from_secs(60), Duration::ZERO), false, 8);

    let head = index.head_of(&key).unwrap();
    assert_eq!(index.purge(&head), 1);

    assert!(matches!(
        lookup(&index, &key, &headers, None),
        LookupOutcome::Miss { .. }
    ));
}

#[test]
fn hit_for_pass_flag_survives_promotion() {
    let index = index();
    let key = digest(9);
    let headers = HeaderMap::new();

    let LookupOutcome::Miss { boc } = lookup(&index, &key, &headers, None) else {
        panic!();
    };
    boc.promote(obj("marker"), exp(Duration::from_secs(60), Duration::ZERO), true, 8);

    let LookupOutcome::Hit { oc, boc } = lookup(&index, &key, &headers, None) else {
        panic!();
    };
    assert!(boc.is_none());
    assert!(oc.flags().contains(ObjFlags::PASS));
}

#[test]
fn drop_obj_backs_out_a_transient_build() {
    let index = index();
    let oc = index.new_objcore();
    oc.promote(
        obj("synthetic"),
        exp(Duration::ZERO, Duration::ZERO),
        false,
        0,
    );
    // The core never entered a bucket; dropping releases the last
    // reference and the object with it.
    assert_eq!(index.drop_obj(oc), 0);
}

#[test]
fn always_miss_skips_matching() {
    let index = index();
    let key = digest(10);
    let headers = HeaderMap::new();

    let LookupOutcome::Miss { boc } = lookup(&index, &key, &headers, None) else {
        panic!();
    };
    boc.promote(obj("there"), exp(Duration::from_secs(60), Duration::ZERO), false, 8);

    let outcome = index.lookup(
        LookupArgs {
            digest: &key,
            req_headers: &headers,
            always_miss: true,
            ignore_busy: false,
        },
        None,
    );
    let LookupOutcome::Miss { boc } = outcome else {
        panic!("always-miss must miss");
    };
    let _ = index.deref(boc);
}
