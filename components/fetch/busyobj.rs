/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! The context of one in-flight backend fetch.

use std::sync::Arc;

use cache::{ObjCore, Object};
use parking_lot::{Condvar, Mutex};

use crate::backend::BereqHead;

/// Fetch progress. Advances monotonically; `Failed` and `Finished` are
/// terminal, and "terminal" is expressed as `state >= Failed` throughout.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum FetchState {
    /// Backend request assembled, transaction not yet started.
    ReqDone,
    /// Transaction running.
    Fetch,
    /// Body streaming to storage. Reserved; streaming delivery is not
    /// wired up yet, fetches go straight from `Fetch` to a terminal.
    Stream,
    Failed,
    Finished,
}

impl FetchState {
    pub fn is_terminal(self) -> bool {
        self >= FetchState::Failed
    }
}

struct BoInner {
    state: FetchState,
    err_code: u16,
    fetch_obj: Option<Arc<Object>>,
}

/// Shared fetch context. The requesting worker and the fetch thread each
/// hold a reference; whoever needs the outcome waits on the state.
pub struct BusyObj {
    vxid: u32,
    is_pass: bool,
    oc: Arc<ObjCore>,
    bereq: BereqHead,
    inner: Mutex<BoInner>,
    cond: Condvar,
}

impl BusyObj {
    pub(crate) fn new(vxid: u32, is_pass: bool, oc: Arc<ObjCore>, bereq: BereqHead) -> Arc<BusyObj> {
        Arc::new(BusyObj {
            vxid,
            is_pass,
            oc,
            bereq,
            inner: Mutex::new(BoInner {
                state: FetchState::ReqDone,
                err_code: 0,
                fetch_obj: None,
            }),
            cond: Condvar::new(),
        })
    }

    pub fn vxid(&self) -> u32 {
        self.vxid
    }

    pub fn is_pass(&self) -> bool {
        self.is_pass
    }

    pub fn bereq(&self) -> &BereqHead {
        &self.bereq
    }

    /// The metadata core this fetch is populating.
    pub fn objcore(&self) -> Arc<ObjCore> {
        self.oc.clone()
    }

    pub fn state(&self) -> FetchState {
        self.inner.lock().state
    }

    pub fn err_code(&self) -> u16 {
        self.inner.lock().err_code
    }

    /// The built object, present once `Finished`.
    pub fn fetch_obj(&self) -> Option<Arc<Object>> {
        self.inner.lock().fetch_obj.clone()
    }

    /// Block until the fetch reaches a terminal state and return it.
    pub fn wait_terminal(&self) -> FetchState {
        let mut inner = self.inner.lock();
        while !inner.state.is_terminal() {
            self.cond.wait(&mut inner);
        }
        inner.state
    }

    pub(crate) fn advance(&self, state: FetchState) {
        let mut inner = self.inner.lock();
        debug_assert!(state >= inner.state, "fetch state must not regress");
        inner.state = state;
        drop(inner);
        self.cond.notify_all();
    }

    pub(crate) fn finish(&self, obj: Arc<Object>, err_code: u16) {
        let mut inner = self.inner.lock();
        inner.fetch_obj = Some(obj);
        inner.err_code = err_code;
        inner.state = FetchState::Finished;
        drop(inner);
        self.cond.notify_all();
    }

    pub(crate) fn fail(&self, err_code: u16) {
        let mut inner = self.inner.lock();
        inner.err_code = err_code;
        inner.state = FetchState::Failed;
        drop(inner);
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::FetchState;

    #[test]
    fn terminal_ordering() {
        assert!(!FetchState::ReqDone.is_terminal());
        assert!(!FetchState::Fetch.is_terminal());
        assert!(!FetchState::Stream.is_terminal());
        assert!(FetchState::Failed.is_terminal());
        assert!(FetchState::Finished.is_terminal());
        assert!(FetchState::Finished > FetchState::Failed);
    }
}
