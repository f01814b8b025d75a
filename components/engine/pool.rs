/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! The request-driving worker pool.
//!
//! One worker drives one request at a time; within a request, states run
//! strictly sequentially. When a dispatch disembarks, the worker parks the
//! request's resume thunk on its waiting-list slot and goes back to the
//! queue; the rush re-submits the boxed request, and whichever worker
//! picks it up continues at the lookup step.

use std::sync::Arc;
use std::thread::JoinHandle;

use cache::Stats;
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::debug;

use crate::fsm::Engine;
use crate::request::{Dispatch, Req};
use crate::Workspace;

/// Per-worker state: counters plus the scratch workspace the dispatch
/// loop polices.
pub struct Worker {
    pub stats: Stats,
    pub scratch: Workspace,
}

impl Worker {
    pub fn new(scratch_size: usize) -> Worker {
        Worker {
            stats: Stats::default(),
            scratch: Workspace::new(scratch_size),
        }
    }
}

enum PoolTask {
    Dispatch(Box<Req>),
    Shutdown,
}

/// A fixed set of request-driving threads over one queue.
pub struct Pool {
    tx: Sender<PoolTask>,
    handles: Vec<JoinHandle<()>>,
}

impl Pool {
    pub fn start(engine: Arc<Engine>, threads: usize) -> Pool {
        let (tx, rx) = unbounded();
        let mut handles = Vec::with_capacity(threads);
        for n in 0..threads {
            let engine = engine.clone();
            let rx: Receiver<PoolTask> = rx.clone();
            let resubmit = tx.clone();
            let builder = std::thread::Builder::new().name(format!("req-worker-{}", n));
            let handle = builder
                .spawn(move || worker_loop(engine, rx, resubmit))
                .expect("could not spawn request worker");
            handles.push(handle);
        }
        Pool { tx, handles }
    }

    /// Queue a request for dispatch.
    pub fn submit(&self, req: Box<Req>) {
        let _ = self.tx.send(PoolTask::Dispatch(req));
    }

    /// Stop accepting work and join the workers. Queued requests are
    /// drained first.
    pub fn shutdown(self) {
        for _ in &self.handles {
            let _ = self.tx.send(PoolTask::Shutdown);
        }
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

fn worker_loop(engine: Arc<Engine>, rx: Receiver<PoolTask>, resubmit: Sender<PoolTask>) {
    let scratch_size = engine.params().load().workspace_session;
    let mut wrk = Worker::new(scratch_size);
    for task in rx {
        let mut req = match task {
            PoolTask::Dispatch(req) => req,
            PoolTask::Shutdown => break,
        };
        match engine.cnt_request(&mut wrk, &mut req) {
            Dispatch::Done => {
                if let Some(done_tx) = req.done_tx.take() {
                    let _ = done_tx.send(req);
                }
            }
            Dispatch::Disembark => {
                debug!("vxid {} disembarking", req.vxid);
                let slot = req
                    .wait_slot
                    .take()
                    .expect("disembark without a waiting-list slot");
                let resubmit = resubmit.clone();
                slot.park(Box::new(move || {
                    let _ = resubmit.send(PoolTask::Dispatch(req));
                }));
            }
            Dispatch::More => unreachable!("the dispatch loop cannot yield MORE"),
        }
    }
}
