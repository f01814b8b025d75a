/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! The request-handling state engine, breakwater's central piece.
//!
//! Every client request — and every embedded sub-request synthesized while
//! expanding includes — is driven through the same deterministic state
//! machine. A worker thread picks the request up and spins the dispatch
//! loop; each state handler consults the policy program, talks to the
//! object index or the fetch subsystem, selects the next state and
//! returns. Three things can fall out of one dispatch:
//!
//! * the loop continues with the updated step,
//! * the request terminated and its accounting is settled, or
//! * the lookup ran into a bucket another worker is still populating; the
//!   request is parked on that bucket's waiting list and the worker is
//!   released (*disembark*). When the build resolves, the waiting list
//!   re-queues the request on the pool and it resumes at the lookup step,
//!   usually on a different worker.
//!
//! The engine is protocol-agnostic above the parsed request: embedded
//! include fragments are, for all relevant purposes, a different protocol
//! served by the same states.
//!
//! Handlers hold shared cache objects, metadata cores and fetch contexts
//! across state edges; which of those a request may hold on entry to each
//! state is asserted at the state boundaries, along with the emptiness of
//! the worker's scratch workspace.

#![deny(unsafe_code)]

pub mod fsm;
pub mod pool;
pub mod request;
mod response;
pub mod session;

pub use fsm::Engine;
pub use pool::{Pool, Worker};
pub use request::{AcctReq, CloseReason, Dispatch, ObjHandle, Req, ReqHttp, ResMode, Step};
pub use session::{BufferTransport, Session, SharedBuffer, Transport};

/// Per-request scratch arena. Handlers may borrow it for the duration of
/// one computation; it is returned empty, and the dispatch loop asserts
/// emptiness at every state transition.
pub struct Workspace {
    buf: Vec<u8>,
    cap: usize,
}

impl Workspace {
    pub fn new(cap: usize) -> Workspace {
        Workspace {
            buf: Vec::new(),
            cap,
        }
    }

    /// Run `f` with the scratch buffer; the buffer is cleared when `f`
    /// returns, whatever happened inside.
    pub fn with<R>(&mut self, f: impl FnOnce(&mut Vec<u8>) -> R) -> R {
        debug_assert!(self.buf.is_empty());
        self.buf.reserve(self.cap.min(4096));
        let r = f(&mut self.buf);
        self.buf.clear();
        r
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
