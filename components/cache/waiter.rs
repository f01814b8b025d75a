/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Waiting-list slots.
//!
//! A suspended request is represented by a [`WaitSlot`] parked on the
//! busy bucket. The slot is enlisted *inside* the lookup, under the bucket
//! lock, but the request itself is still owned by the dispatching worker
//! at that point; the worker parks the resume thunk into the slot after it
//! unwinds. The slot therefore has to handle a rush arriving in the window
//! between enlistment and parking: whichever side comes second performs
//! the resume.

use parking_lot::Mutex;

type ResumeThunk = Box<dyn FnOnce() + Send + 'static>;

enum SlotState {
    /// Enlisted, resume thunk not yet parked.
    Enlisted,
    /// Thunk parked, waiting for a rush.
    Parked(ResumeThunk),
    /// Rushed before the thunk arrived; `park` runs it immediately.
    Rushed,
    /// Consumed.
    Spent,
}

/// One entry on a bucket's waiting list.
pub struct WaitSlot {
    state: Mutex<SlotState>,
}

impl WaitSlot {
    pub fn new() -> WaitSlot {
        WaitSlot {
            state: Mutex::new(SlotState::Enlisted),
        }
    }

    /// Park the resume thunk. If the slot was already rushed, the thunk
    /// runs on the spot and the caller has yielded the request.
    pub fn park(&self, thunk: ResumeThunk) {
        let run_now = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, SlotState::Spent) {
                SlotState::Enlisted => {
                    *state = SlotState::Parked(thunk);
                    None
                }
                SlotState::Rushed => Some(thunk),
                SlotState::Parked(_) | SlotState::Spent => {
                    unreachable!("waiting-list slot parked twice")
                }
            }
        };
        if let Some(thunk) = run_now {
            thunk();
        }
    }

    /// Wake the suspended request. Runs the parked thunk, or records the
    /// rush for a `park` still in flight.
    pub fn rush(&self) {
        let thunk = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, SlotState::Spent) {
                SlotState::Parked(thunk) => Some(thunk),
                SlotState::Enlisted => {
                    *state = SlotState::Rushed;
                    None
                }
                // A slot can be rushed again if its bucket resolves twice
                // before the request re-enters; the second rush is a no-op.
                SlotState::Rushed | SlotState::Spent => None,
            }
        };
        if let Some(thunk) = thunk {
            thunk();
        }
    }
}

impl Default for WaitSlot {
    fn default() -> WaitSlot {
        WaitSlot::new()
    }
}
