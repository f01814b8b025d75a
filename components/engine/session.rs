/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! The client-side session a request answers into.
//!
//! The engine never touches a socket; it writes through the [`Transport`]
//! the connection manager installed on the session. Tests install an
//! in-memory transport and read the response back through a shared handle,
//! and include expansion uses the same arrangement to capture a fragment.

use std::io;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use policy::ResponseHead;

use crate::request::AcctReq;

/// Byte sink towards the client.
pub trait Transport: Send {
    /// Send the response head. Called at most once per response; not
    /// called at all for embedded fragments and piped requests.
    fn send_head(&mut self, head: &ResponseHead) -> io::Result<()>;

    /// Send already-framed body bytes.
    fn send_body(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// The response is complete.
    fn done(&mut self) -> io::Result<()>;
}

#[derive(Default)]
struct BufferInner {
    head: Option<ResponseHead>,
    body: Vec<u8>,
    finished: bool,
}

/// Reader side of a [`BufferTransport`].
#[derive(Clone, Default)]
pub struct SharedBuffer {
    inner: Arc<Mutex<BufferInner>>,
}

impl SharedBuffer {
    pub fn head(&self) -> Option<ResponseHead> {
        self.inner.lock().head.clone()
    }

    pub fn body(&self) -> Vec<u8> {
        self.inner.lock().body.clone()
    }

    pub fn finished(&self) -> bool {
        self.inner.lock().finished
    }
}

/// An in-memory transport; the test suites and embedded sub-requests
/// deliver into one of these.
pub struct BufferTransport {
    inner: Arc<Mutex<BufferInner>>,
}

impl BufferTransport {
    pub fn new() -> (BufferTransport, SharedBuffer) {
        let shared = SharedBuffer::default();
        (
            BufferTransport {
                inner: shared.inner.clone(),
            },
            shared,
        )
    }
}

impl Transport for BufferTransport {
    fn send_head(&mut self, head: &ResponseHead) -> io::Result<()> {
        self.inner.lock().head = Some(head.clone());
        Ok(())
    }

    fn send_body(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.inner.lock().body.extend_from_slice(bytes);
        Ok(())
    }

    fn done(&mut self) -> io::Result<()> {
        self.inner.lock().finished = true;
        Ok(())
    }
}

/// One client connection's view from the engine.
pub struct Session {
    /// Peer label, for logging only.
    pub peer: String,
    /// When the session last went idle; stamped as a request ends.
    pub t_idle: Instant,
    /// Accounting accumulated across the session's requests.
    pub acct: AcctReq,
    pub transport: Box<dyn Transport>,
}

impl Session {
    pub fn new(peer: impl Into<String>, transport: Box<dyn Transport>) -> Session {
        Session {
            peer: peer.into(),
            t_idle: Instant::now(),
            acct: AcctReq::default(),
            transport,
        }
    }

    /// A session answering into a buffer, returning the reader side too.
    pub fn buffered(peer: impl Into<String>) -> (Session, SharedBuffer) {
        let (transport, shared) = BufferTransport::new();
        (Session::new(peer, Box::new(transport)), shared)
    }
}
