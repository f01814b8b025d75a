/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! The policy hook ABI of the request engine.
//!
//! A [`PolicyProgram`] is the user-authored program consulted at labelled
//! points of the request lifecycle. Each hook receives a mutable view of the
//! request ([`HookCtx`]) and answers with a [`Verdict`] telling the engine
//! how to proceed. The set of verdicts accepted at each hook is fixed; an
//! out-of-set verdict is a bug in the program and the engine aborts on it.
//!
//! The default trait methods implement the built-in program, so an empty
//! `impl PolicyProgram for MyPolicy {}` behaves like an unconfigured proxy.

#![deny(unsafe_code)]

mod hash;

use http::header::{AUTHORIZATION, COOKIE, HOST};
use http::{HeaderMap, Method, StatusCode};

pub use hash::HashKey;

/// Outcome of one policy hook invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Lookup,
    Hash,
    Pass,
    Pipe,
    Purge,
    Fetch,
    Deliver,
    Restart,
    Error,
}

/// Head of the response being prepared for the client, exposed to the
/// `deliver` and `error` hooks.
#[derive(Clone, Debug)]
pub struct ResponseHead {
    pub status: StatusCode,
    /// Reason phrase override; `None` means the canonical phrase.
    pub reason: Option<String>,
    pub headers: HeaderMap,
}

impl ResponseHead {
    pub fn new(status: StatusCode) -> ResponseHead {
        ResponseHead {
            status,
            reason: None,
            headers: HeaderMap::new(),
        }
    }
}

/// Mutable view of a request, handed to every hook.
///
/// Lifetimes tie the view to the engine's request context; hooks cannot
/// retain any part of it.
pub struct HookCtx<'a> {
    pub method: &'a Method,
    pub url: &'a str,
    pub headers: &'a mut HeaderMap,
    pub esi_level: u32,
    pub restarts: u32,

    /// Index of the director the request will be routed to.
    pub backend: &'a mut usize,

    // Request flags a program may set.
    pub disable_esi: &'a mut bool,
    pub hash_always_miss: &'a mut bool,
    pub hash_ignore_busy: &'a mut bool,

    /// Synthetic status and reason emitted if the request routes through
    /// the error state.
    pub err_code: &'a mut u16,
    pub err_reason: &'a mut Option<String>,
}

impl HookCtx<'_> {
    /// Arrange for a synthetic error response.
    pub fn set_error(&mut self, code: u16, reason: impl Into<String>) {
        *self.err_code = code;
        *self.err_reason = Some(reason.into());
    }
}

/// A user-authored policy program.
///
/// Each method is one hook. The default bodies are the built-in program.
/// Restart from the `pass` hook is not supported and treated as a program
/// bug by the engine.
pub trait PolicyProgram: Send + Sync {
    /// First hook on every (sub)request. Accepted: `Hash`, `Pass`, `Pipe`,
    /// `Purge`, `Error`.
    fn recv(&self, ctx: &mut HookCtx<'_>) -> Verdict {
        // Pipe anything we do not understand, pass anything we must not
        // cache, hash the rest.
        let known = [
            Method::GET,
            Method::HEAD,
            Method::PUT,
            Method::POST,
            Method::DELETE,
            Method::OPTIONS,
            Method::TRACE,
        ];
        if !known.contains(ctx.method) {
            return Verdict::Pipe;
        }
        if *ctx.method != Method::GET && *ctx.method != Method::HEAD {
            return Verdict::Pass;
        }
        if ctx.headers.contains_key(AUTHORIZATION) || ctx.headers.contains_key(COOKIE) {
            return Verdict::Pass;
        }
        Verdict::Hash
    }

    /// Contribute lookup key material. Must return `Lookup`.
    fn hash(&self, ctx: &mut HookCtx<'_>, key: &mut HashKey) -> Verdict {
        key.add(ctx.url.as_bytes());
        if let Some(host) = ctx.headers.get(HOST) {
            key.add(host.as_bytes());
        }
        Verdict::Lookup
    }

    /// A cache hit is in hand. Accepted: `Deliver`, `Fetch`, `Pass`,
    /// `Restart`, `Error`.
    fn lookup(&self, _ctx: &mut HookCtx<'_>) -> Verdict {
        Verdict::Deliver
    }

    /// Nothing cached under the key. Accepted: `Fetch`, `Pass`, `Restart`,
    /// `Error`.
    fn miss(&self, _ctx: &mut HookCtx<'_>) -> Verdict {
        Verdict::Fetch
    }

    /// The request bypasses the cache. Accepted: `Fetch`, `Error`.
    fn pass(&self, _ctx: &mut HookCtx<'_>) -> Verdict {
        Verdict::Fetch
    }

    /// The request is about to be piped verbatim to the backend; the
    /// backend request headers may still be edited. Accepted: `Pipe`.
    fn pipe(&self, _ctx: &mut HookCtx<'_>, _bereq_headers: &mut HeaderMap) -> Verdict {
        Verdict::Pipe
    }

    /// All variants under the key have been invalidated. Accepted: `Error`
    /// (the engine always continues into the error state to synthesize the
    /// purge response).
    fn purge(&self, ctx: &mut HookCtx<'_>) -> Verdict {
        ctx.set_error(200, "Purged");
        Verdict::Error
    }

    /// The response head is built and about to be sent. Accepted:
    /// `Deliver`, `Restart`.
    fn deliver(&self, _ctx: &mut HookCtx<'_>, _resp: &mut ResponseHead) -> Verdict {
        Verdict::Deliver
    }

    /// A synthetic response is being generated. Accepted: `Deliver`,
    /// `Restart`.
    fn error(&self, _ctx: &mut HookCtx<'_>, _resp: &mut ResponseHead) -> Verdict {
        Verdict::Deliver
    }
}

/// The built-in program with no overrides.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultPolicy;

impl PolicyProgram for DefaultPolicy {}
