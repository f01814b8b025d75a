/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Variance axis handling.
//!
//! A stored response carrying a `Vary` header only matches requests whose
//! values for the named headers equal the values of the request that
//! populated the entry. The populating request's values are captured into
//! a [`VaryKey`] at store time; lookups compare candidate keys against the
//! live request headers.

use http::header::{HeaderName, HeaderValue, VARY};
use http::HeaderMap;

/// The variance-axis values one variant was stored under.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VaryKey {
    axes: Vec<(HeaderName, Option<HeaderValue>)>,
}

impl VaryKey {
    /// Capture the variance key for a response with the given `Vary`
    /// contents, reading the populating request's headers.
    ///
    /// Returns `None` when the response does not vary, and a wildcard
    /// (unmatchable) key for `Vary: *`.
    pub fn capture(resp_headers: &HeaderMap, req_headers: &HeaderMap) -> Option<VaryKey> {
        let mut axes = Vec::new();
        let mut any = false;
        for value in resp_headers.get_all(VARY) {
            let Ok(list) = value.to_str() else {
                continue;
            };
            for name in list.split(',') {
                any = true;
                let name = name.trim();
                if name == "*" {
                    // Never matchable; represented by an axis no request
                    // header can satisfy.
                    return Some(VaryKey {
                        axes: vec![(VARY, None)],
                    });
                }
                let Ok(name) = name.parse::<HeaderName>() else {
                    continue;
                };
                let value = req_headers.get(&name).cloned();
                axes.push((name, value));
            }
        }
        if any { Some(VaryKey { axes }) } else { None }
    }

    /// Whether a live request falls on the same point of the variance
    /// axis.
    pub fn matches(&self, req_headers: &HeaderMap) -> bool {
        self.axes.iter().all(|(name, stored)| {
            if *name == VARY {
                // Wildcard axis from `Vary: *`.
                return false;
            }
            req_headers.get(name) == stored.as_ref()
        })
    }

    pub fn is_empty(&self) -> bool {
        self.axes.is_empty()
    }
}
