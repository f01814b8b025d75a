/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! The director target: where a fetch gets its bytes from.

use std::fmt;
use std::time::Duration;

use http::header::CACHE_CONTROL;
use http::{HeaderMap, Method, StatusCode, Version};

/// Head of the backend request assembled from the client request.
#[derive(Clone, Debug)]
pub struct BereqHead {
    pub method: Method,
    pub url: String,
    pub version: Version,
    pub headers: HeaderMap,
}

/// A complete backend answer.
#[derive(Clone, Debug)]
pub struct Beresp {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    /// TTL override; `None` derives one from the response headers or the
    /// configured default.
    pub ttl: Option<Duration>,
    pub grace: Option<Duration>,
    /// Marks the response uncacheable: the entry becomes a hit-for-pass
    /// marker instead of a deliverable object.
    pub uncacheable: bool,
    /// The body carries include markup to pre-parse at store time.
    pub do_esi: bool,
}

impl Beresp {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Vec<u8>) -> Beresp {
        Beresp {
            status,
            headers,
            body,
            ttl: None,
            grace: None,
            uncacheable: false,
            do_esi: false,
        }
    }
}

#[derive(Debug)]
pub enum FetchError {
    /// Could not reach the backend at all.
    Unreachable(String),
    /// The backend answered garbage.
    Backend(String),
    Timeout,
    /// This backend cannot carry a raw pipe.
    PipeUnsupported,
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::Unreachable(why) => write!(f, "backend unreachable: {}", why),
            FetchError::Backend(why) => write!(f, "backend error: {}", why),
            FetchError::Timeout => write!(f, "backend timed out"),
            FetchError::PipeUnsupported => write!(f, "backend does not support pipe"),
        }
    }
}

impl std::error::Error for FetchError {}

/// One routing target. Implementations are shared across workers.
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    /// Run one request/response transaction.
    fn transact(&self, bereq: &BereqHead, body: Option<&[u8]>) -> Result<Beresp, FetchError>;

    /// Shuttle a raw request to the backend and return the raw answer;
    /// the proxy stays out of the byte stream. Optional.
    fn pipe(&self, _bereq: &BereqHead, _client_bytes: &[u8]) -> Result<Vec<u8>, FetchError> {
        Err(FetchError::PipeUnsupported)
    }
}

/// TTL taken from `Cache-Control: s-maxage` or `max-age`, when present.
pub fn ttl_from_headers(headers: &HeaderMap) -> Option<Duration> {
    for value in headers.get_all(CACHE_CONTROL) {
        let Ok(text) = value.to_str() else { continue };
        let mut max_age = None;
        for directive in text.split(',') {
            let directive = directive.trim();
            if let Some(secs) = directive.strip_prefix("s-maxage=") {
                if let Ok(secs) = secs.parse::<u64>() {
                    return Some(Duration::from_secs(secs));
                }
            } else if let Some(secs) = directive.strip_prefix("max-age=") {
                if let Ok(secs) = secs.parse::<u64>() {
                    max_age = Some(Duration::from_secs(secs));
                }
            }
        }
        if let Some(ttl) = max_age {
            return Some(ttl);
        }
    }
    None
}

/// Whether the response forbids storing a deliverable copy.
pub fn uncacheable_by_headers(headers: &HeaderMap) -> bool {
    headers.get_all(CACHE_CONTROL).iter().any(|value| {
        value.to_str().is_ok_and(|text| {
            text.split(',')
                .map(str::trim)
                .any(|d| d == "no-store" || d == "private")
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with(value: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(CACHE_CONTROL, value.parse().unwrap());
        h
    }

    #[test]
    fn s_maxage_beats_max_age() {
        let h = headers_with("max-age=10, s-maxage=60");
        assert_eq!(ttl_from_headers(&h), Some(Duration::from_secs(60)));
    }

    #[test]
    fn max_age_alone() {
        let h = headers_with("public, max-age=30");
        assert_eq!(ttl_from_headers(&h), Some(Duration::from_secs(30)));
    }

    #[test]
    fn no_store_is_uncacheable() {
        assert!(uncacheable_by_headers(&headers_with("no-store")));
        assert!(uncacheable_by_headers(&headers_with("private, max-age=5")));
        assert!(!uncacheable_by_headers(&headers_with("max-age=5")));
    }
}
