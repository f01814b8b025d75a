/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Response assembly: head building and body writing.
//!
//! The framing was already chosen while preparing the response; this
//! module materializes it — Content-Length for known lengths, chunked
//! framing otherwise, gunzip filtering when the stored copy is gzipped
//! and the client cannot take it, and include expansion for objects
//! stored with pre-parsed markup.

use std::io::{self, Read};
use std::sync::Arc;
use std::time::SystemTime;

use breakwater_config::Params;
use cache::EsiSegment;
use flate2::read::GzDecoder;
use headers::{ContentLength, Date, HeaderMapExt};
use http::header::{CONNECTION, CONTENT_LENGTH, DATE, SERVER, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderValue};
use log::warn;
use policy::ResponseHead;

use crate::fsm::Engine;
use crate::pool::Worker;
use crate::request::{ObjHandle, Req, ResMode};

/// Build the response head from the stored object, per the chosen mode.
/// At most `http_max_hdr` stored headers are carried over.
pub(crate) fn build_head(req: &Req, handle: &ObjHandle, params: &Params) -> ResponseHead {
    let obj = &handle.obj;
    let mut head = ResponseHead::new(obj.status);
    head.reason = obj.reason.clone();

    let mut headers = HeaderMap::new();
    for (name, value) in obj.headers.iter() {
        if headers.len() >= params.http_max_hdr {
            warn!(
                "vxid {} response head capped at {} headers",
                req.vxid, params.http_max_hdr
            );
            break;
        }
        headers.append(name.clone(), value.clone());
    }
    head.headers = headers;

    // Framing is ours to decide, whatever the stored copy carried.
    head.headers.remove(CONTENT_LENGTH);
    head.headers.remove(TRANSFER_ENCODING);
    head.headers.remove(CONNECTION);

    if !head.headers.contains_key(DATE) {
        head.headers.typed_insert(Date::from(SystemTime::now()));
    }
    if !head.headers.contains_key(SERVER) {
        head.headers
            .insert(SERVER, HeaderValue::from_static("breakwater"));
    }

    if req.res_mode.contains(ResMode::LEN) {
        head.headers
            .typed_insert(ContentLength(obj.body_len().unwrap_or(0) as u64));
    }
    if req.res_mode.contains(ResMode::CHUNKED) {
        head.headers
            .insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
    }
    if req.res_mode.contains(ResMode::EOF) || req.doclose.is_some() {
        head.headers
            .insert(CONNECTION, HeaderValue::from_static("close"));
    }
    head
}

/// Write the response to the session transport.
pub(crate) fn write_obj(engine: &Engine, wrk: &mut Worker, req: &mut Req) -> io::Result<()> {
    let handle = req
        .obj
        .clone()
        .expect("writing a response without an object");
    let mode = req.res_mode;

    if !mode.contains(ResMode::ESI_CHILD) {
        let head = req
            .resp
            .as_ref()
            .expect("writing a response without a prepared head");
        req.sess.transport.send_head(head)?;
    }
    if !req.wantbody {
        return req.sess.transport.done();
    }

    let body = handle.obj.body().unwrap_or_else(|| Arc::new(Vec::new()));
    // An embedded fragment is spliced raw into the parent's body stream.
    let chunked = mode.contains(ResMode::CHUNKED) && !mode.contains(ResMode::ESI_CHILD);
    let expand = handle.obj.esi.is_some()
        && !req.disable_esi
        && mode.intersects(ResMode::ESI | ResMode::ESI_CHILD);

    if expand {
        let segments = handle.obj.esi.clone().unwrap_or_default();
        for segment in segments {
            match segment {
                EsiSegment::Bytes(span) => emit(req, chunked, &body[span])?,
                EsiSegment::Include(src) => {
                    let fragment = engine.esi_child(wrk, req, &src);
                    emit(req, chunked, &fragment)?;
                }
            }
        }
    } else if mode.contains(ResMode::GUNZIP) {
        // The stored copy is gzipped, the client cannot take it.
        let mut decoded = Vec::new();
        GzDecoder::new(body.as_slice()).read_to_end(&mut decoded)?;
        emit(req, chunked, &decoded)?;
    } else {
        emit(req, chunked, &body)?;
    }

    if chunked {
        req.sess.transport.send_body(b"0\r\n\r\n")?;
    }
    req.sess.transport.done()
}

fn emit(req: &mut Req, chunked: bool, bytes: &[u8]) -> io::Result<()> {
    if bytes.is_empty() {
        return Ok(());
    }
    if chunked {
        let frame = format!("{:x}\r\n", bytes.len());
        req.sess.transport.send_body(frame.as_bytes())?;
        req.sess.transport.send_body(bytes)?;
        req.sess.transport.send_body(b"\r\n")?;
    } else {
        req.sess.transport.send_body(bytes)?;
    }
    req.resp_bodybytes += bytes.len() as u64;
    Ok(())
}
