//! Response Writer
//!
//! Turns response framing plus a fetch into headers and a streaming body, and
//! maps core errors onto HTTP statuses. This is the only place that knows
//! about status codes.

use bytes::Bytes;
use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Full, StreamBody};
use hyper::body::Frame;
use http::header::{self, HeaderValue};
use http::response::Builder;
use hyper::{Response, StatusCode};
use tokio::sync::mpsc;
use tracing::{debug, error};

use super::protocol::{to_json, ErrorResponse};
use crate::error::StreamError;
use crate::store::{FileMetadata, DEFAULT_CONTENT_TYPE};
use crate::stream::{FetchStream, ResponseFraming};

pub type ResponseBody = UnsyncBoxBody<Bytes, StreamError>;

/// Chunks buffered between the fetch task and the connection
const BODY_CHANNEL_CAPACITY: usize = 2;

const STREAM_CACHE_CONTROL: &str = "public, max-age=3600";

/// How the client should treat the body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Play in place (`/stream`)
    Inline,
    /// Save to disk (`/download`)
    Attachment,
}

pub fn full_body(data: impl Into<Bytes>) -> ResponseBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Empty body with no size hint, so an explicit `Content-Length` survives
pub fn headers_only_body() -> ResponseBody {
    UnsyncBoxBody::new(StreamBody::new(futures::stream::empty::<
        Result<Frame<Bytes>, StreamError>,
    >()))
}

/// Finish a builder, falling back to a bare 500 if a header was invalid
fn finish(builder: Builder, body: ResponseBody) -> Response<ResponseBody> {
    match builder.body(body) {
        Ok(response) => response,
        Err(e) => {
            error!(error = %e, "Failed to build response");
            let mut response = Response::new(full_body(Bytes::new()));
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            response
        }
    }
}

pub fn json_response(status: StatusCode, body: &impl serde::Serialize) -> Response<ResponseBody> {
    match to_json(body) {
        Ok(json) => finish(
            Response::builder()
                .status(status)
                .header(header::CONTENT_TYPE, "application/json")
                .header(header::CONTENT_LENGTH, json.len())
                .header(header::ACCEPT_RANGES, "bytes"),
            full_body(json),
        ),
        Err(e) => {
            error!(error = %e, "Failed to serialize JSON body");
            finish(
                Response::builder().status(StatusCode::INTERNAL_SERVER_ERROR),
                full_body(Bytes::new()),
            )
        }
    }
}

/// Status and machine-readable code for an error
pub fn error_status(err: &StreamError) -> (StatusCode, &'static str) {
    match err {
        StreamError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        StreamError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
        StreamError::RangeNotSatisfiable { .. } => {
            (StatusCode::RANGE_NOT_SATISFIABLE, "range_not_satisfiable")
        }
        StreamError::FileTooLarge { .. } => (StatusCode::BAD_REQUEST, "file_too_large"),
        StreamError::UpstreamTimeout(_) => (StatusCode::GATEWAY_TIMEOUT, "upstream_timeout"),
        StreamError::Upstream(_) => (StatusCode::BAD_GATEWAY, "upstream_error"),
        StreamError::Overloaded { .. } => (StatusCode::SERVICE_UNAVAILABLE, "overloaded"),
        // Never rendered: nobody is listening any more
        StreamError::Cancelled => (StatusCode::INTERNAL_SERVER_ERROR, "cancelled"),
    }
}

/// Render an error that happened before any body byte was sent
pub fn error_response(err: &StreamError) -> Response<ResponseBody> {
    let (status, code) = error_status(err);
    let mut response = json_response(
        status,
        &ErrorResponse {
            error: code.to_string(),
            message: err.to_string(),
        },
    );

    let headers = response.headers_mut();
    match err {
        StreamError::RangeNotSatisfiable { size } => {
            if let Ok(value) = HeaderValue::from_str(&format!("bytes */{}", size)) {
                headers.insert(header::CONTENT_RANGE, value);
            }
        }
        StreamError::Overloaded {
            retry_after_secs, ..
        } => {
            headers.insert(header::RETRY_AFTER, HeaderValue::from(*retry_after_secs));
        }
        _ => {}
    }
    response
}

/// `Content-Disposition` value with an ASCII fallback and an RFC 5987 name
fn content_disposition(disposition: Disposition, name: &str) -> String {
    let kind = match disposition {
        Disposition::Inline => "inline",
        Disposition::Attachment => "attachment",
    };
    let ascii: String = name
        .chars()
        .map(|c| {
            if (c.is_ascii_graphic() && c != '"' && c != '\\') || c == ' ' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!(
        "{}; filename=\"{}\"; filename*=UTF-8''{}",
        kind,
        ascii,
        urlencoding::encode(name)
    )
}

/// Status line and headers for a file response
///
/// Identical for HEAD and GET; only the body differs.
pub fn file_headers(
    framing: &ResponseFraming,
    meta: &FileMetadata,
    disposition: Disposition,
    name_hint: Option<&str>,
) -> Builder {
    let status = StatusCode::from_u16(framing.status()).unwrap_or(StatusCode::OK);
    let name = match (&meta.file_name, name_hint) {
        (None, Some(hint)) if !hint.is_empty() => hint.to_string(),
        _ => meta.display_name(),
    };
    let content_type = match disposition {
        Disposition::Inline => meta.content_type.as_str(),
        Disposition::Attachment => DEFAULT_CONTENT_TYPE,
    };

    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, framing.content_length())
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_DISPOSITION, content_disposition(disposition, &name));

    if let Some(content_range) = framing.content_range() {
        builder = builder.header(header::CONTENT_RANGE, content_range);
    }
    if disposition == Disposition::Inline {
        builder = builder.header(header::CACHE_CONTROL, STREAM_CACHE_CONTROL);
    }
    builder
}

/// Headers with no body (HEAD)
pub fn headers_only(builder: Builder) -> Response<ResponseBody> {
    finish(builder, headers_only_body())
}

/// Headers with an empty body (zero-byte object)
pub fn empty(builder: Builder) -> Response<ResponseBody> {
    finish(builder, full_body(Bytes::new()))
}

/// Headers plus a body fed by `fetch`
///
/// The fetch runs in its own task. If the client goes away the body channel
/// closes, the pump stops and the upstream read and fetch slot are dropped.
/// An upstream failure after headers are out is pushed into the body as an
/// error so the connection is torn down instead of ending cleanly short.
pub fn streaming(builder: Builder, fetch: FetchStream, file_id: String) -> Response<ResponseBody> {
    let (tx, rx) = mpsc::channel::<Result<Bytes, StreamError>>(BODY_CHANNEL_CAPACITY);

    tokio::spawn(async move {
        match fetch.pump(&tx).await {
            Ok(bytes) => debug!(file_id = %file_id, bytes, "Response body complete"),
            Err(StreamError::Cancelled) => {
                debug!(file_id = %file_id, "Client disconnected, upstream read aborted")
            }
            Err(e) => {
                error!(file_id = %file_id, error = %e, "Upstream failed mid-stream, aborting response");
                let _ = tx.send(Err(e)).await;
            }
        }
    });

    let frames = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|item| (item.map(Frame::data), rx))
    });

    finish(builder, UnsyncBoxBody::new(StreamBody::new(frames)))
}
