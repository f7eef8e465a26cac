//! Gateway-produced responses.
//!
//! A gateway status is sent trailers-only: HTTP 200 with `grpc-status` and
//! `grpc-message` in the headers and an empty body that ends the stream.

use axum::body::Body;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderValue, Response, StatusCode};
use axum::response::IntoResponse;

use crate::grpc::{self, Status};

pub fn status_response(status: &Status) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(grpc::CONTENT_TYPE));
    headers.extend(status.to_header_map());
    response
}

/// Plain HTTP answer for requests that are not gRPC at all.
pub fn unsupported_media_type() -> Response<Body> {
    (StatusCode::UNSUPPORTED_MEDIA_TYPE, "expected content-type application/grpc").into_response()
}
