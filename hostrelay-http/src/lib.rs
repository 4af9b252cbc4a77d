//! HTTP surface of the relay.
//!
//! One listener serves both kinds of traffic: `CONNECT` requests to the
//! control path become tunnels, everything else is relayed to the tunnel
//! registered for the request's host.

pub mod host;
pub mod ingress;
pub mod relay;
pub mod upgrade;

pub use ingress::HttpIngress;
pub use relay::RequestRelay;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{header, Response, StatusCode};

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

/// Plain-text response whose body is `message` followed by a newline
pub fn text_response(status: StatusCode, message: &str) -> Response<BoxBody> {
    let body = Full::new(Bytes::from(format!("{message}\n")))
        .map_err(|never| match never {})
        .boxed();
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response.headers_mut().insert(
        header::X_CONTENT_TYPE_OPTIONS,
        header::HeaderValue::from_static("nosniff"),
    );
    response
}

pub(crate) fn empty_body() -> BoxBody {
    http_body_util::Empty::new()
        .map_err(|never| match never {})
        .boxed()
}
