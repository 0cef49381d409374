//! Utilities for generating HTTP responses on authentication failures

use http::{header, HeaderValue, Response, StatusCode};

/// Build a `401 Unauthorized` response with an empty body
///
/// The prepared response will have the form:
///
/// ```http
/// HTTP/1.1 401 Unauthorized
/// www-authenticate: Bearer error="invalid_token"
/// ```
///
/// The response is the same whatever the reason for the failure.
pub fn unauthorized<Body: Default>() -> Response<Body> {
    let mut resp = Response::new(Body::default());
    *resp.status_mut() = StatusCode::UNAUTHORIZED;
    resp.headers_mut().insert(
        header::WWW_AUTHENTICATE,
        HeaderValue::from_static(r#"Bearer error="invalid_token""#),
    );
    resp
}
