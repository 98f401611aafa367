//! CORS for a single frontend origin.
//!
//! Requests without an `Origin` header, or from the server's own origin,
//! pass untouched. Requests from the configured frontend get the
//! credentialed allow headers; preflights are answered here. Any other
//! origin is refused with 403.

use std::time::Duration;

use http::header::{
    ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_MAX_AGE, ACCESS_CONTROL_REQUEST_METHOD, HOST,
    ORIGIN, VARY,
};
use http::{HeaderValue, StatusCode};

use super::{Flow, Stage};
use crate::error::ApiError;
use crate::handler::BoxFuture;
use crate::method::Method;
use crate::request::Request;
use crate::response::Response;

const ALLOW_METHODS: &str = "GET, POST, PUT, PATCH, DELETE, HEAD, OPTIONS";
const ALLOW_HEADERS: &str = "Origin, Content-Length, Content-Type, Authorization";

pub struct Cors {
    allowed_origin: String,
    max_age: Duration,
}

impl Cors {
    pub fn new(allowed_origin: impl Into<String>) -> Self {
        Self {
            allowed_origin: allowed_origin.into(),
            max_age: Duration::from_secs(12 * 3600),
        }
    }

    fn preflight(&self) -> Response {
        let mut res = Response::with_status(StatusCode::NO_CONTENT);
        let headers = res.headers_mut();
        headers.insert(ACCESS_CONTROL_ALLOW_METHODS, HeaderValue::from_static(ALLOW_METHODS));
        headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static(ALLOW_HEADERS));
        headers.insert(ACCESS_CONTROL_MAX_AGE, HeaderValue::from(self.max_age.as_secs()));
        res
    }

    fn decide(&self, req: &mut Request) -> Flow {
        let Some(origin) = req.header(ORIGIN.as_str()) else {
            return Flow::Continue;
        };

        if origin != self.allowed_origin {
            if is_same_origin(req, origin) {
                return Flow::Continue;
            }
            tracing::debug!(origin, "cross-origin request refused");
            return Flow::reject(ApiError::OriginNotAllowed);
        }

        let Ok(origin) = HeaderValue::from_str(origin) else {
            return Flow::reject(ApiError::OriginNotAllowed);
        };
        let is_preflight =
            req.method() == Method::Options && req.headers().contains_key(ACCESS_CONTROL_REQUEST_METHOD);

        req.defer_header(ACCESS_CONTROL_ALLOW_ORIGIN, origin);
        req.defer_header(ACCESS_CONTROL_ALLOW_CREDENTIALS, HeaderValue::from_static("true"));
        req.defer_header(VARY, HeaderValue::from_static("Origin"));

        if is_preflight {
            Flow::Terminate(self.preflight())
        } else {
            Flow::Continue
        }
    }
}

impl Stage for Cors {
    fn name(&self) -> &'static str { "cors" }

    fn call<'a>(&'a self, req: &'a mut Request) -> BoxFuture<'a, Flow> {
        Box::pin(std::future::ready(self.decide(req)))
    }
}

fn is_same_origin(req: &Request, origin: &str) -> bool {
    let Some(host) = req.header(HOST.as_str()) else {
        return false;
    };
    origin
        .strip_prefix("http://")
        .or_else(|| origin.strip_prefix("https://"))
        .is_some_and(|rest| rest == host)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::test_support::{request_with, state};

    const FRONTEND: &str = "http://localhost:8080";

    #[test]
    fn no_origin_passes_without_headers() {
        let state = state();
        let mut req = request_with(&state, Method::Get, "/api/clients", &[]);
        assert!(matches!(Cors::new(FRONTEND).decide(&mut req), Flow::Continue));
        assert!(req.response_headers.is_empty());
    }

    #[test]
    fn allowed_origin_gets_credentialed_headers() {
        let state = state();
        let mut req = request_with(&state, Method::Get, "/api/clients", &[("origin", FRONTEND)]);
        assert!(matches!(Cors::new(FRONTEND).decide(&mut req), Flow::Continue));
        assert_eq!(req.response_headers.get(ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(), FRONTEND);
        assert_eq!(req.response_headers.get(ACCESS_CONTROL_ALLOW_CREDENTIALS).unwrap(), "true");
    }

    #[test]
    fn preflight_is_answered_directly() {
        let state = state();
        let mut req = request_with(
            &state,
            Method::Options,
            "/api/invoices",
            &[("origin", FRONTEND), ("access-control-request-method", "PATCH")],
        );
        match Cors::new(FRONTEND).decide(&mut req) {
            Flow::Terminate(res) => {
                assert_eq!(res.status(), StatusCode::NO_CONTENT);
                assert_eq!(res.header("access-control-max-age"), Some("43200"));
                assert!(res.header("access-control-allow-methods").unwrap().contains("PATCH"));
            }
            Flow::Continue => panic!("preflight should terminate"),
        }
    }

    #[test]
    fn foreign_origin_is_forbidden() {
        let state = state();
        let mut req = request_with(&state, Method::Get, "/api/clients", &[("origin", "https://evil.example")]);
        match Cors::new(FRONTEND).decide(&mut req) {
            Flow::Terminate(res) => assert_eq!(res.status(), StatusCode::FORBIDDEN),
            Flow::Continue => panic!("foreign origin should be refused"),
        }
    }

    #[test]
    fn same_origin_passes() {
        let state = state();
        let mut req = request_with(
            &state,
            Method::Post,
            "/api/auth/login",
            &[("origin", "http://api.example.com"), ("host", "api.example.com")],
        );
        assert!(matches!(Cors::new(FRONTEND).decide(&mut req), Flow::Continue));
    }
}
