//! Incoming HTTP request type and its per-request context.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::HeaderMap;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::auth::{Capability, Identity};
use crate::error::ApiError;
use crate::method::Method;
use crate::state::AppState;

/// An incoming HTTP request with its body fully read.
///
/// Besides the wire data it carries the context the pipeline builds up:
/// the capability of the matched route, and the [`Identity`] once the
/// authenticator has resolved one.
pub struct Request {
    method: Method,
    path: String,
    query: Option<String>,
    headers: HeaderMap,
    body: Bytes,
    remote_addr: SocketAddr,
    pub(crate) params: HashMap<String, String>,
    pub(crate) capability: Capability,
    identity: Option<Identity>,
    /// Headers a stage wants on the final response, whichever produces it.
    pub(crate) response_headers: HeaderMap,
    state: Arc<AppState>,
}

impl Request {
    pub(crate) fn new(
        method: Method,
        path: String,
        query: Option<String>,
        headers: HeaderMap,
        body: Bytes,
        remote_addr: SocketAddr,
        state: Arc<AppState>,
    ) -> Self {
        Self {
            method,
            path,
            query,
            headers,
            body,
            remote_addr,
            params: HashMap::new(),
            capability: Capability::Public,
            identity: None,
            response_headers: HeaderMap::new(),
            state,
        }
    }

    pub fn method(&self) -> Method { self.method }
    pub fn path(&self) -> &str { &self.path }
    pub fn headers(&self) -> &HeaderMap { &self.headers }
    pub fn body(&self) -> &[u8] { &self.body }
    pub fn remote_addr(&self) -> SocketAddr { self.remote_addr }
    pub fn state(&self) -> &Arc<AppState> { &self.state }

    /// Capability the matched route requires; `Public` when nothing matched.
    pub fn capability(&self) -> Capability { self.capability }

    /// Header lookup; `None` for absent or non-UTF-8 values.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Returns a named path parameter.
    ///
    /// For a route `/clients/:id`, `req.param("id")` on `/clients/42` returns `Some("42")`.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Parses a path parameter as a record id.
    pub fn param_id(&self, key: &str) -> Result<Uuid, ApiError> {
        self.param(key)
            .and_then(|v| Uuid::parse_str(v).ok())
            .ok_or_else(|| ApiError::bad_request(format!("Invalid {key}")))
    }

    /// First value of a query-string parameter, percent-decoded.
    pub fn query(&self, key: &str) -> Option<String> {
        let query = self.query.as_deref()?;
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }

    /// All query-string pairs in order, percent-decoded.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        self.query
            .as_deref()
            .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
            .unwrap_or_default()
    }

    /// Deserialises the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        serde_json::from_slice(&self.body)
            .map_err(|e| ApiError::bad_request(format!("Invalid request body: {e}")))
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    /// The authenticated caller, or `MissingCredential` on a route the
    /// authenticator did not run for.
    pub fn require_identity(&self) -> Result<&Identity, ApiError> {
        self.identity.as_ref().ok_or(ApiError::MissingCredential)
    }

    pub(crate) fn set_identity(&mut self, identity: Identity) {
        self.identity = Some(identity);
    }

    /// Queues a header for the response, including a short-circuit one.
    pub(crate) fn defer_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.response_headers.append(name, value);
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use super::*;
    use crate::config::Config;
    use crate::store::MemoryStore;

    pub fn state() -> Arc<AppState> {
        let config = Config { jwt_secret: "unit-test-secret-0123".to_owned(), ..Config::default() };
        Arc::new(AppState::new(config, Arc::new(MemoryStore::new())))
    }

    pub fn request(state: &Arc<AppState>, method: Method, path: &str) -> Request {
        request_with(state, method, path, &[])
    }

    pub fn request_with(
        state: &Arc<AppState>,
        method: Method,
        path: &str,
        headers: &[(&'static str, &str)],
    ) -> Request {
        let mut map = HeaderMap::new();
        for &(name, value) in headers {
            map.append(HeaderName::from_static(name), HeaderValue::from_str(value).unwrap());
        }
        Request::new(
            method,
            path.to_owned(),
            None,
            map,
            Bytes::new(),
            SocketAddr::from(([127, 0, 0, 1], 40000)),
            Arc::clone(state),
        )
    }

    pub fn set_query(req: &mut Request, query: impl Into<String>) {
        req.query = Some(query.into());
    }
}
