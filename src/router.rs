//! Radix-tree request router.
//!
//! One tree per HTTP method. O(path-length) lookup. Every route carries the
//! [`Capability`] it requires; the dispatcher hands it to the stages.

use std::collections::HashMap;
use std::sync::Arc;

use matchit::Router as MatchitRouter;

use crate::auth::Capability;
use crate::handler::{BoxedHandler, Handler};
use crate::method::Method;

/// What a matched route resolves to.
#[derive(Clone)]
pub(crate) struct Endpoint {
    pub capability: Capability,
    pub handler: BoxedHandler,
}

/// The application router.
///
/// Build it once at startup; hand it to [`App::new`](crate::App::new).
/// Each registration returns `self` so calls chain.
///
/// Patterns take literal segments, `:name` parameters and a trailing
/// `*name` catch-all. Overlapping patterns are rejected at registration, so
/// a request path matches at most one route per method.
pub struct Router {
    routes: HashMap<Method, MatchitRouter<Endpoint>>,
}

impl Router {
    pub fn new() -> Self {
        Self { routes: HashMap::new() }
    }

    /// Register a public handler for a method + path pair.
    pub fn on(self, method: Method, path: &str, handler: impl Handler) -> Self {
        self.add(method, path, Capability::Public, handler)
    }

    /// Register a handler that requires `capability`.
    pub fn guarded(
        self,
        method: Method,
        path: &str,
        capability: Capability,
        handler: impl Handler,
    ) -> Self {
        self.add(method, path, capability, handler)
    }

    /// Register a group of routes under `prefix`, all requiring `capability`
    /// unless overridden with [`Scope::guarded`].
    ///
    /// ```rust,no_run
    /// # use invoicer::{Capability, Method, Request, Response, Router};
    /// # async fn list(_: Request) -> Response { Response::text("") }
    /// # async fn get(_: Request) -> Response { Response::text("") }
    /// Router::new().scope("/api/clients", Capability::Authenticated, |s| s
    ///     .on(Method::Get, "",     list)
    ///     .on(Method::Get, "/:id", get));
    /// ```
    pub fn scope(
        self,
        prefix: &str,
        capability: Capability,
        build: impl FnOnce(Scope) -> Scope,
    ) -> Self {
        build(Scope { router: self, prefix: prefix.to_owned(), capability }).router
    }

    fn add(
        mut self,
        method: Method,
        path: &str,
        capability: Capability,
        handler: impl Handler,
    ) -> Self {
        let endpoint = Endpoint { capability, handler: handler.into_boxed_handler() };
        let pattern = to_matchit(path);
        self.routes
            .entry(method)
            .or_default()
            .insert(pattern, endpoint)
            .unwrap_or_else(|e| panic!("invalid route `{method} {path}`: {e}"));
        self
    }

    pub(crate) fn lookup(
        &self,
        method: Method,
        path: &str,
    ) -> Option<(Endpoint, HashMap<String, String>)> {
        let tree = self.routes.get(&method)?;
        let matched = tree.at(path).ok()?;
        let endpoint = Endpoint {
            capability: matched.value.capability,
            handler: Arc::clone(&matched.value.handler),
        };
        let params = matched.params.iter()
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect();
        Some((endpoint, params))
    }
}

impl Default for Router {
    fn default() -> Self { Self::new() }
}

/// A route group under a common prefix. See [`Router::scope`].
pub struct Scope {
    router: Router,
    prefix: String,
    capability: Capability,
}

impl Scope {
    /// Register a handler with the group's capability.
    pub fn on(self, method: Method, path: &str, handler: impl Handler) -> Self {
        let capability = self.capability;
        self.guarded(method, path, capability, handler)
    }

    /// Register a handler with an explicit capability.
    pub fn guarded(
        mut self,
        method: Method,
        path: &str,
        capability: Capability,
        handler: impl Handler,
    ) -> Self {
        let full = format!("{}{}", self.prefix, path);
        self.router = self.router.add(method, &full, capability, handler);
        self
    }
}

/// Translates `:name` and `*name` segments into matchit's `{name}` and
/// `{*name}`.
fn to_matchit(path: &str) -> String {
    path.split('/')
        .map(|seg| {
            if let Some(name) = seg.strip_prefix(':') {
                format!("{{{name}}}")
            } else if let Some(name) = seg.strip_prefix('*') {
                format!("{{*{name}}}")
            } else {
                seg.to_owned()
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::Response;

    async fn ok(_req: crate::Request) -> Response {
        Response::text("ok")
    }

    #[test]
    fn translates_parameter_syntax() {
        assert_eq!(to_matchit("/api/clients/:id"), "/api/clients/{id}");
        assert_eq!(
            to_matchit("/api/product-groups/:id/products/:productId"),
            "/api/product-groups/{id}/products/{productId}"
        );
        assert_eq!(to_matchit("/uploads/*path"), "/uploads/{*path}");
        assert_eq!(to_matchit("/health"), "/health");
    }

    #[test]
    fn scope_prefixes_and_applies_capability() {
        let router = Router::new()
            .on(Method::Get, "/health", ok)
            .scope("/api/auth", Capability::Authenticated, |s| s
                .guarded(Method::Post, "/login", Capability::Public, ok)
                .on(Method::Get, "/profile", ok)
                .guarded(Method::Get, "/users", Capability::Admin, ok));

        let cap = |m, p| router.lookup(m, p).map(|(e, _)| e.capability);
        assert_eq!(cap(Method::Get, "/health"), Some(Capability::Public));
        assert_eq!(cap(Method::Post, "/api/auth/login"), Some(Capability::Public));
        assert_eq!(cap(Method::Get, "/api/auth/profile"), Some(Capability::Authenticated));
        assert_eq!(cap(Method::Get, "/api/auth/users"), Some(Capability::Admin));
    }

    #[test]
    fn captures_named_parameters() {
        let router = Router::new().on(Method::Delete, "/groups/:id/products/:productId", ok);
        let (_, params) = router.lookup(Method::Delete, "/groups/7/products/9").unwrap();
        assert_eq!(params.get("id").map(String::as_str), Some("7"));
        assert_eq!(params.get("productId").map(String::as_str), Some("9"));
    }

    #[test]
    fn method_mismatch_and_unknown_paths_miss() {
        let router = Router::new().on(Method::Get, "/api/clients", ok);
        assert!(router.lookup(Method::Post, "/api/clients").is_none());
        assert!(router.lookup(Method::Get, "/api/clients/extra").is_none());
        assert!(router.lookup(Method::Get, "/nope").is_none());
    }

    #[test]
    #[should_panic(expected = "invalid route")]
    fn conflicting_routes_are_rejected() {
        let _ = Router::new()
            .on(Method::Get, "/api/clients/:id", ok)
            .on(Method::Get, "/api/clients/:client", ok);
    }
}
