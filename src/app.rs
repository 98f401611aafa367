//! The dispatcher: router + ordered stages + injected state.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::HeaderMap;
use http::request::Parts;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::Body;

use crate::error::ApiError;
use crate::method::Method;
use crate::middleware::logging::AccessLog;
use crate::middleware::{recovery, Authenticate, Authorize, Cors, Flow, RateLimit, RateLimiter, Stage};
use crate::request::Request;
use crate::response::{IntoResponse, Response};
use crate::router::Router;
use crate::state::AppState;

/// A ready-to-serve application.
///
/// Owns everything a request needs: the routing table, the stage chain and
/// the shared [`AppState`]. Build one per process (or per test) and hand it
/// to [`Server::serve`](crate::Server::serve), or drive it directly with
/// [`App::dispatch`].
pub struct App {
    router: Router,
    stages: Vec<Box<dyn Stage>>,
    state: Arc<AppState>,
    limiter: Option<Arc<RateLimiter>>,
}

impl App {
    /// The standard chain: CORS → rate limit → authenticate → authorize.
    pub fn new(state: Arc<AppState>, router: Router) -> Self {
        let rate_limit = RateLimit::new(&state.config.rate_limit);
        let limiter = rate_limit.limiter();
        let stages: Vec<Box<dyn Stage>> = vec![
            Box::new(Cors::new(state.config.frontend_origin.clone())),
            Box::new(rate_limit),
            Box::new(Authenticate::new(Arc::clone(&state.tokens), Arc::clone(&state.identities))),
            Box::new(Authorize),
        ];
        Self { router, stages, state, limiter: Some(limiter) }
    }

    /// A custom chain. Logging and recovery still wrap it.
    pub fn with_stages(state: Arc<AppState>, router: Router, stages: Vec<Box<dyn Stage>>) -> Self {
        Self { router, stages, state, limiter: None }
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// The counters of the standard rate-limit stage, if this app has one.
    pub fn rate_limiter(&self) -> Option<Arc<RateLimiter>> {
        self.limiter.clone()
    }

    /// Full dispatch of one HTTP request: body collection, every stage, the
    /// handler, panic recovery and the access log.
    pub async fn dispatch<B>(&self, req: http::Request<B>, remote_addr: SocketAddr) -> Response
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let (parts, body) = req.into_parts();
        let access = AccessLog::start(&parts, remote_addr.ip());
        let res = recovery::catch_panic(self.prepare(parts, body, remote_addr)).await;
        access.finish(res.status());
        res
    }

    async fn prepare<B>(&self, parts: Parts, body: B, remote_addr: SocketAddr) -> Response
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let Ok(method) = Method::try_from(&parts.method) else {
            return ApiError::RouteNotFound.into_response();
        };

        let body = match Limited::new(body, self.state.config.max_body_bytes).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.is::<LengthLimitError>() => return ApiError::PayloadTooLarge.into_response(),
            Err(e) => {
                tracing::debug!("failed to read request body: {e}");
                return ApiError::bad_request("Failed to read request body").into_response();
            }
        };

        let req = Request::new(
            method,
            parts.uri.path().to_owned(),
            parts.uri.query().map(str::to_owned),
            parts.headers,
            body,
            remote_addr,
            Arc::clone(&self.state),
        );
        self.handle(req).await
    }

    /// The stage loop. A request reaches its handler only if every stage
    /// returned [`Flow::Continue`].
    pub(crate) async fn handle(&self, mut req: Request) -> Response {
        let endpoint = match self.router.lookup(req.method(), req.path()) {
            Some((endpoint, params)) => {
                req.capability = endpoint.capability;
                req.params = params;
                Some(endpoint)
            }
            None => None,
        };

        for stage in &self.stages {
            if let Flow::Terminate(res) = stage.call(&mut req).await {
                tracing::debug!(
                    stage = stage.name(),
                    status = res.status().as_u16(),
                    path = req.path(),
                    "request short-circuited",
                );
                return with_deferred(res, std::mem::take(&mut req.response_headers));
            }
        }

        let deferred = std::mem::take(&mut req.response_headers);
        let res = match endpoint {
            Some(endpoint) => endpoint.handler.call(req).await,
            None => ApiError::RouteNotFound.into_response(),
        };
        with_deferred(res, deferred)
    }
}

fn with_deferred(mut res: Response, deferred: HeaderMap) -> Response {
    res.headers_mut().extend(deferred);
    res
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use http::StatusCode;
    use http_body_util::Full;

    use super::*;
    use crate::auth::Capability;
    use crate::handler::BoxFuture;
    use crate::request::test_support::state;

    struct Count(Arc<AtomicUsize>);

    impl Stage for Count {
        fn name(&self) -> &'static str { "count" }

        fn call<'a>(&'a self, _req: &'a mut Request) -> BoxFuture<'a, Flow> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Box::pin(std::future::ready(Flow::Continue))
        }
    }

    struct Deny;

    impl Stage for Deny {
        fn name(&self) -> &'static str { "deny" }

        fn call<'a>(&'a self, _req: &'a mut Request) -> BoxFuture<'a, Flow> {
            Box::pin(std::future::ready(Flow::reject(ApiError::InsufficientRole)))
        }
    }

    fn get(path: &str) -> http::Request<Full<Bytes>> {
        http::Request::builder().uri(path).body(Full::new(Bytes::new())).unwrap()
    }

    fn peer() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 50000))
    }

    #[tokio::test]
    async fn terminate_skips_later_stages_and_handler() {
        let hits = Arc::new(AtomicUsize::new(0));
        let handler_hits = Arc::clone(&hits);
        let router = Router::new().on(Method::Get, "/x", move |_req: Request| {
            handler_hits.fetch_add(100, Ordering::SeqCst);
            async { Response::text("x") }
        });
        let app = App::with_stages(
            state(),
            router,
            vec![Box::new(Count(Arc::clone(&hits))), Box::new(Deny), Box::new(Count(Arc::clone(&hits)))],
        );

        let res = app.dispatch(get("/x"), peer()).await;
        assert_eq!(res.status(), StatusCode::FORBIDDEN);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stages_run_for_unmatched_routes_then_404() {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = App::with_stages(state(), Router::new(), vec![Box::new(Count(Arc::clone(&hits)))]);
        let res = app.dispatch(get("/missing"), peer()).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        assert_eq!(res.body(), br#"{"error":"Route not found"}"#);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_method_is_not_found() {
        let app = App::with_stages(state(), Router::new(), vec![]);
        let req = http::Request::builder()
            .method("PROPFIND")
            .uri("/")
            .body(Full::new(Bytes::new()))
            .unwrap();
        assert_eq!(app.dispatch(req, peer()).await.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn panicking_handler_is_recovered() {
        async fn explode(_req: Request) -> Response {
            panic!("handler bug")
        }
        let router = Router::new().on(Method::Get, "/boom", explode);
        let app = App::with_stages(state(), router, vec![]);
        let res = app.dispatch(get("/boom"), peer()).await;
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let state = state();
        let limit = state.config.max_body_bytes;
        let app = App::with_stages(state, Router::new(), vec![]);
        let req = http::Request::builder()
            .method("POST")
            .uri("/api/clients")
            .body(Full::new(Bytes::from(vec![b'x'; limit + 1])))
            .unwrap();
        assert_eq!(app.dispatch(req, peer()).await.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn handler_sees_route_capability_and_params() {
        let router = Router::new().guarded(
            Method::Get,
            "/items/:id",
            Capability::Authenticated,
            |req: Request| async move {
                format!("{:?} {}", req.capability(), req.param("id").unwrap_or("-"))
            },
        );
        let app = App::with_stages(state(), router, vec![]);
        let res = app.dispatch(get("/items/42"), peer()).await;
        assert_eq!(res.body(), b"Authenticated 42");
    }
}
