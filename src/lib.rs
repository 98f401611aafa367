//! # invoicer
//!
//! A REST backend for invoice management: clients, products, product
//! groups, invoices, deliveries, CSV exports and an audit trail, behind
//! bearer-token auth.
//!
//! ## The pipeline
//!
//! Every request walks the same chain, in this order:
//!
//! ```text
//! logging → recovery → cors → rate_limit → authenticate → authorize → handler
//! ```
//!
//! - **Logging** and **recovery** wrap the whole dispatch: one access-log
//!   event per request, and a panic anywhere becomes a 500.
//! - **CORS** admits the configured frontend origin and answers preflights.
//! - **Rate limit** counts requests per client IP in a fixed window.
//! - **Authenticate** turns a bearer token into an [`Identity`], on routes
//!   that need one.
//! - **Authorize** checks the identity's [`Role`] against the route's
//!   [`Capability`].
//!
//! A stage that answers ends the chain; the handler only runs if every
//! stage let the request through.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use invoicer::store::MemoryStore;
//! use invoicer::{api, App, AppState, Config, Server};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let bind = config.bind;
//!     let state = Arc::new(AppState::new(config, Arc::new(MemoryStore::new())));
//!
//!     Server::bind(bind).serve(App::new(state, api::routes())).await?;
//!     Ok(())
//! }
//! ```
//!
//! Handlers are plain async functions of a [`Request`]:
//!
//! ```rust
//! use invoicer::{ApiError, Json, Request};
//!
//! async fn whoami(req: Request) -> Result<Json<String>, ApiError> {
//!     let identity = req.require_identity()?;
//!     Ok(Json(identity.user_id.to_string()))
//! }
//! ```

mod app;
mod config;
mod error;
mod handler;
mod method;
mod request;
mod response;
mod router;
mod server;
mod state;

pub mod api;
pub mod auth;
pub mod health;
pub mod middleware;
pub mod store;
pub mod uploads;

pub use app::App;
pub use auth::{Capability, Identity, Role};
pub use config::{Config, RateLimitConfig, RunMode};
pub use error::{ApiError, Error};
pub use handler::{BoxFuture, Handler};
pub use method::Method;
pub use request::Request;
pub use response::{ContentType, IntoResponse, Json, Response, ResponseBuilder};
pub use router::{Router, Scope};
pub use server::Server;
pub use state::AppState;
