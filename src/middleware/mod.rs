//! Middleware stages.
//!
//! Every request walks the same ordered chain:
//!
//! ```text
//! logging → recovery → cors → rate_limit → authenticate → authorize → handler
//! ```
//!
//! `logging` and `recovery` wrap the whole dispatch (they need to see the
//! final response and any panic). The rest are [`Stage`]s: each one looks at
//! the request, may enrich its context, and answers with a [`Flow`]. The
//! [`App`](crate::App) runs them in a plain loop; the first
//! [`Flow::Terminate`] ends the chain and its response is sent as-is.

mod auth;
mod cors;
pub(crate) mod logging;
mod rate_limit;
pub(crate) mod recovery;

pub use auth::{Authenticate, Authorize};
pub use cors::Cors;
pub use rate_limit::{client_ip, Decision, RateLimit, RateLimiter};

use crate::error::ApiError;
use crate::handler::BoxFuture;
use crate::request::Request;
use crate::response::{IntoResponse, Response};

/// Outcome of one stage.
#[derive(Debug)]
pub enum Flow {
    /// Hand the (possibly enriched) request to the next stage.
    Continue,
    /// Stop here and send this response.
    Terminate(Response),
}

impl Flow {
    pub fn reject(err: ApiError) -> Self {
        Flow::Terminate(err.into_response())
    }
}

/// One step of the request pipeline.
pub trait Stage: Send + Sync + 'static {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    fn call<'a>(&'a self, req: &'a mut Request) -> BoxFuture<'a, Flow>;
}
