//! Panic recovery: a panicking stage or handler becomes a 500, not a dead
//! connection.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;

use crate::response::{IntoResponse, Json, Response};

pub(crate) async fn catch_panic<F>(fut: F) -> Response
where
    F: Future<Output = Response>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(res) => res,
        Err(payload) => {
            tracing::error!(panic = %panic_message(payload.as_ref()), "request panicked");
            let mut res = Json(serde_json::json!({ "error": "Internal server error" })).into_response();
            res.set_status(http::StatusCode::INTERNAL_SERVER_ERROR);
            res
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
