//! Unauthenticated health endpoint.
//!
//! ```text
//! GET /health → 200 {"status":"OK","timestamp":"2026-10-19T08:00:00+00:00","environment":"release"}
//! ```
//!
//! It answers as long as the process can serve HTTP at all; it does not
//! probe the store.

use chrono::{SecondsFormat, Utc};
use serde::Serialize;

use crate::request::Request;
use crate::response::Json;

#[derive(Serialize)]
pub struct Health {
    pub status: &'static str,
    pub timestamp: String,
    pub environment: &'static str,
}

pub async fn status(req: Request) -> Json<Health> {
    Json(Health {
        status: "OK",
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, false),
        environment: req.state().config.mode.as_str(),
    })
}
