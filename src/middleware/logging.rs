//! Access log: one event per request, emitted after the response is known.

use std::net::IpAddr;
use std::time::Instant;

use http::StatusCode;
use http::header::USER_AGENT;
use http::request::Parts;

/// What is known about a request before dispatch starts.
pub(crate) struct AccessLog {
    client_ip: IpAddr,
    method: http::Method,
    path: String,
    version: http::Version,
    user_agent: String,
    started: Instant,
}

impl AccessLog {
    pub(crate) fn start(parts: &Parts, client_ip: IpAddr) -> Self {
        Self {
            client_ip,
            method: parts.method.clone(),
            path: parts.uri.path().to_owned(),
            version: parts.version,
            user_agent: parts
                .headers
                .get(USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("-")
                .to_owned(),
            started: Instant::now(),
        }
    }

    pub(crate) fn finish(self, status: StatusCode) {
        let latency_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        if status.is_server_error() {
            tracing::error!(
                target: "invoicer::access",
                client_ip = %self.client_ip,
                method = %self.method,
                path = %self.path,
                version = ?self.version,
                status = status.as_u16(),
                latency_ms,
                user_agent = %self.user_agent,
                "request failed",
            );
        } else {
            tracing::info!(
                target: "invoicer::access",
                client_ip = %self.client_ip,
                method = %self.method,
                path = %self.path,
                version = ?self.version,
                status = status.as_u16(),
                latency_ms,
                user_agent = %self.user_agent,
                "request served",
            );
        }
    }
}
