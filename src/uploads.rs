//! Read-only file serving for `/uploads/*path`.
//!
//! Only plain relative paths below the uploads directory are served; any
//! `..`, absolute or prefixed component is treated as a missing file.
//! Missing files get the same JSON 404 as an unknown route.

use std::path::{Component, Path};

use crate::error::ApiError;
use crate::request::Request;
use crate::response::Response;

pub async fn serve(req: Request) -> Result<Response, ApiError> {
    let rel = req.param("path").unwrap_or_default();
    if !is_plain_relative(rel) {
        tracing::debug!(path = rel, "rejected upload path");
        return Err(ApiError::RouteNotFound);
    }

    let full = req.state().config.uploads_dir.join(rel);
    match tokio::fs::metadata(&full).await {
        Ok(meta) if meta.is_file() => {}
        _ => return Err(ApiError::RouteNotFound),
    }

    let bytes = tokio::fs::read(&full)
        .await
        .map_err(|e| ApiError::internal(format!("reading {}: {e}", full.display())))?;
    let mime = mime_guess::from_path(&full).first_or_octet_stream();

    Ok(Response::builder().typed(mime.as_ref(), bytes))
}

fn is_plain_relative(rel: &str) -> bool {
    !rel.is_empty() && Path::new(rel).components().all(|c| matches!(c, Component::Normal(_)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_plain_relative_paths_pass() {
        assert!(is_plain_relative("invoices/2026/inv-1.pdf"));
        assert!(!is_plain_relative("../secrets.env"));
        assert!(!is_plain_relative("a/../../b"));
        assert!(!is_plain_relative("/etc/passwd"));
        assert!(!is_plain_relative(""));
    }
}
