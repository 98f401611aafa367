//! The invoice API route table.
//!
//! Everything lives under `/api`, grouped by resource. Each group declares
//! the capability its routes need; auth is the only group that mixes
//! public, authenticated and admin routes.

mod auth;
mod export;
mod logs;
mod records;

use serde_json::{Map, Value};

use crate::auth::Capability;
use crate::error::ApiError;
use crate::method::Method::{Delete, Get, Head, Patch, Post, Put};
use crate::request::Request;
use crate::router::Router;
use crate::store::{AuditEntry, Collection};
use crate::{health, uploads};

/// Builds the full application router.
pub fn routes() -> Router {
    use Capability::{Admin, Authenticated, Public};
    use Collection::{Clients, Deliveries, Invoices, ProductGroups, Products};

    Router::new()
        .on(Get, "/health", health::status)
        .on(Get, "/uploads/*path", uploads::serve)
        .on(Head, "/uploads/*path", uploads::serve)
        .scope("/api/auth", Authenticated, |s| s
            .guarded(Post, "/register", Public, auth::register)
            .guarded(Post, "/login", Public, auth::login)
            .on(Get, "/profile", auth::profile)
            .on(Put, "/profile", auth::update_profile)
            .on(Put, "/change-password", auth::change_password)
            .on(Post, "/logout", auth::logout)
            .guarded(Get, "/users", Admin, auth::list_users)
            .guarded(Post, "/users", Admin, auth::create_user)
            .guarded(Put, "/users/:id/permissions", Admin, auth::update_permissions)
            .guarded(Delete, "/users/:id", Admin, auth::delete_user)
            .guarded(Put, "/users/:id/toggle-status", Admin, auth::toggle_status))
        .scope("/api/clients", Authenticated, |s| s
            .on(Get, "", records::list(Clients))
            .on(Get, "/:id", records::get(Clients))
            .on(Post, "", records::create(Clients))
            .on(Put, "/:id", records::update(Clients))
            .on(Delete, "/:id", records::delete(Clients))
            .on(Get, "/:id/invoices", records::client_linked(Invoices))
            .on(Get, "/:id/deliveries", records::client_linked(Deliveries))
            .on(Get, "/:id/statistics", records::client_statistics))
        .scope("/api/products", Authenticated, |s| s
            .on(Get, "", records::list(Products))
            .on(Get, "/:id", records::get(Products))
            .on(Post, "", records::create(Products))
            .on(Put, "/:id", records::update(Products))
            .on(Delete, "/:id", records::delete(Products)))
        .scope("/api/product-groups", Authenticated, |s| s
            .on(Get, "", records::list(ProductGroups))
            .on(Get, "/:id", records::get(ProductGroups))
            .on(Post, "", records::create(ProductGroups))
            .on(Put, "/:id", records::update(ProductGroups))
            .on(Delete, "/:id", records::delete(ProductGroups))
            .on(Post, "/:id/products", records::add_group_product)
            .on(Delete, "/:id/products/:productId", records::remove_group_product))
        .scope("/api/invoices", Authenticated, |s| s
            .on(Get, "", records::list(Invoices))
            .on(Get, "/:id", records::get(Invoices))
            .on(Post, "", records::create(Invoices))
            .on(Patch, "/:id/status", records::update_invoice_status)
            .on(Patch, "/:id/tracking", records::update_invoice_tracking)
            .on(Delete, "/:id", records::delete(Invoices)))
        .scope("/api/deliveries", Authenticated, |s| s
            .on(Get, "", records::list(Deliveries))
            .on(Get, "/:id", records::get(Deliveries))
            .on(Post, "", records::create(Deliveries))
            .on(Put, "/:id", records::update(Deliveries))
            .on(Delete, "/:id", records::delete(Deliveries)))
        .scope("/api/export", Authenticated, |s| s
            .on(Get, "/invoices", export::export(Invoices))
            .on(Get, "/clients", export::export(Clients)))
        .scope("/api/logs", Authenticated, |s| s
            .on(Get, "", logs::list))
}

/// Records an audit entry for the caller. Failures are logged, not
/// surfaced: the action itself already succeeded.
async fn audit(req: &Request, action: &str, entity: &str, entity_id: Option<uuid::Uuid>) {
    let Some(identity) = req.identity() else {
        return;
    };
    let entry = AuditEntry::new(identity.user_id, action, entity, entity_id);
    if let Err(e) = req.state().store.append_log(entry).await {
        tracing::warn!(action, entity, "failed to write audit entry: {e}");
    }
}

/// The request body as a JSON object.
fn object_body(req: &Request) -> Result<Map<String, Value>, ApiError> {
    match req.json::<Value>()? {
        Value::Object(map) => Ok(map),
        _ => Err(ApiError::bad_request("Request body must be a JSON object")),
    }
}
