//! CRUD over the record collections, plus the few routes that look across
//! them: a client's invoices, deliveries and statistics, a product group's
//! members, and invoice status/tracking updates.
//!
//! The generic handlers are built per collection:
//!
//! ```text
//! .on(Get, "/:id", records::get(Collection::Clients))
//! ```

use http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::{audit, object_body};
use crate::error::ApiError;
use crate::handler::Handler;
use crate::request::Request;
use crate::response::{IntoResponse, Json};
use crate::store::{Collection, Record};

const DEFAULT_PAGE: usize = 50;
const MAX_PAGE: usize = 500;

/// Query keys with a meaning of their own; every other key filters.
const CONTROL_KEYS: [&str; 3] = ["limit", "offset", "search"];

#[derive(Serialize)]
pub(super) struct Page {
    pub data: Vec<Record>,
    pub total: usize,
}

/// Renders a top-level scalar the way filters and CSV cells compare it.
/// Arrays, objects and null have no scalar form.
pub(super) fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

fn field_matches(record: &Record, key: &str, want: &str) -> bool {
    match key {
        "id" => record.id.to_string() == want,
        _ => record.fields.get(key).and_then(scalar).is_some_and(|v| v == want),
    }
}

fn search_matches(record: &Record, needle: &str) -> bool {
    record.fields.values().any(|v| match v {
        Value::String(s) => s.to_lowercase().contains(needle),
        _ => false,
    })
}

fn page_param(req: &Request, key: &str, default: usize) -> Result<usize, ApiError> {
    match req.query(key) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| ApiError::bad_request(format!("Invalid {key}"))),
    }
}

/// Applies `?field=value` filters, `?search=`, then `limit`/`offset`.
fn paginate(req: &Request, records: Vec<Record>) -> Result<Page, ApiError> {
    let filters: Vec<(String, String)> = req
        .query_pairs()
        .into_iter()
        .filter(|(k, _)| !CONTROL_KEYS.contains(&k.as_str()))
        .collect();
    let search = req.query("search").map(|s| s.to_lowercase()).filter(|s| !s.is_empty());
    let limit = page_param(req, "limit", DEFAULT_PAGE)?.min(MAX_PAGE);
    let offset = page_param(req, "offset", 0)?;

    let matching: Vec<Record> = records
        .into_iter()
        .filter(|r| filters.iter().all(|(k, v)| field_matches(r, k, v)))
        .filter(|r| search.as_deref().is_none_or(|needle| search_matches(r, needle)))
        .collect();

    let total = matching.len();
    let data = matching.into_iter().skip(offset).take(limit).collect();
    Ok(Page { data, total })
}

async fn fetch(req: &Request, collection: Collection, id: Uuid) -> Result<Record, ApiError> {
    req.state()
        .store
        .get(collection, id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("{} not found", collection.label())))
}

/// Required fields and cross-references, checked before a write.
async fn validate(
    req: &Request,
    collection: Collection,
    fields: &Map<String, Value>,
    creating: bool,
) -> Result<(), ApiError> {
    let needs_name = matches!(
        collection,
        Collection::Clients | Collection::Products | Collection::ProductGroups
    );
    if needs_name {
        match fields.get("name") {
            Some(Value::String(name)) if !name.trim().is_empty() => {}
            None if !creating => {}
            _ => return Err(ApiError::bad_request("Field `name` is required")),
        }
    }

    if matches!(collection, Collection::Invoices | Collection::Deliveries) {
        match fields.get("client_id") {
            Some(Value::String(raw)) => {
                let id = Uuid::parse_str(raw).map_err(|_| ApiError::bad_request("Invalid client_id"))?;
                if req.state().store.get(Collection::Clients, id).await?.is_none() {
                    return Err(ApiError::bad_request("Referenced client does not exist"));
                }
            }
            None if !creating => {}
            _ => return Err(ApiError::bad_request("Field `client_id` is required")),
        }
    }
    Ok(())
}

// ── Generic CRUD ──────────────────────────────────────────────────────────────

/// `GET /api/<collection>`: `{data, total}`, newest first.
pub fn list(collection: Collection) -> impl Handler {
    move |req: Request| async move {
        let records = req.state().store.list(collection).await?;
        let page = paginate(&req, records)?;
        Ok::<_, ApiError>(Json(page))
    }
}

/// `GET /api/<collection>/:id`.
pub fn get(collection: Collection) -> impl Handler {
    move |req: Request| async move {
        let id = req.param_id("id")?;
        let record = fetch(&req, collection, id).await?;
        Ok::<_, ApiError>(Json(record))
    }
}

/// `POST /api/<collection>` → 201 with the stored record.
pub fn create(collection: Collection) -> impl Handler {
    move |req: Request| async move {
        let mut fields = object_body(&req)?;
        validate(&req, collection, &fields, true).await?;
        if collection == Collection::ProductGroups {
            fields.entry(MEMBERS).or_insert_with(|| Value::Array(Vec::new()));
        }

        let record = req.state().store.insert(collection, fields).await?;
        audit(&req, "create", collection.as_str(), Some(record.id)).await;
        Ok::<_, ApiError>((StatusCode::CREATED, Json(record)))
    }
}

/// `PUT /api/<collection>/:id`: merges the body into the record.
pub fn update(collection: Collection) -> impl Handler {
    move |req: Request| async move {
        let id = req.param_id("id")?;
        let fields = object_body(&req)?;
        validate(&req, collection, &fields, false).await?;

        let record = req.state().store.update(collection, id, fields).await?;
        audit(&req, "update", collection.as_str(), Some(record.id)).await;
        Ok::<_, ApiError>(Json(record))
    }
}

/// `DELETE /api/<collection>/:id`.
pub fn delete(collection: Collection) -> impl Handler {
    move |req: Request| async move {
        let id = req.param_id("id")?;
        req.state().store.delete(collection, id).await?;
        audit(&req, "delete", collection.as_str(), Some(id)).await;
        let message = format!("{} deleted successfully", collection.label());
        Ok::<_, ApiError>(Json(serde_json::json!({ "message": message })))
    }
}

// ── Clients ───────────────────────────────────────────────────────────────────

async fn linked_to(req: &Request, collection: Collection, client: Uuid) -> Result<Vec<Record>, ApiError> {
    let client = client.to_string();
    let records = req.state().store.list(collection).await?;
    Ok(records
        .into_iter()
        .filter(|r| r.field_str("client_id") == Some(client.as_str()))
        .collect())
}

/// `GET /api/clients/:id/<invoices|deliveries>`.
pub fn client_linked(collection: Collection) -> impl Handler {
    move |req: Request| async move {
        let client = req.param_id("id")?;
        fetch(&req, Collection::Clients, client).await?;
        let records = linked_to(&req, collection, client).await?;
        let page = paginate(&req, records)?;
        Ok::<_, ApiError>(Json(page))
    }
}

#[derive(Debug, Serialize)]
struct ClientStatistics {
    client_id: Uuid,
    invoice_count: usize,
    delivery_count: usize,
    total_invoiced: f64,
}

/// `GET /api/clients/:id/statistics`.
pub async fn client_statistics(req: Request) -> Result<impl IntoResponse, ApiError> {
    let client = req.param_id("id")?;
    fetch(&req, Collection::Clients, client).await?;

    let invoices = linked_to(&req, Collection::Invoices, client).await?;
    let deliveries = linked_to(&req, Collection::Deliveries, client).await?;
    let total_invoiced = invoices
        .iter()
        .filter_map(|r| r.fields.get("total").and_then(Value::as_f64))
        .sum();

    Ok(Json(ClientStatistics {
        client_id: client,
        invoice_count: invoices.len(),
        delivery_count: deliveries.len(),
        total_invoiced,
    }))
}

// ── Product groups ────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct GroupProductBody {
    product_id: Uuid,
}

const MEMBERS: &str = "product_ids";

/// `POST /api/product-groups/:id/products` with `{"product_id": ...}`.
pub async fn add_group_product(req: Request) -> Result<Json<Record>, ApiError> {
    let group_id = req.param_id("id")?;
    let body: GroupProductBody = req.json()?;
    fetch(&req, Collection::ProductGroups, group_id).await?;
    fetch(&req, Collection::Products, body.product_id).await?;

    let product = Value::String(body.product_id.to_string());
    let (group, added) = req
        .state()
        .store
        .add_member(Collection::ProductGroups, group_id, MEMBERS, product)
        .await?;
    if !added {
        return Err(ApiError::Conflict("Product is already in this group".to_owned()));
    }

    audit(&req, "add_product", Collection::ProductGroups.as_str(), Some(group_id)).await;
    Ok(Json(group))
}

/// `DELETE /api/product-groups/:id/products/:productId`.
pub async fn remove_group_product(req: Request) -> Result<Json<Record>, ApiError> {
    let group_id = req.param_id("id")?;
    let product_id = req.param_id("productId")?;

    let product = Value::String(product_id.to_string());
    let (group, removed) = req
        .state()
        .store
        .remove_member(Collection::ProductGroups, group_id, MEMBERS, product)
        .await?;
    if !removed {
        return Err(ApiError::not_found("Product is not in this group"));
    }

    audit(&req, "remove_product", Collection::ProductGroups.as_str(), Some(group_id)).await;
    Ok(Json(group))
}

// ── Invoices ──────────────────────────────────────────────────────────────────

const TRACKING_FIELDS: [&str; 3] = ["tracking_number", "carrier", "tracking_url"];

#[derive(Deserialize)]
struct StatusBody {
    status: String,
}

/// `PATCH /api/invoices/:id/status` with `{"status": ...}`.
pub async fn update_invoice_status(req: Request) -> Result<Json<Record>, ApiError> {
    let id = req.param_id("id")?;
    let body: StatusBody = req.json()?;
    let status = body.status.trim();
    if status.is_empty() {
        return Err(ApiError::bad_request("Field `status` is required"));
    }

    let mut fields = Map::new();
    fields.insert("status".to_owned(), Value::String(status.to_owned()));
    let record = req.state().store.update(Collection::Invoices, id, fields).await?;
    audit(&req, "update_status", Collection::Invoices.as_str(), Some(id)).await;
    Ok(Json(record))
}

/// `PATCH /api/invoices/:id/tracking`. Only the tracking fields are taken
/// from the body.
pub async fn update_invoice_tracking(req: Request) -> Result<Json<Record>, ApiError> {
    let id = req.param_id("id")?;
    let mut fields = object_body(&req)?;
    fields.retain(|k, _| TRACKING_FIELDS.contains(&k.as_str()));
    if !matches!(fields.get("tracking_number"), Some(Value::String(n)) if !n.trim().is_empty()) {
        return Err(ApiError::bad_request("Field `tracking_number` is required"));
    }

    let record = req.state().store.update(Collection::Invoices, id, fields).await?;
    audit(&req, "update_tracking", Collection::Invoices.as_str(), Some(id)).await;
    Ok(Json(record))
}
