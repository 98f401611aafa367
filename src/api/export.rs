//! CSV exports.
//!
//! One row per record, newest first. Columns are `id`, `created_at`,
//! `updated_at`, then the union of every record's top-level scalar fields
//! in alphabetical order. Nested values are left out; a record without a
//! column gets an empty cell. Text that a spreadsheet would evaluate as a
//! formula is prefixed with `'`.

use std::collections::BTreeSet;

use serde_json::Value;

use super::audit;
use super::records::scalar;
use crate::error::ApiError;
use crate::handler::Handler;
use crate::request::Request;
use crate::response::{ContentType, Response};
use crate::store::{Collection, Record};

const META_COLUMNS: [&str; 3] = ["id", "created_at", "updated_at"];

/// `GET /api/export/<collection>`.
pub fn export(collection: Collection) -> impl Handler {
    move |req: Request| async move {
        let records = req.state().store.list(collection).await?;
        let csv = to_csv(&records);
        audit(&req, "export", collection.as_str(), None).await;
        tracing::debug!(collection = collection.as_str(), rows = records.len(), "export");

        let disposition = format!("attachment; filename=\"{}.csv\"", collection.as_str());
        Ok::<_, ApiError>(
            Response::builder()
                .header("content-disposition", &disposition)
                .bytes(ContentType::Csv, csv),
        )
    }
}

fn columns(records: &[Record]) -> Vec<String> {
    let fields: BTreeSet<&str> = records
        .iter()
        .flat_map(|r| r.fields.iter())
        .filter(|(k, v)| scalar(v).is_some() && !META_COLUMNS.contains(&k.as_str()))
        .map(|(k, _)| k.as_str())
        .collect();
    META_COLUMNS
        .iter()
        .copied()
        .chain(fields)
        .map(str::to_owned)
        .collect()
}

fn to_csv(records: &[Record]) -> String {
    let columns = columns(records);
    let mut out = String::new();
    let header: Vec<String> = columns.iter().map(|c| defuse(c)).collect();
    write_row(&mut out, header.iter().map(String::as_str));

    for record in records {
        let cells: Vec<String> = columns
            .iter()
            .map(|c| match c.as_str() {
                "id" => record.id.to_string(),
                "created_at" => record.created_at.to_rfc3339(),
                "updated_at" => record.updated_at.to_rfc3339(),
                key => match record.fields.get(key) {
                    Some(Value::String(text)) => defuse(text),
                    other => other.and_then(scalar).unwrap_or_default(),
                },
            })
            .collect();
        write_row(&mut out, cells.iter().map(String::as_str));
    }
    out
}

fn write_row<'a>(out: &mut String, cells: impl Iterator<Item = &'a str>) {
    for (i, cell) in cells.enumerate() {
        if i > 0 {
            out.push(',');
        }
        push_cell(out, cell);
    }
    out.push_str("\r\n");
}

/// Spreadsheets evaluate text starting with one of these as a formula.
const FORMULA_TRIGGERS: [char; 6] = ['=', '+', '-', '@', '\t', '\r'];

/// Prefixes client-supplied text that a spreadsheet would run as a formula
/// with `'`, so it is shown as text.
fn defuse(text: &str) -> String {
    if text.starts_with(FORMULA_TRIGGERS) {
        format!("'{text}")
    } else {
        text.to_owned()
    }
}

/// Quotes a cell when it holds a separator, quote or line break (RFC 4180).
fn push_cell(out: &mut String, cell: &str) {
    if cell.contains([',', '"', '\r', '\n']) {
        out.push('"');
        out.push_str(&cell.replace('"', "\"\""));
        out.push('"');
    } else {
        out.push_str(cell);
    }
}
