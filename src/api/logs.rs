//! `GET /api/logs`: the audit trail.
//!
//! Admins see every entry and may filter by `user_id`; everyone else sees
//! only their own. `entity` filters by collection, `limit` caps the page
//! (default 100, at most 1000).

use serde_json::json;
use uuid::Uuid;

use crate::auth::Role;
use crate::error::ApiError;
use crate::request::Request;
use crate::response::Json;
use crate::store::LogQuery;

const DEFAULT_LIMIT: usize = 100;
const MAX_LIMIT: usize = 1000;

fn query(req: &Request) -> Result<LogQuery, ApiError> {
    let identity = req.require_identity()?;

    let limit = match req.query("limit") {
        None => DEFAULT_LIMIT,
        Some(raw) => raw.parse::<usize>().map_err(|_| ApiError::bad_request("Invalid limit"))?,
    };

    let user_id = if identity.role == Role::Admin {
        req.query("user_id")
            .map(|raw| Uuid::parse_str(&raw).map_err(|_| ApiError::bad_request("Invalid user_id")))
            .transpose()?
    } else {
        Some(identity.user_id)
    };

    Ok(LogQuery {
        entity: req.query("entity").filter(|e| !e.is_empty()),
        user_id,
        limit: Some(limit.clamp(1, MAX_LIMIT)),
    })
}

pub async fn list(req: Request) -> Result<Json<serde_json::Value>, ApiError> {
    let logs = req.state().store.logs(query(&req)?).await?;
    Ok(Json(json!({ "total": logs.len(), "data": logs })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Identity;
    use crate::method::Method;
    use crate::request::test_support::{request, set_query, state};

    fn as_role(req: &mut Request, role: Role) -> Uuid {
        let user_id = Uuid::new_v4();
        req.set_identity(Identity { user_id, role, active: true });
        user_id
    }

    #[test]
    fn users_are_pinned_to_their_own_entries() {
        let state = state();
        let mut req = request(&state, Method::Get, "/api/logs");
        set_query(&mut req, format!("user_id={}", Uuid::new_v4()));
        let me = as_role(&mut req, Role::User);
        assert_eq!(query(&req).unwrap().user_id, Some(me));
    }

    #[test]
    fn admins_may_filter_by_user() {
        let state = state();
        let other = Uuid::new_v4();
        let mut req = request(&state, Method::Get, "/api/logs");
        set_query(&mut req, format!("user_id={other}&limit=5000&entity=clients"));
        as_role(&mut req, Role::Admin);

        let q = query(&req).unwrap();
        assert_eq!(q.user_id, Some(other));
        assert_eq!(q.limit, Some(MAX_LIMIT));
        assert_eq!(q.entity.as_deref(), Some("clients"));
    }

    #[test]
    fn default_limit_applies() {
        let state = state();
        let mut req = request(&state, Method::Get, "/api/logs");
        as_role(&mut req, Role::Admin);
        let q = query(&req).unwrap();
        assert_eq!(q.limit, Some(DEFAULT_LIMIT));
        assert_eq!(q.user_id, None);
    }
}
