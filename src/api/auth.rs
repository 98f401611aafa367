//! Accounts: registration, login, the caller's profile and admin user
//! management.

use chrono::{DateTime, Utc};
use http::StatusCode;
use serde::{Deserialize, Serialize};

use super::audit;
use crate::auth::password::{hash_password_blocking, verify_password_blocking};
use crate::auth::Role;
use crate::error::ApiError;
use crate::request::Request;
use crate::response::{IntoResponse, Json};
use crate::store::UserRecord;

const MIN_PASSWORD_LEN: usize = 6;

#[derive(Deserialize)]
struct RegisterBody {
    username: String,
    email: String,
    password: String,
    #[serde(default)]
    full_name: Option<String>,
}

#[derive(Deserialize)]
struct LoginBody {
    /// Username or email.
    #[serde(alias = "email", alias = "login")]
    username: String,
    password: String,
}

#[derive(Deserialize)]
struct ProfileBody {
    email: Option<String>,
    full_name: Option<String>,
}

#[derive(Deserialize)]
struct ChangePasswordBody {
    current_password: String,
    new_password: String,
}

#[derive(Deserialize)]
struct CreateUserBody {
    username: String,
    email: String,
    password: String,
    #[serde(default)]
    full_name: Option<String>,
    #[serde(default)]
    role: Role,
    #[serde(default)]
    permissions: Vec<String>,
}

#[derive(Deserialize)]
struct PermissionsBody {
    permissions: Vec<String>,
}

#[derive(Serialize)]
struct Session {
    token: String,
    expires_at: DateTime<Utc>,
    user: UserRecord,
}

fn validate_account(username: &str, email: &str, password: &str) -> Result<(), ApiError> {
    if username.trim().len() < 3 {
        return Err(ApiError::bad_request("Username must be at least 3 characters"));
    }
    if !email.contains('@') {
        return Err(ApiError::bad_request("Invalid email address"));
    }
    validate_password(password)
}

fn validate_password(password: &str) -> Result<(), ApiError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(ApiError::bad_request(format!(
            "Password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    Ok(())
}

fn session(req: &Request, user: UserRecord) -> Result<Session, ApiError> {
    let issued = req.state().tokens.issue(user.id, user.role)?;
    Ok(Session { token: issued.token, expires_at: issued.expires_at, user })
}

/// `POST /api/auth/register`. The very first account becomes an admin; the
/// store decides that at insert time.
pub async fn register(req: Request) -> Result<impl IntoResponse, ApiError> {
    let body: RegisterBody = req.json()?;
    validate_account(&body.username, &body.email, &body.password)?;
    let hash = hash_password_blocking(body.password).await?;

    let mut user = UserRecord::new(body.username.trim().to_owned(), body.email.trim().to_owned(), hash, Role::User);
    user.full_name = body.full_name;
    let user = req.state().store.register_user(user).await?;

    tracing::info!(user_id = %user.id, role = ?user.role, "user registered");
    Ok((StatusCode::CREATED, Json(session(&req, user)?)))
}

/// `POST /api/auth/login`.
pub async fn login(req: Request) -> Result<impl IntoResponse, ApiError> {
    let body: LoginBody = req.json()?;
    let store = &req.state().store;
    let invalid = || ApiError::Unauthorized("Invalid credentials".to_owned());

    let Some(user) = store.find_user_by_login(body.username.trim()).await? else {
        return Err(invalid());
    };
    if !verify_password_blocking(user.password_hash.clone(), body.password).await? {
        tracing::debug!(user_id = %user.id, "login with wrong password");
        return Err(invalid());
    }
    if !user.active {
        return Err(ApiError::InactiveAccount);
    }

    // An admin may have deactivated the account while the hash was checked.
    let user = store.touch_last_login(user.id).await?;
    if !user.active {
        return Err(ApiError::InactiveAccount);
    }
    Ok(Json(session(&req, user)?))
}

async fn caller(req: &Request) -> Result<UserRecord, ApiError> {
    let id = req.require_identity()?.user_id;
    req.state()
        .store
        .find_user(id)
        .await?
        .ok_or_else(|| ApiError::not_found("User not found"))
}

/// `GET /api/auth/profile`.
pub async fn profile(req: Request) -> Result<Json<UserRecord>, ApiError> {
    Ok(Json(caller(&req).await?))
}

/// `PUT /api/auth/profile`. Only email and full name are editable here.
pub async fn update_profile(req: Request) -> Result<Json<UserRecord>, ApiError> {
    let body: ProfileBody = req.json()?;
    let id = req.require_identity()?.user_id;

    let email = body.email.map(|e| e.trim().to_owned());
    if email.as_deref().is_some_and(|e| !e.contains('@')) {
        return Err(ApiError::bad_request("Invalid email address"));
    }

    let user = req.state().store.update_profile(id, email, body.full_name).await?;
    audit(&req, "update_profile", "users", Some(user.id)).await;
    Ok(Json(user))
}

/// `PUT /api/auth/change-password`.
pub async fn change_password(req: Request) -> Result<Json<serde_json::Value>, ApiError> {
    let body: ChangePasswordBody = req.json()?;
    validate_password(&body.new_password)?;
    let user = caller(&req).await?;

    if !verify_password_blocking(user.password_hash, body.current_password).await? {
        return Err(ApiError::bad_request("Current password is incorrect"));
    }
    let hash = hash_password_blocking(body.new_password).await?;

    let user = req.state().store.set_password_hash(user.id, hash).await?;
    audit(&req, "change_password", "users", Some(user.id)).await;
    Ok(Json(serde_json::json!({ "message": "Password changed successfully" })))
}

/// `POST /api/auth/logout`. Tokens are stateless; the client drops its copy.
pub async fn logout(req: Request) -> Result<Json<serde_json::Value>, ApiError> {
    let identity = req.require_identity()?;
    tracing::debug!(user_id = %identity.user_id, "logout");
    audit(&req, "logout", "users", Some(identity.user_id)).await;
    Ok(Json(serde_json::json!({ "message": "Logged out successfully" })))
}

// ── Admin ─────────────────────────────────────────────────────────────────────

/// `GET /api/auth/users`.
pub async fn list_users(req: Request) -> Result<Json<serde_json::Value>, ApiError> {
    let users = req.state().store.list_users().await?;
    Ok(Json(serde_json::json!({ "total": users.len(), "data": users })))
}

/// `POST /api/auth/users`.
pub async fn create_user(req: Request) -> Result<impl IntoResponse, ApiError> {
    let body: CreateUserBody = req.json()?;
    validate_account(&body.username, &body.email, &body.password)?;
    let hash = hash_password_blocking(body.password).await?;

    let mut user = UserRecord::new(body.username.trim().to_owned(), body.email.trim().to_owned(), hash, body.role);
    user.full_name = body.full_name;
    user.permissions = body.permissions;
    let user = req.state().store.insert_user(user).await?;

    audit(&req, "create", "users", Some(user.id)).await;
    Ok((StatusCode::CREATED, Json(user)))
}

async fn target(req: &Request) -> Result<UserRecord, ApiError> {
    let id = req.param_id("id")?;
    req.state()
        .store
        .find_user(id)
        .await?
        .ok_or_else(|| ApiError::not_found("User not found"))
}

/// `PUT /api/auth/users/:id/permissions`.
pub async fn update_permissions(req: Request) -> Result<Json<UserRecord>, ApiError> {
    let body: PermissionsBody = req.json()?;
    let id = req.param_id("id")?;

    let user = req.state().store.set_permissions(id, body.permissions).await?;
    audit(&req, "update_permissions", "users", Some(user.id)).await;
    Ok(Json(user))
}

/// `DELETE /api/auth/users/:id`. Admins cannot delete themselves.
pub async fn delete_user(req: Request) -> Result<Json<serde_json::Value>, ApiError> {
    let user = target(&req).await?;
    if user.id == req.require_identity()?.user_id {
        return Err(ApiError::bad_request("You cannot delete your own account"));
    }

    req.state().store.delete_user(user.id).await?;
    audit(&req, "delete", "users", Some(user.id)).await;
    Ok(Json(serde_json::json!({ "message": "User deleted successfully" })))
}

/// `PUT /api/auth/users/:id/toggle-status`. Admins cannot deactivate
/// themselves.
pub async fn toggle_status(req: Request) -> Result<Json<UserRecord>, ApiError> {
    let id = req.param_id("id")?;
    if id == req.require_identity()?.user_id {
        return Err(ApiError::bad_request("You cannot deactivate your own account"));
    }

    let user = req.state().store.toggle_active(id).await?;
    let action = if user.active { "activate" } else { "deactivate" };
    audit(&req, action, "users", Some(user.id)).await;
    Ok(Json(user))
}
