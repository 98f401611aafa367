//! Persistence collaborator.
//!
//! The pipeline needs exactly one thing from storage: resolving a user id
//! to a record with a role and an active flag ([`IdentityStore`]). The
//! handlers need more ([`Store`]): users, schemaless records per
//! [`Collection`], and the audit log.
//!
//! [`MemoryStore`] implements both over `DashMap`s. It is what the binary
//! runs with and what the tests use; a database-backed store implements the
//! same traits.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::auth::{Identity, Role};
use crate::error::ApiError;
use crate::handler::BoxFuture;

pub type StoreFuture<'a, T> = BoxFuture<'a, Result<T, StoreError>>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("{0}")]
    Conflict(String),

    #[error("store backend: {0}")]
    Backend(String),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => ApiError::NotFound(format!("{what} not found")),
            StoreError::Conflict(msg) => ApiError::Conflict(msg),
            StoreError::Backend(msg) => ApiError::Internal(msg),
        }
    }
}

// ── Data ──────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub full_name: Option<String>,
    #[serde(skip_serializing, default)]
    pub password_hash: String,
    pub role: Role,
    pub active: bool,
    pub permissions: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
}

impl UserRecord {
    pub fn new(username: String, email: String, password_hash: String, role: Role) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            username,
            email,
            full_name: None,
            password_hash,
            role,
            active: true,
            permissions: Vec::new(),
            created_at: now,
            updated_at: now,
            last_login: None,
        }
    }

    pub fn identity(&self) -> Identity {
        Identity { user_id: self.id, role: self.role, active: self.active }
    }
}

/// The record collections the API manages.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Collection {
    Clients,
    Products,
    ProductGroups,
    Invoices,
    Deliveries,
}

impl Collection {
    pub const ALL: [Collection; 5] = [
        Self::Clients,
        Self::Products,
        Self::ProductGroups,
        Self::Invoices,
        Self::Deliveries,
    ];

    /// Name used in audit entries.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Clients       => "clients",
            Self::Products      => "products",
            Self::ProductGroups => "product_groups",
            Self::Invoices      => "invoices",
            Self::Deliveries    => "deliveries",
        }
    }

    /// Singular, capitalised; used in "not found" messages.
    pub fn label(self) -> &'static str {
        match self {
            Self::Clients       => "Client",
            Self::Products      => "Product",
            Self::ProductGroups => "Product group",
            Self::Invoices      => "Invoice",
            Self::Deliveries    => "Delivery",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// A schemaless record: server-managed metadata plus whatever fields the
/// client sent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Record {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Record {
    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub user_id: Uuid,
    pub action: String,
    pub entity: String,
    pub entity_id: Option<Uuid>,
    pub at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(user_id: Uuid, action: &str, entity: &str, entity_id: Option<Uuid>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            action: action.to_owned(),
            entity: entity.to_owned(),
            entity_id,
            at: Utc::now(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogQuery {
    pub entity: Option<String>,
    pub user_id: Option<Uuid>,
    pub limit: Option<usize>,
}

// ── Traits ────────────────────────────────────────────────────────────────────

/// The only storage capability the authenticator relies on.
pub trait IdentityStore: Send + Sync + 'static {
    fn find_user(&self, id: Uuid) -> StoreFuture<'_, Option<UserRecord>>;
}

/// Everything the handlers persist.
pub trait Store: IdentityStore {
    /// Looks a user up by username or email, case-insensitively.
    fn find_user_by_login<'a>(&'a self, login: &'a str) -> StoreFuture<'a, Option<UserRecord>>;
    fn list_users(&self) -> StoreFuture<'_, Vec<UserRecord>>;
    /// Fails with [`StoreError::Conflict`] if the username or email is taken.
    fn insert_user(&self, user: UserRecord) -> StoreFuture<'_, UserRecord>;
    /// Like [`insert_user`](Store::insert_user), but the first account in an
    /// empty store is made [`Role::Admin`]. Deciding and inserting are one
    /// step: of any number of concurrent registrations, exactly one wins.
    fn register_user(&self, user: UserRecord) -> StoreFuture<'_, UserRecord>;
    fn delete_user(&self, id: Uuid) -> StoreFuture<'_, ()>;

    // Targeted user updates. Each one changes only its own fields, so
    // concurrent updates to different fields of one user never undo each
    // other.

    /// `None` leaves a field as it is. A new email is reserved like on insert.
    fn update_profile(
        &self,
        id: Uuid,
        email: Option<String>,
        full_name: Option<String>,
    ) -> StoreFuture<'_, UserRecord>;
    fn set_password_hash(&self, id: Uuid, hash: String) -> StoreFuture<'_, UserRecord>;
    fn set_permissions(&self, id: Uuid, permissions: Vec<String>) -> StoreFuture<'_, UserRecord>;
    /// Flips `active` and returns the user as it now is.
    fn toggle_active(&self, id: Uuid) -> StoreFuture<'_, UserRecord>;
    /// Stamps `last_login`. The returned record carries the current `active`
    /// flag, which may have changed since the caller last read it.
    fn touch_last_login(&self, id: Uuid) -> StoreFuture<'_, UserRecord>;

    /// Newest first.
    fn list(&self, collection: Collection) -> StoreFuture<'_, Vec<Record>>;
    fn get(&self, collection: Collection, id: Uuid) -> StoreFuture<'_, Option<Record>>;
    fn insert(&self, collection: Collection, fields: Map<String, Value>) -> StoreFuture<'_, Record>;
    /// Merges `fields` into the record's top-level fields.
    fn update(
        &self,
        collection: Collection,
        id: Uuid,
        fields: Map<String, Value>,
    ) -> StoreFuture<'_, Record>;
    fn delete(&self, collection: Collection, id: Uuid) -> StoreFuture<'_, ()>;
    /// Appends `value` to the array `field` unless it is already there.
    /// Returns the record and whether it changed.
    fn add_member(
        &self,
        collection: Collection,
        id: Uuid,
        field: &'static str,
        value: Value,
    ) -> StoreFuture<'_, (Record, bool)>;
    /// Removes `value` from the array `field`. Returns the record and whether
    /// it was there.
    fn remove_member(
        &self,
        collection: Collection,
        id: Uuid,
        field: &'static str,
        value: Value,
    ) -> StoreFuture<'_, (Record, bool)>;

    fn append_log(&self, entry: AuditEntry) -> StoreFuture<'_, ()>;
    /// Newest first.
    fn logs(&self, query: LogQuery) -> StoreFuture<'_, Vec<AuditEntry>>;
}

// ── MemoryStore ───────────────────────────────────────────────────────────────

/// In-process store. Lost on restart.
pub struct MemoryStore {
    users: DashMap<Uuid, UserRecord>,
    /// Lowercased username and email → owner. Reserving through the entry
    /// API keeps uniqueness atomic without a global lock.
    logins: DashMap<String, Uuid>,
    tables: [DashMap<Uuid, Record>; Collection::ALL.len()],
    logs: Mutex<Vec<AuditEntry>>,
    /// Held across every user insert so the first-admin check and the
    /// insert cannot interleave.
    signup: Mutex<()>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            users: DashMap::new(),
            logins: DashMap::new(),
            tables: std::array::from_fn(|_| DashMap::new()),
            logs: Mutex::new(Vec::new()),
            signup: Mutex::new(()),
        }
    }

    fn table(&self, collection: Collection) -> &DashMap<Uuid, Record> {
        &self.tables[collection.index()]
    }

    fn reserve_login(&self, login: &str, owner: Uuid) -> Result<(), StoreError> {
        match self.logins.entry(login.to_lowercase()) {
            Entry::Occupied(e) if *e.get() != owner => {
                Err(StoreError::Conflict(format!("`{login}` is already registered")))
            }
            Entry::Occupied(_) => Ok(()),
            Entry::Vacant(e) => {
                e.insert(owner);
                Ok(())
            }
        }
    }

    fn release_login(&self, login: &str, owner: Uuid) {
        self.logins.remove_if(&login.to_lowercase(), |_, id| *id == owner);
    }

    fn insert_user_sync(&self, mut user: UserRecord, first_is_admin: bool) -> Result<UserRecord, StoreError> {
        let _signup = self
            .signup
            .lock()
            .map_err(|_| StoreError::Backend("signup lock poisoned".to_owned()))?;
        if first_is_admin && self.users.is_empty() {
            user.role = Role::Admin;
        }

        self.reserve_login(&user.username, user.id)?;
        if let Err(e) = self.reserve_login(&user.email, user.id) {
            self.release_login(&user.username, user.id);
            return Err(e);
        }
        self.users.insert(user.id, user.clone());
        Ok(user)
    }

    /// Applies `f` to the user while holding its map entry.
    fn modify_user(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut UserRecord) -> Result<(), StoreError>,
    ) -> Result<UserRecord, StoreError> {
        let mut user = self.users.get_mut(&id).ok_or(StoreError::NotFound("User"))?;
        f(user.value_mut())?;
        user.updated_at = Utc::now();
        Ok(user.value().clone())
    }

    fn update_profile_sync(
        &self,
        id: Uuid,
        email: Option<String>,
        full_name: Option<String>,
    ) -> Result<UserRecord, StoreError> {
        self.modify_user(id, |user| {
            if let Some(email) = email {
                if !email.eq_ignore_ascii_case(&user.email) {
                    self.reserve_login(&email, id)?;
                    self.release_login(&user.email, id);
                }
                user.email = email;
            }
            if full_name.is_some() {
                user.full_name = full_name;
            }
            Ok(())
        })
    }

    fn delete_user_sync(&self, id: Uuid) -> Result<(), StoreError> {
        let (_, user) = self.users.remove(&id).ok_or(StoreError::NotFound("User"))?;
        self.release_login(&user.username, id);
        self.release_login(&user.email, id);
        Ok(())
    }

    fn update_sync(
        &self,
        collection: Collection,
        id: Uuid,
        fields: Map<String, Value>,
    ) -> Result<Record, StoreError> {
        let mut record = self
            .table(collection)
            .get_mut(&id)
            .ok_or(StoreError::NotFound(collection.label()))?;
        for (k, v) in fields {
            if !is_reserved_field(&k) {
                record.fields.insert(k, v);
            }
        }
        record.updated_at = Utc::now();
        Ok(record.value().clone())
    }

    fn edit_members(
        &self,
        collection: Collection,
        id: Uuid,
        field: &str,
        edit: impl FnOnce(&mut Vec<Value>) -> bool,
    ) -> Result<(Record, bool), StoreError> {
        let mut record = self
            .table(collection)
            .get_mut(&id)
            .ok_or(StoreError::NotFound(collection.label()))?;
        let members = match record.fields.entry(field) {
            serde_json::map::Entry::Occupied(e) => e.into_mut(),
            serde_json::map::Entry::Vacant(e) => e.insert(Value::Array(Vec::new())),
        };
        if !members.is_array() {
            *members = Value::Array(Vec::new());
        }
        let changed = match members {
            Value::Array(items) => edit(items),
            _ => false,
        };
        if changed {
            record.updated_at = Utc::now();
        }
        Ok((record.value().clone(), changed))
    }

    fn logs_sync(&self, query: LogQuery) -> Result<Vec<AuditEntry>, StoreError> {
        let logs = self
            .logs
            .lock()
            .map_err(|_| StoreError::Backend("audit log lock poisoned".to_owned()))?;
        Ok(logs
            .iter()
            .rev()
            .filter(|e| query.entity.as_deref().is_none_or(|want| e.entity == want))
            .filter(|e| query.user_id.is_none_or(|want| e.user_id == want))
            .take(query.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }
}

impl Default for MemoryStore {
    fn default() -> Self { Self::new() }
}

/// Server-managed keys a client cannot overwrite.
fn is_reserved_field(key: &str) -> bool {
    matches!(key, "id" | "created_at" | "updated_at")
}

impl IdentityStore for MemoryStore {
    fn find_user(&self, id: Uuid) -> StoreFuture<'_, Option<UserRecord>> {
        let user = self.users.get(&id).map(|u| u.value().clone());
        Box::pin(async move { Ok(user) })
    }
}

impl Store for MemoryStore {
    fn find_user_by_login<'a>(&'a self, login: &'a str) -> StoreFuture<'a, Option<UserRecord>> {
        // Copy the id out first: profile updates lock a user, then the login
        // index, so this side must not hold both.
        let id = self.logins.get(&login.to_lowercase()).map(|id| *id.value());
        let user = id.and_then(|id| self.users.get(&id).map(|u| u.value().clone()));
        Box::pin(async move { Ok(user) })
    }

    fn list_users(&self) -> StoreFuture<'_, Vec<UserRecord>> {
        let mut users: Vec<UserRecord> = self.users.iter().map(|u| u.value().clone()).collect();
        users.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Box::pin(async move { Ok(users) })
    }

    fn insert_user(&self, user: UserRecord) -> StoreFuture<'_, UserRecord> {
        let res = self.insert_user_sync(user, false);
        Box::pin(async move { res })
    }

    fn register_user(&self, user: UserRecord) -> StoreFuture<'_, UserRecord> {
        let res = self.insert_user_sync(user, true);
        Box::pin(async move { res })
    }

    fn delete_user(&self, id: Uuid) -> StoreFuture<'_, ()> {
        let res = self.delete_user_sync(id);
        Box::pin(async move { res })
    }

    fn update_profile(
        &self,
        id: Uuid,
        email: Option<String>,
        full_name: Option<String>,
    ) -> StoreFuture<'_, UserRecord> {
        let res = self.update_profile_sync(id, email, full_name);
        Box::pin(async move { res })
    }

    fn set_password_hash(&self, id: Uuid, hash: String) -> StoreFuture<'_, UserRecord> {
        let res = self.modify_user(id, |user| {
            user.password_hash = hash;
            Ok(())
        });
        Box::pin(async move { res })
    }

    fn set_permissions(&self, id: Uuid, permissions: Vec<String>) -> StoreFuture<'_, UserRecord> {
        let res = self.modify_user(id, |user| {
            user.permissions = permissions;
            Ok(())
        });
        Box::pin(async move { res })
    }

    fn toggle_active(&self, id: Uuid) -> StoreFuture<'_, UserRecord> {
        let res = self.modify_user(id, |user| {
            user.active = !user.active;
            Ok(())
        });
        Box::pin(async move { res })
    }

    fn touch_last_login(&self, id: Uuid) -> StoreFuture<'_, UserRecord> {
        let res = self.modify_user(id, |user| {
            user.last_login = Some(Utc::now());
            Ok(())
        });
        Box::pin(async move { res })
    }

    fn list(&self, collection: Collection) -> StoreFuture<'_, Vec<Record>> {
        let mut records: Vec<Record> = self.table(collection).iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Box::pin(async move { Ok(records) })
    }

    fn get(&self, collection: Collection, id: Uuid) -> StoreFuture<'_, Option<Record>> {
        let record = self.table(collection).get(&id).map(|r| r.value().clone());
        Box::pin(async move { Ok(record) })
    }

    fn insert(&self, collection: Collection, mut fields: Map<String, Value>) -> StoreFuture<'_, Record> {
        fields.retain(|k, _| !is_reserved_field(k));
        let now = Utc::now();
        let record = Record { id: Uuid::new_v4(), created_at: now, updated_at: now, fields };
        self.table(collection).insert(record.id, record.clone());
        Box::pin(async move { Ok(record) })
    }

    fn update(
        &self,
        collection: Collection,
        id: Uuid,
        fields: Map<String, Value>,
    ) -> StoreFuture<'_, Record> {
        let res = self.update_sync(collection, id, fields);
        Box::pin(async move { res })
    }

    fn delete(&self, collection: Collection, id: Uuid) -> StoreFuture<'_, ()> {
        let res = self
            .table(collection)
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::NotFound(collection.label()));
        Box::pin(async move { res })
    }

    fn add_member(
        &self,
        collection: Collection,
        id: Uuid,
        field: &'static str,
        value: Value,
    ) -> StoreFuture<'_, (Record, bool)> {
        let res = self.edit_members(collection, id, field, |items| {
            if items.contains(&value) {
                return false;
            }
            items.push(value);
            true
        });
        Box::pin(async move { res })
    }

    fn remove_member(
        &self,
        collection: Collection,
        id: Uuid,
        field: &'static str,
        value: Value,
    ) -> StoreFuture<'_, (Record, bool)> {
        let res = self.edit_members(collection, id, field, |items| {
            let before = items.len();
            items.retain(|v| *v != value);
            items.len() != before
        });
        Box::pin(async move { res })
    }

    fn append_log(&self, entry: AuditEntry) -> StoreFuture<'_, ()> {
        let res = self
            .logs
            .lock()
            .map(|mut logs| logs.push(entry))
            .map_err(|_| StoreError::Backend("audit log lock poisoned".to_owned()));
        Box::pin(async move { res })
    }

    fn logs(&self, query: LogQuery) -> StoreFuture<'_, Vec<AuditEntry>> {
        let res = self.logs_sync(query);
        Box::pin(async move { res })
    }
}
