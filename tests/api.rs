use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use http::StatusCode;
use http_body_util::Full;
use serde_json::{json, Value};

use invoicer::store::{IdentityStore, MemoryStore, Store, UserRecord};
use invoicer::{api, App, AppState, Capability, Config, Method, Request, Response, Role, Router};

const FRONTEND: &str = "http://localhost:8080";

fn config() -> Config {
    let mut config = Config { jwt_secret: "integration-test-secret".to_owned(), ..Config::default() };
    config.rate_limit.max_requests = 10_000;
    config
}

fn peer(last: u8) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, last], 40000))
}

struct Client {
    app: App,
}

struct Reply {
    status: StatusCode,
    body: Value,
    raw: Response,
}

impl Client {
    fn new() -> Self {
        Self::with_config(config())
    }

    fn with_config(config: Config) -> Self {
        let state = Arc::new(AppState::new(config, Arc::new(MemoryStore::new())));
        Self { app: App::new(state, api::routes()) }
    }

    async fn call(
        &self,
        method: &str,
        path: &str,
        token: Option<&str>,
        body: Option<Value>,
        headers: &[(&str, &str)],
    ) -> Reply {
        let mut builder = http::Request::builder().method(method).uri(path);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        for &(name, value) in headers {
            builder = builder.header(name, value);
        }
        let body = match body {
            Some(v) => {
                builder = builder.header("content-type", "application/json");
                Bytes::from(serde_json::to_vec(&v).unwrap())
            }
            None => Bytes::new(),
        };
        let raw = self.app.dispatch(builder.body(Full::new(body)).unwrap(), peer(1)).await;
        Reply {
            status: raw.status(),
            body: serde_json::from_slice(raw.body()).unwrap_or(Value::Null),
            raw,
        }
    }

    async fn get(&self, path: &str, token: &str) -> Reply {
        self.call("GET", path, Some(token), None, &[]).await
    }

    async fn post(&self, path: &str, token: &str, body: Value) -> Reply {
        self.call("POST", path, Some(token), Some(body), &[]).await
    }

    /// Registers `name` and returns its token.
    async fn register(&self, name: &str) -> String {
        let res = self
            .call(
                "POST",
                "/api/auth/register",
                None,
                Some(json!({
                    "username": name,
                    "email": format!("{name}@example.com"),
                    "password": "correct horse",
                })),
                &[],
            )
            .await;
        assert_eq!(res.status, StatusCode::CREATED, "{}", res.body);
        res.body["token"].as_str().unwrap().to_owned()
    }
}

#[tokio::test]
async fn health_is_public() {
    let client = Client::new();
    let res = client.call("GET", "/health", None, None, &[]).await;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.body["status"], "OK");
    assert_eq!(res.body["environment"], "debug");
    assert!(res.body["timestamp"].is_string());
}

#[tokio::test]
async fn sixty_first_request_in_a_window_is_denied() {
    let mut config = config();
    config.rate_limit.max_requests = 60;
    let client = Client::with_config(config);
    let health = || http::Request::builder().uri("/health").body(Full::new(Bytes::new())).unwrap();

    for i in 0..60 {
        let res = client.app.dispatch(health(), peer(7)).await;
        assert_eq!(res.status(), StatusCode::OK, "request {i}");
    }
    let denied = client.app.dispatch(health(), peer(7)).await;
    assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(denied.header("retry-after").is_some());
    assert_eq!(denied.header("x-ratelimit-remaining"), Some("0"));

    let other = client.app.dispatch(health(), peer(8)).await;
    assert_eq!(other.status(), StatusCode::OK);
}

#[tokio::test]
async fn missing_credential_never_reaches_the_handler() {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let router = Router::new().guarded(Method::Get, "/api/secret", Capability::Authenticated, move |_req: Request| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Response::text("secret") }
    });
    let state = Arc::new(AppState::new(config(), Arc::new(MemoryStore::new())));
    let app = App::new(state, router);

    let req = http::Request::builder().uri("/api/secret").body(Full::new(Bytes::new())).unwrap();
    let res = app.dispatch(req, peer(1)).await;
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(res.body(), br#"{"error":"Authorization header required"}"#);
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn forbidden_role_never_reaches_the_handler() {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let router = Router::new().guarded(Method::Get, "/api/admin-only", Capability::Admin, move |_req: Request| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Response::text("admin") }
    });
    let state = Arc::new(AppState::new(config(), Arc::new(MemoryStore::new())));
    let clerk = UserRecord::new("clerk".into(), "clerk@example.com".into(), String::new(), Role::User);
    let root = UserRecord::new("root".into(), "root@example.com".into(), String::new(), Role::Admin);
    let clerk = state.store.insert_user(clerk).await.unwrap();
    let root = state.store.insert_user(root).await.unwrap();
    let clerk_token = state.tokens.issue(clerk.id, clerk.role).unwrap().token;
    let root_token = state.tokens.issue(root.id, root.role).unwrap().token;
    let app = App::new(state, router);

    let get = |token: &str| {
        http::Request::builder()
            .uri("/api/admin-only")
            .header("authorization", format!("Bearer {token}"))
            .body(Full::new(Bytes::new()))
            .unwrap()
    };
    let res = app.dispatch(get(&clerk_token), peer(1)).await;
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
    assert_eq!(res.body(), br#"{"error":"Admin access required"}"#);
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    let res = app.dispatch(get(&root_token), peer(1)).await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn expired_and_garbage_tokens_are_told_apart() {
    let client = Client::new();
    let token = client.register("alice").await;
    let profile = client.get("/api/auth/profile", &token).await;
    let user_id = profile.body["id"].as_str().unwrap().parse().unwrap();

    let expired = client
        .app
        .state()
        .tokens
        .issue_until(user_id, Role::Admin, chrono::Utc::now() - chrono::Duration::minutes(5))
        .unwrap();
    let res = client.get("/api/clients", &expired).await;
    assert_eq!(res.status, StatusCode::UNAUTHORIZED);
    assert_eq!(res.body["error"], "Token expired");

    let res = client.get("/api/clients", "not.a.token").await;
    assert_eq!(res.status, StatusCode::UNAUTHORIZED);
    assert_eq!(res.body["error"], "Invalid token");
}

#[tokio::test]
async fn unmatched_route_has_exact_body() {
    let client = Client::new();
    let res = client.call("GET", "/api/nowhere", None, None, &[]).await;
    assert_eq!(res.status, StatusCode::NOT_FOUND);
    assert_eq!(res.raw.body(), br#"{"error":"Route not found"}"#);

    let res = client.call("PATCH", "/health", None, None, &[]).await;
    assert_eq!(res.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn register_login_profile() {
    let client = Client::new();
    let first = client.register("alice").await;
    let second = client.register("bob").await;

    let me = client.get("/api/auth/profile", &first).await;
    assert_eq!(me.body["username"], "alice");
    assert_eq!(me.body["role"], "admin");
    assert!(me.body.get("password_hash").is_none());

    let bob = client.get("/api/auth/profile", &second).await;
    assert_eq!(bob.body["role"], "user");

    let login = client
        .call(
            "POST",
            "/api/auth/login",
            None,
            Some(json!({"username": "bob@example.com", "password": "correct horse"})),
            &[],
        )
        .await;
    assert_eq!(login.status, StatusCode::OK);
    assert_eq!(login.body["user"]["username"], "bob");
    assert!(login.body["user"]["last_login"].is_string());

    let wrong = client
        .call("POST", "/api/auth/login", None, Some(json!({"username": "bob", "password": "nope"})), &[])
        .await;
    assert_eq!(wrong.status, StatusCode::UNAUTHORIZED);
    assert_eq!(wrong.body["error"], "Invalid credentials");

    let duplicate = client
        .call(
            "POST",
            "/api/auth/register",
            None,
            Some(json!({"username": "BOB", "email": "other@example.com", "password": "correct horse"})),
            &[],
        )
        .await;
    assert_eq!(duplicate.status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn admin_routes_need_the_admin_role() {
    let client = Client::new();
    let admin = client.register("root").await;
    let user = client.register("clerk").await;

    let res = client.get("/api/auth/users", &user).await;
    assert_eq!(res.status, StatusCode::FORBIDDEN);
    assert_eq!(res.body["error"], "Admin access required");

    let res = client.get("/api/auth/users", &admin).await;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.body["total"], 2);
}

#[tokio::test]
async fn deactivated_accounts_lose_access() {
    let client = Client::new();
    let admin = client.register("root").await;
    let user = client.register("clerk").await;
    let clerk_id = client.get("/api/auth/profile", &user).await.body["id"].as_str().unwrap().to_owned();

    let res = client
        .call("PUT", &format!("/api/auth/users/{clerk_id}/toggle-status"), Some(&admin), None, &[])
        .await;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.body["active"], false);

    let res = client.get("/api/clients", &user).await;
    assert_eq!(res.status, StatusCode::UNAUTHORIZED);
    assert_eq!(res.body["error"], "Account is deactivated");

    let root_id = client.get("/api/auth/profile", &admin).await.body["id"].as_str().unwrap().to_owned();
    let res = client.call("DELETE", &format!("/api/auth/users/{root_id}"), Some(&admin), None, &[]).await;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn deactivation_during_login_sticks() {
    let client = Client::new();
    let admin = client.register("root").await;
    let user = client.register("clerk").await;
    let clerk_id = client.get("/api/auth/profile", &user).await.body["id"].as_str().unwrap().to_owned();

    // The login is polled first and parks on the password check; the
    // toggle completes while it waits.
    let login = client.call(
        "POST",
        "/api/auth/login",
        None,
        Some(json!({"username": "clerk", "password": "correct horse"})),
        &[],
    );
    let toggle_path = format!("/api/auth/users/{clerk_id}/toggle-status");
    let toggle = client.call("PUT", &toggle_path, Some(&admin), None, &[]);
    let (login, toggle) = tokio::join!(login, toggle);

    assert_eq!(toggle.status, StatusCode::OK);
    assert_eq!(toggle.body["active"], false);
    assert_eq!(login.status, StatusCode::UNAUTHORIZED);
    assert_eq!(login.body["error"], "Account is deactivated");

    let stored = client.app.state().store.find_user(clerk_id.parse().unwrap()).await.unwrap().unwrap();
    assert!(!stored.active);
    assert!(stored.last_login.is_some());
}

#[tokio::test]
async fn concurrent_first_registrations_yield_one_admin() {
    let client = Client::new();
    let names = ["ana", "ben", "cid", "dot"];
    let tokens = futures::future::join_all(names.iter().map(|name| client.register(name))).await;
    assert_eq!(tokens.len(), names.len());

    let users = client.app.state().store.list_users().await.unwrap();
    assert_eq!(users.len(), names.len());
    assert_eq!(users.iter().filter(|u| u.role == Role::Admin).count(), 1);
}

#[tokio::test]
async fn records_crud_with_audit_trail() {
    let client = Client::new();
    let token = client.register("alice").await;

    let created = client.post("/api/clients", &token, json!({"name": "Acme", "city": "Split"})).await;
    assert_eq!(created.status, StatusCode::CREATED);
    let id = created.body["id"].as_str().unwrap().to_owned();

    let missing_name = client.post("/api/clients", &token, json!({"city": "Zagreb"})).await;
    assert_eq!(missing_name.status, StatusCode::BAD_REQUEST);

    let updated = client
        .call("PUT", &format!("/api/clients/{id}"), Some(&token), Some(json!({"city": "Zadar"})), &[])
        .await;
    assert_eq!(updated.body["city"], "Zadar");
    assert_eq!(updated.body["name"], "Acme");

    client.post("/api/clients", &token, json!({"name": "Globex", "city": "Zadar"})).await;
    let listed = client.get("/api/clients?city=Zadar&limit=1", &token).await;
    assert_eq!(listed.body["total"], 2);
    assert_eq!(listed.body["data"].as_array().unwrap().len(), 1);
    let searched = client.get("/api/clients?search=acm", &token).await;
    assert_eq!(searched.body["total"], 1);

    for total in [100.0, 250.5] {
        let res = client.post("/api/invoices", &token, json!({"client_id": id, "total": total})).await;
        assert_eq!(res.status, StatusCode::CREATED);
    }
    client.post("/api/deliveries", &token, json!({"client_id": id})).await;
    let orphan = client
        .post("/api/invoices", &token, json!({"client_id": uuid::Uuid::new_v4().to_string()}))
        .await;
    assert_eq!(orphan.status, StatusCode::BAD_REQUEST);

    let invoices = client.get(&format!("/api/clients/{id}/invoices"), &token).await;
    assert_eq!(invoices.body["total"], 2);
    let stats = client.get(&format!("/api/clients/{id}/statistics"), &token).await;
    assert_eq!(stats.body["invoice_count"], 2);
    assert_eq!(stats.body["delivery_count"], 1);
    assert_eq!(stats.body["total_invoiced"], 350.5);

    let invoice_id = invoices.body["data"][0]["id"].as_str().unwrap().to_owned();
    let paid = client
        .call("PATCH", &format!("/api/invoices/{invoice_id}/status"), Some(&token), Some(json!({"status": "paid"})), &[])
        .await;
    assert_eq!(paid.body["status"], "paid");

    let deleted = client.call("DELETE", &format!("/api/clients/{id}"), Some(&token), None, &[]).await;
    assert_eq!(deleted.status, StatusCode::OK);
    let gone = client.get(&format!("/api/clients/{id}"), &token).await;
    assert_eq!(gone.status, StatusCode::NOT_FOUND);
    assert_eq!(gone.body["error"], "Client not found");

    let logs = client.get("/api/logs?entity=clients", &token).await;
    let actions: Vec<&str> = logs.body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["action"].as_str().unwrap())
        .collect();
    assert_eq!(actions, ["delete", "create", "update", "create"]);
}

#[tokio::test]
async fn product_group_membership() {
    let client = Client::new();
    let token = client.register("alice").await;
    let group = client.post("/api/product-groups", &token, json!({"name": "Tools"})).await;
    let group_id = group.body["id"].as_str().unwrap().to_owned();
    assert_eq!(group.body["product_ids"], json!([]));
    let product = client.post("/api/products", &token, json!({"name": "Hammer"})).await;
    let product_id = product.body["id"].as_str().unwrap().to_owned();

    let path = format!("/api/product-groups/{group_id}/products");
    let added = client.post(&path, &token, json!({"product_id": product_id})).await;
    assert_eq!(added.body["product_ids"], json!([product_id]));
    let again = client.post(&path, &token, json!({"product_id": product_id})).await;
    assert_eq!(again.status, StatusCode::CONFLICT);

    let removed = client
        .call("DELETE", &format!("{path}/{product_id}"), Some(&token), None, &[])
        .await;
    assert_eq!(removed.body["product_ids"], json!([]));
}

#[tokio::test]
async fn export_is_an_attachment() {
    let client = Client::new();
    let token = client.register("alice").await;
    client.post("/api/clients", &token, json!({"name": "Acme, Inc."})).await;

    let res = client.get("/api/export/clients", &token).await;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.raw.header("content-type"), Some("text/csv; charset=utf-8"));
    assert_eq!(
        res.raw.header("content-disposition"),
        Some("attachment; filename=\"clients.csv\"")
    );
    let csv = std::str::from_utf8(res.raw.body()).unwrap();
    assert!(csv.starts_with("id,created_at,updated_at,name\r\n"));
    assert!(csv.contains("\"Acme, Inc.\""));
}

#[tokio::test]
async fn users_only_see_their_own_logs() {
    let client = Client::new();
    let admin = client.register("root").await;
    let user = client.register("clerk").await;
    client.post("/api/products", &admin, json!({"name": "Saw"})).await;
    client.post("/api/products", &user, json!({"name": "Drill"})).await;

    assert_eq!(client.get("/api/logs", &admin).await.body["total"], 2);
    assert_eq!(client.get("/api/logs", &user).await.body["total"], 1);
}

#[tokio::test]
async fn cors_preflight_and_foreign_origins() {
    let client = Client::new();

    let preflight = client
        .call(
            "OPTIONS",
            "/api/clients",
            None,
            None,
            &[("origin", FRONTEND), ("access-control-request-method", "POST")],
        )
        .await;
    assert_eq!(preflight.status, StatusCode::NO_CONTENT);
    assert_eq!(preflight.raw.header("access-control-allow-origin"), Some(FRONTEND));

    let foreign = client
        .call("GET", "/health", None, None, &[("origin", "https://evil.example")])
        .await;
    assert_eq!(foreign.status, StatusCode::FORBIDDEN);
    assert_eq!(foreign.body["error"], "Origin not allowed");

    // Error responses from later stages still carry the CORS headers.
    let denied = client.call("GET", "/api/clients", None, None, &[("origin", FRONTEND)]).await;
    assert_eq!(denied.status, StatusCode::UNAUTHORIZED);
    assert_eq!(denied.raw.header("access-control-allow-credentials"), Some("true"));
}

#[tokio::test]
async fn oversized_bodies_are_rejected() {
    let mut config = config();
    config.max_body_bytes = 64;
    let client = Client::with_config(config);
    let res = client
        .call("POST", "/api/auth/login", None, Some(json!({"username": "x".repeat(100), "password": "y"})), &[])
        .await;
    assert_eq!(res.status, StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn uploads_are_served_without_traversal() {
    let root = tempfile::tempdir().unwrap();
    let uploads = root.path().join("uploads");
    std::fs::create_dir_all(uploads.join("logos")).unwrap();
    std::fs::write(uploads.join("logos/acme.png"), b"\x89PNG").unwrap();
    std::fs::write(root.path().join("secret.env"), b"JWT_SECRET=x").unwrap();

    let mut config = config();
    config.uploads_dir = uploads;
    let client = Client::with_config(config);

    let res = client.call("GET", "/uploads/logos/acme.png", None, None, &[]).await;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.raw.header("content-type"), Some("image/png"));
    assert_eq!(res.raw.body(), b"\x89PNG");

    let res = client.call("GET", "/uploads/../secret.env", None, None, &[]).await;
    assert_eq!(res.status, StatusCode::NOT_FOUND);

    let res = client.call("GET", "/uploads/logos/missing.png", None, None, &[]).await;
    assert_eq!(res.status, StatusCode::NOT_FOUND);
    assert_eq!(res.raw.body(), br#"{"error":"Route not found"}"#);
}
