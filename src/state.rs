use std::sync::Arc;

use crate::auth::TokenKeys;
use crate::config::Config;
use crate::store::{IdentityStore, Store};

/// Process-wide state, built once at startup and injected into the
/// [`App`](crate::App). Handlers reach it through
/// [`Request::state`](crate::Request::state).
pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn Store>,
    pub identities: Arc<dyn IdentityStore>,
    pub tokens: Arc<TokenKeys>,
}

impl AppState {
    pub fn new<S: Store>(config: Config, store: Arc<S>) -> Self {
        let tokens = Arc::new(TokenKeys::new(config.jwt_secret.as_bytes(), config.token_ttl));
        Self {
            identities: store.clone(),
            store,
            tokens,
            config,
        }
    }
}
