//! Identities, roles and the capabilities routes require.
//!
//! A route declares a [`Capability`]; the authenticated [`Identity`] carries
//! a [`Role`]. Authorization is the single question
//! [`Role::satisfies`] answers.

pub mod password;
pub mod token;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use token::{Claims, IssuedToken, TokenKeys};

/// Role of a user account.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    User,
    Admin,
}

impl Role {
    pub fn satisfies(self, required: Capability) -> bool {
        match required {
            Capability::Public | Capability::Authenticated => true,
            Capability::Admin => self == Role::Admin,
        }
    }
}

/// What a route demands of the caller.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Capability {
    /// No credential needed.
    #[default]
    Public,
    /// Any active account.
    Authenticated,
    /// An active account with [`Role::Admin`].
    Admin,
}

impl Capability {
    pub fn requires_identity(self) -> bool {
        self != Capability::Public
    }
}

/// The caller of an authenticated request, as resolved from the store.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Identity {
    pub user_id: Uuid,
    pub role: Role,
    pub active: bool,
}
