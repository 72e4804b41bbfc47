//! Platform authentication helpers.
//!
//! Sessions are issued and revoked by the hosted identity backend; this crate
//! only models what the dashboard observes of them and defines the seam
//! ([`IdentityBackend`]) through which the route guard reads them.

mod changes;
mod memory;
mod rest;

use std::{fmt, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use changes::{ChangeNotifier, ChangeStreamError, SessionChanges};
pub use memory::MemoryBackend;
pub use rest::{RestBackend, RestConfig};

#[derive(Debug, Error)]
pub enum AuthnError {
    #[error("backend request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("backend returned status {status} during {context}")]
    Status { status: u16, context: &'static str },
    #[error("malformed backend payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid backend url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("no profile row for user {0}")]
    ProfileNotFound(Uuid),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("backend call timed out after {0:?}")]
    TimedOut(Duration),
}

/// User identity attached to a session.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Identity {
    pub id: Uuid,
    #[serde(default)]
    pub email: Option<String>,
}

impl Identity {
    pub fn new(id: Uuid, email: impl Into<String>) -> Self {
        Self {
            id,
            email: Some(email.into()),
        }
    }
}

/// Backend-issued proof of authentication.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    pub access_token: String,
    pub user: Identity,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(access_token: impl Into<String>, user: Identity) -> Self {
        Self {
            access_token: access_token.into(),
            user,
            expires_at: None,
        }
    }

    pub fn expiring_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    pub fn user_id(&self) -> Uuid {
        self.user.id
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

// Tokens never reach logs.
impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("access_token", &"<redacted>")
            .field("user", &self.user)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthEvent {
    SignedIn,
    SignedOut,
    TokenRefreshed,
    UserUpdated,
}

/// Push notification emitted by the backend whenever the session changes.
#[derive(Clone, Debug)]
pub struct SessionChange {
    pub event: AuthEvent,
    pub session: Option<Session>,
}

impl SessionChange {
    pub fn new(event: AuthEvent, session: Option<Session>) -> Self {
        Self { event, session }
    }
}

/// Raw profile row; the role column is free text until parsed by the caller.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ProfileRow {
    #[serde(default)]
    pub role: Option<String>,
}

impl ProfileRow {
    pub fn with_role(role: impl Into<String>) -> Self {
        Self {
            role: Some(role.into()),
        }
    }
}

/// The three backend operations the route guard depends on.
#[async_trait]
pub trait IdentityBackend: Send + Sync {
    /// Point-in-time read of the current session.
    async fn current_session(&self) -> Result<Option<Session>, AuthnError>;

    /// Subscribe to session changes. Dropping the stream unsubscribes.
    fn on_session_change(&self) -> SessionChanges;

    /// Single-row profile lookup keyed by user identity.
    async fn profile_role(&self, user_id: Uuid) -> Result<ProfileRow, AuthnError>;
}
