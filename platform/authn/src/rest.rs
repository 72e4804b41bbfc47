use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{Client, RequestBuilder, StatusCode};
use tracing::{debug, instrument};
use url::Url;
use uuid::Uuid;

use crate::{
    AuthEvent, AuthnError, ChangeNotifier, Identity, IdentityBackend, ProfileRow, Session,
    SessionChange, SessionChanges,
};

const USER_PATH: &str = "auth/v1/user";
const PROFILES_PATH: &str = "rest/v1/profiles";

/// Connection settings for the hosted auth/data service.
#[derive(Clone, Debug)]
pub struct RestConfig {
    pub base_url: Url,
    pub api_key: String,
}

impl RestConfig {
    pub fn new(base_url: &str, api_key: impl Into<String>) -> Result<Self, AuthnError> {
        let mut base = base_url.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        Ok(Self {
            base_url: Url::parse(&base)?,
            api_key: api_key.into(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, AuthnError> {
        Ok(self.base_url.join(path)?)
    }
}

/// Backend client for one browser-equivalent session.
///
/// The hosted service pushes nothing to a server-side client, so change events
/// come from the sign-in/sign-out calls made through this value.
#[derive(Debug)]
pub struct RestBackend {
    client: Client,
    config: Arc<RestConfig>,
    token: RwLock<Option<String>>,
    notifier: ChangeNotifier,
}

impl RestBackend {
    pub fn new(client: Client, config: Arc<RestConfig>) -> Self {
        Self {
            client,
            config,
            token: RwLock::new(None),
            notifier: ChangeNotifier::default(),
        }
    }

    /// Restore a token obtained elsewhere without emitting a change.
    pub fn with_token(self, token: impl Into<String>) -> Self {
        *self.token.write() = Some(token.into());
        self
    }

    pub async fn sign_in_with_token(
        &self,
        token: impl Into<String>,
    ) -> Result<Option<Session>, AuthnError> {
        *self.token.write() = Some(token.into());
        let session = self.current_session().await?;
        let event = if session.is_some() {
            AuthEvent::SignedIn
        } else {
            AuthEvent::SignedOut
        };
        self.notifier
            .notify(SessionChange::new(event, session.clone()));
        Ok(session)
    }

    pub fn sign_out(&self) {
        self.token.write().take();
        self.notifier
            .notify(SessionChange::new(AuthEvent::SignedOut, None));
    }

    fn authorized(&self, builder: RequestBuilder, token: &str) -> RequestBuilder {
        builder.header("apikey", &self.config.api_key).bearer_auth(token)
    }
}

#[async_trait]
impl IdentityBackend for RestBackend {
    #[instrument(name = "authn.current_session", skip_all)]
    async fn current_session(&self) -> Result<Option<Session>, AuthnError> {
        let Some(token) = self.token.read().clone() else {
            return Ok(None);
        };
        let url = self.config.endpoint(USER_PATH)?;
        let response = self
            .authorized(self.client.get(url), &token)
            .send()
            .await?;
        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                debug!(status = %response.status(), "token rejected by backend");
                Ok(None)
            }
            status if !status.is_success() => Err(AuthnError::Status {
                status: status.as_u16(),
                context: "session fetch",
            }),
            _ => {
                let body = response.bytes().await?;
                let user: Identity = serde_json::from_slice(&body)?;
                Ok(Some(Session::new(token, user)))
            }
        }
    }

    fn on_session_change(&self) -> SessionChanges {
        self.notifier.subscribe()
    }

    #[instrument(name = "authn.profile_role", skip(self))]
    async fn profile_role(&self, user_id: Uuid) -> Result<ProfileRow, AuthnError> {
        let mut url = self.config.endpoint(PROFILES_PATH)?;
        url.query_pairs_mut()
            .append_pair("id", &format!("eq.{user_id}"))
            .append_pair("select", "role");
        let token = self
            .token
            .read()
            .clone()
            .unwrap_or_else(|| self.config.api_key.clone());
        let response = self
            .authorized(self.client.get(url), &token)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AuthnError::Status {
                status: status.as_u16(),
                context: "profile lookup",
            });
        }
        let body = response.bytes().await?;
        let rows: Vec<ProfileRow> = serde_json::from_slice(&body)?;
        rows.into_iter()
            .next()
            .ok_or(AuthnError::ProfileNotFound(user_id))
    }
}
