use std::sync::Arc;

use platform_authn::{IdentityBackend, RestBackend, RestConfig};

/// Builds a backend client scoped to one request's credentials.
pub trait BackendFactory: Send + Sync {
    fn for_token(&self, token: Option<&str>) -> Arc<dyn IdentityBackend>;
}

pub struct RestFactory {
    client: reqwest::Client,
    config: Arc<RestConfig>,
}

impl RestFactory {
    pub fn new(config: Arc<RestConfig>) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

impl BackendFactory for RestFactory {
    fn for_token(&self, token: Option<&str>) -> Arc<dyn IdentityBackend> {
        let backend = RestBackend::new(self.client.clone(), self.config.clone());
        match token {
            Some(token) => Arc::new(backend.with_token(token)),
            None => Arc::new(backend),
        }
    }
}

#[cfg(test)]
pub mod testing {
    use std::collections::HashMap;

    use platform_authn::{Identity, MemoryBackend, Session};
    use uuid::Uuid;

    use super::*;

    /// Token table standing in for the hosted backend.
    #[derive(Default)]
    pub struct StaticFactory {
        accounts: HashMap<String, (Identity, Option<String>)>,
    }

    impl StaticFactory {
        pub fn with_account(mut self, token: &str, email: &str, role: Option<&str>) -> Self {
            let identity = Identity::new(Uuid::new_v4(), email);
            self.accounts
                .insert(token.to_string(), (identity, role.map(str::to_string)));
            self
        }
    }

    impl BackendFactory for StaticFactory {
        fn for_token(&self, token: Option<&str>) -> Arc<dyn IdentityBackend> {
            let account = token.and_then(|token| self.accounts.get(token).map(|a| (token, a)));
            match account {
                Some((token, (identity, role))) => Arc::new(
                    MemoryBackend::new()
                        .with_profile(identity.id, role.as_deref())
                        .with_session(Session::new(token, identity.clone())),
                ),
                None => Arc::new(MemoryBackend::new()),
            }
        }
    }
}
