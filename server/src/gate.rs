use std::sync::Arc;

use platform_authn::Identity;
use platform_authz::{PolicyError, Role, RouteAccessPolicy};
use platform_guard::{Access, Resolver, ResolverOptions, RouteGuard};
use serde::Serialize;
use tracing::{info, instrument};

use crate::backend::BackendFactory;

/// Settled access check for one request.
#[derive(Clone, Debug, Serialize)]
pub struct Evaluation {
    #[serde(flatten)]
    pub access: Access,
    pub role: Option<Role>,
    pub user: Option<Identity>,
}

/// Runs the route guard on behalf of callers that cannot hold a resolver open.
#[derive(Clone)]
pub struct Gate {
    guard: RouteGuard,
    backends: Arc<dyn BackendFactory>,
    options: ResolverOptions,
}

impl Gate {
    pub fn new(
        policy: Arc<RouteAccessPolicy>,
        backends: Arc<dyn BackendFactory>,
        options: ResolverOptions,
    ) -> Self {
        Self {
            guard: RouteGuard::new(policy),
            backends,
            options,
        }
    }

    pub fn policy(&self) -> &RouteAccessPolicy {
        self.guard.policy()
    }

    #[instrument(name = "gate.evaluate", skip(self, token), fields(signed_in = token.is_some()))]
    pub async fn evaluate(&self, token: Option<&str>, path: &str) -> Result<Evaluation, PolicyError> {
        let resolver = Resolver::spawn(self.backends.for_token(token), self.options.clone());
        let access = self.guard.settle(&resolver, path).await?;
        let snapshot = resolver.snapshot();
        info!(path = %access.path, decision = ?access.decision, "route evaluated");
        Ok(Evaluation {
            access,
            role: snapshot.role,
            user: snapshot.session.map(|session| session.user),
        })
    }
}

#[cfg(test)]
mod tests {
    use platform_authz::Decision;
    use platform_guard::Verdict;

    use super::*;
    use crate::backend::testing::StaticFactory;

    fn gate() -> Gate {
        let factory = StaticFactory::default()
            .with_account("boss", "boss@farm.test", Some("admin"))
            .with_account("new-hire", "new@farm.test", None);
        Gate::new(
            Arc::new(RouteAccessPolicy::farm_default()),
            Arc::new(factory),
            ResolverOptions::default(),
        )
    }

    #[tokio::test]
    async fn anonymous_visitors_are_sent_to_login() {
        let evaluation = gate().evaluate(None, "/finance").await.unwrap();
        assert_eq!(evaluation.access.decision, Decision::RedirectLogin);
        assert!(evaluation.user.is_none());
    }

    #[tokio::test]
    async fn unassigned_role_reaches_only_open_routes() {
        let gate = gate();
        let dashboard = gate.evaluate(Some("new-hire"), "/dashboard").await.unwrap();
        assert_eq!(dashboard.access.verdict, Verdict::Render);

        let feed = gate.evaluate(Some("new-hire"), "/feed").await.unwrap();
        assert_eq!(feed.access.verdict, Verdict::Redirect("/dashboard".into()));
        assert_eq!(feed.role, None);
    }

    #[tokio::test]
    async fn admin_reaches_staff_pages() {
        let evaluation = gate().evaluate(Some("boss"), "/staff/7").await.unwrap();
        assert_eq!(evaluation.access.decision, Decision::Allow);
        assert_eq!(evaluation.role, Some(Role::Admin));
        assert_eq!(
            evaluation.user.and_then(|user| user.email).as_deref(),
            Some("boss@farm.test")
        );
    }
}
