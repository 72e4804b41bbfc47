use std::sync::Arc;

use platform_authz::{
    Decision, PolicyError, RequiredRoles, RouteAccessPolicy, RouteRule, normalize_path,
};
use serde::Serialize;
use url::form_urlencoded;

use crate::resolver::Resolver;

/// Navigation outcome for one route.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", content = "location", rename_all = "snake_case")]
pub enum Verdict {
    Render,
    Pending,
    Redirect(String),
}

/// Result of guarding a single navigation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Access {
    pub path: String,
    pub rule: RouteRule,
    pub decision: Decision,
    #[serde(flatten)]
    pub verdict: Verdict,
}

/// Parameterised guard shared by every protected route.
#[derive(Clone, Debug)]
pub struct RouteGuard {
    policy: Arc<RouteAccessPolicy>,
}

impl RouteGuard {
    pub fn new(policy: Arc<RouteAccessPolicy>) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RouteAccessPolicy {
        &self.policy
    }

    /// Current verdict without waiting.
    pub fn check(&self, resolver: &Resolver, path: &str) -> Result<Access, PolicyError> {
        let (path, rule) = self.lookup(path)?;
        let decision = match requirement(&rule) {
            Some(required) => resolver.resolve(&required),
            None => Decision::Allow,
        };
        Ok(self.access(path, rule, decision))
    }

    /// Verdict once the resolver has settled for this route.
    pub async fn settle(&self, resolver: &Resolver, path: &str) -> Result<Access, PolicyError> {
        let (path, rule) = self.lookup(path)?;
        let decision = match requirement(&rule) {
            Some(required) => resolver.settled(&required).await,
            None => Decision::Allow,
        };
        Ok(self.access(path, rule, decision))
    }

    pub fn verdict(&self, path: &str, decision: Decision) -> Verdict {
        match decision {
            Decision::Allow => Verdict::Render,
            Decision::Loading => Verdict::Pending,
            Decision::RedirectDefault => Verdict::Redirect(self.policy.default_path().to_string()),
            Decision::RedirectLogin => {
                let next: String = form_urlencoded::byte_serialize(path.as_bytes()).collect();
                Verdict::Redirect(format!("{}?next={next}", self.policy.login_path()))
            }
        }
    }

    fn lookup(&self, path: &str) -> Result<(String, RouteRule), PolicyError> {
        let normalized = normalize_path(path)?;
        let rule = self.policy.rule_for(&normalized)?;
        Ok((normalized, rule))
    }

    fn access(&self, path: String, rule: RouteRule, decision: Decision) -> Access {
        let verdict = self.verdict(&path, decision);
        Access {
            path,
            rule,
            decision,
            verdict,
        }
    }
}

fn requirement(rule: &RouteRule) -> Option<RequiredRoles> {
    match rule {
        RouteRule::Public => None,
        RouteRule::Authenticated => Some(RequiredRoles::any()),
        RouteRule::Roles(roles) => Some(roles.clone()),
    }
}
