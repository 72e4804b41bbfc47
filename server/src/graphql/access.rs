use async_graphql::{Enum, SimpleObject};
use platform_authz::{Decision, Role, RouteAccessPolicy};
use platform_guard::Verdict;

use crate::gate::Evaluation;

#[derive(Enum, Copy, Clone, Debug, Eq, PartialEq)]
pub enum DecisionKind {
    Loading,
    RedirectLogin,
    RedirectDefault,
    Allow,
}

impl From<Decision> for DecisionKind {
    fn from(value: Decision) -> Self {
        match value {
            Decision::Loading => DecisionKind::Loading,
            Decision::RedirectLogin => DecisionKind::RedirectLogin,
            Decision::RedirectDefault => DecisionKind::RedirectDefault,
            Decision::Allow => DecisionKind::Allow,
        }
    }
}

#[derive(Enum, Copy, Clone, Debug, Eq, PartialEq)]
pub enum VerdictKind {
    Render,
    Pending,
    Redirect,
}

#[derive(Enum, Copy, Clone, Debug, Eq, PartialEq)]
pub enum AccessKind {
    Public,
    Authenticated,
    Roles,
}

#[derive(Enum, Copy, Clone, Debug, Eq, PartialEq)]
pub enum RoleKind {
    Admin,
    Manager,
    Worker,
}

impl From<Role> for RoleKind {
    fn from(value: Role) -> Self {
        match value {
            Role::Admin => RoleKind::Admin,
            Role::Manager => RoleKind::Manager,
            Role::Worker => RoleKind::Worker,
        }
    }
}

#[derive(Clone, Debug, SimpleObject)]
pub struct AccessPayload {
    pub path: String,
    pub decision: DecisionKind,
    pub verdict: VerdictKind,
    pub redirect_to: Option<String>,
    pub role: Option<RoleKind>,
    pub email: Option<String>,
}

impl From<Evaluation> for AccessPayload {
    fn from(evaluation: Evaluation) -> Self {
        let (verdict, redirect_to) = match evaluation.access.verdict {
            Verdict::Render => (VerdictKind::Render, None),
            Verdict::Pending => (VerdictKind::Pending, None),
            Verdict::Redirect(location) => (VerdictKind::Redirect, Some(location)),
        };
        Self {
            path: evaluation.access.path,
            decision: evaluation.access.decision.into(),
            verdict,
            redirect_to,
            role: evaluation.role.map(RoleKind::from),
            email: evaluation.user.and_then(|user| user.email),
        }
    }
}

#[derive(Clone, Debug, SimpleObject)]
pub struct RoutePayload {
    pub path: String,
    pub access: AccessKind,
    pub roles: Vec<RoleKind>,
}

impl RoutePayload {
    pub fn from_policy(policy: &RouteAccessPolicy) -> Vec<Self> {
        let public = policy.public_paths().map(|path| Self {
            path: path.to_string(),
            access: AccessKind::Public,
            roles: Vec::new(),
        });
        let landing = std::iter::once(Self {
            path: policy.default_path().to_string(),
            access: AccessKind::Authenticated,
            roles: Vec::new(),
        });
        let gated = policy.routes().map(|(path, roles)| Self {
            path: path.to_string(),
            access: AccessKind::Roles,
            roles: roles.iter().map(RoleKind::from).collect(),
        });
        public.chain(landing).chain(gated).collect()
    }
}
