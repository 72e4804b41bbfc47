use std::collections::{BTreeMap, BTreeSet};

use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{RequiredRoles, Role};

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("route {0} lists no roles; omit it to allow any signed-in user")]
    EmptyRoleSet(String),
    #[error("invalid route path {0:?}")]
    InvalidPath(String),
    #[error("route {0} is both public and role gated")]
    Conflict(String),
    #[error("route {0} is listed more than once")]
    Duplicate(String),
    #[error("default path {0} must be open to every signed-in user")]
    DefaultPathRestricted(String),
    #[error("login path {0} must be public")]
    LoginPathNotPublic(String),
    #[error("malformed policy document: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Access requirement for one path.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "access", content = "roles", rename_all = "snake_case")]
pub enum RouteRule {
    /// Rendered without a session (login, password reset).
    Public,
    Authenticated,
    Roles(RequiredRoles),
}

/// Serialized form of a policy, as read from `GUARD_POLICY_FILE`.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct PolicyDocument {
    #[serde(default = "default_login_path")]
    pub login_path: String,
    #[serde(default = "default_landing_path")]
    pub default_path: String,
    #[serde(default = "default_public_paths")]
    pub public: Vec<String>,
    #[serde(default)]
    pub routes: BTreeMap<String, Vec<Role>>,
}

fn default_login_path() -> String {
    "/login".to_string()
}

fn default_landing_path() -> String {
    "/dashboard".to_string()
}

fn default_public_paths() -> Vec<String> {
    vec![default_login_path()]
}

/// Strip query and fragment, percent-decode and lowercase each segment,
/// collapse slashes, drop the trailing slash.
///
/// Segments that decode to a separator, a dot segment, a control character
/// or another escape are rejected rather than guessed at.
pub fn normalize_path(raw: &str) -> Result<String, PolicyError> {
    let invalid = || PolicyError::InvalidPath(raw.to_string());
    let path = raw.split(['?', '#']).next().unwrap_or_default().trim();
    if !path.starts_with('/') {
        return Err(invalid());
    }
    let mut normalized = String::with_capacity(path.len());
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        let decoded = percent_decode_str(segment)
            .decode_utf8()
            .map_err(|_| invalid())?;
        let smuggled = decoded.contains(['/', '\\', '%']) || decoded.chars().any(char::is_control);
        if smuggled || decoded == "." || decoded == ".." {
            return Err(invalid());
        }
        normalized.push('/');
        normalized.push_str(&decoded.to_ascii_lowercase());
    }
    if normalized.is_empty() {
        normalized.push('/');
    }
    Ok(normalized)
}

/// Static table from navigable path to the roles allowed to view it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteAccessPolicy {
    login_path: String,
    default_path: String,
    public: BTreeSet<String>,
    routes: BTreeMap<String, RequiredRoles>,
}

impl RouteAccessPolicy {
    /// The dashboard's built-in table.
    pub fn farm_default() -> Self {
        use Role::{Admin, Manager, Worker};

        let routes = [
            ("/analytics", RequiredRoles::from([Admin, Manager])),
            ("/batches", RequiredRoles::from([Admin, Manager])),
            ("/feed", RequiredRoles::from([Admin, Manager, Worker])),
            ("/finance", RequiredRoles::from([Admin, Manager])),
            ("/health", RequiredRoles::from([Admin, Manager, Worker])),
            ("/production", RequiredRoles::from([Admin, Manager, Worker])),
            ("/staff", RequiredRoles::from([Admin])),
        ]
        .into_iter()
        .map(|(path, roles)| (path.to_string(), roles))
        .collect();

        Self {
            login_path: default_login_path(),
            default_path: default_landing_path(),
            public: default_public_paths().into_iter().collect(),
            routes,
        }
    }

    pub fn from_json(raw: &str) -> Result<Self, PolicyError> {
        let document: PolicyDocument = serde_json::from_str(raw)?;
        Self::try_from(document)
    }

    pub fn login_path(&self) -> &str {
        &self.login_path
    }

    pub fn default_path(&self) -> &str {
        &self.default_path
    }

    /// Most specific rule for `path`: exact match first, then the nearest
    /// listed ancestor, otherwise any signed-in user.
    pub fn rule_for(&self, path: &str) -> Result<RouteRule, PolicyError> {
        let normalized = normalize_path(path)?;
        let mut candidate = normalized.as_str();
        loop {
            if self.public.contains(candidate) {
                return Ok(RouteRule::Public);
            }
            if let Some(roles) = self.routes.get(candidate) {
                return Ok(RouteRule::Roles(roles.clone()));
            }
            match candidate.rfind('/') {
                Some(0) if candidate.len() > 1 => candidate = "/",
                Some(idx) if idx > 0 => candidate = &candidate[..idx],
                _ => return Ok(RouteRule::Authenticated),
            }
        }
    }

    pub fn routes(&self) -> impl Iterator<Item = (&str, &RequiredRoles)> {
        self.routes.iter().map(|(path, roles)| (path.as_str(), roles))
    }

    pub fn public_paths(&self) -> impl Iterator<Item = &str> {
        self.public.iter().map(String::as_str)
    }

    pub fn to_document(&self) -> PolicyDocument {
        PolicyDocument {
            login_path: self.login_path.clone(),
            default_path: self.default_path.clone(),
            public: self.public.iter().cloned().collect(),
            routes: self
                .routes
                .iter()
                .map(|(path, roles)| (path.clone(), roles.iter().collect()))
                .collect(),
        }
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        let listed = self.public.iter().chain(self.routes.keys());
        for path in listed {
            if normalize_path(path)? != *path {
                return Err(PolicyError::InvalidPath(path.clone()));
            }
        }
        for (path, roles) in &self.routes {
            if roles.is_empty() {
                return Err(PolicyError::EmptyRoleSet(path.clone()));
            }
            if self.public.contains(path) {
                return Err(PolicyError::Conflict(path.clone()));
            }
        }
        if self.rule_for(&self.login_path)? != RouteRule::Public {
            return Err(PolicyError::LoginPathNotPublic(self.login_path.clone()));
        }
        if self.rule_for(&self.default_path)? != RouteRule::Authenticated {
            return Err(PolicyError::DefaultPathRestricted(self.default_path.clone()));
        }
        Ok(())
    }
}

impl Default for RouteAccessPolicy {
    fn default() -> Self {
        Self::farm_default()
    }
}

impl TryFrom<PolicyDocument> for RouteAccessPolicy {
    type Error = PolicyError;

    fn try_from(document: PolicyDocument) -> Result<Self, Self::Error> {
        let public = document
            .public
            .iter()
            .map(|path| normalize_path(path))
            .collect::<Result<_, _>>()?;
        let mut routes = BTreeMap::new();
        for (path, roles) in document.routes {
            let key = normalize_path(&path)?;
            if routes.insert(key.clone(), roles.into_iter().collect()).is_some() {
                return Err(PolicyError::Duplicate(key));
            }
        }
        let policy = Self {
            login_path: normalize_path(&document.login_path)?,
            default_path: normalize_path(&document.default_path)?,
            public,
            routes,
        };
        policy.validate()?;
        Ok(policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_navigation_targets() {
        assert_eq!(normalize_path("/staff/").unwrap(), "/staff");
        assert_eq!(normalize_path("//finance//ledger?tab=1#top").unwrap(), "/finance/ledger");
        assert_eq!(normalize_path("/").unwrap(), "/");
        assert_eq!(normalize_path("/?next=x").unwrap(), "/");
        assert!(normalize_path("staff").is_err());
        assert!(normalize_path("/staff/../finance").is_err());
    }

    #[test]
    fn encoded_and_cased_spellings_share_one_path() {
        assert_eq!(normalize_path("/%73taff").unwrap(), "/staff");
        assert_eq!(normalize_path("/Staff").unwrap(), "/staff");
        assert_eq!(normalize_path("/STAFF/42").unwrap(), "/staff/42");
        assert_eq!(normalize_path("/%46inance/%4Cedger").unwrap(), "/finance/ledger");

        for smuggled in ["/%2e%2e/staff", "/a%2fstaff", "/a%5cstaff", "/%2573taff", "/st%00aff", "/%ff"] {
            assert!(
                matches!(normalize_path(smuggled), Err(PolicyError::InvalidPath(_))),
                "{smuggled} should be rejected"
            );
        }
    }

    #[test]
    fn gated_routes_cannot_be_reached_by_respelling() {
        let policy = RouteAccessPolicy::farm_default();
        let admin_only = RouteRule::Roles(RequiredRoles::from([Role::Admin]));
        for path in ["/staff", "/%73taff", "/Staff", "/STAFF/42", "/sTaFf/%34%32/"] {
            assert_eq!(policy.rule_for(path).unwrap(), admin_only, "{path}");
        }
        assert_eq!(policy.rule_for("/LOGIN").unwrap(), RouteRule::Public);
    }

    #[test]
    fn document_keys_are_normalized() {
        let policy = RouteAccessPolicy::from_json(
            r#"{"public": ["/Login"], "routes": {"/Finance/": ["manager"]}}"#,
        )
        .unwrap();
        assert_eq!(policy.routes().map(|(path, _)| path).collect::<Vec<_>>(), ["/finance"]);
        assert_eq!(
            policy.rule_for("/finance").unwrap(),
            RouteRule::Roles(RequiredRoles::from([Role::Manager]))
        );
        assert!(matches!(
            RouteAccessPolicy::from_json(r#"{"routes": {"/staff": ["admin"], "/Staff": ["worker"]}}"#),
            Err(PolicyError::Duplicate(path)) if path == "/staff"
        ));
    }

    #[test]
    fn farm_default_is_valid() {
        let policy = RouteAccessPolicy::farm_default();
        policy.validate().unwrap();
        assert_eq!(policy.login_path(), "/login");
        assert_eq!(policy.default_path(), "/dashboard");
        assert_eq!(policy.routes().count(), 7);
    }

    #[test]
    fn nested_paths_inherit_the_nearest_rule() {
        let policy = RouteAccessPolicy::farm_default();
        assert_eq!(
            policy.rule_for("/staff/42/edit").unwrap(),
            RouteRule::Roles(RequiredRoles::from([Role::Admin]))
        );
        assert_eq!(policy.rule_for("/login?next=/feed").unwrap(), RouteRule::Public);
        assert_eq!(policy.rule_for("/dashboard").unwrap(), RouteRule::Authenticated);
        assert_eq!(policy.rule_for("/").unwrap(), RouteRule::Authenticated);
        assert_eq!(policy.rule_for("/staffing").unwrap(), RouteRule::Authenticated);
    }

    #[test]
    fn loads_document_with_defaults() {
        let policy = RouteAccessPolicy::from_json(
            r#"{"routes": {"/finance": ["admin"], "/finance/payroll": ["admin"]}}"#,
        )
        .unwrap();
        assert_eq!(policy.login_path(), "/login");
        assert_eq!(
            policy.rule_for("/finance/payroll/2026").unwrap(),
            RouteRule::Roles(RequiredRoles::from([Role::Admin]))
        );
        let document = policy.to_document();
        assert_eq!(document.routes["/finance"], vec![Role::Admin]);
    }

    #[test]
    fn rejects_invalid_documents() {
        assert!(matches!(
            RouteAccessPolicy::from_json(r#"{"routes": {"/staff": []}}"#),
            Err(PolicyError::EmptyRoleSet(path)) if path == "/staff"
        ));
        assert!(matches!(
            RouteAccessPolicy::from_json(r#"{"routes": {"/staff/%2e%2e": ["admin"]}}"#),
            Err(PolicyError::InvalidPath(_))
        ));
        assert!(matches!(
            RouteAccessPolicy::from_json(r#"{"routes": {"/staff": ["owner"]}}"#),
            Err(PolicyError::Decode(_))
        ));
        assert!(matches!(
            RouteAccessPolicy::from_json(r#"{"default_path": "/staff", "routes": {"/staff": ["admin"]}}"#),
            Err(PolicyError::DefaultPathRestricted(_))
        ));
        assert!(matches!(
            RouteAccessPolicy::from_json(r#"{"public": [], "routes": {}}"#),
            Err(PolicyError::LoginPathNotPublic(_))
        ));
        assert!(matches!(
            RouteAccessPolicy::from_json(r#"{"public": ["/login", "/feed"], "routes": {"/feed": ["worker"]}}"#),
            Err(PolicyError::Conflict(_))
        ));
    }
}
