//! Authorization primitives for the farm dashboard.
//!
//! Everything here is synchronous and free of I/O: roles, the route access
//! policy, and [`decide`], which turns what the guard has observed so far into
//! a navigation decision.

mod policy;

use std::{collections::BTreeSet, fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use policy::{PolicyDocument, PolicyError, RouteAccessPolicy, RouteRule, normalize_path};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown role {0:?}")]
pub struct UnknownRole(pub String);

/// Coarse permission tier stored on a user's profile.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Manager,
    Worker,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Admin, Role::Manager, Role::Worker];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Manager => "manager",
            Role::Worker => "worker",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "manager" => Ok(Role::Manager),
            "worker" => Ok(Role::Worker),
            _ => Err(UnknownRole(value.to_string())),
        }
    }
}

/// Roles permitted on a route. Empty means any authenticated session.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct RequiredRoles(BTreeSet<Role>);

impl RequiredRoles {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, role: Role) -> bool {
        self.0.contains(&role)
    }

    /// Whether a settled role (possibly none) satisfies this requirement.
    pub fn permits(&self, role: Option<Role>) -> bool {
        self.is_empty() || role.is_some_and(|role| self.contains(role))
    }

    pub fn iter(&self) -> impl Iterator<Item = Role> + '_ {
        self.0.iter().copied()
    }
}

impl<const N: usize> From<[Role; N]> for RequiredRoles {
    fn from(roles: [Role; N]) -> Self {
        Self(roles.into_iter().collect())
    }
}

impl FromIterator<Role> for RequiredRoles {
    fn from_iter<I: IntoIterator<Item = Role>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Progress of the profile-role lookup for a present session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoleState {
    Pending,
    /// Lookup finished; `None` covers a null role, an unknown role and a
    /// failed lookup alike.
    Settled(Option<Role>),
}

/// What the guard currently knows about the visitor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Observed {
    Unknown,
    Anonymous,
    Authenticated(RoleState),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Loading,
    RedirectLogin,
    RedirectDefault,
    Allow,
}

impl Decision {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Decision::Loading)
    }
}

/// Map an observation and a route requirement to a decision.
pub fn decide(observed: Observed, required: &RequiredRoles) -> Decision {
    match observed {
        Observed::Unknown => Decision::Loading,
        Observed::Anonymous => Decision::RedirectLogin,
        Observed::Authenticated(_) if required.is_empty() => Decision::Allow,
        Observed::Authenticated(RoleState::Pending) => Decision::Loading,
        Observed::Authenticated(RoleState::Settled(role)) => {
            if required.permits(role) {
                Decision::Allow
            } else {
                Decision::RedirectDefault
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn role_strategy() -> impl Strategy<Value = Option<Role>> {
        prop::option::of(prop::sample::select(Role::ALL.to_vec()))
    }

    fn required_strategy() -> impl Strategy<Value = RequiredRoles> {
        prop::collection::vec(prop::sample::select(Role::ALL.to_vec()), 0..4)
            .prop_map(|roles| roles.into_iter().collect())
    }

    fn observed_strategy() -> impl Strategy<Value = Observed> {
        prop_oneof![
            Just(Observed::Unknown),
            Just(Observed::Anonymous),
            Just(Observed::Authenticated(RoleState::Pending)),
            role_strategy().prop_map(|role| Observed::Authenticated(RoleState::Settled(role))),
        ]
    }

    #[test]
    fn roles_parse_loosely_and_print_canonically() {
        assert_eq!(" Admin ".parse::<Role>().unwrap(), Role::Admin);
        assert_eq!("WORKER".parse::<Role>().unwrap(), Role::Worker);
        assert!("owner".parse::<Role>().is_err());
        assert_eq!(Role::Manager.to_string(), "manager");
    }

    #[test]
    fn required_roles_deserialize_from_json_list() {
        let roles: RequiredRoles = serde_json::from_str(r#"["manager","admin","admin"]"#).unwrap();
        assert_eq!(roles, RequiredRoles::from([Role::Admin, Role::Manager]));
        assert_eq!(roles.iter().collect::<Vec<_>>(), vec![Role::Admin, Role::Manager]);
    }

    #[test]
    fn worker_is_sent_to_default_from_manager_routes() {
        let required = RequiredRoles::from([Role::Admin, Role::Manager]);
        let observed = Observed::Authenticated(RoleState::Settled(Some(Role::Worker)));
        assert_eq!(decide(observed, &required), Decision::RedirectDefault);
    }

    #[test]
    fn pending_role_blocks_only_gated_routes() {
        let pending = Observed::Authenticated(RoleState::Pending);
        assert_eq!(decide(pending, &RequiredRoles::any()), Decision::Allow);
        assert_eq!(
            decide(pending, &RequiredRoles::from([Role::Admin])),
            Decision::Loading
        );
    }

    #[test]
    fn anonymous_is_never_allowed() {
        assert_eq!(
            decide(Observed::Anonymous, &RequiredRoles::any()),
            Decision::RedirectLogin
        );
        assert_eq!(
            decide(Observed::Anonymous, &RequiredRoles::from([Role::Admin])),
            Decision::RedirectLogin
        );
    }

    proptest! {
        #[test]
        fn gated_routes_fail_closed(role in role_strategy(), required in required_strategy()) {
            prop_assume!(!required.is_empty());
            let observed = Observed::Authenticated(RoleState::Settled(role));
            let allowed = role.is_some_and(|r| required.contains(r));
            prop_assert_eq!(decide(observed, &required) == Decision::Allow, allowed);
        }

        #[test]
        fn open_routes_admit_any_session(role in role_strategy()) {
            let settled = Observed::Authenticated(RoleState::Settled(role));
            prop_assert_eq!(decide(settled, &RequiredRoles::any()), Decision::Allow);
        }

        #[test]
        fn decisions_are_stable(observed in observed_strategy(), required in required_strategy()) {
            prop_assert_eq!(decide(observed, &required), decide(observed, &required));
        }
    }
}
