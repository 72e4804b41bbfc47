//! Session/role resolution for role-gated dashboard routes.
//!
//! [`SessionMachine`] holds the state transitions and generation bookkeeping
//! without doing any I/O. [`Resolver`] drives it against an
//! [`platform_authn::IdentityBackend`], and [`RouteGuard`] maps its decisions
//! onto navigation through a [`platform_authz::RouteAccessPolicy`].
//!
//! For the app-bootstrap screen, `resolver.resolve(&RequiredRoles::any())`
//! stays `Loading` until the first session read settles.

mod machine;
mod resolver;
mod route;

pub use machine::{Effect, Phase, SessionMachine, Snapshot, StaleResult};
pub use resolver::{Resolver, ResolverOptions};
pub use route::{Access, RouteGuard, Verdict};
