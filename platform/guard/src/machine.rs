use chrono::{DateTime, Utc};
use platform_authn::{AuthnError, ProfileRow, Session};
use platform_authz::{Observed, Role, RoleState};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Init,
    SessionPending,
    SessionAbsent,
    RolePending,
    RoleResolved,
    RoleLookupFailed,
}

/// Published view of the resolver's state.
#[derive(Clone, Debug)]
pub struct Snapshot {
    pub generation: u64,
    pub phase: Phase,
    pub session: Option<Session>,
    pub role: Option<Role>,
}

impl Snapshot {
    pub fn observed(&self) -> Observed {
        self.observed_at(Utc::now())
    }

    /// A session whose expiry has passed reads as signed out even before the
    /// backend reports it.
    pub fn observed_at(&self, now: DateTime<Utc>) -> Observed {
        if self.session.as_ref().is_some_and(|session| session.is_expired_at(now)) {
            return Observed::Anonymous;
        }
        match self.phase {
            Phase::Init | Phase::SessionPending => Observed::Unknown,
            Phase::SessionAbsent => Observed::Anonymous,
            Phase::RolePending => Observed::Authenticated(RoleState::Pending),
            Phase::RoleResolved | Phase::RoleLookupFailed => {
                Observed::Authenticated(RoleState::Settled(self.role))
            }
        }
    }
}

/// Backend call the machine wants performed, tagged with its generation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Effect {
    FetchSession { generation: u64 },
    LookupRole { generation: u64, user_id: Uuid },
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("result from generation {result} arrived while generation {current} is current")]
pub struct StaleResult {
    pub result: u64,
    pub current: u64,
}

/// I/O-free session/role state machine.
///
/// Every auth event bumps the generation; results carrying an older
/// generation are rejected with [`StaleResult`] and leave the state untouched.
#[derive(Debug)]
pub struct SessionMachine {
    generation: u64,
    phase: Phase,
    session: Option<Session>,
    role: Option<Role>,
}

impl Default for SessionMachine {
    fn default() -> Self {
        Self {
            generation: 0,
            phase: Phase::Init,
            session: None,
            role: None,
        }
    }
}

impl SessionMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            generation: self.generation,
            phase: self.phase,
            session: self.session.clone(),
            role: self.role,
        }
    }

    /// Begin a cycle with one point-in-time session fetch.
    pub fn start(&mut self) -> Effect {
        self.advance(Phase::SessionPending);
        Effect::FetchSession {
            generation: self.generation,
        }
    }

    /// Missed change notifications: nothing observed so far can be trusted.
    pub fn resync(&mut self) -> Effect {
        debug!(generation = self.generation, "resyncing after missed session changes");
        self.start()
    }

    pub fn session_fetched(
        &mut self,
        generation: u64,
        result: Result<Option<Session>, AuthnError>,
    ) -> Result<Option<Effect>, StaleResult> {
        self.ensure_current(generation, Phase::SessionPending)?;
        match result {
            Ok(session) => Ok(self.observe_session(session)),
            Err(err) => {
                warn!(error = %err, generation, "session fetch failed; treating visitor as signed out");
                self.enter_absent();
                Ok(None)
            }
        }
    }

    /// A pushed auth event supersedes everything in flight.
    pub fn session_changed(&mut self, session: Option<Session>) -> Option<Effect> {
        self.advance(Phase::SessionPending);
        self.observe_session(session)
    }

    pub fn role_resolved(
        &mut self,
        generation: u64,
        result: Result<ProfileRow, AuthnError>,
    ) -> Result<(), StaleResult> {
        self.ensure_current(generation, Phase::RolePending)?;
        match result {
            Ok(row) => {
                self.role = row.role.as_deref().and_then(|raw| match raw.parse::<Role>() {
                    Ok(role) => Some(role),
                    Err(err) => {
                        warn!(error = %err, "profile carries an unrecognised role");
                        None
                    }
                });
                self.phase = Phase::RoleResolved;
                debug!(generation, role = ?self.role, "role resolved");
            }
            Err(err) => {
                warn!(error = %err, generation, "role lookup failed; denying role-gated routes");
                self.role = None;
                self.phase = Phase::RoleLookupFailed;
            }
        }
        Ok(())
    }

    fn advance(&mut self, phase: Phase) {
        self.generation += 1;
        self.phase = phase;
        self.session = None;
        self.role = None;
    }

    fn ensure_current(&self, generation: u64, expected: Phase) -> Result<(), StaleResult> {
        if generation == self.generation && self.phase == expected {
            Ok(())
        } else {
            Err(StaleResult {
                result: generation,
                current: self.generation,
            })
        }
    }

    fn observe_session(&mut self, session: Option<Session>) -> Option<Effect> {
        match session {
            Some(session) if !session.is_expired_at(Utc::now()) => {
                let user_id = session.user_id();
                debug!(generation = self.generation, %user_id, "session present; looking up role");
                self.session = Some(session);
                self.role = None;
                self.phase = Phase::RolePending;
                Some(Effect::LookupRole {
                    generation: self.generation,
                    user_id,
                })
            }
            Some(_) => {
                debug!(generation = self.generation, "session already expired");
                self.enter_absent();
                None
            }
            None => {
                self.enter_absent();
                None
            }
        }
    }

    fn enter_absent(&mut self) {
        debug!(generation = self.generation, "no session");
        self.session = None;
        self.role = None;
        self.phase = Phase::SessionAbsent;
    }
}
