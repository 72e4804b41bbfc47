use std::{
    collections::HashMap,
    sync::atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

use crate::{
    AuthEvent, AuthnError, ChangeNotifier, Identity, IdentityBackend, ProfileRow, Session,
    SessionChange, SessionChanges,
};

#[derive(Debug, Default)]
struct State {
    session: Option<Session>,
    profiles: HashMap<Uuid, ProfileRow>,
    session_failure: Option<String>,
    role_failure: Option<String>,
}

/// In-process identity backend used by tests and local demos.
///
/// Behaves like a single signed-in browser tab: one current session, change
/// events for sign-in/sign-out/refresh, and a profile table that the staff
/// screen mutates through [`MemoryBackend::set_role`].
#[derive(Debug)]
pub struct MemoryBackend {
    state: Mutex<State>,
    notifier: ChangeNotifier,
    session_gate: watch::Sender<bool>,
    role_gate: watch::Sender<bool>,
    session_fetches: AtomicUsize,
    role_lookups: AtomicUsize,
    role_lookups_completed: AtomicUsize,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self {
            state: Mutex::new(State::default()),
            notifier: ChangeNotifier::default(),
            session_gate: watch::Sender::new(false),
            role_gate: watch::Sender::new(false),
            session_fetches: AtomicUsize::new(0),
            role_lookups: AtomicUsize::new(0),
            role_lookups_completed: AtomicUsize::new(0),
        }
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profile(self, user_id: Uuid, role: Option<&str>) -> Self {
        self.set_role(user_id, role);
        self
    }

    /// Restore a persisted session without emitting a change event.
    pub fn with_session(self, session: Session) -> Self {
        self.state.lock().session = Some(session);
        self
    }

    /// Staff-management mutation: assign or clear a user's role.
    pub fn set_role(&self, user_id: Uuid, role: Option<&str>) {
        self.state.lock().profiles.insert(
            user_id,
            ProfileRow {
                role: role.map(str::to_string),
            },
        );
    }

    pub fn remove_profile(&self, user_id: Uuid) {
        self.state.lock().profiles.remove(&user_id);
    }

    pub fn sign_in(&self, user: Identity) -> Session {
        let session = Session::new(Uuid::new_v4().simple().to_string(), user);
        self.sign_in_session(session.clone());
        session
    }

    pub fn sign_in_session(&self, session: Session) {
        self.state.lock().session = Some(session.clone());
        self.emit(AuthEvent::SignedIn, Some(session));
    }

    /// Rotate the access token of the current session, if any.
    pub fn refresh_token(&self) -> Option<Session> {
        let refreshed = {
            let mut state = self.state.lock();
            let current = state.session.as_mut()?;
            current.access_token = Uuid::new_v4().simple().to_string();
            current.clone()
        };
        self.emit(AuthEvent::TokenRefreshed, Some(refreshed.clone()));
        Some(refreshed)
    }

    pub fn sign_out(&self) {
        self.state.lock().session = None;
        self.emit(AuthEvent::SignedOut, None);
    }

    /// Make every `current_session` call fail until cleared with `None`.
    pub fn fail_session_fetch(&self, reason: Option<&str>) {
        self.state.lock().session_failure = reason.map(str::to_string);
    }

    /// Make every `profile_role` call fail until cleared with `None`.
    pub fn fail_role_lookup(&self, reason: Option<&str>) {
        self.state.lock().role_failure = reason.map(str::to_string);
    }

    /// Hold session fetches in flight until [`MemoryBackend::resume_session_fetches`].
    pub fn pause_session_fetches(&self) {
        self.session_gate.send_replace(true);
    }

    pub fn resume_session_fetches(&self) {
        self.session_gate.send_replace(false);
    }

    /// Hold role lookups in flight until [`MemoryBackend::resume_role_lookups`].
    pub fn pause_role_lookups(&self) {
        self.role_gate.send_replace(true);
    }

    pub fn resume_role_lookups(&self) {
        self.role_gate.send_replace(false);
    }

    pub fn session_fetches(&self) -> usize {
        self.session_fetches.load(Ordering::SeqCst)
    }

    pub fn role_lookups(&self) -> usize {
        self.role_lookups.load(Ordering::SeqCst)
    }

    pub fn role_lookups_completed(&self) -> usize {
        self.role_lookups_completed.load(Ordering::SeqCst)
    }

    pub fn subscribers(&self) -> usize {
        self.notifier.subscribers()
    }

    fn emit(&self, event: AuthEvent, session: Option<Session>) {
        let delivered = self.notifier.notify(SessionChange::new(event, session));
        debug!(?event, delivered, "memory backend session change");
    }
}

/// Resolve once `paused` reads false.
async fn wait_for(paused: &watch::Sender<bool>) {
    let mut gate = paused.subscribe();
    loop {
        if !*gate.borrow_and_update() {
            return;
        }
        if gate.changed().await.is_err() {
            return;
        }
    }
}

#[async_trait]
impl IdentityBackend for MemoryBackend {
    async fn current_session(&self) -> Result<Option<Session>, AuthnError> {
        self.session_fetches.fetch_add(1, Ordering::SeqCst);
        wait_for(&self.session_gate).await;
        let state = self.state.lock();
        if let Some(reason) = &state.session_failure {
            return Err(AuthnError::Unavailable(reason.clone()));
        }
        Ok(state.session.clone())
    }

    fn on_session_change(&self) -> SessionChanges {
        self.notifier.subscribe()
    }

    async fn profile_role(&self, user_id: Uuid) -> Result<ProfileRow, AuthnError> {
        self.role_lookups.fetch_add(1, Ordering::SeqCst);
        wait_for(&self.role_gate).await;
        let result = {
            let state = self.state.lock();
            match &state.role_failure {
                Some(reason) => Err(AuthnError::Unavailable(reason.clone())),
                None => state
                    .profiles
                    .get(&user_id)
                    .cloned()
                    .ok_or(AuthnError::ProfileNotFound(user_id)),
            }
        };
        self.role_lookups_completed.fetch_add(1, Ordering::SeqCst);
        result
    }
}
