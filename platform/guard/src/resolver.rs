use std::{future::Future, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use futures_util::{
    FutureExt, StreamExt,
    future::BoxFuture,
    stream::FuturesUnordered,
};
use platform_authn::{
    AuthnError, ChangeStreamError, IdentityBackend, ProfileRow, Session, SessionChange,
    SessionChanges,
};
use platform_authz::{Decision, Observed, RequiredRoles, decide};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, instrument, warn};

use crate::machine::{Effect, SessionMachine, Snapshot};

#[derive(Clone, Debug)]
pub struct ResolverOptions {
    /// Upper bound on each backend call; expiry counts as a failed call.
    pub fetch_timeout: Duration,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(10),
        }
    }
}

/// Live session/role resolver.
///
/// Subscribes to the backend's session changes on construction and keeps
/// publishing [`Snapshot`]s until dropped. Dropping the handle unsubscribes
/// and discards whatever is still in flight. One resolver can back any number
/// of route guards.
pub struct Resolver {
    snapshots: watch::Receiver<Snapshot>,
    driver: JoinHandle<()>,
}

impl Resolver {
    /// Must be called from within a tokio runtime.
    pub fn spawn(backend: Arc<dyn IdentityBackend>, options: ResolverOptions) -> Self {
        // subscribe before the first fetch so no event slips between them
        let changes = backend.on_session_change();
        let mut machine = SessionMachine::new();
        let first = machine.start();
        let (snapshots, rx) = watch::channel(machine.snapshot());
        let driver = Driver {
            backend,
            options,
            machine,
            changes: Some(changes),
            snapshots,
            inflight: FuturesUnordered::new(),
        };
        Self {
            snapshots: rx,
            driver: tokio::spawn(driver.run(first)),
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshots.borrow().clone()
    }

    pub fn observed(&self) -> Observed {
        self.snapshots.borrow().observed()
    }

    pub fn generation(&self) -> u64 {
        self.snapshots.borrow().generation
    }

    /// Current decision for a route; `Loading` until enough is known.
    pub fn resolve(&self, required: &RequiredRoles) -> Decision {
        decide(self.observed(), required)
    }

    /// Wait for the first terminal decision for `required`.
    pub async fn settled(&self, required: &RequiredRoles) -> Decision {
        let mut snapshots = self.snapshots.clone();
        loop {
            let decision = decide(snapshots.borrow_and_update().observed(), required);
            if decision.is_terminal() {
                return decision;
            }
            if snapshots.changed().await.is_err() {
                // driver is gone and nothing will settle
                return Decision::RedirectLogin;
            }
        }
    }

    /// Receiver for re-rendering on every published change.
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.snapshots.clone()
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

enum Completion {
    Session {
        generation: u64,
        result: Result<Option<Session>, AuthnError>,
    },
    Role {
        generation: u64,
        result: Result<ProfileRow, AuthnError>,
    },
}

struct Driver {
    backend: Arc<dyn IdentityBackend>,
    options: ResolverOptions,
    machine: SessionMachine,
    changes: Option<SessionChanges>,
    snapshots: watch::Sender<Snapshot>,
    inflight: FuturesUnordered<BoxFuture<'static, Completion>>,
}

impl Driver {
    #[instrument(name = "guard.resolver", skip_all)]
    async fn run(mut self, first: Effect) {
        self.launch(first);
        loop {
            tokio::select! {
                change = next_change(&mut self.changes) => self.on_change(change),
                Some(done) = self.inflight.next(), if !self.inflight.is_empty() => {
                    self.on_completion(done)
                }
            }
        }
    }

    fn on_change(&mut self, change: Result<SessionChange, ChangeStreamError>) {
        let effect = match change {
            Ok(change) => {
                debug!(event = ?change.event, "session change observed");
                self.machine.session_changed(change.session)
            }
            Err(ChangeStreamError::Lagged(missed)) => {
                warn!(missed, "session change stream lagged");
                Some(self.machine.resync())
            }
            Err(ChangeStreamError::Closed) => {
                debug!("session change stream closed");
                self.changes = None;
                return;
            }
        };
        if let Some(effect) = effect {
            self.launch(effect);
        }
        self.publish();
    }

    fn on_completion(&mut self, done: Completion) {
        let applied = match done {
            Completion::Session { generation, result } => {
                match self.machine.session_fetched(generation, result) {
                    Ok(Some(effect)) => {
                        self.launch(effect);
                        Ok(())
                    }
                    Ok(None) => Ok(()),
                    Err(stale) => Err(stale),
                }
            }
            Completion::Role { generation, result } => {
                self.machine.role_resolved(generation, result)
            }
        };
        match applied {
            Ok(()) => self.publish(),
            Err(stale) => debug!(%stale, "discarding stale backend result"),
        }
    }

    fn launch(&mut self, effect: Effect) {
        let backend = self.backend.clone();
        let limit = self.options.fetch_timeout;
        let call: BoxFuture<'static, Completion> = match effect {
            Effect::FetchSession { generation } => Box::pin(async move {
                let result = bounded(limit, backend.current_session()).await;
                Completion::Session { generation, result }
            }),
            Effect::LookupRole {
                generation,
                user_id,
            } => Box::pin(async move {
                let result = bounded(limit, backend.profile_role(user_id)).await;
                Completion::Role { generation, result }
            }),
        };
        self.inflight.push(call);
    }

    fn publish(&self) {
        let snapshot = self.machine.snapshot();
        debug!(generation = snapshot.generation, phase = ?snapshot.phase, "resolver state");
        self.snapshots.send_replace(snapshot);
    }
}

async fn next_change(
    changes: &mut Option<SessionChanges>,
) -> Result<SessionChange, ChangeStreamError> {
    match changes {
        Some(changes) => changes.recv().await,
        None => std::future::pending().await,
    }
}

/// Run a backend call under the timeout, turning expiry and panics into errors.
async fn bounded<T>(
    limit: Duration,
    call: impl Future<Output = Result<T, AuthnError>>,
) -> Result<T, AuthnError> {
    match AssertUnwindSafe(tokio::time::timeout(limit, call))
        .catch_unwind()
        .await
    {
        Ok(Ok(result)) => result,
        Ok(Err(_elapsed)) => Err(AuthnError::TimedOut(limit)),
        Err(_panic) => Err(AuthnError::Unavailable("backend call panicked".into())),
    }
}

#[cfg(test)]
mod tests {
    use platform_authn::{Identity, MemoryBackend};
    use platform_authz::Role;
    use uuid::Uuid;

    use super::*;
    use crate::machine::Phase;

    fn manager() -> Identity {
        Identity::new(Uuid::new_v4(), "manager@farm.test")
    }

    #[tokio::test(start_paused = true)]
    async fn resolves_restored_session_and_role() {
        let user = manager();
        let backend = Arc::new(
            MemoryBackend::new()
                .with_profile(user.id, Some("manager"))
                .with_session(Session::new("tok", user)),
        );
        let resolver = Resolver::spawn(backend.clone(), ResolverOptions::default());
        let gated = RequiredRoles::from([Role::Manager]);

        assert_eq!(resolver.resolve(&gated), Decision::Loading);
        assert_eq!(resolver.settled(&gated).await, Decision::Allow);
        assert_eq!(resolver.snapshot().phase, Phase::RoleResolved);
        assert_eq!(backend.session_fetches(), 1);
        assert_eq!(backend.role_lookups(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_role_lookup_times_out_to_default() {
        let user = manager();
        let backend = Arc::new(
            MemoryBackend::new()
                .with_profile(user.id, Some("admin"))
                .with_session(Session::new("tok", user)),
        );
        backend.pause_role_lookups();
        let resolver = Resolver::spawn(
            backend,
            ResolverOptions {
                fetch_timeout: Duration::from_secs(2),
            },
        );
        let decision = resolver.settled(&RequiredRoles::from([Role::Admin])).await;
        assert_eq!(decision, Decision::RedirectDefault);
        assert_eq!(resolver.snapshot().phase, Phase::RoleLookupFailed);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_resolver_unsubscribes() {
        let backend = Arc::new(MemoryBackend::new());
        let resolver = Resolver::spawn(backend.clone(), ResolverOptions::default());
        assert_eq!(backend.subscribers(), 1);
        assert_eq!(
            resolver.settled(&RequiredRoles::any()).await,
            Decision::RedirectLogin
        );
        drop(resolver);
        for _ in 0..16 {
            if backend.subscribers() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(backend.subscribers(), 0);
    }

    async fn exploding_call() -> Result<(), AuthnError> {
        panic!("backend bug")
    }

    #[tokio::test]
    async fn panicking_calls_degrade_to_errors() {
        let result = bounded(Duration::from_secs(1), exploding_call()).await;
        assert!(matches!(result, Err(AuthnError::Unavailable(_))));
    }
}
