//! Session coordinator - Owns this context's view of the session
//!
//! Restores the session at startup, records sign-in and sign-out, and keeps
//! the local state in line with what other contexts write to the shared
//! store.

use std::sync::{Arc, Weak};

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::profile::{SessionState, UserProfile};
use super::SessionError;
use crate::broadcast::{Broadcaster, ChangeAction, ChangeEvent};
use crate::config::ClientConfig;
use crate::gateway::{RequestDescriptor, TokenGateway};
use crate::security::SecretString;
use crate::session::{keys, Namespace, SessionStore, SetOptions};

/// Callback type for session state transitions
pub type SessionCallback = Box<dyn Fn(&SessionState) + Send + Sync>;

struct Watcher {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct CoordinatorInner {
    gateway: TokenGateway,
    broadcaster: Broadcaster,
    state: RwLock<SessionState>,
    callbacks: RwLock<Vec<SessionCallback>>,
    watcher: Mutex<Option<Watcher>>,
    shutdown: CancellationToken,
}

impl Drop for CoordinatorInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Keeps the local session state consistent with the shared store
#[derive(Clone)]
pub struct SessionCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl SessionCoordinator {
    /// Creates a coordinator in the [`SessionState::Unknown`] state
    pub fn new(gateway: TokenGateway, broadcaster: Broadcaster) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                gateway,
                broadcaster,
                state: RwLock::new(SessionState::Unknown),
                callbacks: RwLock::new(Vec::new()),
                watcher: Mutex::new(None),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    fn store(&self) -> &SessionStore {
        self.inner.gateway.store()
    }

    fn config(&self) -> &ClientConfig {
        self.inner.gateway.config()
    }

    pub async fn state(&self) -> SessionState {
        self.inner.state.read().await.clone()
    }

    pub async fn current_user(&self) -> Option<UserProfile> {
        self.inner.state.read().await.user().cloned()
    }

    pub async fn is_authenticated(&self) -> bool {
        self.inner.state.read().await.is_authenticated()
    }

    /// Sets a callback to be called on every state transition
    pub async fn on_change<F>(&self, callback: F)
    where
        F: Fn(&SessionState) + Send + Sync + 'static,
    {
        self.inner.callbacks.write().await.push(Box::new(callback));
    }

    /// Startup rehydration
    ///
    /// Without credentials the session is unauthenticated. With credentials
    /// and a cached profile, the profile is adopted without a network round
    /// trip. Otherwise the profile is fetched; if that fails the stored
    /// session is unusable and is cleared.
    pub async fn restore(&self) -> SessionState {
        if self.inner.gateway.get_credentials().await.is_none() {
            tracing::info!("No stored credentials, starting signed out");
            self.set_state(SessionState::Unauthenticated).await;
            return self.state().await;
        }

        let cached: Option<UserProfile> = self.store().get(Namespace::User, keys::PROFILE).await;
        if let Some(profile) = cached {
            tracing::info!("Restored session for user {}", profile.masked_id());
            self.set_state(SessionState::Authenticated(profile)).await;
            return self.state().await;
        }

        if let Err(e) = self.refresh_profile().await {
            tracing::warn!("Could not load profile, clearing session: {}", e);
            self.clear_session().await;
        }
        self.state().await
    }

    /// Signs in and loads the user's profile
    pub async fn login(
        &self,
        username: &str,
        password: impl Into<SecretString>,
    ) -> Result<UserProfile, SessionError> {
        self.inner.gateway.login(username, password).await?;
        self.refresh_profile().await
    }

    /// Fetches the current user's profile and saves it
    pub async fn refresh_profile(&self) -> Result<UserProfile, SessionError> {
        let descriptor = RequestDescriptor::get(self.config().profile_path.as_str());
        let profile: UserProfile = self.inner.gateway.fetch(descriptor).await?;
        self.save_session(profile.clone()).await?;
        Ok(profile)
    }

    /// Caches the signed-in user and marks the session authenticated
    ///
    /// Credentials must already be stored; this does not sign in.
    pub async fn save_session(&self, profile: UserProfile) -> Result<(), SessionError> {
        if self.inner.gateway.get_credentials().await.is_none() {
            return Err(SessionError::NotAuthenticated);
        }

        self.store()
            .set_with(
                Namespace::User,
                keys::PROFILE,
                &profile,
                SetOptions::ttl(self.config().user_ttl()),
            )
            .await;
        self.set_state(SessionState::Authenticated(profile)).await;
        Ok(())
    }

    /// Drops credentials, cached user data and local state
    ///
    /// Device-scoped namespaces (preferences, UI state, feature flags) are
    /// kept. Every step runs regardless of the others.
    pub async fn clear_session(&self) {
        // Local state first, so the watcher ignores our own removals
        self.set_state(SessionState::Unauthenticated).await;

        self.inner.gateway.clear_credentials().await;
        self.store().remove(Namespace::User, keys::PROFILE).await;
        self.store().clear_namespaces(&Namespace::USER_SCOPED).await;
        tracing::info!("Session cleared");
    }

    pub async fn logout(&self) {
        if let Some(user) = self.current_user().await {
            tracing::info!("Signing out user {}", user.masked_id());
        }
        self.clear_session().await;
    }

    /// Starts reacting to changes made by other contexts
    ///
    /// Returns false if the watcher was already running.
    pub async fn start_watching(&self) -> bool {
        let mut watcher = self.inner.watcher.lock().await;
        if watcher.is_some() {
            return false;
        }

        let events = self.inner.broadcaster.listen();
        let cancel = self.inner.shutdown.child_token();
        let handle = tokio::spawn(watch(
            Arc::downgrade(&self.inner),
            cancel.clone(),
            events,
        ));
        *watcher = Some(Watcher { cancel, handle });

        tracing::info!("Session watcher started");
        true
    }

    /// Stops the watcher and waits for it to exit
    ///
    /// Returns false if it was not running.
    pub async fn stop_watching(&self) -> bool {
        let Some(watcher) = self.inner.watcher.lock().await.take() else {
            return false;
        };

        watcher.cancel.cancel();
        if let Err(e) = watcher.handle.await {
            tracing::warn!("Session watcher ended abnormally: {}", e);
        }
        tracing::info!("Session watcher stopped");
        true
    }

    pub async fn is_watching(&self) -> bool {
        self.inner.watcher.lock().await.is_some()
    }

    async fn set_state(&self, next: SessionState) {
        {
            let mut state = self.inner.state.write().await;
            if *state == next {
                return;
            }
            *state = next.clone();
        }

        for callback in self.inner.callbacks.read().await.iter() {
            callback(&next);
        }
    }

    async fn handle_event(&self, event: &ChangeEvent) {
        match event.action {
            ChangeAction::Remove if event.is(Namespace::Auth, keys::CREDENTIALS) => {
                self.on_credentials_removed().await
            }
            ChangeAction::Set if event.is(Namespace::User, keys::PROFILE) => {
                self.on_profile_written().await
            }
            _ => {}
        }
    }

    async fn on_credentials_removed(&self) {
        // Re-read: the event may be stale
        if self.inner.gateway.get_credentials().await.is_some() {
            return;
        }
        if self.state().await == SessionState::Unauthenticated {
            return;
        }
        tracing::info!("Credentials removed by another context, signing out");
        self.set_state(SessionState::Unauthenticated).await;
    }

    async fn on_profile_written(&self) {
        let stored: Option<UserProfile> = self.store().get(Namespace::User, keys::PROFILE).await;
        let Some(profile) = stored else {
            return;
        };
        if self.inner.gateway.get_credentials().await.is_none() {
            return;
        }

        let differs = match &*self.inner.state.read().await {
            SessionState::Authenticated(current) => !current.same_revision(&profile),
            _ => true,
        };
        if differs {
            tracing::info!(
                "Adopting profile {} (version {}) written elsewhere",
                profile.masked_id(),
                profile.version
            );
            self.set_state(SessionState::Authenticated(profile)).await;
        }
    }

    /// Full re-check after missed events
    async fn revalidate(&self) {
        if self.inner.gateway.get_credentials().await.is_none() {
            self.on_credentials_removed().await;
        } else {
            self.on_profile_written().await;
        }
    }
}

async fn watch(
    weak: Weak<CoordinatorInner>,
    cancel: CancellationToken,
    mut events: broadcast::Receiver<ChangeEvent>,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = events.recv() => {
                let Some(inner) = weak.upgrade() else { break };
                let coordinator = SessionCoordinator { inner };
                match received {
                    Ok(event) => coordinator.handle_event(&event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("Session watcher missed {} events, revalidating", skipped);
                        coordinator.revalidate().await;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }
    tracing::debug!("Session watcher loop exited");
}
