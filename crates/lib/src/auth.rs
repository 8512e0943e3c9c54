//! Auth session: login, restore-on-relaunch, logout.
//!
//! Login trades credentials for a short-lived token, then mints a durable API key whose
//! token becomes the session token and is persisted for the next launch. Restore re-checks
//! that token with the backend; logout clears local state first and revokes the key after.

use crate::backend::{Backend, BackendError, Credentials};
use crate::credentials::{
    load_persisted_user, save_persisted_user, CredentialStore, PersistedUser, StorageError,
    PERSISTED_USER_KEY,
};
use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;

/// Login strategy understood by the backend for username/password.
pub const LOCAL_STRATEGY: &str = "local";

/// The authenticated identity used by all later calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: String,
    pub display_name: String,
    pub token: String,
    pub token_id: String,
    pub valid_until: Option<DateTime<Utc>>,
}

impl Session {
    fn from_persisted(user: PersistedUser, valid_until: Option<DateTime<Utc>>) -> Self {
        Self {
            user_id: user.username.clone(),
            display_name: user.username,
            token: user.jwt,
            token_id: user.token_id,
            valid_until,
        }
    }

    fn to_persisted(&self) -> PersistedUser {
        PersistedUser {
            username: self.user_id.clone(),
            jwt: self.token.clone(),
            token_id: self.token_id.clone(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("username and password are required")]
    MissingCredentials,
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("the saved session could not be removed ({storage}) and the API key could not be revoked ({revoke})")]
    LogoutIncomplete {
        storage: StorageError,
        revoke: BackendError,
    },
}

/// A successful login. `unsaved` is set when the session works but could not be persisted,
/// so the next launch will ask for a login again.
#[derive(Debug)]
pub struct LoggedIn {
    pub session: Session,
    pub unsaved: Option<StorageError>,
}

/// Result of [`AuthSession::restore`]. Restore never fails; callers that only care about the
/// session use [`RestoreOutcome::session`].
#[derive(Debug)]
pub enum RestoreOutcome {
    Restored(Session),
    /// Nothing persisted (or the entry was corrupt).
    Absent,
    /// The backend says the token is invalid or expired. The persisted entry was removed, or
    /// the error says why it could not be.
    Rejected(Option<StorageError>),
    /// The token could not be checked (transport or server failure); the persisted entry is kept.
    Unverified(AuthError),
}

impl RestoreOutcome {
    pub fn session(&self) -> Option<&Session> {
        match self {
            RestoreOutcome::Restored(s) => Some(s),
            _ => None,
        }
    }
}

pub struct AuthSession {
    backend: Arc<dyn Backend>,
    store: Arc<dyn CredentialStore>,
    active: Option<Session>,
}

impl AuthSession {
    pub fn new(backend: Arc<dyn Backend>, store: Arc<dyn CredentialStore>) -> Self {
        Self {
            backend,
            store,
            active: None,
        }
    }

    pub fn active(&self) -> Option<&Session> {
        self.active.as_ref()
    }

    /// Log in with username/password and persist the resulting API key.
    pub async fn login(&mut self, credentials: &Credentials) -> Result<LoggedIn, AuthError> {
        if credentials.username.trim().is_empty() || credentials.password.is_empty() {
            return Err(AuthError::MissingCredentials);
        }
        let jwt = self
            .backend
            .login(LOCAL_STRATEGY, credentials)
            .await
            .map_err(|e| {
                if !e.is_unauthorized() {
                    return AuthError::Backend(e);
                }
                match e {
                    BackendError::Rejected { message, .. } => AuthError::InvalidCredentials(message),
                    other => AuthError::Backend(other),
                }
            })?;
        self.backend.set_token(Some(jwt));

        let label = format!("{} API key", credentials.username);
        let key = match self.backend.create_api_key(&label).await {
            Ok(k) => k,
            Err(e) => {
                self.backend.set_token(None);
                return Err(e.into());
            }
        };
        self.backend.set_token(Some(key.token.clone()));

        let session = Session {
            user_id: credentials.username.clone(),
            display_name: credentials.username.clone(),
            token: key.token,
            token_id: key.id,
            valid_until: None,
        };
        let unsaved = save_persisted_user(self.store.as_ref(), &session.to_persisted())
            .await
            .err();
        if let Some(e) = &unsaved {
            log::warn!("auth: logged in but could not persist credentials: {}", e);
        }
        log::info!("auth: logged in as {}", session.user_id);
        self.active = Some(session.clone());
        Ok(LoggedIn { session, unsaved })
    }

    /// Re-validate the active session, or the persisted one when there is none.
    pub async fn restore(&mut self) -> RestoreOutcome {
        let candidate = match self.active.take() {
            Some(s) => s.to_persisted(),
            None => match load_persisted_user(self.store.as_ref()).await {
                Some(user) => user,
                None => return RestoreOutcome::Absent,
            },
        };

        match self.backend.check_token(&candidate.jwt).await {
            Ok(check) if check.valid => {
                let valid_until = check
                    .expires_at
                    .and_then(|ms| Utc.timestamp_millis_opt(ms).single());
                self.backend.set_token(Some(candidate.jwt.clone()));
                let session = Session::from_persisted(candidate, valid_until);
                log::info!("auth: restored session for {}", session.user_id);
                self.active = Some(session.clone());
                RestoreOutcome::Restored(session)
            }
            Ok(_) => {
                log::info!("auth: persisted token for {} is no longer valid", candidate.username);
                self.backend.set_token(None);
                let stale = self.store.delete(PERSISTED_USER_KEY).await.err();
                if let Some(e) = &stale {
                    log::warn!("auth: could not drop rejected credentials: {}", e);
                }
                RestoreOutcome::Rejected(stale)
            }
            Err(e) => {
                log::warn!("auth: token verification failed: {}", e);
                RestoreOutcome::Unverified(e.into())
            }
        }
    }

    /// Clear local state, then revoke the API key. The in-memory session is gone either way;
    /// a failed storage delete and a failed revocation are both reported.
    pub async fn logout(&mut self) -> Result<(), AuthError> {
        let session = self.active.take();
        let storage = self.store.delete(PERSISTED_USER_KEY).await;

        let revoke = match &session {
            Some(s) => self.backend.delete_api_key(&s.token_id).await,
            None => Ok(()),
        };
        self.backend.set_token(None);
        if let Some(s) = &session {
            log::info!("auth: logged out {}", s.user_id);
        }

        match (storage, revoke) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(storage), Ok(())) => Err(storage.into()),
            (Ok(()), Err(revoke)) => Err(revoke.into()),
            (Err(storage), Err(revoke)) => Err(AuthError::LogoutIncomplete { storage, revoke }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::MemoryCredentialStore;
    use crate::testing::{FakeBackend, ReadOnlyCredentials};

    fn creds(user: &str, pw: &str) -> Credentials {
        Credentials {
            username: user.into(),
            password: pw.into(),
        }
    }

    fn setup() -> (Arc<FakeBackend>, Arc<MemoryCredentialStore>, AuthSession) {
        let (backend, _events) = FakeBackend::new();
        backend.add_user("alice", "pw");
        backend.link_up();
        let store = Arc::new(MemoryCredentialStore::new());
        let auth = AuthSession::new(backend.clone(), store.clone());
        (backend, store, auth)
    }

    #[tokio::test]
    async fn login_persists_api_key() {
        let (backend, store, mut auth) = setup();
        let LoggedIn { session, unsaved } = auth.login(&creds("alice", "pw")).await.unwrap();
        assert!(unsaved.is_none());
        assert_eq!(session.user_id, "alice");
        assert_eq!(backend.current_token(), Some(session.token.clone()));

        let persisted = load_persisted_user(store.as_ref()).await.unwrap();
        assert_eq!(persisted.jwt, session.token);
        assert_eq!(persisted.token_id, session.token_id);
        assert_eq!(auth.active(), Some(&session));
    }

    #[tokio::test]
    async fn bad_password_is_invalid_credentials() {
        let (_backend, store, mut auth) = setup();
        let err = auth.login(&creds("alice", "nope")).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials(_)));
        assert!(load_persisted_user(store.as_ref()).await.is_none());
        assert!(matches!(
            auth.login(&creds("", "pw")).await,
            Err(AuthError::MissingCredentials)
        ));
    }

    #[tokio::test]
    async fn restore_valid_persisted_token() {
        let (backend, store, mut auth) = setup();
        let session = auth.login(&creds("alice", "pw")).await.unwrap().session;

        let mut fresh = AuthSession::new(backend.clone(), store.clone());
        backend.set_token(None);
        let outcome = fresh.restore().await;
        assert_eq!(outcome.session().map(|s| s.token.as_str()), Some(session.token.as_str()));
        assert_eq!(backend.current_token(), Some(session.token));
    }

    #[tokio::test]
    async fn restore_invalid_token_returns_none_and_forgets_it() {
        let (backend, store, mut auth) = setup();
        save_persisted_user(
            store.as_ref(),
            &PersistedUser {
                username: "alice".into(),
                jwt: "expired".into(),
                token_id: "k".into(),
            },
        )
        .await
        .unwrap();
        let outcome = auth.restore().await;
        assert!(outcome.session().is_none());
        assert!(matches!(outcome, RestoreOutcome::Rejected(None)));
        assert!(load_persisted_user(store.as_ref()).await.is_none());
        assert_eq!(backend.current_token(), None);
    }

    #[tokio::test]
    async fn restore_without_entry_is_absent() {
        let (_backend, _store, mut auth) = setup();
        assert!(matches!(auth.restore().await, RestoreOutcome::Absent));
    }

    #[tokio::test]
    async fn restore_when_check_fails_keeps_persisted_entry() {
        let (backend, store, mut auth) = setup();
        auth.login(&creds("alice", "pw")).await.unwrap();
        backend.fail("check_token");
        let outcome = auth.restore().await;
        assert!(matches!(outcome, RestoreOutcome::Unverified(_)));
        assert!(load_persisted_user(store.as_ref()).await.is_some());
    }

    #[tokio::test]
    async fn logout_clears_locally_even_when_revocation_fails() {
        let (backend, store, mut auth) = setup();
        let session = auth.login(&creds("alice", "pw")).await.unwrap().session;
        backend.fail("delete_api_key");
        let err = auth.logout().await.unwrap_err();
        assert!(matches!(err, AuthError::Backend(_)));
        assert!(auth.active().is_none());
        assert!(load_persisted_user(store.as_ref()).await.is_none());
        assert_eq!(backend.current_token(), None);
        // Key was not revoked server side.
        assert!(backend.is_token_valid(&session.token));
    }

    #[tokio::test]
    async fn logout_revokes_key() {
        let (backend, _store, mut auth) = setup();
        let session = auth.login(&creds("alice", "pw")).await.unwrap().session;
        auth.logout().await.unwrap();
        assert!(!backend.is_token_valid(&session.token));
    }

    #[tokio::test]
    async fn login_reports_unsaved_session() {
        let (backend, _events) = FakeBackend::new();
        backend.add_user("alice", "pw");
        backend.link_up();
        let mut auth = AuthSession::new(backend.clone(), Arc::new(ReadOnlyCredentials::default()));
        let LoggedIn { session, unsaved } = auth.login(&creds("alice", "pw")).await.unwrap();
        assert!(matches!(unsaved, Some(StorageError::Io(_))));
        assert_eq!(auth.active(), Some(&session));
        assert_eq!(backend.current_token(), Some(session.token));
    }

    #[tokio::test]
    async fn rejected_restore_reports_undeletable_entry() {
        let (backend, _events) = FakeBackend::new();
        backend.link_up();
        let store = ReadOnlyCredentials::with_user(&PersistedUser {
            username: "alice".into(),
            jwt: "expired".into(),
            token_id: "k".into(),
        });
        let mut auth = AuthSession::new(backend, Arc::new(store));
        assert!(matches!(auth.restore().await, RestoreOutcome::Rejected(Some(_))));
    }

    #[tokio::test]
    async fn logout_reports_storage_and_revocation_failures_together() {
        let (backend, _events) = FakeBackend::new();
        backend.add_user("alice", "pw");
        backend.link_up();
        let mut auth = AuthSession::new(backend.clone(), Arc::new(ReadOnlyCredentials::default()));
        auth.login(&creds("alice", "pw")).await.unwrap();
        backend.fail("delete_api_key");
        let err = auth.logout().await.unwrap_err();
        assert!(matches!(err, AuthError::LogoutIncomplete { .. }));
        assert!(auth.active().is_none());
        assert_eq!(backend.current_token(), None);
    }

    #[tokio::test]
    async fn logout_storage_failure_alone_is_reported() {
        let (backend, _events) = FakeBackend::new();
        backend.add_user("alice", "pw");
        backend.link_up();
        let mut auth = AuthSession::new(backend.clone(), Arc::new(ReadOnlyCredentials::default()));
        let session = auth.login(&creds("alice", "pw")).await.unwrap().session;
        let err = auth.logout().await.unwrap_err();
        assert!(matches!(err, AuthError::Storage(_)));
        assert!(!backend.is_token_valid(&session.token));
    }
}
