//! The process-wide session manager.
//!
//! `SessionManager` owns the one `Session` of the running client. Every
//! mutation goes through its operations; callers share it by cloning the
//! handle. Memory is always updated first and durable storage second, and
//! storage failures are logged rather than surfaced.

use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use reqwest::Method;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::api::{is_unauthorized, ApiClient};
use crate::forms::{LoginForm, RegisterForm};
use crate::models::{LoginOptions, LoginRequest, PasswordChange, TokenResponse, User};

use super::notify::{LogNotifier, NotificationLevel, Notifier};
use super::session::{AuthState, Session};
use super::store::{keys, SecretStore};
use super::AuthError;

/// A refresh in flight. Every caller that hits a 401 while it runs awaits
/// the same future, so concurrent failures cost one refresh call.
type PendingRefresh = Shared<BoxFuture<'static, Option<String>>>;

/// How a refresh call ended, judged against the session as it is now
enum RefreshOutcome {
    Renewed(String),
    /// Logout or a new login happened while the call was in flight. Carries
    /// the access token of the session that replaced ours, if any.
    Superseded(Option<String>),
    Failed,
}

struct Inner {
    api: ApiClient,
    store: Arc<dyn SecretStore>,
    notifier: Arc<dyn Notifier>,
    session: RwLock<Session>,
    pending_refresh: Mutex<Option<PendingRefresh>>,
}

/// Cheap to clone; all clones share one session.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(api: ApiClient, store: Arc<dyn SecretStore>) -> Self {
        Self::with_notifier(api, store, Arc::new(LogNotifier))
    }

    pub fn with_notifier(
        api: ApiClient,
        store: Arc<dyn SecretStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                api,
                store,
                notifier,
                session: RwLock::new(Session::default()),
                pending_refresh: Mutex::new(None),
            }),
        }
    }

    // =========================================================================
    // Storage helpers (best effort)
    // =========================================================================

    fn read_stored(&self, key: &str) -> Option<String> {
        match self.inner.store.get(key) {
            Ok(value) => value,
            Err(e) => {
                warn!(key, error = %e, "Failed to read stored session value");
                None
            }
        }
    }

    fn persist(&self, key: &str, value: &str) {
        if let Err(e) = self.inner.store.set(key, value) {
            warn!(key, error = %e, "Failed to persist session value");
        }
    }

    fn forget(&self, keys: &[&str]) {
        if let Err(e) = self.inner.store.remove_many(keys) {
            warn!(?keys, error = %e, "Failed to remove stored session values");
        }
    }

    fn persist_tokens(&self, tokens: &TokenResponse) {
        self.persist(keys::ACCESS_TOKEN, &tokens.access_token);
        self.persist(keys::REFRESH_TOKEN, &tokens.refresh_token);
    }

    fn persist_user(&self, user: &User) {
        match serde_json::to_string(user) {
            Ok(json) => self.persist(keys::USER, &json),
            Err(e) => warn!(error = %e, "Failed to serialize user"),
        }
    }

    fn notify_error(&self, err: &AuthError) {
        self.inner
            .notifier
            .notify(NotificationLevel::Error, &err.user_message());
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Hydrate the session from durable storage. Call once at startup.
    pub async fn initialize(&self) {
        let access_token = self.read_stored(keys::ACCESS_TOKEN);
        let refresh_token = self.read_stored(keys::REFRESH_TOKEN);
        let user = self
            .read_stored(keys::USER)
            .and_then(|json| match serde_json::from_str::<User>(&json) {
                Ok(user) => Some(user),
                Err(e) => {
                    warn!(error = %e, "Failed to parse stored user");
                    None
                }
            });
        let remembered_email = self.read_stored(keys::REMEMBERED_EMAIL);
        let remember_me = self
            .read_stored(keys::REMEMBER_ME)
            .map(|flag| flag == "true")
            .unwrap_or(false);

        let mut session = self.inner.session.write().await;
        // A user without a token would break the authenticated invariant
        session.user = if access_token.is_some() { user } else { None };
        session.access_token = access_token;
        session.refresh_token = refresh_token;
        session.remembered_email = remembered_email;
        session.remember_me = remember_me;
        session.expires_at = None;

        info!(
            authenticated = session.is_authenticated(),
            has_user = session.user.is_some(),
            remember_me,
            "Session restored"
        );
    }

    /// Validate the login form, then log in. Invalid input never reaches
    /// the network.
    pub async fn submit_login(&self, form: &LoginForm) -> Result<User, AuthError> {
        let (credentials, options) = match form.validate() {
            Ok(valid) => valid,
            Err(errors) => {
                let err = AuthError::from(errors);
                debug!(error = %err, "Login form rejected");
                self.inner.session.write().await.last_error = Some(err.user_message());
                self.notify_error(&err);
                return Err(err);
            }
        };
        self.login(&credentials, options).await
    }

    /// Authenticate, store the token pair and load the user profile.
    ///
    /// With `remember_me` the tokens and email are persisted. Without it any
    /// previously persisted tokens are erased and only the email is kept for
    /// prefill. If the profile cannot be loaded afterwards the session is
    /// ended and `ProfileFetchFailure` is returned.
    pub async fn login(
        &self,
        credentials: &LoginRequest,
        options: LoginOptions,
    ) -> Result<User, AuthError> {
        {
            let mut session = self.inner.session.write().await;
            session.loading = true;
            session.last_error = None;
        }
        info!(email = %credentials.email, remember_me = options.remember_me, "Logging in");

        let tokens = match self.inner.api.authenticate(credentials).await {
            Ok(tokens) => tokens,
            Err(e) => {
                error!(error = %e, "Login failed");
                let err = AuthError::from_login_failure(&e);
                self.fail_login(&err).await;
                return Err(err);
            }
        };

        {
            let mut session = self.inner.session.write().await;
            session.apply_tokens(&tokens);
            session.remember_me = options.remember_me;
            session.remembered_email = Some(credentials.email.clone());
        }

        if options.remember_me {
            self.persist_tokens(&tokens);
        } else {
            self.forget(&keys::SESSION);
        }
        self.persist(keys::REMEMBERED_EMAIL, &credentials.email);
        self.persist(keys::REMEMBER_ME, if options.remember_me { "true" } else { "false" });

        match self.fetch_current_user().await {
            Ok(user) => {
                self.inner.session.write().await.loading = false;
                info!(user = %user.username, "Login successful");
                self.inner.notifier.notify(
                    NotificationLevel::Success,
                    &format!("Welcome, {}", user.display_name()),
                );
                Ok(user)
            }
            Err(e) => {
                let err = match e {
                    AuthError::ProfileFetchFailure(_) => e,
                    other => AuthError::ProfileFetchFailure(other.user_message()),
                };
                self.fail_login(&err).await;
                Err(err)
            }
        }
    }

    /// Validate the registration form, create the account and sign in with
    /// the new credentials. Invalid input never reaches the network.
    pub async fn submit_register(&self, form: &RegisterForm) -> Result<User, AuthError> {
        let (request, options) = match form.to_request() {
            Ok(valid) => valid,
            Err(errors) => {
                let err = AuthError::from(errors);
                debug!(error = %err, "Registration form rejected");
                self.fail_login(&err).await;
                return Err(err);
            }
        };

        {
            let mut session = self.inner.session.write().await;
            session.loading = true;
            session.last_error = None;
        }
        info!(email = %request.credentials.email, "Registering account");

        if let Err(e) = self.inner.api.register(&request).await {
            error!(error = %e, "Registration failed");
            let err = AuthError::from_request(&e);
            self.fail_login(&err).await;
            return Err(err);
        }
        info!(email = %request.credentials.email, "Account registered");
        self.inner
            .notifier
            .notify(NotificationLevel::Success, "Account created");

        let credentials = LoginRequest::new(
            request.credentials.email.clone(),
            request.credentials.password.clone(),
        );
        self.login(&credentials, options).await
    }

    async fn fail_login(&self, err: &AuthError) {
        {
            let mut session = self.inner.session.write().await;
            session.loading = false;
            session.last_error = Some(err.user_message());
        }
        self.notify_error(err);
    }

    /// End the session from any state. Never fails; storage errors are logged.
    pub async fn logout(&self) {
        {
            let mut session = self.inner.session.write().await;
            session.clear_credentials();
        }
        self.forget(&keys::SESSION);
        info!("Logged out");
    }

    // =========================================================================
    // Token refresh
    // =========================================================================

    /// Exchange the refresh token for a new pair and return the new access
    /// token. A missing token or failed exchange ends the session and
    /// yields `None`.
    pub async fn refresh_access_token(&self) -> Option<String> {
        let pending = {
            let mut slot = self.inner.pending_refresh.lock().await;
            match slot.as_ref() {
                Some(pending) => {
                    debug!("Joining in-flight token refresh");
                    pending.clone()
                }
                None => {
                    let this = self.clone();
                    let pending: PendingRefresh =
                        async move { this.run_refresh().await }.boxed().shared();
                    *slot = Some(pending.clone());
                    pending
                }
            }
        };
        pending.await
    }

    async fn run_refresh(&self) -> Option<String> {
        let refresh_token = {
            let mut session = self.inner.session.write().await;
            let token = session.refresh_token.clone();
            if token.is_some() {
                session.refreshing = true;
            }
            token
        };

        let outcome = match refresh_token {
            None => {
                warn!("No refresh token available");
                RefreshOutcome::Failed
            }
            Some(refresh_token) => {
                let tokens = match self.inner.api.refresh(&refresh_token).await {
                    Ok(tokens) => Some(tokens),
                    Err(e) => {
                        warn!(error = %e, "Token refresh failed");
                        None
                    }
                };
                self.settle_refresh(&refresh_token, tokens).await
            }
        };

        let result = match outcome {
            RefreshOutcome::Renewed(token) => Some(token),
            RefreshOutcome::Superseded(token) => token,
            RefreshOutcome::Failed => {
                // End the session while the pending slot is still held, so a
                // late waiter cannot start another refresh with the dead token
                self.logout().await;
                self.notify_error(&AuthError::SessionExpired);
                None
            }
        };

        self.inner.pending_refresh.lock().await.take();
        result
    }

    /// Apply the result of a refresh call made with `used`, unless the
    /// session changed underneath us (logout or a new login while the
    /// request was in flight).
    async fn settle_refresh(&self, used: &str, tokens: Option<TokenResponse>) -> RefreshOutcome {
        let mut session = self.inner.session.write().await;
        if session.refresh_token.as_deref() != Some(used) {
            debug!("Session changed during refresh, discarding the result");
            session.refreshing = false;
            return RefreshOutcome::Superseded(session.access_token.clone());
        }
        let Some(tokens) = tokens else {
            return RefreshOutcome::Failed;
        };
        session.apply_tokens(&tokens);
        session.refreshing = false;
        let remember_me = session.remember_me;
        drop(session);

        if remember_me {
            self.persist_tokens(&tokens);
        }
        info!("Access token refreshed");
        RefreshOutcome::Renewed(tokens.access_token)
    }

    /// Refresh after `stale` was rejected. If another task already replaced
    /// that token, use the replacement instead of refreshing again.
    async fn refresh_after_rejection(&self, stale: Option<&str>) -> Option<String> {
        {
            let session = self.inner.session.read().await;
            match session.access_token.as_deref() {
                Some(current) if Some(current) != stale && !session.refreshing => {
                    debug!("Access token already replaced, skipping refresh");
                    return Some(current.to_string());
                }
                None if stale.is_some() || session.refresh_token.is_none() => {
                    debug!("Session already ended, skipping refresh");
                    return None;
                }
                _ => {}
            }
        }
        self.refresh_access_token().await
    }

    /// Refresh ahead of time when the token is inside its expiry buffer.
    /// Returns the token to use, or `None` when there is no session.
    pub async fn ensure_fresh_token(&self) -> Option<String> {
        let (token, due) = {
            let session = self.inner.session.read().await;
            (session.access_token.clone(), session.needs_refresh())
        };
        match token {
            Some(_) if due => {
                debug!("Access token close to expiry, refreshing");
                self.refresh_access_token().await
            }
            other => other,
        }
    }

    pub async fn needs_refresh(&self) -> bool {
        self.inner.session.read().await.needs_refresh()
    }

    // =========================================================================
    // Authorized requests
    // =========================================================================

    /// Run `op` with the current access token. On a 401 the token is
    /// refreshed once and `op` replayed once; a second 401 is returned as a
    /// request failure.
    pub async fn authorized<T, F, Fut>(&self, op: F) -> Result<T, AuthError>
    where
        F: Fn(Option<String>) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let token = self.access_token().await;
        match op(token.clone()).await {
            Ok(value) => Ok(value),
            Err(e) if is_unauthorized(&e) => {
                debug!("Request unauthorized, attempting token refresh");
                let Some(new_token) = self.refresh_after_rejection(token.as_deref()).await else {
                    return Err(AuthError::SessionExpired);
                };
                op(Some(new_token)).await.map_err(|e| {
                    warn!(error = %e, "Request failed after token refresh");
                    AuthError::from_request(&e)
                })
            }
            Err(e) => Err(AuthError::from_request(&e)),
        }
    }

    pub async fn request<T, B>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<T, AuthError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let api = &self.inner.api;
        self.authorized(|token| {
            let method = method.clone();
            async move { api.request(method, path, token.as_deref(), body).await }
        })
        .await
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, AuthError> {
        self.request(Method::GET, path, None::<&()>).await
    }

    pub async fn post<T, B>(&self, path: &str, body: &B) -> Result<T, AuthError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.request(Method::POST, path, Some(body)).await
    }

    // =========================================================================
    // Profile
    // =========================================================================

    async fn fetch_current_user(&self) -> Result<User, AuthError> {
        let api = &self.inner.api;
        let result = self
            .authorized(|token| async move { api.fetch_current_user(token.as_deref()).await })
            .await;

        match result {
            Ok(user) => {
                let remember_me = {
                    let mut session = self.inner.session.write().await;
                    if !session.is_authenticated() {
                        // Logged out while the request was in flight
                        return Err(AuthError::SessionExpired);
                    }
                    session.user = Some(user.clone());
                    session.remember_me
                };
                if remember_me {
                    self.persist_user(&user);
                }
                debug!(user = %user.username, "User profile loaded");
                Ok(user)
            }
            Err(e) => {
                let err = match e {
                    AuthError::SessionExpired => AuthError::SessionExpired,
                    other => AuthError::ProfileFetchFailure(other.user_message()),
                };
                if err.forces_logout() {
                    warn!(error = %err, "Failed to fetch current user, ending session");
                    self.logout().await;
                }
                Err(err)
            }
        }
    }

    /// Reload the user profile. Without an access token nothing is sent.
    /// Any failure ends the session.
    pub async fn get_current_user(&self) -> Option<User> {
        if !self.is_authenticated().await {
            return None;
        }
        match self.fetch_current_user().await {
            Ok(user) => Some(user),
            Err(e) => {
                self.notify_error(&e);
                None
            }
        }
    }

    pub async fn change_password(&self, change: &PasswordChange) -> Result<(), AuthError> {
        let api = &self.inner.api;
        let result = self
            .authorized(|token| async move { api.change_password(token.as_deref(), change).await })
            .await;

        match result {
            Ok(()) => {
                info!("Password changed");
                self.inner
                    .notifier
                    .notify(NotificationLevel::Success, "Password changed");
                Ok(())
            }
            Err(e) => {
                self.notify_error(&e);
                Err(e)
            }
        }
    }

    /// Re-read the remembered email for login-form prefill
    pub async fn load_remembered_email(&self) -> Option<String> {
        let email = self.read_stored(keys::REMEMBERED_EMAIL);
        self.inner.session.write().await.remembered_email = email.clone();
        email
    }

    pub async fn set_error(&self, error: Option<String>) {
        self.inner.session.write().await.last_error = error;
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn is_authenticated(&self) -> bool {
        self.inner.session.read().await.is_authenticated()
    }

    pub async fn has_role(&self, role: &str) -> bool {
        self.inner.session.read().await.has_role(role)
    }

    pub async fn has_any_role<S: AsRef<str>>(&self, roles: &[S]) -> bool {
        self.inner.session.read().await.has_any_role(roles)
    }

    pub async fn state(&self) -> AuthState {
        self.inner.session.read().await.state()
    }

    pub async fn access_token(&self) -> Option<String> {
        self.inner.session.read().await.access_token.clone()
    }

    pub async fn user(&self) -> Option<User> {
        self.inner.session.read().await.user.clone()
    }

    pub async fn last_error(&self) -> Option<String> {
        self.inner.session.read().await.last_error.clone()
    }

    pub async fn remembered_email(&self) -> Option<String> {
        self.inner.session.read().await.remembered_email.clone()
    }

    pub async fn snapshot(&self) -> Session {
        self.inner.session.read().await.clone()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use mockito::{Matcher, Server, ServerGuard};

    use chrono::NaiveDate;

    use crate::auth::store::MemoryStore;

    const ADMIN_JSON: &str = r#"{"id":"u-1","username":"admin","email":"admin@example.com","full_name":"Fleet Admin","is_active":true,"is_verified":true,"roles":["admin","operator"]}"#;

    fn token_json(access: &str, refresh: &str) -> String {
        format!(
            r#"{{"access_token":"{}","refresh_token":"{}","token_type":"bearer","expires_in":1800}}"#,
            access, refresh
        )
    }

    #[derive(Default)]
    struct RecordingNotifier {
        messages: StdMutex<Vec<(NotificationLevel, String)>>,
    }

    impl RecordingNotifier {
        fn errors(&self) -> Vec<String> {
            self.messages
                .lock()
                .unwrap()
                .iter()
                .filter(|(level, _)| *level == NotificationLevel::Error)
                .map(|(_, m)| m.clone())
                .collect()
        }
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, level: NotificationLevel, message: &str) {
            self.messages.lock().unwrap().push((level, message.to_string()));
        }
    }

    struct Harness {
        server: ServerGuard,
        store: Arc<MemoryStore>,
        notifier: Arc<RecordingNotifier>,
        manager: SessionManager,
    }

    async fn harness() -> Harness {
        let server = Server::new_async().await;
        let api = ApiClient::new(&server.url(), Duration::from_secs(5)).unwrap();
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let manager = SessionManager::with_notifier(api, store.clone(), notifier.clone());
        Harness {
            server,
            store,
            notifier,
            manager,
        }
    }

    async fn mock_login_ok(server: &mut ServerGuard) -> mockito::Mock {
        server
            .mock("POST", "/api/auth/login")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("username".into(), "admin".into()),
                Matcher::UrlEncoded("password".into(), "admin123".into()),
            ]))
            .with_status(200)
            .with_body(token_json("acc-1", "ref-1"))
            .create_async()
            .await
    }

    async fn mock_me(server: &mut ServerGuard, token: &str) -> mockito::Mock {
        server
            .mock("GET", "/api/auth/me")
            .match_header("authorization", format!("Bearer {}", token).as_str())
            .with_status(200)
            .with_body(ADMIN_JSON)
            .create_async()
            .await
    }

    fn admin() -> LoginRequest {
        LoginRequest::new("admin", "admin123")
    }

    #[tokio::test]
    async fn test_login_success_authenticates() {
        let mut h = harness().await;
        let _login = mock_login_ok(&mut h.server).await;
        let _me = mock_me(&mut h.server, "acc-1").await;

        let user = h
            .manager
            .login(&admin(), LoginOptions::default())
            .await
            .expect("login should succeed");

        assert_eq!(user.username, "admin");
        assert!(h.manager.is_authenticated().await);
        assert_eq!(h.manager.state().await, AuthState::Authenticated);
        assert!(h.manager.has_role("admin").await);
        assert!(!h.manager.has_role("auditor").await);
        assert!(h.manager.has_any_role(&["auditor", "operator"]).await);
        assert!(!h.manager.snapshot().await.loading);
    }

    #[tokio::test]
    async fn test_login_rejected_stays_anonymous() {
        let mut h = harness().await;
        let _login = h
            .server
            .mock("POST", "/api/auth/login")
            .with_status(401)
            .with_body(r#"{"detail":"Incorrect username or password"}"#)
            .create_async()
            .await;
        h.store.set(keys::REMEMBERED_EMAIL, "previous@example.com").unwrap();

        let err = h
            .manager
            .login(&LoginRequest::new("admin", "nope"), LoginOptions::remember())
            .await
            .expect_err("login should fail");

        assert_eq!(
            err,
            AuthError::InvalidCredentials("Incorrect username or password".to_string())
        );
        assert!(!h.manager.is_authenticated().await);
        assert!(h.manager.user().await.is_none());
        assert_eq!(h.manager.state().await, AuthState::Anonymous);
        assert_eq!(
            h.manager.last_error().await.as_deref(),
            Some("Incorrect username or password")
        );
        // Durable storage untouched
        assert_eq!(
            h.store.get(keys::REMEMBERED_EMAIL).unwrap().as_deref(),
            Some("previous@example.com")
        );
        assert!(!h.store.contains(keys::REMEMBER_ME));
        assert_eq!(h.notifier.errors(), vec!["Incorrect username or password"]);
    }

    #[tokio::test]
    async fn test_login_network_failure() {
        // Nothing listens on the discard port
        let api = ApiClient::new("http://127.0.0.1:9", Duration::from_secs(2)).unwrap();
        let store = Arc::new(MemoryStore::new());
        let manager = SessionManager::new(api, store.clone());

        let err = manager
            .login(&admin(), LoginOptions::default())
            .await
            .expect_err("nothing should answer");

        assert!(matches!(err, AuthError::NetworkFailure(_)), "{:?}", err);
        assert!(!manager.is_authenticated().await);
        assert!(!store.contains(keys::REMEMBERED_EMAIL));
    }

    #[tokio::test]
    async fn test_login_with_remember_me_persists_everything() {
        let mut h = harness().await;
        let _login = mock_login_ok(&mut h.server).await;
        let _me = mock_me(&mut h.server, "acc-1").await;

        h.manager
            .login(&admin(), LoginOptions::remember())
            .await
            .expect("login should succeed");

        assert_eq!(h.store.get(keys::ACCESS_TOKEN).unwrap().as_deref(), Some("acc-1"));
        assert_eq!(h.store.get(keys::REFRESH_TOKEN).unwrap().as_deref(), Some("ref-1"));
        assert_eq!(h.store.get(keys::REMEMBERED_EMAIL).unwrap().as_deref(), Some("admin"));
        assert_eq!(h.store.get(keys::REMEMBER_ME).unwrap().as_deref(), Some("true"));
        let stored_user: User =
            serde_json::from_str(&h.store.get(keys::USER).unwrap().unwrap()).unwrap();
        assert_eq!(stored_user.id, "u-1");
    }

    #[tokio::test]
    async fn test_login_without_remember_me_keeps_only_email() {
        let mut h = harness().await;
        let _login = mock_login_ok(&mut h.server).await;
        let _me = mock_me(&mut h.server, "acc-1").await;
        // Leftovers from an earlier remembered session
        h.store.set(keys::ACCESS_TOKEN, "old-acc").unwrap();
        h.store.set(keys::REFRESH_TOKEN, "old-ref").unwrap();
        h.store.set(keys::USER, ADMIN_JSON).unwrap();

        h.manager
            .login(&admin(), LoginOptions::default())
            .await
            .expect("login should succeed");

        assert!(h.manager.is_authenticated().await);
        assert!(!h.store.contains(keys::ACCESS_TOKEN));
        assert!(!h.store.contains(keys::REFRESH_TOKEN));
        assert!(!h.store.contains(keys::USER));
        assert_eq!(h.store.get(keys::REMEMBERED_EMAIL).unwrap().as_deref(), Some("admin"));
        assert_eq!(h.store.get(keys::REMEMBER_ME).unwrap().as_deref(), Some("false"));
    }

    #[tokio::test]
    async fn test_login_profile_failure_ends_session() {
        let mut h = harness().await;
        let _login = mock_login_ok(&mut h.server).await;
        let _me = h
            .server
            .mock("GET", "/api/auth/me")
            .with_status(500)
            .create_async()
            .await;

        let err = h
            .manager
            .login(&admin(), LoginOptions::remember())
            .await
            .expect_err("profile failure should fail login");

        assert!(matches!(err, AuthError::ProfileFetchFailure(_)), "{:?}", err);
        assert!(!h.manager.is_authenticated().await);
        assert!(!h.store.contains(keys::ACCESS_TOKEN));
        assert!(!h.store.contains(keys::REFRESH_TOKEN));
    }

    #[tokio::test]
    async fn test_logout_clears_memory_and_storage() {
        let mut h = harness().await;
        let _login = mock_login_ok(&mut h.server).await;
        let _me = mock_me(&mut h.server, "acc-1").await;
        h.manager.login(&admin(), LoginOptions::remember()).await.unwrap();

        h.manager.logout().await;

        assert!(!h.manager.is_authenticated().await);
        assert!(h.manager.user().await.is_none());
        assert!(!h.manager.has_role("admin").await);
        assert!(!h.store.contains(keys::ACCESS_TOKEN));
        assert!(!h.store.contains(keys::REFRESH_TOKEN));
        assert!(!h.store.contains(keys::USER));
        // Prefill survives logout
        assert_eq!(h.store.get(keys::REMEMBERED_EMAIL).unwrap().as_deref(), Some("admin"));
    }

    #[tokio::test]
    async fn test_logout_when_anonymous() {
        let h = harness().await;
        h.manager.logout().await;
        assert!(!h.manager.is_authenticated().await);
        assert_eq!(h.manager.state().await, AuthState::Anonymous);
    }

    #[tokio::test]
    async fn test_initialize_restores_persisted_session() {
        let h = harness().await;
        h.store.set(keys::ACCESS_TOKEN, "acc-9").unwrap();
        h.store.set(keys::REFRESH_TOKEN, "ref-9").unwrap();
        h.store.set(keys::USER, ADMIN_JSON).unwrap();
        h.store.set(keys::REMEMBERED_EMAIL, "admin").unwrap();
        h.store.set(keys::REMEMBER_ME, "true").unwrap();

        h.manager.initialize().await;

        let session = h.manager.snapshot().await;
        assert_eq!(session.access_token.as_deref(), Some("acc-9"));
        assert_eq!(session.refresh_token.as_deref(), Some("ref-9"));
        assert!(session.remember_me);
        assert_eq!(session.remembered_email.as_deref(), Some("admin"));
        assert!(h.manager.has_role("admin").await);
    }

    #[tokio::test]
    async fn test_initialize_ignores_corrupt_user_and_orphan_user() {
        let h = harness().await;
        h.store.set(keys::USER, "{not json").unwrap();
        h.store.set(keys::ACCESS_TOKEN, "acc").unwrap();
        h.manager.initialize().await;
        assert!(h.manager.is_authenticated().await);
        assert!(h.manager.user().await.is_none());

        let h = harness().await;
        h.store.set(keys::USER, ADMIN_JSON).unwrap();
        h.manager.initialize().await;
        assert!(!h.manager.is_authenticated().await);
        assert!(h.manager.user().await.is_none());
    }

    #[tokio::test]
    async fn test_401_triggers_one_refresh_and_one_replay() {
        let mut h = harness().await;
        h.store.set(keys::ACCESS_TOKEN, "stale").unwrap();
        h.store.set(keys::REFRESH_TOKEN, "ref-1").unwrap();
        h.store.set(keys::REMEMBER_ME, "true").unwrap();
        h.manager.initialize().await;

        let stale = h
            .server
            .mock("GET", "/api/fleet/status")
            .match_header("authorization", "Bearer stale")
            .with_status(401)
            .expect(1)
            .create_async()
            .await;
        let refresh = h
            .server
            .mock("POST", "/api/auth/refresh")
            .match_body(Matcher::Json(serde_json::json!({"refresh_token": "ref-1"})))
            .with_status(200)
            .with_body(token_json("acc-2", "ref-2"))
            .expect(1)
            .create_async()
            .await;
        let fresh = h
            .server
            .mock("GET", "/api/fleet/status")
            .match_header("authorization", "Bearer acc-2")
            .with_status(200)
            .with_body(r#"{"active":12}"#)
            .expect(1)
            .create_async()
            .await;

        let body: serde_json::Value = h.manager.get("/api/fleet/status").await.unwrap();

        assert_eq!(body["active"], 12);
        stale.assert_async().await;
        refresh.assert_async().await;
        fresh.assert_async().await;
        assert_eq!(h.manager.access_token().await.as_deref(), Some("acc-2"));
        assert_eq!(h.store.get(keys::ACCESS_TOKEN).unwrap().as_deref(), Some("acc-2"));
        assert_eq!(h.store.get(keys::REFRESH_TOKEN).unwrap().as_deref(), Some("ref-2"));
        assert_eq!(h.manager.state().await, AuthState::Authenticated);
    }

    #[tokio::test]
    async fn test_replay_is_not_retried_on_second_401() {
        let mut h = harness().await;
        h.store.set(keys::ACCESS_TOKEN, "stale").unwrap();
        h.store.set(keys::REFRESH_TOKEN, "ref-1").unwrap();
        h.manager.initialize().await;

        let endpoint = h
            .server
            .mock("GET", "/api/fleet/status")
            .with_status(401)
            .expect(2)
            .create_async()
            .await;
        let refresh = h
            .server
            .mock("POST", "/api/auth/refresh")
            .with_status(200)
            .with_body(token_json("acc-2", "ref-2"))
            .expect(1)
            .create_async()
            .await;

        let err = h
            .manager
            .get::<serde_json::Value>("/api/fleet/status")
            .await
            .expect_err("replay should fail");

        assert!(matches!(err, AuthError::Request(_)), "{:?}", err);
        endpoint.assert_async().await;
        refresh.assert_async().await;
        // Refresh worked, so the session itself survives
        assert!(h.manager.is_authenticated().await);
    }

    #[tokio::test]
    async fn test_refresh_failure_logs_out() {
        let mut h = harness().await;
        h.store.set(keys::ACCESS_TOKEN, "stale").unwrap();
        h.store.set(keys::REFRESH_TOKEN, "revoked").unwrap();
        h.manager.initialize().await;

        let _endpoint = h
            .server
            .mock("GET", "/api/fleet/status")
            .with_status(401)
            .expect(1)
            .create_async()
            .await;
        let _refresh = h
            .server
            .mock("POST", "/api/auth/refresh")
            .with_status(401)
            .create_async()
            .await;

        let err = h
            .manager
            .get::<serde_json::Value>("/api/fleet/status")
            .await
            .expect_err("refresh should fail");

        assert_eq!(err, AuthError::SessionExpired);
        assert!(!h.manager.is_authenticated().await);
        assert!(!h.store.contains(keys::ACCESS_TOKEN));
        assert!(!h.store.contains(keys::REFRESH_TOKEN));
        assert_eq!(h.notifier.errors(), vec![AuthError::SessionExpired.user_message()]);
    }

    #[tokio::test]
    async fn test_refresh_without_refresh_token_logs_out() {
        let mut h = harness().await;
        h.store.set(keys::ACCESS_TOKEN, "acc").unwrap();
        h.manager.initialize().await;
        let refresh = h
            .server
            .mock("POST", "/api/auth/refresh")
            .expect(0)
            .create_async()
            .await;

        assert_eq!(h.manager.refresh_access_token().await, None);
        assert!(!h.manager.is_authenticated().await);
        refresh.assert_async().await;
    }

    #[tokio::test]
    async fn test_refresh_without_remember_me_stays_in_memory() {
        let mut h = harness().await;
        let _login = mock_login_ok(&mut h.server).await;
        let _me = mock_me(&mut h.server, "acc-1").await;
        let _refresh = h
            .server
            .mock("POST", "/api/auth/refresh")
            .with_status(200)
            .with_body(token_json("acc-2", "ref-2"))
            .create_async()
            .await;
        h.manager.login(&admin(), LoginOptions::default()).await.unwrap();

        let token = h.manager.refresh_access_token().await;

        assert_eq!(token.as_deref(), Some("acc-2"));
        assert!(!h.store.contains(keys::ACCESS_TOKEN));
        assert!(!h.store.contains(keys::REFRESH_TOKEN));
    }

    #[tokio::test]
    async fn test_concurrent_401s_share_one_refresh() {
        let mut h = harness().await;
        h.store.set(keys::ACCESS_TOKEN, "stale").unwrap();
        h.store.set(keys::REFRESH_TOKEN, "ref-1").unwrap();
        h.manager.initialize().await;

        let _stale = h
            .server
            .mock("GET", Matcher::Regex(r"^/api/fleet/".to_string()))
            .match_header("authorization", "Bearer stale")
            .with_status(401)
            .create_async()
            .await;
        let refresh = h
            .server
            .mock("POST", "/api/auth/refresh")
            .with_status(200)
            .with_body(token_json("acc-2", "ref-2"))
            .expect(1)
            .create_async()
            .await;
        let fresh = h
            .server
            .mock("GET", Matcher::Regex(r"^/api/fleet/".to_string()))
            .match_header("authorization", "Bearer acc-2")
            .with_status(200)
            .with_body(r#"{"ok":true}"#)
            .expect(3)
            .create_async()
            .await;

        let (a, b, c) = tokio::join!(
            h.manager.get::<serde_json::Value>("/api/fleet/status"),
            h.manager.get::<serde_json::Value>("/api/fleet/vehicles"),
            h.manager.get::<serde_json::Value>("/api/fleet/alerts"),
        );

        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        refresh.assert_async().await;
        fresh.assert_async().await;
    }

    #[tokio::test]
    async fn test_get_current_user_requires_token() {
        let mut h = harness().await;
        let me = h
            .server
            .mock("GET", "/api/auth/me")
            .expect(0)
            .create_async()
            .await;

        assert!(h.manager.get_current_user().await.is_none());
        me.assert_async().await;
    }

    #[tokio::test]
    async fn test_get_current_user_replaces_user() {
        let mut h = harness().await;
        h.store.set(keys::ACCESS_TOKEN, "acc").unwrap();
        h.store.set(
            keys::USER,
            r#"{"id":"u-1","username":"admin","email":"old@example.com","full_name":"Old","is_active":true,"is_verified":false,"roles":[]}"#,
        ).unwrap();
        h.manager.initialize().await;
        assert!(!h.manager.has_role("admin").await);

        let _me = mock_me(&mut h.server, "acc").await;
        let user = h.manager.get_current_user().await.expect("profile should load");

        assert_eq!(user.email, "admin@example.com");
        assert!(h.manager.has_role("admin").await);
        // remember-me is off, so the profile is not written back
        assert_eq!(
            h.store.get(keys::USER).unwrap().as_deref().map(|s| s.contains("old@example.com")),
            Some(true)
        );
    }

    #[tokio::test]
    async fn test_get_current_user_failure_logs_out() {
        let mut h = harness().await;
        h.store.set(keys::ACCESS_TOKEN, "acc").unwrap();
        h.manager.initialize().await;
        let _me = h
            .server
            .mock("GET", "/api/auth/me")
            .with_status(403)
            .with_body(r#"{"detail":"Inactive user"}"#)
            .create_async()
            .await;

        assert!(h.manager.get_current_user().await.is_none());
        assert!(!h.manager.is_authenticated().await);
        assert_eq!(h.notifier.errors(), vec!["Could not load your profile"]);
    }

    #[tokio::test]
    async fn test_submit_login_validates_before_network() {
        let mut h = harness().await;
        let login = h
            .server
            .mock("POST", "/api/auth/login")
            .expect(0)
            .create_async()
            .await;

        let err = h
            .manager
            .submit_login(&LoginForm::new("someone", "secret"))
            .await
            .expect_err("form should be rejected");

        assert!(matches!(err, AuthError::Validation(ref m) if m.len() == 2));
        assert!(!h.manager.is_authenticated().await);
        login.assert_async().await;
    }

    #[tokio::test]
    async fn test_submit_login_mock_account() {
        let mut h = harness().await;
        let login = mock_login_ok(&mut h.server).await;
        let _me = mock_me(&mut h.server, "acc-1").await;

        h.manager
            .submit_login(&LoginForm::new("admin", "admin123").remember_me(true))
            .await
            .expect("login should succeed");

        login.assert_async().await;
        assert!(h.manager.is_authenticated().await);
        assert!(h.manager.snapshot().await.remember_me);
    }

    #[tokio::test]
    async fn test_change_password_surfaces_detail() {
        let mut h = harness().await;
        h.store.set(keys::ACCESS_TOKEN, "acc").unwrap();
        h.manager.initialize().await;
        let _change = h
            .server
            .mock("POST", "/api/auth/change-password")
            .match_header("authorization", "Bearer acc")
            .with_status(400)
            .with_body(r#"{"detail":"Incorrect current password"}"#)
            .create_async()
            .await;

        let err = h
            .manager
            .change_password(&PasswordChange {
                current_password: "wrong".into(),
                new_password: "N3w!password".into(),
            })
            .await
            .expect_err("change should fail");

        assert_eq!(err, AuthError::Request("Incorrect current password".to_string()));
        assert!(h.manager.is_authenticated().await);
    }

    #[tokio::test]
    async fn test_load_remembered_email_and_set_error() {
        let h = harness().await;
        h.store.set(keys::REMEMBERED_EMAIL, "driver@example.com").unwrap();

        assert_eq!(
            h.manager.load_remembered_email().await.as_deref(),
            Some("driver@example.com")
        );
        assert_eq!(
            h.manager.remembered_email().await.as_deref(),
            Some("driver@example.com")
        );

        h.manager.set_error(Some("boom".into())).await;
        assert_eq!(h.manager.last_error().await.as_deref(), Some("boom"));
        h.manager.set_error(None).await;
        assert!(h.manager.last_error().await.is_none());
    }

    #[tokio::test]
    async fn test_ensure_fresh_token_refreshes_near_expiry() {
        let mut h = harness().await;
        let _login = h
            .server
            .mock("POST", "/api/auth/login")
            .with_status(200)
            .with_body(
                r#"{"access_token":"short","refresh_token":"ref-1","token_type":"bearer","expires_in":60}"#,
            )
            .create_async()
            .await;
        let _me = mock_me(&mut h.server, "short").await;
        let refresh = h
            .server
            .mock("POST", "/api/auth/refresh")
            .with_status(200)
            .with_body(token_json("long", "ref-2"))
            .expect(1)
            .create_async()
            .await;
        h.manager.login(&admin(), LoginOptions::default()).await.unwrap();
        assert!(h.manager.needs_refresh().await);

        assert_eq!(h.manager.ensure_fresh_token().await.as_deref(), Some("long"));
        // 1800s token is outside the buffer, no second refresh
        assert_eq!(h.manager.ensure_fresh_token().await.as_deref(), Some("long"));
        refresh.assert_async().await;
    }

    #[tokio::test]
    async fn test_login_with_unbounded_expiry() {
        let mut h = harness().await;
        let _login = h
            .server
            .mock("POST", "/api/auth/login")
            .with_status(200)
            .with_body(
                r#"{"access_token":"acc-1","refresh_token":"ref-1","token_type":"bearer","expires_in":9223372036854775807}"#,
            )
            .create_async()
            .await;
        let _me = mock_me(&mut h.server, "acc-1").await;

        h.manager
            .login(&admin(), LoginOptions::default())
            .await
            .expect("login should succeed");

        let session = h.manager.snapshot().await;
        assert!(session.is_authenticated());
        assert!(session.expires_at.is_none());
        assert!(!h.manager.needs_refresh().await);
    }

    /// Storage that fails every write
    struct FailingStore;

    impl SecretStore for FailingStore {
        fn get(&self, _key: &str) -> anyhow::Result<Option<String>> {
            Ok(None)
        }

        fn set(&self, key: &str, _value: &str) -> anyhow::Result<()> {
            anyhow::bail!("keychain locked, cannot write {}", key)
        }

        fn remove(&self, key: &str) -> anyhow::Result<()> {
            anyhow::bail!("keychain locked, cannot remove {}", key)
        }
    }

    #[tokio::test]
    async fn test_storage_failures_never_reach_the_user() {
        let mut server = Server::new_async().await;
        let _login = mock_login_ok(&mut server).await;
        let _me = mock_me(&mut server, "acc-1").await;
        let api = ApiClient::new(&server.url(), Duration::from_secs(5)).unwrap();
        let notifier = Arc::new(RecordingNotifier::default());
        let manager = SessionManager::with_notifier(api, Arc::new(FailingStore), notifier.clone());

        let user = manager
            .login(&admin(), LoginOptions::remember())
            .await
            .expect("login should succeed despite storage errors");
        assert_eq!(user.username, "admin");
        assert!(manager.is_authenticated().await);
        assert_eq!(manager.state().await, AuthState::Authenticated);

        manager.logout().await;
        assert_eq!(manager.state().await, AuthState::Anonymous);
        assert!(!manager.is_authenticated().await);
        assert!(notifier.errors().is_empty(), "{:?}", notifier.errors());
    }

    fn register_form() -> RegisterForm {
        RegisterForm {
            postal_code: "01310-100".to_string(),
            line_address: "Av. Paulista, 1000".to_string(),
            country_code: Some("BR".to_string()),
            area_code: "11".to_string(),
            phone_number: "91234-5678".to_string(),
            email: "ana.souza@example.com".to_string(),
            password: "Str0ng!pass".to_string(),
            confirmed_password: "Str0ng!pass".to_string(),
            full_name: "Ana Paula Souza".to_string(),
            cpf: "123.456.789-09".to_string(),
            nickname: "ana".to_string(),
            birth_date: NaiveDate::from_ymd_opt(1990, 5, 17),
            accepted_terms: true,
            remember_me: true,
        }
    }

    #[tokio::test]
    async fn test_register_posts_normalized_body_then_logs_in() {
        let mut h = harness().await;
        let register = h
            .server
            .mock("POST", "/api/auth/register")
            .match_body(Matcher::Json(serde_json::json!({
                "credentials": {"email": "ana.souza@example.com", "password": "Str0ng!pass"},
                "profile": {
                    "fullName": "Ana Paula Souza",
                    "cpf": "12345678909",
                    "nickname": "ana",
                    "birthdate": "1990-05-17"
                },
                "phoneNumbers": [{"countryCode": "55", "number": "11912345678", "type": "MOBILE"}],
                "addresses": [{"countryCode": "BR", "postalCode": "01310100", "lineAddress": "Av. Paulista, 1000"}]
            })))
            .with_status(201)
            .expect(1)
            .create_async()
            .await;
        let login = h
            .server
            .mock("POST", "/api/auth/login")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("username".into(), "ana.souza@example.com".into()),
                Matcher::UrlEncoded("password".into(), "Str0ng!pass".into()),
            ]))
            .with_status(200)
            .with_body(token_json("acc-1", "ref-1"))
            .expect(1)
            .create_async()
            .await;
        let _me = mock_me(&mut h.server, "acc-1").await;

        h.manager
            .submit_register(&register_form())
            .await
            .expect("registration should succeed");

        register.assert_async().await;
        login.assert_async().await;
        assert!(h.manager.is_authenticated().await);
        // remember-me from the form carries into the login
        assert_eq!(h.store.get(keys::ACCESS_TOKEN).unwrap().as_deref(), Some("acc-1"));
        assert!(h.notifier.errors().is_empty());
    }

    #[tokio::test]
    async fn test_register_surfaces_nested_server_messages() {
        let mut h = harness().await;
        let _register = h
            .server
            .mock("POST", "/api/auth/register")
            .with_status(400)
            .with_body(
                r#"{"message":[{"field":"credentials","children":[{"field":"email","message":"email must be an email"},{"field":"password","message":"password too weak"}]}]}"#,
            )
            .create_async()
            .await;
        let login = h
            .server
            .mock("POST", "/api/auth/login")
            .expect(0)
            .create_async()
            .await;

        let err = h
            .manager
            .submit_register(&register_form())
            .await
            .expect_err("server should reject");

        assert_eq!(
            err,
            AuthError::Request("email must be an email; password too weak".to_string())
        );
        assert!(!h.manager.is_authenticated().await);
        assert!(!h.manager.snapshot().await.loading);
        assert_eq!(
            h.notifier.errors(),
            vec!["email must be an email; password too weak"]
        );
        login.assert_async().await;
    }

    #[tokio::test]
    async fn test_register_validates_before_network() {
        let mut h = harness().await;
        let register = h
            .server
            .mock("POST", "/api/auth/register")
            .expect(0)
            .create_async()
            .await;
        let mut form = register_form();
        form.accepted_terms = false;

        let err = h
            .manager
            .submit_register(&form)
            .await
            .expect_err("form should be rejected");

        assert_eq!(
            err,
            AuthError::Validation(vec!["You must accept the terms of use.".to_string()])
        );
        assert!(h.manager.last_error().await.is_some());
        register.assert_async().await;
    }

    #[tokio::test]
    async fn test_logout_during_refresh_discards_result_quietly() {
        let mut h = harness().await;
        h.store.set(keys::ACCESS_TOKEN, "acc-1").unwrap();
        h.store.set(keys::REFRESH_TOKEN, "ref-1").unwrap();
        h.manager.initialize().await;

        let body = token_json("acc-2", "ref-2");
        let _refresh = h
            .server
            .mock("POST", "/api/auth/refresh")
            .with_status(200)
            .with_chunked_body(move |w| {
                std::thread::sleep(Duration::from_millis(300));
                w.write_all(body.as_bytes())
            })
            .create_async()
            .await;

        let (token, ()) = tokio::join!(h.manager.refresh_access_token(), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            h.manager.logout().await;
        });

        assert_eq!(token, None);
        assert!(!h.manager.is_authenticated().await);
        assert_eq!(h.manager.state().await, AuthState::Anonymous);
        assert!(!h.store.contains(keys::ACCESS_TOKEN));
        assert!(h.notifier.errors().is_empty(), "{:?}", h.notifier.errors());
    }

    #[tokio::test]
    async fn test_refresh_result_after_logout_is_superseded() {
        let h = harness().await;
        h.store.set(keys::ACCESS_TOKEN, "acc-1").unwrap();
        h.store.set(keys::REFRESH_TOKEN, "ref-1").unwrap();
        h.manager.initialize().await;
        h.manager.logout().await;

        let tokens: TokenResponse = serde_json::from_str(&token_json("acc-2", "ref-2")).unwrap();
        let outcome = h.manager.settle_refresh("ref-1", Some(tokens)).await;

        assert!(matches!(outcome, RefreshOutcome::Superseded(None)));
        assert!(!h.manager.is_authenticated().await);
        assert!(h.notifier.errors().is_empty());
    }

    #[tokio::test]
    async fn test_failed_refresh_is_not_repeated_by_waiters() {
        let mut h = harness().await;
        h.store.set(keys::ACCESS_TOKEN, "stale").unwrap();
        h.store.set(keys::REFRESH_TOKEN, "revoked").unwrap();
        h.manager.initialize().await;

        let _endpoint = h
            .server
            .mock("GET", Matcher::Regex(r"^/api/fleet/".to_string()))
            .with_status(401)
            .create_async()
            .await;
        let refresh = h
            .server
            .mock("POST", "/api/auth/refresh")
            .with_status(401)
            .expect(1)
            .create_async()
            .await;

        let (a, b, c) = tokio::join!(
            h.manager.get::<serde_json::Value>("/api/fleet/status"),
            h.manager.get::<serde_json::Value>("/api/fleet/vehicles"),
            h.manager.get::<serde_json::Value>("/api/fleet/alerts"),
        );

        for result in [a, b, c] {
            assert_eq!(result.unwrap_err(), AuthError::SessionExpired);
        }
        refresh.assert_async().await;
        assert!(!h.manager.is_authenticated().await);
        assert_eq!(h.notifier.errors(), vec![AuthError::SessionExpired.user_message()]);
    }
}
