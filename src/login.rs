use crate::app::{AppState, render_page};
use crate::error::AuthError;
use crate::shell::SessionShell;
use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use async_trait::async_trait;
use axum::{
    Form, Json,
    extract::{Query, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
};
use axum_extra::extract::cookie::{Cookie, CookieJar};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, create_dir_all};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, SystemTime};
use tokio::task::AbortHandle;
use uuid::Uuid;

/// Name of the cookie carrying the session id
pub const SESSION_COOKIE: &str = "session";

/// Tokens are refreshed this long before they expire
const REFRESH_MARGIN: Duration = Duration::from_secs(60);

const MIN_PASSWORD_LEN: usize = 6;

lazy_static! {
    static ref EMAIL: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
}

/// Signed-in user as reported by the identity provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub uid: String,
    pub email: String,
    pub display_name: Option<String>,
    pub email_verified: bool,
}

/// Tokens issued for a signed-in user
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub user: User,
    pub id_token: String,
    pub refresh_token: String,
    pub expires_at: SystemTime,
}

/// Boundary to the identity service
///
/// `lookup` is the state callback: it returns the current user for a valid
/// id token and an error once the session is gone.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn sign_in(&self, email: &str, password: &str) -> Result<AuthSession, AuthError>;

    async fn sign_up(&self, email: &str, password: &str) -> Result<AuthSession, AuthError>;

    async fn lookup(&self, id_token: &str) -> Result<User, AuthError>;

    async fn refresh(&self, refresh_token: &str) -> Result<AuthSession, AuthError>;

    async fn sign_out(&self, _session: &AuthSession) -> Result<(), AuthError> {
        Ok(())
    }
}

/// Stored record of a local user
///
/// Local accounts live in a JSON file keyed by email address.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StoredUser {
    /// Stable user id
    pub uid: String,

    pub email: String,

    #[serde(default)]
    pub display_name: Option<String>,

    /// Argon2 hash of the user's password
    pub password_hash: String,

    #[serde(default)]
    pub disabled: bool,

    #[serde(default)]
    pub email_verified: bool,
}

impl StoredUser {
    fn to_user(&self) -> User {
        User {
            uid: self.uid.clone(),
            email: self.email.clone(),
            display_name: self.display_name.clone(),
            email_verified: self.email_verified,
        }
    }
}

/// Create the users file (and its directory) if it does not exist yet
///
/// # Arguments
/// * `users_file` - Path of the JSON users file
///
/// # Returns
/// * `std::io::Result<()>` - Success or an IO error
pub fn init_database(users_file: &Path) -> std::io::Result<()> {
    if let Some(dir) = users_file.parent() {
        if !dir.as_os_str().is_empty() && !dir.exists() {
            create_dir_all(dir)?;
        }
    }

    if !users_file.exists() {
        let mut file = File::create(users_file)?;
        file.write_all(b"{}")?;
    }

    Ok(())
}

/// Read all local users, keyed by lowercase email
///
/// # Errors
/// * Returns `AuthError::Store` if the file cannot be opened, read or parsed
pub fn get_users(users_file: &Path) -> Result<HashMap<String, StoredUser>, AuthError> {
    let mut file =
        File::open(users_file).map_err(|_| AuthError::Store("Failed to open users file".to_string()))?;

    let mut contents = String::new();
    file.read_to_string(&mut contents)
        .map_err(|_| AuthError::Store("Failed to read users file".to_string()))?;

    serde_json::from_str(&contents).map_err(|_| AuthError::Store("Failed to parse users data".to_string()))
}

/// Write the users map back to disk
pub fn save_users(users_file: &Path, users: &HashMap<String, StoredUser>) -> Result<(), AuthError> {
    let json = serde_json::to_string_pretty(users)
        .map_err(|_| AuthError::Store("Failed to serialize users data".to_string()))?;

    let mut file = File::create(users_file)
        .map_err(|_| AuthError::Store("Failed to create users file".to_string()))?;

    file.write_all(json.as_bytes())
        .map_err(|_| AuthError::Store("Failed to write users data".to_string()))
}

/// Hash a password using Argon2
///
/// # Errors
/// * Returns an error if the password hashing fails
fn hash_password(password: &str) -> Result<String, AuthError> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();

    argon2
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|_| AuthError::Store("Password hashing failed".to_string()))
}

/// Verify a password against a stored Argon2 hash
///
/// # Returns
/// * `Result<bool, AuthError>` - True if the password matches, false if not
fn verify_password(password: &str, hash: &str) -> Result<bool, AuthError> {
    let parsed_hash = PasswordHash::new(hash)
        .map_err(|_| AuthError::Store("Invalid password hash format".to_string()))?;

    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}

struct IssuedToken {
    uid: String,
    expires_at: SystemTime,
}

struct IssuedRefresh {
    uid: String,
    id_token: String,
}

/// Identity provider backed by a local users file
///
/// Passwords are hashed with Argon2. Tokens are random ids held in memory,
/// so every token is invalidated when the process restarts.
pub struct LocalIdentity {
    users_file: PathBuf,
    token_ttl: Duration,
    id_tokens: RwLock<HashMap<String, IssuedToken>>,
    refresh_tokens: RwLock<HashMap<String, IssuedRefresh>>,
    write_lock: Mutex<()>,
}

impl LocalIdentity {
    pub fn new(users_file: impl Into<PathBuf>, token_ttl: Duration) -> Result<Self, AuthError> {
        let users_file = users_file.into();
        init_database(&users_file).map_err(|e| AuthError::Store(e.to_string()))?;
        Ok(LocalIdentity {
            users_file,
            token_ttl,
            id_tokens: RwLock::new(HashMap::new()),
            refresh_tokens: RwLock::new(HashMap::new()),
            write_lock: Mutex::new(()),
        })
    }

    /// Disable or re-enable an account; disabled users cannot sign in and
    /// their outstanding tokens stop validating.
    pub fn set_disabled(&self, email: &str, disabled: bool) -> Result<(), AuthError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut users = get_users(&self.users_file)?;
        let user = users
            .get_mut(&email.to_lowercase())
            .ok_or_else(|| AuthError::rejected("EMAIL_NOT_FOUND"))?;
        user.disabled = disabled;
        save_users(&self.users_file, &users)
    }

    fn issue(&self, user: &StoredUser) -> AuthSession {
        let id_token = Uuid::new_v4().to_string();
        let refresh_token = Uuid::new_v4().to_string();
        let now = SystemTime::now();
        let expires_at = now + self.token_ttl;

        {
            let mut id_tokens = self.id_tokens.write().unwrap_or_else(PoisonError::into_inner);
            id_tokens.retain(|_, token| token.expires_at > now);
            id_tokens.insert(
                id_token.clone(),
                IssuedToken {
                    uid: user.uid.clone(),
                    expires_at,
                },
            );
        }
        self.refresh_tokens
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                refresh_token.clone(),
                IssuedRefresh {
                    uid: user.uid.clone(),
                    id_token: id_token.clone(),
                },
            );

        AuthSession {
            user: user.to_user(),
            id_token,
            refresh_token,
            expires_at,
        }
    }

    fn find_by_uid(&self, uid: &str) -> Result<StoredUser, AuthError> {
        get_users(&self.users_file)?
            .into_values()
            .find(|u| u.uid == uid)
            .ok_or_else(|| AuthError::rejected("USER_NOT_FOUND"))
    }
}

fn validate_credentials(email: &str, password: &str) -> Result<(), AuthError> {
    if !EMAIL.is_match(email) {
        return Err(AuthError::rejected("INVALID_EMAIL"));
    }
    if password.is_empty() {
        return Err(AuthError::rejected("MISSING_PASSWORD"));
    }
    Ok(())
}

#[async_trait]
impl IdentityProvider for LocalIdentity {
    async fn sign_in(&self, email: &str, password: &str) -> Result<AuthSession, AuthError> {
        validate_credentials(email, password)?;

        let users = get_users(&self.users_file)?;
        let user = users
            .get(&email.to_lowercase())
            .ok_or_else(|| AuthError::rejected("EMAIL_NOT_FOUND"))?;
        if user.disabled {
            return Err(AuthError::rejected("USER_DISABLED"));
        }
        if !verify_password(password, &user.password_hash)? {
            return Err(AuthError::rejected("INVALID_PASSWORD"));
        }

        Ok(self.issue(user))
    }

    async fn sign_up(&self, email: &str, password: &str) -> Result<AuthSession, AuthError> {
        validate_credentials(email, password)?;
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(AuthError::rejected("WEAK_PASSWORD"));
        }

        let key = email.to_lowercase();
        let user = {
            let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
            let mut users = get_users(&self.users_file)?;
            if users.contains_key(&key) {
                return Err(AuthError::rejected("EMAIL_EXISTS"));
            }

            let user = StoredUser {
                uid: Uuid::new_v4().simple().to_string(),
                email: email.to_string(),
                display_name: None,
                password_hash: hash_password(password)?,
                disabled: false,
                email_verified: false,
            };
            users.insert(key, user.clone());
            save_users(&self.users_file, &users)?;
            user
        };

        log::info!("registered local user {}", user.email);
        Ok(self.issue(&user))
    }

    async fn lookup(&self, id_token: &str) -> Result<User, AuthError> {
        let uid = {
            let tokens = self.id_tokens.read().unwrap_or_else(PoisonError::into_inner);
            match tokens.get(id_token) {
                Some(token) if token.expires_at > SystemTime::now() => token.uid.clone(),
                _ => return Err(AuthError::rejected("INVALID_ID_TOKEN")),
            }
        };

        let user = self.find_by_uid(&uid)?;
        if user.disabled {
            return Err(AuthError::rejected("USER_DISABLED"));
        }
        Ok(user.to_user())
    }

    async fn refresh(&self, refresh_token: &str) -> Result<AuthSession, AuthError> {
        let issued = self
            .refresh_tokens
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(refresh_token)
            .ok_or_else(|| AuthError::rejected("INVALID_REFRESH_TOKEN"))?;
        self.id_tokens
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&issued.id_token);

        let user = self.find_by_uid(&issued.uid)?;
        if user.disabled {
            return Err(AuthError::rejected("USER_DISABLED"));
        }
        Ok(self.issue(&user))
    }

    async fn sign_out(&self, session: &AuthSession) -> Result<(), AuthError> {
        self.id_tokens
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&session.id_token);
        self.refresh_tokens
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&session.refresh_token);
        Ok(())
    }
}

/// One browser session: identity tokens plus the comparison page state
pub struct SessionHandle {
    pub id: String,
    pub expires_at: SystemTime,
    shell: Mutex<SessionShell>,
    auth: Mutex<AuthSession>,
    monitor: Mutex<Option<AbortHandle>>,
}

impl SessionHandle {
    fn new(auth: AuthSession, ttl: Duration) -> Self {
        SessionHandle {
            id: Uuid::new_v4().to_string(),
            expires_at: SystemTime::now() + ttl,
            shell: Mutex::new(SessionShell::new()),
            auth: Mutex::new(auth),
            monitor: Mutex::new(None),
        }
    }

    /// Lock the session's shell. Never hold the guard across an `.await`.
    pub fn shell(&self) -> MutexGuard<'_, SessionShell> {
        self.shell.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn auth(&self) -> AuthSession {
        self.auth.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set_auth(&self, auth: AuthSession) {
        *self.auth.lock().unwrap_or_else(PoisonError::into_inner) = auth;
    }

    pub fn is_authenticated(&self) -> bool {
        self.shell().user().is_some()
    }

    fn is_expired(&self) -> bool {
        self.expires_at <= SystemTime::now()
    }

    /// Stop the monitor and sign the shell out, cancelling any comparison
    pub fn close(&self) {
        if let Some(monitor) = self.monitor.lock().unwrap_or_else(PoisonError::into_inner).take() {
            monitor.abort();
        }
        self.shell().identity_changed(None);
    }
}

/// Live sessions keyed by session cookie. Clones share the same map.
#[derive(Clone)]
pub struct SessionStore {
    sessions: Arc<RwLock<HashMap<String, Arc<SessionHandle>>>>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        SessionStore {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    /// Create and store a new session for freshly issued tokens
    ///
    /// Expired sessions are swept out first.
    pub fn create_session(&self, auth: AuthSession) -> Arc<SessionHandle> {
        let session = Arc::new(SessionHandle::new(auth, self.ttl));
        let expired: Vec<Arc<SessionHandle>> = {
            let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
            let ids: Vec<String> = sessions
                .values()
                .filter(|s| s.is_expired())
                .map(|s| s.id.clone())
                .collect();
            sessions.insert(session.id.clone(), session.clone());
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };
        for stale in expired {
            log::debug!("dropping expired session {}", stale.id);
            stale.close();
        }
        session
    }

    /// Look a session up; expired sessions are closed and dropped
    pub fn validate_session(&self, session_id: &str) -> Option<Arc<SessionHandle>> {
        let session = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()?;

        if session.is_expired() {
            self.remove(session_id);
            return None;
        }
        Some(session)
    }

    pub fn remove(&self, session_id: &str) -> Option<Arc<SessionHandle>> {
        let session = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id)?;
        session.close();
        Some(session)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn until(deadline: SystemTime) -> Duration {
    deadline.duration_since(SystemTime::now()).unwrap_or_default()
}

/// Deliver identity callbacks to a session's shell
///
/// Each lookup confirms the user (and moves a fresh shell out of `Loading`).
/// Tokens are refreshed shortly before they expire; any failure signs the
/// shell out, drops the session and ends the task. Once the session itself
/// expires its tokens are revoked and it is removed from the store.
pub fn spawn_session_monitor(
    identity: Arc<dyn IdentityProvider>,
    store: SessionStore,
    session: Arc<SessionHandle>,
) {
    let task_session = session.clone();
    let task = tokio::spawn(async move {
        let session = task_session;
        loop {
            let auth = session.auth();
            match identity.lookup(&auth.id_token).await {
                Ok(user) => session.shell().identity_changed(Some(user)),
                Err(e) => {
                    log::info!("session {} lost its identity: {}", session.id, e);
                    store.remove(&session.id);
                    return;
                }
            }

            let refresh_at = auth
                .expires_at
                .checked_sub(REFRESH_MARGIN)
                .unwrap_or(auth.expires_at);
            if session.expires_at <= refresh_at {
                tokio::time::sleep(until(session.expires_at)).await;
                break;
            }
            tokio::time::sleep(until(refresh_at)).await;
            if session.is_expired() {
                break;
            }

            match identity.refresh(&auth.refresh_token).await {
                Ok(fresh) => session.set_auth(fresh),
                Err(e) => {
                    log::info!("token refresh failed for session {}: {}", session.id, e);
                    store.remove(&session.id);
                    return;
                }
            }
        }

        log::info!("session {} expired", session.id);
        if let Err(e) = identity.sign_out(&session.auth()).await {
            log::warn!("revoking tokens of session {} failed: {}", session.id, e);
        }
        store.remove(&session.id);
    });

    *session.monitor.lock().unwrap_or_else(PoisonError::into_inner) = Some(task.abort_handle());
}

/// Only local absolute paths are accepted as post-login targets
pub fn safe_return_to(target: Option<&str>) -> &str {
    match target {
        Some(t) if t.starts_with('/') && !t.starts_with("//") && !t.contains('\\') => t,
        _ => "/",
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct LoginQuery {
    pub return_to: Option<String>,
    pub registered: Option<String>,
}

/// Login form data
#[derive(Debug, Deserialize)]
pub struct LoginForm {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub return_to: Option<String>,
}

/// Signup form data; `confirm_password` must match `password`
#[derive(Debug, Deserialize)]
pub struct SignupForm {
    pub email: String,
    pub password: String,
    pub confirm_password: String,
}

fn session_cookie(id: String) -> Cookie<'static> {
    Cookie::build((SESSION_COOKIE, id))
        .path("/")
        .http_only(true)
        .build()
}

/// Drop the session named by the cookie and revoke its tokens
async fn end_session(state: &AppState, jar: &CookieJar) -> Option<AuthSession> {
    let session = state.sessions.remove(jar.get(SESSION_COOKIE)?.value())?;
    let auth = session.auth();
    if let Err(e) = state.identity.sign_out(&auth).await {
        log::warn!("sign-out at identity provider failed: {}", e);
    }
    Some(auth)
}

/// Replace any session the browser already holds with a signed-in one
async fn start_session(state: &AppState, jar: CookieJar, auth: AuthSession) -> CookieJar {
    end_session(state, &jar).await;

    let session = state.sessions.create_session(auth.clone());
    session.shell().identity_changed(Some(auth.user));
    spawn_session_monitor(state.identity.clone(), state.sessions.clone(), session.clone());
    jar.add(session_cookie(session.id.clone()))
}

/// Serve the login page
pub async fn serve_login_page(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LoginQuery>,
) -> Response {
    let notice = query
        .registered
        .is_some()
        .then_some("Account created. Please sign in.");
    render_login(&state, StatusCode::OK, query.return_to.as_deref(), None, notice)
}

fn render_login(
    state: &AppState,
    status: StatusCode,
    return_to: Option<&str>,
    error: Option<&str>,
    notice: Option<&str>,
) -> Response {
    let data = serde_json::json!({
        "return_to": safe_return_to(return_to),
        "error": error,
        "notice": notice,
    });
    (status, render_page(state, "login", &data)).into_response()
}

/// Handle login form submissions
///
/// On success a session is created, its cookie set, and the browser sent to
/// `return_to`. Provider error codes are mapped to user-facing messages.
pub async fn handle_login(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Form(form): Form<LoginForm>,
) -> Response {
    match state.identity.sign_in(form.email.trim(), &form.password).await {
        Ok(auth) => {
            log::info!("{} signed in", auth.user.email);
            let jar = start_session(&state, jar, auth).await;
            let target = safe_return_to(form.return_to.as_deref()).to_string();
            (jar, Redirect::to(&target)).into_response()
        }
        Err(e) => {
            log::warn!("sign-in failed for {}: {}", form.email, e);
            render_login(
                &state,
                StatusCode::UNAUTHORIZED,
                form.return_to.as_deref(),
                Some(e.user_message()),
                None,
            )
        }
    }
}

pub async fn serve_signup_page(State(state): State<Arc<AppState>>) -> Response {
    render_signup(&state, StatusCode::OK, None)
}

fn render_signup(state: &AppState, status: StatusCode, error: Option<&str>) -> Response {
    let data = serde_json::json!({ "error": error });
    (status, render_page(state, "signup", &data)).into_response()
}

/// Handle signup form submissions; a new account is signed in right away
pub async fn handle_signup(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Form(form): Form<SignupForm>,
) -> Response {
    if form.password != form.confirm_password {
        return render_signup(&state, StatusCode::BAD_REQUEST, Some("Passwords do not match"));
    }

    match state.identity.sign_up(form.email.trim(), &form.password).await {
        Ok(auth) => {
            let jar = start_session(&state, jar, auth).await;
            (jar, Redirect::to("/")).into_response()
        }
        Err(e) => {
            log::warn!("sign-up failed for {}: {}", form.email, e);
            render_signup(&state, StatusCode::BAD_REQUEST, Some(e.user_message()))
        }
    }
}

/// Sign out: drop the session (cancelling its comparison), revoke tokens
/// and clear the cookie.
pub async fn handle_logout(State(state): State<Arc<AppState>>, jar: CookieJar) -> (CookieJar, Redirect) {
    if let Some(auth) = end_session(&state, &jar).await {
        log::info!("{} signed out", auth.user.email);
    }

    (jar.remove(Cookie::build(SESSION_COOKIE).path("/")), Redirect::to("/login"))
}

/// Authentication middleware
///
/// Lets the request through when its session is signed in and stores the
/// session handle in the request extensions. Otherwise API calls get 401
/// and pages redirect to the login page.
pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    mut request: Request,
    next: Next,
) -> Response {
    if let Some(cookie) = jar.get(SESSION_COOKIE) {
        if let Some(session) = state.sessions.validate_session(cookie.value()) {
            if session.is_authenticated() {
                request.extensions_mut().insert(session);
                return next.run(request).await;
            }
        }
    }

    let path = request.uri().path();
    if path.starts_with("/api/") {
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "Not signed in" })),
        )
            .into_response();
    }

    if request.method() != axum::http::Method::GET {
        return Redirect::to("/login").into_response();
    }
    let target = format!("/login?return_to={}", urlencoding::encode(path));
    Redirect::to(&target).into_response()
}
