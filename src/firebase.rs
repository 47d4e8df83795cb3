//! Firebase Authentication through its REST endpoints.

use crate::config::IdentitySettings;
use crate::error::AuthError;
use crate::login::{AuthSession, IdentityProvider, User};
use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::time::{Duration, SystemTime};

#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    local_id: String,
    email: String,
    #[serde(default)]
    display_name: Option<String>,
    id_token: String,
    refresh_token: String,
    expires_in: String,
}

#[derive(Deserialize)]
struct LookupResponse {
    #[serde(default)]
    users: Vec<AccountInfo>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountInfo {
    local_id: String,
    #[serde(default)]
    email: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    email_verified: bool,
    #[serde(default)]
    disabled: bool,
}

#[derive(Deserialize)]
struct RefreshResponse {
    id_token: String,
    refresh_token: String,
    expires_in: String,
}

/// Error code of a Firebase error message, e.g. `WEAK_PASSWORD` for
/// `"WEAK_PASSWORD : Password should be at least 6 characters"`.
pub fn error_code(message: &str) -> &str {
    message.split(" : ").next().unwrap_or(message).trim()
}

fn expiry(expires_in: &str) -> SystemTime {
    let secs = expires_in.trim().parse().unwrap_or(3600);
    SystemTime::now() + Duration::from_secs(secs)
}

pub struct FirebaseIdentity {
    client: reqwest::Client,
    api_key: String,
    identity_base: String,
    token_base: String,
}

impl FirebaseIdentity {
    pub fn new(api_key: impl Into<String>, settings: &IdentitySettings) -> Result<Self, AuthError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| AuthError::Transport(e.to_string()))?;
        Ok(FirebaseIdentity {
            client,
            api_key: api_key.into(),
            identity_base: settings.identity_base.trim_end_matches('/').to_string(),
            token_base: settings.token_base.trim_end_matches('/').to_string(),
        })
    }

    fn accounts_url(&self, action: &str) -> String {
        format!("{}/v1/accounts:{}?key={}", self.identity_base, action, self.api_key)
    }

    async fn post<T: DeserializeOwned>(&self, url: &str, body: &Value) -> Result<T, AuthError> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(match serde_json::from_str::<ErrorBody>(&text) {
                Ok(body) => AuthError::rejected(error_code(&body.error.message)),
                Err(_) => AuthError::Transport(format!("identity service answered {status}")),
            });
        }

        serde_json::from_str(&text).map_err(|e| AuthError::Transport(e.to_string()))
    }

    async fn password_call(&self, action: &str, email: &str, password: &str) -> Result<AuthSession, AuthError> {
        let body = json!({ "email": email, "password": password, "returnSecureToken": true });
        let token: TokenResponse = self.post(&self.accounts_url(action), &body).await?;
        Ok(AuthSession {
            user: User {
                uid: token.local_id,
                email: token.email,
                display_name: token.display_name.filter(|n| !n.is_empty()),
                email_verified: false,
            },
            expires_at: expiry(&token.expires_in),
            id_token: token.id_token,
            refresh_token: token.refresh_token,
        })
    }
}

#[async_trait]
impl IdentityProvider for FirebaseIdentity {
    async fn sign_in(&self, email: &str, password: &str) -> Result<AuthSession, AuthError> {
        self.password_call("signInWithPassword", email, password).await
    }

    async fn sign_up(&self, email: &str, password: &str) -> Result<AuthSession, AuthError> {
        self.password_call("signUp", email, password).await
    }

    async fn lookup(&self, id_token: &str) -> Result<User, AuthError> {
        let body = json!({ "idToken": id_token });
        let response: LookupResponse = self.post(&self.accounts_url("lookup"), &body).await?;
        let account = response
            .users
            .into_iter()
            .next()
            .ok_or_else(|| AuthError::rejected("USER_NOT_FOUND"))?;
        if account.disabled {
            return Err(AuthError::rejected("USER_DISABLED"));
        }
        Ok(User {
            uid: account.local_id,
            email: account.email,
            display_name: account.display_name.filter(|n| !n.is_empty()),
            email_verified: account.email_verified,
        })
    }

    async fn refresh(&self, refresh_token: &str) -> Result<AuthSession, AuthError> {
        let url = format!("{}/v1/token?key={}", self.token_base, self.api_key);
        let body = json!({ "grant_type": "refresh_token", "refresh_token": refresh_token });
        let fresh: RefreshResponse = self.post(&url, &body).await?;
        let user = self.lookup(&fresh.id_token).await?;
        Ok(AuthSession {
            user,
            expires_at: expiry(&fresh.expires_in),
            id_token: fresh.id_token,
            refresh_token: fresh.refresh_token,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        Json, Router,
        extract::{Path, Query},
        http::StatusCode,
        routing::post,
    };
    use std::collections::HashMap;

    fn rejected(message: &str) -> (StatusCode, Json<Value>) {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": { "code": 400, "message": message } })),
        )
    }

    async fn accounts(
        Path(action): Path<String>,
        Query(query): Query<HashMap<String, String>>,
        Json(body): Json<Value>,
    ) -> (StatusCode, Json<Value>) {
        if query.get("key").map(String::as_str) != Some("test-key") {
            return rejected("API key not valid. Please pass a valid API key.");
        }
        match action.as_str() {
            "accounts:signInWithPassword" if body["password"] == "secret1" => (
                StatusCode::OK,
                Json(json!({
                    "localId": "uid-1",
                    "email": body["email"],
                    "displayName": "",
                    "idToken": "id-1",
                    "refreshToken": "refresh-1",
                    "expiresIn": "3600",
                    "registered": true
                })),
            ),
            "accounts:signInWithPassword" => rejected("INVALID_LOGIN_CREDENTIALS"),
            "accounts:signUp" => rejected("WEAK_PASSWORD : Password should be at least 6 characters"),
            "accounts:lookup" if body["idToken"] == "id-2" => (
                StatusCode::OK,
                Json(json!({
                    "users": [{
                        "localId": "uid-1",
                        "email": "ana@example.com",
                        "displayName": "Ana",
                        "emailVerified": true
                    }]
                })),
            ),
            "accounts:lookup" => rejected("INVALID_ID_TOKEN"),
            "token" if body["refresh_token"] == "refresh-1" => (
                StatusCode::OK,
                Json(json!({
                    "id_token": "id-2",
                    "refresh_token": "refresh-2",
                    "expires_in": "3600",
                    "user_id": "uid-1"
                })),
            ),
            _ => rejected("TOKEN_EXPIRED"),
        }
    }

    async fn provider() -> FirebaseIdentity {
        let app = Router::new().route("/v1/*action", post(accounts));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let settings = IdentitySettings {
            identity_base: format!("http://{addr}"),
            token_base: format!("http://{addr}/"),
            ..IdentitySettings::default()
        };
        FirebaseIdentity::new("test-key", &settings).unwrap()
    }

    #[test]
    fn error_codes_drop_the_description() {
        assert_eq!(error_code("EMAIL_NOT_FOUND"), "EMAIL_NOT_FOUND");
        assert_eq!(
            error_code("WEAK_PASSWORD : Password should be at least 6 characters"),
            "WEAK_PASSWORD"
        );
    }

    #[tokio::test]
    async fn sign_in_returns_tokens() {
        let firebase = provider().await;
        let auth = firebase.sign_in("ana@example.com", "secret1").await.unwrap();
        assert_eq!(auth.user.uid, "uid-1");
        assert_eq!(auth.user.display_name, None);
        assert_eq!(auth.id_token, "id-1");
        assert!(auth.expires_at > SystemTime::now());
    }

    #[tokio::test]
    async fn rejections_map_to_codes() {
        let firebase = provider().await;
        let err = firebase.sign_in("ana@example.com", "nope").await.unwrap_err();
        assert_eq!(err.code(), "INVALID_LOGIN_CREDENTIALS");
        assert_eq!(err.user_message(), "Invalid email or password");

        let err = firebase.sign_up("ana@example.com", "123").await.unwrap_err();
        assert_eq!(err.code(), "WEAK_PASSWORD");
    }

    #[tokio::test]
    async fn refresh_then_lookup_profile() {
        let firebase = provider().await;
        let auth = firebase.refresh("refresh-1").await.unwrap();
        assert_eq!(auth.refresh_token, "refresh-2");
        assert_eq!(auth.user.display_name.as_deref(), Some("Ana"));
        assert!(auth.user.email_verified);

        assert_eq!(
            firebase.lookup("id-1").await.unwrap_err().code(),
            "INVALID_ID_TOKEN"
        );
        assert!(firebase.refresh("stale").await.is_err());
    }

    #[tokio::test]
    async fn unreachable_service_is_a_transport_error() {
        let settings = IdentitySettings {
            identity_base: "http://127.0.0.1:9".to_string(),
            timeout_secs: 2,
            ..IdentitySettings::default()
        };
        let firebase = FirebaseIdentity::new("k", &settings).unwrap();
        let err = firebase.sign_in("a@b.co", "secret1").await.unwrap_err();
        assert!(matches!(err, AuthError::Transport(_)));
    }
}
