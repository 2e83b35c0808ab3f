//! Bearer-token session management.
//!
//! # Design
//! Every backend call goes through `SessionManager::fetch`, which renews the
//! token when it is within the configured threshold of expiry, attaches the
//! `Authorization` header, and clears the session when the backend answers
//! 401 or 403. Renewal is single-flight: concurrent callers that all see an
//! expiring token wait on one mutex, and only the first one renews.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{join_path, ProviderConfig};
use crate::error::{ApiError, Result};
use crate::http::{HttpMethod, HttpRequest, HttpResponse};
use crate::store::{SessionStore, TOKEN_KEY, USER_KEY};
use crate::transport::Transport;
use crate::types::{Identity, Permissions, UserProfile};

const RENEW_TOKEN_PATH: &str = ":renew-token";

#[derive(Deserialize)]
struct LoginResponse {
    #[serde(alias = "token")]
    jwt: String,
    #[serde(flatten)]
    profile: UserProfile,
}

pub struct SessionManager {
    transport: Arc<dyn Transport>,
    store: Arc<dyn SessionStore>,
    threshold: Duration,
    login_url: RwLock<String>,
    renewal: Mutex<()>,
}

impl SessionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn SessionStore>,
        config: &ProviderConfig,
    ) -> Self {
        Self {
            transport,
            store,
            threshold: config.renewal_threshold(),
            login_url: RwLock::new(config.login_url()),
            renewal: Mutex::new(()),
        }
    }

    pub fn login_url(&self) -> String {
        match self.login_url.read() {
            Ok(url) => url.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn set_login_url(&self, url: String) {
        debug!(%url, "login url updated");
        match self.login_url.write() {
            Ok(mut current) => *current = url,
            Err(poisoned) => *poisoned.into_inner() = url,
        }
    }

    pub fn token(&self) -> Result<Option<String>> {
        self.store.get(TOKEN_KEY)
    }

    pub fn user(&self) -> Result<Option<UserProfile>> {
        match self.store.get(USER_KEY)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Drops the token and the cached profile together.
    pub fn clear(&self) -> Result<()> {
        self.store.remove(TOKEN_KEY)?;
        self.store.remove(USER_KEY)
    }

    /// Sends an authenticated request, renewing the token first if needed.
    pub async fn fetch(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.renew_if_needed().await?;
        let response = self.send_authorized(request).await?;
        if matches!(response.status, 401 | 403) {
            warn!(status = response.status, "backend rejected credentials, clearing session");
            self.clear()?;
            return Err(ApiError::AuthenticationExpired);
        }
        Ok(response)
    }

    /// Renews the token unconditionally.
    pub async fn renew(&self) -> Result<()> {
        let url = join_path(&self.login_url(), RENEW_TOKEN_PATH);
        let response = self
            .send_authorized(HttpRequest::new(HttpMethod::Post, url))
            .await?;

        if matches!(response.status, 401 | 403) {
            warn!(status = response.status, "token renewal rejected, clearing session");
            self.clear()?;
            return Err(ApiError::RenewalFailed {
                status: response.status,
                body: response.body,
            });
        }
        if !response.is_success() {
            warn!(status = response.status, "token renewal failed");
            return Err(ApiError::HttpError {
                status: response.status,
                status_text: response.status_text,
                body: response.body,
            });
        }

        let token = match serde_json::from_str::<Value>(&response.body) {
            Ok(Value::String(token)) => token,
            _ => response.body.trim().to_string(),
        };
        self.store.set(TOKEN_KEY, &token)?;
        info!("session token renewed");
        Ok(())
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<UserProfile> {
        let request = HttpRequest::new(HttpMethod::Post, self.login_url())
            .with_form_body(&[("username", username), ("password", password)]);
        let response = self.transport.send(request).await?;

        if !response.is_success() {
            let status_text = if response.status_text.is_empty() {
                response.status.to_string()
            } else {
                response.status_text
            };
            return Err(ApiError::LoginFailed { status_text });
        }

        let login: LoginResponse = serde_json::from_str(&response.body)?;
        let user = serde_json::to_string(&login.profile)
            .map_err(|e| ApiError::Serialization(e.to_string()))?;
        self.store.set(TOKEN_KEY, &login.jwt)?;
        self.store.set(USER_KEY, &user)?;
        info!(user = %login.profile.display_name, "logged in");
        Ok(login.profile)
    }

    pub async fn logout(&self) -> Result<()> {
        let response = self
            .fetch(HttpRequest::new(HttpMethod::Delete, self.login_url()))
            .await?;
        if !response.is_success() {
            return Err(ApiError::HttpError {
                status: response.status,
                status_text: response.status_text,
                body: response.body,
            });
        }
        self.clear()?;
        info!("logged out");
        Ok(())
    }

    /// Succeeds iff a token is stored.
    pub fn check_session(&self) -> Result<()> {
        match self.token()? {
            Some(_) => Ok(()),
            None => Err(ApiError::AuthenticationExpired),
        }
    }

    /// Classifies an operation error for the framework's error hook.
    ///
    /// Authentication failures clear the session and come back as
    /// `AuthenticationExpired`; anything else is not a reason to log out.
    pub fn check_error(&self, error: &ApiError) -> Result<()> {
        if error.is_auth_failure() {
            self.clear()?;
            return Err(ApiError::AuthenticationExpired);
        }
        Ok(())
    }

    pub fn permissions(&self) -> Result<Permissions> {
        Ok(self
            .user()?
            .map(|u| Permissions {
                administrator: u.administrator,
                groups: u.groups,
            })
            .unwrap_or_default())
    }

    pub fn identity(&self) -> Result<Identity> {
        let user = self.user()?.ok_or(ApiError::AuthenticationExpired)?;
        Ok(Identity {
            id: user.user_id,
            full_name: user.display_name,
        })
    }

    async fn send_authorized(&self, mut request: HttpRequest) -> Result<HttpResponse> {
        if let Some(token) = self.token()? {
            request
                .headers
                .push(("Authorization".to_string(), format!("Bearer {token}")));
        }
        debug!(method = request.method.as_str(), url = %request.url, "backend call");
        self.transport.send(request).await
    }

    async fn renew_if_needed(&self) -> Result<()> {
        if !self.token_needs_renewal()? {
            return Ok(());
        }
        let _guard = self.renewal.lock().await;
        // Someone else may have renewed while we waited for the guard.
        if !self.token_needs_renewal()? {
            return Ok(());
        }
        self.renew().await
    }

    fn token_needs_renewal(&self) -> Result<bool> {
        let Some(token) = self.token()? else {
            return Ok(false);
        };
        match token_expiry(&token) {
            Some(exp) => {
                let remaining = exp.saturating_sub(Utc::now().timestamp());
                let threshold = i64::try_from(self.threshold.as_secs()).unwrap_or(i64::MAX);
                Ok(remaining < threshold)
            }
            None => {
                warn!("session token has no readable exp claim, skipping renewal");
                Ok(false)
            }
        }
    }
}

/// Reads the `exp` claim (seconds since the epoch) from a JWT payload.
pub fn token_expiry(token: &str) -> Option<i64> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: Value = serde_json::from_slice(&bytes).ok()?;
    let exp = claims.get("exp")?;
    exp.as_i64().or_else(|| exp.as_f64().map(|f| f as i64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testing::{jwt_expiring_at, ScriptedTransport};
    use serde_json::json;

    fn manager(transport: Arc<ScriptedTransport>, store: Arc<MemoryStore>) -> SessionManager {
        let config = ProviderConfig::new("http://h/api").validated().unwrap();
        SessionManager::new(transport, store, &config)
    }

    fn far_token() -> String {
        jwt_expiring_at(Utc::now().timestamp() + 3600)
    }

    fn near_token() -> String {
        jwt_expiring_at(Utc::now().timestamp() + 60)
    }

    fn get(url: &str) -> HttpRequest {
        HttpRequest::new(HttpMethod::Get, url)
    }

    fn user_json() -> serde_json::Value {
        json!({"userId": 1, "displayName": "Admin", "administrator": true, "groups": ["admins"]})
    }

    #[tokio::test]
    async fn renewal_403_clears_session() {
        let transport = Arc::new(ScriptedTransport::new());
        let store = Arc::new(MemoryStore::new());
        store.set(TOKEN_KEY, &near_token()).unwrap();
        store.set(USER_KEY, &user_json().to_string()).unwrap();
        transport.push(HttpResponse::new(403, ""));

        let session = manager(transport.clone(), store);
        let err = session.fetch(get("http://h/api/orders/1")).await.unwrap_err();

        assert!(matches!(err, ApiError::RenewalFailed { status: 403, .. }));
        assert_eq!(transport.requests().len(), 1);
        assert!(session.check_session().is_err());
        assert_eq!(session.user().unwrap(), None);
    }

    #[tokio::test]
    async fn extreme_exp_claims_do_not_overflow() {
        let transport = Arc::new(ScriptedTransport::new());
        let store = Arc::new(MemoryStore::new());
        store.set(TOKEN_KEY, &jwt_expiring_at(i64::MAX)).unwrap();
        transport.push_json(200, json!({}));

        let session = manager(transport.clone(), store.clone());
        session.fetch(get("http://h/api/orders")).await.unwrap();
        assert_eq!(transport.requests().len(), 1);

        // Long past expiry: renewal is attempted, not a panic.
        store.set(TOKEN_KEY, &jwt_expiring_at(i64::MIN)).unwrap();
        transport.push_json(200, json!(far_token()));
        transport.push_json(200, json!({}));
        session.fetch(get("http://h/api/orders")).await.unwrap();
        assert_eq!(transport.count(HttpMethod::Post, "/:renew-token"), 1);
    }

    #[tokio::test]
    async fn huge_threshold_renews_every_call() {
        let transport = Arc::new(ScriptedTransport::new());
        let store = Arc::new(MemoryStore::new());
        store.set(TOKEN_KEY, &far_token()).unwrap();
        transport.push_json(200, json!(far_token()));
        transport.push_json(200, json!({}));

        let config = ProviderConfig::new("http://h/api")
            .with_renewal_threshold(Duration::from_secs(u64::MAX))
            .validated()
            .unwrap();
        let session = SessionManager::new(transport.clone(), store, &config);
        session.fetch(get("http://h/api/orders")).await.unwrap();
        assert_eq!(transport.count(HttpMethod::Post, "/:renew-token"), 1);
    }

    #[test]
    fn reads_exp_claim() {
        assert_eq!(token_expiry(&jwt_expiring_at(1_700_000_000)), Some(1_700_000_000));
        assert_eq!(token_expiry("not-a-jwt"), None);
        assert_eq!(token_expiry("a.!!!.c"), None);
    }

    #[tokio::test]
    async fn login_stores_token_and_profile() {
        let transport = Arc::new(ScriptedTransport::new());
        let store = Arc::new(MemoryStore::new());
        let token = far_token();
        let mut body = user_json();
        body["jwt"] = json!(token);
        transport.push_json(200, body);

        let session = manager(transport.clone(), store.clone());
        let profile = session.login("admin", "s3cret").await.unwrap();

        assert_eq!(profile.display_name, "Admin");
        assert_eq!(session.token().unwrap(), Some(token));
        assert_eq!(session.user().unwrap(), Some(profile));
        assert!(session.check_session().is_ok());

        let request = &transport.requests()[0];
        assert_eq!(request.method, HttpMethod::Post);
        assert_eq!(request.url, "http://h/api/:auth");
        assert_eq!(request.body.as_deref(), Some("username=admin&password=s3cret"));
        assert_eq!(request.header("Authorization"), None);
    }

    #[tokio::test]
    async fn login_without_display_name_still_stores_token() {
        let transport = Arc::new(ScriptedTransport::new());
        let token = far_token();
        transport.push_json(200, json!({"jwt": token, "userId": "u-7"}));

        let session = manager(transport, Arc::new(MemoryStore::new()));
        let profile = session.login("admin", "s3cret").await.unwrap();

        assert_eq!(profile.display_name, "");
        assert_eq!(session.token().unwrap(), Some(token));
        assert_eq!(session.identity().unwrap().id.as_str(), "u-7");
    }

    #[tokio::test]
    async fn login_failure_reports_status_text() {
        let transport = Arc::new(ScriptedTransport::new());
        let mut response = HttpResponse::new(401, "");
        response.status_text = "Unauthorized".to_string();
        transport.push(response);

        let session = manager(transport, Arc::new(MemoryStore::new()));
        let err = session.login("admin", "wrong").await.unwrap_err();
        assert!(matches!(
            err,
            ApiError::LoginFailed { status_text } if status_text == "Unauthorized"
        ));
        assert!(session.check_session().is_err());
    }

    #[tokio::test]
    async fn far_expiry_triggers_no_renewal() {
        let transport = Arc::new(ScriptedTransport::new());
        let store = Arc::new(MemoryStore::new());
        let token = far_token();
        store.set(TOKEN_KEY, &token).unwrap();
        transport.push_json(200, json!({}));

        let session = manager(transport.clone(), store);
        session.fetch(get("http://h/api/orders/1")).await.unwrap();

        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(
            requests[0].header("Authorization"),
            Some(format!("Bearer {token}").as_str())
        );
    }

    #[tokio::test]
    async fn near_expiry_renews_once_before_the_call() {
        let transport = Arc::new(ScriptedTransport::new());
        let store = Arc::new(MemoryStore::new());
        let old = near_token();
        let new = far_token();
        store.set(TOKEN_KEY, &old).unwrap();
        transport.push_json(200, json!(new));
        transport.push_json(200, json!({}));

        let session = manager(transport.clone(), store);
        session.fetch(get("http://h/api/orders/1")).await.unwrap();

        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].url, "http://h/api/:auth/:renew-token");
        assert_eq!(
            requests[0].header("Authorization"),
            Some(format!("Bearer {old}").as_str())
        );
        assert_eq!(
            requests[1].header("Authorization"),
            Some(format!("Bearer {new}").as_str())
        );
        assert_eq!(session.token().unwrap(), Some(new));
    }

    #[tokio::test]
    async fn concurrent_calls_share_one_renewal() {
        let transport = Arc::new(ScriptedTransport::new());
        let store = Arc::new(MemoryStore::new());
        store.set(TOKEN_KEY, &near_token()).unwrap();
        transport.push_json(200, json!(far_token()));
        transport.push_json(200, json!({}));
        transport.push_json(200, json!({}));

        let session = manager(transport.clone(), store);
        let (a, b) = tokio::join!(
            session.fetch(get("http://h/api/orders/1")),
            session.fetch(get("http://h/api/orders/2"))
        );
        a.unwrap();
        b.unwrap();
        assert_eq!(transport.count(HttpMethod::Post, "/:renew-token"), 1);
    }

    #[tokio::test]
    async fn renewal_401_clears_session_and_skips_the_call() {
        let transport = Arc::new(ScriptedTransport::new());
        let store = Arc::new(MemoryStore::new());
        store.set(TOKEN_KEY, &near_token()).unwrap();
        store.set(USER_KEY, &user_json().to_string()).unwrap();
        transport.push(HttpResponse::new(401, "expired"));

        let session = manager(transport.clone(), store);
        let err = session.fetch(get("http://h/api/orders/1")).await.unwrap_err();

        assert!(matches!(err, ApiError::RenewalFailed { status: 401, .. }));
        assert_eq!(transport.requests().len(), 1);
        assert_eq!(session.token().unwrap(), None);
        assert_eq!(session.user().unwrap(), None);
    }

    #[tokio::test]
    async fn forbidden_response_clears_session() {
        let transport = Arc::new(ScriptedTransport::new());
        let store = Arc::new(MemoryStore::new());
        store.set(TOKEN_KEY, &far_token()).unwrap();
        store.set(USER_KEY, &user_json().to_string()).unwrap();
        transport.push(HttpResponse::new(403, ""));

        let session = manager(transport, store);
        let err = session.fetch(get("http://h/api/orders")).await.unwrap_err();

        assert!(matches!(err, ApiError::AuthenticationExpired));
        assert!(session.check_session().is_err());
        assert_eq!(session.permissions().unwrap(), Permissions::default());
    }

    #[tokio::test]
    async fn unreadable_token_is_sent_without_renewal() {
        let transport = Arc::new(ScriptedTransport::new());
        let store = Arc::new(MemoryStore::new());
        store.set(TOKEN_KEY, "opaque-token").unwrap();
        transport.push_json(200, json!({}));

        let session = manager(transport.clone(), store);
        session.fetch(get("http://h/api/orders")).await.unwrap();
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn logout_clears_session() {
        let transport = Arc::new(ScriptedTransport::new());
        let store = Arc::new(MemoryStore::new());
        store.set(TOKEN_KEY, &far_token()).unwrap();
        store.set(USER_KEY, &user_json().to_string()).unwrap();
        transport.push(HttpResponse::new(200, ""));

        let session = manager(transport.clone(), store);
        session.logout().await.unwrap();

        assert_eq!(transport.requests()[0].method, HttpMethod::Delete);
        assert!(session.check_session().is_err());
        assert!(session.identity().is_err());
    }

    #[tokio::test]
    async fn logout_failure_keeps_session() {
        let transport = Arc::new(ScriptedTransport::new());
        let store = Arc::new(MemoryStore::new());
        store.set(TOKEN_KEY, &far_token()).unwrap();
        transport.push(HttpResponse::new(500, "boom"));

        let session = manager(transport, store);
        let err = session.logout().await.unwrap_err();
        assert!(matches!(err, ApiError::HttpError { status: 500, .. }));
        assert!(session.check_session().is_ok());
    }

    #[test]
    fn check_error_only_logs_out_on_auth_failures() {
        let store = Arc::new(MemoryStore::new());
        store.set(TOKEN_KEY, "t").unwrap();
        let session = manager(Arc::new(ScriptedTransport::new()), store);

        let conflict = ApiError::ConstraintViolation {
            message: "fk".to_string(),
        };
        assert!(session.check_error(&conflict).is_ok());
        assert!(session.check_session().is_ok());

        let forbidden = ApiError::HttpError {
            status: 403,
            status_text: "Forbidden".to_string(),
            body: String::new(),
        };
        assert!(matches!(
            session.check_error(&forbidden),
            Err(ApiError::AuthenticationExpired)
        ));
        assert!(session.check_session().is_err());
    }

    #[test]
    fn permissions_and_identity_come_from_profile() {
        let store = Arc::new(MemoryStore::new());
        store.set(USER_KEY, &user_json().to_string()).unwrap();
        let session = manager(Arc::new(ScriptedTransport::new()), store);

        let permissions = session.permissions().unwrap();
        assert!(permissions.administrator);
        assert_eq!(permissions.groups, vec!["admins".to_string()]);

        let identity = session.identity().unwrap();
        assert_eq!(identity.full_name, "Admin");
        assert_eq!(identity.id.as_str(), "1");
    }
}
