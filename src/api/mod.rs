//! Client for the Trovo Open Platform REST API: token validation/refresh,
//! per-channel chat-token fetch, chat send, and user lookup. The websocket
//! gateway only accepts control frames; actual chat text goes through the
//! `chat/send` endpoint here.

use crate::model::Credentials;
use async_trait::async_trait;
use reqwest::{
    header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE},
    Client, Method, Request, StatusCode, Url,
};
use serde::Deserialize;
use serde_json::Value;
use std::{
    fmt,
    sync::Mutex,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

const DEFAULT_TIMEOUT_SECS: u64 = 15;
const SEND_MAX_ATTEMPTS: u32 = 3;
const CLIENT_ID_HEADER: &str = "Client-ID";

pub type DynError = Box<dyn std::error::Error + Send + Sync>;

/// Called with the new credential record after every successful refresh, so
/// a rotated refresh token is never lost to a crash or reconnect.
pub type RefreshHook = Box<dyn Fn(&Credentials) + Send + Sync>;

/// Chat-send capability handed to command handlers and the session core.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send_message(&self, text: &str) -> Result<(), DynError>;
}

/// Credential lifecycle capability consumed by the session manager. All
/// methods must be safe to call repeatedly; the outer reconnect loop will.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Install a previously persisted credential record.
    fn restore(&self, creds: Credentials);
    /// Snapshot of the current (possibly refreshed) credential record.
    fn credentials(&self) -> Credentials;
    /// Validate the held access token, refreshing it if possible.
    async fn ensure_valid(&self) -> Result<(), DynError>;
    /// Fresh per-session chat token for gateway AUTH frames.
    async fn chat_token(&self) -> Result<String, DynError>;
}

/// Platform user lookup, for resolving names the local roster has not seen.
#[async_trait]
pub trait UserLookup: Send + Sync {
    async fn lookup_user(&self, name: &str) -> Result<Option<ApiUser>, DynError>;
}

pub struct TrovoApi {
    http: Client,
    base_url: Url,
    client_id: String,
    client_secret: String,
    channel_id: String,
    tokens: Mutex<Credentials>,
    on_refresh: Mutex<Option<RefreshHook>>,
}

impl TrovoApi {
    pub fn new(
        base_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        channel_id: impl Into<String>,
    ) -> Result<Self, ApiError> {
        let base_url = base_url.into();
        let client_id = client_id.into();
        let client_secret = client_secret.into();
        let channel_id = channel_id.into();

        if client_id.trim().is_empty() {
            return Err(ApiError::Config("client id must not be empty"));
        }
        if client_secret.trim().is_empty() {
            return Err(ApiError::Config("client secret must not be empty"));
        }
        if channel_id.trim().is_empty() {
            return Err(ApiError::Config("channel id must not be empty"));
        }

        let mut parsed =
            Url::parse(base_url.trim()).map_err(|err| ApiError::Url(err.to_string()))?;
        if !parsed.path().ends_with('/') {
            let new_path = format!("{}/", parsed.path().trim_end_matches('/'));
            parsed.set_path(&new_path);
        }

        let http = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(ApiError::Http)?;

        Ok(Self {
            http,
            base_url: parsed,
            client_id,
            client_secret,
            channel_id,
            tokens: Mutex::new(Credentials::default()),
            on_refresh: Mutex::new(None),
        })
    }

    pub fn set_on_refresh(&self, hook: RefreshHook) {
        *self.on_refresh.lock().unwrap() = Some(hook);
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        self.base_url
            .join(path)
            .map_err(|err| ApiError::Url(err.to_string()))
    }

    fn public_headers(&self) -> Result<HeaderMap, ApiError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(
            CLIENT_ID_HEADER,
            HeaderValue::from_str(&self.client_id).map_err(ApiError::InvalidHeaderValue)?,
        );
        Ok(headers)
    }

    fn auth_headers(&self, access_token: &str) -> Result<HeaderMap, ApiError> {
        let mut headers = self.public_headers()?;
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("OAuth {access_token}"))
                .map_err(ApiError::InvalidHeaderValue)?,
        );
        Ok(headers)
    }

    pub fn build_validate_request(&self, access_token: &str) -> Result<Request, ApiError> {
        self.http
            .request(Method::GET, self.endpoint("validate")?)
            .headers(self.auth_headers(access_token)?)
            .build()
            .map_err(ApiError::Http)
    }

    pub fn build_refresh_request(&self, refresh_token: &str) -> Result<Request, ApiError> {
        let body = serde_json::json!({
            "client_secret": self.client_secret,
            "grant_type": "refresh_token",
            "refresh_token": refresh_token,
        });
        self.http
            .request(Method::POST, self.endpoint("refreshtoken")?)
            .headers(self.public_headers()?)
            .header(CONTENT_TYPE, "application/json")
            .body(body.to_string())
            .build()
            .map_err(ApiError::Http)
    }

    pub fn build_chat_token_request(&self, access_token: &str) -> Result<Request, ApiError> {
        let path = format!("chat/channel-token/{}", self.channel_id);
        self.http
            .request(Method::GET, self.endpoint(&path)?)
            .headers(self.auth_headers(access_token)?)
            .build()
            .map_err(ApiError::Http)
    }

    pub fn build_send_request(&self, access_token: &str, content: &str) -> Result<Request, ApiError> {
        let body = serde_json::json!({
            "content": content,
            "channel_id": self.channel_id,
        });
        self.http
            .request(Method::POST, self.endpoint("chat/send")?)
            .headers(self.auth_headers(access_token)?)
            .header(CONTENT_TYPE, "application/json")
            .body(body.to_string())
            .build()
            .map_err(ApiError::Http)
    }

    pub fn build_get_users_request(&self, names: &[String]) -> Result<Request, ApiError> {
        let body = serde_json::json!({ "user": names });
        self.http
            .request(Method::POST, self.endpoint("getusers")?)
            .headers(self.public_headers()?)
            .header(CONTENT_TYPE, "application/json")
            .body(body.to_string())
            .build()
            .map_err(ApiError::Http)
    }

    fn access_token(&self) -> Result<String, ApiError> {
        self.tokens
            .lock()
            .unwrap()
            .access_token
            .clone()
            .ok_or(ApiError::MissingCredentials)
    }

    async fn is_token_valid(&self, access_token: &str) -> Result<bool, ApiError> {
        let req = self.build_validate_request(access_token)?;
        let resp = self.http.execute(req).await.map_err(ApiError::Http)?;
        let status = resp.status();
        let body = resp.text().await.map_err(ApiError::Http)?;
        parse_validate_response(status, &body, now_unix())
    }

    async fn refresh_tokens(&self) -> Result<(), ApiError> {
        let refresh_token = self
            .tokens
            .lock()
            .unwrap()
            .refresh_token
            .clone()
            .ok_or(ApiError::MissingCredentials)?;

        tracing::info!("refreshing access token");
        let req = self.build_refresh_request(&refresh_token)?;
        let resp = self.http.execute(req).await.map_err(ApiError::Http)?;
        let status = resp.status();
        let body = resp.text().await.map_err(ApiError::Http)?;
        let creds = parse_token_response(status, &body)?;
        self.store_refreshed(creds);
        Ok(())
    }

    fn store_refreshed(&self, creds: Credentials) {
        *self.tokens.lock().unwrap() = creds.clone();
        if let Some(hook) = self.on_refresh.lock().unwrap().as_ref() {
            hook(&creds);
        }
    }

    async fn ensure_valid_inner(&self) -> Result<(), ApiError> {
        let creds = self.tokens.lock().unwrap().clone();
        if creds.is_empty() {
            // first-time OAuth code exchange is the operator's job
            return Err(ApiError::MissingCredentials);
        }

        if let Some(token) = creds.access_token.as_deref() {
            if self.is_token_valid(token).await? {
                return Ok(());
            }
            tracing::warn!("access token invalid or expired");
        }

        if creds.refresh_token.is_some() {
            self.refresh_tokens().await
        } else {
            Err(ApiError::InvalidToken)
        }
    }

    async fn channel_chat_token_inner(&self) -> Result<String, ApiError> {
        let access_token = self.access_token()?;
        let req = self.build_chat_token_request(&access_token)?;
        let resp = self.http.execute(req).await.map_err(ApiError::Http)?;
        let status = resp.status();
        let body = resp.text().await.map_err(ApiError::Http)?;
        parse_chat_token_response(status, &body)
    }

    /// Send chat text, re-validating the credential and retrying on an
    /// expired-token response.
    pub async fn send_chat(&self, content: &str) -> Result<(), ApiError> {
        for attempt in 1..=SEND_MAX_ATTEMPTS {
            let access_token = self.access_token()?;
            let req = self.build_send_request(&access_token, content)?;
            let resp = self.http.execute(req).await.map_err(ApiError::Http)?;
            let status = resp.status();
            let body = resp.text().await.map_err(ApiError::Http)?;
            match parse_send_response(status, &body)? {
                SendOutcome::Sent => {
                    tracing::debug!(content, "chat message sent");
                    return Ok(());
                }
                SendOutcome::TokenExpired => {
                    tracing::warn!(attempt, "chat send rejected: access token expired");
                    self.ensure_valid_inner().await?;
                }
            }
        }
        Err(ApiError::SendRetriesExhausted)
    }

    pub async fn get_users(&self, names: &[String]) -> Result<Vec<ApiUser>, ApiError> {
        let req = self.build_get_users_request(names)?;
        let resp = self.http.execute(req).await.map_err(ApiError::Http)?;
        let status = resp.status();
        let body = resp.text().await.map_err(ApiError::Http)?;
        parse_users_response(status, &body)
    }
}

#[async_trait]
impl TokenProvider for TrovoApi {
    fn restore(&self, creds: Credentials) {
        *self.tokens.lock().unwrap() = creds;
    }

    fn credentials(&self) -> Credentials {
        self.tokens.lock().unwrap().clone()
    }

    async fn ensure_valid(&self) -> Result<(), DynError> {
        self.ensure_valid_inner().await.map_err(DynError::from)
    }

    async fn chat_token(&self) -> Result<String, DynError> {
        self.channel_chat_token_inner().await.map_err(DynError::from)
    }
}

#[async_trait]
impl UserLookup for TrovoApi {
    async fn lookup_user(&self, name: &str) -> Result<Option<ApiUser>, DynError> {
        let users = self.get_users(&[name.to_string()]).await?;
        Ok(users.into_iter().next())
    }
}

#[async_trait]
impl MessageSender for TrovoApi {
    async fn send_message(&self, text: &str) -> Result<(), DynError> {
        self.send_chat(text).await.map_err(DynError::from)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    TokenExpired,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiUser {
    pub user_id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub nickname: String,
}

#[derive(Debug)]
pub enum ApiError {
    Config(&'static str),
    Url(String),
    Http(reqwest::Error),
    Json(serde_json::Error),
    InvalidHeaderValue(reqwest::header::InvalidHeaderValue),
    Api { status: StatusCode, body: String },
    Missing(&'static str),
    MissingCredentials,
    InvalidToken,
    SendRetriesExhausted,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config error: {msg}"),
            Self::Url(err) => write!(f, "url error: {err}"),
            Self::Http(err) => write!(f, "http error: {err}"),
            Self::Json(err) => write!(f, "json error: {err}"),
            Self::InvalidHeaderValue(err) => write!(f, "invalid header value: {err}"),
            Self::Api { status, body } => write!(f, "api error {}: {}", status.as_u16(), body),
            Self::Missing(field) => write!(f, "api response missing field: {field}"),
            Self::MissingCredentials => {
                write!(f, "no persisted credentials; provision tokens before starting")
            }
            Self::InvalidToken => write!(f, "access token invalid and no refresh token held"),
            Self::SendRetriesExhausted => write!(f, "chat send retries exhausted"),
        }
    }
}

impl std::error::Error for ApiError {}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Token introspection result. The API reports failures both through HTTP
/// status and an `error` field in an otherwise 200 body; either means invalid.
pub fn parse_validate_response(
    status: StatusCode,
    body: &str,
    now_unix: i64,
) -> Result<bool, ApiError> {
    let value: Value = match serde_json::from_str(body) {
        Ok(value) => value,
        Err(err) => {
            if status.is_success() {
                return Err(ApiError::Json(err));
            }
            return Err(ApiError::Api {
                status,
                body: body.to_string(),
            });
        }
    };

    if value.get("error").is_some() {
        return Ok(false);
    }
    if !status.is_success() {
        return Err(ApiError::Api {
            status,
            body: body.to_string(),
        });
    }

    match expire_ts(&value) {
        Some(ts) => Ok(ts > now_unix),
        None => Ok(false),
    }
}

// expire_ts arrives as a JSON string in practice, but tolerate a number too
fn expire_ts(value: &Value) -> Option<i64> {
    match value.get("expire_ts")? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

pub fn parse_token_response(status: StatusCode, body: &str) -> Result<Credentials, ApiError> {
    if !status.is_success() {
        return Err(ApiError::Api {
            status,
            body: body.to_string(),
        });
    }
    let value: Value = serde_json::from_str(body).map_err(ApiError::Json)?;
    if value.get("error").is_some() {
        return Err(ApiError::Api {
            status,
            body: body.to_string(),
        });
    }

    let access_token = value
        .get("access_token")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .ok_or(ApiError::Missing("access_token"))?;
    let refresh_token = value.get("refresh_token").and_then(Value::as_str);

    Ok(Credentials {
        access_token: Some(access_token.to_string()),
        refresh_token: refresh_token.map(str::to_string),
    })
}

pub fn parse_chat_token_response(status: StatusCode, body: &str) -> Result<String, ApiError> {
    if !status.is_success() {
        return Err(ApiError::Api {
            status,
            body: body.to_string(),
        });
    }
    let value: Value = serde_json::from_str(body).map_err(ApiError::Json)?;
    value
        .get("token")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .ok_or(ApiError::Missing("token"))
}

pub fn parse_send_response(status: StatusCode, body: &str) -> Result<SendOutcome, ApiError> {
    // a bare 2xx with an empty body is the normal success shape
    if body.trim().is_empty() {
        if status.is_success() {
            return Ok(SendOutcome::Sent);
        }
        return Err(ApiError::Api {
            status,
            body: body.to_string(),
        });
    }

    let value: Value = match serde_json::from_str(body) {
        Ok(value) => value,
        Err(_) => {
            return Err(ApiError::Api {
                status,
                body: body.to_string(),
            })
        }
    };

    match value.get("error").and_then(Value::as_str) {
        Some("accessTokenExpired") => Ok(SendOutcome::TokenExpired),
        Some(_) => Err(ApiError::Api {
            status,
            body: body.to_string(),
        }),
        None => Ok(SendOutcome::Sent),
    }
}

pub fn parse_users_response(status: StatusCode, body: &str) -> Result<Vec<ApiUser>, ApiError> {
    if !status.is_success() {
        return Err(ApiError::Api {
            status,
            body: body.to_string(),
        });
    }
    #[derive(Deserialize)]
    struct UsersEnvelope {
        #[serde(default)]
        users: Vec<ApiUser>,
    }
    let envelope: UsersEnvelope = serde_json::from_str(body).map_err(ApiError::Json)?;
    Ok(envelope.users)
}
