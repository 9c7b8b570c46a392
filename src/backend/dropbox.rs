//! Dropbox hosted-file-service backend
//!
//! The artifact lives at a fixed app-folder path. Authentication is OAuth2
//! with offline access; the token pair is persisted in the OS keychain and
//! refreshed when the access token expires. Uploads become conditional
//! once a revision is known, so a concurrent writer surfaces as `Conflict`
//! instead of being silently clobbered.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use super::{Backend, BackendError, BackendKind};
use crate::artifact;
use crate::clipboard::ClipboardItem;

/// Fixed artifact path inside the Dropbox app folder
pub const FILE_PATH: &str = "/Apps/Clipshare/current.clip";

/// Keychain service under which the token pair is stored
pub const KEYCHAIN_SERVICE: &str = "com.clipshare.dropbox";

const KEYCHAIN_ACCOUNT: &str = "tokens";

const CONTENT_API: &str = "https://content.dropboxapi.com/2";
const API: &str = "https://api.dropboxapi.com/2";
const AUTH_URL: &str = "https://www.dropbox.com/oauth2/authorize";
const TOKEN_URL: &str = "https://api.dropboxapi.com/oauth2/token";

/// Default HTTP timeout for all Dropbox requests
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Token pair persisted in the keychain
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredTokens {
    access_token: String,
    refresh_token: String,
    expiry: DateTime<Utc>,
}

#[derive(Default)]
struct DropboxState {
    tokens: Option<StoredTokens>,
    last_rev: Option<String>,
    last_content_hash: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileMetadata {
    rev: String,
    content_hash: String,
    #[serde(default)]
    server_modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Backend over the Dropbox content API
pub struct DropboxBackend {
    app_key: String,
    app_secret: String,
    http: reqwest::Client,
    state: Mutex<DropboxState>,
}

impl DropboxBackend {
    /// Create a Dropbox backend with the given app credentials. Tokens are
    /// loaded from the keychain during `init`.
    pub fn new(app_key: &str, app_secret: &str) -> Self {
        Self {
            app_key: app_key.to_string(),
            app_secret: app_secret.to_string(),
            http: reqwest::Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .expect("reqwest client"),
            state: Mutex::new(DropboxState::default()),
        }
    }

    /// The OAuth authorization URL the user visits to grant offline access
    pub fn authorize_url(&self, state: &str) -> String {
        format!(
            "{AUTH_URL}?client_id={}&response_type=code&token_access_type=offline&state={state}",
            self.app_key
        )
    }

    /// Exchange an authorization code for a token pair and persist it
    pub async fn exchange_code(&self, code: &str) -> Result<(), BackendError> {
        let response = self
            .http
            .post(TOKEN_URL)
            .form(&[
                ("code", code),
                ("grant_type", "authorization_code"),
                ("client_id", &self.app_key),
                ("client_secret", &self.app_secret),
            ])
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(BackendError::Transport(format!(
                "token exchange failed with status {}",
                response.status()
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        let tokens = StoredTokens {
            access_token: token.access_token,
            refresh_token: token.refresh_token.unwrap_or_default(),
            expiry: Utc::now() + chrono::Duration::seconds(token.expires_in.unwrap_or(0)),
        };
        save_tokens(&tokens)?;
        self.state.lock().unwrap().tokens = Some(tokens);
        Ok(())
    }

    /// Forget the stored token pair (logout)
    pub fn clear_tokens(&self) -> Result<(), BackendError> {
        self.state.lock().unwrap().tokens = None;
        delete_tokens()
    }

    /// True if a token pair is loaded
    pub fn is_authenticated(&self) -> bool {
        self.state.lock().unwrap().tokens.is_some()
    }

    /// Current access token, refreshing it first when expired
    async fn bearer(&self) -> Result<String, BackendError> {
        let (token, needs_refresh) = {
            let state = self.state.lock().unwrap();
            match &state.tokens {
                Some(tokens) => (tokens.clone(), Utc::now() > tokens.expiry),
                None => return Err(BackendError::NotConfigured),
            }
        };

        if !needs_refresh {
            return Ok(token.access_token);
        }
        self.refresh_access_token(&token).await
    }

    async fn refresh_access_token(&self, current: &StoredTokens) -> Result<String, BackendError> {
        if current.refresh_token.is_empty() {
            return Err(BackendError::NotAuthenticated(
                "no refresh token available".to_string(),
            ));
        }

        let response = self
            .http
            .post(TOKEN_URL)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", &current.refresh_token),
                ("client_id", &self.app_key),
                ("client_secret", &self.app_secret),
            ])
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(BackendError::NotAuthenticated(format!(
                "token refresh failed with status {}",
                response.status()
            )));
        }

        let refreshed: TokenResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        let tokens = StoredTokens {
            access_token: refreshed.access_token.clone(),
            refresh_token: refreshed
                .refresh_token
                .unwrap_or_else(|| current.refresh_token.clone()),
            expiry: Utc::now() + chrono::Duration::seconds(refreshed.expires_in.unwrap_or(0)),
        };
        save_tokens(&tokens)?;
        self.state.lock().unwrap().tokens = Some(tokens);
        debug!("dropbox access token refreshed");
        Ok(refreshed.access_token)
    }

    fn record_metadata(&self, rev: &str, content_hash: &str) {
        let mut state = self.state.lock().unwrap();
        state.last_rev = Some(rev.to_string());
        state.last_content_hash = Some(content_hash.to_string());
    }

    /// Upload arguments, switching to a conditional update when a revision
    /// from a previous write or read is known
    fn upload_args(&self) -> serde_json::Value {
        let mode = match &self.state.lock().unwrap().last_rev {
            Some(rev) => json!({".tag": "update", "update": rev}),
            None => json!("overwrite"),
        };
        json!({
            "path": FILE_PATH,
            "mode": mode,
            "autorename": false,
            "mute": true,
        })
    }

    async fn get_metadata(&self) -> Result<FileMetadata, BackendError> {
        let bearer = self.bearer().await?;

        let response = self
            .http
            .post(format!("{API}/files/get_metadata"))
            .bearer_auth(bearer)
            .json(&json!({"path": FILE_PATH}))
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        if response.status().as_u16() == 409 {
            return Err(BackendError::NotFound);
        }
        if !response.status().is_success() {
            return Err(BackendError::Transport(format!(
                "get_metadata failed with status {}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))
    }
}

#[async_trait]
impl Backend for DropboxBackend {
    async fn init(&self) -> Result<(), BackendError> {
        if self.app_key.is_empty() {
            return Err(BackendError::NotConfigured);
        }

        let tokens = load_tokens()?.ok_or_else(|| {
            BackendError::NotAuthenticated("no stored Dropbox tokens".to_string())
        })?;
        let expired = Utc::now() > tokens.expiry;
        self.state.lock().unwrap().tokens = Some(tokens.clone());

        if expired {
            self.refresh_access_token(&tokens).await?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BackendError> {
        Ok(())
    }

    async fn write(&self, item: &ClipboardItem) -> Result<(), BackendError> {
        let bearer = self.bearer().await?;
        let data = artifact::encode(item)?;
        let args = self.upload_args();

        let response = self
            .http
            .post(format!("{CONTENT_API}/files/upload"))
            .bearer_auth(bearer)
            .header("Content-Type", "application/octet-stream")
            .header("Dropbox-API-Arg", args.to_string())
            .body(data)
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        if response.status().as_u16() == 409 {
            return Err(BackendError::Conflict);
        }
        if !response.status().is_success() {
            return Err(BackendError::Transport(format!(
                "upload failed with status {}",
                response.status()
            )));
        }

        let meta: FileMetadata = response
            .json()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        self.record_metadata(&meta.rev, &meta.content_hash);
        Ok(())
    }

    async fn read(&self) -> Result<Option<ClipboardItem>, BackendError> {
        let bearer = self.bearer().await?;

        let response = self
            .http
            .post(format!("{CONTENT_API}/files/download"))
            .bearer_auth(bearer)
            .header("Dropbox-API-Arg", json!({"path": FILE_PATH}).to_string())
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        if response.status().as_u16() == 409 {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(BackendError::Transport(format!(
                "download failed with status {}",
                response.status()
            )));
        }

        if let Some(header) = response.headers().get("Dropbox-API-Result") {
            if let Ok(meta) =
                serde_json::from_slice::<FileMetadata>(header.as_bytes())
            {
                self.record_metadata(&meta.rev, &meta.content_hash);
            }
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        Ok(Some(artifact::decode(&bytes)?))
    }

    async fn mod_time(&self) -> Result<DateTime<Utc>, BackendError> {
        let meta = self.get_metadata().await?;
        self.record_metadata(&meta.rev, &meta.content_hash);
        meta.server_modified.ok_or(BackendError::NotFound)
    }

    async fn checksum(&self) -> Result<String, BackendError> {
        let meta = self.get_metadata().await?;
        self.record_metadata(&meta.rev, &meta.content_hash);
        Ok(meta.content_hash)
    }

    async fn exists(&self) -> bool {
        self.get_metadata().await.is_ok()
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Dropbox
    }

    fn location(&self) -> String {
        if self.is_authenticated() {
            format!("dropbox:{FILE_PATH}")
        } else {
            String::new()
        }
    }

    // The artifact path is fixed for the hosted service
    fn set_location(&self, _location: &str) -> Result<(), BackendError> {
        Ok(())
    }
}

fn keychain_entry() -> Result<keyring::Entry, BackendError> {
    keyring::Entry::new(KEYCHAIN_SERVICE, KEYCHAIN_ACCOUNT)
        .map_err(|e| BackendError::Transport(format!("keychain entry: {e}")))
}

fn load_tokens() -> Result<Option<StoredTokens>, BackendError> {
    let entry = keychain_entry()?;
    match entry.get_password() {
        Ok(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| BackendError::Transport(format!("stored tokens corrupt: {e}"))),
        Err(keyring::Error::NoEntry) => Ok(None),
        Err(e) => Err(BackendError::Transport(format!("keychain read: {e}"))),
    }
}

fn save_tokens(tokens: &StoredTokens) -> Result<(), BackendError> {
    let entry = keychain_entry()?;
    let raw = serde_json::to_string(tokens)
        .map_err(|e| BackendError::Transport(e.to_string()))?;
    entry
        .set_password(&raw)
        .map_err(|e| BackendError::Transport(format!("keychain write: {e}")))
}

fn delete_tokens() -> Result<(), BackendError> {
    let entry = keychain_entry()?;
    match entry.delete_credential() {
        Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(BackendError::Transport(format!("keychain delete: {e}"))),
    }
}
