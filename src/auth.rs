use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use reqwest::Client as HttpClient;
use reqwest::header::COOKIE;
use tokio::sync::RwLock;

use crate::error::{ClientError, ClientResult};
use crate::protocol::TokenResponse;

/// Cookie the backend sets at login and reads at `/refresh-token`.
pub const REFRESH_COOKIE: &str = "refresh_token";

pub type RefreshFuture<'a> = Pin<Box<dyn Future<Output = ClientResult<String>> + Send + 'a>>;

/// Obtains a fresh access token when the backend answers 401.
pub trait TokenRefresher: Send + Sync {
    fn refresh<'a>(&'a self, http: &'a HttpClient, base_url: &'a str) -> RefreshFuture<'a>;
}

/// Exchanges the `refresh_token` cookie at `/refresh-token`.
pub struct CookieRefresher {
    refresh_token: String,
}

impl CookieRefresher {
    pub fn new(refresh_token: impl Into<String>) -> Self {
        Self {
            refresh_token: refresh_token.into(),
        }
    }
}

impl TokenRefresher for CookieRefresher {
    fn refresh<'a>(&'a self, http: &'a HttpClient, base_url: &'a str) -> RefreshFuture<'a> {
        Box::pin(async move {
            let response = http
                .post(format!("{}/refresh-token", base_url))
                .header(COOKIE, format!("{}={}", REFRESH_COOKIE, self.refresh_token))
                .send()
                .await?;

            if !response.status().is_success() {
                return Err(ClientError::from_response("Failed to refresh token", response).await);
            }

            let body: TokenResponse = response.json().await?;
            Ok(body.access_token)
        })
    }
}

/// Access token shared by every request a client makes.
#[derive(Default)]
pub struct AuthStore {
    token: RwLock<Option<String>>,
    refresher: RwLock<Option<Arc<dyn TokenRefresher>>>,
}

impl AuthStore {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: RwLock::new(token),
            refresher: RwLock::new(None),
        }
    }

    pub fn with_refresher(self, refresher: Arc<dyn TokenRefresher>) -> Self {
        Self {
            token: self.token,
            refresher: RwLock::new(Some(refresher)),
        }
    }

    pub async fn token(&self) -> Option<String> {
        self.token.read().await.clone()
    }

    pub async fn set_token(&self, token: Option<String>) {
        *self.token.write().await = token;
    }

    /// Replaces the refresher, e.g. after a login hands out a new cookie.
    pub async fn set_refresher(&self, refresher: Option<Arc<dyn TokenRefresher>>) {
        *self.refresher.write().await = refresher;
    }

    pub async fn can_refresh(&self) -> bool {
        self.refresher.read().await.is_some()
    }

    /// Runs the refresher and stores the result. A failed refresh clears the
    /// stored token.
    pub async fn refresh(&self, http: &HttpClient, base_url: &str) -> ClientResult<String> {
        let refresher = self.refresher.read().await.clone();
        let Some(refresher) = refresher else {
            return Err(ClientError::Unauthorized);
        };

        match refresher.refresh(http, base_url).await {
            Ok(token) => {
                tracing::debug!("access token refreshed");
                self.set_token(Some(token.clone())).await;
                Ok(token)
            }
            Err(err) => {
                tracing::warn!(error = %err, "token refresh failed");
                self.set_token(None).await;
                Err(ClientError::Unauthorized)
            }
        }
    }
}

pub fn resolve_token(explicit: Option<String>) -> Option<String> {
    explicit.or_else(|| read_secret(&token_path()))
}

pub fn resolve_refresh_token(explicit: Option<String>) -> Option<String> {
    explicit.or_else(|| read_secret(&refresh_token_path()))
}

fn read_secret(path: &Path) -> Option<String> {
    match std::fs::read_to_string(path) {
        Ok(value) if !value.trim().is_empty() => Some(value.trim().to_string()),
        _ => None,
    }
}

pub fn write_token_file(token: &str) -> ClientResult<PathBuf> {
    let path = token_path();
    write_secret(&path, token)?;
    Ok(path)
}

pub fn write_refresh_token_file(refresh_token: &str) -> ClientResult<PathBuf> {
    let path = refresh_token_path();
    write_secret(&path, refresh_token)?;
    Ok(path)
}

fn write_secret(path: &Path, value: &str) -> ClientResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    file.write_all(value.as_bytes())?;
    Ok(())
}

/// Removes both saved tokens; missing files are fine.
pub fn remove_token_files() -> ClientResult<()> {
    for path in [token_path(), refresh_token_path()] {
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

pub fn config_dir() -> PathBuf {
    match std::env::var_os("HOME").or_else(|| std::env::var_os("USERPROFILE")) {
        Some(home) => PathBuf::from(home).join(".newsdigest"),
        None => PathBuf::from(".newsdigest"),
    }
}

pub fn token_path() -> PathBuf {
    config_dir().join("token")
}

pub fn refresh_token_path() -> PathBuf {
    config_dir().join("refresh_token")
}
