//! Login context and the hosted users table.

use crate::error::{Error, Result};

use base64::engine::general_purpose;
use base64::Engine;
use http::StatusCode;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::{info, warn};

pub const INVALID_CREDENTIALS: &str = "Invalid username or password";
pub const GUEST: &str = "guest";

/// Who is logged in. Loaded once by the CLI and handed to whatever needs it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionContext {
    pub logged_in: bool,
    pub username: Option<String>,
}

impl SessionContext {
    pub fn for_user(username: impl Into<String>) -> Self {
        SessionContext {
            logged_in: true,
            username: Some(username.into()),
        }
    }

    /// Missing file means nobody is logged in.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn clear(path: &Path) -> Result<()> {
        match std::fs::remove_file(path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    /// Gate for pages that need an account.
    pub fn require_login(&self) -> Result<&str> {
        match (&self.username, self.logged_in) {
            (Some(name), true) => Ok(name.as_str()),
            _ => Err(Error::AuthFailure("Please log in first".to_string())),
        }
    }

    pub fn username_or_guest(&self) -> &str {
        self.require_login().unwrap_or(GUEST)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct UserRow {
    username: String,
    salt: String,
    password_hash: String,
}

#[derive(Debug, Deserialize)]
struct BackendError {
    message: String,
}

fn hash_password(password: &str, salt: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

fn new_row(username: &str, password: &str) -> UserRow {
    let mut salt = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt);
    UserRow {
        username: username.to_string(),
        salt: general_purpose::STANDARD.encode(salt),
        password_hash: general_purpose::STANDARD.encode(hash_password(password, &salt)),
    }
}

fn verify(row: &UserRow, password: &str) -> bool {
    let (Ok(salt), Ok(expected)) = (
        general_purpose::STANDARD.decode(&row.salt),
        general_purpose::STANDARD.decode(&row.password_hash),
    ) else {
        warn!("Stored credentials for {} are not valid base64", row.username);
        return false;
    };
    hash_password(password, &salt).as_slice() == expected.as_slice()
}

fn credentials<'a>(username: &'a str, password: &'a str) -> Result<(&'a str, &'a str)> {
    let (username, password) = (username.trim(), password.trim());
    if username.is_empty() || password.is_empty() {
        return Err(Error::AuthFailure(
            "Username and password are required".to_string(),
        ));
    }
    Ok((username, password))
}

/// PostgREST-style client for the users table.
pub struct AuthClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl AuthClient {
    pub fn new(url: &str, api_key: Option<String>, table: &str) -> Self {
        AuthClient {
            client: reqwest::Client::new(),
            endpoint: format!("{}/rest/v1/{}", url.trim_end_matches('/'), table),
            api_key,
        }
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header("apikey", key).bearer_auth(key),
            None => builder,
        }
    }

    pub async fn register(&self, username: &str, password: &str, confirm: &str) -> Result<()> {
        if password != confirm {
            return Err(Error::AuthFailure("Passwords do not match".to_string()));
        }
        let (username, password) = credentials(username, password)?;

        let response = self
            .request(self.client.post(&self.endpoint))
            .header("Prefer", "return=minimal")
            .json(&[new_row(username, password)])
            .send()
            .await
            .map_err(|e| Error::AuthFailure(format!("Error: {}", e)))?;

        match response.status() {
            status if status.is_success() => {
                info!("Registered {}", username);
                Ok(())
            }
            StatusCode::CONFLICT => Err(Error::AuthFailure(
                "Error: username already taken".to_string(),
            )),
            status => Err(backend_failure(status, response).await),
        }
    }

    /// Returns the context to persist on success.
    pub async fn login(&self, username: &str, password: &str) -> Result<SessionContext> {
        let (username, password) = credentials(username, password)?;

        let response = self
            .request(self.client.get(&self.endpoint))
            .query(&[
                ("username", format!("eq.{}", username)),
                ("select", "username,salt,password_hash".to_string()),
            ])
            .send()
            .await
            .map_err(|e| Error::AuthFailure(format!("Error: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(backend_failure(status, response).await);
        }
        let rows: Vec<UserRow> = response
            .json()
            .await
            .map_err(|e| Error::AuthFailure(format!("Error: {}", e)))?;

        match rows.iter().find(|row| verify(row, password)) {
            Some(row) => {
                info!("Welcome, {}!", row.username);
                Ok(SessionContext::for_user(row.username.clone()))
            }
            None => Err(Error::AuthFailure(INVALID_CREDENTIALS.to_string())),
        }
    }
}

async fn backend_failure(status: StatusCode, response: reqwest::Response) -> Error {
    let message = match response.json::<BackendError>().await {
        Ok(body) => body.message,
        Err(_) => status.to_string(),
    };
    Error::AuthFailure(format!("Error: {}", message))
}
