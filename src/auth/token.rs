//! Two-step token exchange against the auth server
//!
//! 1. `GET {server}/challenge?login={user}` returns `{"challenge": ...}`
//! 2. `POST {server}/login` with `{"login": user, "challenge": response}`
//!    returns `{"token": ...}`
//!
//! The response is `UPPER(hex(sha512("{challenge}-{user}-{pwd_hash}")))` with
//! `pwd_hash = UPPER(hex(sha512(password)))`.

use crate::config::Credentials;
use crate::error::sanitize_error_message;
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha512};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Token fetch failures
#[derive(Debug, Error, PartialEq)]
pub enum TokenError {
    #[error("username, password and auth server are all required")]
    MissingCredentials,
    #[error("challenge request failed: {0}")]
    Challenge(String),
    #[error("login request failed: {0}")]
    Login(String),
    #[error("HTTP client unavailable: {0}")]
    HttpClient(String),
}

/// Anything able to trade credentials for a broker token
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch(&self, credentials: &Credentials) -> Result<String, TokenError>;
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    login: &'a str,
    challenge: &'a str,
}

/// HTTP implementation of the challenge/response exchange
#[derive(Debug, Clone)]
pub struct TokenFetcher {
    client: Client,
}

impl TokenFetcher {
    pub fn new(timeout: Duration) -> Result<Self, TokenError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TokenError::HttpClient(e.to_string()))?;

        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    /// Run the full exchange, failing fast when any input is empty
    pub async fn fetch_token(
        &self,
        username: &str,
        password: &str,
        auth_server: &str,
    ) -> Result<String, TokenError> {
        if username.is_empty() || password.is_empty() || auth_server.is_empty() {
            return Err(TokenError::MissingCredentials);
        }

        let server = auth_server.trim_end_matches('/');
        let challenge = self.request_challenge(server, username).await?;
        let response = challenge_response(&challenge, username, password);
        let token = self.login(server, username, &response).await?;

        debug!(username, server, "Fetched broker token");
        Ok(token)
    }

    async fn request_challenge(&self, server: &str, username: &str) -> Result<String, TokenError> {
        let body = self
            .client
            .get(format!("{server}/challenge"))
            .query(&[("login", username)])
            .send()
            .await
            .map_err(|e| TokenError::Challenge(e.to_string()))?
            .text()
            .await
            .map_err(|e| TokenError::Challenge(e.to_string()))?;

        required_field(&body, "challenge").map_err(TokenError::Challenge)
    }

    async fn login(&self, server: &str, username: &str, response: &str) -> Result<String, TokenError> {
        let body = self
            .client
            .post(format!("{server}/login"))
            .json(&LoginRequest {
                login: username,
                challenge: response,
            })
            .send()
            .await
            .map_err(|e| TokenError::Login(e.to_string()))?
            .text()
            .await
            .map_err(|e| TokenError::Login(e.to_string()))?;

        required_field(&body, "token").map_err(TokenError::Login)
    }
}

#[async_trait]
impl TokenSource for TokenFetcher {
    async fn fetch(&self, credentials: &Credentials) -> Result<String, TokenError> {
        let result = self
            .fetch_token(
                &credentials.username,
                &credentials.password,
                &credentials.auth_server,
            )
            .await;

        if let Err(e) = &result {
            warn!(
                username = %credentials.username,
                error = %sanitize_error_message(&e.to_string()),
                "Token fetch failed, connecting without a token"
            );
        }
        result
    }
}

/// Extract a non-empty string (or number) field from a JSON body (pure function)
fn required_field(body: &str, field: &str) -> Result<String, String> {
    let json: Value =
        serde_json::from_str(body).map_err(|e| format!("response is not JSON: {e}"))?;

    match json.get(field) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(format!("response has no `{field}` field")),
    }
}

fn sha512_upper_hex(input: &str) -> String {
    let mut hasher = Sha512::new();
    hasher.update(input.as_bytes());
    hex::encode_upper(hasher.finalize())
}

/// `UPPER(hex(sha512(password)))`
pub fn password_hash(password: &str) -> String {
    sha512_upper_hex(password)
}

/// Answer to an auth server challenge for the given user
pub fn challenge_response(challenge: &str, username: &str, password: &str) -> String {
    sha512_upper_hex(&format!(
        "{challenge}-{username}-{}",
        password_hash(password)
    ))
}
