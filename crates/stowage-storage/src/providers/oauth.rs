//! OAuth 2.0 access-token management for the HTTP API providers.
//!
//! The access token is refreshed ahead of its expiry and once more when a
//! request comes back `401`. A refreshed token is kept so the manager can
//! persist it after the step.

use bytes::Bytes;
use chrono::{Duration as ChronoDuration, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;

use stowage_entity::storage::OAuthToken;

use super::http::transport_error;
use crate::client::{TransferError, TransferResult};

/// Refresh when the token expires within this margin.
const REFRESH_MARGIN_SECONDS: i64 = 300;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct TokenError {
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_description: String,
}

/// Access-token holder for one invocation.
#[derive(Debug, Clone)]
pub struct OAuthSession {
    http: Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    token: OAuthToken,
    refreshed: bool,
}

impl OAuthSession {
    /// Create a session from stored credentials.
    pub fn new(
        http: Client,
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        token: OAuthToken,
    ) -> Self {
        Self {
            http,
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            token,
            refreshed: false,
        }
    }

    /// The HTTP client shared with the provider.
    pub fn http(&self) -> &Client {
        &self.http
    }

    /// The token minted during this session, if a refresh happened.
    pub fn refreshed_token(&self) -> Option<OAuthToken> {
        self.refreshed.then(|| self.token.clone())
    }

    /// A usable access token, refreshing first if it is about to expire.
    pub async fn access_token(&mut self) -> TransferResult<String> {
        if self
            .token
            .needs_refresh(ChronoDuration::seconds(REFRESH_MARGIN_SECONDS))
            && !self.token.refresh_token.is_empty()
        {
            self.refresh().await?;
        }
        if self.token.access_token.is_empty() {
            return Err(TransferError::fatal("Storage is not authorized"));
        }
        Ok(self.token.access_token.clone())
    }

    /// Exchange the refresh token for a new access token.
    pub async fn refresh(&mut self) -> TransferResult<()> {
        if self.token.refresh_token.is_empty() {
            return Err(TransferError::fatal(
                "Access token rejected and no refresh token is stored",
            ));
        }

        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", self.token.refresh_token.as_str()),
        ];
        if !self.client_id.is_empty() {
            form.push(("client_id", self.client_id.as_str()));
        }
        if !self.client_secret.is_empty() {
            form.push(("client_secret", self.client_secret.as_str()));
        }

        let response = self
            .http
            .post(&self.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| transport_error("Token refresh", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let parsed: Option<TokenError> = serde_json::from_str(&body).ok();
            return Err(match parsed {
                Some(err) if err.error == "invalid_grant" || err.error == "invalid_client" => {
                    TransferError::fatal(format!(
                        "Authorization revoked ({}): {}",
                        err.error, err.error_description
                    ))
                }
                _ if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS => {
                    TransferError::recoverable(format!("Token refresh: HTTP {status}"))
                }
                _ => TransferError::fatal(format!("Token refresh: HTTP {status}: {body}")),
            });
        }

        let fresh: TokenResponse = response
            .json()
            .await
            .map_err(|e| transport_error("Token refresh response", e))?;
        self.token.access_token = fresh.access_token;
        if let Some(refresh_token) = fresh.refresh_token.filter(|t| !t.is_empty()) {
            self.token.refresh_token = refresh_token;
        }
        self.token.expires_at = fresh
            .expires_in
            .map(|secs| Utc::now() + ChronoDuration::seconds(secs));
        self.refreshed = true;
        tracing::info!(token_url = %self.token_url, "Refreshed OAuth access token");
        Ok(())
    }

    /// Send an authorized request, refreshing and retrying once on `401`.
    ///
    /// `build` is called again for the retry, so it must be repeatable.
    pub async fn send<F>(&mut self, context: &str, build: F) -> TransferResult<Response>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let token = self.access_token().await?;
        let response = build(&self.http)
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|e| transport_error(context, e))?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        tracing::debug!(context, "Access token rejected, refreshing");
        self.refresh().await?;
        let token = self.token.access_token.clone();
        let response = build(&self.http)
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|e| transport_error(context, e))?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(TransferError::fatal(format!(
                "{context}: access token rejected after refresh"
            )));
        }
        Ok(response)
    }

    /// [`OAuthSession::send`] with a body that is cloned per attempt.
    pub async fn send_body<F>(
        &mut self,
        context: &str,
        body: Bytes,
        build: F,
    ) -> TransferResult<Response>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        self.send(context, |http| build(http).body(body.clone()))
            .await
    }
}
