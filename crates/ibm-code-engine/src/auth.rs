//! API key authentication against IBM Cloud IAM.

use std::time::Duration;

use error_stack::{Report, ResultExt};
use reqwest::header::ACCEPT;
use serde::Deserialize;
use tokio::{sync::Mutex, time::Instant};
use tracing::{event, instrument, Level};

use crate::{client::check_response, CodeEngineError};

pub const DEFAULT_IAM_URL: &str = "https://iam.cloud.ibm.com";
const API_KEY_GRANT_TYPE: &str = "urn:ibm:params:oauth:grant-type:apikey";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    /// Lifetime of the token in seconds.
    expires_in: u64,
}

#[derive(Debug)]
struct CachedToken {
    token: String,
    refresh_at: Instant,
}

/// Tokens are refreshed once this fraction of their lifetime has passed.
fn refresh_at(issued: Instant, expires_in: u64) -> Instant {
    issued + Duration::from_secs(expires_in) * 4 / 5
}

/// Exchanges an API key for IAM bearer tokens, caching each token until it is close to
/// expiring.
pub struct IamAuthenticator {
    http: reqwest::Client,
    url: String,
    api_key: String,
    token: Mutex<Option<CachedToken>>,
}

impl std::fmt::Debug for IamAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IamAuthenticator")
            .field("url", &self.url)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

impl IamAuthenticator {
    pub fn new(http: reqwest::Client, url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
            api_key: api_key.into(),
            token: Mutex::new(None),
        }
    }

    /// Return a valid bearer token, requesting a new one if needed.
    pub async fn token(&self) -> Result<String, Report<CodeEngineError>> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(token.token.clone());
            }
        }

        let issued = Instant::now();
        let response = self.request_token().await?;
        let token = response.access_token.clone();
        *cached = Some(CachedToken {
            token: response.access_token,
            refresh_at: refresh_at(issued, response.expires_in),
        });

        Ok(token)
    }

    #[instrument(level = "debug", skip(self), fields(url = %self.url))]
    async fn request_token(&self) -> Result<TokenResponse, Report<CodeEngineError>> {
        let url = format!("{}/identity/token", self.url.trim_end_matches('/'));
        event!(Level::DEBUG, "Requesting IAM token");

        let response = self
            .http
            .post(&url)
            .header(ACCEPT, "application/json")
            .form(&[
                ("grant_type", API_KEY_GRANT_TYPE),
                ("apikey", self.api_key.as_str()),
            ])
            .send()
            .await
            .change_context(CodeEngineError::Request)
            .change_context(CodeEngineError::Authentication)
            .attach_printable_lazy(|| format!("POST {url}"))?;

        let response = check_response(response)
            .await
            .change_context(CodeEngineError::Authentication)?;

        response
            .json::<TokenResponse>()
            .await
            .change_context(CodeEngineError::Decode)
            .change_context(CodeEngineError::Authentication)
    }
}
