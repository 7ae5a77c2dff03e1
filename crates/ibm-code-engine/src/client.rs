//! A client for the Code Engine v2 REST API

use std::{sync::Arc, time::Duration};

use backon::{ExponentialBuilder, Retryable};
use error_stack::{Report, ResultExt};
use reqwest::{header::ACCEPT, Method};
use serde::{Deserialize, Serialize};
use tracing::{event, instrument, Level};
use url::Url;

use crate::{auth::IamAuthenticator, CodeEngineError};

/// The Code Engine API endpoint for a region, e.g. `us-south`.
pub fn service_url(region: &str) -> String {
    format!("https://api.{region}.codeengine.cloud.ibm.com/v2")
}

/// Whether to verify TLS certificates when talking to IBM Cloud.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsVerification {
    #[default]
    Enabled,
    /// Accept any certificate. Only use this when something between you and IBM Cloud
    /// intercepts TLS.
    Disabled,
}

/// Build the HTTP client shared by the IAM authenticator and the Code Engine client.
pub fn build_http_client(tls: TlsVerification) -> Result<reqwest::Client, Report<CodeEngineError>> {
    let mut builder = reqwest::Client::builder()
        .timeout(Duration::from_secs(60))
        .user_agent(concat!("stratus-ibm-code-engine/", env!("CARGO_PKG_VERSION")));

    if tls == TlsVerification::Disabled {
        event!(
            Level::WARN,
            "TLS certificate verification is DISABLED for IBM Cloud IAM and Code Engine requests"
        );
        builder = builder.danger_accept_invalid_certs(true);
    }

    builder.build().change_context(CodeEngineError::ClientSetup)
}

/// The status of a Code Engine app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppStatus {
    Ready,
    Deploying,
    Warning,
    Failed,
    #[serde(other)]
    Unknown,
}

/// A Code Engine app, as returned by the API. Only the fields used here are parsed.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct App {
    pub name: String,
    #[serde(default)]
    pub status: Option<AppStatus>,
    /// The public URL of the app.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// The URL of the app inside the project's network.
    #[serde(default)]
    pub endpoint_internal: Option<String>,
    #[serde(default)]
    pub status_details: Option<serde_json::Value>,
}

/// The body of a create-app request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
pub struct AppPrototype {
    pub image_reference: String,
    pub name: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub run_commands: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub run_arguments: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale_min_instances: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale_max_instances: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale_cpu_limit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale_memory_limit: Option<String>,
}

/// The Code Engine operations needed to manage the app behind an instance.
#[async_trait::async_trait]
pub trait CodeEngineApi: Send + Sync {
    async fn create_app(
        &self,
        project_id: &str,
        app: &AppPrototype,
    ) -> Result<App, Report<CodeEngineError>>;

    async fn get_app(&self, project_id: &str, name: &str) -> Result<App, Report<CodeEngineError>>;

    async fn delete_app(&self, project_id: &str, name: &str) -> Result<(), Report<CodeEngineError>>;
}

/// Turn an unsuccessful HTTP response into an error containing the response body.
pub(crate) async fn check_response(
    response: reqwest::Response,
) -> Result<reqwest::Response, Report<CodeEngineError>> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(Report::new(CodeEngineError::Status {
        status: status.as_u16(),
        body,
    }))
}

/// A [CodeEngineApi] implementation that talks to the real service.
#[derive(Clone)]
pub struct CodeEngineClient {
    http: reqwest::Client,
    service_url: Url,
    authenticator: Arc<IamAuthenticator>,
    throttle_backoff: ExponentialBuilder,
}

impl std::fmt::Debug for CodeEngineClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeEngineClient")
            .field("service_url", &self.service_url.as_str())
            .field("authenticator", &self.authenticator)
            .finish()
    }
}

impl CodeEngineClient {
    pub fn new(
        http: reqwest::Client,
        service_url: &str,
        authenticator: Arc<IamAuthenticator>,
    ) -> Result<Self, Report<CodeEngineError>> {
        let service_url = Url::parse(service_url)
            .change_context(CodeEngineError::ClientSetup)
            .attach_printable_lazy(|| format!("Invalid service URL {service_url}"))?;

        if service_url.cannot_be_a_base() {
            return Err(Report::new(CodeEngineError::ClientSetup))
                .attach_printable(format!("Invalid service URL {service_url}"));
        }

        Ok(Self {
            http,
            service_url,
            authenticator,
            // Rate-limited requests are retried. Other failures are returned to the caller.
            throttle_backoff: ExponentialBuilder::default()
                .with_min_delay(Duration::from_secs(2))
                .with_max_delay(Duration::from_secs(20))
                .with_max_times(5),
        })
    }

    /// Replace the backoff used to retry rate-limited requests.
    pub fn with_throttle_backoff(mut self, backoff: ExponentialBuilder) -> Self {
        self.throttle_backoff = backoff;
        self
    }

    pub fn service_url(&self) -> &str {
        self.service_url.as_str()
    }

    fn apps_url(&self, project_id: &str, name: Option<&str>) -> Url {
        let mut url = self.service_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend(["projects", project_id, "apps"]);
            if let Some(name) = name {
                segments.push(name);
            }
        }
        url
    }

    async fn send<BODY: Serialize + Sync>(
        &self,
        method: Method,
        url: Url,
        body: Option<&BODY>,
    ) -> Result<reqwest::Response, Report<CodeEngineError>> {
        let method = &method;
        let url = &url;

        (|| async move {
            let token = self.authenticator.token().await?;

            let mut request = self
                .http
                .request(method.clone(), url.clone())
                .bearer_auth(token)
                .header(ACCEPT, "application/json");
            if let Some(body) = body {
                request = request.json(body);
            }

            let response = request
                .send()
                .await
                .change_context(CodeEngineError::Request)
                .attach_printable_lazy(|| format!("{method} {url}"))?;

            check_response(response)
                .await
                .attach_printable_lazy(|| format!("{method} {url}"))
        })
        .retry(&self.throttle_backoff)
        .when(|e| e.current_context().status() == Some(429))
        .notify(|_, delay| {
            event!(Level::WARN, %method, %url, ?delay, "Rate limited by Code Engine, retrying");
        })
        .await
    }
}

#[async_trait::async_trait]
impl CodeEngineApi for CodeEngineClient {
    #[instrument(level = "debug", skip(self, app), fields(name = %app.name))]
    async fn create_app(
        &self,
        project_id: &str,
        app: &AppPrototype,
    ) -> Result<App, Report<CodeEngineError>> {
        let url = self.apps_url(project_id, None);
        let response = self.send(Method::POST, url, Some(app)).await?;
        response
            .json::<App>()
            .await
            .change_context(CodeEngineError::Decode)
    }

    #[instrument(level = "debug", skip(self))]
    async fn get_app(&self, project_id: &str, name: &str) -> Result<App, Report<CodeEngineError>> {
        let url = self.apps_url(project_id, Some(name));
        let response = self.send(Method::GET, url, None::<&()>).await?;
        response
            .json::<App>()
            .await
            .change_context(CodeEngineError::Decode)
    }

    #[instrument(level = "debug", skip(self))]
    async fn delete_app(&self, project_id: &str, name: &str) -> Result<(), Report<CodeEngineError>> {
        let url = self.apps_url(project_id, Some(name));
        self.send(Method::DELETE, url, None::<&()>).await?;
        Ok(())
    }
}
