//! Provision a single Code Engine app to back a scheduler or worker.

use std::sync::Arc;

use backon::Retryable;
use error_stack::{Report, ResultExt};
use stratus_vm_cluster::{
    ClusterHandle, Endpoints, ProvisionError, ProvisionErrorKind, VmInterface,
};
use tracing::{event, instrument, Level};

use crate::{App, AppPrototype, AppStatus, CodeEngineApi, PollPolicy};

/// Settings shared by every instance in a cluster.
#[derive(Clone)]
pub struct InstanceOptions {
    /// The cluster that owns the instance.
    pub cluster: ClusterHandle,
    pub api: Arc<dyn CodeEngineApi>,
    /// The container image to run.
    pub image: String,
    pub region: String,
    pub project_id: String,
    pub poll: PollPolicy,
}

impl std::fmt::Debug for InstanceOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceOptions")
            .field("cluster", &self.cluster.name())
            .field("image", &self.image)
            .field("region", &self.region)
            .field("project_id", &self.project_id)
            .field("poll", &self.poll)
            .finish()
    }
}

impl PartialEq for InstanceOptions {
    fn eq(&self, other: &Self) -> bool {
        self.cluster.same_cluster(&other.cluster)
            && Arc::ptr_eq(&self.api, &other.api)
            && self.image == other.image
            && self.region == other.region
            && self.project_id == other.project_id
            && self.poll == other.poll
    }
}

/// Remove the scheme from a URL, returning everything after the first `//`.
pub fn strip_scheme(url: &str) -> Option<&str> {
    url.split("//").nth(1)
}

/// A Code Engine app that runs one scheduler or worker process.
pub struct CodeEngineInstance {
    options: InstanceOptions,
    name: String,
    port: u16,
    run_commands: Vec<String>,
    run_arguments: Vec<String>,
}

impl std::fmt::Debug for CodeEngineInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeEngineInstance")
            .field("name", &self.name)
            .field("port", &self.port)
            .field("options", &self.options)
            .finish()
    }
}

impl CodeEngineInstance {
    /// Create an instance that will run `run_commands` with `run_arguments` in an app called
    /// `name`, exposing `port`.
    pub fn new(
        options: InstanceOptions,
        name: impl Into<String>,
        port: u16,
        run_commands: Vec<String>,
        run_arguments: Vec<String>,
    ) -> Self {
        Self {
            options,
            name: name.into(),
            port,
            run_commands,
            run_arguments,
        }
    }

    pub fn options(&self) -> &InstanceOptions {
        &self.options
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The create request for this instance's app.
    pub fn prototype(&self) -> AppPrototype {
        AppPrototype {
            image_reference: self.options.image.clone(),
            name: self.name.clone(),
            run_commands: self.run_commands.clone(),
            run_arguments: self.run_arguments.clone(),
            image_port: Some(self.port),
            ..Default::default()
        }
    }

    fn error(&self, kind: ProvisionErrorKind) -> ProvisionError {
        ProvisionError::new(&self.name, kind)
    }

    #[instrument(level = "debug", skip(self), fields(name = %self.name))]
    async fn create_vm(&self) -> Result<Endpoints, Report<ProvisionError>> {
        event!(Level::INFO, name = %self.name, image = %self.options.image, "Creating Code Engine app");
        self.options
            .api
            .create_app(&self.options.project_id, &self.prototype())
            .await
            .change_context(self.error(ProvisionErrorKind::Create))
            .attach_printable_lazy(|| format!("Project {}", self.options.project_id))?;

        let app = self.wait_until_ready().await?;
        event!(Level::INFO, name = %self.name, endpoint = ?app.endpoint, "Code Engine app is ready");
        self.endpoints(&app)
    }

    async fn destroy_vm(&self) -> Result<(), Report<ProvisionError>> {
        event!(Level::INFO, name = %self.name, "Deleting Code Engine app");
        self.options
            .api
            .delete_app(&self.options.project_id, &self.name)
            .await
            .change_context(self.error(ProvisionErrorKind::Delete))
            .attach_printable_lazy(|| format!("Project {}", self.options.project_id))
    }

    /// Check the app's status until it is ready, backing off between checks.
    async fn wait_until_ready(&self) -> Result<App, Report<ProvisionError>> {
        let poll = &self.options.poll;
        let checks = (|| self.check_ready())
            .retry(&poll.backoff())
            .when(|e| e.current_context().kind == ProvisionErrorKind::NotReady)
            .notify(|_, delay| {
                event!(Level::DEBUG, name = %self.name, ?delay, "App is not ready yet");
            });

        match tokio::time::timeout(poll.timeout, checks).await {
            Ok(Ok(app)) => Ok(app),
            Ok(Err(e)) if e.current_context().kind == ProvisionErrorKind::NotReady => {
                Err(e.change_context(self.error(ProvisionErrorKind::TimedOut)))
                    .attach_printable("Exceeded the maximum number of status checks")
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Report::new(self.error(ProvisionErrorKind::TimedOut)))
                .attach_printable(format!("App was not ready after {:?}", poll.timeout)),
        }
    }

    async fn check_ready(&self) -> Result<App, Report<ProvisionError>> {
        let app = match self
            .options
            .api
            .get_app(&self.options.project_id, &self.name)
            .await
        {
            Ok(app) => app,
            // A new app can briefly be missing right after it was created, so treat this the
            // same as not ready.
            Err(e) if e.current_context().status() == Some(404) => {
                return Err(e.change_context(self.error(ProvisionErrorKind::NotReady)));
            }
            Err(e) => return Err(e.change_context(self.error(ProvisionErrorKind::Status))),
        };

        match app.status {
            Some(AppStatus::Ready) => Ok(app),
            Some(AppStatus::Failed) => Err(Report::new(self.error(ProvisionErrorKind::Failed)))
                .attach_printable(format!(
                    "Status details: {}",
                    app.status_details
                        .as_ref()
                        .map(|d| d.to_string())
                        .unwrap_or_else(|| "unknown".to_string())
                )),
            status => Err(Report::new(self.error(ProvisionErrorKind::NotReady)))
                .attach_printable(format!("App status {status:?}")),
        }
    }

    fn endpoints(&self, app: &App) -> Result<Endpoints, Report<ProvisionError>> {
        let parse = |label: &str, url: Option<&str>| {
            url.and_then(strip_scheme)
                .map(String::from)
                .ok_or_else(|| Report::new(self.error(ProvisionErrorKind::MalformedEndpoint)))
                .attach_printable_lazy(|| format!("{label}: {url:?}"))
        };

        Ok(Endpoints {
            internal: parse("endpoint_internal", app.endpoint_internal.as_deref())?,
            external: parse("endpoint", app.endpoint.as_deref())?,
        })
    }
}

#[async_trait::async_trait]
impl VmInterface for CodeEngineInstance {
    fn name(&self) -> &str {
        &self.name
    }

    fn describe(&self) -> Vec<(&'static str, String)> {
        vec![
            ("Source Image", self.options.image.clone()),
            ("Region", self.options.region.clone()),
            ("Project id", self.options.project_id.clone()),
        ]
    }

    async fn acquire(&mut self) -> Result<Endpoints, Report<ProvisionError>> {
        self.create_vm().await
    }

    async fn release(&mut self) -> Result<(), Report<ProvisionError>> {
        self.destroy_vm().await
    }
}
