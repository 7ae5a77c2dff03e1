//! Assemble a cluster of Code Engine apps from configuration and explicit arguments.

use std::sync::Arc;

use error_stack::Report;
use rand::Rng;
use stratus_vm_cluster::{
    CancelHandle, ClusterError, ClusterHandle, InstanceFactory, PublishedScheduler,
    SchedulerProbe, SchedulerRole, VmCluster, WorkerRole,
};
use tracing::{event, Level};

use crate::{
    CodeEngineApi, CodeEngineInstance, CodeEngineScheduler, CodeEngineWorker, ConfigError,
    IbmConfig, InstanceOptions,
};

/// Generate a cluster name like `stratus-1a2b3c4d`.
pub fn generate_cluster_name() -> String {
    format!("stratus-{:08x}", rand::thread_rng().gen::<u32>())
}

/// App names are derived from the cluster name, so it has to be a valid prefix for one: lowercase
/// letters, digits and hyphens, starting with a letter, with room left for the worker suffix.
fn validate_cluster_name(name: &str) -> Result<(), Report<ConfigError>> {
    let valid = !name.is_empty()
        && name.len() <= 40
        && name.starts_with(|c: char| c.is_ascii_lowercase())
        && !name.ends_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');

    if valid {
        Ok(())
    } else {
        Err(Report::new(ConfigError::InvalidName(name.to_string())))
    }
}

/// Builds the scheduler and worker roles of a [CodeEngineCluster].
#[derive(Clone)]
pub struct CodeEngineFactory {
    pub scheduler_options: InstanceOptions,
    pub worker_options: InstanceOptions,
    pub probe: Arc<dyn SchedulerProbe>,
    pub scheduler_command: Vec<String>,
    pub worker_command: Vec<String>,
    pub scheduler_port: u16,
    pub worker_port: u16,
    pub external_port: u16,
}

impl std::fmt::Debug for CodeEngineFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeEngineFactory")
            .field("scheduler_options", &self.scheduler_options)
            .field("worker_options", &self.worker_options)
            .field("scheduler_command", &self.scheduler_command)
            .field("worker_command", &self.worker_command)
            .field("scheduler_port", &self.scheduler_port)
            .field("worker_port", &self.worker_port)
            .field("external_port", &self.external_port)
            .finish()
    }
}

impl InstanceFactory for CodeEngineFactory {
    type Scheduler = CodeEngineInstance;
    type Worker = CodeEngineInstance;

    fn scheduler(&self, cluster: &ClusterHandle) -> Result<CodeEngineScheduler, Report<ClusterError>> {
        let vm = CodeEngineInstance::new(
            self.scheduler_options.clone(),
            format!("{}-scheduler", cluster.name()),
            self.scheduler_port,
            self.scheduler_command.clone(),
            Vec::new(),
        );

        Ok(
            SchedulerRole::new(vm, cluster.clone(), self.probe.clone(), self.scheduler_port)
                .with_external_port(self.external_port),
        )
    }

    fn worker(
        &self,
        cluster: &ClusterHandle,
        ordinal: usize,
    ) -> Result<CodeEngineWorker, Report<ClusterError>> {
        let scheduler = cluster
            .scheduler_internal_address()
            .ok_or_else(|| Report::new(ClusterError::SchedulerNotPublished))?;

        let vm = CodeEngineInstance::new(
            self.worker_options.clone(),
            format!("{}-worker-{ordinal}", cluster.name()),
            self.worker_port,
            self.worker_command.clone(),
            vec![scheduler],
        );

        Ok(WorkerRole::new(vm, cluster.clone()))
    }
}

/// Collects the settings for a [CodeEngineCluster]. Anything not set explicitly is read from
/// the `cloudprovider.ibm` configuration.
pub struct CodeEngineClusterBuilder {
    config: IbmConfig,
    name: Option<String>,
    image: Option<String>,
    region: Option<String>,
    project_id: Option<String>,
    n_workers: Option<usize>,
    debug: bool,
    api: Option<Arc<dyn CodeEngineApi>>,
    probe: Option<Arc<dyn SchedulerProbe>>,
}

impl CodeEngineClusterBuilder {
    pub fn new(config: IbmConfig) -> Self {
        Self {
            config,
            name: None,
            image: None,
            region: None,
            project_id: None,
            n_workers: None,
            debug: false,
            api: None,
            probe: None,
        }
    }

    /// Use this cluster name instead of generating one.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn project_id(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn n_workers(mut self, n_workers: usize) -> Self {
        self.n_workers = Some(n_workers);
        self
    }

    /// Emit the cluster's lifecycle messages at INFO instead of DEBUG.
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Use this client instead of one authenticated with the configured API key.
    pub fn api_client(mut self, api: Arc<dyn CodeEngineApi>) -> Self {
        self.api = Some(api);
        self
    }

    /// Use this probe instead of connecting to the scheduler over TCP.
    pub fn probe(mut self, probe: Arc<dyn SchedulerProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn build(self) -> Result<CodeEngineCluster, Report<ConfigError>> {
        let config = self.config;
        let image = self
            .image
            .or_else(|| config.image.clone())
            .ok_or_else(|| Report::new(ConfigError::Missing("image")))?;
        let region = self
            .region
            .or_else(|| config.region.clone())
            .ok_or_else(|| Report::new(ConfigError::Missing("region")))?;
        let project_id = self
            .project_id
            .or_else(|| config.project_id.clone())
            .ok_or_else(|| Report::new(ConfigError::Missing("project_id")))?;
        let n_workers = self.n_workers.unwrap_or(config.n_workers);

        let name = match self.name {
            Some(name) => {
                validate_cluster_name(&name)?;
                name
            }
            None => generate_cluster_name(),
        };

        let api: Arc<dyn CodeEngineApi> = match self.api {
            Some(api) => api,
            None => config.api_client(&region)?,
        };
        let probe: Arc<dyn SchedulerProbe> = match self.probe {
            Some(probe) => probe,
            None => Arc::new(config.probe()?),
        };
        let poll = config.poll_policy()?;

        let cluster = ClusterHandle::new(name, config.protocol.as_str(), self.debug);
        let options = InstanceOptions {
            cluster: cluster.clone(),
            api,
            image,
            region,
            project_id,
            poll,
        };

        event!(Level::DEBUG, cluster = %cluster.name(), ?options, n_workers, "Created cluster");

        let factory = CodeEngineFactory {
            scheduler_options: options.clone(),
            worker_options: options,
            probe,
            scheduler_command: config.scheduler_command,
            worker_command: config.worker_command,
            scheduler_port: config.scheduler_port,
            worker_port: config.worker_port,
            external_port: config.external_port,
        };

        Ok(CodeEngineCluster {
            inner: VmCluster::new(factory, cluster, n_workers),
        })
    }
}

/// A cluster with one scheduler and a set of workers, each running in its own Code Engine app.
pub struct CodeEngineCluster {
    inner: VmCluster<CodeEngineFactory>,
}

impl std::fmt::Debug for CodeEngineCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeEngineCluster")
            .field("factory", self.inner.factory())
            .finish_non_exhaustive()
    }
}

impl CodeEngineCluster {
    pub fn builder(config: IbmConfig) -> CodeEngineClusterBuilder {
        CodeEngineClusterBuilder::new(config)
    }

    pub fn name(&self) -> String {
        self.inner.cluster().name()
    }

    pub fn handle(&self) -> &ClusterHandle {
        self.inner.cluster()
    }

    /// Settings for the scheduler app.
    pub fn scheduler_options(&self) -> &InstanceOptions {
        &self.inner.factory().scheduler_options
    }

    /// Settings for the worker apps. Changes only apply to workers started afterwards.
    pub fn worker_options(&self) -> &InstanceOptions {
        &self.inner.factory().worker_options
    }

    pub fn scheduler_options_mut(&mut self) -> &mut InstanceOptions {
        &mut self.inner.factory_mut().scheduler_options
    }

    pub fn worker_options_mut(&mut self) -> &mut InstanceOptions {
        &mut self.inner.factory_mut().worker_options
    }

    pub fn scheduler(&self) -> Option<&CodeEngineScheduler> {
        self.inner.scheduler()
    }

    pub fn workers(&self) -> &[CodeEngineWorker] {
        self.inner.workers()
    }

    /// The externally reachable scheduler address, once it has started.
    pub fn scheduler_address(&self) -> Option<String> {
        self.inner.scheduler_address()
    }

    pub fn published_scheduler(&self) -> Option<PublishedScheduler> {
        self.inner.published_scheduler()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.inner.cancel_handle()
    }

    pub async fn start(&mut self) -> Result<(), Report<ClusterError>> {
        self.inner.start().await
    }

    pub async fn scale(&mut self, n: usize) -> Result<(), Report<ClusterError>> {
        self.inner.scale(n).await
    }

    pub async fn close(&mut self) -> Result<(), Report<ClusterError>> {
        self.inner.close().await
    }
}
