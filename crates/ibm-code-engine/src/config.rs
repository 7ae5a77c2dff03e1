//! The `cloudprovider.ibm` configuration namespace.
//!
//! Values are read from a TOML file with a `[cloudprovider.ibm]` table and then overridden by
//! environment variables named `STRATUS_CLOUDPROVIDER__IBM__<KEY>`, e.g.
//! `STRATUS_CLOUDPROVIDER__IBM__API_KEY`.

use std::{
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use error_stack::{Report, ResultExt};
use serde::Deserialize;
use stratus_vm_cluster::{TcpProbe, DEFAULT_EXTERNAL_PORT};
use tracing::{event, Level};

use crate::{
    auth::{IamAuthenticator, DEFAULT_IAM_URL},
    client::{build_http_client, service_url, TlsVerification},
    CodeEngineClient, ConfigError, PollPolicy,
};

/// Points to a configuration file to use instead of the default location.
pub const CONFIG_PATH_VAR: &str = "STRATUS_CONFIG";
const ENV_PREFIX: &str = "STRATUS_CLOUDPROVIDER__IBM__";

#[derive(Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct IbmConfig {
    pub image: Option<String>,
    pub region: Option<String>,
    pub project_id: Option<String>,
    pub api_key: Option<String>,
    /// The command that runs the scheduler process.
    pub scheduler_command: Vec<String>,
    /// The command that runs a worker process. The scheduler address is passed as its
    /// argument.
    pub worker_command: Vec<String>,
    /// The port the scheduler process listens on.
    pub scheduler_port: u16,
    /// The port the worker apps expose.
    pub worker_port: u16,
    /// The port of the Code Engine ingress that fronts the scheduler.
    pub external_port: u16,
    pub protocol: String,
    pub n_workers: usize,
    pub disable_ssl_verification: bool,
    pub poll_interval_secs: f64,
    pub poll_max_interval_secs: f64,
    pub poll_timeout_secs: f64,
    pub poll_max_attempts: Option<usize>,
    /// How long to wait for the scheduler to accept connections once its app is ready.
    pub scheduler_timeout_secs: f64,
    pub iam_url: String,
    /// Override the regional Code Engine API endpoint.
    pub service_url: Option<String>,
}

impl Default for IbmConfig {
    fn default() -> Self {
        Self {
            image: None,
            region: None,
            project_id: None,
            api_key: None,
            scheduler_command: ["python", "-m", "distributed.cli.dask_scheduler"]
                .map(String::from)
                .to_vec(),
            worker_command: ["python", "-m", "distributed.cli.dask_worker"]
                .map(String::from)
                .to_vec(),
            scheduler_port: 8786,
            worker_port: 8787,
            external_port: DEFAULT_EXTERNAL_PORT,
            protocol: "tls".to_string(),
            n_workers: 0,
            disable_ssl_verification: false,
            poll_interval_secs: 1.0,
            poll_max_interval_secs: 10.0,
            poll_timeout_secs: 600.0,
            poll_max_attempts: None,
            scheduler_timeout_secs: 300.0,
            iam_url: DEFAULT_IAM_URL.to_string(),
            service_url: None,
        }
    }
}

impl std::fmt::Debug for IbmConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IbmConfig")
            .field("image", &self.image)
            .field("region", &self.region)
            .field("project_id", &self.project_id)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("scheduler_command", &self.scheduler_command)
            .field("worker_command", &self.worker_command)
            .field("scheduler_port", &self.scheduler_port)
            .field("worker_port", &self.worker_port)
            .field("external_port", &self.external_port)
            .field("protocol", &self.protocol)
            .field("n_workers", &self.n_workers)
            .field("disable_ssl_verification", &self.disable_ssl_verification)
            .field("poll_interval_secs", &self.poll_interval_secs)
            .field("poll_max_interval_secs", &self.poll_max_interval_secs)
            .field("poll_timeout_secs", &self.poll_timeout_secs)
            .field("poll_max_attempts", &self.poll_max_attempts)
            .field("scheduler_timeout_secs", &self.scheduler_timeout_secs)
            .field("iam_url", &self.iam_url)
            .field("service_url", &self.service_url)
            .finish()
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    cloudprovider: CloudProviders,
}

#[derive(Debug, Default, Deserialize)]
struct CloudProviders {
    #[serde(default)]
    ibm: IbmConfig,
}

fn env_var(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(&format!("{ENV_PREFIX}{}", key.to_uppercase()))
}

fn parse_env<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, Report<ConfigError>> {
    env_var(lookup, key)
        .map(|value| {
            value
                .trim()
                .parse::<T>()
                .map_err(|_| Report::new(ConfigError::Invalid(key)))
                .attach_printable_lazy(|| format!("Value {value:?}"))
        })
        .transpose()
}

fn duration(key: &'static str, secs: f64) -> Result<Duration, Report<ConfigError>> {
    Duration::try_from_secs_f64(secs)
        .change_context(ConfigError::Invalid(key))
        .attach_printable_lazy(|| format!("Value {secs}"))
}

impl IbmConfig {
    /// Load the configuration from `path`, or from the default location if `path` is `None`,
    /// and then apply overrides from the environment. A missing file at the default location
    /// is not an error.
    pub fn load(path: Option<&Path>) -> Result<Self, Report<ConfigError>> {
        let mut config = match (path, Self::default_path()) {
            (Some(path), _) => Self::from_file(path)?,
            (None, Some(path)) if path.exists() => Self::from_file(&path)?,
            (None, _) => {
                event!(Level::DEBUG, "No configuration file found, using defaults");
                Self::default()
            }
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// `$STRATUS_CONFIG`, or `stratus/config.toml` in the user's configuration directory.
    pub fn default_path() -> Option<PathBuf> {
        std::env::var_os(CONFIG_PATH_VAR)
            .map(PathBuf::from)
            .or_else(|| dirs::config_dir().map(|dir| dir.join("stratus").join("config.toml")))
    }

    pub fn from_file(path: &Path) -> Result<Self, Report<ConfigError>> {
        event!(Level::DEBUG, path = %path.display(), "Reading configuration file");
        let content = std::fs::read_to_string(path)
            .change_context_lazy(|| ConfigError::Read(path.display().to_string()))?;
        Self::from_toml(&content).attach_printable_lazy(|| path.display().to_string())
    }

    /// Parse the `[cloudprovider.ibm]` table of a TOML document.
    pub fn from_toml(content: &str) -> Result<Self, Report<ConfigError>> {
        let file: ConfigFile = toml::from_str(content).change_context(ConfigError::Parse)?;
        Ok(file.cloudprovider.ibm)
    }

    /// Override values from environment variables, looked up through `lookup`.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), Report<ConfigError>> {
        let lookup = &lookup;

        for (key, value) in [
            ("image", &mut self.image),
            ("region", &mut self.region),
            ("project_id", &mut self.project_id),
            ("api_key", &mut self.api_key),
            ("service_url", &mut self.service_url),
        ] {
            if let Some(v) = env_var(lookup, key) {
                *value = Some(v);
            }
        }

        for (key, value) in [
            ("scheduler_command", &mut self.scheduler_command),
            ("worker_command", &mut self.worker_command),
        ] {
            if let Some(v) = env_var(lookup, key) {
                *value = v.split_whitespace().map(String::from).collect();
            }
        }

        if let Some(v) = env_var(lookup, "protocol") {
            self.protocol = v;
        }
        if let Some(v) = env_var(lookup, "iam_url") {
            self.iam_url = v;
        }

        for (key, value) in [
            ("scheduler_port", &mut self.scheduler_port),
            ("worker_port", &mut self.worker_port),
            ("external_port", &mut self.external_port),
        ] {
            if let Some(v) = parse_env(lookup, key)? {
                *value = v;
            }
        }

        for (key, value) in [
            ("poll_interval_secs", &mut self.poll_interval_secs),
            ("poll_max_interval_secs", &mut self.poll_max_interval_secs),
            ("poll_timeout_secs", &mut self.poll_timeout_secs),
            ("scheduler_timeout_secs", &mut self.scheduler_timeout_secs),
        ] {
            if let Some(v) = parse_env(lookup, key)? {
                *value = v;
            }
        }

        if let Some(v) = parse_env(lookup, "n_workers")? {
            self.n_workers = v;
        }
        if let Some(v) = parse_env(lookup, "poll_max_attempts")? {
            self.poll_max_attempts = Some(v);
        }
        if let Some(v) = parse_env(lookup, "disable_ssl_verification")? {
            self.disable_ssl_verification = v;
        }

        Ok(())
    }

    pub fn poll_policy(&self) -> Result<PollPolicy, Report<ConfigError>> {
        if self.poll_max_attempts == Some(0) {
            return Err(Report::new(ConfigError::Invalid("poll_max_attempts")));
        }

        Ok(PollPolicy {
            initial_interval: duration("poll_interval_secs", self.poll_interval_secs)?,
            max_interval: duration("poll_max_interval_secs", self.poll_max_interval_secs)?,
            timeout: duration("poll_timeout_secs", self.poll_timeout_secs)?,
            max_attempts: self.poll_max_attempts,
        })
    }

    pub fn tls_verification(&self) -> TlsVerification {
        if self.disable_ssl_verification {
            TlsVerification::Disabled
        } else {
            TlsVerification::Enabled
        }
    }

    /// The probe used to wait for the scheduler to accept connections.
    pub fn probe(&self) -> Result<TcpProbe, Report<ConfigError>> {
        Ok(TcpProbe {
            timeout: duration("scheduler_timeout_secs", self.scheduler_timeout_secs)?,
            ..Default::default()
        })
    }

    /// Create a Code Engine client for `region`, authenticated with the configured API key.
    pub fn api_client(&self, region: &str) -> Result<Arc<CodeEngineClient>, Report<ConfigError>> {
        let api_key = self
            .api_key
            .as_deref()
            .filter(|key| !key.is_empty())
            .ok_or_else(|| Report::new(ConfigError::Missing("api_key")))?;

        let http = build_http_client(self.tls_verification()).change_context(ConfigError::Client)?;
        let authenticator = Arc::new(IamAuthenticator::new(
            http.clone(),
            self.iam_url.as_str(),
            api_key,
        ));

        let url = self
            .service_url
            .clone()
            .unwrap_or_else(|| service_url(region));
        let client = CodeEngineClient::new(http, &url, authenticator)
            .change_context(ConfigError::Client)?;
        Ok(Arc::new(client))
    }
}
