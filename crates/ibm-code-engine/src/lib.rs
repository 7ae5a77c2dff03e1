//! Run the scheduler and workers of a cluster as IBM Cloud Code Engine apps.
//!
//! Each scheduler and worker gets its own app. [CodeEngineInstance] creates the app, waits
//! for it to become ready and reports its endpoints, and deletes it again on release.
//! [CodeEngineCluster] fills in the settings from the `cloudprovider.ibm` configuration and
//! drives the instances through a [stratus_vm_cluster::VmCluster].

mod auth;
mod client;
mod cluster;
mod config;
mod error;
mod instance;
mod poll;
mod roles;
#[cfg(test)]
mod test_util;

pub use auth::{IamAuthenticator, DEFAULT_IAM_URL};
pub use client::{
    build_http_client, service_url, App, AppPrototype, AppStatus, CodeEngineApi,
    CodeEngineClient, TlsVerification,
};
pub use cluster::{
    generate_cluster_name, CodeEngineCluster, CodeEngineClusterBuilder, CodeEngineFactory,
};
pub use config::{IbmConfig, CONFIG_PATH_VAR};
pub use error::{CodeEngineError, ConfigError};
pub use instance::{strip_scheme, CodeEngineInstance, InstanceOptions};
pub use poll::PollPolicy;
pub use roles::{CodeEngineScheduler, CodeEngineWorker};
