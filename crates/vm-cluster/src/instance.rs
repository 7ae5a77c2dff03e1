use error_stack::Report;

use crate::ProvisionError;

/// The addresses of a provisioned instance. Each is a `host[:port]` string with the URL
/// scheme removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    /// The address reachable from inside the provider's network.
    pub internal: String,
    /// The address reachable from outside the provider.
    pub external: String,
}

/// A single remote instance that backs a scheduler or worker process.
#[async_trait::async_trait]
pub trait VmInterface: Send + Sync {
    /// The provider-side name of the instance. This must be unique within the provider's
    /// namespace so that concurrent clusters do not collide.
    fn name(&self) -> &str;

    /// Labelled configuration values to log before the instance is created.
    fn describe(&self) -> Vec<(&'static str, String)> {
        Vec::new()
    }

    /// Create the instance and wait until it is ready to receive traffic.
    async fn acquire(&mut self) -> Result<Endpoints, Report<ProvisionError>>;

    /// Delete the instance. This does not wait for the deletion to finish.
    async fn release(&mut self) -> Result<(), Report<ProvisionError>>;
}

/// Return the host portion of a `host[:port][/path]` string.
pub fn split_host(host_and_port: &str) -> &str {
    let host = host_and_port.split('/').next().unwrap_or_default();
    match host.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => {
            host
        }
        _ => host,
    }
}
