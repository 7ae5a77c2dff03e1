//! Wait for a scheduler process to accept connections.

use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use error_stack::{Report, ResultExt};
use tokio::net::TcpStream;
use tracing::{event, instrument, Level};

use crate::ClusterError;

#[async_trait::async_trait]
pub trait SchedulerProbe: Send + Sync {
    /// Resolve once the scheduler at `address` (`protocol://host:port`) is reachable.
    async fn wait_until_reachable(&self, address: &str) -> Result<(), Report<ClusterError>>;
}

/// A [SchedulerProbe] that retries a TCP connection to the scheduler address with exponential
/// backoff until it succeeds or the timeout passes.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    /// Give up after this amount of time.
    pub timeout: Duration,
    /// The delay before the second connection attempt.
    pub initial_interval: Duration,
    /// The maximum delay between connection attempts.
    pub max_interval: Duration,
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(5),
        }
    }
}

#[async_trait::async_trait]
impl SchedulerProbe for TcpProbe {
    #[instrument(level = "debug", skip(self))]
    async fn wait_until_reachable(&self, address: &str) -> Result<(), Report<ClusterError>> {
        let unreachable = || ClusterError::Unreachable(address.to_string());

        let url = url::Url::parse(address)
            .change_context_lazy(unreachable)
            .attach_printable("Invalid scheduler address")?;
        // `host_str` keeps the brackets around IPv6 literals, which can't be resolved.
        let host = match url.host() {
            Some(url::Host::Domain(domain)) => domain.to_string(),
            Some(url::Host::Ipv4(ip)) => ip.to_string(),
            Some(url::Host::Ipv6(ip)) => ip.to_string(),
            None => {
                return Err(Report::new(unreachable()))
                    .attach_printable("Scheduler address has no host")
            }
        };
        let port = url
            .port_or_known_default()
            .ok_or_else(unreachable)
            .attach_printable("Scheduler address has no port")?;

        let backoff = ExponentialBuilder::default()
            .with_min_delay(self.initial_interval)
            .with_max_delay(self.max_interval)
            .with_max_times(usize::MAX);

        let host = host.as_str();
        let connect = (|| async move { TcpStream::connect((host, port)).await.map(|_| ()) })
            .retry(&backoff)
            .notify(|err, delay| {
                event!(Level::DEBUG, %address, ?delay, %err, "Scheduler not reachable yet");
            });

        match tokio::time::timeout(self.timeout, connect).await {
            Ok(result) => result.change_context_lazy(unreachable),
            Err(_) => Err(Report::new(unreachable()))
                .attach_printable(format!("Timed out after {:?}", self.timeout)),
        }
    }
}
