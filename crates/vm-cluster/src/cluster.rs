//! Shared state for a cluster, passed to each role so the scheduler can publish its
//! addresses for the workers.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{event, Level};

use crate::split_host;

/// The addresses of a running scheduler, as published by the scheduler role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedScheduler {
    /// The scheduler's internal `host[:port]`.
    pub internal_ip: String,
    /// The scheduler's external `host[:port]`.
    pub external_ip: String,
    /// The port the scheduler process listens on.
    pub port: u16,
    /// The full external address, `protocol://host:port`.
    pub address: String,
}

impl PublishedScheduler {
    /// The address that other instances inside the provider use to reach the scheduler.
    pub fn internal_address(&self, protocol: &str) -> String {
        format!(
            "{protocol}://{host}:{port}",
            host = split_host(&self.internal_ip),
            port = self.port
        )
    }
}

#[derive(Debug)]
struct ClusterState {
    name: String,
    protocol: String,
    debug: bool,
    scheduler: Option<PublishedScheduler>,
}

/// A cheaply-cloneable reference to a cluster's shared state. All clones refer to the same
/// cluster.
#[derive(Debug, Clone)]
pub struct ClusterHandle(Arc<RwLock<ClusterState>>);

impl ClusterHandle {
    pub fn new(name: impl Into<String>, protocol: impl Into<String>, debug: bool) -> Self {
        Self(Arc::new(RwLock::new(ClusterState {
            name: name.into(),
            protocol: protocol.into(),
            debug,
            scheduler: None,
        })))
    }

    pub fn name(&self) -> String {
        self.0.read().name.clone()
    }

    /// The protocol used to build scheduler addresses, e.g. `tls` or `tcp`.
    pub fn protocol(&self) -> String {
        self.0.read().protocol.clone()
    }

    pub fn debug(&self) -> bool {
        self.0.read().debug
    }

    /// Log a lifecycle message for this cluster. Messages are emitted at INFO when the
    /// cluster was created in debug mode, and DEBUG otherwise.
    pub fn log(&self, message: impl AsRef<str>) {
        let state = self.0.read();
        let message = message.as_ref();
        if state.debug {
            event!(Level::INFO, cluster = %state.name, "{message}");
        } else {
            event!(Level::DEBUG, cluster = %state.name, "{message}");
        }
    }

    pub fn publish_scheduler(&self, scheduler: PublishedScheduler) {
        let mut state = self.0.write();
        event!(Level::INFO, cluster = %state.name, address = %scheduler.address, "Scheduler published");
        state.scheduler = Some(scheduler);
    }

    /// Forget the published scheduler, once it has been shut down.
    pub fn unpublish_scheduler(&self) {
        self.0.write().scheduler = None;
    }

    pub fn scheduler(&self) -> Option<PublishedScheduler> {
        self.0.read().scheduler.clone()
    }

    /// The scheduler's address inside the provider's network, if it has been published.
    pub fn scheduler_internal_address(&self) -> Option<String> {
        let state = self.0.read();
        state
            .scheduler
            .as_ref()
            .map(|s| s.internal_address(&state.protocol))
    }

    /// Return true if both handles refer to the same cluster.
    pub fn same_cluster(&self, other: &ClusterHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
