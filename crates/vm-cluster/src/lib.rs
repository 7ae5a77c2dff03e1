//! Provider-independent lifecycle for clusters made of one scheduler and a set of workers,
//! each running on its own remote instance.
//!
//! A provider implements [VmInterface] to create and delete a single instance, and
//! [InstanceFactory] to build the scheduler and worker roles. [VmCluster] then starts the
//! scheduler, waits for it to publish its addresses on the [ClusterHandle], starts the workers,
//! and tears everything down again.

mod cluster;
mod error;
mod instance;
mod manager;
mod probe;
mod role;
#[cfg(test)]
mod test_util;

pub use cluster::{ClusterHandle, PublishedScheduler};
pub use error::{ClusterError, ProvisionError, ProvisionErrorKind};
pub use instance::{split_host, Endpoints, VmInterface};
pub use manager::{CancelHandle, InstanceFactory, VmCluster};
pub use probe::{SchedulerProbe, TcpProbe};
pub use role::{Role, SchedulerRole, Status, WorkerRole, DEFAULT_EXTERNAL_PORT};
