use thiserror::Error;

/// The stage of an instance's lifecycle at which provisioning failed.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionErrorKind {
    #[error("failed to create instance")]
    Create,
    #[error("failed to read instance status")]
    Status,
    #[error("instance is not ready yet")]
    NotReady,
    #[error("instance failed to deploy")]
    Failed,
    #[error("instance did not become ready in time")]
    TimedOut,
    #[error("instance reported a malformed endpoint")]
    MalformedEndpoint,
    #[error("failed to delete instance")]
    Delete,
}

/// An error from a [VmInterface](crate::VmInterface) implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Instance {instance}: {kind}")]
pub struct ProvisionError {
    /// The provider-side name of the instance.
    pub instance: String,
    pub kind: ProvisionErrorKind,
}

impl ProvisionError {
    pub fn new(instance: impl Into<String>, kind: ProvisionErrorKind) -> Self {
        Self {
            instance: instance.into(),
            kind,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClusterError {
    #[error("Failed to start {0}")]
    Start(String),
    #[error("Scheduler at {0} was not reachable")]
    Unreachable(String),
    #[error("The scheduler has not published its address")]
    SchedulerNotPublished,
    #[error("Failed to close {0}")]
    Close(String),
    #[error("Cluster startup was cancelled")]
    Cancelled,
    #[error("The cluster has already been started")]
    AlreadyStarted,
}
