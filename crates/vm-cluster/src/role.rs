//! The scheduler and worker roles that drive a [VmInterface] through its lifecycle.

use std::sync::Arc;

use error_stack::{Report, ResultExt};
use tracing::instrument;

use crate::{
    split_host, ClusterError, ClusterHandle, Endpoints, PublishedScheduler, SchedulerProbe,
    VmInterface,
};

/// Code Engine and similar platforms expose applications through an HTTPS ingress, so the
/// externally reachable port is fixed no matter which port the container listens on.
pub const DEFAULT_EXTERNAL_PORT: u16 = 443;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Created,
    Starting,
    Running,
    Closing,
    Closed,
    Failed,
}

#[async_trait::async_trait]
pub trait Role: Send {
    fn name(&self) -> &str;
    fn status(&self) -> Status;
    /// Provision the instance behind this role.
    async fn start(&mut self) -> Result<(), Report<ClusterError>>;
    /// Release the instance behind this role. Closing an already closed role does nothing.
    async fn close(&mut self) -> Result<(), Report<ClusterError>>;
}

/// A scheduler process. Once its instance is acquired, the scheduler waits until the process
/// is reachable and then publishes its addresses on the cluster so that workers can connect.
pub struct SchedulerRole<VM: VmInterface> {
    vm: VM,
    cluster: ClusterHandle,
    probe: Arc<dyn SchedulerProbe>,
    /// The port that the scheduler process listens on inside its instance.
    pub port: u16,
    /// The port that the provider exposes the scheduler's external endpoint on.
    pub external_port: u16,
    status: Status,
    internal_ip: Option<String>,
    external_ip: Option<String>,
    address: Option<String>,
}

impl<VM: VmInterface> std::fmt::Debug for SchedulerRole<VM> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerRole")
            .field("name", &self.vm.name())
            .field("status", &self.status)
            .field("address", &self.address)
            .finish()
    }
}

impl<VM: VmInterface> SchedulerRole<VM> {
    pub fn new(vm: VM, cluster: ClusterHandle, probe: Arc<dyn SchedulerProbe>, port: u16) -> Self {
        Self {
            vm,
            cluster,
            probe,
            port,
            external_port: DEFAULT_EXTERNAL_PORT,
            status: Status::Created,
            internal_ip: None,
            external_ip: None,
            address: None,
        }
    }

    pub fn with_external_port(mut self, port: u16) -> Self {
        self.external_port = port;
        self
    }

    pub fn vm(&self) -> &VM {
        &self.vm
    }

    pub fn internal_ip(&self) -> Option<&str> {
        self.internal_ip.as_deref()
    }

    pub fn external_ip(&self) -> Option<&str> {
        self.external_ip.as_deref()
    }

    /// The scheduler's external address, once its instance has been acquired.
    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    async fn start_scheduler(&mut self) -> Result<(), Report<ClusterError>> {
        let mut config = String::from("Launching cluster with the following configuration: ");
        for (label, value) in self.vm.describe() {
            config.push_str(&format!("\n  {label}: {value} "));
        }
        self.cluster.log(config);
        self.cluster.log("Creating scheduler instance");

        let name = self.vm.name().to_string();
        let endpoints = self
            .vm
            .acquire()
            .await
            .change_context(ClusterError::Start(name))?;

        self.on_acquired(endpoints).await
    }

    /// Record the scheduler's endpoints, wait for it to accept connections, and publish it
    /// on the cluster.
    pub async fn on_acquired(&mut self, endpoints: Endpoints) -> Result<(), Report<ClusterError>> {
        let address = format!(
            "{protocol}://{host}:{port}",
            protocol = self.cluster.protocol(),
            host = split_host(&endpoints.external),
            port = self.external_port
        );

        self.internal_ip = Some(endpoints.internal.clone());
        self.external_ip = Some(endpoints.external.clone());
        self.address = Some(address.clone());

        self.probe
            .wait_until_reachable(&address)
            .await
            .attach_printable_lazy(|| format!("Scheduler {}", self.vm.name()))?;

        self.cluster.publish_scheduler(PublishedScheduler {
            internal_ip: endpoints.internal,
            external_ip: endpoints.external,
            port: self.port,
            address,
        });

        Ok(())
    }
}

#[async_trait::async_trait]
impl<VM: VmInterface> Role for SchedulerRole<VM> {
    fn name(&self) -> &str {
        self.vm.name()
    }

    fn status(&self) -> Status {
        self.status
    }

    #[instrument(skip(self), fields(name = %self.vm.name()))]
    async fn start(&mut self) -> Result<(), Report<ClusterError>> {
        self.status = Status::Starting;
        match self.start_scheduler().await {
            Ok(()) => {
                self.status = Status::Running;
                Ok(())
            }
            Err(e) => {
                self.status = Status::Failed;
                Err(e)
            }
        }
    }

    #[instrument(skip(self), fields(name = %self.vm.name()))]
    async fn close(&mut self) -> Result<(), Report<ClusterError>> {
        close_vm(&mut self.vm, &self.cluster, &mut self.status).await
    }
}

/// A worker process. Workers have no behavior beyond acquiring and releasing their instance.
pub struct WorkerRole<VM: VmInterface> {
    vm: VM,
    cluster: ClusterHandle,
    status: Status,
    endpoints: Option<Endpoints>,
}

impl<VM: VmInterface> std::fmt::Debug for WorkerRole<VM> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRole")
            .field("name", &self.vm.name())
            .field("status", &self.status)
            .finish()
    }
}

impl<VM: VmInterface> WorkerRole<VM> {
    pub fn new(vm: VM, cluster: ClusterHandle) -> Self {
        Self {
            vm,
            cluster,
            status: Status::Created,
            endpoints: None,
        }
    }

    pub fn vm(&self) -> &VM {
        &self.vm
    }

    pub fn endpoints(&self) -> Option<&Endpoints> {
        self.endpoints.as_ref()
    }
}

#[async_trait::async_trait]
impl<VM: VmInterface> Role for WorkerRole<VM> {
    fn name(&self) -> &str {
        self.vm.name()
    }

    fn status(&self) -> Status {
        self.status
    }

    #[instrument(skip(self), fields(name = %self.vm.name()))]
    async fn start(&mut self) -> Result<(), Report<ClusterError>> {
        self.status = Status::Starting;
        self.cluster
            .log(format!("Creating worker instance {}", self.vm.name()));

        let name = self.vm.name().to_string();
        match self.vm.acquire().await {
            Ok(endpoints) => {
                self.endpoints = Some(endpoints);
                self.status = Status::Running;
                Ok(())
            }
            Err(e) => {
                self.status = Status::Failed;
                Err(e).change_context(ClusterError::Start(name))
            }
        }
    }

    #[instrument(skip(self), fields(name = %self.vm.name()))]
    async fn close(&mut self) -> Result<(), Report<ClusterError>> {
        close_vm(&mut self.vm, &self.cluster, &mut self.status).await
    }
}

async fn close_vm<VM: VmInterface>(
    vm: &mut VM,
    cluster: &ClusterHandle,
    status: &mut Status,
) -> Result<(), Report<ClusterError>> {
    if *status == Status::Closed {
        return Ok(());
    }

    *status = Status::Closing;
    cluster.log(format!("Terminating instance {}", vm.name()));

    let name = vm.name().to_string();
    match vm.release().await {
        Ok(()) => {
            *status = Status::Closed;
            Ok(())
        }
        Err(e) => {
            *status = Status::Failed;
            Err(e).change_context(ClusterError::Close(name))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{setup_test_tracing, CallLog, FakeProbe, FakeVm};

    fn scheduler_vm(log: &CallLog, external: &str) -> FakeVm {
        FakeVm::new(
            "test-scheduler",
            Some(Endpoints {
                internal: "sched.internal:8786".to_string(),
                external: external.to_string(),
            }),
            log.clone(),
        )
    }

    #[tokio::test]
    async fn scheduler_address_uses_ingress_port() {
        setup_test_tracing();
        let log = CallLog::default();
        let cluster = ClusterHandle::new("test", "tls", false);
        let probe = Arc::new(FakeProbe::new(true, log.clone()));
        let mut scheduler = SchedulerRole::new(
            scheduler_vm(&log, "sched.example.cloud:8786"),
            cluster.clone(),
            probe,
            8786,
        );

        scheduler.start().await.expect("starting scheduler");

        assert_eq!(scheduler.status(), Status::Running);
        assert_eq!(scheduler.address(), Some("tls://sched.example.cloud:443"));
        assert_eq!(scheduler.internal_ip(), Some("sched.internal:8786"));
        assert_eq!(scheduler.external_ip(), Some("sched.example.cloud:8786"));
        assert_eq!(
            log.calls(),
            vec![
                "acquire test-scheduler".to_string(),
                "probe tls://sched.example.cloud:443".to_string()
            ]
        );

        let published = cluster.scheduler().expect("scheduler was published");
        assert_eq!(
            published,
            PublishedScheduler {
                internal_ip: "sched.internal:8786".to_string(),
                external_ip: "sched.example.cloud:8786".to_string(),
                port: 8786,
                address: "tls://sched.example.cloud:443".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn scheduler_custom_external_port() {
        let log = CallLog::default();
        let cluster = ClusterHandle::new("test", "tcp", false);
        let probe = Arc::new(FakeProbe::new(true, log.clone()));
        let mut scheduler =
            SchedulerRole::new(scheduler_vm(&log, "sched.example.cloud"), cluster, probe, 8786)
                .with_external_port(8443);

        scheduler.start().await.expect("starting scheduler");
        assert_eq!(scheduler.address(), Some("tcp://sched.example.cloud:8443"));
    }

    #[tokio::test]
    async fn failed_acquire_does_not_publish() {
        let log = CallLog::default();
        let cluster = ClusterHandle::new("test", "tls", false);
        let probe = Arc::new(FakeProbe::new(true, log.clone()));
        let mut scheduler = SchedulerRole::new(
            FakeVm::new("test-scheduler", None, log.clone()),
            cluster.clone(),
            probe,
            8786,
        );

        let err = scheduler.start().await.expect_err("start should fail");
        assert_eq!(
            err.current_context(),
            &ClusterError::Start("test-scheduler".to_string())
        );
        assert_eq!(scheduler.status(), Status::Failed);
        assert!(cluster.scheduler().is_none());
        assert_eq!(log.calls(), vec!["acquire test-scheduler".to_string()]);

        // The instance can still be released after a failed start.
        scheduler.close().await.expect("closing scheduler");
        assert_eq!(scheduler.status(), Status::Closed);
        assert_eq!(
            log.calls(),
            vec![
                "acquire test-scheduler".to_string(),
                "release test-scheduler".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn unreachable_scheduler_does_not_publish() {
        let log = CallLog::default();
        let cluster = ClusterHandle::new("test", "tls", false);
        let probe = Arc::new(FakeProbe::new(false, log.clone()));
        let mut scheduler = SchedulerRole::new(
            scheduler_vm(&log, "sched.example.cloud"),
            cluster.clone(),
            probe,
            8786,
        );

        let err = scheduler.start().await.expect_err("start should fail");
        assert!(matches!(
            err.current_context(),
            ClusterError::Unreachable(_)
        ));
        assert_eq!(scheduler.status(), Status::Failed);
        assert!(cluster.scheduler().is_none());
    }

    #[tokio::test]
    async fn worker_lifecycle() {
        let log = CallLog::default();
        let cluster = ClusterHandle::new("test", "tls", false);
        let mut worker = WorkerRole::new(
            FakeVm::new(
                "test-worker-0",
                Some(Endpoints {
                    internal: "worker.internal".to_string(),
                    external: "worker.example.cloud".to_string(),
                }),
                log.clone(),
            ),
            cluster,
        );

        assert_eq!(worker.status(), Status::Created);
        worker.start().await.expect("starting worker");
        assert_eq!(worker.status(), Status::Running);
        assert_eq!(
            worker.endpoints().map(|e| e.internal.as_str()),
            Some("worker.internal")
        );

        worker.close().await.expect("closing worker");
        worker.close().await.expect("closing worker twice");
        assert_eq!(worker.status(), Status::Closed);
        assert_eq!(
            log.calls(),
            vec![
                "acquire test-worker-0".to_string(),
                "release test-worker-0".to_string()
            ]
        );
    }
}
