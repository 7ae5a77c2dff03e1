use std::{collections::HashSet, sync::Arc};

use error_stack::Report;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::{
    ClusterError, ClusterHandle, Endpoints, InstanceFactory, ProvisionError, ProvisionErrorKind,
    SchedulerProbe, SchedulerRole, VmInterface, WorkerRole,
};

pub static TRACING: Lazy<()> = Lazy::new(|| {
    if std::env::var("TEST_LOG").is_ok() {
        configure_tracing();
    }
});

fn configure_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, EnvFilter};
    let tree = tracing_tree::HierarchicalLayer::new(2)
        .with_targets(true)
        .with_bracketed_fields(true);

    let subscriber = tracing_subscriber::Registry::default()
        .with(EnvFilter::from_env("TEST_LOG"))
        .with(tree);

    tracing::subscriber::set_global_default(subscriber).unwrap();
}

pub fn setup_test_tracing() {
    Lazy::force(&TRACING);
}

/// An ordered record of the calls made to fakes, shared between all the fakes in a test.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn push(&self, call: impl Into<String>) {
        self.0.lock().push(call.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.0.lock().clone()
    }
}

pub struct FakeVm {
    pub name: String,
    /// The endpoints to return from `acquire`. If `None`, `acquire` fails.
    pub endpoints: Option<Endpoints>,
    pub fail_release: bool,
    /// Never finish acquiring the instance.
    pub hang: bool,
    pub log: CallLog,
}

impl FakeVm {
    pub fn new(name: impl Into<String>, endpoints: Option<Endpoints>, log: CallLog) -> Self {
        Self {
            name: name.into(),
            endpoints,
            fail_release: false,
            hang: false,
            log,
        }
    }
}

#[async_trait::async_trait]
impl VmInterface for FakeVm {
    fn name(&self) -> &str {
        &self.name
    }

    fn describe(&self) -> Vec<(&'static str, String)> {
        vec![("Source Image", "test-image".to_string())]
    }

    async fn acquire(&mut self) -> Result<Endpoints, Report<ProvisionError>> {
        self.log.push(format!("acquire {}", self.name));
        if self.hang {
            std::future::pending::<()>().await;
        }

        self.endpoints
            .clone()
            .ok_or_else(|| Report::new(ProvisionError::new(&self.name, ProvisionErrorKind::Create)))
    }

    async fn release(&mut self) -> Result<(), Report<ProvisionError>> {
        self.log.push(format!("release {}", self.name));
        if self.fail_release {
            Err(Report::new(ProvisionError::new(
                &self.name,
                ProvisionErrorKind::Delete,
            )))
        } else {
            Ok(())
        }
    }
}

pub struct FakeProbe {
    reachable: bool,
    log: CallLog,
}

impl FakeProbe {
    pub fn new(reachable: bool, log: CallLog) -> Self {
        Self { reachable, log }
    }
}

#[async_trait::async_trait]
impl SchedulerProbe for FakeProbe {
    async fn wait_until_reachable(&self, address: &str) -> Result<(), Report<ClusterError>> {
        self.log.push(format!("probe {address}"));
        if self.reachable {
            Ok(())
        } else {
            Err(Report::new(ClusterError::Unreachable(address.to_string())))
        }
    }
}

/// Builds fake scheduler and worker instances. Workers record the scheduler address they
/// were created with.
#[derive(Default)]
pub struct FakeFactory {
    pub log: CallLog,
    pub hang_scheduler: bool,
    pub hang_workers: bool,
    pub failing_acquire: HashSet<String>,
    pub failing_release: HashSet<String>,
}

impl FakeFactory {
    fn vm(&self, name: String, endpoints: Endpoints) -> FakeVm {
        let mut vm = FakeVm::new(name.clone(), Some(endpoints), self.log.clone());
        if self.failing_acquire.contains(&name) {
            vm.endpoints = None;
        }
        vm.fail_release = self.failing_release.contains(&name);
        vm
    }
}

impl InstanceFactory for FakeFactory {
    type Scheduler = FakeVm;
    type Worker = FakeVm;

    fn scheduler(
        &self,
        cluster: &ClusterHandle,
    ) -> Result<SchedulerRole<Self::Scheduler>, Report<ClusterError>> {
        let mut vm = self.vm(
            format!("{}-scheduler", cluster.name()),
            Endpoints {
                internal: "sched.internal".to_string(),
                external: "sched.example.cloud".to_string(),
            },
        );
        vm.hang = self.hang_scheduler;

        Ok(SchedulerRole::new(
            vm,
            cluster.clone(),
            Arc::new(FakeProbe::new(true, self.log.clone())),
            8786,
        ))
    }

    fn worker(
        &self,
        cluster: &ClusterHandle,
        ordinal: usize,
    ) -> Result<WorkerRole<Self::Worker>, Report<ClusterError>> {
        let scheduler = cluster
            .scheduler_internal_address()
            .ok_or(ClusterError::SchedulerNotPublished)?;
        let name = format!("{}-worker-{ordinal}", cluster.name());
        self.log.push(format!("create {name} -> {scheduler}"));

        let mut vm = self.vm(
            name.clone(),
            Endpoints {
                internal: format!("{name}.internal"),
                external: format!("{name}.example.cloud"),
            },
        );
        vm.hang = self.hang_workers;
        Ok(WorkerRole::new(vm, cluster.clone()))
    }
}
