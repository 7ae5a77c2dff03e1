use stratus_vm_cluster::{SchedulerRole, WorkerRole};

use crate::CodeEngineInstance;

/// A scheduler running in a Code Engine app.
pub type CodeEngineScheduler = SchedulerRole<CodeEngineInstance>;

/// A worker running in a Code Engine app.
pub type CodeEngineWorker = WorkerRole<CodeEngineInstance>;
