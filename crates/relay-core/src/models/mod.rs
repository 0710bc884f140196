pub mod error;
pub mod feeds;
pub mod ids;
pub mod initiator;
pub mod job_spec;
pub mod payment;
pub mod run;
pub mod task_spec;
pub mod task_type;

pub use error::{CoreError, CoreErrorKind, CoreResult};
pub use feeds::{Feeds, is_absolute_url};
pub use ids::{InitiatorId, JobRunId, JobSpecId, TaskRunId, TaskSpecId};
pub use initiator::{
    CronParams, DEFAULT_FLUX_POLLING_INTERVAL, EthLogParams, ExternalParams, FluxMonitorParams,
    Initiator, InitiatorDefaults, InitiatorParams, InitiatorRequest, InitiatorType, RunAtParams,
    RunLogParams, WebParams, build_initiator,
};
pub use job_spec::{JobSpec, JobSpecRequest};
pub use payment::Payment;
pub use run::{JobRun, RunStatus, TaskRun, TaskRunError, TriggerEvent};
pub use task_spec::{TASK_TYPE_PARAM, TaskParams, TaskSpec, TaskSpecRequest};
pub use task_type::{TaskType, normalize_tag};
