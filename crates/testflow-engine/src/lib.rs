pub mod context;
pub mod executors;
pub mod http;
pub mod resolver;
pub mod run_log;
pub mod scheduler;

pub use context::{ContextView, ExecutionContext};
pub use executors::StepExecutors;
pub use http::{transport_for, ReqwestTransport, SimulatedTransport};
pub use resolver::{resolve, ExecutionPlan};
pub use run_log::RunLogger;
pub use scheduler::{status_stream, RunHandle, RunScheduler};
